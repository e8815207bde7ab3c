//! JSON diagnostic output format.
//!
//! Machine-readable output for build drivers that wrap the compiler:
//!
//! ```json
//! {
//!   "message": "incompatible dot operand layouts",
//!   "code": "E0002",
//!   "severity": "error",
//!   "labels": [
//!     { "location": "loc(\"attn.py\":192:16)", "is_primary": true, "label": "tt.dot" }
//!   ],
//!   "notes": ["lhs: ...", "rhs: ..."]
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::{Diagnostic, Severity};

/// A diagnostic in JSON format.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonDiagnostic {
    /// The main error message.
    pub message: String,

    /// The error code, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// The severity level.
    pub severity: JsonSeverity,

    /// The labeled locations.
    pub labels: Vec<JsonLabel>,

    /// Additional notes.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub notes: Vec<String>,
}

/// Severity level in JSON format.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JsonSeverity {
    /// Internal compiler error.
    Bug,
    /// A fatal error.
    Error,
    /// A warning.
    Warning,
    /// Informational note.
    Note,
}

impl From<Severity> for JsonSeverity {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Bug => Self::Bug,
            Severity::Error => Self::Error,
            Severity::Warning => Self::Warning,
            Severity::Note => Self::Note,
        }
    }
}

/// A labeled location in JSON format.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonLabel {
    /// The location, printed in MLIR `loc(...)` syntax.
    pub location: String,

    /// The file, when the location is a file position.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub file: Option<String>,

    /// 1-indexed line, when known.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub line: Option<u32>,

    /// 1-indexed column, when known.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub column: Option<u32>,

    /// Whether this is the primary label.
    pub is_primary: bool,

    /// The label text, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub label: Option<String>,
}

/// Convert a diagnostic to its JSON representation.
#[must_use]
pub fn diagnostic_to_json(diagnostic: &Diagnostic) -> JsonDiagnostic {
    let labels = diagnostic
        .labels
        .iter()
        .map(|label| {
            let pos = label.loc.line_col();
            JsonLabel {
                location: label.loc.to_string(),
                file: label.loc.file_name().map(str::to_string),
                line: pos.map(|p| p.line),
                column: pos.map(|p| p.col),
                is_primary: label.primary,
                label: (!label.message.is_empty()).then(|| label.message.clone()),
            }
        })
        .collect();

    JsonDiagnostic {
        message: diagnostic.message.clone(),
        code: diagnostic.code.clone(),
        severity: diagnostic.severity.into(),
        labels,
        notes: diagnostic.notes.clone(),
    }
}

/// Serialize diagnostics as a JSON array.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn diagnostics_to_json(diagnostics: &[Diagnostic]) -> serde_json::Result<String> {
    let json: Vec<_> = diagnostics.iter().map(diagnostic_to_json).collect();
    serde_json::to_string_pretty(&json)
}
