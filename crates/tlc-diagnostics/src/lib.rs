//! Error reporting and diagnostics for TLC.
//!
//! Every fatal condition in the pipeline (malformed input, an unsatisfiable
//! layout constraint, an unsupported construct) is surfaced to the build
//! driver as a [`Diagnostic`]: a message, an error code, and the locations
//! of the operations involved.
//!
//! ## Example
//!
//! ```
//! use tlc_diagnostics::{Diagnostic, DiagnosticRenderer};
//! use tlc_span::Loc;
//!
//! let diag = Diagnostic::error("incompatible dot operand layouts")
//!     .with_code("E0002")
//!     .with_label(Loc::file("attn.py", 192, 16), "tt.dot defined here")
//!     .with_note("lhs: #ttg.dot_op<{opIdx = 0, ...}>");
//!
//! let mut out = Vec::new();
//! DiagnosticRenderer::new().without_colors().render(&diag, &mut out).unwrap();
//! assert!(String::from_utf8(out).unwrap().starts_with("error[E0002]"));
//! ```

#![warn(missing_docs)]

pub mod json;

pub use json::{diagnostic_to_json, diagnostics_to_json, JsonDiagnostic, JsonLabel, JsonSeverity};

use serde::{Deserialize, Serialize};
use std::io::Write;
use tlc_span::Loc;

/// The severity level of a diagnostic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    /// A bug in the compiler itself.
    Bug,
    /// A fatal error that prevents compilation.
    Error,
    /// A warning that doesn't prevent compilation.
    Warning,
    /// A note providing additional context.
    Note,
}

impl Severity {
    /// Get the ANSI color code for this severity.
    #[must_use]
    pub fn color(self) -> &'static str {
        match self {
            Self::Bug => "\x1b[1;35m",     // Bold magenta
            Self::Error => "\x1b[1;31m",   // Bold red
            Self::Warning => "\x1b[1;33m", // Bold yellow
            Self::Note => "\x1b[1;36m",    // Bold cyan
        }
    }

    /// Get the label for this severity.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Bug => "internal compiler error",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Note => "note",
        }
    }
}

/// A labeled location for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Label {
    /// The location being labeled.
    pub loc: Loc,
    /// The message for this label.
    pub message: String,
    /// Whether this is the primary label.
    pub primary: bool,
}

impl Label {
    /// Create a primary label.
    #[must_use]
    pub fn primary(loc: Loc, message: impl Into<String>) -> Self {
        Self {
            loc,
            message: message.into(),
            primary: true,
        }
    }

    /// Create a secondary label.
    #[must_use]
    pub fn secondary(loc: Loc, message: impl Into<String>) -> Self {
        Self {
            loc,
            message: message.into(),
            primary: false,
        }
    }
}

/// A diagnostic message with locations and notes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    /// The severity of this diagnostic.
    pub severity: Severity,
    /// The main message.
    pub message: String,
    /// An optional error code.
    pub code: Option<String>,
    /// Labeled locations with messages.
    pub labels: Vec<Label>,
    /// Additional notes.
    pub notes: Vec<String>,
}

impl Diagnostic {
    fn with_severity(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            code: None,
            labels: Vec::new(),
            notes: Vec::new(),
        }
    }

    /// Create a new error diagnostic.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::with_severity(Severity::Error, message)
    }

    /// Create a new warning diagnostic.
    #[must_use]
    pub fn warning(message: impl Into<String>) -> Self {
        Self::with_severity(Severity::Warning, message)
    }

    /// Create a new bug diagnostic (internal compiler error).
    #[must_use]
    pub fn bug(message: impl Into<String>) -> Self {
        Self::with_severity(Severity::Bug, message)
    }

    /// Add an error code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Add a primary label.
    #[must_use]
    pub fn with_label(mut self, loc: Loc, message: impl Into<String>) -> Self {
        self.labels.push(Label::primary(loc, message));
        self
    }

    /// Add a secondary label.
    #[must_use]
    pub fn with_secondary_label(mut self, loc: Loc, message: impl Into<String>) -> Self {
        self.labels.push(Label::secondary(loc, message));
        self
    }

    /// Add a note.
    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    /// Check if this is an error.
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self.severity, Severity::Error | Severity::Bug)
    }
}

/// A handler for collecting and emitting diagnostics.
#[derive(Debug, Default)]
pub struct DiagnosticHandler {
    diagnostics: Vec<Diagnostic>,
    error_count: usize,
    warning_count: usize,
}

impl DiagnosticHandler {
    /// Create a new diagnostic handler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit a diagnostic.
    pub fn emit(&mut self, diagnostic: Diagnostic) {
        match diagnostic.severity {
            Severity::Error | Severity::Bug => self.error_count += 1,
            Severity::Warning => self.warning_count += 1,
            Severity::Note => {}
        }
        self.diagnostics.push(diagnostic);
    }

    /// Check if any errors have been emitted.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }

    /// Get the number of errors.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.error_count
    }

    /// Get the number of warnings.
    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.warning_count
    }

    /// Get all diagnostics.
    #[must_use]
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }
}

/// Render diagnostics to a writer.
#[derive(Debug)]
pub struct DiagnosticRenderer {
    use_colors: bool,
}

impl DiagnosticRenderer {
    /// Create a new renderer.
    #[must_use]
    pub fn new() -> Self {
        Self { use_colors: true }
    }

    /// Disable colors.
    #[must_use]
    pub fn without_colors(mut self) -> Self {
        self.use_colors = false;
        self
    }

    /// Render a diagnostic to the given writer.
    pub fn render(&self, diagnostic: &Diagnostic, w: &mut impl Write) -> std::io::Result<()> {
        let reset = if self.use_colors { "\x1b[0m" } else { "" };
        let color = if self.use_colors {
            diagnostic.severity.color()
        } else {
            ""
        };

        write!(w, "{}{}", color, diagnostic.severity.label())?;
        if let Some(code) = &diagnostic.code {
            write!(w, "[{code}]")?;
        }
        writeln!(w, "{reset}: {}", diagnostic.message)?;

        for label in &diagnostic.labels {
            let arrow = if label.primary { "-->" } else { "   " };
            match (label.loc.file_name(), label.loc.line_col()) {
                (Some(file), Some(pos)) => {
                    writeln!(w, " {arrow} {file}:{}:{}", pos.line, pos.col)?;
                }
                _ => writeln!(w, " {arrow} {}", label.loc)?,
            }
            if !label.message.is_empty() {
                writeln!(w, "   | {}", label.message)?;
            }
        }

        for note in &diagnostic.notes {
            writeln!(w, " = note: {note}")?;
        }

        writeln!(w)?;
        Ok(())
    }

    /// Render all diagnostics to stderr.
    pub fn render_all(&self, diagnostics: &[Diagnostic]) {
        let mut stderr = std::io::stderr().lock();
        for diag in diagnostics {
            let _ = self.render(diag, &mut stderr);
        }
    }
}

impl Default for DiagnosticRenderer {
    fn default() -> Self {
        Self::new()
    }
}

/// Trait for types that can produce diagnostics.
pub trait IntoDiagnostic {
    /// Convert into a diagnostic.
    fn into_diagnostic(self) -> Diagnostic;
}

impl IntoDiagnostic for Diagnostic {
    fn into_diagnostic(self) -> Diagnostic {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_builder() {
        let diag = Diagnostic::error("layout mismatch")
            .with_code("E0002")
            .with_label(Loc::file("k.py", 10, 4), "operand defined here")
            .with_note("expected #blocked, found #blocked1");

        assert!(diag.is_error());
        assert_eq!(diag.code, Some("E0002".to_string()));
        assert_eq!(diag.labels.len(), 1);
        assert_eq!(diag.notes.len(), 1);
    }

    #[test]
    fn test_diagnostic_handler() {
        let mut handler = DiagnosticHandler::new();

        handler.emit(Diagnostic::error("error 1"));
        handler.emit(Diagnostic::warning("warning 1"));
        handler.emit(Diagnostic::bug("error 2"));

        assert!(handler.has_errors());
        assert_eq!(handler.error_count(), 2);
        assert_eq!(handler.warning_count(), 1);
        assert_eq!(handler.diagnostics().len(), 3);
    }

    #[test]
    fn test_render_without_colors() {
        let diag = Diagnostic::error("unsupported construct")
            .with_code("E0003")
            .with_label(Loc::file("k.py", 7, 2), "tt.load")
            .with_secondary_label(Loc::name("ptr"), "");

        let mut out = Vec::new();
        DiagnosticRenderer::new()
            .without_colors()
            .render(&diag, &mut out)
            .unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("error[E0003]: unsupported construct"));
        assert!(text.contains("--> k.py:7:2"));
        assert!(text.contains("loc(\"ptr\")"));
        assert!(!text.contains('\x1b'));
    }
}
