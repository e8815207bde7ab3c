//! Rendering compile errors as diagnostics.
//!
//! | Code | Meaning |
//! |------|---------|
//! | `E0001` | malformed input program |
//! | `E0002` | two layouts an operation needs to agree on differ |
//! | `E0003` | construct without a layout rule or lowering |
//! | `E0004` | a layout could not be built |
//! | `E0005` | lowering or code generation failed |

use crate::CompileError;
use tlc_block_ir::LowerError;
use tlc_diagnostics::{Diagnostic, IntoDiagnostic};
use tlc_span::Loc;
use tlc_tensor_ir::IrError;

fn at(diag: Diagnostic, loc: &Loc, message: impl Into<String>) -> Diagnostic {
    if loc.is_unknown() {
        diag
    } else {
        diag.with_label(loc.clone(), message)
    }
}

impl IntoDiagnostic for &CompileError {
    fn into_diagnostic(self) -> Diagnostic {
        match self {
            CompileError::Ir(e) => ir_diagnostic(e),
            CompileError::Lower(e) => lower_diagnostic(e),
            CompileError::Codegen(e) => Diagnostic::error(e.to_string()).with_code("E0005"),
            CompileError::Parse { source, .. } => Diagnostic::error(self.to_string())
                .with_code("E0001")
                .with_note(format!("at line {}, column {}", source.line(), source.column())),
            CompileError::Session(_)
            | CompileError::Target(_)
            | CompileError::SourceRead { .. }
            | CompileError::Write { .. } => {
                let diag = Diagnostic::error(self.to_string());
                match std::error::Error::source(self) {
                    Some(source) => diag.with_note(source.to_string()),
                    None => diag,
                }
            }
        }
    }
}

impl IntoDiagnostic for CompileError {
    fn into_diagnostic(self) -> Diagnostic {
        (&self).into_diagnostic()
    }
}

fn ir_diagnostic(e: &IrError) -> Diagnostic {
    match e {
        IrError::Malformed { op, loc, reason } => at(
            Diagnostic::error(format!("malformed `{op}`: {reason}")).with_code("E0001"),
            loc,
            format!("`{op}` defined here"),
        ),
        IrError::ConstraintViolation {
            op,
            loc,
            lhs,
            rhs,
            reason,
        } => at(
            Diagnostic::error(format!("`{op}`: {reason}")).with_code("E0002"),
            loc,
            format!("`{op}` defined here"),
        )
        .with_note(format!("first layout: {lhs}"))
        .with_note(format!("second layout: {rhs}")),
        IrError::Unsupported { op, loc, reason } => at(
            Diagnostic::error(format!("unsupported `{op}`: {reason}")).with_code("E0003"),
            loc,
            format!("`{op}` defined here"),
        ),
        IrError::Layout(e) => Diagnostic::error(format!("invalid layout: {e}")).with_code("E0004"),
    }
}

fn lower_diagnostic(e: &LowerError) -> Diagnostic {
    match e {
        LowerError::Layout(e) => {
            Diagnostic::error(format!("invalid layout: {e}")).with_code("E0004")
        }
        LowerError::UnsupportedOp { op, loc, .. } | LowerError::MissingLayout { op, loc } => at(
            Diagnostic::error(e.to_string()).with_code("E0005"),
            loc,
            format!("`{op}` defined here"),
        ),
        LowerError::SharedMemoryExceeded { .. } | LowerError::Config(_) => {
            Diagnostic::error(e.to_string()).with_code("E0005")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlc_diagnostics::diagnostic_to_json;
    use tlc_layout::LayoutError;

    #[test]
    fn test_constraint_violation_names_both_layouts() {
        let err = CompileError::Ir(IrError::ConstraintViolation {
            op: "tt.dot".to_string(),
            loc: Loc::file("attn.py", 42, 8),
            lhs: "#blocked".to_string(),
            rhs: "#blocked1".to_string(),
            reason: "operands disagree on the contraction layout".to_string(),
        });
        let diag = err.into_diagnostic();
        assert_eq!(diag.code.as_deref(), Some("E0002"));
        assert_eq!(diag.labels.len(), 1);
        assert!(diag.notes.iter().any(|n| n.contains("#blocked1")));
        let json = diagnostic_to_json(&diag);
        assert_eq!(json.code.as_deref(), Some("E0002"));
    }

    #[test]
    fn test_codes() {
        let malformed = CompileError::Ir(IrError::Malformed {
            op: "tt.load".to_string(),
            loc: Loc::Unknown,
            reason: "pointer operand is not a pointer".to_string(),
        });
        let diag = malformed.into_diagnostic();
        assert_eq!(diag.code.as_deref(), Some("E0001"));
        assert!(diag.labels.is_empty());

        let layout = CompileError::Ir(IrError::Layout(LayoutError::ZeroExtent("sizePerThread")));
        assert_eq!(layout.into_diagnostic().code.as_deref(), Some("E0004"));

        let lower = CompileError::Lower(LowerError::SharedMemoryExceeded {
            kernel: "k".to_string(),
            needed: 1 << 20,
            available: 65536,
        });
        assert_eq!(lower.into_diagnostic().code.as_deref(), Some("E0005"));

        let codegen = CompileError::Codegen(tlc_amdgpu::CodegenError::Unsupported(
            "float8 arithmetic".to_string(),
        ));
        assert_eq!(codegen.into_diagnostic().code.as_deref(), Some("E0005"));
    }
}
