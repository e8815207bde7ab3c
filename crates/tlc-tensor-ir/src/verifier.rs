//! Structural and typing checks.
//!
//! [`verify_module`] runs before any pass and rejects malformed input as
//! [`IrError::Malformed`]. [`verify_layouts`] runs after layout assignment
//! and checks that every tensor carries a layout its operation accepts.

use crate::function::{Function, Module, OpId, ValueDef, ValueId};
use crate::ops::{result_types, OpKind};
use crate::types::Type;
use crate::{IrError, IrResult};
use rustc_hash::FxHashSet;
use tlc_layout::{Layout, LayoutConfig};
use tlc_span::Loc;
use tracing::debug;

fn module_error(reason: impl Into<String>) -> IrError {
    IrError::Malformed {
        op: "module".to_string(),
        loc: Loc::Unknown,
        reason: reason.into(),
    }
}

/// Verify every function of a module and its configuration.
///
/// # Errors
///
/// Returns the first [`IrError::Malformed`] found.
pub fn verify_module(module: &Module) -> IrResult<()> {
    let config = module
        .config
        .layout_config()
        .map_err(|e| module_error(e.to_string()))?;
    if config.num_warps == 0 || config.num_ctas == 0 || config.threads_per_warp == 0 {
        return Err(module_error(format!(
            "num-warps, num-ctas and threads-per-warp must be positive, found {}, {}, {}",
            config.num_warps, config.num_ctas, config.threads_per_warp
        )));
    }
    let mut names = FxHashSet::default();
    for func in &module.functions {
        if !names.insert(func.name.as_str()) {
            return Err(module_error(format!("duplicate kernel `{}`", func.name)));
        }
        verify_function(func, &config)?;
    }
    debug!(module = %module.name, functions = module.functions.len(), "verified module");
    Ok(())
}

/// Verify the structure and typing of one function.
///
/// # Errors
///
/// Returns the first [`IrError::Malformed`] found.
pub fn verify_function(func: &Function, config: &LayoutConfig) -> IrResult<()> {
    let mut defined: FxHashSet<ValueId> = FxHashSet::default();
    for (i, &arg) in func.args.iter().enumerate() {
        let Some(data) = func.values.get(arg) else {
            return Err(module_error(format!("argument {i} of `{}` is dangling", func.name)));
        };
        if data.def != (ValueDef::Arg { index: i as u32 }) {
            return Err(module_error(format!(
                "argument {i} of `{}` has a mismatched definition",
                func.name
            )));
        }
        if data.ty.is_tensor() {
            verify_encoding(&data.ty, config).map_err(|reason| {
                module_error(format!("argument {i} of `{}`: {reason}", func.name))
            })?;
        }
        defined.insert(arg);
    }

    let mut seen: FxHashSet<OpId> = FxHashSet::default();
    for (pos, &id) in func.body.iter().enumerate() {
        let Some(op) = func.ops.get(id) else {
            return Err(module_error(format!("`{}` lists a dangling operation", func.name)));
        };
        if op.erased || !seen.insert(id) {
            return Err(IrError::malformed(op, "operation is erased or listed twice"));
        }
        if matches!(op.kind, OpKind::Return) && pos + 1 != func.body.len() {
            return Err(IrError::malformed(op, "return must end the kernel"));
        }

        let mut operand_types = Vec::with_capacity(op.operands.len());
        for &operand in &op.operands {
            if !defined.contains(&operand) {
                return Err(IrError::malformed(
                    op,
                    format!("operand {operand:?} is not defined before use"),
                ));
            }
            operand_types.push(func.value_type(operand));
        }

        let expected = result_types(&op.kind, &operand_types)
            .map_err(|reason| IrError::malformed(op, reason))?;
        if expected.len() != op.results.len() {
            return Err(IrError::malformed(
                op,
                format!("expects {} results, found {}", expected.len(), op.results.len()),
            ));
        }
        for (index, (&result, expected)) in op.results.iter().zip(&expected).enumerate() {
            let Some(data) = func.values.get(result) else {
                return Err(IrError::malformed(op, "result value is dangling"));
            };
            if data.def != (ValueDef::Op { op: id, index: index as u32 }) {
                return Err(IrError::malformed(op, "result has a mismatched definition"));
            }
            if !data.ty.same_modulo_encoding(expected) {
                return Err(IrError::malformed(
                    op,
                    format!("result has type {}, expected {expected}", data.ty),
                ));
            }
            verify_encoding(&data.ty, config).map_err(|reason| IrError::malformed(op, reason))?;
            if !defined.insert(result) {
                return Err(IrError::malformed(op, "value defined twice"));
            }
        }
        if matches!(op.kind, OpKind::ConvertLayout) && func.encoding(op.results[0]).is_none() {
            return Err(IrError::malformed(op, "conversion without a target layout"));
        }
    }
    Ok(())
}

fn verify_encoding(ty: &Type, config: &LayoutConfig) -> Result<(), String> {
    let Some(layout) = ty.encoding() else {
        return Ok(());
    };
    if layout.rank() != ty.shape().len() {
        return Err(format!(
            "layout of rank {} on a rank-{} tensor",
            layout.rank(),
            ty.shape().len()
        ));
    }
    layout.validate(config).map_err(|e| e.to_string())
}

/// Check that every tensor has a layout and every operation's layouts fit
/// together.
///
/// # Errors
///
/// Returns [`IrError::Malformed`] naming the first inconsistent operation.
pub fn verify_layouts(func: &Function, config: &LayoutConfig) -> IrResult<()> {
    for &arg in &func.args {
        if func.value_type(arg).is_tensor() && func.encoding(arg).is_none() {
            return Err(module_error(format!("tensor argument of `{}` has no layout", func.name)));
        }
    }
    for (_, op) in func.body_ops() {
        for &result in &op.results {
            let ty = func.value_type(result);
            if ty.is_tensor() && ty.encoding().is_none() {
                return Err(IrError::malformed(op, "tensor result has no layout"));
            }
            verify_encoding(ty, config).map_err(|reason| IrError::malformed(op, reason))?;
        }
        let enc = |i: usize| func.encoding(op.operands[i]);
        let out = op.result().and_then(|r| func.encoding(r));
        let consistent = match &op.kind {
            kind if kind.is_elementwise() => op
                .operands
                .iter()
                .filter(|&&v| func.value_type(v).shape() == func.value_type(op.results[0]).shape())
                .all(|&v| func.encoding(v).is_none() || func.encoding(v) == out),
            OpKind::Broadcast { .. } => enc(0) == out,
            OpKind::ExpandDims { axis } => match (enc(0), out) {
                (Some(Layout::Slice(s)), Some(parent)) => s.dim == *axis && *s.parent == *parent,
                _ => false,
            },
            OpKind::Reduce { axis, .. } => match (enc(0), out) {
                (Some(src), Some(Layout::Slice(s))) => s.dim == *axis && *s.parent == *src,
                (Some(_), None) => true,
                _ => false,
            },
            OpKind::Load(_) if func.value_type(op.operands[0]).is_tensor() => op
                .operands
                .iter()
                .all(|&v| func.encoding(v) == out),
            OpKind::Store(_) if func.value_type(op.operands[0]).is_tensor() => op
                .operands
                .iter()
                .all(|&v| func.encoding(v) == enc(0)),
            OpKind::Dot => match (enc(0), enc(1), enc(2), out) {
                (
                    Some(Layout::DotOperand(a)),
                    Some(Layout::DotOperand(b)),
                    Some(Layout::Blocked(c)),
                    Some(Layout::Blocked(d)),
                ) => a.op_idx == 0 && b.op_idx == 1 && a.parent == *d && b.parent == *d && c == d,
                _ => false,
            },
            _ => true,
        };
        if !consistent {
            return Err(IrError::malformed(op, "operand and result layouts disagree"));
        }
    }
    Ok(())
}
