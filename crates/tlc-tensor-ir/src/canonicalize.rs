//! Canonicalization after layout assignment.

use crate::builder::Builder;
use crate::function::{Function, InsertPoint, OpId, ValueId};
use crate::ops::OpKind;
use crate::rewrite::{apply_patterns_greedily, GreedyConfig, RewritePattern};
use crate::IrResult;
use tlc_layout::{Layout, SliceLayout};
use tracing::debug;

/// Run every canonicalization pattern to a fixpoint. Returns whether the
/// function changed.
///
/// # Errors
///
/// Propagates pattern errors.
pub fn canonicalize(func: &mut Function) -> IrResult<bool> {
    let patterns: [&dyn RewritePattern; 4] = [
        &BroadcastSelectCondition,
        &FoldIdentityConversion,
        &FoldConversionChain,
        &EraseDeadConversion,
    ];
    let changed = apply_patterns_greedily(func, &patterns, GreedyConfig::default())?;
    debug!(function = %func.name, changed, "canonicalized");
    Ok(changed)
}

fn conversion_source(func: &Function, op: OpId) -> Option<ValueId> {
    let op = func.op(op);
    match op.kind {
        OpKind::ConvertLayout => Some(op.operands[0]),
        _ => None,
    }
}

/// Gives a select's scalar or lower-rank condition the full result shape
/// and layout: a splat for scalars, otherwise a conversion to the matching
/// slice of the result layout, `expand_dims` up to the result rank and a
/// broadcast.
pub struct BroadcastSelectCondition;

impl RewritePattern for BroadcastSelectCondition {
    fn name(&self) -> &'static str {
        "broadcast-select-condition"
    }

    fn match_and_rewrite(&self, func: &mut Function, op: OpId) -> IrResult<bool> {
        if func.op(op).kind != OpKind::Select {
            return Ok(false);
        }
        let cond = func.op(op).operands[0];
        let result = func.op(op).results[0];
        let shape = func.value_type(result).shape().to_vec();
        let Some(layout) = func.encoding(result).cloned() else {
            return Ok(false);
        };
        let cond_ty = func.value_type(cond).clone();
        if cond_ty.shape() == shape.as_slice() && cond_ty.encoding() == Some(&layout) {
            return Ok(false);
        }

        let loc = func.op(op).loc.clone();
        let mut b = Builder::at(func, InsertPoint::Before(op));
        b.set_loc(loc);
        let broadcast = if cond_ty.is_tensor() {
            let missing = shape.len() - cond_ty.shape().len();
            let mut target = layout.clone();
            let mut chain = Vec::with_capacity(missing);
            for _ in 0..missing {
                chain.push(target.clone());
                target = SliceLayout::new(0, target)?.into();
            }
            let mut value = if cond_ty.encoding() == Some(&target) {
                cond
            } else {
                b.convert_layout(cond, target)?
            };
            for parent in chain.into_iter().rev() {
                value = b.expand_dims(value, 0)?;
                set_encoding(&mut b, value, parent);
            }
            if b.ty(value).shape() != shape.as_slice() {
                value = b.broadcast(value, &shape)?;
                set_encoding(&mut b, value, layout);
            }
            value
        } else {
            let value = b.splat(cond, &shape)?;
            set_encoding(&mut b, value, layout);
            value
        };
        func.set_operand(op, 0, broadcast);
        Ok(true)
    }
}

fn set_encoding(b: &mut Builder<'_>, value: ValueId, layout: Layout) {
    let ty = b.ty(value).with_encoding(Some(layout));
    b.set_type(value, ty);
}

/// Removes conversions whose source already has the target layout.
pub struct FoldIdentityConversion;

impl RewritePattern for FoldIdentityConversion {
    fn name(&self) -> &'static str {
        "fold-identity-conversion"
    }

    fn match_and_rewrite(&self, func: &mut Function, op: OpId) -> IrResult<bool> {
        let Some(source) = conversion_source(func, op) else {
            return Ok(false);
        };
        let result = func.op(op).results[0];
        if func.encoding(source) != func.encoding(result) {
            return Ok(false);
        }
        func.replace_all_uses(result, source);
        func.erase_op(op);
        Ok(true)
    }
}

/// Rewrites `convert(convert(x))` to convert `x` directly.
pub struct FoldConversionChain;

impl RewritePattern for FoldConversionChain {
    fn name(&self) -> &'static str {
        "fold-conversion-chain"
    }

    fn match_and_rewrite(&self, func: &mut Function, op: OpId) -> IrResult<bool> {
        let Some(middle) = conversion_source(func, op) else {
            return Ok(false);
        };
        let Some(inner) = func.defining_op(middle) else {
            return Ok(false);
        };
        let Some(source) = conversion_source(func, inner) else {
            return Ok(false);
        };
        func.set_operand(op, 0, source);
        Ok(true)
    }
}

/// Erases conversions nothing uses.
pub struct EraseDeadConversion;

impl RewritePattern for EraseDeadConversion {
    fn name(&self) -> &'static str {
        "erase-dead-conversion"
    }

    fn match_and_rewrite(&self, func: &mut Function, op: OpId) -> IrResult<bool> {
        if conversion_source(func, op).is_none() || func.has_uses(func.op(op).results[0]) {
            return Ok(false);
        }
        func.erase_op(op);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infer::{default_layout, infer_layouts};
    use crate::types::{DType, Type};
    use crate::BinaryOp;
    use tlc_layout::LayoutConfig;

    fn config() -> LayoutConfig {
        LayoutConfig::new(4, 32, 1)
    }

    #[test]
    fn test_conversion_chain_folds_away() {
        let cfg = config();
        let blocked = default_layout(&[32, 32], &cfg).unwrap();
        let mut transposed = blocked.as_blocked().unwrap().clone();
        transposed.order = [0, 1].into_iter().collect();
        let ty = Type::tensor(&[32, 32], DType::Float32).with_encoding(Some(blocked.clone()));
        let mut func = Function::new("k", [ty]);
        let x = func.args[0];
        let mut b = Builder::new(&mut func);
        let there = b.convert_layout(x, transposed.into()).unwrap();
        let back = b.convert_layout(there, blocked).unwrap();
        let y = b.binary(BinaryOp::Add, back, back).unwrap();
        b.ret();

        assert!(canonicalize(&mut func).unwrap());
        assert_eq!(func.count_ops(|k| *k == OpKind::ConvertLayout), 0);
        let add = func.defining_op(y).unwrap();
        assert_eq!(func.op(add).operands.as_slice(), &[x, x]);
        assert!(!canonicalize(&mut func).unwrap());
    }

    #[test]
    fn test_select_scalar_condition_is_splat() {
        let cfg = config();
        let tensor = Type::tensor(&[16, 16], DType::Float32);
        let mut func = Function::new(
            "k",
            [Type::scalar(DType::Bool), tensor.clone(), tensor],
        );
        let (c, x, y) = (func.args[0], func.args[1], func.args[2]);
        let sel = Builder::new(&mut func).select(c, x, y).unwrap();
        infer_layouts(&mut func, &cfg).unwrap();
        canonicalize(&mut func).unwrap();

        let select = func.defining_op(sel).unwrap();
        let cond = func.op(select).operands[0];
        let splat = func.defining_op(cond).unwrap();
        assert!(matches!(func.op(splat).kind, OpKind::Splat { .. }));
        assert_eq!(func.encoding(cond), func.encoding(sel));
        crate::verifier::verify_layouts(&func, &cfg).unwrap();
    }

    #[test]
    fn test_select_row_condition_is_broadcast() {
        let cfg = config();
        let tensor = Type::tensor(&[16, 32], DType::Float32);
        let mut func = Function::new(
            "k",
            [Type::tensor(&[32], DType::Bool), tensor.clone(), tensor],
        );
        let (c, x, y) = (func.args[0], func.args[1], func.args[2]);
        let sel = Builder::new(&mut func).select(c, x, y).unwrap();
        infer_layouts(&mut func, &cfg).unwrap();
        canonicalize(&mut func).unwrap();

        let select = func.defining_op(sel).unwrap();
        let cond = func.op(select).operands[0];
        assert_eq!(func.value_type(cond).shape(), &[16, 32]);
        assert_eq!(func.encoding(cond), func.encoding(sel));
        let broadcast = func.defining_op(cond).unwrap();
        assert!(matches!(func.op(broadcast).kind, OpKind::Broadcast { .. }));
        let expanded = func.op(broadcast).operands[0];
        let expand = func.defining_op(expanded).unwrap();
        assert_eq!(func.op(expand).kind, OpKind::ExpandDims { axis: 0 });
        let sliced = func.op(expand).operands[0];
        assert!(matches!(func.encoding(sliced), Some(Layout::Slice(s)) if s.dim == 0));
        crate::verifier::verify_layouts(&func, &cfg).unwrap();
        assert!(!canonicalize(&mut func).unwrap());
    }
}
