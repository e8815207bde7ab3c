//! Layout inference.
//!
//! Every tensor value receives a layout in four steps:
//!
//! 1. **Anchors.** Pre-existing encodings are kept as they are. Loads get
//!    the default blocked layout of their shape, dots the dot layout
//!    ([`BlockedLayout::for_dot`]).
//! 2. **Backward.** Walking the body in reverse, a value without a layout
//!    takes the layout most of its consumers require of it (ties go to the
//!    first use). Reductions and transposes are skipped; their results are
//!    always derived from their operand.
//! 3. **Forward.** Walking the body in order, anything still open derives
//!    its layout from its operands. Conflicting operand layouts are settled
//!    by counting how many values among the operation's transitive
//!    consumers already carry each candidate; ties keep the first operand.
//!    Whatever remains gets the default blocked layout.
//! 4. **Reconciliation.** [`reconcile_uses`] inserts a `convert_layout`
//!    wherever an operand's layout differs from what its user requires.

use crate::builder::Builder;
use crate::function::{Function, InsertPoint, OpId, ValueId};
use crate::ops::OpKind;
use crate::types::Type;
use crate::{IrError, IrResult};
use rustc_hash::{FxHashMap, FxHashSet};
use tlc_layout::{BlockedLayout, DotOperandLayout, Layout, LayoutConfig, SliceLayout};
use tracing::{debug, trace};

/// The layout a tensor gets when nothing constrains it.
///
/// # Errors
///
/// Returns an error if `shape` is empty or has a zero extent.
pub fn default_layout(shape: &[u32], config: &LayoutConfig) -> IrResult<Layout> {
    Ok(BlockedLayout::default_for(shape, config)?.into())
}

/// Assign a layout to every tensor value of `func` and insert the
/// conversions the assignment needs.
///
/// # Errors
///
/// Returns [`IrError::ConstraintViolation`] if the operands of a dot cannot
/// share a contraction layout, and [`IrError::Unsupported`] for fixed
/// layouts no operation accepts.
pub fn infer_layouts(func: &mut Function, config: &LayoutConfig) -> IrResult<()> {
    let mut inference = Inference {
        config: *config,
        assigned: FxHashMap::default(),
    };
    inference.seed(func)?;
    inference.backward(func)?;
    inference.forward(func)?;
    let assigned = inference.assigned.len();
    for (value, layout) in inference.assigned {
        func.set_encoding(value, Some(layout));
    }
    check_dot_constraints(func)?;
    let inserted = reconcile_uses(func, config)?;
    debug!(
        function = %func.name,
        assigned,
        conversions = inserted,
        "inferred layouts"
    );
    Ok(())
}

struct Inference {
    config: LayoutConfig,
    assigned: FxHashMap<ValueId, Layout>,
}

impl Inference {
    fn seed(&mut self, func: &Function) -> IrResult<()> {
        let values = func
            .args
            .iter()
            .chain(func.body_ops().flat_map(|(_, op)| op.results.iter()));
        for &value in values {
            if let Some(layout) = func.encoding(value) {
                self.assigned.insert(value, layout.clone());
            }
        }

        for (_, op) in func.body_ops() {
            let Some(result) = op.result() else {
                continue;
            };
            let ty = func.value_type(result);
            if !ty.is_tensor() {
                continue;
            }
            match &op.kind {
                OpKind::Load(_) if !self.assigned.contains_key(&result) => {
                    let layout = default_layout(ty.shape(), &self.config)?;
                    self.assigned.insert(result, layout);
                }
                OpKind::Dot => match self.assigned.get(&result) {
                    Some(Layout::Blocked(_)) => {}
                    Some(other) => {
                        return Err(IrError::unsupported(
                            op,
                            format!("dot result must use a blocked layout, found {other}"),
                        ))
                    }
                    None => {
                        let layout = BlockedLayout::for_dot(ty.shape(), &self.config)?;
                        trace!(warps = ?layout.warps_per_cta, "dot layout");
                        self.assigned.insert(result, layout.into());
                    }
                },
                _ => {}
            }
        }
        Ok(())
    }

    fn backward(&mut self, func: &Function) -> IrResult<()> {
        let uses = func.use_map();
        for &id in func.body.iter().rev() {
            let op = func.op(id);
            if matches!(op.kind, OpKind::Reduce { .. } | OpKind::Trans { .. }) {
                continue;
            }
            for &result in &op.results {
                self.resolve_from_uses(func, result, &uses)?;
            }
        }
        for &arg in &func.args {
            self.resolve_from_uses(func, arg, &uses)?;
        }
        Ok(())
    }

    fn resolve_from_uses(
        &mut self,
        func: &Function,
        value: ValueId,
        uses: &FxHashMap<ValueId, Vec<(OpId, usize)>>,
    ) -> IrResult<()> {
        if !func.value_type(value).is_tensor() || self.assigned.contains_key(&value) {
            return Ok(());
        }
        let mut requirements = Vec::new();
        for &(user, index) in uses.get(&value).map_or(&[][..], Vec::as_slice) {
            let layout_of = |v: ValueId| self.assigned.get(&v).cloned();
            if let Some(layout) =
                operand_requirement(func, user, index, &layout_of, &self.config, false)?
            {
                requirements.push(layout);
            }
        }
        if let Some(layout) = majority(requirements) {
            self.assigned.insert(value, layout);
        }
        Ok(())
    }

    fn forward(&mut self, func: &Function) -> IrResult<()> {
        for &arg in &func.args {
            let ty = func.value_type(arg);
            if ty.is_tensor() && !self.assigned.contains_key(&arg) {
                let layout = default_layout(ty.shape(), &self.config)?;
                self.assigned.insert(arg, layout);
            }
        }
        for (id, op) in func.body_ops() {
            let Some(result) = op.result() else {
                continue;
            };
            let ty = func.value_type(result);
            if !ty.is_tensor() || self.assigned.contains_key(&result) {
                continue;
            }
            let layout = self.derive(func, id, ty)?;
            self.assigned.insert(result, layout);
        }
        Ok(())
    }

    /// The layout of `id`'s result as implied by its operands.
    fn derive(&self, func: &Function, id: OpId, ty: &Type) -> IrResult<Layout> {
        let op = func.op(id);
        let operand_layout = |i: usize| op.operands.get(i).and_then(|v| self.assigned.get(v));
        let layout = match &op.kind {
            kind if kind.is_elementwise() => {
                let mut candidates: Vec<Layout> = Vec::new();
                for &operand in &op.operands {
                    if func.value_type(operand).shape() != ty.shape() {
                        continue;
                    }
                    if let Some(layout) = self.assigned.get(&operand) {
                        if !candidates.contains(layout) {
                            candidates.push(layout.clone());
                        }
                    }
                }
                match candidates.len() {
                    0 => None,
                    1 => candidates.pop(),
                    _ => self.resolve_conflict(func, id, candidates),
                }
            }
            OpKind::Broadcast { .. } => operand_layout(0).cloned(),
            OpKind::ExpandDims { axis } => match operand_layout(0) {
                Some(Layout::Slice(slice)) if slice.dim == *axis => Some((*slice.parent).clone()),
                _ => None,
            },
            OpKind::Trans { order } => match operand_layout(0) {
                Some(Layout::Blocked(blocked)) => Some(blocked.permute(order)?.into()),
                _ => None,
            },
            OpKind::Reduce { axis, .. } => match operand_layout(0) {
                Some(parent) => Some(SliceLayout::new(*axis, parent.clone())?.into()),
                None => None,
            },
            _ => None,
        };
        match layout {
            Some(layout) => Ok(layout),
            None => default_layout(ty.shape(), &self.config),
        }
    }

    /// Pick among conflicting operand layouts by how many values among the
    /// transitive consumers of `id` already use each.
    fn resolve_conflict(&self, func: &Function, id: OpId, candidates: Vec<Layout>) -> Option<Layout> {
        let consumers = transitive_consumers(func, id);
        let mut best: Option<(Layout, usize)> = None;
        for candidate in candidates {
            let score = consumers
                .iter()
                .filter(|v| self.assigned.get(v) == Some(&candidate))
                .count();
            trace!(%candidate, score, "layout candidate");
            if best.as_ref().map_or(true, |(_, s)| score > *s) {
                best = Some((candidate, score));
            }
        }
        best.map(|(layout, _)| layout)
    }
}

/// Values touched by the operations transitively consuming `id`'s results.
fn transitive_consumers(func: &Function, id: OpId) -> FxHashSet<ValueId> {
    let uses = func.use_map();
    let mut seen_ops = FxHashSet::default();
    let mut values = FxHashSet::default();
    let mut stack: Vec<ValueId> = func.op(id).results.to_vec();
    while let Some(value) = stack.pop() {
        for &(user, _) in uses.get(&value).map_or(&[][..], Vec::as_slice) {
            if !seen_ops.insert(user) {
                continue;
            }
            let op = func.op(user);
            values.extend(op.operands.iter().copied());
            values.extend(op.results.iter().copied());
            stack.extend(op.results.iter().copied());
        }
    }
    values
}

/// The most frequent layout, ties to the earliest.
fn majority(layouts: Vec<Layout>) -> Option<Layout> {
    let mut counts: Vec<(Layout, usize)> = Vec::new();
    for layout in layouts {
        match counts.iter_mut().find(|(l, _)| *l == layout) {
            Some((_, n)) => *n += 1,
            None => counts.push((layout, 1)),
        }
    }
    let mut best: Option<(Layout, usize)> = None;
    for (layout, n) in counts {
        if best.as_ref().map_or(true, |(_, m)| n > *m) {
            best = Some((layout, n));
        }
    }
    best.map(|(layout, _)| layout)
}

/// The layout operation `user` requires of operand `index`, given the
/// layouts reported by `layout_of`.
///
/// Dot operands A and B are only required when `dot_operands` is set: the
/// backward walk does not push dot operand layouts upstream.
///
/// # Errors
///
/// Returns an error if the required layout cannot be constructed.
pub fn operand_requirement(
    func: &Function,
    user: OpId,
    index: usize,
    layout_of: &dyn Fn(ValueId) -> Option<Layout>,
    config: &LayoutConfig,
    dot_operands: bool,
) -> IrResult<Option<Layout>> {
    let op = func.op(user);
    let operand = op.operands[index];
    let operand_ty = func.value_type(operand);
    if !operand_ty.is_tensor() {
        return Ok(None);
    }
    let result_layout = || op.result().and_then(layout_of);
    let required = match &op.kind {
        kind if kind.is_elementwise() => {
            let same_shape = op
                .result()
                .is_some_and(|r| func.value_type(r).shape() == operand_ty.shape());
            if same_shape {
                result_layout()
            } else {
                None
            }
        }
        OpKind::Load(_) | OpKind::Broadcast { .. } => result_layout(),
        OpKind::Store(_) => {
            let ptr = op.operands[0];
            if func.value_type(ptr).is_tensor() {
                match layout_of(ptr) {
                    Some(layout) => Some(layout),
                    None => Some(default_layout(func.value_type(ptr).shape(), config)?),
                }
            } else {
                None
            }
        }
        OpKind::ExpandDims { axis } => match result_layout() {
            Some(result) => Some(SliceLayout::new(*axis, result)?.into()),
            None => None,
        },
        OpKind::Trans { order } => match result_layout() {
            Some(Layout::Blocked(result)) => Some(result.permute(&inverse_permutation(order))?.into()),
            _ => None,
        },
        OpKind::Reduce { axis, .. } => match result_layout() {
            Some(Layout::Slice(slice)) if slice.dim == *axis => Some(*slice.parent),
            _ => None,
        },
        OpKind::Dot => match (index, result_layout()) {
            (2, result) => result,
            (0 | 1, Some(Layout::Blocked(result))) if dot_operands => {
                let bits = operand_ty.elem().map_or(32, |e| e.bits());
                let k_width = DotOperandLayout::k_width_for_bits(bits);
                Some(DotOperandLayout::new(index as u32, result, k_width)?.into())
            }
            _ => None,
        },
        _ => None,
    };
    Ok(required)
}

fn inverse_permutation(order: &[u32]) -> Vec<u32> {
    let mut inverse = vec![0; order.len()];
    for (i, &d) in order.iter().enumerate() {
        inverse[d as usize] = i as u32;
    }
    inverse
}

/// Check that both operands of every dot agree on the contraction
/// dimension and on elements per lane along it.
///
/// # Errors
///
/// Returns [`IrError::ConstraintViolation`] naming both operand layouts.
pub fn check_dot_constraints(func: &Function) -> IrResult<()> {
    for (_, op) in func.body_ops() {
        if op.kind != OpKind::Dot {
            continue;
        }
        let (a, b) = (op.operands[0], op.operands[1]);
        let (a_ty, b_ty) = (func.value_type(a), func.value_type(b));
        let Some(Layout::Blocked(parent)) = op.result().and_then(|r| func.encoding(r)) else {
            continue;
        };
        let k_width = |ty: &Type| DotOperandLayout::k_width_for_bits(ty.elem().map_or(32, |e| e.bits()));
        let lhs = DotOperandLayout::new(0, parent.clone(), k_width(a_ty))?;
        let rhs = DotOperandLayout::new(1, parent.clone(), k_width(b_ty))?;
        let reason = if a_ty.shape()[1] != b_ty.shape()[0] {
            Some(format!(
                "contraction extents differ: A has K = {}, B has K = {}",
                a_ty.shape()[1],
                b_ty.shape()[0]
            ))
        } else if lhs.k_width != rhs.k_width {
            Some(format!(
                "operands hold {} and {} contraction elements per lane",
                lhs.k_width, rhs.k_width
            ))
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(IrError::ConstraintViolation {
                op: op.kind.name().to_string(),
                loc: op.loc.clone(),
                lhs: Layout::from(lhs).to_string(),
                rhs: Layout::from(rhs).to_string(),
                reason,
            });
        }
    }
    Ok(())
}

/// Insert a `convert_layout` on every operand whose layout differs from
/// the one its user requires. Conversions of the same value to the same
/// layout are shared. Returns the number of conversions inserted.
///
/// # Errors
///
/// Returns an error if a required layout cannot be constructed.
pub fn reconcile_uses(func: &mut Function, config: &LayoutConfig) -> IrResult<usize> {
    let mut converted: FxHashMap<(ValueId, Layout), ValueId> = FxHashMap::default();
    let mut inserted = 0;
    for id in func.body.clone() {
        for index in 0..func.op(id).operands.len() {
            let operand = func.op(id).operands[index];
            let layout_of = |v: ValueId| func.encoding(v).cloned();
            let Some(required) = operand_requirement(func, id, index, &layout_of, config, true)?
            else {
                continue;
            };
            if func.encoding(operand) == Some(&required) {
                continue;
            }
            let key = (operand, required);
            let value = match converted.get(&key) {
                Some(&value) => value,
                None => {
                    let loc = func.op(id).loc.clone();
                    let mut builder = Builder::at(func, InsertPoint::Before(id));
                    builder.set_loc(loc);
                    let value = builder.convert_layout(operand, key.1.clone())?;
                    trace!(?operand, to = %key.1, "inserted conversion");
                    converted.insert(key, value);
                    inserted += 1;
                    value
                }
            };
            func.set_operand(id, index, value);
        }
    }
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DType, ElemType};
    use crate::{BinaryOp, MemAttrs, ReduceOp};

    fn config(num_warps: u32, threads: u32) -> LayoutConfig {
        LayoutConfig::new(num_warps, threads, 1)
    }

    #[test]
    fn test_majority_ties_first() {
        let cfg = config(4, 32);
        let a = default_layout(&[16, 16], &cfg).unwrap();
        let b = default_layout(&[16, 16], &config(2, 32)).unwrap();
        assert_eq!(majority(vec![a.clone(), b.clone()]), Some(a.clone()));
        assert_eq!(majority(vec![a.clone(), b.clone(), b.clone()]), Some(b));
        assert_eq!(majority(Vec::new()), None);
    }

    #[test]
    fn test_inverse_permutation() {
        assert_eq!(inverse_permutation(&[1, 0]), vec![1, 0]);
        assert_eq!(inverse_permutation(&[2, 0, 1]), vec![1, 2, 0]);
    }

    #[test]
    fn test_expand_dims_pulls_slice_upstream() {
        let cfg = config(4, 32);
        let mut func = Function::new("k", [Type::ptr(DType::Float32)]);
        let base = func.args[0];
        let mut b = Builder::new(&mut func);
        let rows = b.make_range(0, 32).unwrap();
        let rows = b.expand_dims(rows, 1).unwrap();
        let rows = b.broadcast(rows, &[32, 32]).unwrap();
        let cols = b.make_range(0, 32).unwrap();
        let cols = b.expand_dims(cols, 0).unwrap();
        let cols = b.broadcast(cols, &[32, 32]).unwrap();
        let offsets = b.binary(BinaryOp::Add, rows, cols).unwrap();
        let ptrs = b.splat(base, &[32, 32]).unwrap();
        let ptrs = b.add_ptr(ptrs, offsets).unwrap();
        let x = b.load(ptrs, None, None, MemAttrs::default()).unwrap();
        b.store(ptrs, x, None, MemAttrs::default()).unwrap();
        b.ret();

        infer_layouts(&mut func, &cfg).unwrap();
        let blocked = default_layout(&[32, 32], &cfg).unwrap();
        assert_eq!(func.encoding(ptrs), Some(&blocked));
        assert_eq!(func.encoding(offsets), Some(&blocked));
        let range = func.op(func.body[0]).results[0];
        assert_eq!(
            func.encoding(range),
            Some(&Layout::from(SliceLayout::new(1, blocked).unwrap()))
        );
        assert_eq!(func.count_ops(|k| *k == OpKind::ConvertLayout), 0);
        crate::verifier::verify_layouts(&func, &cfg).unwrap();
    }

    #[test]
    fn test_reduce_derives_slice() {
        let cfg = config(4, 32);
        let mut func = Function::new("k", [Type::tensor(&[8, 64], DType::Float32)]);
        let x = func.args[0];
        let mut b = Builder::new(&mut func);
        let m = b.reduce(x, 1, ReduceOp::Max).unwrap();
        b.ret();
        infer_layouts(&mut func, &cfg).unwrap();
        let parent = func.encoding(x).unwrap().clone();
        assert_eq!(
            func.encoding(m),
            Some(&Layout::from(SliceLayout::new(1, parent).unwrap()))
        );
    }

    fn conflicting_layouts(cfg: &LayoutConfig) -> (Layout, Layout) {
        let wide = Layout::from(
            BlockedLayout::with_size_per_thread(
                &[64, 64],
                [1, 4].into_iter().collect(),
                [1, 0].into_iter().collect(),
                cfg,
            )
            .unwrap(),
        );
        (default_layout(&[64, 64], cfg).unwrap(), wide)
    }

    #[test]
    fn test_consumer_requirement_wins() {
        let cfg = config(4, 32);
        let (other, fixed) = conflicting_layouts(&cfg);
        let tensor = Type::tensor(&[64, 64], DType::Float32);
        let ptrs = Type::tensor(&[64, 64], ElemType::Ptr(DType::Float32));
        let mut func = Function::new(
            "k",
            [
                tensor.with_encoding(Some(other)),
                tensor.with_encoding(Some(fixed.clone())),
                ptrs.with_encoding(Some(fixed.clone())),
            ],
        );
        let (a, c, p) = (func.args[0], func.args[1], func.args[2]);
        let mut b = Builder::new(&mut func);
        let sum = b.binary(BinaryOp::Add, a, c).unwrap();
        let scaled = b.binary(BinaryOp::Mul, sum, c).unwrap();
        b.store(p, scaled, None, MemAttrs::default()).unwrap();
        b.ret();

        infer_layouts(&mut func, &cfg).unwrap();
        assert_eq!(func.encoding(sum), Some(&fixed));
        assert_eq!(func.count_ops(|k| *k == OpKind::ConvertLayout), 1);
        crate::verifier::verify_layouts(&func, &cfg).unwrap();
    }

    #[test]
    fn test_conflict_scores_transitive_consumers() {
        let cfg = config(4, 32);
        let (other, fixed) = conflicting_layouts(&cfg);
        let tensor = Type::tensor(&[64, 64], DType::Float32);
        let mut func = Function::new("k", [tensor.clone(), tensor]);
        let (a, c) = (func.args[0], func.args[1]);
        let mut b = Builder::new(&mut func);
        let sum = b.binary(BinaryOp::Add, a, c).unwrap();
        b.binary(BinaryOp::Add, sum, c).unwrap();
        let add = func.defining_op(sum).unwrap();

        let mut inference = Inference {
            config: cfg,
            assigned: FxHashMap::default(),
        };
        inference.assigned.insert(a, other.clone());
        inference.assigned.insert(c, fixed.clone());
        let candidates = vec![other.clone(), fixed.clone()];
        assert_eq!(
            inference.resolve_conflict(&func, add, candidates.clone()),
            Some(fixed.clone())
        );

        // With no consumer carrying either layout the first operand wins.
        inference.assigned.remove(&c);
        assert_eq!(inference.resolve_conflict(&func, add, candidates), Some(other));
    }

    #[test]
    fn test_dot_kwidth_mismatch_is_constraint_violation() {
        let cfg = config(4, 64);
        let mut func = Function::new(
            "k",
            [
                Type::tensor(&[64, 32], DType::Float16),
                Type::tensor(&[32, 64], DType::Float32),
                Type::tensor(&[64, 64], DType::Float32),
            ],
        );
        let (a, bm, c) = (func.args[0], func.args[1], func.args[2]);
        let mut b = Builder::new(&mut func);
        b.set_loc(tlc_span::Loc::file("attn.py", 12, 4));
        b.dot(a, bm, c).unwrap();
        let err = infer_layouts(&mut func, &cfg).unwrap_err();
        match err {
            IrError::ConstraintViolation { op, loc, lhs, rhs, .. } => {
                assert_eq!(op, "tt.dot");
                assert_eq!(loc, tlc_span::Loc::file("attn.py", 12, 4));
                assert!(lhs.contains("opIdx = 0") && lhs.contains("kWidth = 4"));
                assert!(rhs.contains("opIdx = 1") && rhs.contains("kWidth = 2"));
            }
            other => panic!("unexpected error {other}"),
        }
    }
}
