//! Coalescing of global memory accesses.
//!
//! Each global load and store gets a blocked layout whose fastest dimension
//! holds as many contiguous elements per lane as one vector access can
//! carry. Memory operations connected through data flow and sharing a shape
//! and order form a region with one thread arrangement, derived from the
//! region's narrowest element type; each access then keeps its own vector
//! width within that arrangement.
//!
//! Operands computed by a chain of cheap elementwise operations (ranges,
//! splats, constants, arithmetic and pointer offsets) are recomputed under
//! the new layout rather than converted; the originals are erased once
//! nothing else reads them. Only real conversions are counted.

use crate::builder::Builder;
use crate::function::{Function, InsertPoint, OpId, ValueId};
use crate::infer::reconcile_uses;
use crate::ops::OpKind;
use crate::types::{ElemType, Shape, Type};
use crate::{IrError, IrResult};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tlc_layout::{BlockedLayout, Dims, Layout, LayoutConfig};
use tlc_target::GpuTarget;
use tracing::debug;

/// A global memory access considered for coalescing.
#[derive(Clone, Debug)]
struct Access {
    op: OpId,
    shape: Shape,
    order: Dims,
    per_thread: u32,
}

/// Rewrite the layouts of global loads and stores for vectorized access.
/// Returns the number of conversions inserted.
///
/// # Errors
///
/// Returns [`IrError::Unsupported`] for a block pointer whose
/// `make_tensor_ptr` cannot be found, or a layout error.
pub fn coalesce(func: &mut Function, target: &GpuTarget, config: &LayoutConfig) -> IrResult<usize> {
    let max_bytes = target.max_contiguous_bytes();
    let mut accesses = Vec::new();
    for (id, op) in func.body_ops() {
        if op.kind.is_memory_access() {
            if let Some(access) = describe_access(func, id, max_bytes)? {
                accesses.push(access);
            }
        }
    }
    if accesses.is_empty() {
        return Ok(0);
    }

    let slices: Vec<FxHashSet<ValueId>> = accesses.iter().map(|a| slice_of(func, a.op)).collect();
    let mut regions = UnionFind::new(accesses.len());
    for i in 0..accesses.len() {
        for j in i + 1..accesses.len() {
            let (a, b) = (&accesses[i], &accesses[j]);
            if a.shape == b.shape && a.order == b.order && !slices[i].is_disjoint(&slices[j]) {
                regions.union(i, j);
            }
        }
    }

    let mut assigned = Vec::with_capacity(accesses.len());
    for region in regions.groups() {
        let first = &accesses[region[0]];
        let widest = region
            .iter()
            .map(|&i| accesses[i].per_thread)
            .max()
            .unwrap_or(1);
        let arrangement = BlockedLayout::with_size_per_thread(
            &first.shape,
            size_per_thread(&first.shape, &first.order, widest),
            first.order.clone(),
            config,
        )?;
        debug!(
            accesses = region.len(),
            per_thread = widest,
            layout = %arrangement,
            "coalescing region"
        );
        for &i in &region {
            let access = &accesses[i];
            let mut layout = arrangement.clone();
            let fastest = access.order[0] as usize;
            layout.size_per_thread[fastest] = widest.min(access.per_thread);
            assigned.push((i, Layout::Blocked(layout)));
        }
    }

    // Recomputed chains are shared with later accesses, so visit accesses in
    // program order.
    assigned.sort_by_key(|&(i, _)| i);
    let mut recomputed = Recomputed::default();
    let mut inserted = 0;
    for (i, layout) in &assigned {
        inserted += apply_layout(func, accesses[*i].op, layout, &mut recomputed)?;
    }
    for value in recomputed.replaced {
        erase_dead_chain(func, value);
    }
    inserted += reconcile_uses(func, config)?;
    debug!(function = %func.name, conversions = inserted, "coalesced memory accesses");
    Ok(inserted)
}

fn describe_access(func: &Function, id: OpId, max_bytes: u32) -> IrResult<Option<Access>> {
    let op = func.op(id);
    let ptr = op.operands[0];
    let (shape, pointee, order) = match func.value_type(ptr) {
        Type::Tensor(tensor) => {
            let ElemType::Ptr(pointee) = tensor.elem else {
                return Ok(None);
            };
            let Some(layout) = &tensor.encoding else {
                return Err(IrError::malformed(op, "pointer has no layout"));
            };
            (tensor.shape.clone(), pointee, layout.order())
        }
        Type::BlockPtr(block) => {
            let order = block_ptr_order(func, ptr).ok_or_else(|| {
                IrError::unsupported(op, "block pointer does not come from make_tensor_ptr")
            })?;
            (block.shape.clone(), block.elem, order)
        }
        Type::Scalar(_) => return Ok(None),
    };
    let fastest = order[0] as usize;
    let per_thread = (max_bytes / pointee.size_bytes()).max(1).min(shape[fastest]);
    Ok(Some(Access {
        op: id,
        shape,
        order,
        per_thread,
    }))
}

/// The `order` of the `make_tensor_ptr` a block pointer was advanced from.
fn block_ptr_order(func: &Function, mut ptr: ValueId) -> Option<Dims> {
    loop {
        let op = func.op(func.defining_op(ptr)?);
        match &op.kind {
            OpKind::MakeTensorPtr { order, .. } => return Some(order.iter().copied().collect()),
            OpKind::Advance => ptr = op.operands[0],
            _ => return None,
        }
    }
}

fn size_per_thread(shape: &[u32], order: &[u32], per_thread: u32) -> Dims {
    let mut spt: Dims = SmallVec::from_elem(1, shape.len());
    spt[order[0] as usize] = per_thread;
    spt
}

fn is_sliceable(ty: &Type) -> bool {
    matches!(ty, Type::Tensor(_) | Type::BlockPtr(_))
}

/// Tensor values reachable from `id` through operands or through uses.
fn slice_of(func: &Function, id: OpId) -> FxHashSet<ValueId> {
    let mut slice = FxHashSet::default();
    let op = func.op(id);

    let mut stack: Vec<ValueId> = op.operands.to_vec();
    while let Some(value) = stack.pop() {
        if !is_sliceable(func.value_type(value)) || !slice.insert(value) {
            continue;
        }
        if let Some(def) = func.defining_op(value) {
            stack.extend(func.op(def).operands.iter().copied());
        }
    }

    let uses = func.use_map();
    let mut stack: Vec<ValueId> = op.results.to_vec();
    let mut forward = FxHashSet::default();
    while let Some(value) = stack.pop() {
        if !is_sliceable(func.value_type(value)) || !forward.insert(value) {
            continue;
        }
        for &(user, _) in uses.get(&value).map_or(&[][..], Vec::as_slice) {
            stack.extend(func.op(user).results.iter().copied());
        }
    }
    slice.extend(forward);
    slice
}

/// Values already recomputed under a layout, and the operands they replaced.
#[derive(Default)]
struct Recomputed {
    clones: FxHashMap<(ValueId, Layout), ValueId>,
    replaced: Vec<ValueId>,
}

/// Give a memory access `layout`, recomputing or converting its tensor
/// operands as needed. Returns the number of conversions inserted.
fn apply_layout(
    func: &mut Function,
    id: OpId,
    layout: &Layout,
    recomputed: &mut Recomputed,
) -> IrResult<usize> {
    let mut inserted = 0;
    for index in 0..func.op(id).operands.len() {
        let operand = func.op(id).operands[index];
        if !func.value_type(operand).is_tensor() || func.encoding(operand) == Some(layout) {
            continue;
        }
        if let Some(value) = rematerialize(func, operand, layout, id, recomputed) {
            func.set_operand(id, index, value);
            recomputed.replaced.push(operand);
            continue;
        }
        let loc = func.op(id).loc.clone();
        let mut builder = Builder::at(func, InsertPoint::Before(id));
        builder.set_loc(loc);
        let converted = builder.convert_layout(operand, layout.clone())?;
        func.set_operand(id, index, converted);
        inserted += 1;
    }
    let loaded = match func.op(id).kind {
        OpKind::Load(_) => func.op(id).result(),
        _ => None,
    };
    if let Some(result) = loaded {
        func.set_encoding(result, Some(layout.clone()));
    }
    Ok(inserted)
}

fn is_rematerializable(kind: &OpKind) -> bool {
    matches!(
        kind,
        OpKind::MakeRange { .. }
            | OpKind::Splat { .. }
            | OpKind::Constant { .. }
            | OpKind::Unary(_)
            | OpKind::Binary(_)
            | OpKind::Cast { .. }
            | OpKind::AddPtr
    )
}

/// Defining ops of the tensor values `value` is computed from, operands
/// first. Fails on arguments and on anything but cheap elementwise ops.
fn collect_chain(
    func: &Function,
    value: ValueId,
    seen: &mut FxHashSet<OpId>,
    chain: &mut Vec<OpId>,
) -> bool {
    if !func.value_type(value).is_tensor() {
        return true;
    }
    let Some(def) = func.defining_op(value) else {
        return false;
    };
    if !seen.insert(def) {
        return true;
    }
    let op = func.op(def);
    if !is_rematerializable(&op.kind) || op.results.len() != 1 {
        return false;
    }
    for &operand in &op.operands {
        if !collect_chain(func, operand, seen, chain) {
            return false;
        }
    }
    chain.push(def);
    true
}

/// Recompute `value` under `layout` just before `at`.
fn rematerialize(
    func: &mut Function,
    value: ValueId,
    layout: &Layout,
    at: OpId,
    recomputed: &mut Recomputed,
) -> Option<ValueId> {
    let mut chain = Vec::new();
    if !collect_chain(func, value, &mut FxHashSet::default(), &mut chain) {
        return None;
    }
    for def in chain {
        let op = func.op(def).clone();
        let key = (op.results[0], layout.clone());
        if recomputed.clones.contains_key(&key) {
            continue;
        }
        let operands: SmallVec<[ValueId; 4]> = op
            .operands
            .iter()
            .map(|&v| {
                recomputed
                    .clones
                    .get(&(v, layout.clone()))
                    .copied()
                    .unwrap_or(v)
            })
            .collect();
        let mut kind = op.kind;
        if let OpKind::Constant { ty, .. } = &mut kind {
            *ty = ty.with_encoding(Some(layout.clone()));
        }
        let ty = func.value_type(key.0).with_encoding(Some(layout.clone()));
        let clone = func.insert_op(InsertPoint::Before(at), kind, &operands, [ty], op.loc);
        recomputed.clones.insert(key, func.op(clone).results[0]);
    }
    debug!(?value, to = %layout, "recomputed operand");
    recomputed.clones.get(&(value, layout.clone())).copied()
}

/// Erase the elementwise ops computing `value` that nothing reads anymore.
fn erase_dead_chain(func: &mut Function, value: ValueId) {
    let mut stack = vec![value];
    while let Some(value) = stack.pop() {
        let Some(def) = func.defining_op(value) else {
            continue;
        };
        let op = func.op(def);
        if op.erased || !is_rematerializable(&op.kind) || op.results.iter().any(|&r| func.has_uses(r))
        {
            continue;
        }
        stack.extend(op.operands.iter().copied());
        func.erase_op(def);
    }
}

/// Disjoint sets over `0..n` with path halving.
struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra.max(rb)] = ra.min(rb);
        }
    }

    /// Members of each set, ordered by their smallest element.
    fn groups(&mut self) -> Vec<Vec<usize>> {
        let mut groups: Vec<Vec<usize>> = Vec::new();
        let mut root_group = vec![usize::MAX; self.parent.len()];
        for i in 0..self.parent.len() {
            let root = self.find(i);
            if root_group[root] == usize::MAX {
                root_group[root] = groups.len();
                groups.push(Vec::new());
            }
            groups[root_group[root]].push(i);
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infer::infer_layouts;
    use crate::types::DType;
    use crate::MemAttrs;

    #[test]
    fn test_union_find_groups() {
        let mut uf = UnionFind::new(5);
        uf.union(3, 1);
        uf.union(4, 0);
        assert_eq!(uf.groups(), vec![vec![0, 4], vec![1, 3], vec![2]]);
    }

    fn copy_kernel(dtype: DType, n: u32) -> Function {
        let mut func = Function::new("copy", [Type::ptr(dtype), Type::ptr(dtype)]);
        let (src, dst) = (func.args[0], func.args[1]);
        let mut b = Builder::new(&mut func);
        let offsets = b.make_range(0, n as i32).unwrap();
        let src = b.splat(src, &[n]).unwrap();
        let src = b.add_ptr(src, offsets).unwrap();
        let dst = b.splat(dst, &[n]).unwrap();
        let dst = b.add_ptr(dst, offsets).unwrap();
        let x = b.load(src, None, None, MemAttrs::default()).unwrap();
        b.store(dst, x, None, MemAttrs::default()).unwrap();
        b.ret();
        func
    }

    #[test]
    fn test_vector_width_follows_target() {
        let config = LayoutConfig::new(4, 32, 1);
        for (target, dtype, expected) in [
            ("cuda:80", DType::Float32, 4),
            ("cuda:80", DType::Float16, 8),
            ("cuda:61", DType::Float32, 2),
            ("cuda:80", DType::Float64, 2),
        ] {
            let target: GpuTarget = target.parse().unwrap();
            let mut func = copy_kernel(dtype, 1024);
            infer_layouts(&mut func, &config).unwrap();
            coalesce(&mut func, &target, &config).unwrap();
            let load = func
                .body_ops()
                .find(|(_, op)| matches!(op.kind, OpKind::Load(_)))
                .and_then(|(_, op)| op.result())
                .unwrap();
            let layout = func.encoding(load).unwrap();
            assert_eq!(layout.size_per_thread()[0], expected, "{target} {dtype}");
        }
    }

    #[test]
    fn test_per_thread_capped_by_extent() {
        let config = LayoutConfig::new(1, 32, 1);
        let mut func = copy_kernel(DType::Float16, 4);
        infer_layouts(&mut func, &config).unwrap();
        coalesce(&mut func, &GpuTarget::cuda(80), &config).unwrap();
        let x = func
            .body_ops()
            .find(|(_, op)| matches!(op.kind, OpKind::Load(_)))
            .and_then(|(_, op)| op.result())
            .unwrap();
        assert_eq!(func.encoding(x).unwrap().size_per_thread()[0], 4);
    }

    #[test]
    fn test_offset_chains_are_recomputed() {
        let config = LayoutConfig::new(1, 32, 1);
        let mut func = copy_kernel(DType::Int8, 600);
        infer_layouts(&mut func, &config).unwrap();
        let before = func.num_ops();
        let inserted = coalesce(&mut func, &GpuTarget::hip("gfx1100").unwrap(), &config).unwrap();
        assert_eq!(inserted, 0);
        assert_eq!(func.count_ops(|k| *k == OpKind::ConvertLayout), 0);
        // The range is shared by both accesses; the old chain is gone.
        assert_eq!(func.num_ops(), before);
        assert_eq!(func.count_ops(|k| matches!(k, OpKind::MakeRange { .. })), 1);

        for (_, op) in func.body_ops().filter(|(_, op)| op.kind.is_memory_access()) {
            let ptr = op.operands[0];
            let layout = func.encoding(ptr).unwrap();
            assert_eq!(layout.size_per_thread()[0], 16);
            let def = func.op(func.defining_op(ptr).unwrap());
            assert_eq!(def.kind, OpKind::AddPtr);
            for &operand in &def.operands {
                assert_eq!(func.encoding(operand), Some(layout));
            }
        }
    }

    #[test]
    fn test_block_pointer_order() {
        let config = LayoutConfig::new(4, 64, 1);
        let mut func = Function::new("k", [Type::ptr(DType::Float16)]);
        let base = func.args[0];
        let mut b = Builder::new(&mut func);
        let dim = b.const_i64(128).unwrap();
        let one = b.const_i64(1).unwrap();
        let zero = b.const_i32(0).unwrap();
        let block = b
            .make_tensor_ptr(base, &[dim, dim], &[one, dim], &[zero, zero], &[64, 64], &[0, 1])
            .unwrap();
        let step = b.const_i32(64).unwrap();
        let next = b.advance(block, &[step, zero]).unwrap();
        let x = b.load(next, None, None, MemAttrs::default()).unwrap();
        b.ret();
        infer_layouts(&mut func, &config).unwrap();
        coalesce(&mut func, &GpuTarget::default(), &config).unwrap();
        let layout = func.encoding(x).unwrap();
        assert_eq!(layout.order().as_slice(), &[0, 1]);
        assert_eq!(layout.size_per_thread().as_slice(), &[8, 1]);
    }
}
