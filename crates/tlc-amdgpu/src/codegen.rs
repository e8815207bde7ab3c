//! Kernel emission from Block IR.
//!
//! Every tensor value becomes the list of registers the calling lane holds,
//! in the register order of its layout (see [`crate::distribution`]).
//! Scalars stay scalars; block pointers are tracked as base, extents,
//! strides and offsets and only materialize as addresses at their loads and
//! stores.
//!
//! | Plan | Emission |
//! |------|----------|
//! | elementwise | one instruction per register |
//! | memory access | predicated helper calls on `vector_width` groups |
//! | reduction | register combine, `shuffle_xor` butterfly, LDS across warps |
//! | conversion | register renaming, `shuffle_idx_dyn`, or an LDS round trip |
//! | dot | a call to a tile helper specialized for the operand shapes |

use crate::distribution::{and_pred, Distribution};
use crate::expand::expand_predicated_calls;
use crate::ll::{
    self, BinOp, Builder, CastOp, FloatPredicate, Global, Inst, IntPredicate, LlType, MemFlags,
    Signature, Value, LDS_ADDRSPACE,
};
use crate::primitives::{get_num_programs, get_pid, ll_load, ll_store, mangle, shuffle_idx_dyn, shuffle_xor};
use crate::{CodegenError, CodegenResult};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tlc_block_ir::{
    BlockFunction, BlockModule, BlockOp, ConvertPlan, DotPlan, MemAccessPlan, Plan, ReducePlan,
};
use tlc_index::Idx;
use tlc_layout::{fmt_dims, Dims, Layout, LayoutConfig};
use tlc_target::GpuTarget;
use tlc_tensor_ir::{
    BinaryOp, CacheModifier, ConstValue, DType, ElemType, OpKind, Padding, ReduceOp, Type,
    UnaryOp, ValueId,
};
use tracing::{debug, trace};

/// The workgroup's shared memory buffer. Scratch users index it from 0;
/// its size is fixed at launch.
pub const SHARED_MEMORY: &str = "global_smem";

/// Emit every kernel of a module, with predicated accesses expanded.
///
/// # Errors
///
/// Returns [`CodegenError::UnsupportedTarget`] if the module was planned
/// for a non-AMD target, or the first kernel's emission error.
pub fn emit_module(module: &BlockModule) -> CodegenResult<ll::Module> {
    if !module.target.is_amd() {
        return Err(CodegenError::UnsupportedTarget(module.target.to_string()));
    }
    let mut out = ll::Module::new(module.name.clone(), module.target.arch.clone());
    let mut shared = false;
    for func in &module.functions {
        let mut emitted = emit_function(func, &module.target, &module.config)?;
        expand_predicated_calls(&mut emitted)?;
        shared |= emitted.insts().any(uses_shared_memory);
        out.functions.push(emitted);
    }
    if shared {
        out.globals.push(Global {
            name: SHARED_MEMORY.to_string(),
            addrspace: LDS_ADDRSPACE,
            align: 16,
        });
    }
    debug!(
        module = %module.name,
        kernels = out.functions.len(),
        shared,
        "emitted module"
    );
    Ok(out)
}

fn uses_shared_memory(inst: &Inst) -> bool {
    let smem = |v: &Value| matches!(v, Value::Global(name, _) if name == SHARED_MEMORY);
    match inst {
        Inst::Gep { base, .. } => smem(base),
        Inst::Load { ptr, .. } => smem(ptr),
        Inst::Store { ptr, .. } => smem(ptr),
        _ => false,
    }
}

/// Emit one kernel. Predicated accesses are left as helper calls.
///
/// # Errors
///
/// Returns an error if the target is not AMD, a kernel argument is not a
/// scalar, or an operation has no emission for its types and layouts.
pub fn emit_function(
    func: &BlockFunction,
    target: &GpuTarget,
    config: &LayoutConfig,
) -> CodegenResult<ll::Function> {
    if !target.is_amd() {
        return Err(CodegenError::UnsupportedTarget(target.to_string()));
    }
    let mut params = Vec::with_capacity(func.args.len());
    for &arg in &func.args {
        match func.value_type(arg) {
            Type::Scalar(elem) => params.push(LlType::from_elem(*elem)),
            other => {
                return Err(CodegenError::Unsupported(format!(
                    "kernel argument of type {other}"
                )))
            }
        }
    }

    let mut out = ll::Function::new(func.name.clone(), params);
    out.kernel = true;
    out.attributes.push((
        "amdgpu-flat-work-group-size".to_string(),
        format!("1,{}", config.num_warps * config.threads_per_warp),
    ));
    let args: Vec<(ValueId, Value)> = func
        .args
        .iter()
        .zip(&out.params)
        .map(|(&a, &r)| (a, Value::Reg(r)))
        .collect();

    {
        let mut emitter = Emitter::new(func, target, &mut out, config.threads_per_warp);
        for (arg, value) in args {
            emitter.define(arg, Lowered::Scalar(value));
        }
        for op in &func.ops {
            trace!(op = op.kind.name(), "emitting");
            emitter.emit_op(op)?;
        }
        emitter.finish();
    }
    debug!(
        kernel = %func.name,
        regs = out.regs.len(),
        calls = out.count_calls(""),
        "emitted kernel"
    );
    Ok(out)
}

/// A block pointer: a window of a strided tensor in global memory.
#[derive(Clone, Debug)]
struct BlockPtrDesc {
    base: Value,
    /// Extents of the whole tensor, `i64`.
    dims: Vec<Value>,
    /// Element strides, `i64`.
    strides: Vec<Value>,
    /// Window origin, `i32`.
    offsets: Vec<Value>,
    elem: DType,
}

#[derive(Clone, Debug)]
enum Lowered {
    Scalar(Value),
    Tensor(Vec<Value>),
    BlockPtr(BlockPtrDesc),
}

struct Emitter<'a, 'f> {
    func: &'a BlockFunction,
    target: &'a GpuTarget,
    b: Builder<'f>,
    values: FxHashMap<ValueId, Lowered>,
    lane: Value,
    warp: Value,
}

fn result(op: &BlockOp) -> CodegenResult<ValueId> {
    op.results
        .first()
        .copied()
        .ok_or_else(|| CodegenError::Internal(format!("`{}` has no result", op.kind.name())))
}

fn operand(op: &BlockOp, i: usize) -> CodegenResult<ValueId> {
    op.operands.get(i).copied().ok_or_else(|| {
        CodegenError::Internal(format!("`{}` has no operand {i}", op.kind.name()))
    })
}

fn int(v: u32) -> Value {
    Value::i32(i64::from(v))
}

impl<'a, 'f> Emitter<'a, 'f> {
    fn new(
        func: &'a BlockFunction,
        target: &'a GpuTarget,
        out: &'f mut ll::Function,
        wave_size: u32,
    ) -> Self {
        let mut b = Builder::new(out, wave_size);
        let tid = b.thread_id();
        let lane = b.urem(tid.clone(), int(wave_size));
        let warp = b.udiv(tid, int(wave_size));
        Self {
            func,
            target,
            b,
            values: FxHashMap::default(),
            lane,
            warp,
        }
    }

    fn finish(&mut self) {
        let block = self.b.block();
        let terminated = self.b.func().blocks[block]
            .insts
            .last()
            .is_some_and(Inst::is_terminator);
        if !terminated {
            self.b.ret();
        }
    }

    fn define(&mut self, value: ValueId, lowered: Lowered) {
        self.values.insert(value, lowered);
    }

    /// Define a value from per-register results; scalars have one.
    fn define_registers(&mut self, value: ValueId, mut regs: Vec<Value>) -> CodegenResult<()> {
        let lowered = if self.func.value_type(value).is_tensor() {
            Lowered::Tensor(regs)
        } else {
            let first = regs
                .drain(..)
                .next()
                .ok_or_else(|| CodegenError::Internal("scalar without a value".to_string()))?;
            Lowered::Scalar(first)
        };
        self.define(value, lowered);
        Ok(())
    }

    fn get(&self, value: ValueId) -> CodegenResult<&Lowered> {
        self.values
            .get(&value)
            .ok_or(CodegenError::MissingValue(value.index()))
    }

    fn scalar(&self, value: ValueId) -> CodegenResult<Value> {
        match self.get(value)? {
            Lowered::Scalar(v) => Ok(v.clone()),
            _ => Err(CodegenError::TypeError(format!(
                "%{} is not a scalar",
                value.index()
            ))),
        }
    }

    fn tensor(&self, value: ValueId) -> CodegenResult<Vec<Value>> {
        match self.get(value)? {
            Lowered::Tensor(regs) => Ok(regs.clone()),
            _ => Err(CodegenError::TypeError(format!(
                "%{} is not a tensor",
                value.index()
            ))),
        }
    }

    fn block_ptr(&self, value: ValueId) -> CodegenResult<BlockPtrDesc> {
        match self.get(value)? {
            Lowered::BlockPtr(desc) => Ok(desc.clone()),
            _ => Err(CodegenError::TypeError(format!(
                "%{} is not a block pointer",
                value.index()
            ))),
        }
    }

    /// Register `i` of a tensor, or the scalar itself.
    fn element(&self, value: ValueId, i: usize) -> CodegenResult<Value> {
        match self.get(value)? {
            Lowered::Scalar(v) => Ok(v.clone()),
            Lowered::Tensor(regs) => regs.get(i).cloned().ok_or_else(|| {
                CodegenError::Internal(format!("%{} has no register {i}", value.index()))
            }),
            Lowered::BlockPtr(_) => Err(CodegenError::TypeError(format!(
                "%{} is a block pointer",
                value.index()
            ))),
        }
    }

    fn dist(&self, value: ValueId) -> CodegenResult<Distribution> {
        let ty = self.func.value_type(value);
        let layout = ty.encoding().ok_or_else(|| {
            CodegenError::Internal(format!("%{} has no layout", value.index()))
        })?;
        Distribution::new(layout, ty.shape())
    }

    /// Registers a value of this type occupies.
    fn width(&self, value: ValueId) -> CodegenResult<usize> {
        if self.func.value_type(value).is_tensor() {
            Ok(self.dist(value)?.len())
        } else {
            Ok(1)
        }
    }

    fn elem(&self, value: ValueId) -> CodegenResult<ElemType> {
        self.func.value_type(value).elem().ok_or_else(|| {
            CodegenError::TypeError(format!("%{} has no element type", value.index()))
        })
    }

    fn dtype(&self, value: ValueId) -> CodegenResult<DType> {
        self.elem(value)?.dtype().ok_or_else(|| {
            CodegenError::TypeError(format!("%{} holds pointers", value.index()))
        })
    }

    fn emit_op(&mut self, op: &BlockOp) -> CodegenResult<()> {
        match (&op.kind, &op.plan) {
            (OpKind::Reduce { op: combine, .. }, Plan::Reduce(plan)) => {
                self.reduce(op, *combine, plan)
            }
            (OpKind::Load(_), Plan::MemAccess(plan)) => self.load(op, plan),
            (OpKind::Store(_), Plan::MemAccess(plan)) => self.store(op, plan),
            (OpKind::Dot, Plan::Dot(plan)) => self.dot(op, plan),
            (OpKind::ConvertLayout, Plan::Convert(plan)) => self.convert(op, plan),
            (
                OpKind::Reduce { .. }
                | OpKind::Load(_)
                | OpKind::Store(_)
                | OpKind::Dot
                | OpKind::ConvertLayout,
                plan,
            ) => Err(CodegenError::Internal(format!(
                "`{}` planned as {plan}",
                op.kind.name()
            ))),
            _ => self.simple(op),
        }
    }

    fn simple(&mut self, op: &BlockOp) -> CodegenResult<()> {
        match &op.kind {
            OpKind::GetProgramId { axis } => {
                let v = get_pid(&mut self.b, *axis)?;
                self.define(result(op)?, Lowered::Scalar(v));
            }
            OpKind::GetNumPrograms { axis } => {
                let v = get_num_programs(&mut self.b, *axis)?;
                self.define(result(op)?, Lowered::Scalar(v));
            }
            OpKind::MakeRange { start, .. } => {
                let out = result(op)?;
                let dist = self.dist(out)?;
                let coords = dist.emit_coords(&mut self.b, &self.lane, &self.warp);
                let regs = coords
                    .into_iter()
                    .map(|c| {
                        let first = c.into_iter().next().unwrap_or(Value::i32(0));
                        self.b.add(first, Value::i32(i64::from(*start)))
                    })
                    .collect();
                self.define(out, Lowered::Tensor(regs));
            }
            OpKind::Splat { .. } => {
                let out = result(op)?;
                let v = self.scalar(operand(op, 0)?)?;
                let n = self.width(out)?;
                self.define(out, Lowered::Tensor(vec![v; n]));
            }
            OpKind::Broadcast { .. } | OpKind::ExpandDims { .. } | OpKind::Trans { .. } => {
                self.remap(op)?;
            }
            OpKind::Constant { value, ty } => {
                let out = result(op)?;
                let dtype = ty.elem().and_then(ElemType::dtype).ok_or_else(|| {
                    CodegenError::Unsupported(format!("constant of type {ty}"))
                })?;
                let c = const_value(*value, dtype)?;
                let n = self.width(out)?;
                self.define_registers(out, vec![c; n])?;
            }
            OpKind::Unary(u) => {
                let (src, out) = (operand(op, 0)?, result(op)?);
                let dtype = self.dtype(src)?;
                let mut regs = Vec::new();
                for i in 0..self.width(out)? {
                    let x = self.element(src, i)?;
                    regs.push(unary(&mut self.b, *u, dtype, x)?);
                }
                self.define_registers(out, regs)?;
            }
            OpKind::Binary(bin) => {
                let (lhs, rhs, out) = (operand(op, 0)?, operand(op, 1)?, result(op)?);
                let dtype = self.dtype(lhs)?;
                let mut regs = Vec::new();
                for i in 0..self.width(out)? {
                    let (l, r) = (self.element(lhs, i)?, self.element(rhs, i)?);
                    regs.push(binary(&mut self.b, *bin, dtype, l, r)?);
                }
                self.define_registers(out, regs)?;
            }
            OpKind::Cast { to } => {
                let (src, out) = (operand(op, 0)?, result(op)?);
                let from = self.dtype(src)?;
                let mut regs = Vec::new();
                for i in 0..self.width(out)? {
                    let x = self.element(src, i)?;
                    regs.push(cast(&mut self.b, from, *to, x)?);
                }
                self.define_registers(out, regs)?;
            }
            OpKind::AddPtr => {
                let (ptr, offset, out) = (operand(op, 0)?, operand(op, 1)?, result(op)?);
                let pointee = self.elem(ptr)?.pointee().ok_or_else(|| {
                    CodegenError::TypeError("`tt.addptr` on a non-pointer".to_string())
                })?;
                let elem = LlType::from_dtype(pointee);
                let mut regs = Vec::new();
                for i in 0..self.width(out)? {
                    let (p, o) = (self.element(ptr, i)?, self.element(offset, i)?);
                    regs.push(self.b.gep(elem.clone(), p, o));
                }
                self.define_registers(out, regs)?;
            }
            OpKind::Select => {
                let (cond, t, f, out) = (
                    operand(op, 0)?,
                    operand(op, 1)?,
                    operand(op, 2)?,
                    result(op)?,
                );
                let mut regs = Vec::new();
                for i in 0..self.width(out)? {
                    let c = self.element(cond, i)?;
                    let (on_true, on_false) = (self.element(t, i)?, self.element(f, i)?);
                    regs.push(self.b.select(c, on_true, on_false));
                }
                self.define_registers(out, regs)?;
            }
            OpKind::MakeTensorPtr { shape, .. } => self.make_tensor_ptr(op, shape.len())?,
            OpKind::Advance => {
                let out = result(op)?;
                let mut desc = self.block_ptr(operand(op, 0)?)?;
                for d in 0..desc.offsets.len() {
                    let delta = self.scalar(operand(op, 1 + d)?)?;
                    let delta = resize_int(&mut self.b, delta, LlType::I32);
                    desc.offsets[d] = self.b.add(desc.offsets[d].clone(), delta);
                }
                self.define(out, Lowered::BlockPtr(desc));
            }
            OpKind::Return => self.b.ret(),
            kind => {
                return Err(CodegenError::Internal(format!(
                    "`{}` reached elementwise emission",
                    kind.name()
                )))
            }
        }
        Ok(())
    }

    fn make_tensor_ptr(&mut self, op: &BlockOp, rank: usize) -> CodegenResult<()> {
        let out = result(op)?;
        let Type::BlockPtr(ty) = self.func.value_type(out) else {
            return Err(CodegenError::TypeError(
                "`tt.make_tensor_ptr` result is not a block pointer".to_string(),
            ));
        };
        let elem = ty.elem;
        let base = self.scalar(operand(op, 0)?)?;
        let group = |emitter: &mut Self, first: usize, to: LlType| {
            (first..first + rank)
                .map(|i| {
                    let v = emitter.scalar(operand(op, i)?)?;
                    Ok(resize_int(&mut emitter.b, v, to.clone()))
                })
                .collect::<CodegenResult<Vec<_>>>()
        };
        let dims = group(self, 1, LlType::I64)?;
        let strides = group(self, 1 + rank, LlType::I64)?;
        let offsets = group(self, 1 + 2 * rank, LlType::I32)?;
        self.define(
            out,
            Lowered::BlockPtr(BlockPtrDesc {
                base,
                dims,
                strides,
                offsets,
                elem,
            }),
        );
        Ok(())
    }

    /// Broadcasts, dimension insertion and transposes move no data: each
    /// result register names a register the lane already holds.
    fn remap(&mut self, op: &BlockOp) -> CodegenResult<()> {
        let (src, out) = (operand(op, 0)?, result(op)?);
        let (src_ty, out_ty) = (self.func.value_type(src), self.func.value_type(out));
        let (Some(from), Some(to)) = (src_ty.encoding(), out_ty.encoding()) else {
            return Err(CodegenError::Internal(format!(
                "`{}` on a tensor without a layout",
                op.kind.name()
            )));
        };
        let related = match &op.kind {
            OpKind::Broadcast { .. } => from == to,
            OpKind::ExpandDims { axis } => {
                matches!(from, Layout::Slice(s) if s.dim == *axis && *s.parent == *to)
            }
            OpKind::Trans { order } => match from {
                Layout::Blocked(b) => b.permute(order).ok().map(Layout::Blocked).as_ref() == Some(to),
                _ => false,
            },
            _ => false,
        };
        if !related {
            return Err(CodegenError::Unsupported(format!(
                "`{}` from {from} to {to}",
                op.kind.name()
            )));
        }

        let (src_shape, out_shape) = (src_ty.shape(), out_ty.shape());
        let src_dist = Distribution::new(from, src_shape)?;
        let out_dist = Distribution::new(to, out_shape)?;
        let mut index: FxHashMap<Dims, usize> = FxHashMap::default();
        for r in 0..src_dist.len() {
            index.entry(src_dist.element_key(r, src_shape)).or_insert(r);
        }
        let regs = self.tensor(src)?;
        let mut remapped = Vec::with_capacity(out_dist.len());
        for r in 0..out_dist.len() {
            let key = out_dist.element_key(r, out_shape);
            let src_key: Dims = match &op.kind {
                OpKind::Broadcast { .. } => key
                    .iter()
                    .zip(src_shape)
                    .map(|(&k, &s)| if s == 1 { 0 } else { k })
                    .collect(),
                OpKind::ExpandDims { axis } => key
                    .iter()
                    .enumerate()
                    .filter(|&(d, _)| d != *axis as usize)
                    .map(|(_, &k)| k)
                    .collect(),
                OpKind::Trans { order } => {
                    let mut k: Dims = SmallVec::from_elem(0, key.len());
                    for (i, &o) in order.iter().enumerate() {
                        k[o as usize] = key[i];
                    }
                    k
                }
                _ => key,
            };
            let s = index.get(&src_key).ok_or_else(|| {
                CodegenError::Internal(format!("no register holds {}", fmt_dims(&src_key)))
            })?;
            remapped.push(regs[*s].clone());
        }
        self.define(out, Lowered::Tensor(remapped));
        Ok(())
    }

    /// Address and predicate of the given registers of an access.
    ///
    /// The predicate is the access's own mask or boundary check, and the
    /// register lying inside the tensor. Stores also leave replicas to
    /// their canonical owner.
    fn access(
        &mut self,
        op: &BlockOp,
        plan: &MemAccessPlan,
        data: ValueId,
        registers: &[usize],
    ) -> CodegenResult<Vec<(Value, Value)>> {
        let ptr = operand(op, 0)?;
        let is_load = matches!(op.kind, OpKind::Load(_));
        let bounds = if self.func.value_type(data).is_tensor() {
            self.dist(data)?
                .emit_in_bounds(&mut self.b, &self.lane, &self.warp, registers, !is_load, None)
        } else {
            vec![Value::bool(true); registers.len()]
        };
        let mut out = Vec::with_capacity(registers.len());
        if !plan.block_ptr {
            let mask = if is_load { 1 } else { 2 };
            for (&i, inside) in registers.iter().zip(bounds) {
                let addr = self.element(ptr, i)?;
                let pred = if plan.masked {
                    let user = self.element(operand(op, mask)?, i)?;
                    and_pred(&mut self.b, inside, user)
                } else {
                    inside
                };
                out.push((addr, pred));
            }
            return Ok(out);
        }

        let desc = self.block_ptr(ptr)?;
        let elem = LlType::from_dtype(desc.elem);
        let coords = self
            .dist(data)?
            .emit_coords_at(&mut self.b, &self.lane, &self.warp, registers);
        for (coord, inside) in coords.into_iter().zip(bounds) {
            let mut index = Value::i64(0);
            let mut pred = inside;
            for (d, c) in coord.into_iter().enumerate() {
                let pos = self.b.add(desc.offsets[d].clone(), c);
                let wide = self.b.sext(pos.clone(), LlType::I64);
                let term = self.b.mul(wide.clone(), desc.strides[d].clone());
                index = self.b.add(index, term);
                if plan.boundary_check.iter().any(|&b| b as usize == d) {
                    let above = self.b.icmp(IntPredicate::Sge, pos, Value::i32(0));
                    let below = self.b.icmp(IntPredicate::Slt, wide, desc.dims[d].clone());
                    let inside = self.b.and(above, below);
                    pred = and_pred(&mut self.b, pred, inside);
                }
            }
            out.push((self.b.gep(elem.clone(), desc.base.clone(), index), pred));
        }
        Ok(out)
    }

    /// Register groups of one vector access each.
    fn vector_groups(n: usize, plan: &MemAccessPlan) -> Vec<(usize, usize)> {
        let width = (plan.vector_width as usize).max(1);
        (0..n)
            .step_by(width)
            .map(|start| (start, (start + width).min(n)))
            .collect()
    }

    fn load(&mut self, op: &BlockOp, plan: &MemAccessPlan) -> CodegenResult<()> {
        let out = result(op)?;
        let elem = LlType::from_elem(self.elem(out)?);
        let cache = if plan.volatile {
            CacheModifier::Cg
        } else {
            plan.cache
        };
        let n = self.width(out)?;
        let groups = Self::vector_groups(n, plan);
        let firsts: Vec<usize> = groups.iter().map(|&(start, _)| start).collect();
        let accesses = self.access(op, plan, out, &firsts)?;

        let mut regs = Vec::with_capacity(n);
        for ((start, end), (addr, pred)) in groups.into_iter().zip(accesses) {
            #[allow(clippy::cast_possible_truncation)]
            let ty = LlType::vector((end - start) as u32, elem.clone());
            let false_val = match (plan.other, plan.padding) {
                (Some(other), _) => {
                    let fallback = (start..end)
                        .map(|i| self.element(other, i))
                        .collect::<CodegenResult<Vec<_>>>()?;
                    self.b.pack(&fallback)
                }
                (None, Some(Padding::Nan)) if elem.is_float() => {
                    let nan = vec![Value::Float(elem.clone(), f64::NAN); end - start];
                    self.b.pack(&nan)
                }
                _ => Value::Zero(ty.clone()),
            };
            // A register group past the extent on every lane keeps the fallback.
            let loaded = if pred.as_int() == Some(0) {
                false_val
            } else {
                ll_load(&mut self.b, addr, &ty, pred, false_val, cache)?
            };
            regs.extend(self.b.unpack(loaded));
        }
        self.define_registers(out, regs)
    }

    fn store(&mut self, op: &BlockOp, plan: &MemAccessPlan) -> CodegenResult<()> {
        let value = operand(op, 1)?;
        let cache = if plan.volatile {
            CacheModifier::Wt
        } else {
            plan.cache
        };
        let n = self.width(value)?;
        let groups = Self::vector_groups(n, plan);
        let firsts: Vec<usize> = groups.iter().map(|&(start, _)| start).collect();
        let accesses = self.access(op, plan, value, &firsts)?;
        for ((start, end), (addr, pred)) in groups.into_iter().zip(accesses) {
            if pred.as_int() == Some(0) {
                continue;
            }
            let elems = (start..end)
                .map(|i| self.element(value, i))
                .collect::<CodegenResult<Vec<_>>>()?;
            let packed = self.b.pack(&elems);
            ll_store(&mut self.b, addr, packed, pred, cache)?;
        }
        Ok(())
    }

    fn dot(&mut self, op: &BlockOp, plan: &DotPlan) -> CodegenResult<()> {
        let out = result(op)?;
        let shape = self.func.value_type(out).shape();
        let (m, n) = (shape[0], shape[1]);
        let mut args = Vec::with_capacity(3);
        for i in 0..3 {
            let regs = self.tensor(operand(op, i)?)?;
            args.push(self.b.pack(&regs));
        }
        let params: Vec<LlType> = args.iter().map(|a| self.b.value_type(a)).collect();
        let warps: Vec<String> = plan.warps_per_cta.iter().map(ToString::to_string).collect();
        let base = format!(
            "__tlc_tile_dot_m{m}n{n}k{}_w{}_kw{}",
            plan.k,
            warps.join("x"),
            plan.k_width
        );
        let name = mangle(&base, &params);
        let sig = Signature::new(params[2].clone(), params);
        let acc = self
            .b
            .call(&name, sig, args)
            .ok_or_else(|| CodegenError::Internal(format!("{name} returned no value")))?;
        let regs = self.b.unpack(acc);
        self.define(out, Lowered::Tensor(regs));
        Ok(())
    }

    fn reduce(&mut self, op: &BlockOp, combine: ReduceOp, plan: &ReducePlan) -> CodegenResult<()> {
        let (src, out) = (operand(op, 0)?, result(op)?);
        let src_ty = self.func.value_type(src);
        let shape = src_ty.shape().to_vec();
        let layout = src_ty
            .encoding()
            .ok_or_else(|| CodegenError::Internal("reduction of an unlaid tensor".to_string()))?
            .clone();
        let dist = Distribution::new(&layout, &shape)?;
        let dtype = self.dtype(src)?;
        let combiner = combine.combiner();
        let axis = plan.axis as usize;
        let regs = self.tensor(src)?;

        // Registers that hold a replica or nothing along the axis contribute
        // the identity; registers past the extent elsewhere replicate ones
        // below it.
        let span = combine_span(&layout, plan);
        let contributes =
            dist.emit_contributes(&mut self.b, &self.lane, &self.warp, axis, span);
        let identity = reduce_identity(combine, dtype)?;
        let mut groups: IndexMap<Dims, (usize, Value)> = IndexMap::new();
        for (r, offsets) in dist.registers.iter().enumerate() {
            let outside = offsets
                .iter()
                .zip(&shape)
                .enumerate()
                .any(|(d, (&o, &s))| d != axis && o >= s);
            if outside || contributes[r].as_int() == Some(0) {
                continue;
            }
            let value = self
                .b
                .select(contributes[r].clone(), regs[r].clone(), identity.clone());
            let key: Dims = erase(offsets, axis);
            let acc = match groups.get(&key) {
                Some((_, acc)) => binary(&mut self.b, combiner, dtype, acc.clone(), value)?,
                None => value,
            };
            let first = groups.get(&key).map_or(r, |&(first, _)| first);
            groups.insert(key, (first, acc));
        }

        for &mask in &plan.shuffle_masks {
            for (_, acc) in groups.values_mut() {
                let other = shuffle_xor(&mut self.b, acc.clone(), mask)?;
                *acc = binary(&mut self.b, combiner, dtype, acc.clone(), other)?;
            }
        }

        if let Some(inter) = &plan.inter_warp {
            let elem = LlType::from_dtype(dtype);
            let smem = Value::Global(SHARED_MEMORY.to_string(), LDS_ADDRSPACE);
            let warp_axis = dist.emit_warp_index(&mut self.b, &self.warp, axis);
            let slot = self.b.urem(warp_axis, int(inter.warps));
            let reps: Vec<usize> = groups.values().map(|&(first, _)| first).collect();
            let coords = dist.emit_coords_at(&mut self.b, &self.lane, &self.warp, &reps);
            let inside =
                dist.emit_in_bounds(&mut self.b, &self.lane, &self.warp, &reps, false, Some(axis));
            let out_strides = row_major_strides(&erase(&shape, axis));
            let mut bases = Vec::with_capacity(coords.len());
            for (((_, acc), coord), inside) in groups.values().zip(&coords).zip(inside) {
                // Overhanging outputs have no slot; they read slot 0 and
                // write nothing.
                let lin = linearize(&mut self.b, &erase_values(coord, axis), &out_strides);
                let lin = self.b.select(inside.clone(), lin, Value::i32(0));
                let base = self.b.mul(lin, int(inter.warps));
                let at = self.b.add(base.clone(), slot.clone());
                let addr = self.b.gep(elem.clone(), smem.clone(), at);
                self.lds_store(acc.clone(), addr, inside)?;
                bases.push(base);
            }
            self.b.barrier();
            for ((_, acc), base) in groups.values_mut().zip(bases) {
                let mut total: Option<Value> = None;
                for w in 0..inter.warps {
                    let at = self.b.add(base.clone(), int(w));
                    let addr = self.b.gep(elem.clone(), smem.clone(), at);
                    let v = self.b.load(elem.clone(), addr, MemFlags::default());
                    total = Some(match total {
                        Some(t) => binary(&mut self.b, combiner, dtype, t, v)?,
                        None => v,
                    });
                }
                if let Some(t) = total {
                    *acc = t;
                }
            }
            self.b.barrier();
        }

        match self.func.value_type(out) {
            Type::Tensor(t) => {
                let out_layout = t.encoding.as_ref().ok_or_else(|| {
                    CodegenError::Internal("reduction result without a layout".to_string())
                })?;
                let sliced = matches!(out_layout, Layout::Slice(s)
                    if s.dim == plan.axis && *s.parent == layout);
                if !sliced {
                    return Err(CodegenError::Unsupported(format!(
                        "reduction result in {out_layout} for an operand in {layout}"
                    )));
                }
                let out_dist = Distribution::new(out_layout, &t.shape)?;
                let mut results = Vec::with_capacity(out_dist.len());
                for r in 0..out_dist.len() {
                    let key = out_dist.element_key(r, &t.shape);
                    let (_, v) = groups.get(&key).ok_or_else(|| {
                        CodegenError::Internal(format!("no partial result for {}", fmt_dims(&key)))
                    })?;
                    results.push(v.clone());
                }
                self.define(out, Lowered::Tensor(results));
            }
            _ => {
                let (_, v) = groups.values().next().ok_or_else(|| {
                    CodegenError::Internal("reduction of an empty tensor".to_string())
                })?;
                let v = v.clone();
                self.define(out, Lowered::Scalar(v));
            }
        }
        Ok(())
    }

    /// Store to LDS when `pred` holds.
    fn lds_store(&mut self, value: Value, addr: Value, pred: Value) -> CodegenResult<()> {
        match pred.as_int() {
            Some(0) => Ok(()),
            Some(_) => {
                self.b.store(value, addr, MemFlags::default());
                Ok(())
            }
            None => ll_store(&mut self.b, addr, value, pred, CacheModifier::None),
        }
    }

    fn convert(&mut self, op: &BlockOp, plan: &ConvertPlan) -> CodegenResult<()> {
        let (src, out) = (operand(op, 0)?, result(op)?);
        let regs = self.tensor(src)?;
        let (from, to) = (self.dist(src)?, self.dist(out)?);
        if self.func.value_type(src).encoding() == self.func.value_type(out).encoding() {
            self.define(out, Lowered::Tensor(regs));
            return Ok(());
        }
        let shape = self.func.value_type(src).shape().to_vec();
        let in_warp = !matches!(plan, ConvertPlan::SharedMemory { .. }) && from.same_warp_split(&to);
        if in_warp {
            let shuffle = matches!(plan, ConvertPlan::WarpShuffle);
            if let Some(moved) = self.convert_in_warp(&from, &to, &regs, &shape, shuffle)? {
                self.define(out, Lowered::Tensor(moved));
                return Ok(());
            }
        }
        let elem = LlType::from_elem(self.elem(src)?);
        let moved = self.convert_through_lds(&from, &to, &regs, &shape, &elem)?;
        self.define(out, Lowered::Tensor(moved));
        Ok(())
    }

    /// Move registers within each warp. Returns `None` when the source
    /// owner of an element cannot be computed.
    fn convert_in_warp(
        &mut self,
        from: &Distribution,
        to: &Distribution,
        regs: &[Value],
        shape: &[u32],
        shuffle: bool,
    ) -> CodegenResult<Option<Vec<Value>>> {
        if from.same_base(to) {
            let mut index: FxHashMap<Dims, usize> = FxHashMap::default();
            for r in 0..from.len() {
                index.entry(from.element_key(r, shape)).or_insert(r);
            }
            let renamed: Option<Vec<Value>> = (0..to.len())
                .map(|r| index.get(&to.element_key(r, shape)).map(|&s| regs[s].clone()))
                .collect();
            if renamed.is_some() {
                return Ok(renamed);
            }
        }
        if !from.locatable() {
            return Ok(None);
        }

        let coords = to.emit_coords(&mut self.b, &self.lane, &self.warp);
        let mut moved = Vec::with_capacity(coords.len());
        for coord in coords {
            let Some((src_lane, src_reg)) = from.emit_locate(&mut self.b, &coord) else {
                return Ok(None);
            };
            let read = |b: &mut Builder<'_>, v: Value| {
                if shuffle {
                    shuffle_idx_dyn(b, v, src_lane.clone())
                } else {
                    Ok(v)
                }
            };
            let value = match src_reg.as_int() {
                // Only overhanging elements locate past the source registers;
                // their value is never observed.
                Some(r) => {
                    let v = usize::try_from(r)
                        .ok()
                        .and_then(|r| regs.get(r))
                        .or_else(|| regs.first())
                        .cloned()
                        .ok_or_else(|| {
                            CodegenError::Internal("conversion of an empty tensor".to_string())
                        })?;
                    read(&mut self.b, v)?
                }
                // Every candidate is read from the source lane, then the
                // source register is picked locally.
                None => {
                    let mut picked: Option<Value> = None;
                    for (i, reg) in regs.iter().enumerate() {
                        let v = read(&mut self.b, reg.clone())?;
                        picked = Some(match picked {
                            None => v,
                            Some(prev) => {
                                #[allow(clippy::cast_possible_wrap)]
                                let hit = self.b.icmp(
                                    IntPredicate::Eq,
                                    src_reg.clone(),
                                    Value::i32(i as i64),
                                );
                                self.b.select(hit, v, prev)
                            }
                        });
                    }
                    picked.ok_or_else(|| {
                        CodegenError::Internal("conversion of an empty tensor".to_string())
                    })?
                }
            };
            moved.push(value);
        }
        Ok(Some(moved))
    }

    /// Write every element to LDS at its row-major index and read it back
    /// in the destination layout.
    fn convert_through_lds(
        &mut self,
        from: &Distribution,
        to: &Distribution,
        regs: &[Value],
        shape: &[u32],
        elem: &LlType,
    ) -> CodegenResult<Vec<Value>> {
        let size: u64 = shape.iter().map(|&d| u64::from(d)).product();
        let bytes = size * u64::from(elem.bits().div_ceil(8));
        let available = self.target.shared_memory_bytes();
        if bytes > u64::from(available) {
            return Err(CodegenError::Unsupported(format!(
                "conversion through {bytes} bytes of LDS, the target has {available}"
            )));
        }
        let smem = Value::Global(SHARED_MEMORY.to_string(), LDS_ADDRSPACE);
        let strides = row_major_strides(shape);

        let all: Vec<usize> = (0..from.len()).collect();
        let coords = from.emit_coords(&mut self.b, &self.lane, &self.warp);
        let inside = from.emit_in_bounds(&mut self.b, &self.lane, &self.warp, &all, false, None);
        for ((coord, v), inside) in coords.iter().zip(regs).zip(inside) {
            if inside.as_int() == Some(0) {
                continue;
            }
            let at = linearize(&mut self.b, coord, &strides);
            let addr = self.b.gep(elem.clone(), smem.clone(), at);
            self.lds_store(v.clone(), addr, inside)?;
        }
        self.b.barrier();
        let all: Vec<usize> = (0..to.len()).collect();
        let coords = to.emit_coords(&mut self.b, &self.lane, &self.warp);
        let inside = to.emit_in_bounds(&mut self.b, &self.lane, &self.warp, &all, false, None);
        let mut moved = Vec::with_capacity(coords.len());
        for (coord, inside) in coords.iter().zip(inside) {
            let at = linearize(&mut self.b, coord, &strides);
            let at = self.b.select(inside, at, Value::i32(0));
            let addr = self.b.gep(elem.clone(), smem.clone(), at);
            moved.push(self.b.load(elem.clone(), addr, MemFlags::default()));
        }
        self.b.barrier();
        Ok(moved)
    }
}

/// Unwrapped coordinates along the reduced axis that one combining group of
/// lanes and warps covers; `None` when all of them combine.
fn combine_span(layout: &Layout, plan: &ReducePlan) -> Option<u32> {
    let blocked = layout.as_blocked()?;
    let a = plan.axis as usize;
    let spt = blocked.size_per_thread[a];
    let tpw = blocked.threads_per_warp[a];
    let lanes = 1u32 << plan.shuffle_masks.len();
    if lanes < tpw {
        Some(lanes * spt)
    } else if plan.inter_warp.is_none() && blocked.warps_per_cta[a] > 1 {
        Some(spt * tpw)
    } else {
        None
    }
}

/// The value `op` leaves unchanged.
fn reduce_identity(op: ReduceOp, dtype: DType) -> CodegenResult<Value> {
    check_f8(dtype)?;
    let ty = LlType::from_dtype(dtype);
    if dtype.is_float() {
        let v = match op {
            ReduceOp::Sum | ReduceOp::Any => 0.0,
            ReduceOp::Prod | ReduceOp::All => 1.0,
            ReduceOp::Max => f64::NEG_INFINITY,
            ReduceOp::Min => f64::INFINITY,
        };
        return Ok(Value::Float(ty, v));
    }
    let bits = dtype.bits();
    let max = if bits >= 64 {
        i64::MAX
    } else {
        (1i64 << (bits - 1)) - 1
    };
    let v = match op {
        ReduceOp::Sum | ReduceOp::Any => 0,
        ReduceOp::Prod => 1,
        ReduceOp::All => -1,
        ReduceOp::Max if dtype == DType::Bool => 0,
        ReduceOp::Min if dtype == DType::Bool => 1,
        ReduceOp::Max => -max - 1,
        ReduceOp::Min => max,
    };
    Ok(Value::Int(ty, v))
}

fn erase(dims: &[u32], axis: usize) -> Dims {
    dims.iter()
        .enumerate()
        .filter(|&(d, _)| d != axis)
        .map(|(_, &v)| v)
        .collect()
}

fn erase_values(values: &[Value], axis: usize) -> Vec<Value> {
    values
        .iter()
        .enumerate()
        .filter(|&(d, _)| d != axis)
        .map(|(_, v)| v.clone())
        .collect()
}

fn row_major_strides(shape: &[u32]) -> Dims {
    let mut strides: Dims = SmallVec::from_elem(1, shape.len());
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    strides
}

fn linearize(b: &mut Builder<'_>, coords: &[Value], strides: &[u32]) -> Value {
    let mut lin = Value::i32(0);
    for (c, &s) in coords.iter().zip(strides) {
        let term = b.mul(c.clone(), int(s));
        lin = b.add(lin, term);
    }
    lin
}

/// Sign-extend or truncate an integer to `to`.
fn resize_int(b: &mut Builder<'_>, value: Value, to: LlType) -> Value {
    if b.value_type(&value).bits() < to.bits() {
        b.sext(value, to)
    } else {
        b.trunc(value, to)
    }
}

fn check_f8(dtype: DType) -> CodegenResult<()> {
    if dtype == DType::Float8E5M2 {
        return Err(CodegenError::Unsupported(format!(
            "arithmetic on {dtype}"
        )));
    }
    Ok(())
}

fn const_value(value: ConstValue, dtype: DType) -> CodegenResult<Value> {
    check_f8(dtype)?;
    let ty = LlType::from_dtype(dtype);
    Ok(match (value, dtype.is_float()) {
        (ConstValue::Int(v), false) => Value::Int(ty, v),
        #[allow(clippy::cast_precision_loss)]
        (ConstValue::Int(v), true) => Value::Float(ty, v as f64),
        (ConstValue::Float(v), true) => Value::Float(ty, v),
        #[allow(clippy::cast_possible_truncation)]
        (ConstValue::Float(v), false) => Value::Int(ty, v as i64),
    })
}

fn unary(b: &mut Builder<'_>, op: UnaryOp, dtype: DType, x: Value) -> CodegenResult<Value> {
    check_f8(dtype)?;
    let ty = LlType::from_dtype(dtype);
    let suffix = ty.mangle();
    if !dtype.is_float() {
        return match op {
            UnaryOp::Neg => Ok(b.sub(Value::Int(ty, 0), x)),
            UnaryOp::Abs => Ok(b.intrinsic(
                &format!("llvm.abs.{suffix}"),
                ty,
                vec![x, Value::bool(false)],
            )),
            UnaryOp::Not => Ok(b.xor(x, Value::Int(ty, -1))),
            other => Err(CodegenError::TypeError(format!(
                "{other:?} of an integer"
            ))),
        };
    }
    let call = |b: &mut Builder<'_>, name: &str, x: Value| {
        b.intrinsic(&format!("llvm.{name}.{suffix}"), ty.clone(), vec![x])
    };
    Ok(match op {
        UnaryOp::Neg => b.fneg(x),
        UnaryOp::Abs => call(b, "fabs", x),
        UnaryOp::Sqrt => call(b, "sqrt", x),
        UnaryOp::Rsqrt => {
            let root = call(b, "sqrt", x);
            b.binary(BinOp::FDiv, Value::Float(ty.clone(), 1.0), root)
        }
        UnaryOp::Exp => call(b, "exp", x),
        UnaryOp::Exp2 => call(b, "exp2", x),
        UnaryOp::Log => call(b, "log", x),
        UnaryOp::Log2 => call(b, "log2", x),
        UnaryOp::Sin => call(b, "sin", x),
        UnaryOp::Cos => call(b, "cos", x),
        UnaryOp::Ceil => call(b, "ceil", x),
        UnaryOp::Floor => call(b, "floor", x),
        UnaryOp::Tanh => b.intrinsic(&format!("__ocml_tanh_{suffix}"), ty.clone(), vec![x]),
        UnaryOp::Not => {
            return Err(CodegenError::TypeError(
                "bitwise not of a float".to_string(),
            ))
        }
    })
}

fn binary(
    b: &mut Builder<'_>,
    op: BinaryOp,
    dtype: DType,
    lhs: Value,
    rhs: Value,
) -> CodegenResult<Value> {
    check_f8(dtype)?;
    let ty = LlType::from_dtype(dtype);
    let suffix = ty.mangle();
    if dtype.is_float() {
        return Ok(match op {
            BinaryOp::Add => b.binary(BinOp::FAdd, lhs, rhs),
            BinaryOp::Sub => b.binary(BinOp::FSub, lhs, rhs),
            BinaryOp::Mul => b.binary(BinOp::FMul, lhs, rhs),
            BinaryOp::Div => b.binary(BinOp::FDiv, lhs, rhs),
            BinaryOp::Rem => b.binary(BinOp::FRem, lhs, rhs),
            BinaryOp::Max => b.intrinsic(&format!("llvm.maxnum.{suffix}"), ty, vec![lhs, rhs]),
            BinaryOp::Min => b.intrinsic(&format!("llvm.minnum.{suffix}"), ty, vec![lhs, rhs]),
            BinaryOp::Eq => b.fcmp(FloatPredicate::Oeq, lhs, rhs),
            BinaryOp::Ne => b.fcmp(FloatPredicate::Une, lhs, rhs),
            BinaryOp::Lt => b.fcmp(FloatPredicate::Olt, lhs, rhs),
            BinaryOp::Le => b.fcmp(FloatPredicate::Ole, lhs, rhs),
            BinaryOp::Gt => b.fcmp(FloatPredicate::Ogt, lhs, rhs),
            BinaryOp::Ge => b.fcmp(FloatPredicate::Oge, lhs, rhs),
            other => {
                return Err(CodegenError::TypeError(format!("{other:?} of floats")));
            }
        });
    }
    let boolean = dtype == DType::Bool;
    Ok(match op {
        BinaryOp::Add => b.add(lhs, rhs),
        BinaryOp::Sub => b.sub(lhs, rhs),
        BinaryOp::Mul => b.mul(lhs, rhs),
        BinaryOp::Div => b.binary(BinOp::SDiv, lhs, rhs),
        BinaryOp::Rem => b.binary(BinOp::SRem, lhs, rhs),
        BinaryOp::Max if boolean => b.binary(BinOp::Or, lhs, rhs),
        BinaryOp::Min if boolean => b.and(lhs, rhs),
        BinaryOp::Max => b.intrinsic(&format!("llvm.smax.{suffix}"), ty, vec![lhs, rhs]),
        BinaryOp::Min => b.intrinsic(&format!("llvm.smin.{suffix}"), ty, vec![lhs, rhs]),
        BinaryOp::Eq => b.icmp(IntPredicate::Eq, lhs, rhs),
        BinaryOp::Ne => b.icmp(IntPredicate::Ne, lhs, rhs),
        BinaryOp::Lt => b.icmp(IntPredicate::Slt, lhs, rhs),
        BinaryOp::Le => b.icmp(IntPredicate::Sle, lhs, rhs),
        BinaryOp::Gt => b.icmp(IntPredicate::Sgt, lhs, rhs),
        BinaryOp::Ge => b.icmp(IntPredicate::Sge, lhs, rhs),
        BinaryOp::And => b.and(lhs, rhs),
        BinaryOp::Or => b.binary(BinOp::Or, lhs, rhs),
        BinaryOp::Xor => b.xor(lhs, rhs),
        BinaryOp::Shl => b.shl(lhs, rhs),
        BinaryOp::Shr => b.binary(BinOp::AShr, lhs, rhs),
    })
}

fn cast(b: &mut Builder<'_>, from: DType, to: DType, x: Value) -> CodegenResult<Value> {
    if from == to {
        return Ok(x);
    }
    if from == DType::Float8E5M2 || to == DType::Float8E5M2 {
        return Err(CodegenError::Unsupported(format!(
            "conversion from {from} to {to}"
        )));
    }
    let (from_ty, to_ty) = (LlType::from_dtype(from), LlType::from_dtype(to));
    Ok(if to == DType::Bool {
        if from.is_float() {
            b.fcmp(FloatPredicate::Une, x, Value::Zero(from_ty))
        } else {
            b.icmp(IntPredicate::Ne, x, Value::Int(from_ty, 0))
        }
    } else if from == DType::Bool {
        let op = if to.is_float() {
            CastOp::UiToFp
        } else {
            CastOp::ZExt
        };
        b.cast(op, x, to_ty)
    } else {
        match (from.is_float(), to.is_float()) {
            // half and bfloat have no direct conversion.
            (true, true) if from.bits() == to.bits() => {
                let wide = b.cast(CastOp::FpExt, x, LlType::Float);
                b.cast(CastOp::FpTrunc, wide, to_ty)
            }
            (true, true) if to.bits() > from.bits() => b.cast(CastOp::FpExt, x, to_ty),
            (true, true) => b.cast(CastOp::FpTrunc, x, to_ty),
            (false, false) if to.bits() > from.bits() => b.sext(x, to_ty),
            (false, false) => b.trunc(x, to_ty),
            (false, true) => b.cast(CastOp::SiToFp, x, to_ty),
            (true, false) => b.cast(CastOp::FpToSi, x, to_ty),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function() -> ll::Function {
        ll::Function::new("f", [LlType::Half, LlType::BFloat, LlType::I32, LlType::Float])
    }

    #[test]
    fn test_casts_between_float_widths() {
        let mut func = function();
        let (h, bf) = (Value::Reg(func.params[0]), Value::Reg(func.params[1]));
        let mut b = Builder::new(&mut func, 64);
        let to_bf = cast(&mut b, DType::Float16, DType::BFloat16, h.clone()).unwrap();
        assert_eq!(b.value_type(&to_bf), LlType::BFloat);
        let to_f32 = cast(&mut b, DType::BFloat16, DType::Float32, bf).unwrap();
        assert_eq!(b.value_type(&to_f32), LlType::Float);
        let flag = cast(&mut b, DType::Float16, DType::Bool, h).unwrap();
        assert_eq!(b.value_type(&flag), LlType::I1);
        let ops: Vec<CastOp> = func
            .insts()
            .filter_map(|i| match i {
                Inst::Cast { op, .. } => Some(*op),
                _ => None,
            })
            .collect();
        assert_eq!(ops, vec![CastOp::FpExt, CastOp::FpTrunc, CastOp::FpExt]);
    }

    #[test]
    fn test_float8_is_rejected() {
        let mut func = function();
        let x = Value::Reg(func.params[2]);
        let mut b = Builder::new(&mut func, 64);
        assert!(matches!(
            cast(&mut b, DType::Float8E5M2, DType::Float32, x.clone()),
            Err(CodegenError::Unsupported(_))
        ));
        assert!(matches!(
            binary(&mut b, BinaryOp::Add, DType::Float8E5M2, x.clone(), x),
            Err(CodegenError::Unsupported(_))
        ));
    }

    #[test]
    fn test_math_intrinsics_carry_type_suffix() {
        let mut func = function();
        let (h, f) = (Value::Reg(func.params[0]), Value::Reg(func.params[3]));
        let mut b = Builder::new(&mut func, 64);
        unary(&mut b, UnaryOp::Exp2, DType::Float32, f.clone()).unwrap();
        unary(&mut b, UnaryOp::Tanh, DType::Float16, h).unwrap();
        binary(&mut b, BinaryOp::Max, DType::Float32, f.clone(), f).unwrap();
        assert!(func.externs.contains_key("llvm.exp2.f32"));
        assert!(func.externs.contains_key("__ocml_tanh_f16"));
        assert!(func.externs.contains_key("llvm.maxnum.f32"));
    }

    #[test]
    fn test_integer_ops_are_signed() {
        let mut func = function();
        let x = Value::Reg(func.params[2]);
        let mut b = Builder::new(&mut func, 64);
        binary(&mut b, BinaryOp::Div, DType::Int32, x.clone(), Value::i32(3)).unwrap();
        binary(&mut b, BinaryOp::Shr, DType::Int32, x.clone(), Value::i32(1)).unwrap();
        binary(&mut b, BinaryOp::Max, DType::Int32, x.clone(), Value::i32(0)).unwrap();
        assert!(matches!(
            unary(&mut b, UnaryOp::Sqrt, DType::Int32, x),
            Err(CodegenError::TypeError(_))
        ));
        let binops: Vec<BinOp> = func
            .insts()
            .filter_map(|i| match i {
                Inst::Binary { op, .. } => Some(*op),
                _ => None,
            })
            .collect();
        assert_eq!(binops, vec![BinOp::SDiv, BinOp::AShr]);
        assert!(func.externs.contains_key("llvm.smax.i32"));
    }

    #[test]
    fn test_row_major_strides() {
        assert_eq!(row_major_strides(&[4, 8, 2]).as_slice(), &[16, 2, 1]);
        assert_eq!(row_major_strides(&[64]).as_slice(), &[1]);
        assert_eq!(erase(&[4, 8, 2], 1).as_slice(), &[4, 2]);
    }
}
