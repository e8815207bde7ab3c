//! # Lowering from Tensor IR to Block IR
//!
//! Every operation of a layout-annotated kernel gets a [`Plan`]. Layouts are
//! read, never changed: a kernel that reaches this stage with a tensor
//! lacking a layout, or with an operand layout the operation cannot consume,
//! is rejected.

use crate::{
    BlockFunction, BlockModule, BlockOp, ConvertPlan, DotPlan, InterWarp, MemAccessPlan, Plan,
    ReducePlan,
};
use smallvec::SmallVec;
use thiserror::Error;
use tlc_layout::{Layout, LayoutConfig, LayoutError};
use tlc_span::Loc;
use tlc_target::GpuTarget;
use tlc_tensor_ir::{Function, MemAttrs, Module, ModuleConfig, OpKind, Operation, Type};
use tracing::{debug, trace};

/// Errors that can occur during lowering.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum LowerError {
    /// An operation or layout combination without a lowering.
    #[error("{loc}: cannot lower `{op}`: {reason}")]
    UnsupportedOp {
        /// Operation name.
        op: String,
        /// Source location.
        loc: Loc,
        /// What is missing.
        reason: String,
    },

    /// A tensor reached lowering without a layout.
    #[error("{loc}: `{op}` uses a tensor without a layout")]
    MissingLayout {
        /// Operation name.
        op: String,
        /// Source location.
        loc: Loc,
    },

    /// The kernel needs more shared memory than the target has.
    #[error("kernel `{kernel}` needs {needed} bytes of shared memory, the target has {available}")]
    SharedMemoryExceeded {
        /// Kernel name.
        kernel: String,
        /// Bytes required.
        needed: u32,
        /// Bytes available.
        available: u32,
    },

    /// The module configuration names an unknown target.
    #[error("invalid module configuration: {0}")]
    Config(String),

    /// A layout query failed.
    #[error(transparent)]
    Layout(#[from] LayoutError),
}

impl LowerError {
    fn unsupported(op: &Operation, reason: impl Into<String>) -> Self {
        Self::UnsupportedOp {
            op: op.kind.name().to_string(),
            loc: op.loc.clone(),
            reason: reason.into(),
        }
    }
}

/// Configuration for lowering.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LowerConfig {
    /// Target hardware.
    pub target: GpuTarget,
    /// Warp and lane counts.
    pub layout: LayoutConfig,
}

impl LowerConfig {
    /// Create a configuration.
    #[must_use]
    pub fn new(target: GpuTarget, layout: LayoutConfig) -> Self {
        Self { target, layout }
    }

    /// The configuration a module's attribute block describes.
    ///
    /// # Errors
    ///
    /// Returns [`LowerError::Config`] if the target string is not recognized.
    pub fn from_module_config(config: &ModuleConfig) -> Result<Self, LowerError> {
        let target = config
            .gpu_target()
            .map_err(|e| LowerError::Config(e.to_string()))?;
        let layout = config
            .layout_config()
            .map_err(|e| LowerError::Config(e.to_string()))?;
        Ok(Self::new(target, layout))
    }
}

/// Lower every kernel of a module.
///
/// # Errors
///
/// Returns the first kernel's [`LowerError`].
pub fn lower_module(module: &Module) -> Result<BlockModule, LowerError> {
    let config = LowerConfig::from_module_config(&module.config)?;
    let functions = module
        .functions
        .iter()
        .map(|func| lower_function(func, &config))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(BlockModule {
        name: module.name.clone(),
        target: config.target,
        config: config.layout,
        functions,
    })
}

/// Lower one kernel.
///
/// # Errors
///
/// Returns an error if a tensor has no layout, an operation has no lowering
/// for its layouts, or the kernel's scratch exceeds the target's shared
/// memory.
pub fn lower_function(func: &Function, config: &LowerConfig) -> Result<BlockFunction, LowerError> {
    let mut ops = Vec::with_capacity(func.body.len());
    let mut scratch_bytes = 0;
    for (id, op) in func.body_ops() {
        check_layouts(func, op)?;
        let plan = plan_op(func, op, config)?;
        trace!(op = op.kind.name(), %plan, "planned");
        scratch_bytes = scratch_bytes.max(plan.scratch_bytes());
        ops.push(BlockOp {
            source: id,
            kind: op.kind.clone(),
            operands: op.operands.clone(),
            results: op.results.clone(),
            loc: op.loc.clone(),
            plan,
        });
    }

    let available = config.target.shared_memory_bytes();
    if scratch_bytes > available {
        return Err(LowerError::SharedMemoryExceeded {
            kernel: func.name.clone(),
            needed: scratch_bytes,
            available,
        });
    }
    debug!(kernel = %func.name, ops = ops.len(), scratch_bytes, "lowered kernel");
    Ok(BlockFunction {
        name: func.name.clone(),
        args: func.args.clone(),
        values: func.values.clone(),
        ops,
        scratch_bytes,
    })
}

fn check_layouts(func: &Function, op: &Operation) -> Result<(), LowerError> {
    let missing = op
        .operands
        .iter()
        .chain(&op.results)
        .any(|&v| func.value_type(v).is_tensor() && func.encoding(v).is_none());
    if missing {
        return Err(LowerError::MissingLayout {
            op: op.kind.name().to_string(),
            loc: op.loc.clone(),
        });
    }
    Ok(())
}

fn plan_op(func: &Function, op: &Operation, config: &LowerConfig) -> Result<Plan, LowerError> {
    match &op.kind {
        OpKind::Reduce { axis, .. } => reduce_plan(func, op, *axis).map(Plan::Reduce),
        OpKind::Load(attrs) | OpKind::Store(attrs) => {
            mem_access_plan(func, op, attrs, &config.target).map(Plan::MemAccess)
        }
        OpKind::Dot => dot_plan(func, op).map(Plan::Dot),
        OpKind::ConvertLayout => {
            let (src, dst) = (op.operands[0], op.results[0]);
            let (Some(from), Some(to)) = (func.encoding(src), func.encoding(dst)) else {
                return Err(LowerError::unsupported(op, "conversion of a non-tensor value"));
            };
            let ty = func.value_type(src);
            let plan = classify_conversion(from, to, ty.shape(), elem_bytes(ty))?;
            Ok(Plan::Convert(plan))
        }
        _ => match op.result() {
            Some(result) => match func.encoding(result) {
                Some(layout) => Ok(Plan::Elementwise {
                    elems_per_thread: layout
                        .total_elems_per_thread(func.value_type(result).shape())?,
                }),
                None => Ok(Plan::Uniform),
            },
            None => Ok(Plan::Uniform),
        },
    }
}

fn elem_bytes(ty: &Type) -> u32 {
    match ty {
        Type::BlockPtr(b) => b.elem.size_bytes(),
        _ => ty.elem().map_or(4, |e| e.bits().div_ceil(8)),
    }
}

fn bytes(count: u64, elem_bytes: u32) -> u32 {
    u32::try_from(count * u64::from(elem_bytes)).unwrap_or(u32::MAX)
}

fn reduce_plan(func: &Function, op: &Operation, axis: u32) -> Result<ReducePlan, LowerError> {
    let operand = op.operands[0];
    let ty = func.value_type(operand);
    let Some(layout @ Layout::Blocked(src)) = func.encoding(operand) else {
        return Err(LowerError::unsupported(
            op,
            "reduction operand must use a blocked layout",
        ));
    };
    let shape = ty.shape();
    let a = axis as usize;
    let thread = layout.elems_per_thread(shape)?[a];

    let spt = src.size_per_thread[a];
    let tpw = src.threads_per_warp[a];
    // Round up: lanes past the extent hold no element and contribute the
    // identity.
    let lanes = tpw.min(shape[a].div_ceil(spt).next_power_of_two());
    // Lane ids enumerate dimensions in `order`, fastest first.
    let lane_stride: u32 = src
        .order
        .iter()
        .take_while(|&&d| d != axis)
        .map(|&d| src.threads_per_warp[d as usize])
        .product();
    let mut shuffle_masks = SmallVec::new();
    let mut offset = lanes / 2;
    while offset > 0 {
        shuffle_masks.push(offset * lane_stride);
        offset /= 2;
    }

    let warps = if shape[a].div_ceil(spt * tpw) > 1 {
        src.warps_per_cta[a]
    } else {
        1
    };
    let outputs: u64 = shape.iter().map(|&d| u64::from(d)).product::<u64>() / u64::from(shape[a]);
    let inter_warp = (warps > 1).then(|| InterWarp {
        warps,
        scratch_bytes: bytes(outputs * u64::from(warps), elem_bytes(ty)),
    });

    let result = op.results[0];
    let elems_per_thread = match func.encoding(result) {
        Some(out) => out.total_elems_per_thread(func.value_type(result).shape())?,
        None => 1,
    };
    Ok(ReducePlan {
        axis,
        thread,
        shuffle_masks,
        inter_warp,
        elems_per_thread,
    })
}

fn mem_access_plan(
    func: &Function,
    op: &Operation,
    attrs: &MemAttrs,
    target: &GpuTarget,
) -> Result<MemAccessPlan, LowerError> {
    let is_load = matches!(op.kind, OpKind::Load(_));
    let data = if is_load { op.results[0] } else { op.operands[1] };
    let mask_index = if is_load { 1 } else { 2 };
    let ptr_ty = func.value_type(op.operands[0]);
    let (layout, pointee, masked, block_ptr) = match ptr_ty {
        Type::Scalar(elem) => (None, elem.pointee(), op.operands.len() > mask_index, false),
        Type::Tensor(t) => (
            func.encoding(op.operands[0]),
            t.elem.pointee(),
            op.operands.len() > mask_index,
            false,
        ),
        Type::BlockPtr(b) => (
            func.encoding(data),
            Some(b.elem),
            !attrs.boundary_check.is_empty(),
            true,
        ),
    };
    let Some(pointee) = pointee else {
        return Err(LowerError::unsupported(op, "address is not a pointer"));
    };

    let (vector_width, vectors_per_thread) = match layout {
        Some(layout) => {
            let order = layout.order();
            let contiguous = layout.size_per_thread()[order[0] as usize];
            let max_elems = (target.max_vector_access_bits() / pointee.bits()).max(1);
            let shape = func.value_type(data).shape();
            // A vector never straddles the end of a row, so one predicate
            // covers it.
            let extent = shape[order[0] as usize];
            let mut width = contiguous.min(max_elems).max(1);
            while contiguous % width != 0 || extent % width != 0 {
                width /= 2;
            }
            let total = layout.total_elems_per_thread(shape)?;
            let vectors = u32::try_from(total / u64::from(width)).unwrap_or(u32::MAX);
            (width, vectors)
        }
        None => (1, 1),
    };

    Ok(MemAccessPlan {
        vector_width,
        vectors_per_thread,
        masked,
        other: if is_load { op.operands.get(2).copied() } else { None },
        cache: attrs.cache,
        eviction: attrs.eviction,
        volatile: attrs.is_volatile,
        boundary_check: attrs.boundary_check.clone(),
        padding: attrs.padding,
        block_ptr,
    })
}

fn dot_plan(func: &Function, op: &Operation) -> Result<DotPlan, LowerError> {
    let layouts = (
        func.encoding(op.operands[0]),
        func.encoding(op.operands[1]),
        func.encoding(op.results[0]),
    );
    let (Some(Layout::DotOperand(a)), Some(Layout::DotOperand(b)), Some(result @ Layout::Blocked(d))) =
        layouts
    else {
        return Err(LowerError::unsupported(
            op,
            "operands must be in dot operand layouts of a blocked result",
        ));
    };
    if a.k_width != b.k_width {
        return Err(LowerError::unsupported(
            op,
            format!("operand kWidth {} and {} differ", a.k_width, b.k_width),
        ));
    }
    Ok(DotPlan {
        warps_per_cta: d.warps_per_cta.clone(),
        k_width: a.k_width,
        elems_per_thread: result.total_elems_per_thread(func.value_type(op.results[0]).shape())?,
        k: func.value_type(op.operands[0]).shape()[1],
    })
}

/// Decide how a conversion moves data by comparing the owner of every
/// element under both layouts.
///
/// # Errors
///
/// Returns an error if either layout does not match the shape's rank.
pub fn classify_conversion(
    from: &Layout,
    to: &Layout,
    shape: &[u32],
    elem_bytes: u32,
) -> Result<ConvertPlan, LayoutError> {
    if from == to {
        return Ok(ConvertPlan::Registers);
    }
    let size: u64 = shape.iter().map(|&d| u64::from(d)).product();
    let mut same_lane = true;
    for index in 0..size {
        let (src, dst) = (from.owner(shape, index)?, to.owner(shape, index)?);
        if src.warp != dst.warp || src.cta != dst.cta {
            return Ok(ConvertPlan::SharedMemory {
                scratch_bytes: bytes(size, elem_bytes),
            });
        }
        same_lane &= src.lane == dst.lane;
    }
    Ok(if same_lane {
        ConvertPlan::Registers
    } else {
        ConvertPlan::WarpShuffle
    })
}
