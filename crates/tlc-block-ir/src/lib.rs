//! # TLC Block IR
//!
//! The layout-aware form of a kernel: every tensor-IR operation paired with
//! a plan describing how its elements are spread over registers, lanes,
//! warps and shared memory.
//!
//! ## Pipeline Position
//!
//! ```text
//! [Tensor IR]  <- layouts assigned, conversions explicit
//!     |
//!     v
//! [Block IR]   <- This crate: per-operation plans
//!     |
//!     v
//! [AMD ll IR]
//! ```
//!
//! ## Plans
//!
//! | Operation | Plan |
//! |-----------|------|
//! | `tt.reduce` | [`ReducePlan`]: in-register, butterfly shuffles, cross-warp scratch |
//! | `tt.load` / `tt.store` | [`MemAccessPlan`]: vector width and predication |
//! | `tt.dot` | [`DotPlan`]: warp split and operand packing |
//! | `ttg.convert_layout` | [`ConvertPlan`]: registers, shuffles or shared memory |
//! | elementwise and structural ops | [`Plan::Elementwise`] |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use tlc_index::{Idx, IndexVec};
use tlc_layout::{fmt_dims, Dims, LayoutConfig};
use tlc_span::Loc;
use tlc_target::GpuTarget;
use tlc_tensor_ir::{
    CacheModifier, EvictionPolicy, OpId, OpKind, Padding, Type, ValueData, ValueId,
};

pub mod lower;

pub use lower::{classify_conversion, lower_function, lower_module, LowerConfig, LowerError};

/// A lowered module.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockModule {
    /// Module name.
    pub name: String,
    /// The target the plans were made for.
    pub target: GpuTarget,
    /// Hardware configuration.
    pub config: LayoutConfig,
    /// Lowered kernels.
    pub functions: Vec<BlockFunction>,
}

/// A lowered kernel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockFunction {
    /// Kernel name.
    pub name: String,
    /// Argument values.
    pub args: Vec<ValueId>,
    /// Values with their layout-annotated types.
    pub values: IndexVec<ValueId, ValueData>,
    /// Operations in program order.
    pub ops: Vec<BlockOp>,
    /// Shared memory needed by the largest scratch user. Scratch is reused
    /// between operations.
    pub scratch_bytes: u32,
}

impl BlockFunction {
    /// Type of a value.
    #[must_use]
    pub fn value_type(&self, value: ValueId) -> &Type {
        &self.values[value].ty
    }

    /// Count operations whose plan satisfies `pred`.
    pub fn count_plans(&self, mut pred: impl FnMut(&Plan) -> bool) -> usize {
        self.ops.iter().filter(|op| pred(&op.plan)).count()
    }
}

/// One operation with its plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockOp {
    /// The tensor-IR operation this lowers.
    pub source: OpId,
    /// Operation kind and attributes.
    pub kind: OpKind,
    /// Operand values.
    pub operands: SmallVec<[ValueId; 4]>,
    /// Result values.
    pub results: SmallVec<[ValueId; 1]>,
    /// Source location.
    pub loc: Loc,
    /// How the operation is carried out.
    pub plan: Plan,
}

/// How an operation maps onto the hardware.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Plan {
    /// Executed once per lane on uniform (scalar) values.
    Uniform,
    /// Applied independently to every element a lane holds.
    Elementwise {
        /// Elements of the result each lane holds.
        elems_per_thread: u64,
    },
    /// A reduction along one axis.
    Reduce(ReducePlan),
    /// A global load or store.
    MemAccess(MemAccessPlan),
    /// A matrix multiply-accumulate.
    Dot(DotPlan),
    /// A layout conversion.
    Convert(ConvertPlan),
}

impl Plan {
    /// Shared memory the plan uses, in bytes.
    #[must_use]
    pub fn scratch_bytes(&self) -> u32 {
        match self {
            Self::Reduce(ReducePlan {
                inter_warp: Some(w),
                ..
            }) => w.scratch_bytes,
            Self::Convert(ConvertPlan::SharedMemory { scratch_bytes }) => *scratch_bytes,
            _ => 0,
        }
    }
}

/// Lowering of `tt.reduce`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReducePlan {
    /// Reduced axis.
    pub axis: u32,
    /// Elements each lane combines in registers before any shuffle.
    pub thread: u32,
    /// XOR lane masks of the butterfly within a warp, widest first.
    pub shuffle_masks: SmallVec<[u32; 8]>,
    /// Cross-warp combination through shared memory, when the axis spans
    /// more than one warp.
    pub inter_warp: Option<InterWarp>,
    /// Elements of the result each lane holds.
    pub elems_per_thread: u64,
}

/// The cross-warp stage of a reduction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterWarp {
    /// Warps along the reduced axis.
    pub warps: u32,
    /// Shared memory holding one partial per warp and output element.
    pub scratch_bytes: u32,
}

/// Lowering of `tt.load` and `tt.store`, shared by pointer tensors and
/// block pointers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemAccessPlan {
    /// Elements per vector access.
    pub vector_width: u32,
    /// Vector accesses each lane issues.
    pub vectors_per_thread: u32,
    /// Whether lanes are predicated by a mask or a boundary check.
    pub masked: bool,
    /// Value observed by masked-off lanes of a load.
    pub other: Option<ValueId>,
    /// Cache modifier.
    pub cache: CacheModifier,
    /// Eviction policy.
    pub eviction: EvictionPolicy,
    /// Volatile access.
    pub volatile: bool,
    /// Block pointer dimensions checked against the tensor bounds.
    pub boundary_check: Vec<u32>,
    /// Fill value of out-of-bounds block pointer elements.
    pub padding: Option<Padding>,
    /// Whether the address comes from a block pointer.
    pub block_ptr: bool,
}

/// Lowering of `tt.dot`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DotPlan {
    /// Warp split of the result tile.
    pub warps_per_cta: Dims,
    /// Contraction elements each lane packs per operand register.
    pub k_width: u32,
    /// Accumulator elements each lane holds.
    pub elems_per_thread: u64,
    /// Length of the contraction dimension.
    pub k: u32,
}

/// Lowering of `ttg.convert_layout`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "via", rename_all = "snake_case")]
pub enum ConvertPlan {
    /// Every element stays in the same lane; registers are renamed.
    Registers,
    /// Elements move between lanes of one warp.
    WarpShuffle,
    /// Elements cross warps through shared memory.
    SharedMemory {
        /// Size of the staging buffer.
        scratch_bytes: u32,
    },
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uniform => write!(f, "uniform"),
            Self::Elementwise { elems_per_thread } => {
                write!(f, "elementwise elems_per_thread = {elems_per_thread}")
            }
            Self::Reduce(r) => {
                write!(
                    f,
                    "reduce axis = {}, thread = {}, shuffles = {}",
                    r.axis,
                    r.thread,
                    fmt_dims(&r.shuffle_masks)
                )?;
                if let Some(w) = r.inter_warp {
                    write!(f, ", warps = {}, scratch = {}", w.warps, w.scratch_bytes)?;
                }
                Ok(())
            }
            Self::MemAccess(m) => {
                write!(f, "vector = {} x {}", m.vector_width, m.vectors_per_thread)?;
                if m.masked {
                    write!(f, ", masked")?;
                }
                if m.block_ptr {
                    write!(f, ", block_ptr")?;
                }
                if m.cache != CacheModifier::None {
                    write!(f, ", cache = {}", m.cache.name())?;
                }
                if m.volatile {
                    write!(f, ", volatile")?;
                }
                Ok(())
            }
            Self::Dot(d) => write!(
                f,
                "dot warps = {}, kWidth = {}, k = {}, elems_per_thread = {}",
                fmt_dims(&d.warps_per_cta),
                d.k_width,
                d.k,
                d.elems_per_thread
            ),
            Self::Convert(ConvertPlan::Registers) => write!(f, "convert in registers"),
            Self::Convert(ConvertPlan::WarpShuffle) => write!(f, "convert by warp shuffle"),
            Self::Convert(ConvertPlan::SharedMemory { scratch_bytes }) => {
                write!(f, "convert through shared memory, scratch = {scratch_bytes}")
            }
        }
    }
}

impl fmt::Display for BlockFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "block.func @{} scratch = {} {{", self.name, self.scratch_bytes)?;
        for op in &self.ops {
            write!(f, "  ")?;
            if !op.results.is_empty() {
                let names: Vec<String> =
                    op.results.iter().map(|v| format!("%{}", v.index())).collect();
                write!(f, "{} = ", names.join(", "))?;
            }
            writeln!(f, "{}: {}", op.kind.name(), op.plan)?;
        }
        writeln!(f, "}}")
    }
}

impl fmt::Display for BlockModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "// {} for {}, {} warps x {} lanes",
            self.name, self.target, self.config.num_warps, self.config.threads_per_warp
        )?;
        for func in &self.functions {
            write!(f, "{func}")?;
        }
        Ok(())
    }
}
