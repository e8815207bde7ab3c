//! # TLC Layouts
//!
//! A layout is the distribution function that maps every element of a tensor
//! to the execution unit holding it: a `(cta, warp, lane)` triple plus a
//! register offset inside that lane.
//!
//! ## Layout Kinds
//!
//! | Kind | Parameters | Meaning |
//! |------|------------|---------|
//! | [`BlockedLayout`] | `sizePerThread`, `threadsPerWarp`, `warpsPerCTA`, `order`, CTA layout | Regular tiling, wrapping around when the tensor is larger than a tile |
//! | [`SliceLayout`] | `dim`, parent | The parent with one dimension removed (result of a reduction) |
//! | [`DotOperandLayout`] | `opIdx`, parent, `kWidth` | How a dot's A or B operand is held relative to the result layout |
//!
//! ## Tiling
//!
//! Along every dimension `d` a blocked layout covers a CTA tile of
//! `sizePerThread[d] * threadsPerWarp[d] * warpsPerCTA[d]` elements:
//!
//! ```text
//!   dim 1 (order[0], fastest) ->
//!  +--------+--------+--------+--------+
//!  | lane 0 | lane 1 | lane 2 | lane 3 |   warp 0
//!  | [s s]  | [s s]  | [s s]  | [s s]  |
//!  +--------+--------+--------+--------+
//!  | lane 0 | lane 1 | lane 2 | lane 3 |   warp 1
//!  +--------+--------+--------+--------+
//! ```
//!
//! A shape larger than the tile is covered by repetitions, `ceil(shape /
//! tile)` of them; positions past the end of the last repetition are masked.
//! A shape smaller than the tile is replicated, and the lowest-numbered
//! replica is the canonical owner reported by [`Layout::owner`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod blocked;
mod dot_operand;
mod slice;

pub use blocked::{balanced_dot_warps, BlockedLayout, CtaLayout};
pub use dot_operand::DotOperandLayout;
pub use slice::SliceLayout;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Per-dimension layout parameters.
pub type Dims = SmallVec<[u32; 4]>;

/// Hardware configuration every layout is built against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayoutConfig {
    /// Warps per CTA.
    pub num_warps: u32,
    /// Lanes per warp.
    pub threads_per_warp: u32,
    /// CTAs per cluster.
    pub num_ctas: u32,
}

impl LayoutConfig {
    /// Create a configuration.
    #[must_use]
    pub const fn new(num_warps: u32, threads_per_warp: u32, num_ctas: u32) -> Self {
        Self {
            num_warps,
            threads_per_warp,
            num_ctas,
        }
    }
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self::new(4, 64, 1)
    }
}

/// The execution unit owning a tensor element.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Owner {
    /// Lane within the warp.
    pub lane: u32,
    /// Warp within the CTA.
    pub warp: u32,
    /// CTA within the cluster.
    pub cta: u32,
    /// Register offset within the lane.
    pub offset: u32,
}

/// Errors that can occur when building or querying layouts.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    /// A parameter vector has the wrong rank.
    #[error("{what} has rank {found}, expected {expected}")]
    RankMismatch {
        /// Which parameter.
        what: &'static str,
        /// Expected rank.
        expected: usize,
        /// Actual rank.
        found: usize,
    },
    /// `order` is not a permutation of the dimensions.
    #[error("order {0:?} is not a permutation")]
    InvalidOrder(Vec<u32>),
    /// A parameter or shape contains a zero.
    #[error("{0} must be positive in every dimension")]
    ZeroExtent(&'static str),
    /// `threadsPerWarp` does not multiply out to the warp size.
    #[error("threadsPerWarp multiplies to {product}, expected {expected}")]
    ThreadsPerWarp {
        /// Product of the vector.
        product: u64,
        /// Lanes per warp.
        expected: u32,
    },
    /// `warpsPerCTA` does not multiply out to the warp count.
    #[error("warpsPerCTA multiplies to {product}, expected {expected}")]
    WarpsPerCta {
        /// Product of the vector.
        product: u64,
        /// Warps per CTA.
        expected: u32,
    },
    /// `CTAsPerCGA` does not multiply out to the CTA count.
    #[error("CTAsPerCGA multiplies to {product}, expected {expected}")]
    CtasPerCga {
        /// Product of the vector.
        product: u64,
        /// CTAs per cluster.
        expected: u32,
    },
    /// A CTA split does not divide the CTA count of its dimension.
    #[error("CTASplitNum {split} does not divide CTAsPerCGA {ctas} in dimension {dim}")]
    CtaSplit {
        /// Dimension.
        dim: usize,
        /// Split count.
        split: u32,
        /// CTA count.
        ctas: u32,
    },
    /// Slicing a dimension the parent does not have.
    #[error("cannot slice dimension {dim} of a rank {rank} layout")]
    SliceDim {
        /// Sliced dimension.
        dim: u32,
        /// Parent rank.
        rank: usize,
    },
    /// Dot operand index other than 0 or 1.
    #[error("dot operand index must be 0 or 1, found {0}")]
    OperandIndex(u32),
    /// Dot operand parent of the wrong kind or rank.
    #[error("dot operand parent must be a rank 2 blocked layout")]
    DotParent,
    /// Shape rank does not match the layout rank.
    #[error("shape of rank {shape_rank} used with a rank {layout_rank} layout")]
    ShapeRank {
        /// Layout rank.
        layout_rank: usize,
        /// Shape rank.
        shape_rank: usize,
    },
    /// Element index outside the tensor.
    #[error("element index {index} out of bounds for {size} elements")]
    IndexOutOfBounds {
        /// Linear index.
        index: u64,
        /// Element count.
        size: u64,
    },
    /// Operation only defined on blocked layouts.
    #[error("expected a blocked layout, found {0}")]
    NotBlocked(String),
}

/// A tensor layout encoding.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Layout {
    /// Regular blocked distribution.
    Blocked(BlockedLayout),
    /// Parent layout with one dimension removed.
    Slice(SliceLayout),
    /// Operand of a dot relative to the result layout.
    DotOperand(DotOperandLayout),
}

impl Layout {
    /// Tensor rank this layout describes.
    #[must_use]
    pub fn rank(&self) -> usize {
        match self {
            Self::Blocked(b) => b.rank(),
            Self::Slice(s) => s.rank(),
            Self::DotOperand(d) => d.rank(),
        }
    }

    /// Get the blocked layout, if this is one.
    #[must_use]
    pub fn as_blocked(&self) -> Option<&BlockedLayout> {
        match self {
            Self::Blocked(b) => Some(b),
            _ => None,
        }
    }

    /// Check if this is a blocked layout.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked(_))
    }

    /// Dimension order, fastest varying first.
    #[must_use]
    pub fn order(&self) -> Dims {
        match self {
            Self::Blocked(b) => b.order.clone(),
            Self::Slice(s) => s.order(),
            Self::DotOperand(d) => d.parent.order.clone(),
        }
    }

    /// Contiguous elements per thread in each dimension.
    #[must_use]
    pub fn size_per_thread(&self) -> Dims {
        match self {
            Self::Blocked(b) => b.size_per_thread.clone(),
            Self::Slice(s) => s.erase_dim(&s.parent.size_per_thread()),
            Self::DotOperand(d) => d.size_per_thread(),
        }
    }

    /// Lanes per warp in each dimension.
    #[must_use]
    pub fn threads_per_warp(&self) -> Dims {
        match self {
            Self::Blocked(b) => b.threads_per_warp.clone(),
            Self::Slice(s) => s.erase_dim(&s.parent.threads_per_warp()),
            Self::DotOperand(d) => d.parent.threads_per_warp.clone(),
        }
    }

    /// Warps per CTA in each dimension.
    #[must_use]
    pub fn warps_per_cta(&self) -> Dims {
        match self {
            Self::Blocked(b) => b.warps_per_cta.clone(),
            Self::Slice(s) => s.erase_dim(&s.parent.warps_per_cta()),
            Self::DotOperand(d) => d.parent.warps_per_cta.clone(),
        }
    }

    /// Elements covered by one CTA tile in each dimension.
    #[must_use]
    pub fn shape_per_cta_tile(&self) -> Dims {
        match self {
            Self::Blocked(b) => b.shape_per_cta_tile(),
            Self::Slice(s) => s.erase_dim(&s.parent.shape_per_cta_tile()),
            Self::DotOperand(d) => d.shape_per_cta_tile(),
        }
    }

    /// The CTA layout at the root of this layout.
    #[must_use]
    pub fn cta_layout(&self) -> &CtaLayout {
        match self {
            Self::Blocked(b) => &b.cta_layout,
            Self::Slice(s) => s.parent.cta_layout(),
            Self::DotOperand(d) => &d.parent.cta_layout,
        }
    }

    /// Elements each thread holds in each dimension, repetitions included.
    ///
    /// # Errors
    ///
    /// Returns an error if the shape rank does not match.
    pub fn elems_per_thread(&self, shape: &[u32]) -> Result<Dims, LayoutError> {
        check_shape(self.rank(), shape)?;
        Ok(self.elems_at(shape))
    }

    /// Elements per thread for a shape already checked against this layout.
    pub(crate) fn elems_at(&self, shape: &[u32]) -> Dims {
        match self {
            Self::Blocked(b) => b.elems_per_thread(shape),
            Self::Slice(s) => s.elems_per_thread(shape),
            Self::DotOperand(d) => d.elems_per_thread(shape),
        }
    }

    /// Total elements each thread holds.
    ///
    /// # Errors
    ///
    /// Returns an error if the shape rank does not match.
    pub fn total_elems_per_thread(&self, shape: &[u32]) -> Result<u64, LayoutError> {
        Ok(product(&self.elems_per_thread(shape)?))
    }

    /// Owner of the element at a row-major linear index.
    ///
    /// # Errors
    ///
    /// Returns an error if the shape rank does not match or the index is out
    /// of bounds.
    pub fn owner(&self, shape: &[u32], linear_index: u64) -> Result<Owner, LayoutError> {
        check_shape(self.rank(), shape)?;
        let size = product(shape);
        if linear_index >= size {
            return Err(LayoutError::IndexOutOfBounds {
                index: linear_index,
                size,
            });
        }
        Ok(self.owner_at(shape, &delinearize(linear_index, shape)))
    }

    /// Owner of the element at a multi-index. The shape and index must be
    /// valid for this layout.
    pub(crate) fn owner_at(&self, shape: &[u32], index: &[u32]) -> Owner {
        match self {
            Self::Blocked(b) => b.owner_at(shape, index),
            Self::Slice(s) => s.owner_at(shape, index),
            Self::DotOperand(d) => d.owner_at(shape, index),
        }
    }

    /// Per-dimension register coordinate of an element within its lane.
    pub(crate) fn register_coords_at(&self, shape: &[u32], index: &[u32]) -> Dims {
        match self {
            Self::Blocked(b) => b.register_coords(shape, index),
            Self::Slice(s) => s.register_coords(shape, index),
            Self::DotOperand(d) => d.register_coords(shape, index),
        }
    }

    /// The `(lane, warp)` pairs owning at least one element.
    ///
    /// # Errors
    ///
    /// Returns an error if the shape rank does not match.
    pub fn thread_warp_coverage(&self, shape: &[u32]) -> Result<BTreeSet<(u32, u32)>, LayoutError> {
        check_shape(self.rank(), shape)?;
        let mut covered = BTreeSet::new();
        for linear in 0..product(shape) {
            let owner = self.owner_at(shape, &delinearize(linear, shape));
            covered.insert((owner.lane, owner.warp));
        }
        Ok(covered)
    }

    /// Check the layout against a hardware configuration.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self, config: &LayoutConfig) -> Result<(), LayoutError> {
        match self {
            Self::Blocked(b) => b.validate(config),
            Self::Slice(s) => {
                if s.dim as usize >= s.parent.rank() {
                    return Err(LayoutError::SliceDim {
                        dim: s.dim,
                        rank: s.parent.rank(),
                    });
                }
                s.parent.validate(config)
            }
            Self::DotOperand(d) => {
                if d.op_idx > 1 {
                    return Err(LayoutError::OperandIndex(d.op_idx));
                }
                if d.parent.rank() != 2 {
                    return Err(LayoutError::DotParent);
                }
                d.parent.validate(config)
            }
        }
    }
}

impl From<BlockedLayout> for Layout {
    fn from(layout: BlockedLayout) -> Self {
        Self::Blocked(layout)
    }
}

impl From<SliceLayout> for Layout {
    fn from(layout: SliceLayout) -> Self {
        Self::Slice(layout)
    }
}

impl From<DotOperandLayout> for Layout {
    fn from(layout: DotOperandLayout) -> Self {
        Self::DotOperand(layout)
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocked(b) => write!(f, "{b}"),
            Self::Slice(s) => write!(f, "#ttg.slice<{{dim = {}, parent = {}}}>", s.dim, s.parent),
            Self::DotOperand(d) => write!(
                f,
                "#ttg.dot_op<{{opIdx = {}, parent = {}, kWidth = {}}}>",
                d.op_idx, d.parent, d.k_width
            ),
        }
    }
}

/// Format a vector as `[a, b, c]`.
pub fn fmt_dims(dims: &[u32]) -> String {
    let parts: Vec<String> = dims.iter().map(ToString::to_string).collect();
    format!("[{}]", parts.join(", "))
}

pub(crate) fn product(dims: &[u32]) -> u64 {
    dims.iter().map(|&d| u64::from(d)).product()
}

pub(crate) fn check_shape(rank: usize, shape: &[u32]) -> Result<(), LayoutError> {
    if shape.len() != rank {
        return Err(LayoutError::ShapeRank {
            layout_rank: rank,
            shape_rank: shape.len(),
        });
    }
    if shape.contains(&0) {
        return Err(LayoutError::ZeroExtent("shape"));
    }
    Ok(())
}

/// Row-major linear index to multi-index.
pub(crate) fn delinearize(mut linear: u64, shape: &[u32]) -> Dims {
    let mut index: Dims = SmallVec::from_elem(0, shape.len());
    for d in (0..shape.len()).rev() {
        let extent = u64::from(shape[d]);
        // Both values are bounded by `shape[d]`, a u32.
        #[allow(clippy::cast_possible_truncation)]
        {
            index[d] = (linear % extent) as u32;
        }
        linear /= extent;
    }
    index
}

/// Linearize `coords` over `extents`, `order[0]` varying fastest.
pub(crate) fn linearize(coords: &[u32], extents: &[u32], order: &[u32]) -> u32 {
    let mut id = 0;
    let mut stride = 1;
    for &d in order {
        id += coords[d as usize] * stride;
        stride *= extents[d as usize];
    }
    id
}

pub(crate) fn ceil_div(a: u32, b: u32) -> u32 {
    a.div_ceil(b)
}
