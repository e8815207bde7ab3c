//! Blocked layouts and their default construction.

use crate::{ceil_div, fmt_dims, linearize, product, Dims, LayoutConfig, LayoutError, Owner};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// How a tensor is split and replicated across the CTAs of a cluster.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CtaLayout {
    /// CTAs along each dimension.
    #[serde(rename = "CTAsPerCGA")]
    pub ctas_per_cga: Dims,
    /// Distinct tensor pieces along each dimension; the remaining
    /// `CTAsPerCGA / CTASplitNum` CTAs hold replicas.
    #[serde(rename = "CTASplitNum")]
    pub cta_split_num: Dims,
    /// CTA linearization order, fastest first.
    #[serde(rename = "CTAOrder")]
    pub cta_order: Dims,
}

impl CtaLayout {
    /// The layout of a single CTA.
    #[must_use]
    pub fn single(rank: usize) -> Self {
        Self {
            ctas_per_cga: SmallVec::from_elem(1, rank),
            cta_split_num: SmallVec::from_elem(1, rank),
            cta_order: reversed_dims(rank),
        }
    }

    /// Split `shape` across `num_ctas` CTAs, most-major dimension first.
    #[must_use]
    pub fn for_shape(shape: &[u32], order: &[u32], num_ctas: u32) -> Self {
        let rank = shape.len();
        if num_ctas <= 1 || rank == 0 {
            return Self::single(rank);
        }
        let mut ctas: Dims = SmallVec::from_elem(1, rank);
        let mut remaining = num_ctas;
        for &d in order.iter().skip(1).rev() {
            let d = d as usize;
            ctas[d] = largest_divisor_at_most(remaining, shape[d].min(remaining));
            remaining /= ctas[d];
        }
        ctas[order[0] as usize] *= remaining;
        Self {
            cta_split_num: ctas.clone(),
            ctas_per_cga: ctas,
            cta_order: order.into(),
        }
    }

    /// Number of CTAs.
    #[must_use]
    pub fn num_ctas(&self) -> u64 {
        product(&self.ctas_per_cga)
    }

    fn is_single(&self) -> bool {
        self.num_ctas() == 1
    }
}

/// A regular blocked distribution of a tensor over lanes, warps and CTAs.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedLayout {
    /// Contiguous elements each lane holds per dimension.
    pub size_per_thread: Dims,
    /// Lanes per dimension; multiplies to the warp size.
    pub threads_per_warp: Dims,
    /// Warps per dimension; multiplies to the warp count.
    #[serde(rename = "warpsPerCTA")]
    pub warps_per_cta: Dims,
    /// Dimensions from fastest to slowest varying.
    pub order: Dims,
    /// Distribution across CTAs.
    #[serde(rename = "CTALayout")]
    pub cta_layout: CtaLayout,
}

impl BlockedLayout {
    /// Create a blocked layout, validating it against `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if ranks disagree, `order` is not a permutation, any
    /// entry is zero, or the lane, warp and CTA products do not match `config`.
    pub fn new(
        size_per_thread: Dims,
        threads_per_warp: Dims,
        warps_per_cta: Dims,
        order: Dims,
        cta_layout: CtaLayout,
        config: &LayoutConfig,
    ) -> Result<Self, LayoutError> {
        let layout = Self {
            size_per_thread,
            threads_per_warp,
            warps_per_cta,
            order,
            cta_layout,
        };
        layout.validate(config)?;
        Ok(layout)
    }

    /// The default layout for `shape`: one element per thread, the last
    /// dimension fastest.
    ///
    /// # Errors
    ///
    /// Returns an error if the shape is empty or contains a zero.
    pub fn default_for(shape: &[u32], config: &LayoutConfig) -> Result<Self, LayoutError> {
        let rank = shape.len();
        Self::with_size_per_thread(
            shape,
            SmallVec::from_elem(1, rank),
            reversed_dims(rank),
            config,
        )
    }

    /// Distribute lanes and warps over `shape` for a given `sizePerThread`
    /// and `order`.
    ///
    /// Lanes and warps are handed out along `order` starting from the
    /// fastest dimension, each taking as many as its extent can use; the
    /// slowest dimension absorbs whatever is left.
    ///
    /// # Errors
    ///
    /// Returns an error if the inputs disagree in rank, `order` is not a
    /// permutation, or anything is zero.
    pub fn with_size_per_thread(
        shape: &[u32],
        size_per_thread: Dims,
        order: Dims,
        config: &LayoutConfig,
    ) -> Result<Self, LayoutError> {
        let rank = shape.len();
        if rank == 0 {
            return Err(LayoutError::ZeroExtent("rank"));
        }
        if shape.contains(&0) {
            return Err(LayoutError::ZeroExtent("shape"));
        }
        check_rank("sizePerThread", rank, &size_per_thread)?;
        check_order(rank, &order)?;
        if size_per_thread.contains(&0) {
            return Err(LayoutError::ZeroExtent("sizePerThread"));
        }

        let cta_layout = CtaLayout::for_shape(shape, &order, config.num_ctas);
        let shape_per_cta: Dims = shape
            .iter()
            .zip(&cta_layout.cta_split_num)
            .map(|(&s, &split)| ceil_div(s, split))
            .collect();

        let mut threads_per_warp: Dims = SmallVec::from_elem(1, rank);
        let mut warps_per_cta: Dims = SmallVec::from_elem(1, rank);
        let mut remaining_lanes = config.threads_per_warp;
        let mut remaining_warps = config.num_warps;
        let mut remaining_threads = config.num_warps * config.threads_per_warp;
        let mut prev_lanes = 1;
        let mut prev_warps = 1;

        for &d in &order[..rank - 1] {
            let i = d as usize;
            let usable = (shape_per_cta[i] / size_per_thread[i]).max(1);
            let threads_per_cta = remaining_threads.clamp(1, usable);
            threads_per_warp[i] = largest_divisor_at_most(
                remaining_lanes,
                threads_per_cta.clamp(1, remaining_lanes),
            );
            warps_per_cta[i] = largest_divisor_at_most(
                remaining_warps,
                (threads_per_cta / threads_per_warp[i]).clamp(1, remaining_warps),
            );
            remaining_lanes /= threads_per_warp[i];
            remaining_warps /= warps_per_cta[i];
            remaining_threads = (remaining_threads / threads_per_cta).max(1);
            prev_lanes *= threads_per_warp[i];
            prev_warps *= warps_per_cta[i];
        }

        let last = order[rank - 1] as usize;
        threads_per_warp[last] = config.threads_per_warp / prev_lanes;
        warps_per_cta[last] = config.num_warps / prev_warps;

        Self::new(
            size_per_thread,
            threads_per_warp,
            warps_per_cta,
            order,
            cta_layout,
            config,
        )
    }

    /// The layout of a dot result: the default layout with warps split
    /// between the two non-contracted dimensions by [`balanced_dot_warps`].
    ///
    /// # Errors
    ///
    /// Returns an error if `shape` is not rank 2 or is invalid.
    pub fn for_dot(shape: &[u32], config: &LayoutConfig) -> Result<Self, LayoutError> {
        if shape.len() != 2 {
            return Err(LayoutError::RankMismatch {
                what: "dot result",
                expected: 2,
                found: shape.len(),
            });
        }
        let mut layout = Self::default_for(shape, config)?;
        layout.warps_per_cta = balanced_dot_warps(shape, config.num_warps);
        layout.validate(config)?;
        Ok(layout)
    }

    /// Check the layout against a hardware configuration.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self, config: &LayoutConfig) -> Result<(), LayoutError> {
        let rank = self.size_per_thread.len();
        check_rank("threadsPerWarp", rank, &self.threads_per_warp)?;
        check_rank("warpsPerCTA", rank, &self.warps_per_cta)?;
        check_rank("CTAsPerCGA", rank, &self.cta_layout.ctas_per_cga)?;
        check_rank("CTASplitNum", rank, &self.cta_layout.cta_split_num)?;
        check_order(rank, &self.order)?;
        check_order(rank, &self.cta_layout.cta_order)?;
        for (what, dims) in [
            ("sizePerThread", &self.size_per_thread),
            ("threadsPerWarp", &self.threads_per_warp),
            ("warpsPerCTA", &self.warps_per_cta),
            ("CTAsPerCGA", &self.cta_layout.ctas_per_cga),
            ("CTASplitNum", &self.cta_layout.cta_split_num),
        ] {
            if dims.contains(&0) {
                return Err(LayoutError::ZeroExtent(what));
            }
        }

        let lanes = product(&self.threads_per_warp);
        if lanes != u64::from(config.threads_per_warp) {
            return Err(LayoutError::ThreadsPerWarp {
                product: lanes,
                expected: config.threads_per_warp,
            });
        }
        let warps = product(&self.warps_per_cta);
        if warps != u64::from(config.num_warps) {
            return Err(LayoutError::WarpsPerCta {
                product: warps,
                expected: config.num_warps,
            });
        }
        let ctas = self.cta_layout.num_ctas();
        if ctas != u64::from(config.num_ctas) {
            return Err(LayoutError::CtasPerCga {
                product: ctas,
                expected: config.num_ctas,
            });
        }
        for (dim, (&ctas, &split)) in self
            .cta_layout
            .ctas_per_cga
            .iter()
            .zip(&self.cta_layout.cta_split_num)
            .enumerate()
        {
            if ctas % split != 0 {
                return Err(LayoutError::CtaSplit { dim, split, ctas });
            }
        }
        Ok(())
    }

    /// Tensor rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.size_per_thread.len()
    }

    /// Elements covered by one CTA tile in each dimension.
    #[must_use]
    pub fn shape_per_cta_tile(&self) -> Dims {
        (0..self.rank())
            .map(|d| self.size_per_thread[d] * self.threads_per_warp[d] * self.warps_per_cta[d])
            .collect()
    }

    /// The part of `shape` held by one CTA.
    #[must_use]
    pub fn shape_per_cta(&self, shape: &[u32]) -> Dims {
        shape
            .iter()
            .zip(&self.cta_layout.cta_split_num)
            .map(|(&s, &split)| ceil_div(s, split))
            .collect()
    }

    pub(crate) fn elems_per_thread(&self, shape: &[u32]) -> Dims {
        let tile = self.shape_per_cta_tile();
        self.shape_per_cta(shape)
            .iter()
            .enumerate()
            .map(|(d, &s)| ceil_div(s, tile[d]) * self.size_per_thread[d])
            .collect()
    }

    /// Per-dimension register coordinate of `index` within its lane.
    pub(crate) fn register_coords(&self, shape: &[u32], index: &[u32]) -> Dims {
        let shape_per_cta = self.shape_per_cta(shape);
        let tile = self.shape_per_cta_tile();
        (0..self.rank())
            .map(|d| {
                let local = index[d] % shape_per_cta[d];
                let rep = local / tile[d];
                let elem = (local % tile[d]) % self.size_per_thread[d];
                rep * self.size_per_thread[d] + elem
            })
            .collect()
    }

    pub(crate) fn owner_at(&self, shape: &[u32], index: &[u32]) -> Owner {
        let rank = self.rank();
        let shape_per_cta = self.shape_per_cta(shape);
        let tile = self.shape_per_cta_tile();
        let mut cta: Dims = SmallVec::from_elem(0, rank);
        let mut lane: Dims = SmallVec::from_elem(0, rank);
        let mut warp: Dims = SmallVec::from_elem(0, rank);
        for d in 0..rank {
            cta[d] = index[d] / shape_per_cta[d];
            let within = (index[d] % shape_per_cta[d]) % tile[d];
            let spt = self.size_per_thread[d];
            lane[d] = (within / spt) % self.threads_per_warp[d];
            warp[d] = (within / (spt * self.threads_per_warp[d])) % self.warps_per_cta[d];
        }
        let registers = self.register_coords(shape, index);
        let extents = self.elems_per_thread(shape);
        Owner {
            lane: linearize(&lane, &self.threads_per_warp, &self.order),
            warp: linearize(&warp, &self.warps_per_cta, &self.order),
            cta: linearize(&cta, &self.cta_layout.ctas_per_cga, &self.cta_layout.cta_order),
            offset: linearize(&registers, &extents, &self.order),
        }
    }

    /// The layout of this layout's tensor after a transpose: result
    /// dimension `i` is operand dimension `perm[i]`.
    ///
    /// # Errors
    ///
    /// Returns an error if `perm` is not a permutation of the dimensions.
    pub fn permute(&self, perm: &[u32]) -> Result<Self, LayoutError> {
        check_order(self.rank(), perm)?;
        let mut inverse: Dims = SmallVec::from_elem(0, perm.len());
        for (i, &p) in perm.iter().enumerate() {
            // Ranks are tiny; `i` always fits.
            #[allow(clippy::cast_possible_truncation)]
            {
                inverse[p as usize] = i as u32;
            }
        }
        let gather = |dims: &Dims| -> Dims { perm.iter().map(|&p| dims[p as usize]).collect() };
        let remap = |order: &Dims| -> Dims { order.iter().map(|&d| inverse[d as usize]).collect() };
        Ok(Self {
            size_per_thread: gather(&self.size_per_thread),
            threads_per_warp: gather(&self.threads_per_warp),
            warps_per_cta: gather(&self.warps_per_cta),
            order: remap(&self.order),
            cta_layout: CtaLayout {
                ctas_per_cga: gather(&self.cta_layout.ctas_per_cga),
                cta_split_num: gather(&self.cta_layout.cta_split_num),
                cta_order: remap(&self.cta_layout.cta_order),
            },
        })
    }
}

impl fmt::Display for BlockedLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#ttg.blocked<{{sizePerThread = {}, threadsPerWarp = {}, warpsPerCTA = {}, order = {}",
            fmt_dims(&self.size_per_thread),
            fmt_dims(&self.threads_per_warp),
            fmt_dims(&self.warps_per_cta),
            fmt_dims(&self.order),
        )?;
        if !self.cta_layout.is_single() {
            write!(
                f,
                ", CTAsPerCGA = {}, CTASplitNum = {}, CTAOrder = {}",
                fmt_dims(&self.cta_layout.ctas_per_cga),
                fmt_dims(&self.cta_layout.cta_split_num),
                fmt_dims(&self.cta_layout.cta_order),
            )?;
        }
        write!(f, "}}>")
    }
}

/// Split `num_warps` between the two non-contracted dimensions of a dot
/// result of shape `[M, N]`.
///
/// Starting from `[1, 1]`, the dimension with more remaining 16-element rows
/// per warp is doubled (ties go to dimension 0) until the power-of-two part
/// of `num_warps` is used; any odd factor left over goes to dimension 1.
#[must_use]
pub fn balanced_dot_warps(shape: &[u32], num_warps: u32) -> Dims {
    const INSTR: u32 = 16;
    let pow2 = 1u32 << num_warps.max(1).trailing_zeros();
    let mut warps = [1u32, 1u32];
    while warps[0] * warps[1] < pow2 {
        let rows = shape[0] / INSTR / warps[0];
        let cols = shape[1] / (INSTR * warps[1]);
        if rows >= cols && warps[0] < shape[0] / INSTR {
            warps[0] *= 2;
        } else {
            warps[1] *= 2;
        }
    }
    warps[1] *= num_warps.max(1) / pow2;
    SmallVec::from_slice(&warps)
}

fn reversed_dims(rank: usize) -> Dims {
    // Ranks are tiny.
    #[allow(clippy::cast_possible_truncation)]
    (0..rank as u32).rev().collect()
}

fn largest_divisor_at_most(n: u32, cap: u32) -> u32 {
    (1..=cap.min(n).max(1))
        .rev()
        .find(|d| n % d == 0)
        .unwrap_or(1)
}

fn check_rank(what: &'static str, expected: usize, dims: &[u32]) -> Result<(), LayoutError> {
    if dims.len() == expected {
        Ok(())
    } else {
        Err(LayoutError::RankMismatch {
            what,
            expected,
            found: dims.len(),
        })
    }
}

fn check_order(rank: usize, order: &[u32]) -> Result<(), LayoutError> {
    let mut seen = vec![false; rank];
    let valid = order.len() == rank
        && order.iter().all(|&d| {
            let d = d as usize;
            d < rank && !std::mem::replace(&mut seen[d], true)
        });
    if valid {
        Ok(())
    } else {
        Err(LayoutError::InvalidOrder(order.to_vec()))
    }
}
