//! Dot operand layouts.

use crate::{BlockedLayout, Dims, LayoutError, Owner};
use serde::{Deserialize, Serialize};
use smallvec::smallvec;

/// How operand A (`op_idx = 0`, `M x K`) or B (`op_idx = 1`, `K x N`) of a
/// dot is held, relative to the blocked layout of the `M x N` result.
///
/// Each lane keeps the full contraction dimension for the rows (A) or
/// columns (B) of the result it owns.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DotOperandLayout {
    /// 0 for A, 1 for B.
    pub op_idx: u32,
    /// Layout of the dot result.
    pub parent: BlockedLayout,
    /// Contiguous contraction elements per lane.
    pub k_width: u32,
}

impl DotOperandLayout {
    /// Create a dot operand layout.
    ///
    /// # Errors
    ///
    /// Returns an error if `op_idx` is not 0 or 1, the parent is not rank 2,
    /// or `k_width` is zero.
    pub fn new(op_idx: u32, parent: BlockedLayout, k_width: u32) -> Result<Self, LayoutError> {
        if op_idx > 1 {
            return Err(LayoutError::OperandIndex(op_idx));
        }
        if parent.rank() != 2 {
            return Err(LayoutError::DotParent);
        }
        if k_width == 0 {
            return Err(LayoutError::ZeroExtent("kWidth"));
        }
        Ok(Self {
            op_idx,
            parent,
            k_width,
        })
    }

    /// Contraction elements per lane for an element type of `bits` width:
    /// one 64-bit chunk.
    #[must_use]
    pub fn k_width_for_bits(bits: u32) -> u32 {
        (64 / bits.max(1)).max(1)
    }

    /// Tensor rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        2
    }

    /// The non-contracted dimension this operand shares with the result.
    fn kept_dim(&self) -> usize {
        if self.op_idx == 0 {
            0
        } else {
            1
        }
    }

    pub(crate) fn size_per_thread(&self) -> Dims {
        let kept = self.parent.size_per_thread[self.kept_dim()];
        if self.op_idx == 0 {
            smallvec![kept, self.k_width]
        } else {
            smallvec![self.k_width, kept]
        }
    }

    pub(crate) fn shape_per_cta_tile(&self) -> Dims {
        let kept = self.parent.shape_per_cta_tile()[self.kept_dim()];
        if self.op_idx == 0 {
            smallvec![kept, self.k_width]
        } else {
            smallvec![self.k_width, kept]
        }
    }

    /// Result-space shape and index for an operand element.
    fn parent_coords(&self, shape: &[u32], index: &[u32]) -> ([u32; 2], [u32; 2]) {
        if self.op_idx == 0 {
            ([shape[0], 1], [index[0], 0])
        } else {
            ([1, shape[1]], [0, index[1]])
        }
    }

    pub(crate) fn elems_per_thread(&self, shape: &[u32]) -> Dims {
        let (parent_shape, _) = self.parent_coords(shape, &[0, 0]);
        let kept = self.parent.elems_per_thread(&parent_shape)[self.kept_dim()];
        if self.op_idx == 0 {
            smallvec![kept, shape[1]]
        } else {
            smallvec![shape[0], kept]
        }
    }

    pub(crate) fn register_coords(&self, shape: &[u32], index: &[u32]) -> Dims {
        let (parent_shape, parent_index) = self.parent_coords(shape, index);
        let row = self.parent.register_coords(&parent_shape, &parent_index)[self.kept_dim()];
        if self.op_idx == 0 {
            smallvec![row, index[1]]
        } else {
            smallvec![index[0], row]
        }
    }

    pub(crate) fn owner_at(&self, shape: &[u32], index: &[u32]) -> Owner {
        let (parent_shape, parent_index) = self.parent_coords(shape, index);
        let mut owner = self.parent.owner_at(&parent_shape, &parent_index);
        let row = self.parent.register_coords(&parent_shape, &parent_index)[self.kept_dim()];
        owner.offset = if self.op_idx == 0 {
            row * shape[1] + index[1]
        } else {
            let kept = self.parent.elems_per_thread(&parent_shape)[1];
            index[0] * kept + row
        };
        owner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Layout, LayoutConfig};

    fn dot_parent() -> BlockedLayout {
        BlockedLayout::for_dot(&[64, 64], &LayoutConfig::new(4, 32, 1)).unwrap()
    }

    #[test]
    fn test_k_width() {
        assert_eq!(DotOperandLayout::k_width_for_bits(16), 4);
        assert_eq!(DotOperandLayout::k_width_for_bits(32), 2);
        assert_eq!(DotOperandLayout::k_width_for_bits(8), 8);
        assert_eq!(DotOperandLayout::k_width_for_bits(64), 1);
        assert_eq!(DotOperandLayout::k_width_for_bits(128), 1);
    }

    #[test]
    fn test_invalid_operands() {
        assert_eq!(
            DotOperandLayout::new(2, dot_parent(), 4),
            Err(LayoutError::OperandIndex(2))
        );
        let flat = BlockedLayout::default_for(&[64], &LayoutConfig::new(4, 32, 1)).unwrap();
        assert_eq!(DotOperandLayout::new(0, flat, 4), Err(LayoutError::DotParent));
    }

    #[test]
    fn test_operand_a_follows_result_rows() {
        let parent = dot_parent();
        let a = Layout::DotOperand(DotOperandLayout::new(0, parent.clone(), 4).unwrap());
        let result = Layout::Blocked(parent);
        let (m, k) = (64u32, 32u32);
        for row in 0..m {
            let from_result = result.owner(&[m, 64], u64::from(row * 64)).unwrap();
            for col in 0..k {
                let owner = a.owner(&[m, k], u64::from(row * k + col)).unwrap();
                assert_eq!((owner.lane, owner.warp), (from_result.lane, from_result.warp));
            }
        }
        let elems = a.elems_per_thread(&[m, k]).unwrap();
        assert_eq!(elems[1], k);
    }

    #[test]
    fn test_operand_offsets_unique_per_lane() {
        let b = Layout::DotOperand(DotOperandLayout::new(1, dot_parent(), 4).unwrap());
        let shape = [16u32, 64];
        let mut seen = std::collections::HashSet::new();
        for i in 0..16 * 64 {
            let owner = b.owner(&shape, i).unwrap();
            assert!(seen.insert(owner), "duplicate owner {owner:?}");
        }
        assert!(b.to_string().starts_with("#ttg.dot_op<{opIdx = 1, parent = #ttg.blocked"));
    }
}
