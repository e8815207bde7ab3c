//! Sliced layouts.

use crate::{linearize, Dims, Layout, LayoutError, Owner};
use serde::{Deserialize, Serialize};

/// A parent layout with dimension `dim` removed.
///
/// Element `i` of a sliced tensor lives where the parent keeps element `i`
/// with a zero inserted at `dim`, over the parent shape with a unit extent
/// inserted at `dim`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SliceLayout {
    /// Removed dimension of the parent.
    pub dim: u32,
    /// The parent layout.
    pub parent: Box<Layout>,
}

impl SliceLayout {
    /// Slice `dim` out of `parent`.
    ///
    /// # Errors
    ///
    /// Returns [`LayoutError::SliceDim`] if `parent` has no dimension `dim`.
    pub fn new(dim: u32, parent: impl Into<Layout>) -> Result<Self, LayoutError> {
        let parent = parent.into();
        if dim as usize >= parent.rank() {
            return Err(LayoutError::SliceDim {
                dim,
                rank: parent.rank(),
            });
        }
        Ok(Self {
            dim,
            parent: Box::new(parent),
        })
    }

    /// Tensor rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.parent.rank() - 1
    }

    /// The parent order without `dim`, renumbered.
    #[must_use]
    pub fn order(&self) -> Dims {
        self.parent
            .order()
            .iter()
            .filter(|&&d| d != self.dim)
            .map(|&d| if d > self.dim { d - 1 } else { d })
            .collect()
    }

    /// The shape the parent sees for a sliced tensor of `shape`.
    #[must_use]
    pub fn parent_shape(&self, shape: &[u32]) -> Dims {
        let mut parent: Dims = shape.into();
        parent.insert(self.dim as usize, 1);
        parent
    }

    /// Drop `dim` from a parent-rank vector.
    pub(crate) fn erase_dim(&self, dims: &[u32]) -> Dims {
        dims.iter()
            .enumerate()
            .filter(|&(d, _)| d != self.dim as usize)
            .map(|(_, &v)| v)
            .collect()
    }

    pub(crate) fn elems_per_thread(&self, shape: &[u32]) -> Dims {
        self.erase_dim(&self.parent.elems_at(&self.parent_shape(shape)))
    }

    fn parent_index(&self, index: &[u32]) -> Dims {
        let mut parent_index: Dims = index.into();
        parent_index.insert(self.dim as usize, 0);
        parent_index
    }

    pub(crate) fn register_coords(&self, shape: &[u32], index: &[u32]) -> Dims {
        let parent_shape = self.parent_shape(shape);
        self.erase_dim(
            &self
                .parent
                .register_coords_at(&parent_shape, &self.parent_index(index)),
        )
    }

    pub(crate) fn owner_at(&self, shape: &[u32], index: &[u32]) -> Owner {
        let parent_shape = self.parent_shape(shape);
        let mut owner = self
            .parent
            .owner_at(&parent_shape, &self.parent_index(index));
        // Registers are dense over the remaining dimensions.
        owner.offset = linearize(
            &self.register_coords(shape, index),
            &self.elems_per_thread(shape),
            &self.order(),
        );
        owner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlockedLayout, CtaLayout, LayoutConfig};

    #[test]
    fn test_slice_rank_and_order() {
        let config = LayoutConfig::new(4, 32, 1);
        let parent = BlockedLayout::default_for(&[16, 32, 8], &config).unwrap();
        let slice = SliceLayout::new(1, parent).unwrap();
        assert_eq!(slice.rank(), 2);
        assert_eq!(slice.order(), Dims::from_slice(&[1, 0]));
        assert!(SliceLayout::new(3, slice.parent.as_ref().clone()).is_err());
    }

    #[test]
    fn test_slice_matches_parent_ownership() {
        for num_warps in [1u32, 2, 4] {
            let config = LayoutConfig::new(num_warps, 32, 1);
            for (shape, dim) in [([16u32, 16], 0u32), ([16, 16], 1), ([64, 8], 0), ([4, 128], 1)] {
                let parent = Layout::Blocked(BlockedLayout::default_for(&shape, &config).unwrap());
                let slice = Layout::Slice(SliceLayout::new(dim, parent.clone()).unwrap());
                let kept = shape[1 - dim as usize];
                let parent_shape: [u32; 2] = if dim == 0 { [1, kept] } else { [kept, 1] };
                for i in 0..kept {
                    let parent_index: [u32; 2] = if dim == 0 { [0, i] } else { [i, 0] };
                    let from_parent = parent.owner_at(&parent_shape, &parent_index);
                    let from_slice = slice.owner(&[kept], u64::from(i)).unwrap();
                    assert_eq!(from_slice, from_parent);
                }
            }
        }
    }

    #[test]
    fn test_slice_offsets_are_dense() {
        let parent = BlockedLayout::new(
            Dims::from_slice(&[2, 4]),
            Dims::from_slice(&[8, 8]),
            Dims::from_slice(&[4, 1]),
            Dims::from_slice(&[1, 0]),
            CtaLayout::single(2),
            &LayoutConfig::new(4, 64, 1),
        )
        .unwrap();
        let slice = Layout::Slice(SliceLayout::new(1, parent).unwrap());
        let total = slice.total_elems_per_thread(&[64]).unwrap();
        assert_eq!(total, 2);
        let mut offsets: Vec<u32> = (0..64)
            .map(|i| slice.owner(&[64], i).unwrap().offset)
            .collect();
        offsets.sort_unstable();
        offsets.dedup();
        assert_eq!(offsets, vec![0, 1]);
    }

    #[test]
    fn test_slice_elems_per_thread() {
        let config = LayoutConfig::new(2, 32, 1);
        let parent = Layout::Blocked(BlockedLayout::default_for(&[16, 16], &config).unwrap());
        // tpw [2, 16], wpc [2, 1]: each lane holds one of 16 columns.
        let slice = Layout::Slice(SliceLayout::new(0, parent).unwrap());
        assert_eq!(slice.elems_per_thread(&[16]).unwrap(), Dims::from_slice(&[1]));
        assert_eq!(slice.threads_per_warp(), Dims::from_slice(&[16]));
        assert_eq!(slice.warps_per_cta(), Dims::from_slice(&[1]));
    }
}
