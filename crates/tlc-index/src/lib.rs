//! Typed indices and index-addressed vectors for TLC.
//!
//! Compiler data structures in TLC live in arenas and refer to each other
//! through small copyable indices instead of pointers. This crate provides
//! the [`Idx`] trait, the [`define_index!`] macro for declaring new index
//! types, and [`IndexVec`], a vector that can only be indexed by its
//! matching index type.
//!
//! Crates using [`define_index!`] must depend on `serde`, since the generated
//! types derive `Serialize` and `Deserialize`.

#![warn(missing_docs)]

use std::fmt;
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};

/// A type usable as a dense index into an [`IndexVec`].
pub trait Idx: Copy + Eq + std::hash::Hash + fmt::Debug + 'static {
    /// Create an index from a raw `usize`.
    fn new(idx: usize) -> Self;

    /// Get the raw `usize` value of this index.
    fn index(self) -> usize;
}

impl Idx for usize {
    fn new(idx: usize) -> Self {
        idx
    }

    fn index(self) -> usize {
        self
    }
}

/// Declare one or more `u32`-backed index types implementing [`Idx`].
#[macro_export]
macro_rules! define_index {
    ($($(#[$attr:meta])* $vis:vis struct $name:ident;)*) => {
        $(
            $(#[$attr])*
            #[derive(
                Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
                ::serde::Serialize, ::serde::Deserialize,
            )]
            #[serde(transparent)]
            $vis struct $name(u32);

            impl $crate::Idx for $name {
                fn new(idx: usize) -> Self {
                    assert!(idx <= u32::MAX as usize, "index overflow");
                    Self(idx as u32)
                }

                fn index(self) -> usize {
                    self.0 as usize
                }
            }

            impl ::std::fmt::Debug for $name {
                fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                    write!(f, "{}({})", stringify!($name), self.0)
                }
            }
        )*
    };
}

/// A vector indexed by a typed index `I`.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexVec<I: Idx, T> {
    raw: Vec<T>,
    #[serde(skip)]
    _marker: PhantomData<fn(&I)>,
}

impl<I: Idx, T> IndexVec<I, T> {
    /// Create an empty vector.
    #[must_use]
    pub fn new() -> Self {
        Self {
            raw: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Create an empty vector with room for `capacity` elements.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            raw: Vec::with_capacity(capacity),
            _marker: PhantomData,
        }
    }

    /// Push a value, returning its index.
    pub fn push(&mut self, value: T) -> I {
        let idx = I::new(self.raw.len());
        self.raw.push(value);
        idx
    }

    /// The index the next pushed value will receive.
    #[must_use]
    pub fn next_index(&self) -> I {
        I::new(self.raw.len())
    }

    /// Get a value by index.
    #[must_use]
    pub fn get(&self, idx: I) -> Option<&T> {
        self.raw.get(idx.index())
    }

    /// Get a mutable value by index.
    pub fn get_mut(&mut self, idx: I) -> Option<&mut T> {
        self.raw.get_mut(idx.index())
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Whether the vector is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Iterate over values.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.raw.iter()
    }

    /// Iterate mutably over values.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.raw.iter_mut()
    }

    /// Iterate over `(index, value)` pairs.
    pub fn iter_enumerated(&self) -> impl Iterator<Item = (I, &T)> + '_ {
        self.raw.iter().enumerate().map(|(i, v)| (I::new(i), v))
    }

    /// Iterate over all valid indices.
    pub fn indices(&self) -> impl Iterator<Item = I> + 'static {
        (0..self.raw.len()).map(I::new)
    }

    /// View the underlying storage.
    #[must_use]
    pub fn raw(&self) -> &[T] {
        &self.raw
    }
}

impl<I: Idx, T> Default for IndexVec<I, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Idx, T: fmt::Debug> fmt::Debug for IndexVec<I, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter_enumerated()).finish()
    }
}

impl<I: Idx, T> Index<I> for IndexVec<I, T> {
    type Output = T;

    fn index(&self, idx: I) -> &T {
        &self.raw[idx.index()]
    }
}

impl<I: Idx, T> IndexMut<I> for IndexVec<I, T> {
    fn index_mut(&mut self, idx: I) -> &mut T {
        &mut self.raw[idx.index()]
    }
}

impl<I: Idx, T> FromIterator<T> for IndexVec<I, T> {
    fn from_iter<It: IntoIterator<Item = T>>(iter: It) -> Self {
        Self {
            raw: iter.into_iter().collect(),
            _marker: PhantomData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    define_index! {
        /// Test index.
        pub struct NodeId;
    }

    #[test]
    fn test_push_and_index() {
        let mut vec: IndexVec<NodeId, &str> = IndexVec::new();
        let a = vec.push("a");
        let b = vec.push("b");

        assert_eq!(vec[a], "a");
        assert_eq!(vec[b], "b");
        assert_eq!(b.index(), 1);
        assert_eq!(vec.next_index(), NodeId::new(2));
    }

    #[test]
    fn test_iter_enumerated() {
        let vec: IndexVec<NodeId, u32> = [10, 20, 30].into_iter().collect();
        let pairs: Vec<_> = vec.iter_enumerated().map(|(i, v)| (i.index(), *v)).collect();
        assert_eq!(pairs, vec![(0, 10), (1, 20), (2, 30)]);
    }

    #[test]
    fn test_debug_format() {
        assert_eq!(format!("{:?}", NodeId::new(7)), "NodeId(7)");
    }
}
