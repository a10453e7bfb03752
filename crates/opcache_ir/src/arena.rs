//! Dense, ID-indexed node storage for pooled images.
//!
//! Nodes are only ever appended, so an ID handed out by [`Arena::alloc`] stays
//! valid for the life of the arena. Relinking a copied graph therefore means
//! rewriting IDs, never addresses.

use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::ops::Index;

/// Opaque index types usable as arena keys.
pub trait ArenaId: Copy {
    /// Creates an ID from a raw index.
    fn from_raw(index: u32) -> Self;

    /// Returns the raw index.
    fn as_raw(self) -> u32;
}

/// Append-only storage addressed by `I`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arena<I: ArenaId, T> {
    nodes: Vec<T>,
    #[serde(skip)]
    _id: PhantomData<I>,
}

impl<I: ArenaId, T> Default for Arena<I, T> {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

impl<I: ArenaId, T> Arena<I, T> {
    /// Creates an empty arena with room for `capacity` nodes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
            _id: PhantomData,
        }
    }

    /// Appends a node and returns its ID.
    pub fn alloc(&mut self, node: T) -> I {
        let id = I::from_raw(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    /// Returns the node with the given ID, or `None` if it is out of range.
    pub fn get(&self, id: I) -> Option<&T> {
        self.nodes.get(id.as_raw() as usize)
    }

    /// Returns the number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if the arena holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterates over `(ID, &node)` pairs in allocation order.
    pub fn iter(&self) -> impl Iterator<Item = (I, &T)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (I::from_raw(i as u32), node))
    }
}

impl<I: ArenaId, T> Index<I> for Arena<I, T> {
    type Output = T;

    /// # Panics
    ///
    /// Panics if the ID did not come from this arena.
    fn index(&self, id: I) -> &T {
        &self.nodes[id.as_raw() as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ConstId;

    #[test]
    fn ids_are_dense_and_stable() {
        let mut arena: Arena<ConstId, &str> = Arena::default();
        let a = arena.alloc("a");
        let b = arena.alloc("b");
        assert_eq!((a.as_raw(), b.as_raw()), (0, 1));
        assert_eq!(arena[a], "a");
        assert_eq!(arena[b], "b");
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn get_out_of_range_is_none() {
        let arena: Arena<ConstId, u8> = Arena::with_capacity(4);
        assert!(arena.is_empty());
        assert!(arena.get(ConstId::from_raw(0)).is_none());
    }

    #[test]
    fn iter_in_allocation_order() {
        let mut arena: Arena<ConstId, u32> = Arena::default();
        arena.alloc(7);
        arena.alloc(9);
        let seen: Vec<_> = arena.iter().map(|(id, v)| (id.as_raw(), *v)).collect();
        assert_eq!(seen, vec![(0, 7), (1, 9)]);
    }

    #[test]
    fn serde_keeps_nodes() {
        let mut arena: Arena<ConstId, String> = Arena::default();
        arena.alloc("first".to_string());
        let json = serde_json::to_string(&arena).unwrap();
        let back: Arena<ConstId, String> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, arena);
    }
}
