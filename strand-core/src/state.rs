//! The immutable state tree
//!
//! A [`StateTree`] is an ordered mapping from slice name to slice state.
//! Slice states are plain value types erased behind the [`SliceState`]
//! trait, which carries structural equality and `Any` downcasting. Every
//! commit produces a brand-new tree that shares the `Arc`s of unchanged
//! slices; published trees are never mutated, so readers hold no locks.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use strand_types::{SliceName, Version};

/// A slice's state, erased for storage in the tree
///
/// Implemented automatically for every `Debug + PartialEq + Send + Sync +
/// 'static` value type; slice states never contain shared mutable
/// substructure.
pub trait SliceState: Any + Debug + Send + Sync {
    /// Downcast support
    fn as_any(&self) -> &dyn Any;

    /// Structural equality against another erased slice state
    fn eq_slice(&self, other: &dyn SliceState) -> bool;
}

impl<T> SliceState for T
where
    T: Any + Debug + PartialEq + Send + Sync,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_slice(&self, other: &dyn SliceState) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .map_or(false, |other| self == other)
    }
}

/// Ordered, immutable mapping from slice name to slice state
#[derive(Debug, Clone, Default)]
pub struct StateTree {
    slices: BTreeMap<SliceName, Arc<dyn SliceState>>,
}

impl StateTree {
    /// The empty tree
    pub fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn from_slices(slices: BTreeMap<SliceName, Arc<dyn SliceState>>) -> Self {
        Self { slices }
    }

    pub(crate) fn clone_slices(&self) -> BTreeMap<SliceName, Arc<dyn SliceState>> {
        self.slices.clone()
    }

    /// Typed view of a slice's state
    pub fn slice<T: Any>(&self, name: &SliceName) -> Option<&T> {
        self.slices.get(name)?.as_any().downcast_ref::<T>()
    }

    /// Erased view of a slice's state
    pub fn slice_dyn(&self, name: &SliceName) -> Option<&Arc<dyn SliceState>> {
        self.slices.get(name)
    }

    /// Whether the slice has been initialized
    pub fn contains(&self, name: &SliceName) -> bool {
        self.slices.contains_key(name)
    }

    /// Slice names in tree order
    pub fn names(&self) -> impl Iterator<Item = &SliceName> {
        self.slices.keys()
    }

    /// Slices in tree order
    pub fn iter(&self) -> impl Iterator<Item = (&SliceName, &Arc<dyn SliceState>)> {
        self.slices.iter()
    }

    /// Number of initialized slices
    pub fn len(&self) -> usize {
        self.slices.len()
    }

    /// Whether no slice has been initialized yet
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }
}

impl PartialEq for StateTree {
    fn eq(&self, other: &Self) -> bool {
        self.slices.len() == other.slices.len()
            && self
                .slices
                .iter()
                .zip(other.slices.iter())
                .all(|((name_a, state_a), (name_b, state_b))| {
                    name_a == name_b && state_a.eq_slice(state_b.as_ref())
                })
    }
}

/// A published tree plus the version it was committed at
#[derive(Debug, Clone)]
pub(crate) struct Committed {
    pub version: Version,
    pub tree: Arc<StateTree>,
}

impl Committed {
    pub fn genesis() -> Self {
        Self {
            version: Version::ZERO,
            tree: Arc::new(StateTree::empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Counter {
        value: i64,
    }

    fn tree_with(name: &str, value: i64) -> StateTree {
        let mut slices: BTreeMap<SliceName, Arc<dyn SliceState>> = BTreeMap::new();
        slices.insert(SliceName::new(name), Arc::new(Counter { value }));
        StateTree::from_slices(slices)
    }

    #[test]
    fn test_typed_slice_access() {
        let tree = tree_with("counter", 3);
        let name = SliceName::new("counter");

        assert_eq!(tree.slice::<Counter>(&name), Some(&Counter { value: 3 }));
        assert!(tree.slice::<String>(&name).is_none());
        assert!(tree.slice::<Counter>(&SliceName::new("missing")).is_none());
    }

    #[test]
    fn test_structural_equality() {
        assert_eq!(tree_with("counter", 3), tree_with("counter", 3));
        assert_ne!(tree_with("counter", 3), tree_with("counter", 4));
        assert_ne!(tree_with("counter", 3), tree_with("other", 3));
    }

    #[test]
    fn test_empty_tree() {
        let tree = StateTree::empty();
        assert!(tree.is_empty());
        assert_eq!(tree.len(), 0);
        assert_eq!(tree, StateTree::empty());
    }

    #[test]
    fn test_slice_order_is_name_order() {
        let mut slices: BTreeMap<SliceName, Arc<dyn SliceState>> = BTreeMap::new();
        slices.insert(SliceName::new("zeta"), Arc::new(Counter { value: 1 }));
        slices.insert(SliceName::new("alpha"), Arc::new(Counter { value: 2 }));
        let tree = StateTree::from_slices(slices);

        let names: Vec<&str> = tree.names().map(|n| n.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
