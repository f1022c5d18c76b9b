//! The search-tree contract shared by every enumerable system and every scheduler.
//!
//! A system describes a finite search tree: an indexed set of roots and a pure expansion
//! function. Schedulers never look inside a node; they only move it between workers and hand
//! it back to [`EnumerableSystem::expand`] exactly once.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::ExpandError;
use crate::graph::NodeId;

/// Output buffer of one expansion: child nodes to schedule and items to report.
///
/// Schedulers reuse one buffer per worker; systems only append.
#[derive(Debug)]
pub struct Expansion<Node, Item> {
    children: Vec<Node>,
    items: Vec<Item>,
}

impl<Node, Item> Default for Expansion<Node, Item> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Node, Item> Expansion<Node, Item> {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self {
            children: Vec::new(),
            items: Vec::new(),
        }
    }

    /// Schedules a child node.
    #[inline]
    pub fn push_child(&mut self, child: Node) {
        self.children.push(child);
    }

    /// Reports an item.
    #[inline]
    pub fn emit(&mut self, item: Item) {
        self.items.push(item);
    }

    /// Children pushed so far.
    pub fn children(&self) -> &[Node] {
        &self.children
    }

    /// Items emitted so far.
    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// Removes and yields all children, in the order they were pushed.
    pub fn drain_children(&mut self) -> std::vec::Drain<'_, Node> {
        self.children.drain(..)
    }

    /// Removes and yields all items.
    pub fn drain_items(&mut self) -> std::vec::Drain<'_, Item> {
        self.items.drain(..)
    }

    /// Empties both buffers, keeping their capacity.
    pub fn clear(&mut self) {
        self.children.clear();
        self.items.clear();
    }
}

/// Items cross process boundaries as plain lists of vertex ids.
pub trait WireItem: Sized + Send + 'static {
    /// Encodes the item as vertex ids.
    fn to_wire(&self) -> Vec<u64>;

    /// Decodes an item; `None` if an id does not fit.
    fn from_wire(words: &[u64]) -> Option<Self>;
}

impl<N: NodeId> WireItem for Vec<N> {
    fn to_wire(&self) -> Vec<u64> {
        self.iter().map(|v| v.to_u64()).collect()
    }

    fn from_wire(words: &[u64]) -> Option<Self> {
        words.iter().map(|&w| N::try_from_u64(w)).collect()
    }
}

/// A set system whose maximal members are enumerated by walking a search tree.
///
/// Implementations must be pure: `root(i)` and `expand(node)` depend only on their arguments
/// and the system's immutable state (graph, parameters). The tree must be finite.
pub trait EnumerableSystem: Send + Sync {
    /// One unexplored branch of the search tree. Self-contained and movable across threads;
    /// serializable so that a distributed run can hand a subtree to another rank.
    type Node: Clone + Send + Serialize + DeserializeOwned + 'static;
    /// An emitted maximal structure.
    type Item: WireItem;

    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Number of root slots. Roots are addressed by index so that they can be split into
    /// contiguous chunks.
    fn root_count(&self) -> usize;

    /// Materialises root `index`; `None` if that root is pruned and has nothing to explore.
    fn root(&self, index: usize) -> Option<Self::Node>;

    /// Expands `node`, appending its children and any items to `out`.
    ///
    /// # Errors
    /// An error is fatal to the whole run.
    fn expand(
        &self,
        node: Self::Node,
        out: &mut Expansion<Self::Node, Self::Item>,
    ) -> Result<(), ExpandError>;

    /// All present roots, in index order.
    fn roots(&self) -> impl Iterator<Item = Self::Node> + '_
    where
        Self: Sized,
    {
        (0..self.root_count()).filter_map(move |i| self.root(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expansion_drains_in_push_order() {
        let mut out: Expansion<u8, Vec<u32>> = Expansion::new();
        out.push_child(1);
        out.push_child(2);
        out.emit(vec![3, 4]);
        assert_eq!(out.children(), &[1, 2]);
        assert_eq!(out.drain_children().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(out.items().len(), 1);
        out.clear();
        assert!(out.items().is_empty());
    }

    #[test]
    fn wire_item_round_trip_and_overflow() {
        let item: Vec<u32> = vec![0, 7, 42];
        assert_eq!(Vec::<u32>::from_wire(&item.to_wire()), Some(item));
        assert_eq!(Vec::<u32>::from_wire(&[u64::MAX]), None);
    }
}
