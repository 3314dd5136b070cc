//! Server nodes: identity, reference count and parent back-reference.
//!
//! Nodes live in a [`NodeArena`] owned by the node graph. Attach and detach
//! are crate-private: only the group and node-graph code may change a node's
//! place in the tree.

#![forbid(unsafe_code)]

use crate::error::GraphError;
use crate::group::Group;
use crate::invariant_ppt::{assert_invariant, PARENT_EDGE_COUNTED};
use crate::pool::Block;
use crate::synth::Synth;
use std::fmt;

/// Process-wide node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub i32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parameter slot address: symbolic name or direct index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Slot<'a> {
    /// Resolved through the prototype's parameter table.
    Name(&'a str),
    /// Used as-is.
    Index(usize),
}

impl<'a> From<&'a str> for Slot<'a> {
    fn from(name: &'a str) -> Self {
        Slot::Name(name)
    }
}

impl From<usize> for Slot<'_> {
    fn from(index: usize) -> Self {
        Slot::Index(index)
    }
}

impl fmt::Display for Slot<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Name(name) => write!(f, "'{}'", name),
            Slot::Index(index) => write!(f, "#{}", index),
        }
    }
}

/// Generation-checked arena handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NodeKey {
    index: u32,
    generation: u32,
}

/// The two node variants.
#[derive(Debug)]
pub enum NodeKind {
    /// Leaf node running a synth instance.
    Synth(Synth),
    /// Internal node owning children.
    Group(Group),
}

/// A node of the synthesis tree.
#[derive(Debug)]
pub struct ServerNode {
    id: NodeId,
    parent: Option<NodeKey>,
    prev: Option<NodeKey>,
    next: Option<NodeKey>,
    use_count: u32,
    block: Option<Block>,
    kind: NodeKind,
}

impl ServerNode {
    pub(crate) fn new(id: NodeId, kind: NodeKind, block: Block) -> Self {
        Self {
            id,
            parent: None,
            prev: None,
            next: None,
            use_count: 0,
            block: Some(block),
            kind,
        }
    }

    /// The node's id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// True for leaf nodes.
    pub fn is_synth(&self) -> bool {
        matches!(self.kind, NodeKind::Synth(_))
    }

    /// True while the node has a parent.
    pub fn is_attached(&self) -> bool {
        self.parent.is_some()
    }

    /// Strong references: one for the parent edge plus one per external
    /// [`NodeRef`](crate::node_graph::NodeRef).
    pub fn use_count(&self) -> u32 {
        self.use_count
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn as_synth(&self) -> Option<&Synth> {
        match &self.kind {
            NodeKind::Synth(synth) => Some(synth),
            NodeKind::Group(_) => None,
        }
    }

    pub fn as_group(&self) -> Option<&Group> {
        match &self.kind {
            NodeKind::Group(group) => Some(group),
            NodeKind::Synth(_) => None,
        }
    }

    /// Write a parameter slot.
    ///
    /// Groups accept and ignore every slot.
    pub fn set<'a>(&mut self, slot: impl Into<Slot<'a>>, value: f32) -> Result<(), GraphError> {
        match &mut self.kind {
            NodeKind::Synth(synth) => synth.set(slot, value),
            NodeKind::Group(_) => Ok(()),
        }
    }

    pub(crate) fn parent(&self) -> Option<NodeKey> {
        self.parent
    }

    pub(crate) fn prev_sibling(&self) -> Option<NodeKey> {
        self.prev
    }

    /// Next sibling while attached. A detached node awaiting destruction
    /// reuses the link to chain the teardown work list.
    pub(crate) fn next_sibling(&self) -> Option<NodeKey> {
        self.next
    }

    pub(crate) fn set_siblings(&mut self, prev: Option<NodeKey>, next: Option<NodeKey>) {
        self.prev = prev;
        self.next = next;
    }

    pub(crate) fn set_prev(&mut self, prev: Option<NodeKey>) {
        self.prev = prev;
    }

    pub(crate) fn set_next(&mut self, next: Option<NodeKey>) {
        self.next = next;
    }

    pub(crate) fn kind_mut(&mut self) -> &mut NodeKind {
        &mut self.kind
    }

    pub(crate) fn group_mut(&mut self) -> Option<&mut Group> {
        match &mut self.kind {
            NodeKind::Group(group) => Some(group),
            NodeKind::Synth(_) => None,
        }
    }

    pub(crate) fn take_block(&mut self) -> Option<Block> {
        self.block.take()
    }

    /// Attach to `parent`; the parent edge holds one count unit.
    pub(crate) fn set_parent(&mut self, parent: NodeKey) {
        assert_invariant(
            PARENT_EDGE_COUNTED,
            self.parent.is_none(),
            "node attached while it already has a parent",
            Some("set_parent"),
        );
        self.add_ref();
        self.parent = Some(parent);
    }

    /// Detach from the parent and drop the edge's count unit. Returns true when
    /// no reference remains and the node must be destroyed.
    pub(crate) fn clear_parent(&mut self) -> bool {
        self.parent = None;
        self.release()
    }

    pub(crate) fn add_ref(&mut self) {
        self.use_count += 1;
    }

    /// Drop one count unit. Returns true when the count reached zero.
    pub(crate) fn release(&mut self) -> bool {
        assert_invariant(
            PARENT_EDGE_COUNTED,
            self.use_count > 0,
            "release on a node without references",
            Some("release"),
        );
        self.use_count -= 1;
        self.use_count == 0
    }
}

struct Entry {
    generation: u32,
    node: Option<ServerNode>,
}

/// Slot storage for every live node.
///
/// Every slot is reserved up front; the arena never grows, so inserting and
/// removing nodes never touches the system allocator.
pub(crate) struct NodeArena {
    entries: Vec<Entry>,
    vacant: Vec<u32>,
    capacity: usize,
}

impl NodeArena {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            vacant: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn is_full(&self) -> bool {
        self.vacant.is_empty() && self.entries.len() >= self.capacity
    }

    /// Store `node`, handing it back when every slot is taken.
    pub(crate) fn insert(&mut self, node: ServerNode) -> Result<NodeKey, ServerNode> {
        if let Some(index) = self.vacant.pop() {
            let entry = &mut self.entries[index as usize];
            entry.node = Some(node);
            return Ok(NodeKey {
                index,
                generation: entry.generation,
            });
        }
        if self.entries.len() >= self.capacity {
            return Err(node);
        }
        let index = self.entries.len() as u32;
        self.entries.push(Entry {
            generation: 0,
            node: Some(node),
        });
        Ok(NodeKey {
            index,
            generation: 0,
        })
    }

    pub(crate) fn get(&self, key: NodeKey) -> Option<&ServerNode> {
        self.entries
            .get(key.index as usize)
            .filter(|entry| entry.generation == key.generation)
            .and_then(|entry| entry.node.as_ref())
    }

    pub(crate) fn get_mut(&mut self, key: NodeKey) -> Option<&mut ServerNode> {
        self.entries
            .get_mut(key.index as usize)
            .filter(|entry| entry.generation == key.generation)
            .and_then(|entry| entry.node.as_mut())
    }

    /// Take the node out; stale keys to this slot stop resolving.
    pub(crate) fn remove(&mut self, key: NodeKey) -> Option<ServerNode> {
        let entry = self
            .entries
            .get_mut(key.index as usize)
            .filter(|entry| entry.generation == key.generation)?;
        let node = entry.node.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.vacant.push(key.index);
        Some(node)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len() - self.vacant.len()
    }
}

impl fmt::Debug for NodeArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeArena")
            .field("live", &self.len())
            .field("slots", &self.entries.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
