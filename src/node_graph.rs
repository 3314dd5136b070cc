//! Node graph: owns the root group and applies edits atomically.
//!
//! Every edit runs its fallible steps (id check, prototype lookup, constraint
//! resolution, slot and pool reservation, instantiation) before the first
//! mutation, so a failed edit leaves the pool, the registry and the tree
//! untouched.
//!
//! Node slots and the registry are sized once from [`ServerConfig::max_nodes`]
//! and group children are linked through the nodes, so edits do not allocate.
//! The only system allocation on the edit path is whatever a prototype's unit
//! graph builder performs.

#![forbid(unsafe_code)]

use crate::config::ServerConfig;
use crate::error::GraphError;
use crate::event::{new_event_queue, NodeEvent};
use crate::group::{self, Group, GroupKind, NodePosition, Placement, PositionConstraint};
use crate::invariant_ppt::{
    assert_invariant, DESTROY_DETACHED, EDIT_REJECTS_INVALID, POOL_BOUNDED, REGISTRY_UNIQUE_IDS,
};
use crate::node::{NodeArena, NodeId, NodeKey, NodeKind, ServerNode, Slot};
use crate::pool::{shared_pool, Block, NodeAllocator, SharedPool};
use crate::prototype::{sine_definition, SynthFactory};
use crate::registry::NodeRegistry;
use rtrb::{Consumer, Producer};
use std::fmt::Write as _;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Id of the root group every tree hangs from.
pub const ROOT_NODE_ID: NodeId = NodeId(0);

static NEXT_GRAPH_SERIAL: AtomicU64 = AtomicU64::new(1);

/// An external strong reference to a node.
///
/// Obtained from [`NodeGraph::retain`] and handed back through
/// [`NodeGraph::release`] of the same graph. The token is move-only, so each
/// reference is released exactly once. A retained node freed from the tree
/// stays registered, detached, until its last reference is released.
///
/// Dropping a `NodeRef` without releasing it keeps its node and pool block
/// alive until the graph itself is dropped.
#[must_use = "a retained node stays alive until the reference is released"]
#[derive(Debug, PartialEq, Eq)]
pub struct NodeRef {
    graph: u64,
    id: NodeId,
    key: NodeKey,
}

impl NodeRef {
    pub fn id(&self) -> NodeId {
        self.id
    }
}

/// The synthesis tree with its pool, registry and prototype factory.
///
/// Not `Send`: the pool is shared through `Rc<RefCell<_>>`, so one owner
/// serializes every edit.
pub struct NodeGraph {
    pub(crate) arena: NodeArena,
    registry: NodeRegistry,
    memory: NodeAllocator<u8>,
    factory: SynthFactory,
    pub(crate) root: NodeKey,
    events: Producer<NodeEvent>,
    serial: u64,
}

impl NodeGraph {
    /// Build a graph with its own pool of `config.pool_capacity` bytes.
    ///
    /// Returns the graph and the consumer side of its event queue.
    pub fn new(config: &ServerConfig) -> Result<(Self, Consumer<NodeEvent>), GraphError> {
        Self::with_pool(shared_pool(config.pool_capacity), config)
    }

    /// Build a graph drawing node memory from an existing pool.
    ///
    /// The factory starts with the built-in `sine` prototype at
    /// `config.sample_rate`.
    pub fn with_pool(
        pool: SharedPool,
        config: &ServerConfig,
    ) -> Result<(Self, Consumer<NodeEvent>), GraphError> {
        let memory = NodeAllocator::new(pool);
        let block = memory.allocate(group_footprint())?;
        let mut arena = NodeArena::with_capacity(config.max_nodes);
        let root = match arena.insert(ServerNode::new(
            ROOT_NODE_ID,
            NodeKind::Group(Group::new(GroupKind::Sequential)),
            block,
        )) {
            Ok(root) => root,
            Err(mut node) => {
                if let Some(block) = node.take_block() {
                    memory.deallocate(block);
                }
                return Err(slots_exhausted());
            }
        };
        // The graph itself holds the root's only reference.
        if let Some(node) = arena.get_mut(root) {
            node.add_ref();
        }
        let mut registry = NodeRegistry::with_capacity(config.max_nodes);
        registry.insert(ROOT_NODE_ID, root)?;

        let mut factory = SynthFactory::new();
        factory.register_definition(sine_definition(config.sample_rate));

        let (events, consumer) = new_event_queue(config.event_queue_capacity);
        let graph = Self {
            arena,
            registry,
            memory,
            factory,
            root,
            events,
            serial: NEXT_GRAPH_SERIAL.fetch_add(1, Ordering::Relaxed),
        };
        Ok((graph, consumer))
    }

    pub fn root_id(&self) -> NodeId {
        ROOT_NODE_ID
    }

    pub fn factory(&self) -> &SynthFactory {
        &self.factory
    }

    pub fn factory_mut(&mut self) -> &mut SynthFactory {
        &mut self.factory
    }

    /// An adapter over the pool backing this graph's nodes.
    pub fn allocator(&self) -> NodeAllocator<u8> {
        self.memory.clone()
    }

    /// Bytes of node memory currently in use, root group included.
    pub fn pool_in_use(&self) -> usize {
        self.memory.pool().borrow().in_use()
    }

    /// Number of live nodes, root group included.
    pub fn node_count(&self) -> usize {
        self.registry.len()
    }

    /// Live node ids in ascending order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.registry.ids().collect()
    }

    /// Instantiate prototype `prototype` as node `id` and place it.
    pub fn create_synth(
        &mut self,
        id: NodeId,
        prototype: &str,
        constraint: PositionConstraint,
    ) -> Result<(), GraphError> {
        self.check_unused(id)?;
        let prototype = self.factory.get(prototype)?;
        let placement = self.resolve(constraint)?;
        self.check_room()?;
        let block = self.allocate(prototype.instance_size())?;
        let synth = match prototype.create_instance(id) {
            Ok(synth) => synth,
            Err(err) => {
                self.memory.deallocate(block);
                warn!(node = %id, prototype = prototype.name(), error = %err, "synth instantiation failed");
                return Err(err);
            }
        };
        self.graft(ServerNode::new(id, NodeKind::Synth(synth), block), placement)
    }

    /// Create an empty group as node `id` and place it.
    pub fn create_group(
        &mut self,
        id: NodeId,
        kind: GroupKind,
        constraint: PositionConstraint,
    ) -> Result<(), GraphError> {
        self.check_unused(id)?;
        let placement = self.resolve(constraint)?;
        self.check_room()?;
        let block = self.allocate(group_footprint())?;
        self.graft(
            ServerNode::new(id, NodeKind::Group(Group::new(kind)), block),
            placement,
        )
    }

    /// Remove node `id` from the tree; it is destroyed unless retained.
    pub fn free(&mut self, id: NodeId) -> Result<(), GraphError> {
        let key = self.registry.get(id)?;
        if key == self.root {
            return Err(rejected("the root group cannot be freed"));
        }
        let orphaned =
            group::detach(&mut self.arena, key).ok_or_else(|| rejected("node is not attached"))?;
        debug!(node = %id, "freed node");
        if orphaned {
            self.destroy(key);
        }
        Ok(())
    }

    /// Free every child of group `id`, keeping the group itself.
    pub fn free_children(&mut self, id: NodeId) -> Result<(), GraphError> {
        let key = self.registry.get(id)?;
        let mut cursor = self
            .arena
            .get_mut(key)
            .and_then(ServerNode::group_mut)
            .map(Group::take_head)
            .ok_or_else(|| rejected("free_children target is not a group"))?;
        let mut count = 0usize;
        while let Some(child) = cursor {
            let Some(node) = self.arena.get_mut(child) else {
                break;
            };
            cursor = node.next_sibling();
            node.set_siblings(None, None);
            count += 1;
            if node.clear_parent() {
                self.destroy(child);
            }
        }
        debug!(group = %id, count, "freed group children");
        Ok(())
    }

    /// Relocate node `id` according to `constraint`.
    ///
    /// `replace` is rejected, as are targets inside the moved subtree. A
    /// detached, retained node is attached by a move.
    pub fn move_node(&mut self, id: NodeId, constraint: PositionConstraint) -> Result<(), GraphError> {
        let key = self.registry.get(id)?;
        if key == self.root {
            return Err(rejected("the root group cannot be moved"));
        }
        if constraint.position == NodePosition::Replace {
            return Err(rejected("replace cannot move an existing node"));
        }
        let target = self.registry.get(constraint.target)?;
        if group::is_within(&self.arena, target, key) {
            return Err(rejected("move target lies inside the moved node"));
        }
        let mut placement = group::resolve(&self.arena, target, constraint.position)?;
        // Anchored on the moved node itself: keep the anchor it had.
        if placement.before == Some(key) {
            placement.before = self.arena.get(key).and_then(ServerNode::next_sibling);
        }

        // Hold a reference so the node survives between detach and attach.
        if let Some(node) = self.arena.get_mut(key) {
            node.add_ref();
        }
        group::detach(&mut self.arena, key);
        let committed = group::commit(&mut self.arena, key, placement);
        if self.arena.get_mut(key).map_or(false, ServerNode::release) {
            self.destroy(key);
        }
        committed?;

        let parent = self.id_of(placement.parent);
        debug!(node = %id, parent = %parent, "moved node");
        self.emit(NodeEvent::Moved { node: id, parent });
        Ok(())
    }

    /// Write a parameter slot of node `id`. Groups ignore the write.
    pub fn set_parameter<'a>(
        &mut self,
        id: NodeId,
        slot: impl Into<Slot<'a>>,
        value: f32,
    ) -> Result<(), GraphError> {
        let key = self.registry.get(id)?;
        self.arena
            .get_mut(key)
            .ok_or(GraphError::NodeNotFound(id))?
            .set(slot, value)
    }

    pub fn lookup(&self, id: NodeId) -> Result<&ServerNode, GraphError> {
        let key = self.registry.get(id)?;
        self.arena.get(key).ok_or(GraphError::NodeNotFound(id))
    }

    /// Parent of node `id`, `None` when detached (or for the root).
    pub fn parent_of(&self, id: NodeId) -> Result<Option<NodeId>, GraphError> {
        Ok(self.lookup(id)?.parent().map(|parent| self.id_of(parent)))
    }

    /// Children of node `id` in sequence order; empty for synths.
    pub fn children(&self, id: NodeId) -> Result<Vec<NodeId>, GraphError> {
        let key = self.registry.get(id)?;
        Ok(group::children(&self.arena, key)
            .map(|child| self.id_of(child))
            .collect())
    }

    /// Take an external reference to node `id`.
    pub fn retain(&mut self, id: NodeId) -> Result<NodeRef, GraphError> {
        let key = self.registry.get(id)?;
        self.arena
            .get_mut(key)
            .ok_or(GraphError::NodeNotFound(id))?
            .add_ref();
        Ok(NodeRef {
            graph: self.serial,
            id,
            key,
        })
    }

    /// True when `node_ref` was issued by this graph.
    pub fn owns(&self, node_ref: &NodeRef) -> bool {
        node_ref.graph == self.serial
            && self.arena.get(node_ref.key).map(ServerNode::id) == Some(node_ref.id)
    }

    /// Give back an external reference. Destroys the node when it was the last
    /// one.
    ///
    /// A reference issued by another graph is rejected with
    /// [`GraphError::ForeignReference`] and consumed without effect.
    pub fn release(&mut self, node_ref: NodeRef) -> Result<(), GraphError> {
        if !self.owns(&node_ref) {
            warn!(node = %node_ref.id, "release of a reference from another graph");
            return Err(GraphError::ForeignReference(node_ref.id));
        }
        let NodeRef { id, key, .. } = node_ref;
        if self.arena.get_mut(key).map_or(false, ServerNode::release) {
            debug!(node = %id, "last reference released");
            self.destroy(key);
        }
        Ok(())
    }

    /// Render the tree as indented text, one node per line.
    pub fn dump_tree(&self) -> String {
        let mut out = String::new();
        let mut stack = vec![(self.root, 0usize)];
        while let Some((key, depth)) = stack.pop() {
            let Some(node) = self.arena.get(key) else {
                continue;
            };
            let indent = "   ".repeat(depth);
            match node.kind() {
                NodeKind::Group(group) => {
                    let kind = if group.is_parallel() { "parallel" } else { "sequential" };
                    let _ = writeln!(out, "{}{} group ({})", indent, node.id(), kind);
                    let children: Vec<NodeKey> = group::children(&self.arena, key).collect();
                    stack.extend(children.into_iter().rev().map(|child| (child, depth + 1)));
                }
                NodeKind::Synth(synth) => {
                    let _ = write!(out, "{}{} {}", indent, node.id(), synth.prototype_name());
                    for (index, value) in synth.controls().iter().enumerate() {
                        match synth.parameters().name(index) {
                            Some(name) => {
                                let _ = write!(out, " {}={}", name, value);
                            }
                            None => {
                                let _ = write!(out, " #{}={}", index, value);
                            }
                        }
                    }
                    out.push('\n');
                }
            }
        }
        out
    }

    fn check_unused(&self, id: NodeId) -> Result<(), GraphError> {
        if self.registry.contains(id) {
            assert_invariant(
                REGISTRY_UNIQUE_IDS,
                true,
                "duplicate id rejected",
                Some("NodeGraph::create"),
            );
            warn!(node = %id, "node id already in use");
            return Err(GraphError::DuplicateNodeId(id));
        }
        Ok(())
    }

    fn check_room(&self) -> Result<(), GraphError> {
        if self.arena.is_full() {
            return Err(slots_exhausted());
        }
        Ok(())
    }

    fn resolve(&self, constraint: PositionConstraint) -> Result<Placement, GraphError> {
        let target = self.registry.get(constraint.target)?;
        group::resolve(&self.arena, target, constraint.position)
    }

    fn allocate(&self, size: usize) -> Result<Block, GraphError> {
        let block = self.memory.allocate(size).map_err(|err| {
            warn!(size, error = %err, "node allocation failed");
            err
        })?;
        let pool = self.memory.pool().borrow();
        assert_invariant(
            POOL_BOUNDED,
            pool.in_use() <= pool.capacity(),
            "pool handed out more than its capacity",
            Some("NodeGraph::allocate"),
        );
        Ok(block)
    }

    /// Register a freshly built node and attach it at `placement`.
    fn graft(&mut self, node: ServerNode, placement: Placement) -> Result<(), GraphError> {
        let id = node.id();
        let is_synth = node.is_synth();
        let key = match self.arena.insert(node) {
            Ok(key) => key,
            Err(mut node) => {
                if let Some(block) = node.take_block() {
                    self.memory.deallocate(block);
                }
                return Err(slots_exhausted());
            }
        };
        if let Err(err) = self.registry.insert(id, key) {
            self.abandon(key);
            return Err(err);
        }
        let orphan = match group::commit(&mut self.arena, key, placement) {
            Ok(orphan) => orphan,
            Err(err) => {
                self.registry.remove(id);
                self.abandon(key);
                return Err(err);
            }
        };
        if let Some(orphan) = orphan {
            self.destroy(orphan);
        }

        let parent = self.id_of(placement.parent);
        debug!(node = %id, parent = %parent, is_synth, "created node");
        self.emit(NodeEvent::Created {
            node: id,
            parent,
            is_synth,
        });
        Ok(())
    }

    /// Drop a node that never became visible.
    fn abandon(&mut self, key: NodeKey) {
        if let Some(mut node) = self.arena.remove(key) {
            if let Some(block) = node.take_block() {
                self.memory.deallocate(block);
            }
        }
    }

    /// The single teardown routine: every destruction path ends here.
    ///
    /// Unregisters the node, releases its children's parent edges (cascading
    /// into children left without references) and returns its block. Nodes
    /// waiting to be torn down are chained through their free `next` links.
    fn destroy(&mut self, key: NodeKey) {
        let mut pending = Some(key);
        while let Some(key) = pending {
            let Some(mut node) = self.arena.remove(key) else {
                break;
            };
            pending = node.next_sibling();
            assert_invariant(
                DESTROY_DETACHED,
                !node.is_attached() && node.use_count() == 0,
                "node destroyed while attached or referenced",
                Some("NodeGraph::destroy"),
            );
            self.registry.remove(node.id());
            let mut cursor = node.group_mut().and_then(Group::take_head);
            while let Some(child_key) = cursor {
                let Some(child) = self.arena.get_mut(child_key) else {
                    break;
                };
                cursor = child.next_sibling();
                child.set_siblings(None, None);
                if child.clear_parent() {
                    child.set_next(pending);
                    pending = Some(child_key);
                }
            }
            if let Some(block) = node.take_block() {
                self.memory.deallocate(block);
            }
            debug!(node = %node.id(), "destroyed node");
            self.emit(NodeEvent::Destroyed { node: node.id() });
        }
    }

    fn emit(&mut self, event: NodeEvent) {
        if self.events.push(event).is_err() {
            warn!(
                event = event.description(),
                node = %event.node(),
                "node event queue full, dropping event"
            );
        }
    }

    fn id_of(&self, key: NodeKey) -> NodeId {
        self.arena.get(key).map_or(ROOT_NODE_ID, ServerNode::id)
    }
}

impl Drop for NodeGraph {
    fn drop(&mut self) {
        // Return the tree's memory to a pool that may outlive the graph.
        // Nodes still retained through a NodeRef keep their blocks.
        let root = self.root;
        if self.arena.get_mut(root).map_or(false, ServerNode::release) {
            self.destroy(root);
        }
    }
}

fn group_footprint() -> usize {
    mem::size_of::<ServerNode>()
}

fn rejected(reason: &'static str) -> GraphError {
    assert_invariant(EDIT_REJECTS_INVALID, true, reason, Some("NodeGraph"));
    warn!(reason, "edit rejected");
    GraphError::InvalidConstraint(reason)
}

fn slots_exhausted() -> GraphError {
    warn!("node slots exhausted");
    GraphError::OutOfMemory {
        requested: mem::size_of::<ServerNode>(),
    }
}
