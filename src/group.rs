//! Groups and position constraints.
//!
//! Placing a node is split in two steps: [`resolve`] validates a constraint
//! against the current tree without touching it, and [`commit`] applies the
//! resulting placement. Callers run every fallible step before committing, so
//! a rejected edit never leaves the tree partially mutated.
//!
//! A group's children form a doubly linked list threaded through the nodes
//! themselves (`prev`/`next` sibling links in the arena), so linking and
//! unlinking never allocate.

#![forbid(unsafe_code)]

use crate::error::GraphError;
use crate::invariant_ppt::{assert_invariant, EDIT_REJECTS_INVALID, TREE_LINKED};
use crate::node::{NodeArena, NodeId, NodeKey, ServerNode};
use std::iter;
use tracing::warn;

/// Execution semantics of a group's children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    /// Children run in sequence order.
    Sequential,
    /// Children have no ordering guarantee.
    Parallel,
}

/// An internal node owning an ordered sequence of children.
///
/// Each child link is strong: it accounts for the child's parent-edge count
/// unit.
#[derive(Debug)]
pub struct Group {
    kind: GroupKind,
    head: Option<NodeKey>,
    tail: Option<NodeKey>,
    len: usize,
}

impl Group {
    pub fn new(kind: GroupKind) -> Self {
        Self {
            kind,
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn kind(&self) -> GroupKind {
        self.kind
    }

    pub fn is_parallel(&self) -> bool {
        self.kind == GroupKind::Parallel
    }

    /// Number of direct children.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn head(&self) -> Option<NodeKey> {
        self.head
    }

    /// Forget every child, returning the first one. The children keep their
    /// sibling links; the caller walks and clears them.
    pub(crate) fn take_head(&mut self) -> Option<NodeKey> {
        self.tail = None;
        self.len = 0;
        self.head.take()
    }
}

/// Where a node goes relative to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePosition {
    /// First child of the target group.
    Head,
    /// Last child of the target group.
    Tail,
    /// Immediately before the target, in the target's parent.
    Before,
    /// Immediately after the target, in the target's parent.
    After,
    /// Into the target's slot; the target is detached.
    Replace,
    /// At an explicit slot of a parallel target group.
    Insert(usize),
}

/// A target node plus a position relative to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionConstraint {
    pub target: NodeId,
    pub position: NodePosition,
}

impl PositionConstraint {
    pub fn new(target: NodeId, position: NodePosition) -> Self {
        Self { target, position }
    }

    pub fn head(target: NodeId) -> Self {
        Self::new(target, NodePosition::Head)
    }

    pub fn tail(target: NodeId) -> Self {
        Self::new(target, NodePosition::Tail)
    }

    pub fn before(target: NodeId) -> Self {
        Self::new(target, NodePosition::Before)
    }

    pub fn after(target: NodeId) -> Self {
        Self::new(target, NodePosition::After)
    }

    pub fn replace(target: NodeId) -> Self {
        Self::new(target, NodePosition::Replace)
    }

    pub fn insert(target: NodeId, slot: usize) -> Self {
        Self::new(target, NodePosition::Insert(slot))
    }
}

/// A validated placement: link into `parent` ahead of `before` (at the end
/// for `None`), optionally taking over the slot of `replaced`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Placement {
    pub(crate) parent: NodeKey,
    pub(crate) before: Option<NodeKey>,
    pub(crate) replaced: Option<NodeKey>,
}

fn reject(reason: &'static str) -> GraphError {
    assert_invariant(EDIT_REJECTS_INVALID, true, reason, Some("apply_position"));
    warn!(reason, "position constraint rejected");
    GraphError::InvalidConstraint(reason)
}

fn target_group(arena: &NodeArena, key: NodeKey) -> Option<&Group> {
    arena.get(key).and_then(ServerNode::as_group)
}

fn target_group_mut(arena: &mut NodeArena, key: NodeKey) -> Option<&mut Group> {
    arena.get_mut(key).and_then(ServerNode::group_mut)
}

/// Children of `group` in sequence order; empty for synths.
pub(crate) fn children(arena: &NodeArena, group: NodeKey) -> impl Iterator<Item = NodeKey> + '_ {
    let head = target_group(arena, group).and_then(Group::head);
    iter::successors(head, move |&key| arena.get(key).and_then(ServerNode::next_sibling))
}

/// Validate `position` against `target` without mutating the tree.
pub(crate) fn resolve(
    arena: &NodeArena,
    target: NodeKey,
    position: NodePosition,
) -> Result<Placement, GraphError> {
    let target_node = arena.get(target).ok_or_else(|| reject("target is not live"))?;
    match position {
        NodePosition::Head | NodePosition::Tail => {
            let group = target_node
                .as_group()
                .ok_or_else(|| reject("head/tail target is not a group"))?;
            let before = if position == NodePosition::Head {
                group.head()
            } else {
                None
            };
            Ok(Placement {
                parent: target,
                before,
                replaced: None,
            })
        }
        NodePosition::Before | NodePosition::After | NodePosition::Replace => {
            let parent = target_node
                .parent()
                .ok_or_else(|| reject("target is not attached"))?;
            Ok(match position {
                NodePosition::Before => Placement {
                    parent,
                    before: Some(target),
                    replaced: None,
                },
                NodePosition::After => Placement {
                    parent,
                    before: target_node.next_sibling(),
                    replaced: None,
                },
                _ => Placement {
                    parent,
                    before: Some(target),
                    replaced: Some(target),
                },
            })
        }
        NodePosition::Insert(slot) => {
            let group = target_node
                .as_group()
                .ok_or_else(|| reject("insert target is not a group"))?;
            if !group.is_parallel() {
                return Err(reject("insert requires a parallel group"));
            }
            if slot > group.len() {
                return Err(reject("insert slot is past the last child"));
            }
            Ok(Placement {
                parent: target,
                before: children(arena, target).nth(slot),
                replaced: None,
            })
        }
    }
}

/// Apply a placement produced by [`resolve`] against the same tree.
///
/// Returns the replaced node when its last reference was the parent edge; the
/// caller destroys it.
pub(crate) fn commit(
    arena: &mut NodeArena,
    node: NodeKey,
    placement: Placement,
) -> Result<Option<NodeKey>, GraphError> {
    if arena.get(node).map_or(true, ServerNode::is_attached) {
        return Err(reject("placed node is not a live detached node"));
    }
    if target_group(arena, placement.parent).is_none() {
        return Err(reject("placement parent is not a group"));
    }

    link(arena, placement.parent, node, placement.before);
    if let Some(child) = arena.get_mut(node) {
        child.set_parent(placement.parent);
    }
    let orphan = placement.replaced.filter(|&old| {
        let orphaned = arena
            .get_mut(old)
            .map_or(false, ServerNode::clear_parent);
        unlink(arena, placement.parent, old);
        orphaned
    });
    Ok(orphan)
}

/// Detach `node` from its parent, then unlink it from the sibling list.
///
/// Returns `None` for a node that is not attached, otherwise whether no
/// reference survived and the caller must destroy the node.
pub(crate) fn detach(arena: &mut NodeArena, node: NodeKey) -> Option<bool> {
    let parent = arena.get(node)?.parent()?;
    let orphaned = arena.get_mut(node)?.clear_parent();
    unlink(arena, parent, node);
    Some(orphaned)
}

/// True when `node` is `ancestor` or lies in its subtree.
pub(crate) fn is_within(arena: &NodeArena, node: NodeKey, ancestor: NodeKey) -> bool {
    let mut current = Some(node);
    while let Some(key) = current {
        if key == ancestor {
            return true;
        }
        current = arena.get(key).and_then(ServerNode::parent);
    }
    false
}

fn link(arena: &mut NodeArena, parent: NodeKey, node: NodeKey, before: Option<NodeKey>) {
    let prev = match before {
        Some(next) => arena.get(next).and_then(ServerNode::prev_sibling),
        None => target_group(arena, parent).and_then(|group| group.tail),
    };
    if let Some(child) = arena.get_mut(node) {
        child.set_siblings(prev, before);
    }
    match prev.and_then(|prev| arena.get_mut(prev)) {
        Some(prev) => prev.set_next(Some(node)),
        None => {
            if let Some(group) = target_group_mut(arena, parent) {
                group.head = Some(node);
            }
        }
    }
    match before.and_then(|next| arena.get_mut(next)) {
        Some(next) => next.set_prev(Some(node)),
        None => {
            if let Some(group) = target_group_mut(arena, parent) {
                group.tail = Some(node);
            }
        }
    }
    if let Some(group) = target_group_mut(arena, parent) {
        group.len += 1;
    }
}

fn unlink(arena: &mut NodeArena, parent: NodeKey, node: NodeKey) {
    let (prev, next) = arena.get_mut(node).map_or((None, None), |child| {
        let links = (child.prev_sibling(), child.next_sibling());
        child.set_siblings(None, None);
        links
    });
    let linked = match prev {
        Some(prev) => arena.get(prev).and_then(ServerNode::next_sibling) == Some(node),
        None => target_group(arena, parent).and_then(Group::head) == Some(node),
    };
    assert_invariant(
        TREE_LINKED,
        linked,
        "attached node missing from its parent's children",
        Some("unlink"),
    );

    match prev.and_then(|prev| arena.get_mut(prev)) {
        Some(prev) => prev.set_next(next),
        None => {
            if let Some(group) = target_group_mut(arena, parent) {
                group.head = next;
            }
        }
    }
    match next.and_then(|next| arena.get_mut(next)) {
        Some(next) => next.set_prev(prev),
        None => {
            if let Some(group) = target_group_mut(arena, parent) {
                group.tail = prev;
            }
        }
    }
    if let Some(group) = target_group_mut(arena, parent) {
        group.len -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeKind, ServerNode};
    use crate::pool::NodePool;

    struct Tree {
        pool: NodePool,
        arena: NodeArena,
        root: NodeKey,
    }

    impl Tree {
        fn new(kind: GroupKind) -> Self {
            let mut pool = NodePool::new(4096);
            let mut arena = NodeArena::with_capacity(16);
            let block = pool.allocate(32).unwrap();
            let root = arena
                .insert(ServerNode::new(
                    NodeId(0),
                    NodeKind::Group(Group::new(kind)),
                    block,
                ))
                .unwrap();
            Self { pool, arena, root }
        }

        fn node(&mut self, id: i32) -> NodeKey {
            let block = self.pool.allocate(32).unwrap();
            self.arena
                .insert(ServerNode::new(
                    NodeId(id),
                    NodeKind::Group(Group::new(GroupKind::Sequential)),
                    block,
                ))
                .unwrap()
        }

        fn place(
            &mut self,
            node: NodeKey,
            target: NodeKey,
            position: NodePosition,
        ) -> Result<Option<NodeKey>, GraphError> {
            let placement = resolve(&self.arena, target, position)?;
            commit(&mut self.arena, node, placement)
        }

        fn child_ids(&self, group: NodeKey) -> Vec<i32> {
            children(&self.arena, group)
                .map(|k| self.arena.get(k).unwrap().id().0)
                .collect()
        }

        /// Walk the list backwards from the tail.
        fn reverse_ids(&self, group: NodeKey) -> Vec<i32> {
            let tail = target_group(&self.arena, group).unwrap().tail;
            iter::successors(tail, |&k| self.arena.get(k).unwrap().prev_sibling())
                .map(|k| self.arena.get(k).unwrap().id().0)
                .collect()
        }
    }

    #[test]
    fn head_and_tail_into_empty_group() {
        for position in [NodePosition::Head, NodePosition::Tail] {
            let mut tree = Tree::new(GroupKind::Sequential);
            let node = tree.node(1);
            let root = tree.root;
            assert_eq!(tree.place(node, root, position), Ok(None));
            assert_eq!(tree.child_ids(root), vec![1]);
            assert_eq!(tree.arena.get(node).unwrap().use_count(), 1);
        }
    }

    #[test]
    fn before_and_after_keep_sibling_order() {
        let mut tree = Tree::new(GroupKind::Sequential);
        let root = tree.root;
        let a = tree.node(1);
        let b = tree.node(2);
        tree.place(a, root, NodePosition::Tail).unwrap();
        tree.place(b, root, NodePosition::Tail).unwrap();
        let c = tree.node(3);
        tree.place(c, b, NodePosition::Before).unwrap();
        let d = tree.node(4);
        tree.place(d, a, NodePosition::After).unwrap();
        let e = tree.node(5);
        tree.place(e, root, NodePosition::Head).unwrap();
        assert_eq!(tree.child_ids(root), vec![5, 1, 4, 3, 2]);
        assert_eq!(tree.reverse_ids(root), vec![2, 3, 4, 1, 5]);
        assert_eq!(target_group(&tree.arena, root).unwrap().len(), 5);
    }

    #[test]
    fn before_detached_target_is_rejected() {
        let mut tree = Tree::new(GroupKind::Sequential);
        let loose = tree.node(1);
        let node = tree.node(2);
        assert_eq!(
            tree.place(node, loose, NodePosition::Before),
            Err(GraphError::InvalidConstraint("target is not attached"))
        );
        assert!(!tree.arena.get(node).unwrap().is_attached());
    }

    #[test]
    fn insert_into_sequential_group_is_rejected() {
        let mut tree = Tree::new(GroupKind::Sequential);
        let root = tree.root;
        let node = tree.node(1);
        assert!(matches!(
            tree.place(node, root, NodePosition::Insert(0)),
            Err(GraphError::InvalidConstraint(_))
        ));
        assert!(tree.child_ids(root).is_empty());
    }

    #[test]
    fn insert_into_parallel_group_uses_slot() {
        let mut tree = Tree::new(GroupKind::Parallel);
        let root = tree.root;
        for id in [1, 2] {
            let node = tree.node(id);
            tree.place(node, root, NodePosition::Tail).unwrap();
        }
        let node = tree.node(3);
        tree.place(node, root, NodePosition::Insert(1)).unwrap();
        assert_eq!(tree.child_ids(root), vec![1, 3, 2]);
        let last = tree.node(4);
        tree.place(last, root, NodePosition::Insert(3)).unwrap();
        assert_eq!(tree.child_ids(root), vec![1, 3, 2, 4]);
        let late = tree.node(5);
        assert!(tree.place(late, root, NodePosition::Insert(9)).is_err());
    }

    #[test]
    fn replace_takes_slot_and_orphans_target() {
        let mut tree = Tree::new(GroupKind::Sequential);
        let root = tree.root;
        let a = tree.node(1);
        let b = tree.node(2);
        tree.place(a, root, NodePosition::Tail).unwrap();
        tree.place(b, root, NodePosition::Tail).unwrap();
        let c = tree.node(3);
        assert_eq!(tree.place(c, a, NodePosition::Replace), Ok(Some(a)));
        assert_eq!(tree.child_ids(root), vec![3, 2]);
        assert_eq!(tree.reverse_ids(root), vec![2, 3]);
        let old = tree.arena.get(a).unwrap();
        assert!(!old.is_attached());
        assert_eq!(old.next_sibling(), None);
    }

    #[test]
    fn detach_unlinks_head_middle_and_tail() {
        let mut tree = Tree::new(GroupKind::Sequential);
        let root = tree.root;
        let keys: Vec<NodeKey> = (1..=4).map(|id| tree.node(id)).collect();
        for &key in &keys {
            tree.place(key, root, NodePosition::Tail).unwrap();
        }
        assert_eq!(detach(&mut tree.arena, keys[1]), Some(true));
        assert_eq!(tree.child_ids(root), vec![1, 3, 4]);
        assert_eq!(detach(&mut tree.arena, keys[0]), Some(true));
        assert_eq!(detach(&mut tree.arena, keys[3]), Some(true));
        assert_eq!(tree.child_ids(root), vec![3]);
        assert_eq!(tree.reverse_ids(root), vec![3]);
        assert!(detach(&mut tree.arena, keys[1]).is_none());
        assert!(is_within(&tree.arena, keys[2], root));
        assert!(!is_within(&tree.arena, root, keys[2]));
    }
}
