//! Node registry: id-ordered index over every live node.

#![forbid(unsafe_code)]

use crate::error::GraphError;
use crate::invariant_ppt::{assert_invariant, REGISTRY_UNIQUE_IDS};
use crate::node::{NodeId, NodeKey};

/// Maps node ids to arena handles, independent of tree shape.
///
/// Entries are weak: the registry never contributes to a node's use count.
/// The index is a vector sorted by id with room for every node the arena can
/// hold, so registering and unregistering never allocate.
#[derive(Debug)]
pub(crate) struct NodeRegistry {
    index: Vec<(NodeId, NodeKey)>,
}

impl NodeRegistry {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            index: Vec::with_capacity(capacity),
        }
    }

    fn position(&self, id: NodeId) -> Result<usize, usize> {
        self.index.binary_search_by_key(&id, |&(entry, _)| entry)
    }

    pub(crate) fn insert(&mut self, id: NodeId, key: NodeKey) -> Result<(), GraphError> {
        match self.position(id) {
            Ok(_) => {
                assert_invariant(
                    REGISTRY_UNIQUE_IDS,
                    true,
                    "duplicate id rejected",
                    Some("NodeRegistry::insert"),
                );
                Err(GraphError::DuplicateNodeId(id))
            }
            Err(slot) => {
                self.index.insert(slot, (id, key));
                Ok(())
            }
        }
    }

    pub(crate) fn get(&self, id: NodeId) -> Result<NodeKey, GraphError> {
        self.position(id)
            .map(|slot| self.index[slot].1)
            .map_err(|_| GraphError::NodeNotFound(id))
    }

    pub(crate) fn contains(&self, id: NodeId) -> bool {
        self.position(id).is_ok()
    }

    /// Called once per node, from the graph's teardown routine.
    pub(crate) fn remove(&mut self, id: NodeId) {
        let removed = self.position(id).map(|slot| self.index.remove(slot));
        assert_invariant(
            REGISTRY_UNIQUE_IDS,
            removed.is_ok(),
            "node unregistered twice",
            Some("NodeRegistry::remove"),
        );
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    /// Ids in ascending order.
    pub(crate) fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.index.iter().map(|&(id, _)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::{Group, GroupKind};
    use crate::node::{NodeArena, NodeKind, ServerNode};
    use crate::pool::NodePool;

    fn key_for(arena: &mut NodeArena, pool: &mut NodePool, id: i32) -> NodeKey {
        let block = pool.allocate(32).unwrap();
        arena
            .insert(ServerNode::new(
                NodeId(id),
                NodeKind::Group(Group::new(GroupKind::Parallel)),
                block,
            ))
            .unwrap()
    }

    #[test]
    fn registry_rejects_duplicates_unchanged() {
        let mut pool = NodePool::new(1024);
        let mut arena = NodeArena::with_capacity(8);
        let mut registry = NodeRegistry::with_capacity(8);
        let a = key_for(&mut arena, &mut pool, 5);
        let b = key_for(&mut arena, &mut pool, 5);
        registry.insert(NodeId(5), a).unwrap();
        assert_eq!(
            registry.insert(NodeId(5), b),
            Err(GraphError::DuplicateNodeId(NodeId(5)))
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(NodeId(5)), Ok(a));
    }

    #[test]
    fn registry_orders_by_id() {
        let mut pool = NodePool::new(1024);
        let mut arena = NodeArena::with_capacity(8);
        let mut registry = NodeRegistry::with_capacity(8);
        for id in [9, -1, 3] {
            let key = key_for(&mut arena, &mut pool, id);
            registry.insert(NodeId(id), key).unwrap();
        }
        let ids: Vec<NodeId> = registry.ids().collect();
        assert_eq!(ids, vec![NodeId(-1), NodeId(3), NodeId(9)]);
        registry.remove(NodeId(3));
        assert_eq!(registry.get(NodeId(3)), Err(GraphError::NodeNotFound(NodeId(3))));
        assert!(!registry.contains(NodeId(3)));
    }
}
