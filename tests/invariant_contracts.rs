//! Contract coverage: the invariant checks must fire on the paths that own
//! them. Kept in its own test binary so no other test touches the log.

use synthgraph::invariant_ppt::{
    clear_invariant_log, contract_test, DESTROY_DETACHED, EDIT_REJECTS_INVALID,
    PARENT_EDGE_COUNTED, POOL_BOUNDED, REGISTRY_UNIQUE_IDS, TREE_LINKED,
};
use synthgraph::prototype::sine_definition;
use synthgraph::{GroupKind, NodeGraph, NodeId, PositionConstraint, ServerConfig, ROOT_NODE_ID};

#[test]
fn graph_edits_enforce_invariants() {
    clear_invariant_log();

    let (mut graph, _events) = NodeGraph::new(&ServerConfig::default()).unwrap();
    graph.factory_mut().register_definition(sine_definition(44100.0));
    graph
        .create_group(NodeId(1), GroupKind::Sequential, PositionConstraint::tail(ROOT_NODE_ID))
        .unwrap();
    graph
        .create_synth(NodeId(2), "sine", PositionConstraint::tail(NodeId(1)))
        .unwrap();
    assert!(graph
        .create_synth(NodeId(2), "sine", PositionConstraint::tail(NodeId(1)))
        .is_err());
    assert!(graph
        .create_synth(NodeId(3), "sine", PositionConstraint::insert(NodeId(1), 0))
        .is_err());
    graph.free(NodeId(1)).unwrap();

    contract_test(
        "graph edits",
        &[
            POOL_BOUNDED,
            REGISTRY_UNIQUE_IDS,
            PARENT_EDGE_COUNTED,
            DESTROY_DETACHED,
            EDIT_REJECTS_INVALID,
            TREE_LINKED,
        ],
    );
}
