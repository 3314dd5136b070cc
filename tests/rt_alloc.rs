use std::alloc::{GlobalAlloc, Layout};
use std::cell::RefCell;
use synthgraph::prototype::{sine_definition, SynthDefinition};
use synthgraph::rt::process_block;
use synthgraph::synth::{ParameterTable, UnitGraph};
use synthgraph::{
    GraphError, GroupKind, NodeGraph, NodeId, PositionConstraint, ServerConfig, ROOT_NODE_ID,
};

thread_local! {
    static ALLOC_COUNT: RefCell<usize> = RefCell::new(0);
}

struct CountingAllocator;

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        ALLOC_COUNT.with(|c| *c.borrow_mut() += 1);
        unsafe { std::alloc::System.alloc(layout) }
    }
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { std::alloc::System.dealloc(ptr, layout) }
    }
}

#[global_allocator]
static A: CountingAllocator = CountingAllocator;

#[test]
fn process_block_does_not_allocate() {
    let mut out = vec![0.0; 64];
    let (mut graph, _events) = NodeGraph::new(&ServerConfig::default()).unwrap();
    graph.factory_mut().register_definition(sine_definition(44100.0));
    for group in 1..=4 {
        let kind = if group % 2 == 0 {
            GroupKind::Parallel
        } else {
            GroupKind::Sequential
        };
        graph
            .create_group(NodeId(group), kind, PositionConstraint::tail(ROOT_NODE_ID))
            .unwrap();
        for voice in 0..8 {
            graph
                .create_synth(
                    NodeId(group * 100 + voice),
                    "sine",
                    PositionConstraint::head(NodeId(group)),
                )
                .unwrap();
        }
    }
    graph
        .move_node(NodeId(4), PositionConstraint::tail(NodeId(1)))
        .unwrap();

    let after_edits = ALLOC_COUNT.with(|c| *c.borrow());
    for _ in 0..10_000 {
        process_block(&mut graph, &mut out);
    }
    let final_count = ALLOC_COUNT.with(|c| *c.borrow());
    assert_eq!(final_count, after_edits, "process_block should not allocate");
}

fn allocations() -> usize {
    ALLOC_COUNT.with(|c| *c.borrow())
}

/// Unit graph without state, so building one does not touch the heap.
struct Silent;

impl UnitGraph for Silent {
    fn process(&mut self, _controls: &[f32], _out: &mut [f32]) {}
}

/// One round of every edit kind, leaving the tree as it found it.
fn edit_round(graph: &mut NodeGraph) -> Result<(), GraphError> {
    graph.create_group(NodeId(1), GroupKind::Sequential, PositionConstraint::tail(ROOT_NODE_ID))?;
    graph.create_group(NodeId(2), GroupKind::Parallel, PositionConstraint::tail(ROOT_NODE_ID))?;
    for voice in 10..26 {
        graph.create_synth(NodeId(voice), "silent", PositionConstraint::head(NodeId(1)))?;
        graph.set_parameter(NodeId(voice), "freq", 220.0)?;
        graph.set_parameter(NodeId(voice), 1usize, 0.2)?;
    }
    graph.create_synth(NodeId(30), "silent", PositionConstraint::replace(NodeId(12)))?;
    graph.create_synth(NodeId(31), "silent", PositionConstraint::insert(NodeId(2), 0))?;
    graph.move_node(NodeId(13), PositionConstraint::after(NodeId(31)))?;
    graph.move_node(NodeId(2), PositionConstraint::before(NodeId(14)))?;
    let held = graph.retain(NodeId(15))?;
    graph.free(NodeId(15))?;
    graph.release(held)?;
    graph.free_children(NodeId(1))?;
    graph.free(NodeId(1))
}

#[test]
fn warmed_edits_do_not_allocate() {
    let config = ServerConfig {
        pool_capacity: 256 * 1024,
        max_nodes: 64,
        ..ServerConfig::default()
    };
    let (mut graph, mut events) = NodeGraph::new(&config).unwrap();
    let parameters: ParameterTable = [("freq", 440.0), ("amp", 0.1)].into_iter().collect();
    graph.factory_mut().register_definition(SynthDefinition::new(
        "silent",
        parameters,
        |_: &ParameterTable| -> Result<Box<dyn UnitGraph>, String> { Ok(Box::new(Silent)) },
    ));
    let baseline = graph.pool_in_use();

    // The first round registers logging callsites and the invariant log.
    edit_round(&mut graph).unwrap();
    while events.pop().is_ok() {}
    assert_eq!(graph.node_count(), 1);

    for _ in 0..8 {
        let before = allocations();
        edit_round(&mut graph).unwrap();
        assert_eq!(allocations(), before, "warmed edits should not allocate");
        while events.pop().is_ok() {}
    }
    assert_eq!(graph.pool_in_use(), baseline);
}
