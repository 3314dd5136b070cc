//! RT module: the render walk over the node tree.

// IMPORTANT: Do not call assert_invariant or any tracing macro here; the walk
// runs on the audio thread and must not lock or allocate.

use crate::group;
use crate::node::{NodeArena, NodeKey, NodeKind};
use crate::node_graph::NodeGraph;

/// Render one block: zero `out`, then run every synth depth-first in child
/// order, each adding its signal into `out`.
///
/// The walk follows the parent and sibling links stored in the nodes, so it
/// keeps no traversal state of its own and never allocates.
pub fn process_block(graph: &mut NodeGraph, out: &mut [f32]) {
    out.fill(0.0);
    let NodeGraph { arena, root, .. } = graph;
    let root = *root;
    let mut cursor = group::children(arena, root).next();
    while let Some(key) = cursor {
        let Some(node) = arena.get_mut(key) else {
            break;
        };
        let first_child = match node.kind_mut() {
            NodeKind::Synth(synth) => {
                synth.render(out);
                None
            }
            NodeKind::Group(group) => group.head(),
        };
        cursor = first_child.or_else(|| next_in_walk(arena, key, root));
    }
}

/// The next sibling of `key` or of its nearest ancestor below `root`.
fn next_in_walk(arena: &NodeArena, mut key: NodeKey, root: NodeKey) -> Option<NodeKey> {
    loop {
        let node = arena.get(key)?;
        if let Some(next) = node.next_sibling() {
            return Some(next);
        }
        key = node.parent().filter(|&parent| parent != root)?;
    }
}

/// Run process_block with panic containment.
pub fn process_block_safe(graph: &mut NodeGraph, out: &mut [f32]) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        process_block(graph, out);
    }));
    if result.is_err() {
        // Fail closed: silence output
        out.fill(0.0);
    }
}

/// Render `frames` samples offline in blocks of `block_size`.
pub fn render_offline(graph: &mut NodeGraph, frames: usize, block_size: usize) -> Vec<f32> {
    let mut output = vec![0.0; frames];
    for block in output.chunks_mut(block_size.max(1)) {
        process_block(graph, block);
    }
    output
}
