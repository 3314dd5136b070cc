//! Node lifecycle events for the notification layer.
//!
//! The node graph pushes events into a lock-free SPSC queue; the reply and
//! notification collaborators drain the consumer side. Events are small and
//! `Copy`, and pushing never blocks: when the queue is full the event is
//! dropped.

use crate::node::NodeId;
use rtrb::{Consumer, Producer, RingBuffer};

/// Default capacity of the node event queue.
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Create a node event queue pair.
///
/// Returns (producer for the node graph, consumer for the notifier).
pub fn new_event_queue(capacity: usize) -> (Producer<NodeEvent>, Consumer<NodeEvent>) {
    RingBuffer::new(capacity)
}

/// Lifecycle events emitted by node graph edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    /// A node was constructed and placed.
    Created {
        node: NodeId,
        /// The parent it was placed under.
        parent: NodeId,
        is_synth: bool,
    },

    /// A node was moved to a new parent or position.
    Moved {
        node: NodeId,
        parent: NodeId,
    },

    /// A node was destroyed and its memory returned to the pool.
    Destroyed {
        node: NodeId,
    },
}

impl NodeEvent {
    pub fn node(&self) -> NodeId {
        match self {
            NodeEvent::Created { node, .. } => *node,
            NodeEvent::Moved { node, .. } => *node,
            NodeEvent::Destroyed { node } => *node,
        }
    }

    /// Returns a human-readable description (for debugging).
    pub fn description(&self) -> &'static str {
        match self {
            NodeEvent::Created { .. } => "Created",
            NodeEvent::Moved { .. } => "Moved",
            NodeEvent::Destroyed { .. } => "Destroyed",
        }
    }
}

/// Drain every pending event.
pub fn drain_events(rx: &mut Consumer<NodeEvent>) -> Vec<NodeEvent> {
    let mut events = Vec::with_capacity(rx.slots());
    while let Ok(event) = rx.pop() {
        events.push(event);
    }
    events
}
