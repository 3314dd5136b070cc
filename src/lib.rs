//! Node-graph core of a real-time synthesis server.
//!
//! Synths and groups form a tree rooted at group 0. Node memory comes from a
//! fixed-capacity [`pool::NodePool`], nodes are found by id through an
//! ordered registry, and every tree edit on [`node_graph::NodeGraph`] either
//! commits fully or leaves everything untouched. [`rt::process_block`] walks
//! the tree once per block.

pub mod config;
pub mod error;
pub mod event;
pub mod group;
#[doc(hidden)]
pub mod invariant_ppt;
pub mod node;
pub mod node_graph;
pub mod pool;
pub mod prototype;
mod registry;
pub mod rt;
pub mod synth;

pub use config::ServerConfig;
pub use error::{ConfigError, DefinitionError, GraphError};
pub use event::NodeEvent;
pub use group::{GroupKind, NodePosition, PositionConstraint};
pub use node::{NodeId, ServerNode, Slot};
pub use node_graph::{NodeGraph, NodeRef, ROOT_NODE_ID};
pub use pool::{NodeAllocator, NodePool};
pub use prototype::{SynthFactory, SynthPrototype};
