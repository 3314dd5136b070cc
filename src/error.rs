//! Error types for node graph edits, definition loading and configuration.

use crate::node::NodeId;
use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by node graph edits.
///
/// Every edit that returns one of these leaves the pool, the registry and the
/// tree exactly as they were before the call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    /// A live node already uses this id.
    #[error("node id {0} is already in use")]
    DuplicateNodeId(NodeId),

    /// No live node has this id.
    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    /// The position constraint cannot be applied to the addressed target.
    #[error("invalid position constraint: {0}")]
    InvalidConstraint(&'static str),

    /// The parameter name or index does not resolve to a slot.
    #[error("parameter slot {0} not found")]
    SlotNotFound(String),

    /// The node pool cannot serve the requested block.
    #[error("node pool exhausted: cannot serve {requested} bytes")]
    OutOfMemory {
        /// Requested size in bytes.
        requested: usize,
    },

    /// The prototype failed to build a synth instance.
    #[error("synth instantiation failed: {0}")]
    InstantiationError(String),

    /// No prototype is registered under this name.
    #[error("synth prototype '{0}' is not registered")]
    PrototypeNotFound(String),

    /// The node reference was issued by another graph.
    #[error("reference to node {0} was issued by another graph")]
    ForeignReference(NodeId),
}

/// Errors raised while reading synth definitions into the factory.
#[derive(Error, Debug)]
pub enum DefinitionError {
    #[error("failed to read definition file: {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed synth definition: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while loading a server configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
