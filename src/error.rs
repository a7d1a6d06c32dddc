//! Error types for the graph backend.

use thiserror::Error;

use crate::graph::{EdgeId, NodeId};

#[derive(Error, Debug)]
pub enum SlamError {
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("unknown edge {0}")]
    UnknownEdge(EdgeId),

    #[error("node {node} is not a {expected} node")]
    NodeKind { node: NodeId, expected: &'static str },

    #[error("unknown robust kernel: {0}")]
    UnknownKernel(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    Dimension { expected: usize, actual: usize },

    #[error("no transform from {from} to {to}")]
    Transform { from: String, to: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SlamError>;
