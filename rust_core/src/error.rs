//! Error types for graph construction and NMC initialization.

use crate::graph::{NodeId, ValueType};
use thiserror::Error;

/// Errors surfaced by the sampler.
///
/// Structural problems are reported before any sweep runs. Numeric trouble
/// inside a step never reaches the caller: the candidate is rejected and the
/// chain moves on.
#[derive(Debug, Error)]
pub enum NmcError {
    /// The support holds a node this engine cannot sample through.
    #[error("graph incompatible with NMC at node {node}: {reason}")]
    GraphIncompatible { node: NodeId, reason: String },

    /// A latent variable is not continuous.
    #[error("NMC only supports continuous latent variables; node {node} is {value_type}")]
    UnsupportedVariable { node: NodeId, value_type: ValueType },

    /// A gradient, curvature or log-probability came out NaN or infinite.
    #[error("non-finite {quantity} at node {node}")]
    NumericDegeneracy { node: NodeId, quantity: &'static str },

    /// Builder misuse: unknown parents, mismatched types, bad observations.
    #[error("invalid graph: {0}")]
    InvalidGraph(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, NmcError>;
