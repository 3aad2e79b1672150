pub mod autodiff;
pub mod distributions;
pub mod error;
pub mod graph;
pub mod initializer;
pub mod nmc;
pub mod number;
pub mod proposer;
pub mod sampler;
pub mod snapshot;
pub mod support;

pub use error::{NmcError, Result};
pub use graph::{Graph, NodeId, NodeValue, ValueType};
pub use nmc::Nmc;
pub use sampler::{sample, NmcConfig, SampleResult, Samples};

// Future: block proposals that move several correlated scalars jointly from
// the full local Hessian instead of one coordinate at a time.
