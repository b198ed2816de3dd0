//! CPU-resident phylogenetic likelihood evaluation engine.
//!
//! Computes site-wise and aggregated log-likelihoods (and first/second
//! derivatives with respect to an edge length) for continuous-time Markov
//! substitution models on trees, via Felsenstein peeling over partials
//! buffers, eigen-derived transition matrices, explicit underflow scaling,
//! and optional parallel dispatch across partitions or pattern ranges.

mod buffers;
mod eigen;
mod engine;
mod error;
mod kernels;
mod likelihood;
mod partition;
mod pool;
mod scale;

pub use engine::{flags, InstanceConfig, LikelihoodEngine, Operation, PartitionOperation};
pub use error::{EngineError, Result};
