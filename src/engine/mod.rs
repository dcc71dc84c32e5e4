//! Run execution: the engine, its run registry, and cancellation.
//!
//! See [`ExecutionEngine`] for the run lifecycle and concurrency model.

mod cancel;
mod runner;

pub use cancel::CancelToken;
pub use runner::{EngineBuilder, EngineError, ExecutionEngine};
