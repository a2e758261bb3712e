//! Turn execution: folds provider deltas into persisted blocks and streams
//! the push protocol to subscribers.

pub mod accumulator;
pub mod error;
pub mod executor;
pub mod registry;

#[cfg(test)]
mod testing;

pub use accumulator::BlockAccumulator;
pub use error::EngineError;
pub use executor::{ExecutorConfig, TurnExecutor, CANCELLED_MESSAGE};
pub use registry::{ExecutorRegistry, RegistryConfig};
