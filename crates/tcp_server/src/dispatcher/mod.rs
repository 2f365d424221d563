//! Ordered work dispatch.
//!
//! Work for one key always runs on the same worker thread, in submission
//! order; different keys run concurrently up to the pool size.

mod ordered;

pub use ordered::{Job, OrderedDispatcher, ShutdownReport};

/// Dispatch failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Dispatcher is shutting down")]
    ShuttingDown,
}
