//! Application-facing message handling.
//!
//! Handlers implement [`MessageHandler`] (or are plain closures) and receive
//! a [`SessionContext`] for every callback. All handler callbacks for one
//! session run on the same dispatcher worker, in the order the events
//! happened.

mod handler;
mod outbound;

pub use handler::{MessageHandler, SessionContext};
pub(crate) use outbound::Outbound;
