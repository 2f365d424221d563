//! Server lifecycle and transport event handling.
//!
//! This module contains the main server structure and the glue that turns
//! transport events into ordered handler callbacks.

pub mod core;
pub(crate) mod handlers;

pub use core::{ServerState, TcpServer};
