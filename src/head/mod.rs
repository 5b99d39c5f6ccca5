//! # Head
//!
//! Shard fan-out of one deployment.

pub mod handler;
pub mod polling;

#[cfg(test)]
mod handler_test;

pub use handler::{HeadRequestHandler, USES_AFTER, USES_BEFORE, merge_routes};
pub use polling::{PollingConfig, PollingType};
