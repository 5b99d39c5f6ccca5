//! # Dynamic Batching
//!
//! Server-side coalescing of small requests into larger executor calls.

pub mod config;
pub mod queue;

#[cfg(test)]
mod queue_test;

pub use config::{DynamicBatchingConfig, resolve_batching};
pub use queue::{BatchQueue, PendingDocs};
