//! # Worker
//!
//! Executor hosting on the worker side of the RPC surface.

pub mod executor;
pub mod handler;


pub use executor::{CallOutput, EndpointBinding, Executor, GeneratedDocs};
pub use handler::WorkerRequestHandler;
