//! HTTP and server-sent events surface of the gateway.

pub mod csv;
pub mod models;
pub mod server;
pub mod sse;

pub use server::HttpGateway;
