//! # flowgate
//!
//! Request routing and streaming fabric for DAGs of remote
//! document-processing deployments.
//!
//! A gateway receives client requests carrying batches of documents and
//! drives them through a topology of deployments. Each deployment is a head
//! that fans a request out to its shards and merges the partial answers, in
//! front of workers hosting the user's [`worker::Executor`].
//!
//! ## Layout
//!
//! - [`gateway::GatewayStreamer`] is the entry point of a gateway; the HTTP,
//!   WebSocket and RPC surfaces all sit on top of it.
//! - [`head::HeadRequestHandler`] serves one deployment in front of its shards.
//! - [`worker::WorkerRequestHandler`] serves one executor replica.
//!
//! Every runtime is an [`networking::RpcService`] and can be exposed with
//! [`networking::serve`].

#![deny(missing_docs)]

/// Dynamic batching of worker requests.
pub mod batching;
/// Configuration of every runtime.
pub mod config;
/// Error types shared by every layer.
pub mod error;
/// Gateway runtime: streamer, request handler and client surfaces.
pub mod gateway;
/// Topology graph compilation and per-request execution.
pub mod graph;
/// Head runtime: shard fan-out and reduction.
pub mod head;
/// Tracing subscriber setup.
pub mod logging;
/// Requests, documents and their metadata.
pub mod message;
/// Channels, connection pool and the RPC server.
pub mod networking;
/// Merging of partial responses.
pub mod reduce;
/// Request stream admission and ordering.
pub mod stream;
/// Worker runtime hosting an executor.
pub mod worker;
