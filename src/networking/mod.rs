//! # Networking
//!
//! Transport seam, replica bookkeeping and the connection pool used by the
//! gateway to reach heads and by heads to reach workers.

pub mod channel;
pub mod compression;
pub mod http_channel;
pub mod local;
pub mod pool;
pub mod pool_map;
pub mod replica_list;
pub mod server;
pub mod wire;


pub use channel::{
  CallOptions, ChannelFactory, DocStream, ENDPOINT_KEY, IS_ERROR_KEY, Metadata, RequestStream,
  ResponseStream, RpcChannel, RpcService, host_port,
};
pub use http_channel::HttpChannelFactory;
pub use local::LocalChannelFactory;
pub use pool::{ConnectionPool, SendOptions, SendResult, SendTask};
pub use pool_map::Role;
pub use replica_list::{Replica, ReplicaList};
pub use server::{serve, serve_with};
