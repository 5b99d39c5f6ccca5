//! # Gateway
//!
//! Client-facing side of a flow: the streamer facade, the request handler
//! driving the topology graph, and the HTTP, SSE and WebSocket surfaces.

pub mod executor_streamer;
pub mod http;
pub mod request_handler;
pub mod streamer;
pub mod websocket;


pub use executor_streamer::ExecutorStreamer;
pub use http::HttpGateway;
pub use request_handler::GatewayRequestHandler;
pub use streamer::{DocItems, GatewayStreamer};
