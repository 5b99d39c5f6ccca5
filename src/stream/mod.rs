//! # Stream
//!
//! Admission and ordering of client request streams.

pub mod streamer;


pub use streamer::{RequestHandler, RequestStreamer, ResponseItems, StreamItem};
