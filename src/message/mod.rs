//! # Message Envelopes
//!
//! Typed containers exchanged between the gateway, heads and workers.

pub mod document;
pub mod params;
pub mod request;
pub mod schema;
pub mod status;

#[cfg(test)]
mod request_test;

pub use document::{DocBatch, Document, new_id};
pub use params::Parameters;
pub use request::{
  ControlCommand, ControlRequest, DataRequest, GATEWAY_ROUTE, Header, RelatedEntity,
  SingleDocumentRequest, StatusInfo, request_from_parts,
};
pub use schema::{DEFAULT_ENDPOINT, DocSchema, EndpointSchema, EndpointsInfo, FieldKind, ModelSchema};
pub use status::{Route, Status, StatusCode};
