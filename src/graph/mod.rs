//! # Topology Graph
//!
//! Compilation, validation and per-request execution of the DAG of
//! deployments a gateway serves.

pub mod compatibility;
pub mod execution;
pub mod filter;
#[allow(clippy::module_inception)]
pub mod graph;
pub mod node;


pub use compatibility::{EndpointModels, all_endpoints, endpoints_models, validate_compatibility};
pub use execution::{GraphRun, NodeResult, target_pattern};
pub use filter::{FieldOp, Filter};
pub use graph::{DiscoveredEndpoints, TopologyGraph, Upstream};
pub use node::{END_GATEWAY, END_GATEWAY_NODE, NodeId, NodeSpec, START_GATEWAY};
