//! # Schema Compatibility
//!
//! Checks run once discovery has returned the endpoints of every deployment.
//! For each edge between two deployments and each endpoint of the upstream
//! one, the upstream output model must structurally match the downstream
//! input model.

use super::graph::{DiscoveredEndpoints, TopologyGraph};
use crate::error::GraphError;
use crate::message::{DEFAULT_ENDPOINT, ModelSchema};
use std::collections::BTreeMap;

/// Input and output model of one endpoint of the whole flow.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointModels {
  /// Model accepted by the first deployment.
  pub input: ModelSchema,
  /// Model produced by the last deployment.
  pub output: ModelSchema,
  /// Whether the endpoint streams documents back.
  pub is_generator: bool,
  /// Whether the endpoint takes a single document.
  pub is_singleton_doc: bool,
}

/// Validates every edge between two deployments.
///
/// Returns a warning for every endpoint the downstream deployment does not
/// serve; those edges are skipped at request time.
///
/// # Errors
///
/// [`GraphError::SchemaMismatch`] on the first incompatible edge.
pub fn validate_compatibility(
  graph: &TopologyGraph,
  discovered: &DiscoveredEndpoints,
) -> Result<Vec<String>, GraphError> {
  let mut warnings = Vec::new();
  for (from, to) in graph.deployment_edges() {
    let upstream = graph.node(from);
    let downstream = graph.node(to);
    let (Some(up_info), Some(down_info)) = (
      discovered.get(&upstream.name),
      discovered.get(&downstream.name),
    ) else {
      continue;
    };

    for (endpoint, up_schema) in &up_info.schemas {
      if !down_info.accepts(endpoint) {
        warnings.push(format!(
          "`{}` does not serve `{endpoint}` exposed by `{}`; requests to it will skip `{}`",
          downstream.name, upstream.name, downstream.name
        ));
        continue;
      }
      let Some(down_schema) = down_info
        .schemas
        .get(endpoint)
        .or_else(|| down_info.schemas.get(DEFAULT_ENDPOINT))
      else {
        continue;
      };
      if !up_schema.output.structurally_matches(&down_schema.input) {
        return Err(GraphError::SchemaMismatch {
          endpoint: endpoint.clone(),
          upstream: upstream.name.clone(),
          downstream: downstream.name.clone(),
          output: up_schema.output.name.clone(),
          input: down_schema.input.name.clone(),
        });
      }
    }
  }
  Ok(warnings)
}

/// Input model of the origins and output model of the last deployment before
/// the gateway, by endpoint.
pub fn endpoints_models(
  graph: &TopologyGraph,
  discovered: &DiscoveredEndpoints,
) -> BTreeMap<String, EndpointModels> {
  let last: Vec<_> = graph
    .depth_first()
    .into_iter()
    .filter(|id| {
      graph
        .node(*id)
        .outgoing
        .iter()
        .any(|next| graph.node(*next).is_end)
    })
    .filter_map(|id| discovered.get(&graph.node(id).name))
    .collect();

  let mut models = BTreeMap::new();
  for origin in graph.origins() {
    let Some(info) = discovered.get(&graph.node(*origin).name) else {
      continue;
    };
    for (endpoint, schema) in &info.schemas {
      if models.contains_key(endpoint) {
        continue;
      }
      let output = last
        .iter()
        .rev()
        .find_map(|info| info.schema_for(endpoint))
        .map_or_else(|| schema.output.clone(), |s| s.output.clone());
      models.insert(
        endpoint.clone(),
        EndpointModels {
          input: schema.input.clone(),
          output,
          is_generator: schema.is_generator,
          is_singleton_doc: schema.is_singleton_doc,
        },
      );
    }
  }
  models
}

/// Every endpoint served by at least one deployment.
pub fn all_endpoints(discovered: &DiscoveredEndpoints) -> Vec<String> {
  let mut endpoints: Vec<String> = discovered
    .values()
    .flat_map(|info| info.endpoints.iter().cloned())
    .collect();
  endpoints.sort();
  endpoints.dedup();
  endpoints
}
