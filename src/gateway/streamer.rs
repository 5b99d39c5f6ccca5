//! # Gateway Streamer
//!
//! Facade over the topology graph, the request streamer and the connection
//! pool. Every client surface (HTTP, SSE, WebSocket, RPC) goes through it.
//!
//! ```rust,no_run
//! use flowgate::config::GatewayStreamerConfig;
//! use flowgate::gateway::GatewayStreamer;
//! use flowgate::message::{DataRequest, Document};
//! use flowgate::networking::HttpChannelFactory;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), flowgate::error::GatewayError> {
//! let config = GatewayStreamerConfig::default()
//!   .with_edge("start-gateway", "encoder")
//!   .with_edge("encoder", "end-gateway")
//!   .with_addresses("encoder", ["10.0.0.4:8080"]);
//! let factory = Arc::new(HttpChannelFactory::new(&Default::default()));
//! let streamer = GatewayStreamer::new(config, factory).await?;
//!
//! let request = DataRequest::new()
//!   .with_endpoint("/encode")
//!   .with_docs(vec![Document::with_id("a")]);
//! let response = streamer.process_single_data(request).await?;
//! println!("{} documents", response.docs().len());
//! streamer.close().await;
//! # Ok(())
//! # }
//! ```

use super::request_handler::GatewayRequestHandler;
use crate::config::{ConnectionPoolConfig, GatewayStreamerConfig};
use crate::error::{ExecutorError, GatewayError, RpcError};
use crate::graph::{DiscoveredEndpoints, EndpointModels, TopologyGraph, all_endpoints, endpoints_models};
use crate::message::{
  DataRequest, DocBatch, Document, EndpointSchema, EndpointsInfo, GATEWAY_ROUTE, Parameters,
  SingleDocumentRequest, Status, new_id,
};
use crate::networking::{
  ChannelFactory, ConnectionPool, DocStream, IS_ERROR_KEY, Metadata, RequestStream, ResponseStream,
  Role, RpcService, SendOptions,
};
use crate::stream::{RequestStreamer, ResponseItems};
use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Documents yielded by a server-streaming endpoint.
pub type DocItems = BoxStream<'static, Result<Document, GatewayError>>;

/// Gateway facade.
pub struct GatewayStreamer {
  config: GatewayStreamerConfig,
  handler: Arc<GatewayRequestHandler>,
  streamer: RequestStreamer,
}

impl GatewayStreamer {
  /// Compiles the topology and connects to the head of every deployment.
  ///
  /// # Errors
  ///
  /// An invalid topology or a malformed address.
  pub async fn new(config: GatewayStreamerConfig, factory: Arc<dyn ChannelFactory>) -> Result<Self, GatewayError> {
    let graph = Arc::new(TopologyGraph::from_config(&config)?);
    let pool_config = ConnectionPoolConfig::default()
      .with_compression(config.compression)
      .with_retries(config.retries);
    let pool = Arc::new(ConnectionPool::new(config.runtime_name.clone(), factory, pool_config));

    for (deployment, addresses) in &config.executor_addresses {
      for address in addresses.to_vec() {
        pool.add_connection(deployment, &address, Role::Head, None).await?;
      }
    }
    info!(
      runtime = %config.runtime_name,
      deployments = config.executor_addresses.len(),
      prefetch = config.prefetch,
      "gateway streamer ready"
    );

    let handler = Arc::new(GatewayRequestHandler::new(graph, pool));
    let streamer = RequestStreamer::new(handler.clone(), config.prefetch);
    Ok(Self {
      config,
      handler,
      streamer,
    })
  }

  /// Builds the streamer from the arguments stored in the environment.
  ///
  /// # Errors
  ///
  /// A missing or malformed environment variable, or the errors of
  /// [`GatewayStreamer::new`].
  pub async fn from_env(factory: Arc<dyn ChannelFactory>) -> Result<Self, GatewayError> {
    Self::new(GatewayStreamerConfig::from_env()?, factory).await
  }

  /// Stores the arguments of this streamer in the environment.
  pub fn set_env_streamer_args(&self) -> Result<(), GatewayError> {
    self.config.set_env()
  }

  /// Streamer arguments.
  pub fn config(&self) -> &GatewayStreamerConfig {
    &self.config
  }

  /// The request handler.
  pub fn handler(&self) -> &Arc<GatewayRequestHandler> {
    &self.handler
  }

  /// Streams the responses to `requests`.
  pub fn rpc_stream<S>(&self, requests: S, results_in_order: bool) -> ResponseItems
  where
    S: Stream<Item = DataRequest> + Send + 'static,
  {
    self.streamer.stream(requests, results_in_order)
  }

  /// Sends one request and awaits its response.
  ///
  /// # Errors
  ///
  /// See [`GatewayRequestHandler::execute`].
  pub async fn process_single_data(&self, request: DataRequest) -> Result<DataRequest, GatewayError> {
    let mut responses = self.rpc_stream(futures::stream::iter([request]), true);
    match responses.next().await {
      Some(result) => result,
      None => Err(GatewayError::NoResponse("request stream ended early".into())),
    }
  }

  /// Splits `docs` into requests of at most `request_size` documents and
  /// streams their responses.
  pub fn stream_docs<I>(
    &self,
    docs: I,
    request_size: usize,
    endpoint: &str,
    parameters: Parameters,
    results_in_order: bool,
  ) -> ResponseItems
  where
    I: IntoIterator<Item = Document>,
    I::IntoIter: Send + 'static,
  {
    let endpoint = endpoint.to_string();
    let chunks = futures::stream::iter(docs).chunks(request_size.max(1));
    let requests = chunks.map(move |docs| {
      DataRequest::new()
        .with_endpoint(endpoint.clone())
        .with_parameters(parameters.clone())
        .with_docs(DocBatch::from(docs))
    });
    self.rpc_stream(requests, results_in_order)
  }

  /// Streams the documents an executor generates for `request`.
  ///
  /// The request goes to the first deployment of the graph, which is expected
  /// to be the only one.
  ///
  /// # Errors
  ///
  /// A graph without deployments and transport failures until the stream is
  /// opened. Executor failures are yielded as [`GatewayError::Executor`].
  pub async fn rpc_stream_doc(&self, mut request: SingleDocumentRequest) -> Result<DocItems, GatewayError> {
    let graph = self.handler.graph();
    let Some(origin) = graph.origins().first().copied() else {
      return Err(GatewayError::Config("no deployment to stream from".into()));
    };
    let node = graph.node(origin);
    if request.header.request_id.is_empty() {
      request.header.request_id = new_id();
    }
    let options = SendOptions {
      role: Role::Head,
      endpoint: Some(request.endpoint().to_string()),
      metadata: node.metadata.clone(),
      timeout: node.timeout_send,
      retries: Some(node.retries),
      ..SendOptions::default()
    };
    debug!(deployment = %node.name, request_id = %request.header.request_id, "streaming document");
    let items = self
      .handler
      .pool()
      .send_single_document_request(request, &node.name, options)
      .await?;
    Ok(items.map(unpack_streamed).boxed())
  }

  /// Streams the documents an executor generates for `doc`.
  ///
  /// # Errors
  ///
  /// See [`GatewayStreamer::rpc_stream_doc`].
  pub async fn stream_doc(&self, doc: Document, endpoint: &str, parameters: Parameters) -> Result<DocItems, GatewayError> {
    let mut request = SingleDocumentRequest::new(doc).with_endpoint(endpoint);
    request.parameters = parameters;
    self.rpc_stream_doc(request).await
  }

  /// Discovers the endpoints of every deployment, once.
  ///
  /// # Errors
  ///
  /// Transport failures and schema mismatches between adjacent deployments.
  pub async fn discover(&self) -> Result<Arc<DiscoveredEndpoints>, GatewayError> {
    self.handler.graph().discover(self.handler.pool()).await
  }

  /// Input and output models of every endpoint the flow serves.
  ///
  /// # Errors
  ///
  /// See [`GatewayStreamer::discover`].
  pub async fn endpoints_models(&self) -> Result<BTreeMap<String, EndpointModels>, GatewayError> {
    let discovered = self.discover().await?;
    Ok(endpoints_models(self.handler.graph(), &discovered))
  }

  /// Warms up the heads of every deployment concurrently.
  pub async fn warmup(&self, cancel: CancellationToken) {
    let pool = self.handler.pool();
    let deployments: Vec<String> = self.handler.graph().deployments().map(String::from).collect();
    join_all(
      deployments
        .iter()
        .map(|deployment| pool.warmup(deployment, cancel.clone())),
    )
    .await;
  }

  /// Waits for the floating deployments and closes every channel.
  pub async fn close(&self) {
    self.handler.close().await;
    self.handler.pool().close().await;
    info!(runtime = %self.config.runtime_name, "gateway streamer closed");
  }
}

/// Unwraps one streamed response, turning an error status into
/// [`GatewayError::Executor`].
pub(crate) fn unpack_streamed(item: Result<SingleDocumentRequest, RpcError>) -> Result<Document, GatewayError> {
  let response = item?;
  if response.is_error() {
    let exception = response
      .header
      .status
      .exception
      .clone()
      .unwrap_or_else(|| ExecutorError::new("UnknownError", response.header.status.description.clone()));
    return Err(GatewayError::Executor(exception));
  }
  response
    .data
    .doc
    .ok_or_else(|| GatewayError::NoResponse("streamed response without a document".into()))
}

#[async_trait]
impl RpcService for GatewayStreamer {
  async fn process_data(
    &self,
    requests: Vec<DataRequest>,
    _metadata: Metadata,
  ) -> Result<(DataRequest, Metadata), RpcError> {
    let Some(request) = requests.into_iter().next() else {
      return Err(RpcError::invalid_argument("no request to process"));
    };
    let mut fallback = request.clone();
    match self.process_single_data(request).await {
      Ok(response) => {
        let mut metadata = Metadata::new();
        if response.is_error() {
          metadata.insert(IS_ERROR_KEY.to_string(), "true".to_string());
        }
        Ok((response, metadata))
      }
      Err(GatewayError::Rpc(err)) => Err(err),
      Err(err) => {
        fallback.add_error(&err, GATEWAY_ROUTE);
        let mut metadata = Metadata::new();
        metadata.insert(IS_ERROR_KEY.to_string(), "true".to_string());
        Ok((fallback, metadata))
      }
    }
  }

  async fn stream(
    self: Arc<Self>,
    requests: RequestStream,
    _metadata: Metadata,
  ) -> Result<ResponseStream, RpcError> {
    let responses = self
      .rpc_stream(requests, false)
      .map(|item| item.map_err(GatewayError::into_rpc));
    Ok(responses.boxed())
  }

  async fn stream_single_document(
    &self,
    request: SingleDocumentRequest,
    _metadata: Metadata,
  ) -> Result<DocStream, RpcError> {
    let template = SingleDocumentRequest {
      data: Default::default(),
      ..request.clone()
    };
    let docs = self.rpc_stream_doc(request).await.map_err(GatewayError::into_rpc)?;
    let items = docs.map(move |item| {
      let mut response = template.clone();
      match item {
        Ok(doc) => response.data.doc = Some(doc),
        Err(GatewayError::Executor(exception)) => {
          response.header.status = Status::error(exception);
        }
        Err(err) => return Err(err.into_rpc()),
      }
      Ok(response)
    });
    Ok(items.boxed())
  }

  async fn endpoint_discovery(&self) -> Result<EndpointsInfo, RpcError> {
    let discovered = self.discover().await.map_err(GatewayError::into_rpc)?;
    let mut info = EndpointsInfo {
      endpoints: all_endpoints(&discovered),
      ..EndpointsInfo::default()
    };
    for (endpoint, models) in endpoints_models(self.handler.graph(), &discovered) {
      info.schemas.insert(
        endpoint,
        EndpointSchema {
          input: models.input,
          output: models.output,
          parameters: None,
          is_generator: models.is_generator,
          is_singleton_doc: models.is_singleton_doc,
        },
      );
    }
    Ok(info)
  }
}
