//! # Worker Request Handler
//!
//! Serves the RPC surface of one worker by calling its [`Executor`].
//!
//! A request is routed to the function bound to its endpoint, or to the one
//! bound to `/default`. A request to an endpoint the executor does not serve
//! at all is returned unchanged. Parameters are scoped to the deployment
//! before the call. Endpoints with dynamic batching go through one
//! [`BatchQueue`] per endpoint and parameter fingerprint.

use super::executor::{CallOutput, EndpointBinding, Executor};
use crate::batching::{BatchQueue, DynamicBatchingConfig, resolve_batching};
use crate::config::WorkerConfig;
use crate::error::{BatchQueueError, ExecutorError, GatewayError, RpcError};
use crate::message::params::{fingerprint, scope_parameters};
use crate::message::{
  DEFAULT_ENDPOINT, DataRequest, DocBatch, EndpointsInfo, Parameters, SingleDocumentRequest,
  Status,
};
use crate::networking::{DocStream, ENDPOINT_KEY, IS_ERROR_KEY, Metadata, RpcService};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Worker hosting one executor.
pub struct WorkerRequestHandler {
  config: WorkerConfig,
  executor: Arc<dyn Executor>,
  bindings: HashMap<String, EndpointBinding>,
  queues: Mutex<HashMap<(String, String), Arc<BatchQueue>>>,
}

impl WorkerRequestHandler {
  /// Creates a worker for `executor`.
  pub fn new(config: WorkerConfig, executor: Arc<dyn Executor>) -> Self {
    let bindings: HashMap<String, EndpointBinding> = executor
      .endpoints()
      .into_iter()
      .map(|binding| (binding.endpoint.clone(), binding))
      .collect();
    info!(deployment = %config.name, endpoints = bindings.len(), "worker ready");
    Self {
      config,
      executor,
      bindings,
      queues: Mutex::new(HashMap::new()),
    }
  }

  /// Deployment name.
  pub fn name(&self) -> &str {
    &self.config.name
  }

  /// The binding serving `endpoint`, if any.
  fn binding_for(&self, endpoint: &str) -> Option<&EndpointBinding> {
    self
      .bindings
      .get(endpoint)
      .or_else(|| self.bindings.get(DEFAULT_ENDPOINT))
  }

  /// Runs the executor on the documents of `requests`.
  ///
  /// The documents of every partial request are concatenated in order and
  /// the response is built on the first request.
  ///
  /// # Errors
  ///
  /// Executor and batching failures. The RPC surface reports them in the
  /// response status instead.
  pub async fn handle(&self, requests: Vec<DataRequest>, endpoint: &str) -> Result<DataRequest, GatewayError> {
    let mut iter = requests.into_iter();
    let Some(mut request) = iter.next() else {
      return Err(RpcError::invalid_argument("no request to process").into());
    };
    let Some(binding) = self.binding_for(endpoint) else {
      debug!(deployment = %self.config.name, %endpoint, "endpoint not served, passing request through");
      return Ok(request);
    };
    let bound = binding.endpoint.clone();

    let mut docs = request.replace_docs(DocBatch::new());
    for other in iter {
      docs.extend(other.data.docs);
    }
    let parameters = scope_parameters(&request.parameters, &self.config.name);

    let batching = resolve_batching(
      &self.config.dynamic_batching,
      &bound,
      &binding.function,
      binding.batching.as_ref(),
    );
    let docs = match batching {
      Some(batching) => {
        let queue = self.queue(&bound, &parameters, batching.clone()).await?;
        queue.push(docs).await?.wait().await?
      }
      None => {
        let output = self.executor.call(&bound, &mut docs, &parameters).await?;
        match output {
          CallOutput::InPlace => docs,
          CallOutput::Docs(output) => output,
          CallOutput::Results(results) => {
            request.results.insert(self.config.name.clone(), results);
            docs
          }
        }
      }
    };
    request.replace_docs(docs);
    Ok(request)
  }

  async fn queue(
    &self,
    endpoint: &str,
    parameters: &Parameters,
    config: DynamicBatchingConfig,
  ) -> Result<Arc<BatchQueue>, GatewayError> {
    let key = (endpoint.to_string(), fingerprint(parameters));
    let mut queues = self.queues.lock().await;
    if let Some(queue) = queues.get(&key) {
      return Ok(Arc::clone(queue));
    }
    let queue = Arc::new(BatchQueue::new(
      Arc::clone(&self.executor),
      endpoint,
      parameters.clone(),
      config,
    )?);
    debug!(deployment = %self.config.name, %endpoint, "created batch queue");
    queues.insert(key, Arc::clone(&queue));
    Ok(queue)
  }

  /// Flushes and closes every batch queue.
  pub async fn close(&self) {
    let queues: Vec<Arc<BatchQueue>> = self.queues.lock().await.drain().map(|(_, q)| q).collect();
    for queue in queues {
      queue.close().await;
    }
    info!(deployment = %self.config.name, "worker closed");
  }
}

#[async_trait]
impl RpcService for WorkerRequestHandler {
  async fn process_data(
    &self,
    requests: Vec<DataRequest>,
    metadata: Metadata,
  ) -> Result<(DataRequest, Metadata), RpcError> {
    let Some(first) = requests.first() else {
      return Err(RpcError::invalid_argument("no request to process"));
    };
    let endpoint = metadata
      .get(ENDPOINT_KEY)
      .cloned()
      .unwrap_or_else(|| first.endpoint().to_string());
    let mut fallback = first.clone();

    match self.handle(requests, &endpoint).await {
      Ok(response) => Ok((response, Metadata::new())),
      Err(GatewayError::Rpc(err)) => Err(err),
      Err(err) => {
        error!(deployment = %self.config.name, %endpoint, error = %err, "executor failed");
        let exception = match err {
          GatewayError::Executor(e) => e,
          GatewayError::BatchQueue(BatchQueueError::Executor(e)) => e,
          other => ExecutorError::new(other.kind_name(), other.to_string()),
        };
        fallback.add_exception(exception.with_executor(self.config.name.clone()));
        let mut metadata = Metadata::new();
        metadata.insert(IS_ERROR_KEY.to_string(), "true".to_string());
        Ok((fallback, metadata))
      }
    }
  }

  async fn stream_single_document(
    &self,
    request: SingleDocumentRequest,
    _metadata: Metadata,
  ) -> Result<DocStream, RpcError> {
    let endpoint = request.endpoint().to_string();
    let Some(binding) = self.binding_for(&endpoint) else {
      return Err(RpcError::not_found(format!(
        "`{}` does not serve `{endpoint}`",
        self.config.name
      )));
    };
    let Some(doc) = request.data.doc.clone() else {
      return Err(RpcError::invalid_argument("single document request without a document"));
    };
    let parameters = scope_parameters(&request.parameters, &self.config.name);
    let name = self.config.name.clone();
    let template = SingleDocumentRequest {
      data: Default::default(),
      ..request
    };

    let stream = match self.executor.stream_doc(&binding.endpoint, doc, &parameters).await {
      Ok(docs) => docs,
      Err(err) => {
        let mut failed = template;
        failed.header.status = Status::error(err.with_executor(name));
        return Ok(futures::stream::once(async move { Ok(failed) }).boxed());
      }
    };

    let items = stream.map(move |item| {
      let mut response = template.clone();
      match item {
        Ok(doc) => response.data.doc = Some(doc),
        Err(err) => {
          response.header.status = Status::error(err.with_executor(name.clone()));
        }
      }
      Ok(response)
    });
    Ok(items.boxed())
  }

  async fn endpoint_discovery(&self) -> Result<EndpointsInfo, RpcError> {
    let mut info = EndpointsInfo::default();
    let mut bindings: Vec<&EndpointBinding> = self.bindings.values().collect();
    bindings.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
    for binding in bindings {
      info.endpoints.push(binding.endpoint.clone());
      info.schemas.insert(binding.endpoint.clone(), binding.schema.clone());
    }
    Ok(info)
  }
}
