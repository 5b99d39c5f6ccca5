//! Shared fixtures: a recording executor and deployments wired over the
//! in-process transport.

#![allow(dead_code)]

use async_trait::async_trait;
use flowgate::config::{HeadConfig, WorkerConfig};
use flowgate::error::ExecutorError;
use flowgate::head::HeadRequestHandler;
use flowgate::message::{DocBatch, Document, EndpointSchema, Parameters};
use flowgate::networking::LocalChannelFactory;
use flowgate::worker::{CallOutput, EndpointBinding, Executor, GeneratedDocs, WorkerRequestHandler};
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Marks every document it sees and remembers the size of each batch.
pub struct Recorder {
  pub name: String,
  delay: Duration,
  batches: Mutex<Vec<Vec<String>>>,
}

impl Recorder {
  pub fn new(name: &str) -> Arc<Self> {
    Self::slow(name, Duration::ZERO)
  }

  pub fn slow(name: &str, delay: Duration) -> Arc<Self> {
    Arc::new(Self {
      name: name.to_string(),
      delay,
      batches: Mutex::new(Vec::new()),
    })
  }

  /// Ids of the documents of every call, in call order.
  pub fn batches(&self) -> Vec<Vec<String>> {
    self.batches.lock().unwrap().clone()
  }
}

#[async_trait]
impl Executor for Recorder {
  fn endpoints(&self) -> Vec<EndpointBinding> {
    vec![
      EndpointBinding::new("/default", "mark"),
      EndpointBinding::new("/fail", "fail"),
      EndpointBinding::new("/generate", "generate").with_schema(EndpointSchema {
        is_generator: true,
        ..EndpointSchema::default()
      }),
    ]
  }

  async fn call(
    &self,
    endpoint: &str,
    docs: &mut DocBatch,
    _parameters: &Parameters,
  ) -> Result<CallOutput, ExecutorError> {
    self.batches.lock().unwrap().push(docs.ids());
    tokio::time::sleep(self.delay).await;
    if endpoint == "/fail" {
      return Err(ExecutorError::new("ValueError", format!("{} refused", self.name)));
    }
    for doc in docs.iter_mut() {
      doc.set(format!("seen_{}", self.name), true);
    }
    Ok(CallOutput::InPlace)
  }

  async fn stream_doc(
    &self,
    _endpoint: &str,
    doc: Document,
    parameters: &Parameters,
  ) -> Result<GeneratedDocs, ExecutorError> {
    let text = doc.get("text").and_then(|t| t.as_str()).unwrap_or_default().to_string();
    let prefix = parameters.get("prefix").and_then(|p| p.as_str()).unwrap_or_default();
    let words: Vec<Result<Document, ExecutorError>> = text
      .split_whitespace()
      .enumerate()
      .map(|(i, word)| {
        let word = format!("{prefix}{word}");
        Ok(Document::with_id(format!("{}-{i}", doc.id)).with_field("text", word))
      })
      .collect();
    Ok(futures::stream::iter(words).boxed())
  }
}

/// Serves `executor` on `replicas` workers behind a head at `<name>:1`.
pub async fn deploy(factory: &LocalChannelFactory, executor: Arc<Recorder>, replicas: usize) -> String {
  let name = executor.name.clone();
  let mut head = HeadConfig::new(name.clone());
  for replica in 0..replicas {
    let address = format!("{name}-w{replica}:1");
    let worker = WorkerRequestHandler::new(WorkerConfig::new(name.clone()), executor.clone());
    factory.register(&address, Arc::new(worker));
    head = head.with_shard_replica(0, address);
  }
  let head = HeadRequestHandler::new(head, Arc::new(factory.clone()))
    .await
    .unwrap();
  let address = format!("{name}:1");
  factory.register(&address, Arc::new(head));
  address
}

/// Total calls received by the workers of `name`.
pub fn worker_calls(factory: &LocalChannelFactory, name: &str, replicas: usize) -> usize {
  (0..replicas)
    .map(|replica| factory.calls(&format!("{name}-w{replica}:1")))
    .sum()
}

/// `count` documents with ids `d0..`.
pub fn docs(count: usize) -> Vec<Document> {
  (0..count).map(|i| Document::with_id(format!("d{i}"))).collect()
}
