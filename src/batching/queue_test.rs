//! # Batch Queue Test Suite
//!
//! Timing tests run on a paused clock.

use crate::batching::{BatchQueue, DynamicBatchingConfig};
use crate::error::{BatchQueueError, ExecutorError};
use crate::message::{DocBatch, Document, Parameters};
use crate::worker::{CallOutput, EndpointBinding, Executor};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone, Copy, PartialEq)]
enum Mode {
  InPlace,
  Replace,
  Shrink,
  Results,
  FailOnDoc(&'static str),
}

/// Records every sub-batch it is called with.
struct Recorder {
  mode: Mode,
  batches: Mutex<Vec<(Instant, Vec<String>)>>,
}

impl Recorder {
  fn new(mode: Mode) -> Arc<Self> {
    Arc::new(Self {
      mode,
      batches: Mutex::new(Vec::new()),
    })
  }

  fn sizes(&self) -> Vec<usize> {
    self.batches.lock().unwrap().iter().map(|(_, ids)| ids.len()).collect()
  }
}

#[async_trait]
impl Executor for Recorder {
  fn endpoints(&self) -> Vec<EndpointBinding> {
    vec![EndpointBinding::new("/foo", "foo")]
  }

  async fn call(
    &self,
    _endpoint: &str,
    docs: &mut DocBatch,
    _parameters: &Parameters,
  ) -> Result<CallOutput, ExecutorError> {
    self
      .batches
      .lock()
      .unwrap()
      .push((Instant::now(), docs.ids()));
    match self.mode {
      Mode::InPlace => {
        for doc in docs.iter_mut() {
          doc.set("batched", true);
        }
        Ok(CallOutput::InPlace)
      }
      Mode::Replace => Ok(CallOutput::Docs(
        docs
          .iter()
          .map(|d| Document::with_id(format!("{}-out", d.id)))
          .collect(),
      )),
      Mode::Shrink => Ok(CallOutput::Docs(DocBatch::new())),
      Mode::Results => Ok(CallOutput::Results(serde_json::json!({"n": docs.len()}))),
      Mode::FailOnDoc(id) if docs.get_by_id(id).is_some() => {
        Err(ExecutorError::new("ValueError", "bad doc").with_executor("recorder"))
      }
      Mode::FailOnDoc(_) => Ok(CallOutput::InPlace),
    }
  }

  fn doc_metric(&self, _endpoint: &str, doc: &Document) -> f64 {
    doc.get("weight").and_then(|w| w.as_f64()).unwrap_or(1.0)
  }
}

fn batch(prefix: &str, n: usize) -> DocBatch {
  (0..n).map(|i| Document::with_id(format!("{prefix}{i}"))).collect()
}

fn queue(executor: &Arc<Recorder>, config: DynamicBatchingConfig) -> BatchQueue {
  BatchQueue::new(executor.clone(), "/foo", Parameters::new(), config).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_small_requests_flush_on_timeout() {
  let executor = Recorder::new(Mode::InPlace);
  let queue = queue(&executor, DynamicBatchingConfig::new(4, Duration::from_millis(2000)));
  let started = Instant::now();

  let mut pending = Vec::new();
  for name in ["a", "b", "c"] {
    pending.push(queue.push(batch(name, 1)).await.unwrap());
    tokio::time::sleep(Duration::from_millis(3)).await;
  }

  for (pending, name) in pending.into_iter().zip(["a0", "b0", "c0"]) {
    let docs = pending.wait().await.unwrap();
    assert_eq!(docs.ids(), vec![name]);
    assert_eq!(docs[0].get("batched"), Some(&serde_json::json!(true)));
  }

  let batches = executor.batches.lock().unwrap().clone();
  assert_eq!(batches.len(), 1);
  assert_eq!(batches[0].1, vec!["a0", "b0", "c0"]);
  let waited = batches[0].0 - started;
  assert!(waited >= Duration::from_millis(2000));
  assert!(waited < Duration::from_millis(2100));
}

#[tokio::test(start_paused = true)]
async fn test_oversized_requests_flush_immediately_in_sub_batches() {
  let executor = Recorder::new(Mode::Replace);
  let queue = queue(&executor, DynamicBatchingConfig::new(4, Duration::from_secs(60)));
  let started = Instant::now();

  let mut pending = Vec::new();
  for name in ["a", "b", "c"] {
    pending.push(queue.push(batch(name, 10)).await.unwrap());
  }

  let mut returned = 0;
  for (pending, name) in pending.into_iter().zip(["a", "b", "c"]) {
    let docs = pending.wait().await.unwrap();
    let expected: Vec<String> = (0..10).map(|i| format!("{name}{i}-out")).collect();
    assert_eq!(docs.ids(), expected);
    returned += docs.len();
  }

  assert_eq!(returned, 30);
  assert_eq!(executor.sizes(), vec![4, 4, 4, 4, 4, 4, 4, 2]);
  assert!(Instant::now() - started < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_flush_all_sends_one_call() {
  let executor = Recorder::new(Mode::InPlace);
  let config = DynamicBatchingConfig::new(4, Duration::from_secs(1)).with_flush_all(true);
  let queue = queue(&executor, config);

  let first = queue.push(batch("a", 3)).await.unwrap();
  let second = queue.push(batch("b", 3)).await.unwrap();
  assert_eq!(first.wait().await.unwrap().len(), 3);
  assert_eq!(second.wait().await.unwrap().len(), 3);
  assert_eq!(executor.sizes(), vec![6]);
}

#[tokio::test(start_paused = true)]
async fn test_custom_metric_triggers_flush() {
  let executor = Recorder::new(Mode::InPlace);
  let config = DynamicBatchingConfig::new(10, Duration::from_secs(60)).with_custom_metric(true);
  let queue = queue(&executor, config);
  let started = Instant::now();

  let heavy: DocBatch = vec![Document::with_id("h").with_field("weight", 12.0)].into();
  let pending = queue.push(heavy).await.unwrap();
  assert_eq!(pending.wait().await.unwrap().ids(), vec!["h"]);
  assert!(Instant::now() - started < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_failing_sub_batch_fails_only_its_requests() {
  let executor = Recorder::new(Mode::FailOnDoc("b1"));
  let queue = queue(&executor, DynamicBatchingConfig::new(2, Duration::from_secs(60)));

  let a = queue.push(batch("a", 2)).await.unwrap();
  let b = queue.push(batch("b", 2)).await.unwrap();
  let c = queue.push(batch("c", 2)).await.unwrap();

  assert!(a.wait().await.is_ok());
  assert!(matches!(b.wait().await, Err(BatchQueueError::Executor(_))));
  assert!(c.wait().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_wrong_output_length_is_reported() {
  let executor = Recorder::new(Mode::Shrink);
  let queue = queue(&executor, DynamicBatchingConfig::new(1, Duration::from_secs(60)));
  let pending = queue.push(batch("a", 1)).await.unwrap();
  assert_eq!(
    pending.wait().await.unwrap_err(),
    BatchQueueError::OutputLengthMismatch {
      expected: 1,
      actual: 0
    }
  );
}

#[tokio::test(start_paused = true)]
async fn test_result_maps_are_rejected() {
  let executor = Recorder::new(Mode::Results);
  let queue = queue(&executor, DynamicBatchingConfig::new(1, Duration::from_secs(60)));
  let pending = queue.push(batch("a", 1)).await.unwrap();
  assert_eq!(pending.wait().await.unwrap_err(), BatchQueueError::WrongOutputType);
}

#[tokio::test(start_paused = true)]
async fn test_close_flushes_pending_documents() {
  let executor = Recorder::new(Mode::InPlace);
  let queue = queue(&executor, DynamicBatchingConfig::new(100, Duration::from_secs(3600)));
  let pending = queue.push(batch("a", 2)).await.unwrap();

  queue.close().await;
  assert_eq!(pending.wait().await.unwrap().len(), 2);
  assert!(matches!(
    queue.push(batch("b", 1)).await,
    Err(BatchQueueError::Closed)
  ));
}

#[tokio::test]
async fn test_empty_request_completes_at_once() {
  let executor = Recorder::new(Mode::InPlace);
  let queue = queue(&executor, DynamicBatchingConfig::default());
  let pending = queue.push(DocBatch::new()).await.unwrap();
  assert!(pending.wait().await.unwrap().is_empty());
  assert!(executor.sizes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_triggers_before_a_flush_do_not_carry_over() {
  let executor = Recorder::new(Mode::InPlace);
  let config = DynamicBatchingConfig::new(4, Duration::from_millis(1000)).with_allow_concurrent(true);
  let queue = queue(&executor, config);
  tokio::time::sleep(Duration::from_millis(1)).await;

  let a = queue.push(batch("a", 4)).await.unwrap();
  let b = queue.push(batch("b", 4)).await.unwrap();
  assert_eq!(a.wait().await.unwrap().len(), 4);
  assert_eq!(b.wait().await.unwrap().len(), 4);
  assert_eq!(executor.sizes(), vec![4, 4]);

  let pushed = Instant::now();
  let c = queue.push(batch("c", 1)).await.unwrap();
  assert_eq!(c.wait().await.unwrap().ids(), vec!["c0"]);
  let batches = executor.batches.lock().unwrap().clone();
  assert_eq!(batches.len(), 3);
  assert!(batches[2].0 - pushed >= Duration::from_millis(1000));
}
