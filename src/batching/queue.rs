//! # Dynamic Batch Queue
//!
//! Coalesces the documents of independent requests to one endpoint into
//! batched executor calls, then hands every caller back exactly its own
//! documents, in the order it sent them.
//!
//! ## Flushing
//!
//! A flush is triggered when the queued metric reaches
//! `preferred_batch_size`, when the timer armed by the first push of a batch
//! fires, or when the queue closes. Triggers fired before the flush task
//! takes its snapshot are absorbed by that snapshot. A single flush task per
//! queue snapshots the queued state and calls the executor once per
//! sub-batch. A caller
//! completes as soon as all of its documents came back, which may be before
//! the flush ends. A failing sub-batch fails every caller with documents in
//! it.

use super::config::DynamicBatchingConfig;
use crate::error::BatchQueueError;
use crate::message::{DocBatch, Document, Parameters};
use crate::worker::{CallOutput, Executor};
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, Notify, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type Completion = oneshot::Sender<Result<DocBatch, BatchQueueError>>;

/// Documents waiting for the next flush.
#[derive(Default)]
struct QueueState {
  docs: Vec<Document>,
  metrics: Vec<f64>,
  request_idxs: Vec<usize>,
  request_lens: Vec<usize>,
  completions: Vec<Completion>,
  metric_value: f64,
  timer: Option<JoinHandle<()>>,
  /// Set once the flush task was woken for this snapshot.
  triggered: bool,
}

impl QueueState {
  fn take(&mut self) -> QueueState {
    if let Some(timer) = self.timer.take() {
      timer.abort();
    }
    std::mem::take(self)
  }
}

struct Inner {
  executor: Arc<dyn Executor>,
  endpoint: String,
  parameters: Parameters,
  config: DynamicBatchingConfig,
  state: Mutex<QueueState>,
  trigger: Notify,
  closed: AtomicBool,
}

impl Inner {
  /// Wakes the flush task, at most once until the next snapshot.
  fn fire(&self, state: &mut QueueState) {
    if !state.triggered {
      state.triggered = true;
      self.trigger.notify_one();
    }
  }
}

/// Caller side of a push: resolves to the caller's processed documents.
pub struct PendingDocs {
  receiver: oneshot::Receiver<Result<DocBatch, BatchQueueError>>,
}

impl PendingDocs {
  /// Waits for the flush covering every document of the push.
  ///
  /// # Errors
  ///
  /// The failure of any sub-batch holding one of the documents, or
  /// [`BatchQueueError::Closed`] when the queue went away.
  pub async fn wait(self) -> Result<DocBatch, BatchQueueError> {
    self.receiver.await.unwrap_or(Err(BatchQueueError::Closed))
  }
}

/// Batch queue of one `(endpoint, parameters)` pair.
pub struct BatchQueue {
  inner: Arc<Inner>,
  flush_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl BatchQueue {
  /// Creates the queue and starts its flush task.
  ///
  /// # Errors
  ///
  /// An invalid configuration.
  pub fn new(
    executor: Arc<dyn Executor>,
    endpoint: impl Into<String>,
    parameters: Parameters,
    config: DynamicBatchingConfig,
  ) -> Result<Self, BatchQueueError> {
    config.validate()?;
    let inner = Arc::new(Inner {
      executor,
      endpoint: endpoint.into(),
      parameters,
      config,
      state: Mutex::new(QueueState::default()),
      trigger: Notify::new(),
      closed: AtomicBool::new(false),
    });
    let flush_task = tokio::spawn(flush_loop(Arc::clone(&inner)));
    Ok(Self {
      inner,
      flush_task: std::sync::Mutex::new(Some(flush_task)),
    })
  }

  /// Endpoint served by the queue.
  pub fn endpoint(&self) -> &str {
    &self.inner.endpoint
  }

  /// Queues the documents of one request.
  ///
  /// # Errors
  ///
  /// [`BatchQueueError::Closed`] after [`BatchQueue::close`].
  pub async fn push(&self, docs: DocBatch) -> Result<PendingDocs, BatchQueueError> {
    if self.inner.closed.load(Ordering::Acquire) {
      return Err(BatchQueueError::Closed);
    }
    let (sender, receiver) = oneshot::channel();
    if docs.is_empty() {
      let _ = sender.send(Ok(DocBatch::new()));
      return Ok(PendingDocs { receiver });
    }

    let inner = &self.inner;
    let mut state = inner.state.lock().await;
    if state.timer.as_ref().is_none_or(JoinHandle::is_finished) {
      let queue = Arc::downgrade(inner);
      let timeout = inner.config.timeout();
      state.timer = Some(tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if let Some(inner) = queue.upgrade() {
          let mut state = inner.state.lock().await;
          inner.fire(&mut state);
        }
      }));
    }

    let ordinal = state.completions.len();
    let count = docs.len();
    for doc in docs {
      let metric = if inner.config.use_custom_metric {
        inner.executor.doc_metric(&inner.endpoint, &doc)
      } else {
        1.0
      };
      state.metric_value += metric;
      state.metrics.push(metric);
      state.docs.push(doc);
      state.request_idxs.push(ordinal);
    }
    state.request_lens.push(count);
    state.completions.push(sender);

    if state.metric_value >= inner.config.preferred_batch_size as f64 {
      inner.fire(&mut state);
    }
    Ok(PendingDocs { receiver })
  }

  /// Flushes what is queued, waits for the flush, and stops the queue.
  pub async fn close(&self) {
    self.inner.closed.store(true, Ordering::Release);
    self.inner.trigger.notify_one();
    let task = self.flush_task.lock().ok().and_then(|mut task| task.take());
    if let Some(task) = task {
      if let Err(err) = task.await {
        warn!(endpoint = %self.inner.endpoint, error = %err, "batch flush task failed");
      }
    }
    if let Some(timer) = self.inner.state.lock().await.timer.take() {
      timer.abort();
    }
  }
}

impl Drop for BatchQueue {
  fn drop(&mut self) {
    if let Some(task) = self.flush_task.get_mut().ok().and_then(Option::take) {
      task.abort();
    }
  }
}

async fn flush_loop(inner: Arc<Inner>) {
  loop {
    inner.trigger.notified().await;
    let closing = inner.closed.load(Ordering::Acquire);
    flush(&inner).await;
    if closing {
      debug!(endpoint = %inner.endpoint, "batch queue closed");
      break;
    }
  }
}

async fn flush(inner: &Inner) {
  let mut guard = inner.state.lock().await;
  let snapshot = guard.take();
  if snapshot.docs.is_empty() {
    return;
  }
  if inner.config.allow_concurrent {
    drop(guard);
    process(inner, snapshot).await;
  } else {
    process(inner, snapshot).await;
    drop(guard);
  }
}

async fn process(inner: &Inner, snapshot: QueueState) {
  let QueueState {
    docs,
    metrics,
    request_idxs,
    request_lens,
    completions,
    ..
  } = snapshot;
  let mut completions: Vec<Option<Completion>> = completions.into_iter().map(Some).collect();
  let mut outputs: Vec<Vec<Document>> = request_lens.iter().map(|n| Vec::with_capacity(*n)).collect();

  let ranges = sub_batches(&metrics, &inner.config);
  debug!(
    endpoint = %inner.endpoint,
    docs = docs.len(),
    requests = request_lens.len(),
    sub_batches = ranges.len(),
    "flushing batch queue"
  );

  for range in ranges {
    let owners = &request_idxs[range.clone()];
    let batch: DocBatch = docs[range].to_vec().into();
    match call(inner, batch).await {
      Ok(processed) => {
        for (doc, &owner) in processed.into_iter().zip(owners) {
          outputs[owner].push(doc);
          if outputs[owner].len() == request_lens[owner] {
            if let Some(completion) = completions[owner].take() {
              let _ = completion.send(Ok(std::mem::take(&mut outputs[owner]).into()));
            }
          }
        }
      }
      Err(err) => {
        warn!(endpoint = %inner.endpoint, error = %err, "batched call failed");
        for &owner in owners {
          if let Some(completion) = completions[owner].take() {
            let _ = completion.send(Err(err.clone()));
          }
        }
      }
    }
  }
}

async fn call(inner: &Inner, mut batch: DocBatch) -> Result<DocBatch, BatchQueueError> {
  let expected = batch.len();
  let output = inner
    .executor
    .call(&inner.endpoint, &mut batch, &inner.parameters)
    .await?;
  match output {
    CallOutput::InPlace => Ok(batch),
    CallOutput::Docs(docs) if docs.len() == expected => Ok(docs),
    CallOutput::Docs(docs) => Err(BatchQueueError::OutputLengthMismatch {
      expected,
      actual: docs.len(),
    }),
    CallOutput::Results(_) => Err(BatchQueueError::WrongOutputType),
  }
}

/// Splits the queued documents into sub-batches whose metric reaches the
/// preferred batch size, the last one taking the remainder.
fn sub_batches(metrics: &[f64], config: &DynamicBatchingConfig) -> Vec<Range<usize>> {
  if metrics.is_empty() {
    return Vec::new();
  }
  if config.flush_all {
    return vec![0..metrics.len()];
  }
  let limit = config.preferred_batch_size as f64;
  let mut ranges = Vec::new();
  let mut start = 0;
  let mut acc = 0.0;
  for (i, metric) in metrics.iter().enumerate() {
    acc += metric;
    if acc >= limit {
      ranges.push(start..i + 1);
      start = i + 1;
      acc = 0.0;
    }
  }
  if start < metrics.len() {
    ranges.push(start..metrics.len());
  }
  ranges
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[test]
  fn test_sub_batches_split_at_preferred_size() {
    let config = DynamicBatchingConfig::new(4, Duration::from_secs(1));
    let sizes: Vec<usize> = sub_batches(&[1.0; 30], &config)
      .into_iter()
      .map(|r| r.len())
      .collect();
    assert_eq!(sizes, vec![4, 4, 4, 4, 4, 4, 4, 2]);
  }

  #[test]
  fn test_flush_all_is_one_batch() {
    let config = DynamicBatchingConfig::new(4, Duration::from_secs(1)).with_flush_all(true);
    assert_eq!(sub_batches(&[1.0; 9], &config), vec![0..9]);
  }

  #[test]
  fn test_custom_metric_weights() {
    let config = DynamicBatchingConfig::new(10, Duration::from_secs(1)).with_custom_metric(true);
    let ranges = sub_batches(&[6.0, 5.0, 2.0, 2.0, 7.0], &config);
    assert_eq!(ranges, vec![0..2, 2..5]);
  }
}
