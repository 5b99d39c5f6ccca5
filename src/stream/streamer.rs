//! # Request Streamer
//!
//! Turns a stream of client requests into a stream of responses.
//!
//! Every request is handed to a [`RequestHandler`] as soon as it is admitted.
//! With `prefetch == 0` every request is admitted as soon as the input yields
//! it. With `prefetch == n` at most `n` requests are in flight and a slot is
//! freed each time a response is yielded. Responses come back in submission
//! order when `results_in_order` is set and in completion order otherwise.
//!
//! The in-flight handler futures live inside the output stream, so dropping
//! the output stream cancels them together with the input. Work that must
//! outlive the client (floating branches) is the handler's business.

use crate::error::GatewayError;
use crate::message::DataRequest;
use async_stream::stream;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, FuturesOrdered, FuturesUnordered};
use futures::{FutureExt, Stream, StreamExt};
use std::sync::Arc;
use tracing::{debug, trace};

/// Result of one streamed request.
pub type StreamItem = Result<DataRequest, GatewayError>;

/// Stream of responses yielded by [`RequestStreamer::stream`].
pub type ResponseItems = BoxStream<'static, StreamItem>;

/// Handles one request of a client stream.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
  /// Produces the response to `request`.
  async fn handle(&self, request: DataRequest) -> StreamItem;
}

type Pending = BoxFuture<'static, StreamItem>;

/// The set of in-flight handler futures.
enum InFlight {
  Ordered(FuturesOrdered<Pending>),
  Unordered(FuturesUnordered<Pending>),
}

impl InFlight {
  fn new(in_order: bool) -> Self {
    if in_order {
      InFlight::Ordered(FuturesOrdered::new())
    } else {
      InFlight::Unordered(FuturesUnordered::new())
    }
  }

  fn push(&mut self, future: Pending) {
    match self {
      InFlight::Ordered(set) => set.push_back(future),
      InFlight::Unordered(set) => set.push(future),
    }
  }

  fn len(&self) -> usize {
    match self {
      InFlight::Ordered(set) => set.len(),
      InFlight::Unordered(set) => set.len(),
    }
  }

  async fn next(&mut self) -> Option<StreamItem> {
    match self {
      InFlight::Ordered(set) => set.next().await,
      InFlight::Unordered(set) => set.next().await,
    }
  }
}

enum Step {
  Completed(StreamItem),
  Admitted(DataRequest),
  Exhausted,
}

/// Drives a [`RequestHandler`] over client request streams.
#[derive(Clone)]
pub struct RequestStreamer {
  handler: Arc<dyn RequestHandler>,
  prefetch: usize,
}

impl RequestStreamer {
  /// Creates a streamer admitting at most `prefetch` requests at a time,
  /// or any number of them when `prefetch` is 0.
  pub fn new(handler: Arc<dyn RequestHandler>, prefetch: usize) -> Self {
    Self { handler, prefetch }
  }

  /// The admission window, 0 meaning unbounded.
  pub fn prefetch(&self) -> usize {
    self.prefetch
  }

  /// Streams the responses to `requests`.
  pub fn stream<S>(&self, requests: S, results_in_order: bool) -> ResponseItems
  where
    S: Stream<Item = DataRequest> + Send + 'static,
  {
    let handler = Arc::clone(&self.handler);
    let prefetch = self.prefetch;

    let responses = stream! {
      let mut requests = Box::pin(requests.fuse());
      let mut in_flight = InFlight::new(results_in_order);
      let mut exhausted = false;
      let mut submitted = 0usize;

      loop {
        let admit = !exhausted && (prefetch == 0 || in_flight.len() < prefetch);
        if !admit && in_flight.len() == 0 {
          break;
        }
        let busy = in_flight.len() > 0;

        let step = tokio::select! {
          biased;
          Some(item) = in_flight.next(), if busy => Step::Completed(item),
          next = requests.next(), if admit => match next {
            Some(request) => Step::Admitted(request),
            None => Step::Exhausted,
          },
        };

        match step {
          Step::Completed(item) => yield item,
          Step::Admitted(request) => {
            submitted += 1;
            trace!(request_id = %request.request_id(), in_flight = in_flight.len() + 1, "request admitted");
            let handler = Arc::clone(&handler);
            in_flight.push(async move { handler.handle(request).await }.boxed());
          }
          Step::Exhausted => {
            debug!(submitted, "request stream exhausted");
            exhausted = true;
          }
        }
      }
    };
    responses.boxed()
  }

  /// Streams the responses to an already materialised sequence of requests.
  pub fn stream_iter<I>(&self, requests: I, results_in_order: bool) -> ResponseItems
  where
    I: IntoIterator<Item = DataRequest>,
    I::IntoIter: Send + 'static,
  {
    self.stream(futures::stream::iter(requests), results_in_order)
  }
}
