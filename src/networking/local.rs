//! # In-Process Transport
//!
//! [`LocalChannelFactory`] routes calls to [`RpcService`] implementations
//! registered under an address, without any serialization. Heads and workers
//! embedded in the gateway process use it, and so do the tests, which can also
//! inject failures on an address to exercise the retry policy.

use super::channel::{
  CallOptions, ChannelFactory, DocStream, Metadata, RequestStream, ResponseStream, RpcChannel,
  RpcService, host_port, with_deadline,
};
use crate::error::{RpcCode, RpcError};
use crate::message::{DataRequest, EndpointsInfo, SingleDocumentRequest, StatusInfo};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy)]
struct Fault {
  code: RpcCode,
  remaining: Option<usize>,
}

#[derive(Default)]
struct Registry {
  services: Mutex<HashMap<String, Arc<dyn RpcService>>>,
  faults: Mutex<HashMap<String, Fault>>,
  calls: Mutex<HashMap<String, usize>>,
}

impl Registry {
  fn record_call(&self, address: &str) {
    *lock(&self.calls).entry(address.to_string()).or_insert(0) += 1;
  }

  fn check_fault(&self, address: &str) -> Result<(), RpcError> {
    let mut faults = lock(&self.faults);
    let active = match faults.get_mut(address) {
      None => return Ok(()),
      Some(fault) => match fault.remaining.as_mut() {
        Some(0) => None,
        Some(n) => {
          *n -= 1;
          Some(fault.code)
        }
        None => Some(fault.code),
      },
    };
    match active {
      None => {
        faults.remove(address);
        Ok(())
      }
      Some(code) => {
        Err(RpcError::new(code, format!("injected failure on {address}")).with_dest_addr([address]))
      }
    }
  }

  fn resolve(&self, address: &str) -> Result<Arc<dyn RpcService>, RpcError> {
    self.check_fault(address)?;
    lock(&self.services)
      .get(address)
      .cloned()
      .ok_or_else(|| {
        RpcError::unavailable(format!("connection refused by {address}")).with_dest_addr([address])
      })
  }
}

/// Factory of in-process channels.
#[derive(Clone, Default)]
pub struct LocalChannelFactory {
  registry: Arc<Registry>,
}

impl LocalChannelFactory {
  /// Creates an empty factory.
  pub fn new() -> Self {
    Self::default()
  }

  /// Serves `service` at `address`.
  pub fn register(&self, address: &str, service: Arc<dyn RpcService>) {
    lock(&self.registry.services).insert(host_port(address).to_string(), service);
  }

  /// Stops serving `address`; further calls fail with `Unavailable`.
  pub fn unregister(&self, address: &str) {
    lock(&self.registry.services).remove(host_port(address));
  }

  /// Fails the next `times` calls to `address` with `code`, or every call when
  /// `times` is `None`.
  pub fn fail(&self, address: &str, code: RpcCode, times: Option<usize>) {
    lock(&self.registry.faults).insert(
      host_port(address).to_string(),
      Fault {
        code,
        remaining: times,
      },
    );
  }

  /// Removes an injected failure.
  pub fn heal(&self, address: &str) {
    lock(&self.registry.faults).remove(host_port(address));
  }

  /// Data calls attempted against `address`, failed ones included.
  pub fn calls(&self, address: &str) -> usize {
    lock(&self.registry.calls)
      .get(host_port(address))
      .copied()
      .unwrap_or(0)
  }

  /// Data calls attempted against any address.
  pub fn total_calls(&self) -> usize {
    lock(&self.registry.calls).values().sum()
  }
}

impl ChannelFactory for LocalChannelFactory {
  fn create(&self, address: &str, _deployment: &str) -> Result<Arc<dyn RpcChannel>, RpcError> {
    Ok(Arc::new(LocalChannel {
      address: host_port(address).to_string(),
      registry: Arc::clone(&self.registry),
      closed: AtomicBool::new(false),
    }))
  }
}

/// Channel to a service registered in a [`LocalChannelFactory`].
pub struct LocalChannel {
  address: String,
  registry: Arc<Registry>,
  closed: AtomicBool,
}

impl LocalChannel {
  fn service(&self) -> Result<Arc<dyn RpcService>, RpcError> {
    if self.closed.load(Ordering::Acquire) {
      return Err(RpcError::new(RpcCode::Cancelled, "channel closed").with_dest_addr([&self.address]));
    }
    self.registry.resolve(&self.address)
  }
}

#[async_trait]
impl RpcChannel for LocalChannel {
  fn address(&self) -> &str {
    &self.address
  }

  async fn send_requests(
    &self,
    mut requests: Vec<DataRequest>,
    options: &CallOptions,
  ) -> Result<(DataRequest, Metadata), RpcError> {
    self.registry.record_call(&self.address);
    let service = self.service()?;
    let metadata = options.call_metadata();
    with_deadline(options.timeout, &self.address, async move {
      if requests.len() == 1 {
        let request = requests.remove(0);
        service.process_single_data(request, metadata).await
      } else {
        service.process_data(requests, metadata).await
      }
    })
    .await
  }

  async fn send_stream(
    &self,
    requests: RequestStream,
    options: &CallOptions,
  ) -> Result<ResponseStream, RpcError> {
    self.registry.record_call(&self.address);
    let service = self.service()?;
    service.stream(requests, options.call_metadata()).await
  }

  async fn send_single_document(
    &self,
    request: SingleDocumentRequest,
    options: &CallOptions,
  ) -> Result<DocStream, RpcError> {
    self.registry.record_call(&self.address);
    let service = self.service()?;
    let metadata = options.call_metadata();
    with_deadline(options.timeout, &self.address, async move {
      service.stream_single_document(request, metadata).await
    })
    .await
  }

  async fn send_discover_endpoint(&self, timeout: Option<Duration>) -> Result<EndpointsInfo, RpcError> {
    let service = self.service()?;
    with_deadline(timeout, &self.address, async move { service.endpoint_discovery().await }).await
  }

  async fn send_status(&self, timeout: Option<Duration>) -> Result<StatusInfo, RpcError> {
    let service = self.service()?;
    with_deadline(timeout, &self.address, async move { service.status().await }).await
  }

  async fn close(&self, _grace: Duration) {
    self.closed.store(true, Ordering::Release);
  }
}
