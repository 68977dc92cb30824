//! # Query Endpoint
//!
//! Control-plane server run by every worker, and the client used both by
//! external callers and by workers fetching each other's reports.
//!
//! ## Protocol
//!
//! Length-delimited frames over TCP, one JSON [`ControlRequest`] in and one
//! JSON [`ControlResponse`] out per frame. A connection may carry any number
//! of requests.
//!
//! - `query`: the receiving worker fetches a [`WorkerReport`] from every
//!   cluster member (its own locally, peers over their control planes),
//!   merges them with the [`ClusterStatusAggregator`] and returns the whole
//!   answer in one frame.
//! - `worker-report`: the receiving worker returns its own report.
//!
//! ## Example
//!
//! ```rust,no_run
//! use clusterweave::endpoint::QueryClient;
//! use clusterweave::query::QueryKind;
//!
//! # async fn example() -> Result<(), clusterweave::error::QueryError> {
//! let client = QueryClient::new("127.0.0.1:7001".parse().unwrap());
//! let status = client.query_json(QueryKind::ClusterStatus).await?;
//! println!("{status}");
//! # Ok(())
//! # }
//! ```

use crate::aggregator::{ClusterStatusAggregator, WorkerReport};
use crate::cluster::WorkerInfo;
use crate::directory::PartitionDirectory;
use crate::error::QueryError;
use crate::query::{ControlRequest, ControlResponse, OutputFormat, QueryKind, WireError};
use bytes::Bytes;
use futures::future::join_all;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bounded retry for unreachable control planes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
  /// Total attempts, including the first (minimum 1).
  pub max_attempts: u32,
  /// Delay between attempts.
  pub backoff: Duration,
}

impl RetryPolicy {
  /// Creates a policy with the given attempts and backoff.
  pub fn new(max_attempts: u32, backoff: Duration) -> Self {
    Self {
      max_attempts,
      backoff,
    }
  }

  /// A policy that never retries.
  pub fn no_retry() -> Self {
    Self::new(1, Duration::ZERO)
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      backoff: Duration::from_millis(100),
    }
  }
}

/// Configuration for a control-plane endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
  /// Idle time after which a client connection is closed (default: 30 seconds).
  pub connection_timeout: Duration,
  /// Per-attempt timeout when fetching a peer's report (default: 5 seconds).
  pub peer_timeout: Duration,
  /// Retry policy for peer report fetches.
  pub peer_retry: RetryPolicy,
}

impl Default for EndpointConfig {
  fn default() -> Self {
    Self {
      connection_timeout: Duration::from_secs(30),
      peer_timeout: Duration::from_secs(5),
      peer_retry: RetryPolicy::default(),
    }
  }
}

impl EndpointConfig {
  /// Sets the idle connection timeout.
  #[must_use]
  pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
    self.connection_timeout = timeout;
    self
  }

  /// Sets the per-attempt peer timeout.
  #[must_use]
  pub fn with_peer_timeout(mut self, timeout: Duration) -> Self {
    self.peer_timeout = timeout;
    self
  }

  /// Sets the peer retry policy.
  #[must_use]
  pub fn with_peer_retry(mut self, retry: RetryPolicy) -> Self {
    self.peer_retry = retry;
    self
  }
}

/// The facts a worker reports about itself.
#[derive(Debug)]
pub struct LocalWorker {
  /// Worker name.
  pub name: String,
  /// The worker's partition directory.
  pub directory: Arc<PartitionDirectory>,
  /// Set while the worker's compute loop runs.
  pub processing: Arc<AtomicBool>,
  /// Ingestion points hosted by the worker.
  pub source_ids: Vec<String>,
}

impl LocalWorker {
  /// Takes a report from the current directory state.
  pub fn report(&self) -> WorkerReport {
    WorkerReport {
      worker: self.name.clone(),
      processing: self.processing.load(Ordering::Acquire),
      source_ids: self.source_ids.clone(),
      directory: self.directory.snapshot(),
    }
  }
}

struct EndpointState {
  local: LocalWorker,
  members: Vec<WorkerInfo>,
  aggregator: ClusterStatusAggregator,
  config: EndpointConfig,
}

impl EndpointState {
  async fn handle(&self, request: ControlRequest) -> ControlResponse {
    match request {
      ControlRequest::WorkerReport => ControlResponse::WorkerReport {
        report: self.local.report(),
      },
      ControlRequest::Query { kind, format } => match self.answer(&kind, format).await {
        Ok(body) => ControlResponse::Answer { body },
        Err(err) => {
          warn!(
            worker = %self.local.name,
            kind = %kind,
            error = %err,
            "Query failed"
          );
          ControlResponse::Error {
            error: WireError::from(&err),
          }
        }
      },
    }
  }

  async fn answer(&self, kind: &str, format: OutputFormat) -> Result<String, QueryError> {
    let kind: QueryKind = kind.parse()?;
    let reports = self.collect_reports().await?;
    let answer = self.aggregator.answer(kind, &reports)?;
    Ok(format.render(&answer))
  }

  async fn collect_reports(&self) -> Result<Vec<WorkerReport>, QueryError> {
    let fetches = self.members.iter().map(|member| async move {
      if member.name == self.local.name {
        Ok(self.local.report())
      } else {
        QueryClient::new(member.control_addr)
          .with_timeout(self.config.peer_timeout)
          .with_retry(self.config.peer_retry.clone())
          .worker_report()
          .await
      }
    });
    join_all(fetches).await.into_iter().collect()
  }
}

/// Control-plane server for one worker.
pub struct QueryEndpoint {
  listener: TcpListener,
  state: Arc<EndpointState>,
}

impl QueryEndpoint {
  /// Creates an endpoint serving on an already bound listener.
  ///
  /// `members` is the full cluster roster in join order, including `local`.
  pub fn new(
    listener: TcpListener,
    local: LocalWorker,
    members: Vec<WorkerInfo>,
    aggregator: ClusterStatusAggregator,
    config: EndpointConfig,
  ) -> Self {
    Self {
      listener,
      state: Arc::new(EndpointState {
        local,
        members,
        aggregator,
        config,
      }),
    }
  }

  /// Address the endpoint listens on.
  pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
    self.listener.local_addr()
  }

  /// Accepts connections until `cancel` fires.
  pub async fn serve(self, cancel: CancellationToken) {
    let worker = self.state.local.name.clone();
    if let Ok(addr) = self.listener.local_addr() {
      info!(worker = %worker, address = %addr, "Control plane listening");
    }

    loop {
      let accepted = tokio::select! {
        _ = cancel.cancelled() => break,
        accepted = self.listener.accept() => accepted,
      };
      match accepted {
        Ok((stream, peer_addr)) => {
          debug!(worker = %worker, peer = %peer_addr, "Accepted control connection");
          let state = Arc::clone(&self.state);
          let cancel = cancel.clone();
          tokio::spawn(async move {
            if let Err(e) = Self::handle_connection(stream, state, cancel).await {
              error!(
                peer = %peer_addr,
                error = %e,
                "Error handling control connection"
              );
            }
          });
        }
        Err(e) => {
          warn!(error = %e, "Error accepting control connection");
        }
      }
    }
    info!(worker = %worker, "Control plane stopped");
  }

  async fn handle_connection(
    stream: TcpStream,
    state: Arc<EndpointState>,
    cancel: CancellationToken,
  ) -> std::io::Result<()> {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    loop {
      let next = tokio::select! {
        _ = cancel.cancelled() => break,
        next = timeout(state.config.connection_timeout, framed.next()) => next,
      };
      let frame = match next {
        Ok(Some(frame)) => frame?,
        Ok(None) => break,
        Err(_) => {
          debug!(worker = %state.local.name, "Control connection idle timeout");
          break;
        }
      };

      let response = match serde_json::from_slice::<ControlRequest>(&frame) {
        Ok(request) => state.handle(request).await,
        Err(e) => ControlResponse::Error {
          error: WireError::Protocol {
            message: format!("malformed request: {e}"),
          },
        },
      };
      let encoded = serde_json::to_vec(&response).map_err(std::io::Error::other)?;
      framed.send(Bytes::from(encoded)).await?;
    }
    Ok(())
  }
}

/// Client for a worker's control plane.
#[derive(Clone, Debug)]
pub struct QueryClient {
  addr: SocketAddr,
  timeout: Duration,
  retry: RetryPolicy,
}

impl QueryClient {
  /// Creates a client for the control plane at `addr`.
  pub fn new(addr: SocketAddr) -> Self {
    Self {
      addr,
      timeout: Duration::from_secs(10),
      retry: RetryPolicy::default(),
    }
  }

  /// Sets the per-attempt timeout (connect, send and receive).
  #[must_use]
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  /// Sets the retry policy for unreachable control planes.
  #[must_use]
  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  /// Address this client targets.
  pub fn addr(&self) -> SocketAddr {
    self.addr
  }

  /// Issues a query by wire name and returns the rendered answer.
  ///
  /// # Errors
  ///
  /// - [`QueryError::UnknownQuery`] if the endpoint does not serve `kind`
  /// - [`QueryError::QueryUnreachable`] if the endpoint (or a peer it needs)
  ///   cannot be reached
  /// - [`QueryError::ConsistencyViolation`] if the cluster view is inconsistent
  pub async fn query(&self, kind: &str, format: OutputFormat) -> Result<String, QueryError> {
    let request = ControlRequest::Query {
      kind: kind.to_string(),
      format,
    };
    match self.request(&request).await? {
      ControlResponse::Answer { body } => Ok(body),
      ControlResponse::Error { error } => Err(error.into()),
      other => Err(unexpected(&other)),
    }
  }

  /// Issues a query and parses the JSON answer.
  pub async fn query_json(&self, kind: QueryKind) -> Result<Value, QueryError> {
    let body = self.query(kind.as_str(), OutputFormat::Json).await?;
    serde_json::from_str(&body)
      .map_err(|e| QueryError::Protocol(format!("failed to parse {kind} answer: {e}")))
  }

  /// Fetches the target worker's own report.
  pub async fn worker_report(&self) -> Result<WorkerReport, QueryError> {
    match self.request(&ControlRequest::WorkerReport).await? {
      ControlResponse::WorkerReport { report } => Ok(report),
      ControlResponse::Error { error } => Err(error.into()),
      other => Err(unexpected(&other)),
    }
  }

  async fn request(&self, request: &ControlRequest) -> Result<ControlResponse, QueryError> {
    let payload = serde_json::to_vec(request)
      .map(Bytes::from)
      .map_err(|e| QueryError::Protocol(format!("failed to encode request: {e}")))?;

    let max_attempts = self.retry.max_attempts.max(1);
    let mut attempt = 0;
    loop {
      attempt += 1;
      let reason = match timeout(self.timeout, self.exchange(payload.clone())).await {
        Ok(Ok(frame)) => {
          return serde_json::from_slice(&frame)
            .map_err(|e| QueryError::Protocol(format!("malformed response: {e}")));
        }
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("timed out after {:?}", self.timeout),
      };
      if attempt >= max_attempts {
        return Err(QueryError::QueryUnreachable {
          addr: self.addr,
          attempts: attempt,
          reason,
        });
      }
      debug!(
        address = %self.addr,
        attempt,
        reason = %reason,
        "Control plane unreachable, retrying"
      );
      tokio::time::sleep(self.retry.backoff).await;
    }
  }

  async fn exchange(&self, payload: Bytes) -> std::io::Result<bytes::BytesMut> {
    let stream = TcpStream::connect(self.addr).await?;
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    framed.send(payload).await?;
    match framed.next().await {
      Some(frame) => frame,
      None => Err(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed before response",
      )),
    }
  }
}

fn unexpected(response: &ControlResponse) -> QueryError {
  QueryError::Protocol(format!("unexpected response: {response:?}"))
}
