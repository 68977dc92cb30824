//! # Ingestion Source
//!
//! Data-plane listener hosted by the initializer. Each connection carries
//! length-delimited frames (4-byte big-endian length prefix) whose payloads
//! the application decodes. For every frame the source:
//!
//! 1. decodes the payload,
//! 2. routes each touched state partition to its owning worker and the record
//!    to a stateless partition on the next worker in sequence,
//! 3. waits until every involved worker has applied its share,
//! 4. writes back an acknowledgement frame holding the connection's
//!    cumulative frame count as a big-endian `u64`.
//!
//! Frames that fail to decode are logged, skipped and still acknowledged so a
//! sender never resends a payload the cluster cannot use.

use crate::application::Application;
use crate::partitioning::{PartitionRouter, stable_id};
use crate::worker::{Delivery, WorkItem};
use bytes::Bytes;
use futures::future::try_join_all;
use futures::{SinkExt, StreamExt};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Size of an acknowledgement payload.
pub const ACK_LEN: usize = 8;

/// Error that ends an ingestion connection.
#[derive(Error, Debug)]
pub enum SourceError {
  /// Transport failure.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  /// A worker stopped before applying routed work.
  #[error("worker {0} is no longer accepting work")]
  WorkerGone(usize),
}

struct SourceState {
  id: String,
  application: Arc<dyn Application>,
  router: Arc<PartitionRouter>,
  workers: Vec<mpsc::Sender<Delivery>>,
  stateless_sequence: Arc<AtomicU64>,
  connection_timeout: Duration,
}

/// A data-plane ingestion point.
pub struct IngestSource {
  listener: TcpListener,
  state: Arc<SourceState>,
}

impl IngestSource {
  /// Creates an ingestion point on an already bound listener.
  ///
  /// `workers` holds one delivery channel per worker, in roster order.
  /// `stateless_sequence` is shared by all sources of a cluster so stateless
  /// work is spread over workers in a single global rotation.
  pub fn new(
    index: usize,
    listener: TcpListener,
    application: Arc<dyn Application>,
    router: Arc<PartitionRouter>,
    workers: Vec<mpsc::Sender<Delivery>>,
    stateless_sequence: Arc<AtomicU64>,
  ) -> std::io::Result<Self> {
    let addr = listener.local_addr()?;
    let index = index.to_string();
    let addr = addr.to_string();
    let id = stable_id(&[application.name(), "source", index.as_str(), addr.as_str()]);
    Ok(Self {
      listener,
      state: Arc::new(SourceState {
        id: id.to_string(),
        application,
        router,
        workers,
        stateless_sequence,
        connection_timeout: Duration::from_secs(30),
      }),
    })
  }

  /// Sets the idle time after which a sender connection is closed.
  #[must_use]
  pub fn with_connection_timeout(mut self, connection_timeout: Duration) -> Self {
    if let Some(state) = Arc::get_mut(&mut self.state) {
      state.connection_timeout = connection_timeout;
    }
    self
  }

  /// Opaque identifier of this ingestion point.
  pub fn id(&self) -> &str {
    &self.state.id
  }

  /// Address senders connect to.
  pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
    self.listener.local_addr()
  }

  /// Accepts sender connections until `cancel` fires.
  pub async fn run(self, cancel: CancellationToken) {
    if let Ok(addr) = self.listener.local_addr() {
      info!(source = %self.state.id, address = %addr, "Ingestion source listening");
    }
    loop {
      let accepted = tokio::select! {
        _ = cancel.cancelled() => break,
        accepted = self.listener.accept() => accepted,
      };
      match accepted {
        Ok((stream, peer_addr)) => {
          info!(source = %self.state.id, peer = %peer_addr, "Accepted sender connection");
          let state = Arc::clone(&self.state);
          let cancel = cancel.clone();
          tokio::spawn(async move {
            match Self::handle_connection(stream, &state, cancel).await {
              Ok(frames) => {
                debug!(source = %state.id, peer = %peer_addr, frames, "Sender disconnected");
              }
              Err(e) => {
                error!(
                  source = %state.id,
                  peer = %peer_addr,
                  error = %e,
                  "Error handling sender connection"
                );
              }
            }
          });
        }
        Err(e) => {
          warn!(error = %e, "Error accepting sender connection");
        }
      }
    }
  }

  async fn handle_connection(
    stream: TcpStream,
    state: &SourceState,
    cancel: CancellationToken,
  ) -> Result<u64, SourceError> {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    let mut frames: u64 = 0;
    loop {
      let next = tokio::select! {
        _ = cancel.cancelled() => break,
        next = timeout(state.connection_timeout, framed.next()) => next,
      };
      let payload = match next {
        Ok(Some(frame)) => frame?,
        Ok(None) => break,
        Err(_) => {
          warn!(source = %state.id, "Sender connection idle timeout");
          break;
        }
      };

      match state.application.decode(&payload) {
        Ok(record) => {
          let sequence = state.stateless_sequence.fetch_add(1, Ordering::Relaxed);
          let mut routed: BTreeMap<usize, Vec<WorkItem>> = BTreeMap::new();
          for access in state.application.partition(&record) {
            let worker = state.router.worker_for_state(&access.state_type, &access.key);
            routed.entry(worker).or_default().push(WorkItem::State(access));
          }
          if let Some(partition) = state.router.stateless_partition_for(&record.key) {
            routed
              .entry(state.router.worker_for_stateless(sequence))
              .or_default()
              .push(WorkItem::Stateless(partition));
          }
          Self::deliver(state, routed).await?;
        }
        Err(e) => {
          warn!(source = %state.id, error = %e, "Skipping undecodable frame");
        }
      }

      frames += 1;
      framed.send(Bytes::copy_from_slice(&frames.to_be_bytes())).await?;
    }
    Ok(frames)
  }

  async fn deliver(
    state: &SourceState,
    routed: BTreeMap<usize, Vec<WorkItem>>,
  ) -> Result<(), SourceError> {
    let mut pending = Vec::with_capacity(routed.len());
    for (worker, items) in routed {
      let sender = state.workers.get(worker).ok_or(SourceError::WorkerGone(worker))?;
      let (done, applied) = oneshot::channel();
      sender
        .send(Delivery { items, done })
        .await
        .map_err(|_| SourceError::WorkerGone(worker))?;
      pending.push(async move { applied.await.map_err(|_| SourceError::WorkerGone(worker)) });
    }
    try_join_all(pending).await?;
    Ok(())
  }
}
