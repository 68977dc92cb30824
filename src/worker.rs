//! Per-worker compute loop.
//!
//! A worker owns its [`PartitionDirectory`] outright: only its own loop writes
//! to it, and other workers learn its contents exclusively through the
//! control plane. Routed work arrives as [`Delivery`] batches; the sender is
//! told through `done` once the batch has been applied, which is what lets
//! an ingestion point acknowledge a record only after it was processed.

use crate::application::{Application, StateAccess};
use crate::directory::{KeyAccess, PartitionDirectory};
use crate::partitioning::{PartitionRouter, StatelessPartitionId, stable_id};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A unit of routed work.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkItem {
  /// Touch a state partition this worker owns.
  State(StateAccess),
  /// Process a message for a stateless partition.
  Stateless(StatelessPartitionId),
}

/// Work routed to one worker for one ingested record.
#[derive(Debug)]
pub struct Delivery {
  /// Items to apply, in order.
  pub items: Vec<WorkItem>,
  /// Signalled once every item has been applied.
  pub done: oneshot::Sender<()>,
}

/// One worker of the cluster.
#[derive(Debug)]
pub struct Worker {
  name: String,
  directory: Arc<PartitionDirectory>,
  processing: Arc<AtomicBool>,
}

impl Worker {
  /// Creates a worker and registers the application's partitions with it.
  ///
  /// Every state type is registered with no keys, and every stateless
  /// partition gets one marker for this worker, so a freshly started worker
  /// already reports its full partition structure.
  pub fn new(name: impl Into<String>, application: &dyn Application, router: &PartitionRouter) -> Self {
    let name = name.into();
    let directory = PartitionDirectory::new();
    for spec in application.state_types() {
      directory.register_state_type(&spec.name);
    }
    for partition in router.stateless_partitions() {
      let marker = stable_id(&[name.as_str(), partition.to_string().as_str()]);
      directory.register_stateless_partition(*partition, marker);
    }
    Self {
      name,
      directory: Arc::new(directory),
      processing: Arc::new(AtomicBool::new(false)),
    }
  }

  /// Worker name.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Shared handle to the worker's directory.
  pub fn directory(&self) -> Arc<PartitionDirectory> {
    Arc::clone(&self.directory)
  }

  /// Shared flag that is set while the compute loop runs.
  pub fn processing(&self) -> Arc<AtomicBool> {
    Arc::clone(&self.processing)
  }

  /// Applies routed work to the directory.
  pub fn apply(&self, items: &[WorkItem]) {
    for item in items {
      match item {
        WorkItem::State(access) => {
          if self.directory.record_state_access(&access.state_type, &access.key) == KeyAccess::Created {
            debug!(
              worker = %self.name,
              state_type = %access.state_type,
              key = %access.key,
              "Initialized state partition"
            );
          }
        }
        WorkItem::Stateless(partition) => {
          self.directory.record_stateless_access(*partition);
        }
      }
    }
  }

  /// Marks the worker as processing and returns its compute loop.
  ///
  /// The flag is set before the loop is first polled and cleared when the
  /// loop exits or is dropped.
  pub fn start(
    self,
    mut deliveries: mpsc::Receiver<Delivery>,
    cancel: CancellationToken,
  ) -> impl Future<Output = ()> + Send + 'static {
    self.processing.store(true, Ordering::Release);
    let processing = scopeguard::guard(Arc::clone(&self.processing), |flag| {
      flag.store(false, Ordering::Release);
    });
    async move {
      info!(worker = %self.name, "Worker loop started");
      loop {
        let delivery = tokio::select! {
          _ = cancel.cancelled() => break,
          delivery = deliveries.recv() => delivery,
        };
        let Some(delivery) = delivery else {
          break;
        };
        self.apply(&delivery.items);
        // The source may have gone away; the work is applied either way.
        let _ = delivery.done.send(());
      }
      drop(processing);
      info!(worker = %self.name, "Worker loop stopped");
    }
  }
}
