//! # Cluster Lifecycle
//!
//! The harness starts and stops clusters through two seams:
//!
//! - **[`ClusterLauncher`]**: starts a cluster from a [`ClusterConfig`]
//! - **[`ClusterHandle`]**: exposes the started cluster's workers and
//!   ingestion addresses and shuts it down
//!
//! Spawning worker processes is outside this crate; a process-based launcher
//! implements these traits. [`LocalLauncher`] runs every worker as a set of
//! tasks in the current runtime, each with its own control-plane and (for the
//! initializer) ingestion listeners on real sockets, sharing no memory with
//! the others beyond the channels that stand in for the data plane.
//!
//! ## Example
//!
//! ```rust,no_run
//! use clusterweave::application::DummyApplication;
//! use clusterweave::cluster::{ClusterConfig, ClusterLauncher, LocalLauncher};
//!
//! # async fn example() -> Result<(), clusterweave::error::ClusterError> {
//! let launcher = LocalLauncher::new(DummyApplication);
//! let mut cluster = launcher.launch(&ClusterConfig::default().with_workers(2)).await?;
//! println!("initializer control plane: {}", cluster.workers()[0].control_addr);
//! cluster.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use crate::aggregator::ClusterStatusAggregator;
use crate::application::Application;
use crate::endpoint::{EndpointConfig, LocalWorker, QueryEndpoint};
use crate::error::ClusterError;
use crate::partitioning::PartitionRouter;
use crate::source::IngestSource;
use crate::worker::{Delivery, Worker};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Name of the first worker to join a cluster.
pub const INITIALIZER_NAME: &str = "initializer";

/// Returns worker names in join order: the initializer, then `worker1`, `worker2`, ...
pub fn worker_names(count: usize) -> Vec<String> {
  (0..count)
    .map(|index| match index {
      0 => INITIALIZER_NAME.to_string(),
      n => format!("worker{n}"),
    })
    .collect()
}

/// Configuration for starting a cluster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
  /// Number of workers (default: 1).
  pub workers: usize,
  /// Number of ingestion sources on the initializer (default: 1).
  pub sources: usize,
  /// Interface listeners bind to (default: 127.0.0.1).
  pub host: IpAddr,
  /// Capacity of each worker's delivery channel (default: 64).
  pub channel_capacity: usize,
  /// Control-plane endpoint settings.
  pub endpoint: EndpointConfig,
  /// Time allowed for tasks to stop on shutdown (default: 5 seconds).
  pub shutdown_grace: Duration,
}

impl Default for ClusterConfig {
  fn default() -> Self {
    Self {
      workers: 1,
      sources: 1,
      host: IpAddr::V4(Ipv4Addr::LOCALHOST),
      channel_capacity: 64,
      endpoint: EndpointConfig::default(),
      shutdown_grace: Duration::from_secs(5),
    }
  }
}

impl ClusterConfig {
  /// Sets the number of workers.
  #[must_use]
  pub fn with_workers(mut self, workers: usize) -> Self {
    self.workers = workers;
    self
  }

  /// Sets the number of ingestion sources.
  #[must_use]
  pub fn with_sources(mut self, sources: usize) -> Self {
    self.sources = sources;
    self
  }

  /// Sets the bind interface.
  #[must_use]
  pub fn with_host(mut self, host: IpAddr) -> Self {
    self.host = host;
    self
  }

  /// Sets the control-plane endpoint settings.
  #[must_use]
  pub fn with_endpoint(mut self, endpoint: EndpointConfig) -> Self {
    self.endpoint = endpoint;
    self
  }

  /// Sets the shutdown grace period.
  #[must_use]
  pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
    self.shutdown_grace = grace;
    self
  }

  /// Checks the configuration can start a cluster.
  pub fn validate(&self) -> Result<(), ClusterError> {
    if self.workers == 0 {
      return Err(ClusterError::InvalidConfig("workers must be >= 1".to_string()));
    }
    if self.channel_capacity == 0 {
      return Err(ClusterError::InvalidConfig(
        "channel_capacity must be >= 1".to_string(),
      ));
    }
    Ok(())
  }
}

/// A cluster member as seen from outside.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
  /// Unique worker name.
  pub name: String,
  /// Control-plane address.
  pub control_addr: SocketAddr,
  /// Whether the worker is currently running.
  pub alive: bool,
}

/// Starts clusters.
#[async_trait]
pub trait ClusterLauncher: Send + Sync {
  /// Starts a cluster and returns once every control plane accepts connections.
  async fn launch(&self, config: &ClusterConfig) -> Result<Box<dyn ClusterHandle>, ClusterError>;
}

/// A running cluster.
#[async_trait]
pub trait ClusterHandle: Send + Sync {
  /// Workers in join order, initializer first.
  fn workers(&self) -> Vec<WorkerInfo>;

  /// Ingestion addresses, in source order.
  fn source_addrs(&self) -> Vec<SocketAddr>;

  /// Stops the cluster. Calling it again after success is a no-op.
  async fn shutdown(&mut self) -> Result<(), ClusterError>;
}

/// Launches [`LocalCluster`]s running a given application.
#[derive(Clone)]
pub struct LocalLauncher {
  application: Arc<dyn Application>,
}

impl LocalLauncher {
  /// Creates a launcher for `application`.
  pub fn new(application: impl Application) -> Self {
    Self {
      application: Arc::new(application),
    }
  }
}

#[async_trait]
impl ClusterLauncher for LocalLauncher {
  async fn launch(&self, config: &ClusterConfig) -> Result<Box<dyn ClusterHandle>, ClusterError> {
    let cluster = LocalCluster::start(Arc::clone(&self.application), config).await?;
    Ok(Box::new(cluster))
  }
}

/// A cluster whose workers run as tasks in the current runtime.
pub struct LocalCluster {
  members: Vec<WorkerInfo>,
  liveness: Vec<Arc<AtomicBool>>,
  source_addrs: Vec<SocketAddr>,
  // Held until shutdown so worker loops stop on cancellation, not when the
  // last source goes away.
  deliveries: Vec<mpsc::Sender<Delivery>>,
  cancel: CancellationToken,
  tasks: JoinSet<()>,
  shutdown_grace: Duration,
}

impl LocalCluster {
  /// Binds every listener, registers partitions on every worker and spawns
  /// the worker loops, control planes and ingestion sources.
  pub async fn start(
    application: Arc<dyn Application>,
    config: &ClusterConfig,
  ) -> Result<Self, ClusterError> {
    config.validate()?;
    let names = worker_names(config.workers);
    let bind_addr = SocketAddr::new(config.host, 0);

    let mut control_listeners = Vec::with_capacity(names.len());
    let mut members = Vec::with_capacity(names.len());
    for name in &names {
      let listener = bind("control plane", bind_addr).await?;
      let control_addr = local_addr("control plane", bind_addr, &listener)?;
      members.push(WorkerInfo {
        name: name.clone(),
        control_addr,
        alive: true,
      });
      control_listeners.push(listener);
    }

    let router = Arc::new(PartitionRouter::new(
      names.len(),
      &application.state_types(),
      application.name(),
      application.stateless_partition_count(),
    ));
    let aggregator = ClusterStatusAggregator::new(names.clone()).with_router((*router).clone());

    let mut workers = Vec::with_capacity(names.len());
    let mut senders = Vec::with_capacity(names.len());
    let mut receivers = Vec::with_capacity(names.len());
    for name in &names {
      workers.push(Worker::new(name.clone(), application.as_ref(), &router));
      let (tx, rx) = mpsc::channel(config.channel_capacity);
      senders.push(tx);
      receivers.push(rx);
    }

    let stateless_sequence = Arc::new(AtomicU64::new(0));
    let mut sources = Vec::with_capacity(config.sources);
    for index in 0..config.sources {
      let listener = bind("ingestion", bind_addr).await?;
      let source = IngestSource::new(
        index,
        listener,
        Arc::clone(&application),
        Arc::clone(&router),
        senders.clone(),
        Arc::clone(&stateless_sequence),
      )
      .map_err(|source| ClusterError::Bind {
        role: "ingestion",
        addr: bind_addr,
        source,
      })?;
      sources.push(source);
    }
    let source_ids: Vec<String> = sources.iter().map(|s| s.id().to_string()).collect();
    let mut source_addrs = Vec::with_capacity(sources.len());
    for source in &sources {
      source_addrs.push(source.local_addr().map_err(|source| ClusterError::Bind {
        role: "ingestion",
        addr: bind_addr,
        source,
      })?);
    }
    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();
    let mut liveness = Vec::with_capacity(workers.len());
    for (index, ((worker, deliveries), listener)) in workers
      .into_iter()
      .zip(receivers)
      .zip(control_listeners)
      .enumerate()
    {
      let local = LocalWorker {
        name: worker.name().to_string(),
        directory: worker.directory(),
        processing: worker.processing(),
        source_ids: if index == 0 { source_ids.clone() } else { Vec::new() },
      };
      liveness.push(worker.processing());
      let endpoint = QueryEndpoint::new(
        listener,
        local,
        members.clone(),
        aggregator.clone(),
        config.endpoint.clone(),
      );
      tasks.spawn(endpoint.serve(cancel.child_token()));
      tasks.spawn(worker.start(deliveries, cancel.child_token()));
    }
    for source in sources {
      tasks.spawn(source.run(cancel.child_token()));
    }

    info!(
      workers = members.len(),
      sources = source_addrs.len(),
      initializer = %members[0].control_addr,
      "Local cluster started"
    );

    Ok(Self {
      members,
      liveness,
      source_addrs,
      deliveries: senders,
      cancel,
      tasks,
      shutdown_grace: config.shutdown_grace,
    })
  }
}

#[async_trait]
impl ClusterHandle for LocalCluster {
  fn workers(&self) -> Vec<WorkerInfo> {
    self
      .members
      .iter()
      .zip(&self.liveness)
      .map(|(member, alive)| WorkerInfo {
        alive: alive.load(Ordering::Acquire),
        ..member.clone()
      })
      .collect()
  }

  fn source_addrs(&self) -> Vec<SocketAddr> {
    self.source_addrs.clone()
  }

  async fn shutdown(&mut self) -> Result<(), ClusterError> {
    self.cancel.cancel();
    self.deliveries.clear();
    let tasks = &mut self.tasks;
    let drained = tokio::time::timeout(self.shutdown_grace, async {
      while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
          warn!(error = %e, "Cluster task ended abnormally");
        }
      }
    })
    .await;
    match drained {
      Ok(()) => {
        info!(workers = self.members.len(), "Local cluster stopped");
        Ok(())
      }
      Err(_) => {
        let remaining = self.tasks.len();
        self.tasks.abort_all();
        Err(ClusterError::Shutdown(format!(
          "{remaining} task(s) still running after {:?}",
          self.shutdown_grace
        )))
      }
    }
  }
}

impl Drop for LocalCluster {
  fn drop(&mut self) {
    self.cancel.cancel();
  }
}

async fn bind(role: &'static str, addr: SocketAddr) -> Result<TcpListener, ClusterError> {
  TcpListener::bind(addr)
    .await
    .map_err(|source| ClusterError::Bind { role, addr, source })
}

fn local_addr(
  role: &'static str,
  addr: SocketAddr,
  listener: &TcpListener,
) -> Result<SocketAddr, ClusterError> {
  listener
    .local_addr()
    .map_err(|source| ClusterError::Bind { role, addr, source })
}
