//! # Error Taxonomy
//!
//! Errors raised by the introspection subsystem, grouped by the component that
//! produces them:
//!
//! - **[`QueryError`]**: control-plane queries (`UnknownQuery`, `QueryUnreachable`,
//!   `ConsistencyViolation`, protocol failures)
//! - **[`ConsistencyViolation`]**: structural partitioning bugs detected while
//!   merging worker directories. Never repaired, always surfaced verbatim.
//! - **[`InjectionError`]**: the data injection driver (`InjectionAborted`)
//! - **[`ClusterError`]**: cluster lifecycle (bind, launch, shutdown)
//! - **[`HarnessError`]**: the verification harness, wrapping the above plus
//!   assertion failures
//!
//! Only `QueryUnreachable` is retried (by [`QueryClient`](crate::endpoint::QueryClient)),
//! and only a bounded number of times. Everything else propagates unchanged.

use crate::query::QueryKind;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;

/// A structural partitioning bug found while merging worker directories.
///
/// Serializable so a worker that detects a violation while aggregating can
/// hand it to the remote caller unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "violation", rename_all = "kebab-case")]
pub enum ConsistencyViolation {
  /// The same state partition key is hosted by more than one worker.
  #[error("state partition {state_type}/{key} is owned by multiple workers: {owners:?}")]
  DuplicateOwnership {
    /// State type name.
    state_type: String,
    /// Partition key.
    key: String,
    /// Every worker that reported the key, in roster order.
    owners: Vec<String>,
  },
  /// A worker hosts a key the routing function assigns to another worker.
  #[error("state partition {state_type}/{key} is hosted by {actual} but routes to {expected}")]
  Misrouted {
    /// State type name.
    state_type: String,
    /// Partition key.
    key: String,
    /// Worker the router assigns the key to.
    expected: String,
    /// Worker that reported the key.
    actual: String,
  },
  /// A report came from a worker that is not part of the cluster roster.
  #[error("report from {worker}, which is not a cluster member")]
  UnknownWorker {
    /// Name the report carried.
    worker: String,
  },
  /// The number of reports does not match the roster.
  #[error("expected reports from {expected} workers, received {received}")]
  MissingReports {
    /// Roster size.
    expected: usize,
    /// Reports received.
    received: usize,
  },
}

/// Errors returned by control-plane queries.
#[derive(Error, Debug)]
pub enum QueryError {
  /// The query kind is not one the endpoint serves. Not retried.
  #[error("unknown query kind: {0}")]
  UnknownQuery(String),
  /// The control plane could not be reached after exhausting retries.
  #[error("control plane at {addr} unreachable after {attempts} attempt(s): {reason}")]
  QueryUnreachable {
    /// Address that was queried.
    addr: SocketAddr,
    /// Connection attempts made.
    attempts: u32,
    /// Last transport failure.
    reason: String,
  },
  /// The merged cluster view is inconsistent.
  #[error("consistency violation: {0}")]
  ConsistencyViolation(#[from] ConsistencyViolation),
  /// The peer answered with something that is not a valid control-plane message.
  #[error("control plane protocol error: {0}")]
  Protocol(String),
}

impl QueryError {
  /// Returns true if retrying the same query could succeed.
  pub fn is_retryable(&self) -> bool {
    matches!(self, QueryError::QueryUnreachable { .. })
  }
}

/// Errors returned by the data injection driver.
#[derive(Error, Debug)]
pub enum InjectionError {
  /// Transport lost and reconnects exhausted (or disabled).
  #[error("injection into {addr} aborted after {sent} acknowledged record(s): {reason}")]
  InjectionAborted {
    /// Ingestion address.
    addr: SocketAddr,
    /// Records acknowledged by the ingestion point before the abort.
    sent: u64,
    /// Last transport failure.
    reason: String,
  },
  /// The driver configuration cannot be used.
  #[error("invalid injection config: {0}")]
  InvalidConfig(String),
}

/// Errors raised while starting or stopping a cluster.
#[derive(Error, Debug)]
pub enum ClusterError {
  /// The cluster configuration cannot be used.
  #[error("invalid cluster config: {0}")]
  InvalidConfig(String),
  /// A listener could not be bound.
  #[error("failed to bind {role} listener on {addr}: {source}")]
  Bind {
    /// What the listener serves (control plane or ingestion).
    role: &'static str,
    /// Requested address.
    addr: SocketAddr,
    /// Underlying I/O error.
    #[source]
    source: std::io::Error,
  },
  /// Tasks did not stop within the shutdown grace period.
  #[error("cluster shutdown incomplete: {0}")]
  Shutdown(String),
}

/// Errors raised by the verification harness.
#[derive(Error, Debug)]
pub enum HarnessError {
  /// Cluster lifecycle failure.
  #[error(transparent)]
  Cluster(#[from] ClusterError),
  /// Injection failure.
  #[error(transparent)]
  Injection(#[from] InjectionError),
  /// A query failed.
  #[error("{kind} failed: {source}")]
  Query {
    /// Query kind that failed.
    kind: QueryKind,
    /// Underlying query error.
    #[source]
    source: QueryError,
  },
  /// An answer did not match its expectation.
  #[error("{kind} at '{pointer}': expected {expected}, got {actual}")]
  AssertionFailed {
    /// Query kind whose answer diverged.
    kind: QueryKind,
    /// JSON pointer into the answer ("" for the whole answer).
    pointer: String,
    /// Expected value.
    expected: serde_json::Value,
    /// Actual value (`null` when the pointer did not resolve).
    actual: serde_json::Value,
  },
  /// The scenario references something the cluster does not have.
  #[error("invalid scenario: {0}")]
  InvalidScenario(String),
  /// Acknowledgements did not reach the injected count in time.
  #[error("settle timed out after {0:?}")]
  SettleTimeout(std::time::Duration),
  /// The injection task panicked or was aborted.
  #[error("injection task failed: {0}")]
  TaskFailed(String),
}
