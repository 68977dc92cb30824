//! # Control-Plane Queries
//!
//! Query kinds, output formats and the request/response messages exchanged
//! with a worker's control-plane endpoint.
//!
//! Messages are JSON documents carried in length-delimited frames (4-byte
//! big-endian length prefix). A client sends one [`ControlRequest`] per frame
//! and receives exactly one [`ControlResponse`] frame back.

use crate::aggregator::WorkerReport;
use crate::error::{ConsistencyViolation, QueryError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::str::FromStr;

/// The fixed set of introspection queries.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum QueryKind {
  /// Structural listing of state and stateless partitions per worker.
  #[serde(rename = "partition-query")]
  Partition,
  /// Per-worker key counts and stateless message counts.
  #[serde(rename = "partition-count-query")]
  PartitionCount,
  /// Worker roster and processing flag.
  #[serde(rename = "cluster-status-query")]
  ClusterStatus,
  /// Opaque ingestion-point identifiers.
  #[serde(rename = "source-ids-query")]
  SourceIds,
  /// Keys per state type, flattened across workers.
  #[serde(rename = "state-entity-query")]
  StateEntity,
  /// Distinct key count per state type.
  #[serde(rename = "state-entity-count-query")]
  StateEntityCount,
  /// Per-worker markers per stateless partition.
  #[serde(rename = "stateless-partition-query")]
  StatelessPartition,
  /// Per-worker message counts per stateless partition.
  #[serde(rename = "stateless-partition-count-query")]
  StatelessPartitionCount,
  /// Initialization count per state key.
  #[serde(rename = "state-initializer-count-query")]
  StateInitializerCount,
}

impl QueryKind {
  /// Every query kind, in documentation order.
  pub const ALL: [QueryKind; 9] = [
    QueryKind::Partition,
    QueryKind::PartitionCount,
    QueryKind::ClusterStatus,
    QueryKind::SourceIds,
    QueryKind::StateEntity,
    QueryKind::StateEntityCount,
    QueryKind::StatelessPartition,
    QueryKind::StatelessPartitionCount,
    QueryKind::StateInitializerCount,
  ];

  /// Wire name of the query kind.
  pub fn as_str(self) -> &'static str {
    match self {
      QueryKind::Partition => "partition-query",
      QueryKind::PartitionCount => "partition-count-query",
      QueryKind::ClusterStatus => "cluster-status-query",
      QueryKind::SourceIds => "source-ids-query",
      QueryKind::StateEntity => "state-entity-query",
      QueryKind::StateEntityCount => "state-entity-count-query",
      QueryKind::StatelessPartition => "stateless-partition-query",
      QueryKind::StatelessPartitionCount => "stateless-partition-count-query",
      QueryKind::StateInitializerCount => "state-initializer-count-query",
    }
  }

  /// Returns true if answering requires merging state partitions.
  pub fn reads_state_partitions(self) -> bool {
    !matches!(self, QueryKind::ClusterStatus | QueryKind::SourceIds)
  }
}

impl fmt::Display for QueryKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for QueryKind {
  type Err = QueryError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    QueryKind::ALL
      .into_iter()
      .find(|kind| kind.as_str() == s)
      .ok_or_else(|| QueryError::UnknownQuery(s.to_string()))
  }
}

/// How an answer body is rendered.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
  /// Compact JSON object.
  #[default]
  Json,
  /// Indented `key: value` text.
  Human,
}

impl OutputFormat {
  /// Renders an answer in this format.
  pub fn render(self, answer: &Value) -> String {
    match self {
      OutputFormat::Json => answer.to_string(),
      OutputFormat::Human => render_human(answer),
    }
  }
}

/// Request sent to a control-plane endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "kebab-case")]
pub enum ControlRequest {
  /// Cluster-wide query. The kind travels as its wire name so an unknown
  /// kind reaches the endpoint and is rejected there.
  Query {
    /// Query kind wire name.
    kind: String,
    /// Rendering of the answer body.
    #[serde(default)]
    format: OutputFormat,
  },
  /// The receiving worker's own report, used by peers while aggregating.
  WorkerReport,
}

/// Response returned by a control-plane endpoint.
///
/// Externally tagged: reports carry maps keyed by numeric partition id, which
/// an internally tagged enum cannot read back.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlResponse {
  /// Complete answer to a query, rendered in the requested format.
  Answer {
    /// Rendered answer.
    body: String,
  },
  /// The worker's local report.
  WorkerReport {
    /// Report payload.
    report: WorkerReport,
  },
  /// The request failed.
  Error {
    /// Failure detail.
    error: WireError,
  },
}

/// A [`QueryError`] in transferable form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "kebab-case")]
pub enum WireError {
  /// See [`QueryError::UnknownQuery`].
  UnknownQuery {
    /// Rejected kind.
    kind: String,
  },
  /// See [`QueryError::QueryUnreachable`]; raised when a peer was unreachable.
  Unreachable {
    /// Peer address.
    addr: SocketAddr,
    /// Attempts made.
    attempts: u32,
    /// Last failure.
    reason: String,
  },
  /// See [`QueryError::ConsistencyViolation`].
  Consistency {
    /// The violation, unchanged.
    violation: ConsistencyViolation,
  },
  /// See [`QueryError::Protocol`].
  Protocol {
    /// Failure detail.
    message: String,
  },
}

impl From<&QueryError> for WireError {
  fn from(err: &QueryError) -> Self {
    match err {
      QueryError::UnknownQuery(kind) => WireError::UnknownQuery { kind: kind.clone() },
      QueryError::QueryUnreachable {
        addr,
        attempts,
        reason,
      } => WireError::Unreachable {
        addr: *addr,
        attempts: *attempts,
        reason: reason.clone(),
      },
      QueryError::ConsistencyViolation(violation) => WireError::Consistency {
        violation: violation.clone(),
      },
      QueryError::Protocol(message) => WireError::Protocol {
        message: message.clone(),
      },
    }
  }
}

impl From<WireError> for QueryError {
  fn from(err: WireError) -> Self {
    match err {
      WireError::UnknownQuery { kind } => QueryError::UnknownQuery(kind),
      WireError::Unreachable {
        addr,
        attempts,
        reason,
      } => QueryError::QueryUnreachable {
        addr,
        attempts,
        reason,
      },
      WireError::Consistency { violation } => QueryError::ConsistencyViolation(violation),
      WireError::Protocol { message } => QueryError::Protocol(message),
    }
  }
}

/// Renders a JSON answer as indented `key: value` lines.
///
/// ```rust
/// use clusterweave::query::render_human;
///
/// let answer = serde_json::json!({"worker_count": 2, "worker_names": ["initializer", "worker1"]});
/// assert_eq!(
///     render_human(&answer),
///     "worker_count: 2\nworker_names:\n  - initializer\n  - worker1\n"
/// );
/// ```
pub fn render_human(answer: &Value) -> String {
  let mut out = String::new();
  render_value(answer, 0, &mut out);
  out
}

fn render_value(value: &Value, depth: usize, out: &mut String) {
  let pad = "  ".repeat(depth);
  match value {
    Value::Object(map) => {
      for (key, child) in map {
        match scalar_text(child) {
          Some(text) => {
            let _ = writeln!(out, "{pad}{key}: {text}");
          }
          None => {
            let _ = writeln!(out, "{pad}{key}:");
            render_value(child, depth + 1, out);
          }
        }
      }
    }
    Value::Array(items) => {
      for item in items {
        match scalar_text(item) {
          Some(text) => {
            let _ = writeln!(out, "{pad}- {text}");
          }
          None => {
            let _ = writeln!(out, "{pad}-");
            render_value(item, depth + 1, out);
          }
        }
      }
    }
    scalar => {
      let _ = writeln!(out, "{pad}{}", scalar_text(scalar).unwrap_or_default());
    }
  }
}

fn scalar_text(value: &Value) -> Option<String> {
  match value {
    Value::Null => Some("null".to_string()),
    Value::Bool(b) => Some(b.to_string()),
    Value::Number(n) => Some(n.to_string()),
    Value::String(s) => Some(s.clone()),
    Value::Array(items) if items.is_empty() => Some("[]".to_string()),
    Value::Object(map) if map.is_empty() => Some("{}".to_string()),
    Value::Array(_) | Value::Object(_) => None,
  }
}
