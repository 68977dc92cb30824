//! # Cluster Status Aggregator
//!
//! Merges per-worker reports into cluster-wide answers. Merging happens only
//! when a query asks for it, never on the message-processing path.
//!
//! - State partitions are unioned per state type. Ownership is exclusive, so
//!   a key reported by two workers, or by a worker the router does not assign
//!   it to, is a [`ConsistencyViolation`].
//! - Stateless partitions are collected per partition id; several workers
//!   contributing to the same id is expected.
//!
//! Every answer is built from ordered maps, so equal cluster state always
//! serializes to the same bytes.

use crate::directory::DirectorySnapshot;
use crate::error::{ConsistencyViolation, QueryError};
use crate::partitioning::{PartitionKey, PartitionRouter, StatelessPartitionId};
use crate::query::QueryKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// What a single worker contributes to an aggregated answer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
  /// Reporting worker's name.
  pub worker: String,
  /// Whether the worker's ingest/compute loop is active.
  pub processing: bool,
  /// Ingestion points hosted by the worker.
  pub source_ids: Vec<String>,
  /// The worker's partition directory.
  pub directory: DirectorySnapshot,
}

/// `partition-query` answer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionListing {
  /// State type to worker to hosted keys.
  pub state_partitions: BTreeMap<String, BTreeMap<String, Vec<String>>>,
  /// Stateless partition id to worker to local markers.
  pub stateless_partitions: BTreeMap<StatelessPartitionId, BTreeMap<String, Vec<u64>>>,
}

/// `partition-count-query` answer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionCounts {
  /// State type to worker to number of hosted keys (workers with none omitted).
  pub state_partitions: BTreeMap<String, BTreeMap<String, usize>>,
  /// Stateless partition id to worker to messages processed.
  pub stateless_partitions: BTreeMap<StatelessPartitionId, BTreeMap<String, u64>>,
}

/// `cluster-status-query` answer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatus {
  /// True if at least one worker's loop is active.
  pub processing_messages: bool,
  /// Worker names in join order, initializer first.
  pub worker_names: Vec<String>,
  /// Number of workers.
  pub worker_count: usize,
}

/// `source-ids-query` answer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceIds {
  /// Opaque ingestion-point identifiers.
  pub source_ids: Vec<String>,
}

/// Answers queries by merging worker reports.
#[derive(Clone, Debug)]
pub struct ClusterStatusAggregator {
  roster: Vec<String>,
  router: Option<PartitionRouter>,
}

impl ClusterStatusAggregator {
  /// Creates an aggregator for workers named in join order.
  pub fn new(roster: Vec<String>) -> Self {
    Self {
      roster,
      router: None,
    }
  }

  /// Verifies that hosted keys live where `router` places them.
  #[must_use]
  pub fn with_router(mut self, router: PartitionRouter) -> Self {
    self.router = Some(router);
    self
  }

  /// Worker names in join order.
  pub fn roster(&self) -> &[String] {
    &self.roster
  }

  /// Answers `kind` from one report per roster member.
  ///
  /// # Errors
  ///
  /// Returns [`QueryError::ConsistencyViolation`] if the reports do not match
  /// the roster or a state partition key is owned inconsistently.
  pub fn answer(&self, kind: QueryKind, reports: &[WorkerReport]) -> Result<Value, QueryError> {
    let reports = self.in_roster_order(reports)?;
    if kind.reads_state_partitions() {
      self.check_state_ownership(&reports)?;
    }
    let answer = match kind {
      QueryKind::Partition => serde_json::to_value(partition_listing(&reports)),
      QueryKind::PartitionCount => serde_json::to_value(partition_counts(&reports)),
      QueryKind::ClusterStatus => serde_json::to_value(self.cluster_status(&reports)),
      QueryKind::SourceIds => serde_json::to_value(source_ids(&reports)),
      QueryKind::StateEntity => serde_json::to_value(state_entities(&reports)),
      QueryKind::StateEntityCount => serde_json::to_value(state_entity_counts(&reports)),
      QueryKind::StatelessPartition => {
        serde_json::to_value(partition_listing(&reports).stateless_partitions)
      }
      QueryKind::StatelessPartitionCount => {
        serde_json::to_value(partition_counts(&reports).stateless_partitions)
      }
      QueryKind::StateInitializerCount => serde_json::to_value(initializer_counts(&reports)),
    };
    answer.map_err(|e| QueryError::Protocol(format!("failed to encode {kind} answer: {e}")))
  }

  fn cluster_status(&self, reports: &[&WorkerReport]) -> ClusterStatus {
    ClusterStatus {
      processing_messages: reports.iter().any(|report| report.processing),
      worker_names: self.roster.clone(),
      worker_count: self.roster.len(),
    }
  }

  fn in_roster_order<'a>(
    &self,
    reports: &'a [WorkerReport],
  ) -> Result<Vec<&'a WorkerReport>, ConsistencyViolation> {
    if let Some(stranger) = reports
      .iter()
      .find(|report| !self.roster.contains(&report.worker))
    {
      return Err(ConsistencyViolation::UnknownWorker {
        worker: stranger.worker.clone(),
      });
    }
    let missing = || ConsistencyViolation::MissingReports {
      expected: self.roster.len(),
      received: reports.len(),
    };
    if reports.len() != self.roster.len() {
      return Err(missing());
    }
    self
      .roster
      .iter()
      .map(|name| {
        reports
          .iter()
          .find(|report| &report.worker == name)
          .ok_or_else(missing)
      })
      .collect()
  }

  fn check_state_ownership(&self, reports: &[&WorkerReport]) -> Result<(), ConsistencyViolation> {
    let mut owners: BTreeMap<(&str, &PartitionKey), Vec<&str>> = BTreeMap::new();
    for report in reports {
      for (state_type, keys) in report.directory.state_partitions.iter() {
        for key in keys.keys() {
          owners
            .entry((state_type.as_str(), key))
            .or_default()
            .push(report.worker.as_str());
        }
      }
    }

    for ((state_type, key), workers) in &owners {
      if workers.len() > 1 {
        return Err(ConsistencyViolation::DuplicateOwnership {
          state_type: state_type.to_string(),
          key: key.to_string(),
          owners: workers.iter().map(|w| w.to_string()).collect(),
        });
      }
    }

    let Some(router) = self
      .router
      .as_ref()
      .filter(|router| router.worker_count() == self.roster.len())
    else {
      return Ok(());
    };
    for ((state_type, key), workers) in &owners {
      let expected = &self.roster[router.worker_for_state(state_type, key)];
      let actual = workers[0];
      if expected != actual {
        return Err(ConsistencyViolation::Misrouted {
          state_type: state_type.to_string(),
          key: key.to_string(),
          expected: expected.clone(),
          actual: actual.to_string(),
        });
      }
    }
    Ok(())
  }
}

fn partition_listing(reports: &[&WorkerReport]) -> PartitionListing {
  let mut listing = PartitionListing::default();
  for report in reports {
    for (state_type, keys) in report.directory.state_partitions.iter() {
      listing
        .state_partitions
        .entry(state_type.clone())
        .or_default()
        .insert(
          report.worker.clone(),
          keys.keys().map(|key| key.to_string()).collect(),
        );
    }
    for (partition, entry) in report.directory.stateless_partitions.iter() {
      listing
        .stateless_partitions
        .entry(*partition)
        .or_default()
        .insert(report.worker.clone(), entry.markers.clone());
    }
  }
  listing
}

fn partition_counts(reports: &[&WorkerReport]) -> PartitionCounts {
  let mut counts = PartitionCounts::default();
  for report in reports {
    for (state_type, keys) in report.directory.state_partitions.iter() {
      let per_worker = counts.state_partitions.entry(state_type.clone()).or_default();
      if !keys.is_empty() {
        per_worker.insert(report.worker.clone(), keys.len());
      }
    }
    for (partition, entry) in report.directory.stateless_partitions.iter() {
      counts
        .stateless_partitions
        .entry(*partition)
        .or_default()
        .insert(report.worker.clone(), entry.messages);
    }
  }
  counts
}

fn source_ids(reports: &[&WorkerReport]) -> SourceIds {
  SourceIds {
    source_ids: reports
      .iter()
      .flat_map(|report| report.source_ids.iter().cloned())
      .collect(),
  }
}

fn state_entities(reports: &[&WorkerReport]) -> BTreeMap<String, Vec<String>> {
  distinct_keys(reports)
    .into_iter()
    .map(|(state_type, keys)| (state_type, keys.into_iter().collect()))
    .collect()
}

fn state_entity_counts(reports: &[&WorkerReport]) -> BTreeMap<String, usize> {
  distinct_keys(reports)
    .into_iter()
    .map(|(state_type, keys)| (state_type, keys.len()))
    .collect()
}

fn distinct_keys(reports: &[&WorkerReport]) -> BTreeMap<String, BTreeSet<String>> {
  let mut merged: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
  for report in reports {
    for (state_type, keys) in report.directory.state_partitions.iter() {
      merged
        .entry(state_type.clone())
        .or_default()
        .extend(keys.keys().map(|key| key.to_string()));
    }
  }
  merged
}

fn initializer_counts(reports: &[&WorkerReport]) -> BTreeMap<String, BTreeMap<String, u32>> {
  let mut merged: BTreeMap<String, BTreeMap<String, u32>> = BTreeMap::new();
  for report in reports {
    for (state_type, keys) in report.directory.state_partitions.iter() {
      let per_key = merged.entry(state_type.clone()).or_default();
      for (key, state) in keys.iter() {
        per_key.insert(key.to_string(), state.initializer_count());
      }
    }
  }
  merged
}
