//! # Verification Harness
//!
//! Runs a [`Scenario`] against a cluster as a fixed sequence of phases:
//!
//! ```text
//! Start -> Inject -> Settle -> Query -> Assert -> Teardown
//! ```
//!
//! `Inject` is skipped when the scenario has no injection plan. A failure in
//! any phase skips the remaining ones except `Teardown`, which always runs:
//! the injection driver is cancelled and the cluster is shut down whether the
//! scenario passed or not.
//!
//! ## Settling
//!
//! Queries only see converged state once every injected record has been
//! processed. [`Settle::Fixed`] waits a fixed delay, which may legitimately
//! observe partial state if processing is slow. [`Settle::Acknowledged`] waits
//! until the driver has finished and the ingestion point has acknowledged
//! every record, which happens only after the owning workers applied them.
//!
//! ## Example
//!
//! ```rust,no_run
//! use clusterweave::application::DummyApplication;
//! use clusterweave::cluster::{ClusterConfig, LocalLauncher};
//! use clusterweave::harness::{Expectation, Scenario};
//! use clusterweave::query::QueryKind;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), clusterweave::error::HarnessError> {
//! let launcher = LocalLauncher::new(DummyApplication);
//! Scenario::new(ClusterConfig::default().with_workers(2))
//!     .expect(Expectation::equals(QueryKind::ClusterStatus, "/worker_count", json!(2)))
//!     .run(&launcher)
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::cluster::{ClusterConfig, ClusterHandle, ClusterLauncher};
use crate::endpoint::{QueryClient, RetryPolicy};
use crate::error::{HarnessError, InjectionError};
use crate::injection::{InjectionConfig, InjectionReport, Reader, Sender};
use crate::query::QueryKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A step of a scenario run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
  /// Launch the cluster.
  Start,
  /// Start the injection driver.
  Inject,
  /// Wait for convergence.
  Settle,
  /// Issue queries.
  Query,
  /// Check expectations against the answers.
  Assert,
  /// Stop the driver and the cluster.
  Teardown,
}

impl fmt::Display for Phase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Phase::Start => "start",
      Phase::Inject => "inject",
      Phase::Settle => "settle",
      Phase::Query => "query",
      Phase::Assert => "assert",
      Phase::Teardown => "teardown",
    };
    f.write_str(name)
  }
}

/// How the harness decides the cluster has converged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Settle {
  /// Wait a fixed delay after starting injection.
  Fixed(Duration),
  /// Wait until every injected record is acknowledged, up to `timeout`.
  Acknowledged {
    /// Upper bound on the wait.
    timeout: Duration,
  },
}

impl Default for Settle {
  fn default() -> Self {
    Settle::Fixed(Duration::from_millis(500))
  }
}

/// A check against one query answer.
///
/// `pointer` is a JSON pointer (RFC 6901) into the answer; `""` selects the
/// whole answer.
#[derive(Clone, Debug, PartialEq)]
pub enum Expectation {
  /// The selected value equals `expected` exactly.
  Equals {
    /// Query kind to check.
    kind: QueryKind,
    /// Location in the answer.
    pointer: String,
    /// Expected value.
    expected: Value,
  },
  /// The selected array or object has exactly `len` entries.
  Cardinality {
    /// Query kind to check.
    kind: QueryKind,
    /// Location in the answer.
    pointer: String,
    /// Expected entry count.
    len: usize,
  },
  /// The selected object has exactly these keys.
  Keys {
    /// Query kind to check.
    kind: QueryKind,
    /// Location in the answer.
    pointer: String,
    /// Expected keys, in any order.
    keys: BTreeSet<String>,
  },
  /// The numbers in the selected object or array sum to `total`.
  Total {
    /// Query kind to check.
    kind: QueryKind,
    /// Location in the answer.
    pointer: String,
    /// Expected sum.
    total: u64,
  },
}

impl Expectation {
  /// Expects the value at `pointer` to equal `expected`.
  pub fn equals(kind: QueryKind, pointer: impl Into<String>, expected: Value) -> Self {
    Expectation::Equals {
      kind,
      pointer: pointer.into(),
      expected,
    }
  }

  /// Expects the array or object at `pointer` to have `len` entries.
  pub fn cardinality(kind: QueryKind, pointer: impl Into<String>, len: usize) -> Self {
    Expectation::Cardinality {
      kind,
      pointer: pointer.into(),
      len,
    }
  }

  /// Expects the object at `pointer` to have exactly `keys`.
  pub fn keys<I, S>(kind: QueryKind, pointer: impl Into<String>, keys: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Expectation::Keys {
      kind,
      pointer: pointer.into(),
      keys: keys.into_iter().map(Into::into).collect(),
    }
  }

  /// Expects the numbers at `pointer` to sum to `total`.
  pub fn total(kind: QueryKind, pointer: impl Into<String>, total: u64) -> Self {
    Expectation::Total {
      kind,
      pointer: pointer.into(),
      total,
    }
  }

  /// Query kind this expectation reads.
  pub fn kind(&self) -> QueryKind {
    match self {
      Expectation::Equals { kind, .. }
      | Expectation::Cardinality { kind, .. }
      | Expectation::Keys { kind, .. }
      | Expectation::Total { kind, .. } => *kind,
    }
  }

  fn pointer(&self) -> &str {
    match self {
      Expectation::Equals { pointer, .. }
      | Expectation::Cardinality { pointer, .. }
      | Expectation::Keys { pointer, .. }
      | Expectation::Total { pointer, .. } => pointer,
    }
  }

  /// Checks the expectation against `answer`.
  pub fn check(&self, answer: &Value) -> Result<(), HarnessError> {
    let selected = answer.pointer(self.pointer());
    let (expected, actual) = match self {
      Expectation::Equals { expected, .. } => (expected.clone(), selected.cloned()),
      Expectation::Cardinality { len, .. } => (json!(len), selected.and_then(entry_count).map(Value::from)),
      Expectation::Keys { keys, .. } => (
        json!(keys),
        selected
          .and_then(Value::as_object)
          .map(|object| json!(object.keys().collect::<BTreeSet<_>>())),
      ),
      Expectation::Total { total, .. } => (json!(total), selected.and_then(sum).map(Value::from)),
    };
    let actual = actual.unwrap_or(Value::Null);
    if actual == expected {
      return Ok(());
    }
    Err(HarnessError::AssertionFailed {
      kind: self.kind(),
      pointer: self.pointer().to_string(),
      expected,
      actual,
    })
  }
}

fn entry_count(value: &Value) -> Option<usize> {
  match value {
    Value::Array(items) => Some(items.len()),
    Value::Object(entries) => Some(entries.len()),
    _ => None,
  }
}

fn sum(value: &Value) -> Option<u64> {
  match value {
    Value::Array(items) => items.iter().map(Value::as_u64).sum(),
    Value::Object(entries) => entries.values().map(Value::as_u64).sum(),
    other => other.as_u64(),
  }
}

/// Timing of one executed phase.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
  /// The phase.
  pub phase: Phase,
  /// When it started.
  pub started_at: DateTime<Utc>,
  /// When it finished.
  pub finished_at: DateTime<Utc>,
  /// Whether it completed without error.
  pub succeeded: bool,
}

/// Result of a passing scenario.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HarnessReport {
  /// Answer per issued query kind.
  pub answers: BTreeMap<QueryKind, Value>,
  /// Driver outcome, when the scenario injected data and the driver finished.
  pub injection: Option<InjectionReport>,
  /// Executed phases, in order.
  pub phases: Vec<PhaseRecord>,
}

impl HarnessReport {
  /// Returns the answer for `kind`, if it was issued.
  pub fn answer(&self, kind: QueryKind) -> Option<&Value> {
    self.answers.get(&kind)
  }

  fn record(&mut self, phase: Phase, started_at: DateTime<Utc>, succeeded: bool) {
    let finished_at = Utc::now();
    info!(
      phase = %phase,
      succeeded,
      elapsed_ms = (finished_at - started_at).num_milliseconds(),
      "Harness phase finished"
    );
    self.phases.push(PhaseRecord {
      phase,
      started_at,
      finished_at,
      succeeded,
    });
  }
}

struct InjectionPlan {
  source: usize,
  reader: Reader,
  config: InjectionConfig,
}

struct RunningInjection {
  cancel: CancellationToken,
  handle: JoinHandle<Result<InjectionReport, InjectionError>>,
}

/// A cluster lifecycle with optional injection, queries and expectations.
pub struct Scenario {
  cluster: ClusterConfig,
  injection: Option<InjectionPlan>,
  settle: Settle,
  queries: BTreeSet<QueryKind>,
  expectations: Vec<Expectation>,
  target_worker: usize,
  query_timeout: Duration,
  query_retry: RetryPolicy,
}

impl Scenario {
  /// Creates a scenario that starts a cluster with `cluster`.
  pub fn new(cluster: ClusterConfig) -> Self {
    Self {
      cluster,
      injection: None,
      settle: Settle::default(),
      queries: BTreeSet::new(),
      expectations: Vec::new(),
      target_worker: 0,
      query_timeout: Duration::from_secs(10),
      query_retry: RetryPolicy::default(),
    }
  }

  /// Injects the records `reader` yields into ingestion source `source`.
  #[must_use]
  pub fn with_injection(mut self, source: usize, reader: Reader, config: InjectionConfig) -> Self {
    self.injection = Some(InjectionPlan {
      source,
      reader,
      config,
    });
    self
  }

  /// Sets the convergence strategy.
  #[must_use]
  pub fn with_settle(mut self, settle: Settle) -> Self {
    self.settle = settle;
    self
  }

  /// Issues `kind` even if no expectation reads it.
  #[must_use]
  pub fn query(mut self, kind: QueryKind) -> Self {
    self.queries.insert(kind);
    self
  }

  /// Adds an expectation; its query kind is issued automatically.
  #[must_use]
  pub fn expect(mut self, expectation: Expectation) -> Self {
    self.queries.insert(expectation.kind());
    self.expectations.push(expectation);
    self
  }

  /// Sends queries to the worker at roster index `index` (default: the initializer).
  #[must_use]
  pub fn with_target_worker(mut self, index: usize) -> Self {
    self.target_worker = index;
    self
  }

  /// Sets the query client's timeout and retry policy.
  #[must_use]
  pub fn with_query_client(mut self, timeout: Duration, retry: RetryPolicy) -> Self {
    self.query_timeout = timeout;
    self.query_retry = retry;
    self
  }

  /// Runs every phase and tears the cluster down.
  ///
  /// # Errors
  ///
  /// The first failure of any phase; [`HarnessError::AssertionFailed`] names
  /// the query kind, location, expected and actual values. A teardown failure
  /// is returned only when every other phase passed.
  pub async fn run(mut self, launcher: &dyn ClusterLauncher) -> Result<HarnessReport, HarnessError> {
    let mut report = HarnessReport::default();

    let started_at = Utc::now();
    let launched = launcher.launch(&self.cluster).await;
    report.record(Phase::Start, started_at, launched.is_ok());
    let mut cluster = launched?;

    let mut injection = None;
    let outcome = self.drive(cluster.as_ref(), &mut injection, &mut report).await;
    if let Err(e) = &outcome {
      error!(error = %e, "Scenario failed");
    }

    let started_at = Utc::now();
    let teardown = Self::teardown(cluster.as_mut(), injection, &mut report).await;
    report.record(Phase::Teardown, started_at, teardown.is_ok());

    match (outcome, teardown) {
      (Ok(()), Ok(())) => Ok(report),
      (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
      (Err(e), Err(teardown)) => {
        warn!(error = %teardown, "Teardown failed after scenario failure");
        Err(e)
      }
    }
  }

  async fn drive(
    &mut self,
    cluster: &dyn ClusterHandle,
    injection: &mut Option<RunningInjection>,
    report: &mut HarnessReport,
  ) -> Result<(), HarnessError> {
    if let Some(plan) = self.injection.take() {
      let started_at = Utc::now();
      let started = Self::start_injection(cluster, plan);
      report.record(Phase::Inject, started_at, started.is_ok());
      *injection = Some(started?);
    }

    let started_at = Utc::now();
    let settled = self.wait_for_convergence(injection, report).await;
    report.record(Phase::Settle, started_at, settled.is_ok());
    settled?;

    let started_at = Utc::now();
    let answered = self.issue_queries(cluster).await;
    report.record(Phase::Query, started_at, answered.is_ok());
    report.answers = answered?;

    let started_at = Utc::now();
    let asserted = self.assert(&report.answers);
    report.record(Phase::Assert, started_at, asserted.is_ok());
    asserted
  }

  fn start_injection(
    cluster: &dyn ClusterHandle,
    plan: InjectionPlan,
  ) -> Result<RunningInjection, HarnessError> {
    let addrs = cluster.source_addrs();
    let addr = addrs.get(plan.source).copied().ok_or_else(|| {
      HarnessError::InvalidScenario(format!(
        "injection source {} does not exist (cluster has {})",
        plan.source,
        addrs.len()
      ))
    })?;
    info!(address = %addr, source = plan.source, "Starting injection");
    let cancel = CancellationToken::new();
    let sender = Sender::new(addr, plan.reader, plan.config).with_cancellation(cancel.clone());
    Ok(RunningInjection {
      cancel,
      handle: tokio::spawn(sender.run()),
    })
  }

  async fn wait_for_convergence(
    &self,
    injection: &mut Option<RunningInjection>,
    report: &mut HarnessReport,
  ) -> Result<(), HarnessError> {
    let Some(running) = injection.as_mut() else {
      return Ok(());
    };
    match self.settle {
      Settle::Fixed(delay) => {
        debug!(delay_ms = delay.as_millis() as u64, "Settling for a fixed delay");
        tokio::time::sleep(delay).await;
        Ok(())
      }
      Settle::Acknowledged { timeout } => {
        let joined = tokio::time::timeout(timeout, &mut running.handle)
          .await
          .map_err(|_| HarnessError::SettleTimeout(timeout))?;
        *injection = None;
        let injected = joined.map_err(|e| HarnessError::TaskFailed(e.to_string()))??;
        info!(acknowledged = injected.acknowledged, "Injection acknowledged");
        report.injection = Some(injected);
        Ok(())
      }
    }
  }

  async fn issue_queries(
    &self,
    cluster: &dyn ClusterHandle,
  ) -> Result<BTreeMap<QueryKind, Value>, HarnessError> {
    let workers = cluster.workers();
    let target = workers.get(self.target_worker).ok_or_else(|| {
      HarnessError::InvalidScenario(format!(
        "target worker {} does not exist (cluster has {})",
        self.target_worker,
        workers.len()
      ))
    })?;
    let client = QueryClient::new(target.control_addr)
      .with_timeout(self.query_timeout)
      .with_retry(self.query_retry.clone());

    let mut answers = BTreeMap::new();
    for kind in &self.queries {
      let answer = client
        .query_json(*kind)
        .await
        .map_err(|source| HarnessError::Query { kind: *kind, source })?;
      debug!(kind = %kind, worker = %target.name, "Query answered");
      answers.insert(*kind, answer);
    }
    Ok(answers)
  }

  fn assert(&self, answers: &BTreeMap<QueryKind, Value>) -> Result<(), HarnessError> {
    for expectation in &self.expectations {
      let kind = expectation.kind();
      let answer = answers.get(&kind).unwrap_or(&Value::Null);
      if let Err(e) = expectation.check(answer) {
        if let HarnessError::AssertionFailed {
          kind,
          pointer,
          expected,
          actual,
        } = &e
        {
          error!(
            kind = %kind,
            pointer = %pointer,
            expected = %expected,
            actual = %actual,
            "Expectation failed"
          );
        }
        return Err(e);
      }
    }
    Ok(())
  }

  async fn teardown(
    cluster: &mut dyn ClusterHandle,
    injection: Option<RunningInjection>,
    report: &mut HarnessReport,
  ) -> Result<(), HarnessError> {
    let mut failed = None;
    let mut pending = None;
    if let Some(running) = injection {
      if running.handle.is_finished() {
        match running.handle.await {
          Ok(Ok(injected)) => report.injection = Some(injected),
          Ok(Err(e)) => failed = Some(HarnessError::Injection(e)),
          Err(e) => failed = Some(HarnessError::TaskFailed(e.to_string())),
        }
      } else {
        running.cancel.cancel();
        pending = Some(running.handle);
      }
    }

    let shutdown = cluster.shutdown().await;

    if let Some(handle) = pending {
      match handle.await {
        Ok(Ok(injected)) => report.injection = Some(injected),
        Ok(Err(e)) => {
          warn!(error = %e, "Injection failed before teardown stopped it");
          failed = Some(HarnessError::Injection(e));
        }
        Err(e) => {
          warn!(error = %e, "Injection task failed during teardown");
          failed = Some(HarnessError::TaskFailed(e.to_string()));
        }
      }
    }

    shutdown?;
    match failed {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }
}
