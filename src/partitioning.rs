//! # Partition Routing
//!
//! Deterministic routing of records to partitions and workers.
//!
//! - **State partitions** are exclusively owned: a `(state type, key)` pair
//!   always maps to the same worker for a given worker count. Singleton state
//!   types always live on the initializer (worker index 0).
//! - **Stateless partitions** are non-exclusive numeric buckets. A record picks
//!   its bucket by key hash; the work is then spread across workers by record
//!   sequence number.
//!
//! Hashing is 64-bit FNV-1a so the mapping is stable across processes,
//! restarts and toolchains.
//!
//! ## Usage
//!
//! ```rust
//! use clusterweave::application::StateTypeSpec;
//! use clusterweave::partitioning::{PartitionKey, PartitionRouter};
//!
//! let router = PartitionRouter::new(
//!     2,
//!     &[StateTypeSpec::partitioned("Orders"), StateTypeSpec::singleton("Totals")],
//!     "shop",
//!     1,
//! );
//! let key = PartitionKey::from("order-17");
//! assert_eq!(router.worker_for_state("Orders", &key), router.worker_for_state("Orders", &key));
//! assert_eq!(router.worker_for_state("Totals", &key), 0);
//! ```

use crate::application::{StateTypeKind, StateTypeSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Numeric identifier of a stateless partition.
pub type StatelessPartitionId = u64;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
const PART_SEPARATOR: u8 = 0xff;
// Keep ids within the exactly-representable integer range of JSON consumers.
const OPAQUE_ID_MASK: u64 = (1 << 53) - 1;

/// Partition key that selects which state instance handles a record.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(pub String);

impl PartitionKey {
  /// Creates a new partition key from a string.
  pub fn new(s: String) -> Self {
    Self(s)
  }

  /// Returns the key as a string slice.
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl From<String> for PartitionKey {
  fn from(s: String) -> Self {
    Self(s)
  }
}

impl From<&str> for PartitionKey {
  fn from(s: &str) -> Self {
    Self(s.to_string())
  }
}

impl fmt::Display for PartitionKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Deterministic 64-bit FNV-1a hash of the given bytes.
pub fn hash_partition_key(key: impl AsRef<[u8]>) -> u64 {
  fnv1a(FNV_OFFSET_BASIS, key.as_ref())
}

fn fnv1a(seed: u64, bytes: &[u8]) -> u64 {
  bytes.iter().fold(seed, |hash, byte| {
    (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
  })
}

fn hash_parts(parts: &[&str]) -> u64 {
  parts.iter().enumerate().fold(FNV_OFFSET_BASIS, |hash, (i, part)| {
    let hash = if i > 0 { fnv1a(hash, &[PART_SEPARATOR]) } else { hash };
    fnv1a(hash, part.as_bytes())
  })
}

/// Derives a stable, non-zero opaque identifier from its parts.
///
/// Used for source ids, stateless partition ids and per-worker partition
/// markers. Distinct part lists hash to distinct ids with overwhelming
/// probability; the same parts always produce the same id.
pub fn stable_id(parts: &[&str]) -> u64 {
  (hash_parts(parts) & OPAQUE_ID_MASK) | 1
}

/// Routes state keys and stateless work to workers.
///
/// Built from the application's declared state types; every worker and the
/// aggregator construct the same router from the same inputs, so they agree on
/// ownership without coordination.
#[derive(Clone, Debug)]
pub struct PartitionRouter {
  worker_count: usize,
  state_kinds: HashMap<String, StateTypeKind>,
  stateless_partitions: Vec<StatelessPartitionId>,
}

impl PartitionRouter {
  /// Creates a router for `worker_count` workers.
  ///
  /// `stateless_partition_count` buckets are derived from `application`; a
  /// count of zero leaves the application without stateless partitions.
  pub fn new(
    worker_count: usize,
    state_types: &[StateTypeSpec],
    application: &str,
    stateless_partition_count: usize,
  ) -> Self {
    let state_kinds = state_types
      .iter()
      .map(|spec| (spec.name.clone(), spec.kind))
      .collect();
    let stateless_partitions = (0..stateless_partition_count)
      .map(|index| stable_id(&[application, "stateless", index.to_string().as_str()]))
      .collect();
    Self {
      worker_count: worker_count.max(1),
      state_kinds,
      stateless_partitions,
    }
  }

  /// Number of workers the router distributes over.
  pub fn worker_count(&self) -> usize {
    self.worker_count
  }

  /// Stateless partition ids, in declaration order.
  pub fn stateless_partitions(&self) -> &[StatelessPartitionId] {
    &self.stateless_partitions
  }

  /// Returns the index of the worker that owns `key` of `state_type`.
  ///
  /// Singleton state types, and state types the router does not know, are
  /// owned by the initializer (index 0).
  pub fn worker_for_state(&self, state_type: &str, key: &PartitionKey) -> usize {
    match self.state_kinds.get(state_type) {
      Some(StateTypeKind::Partitioned) => {
        (hash_parts(&[state_type, key.as_str()]) % self.worker_count as u64) as usize
      }
      Some(StateTypeKind::Singleton) | None => 0,
    }
  }

  /// Returns the stateless partition a record with `key` belongs to.
  pub fn stateless_partition_for(&self, key: &PartitionKey) -> Option<StatelessPartitionId> {
    if self.stateless_partitions.is_empty() {
      return None;
    }
    let index = hash_partition_key(key.as_str()) % self.stateless_partitions.len() as u64;
    Some(self.stateless_partitions[index as usize])
  }

  /// Returns the worker that processes stateless record number `sequence`.
  pub fn worker_for_stateless(&self, sequence: u64) -> usize {
    (sequence % self.worker_count as u64) as usize
  }
}
