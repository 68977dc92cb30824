//! # Partition Directory
//!
//! Per-worker record of the state partitions a worker hosts and the stateless
//! partitions it has processed messages for.
//!
//! The directory is written by the worker's compute loop and read by the
//! control plane. State is held in persistent [`im`] maps behind a lock that
//! is only ever held for a single map update or a single O(1) clone, so taking
//! a [`DirectorySnapshot`] never waits on message processing for longer than
//! one update and never copies the maps.
//!
//! Keys move through explicit [`KeyState`] transitions: an absent key is
//! `Uninitialized`; the first access makes it `Initialized { count: 1 }`;
//! only a recovery re-initializes it.

use crate::partitioning::{PartitionKey, StatelessPartitionId};
use im::OrdMap;
use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock};

/// Lifecycle of a state partition key on one worker.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum KeyState {
  /// The key has never been touched on this worker.
  #[default]
  Uninitialized,
  /// The key's state has been initialized `count` times.
  Initialized {
    /// Number of (re)initializations; 1 unless recovery occurred.
    count: u32,
  },
}

impl KeyState {
  /// Transition applied when the key's state is (re)initialized.
  #[must_use]
  pub fn initialize(self) -> Self {
    match self {
      KeyState::Uninitialized => KeyState::Initialized { count: 1 },
      KeyState::Initialized { count } => KeyState::Initialized {
        count: count.saturating_add(1),
      },
    }
  }

  /// Number of times the key has been initialized.
  pub fn initializer_count(self) -> u32 {
    match self {
      KeyState::Uninitialized => 0,
      KeyState::Initialized { count } => count,
    }
  }
}

/// Outcome of [`PartitionDirectory::record_state_access`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyAccess {
  /// First touch: the key was initialized.
  Created,
  /// The key already existed and was left unchanged.
  Existing,
}

/// A stateless partition as seen by one worker.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct StatelessEntry {
  /// Local markers registered for the partition (one per local step).
  pub markers: Vec<u64>,
  /// Messages processed locally for the partition.
  pub messages: u64,
}

/// Immutable copy of a worker's directory.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectorySnapshot {
  /// State type name to hosted keys.
  pub state_partitions: OrdMap<String, OrdMap<PartitionKey, KeyState>>,
  /// Stateless partition id to local entry.
  pub stateless_partitions: OrdMap<StatelessPartitionId, StatelessEntry>,
}

/// The authoritative partition record of a single worker.
#[derive(Debug, Default)]
pub struct PartitionDirectory {
  inner: RwLock<DirectorySnapshot>,
}

impl PartitionDirectory {
  /// Creates an empty directory.
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers a state type with no keys. Existing keys are kept.
  pub fn register_state_type(&self, state_type: &str) {
    self.update(|snapshot| {
      if !snapshot.state_partitions.contains_key(state_type) {
        snapshot
          .state_partitions
          .insert(state_type.to_string(), OrdMap::new());
      }
    });
  }

  /// Registers a local marker for a stateless partition.
  pub fn register_stateless_partition(&self, partition: StatelessPartitionId, marker: u64) {
    self.update(|snapshot| {
      let mut entry = snapshot
        .stateless_partitions
        .get(&partition)
        .cloned()
        .unwrap_or_default();
      if !entry.markers.contains(&marker) {
        entry.markers.push(marker);
      }
      snapshot.stateless_partitions.insert(partition, entry);
    });
  }

  /// Records an access to `key` of `state_type`.
  ///
  /// The first access initializes the key; later accesses leave it unchanged.
  pub fn record_state_access(&self, state_type: &str, key: &PartitionKey) -> KeyAccess {
    self.update_keys(state_type, |keys| {
      if keys.contains_key(key) {
        KeyAccess::Existing
      } else {
        keys.insert(key.clone(), KeyState::Uninitialized.initialize());
        KeyAccess::Created
      }
    })
  }

  /// Re-initializes `key` after its state was recovered.
  ///
  /// Returns the key's new state.
  pub fn record_recovery(&self, state_type: &str, key: &PartitionKey) -> KeyState {
    self.update_keys(state_type, |keys| {
      let next = keys.get(key).copied().unwrap_or_default().initialize();
      keys.insert(key.clone(), next);
      next
    })
  }

  /// Counts one processed message for a stateless partition.
  ///
  /// Returns the partition's new local count.
  pub fn record_stateless_access(&self, partition: StatelessPartitionId) -> u64 {
    self.update(|snapshot| {
      let mut entry = snapshot
        .stateless_partitions
        .get(&partition)
        .cloned()
        .unwrap_or_default();
      entry.messages += 1;
      let messages = entry.messages;
      snapshot.stateless_partitions.insert(partition, entry);
      messages
    })
  }

  /// Returns an immutable copy of the directory.
  pub fn snapshot(&self) -> DirectorySnapshot {
    self
      .inner
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  fn update_keys<R>(
    &self,
    state_type: &str,
    apply: impl FnOnce(&mut OrdMap<PartitionKey, KeyState>) -> R,
  ) -> R {
    self.update(|snapshot| {
      let mut keys = snapshot
        .state_partitions
        .get(state_type)
        .cloned()
        .unwrap_or_default();
      let result = apply(&mut keys);
      snapshot.state_partitions.insert(state_type.to_string(), keys);
      result
    })
  }

  fn update<R>(&self, apply: impl FnOnce(&mut DirectorySnapshot) -> R) -> R {
    let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
    apply(&mut *guard)
  }
}
