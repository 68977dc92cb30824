//! Application contract consumed by the cluster: which state types exist, how
//! many stateless partitions there are, how an ingested payload decodes and
//! which state partitions a record touches.
//!
//! [`DummyApplication`] is the reference application used by the harness
//! tests: every record touches the singleton `DummyState` (key `"key"`) and
//! `PartitionedDummyState` keyed by the record's 2-byte tag.

use crate::partitioning::PartitionKey;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a state type's keys are placed across workers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StateTypeKind {
  /// Keys are hashed across all workers.
  Partitioned,
  /// All keys live on the initializer.
  Singleton,
}

/// Declaration of a named state type.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StateTypeSpec {
  /// State type name, unique within the application.
  pub name: String,
  /// Placement of its keys.
  pub kind: StateTypeKind,
}

impl StateTypeSpec {
  /// Declares a partitioned state type.
  pub fn partitioned(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      kind: StateTypeKind::Partitioned,
    }
  }

  /// Declares a singleton state type.
  pub fn singleton(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      kind: StateTypeKind::Singleton,
    }
  }
}

/// A decoded ingestion payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DecodedRecord {
  /// Key the record is partitioned by.
  pub key: PartitionKey,
  /// Application value carried alongside the key.
  pub value: u32,
}

/// A state partition touched by a record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StateAccess {
  /// State type name.
  pub state_type: String,
  /// Partition key within that state type.
  pub key: PartitionKey,
}

/// Error decoding an ingestion payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
  /// Payload has the wrong size.
  #[error("expected a {expected}-byte payload, got {actual} bytes")]
  Length {
    /// Required size.
    expected: usize,
    /// Received size.
    actual: usize,
  },
  /// Tag bytes are not valid UTF-8.
  #[error("tag is not valid utf-8")]
  InvalidTag,
}

/// The application running on every worker.
pub trait Application: Send + Sync + 'static {
  /// Application name; seeds stateless partition ids.
  fn name(&self) -> &str;

  /// State types, registered on every worker at startup.
  fn state_types(&self) -> Vec<StateTypeSpec>;

  /// Number of stateless partitions.
  fn stateless_partition_count(&self) -> usize;

  /// Decodes one ingestion payload (without its length prefix).
  fn decode(&self, payload: &[u8]) -> Result<DecodedRecord, DecodeError>;

  /// State partitions touched by `record`.
  fn partition(&self, record: &DecodedRecord) -> Vec<StateAccess>;
}

/// Reference application with one singleton and one partitioned state type.
#[derive(Clone, Copy, Debug, Default)]
pub struct DummyApplication;

impl DummyApplication {
  /// Singleton state type; always holds the single key `"key"`.
  pub const SINGLETON_STATE: &'static str = "DummyState";
  /// Partitioned state type keyed by the record tag.
  pub const PARTITIONED_STATE: &'static str = "PartitionedDummyState";
  /// Key used for the singleton state.
  pub const SINGLETON_KEY: &'static str = "key";
  /// Number of stateless partitions the application declares.
  pub const STATELESS_PARTITIONS: usize = 2;

  const TAG_LEN: usize = 2;
  const PAYLOAD_LEN: usize = Self::TAG_LEN + 4;

  /// Encodes `tag` and `value` as a 2-byte tag followed by a big-endian `u32`.
  ///
  /// Tags shorter than two bytes are NUL-padded, longer tags are truncated.
  pub fn encode(tag: &str, value: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(Self::PAYLOAD_LEN);
    let mut tag_bytes = [0u8; Self::TAG_LEN];
    for (slot, byte) in tag_bytes.iter_mut().zip(tag.as_bytes()) {
      *slot = *byte;
    }
    buf.put_slice(&tag_bytes);
    buf.put_u32(value);
    buf.freeze()
  }
}

impl Application for DummyApplication {
  fn name(&self) -> &str {
    "dummy"
  }

  fn state_types(&self) -> Vec<StateTypeSpec> {
    vec![
      StateTypeSpec::singleton(Self::SINGLETON_STATE),
      StateTypeSpec::partitioned(Self::PARTITIONED_STATE),
    ]
  }

  fn stateless_partition_count(&self) -> usize {
    Self::STATELESS_PARTITIONS
  }

  fn decode(&self, payload: &[u8]) -> Result<DecodedRecord, DecodeError> {
    if payload.len() != Self::PAYLOAD_LEN {
      return Err(DecodeError::Length {
        expected: Self::PAYLOAD_LEN,
        actual: payload.len(),
      });
    }
    let (tag, mut value) = payload.split_at(Self::TAG_LEN);
    let tag = std::str::from_utf8(tag).map_err(|_| DecodeError::InvalidTag)?;
    Ok(DecodedRecord {
      key: PartitionKey::from(tag.trim_end_matches('\0')),
      value: value.get_u32(),
    })
  }

  fn partition(&self, record: &DecodedRecord) -> Vec<StateAccess> {
    vec![
      StateAccess {
        state_type: Self::SINGLETON_STATE.to_string(),
        key: PartitionKey::from(Self::SINGLETON_KEY),
      },
      StateAccess {
        state_type: Self::PARTITIONED_STATE.to_string(),
        key: record.key.clone(),
      },
    ]
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_encode_pads_single_character_tag() {
    let bytes = DummyApplication::encode("A", 1);
    assert_eq!(bytes.as_ref(), &[b'A', 0, 0, 0, 0, 1]);
  }

  #[test]
  fn test_decode_strips_padding() {
    let app = DummyApplication;
    let record = app.decode(&DummyApplication::encode("B", 7)).unwrap();
    assert_eq!(record.key, PartitionKey::from("B"));
    assert_eq!(record.value, 7);
  }

  #[test]
  fn test_decode_rejects_short_payload() {
    let app = DummyApplication;
    assert_eq!(
      app.decode(&[b'A', 0, 1]),
      Err(DecodeError::Length {
        expected: 6,
        actual: 3
      })
    );
  }

  #[test]
  fn test_partition_touches_both_state_types() {
    let app = DummyApplication;
    let record = app.decode(&DummyApplication::encode("C", 1)).unwrap();
    let accesses = app.partition(&record);
    assert_eq!(accesses.len(), 2);
    assert_eq!(accesses[0].state_type, "DummyState");
    assert_eq!(accesses[0].key.as_str(), "key");
    assert_eq!(accesses[1].state_type, "PartitionedDummyState");
    assert_eq!(accesses[1].key.as_str(), "C");
  }
}
