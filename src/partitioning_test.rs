//! Tests for partition routing.

use crate::application::StateTypeSpec;
use crate::partitioning::{PartitionKey, PartitionRouter, hash_partition_key, stable_id};
use std::collections::BTreeSet;

fn router(workers: usize) -> PartitionRouter {
  PartitionRouter::new(
    workers,
    &[
      StateTypeSpec::singleton("DummyState"),
      StateTypeSpec::partitioned("PartitionedDummyState"),
    ],
    "dummy",
    2,
  )
}

#[test]
fn test_hash_is_fnv1a() {
  // Published FNV-1a 64 test vectors.
  assert_eq!(hash_partition_key(""), 0xcbf2_9ce4_8422_2325);
  assert_eq!(hash_partition_key("a"), 0xaf63_dc4c_8601_ec8c);
}

#[test]
fn test_stable_id_is_deterministic_and_nonzero() {
  let a = stable_id(&["dummy", "source", "0"]);
  assert_eq!(a, stable_id(&["dummy", "source", "0"]));
  assert_ne!(a, 0);
  assert!(a < (1 << 53));
}

#[test]
fn test_stable_id_separates_parts() {
  assert_ne!(stable_id(&["ab", "c"]), stable_id(&["a", "bc"]));
}

#[test]
fn test_singleton_routes_to_initializer() {
  let r = router(4);
  for key in ["key", "A", "B", "zzz"] {
    assert_eq!(r.worker_for_state("DummyState", &PartitionKey::from(key)), 0);
  }
}

#[test]
fn test_unknown_state_type_routes_to_initializer() {
  let r = router(3);
  assert_eq!(r.worker_for_state("Nope", &PartitionKey::from("A")), 0);
}

#[test]
fn test_partitioned_keys_spread_and_stay_in_range() {
  let r = router(2);
  let owners: BTreeSet<usize> = (b'A'..=b'Z')
    .map(|c| {
      let key = PartitionKey::from((c as char).to_string());
      r.worker_for_state("PartitionedDummyState", &key)
    })
    .collect();
  assert!(owners.iter().all(|w| *w < 2));
  assert_eq!(owners.len(), 2);
}

#[test]
fn test_single_worker_owns_everything() {
  let r = router(1);
  let key = PartitionKey::from("Q");
  assert_eq!(r.worker_for_state("PartitionedDummyState", &key), 0);
  assert_eq!(r.worker_for_stateless(7), 0);
}

#[test]
fn test_zero_workers_is_treated_as_one() {
  let r = router(0);
  assert_eq!(r.worker_count(), 1);
}

#[test]
fn test_stateless_partitions_are_distinct() {
  let r = router(2);
  let ids = r.stateless_partitions();
  assert_eq!(ids.len(), 2);
  assert_ne!(ids[0], ids[1]);
  let key = PartitionKey::from("A");
  let chosen = r.stateless_partition_for(&key);
  assert!(chosen.is_some_and(|id| ids.contains(&id)));
  assert_eq!(chosen, r.stateless_partition_for(&key));
}

#[test]
fn test_no_stateless_partitions() {
  let r = PartitionRouter::new(2, &[], "empty", 0);
  assert!(r.stateless_partitions().is_empty());
  assert_eq!(r.stateless_partition_for(&PartitionKey::from("A")), None);
}

#[test]
fn test_stateless_work_round_robins() {
  let r = router(3);
  let workers: Vec<usize> = (0..6).map(|seq| r.worker_for_stateless(seq)).collect();
  assert_eq!(workers, vec![0, 1, 2, 0, 1, 2]);
}
