//! # ClusterWeave
//!
//! Cluster introspection for partitioned stream processing workers.
//!
//! Every worker keeps a [`directory::PartitionDirectory`] of the state
//! partitions and stateless partitions it hosts. Any worker's control plane
//! answers a fixed set of [`query::QueryKind`]s by fetching a snapshot from
//! every member and merging them on demand, off the message-processing path.
//!
//! ## Key Features
//!
//! - **Ownership checks**: a state key hosted by two workers, or by a worker
//!   the router does not assign it to, fails the query with a
//!   [`error::ConsistencyViolation`] instead of being merged silently
//! - **Deterministic answers**: ordered maps throughout, so an unchanged
//!   cluster answers byte-identically
//! - **Acknowledged ingestion**: the [`injection::Sender`] resumes from the
//!   first unacknowledged record after a reconnect
//! - **Phased verification**: [`harness::Scenario`] runs start, inject,
//!   settle, query, assert and teardown with unconditional teardown
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use clusterweave::application::DummyApplication;
//! use clusterweave::cluster::{ClusterConfig, ClusterLauncher, LocalLauncher};
//! use clusterweave::endpoint::QueryClient;
//! use clusterweave::query::QueryKind;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut cluster = LocalLauncher::new(DummyApplication)
//!     .launch(&ClusterConfig::default().with_workers(2))
//!     .await?;
//! let client = QueryClient::new(cluster.workers()[0].control_addr);
//! println!("{}", client.query_json(QueryKind::ClusterStatus).await?);
//! cluster.shutdown().await?;
//! # Ok(())
//! # }
//! ```

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// Error taxonomy for queries, injection, cluster lifecycle and the harness.
pub mod error;
/// Partition keys, stable hashing and key-to-worker routing.
pub mod partitioning;
/// Application contract and the reference dummy application.
pub mod application;
/// Per-worker partition directory with snapshot reads.
pub mod directory;
/// Query kinds, output formats and control-plane messages.
pub mod query;
/// Merges worker reports into query answers.
pub mod aggregator;
/// Control-plane server and client.
pub mod endpoint;
/// Per-worker compute loop.
pub mod worker;
/// Data-plane ingestion listener.
pub mod source;
/// Cluster configuration, lifecycle seams and the in-process cluster.
pub mod cluster;
/// Data injection driver.
pub mod injection;
/// Phased verification harness.
pub mod harness;

#[cfg(test)]
mod partitioning_test;
#[cfg(test)]
mod injection_test;
