//! # Data Injection Driver
//!
//! Sends a generated record sequence to one ingestion address.
//!
//! Records come from a caller-supplied generator ([`iter_generator`]) whose
//! encoder runs lazily: a record is encoded when the [`Sender`] pulls it into
//! the next batch, never before, so the sequence may be unbounded. Batches of
//! `batch_size` frames are written, then the sender waits until the ingestion
//! point has acknowledged all of them before sleeping `interval` and moving on.
//!
//! When the transport drops mid-batch the unacknowledged tail of the batch is
//! kept; with `reconnect` enabled the sender reconnects and resends exactly
//! that tail, so acknowledged records are never duplicated and generator
//! order is preserved on the wire.
//!
//! ## Example
//!
//! ```rust,no_run
//! use clusterweave::application::DummyApplication;
//! use clusterweave::injection::{InjectionConfig, Reader, Sender, iter_generator};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), clusterweave::error::InjectionError> {
//! let keys = (b'A'..=b'J').map(|c| (c as char).to_string());
//! let reader = Reader::new(iter_generator(keys, |key: &String| DummyApplication::encode(key, 1)));
//! let config = InjectionConfig::default()
//!     .with_batch_size(50)
//!     .with_interval(Duration::from_millis(50))
//!     .with_reconnect(true);
//! let report = Sender::new("127.0.0.1:7100".parse().unwrap(), reader, config).run().await?;
//! println!("acknowledged {} records", report.acknowledged);
//! # Ok(())
//! # }
//! ```

use crate::error::InjectionError;
use crate::source::ACK_LEN;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A generated record and its wire encoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InjectionRecord<T> {
  /// Position in the generated sequence, starting at 0.
  pub seq: u64,
  /// The generated value.
  pub value: T,
  /// Encoded frame payload.
  pub encoded: Bytes,
}

/// Iterator that pairs generated values with their lazily computed encoding.
#[derive(Debug)]
pub struct IterGenerator<I, F> {
  items: I,
  encoder: F,
  seq: u64,
}

impl<I, F> Iterator for IterGenerator<I, F>
where
  I: Iterator,
  F: FnMut(&I::Item) -> Bytes,
{
  type Item = InjectionRecord<I::Item>;

  fn next(&mut self) -> Option<Self::Item> {
    let value = self.items.next()?;
    let encoded = (self.encoder)(&value);
    let seq = self.seq;
    self.seq += 1;
    Some(InjectionRecord {
      seq,
      value,
      encoded,
    })
  }

  fn size_hint(&self) -> (usize, Option<usize>) {
    self.items.size_hint()
  }
}

/// Builds a generator from `items`, encoding each one with `encoder` as it is pulled.
pub fn iter_generator<I, F>(items: I, encoder: F) -> IterGenerator<I::IntoIter, F>
where
  I: IntoIterator,
  F: FnMut(&I::Item) -> Bytes,
{
  IterGenerator {
    items: items.into_iter(),
    encoder,
    seq: 0,
  }
}

/// Pulls encoded frames from a generator on behalf of a [`Sender`].
pub struct Reader {
  frames: Box<dyn Iterator<Item = Bytes> + Send>,
  read: u64,
}

impl Reader {
  /// Wraps a generator of records.
  pub fn new<G, T>(generator: G) -> Self
  where
    G: Iterator<Item = InjectionRecord<T>> + Send + 'static,
  {
    Self {
      frames: Box::new(generator.map(|record| record.encoded)),
      read: 0,
    }
  }

  /// Returns the next encoded frame, or `None` once the generator is exhausted.
  pub fn read(&mut self) -> Option<Bytes> {
    let frame = self.frames.next()?;
    self.read += 1;
    Some(frame)
  }

  /// Number of frames pulled so far.
  pub fn records_read(&self) -> u64 {
    self.read
  }
}

impl std::fmt::Debug for Reader {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Reader").field("read", &self.read).finish()
  }
}

/// Configuration for a [`Sender`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectionConfig {
  /// Frames written per batch (default: 50).
  pub batch_size: usize,
  /// Pause between batches (default: 50ms).
  pub interval: Duration,
  /// Reconnect after a transport drop (default: false).
  pub reconnect: bool,
  /// Consecutive transport failures tolerated before aborting (default: 5).
  pub max_reconnect_attempts: u32,
  /// Delay before each reconnect (default: 100ms).
  pub reconnect_backoff: Duration,
  /// Per-attempt connect timeout (default: 5 seconds).
  pub connect_timeout: Duration,
  /// Time allowed for a batch to be acknowledged (default: 10 seconds).
  pub ack_timeout: Duration,
}

impl Default for InjectionConfig {
  fn default() -> Self {
    Self {
      batch_size: 50,
      interval: Duration::from_millis(50),
      reconnect: false,
      max_reconnect_attempts: 5,
      reconnect_backoff: Duration::from_millis(100),
      connect_timeout: Duration::from_secs(5),
      ack_timeout: Duration::from_secs(10),
    }
  }
}

impl InjectionConfig {
  /// Sets the batch size.
  #[must_use]
  pub fn with_batch_size(mut self, batch_size: usize) -> Self {
    self.batch_size = batch_size;
    self
  }

  /// Sets the inter-batch interval.
  #[must_use]
  pub fn with_interval(mut self, interval: Duration) -> Self {
    self.interval = interval;
    self
  }

  /// Enables or disables reconnection.
  #[must_use]
  pub fn with_reconnect(mut self, reconnect: bool) -> Self {
    self.reconnect = reconnect;
    self
  }

  /// Sets the reconnect budget and backoff.
  #[must_use]
  pub fn with_reconnect_policy(mut self, max_attempts: u32, backoff: Duration) -> Self {
    self.max_reconnect_attempts = max_attempts;
    self.reconnect_backoff = backoff;
    self
  }

  /// Sets the per-attempt connect timeout.
  #[must_use]
  pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
    self.connect_timeout = connect_timeout;
    self
  }

  /// Sets the acknowledgement timeout.
  #[must_use]
  pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
    self.ack_timeout = ack_timeout;
    self
  }

  /// Checks the configuration can drive a sender.
  pub fn validate(&self) -> Result<(), InjectionError> {
    if self.batch_size == 0 {
      return Err(InjectionError::InvalidConfig("batch_size must be >= 1".to_string()));
    }
    Ok(())
  }
}

/// Outcome of a completed (or cancelled) injection run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionReport {
  /// Records the ingestion point acknowledged.
  pub acknowledged: u64,
  /// Frame writes, including resends after a reconnect.
  pub written: u64,
  /// Successful reconnections.
  pub reconnects: u32,
  /// Whether the run stopped early because it was cancelled.
  pub cancelled: bool,
}

struct Connection {
  framed: Framed<TcpStream, LengthDelimitedCodec>,
  acked: u64,
}

/// Drives one record sequence into one ingestion address.
#[derive(Debug)]
pub struct Sender {
  link: Link,
  reader: Reader,
}

#[derive(Debug)]
struct Link {
  addr: SocketAddr,
  config: InjectionConfig,
  cancel: CancellationToken,
}

impl Sender {
  /// Creates a sender for `addr`.
  pub fn new(addr: SocketAddr, reader: Reader, config: InjectionConfig) -> Self {
    Self {
      link: Link {
        addr,
        config,
        cancel: CancellationToken::new(),
      },
      reader,
    }
  }

  /// Stops the run at the next batch boundary once `cancel` fires.
  #[must_use]
  pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
    self.link.cancel = cancel;
    self
  }

  /// Sends every record the reader yields.
  ///
  /// # Errors
  ///
  /// [`InjectionError::InjectionAborted`] when the transport cannot be
  /// re-established (or reconnection is disabled), carrying the number of
  /// records acknowledged before the abort.
  pub async fn run(self) -> Result<InjectionReport, InjectionError> {
    let Sender { link, mut reader } = self;
    link.config.validate()?;
    info!(
      address = %link.addr,
      batch_size = link.config.batch_size,
      reconnect = link.config.reconnect,
      "Injection started"
    );

    let mut report = InjectionReport::default();
    let mut pending: VecDeque<Bytes> = VecDeque::with_capacity(link.config.batch_size);
    let mut connection: Option<Connection> = None;
    let mut failures: u32 = 0;
    let mut exhausted = false;

    loop {
      if link.cancel.is_cancelled() {
        report.cancelled = true;
        break;
      }
      while !exhausted && pending.len() < link.config.batch_size {
        match reader.read() {
          Some(frame) => pending.push_back(frame),
          None => exhausted = true,
        }
      }
      if pending.is_empty() {
        break;
      }

      let conn = match connection.as_mut() {
        Some(conn) => conn,
        None => {
          match link.connect(&mut failures, &report).await? {
            Some(conn) => {
              if report.written > 0 {
                report.reconnects += 1;
                info!(address = %link.addr, resend = pending.len(), "Reconnected to ingestion point");
              }
              connection.insert(conn)
            }
            None => {
              report.cancelled = true;
              break;
            }
          }
        }
      };

      match link.send_batch(conn, &pending, &mut report).await {
        Ok(()) => {
          report.acknowledged += pending.len() as u64;
          pending.clear();
          failures = 0;
        }
        Err((acked, e)) => {
          report.acknowledged += acked;
          pending.drain(..acked as usize);
          connection = None;
          warn!(
            address = %link.addr,
            acknowledged = report.acknowledged,
            unacknowledged = pending.len(),
            error = %e,
            "Ingestion transport dropped"
          );
          // A cancelled run ends cleanly even if the peer vanished meanwhile.
          if link.cancel.is_cancelled() {
            report.cancelled = true;
            break;
          }
          failures += 1;
          if !link.config.reconnect || failures > link.config.max_reconnect_attempts {
            return Err(link.aborted(&report, e.to_string()));
          }
          continue;
        }
      }

      if exhausted {
        continue;
      }
      tokio::select! {
        _ = link.cancel.cancelled() => {
          report.cancelled = true;
          break;
        }
        _ = tokio::time::sleep(link.config.interval) => {}
      }
    }

    if let Some(mut conn) = connection
      && let Err(e) = SinkExt::<Bytes>::close(&mut conn.framed).await
    {
      debug!(address = %link.addr, error = %e, "Error closing ingestion connection");
    }
    info!(
      address = %link.addr,
      acknowledged = report.acknowledged,
      written = report.written,
      reconnects = report.reconnects,
      cancelled = report.cancelled,
      "Injection finished"
    );
    Ok(report)
  }
}

impl Link {
  /// Connects, retrying per the reconnect policy. `Ok(None)` means cancelled.
  async fn connect(
    &self,
    failures: &mut u32,
    report: &InjectionReport,
  ) -> Result<Option<Connection>, InjectionError> {
    loop {
      if *failures > 0 {
        tokio::select! {
          _ = self.cancel.cancelled() => return Ok(None),
          _ = tokio::time::sleep(self.config.reconnect_backoff) => {}
        }
      }
      let reason = match timeout(self.config.connect_timeout, TcpStream::connect(self.addr)).await {
        Ok(Ok(stream)) => {
          debug!(address = %self.addr, "Connected to ingestion point");
          return Ok(Some(Connection {
            framed: Framed::new(stream, LengthDelimitedCodec::new()),
            acked: 0,
          }));
        }
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("connect timed out after {:?}", self.config.connect_timeout),
      };
      if self.cancel.is_cancelled() {
        return Ok(None);
      }
      *failures += 1;
      if !self.config.reconnect || *failures > self.config.max_reconnect_attempts {
        return Err(self.aborted(report, reason));
      }
      debug!(
        address = %self.addr,
        attempt = *failures,
        reason = %reason,
        "Ingestion point unreachable, retrying"
      );
    }
  }

  /// Writes `batch` and waits for its acknowledgement.
  ///
  /// On failure returns how many records of the batch were acknowledged.
  async fn send_batch(
    &self,
    conn: &mut Connection,
    batch: &VecDeque<Bytes>,
    report: &mut InjectionReport,
  ) -> Result<(), (u64, std::io::Error)> {
    let base = conn.acked;
    let target = base + batch.len() as u64;

    for frame in batch {
      conn.framed.feed(frame.clone()).await.map_err(|e| (0, e))?;
      report.written += 1;
    }
    SinkExt::<Bytes>::flush(&mut conn.framed).await.map_err(|e| (0, e))?;

    while conn.acked < target {
      let next = timeout(self.config.ack_timeout, conn.framed.next()).await;
      let ack = match next {
        Ok(Some(Ok(frame))) => parse_ack(&frame),
        Ok(Some(Err(e))) => Err(e),
        Ok(None) => Err(std::io::Error::new(
          std::io::ErrorKind::UnexpectedEof,
          "ingestion point closed the connection",
        )),
        Err(_) => Err(std::io::Error::new(
          std::io::ErrorKind::TimedOut,
          format!("no acknowledgement within {:?}", self.config.ack_timeout),
        )),
      };
      match ack {
        Ok(count) if count <= target => conn.acked = conn.acked.max(count),
        Ok(count) => {
          let e = std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("acknowledgement {count} exceeds frames sent {target}"),
          );
          return Err((conn.acked - base, e));
        }
        Err(e) => return Err((conn.acked - base, e)),
      }
    }
    Ok(())
  }

  fn aborted(&self, report: &InjectionReport, reason: String) -> InjectionError {
    InjectionError::InjectionAborted {
      addr: self.addr,
      sent: report.acknowledged,
      reason,
    }
  }
}

fn parse_ack(frame: &[u8]) -> std::io::Result<u64> {
  let bytes: [u8; ACK_LEN] = frame.try_into().map_err(|_| {
    std::io::Error::new(
      std::io::ErrorKind::InvalidData,
      format!("acknowledgement frame of {} bytes", frame.len()),
    )
  })?;
  Ok(u64::from_be_bytes(bytes))
}
