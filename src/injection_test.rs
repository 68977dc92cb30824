//! Tests for the data injection driver.

use crate::application::DummyApplication;
use crate::error::InjectionError;
use crate::injection::{InjectionConfig, Reader, Sender, iter_generator};
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

fn letters(n: u8) -> Reader {
  let keys = (0..n).map(|i| ((b'A' + i) as char).to_string());
  Reader::new(iter_generator(keys, |key: &String| DummyApplication::encode(key, 1)))
}

fn fast_config() -> InjectionConfig {
  InjectionConfig::default()
    .with_batch_size(5)
    .with_interval(Duration::from_millis(1))
    .with_reconnect_policy(3, Duration::from_millis(10))
}

/// Accepts connections and acknowledges every frame. On the first connection
/// only `first_connection_acks` frames are acknowledged before it is dropped.
/// Returns the acknowledged payloads in arrival order.
async fn ack_server(first_connection_acks: Option<u64>) -> (SocketAddr, JoinHandle<Vec<BytesMut>>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let handle = tokio::spawn(async move {
    let mut acknowledged = Vec::new();
    let mut limit = first_connection_acks;
    loop {
      let Ok(Ok((stream, _))) = tokio::time::timeout(Duration::from_millis(500), listener.accept()).await
      else {
        return acknowledged;
      };
      let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
      let mut count: u64 = 0;
      while let Some(Ok(frame)) = framed.next().await {
        if limit.is_some_and(|limit| count >= limit) {
          break;
        }
        count += 1;
        acknowledged.push(frame);
        framed
          .send(Bytes::copy_from_slice(&count.to_be_bytes()))
          .await
          .unwrap();
      }
      limit = None;
    }
  });
  (addr, handle)
}

#[test]
fn test_generator_encodes_lazily() {
  let calls = Arc::new(AtomicUsize::new(0));
  let counter = Arc::clone(&calls);
  let mut reader = Reader::new(iter_generator(0u32.., move |value: &u32| {
    counter.fetch_add(1, Ordering::SeqCst);
    DummyApplication::encode("A", *value)
  }));
  assert_eq!(calls.load(Ordering::SeqCst), 0);
  let first = reader.read().unwrap();
  let second = reader.read().unwrap();
  assert_eq!(calls.load(Ordering::SeqCst), 2);
  assert_eq!(reader.records_read(), 2);
  assert_eq!(first.as_ref(), DummyApplication::encode("A", 0).as_ref());
  assert_eq!(second.as_ref(), DummyApplication::encode("A", 1).as_ref());
}

#[test]
fn test_generator_numbers_records() {
  let records: Vec<_> = iter_generator(["x", "y"], |s: &&str| Bytes::from(s.to_string())).collect();
  assert_eq!(records[0].seq, 0);
  assert_eq!(records[1].seq, 1);
  assert_eq!(records[1].value, "y");
  assert_eq!(records[1].encoded, Bytes::from("y"));
}

#[test]
fn test_config_rejects_empty_batches() {
  let err = InjectionConfig::default().with_batch_size(0).validate().unwrap_err();
  assert!(matches!(err, InjectionError::InvalidConfig(_)));
}

#[tokio::test]
async fn test_sends_in_generator_order() {
  let (addr, server) = ack_server(None).await;
  let report = Sender::new(addr, letters(12), fast_config()).run().await.unwrap();
  assert_eq!(report.acknowledged, 12);
  assert_eq!(report.written, 12);
  assert_eq!(report.reconnects, 0);
  assert!(!report.cancelled);

  let received = server.await.unwrap();
  let expected: Vec<Bytes> = (0..12u8)
    .map(|i| DummyApplication::encode(&((b'A' + i) as char).to_string(), 1))
    .collect();
  let received: Vec<Bytes> = received.into_iter().map(BytesMut::freeze).collect();
  assert_eq!(received, expected);
}

#[tokio::test]
async fn test_reconnect_resumes_after_last_acknowledged() {
  let (addr, server) = ack_server(Some(3)).await;
  let config = fast_config().with_reconnect(true);
  let report = Sender::new(addr, letters(10), config).run().await.unwrap();
  assert_eq!(report.acknowledged, 10);
  assert_eq!(report.reconnects, 1);
  // The two unacknowledged frames of the first batch were written twice.
  assert_eq!(report.written, 12);

  let received = server.await.unwrap();
  let keys: Vec<u8> = received.iter().map(|frame| frame[0]).collect();
  assert_eq!(keys, (b'A'..=b'J').collect::<Vec<_>>());
}

#[tokio::test]
async fn test_drop_without_reconnect_aborts_with_progress() {
  let (addr, _server) = ack_server(Some(3)).await;
  let err = Sender::new(addr, letters(10), fast_config()).run().await.unwrap_err();
  match err {
    InjectionError::InjectionAborted { sent, addr: got, .. } => {
      assert_eq!(sent, 3);
      assert_eq!(got, addr);
    }
    other => panic!("unexpected error: {other:?}"),
  }
}

#[tokio::test]
async fn test_unreachable_address_aborts_after_retries() {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  drop(listener);

  let config = fast_config().with_reconnect(true);
  let err = Sender::new(addr, letters(3), config).run().await.unwrap_err();
  assert!(matches!(err, InjectionError::InjectionAborted { sent: 0, .. }));
}

#[tokio::test]
async fn test_cancelled_before_start_sends_nothing() {
  let (addr, _server) = ack_server(None).await;
  let cancel = CancellationToken::new();
  cancel.cancel();
  let report = Sender::new(addr, letters(10), fast_config())
    .with_cancellation(cancel)
    .run()
    .await
    .unwrap();
  assert!(report.cancelled);
  assert_eq!(report.acknowledged, 0);
  assert_eq!(report.written, 0);
}

#[tokio::test]
async fn test_cancellation_stops_between_batches() {
  let (addr, _server) = ack_server(None).await;
  let cancel = CancellationToken::new();
  let config = fast_config().with_interval(Duration::from_secs(30));
  let sender = Sender::new(addr, letters(20), config).with_cancellation(cancel.clone());
  let run = tokio::spawn(sender.run());
  tokio::time::sleep(Duration::from_millis(200)).await;
  cancel.cancel();

  let report = tokio::time::timeout(Duration::from_secs(5), run)
    .await
    .unwrap()
    .unwrap()
    .unwrap();
  assert!(report.cancelled);
  assert_eq!(report.acknowledged, 5);
}

#[tokio::test]
async fn test_transport_lost_after_cancellation_is_not_an_abort() {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  // Reads frames without acknowledging them, then goes away.
  let server = tokio::spawn(async move {
    let (stream, _) = listener.accept().await.unwrap();
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    let _ = tokio::time::timeout(Duration::from_millis(300), async {
      while let Some(Ok(_)) = framed.next().await {}
    })
    .await;
  });

  let cancel = CancellationToken::new();
  let config = fast_config().with_reconnect(false).with_ack_timeout(Duration::from_secs(5));
  let run = tokio::spawn(Sender::new(addr, letters(5), config).with_cancellation(cancel.clone()).run());
  tokio::time::sleep(Duration::from_millis(100)).await;
  cancel.cancel();
  server.await.unwrap();

  let report = tokio::time::timeout(Duration::from_secs(5), run)
    .await
    .unwrap()
    .unwrap()
    .unwrap();
  assert!(report.cancelled);
  assert_eq!(report.acknowledged, 0);
  assert_eq!(report.written, 5);
}
