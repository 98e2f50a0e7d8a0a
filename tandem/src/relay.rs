// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Bidirectional byte shuttle between two live streams.
//!
//! Data is copied unmodified in whichever direction it arrives; idle time is
//! accounted in discrete poll ticks, and whichever way the loop ends, both
//! streams are shut down before returning.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Timing and sizing knobs for one relay operation.
#[derive(Clone, Copy, Debug)]
pub struct RelayPolicy {
  pub idle_timeout: Duration,
  pub tick: Duration,
  pub buffer_size: usize,
}

impl RelayPolicy {
  pub fn new(idle_timeout: Duration, tick: Duration, buffer_size: usize) -> Self {
    Self {
      idle_timeout,
      tick,
      buffer_size,
    }
  }

  /// Number of consecutive quiet ticks tolerated before the relay ends.
  fn max_idle_ticks(&self) -> u64 {
    let tick = self.tick.as_millis().max(1);
    (self.idle_timeout.as_millis() / tick) as u64
  }
}

/// Why a relay stopped. None of these are reported to either peer; the relay
/// ends with a silent close in every case.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayEnd {
  /// One side signaled end-of-stream.
  PeerClosed,
  /// No bytes moved in either direction for the configured duration.
  IdleTimeout,
  /// A read or write on either stream failed.
  StreamError,
}

/// Byte counts and termination cause for a completed relay.
#[derive(Clone, Copy, Debug)]
pub struct RelayOutcome {
  pub a_to_b: u64,
  pub b_to_a: u64,
  pub end: RelayEnd,
}

/// Copies bytes between `a` and `b` until either side closes or the idle
/// timeout elapses, then shuts both streams down. A failed read or write on
/// either stream also ends the loop.
///
/// Per-direction byte order is preserved; interleaving between the two
/// directions is unconstrained. A chunk is written out in full before the
/// idle counter resets, so a short write on the destination never drops the
/// tail of a read.
pub async fn relay<A, B>(mut a: A, mut b: B, policy: RelayPolicy) -> RelayOutcome
where
  A: AsyncRead + AsyncWrite + Unpin,
  B: AsyncRead + AsyncWrite + Unpin,
{
  let max_idle_ticks = policy.max_idle_ticks();
  let mut buf_a = vec![0u8; policy.buffer_size];
  let mut buf_b = vec![0u8; policy.buffer_size];
  let mut idle_ticks = 0u64;
  let mut a_to_b = 0u64;
  let mut b_to_a = 0u64;

  // Each pass arms fresh reads on both streams plus a tick timer; a branch
  // that loses the race has not consumed any bytes.
  let end = loop {
    tokio::select! {
      read = a.read(&mut buf_a) => match read {
        Ok(0) => break RelayEnd::PeerClosed,
        Ok(n) => {
          if write_chunk(&mut b, &buf_a[..n]).await.is_err() {
            break RelayEnd::StreamError;
          }
          a_to_b += n as u64;
          idle_ticks = 0;
        }
        Err(_) => break RelayEnd::StreamError,
      },
      read = b.read(&mut buf_b) => match read {
        Ok(0) => break RelayEnd::PeerClosed,
        Ok(n) => {
          if write_chunk(&mut a, &buf_b[..n]).await.is_err() {
            break RelayEnd::StreamError;
          }
          b_to_a += n as u64;
          idle_ticks = 0;
        }
        Err(_) => break RelayEnd::StreamError,
      },
      _ = tokio::time::sleep(policy.tick) => {
        idle_ticks += 1;
        if idle_ticks >= max_idle_ticks {
          break RelayEnd::IdleTimeout;
        }
      }
    }
  };

  // Unconditional cleanup: both ends close no matter how the loop ended.
  let _ = a.shutdown().await;
  let _ = b.shutdown().await;

  RelayOutcome { a_to_b, b_to_a, end }
}

async fn write_chunk<W>(writer: &mut W, chunk: &[u8]) -> io::Result<()>
where
  W: AsyncWrite + Unpin,
{
  writer.write_all(chunk).await?;
  writer.flush().await
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;
  use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

  fn test_policy() -> RelayPolicy {
    RelayPolicy::new(Duration::from_secs(60), Duration::from_secs(3), 4096)
  }

  #[tokio::test]
  async fn shuttles_bytes_in_both_directions() {
    let (mut client, client_side) = duplex(1024);
    let (server_side, mut server) = duplex(1024);

    let relay_task = tokio::spawn(relay(client_side, server_side, test_policy()));

    client.write_all(b"question").await.unwrap();
    let mut buf = [0u8; 8];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"question");

    server.write_all(b"answer").await.unwrap();
    let mut buf = [0u8; 6];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"answer");

    // Closing one side ends the relay and closes the other.
    drop(client);
    let outcome = relay_task.await.unwrap();
    assert_eq!(outcome.end, RelayEnd::PeerClosed);
    assert_eq!(outcome.a_to_b, 8);
    assert_eq!(outcome.b_to_a, 6);
    let mut rest = Vec::new();
    server.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
  }

  #[tokio::test]
  async fn drains_chunks_larger_than_the_transport_window() {
    // A 64-byte pipe forces short writes; every byte must still arrive.
    let (mut client, client_side) = duplex(64);
    let (server_side, mut server) = duplex(64);

    let relay_task = tokio::spawn(relay(client_side, server_side, test_policy()));

    let payload: Vec<u8> = (0..16 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let writer = tokio::spawn(async move {
      client.write_all(&payload).await.unwrap();
      client.shutdown().await.unwrap();
    });

    let mut received = Vec::new();
    server.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, expected);

    writer.await.unwrap();
    let outcome = relay_task.await.unwrap();
    assert_eq!(outcome.a_to_b, 16 * 1024);
  }

  #[tokio::test(start_paused = true)]
  async fn quiet_session_ends_at_the_idle_timeout() {
    let (mut client, client_side) = duplex(1024);
    let (server_side, mut server) = duplex(1024);

    let policy = RelayPolicy::new(Duration::from_secs(9), Duration::from_secs(3), 1024);
    let outcome = relay(client_side, server_side, policy).await;
    assert_eq!(outcome.end, RelayEnd::IdleTimeout);
    assert_eq!(outcome.a_to_b, 0);
    assert_eq!(outcome.b_to_a, 0);

    // Both far ends observe the close.
    let mut buf = Vec::new();
    client.read_to_end(&mut buf).await.unwrap();
    assert!(buf.is_empty());
    server.read_to_end(&mut buf).await.unwrap();
    assert!(buf.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn traffic_resets_the_idle_clock() {
    let (mut client, client_side) = duplex(1024);
    let (server_side, mut server) = duplex(1024);

    let policy = RelayPolicy::new(Duration::from_secs(9), Duration::from_secs(3), 1024);
    let relay_task = tokio::spawn(relay(client_side, server_side, policy));

    // Keep the session alive past several full timeout windows.
    for _ in 0..6 {
      tokio::time::sleep(Duration::from_secs(6)).await;
      client.write_all(b"tick").await.unwrap();
      let mut buf = [0u8; 4];
      server.read_exact(&mut buf).await.unwrap();
    }

    // Then fall silent and let the timeout fire.
    let outcome = relay_task.await.unwrap();
    assert_eq!(outcome.end, RelayEnd::IdleTimeout);
    assert_eq!(outcome.a_to_b, 24);
  }
}
