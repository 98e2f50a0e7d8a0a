// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Local hop: admits the client, dials the backhaul, and relays bytes
//! without interpreting them. All HTTP semantics, CONNECT and plain
//! forwarding alike, are decided on the remote hop; this side is a
//! transparent tunnel with an error page for everything it cannot deliver.

use std::{io, net::IpAddr, sync::Arc};

use tokio::{
  io::{AsyncRead, AsyncWrite, AsyncWriteExt},
  net::{TcpListener, TcpStream},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
  admission,
  config::LocalConfig,
  http,
  relay::{self, RelayPolicy},
  secure::{ChannelDialer, HandshakeError, SecureStream},
  ServeError,
};

/// Why the backhaul could not be brought up for one session.
#[derive(thiserror::Error, Debug)]
pub enum BackhaulError {
  #[error("connecting to {addr}: {source}")]
  Connect {
    addr: String,
    source: io::Error,
  },
  #[error(transparent)]
  Handshake(#[from] HandshakeError),
}

/// Binds the configured address and serves until `shutdown` fires, then
/// waits for in-flight sessions to run out.
pub async fn run(config: LocalConfig, shutdown: CancellationToken) -> Result<(), ServeError> {
  let listener = TcpListener::bind(config.bind)
    .await
    .map_err(|source| ServeError::Bind {
      addr: config.bind,
      source,
    })?;
  run_with_listener(listener, config, shutdown).await
}

/// [`run`] over an already-bound listener; lets callers pick an ephemeral
/// port and learn it from the listener before starting.
pub async fn run_with_listener(
  listener: TcpListener,
  config: LocalConfig,
  shutdown: CancellationToken,
) -> Result<(), ServeError> {
  let dialer = match &config.tls {
    Some(paths) => ChannelDialer::mutual_tls(paths, config.backhaul_server_name())?,
    None => ChannelDialer::plaintext(),
  };
  let dialer = Arc::new(dialer);
  let config = Arc::new(config);
  tracing::info!(
    addr = ?listener.local_addr().ok(),
    backhaul = %config.backhaul_addr(),
    "local proxy listening"
  );

  let sessions = TaskTracker::new();
  loop {
    tokio::select! {
      _ = shutdown.cancelled() => break,
      accepted = listener.accept() => {
        let (socket, peer) = match accepted {
          Ok(pair) => pair,
          Err(error) => {
            tracing::warn!(?error, "accept failed");
            continue;
          }
        };
        let dialer = Arc::clone(&dialer);
        let config = Arc::clone(&config);
        sessions.spawn(async move {
          if let Err(error) = serve_connection(socket, peer.ip(), &dialer, &config).await {
            tracing::debug!(?peer, %error, "session ended with error");
          }
        });
      }
    }
  }

  tracing::info!("local proxy draining sessions");
  sessions.close();
  sessions.wait().await;
  Ok(())
}

/// Drives one client connection: admission, backhaul dial and handshake,
/// then a pure byte relay until either side finishes.
pub async fn serve_connection<C>(
  mut client: C,
  peer_ip: IpAddr,
  dialer: &ChannelDialer,
  config: &LocalConfig,
) -> io::Result<()>
where
  C: AsyncRead + AsyncWrite + Unpin,
{
  if !admission::permitted(peer_ip, &config.permitted) {
    tracing::info!(%peer_ip, "rejected by address filter");
    http::write_proxy_failure(
      &mut client,
      &format!("Your ip [{peer_ip}] is not allowed to connect to this proxy."),
    )
    .await?;
    return client.shutdown().await;
  }

  let backhaul = match open_backhaul(dialer, config).await {
    Ok(backhaul) => backhaul,
    Err(error) => {
      tracing::warn!(backhaul = %config.backhaul_addr(), %error, "backhaul unavailable");
      let info = format!(
        "<html><body><h1>Remote Proxy Error</h1>Please check your configuration or try later.<br/>{error}</body></html>"
      );
      http::write_proxy_failure(&mut client, &info).await?;
      return client.shutdown().await;
    }
  };

  let policy = RelayPolicy::new(config.idle_timeout, config.tick, config.buffer_size);
  let outcome = relay::relay(client, backhaul, policy).await;
  tracing::debug!(%peer_ip, ?outcome, "session closed");
  Ok(())
}

/// Dials the remote hop and completes the channel handshake. The outbound
/// socket exists only once admission has already passed.
async fn open_backhaul(
  dialer: &ChannelDialer,
  config: &LocalConfig,
) -> Result<SecureStream<TcpStream>, BackhaulError> {
  let addr = config.backhaul_addr();
  let socket = TcpStream::connect(&addr)
    .await
    .map_err(|source| BackhaulError::Connect { addr, source })?;
  Ok(dialer.wrap(socket).await?)
}
