// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Remote hop: terminates the backhaul, reads one request head, classifies
//! it, connects to the real destination, and relays.
//!
//! A session moves through awaiting-request, then either tunneling (CONNECT)
//! or forwarding (everything else), then relaying, then closed. Every
//! failure before the relay starts is answered with an HTTP error page;
//! everything after is a silent close.

use std::{io, net::IpAddr, sync::Arc};

use tokio::{
  io::{AsyncRead, AsyncWrite, AsyncWriteExt},
  net::{TcpListener, TcpStream},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
  admission,
  config::RemoteConfig,
  http::{self, HostPort, RequestHead},
  relay::{self, RelayPolicy},
  secure::ChannelAcceptor,
  ServeError,
};

/// Established CONNECT tunnels idle out on their own fixed clock, untied to
/// the forwarding timeout.
const TUNNEL_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(300);

/// How a request head is handled once parsed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RequestClass {
  /// Open a raw byte tunnel to the target and answer `200`.
  Tunnel,
  /// Rewrite the head and forward to the target.
  Forward,
}

/// Method dispatch. Only CONNECT tunnels; the ordinary verbs all share one
/// forwarding path, and anything else is unsupported.
fn classify(method: &str) -> Option<RequestClass> {
  match method {
    "CONNECT" => Some(RequestClass::Tunnel),
    "GET" | "POST" | "PUT" | "HEAD" | "DELETE" | "OPTIONS" => Some(RequestClass::Forward),
    _ => None,
  }
}

/// Binds the configured address and serves until `shutdown` fires, then
/// waits for in-flight sessions to run out.
pub async fn run(config: RemoteConfig, shutdown: CancellationToken) -> Result<(), ServeError> {
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
  config: RemoteConfig,
  shutdown: CancellationToken,
) -> Result<(), ServeError> {
  let acceptor = match &config.tls {
    Some(paths) => ChannelAcceptor::mutual_tls(paths)?,
    None => ChannelAcceptor::plaintext(),
  };
  let acceptor = Arc::new(acceptor);
  let config = Arc::new(config);
  tracing::info!(addr = ?listener.local_addr().ok(), "remote proxy listening");

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
        let acceptor = Arc::clone(&acceptor);
        let config = Arc::clone(&config);
        sessions.spawn(async move {
          // A failed handshake is dropped with no HTTP-level answer.
          let stream = match acceptor.wrap(socket).await {
            Ok(stream) => stream,
            Err(error) => {
              tracing::debug!(?peer, %error, "backhaul handshake failed");
              return;
            }
          };
          if let Err(error) = serve_connection(stream, peer.ip(), &config).await {
            tracing::debug!(?peer, %error, "session ended with error");
          }
        });
      }
    }
  }

  tracing::info!("remote proxy draining sessions");
  sessions.close();
  sessions.wait().await;
  Ok(())
}

/// Drives one backhaul connection from admission through relay to close.
pub async fn serve_connection<S>(
  mut stream: S,
  peer_ip: IpAddr,
  config: &RemoteConfig,
) -> io::Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  if !admission::permitted(peer_ip, &config.permitted) {
    tracing::info!(%peer_ip, "rejected by address filter");
    http::write_error_page(
      &mut stream,
      403,
      "Forbidden",
      &format!("Your ip [{peer_ip}] is not in white list"),
    )
    .await?;
    return stream.shutdown().await;
  }

  let head = match http::read_request_head(&mut stream).await {
    Ok(head) => head,
    Err(http::HeadError::Io(source)) => return Err(source),
    Err(error) => {
      tracing::debug!(%peer_ip, %error, "unreadable request head");
      http::write_error_page(&mut stream, 400, "Bad Request", &error.to_string()).await?;
      return stream.shutdown().await;
    }
  };
  tracing::debug!(%peer_ip, method = %head.method, target = %head.target, "request");

  match classify(&head.method) {
    Some(RequestClass::Tunnel) => tunnel(stream, head, config).await,
    Some(RequestClass::Forward) => forward(stream, head, config).await,
    None => {
      http::write_error_page(&mut stream, 501, "Unsupported method", &head.method).await?;
      stream.shutdown().await
    }
  }
}

/// CONNECT handler: raw tunnel to `host[:port]`, `200` on success, `404`
/// carrying the connect error otherwise.
async fn tunnel<S>(mut inbound: S, head: RequestHead, config: &RemoteConfig) -> io::Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let target = match head.target.parse::<HostPort>() {
    Ok(target) => target,
    Err(error) => {
      http::write_error_page(&mut inbound, 404, "Not Found", &error.to_string()).await?;
      return inbound.shutdown().await;
    }
  };

  let mut outbound = match TcpStream::connect(target.addr()).await {
    Ok(outbound) => outbound,
    Err(error) => {
      tracing::info!(target = %target.addr(), %error, "tunnel connect failed");
      http::write_error_page(&mut inbound, 404, "Not Found", &error.to_string()).await?;
      return inbound.shutdown().await;
    }
  };

  http::write_tunnel_established(&mut inbound).await?;
  if !head.trailing.is_empty() {
    outbound.write_all(&head.trailing).await?;
  }

  let policy = RelayPolicy::new(TUNNEL_IDLE_TIMEOUT, config.tick, config.buffer_size);
  let outcome = relay::relay(inbound, outbound, policy).await;
  tracing::debug!(target = %target.addr(), ?outcome, "tunnel closed");
  Ok(())
}

/// Shared handler for all non-CONNECT verbs: validate the absolute target,
/// rewrite the head, forward, and relay the rest of the exchange.
async fn forward<S>(mut inbound: S, head: RequestHead, config: &RemoteConfig) -> io::Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let target = match http::parse_forward_target(&head.target) {
    Ok(target) => target,
    Err(error) => {
      http::write_error_page(&mut inbound, 400, "Bad Request", &error.to_string()).await?;
      return inbound.shutdown().await;
    }
  };

  let mut outbound = match TcpStream::connect(target.authority.addr()).await {
    Ok(outbound) => outbound,
    Err(error) => {
      tracing::info!(target = %target.authority.addr(), %error, "forward connect failed");
      http::write_error_page(&mut inbound, 404, "Not Found", &error.to_string()).await?;
      return inbound.shutdown().await;
    }
  };

  outbound.write_all(&http::build_forward_head(&head, &target)).await?;
  if !head.trailing.is_empty() {
    outbound.write_all(&head.trailing).await?;
  }

  let policy = RelayPolicy::new(config.idle_timeout, config.tick, config.buffer_size);
  let outcome = relay::relay(inbound, outbound, policy).await;
  tracing::debug!(target = %target.authority.addr(), ?outcome, "forward closed");
  Ok(())
}
