// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Per-hop configuration, built once at startup and shared read-only by
//! every session.

use std::{
  collections::HashSet,
  net::{IpAddr, SocketAddr},
  path::PathBuf,
  time::Duration,
};

/// Default I/O chunk size for relay copies.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;
/// Default readiness-poll interval for relay idle accounting.
pub const DEFAULT_TICK: Duration = Duration::from_secs(3);
/// Default idle timeout on the local hop.
pub const DEFAULT_LOCAL_IDLE_TIMEOUT: Duration = Duration::from_secs(180);
/// Default idle timeout for forwarded requests on the remote hop.
pub const DEFAULT_REMOTE_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Locations of the PEM material for one side of the backhaul.
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct TlsPaths {
  /// Certificate chain presented to the peer.
  pub cert: PathBuf,
  /// Private key matching `cert`.
  pub key: PathBuf,
  /// Authority bundle the peer's certificate must chain to.
  pub ca: PathBuf,
}

/// Parameters for the client-facing hop.
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct LocalConfig {
  pub bind: SocketAddr,
  /// Backhaul destination; kept as host + port so DNS names resolve at dial
  /// time rather than at startup.
  pub backhaul_host: String,
  pub backhaul_port: u16,
  /// Name the backhaul certificate is validated against. Defaults to
  /// `backhaul_host` when unset.
  pub backhaul_san: Option<String>,
  /// `None` disables backhaul encryption entirely.
  pub tls: Option<TlsPaths>,
  pub idle_timeout: Duration,
  pub tick: Duration,
  pub buffer_size: usize,
  /// Source addresses allowed to use this hop. Empty means allow all.
  pub permitted: HashSet<IpAddr>,
}

impl LocalConfig {
  pub fn backhaul_addr(&self) -> String {
    format!("{}:{}", self.backhaul_host, self.backhaul_port)
  }

  /// Name presented to certificate validation when dialing the backhaul.
  pub fn backhaul_server_name(&self) -> &str {
    self.backhaul_san.as_deref().unwrap_or(&self.backhaul_host)
  }
}

/// Parameters for the destination-facing hop.
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct RemoteConfig {
  pub bind: SocketAddr,
  /// `None` disables backhaul encryption entirely.
  pub tls: Option<TlsPaths>,
  /// Idle timeout applied to forwarded (non-CONNECT) exchanges.
  pub idle_timeout: Duration,
  pub tick: Duration,
  pub buffer_size: usize,
  /// Source addresses allowed to use this hop. Empty means allow all.
  pub permitted: HashSet<IpAddr>,
}
