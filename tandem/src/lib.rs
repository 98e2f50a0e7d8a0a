// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Core of the tandem two-hop forwarding proxy.
//!
//! The local hop ([`local`]) accepts proxy-configured clients and relays
//! their bytes, uninterpreted, over a mutually authenticated backhaul to the
//! remote hop ([`remote`]), which parses the original request, connects to
//! the real destination, and relays until close or idle timeout.

pub mod admission;
pub mod config;
pub mod http;
pub mod local;
pub mod relay;
pub mod remote;
pub mod secure;
pub mod util;

use std::{io, net::SocketAddr};

/// `Proxy-agent` identification sent on successful CONNECT responses.
pub const PROXY_AGENT: &str = concat!("tandem/", env!("CARGO_PKG_VERSION"));

/// Failure to bring a hop's listener up. Anything per-session is handled
/// inside the session task and never surfaces here.
#[derive(thiserror::Error, Debug)]
pub enum ServeError {
  #[error(transparent)]
  Tls(#[from] secure::TlsSetupError),
  #[error("failed to bind {addr}: {source}")]
  Bind {
    addr: SocketAddr,
    source: io::Error,
  },
}
