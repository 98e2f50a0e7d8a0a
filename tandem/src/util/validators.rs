// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Error as AnyErr, Result};
use std::net::SocketAddr;
use std::path::Path;

pub fn validate_existing_file(v: &str) -> Result<(), String> {
  if !Path::new(&v).exists() {
    Err(String::from("A file must exist at the given path"))
  } else {
    Ok(())
  }
}

pub fn parse_socketaddr(v: &str) -> Result<SocketAddr> {
  use std::net::ToSocketAddrs;
  ToSocketAddrs::to_socket_addrs(v)
    .map_err(|e| e.into())
    .and_then(|mut items| {
      items.next().ok_or_else(|| {
        AnyErr::msg("No addresses were resolved from the given host")
      })
    })
}

/// Splits `host:port` without resolving the host, so DNS names stay symbolic
/// until dial time.
pub fn parse_host_port(v: &str) -> Result<(String, u16)> {
  match v.rsplit_once(':') {
    None => Err(AnyErr::msg("Expected host:port")),
    Some((host, port)) => {
      if host.is_empty() {
        return Err(AnyErr::msg("Host component must not be empty"));
      }
      let port = port
        .parse::<u16>()
        .map_err(|_| AnyErr::msg("Port component was not a valid u16"))?;
      Ok((host.to_string(), port))
    }
  }
}

pub fn validate_socketaddr(v: &str) -> Result<(), String> {
  parse_socketaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_host_port(v: &str) -> Result<(), String> {
  parse_host_port(v).map(|_| ()).map_err(|e| e.to_string())
}
