// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Mutually authenticated channel setup for the backhaul.
//!
//! Certificate material is loaded once at startup into a dialer or acceptor
//! value; the per-connection cost is the handshake alone. Both directions
//! require the peer to present a certificate chaining to the configured
//! authority bundle, so an unauthenticated peer is cut off at the transport
//! layer before any proxy bytes are exchanged.

use std::{
  fs::File,
  io::{self, BufReader},
  path::{Path, PathBuf},
  pin::Pin,
  sync::Arc,
  task::{Context, Poll},
};

use rustls::{server::AllowAnyAuthenticatedClient, Certificate, PrivateKey, RootCertStore, ServerName};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::TlsPaths;

/// Startup-fatal failure assembling TLS material. Never produced per-session.
#[derive(thiserror::Error, Debug)]
pub enum TlsSetupError {
  #[error("failed reading {path:?}: {source}")]
  ReadMaterial {
    path: PathBuf,
    source: io::Error,
  },
  #[error("no certificates found in {0:?}")]
  EmptyCertChain(PathBuf),
  #[error("no private key found in {0:?}")]
  MissingKey(PathBuf),
  #[error("authority bundle {path:?} rejected: {source}")]
  BadAuthority {
    path: PathBuf,
    source: rustls::Error,
  },
  #[error("invalid backhaul server name {0:?}")]
  InvalidServerName(String),
  #[error("TLS configuration rejected: {0}")]
  Config(#[from] rustls::Error),
}

/// Per-session failure negotiating the encrypted channel.
#[derive(thiserror::Error, Debug)]
pub enum HandshakeError {
  #[error("TLS handshake failed: {0}")]
  Failed(#[from] io::Error),
}

/// Outbound side of the backhaul channel, held by the local hop.
pub enum ChannelDialer {
  Plaintext,
  Tls {
    connector: TlsConnector,
    server_name: ServerName,
  },
}

impl ChannelDialer {
  pub fn plaintext() -> Self {
    Self::Plaintext
  }

  /// Builds an initiator that presents `paths.cert`/`paths.key` and trusts
  /// only certificates chaining to `paths.ca`, validated against
  /// `server_name`.
  pub fn mutual_tls(paths: &TlsPaths, server_name: &str) -> Result<Self, TlsSetupError> {
    let roots = load_authority(&paths.ca)?;
    let chain = load_cert_chain(&paths.cert)?;
    let key = load_private_key(&paths.key)?;
    let config = rustls::ClientConfig::builder()
      .with_safe_defaults()
      .with_root_certificates(roots)
      .with_client_auth_cert(chain, key)?;
    let server_name = ServerName::try_from(server_name)
      .map_err(|_| TlsSetupError::InvalidServerName(server_name.to_string()))?;
    Ok(Self::Tls {
      connector: TlsConnector::from(Arc::new(config)),
      server_name,
    })
  }

  /// Wraps an already-connected socket, or hands it back untouched when
  /// encryption is disabled.
  pub async fn wrap<S>(&self, raw: S) -> Result<SecureStream<S>, HandshakeError>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    match self {
      Self::Plaintext => Ok(SecureStream::Plain(raw)),
      Self::Tls {
        connector,
        server_name,
      } => {
        let stream = connector.connect(server_name.clone(), raw).await?;
        Ok(SecureStream::ClientTls(Box::new(stream)))
      }
    }
  }
}

/// Inbound side of the backhaul channel, held by the remote hop.
pub enum ChannelAcceptor {
  Plaintext,
  Tls(TlsAcceptor),
}

impl ChannelAcceptor {
  pub fn plaintext() -> Self {
    Self::Plaintext
  }

  /// Builds a responder that presents `paths.cert`/`paths.key` and requires
  /// client certificates chaining to `paths.ca`.
  pub fn mutual_tls(paths: &TlsPaths) -> Result<Self, TlsSetupError> {
    let roots = load_authority(&paths.ca)?;
    let chain = load_cert_chain(&paths.cert)?;
    let key = load_private_key(&paths.key)?;
    let verifier = AllowAnyAuthenticatedClient::new(roots).boxed();
    let config = rustls::ServerConfig::builder()
      .with_safe_defaults()
      .with_client_cert_verifier(verifier)
      .with_single_cert(chain, key)?;
    Ok(Self::Tls(TlsAcceptor::from(Arc::new(config))))
  }

  /// Wraps an accepted socket, or hands it back untouched when encryption is
  /// disabled.
  pub async fn wrap<S>(&self, raw: S) -> Result<SecureStream<S>, HandshakeError>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    match self {
      Self::Plaintext => Ok(SecureStream::Plain(raw)),
      Self::Tls(acceptor) => {
        let stream = acceptor.accept(raw).await?;
        Ok(SecureStream::ServerTls(Box::new(stream)))
      }
    }
  }
}

/// A backhaul stream in whichever dress the configuration produced.
pub enum SecureStream<S> {
  Plain(S),
  ClientTls(Box<tokio_rustls::client::TlsStream<S>>),
  ServerTls(Box<tokio_rustls::server::TlsStream<S>>),
}

impl<S> AsyncRead for SecureStream<S>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    match self.get_mut() {
      SecureStream::Plain(ref mut s) => AsyncRead::poll_read(Pin::new(s), cx, buf),
      SecureStream::ClientTls(ref mut s) => AsyncRead::poll_read(Pin::new(&mut **s), cx, buf),
      SecureStream::ServerTls(ref mut s) => AsyncRead::poll_read(Pin::new(&mut **s), cx, buf),
    }
  }
}

impl<S> AsyncWrite for SecureStream<S>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    match self.get_mut() {
      SecureStream::Plain(ref mut s) => AsyncWrite::poll_write(Pin::new(s), cx, buf),
      SecureStream::ClientTls(ref mut s) => AsyncWrite::poll_write(Pin::new(&mut **s), cx, buf),
      SecureStream::ServerTls(ref mut s) => AsyncWrite::poll_write(Pin::new(&mut **s), cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    match self.get_mut() {
      SecureStream::Plain(ref mut s) => AsyncWrite::poll_flush(Pin::new(s), cx),
      SecureStream::ClientTls(ref mut s) => AsyncWrite::poll_flush(Pin::new(&mut **s), cx),
      SecureStream::ServerTls(ref mut s) => AsyncWrite::poll_flush(Pin::new(&mut **s), cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    match self.get_mut() {
      SecureStream::Plain(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(s), cx),
      SecureStream::ClientTls(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(&mut **s), cx),
      SecureStream::ServerTls(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(&mut **s), cx),
    }
  }
}

fn open_pem(path: &Path) -> Result<BufReader<File>, TlsSetupError> {
  File::open(path)
    .map(BufReader::new)
    .map_err(|source| TlsSetupError::ReadMaterial {
      path: path.to_path_buf(),
      source,
    })
}

fn load_cert_chain(path: &Path) -> Result<Vec<Certificate>, TlsSetupError> {
  let mut reader = open_pem(path)?;
  let certs = rustls_pemfile::certs(&mut reader).map_err(|source| TlsSetupError::ReadMaterial {
    path: path.to_path_buf(),
    source,
  })?;
  if certs.is_empty() {
    return Err(TlsSetupError::EmptyCertChain(path.to_path_buf()));
  }
  Ok(certs.into_iter().map(Certificate).collect())
}

fn load_private_key(path: &Path) -> Result<PrivateKey, TlsSetupError> {
  let mut reader = open_pem(path)?;
  loop {
    let item = rustls_pemfile::read_one(&mut reader).map_err(|source| {
      TlsSetupError::ReadMaterial {
        path: path.to_path_buf(),
        source,
      }
    })?;
    match item {
      Some(rustls_pemfile::Item::PKCS8Key(key))
      | Some(rustls_pemfile::Item::RSAKey(key))
      | Some(rustls_pemfile::Item::ECKey(key)) => return Ok(PrivateKey(key)),
      Some(_) => continue,
      None => return Err(TlsSetupError::MissingKey(path.to_path_buf())),
    }
  }
}

fn load_authority(path: &Path) -> Result<RootCertStore, TlsSetupError> {
  let mut roots = RootCertStore::empty();
  for cert in load_cert_chain(path)? {
    roots.add(&cert).map_err(|source| TlsSetupError::BadAuthority {
      path: path.to_path_buf(),
      source,
    })?;
  }
  Ok(roots)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::TlsPaths;
  use std::path::PathBuf;
  use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

  struct TestAuthority {
    ca: rcgen::Certificate,
    dir: PathBuf,
    ca_path: PathBuf,
  }

  impl TestAuthority {
    fn new(tag: &str) -> Self {
      let mut params = rcgen::CertificateParams::new(Vec::<String>::new());
      params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
      params
        .distinguished_name
        .push(rcgen::DnType::CommonName, format!("tandem test ca {tag}"));
      let ca = rcgen::Certificate::from_params(params).unwrap();
      let dir = std::env::temp_dir().join(format!("tandem-secure-{}-{}", std::process::id(), tag));
      std::fs::create_dir_all(&dir).unwrap();
      let ca_path = dir.join("ca.pem");
      std::fs::write(&ca_path, ca.serialize_pem().unwrap()).unwrap();
      Self { ca, dir, ca_path }
    }

    /// Issues a leaf for `san` and returns paths using this authority's CA
    /// bundle for peer validation.
    fn issue(&self, name: &str, san: &str) -> TlsPaths {
      let params = rcgen::CertificateParams::new(vec![san.to_string()]);
      let cert = rcgen::Certificate::from_params(params).unwrap();
      let cert_path = self.dir.join(format!("{name}.pem"));
      let key_path = self.dir.join(format!("{name}.key"));
      std::fs::write(&cert_path, cert.serialize_pem_with_signer(&self.ca).unwrap()).unwrap();
      std::fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();
      TlsPaths {
        cert: cert_path,
        key: key_path,
        ca: self.ca_path.clone(),
      }
    }
  }

  #[tokio::test]
  async fn disabled_channel_passes_socket_through() {
    let (a, b) = duplex(256);
    let dialer = ChannelDialer::plaintext();
    let acceptor = ChannelAcceptor::plaintext();
    let (mut left, mut right) = tokio::join!(
      async { dialer.wrap(a).await.unwrap() },
      async { acceptor.wrap(b).await.unwrap() },
    );
    left.write_all(b"unwrapped").await.unwrap();
    left.flush().await.unwrap();
    let mut buf = [0u8; 9];
    right.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"unwrapped");
  }

  #[tokio::test]
  async fn mutual_handshake_succeeds_with_shared_authority() {
    let authority = TestAuthority::new("shared");
    let server_paths = authority.issue("server", "localhost");
    let client_paths = authority.issue("client", "tandem-client");

    let dialer = ChannelDialer::mutual_tls(&client_paths, "localhost").unwrap();
    let acceptor = ChannelAcceptor::mutual_tls(&server_paths).unwrap();

    let (a, b) = duplex(16 * 1024);
    let (client, server) = tokio::join!(dialer.wrap(a), acceptor.wrap(b));
    let mut client = client.unwrap();
    let mut server = server.unwrap();

    client.write_all(b"over tls").await.unwrap();
    client.flush().await.unwrap();
    let mut buf = [0u8; 8];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"over tls");
  }

  #[tokio::test]
  async fn responder_rejects_certificate_from_foreign_authority() {
    let ours = TestAuthority::new("ours");
    let theirs = TestAuthority::new("theirs");
    let server_paths = ours.issue("server", "localhost");
    // Client chain is valid, but signed by an authority the responder does
    // not trust.
    let mut client_paths = theirs.issue("client", "tandem-client");
    client_paths.ca = ours.ca_path.clone();

    let dialer = ChannelDialer::mutual_tls(&client_paths, "localhost").unwrap();
    let acceptor = ChannelAcceptor::mutual_tls(&server_paths).unwrap();

    let (a, b) = duplex(16 * 1024);
    let (_client, server) = tokio::join!(dialer.wrap(a), acceptor.wrap(b));
    assert!(server.is_err());
  }

  #[tokio::test]
  async fn initiator_rejects_server_from_foreign_authority() {
    let ours = TestAuthority::new("initiator-ours");
    let theirs = TestAuthority::new("initiator-theirs");
    // Server presents a chain from an authority the dialer does not trust.
    let mut server_paths = theirs.issue("server", "localhost");
    server_paths.ca = theirs.ca_path.clone();
    let client_paths = ours.issue("client", "tandem-client");

    let dialer = ChannelDialer::mutual_tls(&client_paths, "localhost").unwrap();
    let acceptor = ChannelAcceptor::mutual_tls(&server_paths).unwrap();

    let (a, b) = duplex(16 * 1024);
    let (client, _server) = tokio::join!(dialer.wrap(a), acceptor.wrap(b));
    assert!(client.is_err());
  }

  #[test]
  fn missing_material_is_a_setup_error() {
    let paths = TlsPaths {
      cert: PathBuf::from("/nonexistent/cert.pem"),
      key: PathBuf::from("/nonexistent/key.pem"),
      ca: PathBuf::from("/nonexistent/ca.pem"),
    };
    assert!(matches!(
      ChannelAcceptor::mutual_tls(&paths),
      Err(TlsSetupError::ReadMaterial { .. })
    ));
    assert!(matches!(
      ChannelDialer::mutual_tls(&paths, "localhost"),
      Err(TlsSetupError::ReadMaterial { .. })
    ));
  }
}
