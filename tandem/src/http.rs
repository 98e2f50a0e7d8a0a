// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Minimal HTTP surface for the remote hop: reading one request head off a
//! stream, parsing request targets, and writing the handful of response
//! shapes the proxy produces. Everything past the head is opaque bytes.

use std::io;
use std::str::FromStr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest request head (request line plus headers) buffered before a
/// connection is refused.
pub const MAX_HEAD_LENGTH: usize = 8192;

/// One parsed request line and header block, plus whatever bytes arrived
/// past the terminating blank line.
#[derive(Debug)]
pub struct RequestHead {
  pub method: String,
  pub target: String,
  /// Minor HTTP version from the request line (`1` for HTTP/1.1).
  pub minor_version: u8,
  /// Header fields in arrival order, names as received, values raw.
  pub headers: Vec<(String, Vec<u8>)>,
  /// Bytes read beyond the head: pipelined body or early tunnel data. These
  /// belong to the destination and must not be dropped.
  pub trailing: Vec<u8>,
}

impl RequestHead {
  /// Case-insensitive single-header lookup, used by tests and logging.
  pub fn header(&self, name: &str) -> Option<&[u8]> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_slice())
  }
}

#[derive(thiserror::Error, Debug)]
pub enum HeadError {
  #[error("request head exceeded {MAX_HEAD_LENGTH} bytes")]
  TooLarge,
  #[error("malformed request head: {0}")]
  Parse(#[from] httparse::Error),
  #[error("connection closed before a full request head arrived")]
  Truncated,
  #[error(transparent)]
  Io(#[from] io::Error),
}

/// Reads from `stream` until a full head has arrived and parses it.
pub async fn read_request_head<R>(stream: &mut R) -> Result<RequestHead, HeadError>
where
  R: AsyncRead + Unpin,
{
  let mut buf = Vec::with_capacity(1024);
  let mut chunk = [0u8; 1024];
  loop {
    if buf.len() >= MAX_HEAD_LENGTH {
      return Err(HeadError::TooLarge);
    }
    let n = stream.read(&mut chunk).await?;
    if n == 0 {
      return Err(HeadError::Truncated);
    }
    buf.extend_from_slice(&chunk[..n]);

    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(&buf)? {
      httparse::Status::Partial => continue,
      httparse::Status::Complete(head_len) => {
        let parsed = RequestHead {
          method: req.method.unwrap_or_default().to_string(),
          target: req.path.unwrap_or_default().to_string(),
          minor_version: req.version.unwrap_or(1),
          headers: req
            .headers
            .iter()
            .map(|h| (h.name.to_string(), h.value.to_vec()))
            .collect(),
          trailing: buf[head_len..].to_vec(),
        };
        return Ok(parsed);
      }
    }
  }
}

/// A request target the proxy could not accept.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("bad url {0}")]
pub struct BadTarget(pub String);

/// `host[:port]` authority as found in CONNECT targets and absolute URLs.
///
/// The port defaults to 80 when absent. CONNECT targets conventionally imply
/// 443, but the parser is shared with plain forwarding and keeps the
/// forwarding default for both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
  pub host: String,
  pub port: u16,
}

impl HostPort {
  pub fn addr(&self) -> String {
    format!("{}:{}", self.host, self.port)
  }
}

impl FromStr for HostPort {
  type Err = BadTarget;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (host, port) = match s.split_once(':') {
      Some((host, port)) => (
        host,
        port.parse::<u16>().map_err(|_| BadTarget(s.to_string()))?,
      ),
      None => (s, 80),
    };
    if host.is_empty() {
      return Err(BadTarget(s.to_string()));
    }
    Ok(Self {
      host: host.to_string(),
      port,
    })
  }
}

/// Destination and rewritten request target for one forwarded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
  pub authority: HostPort,
  /// Path plus query, as sent to the destination in the rewritten request
  /// line.
  pub origin_form: String,
}

/// Validates an absolute `http://` request target and splits it into the
/// destination authority and the origin-form remainder.
pub fn parse_forward_target(target: &str) -> Result<ForwardTarget, BadTarget> {
  let bad = || BadTarget(target.to_string());
  // The Uri type has no fragment representation, so refuse them explicitly.
  if target.contains('#') {
    return Err(bad());
  }
  let uri = target.parse::<http::Uri>().map_err(|_| bad())?;
  if uri.scheme_str() != Some("http") {
    return Err(bad());
  }
  let host = uri.host().filter(|h| !h.is_empty()).ok_or_else(bad)?;
  let port = uri.port_u16().unwrap_or(80);
  let origin_form = match uri.path_and_query() {
    Some(pq) if !pq.as_str().is_empty() => pq.as_str().to_string(),
    _ => "/".to_string(),
  };
  Ok(ForwardTarget {
    authority: HostPort {
      host: host.to_string(),
      port,
    },
    origin_form,
  })
}

/// Builds the head forwarded to the destination: origin-form request line,
/// `Connection: close` forced, `Proxy-Connection` dropped, everything else
/// verbatim in order.
pub fn build_forward_head(head: &RequestHead, target: &ForwardTarget) -> Vec<u8> {
  let mut out = Vec::with_capacity(256);
  out.extend_from_slice(
    format!(
      "{} {} HTTP/1.{}\r\n",
      head.method, target.origin_form, head.minor_version
    )
    .as_bytes(),
  );
  for (name, value) in &head.headers {
    if name.eq_ignore_ascii_case("connection") || name.eq_ignore_ascii_case("proxy-connection") {
      continue;
    }
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
  }
  out.extend_from_slice(b"Connection: close\r\n\r\n");
  out
}

/// `200 Connection established` preamble for a freshly opened tunnel.
pub async fn write_tunnel_established<W>(stream: &mut W) -> io::Result<()>
where
  W: AsyncWrite + Unpin,
{
  let head = format!(
    "HTTP/1.1 200 Connection established\r\nProxy-agent: {}\r\n\r\n",
    crate::PROXY_AGENT
  );
  stream.write_all(head.as_bytes()).await?;
  stream.flush().await
}

/// Remote-hop error response: standard status line, HTML body carrying the
/// detail text, connection closed by the caller afterwards.
pub async fn write_error_page<W>(
  stream: &mut W,
  status: u16,
  reason: &str,
  detail: &str,
) -> io::Result<()>
where
  W: AsyncWrite + Unpin,
{
  let body = format!("<html><body><h1>{status} {reason}</h1><p>{detail}</p></body></html>\r\n");
  let head = format!(
    "HTTP/1.1 {status} {reason}\r\nCache-Control: no-cache\r\nConnection: close\r\nContent-Type: text/html\r\n\r\n"
  );
  stream.write_all(head.as_bytes()).await?;
  stream.write_all(body.as_bytes()).await?;
  stream.flush().await
}

/// Local-hop failure page. Denied admission and backhaul dial or handshake
/// failures are all reported to the client this way, since no remote
/// response will ever arrive.
pub async fn write_proxy_failure<W>(stream: &mut W, info: &str) -> io::Result<()>
where
  W: AsyncWrite + Unpin,
{
  let head = "HTTP/1.1 500 Remote Proxy Error\r\nCache-Control: no-cache\r\nConnection: close\r\nContent-Type: text/html\r\n\r\n";
  stream.write_all(head.as_bytes()).await?;
  stream.write_all(info.as_bytes()).await?;
  stream.write_all(b"\r\n").await?;
  stream.flush().await
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::duplex;

  #[tokio::test]
  async fn reads_a_head_split_across_writes() {
    let (mut tx, mut rx) = duplex(1024);
    tokio::spawn(async move {
      tx.write_all(b"GET http://example.com/a HTTP/1.1\r\nHo").await.unwrap();
      tx.write_all(b"st: example.com\r\n\r\n").await.unwrap();
    });
    let head = read_request_head(&mut rx).await.unwrap();
    assert_eq!(head.method, "GET");
    assert_eq!(head.target, "http://example.com/a");
    assert_eq!(head.minor_version, 1);
    assert_eq!(head.header("host"), Some(&b"example.com"[..]));
    assert!(head.trailing.is_empty());
  }

  #[tokio::test]
  async fn keeps_bytes_past_the_blank_line() {
    let (mut tx, mut rx) = duplex(1024);
    tokio::spawn(async move {
      tx.write_all(b"POST http://example.com/ HTTP/1.1\r\nContent-Length: 4\r\n\r\nbody")
        .await
        .unwrap();
    });
    let head = read_request_head(&mut rx).await.unwrap();
    assert_eq!(head.trailing, b"body");
  }

  #[tokio::test]
  async fn oversized_head_is_refused() {
    let (mut tx, mut rx) = duplex(64 * 1024);
    tokio::spawn(async move {
      let filler = format!("GET / HTTP/1.1\r\nX-Filler: {}\r\n", "y".repeat(MAX_HEAD_LENGTH));
      tx.write_all(filler.as_bytes()).await.unwrap();
    });
    assert!(matches!(
      read_request_head(&mut rx).await,
      Err(HeadError::TooLarge)
    ));
  }

  #[tokio::test]
  async fn early_close_is_truncation() {
    let (mut tx, mut rx) = duplex(1024);
    tokio::spawn(async move {
      tx.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
      tx.shutdown().await.unwrap();
    });
    assert!(matches!(
      read_request_head(&mut rx).await,
      Err(HeadError::Truncated)
    ));
  }

  #[test]
  fn authority_parsing_defaults_to_port_80() {
    let hp: HostPort = "example.com".parse().unwrap();
    assert_eq!(hp.host, "example.com");
    assert_eq!(hp.port, 80);
    let hp: HostPort = "example.com:8443".parse().unwrap();
    assert_eq!(hp.port, 8443);
    assert_eq!(hp.addr(), "example.com:8443");
    assert!("".parse::<HostPort>().is_err());
    assert!(":99".parse::<HostPort>().is_err());
    assert!("example.com:http".parse::<HostPort>().is_err());
  }

  #[test]
  fn forward_target_accepts_plain_http_urls_only() {
    let t = parse_forward_target("http://example.com/path?q=1").unwrap();
    assert_eq!(t.authority, HostPort { host: "example.com".into(), port: 80 });
    assert_eq!(t.origin_form, "/path?q=1");

    let t = parse_forward_target("http://example.com:8080").unwrap();
    assert_eq!(t.authority.port, 8080);
    assert_eq!(t.origin_form, "/");

    assert!(parse_forward_target("ftp://example.com/path").is_err());
    assert!(parse_forward_target("https://example.com/").is_err());
    assert!(parse_forward_target("/just/a/path").is_err());
    assert!(parse_forward_target("http://example.com/a#frag").is_err());
  }

  #[test]
  fn forwarded_head_is_rewritten() {
    let head = RequestHead {
      method: "GET".into(),
      target: "http://example.com/path?q=1".into(),
      minor_version: 1,
      headers: vec![
        ("Host".into(), b"example.com".to_vec()),
        ("Proxy-Connection".into(), b"Keep-Alive".to_vec()),
        ("Connection".into(), b"keep-alive".to_vec()),
        ("Accept".into(), b"*/*".to_vec()),
      ],
      trailing: Vec::new(),
    };
    let target = parse_forward_target(&head.target).unwrap();
    let out = build_forward_head(&head, &target);
    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("GET /path?q=1 HTTP/1.1\r\n"));
    assert!(text.contains("Host: example.com\r\n"));
    assert!(text.contains("Accept: */*\r\n"));
    assert!(!text.to_ascii_lowercase().contains("proxy-connection"));
    assert!(!text.contains("keep-alive"));
    assert!(text.ends_with("Connection: close\r\n\r\n"));
  }

  #[tokio::test]
  async fn error_page_shape() {
    let (mut tx, mut rx) = duplex(4096);
    write_error_page(&mut tx, 404, "Not Found", "connection refused").await.unwrap();
    drop(tx);
    let mut out = String::new();
    rx.read_to_string(&mut out).await.unwrap();
    assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(out.contains("Connection: close\r\n"));
    assert!(out.contains("connection refused"));
  }
}
