//! Parsed HTTP request and WebSocket draft detection (spec.md §3 Header,
//! §4.C). Grounded on `examples/original_source/include/header.h` /
//! `src/header.c` for the field set and draft enumeration, re-expressed
//! as an owned, line-oriented parser instead of the C in-place pointer
//! slicing.

use crate::error::HandshakeError;

/// The negotiated (or rejected) WebSocket draft, mirroring
/// `include/header.h`'s `wss_type_t`. Only `Rfc6455`, `Hybi10` and
/// `Hybi07` upgrade successfully (spec.md §4.C); the others parse (so a
/// precise 501 can be returned) but never succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsType {
  Unknown,
  Hixie75,
  Hixie76,
  Hybi04,
  Hybi05,
  Hybi06,
  Hybi07,
  Hybi10,
  Rfc6455,
}

impl WsType {
  pub fn upgradeable(self) -> bool {
    matches!(self, WsType::Rfc6455 | WsType::Hybi10 | WsType::Hybi07)
  }

  /// Chooses the highest supported draft named in a comma-separated
  /// `Sec-WebSocket-Version` header value.
  fn from_version_list(versions: &str) -> WsType {
    versions
      .split(',')
      .filter_map(|v| v.trim().parse::<u32>().ok())
      .map(WsType::from_version_number)
      .max_by_key(|t| t.rank())
      .unwrap_or(WsType::Unknown)
  }

  fn from_version_number(v: u32) -> WsType {
    match v {
      13 => WsType::Rfc6455,
      8 => WsType::Hybi10,
      7 => WsType::Hybi07,
      6 => WsType::Hybi06,
      5 => WsType::Hybi05,
      4 => WsType::Hybi04,
      _ => WsType::Unknown,
    }
  }

  fn rank(self) -> u32 {
    match self {
      WsType::Unknown => 0,
      WsType::Hixie75 => 1,
      WsType::Hixie76 => 2,
      WsType::Hybi04 => 4,
      WsType::Hybi05 => 5,
      WsType::Hybi06 => 6,
      WsType::Hybi07 => 7,
      WsType::Hybi10 => 8,
      WsType::Rfc6455 => 13,
    }
  }
}

/// A single raw header line, kept case-preserved for echoing but matched
/// case-insensitively (spec.md §4.C: "tolerates header-field name
/// case-insensitivity").
#[derive(Debug, Clone)]
struct RawHeader {
  name: String,
  value: String,
}

/// Parsed HTTP request (spec.md §3 Header).
#[derive(Debug, Clone, Default)]
pub struct Header {
  pub method: String,
  pub target: String,
  pub http_version: String,
  pub host: Option<String>,
  pub origin: Option<String>,
  pub cookies: Vec<(String, String)>,
  pub upgrade: Option<String>,
  pub connection: Option<String>,
  pub sec_websocket_key: Option<String>,
  pub sec_websocket_version: Option<String>,
  pub sec_websocket_protocol: Vec<String>,
  /// Raw `Sec-WebSocket-Extensions` offers, values from every occurrence
  /// of the header concatenated with commas preserved (spec.md §4.C).
  pub sec_websocket_extensions: Option<String>,
  pub ws_type: WsType,
  /// Set once the handshake engine selects a subprotocol.
  pub selected_subprotocol: Option<String>,
  /// Set once the handshake engine negotiates extensions: (name, accepted
  /// params).
  pub accepted_extensions: Vec<(String, String)>,
}

fn split_once_colon(line: &str) -> Option<(&str, &str)> {
  let idx = line.find(':')?;
  Some((&line[..idx], line[idx + 1..].trim_start()))
}

fn parse_cookies(value: &str) -> Vec<(String, String)> {
  value
    .split(';')
    .filter_map(|kv| {
      let kv = kv.trim();
      let idx = kv.find('=')?;
      Some((kv[..idx].trim().to_string(), kv[idx + 1..].trim().to_string()))
    })
    .collect()
}

impl Header {
  /// Parses the request line and headers out of `buffer`, which must
  /// contain at least the double-CRLF terminator. Returns the header and
  /// the offset of the first payload byte (just past the double CRLF).
  ///
  /// Enforces: method GET, `size_uri`, `HTTP/1.1`, `size_header`, and
  /// that `Sec-WebSocket-Version`/`Sec-WebSocket-Key` don't repeat
  /// (spec.md §4.C).
  pub fn parse(
    buffer: &[u8],
    size_uri: usize,
    size_header: usize,
  ) -> Result<(Header, usize), HandshakeError> {
    let terminator = find_double_crlf(buffer).ok_or(HandshakeError::MalformedRequest)?;
    if terminator > size_header {
      return Err(HandshakeError::HeaderTooLarge);
    }
    let text = std::str::from_utf8(&buffer[..terminator])
      .map_err(|_| HandshakeError::MalformedRequest)?;

    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or(HandshakeError::MalformedRequest)?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or(HandshakeError::MalformedRequest)?.to_string();
    let target = parts.next().ok_or(HandshakeError::MalformedRequest)?.to_string();
    let http_version = parts.next().ok_or(HandshakeError::MalformedRequest)?.to_string();

    if method != "GET" {
      return Err(HandshakeError::MethodNotAllowed);
    }
    if target.len() > size_uri {
      return Err(HandshakeError::UriTooLong);
    }
    if !(target.starts_with('/')
      || target.starts_with("ws://")
      || target.starts_with("wss://")
      || target.starts_with("http://")
      || target.starts_with("https://"))
    {
      return Err(HandshakeError::MalformedRequest);
    }
    if http_version != "HTTP/1.1" {
      return Err(HandshakeError::HttpVersionNotSupported);
    }

    let mut raw_headers: Vec<RawHeader> = Vec::new();
    for line in lines {
      if line.is_empty() {
        continue;
      }
      let (name, value) = split_once_colon(line).ok_or(HandshakeError::MalformedRequest)?;
      raw_headers.push(RawHeader {
        name: name.trim().to_string(),
        value: value.to_string(),
      });
    }

    let mut header = Header {
      method,
      target,
      http_version,
      ..Default::default()
    };

    let mut seen_version = false;
    let mut seen_key = false;
    let mut extensions_acc: Option<String> = None;

    for h in &raw_headers {
      let lname = h.name.to_ascii_lowercase();
      match lname.as_str() {
        "host" => header.host = Some(h.value.clone()),
        "origin" => header.origin = Some(h.value.clone()),
        "cookie" => header.cookies.extend(parse_cookies(&h.value)),
        "upgrade" => header.upgrade = Some(h.value.clone()),
        "connection" => header.connection = Some(h.value.clone()),
        "sec-websocket-key" => {
          if seen_key {
            return Err(HandshakeError::DuplicateHeader);
          }
          seen_key = true;
          header.sec_websocket_key = Some(h.value.trim().to_string());
        }
        "sec-websocket-version" => {
          if seen_version {
            return Err(HandshakeError::DuplicateHeader);
          }
          seen_version = true;
          header.sec_websocket_version = Some(h.value.trim().to_string());
        }
        "sec-websocket-protocol" => {
          header
            .sec_websocket_protocol
            .extend(h.value.split(',').map(|s| s.trim().to_string()));
        }
        "sec-websocket-extensions" => {
          let v = h.value.trim();
          extensions_acc = Some(match extensions_acc.take() {
            Some(mut acc) => {
              acc.push(',');
              acc.push_str(v);
              acc
            }
            None => v.to_string(),
          });
        }
        _ => {}
      }
    }
    header.sec_websocket_extensions = extensions_acc;

    header.ws_type = match &header.sec_websocket_version {
      Some(v) => WsType::from_version_list(v),
      None => detect_legacy_draft(&raw_headers),
    };

    Ok((header, terminator + 4))
  }
}

/// Matches legacy Hixie/HYBI draft signatures when no
/// `Sec-WebSocket-Version` header is present (spec.md §4.C: "the engine
/// also matches legacy draft signatures ... but only RFC6455, HYBI10, and
/// HYBI07 upgrade successfully").
fn detect_legacy_draft(raw_headers: &[RawHeader]) -> WsType {
  let has = |name: &str| raw_headers.iter().any(|h| h.name.eq_ignore_ascii_case(name));
  if has("Sec-WebSocket-Key1") && has("Sec-WebSocket-Key2") {
    WsType::Hixie76
  } else if has("Sec-WebSocket-Key") {
    // HYBI-04..06 used Sec-WebSocket-Key without declaring a version.
    WsType::Hybi04
  } else if has("WebSocket-Protocol") || has("Origin") {
    WsType::Hixie75
  } else {
    WsType::Unknown
  }
}

fn find_double_crlf(buffer: &[u8]) -> Option<usize> {
  buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
  use super::*;

  const REQUEST: &[u8] = b"GET /chat HTTP/1.1\r\n\
Host: 127.0.0.1\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Origin: 127.0.0.1\r\n\
Sec-WebSocket-Version: 13\r\n\r\n";

  #[test]
  fn parses_handshake_request() {
    let (header, body_offset) = Header::parse(REQUEST, 8192, 8192).unwrap();
    assert_eq!(header.method, "GET");
    assert_eq!(header.target, "/chat");
    assert_eq!(header.host.as_deref(), Some("127.0.0.1"));
    assert_eq!(
      header.sec_websocket_key.as_deref(),
      Some("dGhlIHNhbXBsZSBub25jZQ==")
    );
    assert_eq!(header.ws_type, WsType::Rfc6455);
    assert_eq!(body_offset, REQUEST.len());
  }

  #[test]
  fn rejects_non_get() {
    let req = b"POST /chat HTTP/1.1\r\nHost: a\r\n\r\n";
    let err = Header::parse(req, 8192, 8192).unwrap_err();
    assert_eq!(err, HandshakeError::MethodNotAllowed);
  }

  #[test]
  fn rejects_duplicate_key() {
    let req = b"GET / HTTP/1.1\r\nSec-WebSocket-Key: a\r\nSec-WebSocket-Key: b\r\n\r\n";
    let err = Header::parse(req, 8192, 8192).unwrap_err();
    assert_eq!(err, HandshakeError::DuplicateHeader);
  }

  #[test]
  fn concatenates_multiple_extension_headers() {
    let req = b"GET / HTTP/1.1\r\nSec-WebSocket-Extensions: a\r\nSec-WebSocket-Extensions: b; x=1\r\n\r\n";
    let (header, _) = Header::parse(req, 8192, 8192).unwrap();
    assert_eq!(header.sec_websocket_extensions.as_deref(), Some("a,b; x=1"));
  }

  #[test]
  fn header_name_is_case_insensitive() {
    let req = b"GET / HTTP/1.1\r\nHOST: example.com\r\nupGRADE: WebSocket\r\n\r\n";
    let (header, _) = Header::parse(req, 8192, 8192).unwrap();
    assert_eq!(header.host.as_deref(), Some("example.com"));
    assert_eq!(header.upgrade.as_deref(), Some("WebSocket"));
  }
}
