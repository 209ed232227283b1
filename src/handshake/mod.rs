//! Upgrade decision engine (spec.md §4.C). Walks the 8-step decision
//! table in order, short-circuiting on the first rejection, grounded on
//! `examples/original_source/src/http.c`'s `WSS_upgrade` dispatch.
//! `Sec-WebSocket-Accept` computation follows the sha1+base64 pattern in
//! `examples/other_examples/47cfa09a_TechfaneTechnologies-mews__src-lib.rs.rs`.

pub mod header;

use crate::config::ServerConfig;
use crate::error::HandshakeError;
use crate::extension::ExtensionRegistry;
use crate::subprotocol::SubprotocolRegistry;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use header::{Header, WsType};
use sha1::{Digest, Sha1};

const MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Computes `Sec-WebSocket-Accept` from the client's `Sec-WebSocket-Key`
/// (RFC 6455 §4.2.2 step 5, spec.md scenario 1).
pub fn accept_key(client_key: &str) -> String {
  let mut hasher = Sha1::new();
  hasher.update(client_key.as_bytes());
  hasher.update(MAGIC.as_bytes());
  STANDARD.encode(hasher.finalize())
}

/// Outcome of a successful upgrade decision: the 101 response bytes plus
/// the now-annotated header (selected subprotocol, accepted extensions).
pub struct Accepted {
  pub response: Vec<u8>,
  pub header: Header,
}

/// Runs the spec's 8-step decision table against a parsed `Header`,
/// returning either the 101 response to send or the `HandshakeError`
/// that should become an HTTP error response (spec.md §4.C, §7).
pub fn negotiate(
  mut header: Header,
  config: &ServerConfig,
  subprotocols: &SubprotocolRegistry,
  extensions: &ExtensionRegistry,
) -> Result<Accepted, HandshakeError> {
  // 1. scheme: an absolute http(s):// target means the client is asking
  //    for a plain HTTP resource, not an upgrade.
  if header.target.starts_with("http://") || header.target.starts_with("https://") {
    return Err(HandshakeError::UpgradeRequired);
  }

  // 2. URI: path (and optional query) must match a configured route.
  let (path, query) = match header.target.split_once('?') {
    Some((p, q)) => (p, Some(q)),
    None => (header.target.as_str(), None),
  };
  if !config.paths.is_empty() && !config.paths.iter().any(|p| p == path) {
    return Err(HandshakeError::NotFound);
  }
  if let Some(q) = query {
    if !config.queries.is_empty() && !config.queries.iter().any(|allowed| allowed == q) {
      return Err(HandshakeError::NotFound);
    }
  }

  // 3. Host allow-list.
  if !config.hosts.is_empty() {
    let host = header.host.as_deref().ok_or(HandshakeError::BadHost)?;
    let host_only = host.split(':').next().unwrap_or(host);
    if !config.hosts.iter().any(|h| h == host_only) {
      return Err(HandshakeError::BadHost);
    }
  }

  // 4. Upgrade header must name "websocket".
  match &header.upgrade {
    Some(v) if v.eq_ignore_ascii_case("websocket") => {}
    _ => return Err(HandshakeError::MissingUpgrade),
  }

  // 5. Connection header must include the "Upgrade" token.
  let has_upgrade_token = header
    .connection
    .as_deref()
    .map(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("upgrade")))
    .unwrap_or(false);
  if !has_upgrade_token {
    return Err(HandshakeError::MissingConnectionUpgrade);
  }

  // 6. Origin allow-list.
  if !config.origins.is_empty() {
    let origin = header.origin.as_deref().ok_or(HandshakeError::Forbidden)?;
    if !config.origins.iter().any(|o| o == origin) {
      return Err(HandshakeError::Forbidden);
    }
  }

  // 7. Draft must be one this server speaks.
  if !header.ws_type.upgradeable() {
    return Err(HandshakeError::NotImplemented);
  }

  // 8. Sec-WebSocket-Key must base64-decode to exactly 16 bytes.
  let client_key = header
    .sec_websocket_key
    .as_deref()
    .ok_or(HandshakeError::InvalidKey)?;
  let decoded = STANDARD
    .decode(client_key)
    .map_err(|_| HandshakeError::InvalidKey)?;
  if decoded.len() != 16 {
    return Err(HandshakeError::InvalidKey);
  }

  let selected_protocol = if !header.sec_websocket_protocol.is_empty() {
    subprotocols
      .negotiate(&header.sec_websocket_protocol)
      .map(|p| p.name().to_string())
  } else {
    None
  };
  header.selected_subprotocol = selected_protocol.clone();

  let accepted_extensions = negotiate_extensions(&header, extensions);
  header.accepted_extensions = accepted_extensions.clone();

  let response = build_response(
    &accept_key(client_key),
    selected_protocol.as_deref(),
    &accepted_extensions,
    header.ws_type,
  );

  Ok(Accepted { response, header })
}

/// Walks the comma-separated `Sec-WebSocket-Extensions` offer list,
/// calling `on_open` on each named, registered extension and recording
/// its accepted params (spec.md §4.C). Unknown or duplicate offers are
/// silently skipped, matching the original's "ignore what you don't
/// understand" negotiation stance.
fn negotiate_extensions(header: &Header, extensions: &ExtensionRegistry) -> Vec<(String, String)> {
  let mut accepted = Vec::new();
  let Some(offers) = &header.sec_websocket_extensions else {
    return accepted;
  };
  for offer in offers.split(',') {
    let mut parts = offer.splitn(2, ';');
    let name = parts.next().unwrap_or("").trim();
    let params = parts.next().unwrap_or("").trim();
    if name.is_empty() || accepted.iter().any(|(n, _): &(String, String)| n == name) {
      continue;
    }
    if let Some(ext) = extensions.find(name) {
      if let Some(negotiation) = ext.on_open(0, params) {
        accepted.push((name.to_string(), negotiation.accepted_params));
      }
    }
  }
  accepted
}

fn build_response(
  accept: &str,
  protocol: Option<&str>,
  extensions: &[(String, String)],
  ws_type: WsType,
) -> Vec<u8> {
  let status_line = if ws_type == WsType::Rfc6455 {
    "HTTP/1.1 101 Switching Protocols\r\n"
  } else {
    "HTTP/1.1 101 Web Socket Protocol Handshake\r\n"
  };
  let mut out = String::new();
  out.push_str(status_line);
  out.push_str("Upgrade: websocket\r\n");
  out.push_str("Connection: Upgrade\r\n");
  out.push_str(&format!("Sec-WebSocket-Accept: {accept}\r\n"));
  if let Some(p) = protocol {
    out.push_str(&format!("Sec-WebSocket-Protocol: {p}\r\n"));
  }
  if !extensions.is_empty() {
    let joined = extensions
      .iter()
      .map(|(name, params)| {
        if params.is_empty() {
          name.clone()
        } else {
          format!("{name}; {params}")
        }
      })
      .collect::<Vec<_>>()
      .join(", ");
    out.push_str(&format!("Sec-WebSocket-Extensions: {joined}\r\n"));
  }
  out.push_str("\r\n");
  out.into_bytes()
}

/// Builds the plain-HTTP error response for a rejected upgrade attempt
/// (spec.md §4.C / §7: every rejection still gets a valid HTTP response,
/// not a dropped connection).
pub fn error_response(err: HandshakeError) -> Vec<u8> {
  let status = err.status_code();
  let reason = err.reason_phrase();
  let body = format!("{status} {reason}");
  format!(
    "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
    body.len()
  )
  .into_bytes()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::subprotocol::Echo;

  #[test]
  fn accept_key_matches_rfc6455_example() {
    assert_eq!(
      accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
      "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
    );
  }

  const REQUEST: &[u8] = b"GET /chat HTTP/1.1\r\n\
Host: 127.0.0.1\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Origin: 127.0.0.1\r\n\
Sec-WebSocket-Version: 13\r\n\r\n";

  fn registries() -> (SubprotocolRegistry, ExtensionRegistry) {
    (
      SubprotocolRegistry::new(vec![Box::new(Echo)], "echo"),
      ExtensionRegistry::new(Vec::new()),
    )
  }

  #[test]
  fn accepts_a_well_formed_handshake() {
    let (header, _) = Header::parse(REQUEST, 8192, 8192).unwrap();
    let config = ServerConfig::default();
    let (subprotocols, extensions) = registries();
    let accepted = negotiate(header, &config, &subprotocols, &extensions).unwrap();
    let text = String::from_utf8(accepted.response).unwrap();
    assert!(text.starts_with("HTTP/1.1 101"));
    assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
  }

  #[test]
  fn rejects_missing_upgrade_header() {
    let req = b"GET /chat HTTP/1.1\r\nHost: a\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n";
    let (header, _) = Header::parse(req, 8192, 8192).unwrap();
    let config = ServerConfig::default();
    let (subprotocols, extensions) = registries();
    let err = negotiate(header, &config, &subprotocols, &extensions).unwrap_err();
    assert_eq!(err, HandshakeError::MissingUpgrade);
  }

  #[test]
  fn rejects_host_not_in_allow_list() {
    let (header, _) = Header::parse(REQUEST, 8192, 8192).unwrap();
    let config = ServerConfig::builder().hosts(vec!["example.com".into()]).build();
    let (subprotocols, extensions) = registries();
    let err = negotiate(header, &config, &subprotocols, &extensions).unwrap_err();
    assert_eq!(err, HandshakeError::BadHost);
  }

  #[test]
  fn rejects_malformed_key() {
    let req = b"GET /chat HTTP/1.1\r\nHost: a\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: notbase64!!\r\nSec-WebSocket-Version: 13\r\n\r\n";
    let (header, _) = Header::parse(req, 8192, 8192).unwrap();
    let config = ServerConfig::default();
    let (subprotocols, extensions) = registries();
    let err = negotiate(header, &config, &subprotocols, &extensions).unwrap_err();
    assert_eq!(err, HandshakeError::InvalidKey);
  }
}
