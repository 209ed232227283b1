//! Error taxonomy (spec.md §7), typed with `thiserror` the way the teacher's
//! `WebSocketError` was.

use thiserror::Error;

/// Errors that are fatal to a single session: the frame/session layer
/// returns these, the dispatcher turns them into a close frame (when a
/// close code is attached) and tears the session down.
#[derive(Error, Debug)]
pub enum WebSocketError {
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
  #[error("connection closed")]
  ConnectionClosed,
  #[error("invalid close frame")]
  InvalidCloseFrame,
  #[error("invalid close code")]
  InvalidCloseCode,
  #[error("invalid UTF-8")]
  InvalidUtf8,
  #[error("reserved bits set without a negotiated extension")]
  ReservedBitsNotZero,
  #[error("control frame must not be fragmented")]
  ControlFrameFragmented,
  #[error("control frame payload exceeds 125 bytes")]
  ControlFrameTooLarge,
  #[error("frame payload exceeds the configured maximum")]
  FrameTooLarge,
  #[error("unexpected end of stream")]
  UnexpectedEof,
  #[error("unknown or reserved opcode")]
  UnknownOpcode,
  #[error("client frame missing the mask bit")]
  FrameNotMasked,
  #[error("continuation frame with no fragment in progress")]
  UnexpectedContinuation,
  #[error("data frame received while a fragment sequence is in progress")]
  UnexpectedDataFrame,
  #[error("payload length's most significant bit set on a pre-RFC6455 draft")]
  InvalidPayloadLength,
  #[error("failed to inflate a permessage-deflate payload")]
  InvalidEncoding,
  #[error("frame count for a single message exceeds the configured limit")]
  TooManyFragments,
  #[error("rsv1 set but no extension is negotiated for this session")]
  ExtensionNotNegotiated,
}

impl WebSocketError {
  /// The close code that should be sent to the peer for this error, if any
  /// (some errors, like `ConnectionClosed` or I/O errors, have no code to
  /// send because the wire is already gone or about to be dropped).
  pub fn close_code(&self) -> Option<crate::close::CloseCode> {
    use crate::close::CloseCode;
    match self {
      WebSocketError::ReservedBitsNotZero => Some(CloseCode::Protocol),
      WebSocketError::UnknownOpcode => Some(CloseCode::Type),
      WebSocketError::FrameNotMasked => Some(CloseCode::Protocol),
      WebSocketError::ControlFrameFragmented => Some(CloseCode::Protocol),
      WebSocketError::FrameTooLarge => Some(CloseCode::Big),
      WebSocketError::ControlFrameTooLarge => Some(CloseCode::Protocol),
      WebSocketError::InvalidPayloadLength => Some(CloseCode::Protocol),
      WebSocketError::InvalidCloseFrame => Some(CloseCode::Protocol),
      WebSocketError::InvalidUtf8 => Some(CloseCode::Utf8),
      WebSocketError::InvalidCloseCode => Some(CloseCode::Protocol),
      WebSocketError::UnexpectedContinuation => Some(CloseCode::Protocol),
      WebSocketError::UnexpectedDataFrame => Some(CloseCode::Protocol),
      WebSocketError::TooManyFragments => Some(CloseCode::Big),
      WebSocketError::InvalidEncoding => Some(CloseCode::Unexpected),
      WebSocketError::ExtensionNotNegotiated => Some(CloseCode::Protocol),
      WebSocketError::ConnectionClosed
      | WebSocketError::Io(_)
      | WebSocketError::UnexpectedEof => None,
    }
  }
}

/// Errors raised while parsing and deciding on an HTTP upgrade request
/// (spec.md §4.C). Each carries the HTTP status the engine must respond
/// with.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeError {
  #[error("request line or headers malformed")]
  MalformedRequest,
  #[error("request target exceeds size_uri")]
  UriTooLong,
  #[error("header block exceeds size_header")]
  HeaderTooLarge,
  #[error("trailing payload exceeds size_payload")]
  PayloadTooLarge,
  #[error("method is not GET")]
  MethodNotAllowed,
  #[error("HTTP version is not 1.1")]
  HttpVersionNotSupported,
  #[error("request target uses an absolute http(s):// scheme")]
  UpgradeRequired,
  #[error("request target did not match any configured host/port/path/query")]
  NotFound,
  #[error("Host header not in the configured allow-list")]
  BadHost,
  #[error("missing or invalid Upgrade header")]
  MissingUpgrade,
  #[error("missing or invalid Connection header")]
  MissingConnectionUpgrade,
  #[error("Origin header not in the configured allow-list")]
  Forbidden,
  #[error("WebSocket draft version is not implemented")]
  NotImplemented,
  #[error("Sec-WebSocket-Key did not decode to 16 bytes")]
  InvalidKey,
  #[error("a header that must appear at most once was repeated")]
  DuplicateHeader,
}

impl HandshakeError {
  /// HTTP status code this error maps to, per the upgrade decision table
  /// in spec.md §4.C.
  pub fn status_code(&self) -> u16 {
    match self {
      HandshakeError::UriTooLong => 414,
      HandshakeError::HeaderTooLarge => 431,
      HandshakeError::PayloadTooLarge => 413,
      HandshakeError::MethodNotAllowed => 405,
      HandshakeError::HttpVersionNotSupported => 505,
      HandshakeError::UpgradeRequired => 426,
      HandshakeError::NotFound => 404,
      HandshakeError::BadHost => 400,
      HandshakeError::MissingUpgrade => 426,
      HandshakeError::MissingConnectionUpgrade => 426,
      HandshakeError::Forbidden => 403,
      HandshakeError::NotImplemented => 501,
      HandshakeError::InvalidKey => 426,
      HandshakeError::MalformedRequest | HandshakeError::DuplicateHeader => 400,
    }
  }

  pub fn reason_phrase(&self) -> &'static str {
    match self.status_code() {
      400 => "Bad Request",
      403 => "Forbidden",
      404 => "Not Found",
      405 => "Method Not Allowed",
      413 => "Payload Too Large",
      414 => "URI Too Long",
      426 => "Upgrade Required",
      431 => "Request Header Fields Too Large",
      501 => "Not Implemented",
      505 => "HTTP Version Not Supported",
      _ => "Error",
    }
  }
}

/// Fatal-to-process errors: failure to bind, to build the multiplexer, or
/// to start the worker pools (spec.md §7).
#[derive(Error, Debug)]
pub enum ServerError {
  #[error("failed to bind listener: {0}")]
  Bind(std::io::Error),
  #[error("failed to create the readiness multiplexer: {0}")]
  Multiplexer(std::io::Error),
  #[error("failed to spawn worker thread: {0}")]
  WorkerSpawn(std::io::Error),
  #[error("{pool} task queue overflowed (capacity {capacity})")]
  PoolOverflow { pool: &'static str, capacity: usize },
}
