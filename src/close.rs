//! Close codes, RFC 6455 §7.4 as narrowed by spec.md §6.

/// A WebSocket close status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
  Normal = 1000,
  Shutdown = 1001,
  Protocol = 1002,
  Type = 1003,
  NoStatusCode = 1005,
  Abnormal = 1006,
  Utf8 = 1007,
  Policy = 1008,
  Big = 1009,
  Extension = 1010,
  Unexpected = 1011,
  Restarting = 1012,
  TryAgain = 1013,
  BadGateway = 1014,
  TlsHandshake = 1015,
  /// Any other code in the allowed ranges ([3000, 5000)) that this server
  /// does not assign meaning to but must still round-trip.
  Other(u16),
}

impl CloseCode {
  pub fn code(self) -> u16 {
    match self {
      CloseCode::Normal => 1000,
      CloseCode::Shutdown => 1001,
      CloseCode::Protocol => 1002,
      CloseCode::Type => 1003,
      CloseCode::NoStatusCode => 1005,
      CloseCode::Abnormal => 1006,
      CloseCode::Utf8 => 1007,
      CloseCode::Policy => 1008,
      CloseCode::Big => 1009,
      CloseCode::Extension => 1010,
      CloseCode::Unexpected => 1011,
      CloseCode::Restarting => 1012,
      CloseCode::TryAgain => 1013,
      CloseCode::BadGateway => 1014,
      CloseCode::TlsHandshake => 1015,
      CloseCode::Other(c) => c,
    }
  }

  /// Default human-readable reason used when a builder is given none.
  pub fn default_reason(self) -> &'static str {
    match self {
      CloseCode::Normal => "Normal closure",
      CloseCode::Shutdown => "Server is shutting down",
      CloseCode::Protocol => "Protocol error",
      CloseCode::Type => "Unsupported data",
      CloseCode::Utf8 => "Invalid UTF-8",
      CloseCode::Policy => "Policy violation",
      CloseCode::Big => "Message too big",
      CloseCode::Extension => "Mandatory extension missing",
      CloseCode::Unexpected => "Internal server error",
      CloseCode::Restarting => "Service restart",
      CloseCode::TryAgain => "Try again later",
      CloseCode::BadGateway => "Bad gateway",
      CloseCode::TlsHandshake => "TLS handshake failed",
      _ => "",
    }
  }

  /// A code received from the wire is valid iff it is not one of the
  /// reserved-but-forbidden values in spec.md §4.B's validate table.
  ///
  /// `code < 1000`, `code in [1004,1006]`, `code in [1015,2999]`, or
  /// `code >= 5000` are all rejected.
  pub fn is_allowed(code: u16) -> bool {
    !(code < 1000
      || (1004..=1006).contains(&code)
      || (1015..=2999).contains(&code)
      || code >= 5000)
  }
}

impl From<u16> for CloseCode {
  fn from(code: u16) -> Self {
    match code {
      1000 => CloseCode::Normal,
      1001 => CloseCode::Shutdown,
      1002 => CloseCode::Protocol,
      1003 => CloseCode::Type,
      1005 => CloseCode::NoStatusCode,
      1006 => CloseCode::Abnormal,
      1007 => CloseCode::Utf8,
      1008 => CloseCode::Policy,
      1009 => CloseCode::Big,
      1010 => CloseCode::Extension,
      1011 => CloseCode::Unexpected,
      1012 => CloseCode::Restarting,
      1013 => CloseCode::TryAgain,
      1014 => CloseCode::BadGateway,
      1015 => CloseCode::TlsHandshake,
      other => CloseCode::Other(other),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rejects_reserved_ranges() {
    assert!(!CloseCode::is_allowed(999));
    assert!(!CloseCode::is_allowed(1004));
    assert!(!CloseCode::is_allowed(1005));
    assert!(!CloseCode::is_allowed(1006));
    assert!(!CloseCode::is_allowed(1015));
    assert!(!CloseCode::is_allowed(2999));
    assert!(!CloseCode::is_allowed(5000));
  }

  #[test]
  fn accepts_normal_and_application_range() {
    assert!(CloseCode::is_allowed(1000));
    assert!(CloseCode::is_allowed(1002));
    assert!(CloseCode::is_allowed(3000));
    assert!(CloseCode::is_allowed(4999));
  }
}
