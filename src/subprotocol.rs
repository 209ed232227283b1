//! Subprotocol ABI (spec.md §6) expressed as a Rust trait per the "Dynamic
//! plug-in loading → interface abstraction" design note (spec.md §9).
//! Built-ins grounded on
//! `examples/original_source/subprotocols/echo/echo.c` and
//! `.../broadcast/broadcast.c`.

use crate::frame::OpCode;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::IpAddr;

/// What a subprotocol calls to push a message to one or more sessions
/// (spec.md §4.D send path, §6 Subprotocol ABI `send_fn`).
pub trait Sender: Send + Sync {
  fn send(&self, fd: i32, opcode: OpCode, payload: &[u8]);
}

/// Connection metadata passed to `on_connect` (spec.md §6).
pub struct ConnectInfo<'a> {
  pub fd: i32,
  pub ip: IpAddr,
  pub port: u16,
  pub path: &'a str,
  pub cookies: &'a [(String, String)],
}

/// Application-level plug-in selected by `Sec-WebSocket-Protocol`
/// (spec.md §6 Subprotocol ABI).
pub trait Subprotocol: Send + Sync {
  fn name(&self) -> &str;

  fn on_init(&self, _sender: &dyn Sender) {}

  fn on_connect(&self, _info: &ConnectInfo<'_>) {}

  fn on_message(&self, fd: i32, opcode: OpCode, message: &[u8], sender: &dyn Sender);

  fn on_write(&self, _fd: i32, _message: &[u8]) {}

  fn on_close(&self, _fd: i32) {}

  fn on_destroy(&self) {}
}

/// Echoes every TEXT/BINARY message back to its sender.
pub struct Echo;

impl Subprotocol for Echo {
  fn name(&self) -> &str {
    "echo"
  }

  fn on_message(&self, fd: i32, opcode: OpCode, message: &[u8], sender: &dyn Sender) {
    sender.send(fd, opcode, message);
  }
}

/// Relays every TEXT/BINARY message to every other connected session.
/// Grounded on `subprotocols/broadcast/broadcast.c`, which keeps a
/// process-global set of receiver fds; here that set is owned by the
/// `Broadcast` instance instead of a global.
pub struct Broadcast {
  receivers: Mutex<HashSet<i32>>,
}

impl Default for Broadcast {
  fn default() -> Self {
    Broadcast {
      receivers: Mutex::new(HashSet::new()),
    }
  }
}

impl Subprotocol for Broadcast {
  fn name(&self) -> &str {
    "broadcast"
  }

  fn on_connect(&self, info: &ConnectInfo<'_>) {
    self.receivers.lock().insert(info.fd);
  }

  fn on_message(&self, fd: i32, opcode: OpCode, message: &[u8], sender: &dyn Sender) {
    for receiver in self.receivers.lock().iter() {
      if *receiver != fd {
        sender.send(*receiver, opcode, message);
      }
    }
  }

  fn on_close(&self, fd: i32) {
    self.receivers.lock().remove(&fd);
  }
}

/// Immutable-after-init registry of loaded subprotocols (spec.md §9:
/// "Extension and subprotocol registries are immutable after init and
/// need no lock").
pub struct SubprotocolRegistry {
  protocols: Vec<Box<dyn Subprotocol>>,
  default_index: usize,
}

impl SubprotocolRegistry {
  pub fn new(protocols: Vec<Box<dyn Subprotocol>>, default_name: &str) -> Self {
    let default_index = protocols
      .iter()
      .position(|p| p.name() == default_name)
      .unwrap_or(0);
    SubprotocolRegistry {
      protocols,
      default_index,
    }
  }

  /// Walks the comma-separated `Sec-WebSocket-Protocol` offer list
  /// left-to-right and returns the first match; falls back to the
  /// configured default when none match (spec.md §4.C).
  pub fn negotiate(&self, offers: &[String]) -> Option<&dyn Subprotocol> {
    if self.protocols.is_empty() {
      return None;
    }
    for offer in offers {
      if let Some(p) = self.protocols.iter().find(|p| p.name() == offer.trim()) {
        return Some(p.as_ref());
      }
    }
    self.protocols.get(self.default_index).map(|p| p.as_ref())
  }

  pub fn find(&self, name: &str) -> Option<&dyn Subprotocol> {
    self.protocols.iter().find(|p| p.name() == name).map(|p| p.as_ref())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicI32, Ordering};

  struct RecordingSender {
    last_fd: AtomicI32,
  }
  impl Sender for RecordingSender {
    fn send(&self, fd: i32, _opcode: OpCode, _payload: &[u8]) {
      self.last_fd.store(fd, Ordering::SeqCst);
    }
  }

  #[test]
  fn echo_sends_back_to_same_fd() {
    let echo = Echo;
    let sender = RecordingSender {
      last_fd: AtomicI32::new(-1),
    };
    echo.on_message(7, OpCode::Text, b"hi", &sender);
    assert_eq!(sender.last_fd.load(Ordering::SeqCst), 7);
  }

  #[test]
  fn negotiate_picks_first_match_or_default() {
    let registry = SubprotocolRegistry::new(
      vec![Box::new(Echo), Box::new(Broadcast::default())],
      "echo",
    );
    let chosen = registry
      .negotiate(&["unknown".to_string(), "broadcast".to_string()])
      .unwrap();
    assert_eq!(chosen.name(), "broadcast");

    let fallback = registry.negotiate(&["nope".to_string()]).unwrap();
    assert_eq!(fallback.name(), "echo");
  }
}
