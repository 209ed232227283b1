//! Extension ABI (spec.md §6) expressed as a Rust trait per the "Dynamic
//! plug-in loading → interface abstraction" design note (spec.md §9).
//! Built-in `PermessageDeflate` grounded on
//! `examples/original_source/extensions/permessage-deflate/permessage-deflate.c`,
//! reusing the teacher's `miniz_oxide` inflate pattern
//! (`examples/willrnch-fastwebsockets/src/lib.rs`) for the mirror-image
//! deflate path.

use crate::frame::Frame;
use miniz_oxide::deflate::stream::{deflate, CompressorOxide};
use miniz_oxide::deflate::create_comp_flags_from_zip_params;
use miniz_oxide::inflate::stream::{inflate, InflateState};
use miniz_oxide::{DataFormat, MZFlush};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Negotiated per-connection extension state, handed back from `on_open`.
/// `accepted_params` becomes the extension's reply in the handshake's
/// `Sec-WebSocket-Extensions` response header (spec.md §4.C).
pub struct Negotiation {
  pub accepted_params: String,
}

/// Wire-level plug-in that transforms frames on their way in or out
/// (spec.md §6 Extension ABI). `rsv1`/permessage-deflate is the only
/// built-in; others can be registered the same way.
pub trait Extension: Send + Sync {
  fn name(&self) -> &str;

  /// Called once per connection when the offer is accepted; `params` is
  /// the client's offer string for this extension (e.g.
  /// `"server_no_context_takeover"`). Returning `None` rejects the offer.
  fn on_open(&self, fd: i32, params: &str) -> Option<Negotiation>;

  /// Transforms an inbound frame in place before the subprotocol sees it.
  fn in_frame(&self, fd: i32, frame: &mut Frame) -> Result<(), crate::error::WebSocketError>;

  /// Transforms the outbound frame set in place before they're queued on
  /// the wire (spec.md §4.D send path runs after this).
  fn out_frames(&self, fd: i32, frames: &mut [Frame]) -> Result<(), crate::error::WebSocketError>;

  fn on_close(&self, _fd: i32) {}
}

/// Mirrors `default_compression_level = Z_DEFAULT_COMPRESSION` and the
/// `-window_bits, Z_DEFAULT_STRATEGY` arguments to `deflateInit2` in
/// `permessage-deflate.c`.
const DEFAULT_COMPRESSION_LEVEL: i32 = 6;
const WINDOW_BITS: i32 = 15;
const DEFAULT_STRATEGY: i32 = 0;

struct CompState {
  compressor: CompressorOxide,
  decompressor: Box<InflateState>,
  server_no_context_takeover: bool,
}

/// `permessage-deflate` (RFC 7692), the only extension the original
/// ships. Maintains one zlib-equivalent stream pair per session fd,
/// matching `wss_comp_t` in `permessage-deflate.c`.
pub struct PermessageDeflate {
  sessions: Mutex<HashMap<i32, CompState>>,
}

impl Default for PermessageDeflate {
  fn default() -> Self {
    PermessageDeflate {
      sessions: Mutex::new(HashMap::new()),
    }
  }
}

impl PermessageDeflate {
  fn parse_params(params: &str) -> (bool, bool) {
    let mut server_no_context_takeover = false;
    let mut client_no_context_takeover = false;
    for part in params.split(';') {
      match part.trim() {
        "server_no_context_takeover" => server_no_context_takeover = true,
        "client_no_context_takeover" => client_no_context_takeover = true,
        _ => {}
      }
    }
    (server_no_context_takeover, client_no_context_takeover)
  }
}

impl Extension for PermessageDeflate {
  fn name(&self) -> &str {
    "permessage-deflate"
  }

  fn on_open(&self, fd: i32, params: &str) -> Option<Negotiation> {
    let (server_no_context_takeover, _client_no_context_takeover) = Self::parse_params(params);
    let flags = create_comp_flags_from_zip_params(
      DEFAULT_COMPRESSION_LEVEL,
      WINDOW_BITS,
      DEFAULT_STRATEGY,
    );
    let state = CompState {
      compressor: CompressorOxide::new(flags),
      decompressor: InflateState::new_boxed(DataFormat::Raw),
      server_no_context_takeover,
    };
    self.sessions.lock().insert(fd, state);

    let mut accepted = String::new();
    if server_no_context_takeover {
      accepted.push_str("server_no_context_takeover");
    }
    Some(Negotiation {
      accepted_params: accepted,
    })
  }

  /// Mirrors `inFrames` in the original: the concatenated, rsv1-marked
  /// payload is inflated, with the standard `00 00 ff ff` tail restored
  /// first so the decompressor sees a complete deflate block.
  fn in_frame(&self, fd: i32, frame: &mut Frame) -> Result<(), crate::error::WebSocketError> {
    if !frame.rsv1 || frame.opcode.is_control() {
      return Ok(());
    }
    let mut sessions = self.sessions.lock();
    let state = sessions
      .get_mut(&fd)
      .ok_or(crate::error::WebSocketError::ExtensionNotNegotiated)?;

    let mut input = frame.payload.as_slice().to_vec();
    input.extend_from_slice(&[0x00, 0x00, 0xff, 0xff]);

    let mut out = vec![0u8; input.len() * 4 + 64];
    loop {
      let res = inflate(&mut state.decompressor, &input, &mut out, MZFlush::Sync);
      if res.bytes_consumed == input.len() || out.len() - res.bytes_written == 0 {
        out.truncate(res.bytes_written);
        break;
      }
      let written = out.len();
      out.resize(written * 2, 0);
    }

    if state.server_no_context_takeover {
      *state.decompressor = *InflateState::new_boxed(DataFormat::Raw);
    }

    frame.payload = crate::frame::Payload::Owned(out);
    frame.rsv1 = false;
    Ok(())
  }

  /// Mirrors `outFrames`: deflate the concatenated payload, using
  /// `MZFlush::Block` (the original's `Z_BLOCK`) when
  /// `server_no_context_takeover` is set so a trailing `MZFlush::Full`
  /// round can reset the window; otherwise a single `MZFlush::Sync`
  /// round produces the usual `00 00 ff ff`-terminated stream, which is
  /// then stripped (or replaced with a single `0x00`) as RFC 7692 §7.2.1
  /// requires.
  fn out_frames(&self, fd: i32, frames: &mut [Frame]) -> Result<(), crate::error::WebSocketError> {
    if frames.is_empty() || frames[0].opcode.is_control() {
      return Ok(());
    }
    let mut sessions = self.sessions.lock();
    let state = sessions
      .get_mut(&fd)
      .ok_or(crate::error::WebSocketError::ExtensionNotNegotiated)?;

    let mut input = Vec::new();
    for f in frames.iter() {
      input.extend_from_slice(f.payload.as_slice());
    }

    let first_flush = if state.server_no_context_takeover {
      MZFlush::Block
    } else {
      MZFlush::Sync
    };
    let mut message = deflate_all(&mut state.compressor, &input, first_flush);

    if state.server_no_context_takeover {
      message.extend(deflate_all(&mut state.compressor, &[], MZFlush::Full));
    }

    if message.len() >= 4 && message[message.len() - 4..] == [0x00, 0x00, 0xff, 0xff] {
      message.truncate(message.len() - 4);
    } else {
      message.push(0x00);
    }

    if state.server_no_context_takeover {
      let flags = create_comp_flags_from_zip_params(
        DEFAULT_COMPRESSION_LEVEL,
        WINDOW_BITS,
        DEFAULT_STRATEGY,
      );
      state.compressor = CompressorOxide::new(flags);
    }

    rechunk(frames, message);
    frames[0].rsv1 = true;
    Ok(())
  }

  fn on_close(&self, fd: i32) {
    self.sessions.lock().remove(&fd);
  }
}

fn deflate_all(compressor: &mut CompressorOxide, input: &[u8], flush: MZFlush) -> Vec<u8> {
  let mut out = vec![0u8; input.len().max(64) + 256];
  loop {
    let res = deflate(compressor, input, &mut out, flush);
    if res.bytes_consumed >= input.len() && out.len() - res.bytes_written > 0 {
      out.truncate(res.bytes_written);
      return out;
    }
    let written = out.len();
    out.resize(written * 2, 0);
  }
}

/// Redistributes `message` across `frames` in-place, keeping the same
/// frame count the caller queued (spec.md's fixed per-call frame slots),
/// with every byte past the first frame's share landing in the last.
fn rechunk(frames: &mut [Frame], message: Vec<u8>) {
  let count = frames.len();
  let share = message.len() / count;
  let mut rest = message.as_slice();
  for (i, f) in frames.iter_mut().enumerate() {
    let take = if i + 1 == count { rest.len() } else { share };
    let (chunk, remainder) = rest.split_at(take);
    f.payload = crate::frame::Payload::Owned(chunk.to_vec());
    rest = remainder;
  }
}

/// Immutable-after-init registry of loaded extensions (spec.md §9).
pub struct ExtensionRegistry {
  extensions: Vec<Box<dyn Extension>>,
}

impl ExtensionRegistry {
  pub fn new(extensions: Vec<Box<dyn Extension>>) -> Self {
    ExtensionRegistry { extensions }
  }

  pub fn find(&self, name: &str) -> Option<&dyn Extension> {
    self
      .extensions
      .iter()
      .find(|e| e.name() == name)
      .map(|e| e.as_ref())
  }

  pub fn is_empty(&self) -> bool {
    self.extensions.is_empty()
  }

  /// All loaded extensions, in registration order — used by `disconnect`
  /// to run every extension's `on_close` regardless of which one (if
  /// any) this session actually negotiated.
  pub fn iter(&self) -> impl Iterator<Item = &dyn Extension> {
    self.extensions.iter().map(|e| e.as_ref())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::{OpCode, Payload};

  fn text_frame(payload: &[u8]) -> Frame {
    Frame::new(true, OpCode::Text, None, Payload::Owned(payload.to_vec()))
  }

  #[test]
  fn round_trips_a_message_through_compress_and_decompress() {
    let ext = PermessageDeflate::default();
    ext.on_open(1, "").unwrap();

    let mut frames = vec![text_frame(b"hello hello hello hello")];
    ext.out_frames(1, &mut frames).unwrap();
    assert!(frames[0].rsv1);
    assert_ne!(frames[0].payload.as_slice(), b"hello hello hello hello");

    ext.in_frame(1, &mut frames[0]).unwrap();
    assert!(!frames[0].rsv1);
    assert_eq!(frames[0].payload.as_slice(), b"hello hello hello hello");
  }

  #[test]
  fn no_context_takeover_is_accepted_and_echoed() {
    let ext = PermessageDeflate::default();
    let negotiation = ext.on_open(2, "server_no_context_takeover").unwrap();
    assert_eq!(negotiation.accepted_params, "server_no_context_takeover");

    let mut frames = vec![text_frame(b"abcabcabcabc")];
    ext.out_frames(2, &mut frames).unwrap();
    ext.in_frame(2, &mut frames[0]).unwrap();
    assert_eq!(frames[0].payload.as_slice(), b"abcabcabcabc");
  }
}
