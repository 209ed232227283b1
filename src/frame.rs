//! WebSocket frame parsing, serialization and construction (spec.md §4.B),
//! grounded on the teacher's `frame.rs`/`mask.rs` split: `Frame`, `OpCode`
//! and `Payload` keep the teacher's shapes; parsing is re-expressed over a
//! plain byte buffer (the dispatcher owns a `Vec<u8>` accumulator per
//! session, not an `AsyncRead`) instead of the teacher's per-connection
//! async reader.

use crate::close::CloseCode;
use crate::error::WebSocketError;
use crate::mask::unmask;
use rand::RngCore;

/// The 4-bit frame type tag (RFC 6455 §5.2, spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
  Continuation,
  Text,
  Binary,
  Close,
  Ping,
  Pong,
}

impl OpCode {
  pub fn is_control(self) -> bool {
    matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
  }

  fn as_u8(self) -> u8 {
    match self {
      OpCode::Continuation => 0x0,
      OpCode::Text => 0x1,
      OpCode::Binary => 0x2,
      OpCode::Close => 0x8,
      OpCode::Ping => 0x9,
      OpCode::Pong => 0xA,
    }
  }
}

impl TryFrom<u8> for OpCode {
  type Error = WebSocketError;

  fn try_from(value: u8) -> Result<Self, Self::Error> {
    match value {
      0x0 => Ok(OpCode::Continuation),
      0x1 => Ok(OpCode::Text),
      0x2 => Ok(OpCode::Binary),
      0x8 => Ok(OpCode::Close),
      0x9 => Ok(OpCode::Ping),
      0xA => Ok(OpCode::Pong),
      _ => Err(WebSocketError::UnknownOpcode),
    }
  }
}

/// A frame's payload buffer. Owned variants dominate on the server side:
/// the dispatcher's accumulator is reused across parses, so a frame that
/// outlives the buffer it was parsed from must copy.
#[derive(Debug, Clone)]
pub enum Payload {
  Owned(Vec<u8>),
  Borrowed(&'static [u8]),
}

impl Payload {
  pub fn len(&self) -> usize {
    match self {
      Payload::Owned(v) => v.len(),
      Payload::Borrowed(v) => v.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn as_slice(&self) -> &[u8] {
    match self {
      Payload::Owned(v) => v,
      Payload::Borrowed(v) => v,
    }
  }

  pub fn into_vec(self) -> Vec<u8> {
    match self {
      Payload::Owned(v) => v,
      Payload::Borrowed(v) => v.to_vec(),
    }
  }

  fn as_mut_slice(&mut self) -> &mut [u8] {
    match self {
      Payload::Owned(v) => v,
      Payload::Borrowed(_) => &mut [],
    }
  }
}

impl From<Vec<u8>> for Payload {
  fn from(v: Vec<u8>) -> Self {
    Payload::Owned(v)
  }
}

/// A parsed WebSocket frame (spec.md §3 Frame).
#[derive(Debug, Clone)]
pub struct Frame {
  pub fin: bool,
  pub rsv1: bool,
  pub rsv2: bool,
  pub rsv3: bool,
  pub opcode: OpCode,
  pub mask: Option<[u8; 4]>,
  pub payload: Payload,
  /// Split of `payload` between extension-owned bytes (front) and
  /// application bytes (back); see spec.md §3. Extensions that consume
  /// rsv1 (permessage-deflate) leave this at 0 once they've decompressed,
  /// since the decompressed bytes are all application data.
  pub extension_data_len: usize,
}

impl Frame {
  pub fn new(fin: bool, opcode: OpCode, mask: Option<[u8; 4]>, payload: Payload) -> Self {
    Frame {
      fin,
      rsv1: false,
      rsv2: false,
      rsv3: false,
      opcode,
      mask,
      payload,
      extension_data_len: 0,
    }
  }

  pub fn application_data(&self) -> &[u8] {
    &self.payload.as_slice()[self.extension_data_len..]
  }

  /// Unmasks the payload in place using `self.mask`, clearing the mask
  /// field afterwards (idempotent: calling twice without re-setting the
  /// mask is a no-op on the second call).
  pub fn unmask(&mut self) {
    if let Some(key) = self.mask.take() {
      unmask(self.payload.as_mut_slice(), key);
    }
  }

  pub fn mask_with(&mut self, key: [u8; 4]) {
    unmask(self.payload.as_mut_slice(), key);
    self.mask = Some(key);
  }

  /// Parses one frame starting at `buffer[*offset]`, advancing `*offset`
  /// past it. If the buffer doesn't yet hold a complete frame, `*offset`
  /// is still advanced to the computed end (spec.md §4.B) so the caller
  /// can detect the shortfall via `*offset > buffer.len()` and re-arm for
  /// more data without consuming anything.
  pub fn parse(buffer: &[u8], offset: &mut usize) -> Result<Frame, WebSocketError> {
    let start = *offset;
    if buffer.len() < start + 2 {
      *offset = start + 2;
      return Err(WebSocketError::UnexpectedEof);
    }

    let b0 = buffer[start];
    let b1 = buffer[start + 1];

    let fin = b0 & 0b1000_0000 != 0;
    let rsv1 = b0 & 0b0100_0000 != 0;
    let rsv2 = b0 & 0b0010_0000 != 0;
    let rsv3 = b0 & 0b0001_0000 != 0;
    let opcode = OpCode::try_from(b0 & 0x0F)?;

    let masked = b1 & 0b1000_0000 != 0;
    let len_code = b1 & 0x7F;

    let mut pos = start + 2;
    let payload_len: u64 = match len_code {
      126 => {
        if buffer.len() < pos + 2 {
          *offset = pos + 2 + if masked { 4 } else { 0 };
          return Err(WebSocketError::UnexpectedEof);
        }
        let v = u16::from_be_bytes(buffer[pos..pos + 2].try_into().unwrap());
        pos += 2;
        v as u64
      }
      127 => {
        if buffer.len() < pos + 8 {
          *offset = pos + 8 + if masked { 4 } else { 0 };
          return Err(WebSocketError::UnexpectedEof);
        }
        let v = u64::from_be_bytes(buffer[pos..pos + 8].try_into().unwrap());
        pos += 8;
        v
      }
      n => n as u64,
    };

    let mask = if masked {
      if buffer.len() < pos + 4 {
        *offset = pos + 4;
        return Err(WebSocketError::UnexpectedEof);
      }
      let m: [u8; 4] = buffer[pos..pos + 4].try_into().unwrap();
      pos += 4;
      Some(m)
    } else {
      None
    };

    let end = pos + payload_len as usize;
    *offset = end;
    if buffer.len() < end {
      return Err(WebSocketError::UnexpectedEof);
    }

    let payload = Payload::Owned(buffer[pos..end].to_vec());
    let mut frame = Frame::new(fin, opcode, mask, payload);
    frame.rsv1 = rsv1;
    frame.rsv2 = rsv2;
    frame.rsv3 = rsv3;
    Ok(frame)
  }

  /// Serializes the frame per RFC 6455 §5.2. The server never masks
  /// outbound frames (spec.md §4.B), so `self.mask` is ignored here.
  pub fn serialize(&self) -> Vec<u8> {
    let payload = self.payload.as_slice();
    let len = payload.len();

    let mut out = Vec::with_capacity(14 + len);
    let mut b0 = self.opcode.as_u8();
    if self.fin {
      b0 |= 0b1000_0000;
    }
    if self.rsv1 {
      b0 |= 0b0100_0000;
    }
    if self.rsv2 {
      b0 |= 0b0010_0000;
    }
    if self.rsv3 {
      b0 |= 0b0001_0000;
    }
    out.push(b0);

    if len <= 125 {
      out.push(len as u8);
    } else if len <= 0xFFFF {
      out.push(126);
      out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
      out.push(127);
      out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    out.extend_from_slice(payload);
    out
  }

  /// `true` for TEXT/BINARY frames that start or continue a data message.
  pub fn is_data(&self) -> bool {
    matches!(self.opcode, OpCode::Text | OpCode::Binary | OpCode::Continuation)
  }
}

/// Builds a CLOSE frame whose payload begins with the big-endian 16-bit
/// close code, followed by `reason` (or the code's standard reason when
/// `reason` is `None`).
pub fn closing_frame(code: CloseCode, reason: Option<&str>) -> Frame {
  let reason = reason.unwrap_or_else(|| code.default_reason());
  let mut payload = Vec::with_capacity(2 + reason.len());
  payload.extend_from_slice(&code.code().to_be_bytes());
  payload.extend_from_slice(reason.as_bytes());
  let mut frame = Frame::new(true, OpCode::Close, None, Payload::Owned(payload));
  frame.extension_data_len = 0;
  frame
}

/// Builds a PING frame with a 120-byte random payload (spec.md §4.B).
pub fn ping_frame() -> Frame {
  let mut payload = vec![0u8; 120];
  rand::thread_rng().fill_bytes(&mut payload);
  Frame::new(true, OpCode::Ping, None, Payload::Owned(payload))
}

/// Builds a PONG frame reusing `ping`'s payload verbatim.
pub fn pong_frame(ping: &Frame) -> Frame {
  Frame::new(
    true,
    OpCode::Pong,
    None,
    Payload::Owned(ping.payload.as_slice().to_vec()),
  )
}

/// Splits `message` into `ceil(len / size_frame)` frames of `opcode`, the
/// last with `fin = true`. CLOSE is never fragmented — callers should use
/// [`closing_frame`] instead; this function panics if asked to chunk a
/// CLOSE opcode; the dispatcher's send path never calls it that way.
pub fn chunk_message(opcode: OpCode, message: &[u8], size_frame: usize) -> Vec<Frame> {
  assert_ne!(opcode, OpCode::Close, "CLOSE frames are never chunked");
  assert!(size_frame > 0);

  if message.is_empty() {
    return vec![Frame::new(true, opcode, None, Payload::Owned(Vec::new()))];
  }

  let mut frames = Vec::with_capacity(message.len().div_ceil(size_frame));
  let mut chunks = message.chunks(size_frame).peekable();
  let mut first = true;
  while let Some(chunk) = chunks.next() {
    let fin = chunks.peek().is_none();
    let op = if first { opcode } else { OpCode::Continuation };
    frames.push(Frame::new(fin, op, None, Payload::Owned(chunk.to_vec())));
    first = false;
  }
  frames
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_small_masked_text() {
    let bytes: [u8; 11] = [
      0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
    ];
    let mut offset = 0;
    let mut frame = Frame::parse(&bytes, &mut offset).unwrap();
    assert_eq!(offset, bytes.len());
    assert_eq!(frame.opcode, OpCode::Text);
    assert!(frame.fin);
    frame.unmask();
    assert_eq!(frame.application_data(), b"Hello");
  }

  #[test]
  fn parse_advances_offset_on_short_buffer() {
    let bytes: [u8; 4] = [0x81, 0x85, 0x37, 0xfa];
    let mut offset = 0;
    let result = Frame::parse(&bytes, &mut offset);
    assert!(result.is_err());
    assert!(offset > bytes.len());
  }

  #[test]
  fn round_trip_unmasked() {
    let frame = Frame::new(true, OpCode::Binary, None, Payload::Owned(vec![1, 2, 3, 4, 5]));
    let bytes = frame.serialize();
    let mut offset = 0;
    let parsed = Frame::parse(&bytes, &mut offset).unwrap();
    assert_eq!(parsed.fin, frame.fin);
    assert_eq!(parsed.opcode, frame.opcode);
    assert_eq!(parsed.application_data(), frame.application_data());
  }

  #[test]
  fn pong_echoes_ping_payload() {
    let ping = ping_frame();
    let pong = pong_frame(&ping);
    assert_eq!(pong.opcode, OpCode::Pong);
    assert_eq!(pong.payload.as_slice(), ping.payload.as_slice());
    assert!(pong.mask.is_none());
  }

  #[test]
  fn chunker_splits_and_sets_fin() {
    let msg = vec![0u8; 10];
    let frames = chunk_message(OpCode::Binary, &msg, 4);
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0].opcode, OpCode::Binary);
    assert_eq!(frames[1].opcode, OpCode::Continuation);
    assert_eq!(frames[2].opcode, OpCode::Continuation);
    assert!(!frames[0].fin);
    assert!(!frames[1].fin);
    assert!(frames[2].fin);
  }

  #[test]
  fn closing_frame_has_big_endian_code() {
    let frame = closing_frame(CloseCode::Normal, Some("bye"));
    let bytes = frame.application_data();
    assert_eq!(u16::from_be_bytes([bytes[0], bytes[1]]), 1000);
    assert_eq!(&bytes[2..], b"bye");
  }
}
