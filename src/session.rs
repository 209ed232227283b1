//! Per-connection state (spec.md §4, invariants I1-I4), grounded on
//! `examples/original_source/include/session.h`'s `session_t`: one
//! struct per fd, its own ring buffer, a single owning mutex.

use crate::frame::Frame;
use crate::handshake::header::Header;
use crate::ringbuf::RingBuffer;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::time::Instant;

/// Lifecycle state a session can be in at any instant (spec.md §4,
/// mirrors `session_state_t`). A worker only ever moves a session
/// forward through this chain; `Closing` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
  Connecting,
  Reading,
  Writing,
  Idle,
  Closing,
}

/// What the dispatcher should re-arm this session's fd for after a
/// worker finishes a step (spec.md §4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
  Read,
  Write,
  Both,
  None,
}

/// In-flight fragmented-message accumulator (spec.md §4.B fragmentation
/// rules): a data frame opens it, continuation frames extend it, and the
/// `fin` continuation closes it back to `None`.
pub struct FragmentState {
  pub opcode: crate::frame::OpCode,
  pub buffer: Vec<u8>,
  pub frame_count: usize,
}

/// Everything the dispatcher and worker pools need to drive one
/// connection. One `Session` per accepted fd; reachable only through the
/// sessions table's reader/writer lock (spec.md §4.D), and internally
/// single-writer via `lock` (invariant I2: "no two workers touch the
/// same session concurrently").
pub struct Session {
  pub fd: i32,
  pub ip: IpAddr,
  pub port: u16,
  pub handshaked: bool,
  pub state: Mutex<SessionState>,
  pub header: Mutex<Option<Header>>,
  /// Growable accumulator the reader appends raw bytes into; frames are
  /// parsed out of its front and the consumed prefix is drained.
  pub inbound: Mutex<Vec<u8>>,
  pub fragment: Mutex<Option<FragmentState>>,
  pub outbound: RingBuffer,
  pub last_activity: Mutex<Instant>,
  pub pending_close_sent: Mutex<bool>,
  /// The last worker's verdict on which readiness this session still
  /// wants (spec.md §4.D `session.event`); the dispatcher re-registers
  /// the fd for exactly this after each step.
  pub event: Mutex<Interest>,
  /// Work scheduled against this session but not yet complete — a
  /// `pool_io`/`pool_connect` dispatch or an externally scheduled `send`
  /// (spec.md §3, §5). `disconnect` waits for this to reach zero before
  /// tearing the session down.
  job_count: AtomicUsize,
  /// Guards `disconnect` so it only ever runs once per session even if
  /// both the cleanup thread and the dispatch loop try to tear down the
  /// same fd.
  disconnecting: std::sync::atomic::AtomicBool,
  /// Set once a CLOSE frame has been queued for a session-ending reason;
  /// the write step only transitions to `Closing` once the outbound ring
  /// is empty again, so the CLOSE actually reaches the wire first
  /// (mirrors the `framed`/outgoing-CLOSE detection spec.md's `Message`
  /// describes, without needing to inspect queued bytes to find it).
  closing_after_write: std::sync::atomic::AtomicBool,
}

impl Session {
  pub fn new(fd: i32, ip: IpAddr, port: u16, ringbuffer_capacity: usize) -> Self {
    Session {
      fd,
      ip,
      port,
      handshaked: false,
      state: Mutex::new(SessionState::Connecting),
      header: Mutex::new(None),
      inbound: Mutex::new(Vec::new()),
      fragment: Mutex::new(None),
      outbound: RingBuffer::new(ringbuffer_capacity, 0, 4),
      last_activity: Mutex::new(Instant::now()),
      pending_close_sent: Mutex::new(false),
      event: Mutex::new(Interest::None),
      job_count: AtomicUsize::new(0),
      disconnecting: std::sync::atomic::AtomicBool::new(false),
      closing_after_write: std::sync::atomic::AtomicBool::new(false),
    }
  }

  pub fn set_event(&self, interest: Interest) {
    *self.event.lock() = interest;
  }

  /// The readiness this session last asked to be re-armed for; read back
  /// by `rearm`/`arm_for_write` so the actual `mio` registration always
  /// matches what the last worker step decided instead of recomputing it
  /// independently.
  pub fn event(&self) -> Interest {
    *self.event.lock()
  }

  /// Marks one more unit of scheduled work against this session.
  pub fn inc_jobs(&self) {
    self.job_count.fetch_add(1, AtomicOrdering::SeqCst);
  }

  /// Marks one unit of scheduled work as finished.
  pub fn dec_jobs(&self) {
    self.job_count.fetch_sub(1, AtomicOrdering::SeqCst);
  }

  pub fn job_count(&self) -> usize {
    self.job_count.load(AtomicOrdering::SeqCst)
  }

  /// Busy-waits for every in-flight job against this session to finish.
  /// Only `disconnect` calls this, and only after the fd has already
  /// been removed from the readiness set, so no new job can start.
  pub fn wait_for_jobs_to_drain(&self) {
    while self.job_count() > 0 {
      std::thread::yield_now();
    }
  }

  /// `true` the first time this is called for a session; `false` on
  /// every call after, so a concurrent second teardown attempt backs off
  /// instead of running the close hooks twice.
  pub fn begin_disconnect(&self) -> bool {
    !self.disconnecting.swap(true, AtomicOrdering::SeqCst)
  }

  pub fn mark_closing_after_write(&self) {
    self.closing_after_write.store(true, AtomicOrdering::SeqCst);
  }

  pub fn should_close_after_write(&self) -> bool {
    self.closing_after_write.load(AtomicOrdering::SeqCst)
  }

  pub fn touch(&self) {
    *self.last_activity.lock() = Instant::now();
  }

  pub fn idle_for(&self) -> std::time::Duration {
    self.last_activity.lock().elapsed()
  }

  pub fn state(&self) -> SessionState {
    *self.state.lock()
  }

  pub fn set_state(&self, s: SessionState) {
    *self.state.lock() = s;
  }

  /// Begins (or extends, for a continuation) a fragmented message.
  /// Returns the completed message once `fin` closes it; enforces
  /// invariant I3 ("at most one fragment sequence in progress per
  /// session") by refusing a second opener.
  pub fn accumulate_fragment(
    &self,
    frame: &Frame,
    max_frames: usize,
  ) -> Result<Option<(crate::frame::OpCode, Vec<u8>)>, crate::error::WebSocketError> {
    use crate::error::WebSocketError;
    use crate::frame::OpCode;

    let mut guard = self.fragment.lock();
    match (frame.opcode, guard.as_mut()) {
      (OpCode::Continuation, None) => Err(WebSocketError::UnexpectedContinuation),
      (op, None) if op != OpCode::Continuation => {
        let mut state = FragmentState {
          opcode: op,
          buffer: frame.application_data().to_vec(),
          frame_count: 1,
        };
        if frame.fin {
          return Ok(Some((state.opcode, std::mem::take(&mut state.buffer))));
        }
        *guard = Some(state);
        Ok(None)
      }
      (op, Some(_)) if op != OpCode::Continuation => Err(WebSocketError::UnexpectedDataFrame),
      (OpCode::Continuation, Some(state)) => {
        state.buffer.extend_from_slice(frame.application_data());
        state.frame_count += 1;
        if state.frame_count > max_frames {
          return Err(WebSocketError::TooManyFragments);
        }
        if frame.fin {
          let state = guard.take().unwrap();
          Ok(Some((state.opcode, state.buffer)))
        } else {
          Ok(None)
        }
      }
      _ => unreachable!(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::{OpCode, Payload};
  use std::net::{IpAddr, Ipv4Addr};

  fn session() -> Session {
    Session::new(3, IpAddr::V4(Ipv4Addr::LOCALHOST), 8080, 4096)
  }

  fn frame(fin: bool, opcode: OpCode, data: &[u8]) -> Frame {
    Frame::new(fin, opcode, None, Payload::Owned(data.to_vec()))
  }

  #[test]
  fn single_fin_frame_completes_immediately() {
    let s = session();
    let result = s.accumulate_fragment(&frame(true, OpCode::Text, b"hi"), 16).unwrap();
    let (opcode, data) = result.unwrap();
    assert_eq!(opcode, OpCode::Text);
    assert_eq!(data, b"hi");
  }

  #[test]
  fn fragmented_message_reassembles_across_continuations() {
    let s = session();
    assert!(s
      .accumulate_fragment(&frame(false, OpCode::Text, b"he"), 16)
      .unwrap()
      .is_none());
    assert!(s
      .accumulate_fragment(&frame(false, OpCode::Continuation, b"ll"), 16)
      .unwrap()
      .is_none());
    let (opcode, data) = s
      .accumulate_fragment(&frame(true, OpCode::Continuation, b"o"), 16)
      .unwrap()
      .unwrap();
    assert_eq!(opcode, OpCode::Text);
    assert_eq!(data, b"hello");
  }

  #[test]
  fn continuation_without_opener_is_rejected() {
    let s = session();
    let err = s
      .accumulate_fragment(&frame(true, OpCode::Continuation, b"x"), 16)
      .unwrap_err();
    assert!(matches!(err, crate::error::WebSocketError::UnexpectedContinuation));
  }

  #[test]
  fn data_frame_mid_fragment_is_rejected() {
    let s = session();
    s.accumulate_fragment(&frame(false, OpCode::Text, b"a"), 16)
      .unwrap();
    let err = s
      .accumulate_fragment(&frame(true, OpCode::Binary, b"b"), 16)
      .unwrap_err();
    assert!(matches!(err, crate::error::WebSocketError::UnexpectedDataFrame));
  }

  #[test]
  fn exceeding_max_frames_is_rejected() {
    let s = session();
    s.accumulate_fragment(&frame(false, OpCode::Text, b"a"), 2)
      .unwrap();
    s.accumulate_fragment(&frame(false, OpCode::Continuation, b"b"), 2)
      .unwrap();
    let err = s
      .accumulate_fragment(&frame(true, OpCode::Continuation, b"c"), 2)
      .unwrap_err();
    assert!(matches!(err, crate::error::WebSocketError::TooManyFragments));
  }
}
