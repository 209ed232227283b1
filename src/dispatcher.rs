//! Single listener thread + two bounded worker pools (spec.md §4.D),
//! grounded on `examples/original_source/include/worker.h`/`server.h`'s
//! epoll distribution loop and on the mio event-loop shape in
//! `examples/other_examples/b74c2448_ryanseipp-rask-old__src-worker.rs.rs`.
//! `mio::Poll` stands in for the original's raw epoll/kqueue/poll
//! abstraction (spec.md §4.D's multiplexer is "whichever the OS offers";
//! `mio` already picks that per-platform).

use crate::config::ServerConfig;
use crate::error::{ServerError, WebSocketError};
use crate::extension::ExtensionRegistry;
use crate::frame::{closing_frame, ping_frame, Frame, OpCode, Payload};
use crate::handshake;
use crate::handshake::header::Header;
use crate::pool::Pool;
use crate::session::{Interest, Session, SessionState};
use crate::subprotocol::{ConnectInfo, Sender as SubSender, SubprotocolRegistry};
use log::{debug, info, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest as MioInterest, Poll, Registry, Token};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

const LISTENER_TOKEN: Token = Token(0);

/// A connected session plus the raw socket it owns. The socket lives
/// behind the same lock as the session's mutable state (spec.md §4.D
/// invariant I2), since only one worker may touch either at a time.
/// `registry` is a handle onto the listener's own `mio::Registry` so any
/// thread — a worker finishing a step, or a producer calling `send` from
/// outside the dispatch loop — can (de)register this fd without routing
/// back through the listener.
struct Connection {
  socket: parking_lot::Mutex<TcpStream>,
  session: Session,
  registry: Registry,
}

/// Sessions table: `fd -> Connection`, reachable through a
/// reader/writer lock so the listener thread can insert/remove while
/// workers read concurrently (spec.md §4.D).
type Sessions = RwLock<HashMap<i32, Arc<Connection>>>;

/// Runs the accept/read/write distribution loop on the calling thread
/// until `shutdown` is set. Spawns `pool_connect` (handshake work) and
/// `pool_io` (frame I/O) internally.
pub struct Dispatcher {
  config: Arc<ServerConfig>,
  subprotocols: Arc<SubprotocolRegistry>,
  extensions: Arc<ExtensionRegistry>,
  sessions: Arc<Sessions>,
}

struct ChannelSender {
  sessions: Arc<Sessions>,
  config: Arc<ServerConfig>,
  extensions: Arc<ExtensionRegistry>,
}

impl SubSender for ChannelSender {
  fn send(&self, fd: i32, opcode: OpCode, payload: &[u8]) {
    let table = self.sessions.read();
    if let Some(conn) = table.get(&fd) {
      conn.session.inc_jobs();
      enqueue(&conn.session, opcode, payload, &self.config, &self.extensions);
      arm_for_write(conn);
      conn.session.dec_jobs();
    }
  }
}

/// `true` if this session negotiated `name` during its handshake
/// (spec.md §4.C `accepted_extensions`).
fn has_accepted_extension(session: &Session, name: &str) -> bool {
  session
    .header
    .lock()
    .as_ref()
    .map(|h| h.accepted_extensions.iter().any(|(n, _)| n == name))
    .unwrap_or(false)
}

/// Splits `payload` into frames, runs them through any negotiated
/// extension's `out_frames` (spec.md §4.D send path runs extensions
/// before serialization), and copies the serialized bytes into the
/// session's outbound ring buffer. Takes `&Session` rather than
/// `&Connection` since it never touches the socket — this is what lets
/// tests drive it directly against a bare `Session`.
fn enqueue(
  session: &Session,
  opcode: OpCode,
  payload: &[u8],
  config: &ServerConfig,
  extensions: &ExtensionRegistry,
) {
  // CLOSE/PING/PONG are single, unfragmented frames (RFC 6455 §5.4);
  // `chunk_message` refuses CLOSE outright, so control opcodes build
  // their one frame directly instead of going through the chunker.
  let mut frames = if opcode.is_control() {
    vec![Frame::new(true, opcode, None, Payload::Owned(payload.to_vec()))]
  } else {
    crate::frame::chunk_message(opcode, payload, config.size_frame)
  };

  if !opcode.is_control() && has_accepted_extension(session, "permessage-deflate") {
    if let Some(ext) = extensions.find("permessage-deflate") {
      if ext.out_frames(session.fd, &mut frames).is_err() {
        warn!("out_frames failed for session {}; sending uncompressed", session.fd);
      }
    }
  }

  for frame in &frames {
    let bytes = frame.serialize();
    loop {
      match session.outbound.acquire(None, bytes.len()) {
        Some((offset, worker)) => {
          session.outbound.write_at(offset, &bytes);
          session.outbound.produce(worker);
          break;
        }
        None => std::thread::yield_now(),
      }
    }
  }
}

/// Best-effort nudge for a producer calling `send` (or the cleanup
/// thread's ping) outside of a worker step: if the fd is currently idle
/// and registered for READ only, extend it to READ|WRITE so the next
/// bounded `poll` wakeup flushes what was just enqueued. If a worker
/// currently owns the fd (deregistered mid-step), this fails silently —
/// that worker's own end-of-step `rearm` already re-checks the outbound
/// ring and will arm WRITE itself.
fn arm_for_write(conn: &Connection) {
  if conn.session.event() == Interest::Both {
    return;
  }
  conn.session.set_event(Interest::Both);
  let mut socket = conn.socket.lock();
  let _ = conn.registry.reregister(
    &mut *socket,
    Token(conn.session.fd as usize),
    MioInterest::READABLE | MioInterest::WRITABLE,
  );
}

/// Re-registers a session's fd for exactly the readiness it still wants
/// (spec.md §4.D: "optionally re-arms the fd for READ or WRITE"), using
/// the ring buffer's own fill state rather than trusting a flag that
/// could go stale between a worker's step and this call.
fn rearm(conn: &Connection) {
  let want_write = !conn.session.outbound.is_empty();
  conn.session.set_event(if want_write { Interest::Both } else { Interest::Read });
  conn.session.touch();

  // Read back what was just set rather than trusting `want_write` still
  // holds: a concurrent `send` can call `set_event(Interest::Both)` via
  // `arm_for_write` between the line above and this one, and that
  // verdict — not the now-stale local — is the one that must win.
  let mio_interest = match conn.session.event() {
    Interest::Both => MioInterest::READABLE | MioInterest::WRITABLE,
    Interest::Read => MioInterest::READABLE,
    Interest::Write => MioInterest::WRITABLE,
    Interest::None => return,
  };
  let mut socket = conn.socket.lock();
  if let Err(e) = conn
    .registry
    .register(&mut *socket, Token(conn.session.fd as usize), mio_interest)
  {
    warn!("failed to re-arm session {}: {e}", conn.session.fd);
  }
}

/// Connection lifecycle teardown (spec.md §4.D/§5 disconnect): waits for
/// every job scheduled against this session to finish, tells the
/// subprotocol and every loaded extension the fd is gone, removes it
/// from the readiness set, and evicts it from the sessions table. The
/// dropped `Connection` then closes the fd. Safe to call more than once
/// for the same session — only the first caller does any work.
fn disconnect(
  conn: &Connection,
  subprotocols: &SubprotocolRegistry,
  extensions: &ExtensionRegistry,
  sessions: &Sessions,
) {
  if !conn.session.begin_disconnect() {
    return;
  }
  conn.session.wait_for_jobs_to_drain();
  conn.session.set_state(SessionState::Closing);

  if let Some(selected) = conn
    .session
    .header
    .lock()
    .as_ref()
    .and_then(|h| h.selected_subprotocol.clone())
  {
    if let Some(proto) = subprotocols.find(&selected) {
      proto.on_close(conn.session.fd);
    }
  }

  {
    let mut socket = conn.socket.lock();
    let _ = conn.registry.deregister(&mut *socket);
  }

  for ext in extensions.iter() {
    ext.on_close(conn.session.fd);
  }

  sessions.write().remove(&conn.session.fd);
  info!("session {} disconnected", conn.session.fd);
}

impl Dispatcher {
  pub fn new(
    config: ServerConfig,
    subprotocols: SubprotocolRegistry,
    extensions: ExtensionRegistry,
  ) -> Self {
    Dispatcher {
      config: Arc::new(config),
      subprotocols: Arc::new(subprotocols),
      extensions: Arc::new(extensions),
      sessions: Arc::new(RwLock::new(HashMap::new())),
    }
  }

  /// Binds `config.port_http`, builds the multiplexer, spawns the worker
  /// pools and the cleanup thread, and runs the accept/poll loop until
  /// `shutdown` flips (spec.md §4.D: listener, `pool_connect`,
  /// `pool_io`, and a cleanup thread all run concurrently).
  pub fn run(&self, shutdown: Arc<std::sync::atomic::AtomicBool>) -> Result<(), ServerError> {
    let addr = format!("0.0.0.0:{}", self.config.port_http)
      .parse()
      .expect("constructed from a valid port");
    let mut listener = TcpListener::bind(addr).map_err(ServerError::Bind)?;
    let mut poll = Poll::new().map_err(ServerError::Multiplexer)?;
    poll
      .registry()
      .register(&mut listener, LISTENER_TOKEN, MioInterest::READABLE)
      .map_err(ServerError::Multiplexer)?;

    let subprotocols_for_connect = self.subprotocols.clone();
    let extensions_for_connect = self.extensions.clone();
    let config_for_connect = self.config.clone();
    let sessions_for_connect = self.sessions.clone();
    let pool_connect: Pool<Arc<Connection>> = Pool::new(
      "pool_connect",
      self.config.pool_connect_workers,
      self.config.pool_connect_tasks,
      move |conn| {
        handle_handshake(
          &conn,
          &config_for_connect,
          &subprotocols_for_connect,
          &extensions_for_connect,
          &sessions_for_connect,
        );
      },
    );

    let extensions_for_io = self.extensions.clone();
    let subprotocols_for_io = self.subprotocols.clone();
    let config_for_io = self.config.clone();
    let sessions_for_sender = self.sessions.clone();
    let sessions_for_disconnect = self.sessions.clone();
    let pool_io: Pool<(Arc<Connection>, bool, bool)> = Pool::new(
      "pool_io",
      self.config.pool_io_workers,
      self.config.pool_io_tasks,
      move |(conn, readable, writable)| {
        if conn.session.state() != SessionState::Closing {
          let sender = ChannelSender {
            sessions: sessions_for_sender.clone(),
            config: config_for_io.clone(),
            extensions: extensions_for_io.clone(),
          };
          if readable {
            handle_readable(&conn, &config_for_io, &subprotocols_for_io, &extensions_for_io, &sender);
          }
          if writable {
            handle_writable(&conn);
          }
        }
        conn.session.dec_jobs();
        if conn.session.state() == SessionState::Closing {
          disconnect(&conn, &subprotocols_for_io, &extensions_for_io, &sessions_for_disconnect);
        } else {
          rearm(&conn);
        }
      },
    );

    let sessions_for_cleanup = self.sessions.clone();
    let config_for_cleanup = self.config.clone();
    let subprotocols_for_cleanup = self.subprotocols.clone();
    let extensions_for_cleanup = self.extensions.clone();
    let shutdown_for_cleanup = shutdown.clone();
    let cleanup_handle = std::thread::Builder::new()
      .name("cleanup".into())
      .spawn(move || {
        while !shutdown_for_cleanup.load(Ordering::Relaxed) {
          std::thread::sleep(config_for_cleanup.timeout_poll);
          sweep_idle_sessions(
            &sessions_for_cleanup,
            &config_for_cleanup,
            &subprotocols_for_cleanup,
            &extensions_for_cleanup,
          );
        }
      })
      .expect("failed to spawn cleanup thread");

    let next_fd = AtomicI32::new(1);
    let mut events = Events::with_capacity(1024);
    while !shutdown.load(Ordering::Relaxed) {
      if let Err(e) = poll.poll(&mut events, Some(Duration::from_secs(1))) {
        if e.kind() == std::io::ErrorKind::Interrupted {
          continue;
        }
        warn!("poll failed: {e}");
        continue;
      }

      for event in events.iter() {
        if event.token() == LISTENER_TOKEN {
          loop {
            match listener.accept() {
              Ok((socket, addr)) => {
                let fd = next_fd.fetch_add(1, Ordering::Relaxed);
                let registry = match poll.registry().try_clone() {
                  Ok(r) => r,
                  Err(e) => {
                    warn!("failed to clone registry for session {fd}: {e}");
                    continue;
                  }
                };
                let session = Session::new(fd, addr.ip(), addr.port(), self.config.size_ringbuffer);
                // Not registered with the multiplexer yet: `pool_connect`
                // reads the request synchronously below, so there is no
                // readiness event for this fd to race against until the
                // handshake step re-arms it (or tears it down).
                session.inc_jobs();
                let conn = Arc::new(Connection {
                  socket: parking_lot::Mutex::new(socket),
                  session,
                  registry,
                });
                self.sessions.write().insert(fd, conn.clone());
                if pool_connect.submit(conn.clone()).is_err() {
                  warn!("pool_connect overflowed; dropping connection {fd}");
                  conn.session.dec_jobs();
                  self.sessions.write().remove(&fd);
                }
              }
              Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
              Err(e) => {
                warn!("accept failed: {e}");
                break;
              }
            }
          }
        } else {
          let fd = event.token().0 as i32;
          let table = self.sessions.read();
          if let Some(conn) = table.get(&fd) {
            let conn = conn.clone();
            drop(table);
            // Invariant I1: remove the fd from the readiness set before
            // dispatch so the same event can't be re-delivered to a
            // second worker while this one still holds the session.
            {
              let mut socket = conn.socket.lock();
              let _ = conn.registry.deregister(&mut *socket);
            }
            if event.is_error() || event.is_read_closed() || event.is_write_closed() {
              conn.session.set_state(SessionState::Closing);
            }
            conn.session.inc_jobs();
            if pool_io
              .submit((conn.clone(), event.is_readable(), event.is_writable()))
              .is_err()
            {
              warn!("pool_io overflowed; dropping event for session {fd}");
              conn.session.dec_jobs();
            }
          }
        }
      }
    }

    pool_connect.shutdown();
    pool_io.shutdown();
    let _ = cleanup_handle.join();
    Ok(())
  }
}

/// `pool_connect` task: reads the HTTP request off the socket and runs
/// the upgrade decision table, writing either a 101 response or an HTTP
/// error response back (spec.md §4.C).
fn handle_handshake(
  conn: &Connection,
  config: &ServerConfig,
  subprotocols: &SubprotocolRegistry,
  extensions: &ExtensionRegistry,
  sessions: &Sessions,
) {
  conn.session.set_state(SessionState::Reading);
  let mut buf = vec![0u8; config.size_header + config.size_uri];
  let mut socket = conn.socket.lock();
  let n = match socket.read(&mut buf) {
    Ok(n) => n,
    Err(_) => {
      drop(socket);
      conn.session.set_state(SessionState::Closing);
      conn.session.dec_jobs();
      disconnect(conn, subprotocols, extensions, sessions);
      return;
    }
  };
  buf.truncate(n);

  match Header::parse(&buf, config.size_uri, config.size_header) {
    Ok((header, _offset)) => match handshake::negotiate(header, config, subprotocols, extensions) {
      Ok(accepted) => {
        if socket.write_all(&accepted.response).is_ok() {
          *conn.session.header.lock() = Some(accepted.header);
          conn.session.set_state(SessionState::Idle);
          info!("session {} upgraded", conn.session.fd);
          if let Some(selected) = conn
            .session
            .header
            .lock()
            .as_ref()
            .and_then(|h| h.selected_subprotocol.clone())
          {
            if let Some(proto) = subprotocols.find(&selected) {
              proto.on_connect(&ConnectInfo {
                fd: conn.session.fd,
                ip: conn.session.ip,
                port: conn.session.port,
                path: "",
                cookies: &[],
              });
            }
          }
        } else {
          conn.session.set_state(SessionState::Closing);
        }
      }
      Err(err) => {
        let _ = socket.write_all(&handshake::error_response(err));
        conn.session.set_state(SessionState::Closing);
      }
    },
    Err(_) => conn.session.set_state(SessionState::Closing),
  }
  drop(socket);

  conn.session.dec_jobs();
  if conn.session.state() == SessionState::Closing {
    disconnect(conn, subprotocols, extensions, sessions);
  } else {
    rearm(conn);
  }
}

/// `pool_io` read step: drains the socket into the session's inbound
/// accumulator, parses as many complete frames as it can, validates and
/// dispatches each to its subprotocol (spec.md §4.D read step).
fn handle_readable(
  conn: &Connection,
  config: &ServerConfig,
  subprotocols: &SubprotocolRegistry,
  extensions: &ExtensionRegistry,
  sender: &dyn SubSender,
) {
  conn.session.set_state(SessionState::Reading);
  conn.session.touch();

  let mut chunk = [0u8; 8192];
  let mut socket = conn.socket.lock();
  let mut inbound = conn.session.inbound.lock();
  loop {
    match socket.read(&mut chunk) {
      Ok(0) => {
        conn.session.set_state(SessionState::Closing);
        return;
      }
      Ok(n) => inbound.extend_from_slice(&chunk[..n]),
      Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
      Err(_) => {
        conn.session.set_state(SessionState::Closing);
        return;
      }
    }
    // This bounds one session's single read step, not a whole message
    // (spec.md §4.C's `size_payload` governs the handshake's own trailing
    // payload instead); `max_message_size` is the live-session bound.
    if inbound.len() > config.max_message_size {
      break;
    }
  }
  drop(socket);

  let mut offset = 0usize;
  let mut consumed = 0usize;
  loop {
    match Frame::parse(&inbound, &mut offset) {
      Ok(mut frame) => {
        consumed = offset;
        frame.unmask();
        if let Err(e) = validate_and_dispatch(&conn.session, &mut frame, config, subprotocols, extensions, sender) {
          send_close(&conn.session, &e, config, extensions);
          conn.session.mark_closing_after_write();
          conn.session.set_state(SessionState::Idle);
          return;
        }
      }
      // A short buffer leaves `offset` past the computed frame end, past
      // the last *complete* frame's end; only bytes up to `consumed` were
      // actually parsed, so that (not `offset`) is what gets drained.
      Err(WebSocketError::UnexpectedEof) => break,
      Err(e) => {
        send_close(&conn.session, &e, config, extensions);
        conn.session.mark_closing_after_write();
        conn.session.set_state(SessionState::Idle);
        return;
      }
    }
  }
  inbound.drain(0..consumed);
  conn.session.set_state(SessionState::Idle);
}

fn validate_and_dispatch(
  session: &Session,
  frame: &mut Frame,
  config: &ServerConfig,
  subprotocols: &SubprotocolRegistry,
  extensions: &ExtensionRegistry,
  sender: &dyn SubSender,
) -> Result<(), WebSocketError> {
  if (frame.rsv1 || frame.rsv2 || frame.rsv3) && extensions.is_empty() {
    return Err(WebSocketError::ReservedBitsNotZero);
  }
  if frame.rsv1 {
    if let Some(ext) = extensions.find("permessage-deflate") {
      ext.in_frame(session.fd, frame)?;
    }
  }
  if frame.opcode.is_control() {
    if !frame.fin {
      return Err(WebSocketError::ControlFrameFragmented);
    }
    if frame.payload.len() > 125 {
      return Err(WebSocketError::ControlFrameTooLarge);
    }
    return dispatch_control(session, frame, sender);
  }

  if frame.payload.len() > config.max_message_size {
    return Err(WebSocketError::FrameTooLarge);
  }

  if let Some((opcode, message)) = session.accumulate_fragment(frame, config.max_frames)? {
    if opcode == OpCode::Text {
      validate_utf8(&message)?;
    }
    let header = session.header.lock();
    let protocol = header
      .as_ref()
      .and_then(|h| h.selected_subprotocol.as_deref())
      .and_then(|name| subprotocols.find(name));
    if let Some(protocol) = protocol {
      protocol.on_message(session.fd, opcode, &message, sender);
    }
  }
  Ok(())
}

/// UTF-8 validation, with an optional SIMD fast path selected at compile
/// time (spec.md §9's "inline SIMD" note applies equally well here: the
/// behavior must agree bit-for-bit with the scalar check).
fn validate_utf8(data: &[u8]) -> Result<(), WebSocketError> {
  #[cfg(feature = "simd")]
  let result = simdutf8::basic::from_utf8(data);
  #[cfg(not(feature = "simd"))]
  let result = std::str::from_utf8(data);

  result.map(|_| ()).map_err(|_| WebSocketError::InvalidUtf8)
}

fn dispatch_control(
  session: &Session,
  frame: &Frame,
  sender: &dyn SubSender,
) -> Result<(), WebSocketError> {
  match frame.opcode {
    OpCode::Ping => {
      sender.send(session.fd, OpCode::Pong, frame.application_data());
      Ok(())
    }
    OpCode::Pong => Ok(()),
    OpCode::Close => {
      let data = frame.application_data();
      if !data.is_empty() {
        if data.len() < 2 {
          return Err(WebSocketError::InvalidCloseFrame);
        }
        let code = u16::from_be_bytes([data[0], data[1]]);
        if !crate::close::CloseCode::is_allowed(code) {
          return Err(WebSocketError::InvalidCloseCode);
        }
        validate_utf8(&data[2..])?;
      }
      let mut sent = session.pending_close_sent.lock();
      if !*sent {
        *sent = true;
        sender.send(session.fd, OpCode::Close, data);
      }
      Err(WebSocketError::ConnectionClosed)
    }
    _ => unreachable!("data opcodes are routed separately"),
  }
}

fn send_close(session: &Session, err: &WebSocketError, config: &ServerConfig, extensions: &ExtensionRegistry) {
  if let Some(code) = err.close_code() {
    let frame = closing_frame(code, None);
    enqueue(session, OpCode::Close, frame.application_data(), config, extensions);
  }
  debug!("session {} closing: {err}", session.fd);
}

/// `pool_io` write step: drains whatever the session's ring buffer has
/// ready and writes it to the socket (spec.md §4.A/§4.D). Once the ring
/// is empty and a CLOSE was the reason this session is winding down, the
/// CLOSE has now actually reached the wire, so this is what flips the
/// session to `Closing` and lets the dispatcher run `disconnect`.
fn handle_writable(conn: &Connection) {
  conn.session.set_state(SessionState::Writing);
  let mut socket = conn.socket.lock();
  loop {
    let (offset, len) = conn.session.outbound.consume();
    if len == 0 {
      break;
    }
    let data = conn.session.outbound.read_at(offset, len);
    match socket.write_all(&data) {
      Ok(()) => conn.session.outbound.release(len),
      // Leaves this range unreleased; `consume` hands back the same
      // range on the next writable event. A non-blocking socket can in
      // principle report WouldBlock after writing part of `data` — this
      // crate's frames are far smaller than a socket send buffer, so
      // that partial-write case is treated as the rare exception it is
      // rather than tracked with a second cursor.
      Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
      Err(_) => {
        conn.session.outbound.release(len);
        conn.session.set_state(SessionState::Closing);
        return;
      }
    }
  }
  let _ = socket.flush();
  if conn.session.should_close_after_write() && conn.session.outbound.is_empty() {
    conn.session.set_state(SessionState::Closing);
  } else {
    conn.session.set_state(SessionState::Idle);
  }
}

/// Cleanup sweep: pings sessions idle past `timeout_pings`, closes (and
/// disconnects) ones idle past `timeout_client`, and runs `disconnect`
/// for any session a worker already marked `Closing` (spec.md §4.D
/// cleanup thread).
pub(crate) fn sweep_idle_sessions(
  sessions: &Sessions,
  config: &ServerConfig,
  subprotocols: &SubprotocolRegistry,
  extensions: &ExtensionRegistry,
) {
  let mut to_close = Vec::new();
  let mut to_ping = Vec::new();
  {
    let table = sessions.read();
    for conn in table.values() {
      if conn.session.state() == SessionState::Closing {
        to_close.push(conn.clone());
        continue;
      }
      let idle = conn.session.idle_for();
      if idle > config.timeout_client {
        to_close.push(conn.clone());
      } else if idle > config.timeout_pings {
        to_ping.push(conn.clone());
      }
    }
  }

  for conn in &to_ping {
    let ping = ping_frame();
    enqueue(&conn.session, OpCode::Ping, ping.application_data(), config, extensions);
    arm_for_write(conn);
  }

  for conn in &to_close {
    if conn.session.state() != SessionState::Closing {
      // Mirrors spec.md §4.D's cleanup-thread CLOSE: wait for this
      // session's own in-flight job to finish, then write the CLOSE
      // directly rather than queuing it through the ring buffer, since
      // nothing else will schedule a write step for an idle session.
      conn.session.wait_for_jobs_to_drain();
      write_close_frame_sync(conn, crate::close::CloseCode::Shutdown);
    }
    disconnect(conn, subprotocols, extensions, sessions);
  }
}

fn write_close_frame_sync(conn: &Connection, code: crate::close::CloseCode) {
  let frame = closing_frame(code, None);
  let bytes = frame.serialize();
  let mut socket = conn.socket.lock();
  let _ = socket.write_all(&bytes);
  let _ = socket.flush();
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::subprotocol::Echo;
  use std::net::{IpAddr, Ipv4Addr};
  use std::sync::Mutex as StdMutex;

  fn session() -> Session {
    Session::new(5, IpAddr::V4(Ipv4Addr::LOCALHOST), 9000, 4096)
  }

  fn registries() -> (SubprotocolRegistry, ExtensionRegistry) {
    (
      SubprotocolRegistry::new(vec![Box::new(Echo)], "echo"),
      ExtensionRegistry::new(Vec::new()),
    )
  }

  /// Records every `send` call instead of touching a real socket, so
  /// assertions can inspect exactly what the dispatch path tried to send.
  #[derive(Default)]
  struct RecordingSender {
    sent: StdMutex<Vec<(i32, OpCode, Vec<u8>)>>,
  }

  impl SubSender for RecordingSender {
    fn send(&self, fd: i32, opcode: OpCode, payload: &[u8]) {
      self.sent.lock().unwrap().push((fd, opcode, payload.to_vec()));
    }
  }

  fn masked_frame(fin: bool, opcode: OpCode, data: &[u8]) -> Frame {
    let mut frame = Frame::new(fin, opcode, Some([0, 0, 0, 0]), data.to_vec().into());
    frame.unmask();
    frame
  }

  #[test]
  fn invalid_utf8_text_message_closes_with_1007() {
    let s = session();
    let config = ServerConfig::default();
    let (subprotocols, extensions) = registries();
    let sender = RecordingSender::default();

    let mut frame = masked_frame(true, OpCode::Text, &[0xC3, 0x28]);
    let err = validate_and_dispatch(&s, &mut frame, &config, &subprotocols, &extensions, &sender)
      .unwrap_err();
    assert!(matches!(err, WebSocketError::InvalidUtf8));
    assert_eq!(err.close_code().unwrap().code(), 1007);
  }

  #[test]
  fn oversize_control_frame_closes_with_1002() {
    let s = session();
    let config = ServerConfig::default();
    let (subprotocols, extensions) = registries();
    let sender = RecordingSender::default();

    let mut frame = masked_frame(true, OpCode::Ping, &[0u8; 200]);
    let err = validate_and_dispatch(&s, &mut frame, &config, &subprotocols, &extensions, &sender)
      .unwrap_err();
    assert!(matches!(err, WebSocketError::ControlFrameTooLarge));
    assert_eq!(err.close_code().unwrap().code(), 1002);
  }

  #[test]
  fn close_frame_is_echoed_at_most_once_per_session() {
    let s = session();
    let sender = RecordingSender::default();

    let close = masked_frame(true, OpCode::Close, &[0x03, 0xE8]);
    for _ in 0..2 {
      let err = dispatch_control(&s, &close, &sender).unwrap_err();
      assert!(matches!(err, WebSocketError::ConnectionClosed));
    }
    let sent = sender.sent.lock().unwrap();
    assert_eq!(sent.len(), 1, "a CLOSE must be echoed at most once per session");
    assert_eq!(sent[0].1, OpCode::Close);
  }

  #[test]
  fn ping_is_answered_with_a_pong_carrying_the_same_payload() {
    let s = session();
    let sender = RecordingSender::default();
    let ping = masked_frame(true, OpCode::Ping, b"PING");
    dispatch_control(&s, &ping, &sender).unwrap();
    let sent = sender.sent.lock().unwrap();
    assert_eq!(sent, vec![(s.fd, OpCode::Pong, b"PING".to_vec())]);
  }

  fn connected_pair() -> (Registry, TcpStream, std::net::TcpStream) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = std::net::TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    server.set_nonblocking(true).unwrap();
    let poll = Poll::new().unwrap();
    let registry = poll.registry().try_clone().unwrap();
    (registry, TcpStream::from_std(server), client)
  }

  /// Exercises `enqueue` + `handle_writable` end to end: a queued CLOSE
  /// frame's serialized bytes must actually land on the peer socket, not
  /// just get reserved in the ring buffer and dropped.
  #[test]
  fn enqueued_close_frame_is_written_to_the_socket() {
    let (registry, server_socket, mut client) = connected_pair();
    let conn = Connection {
      socket: parking_lot::Mutex::new(server_socket),
      session: session(),
      registry,
    };

    let frame = closing_frame(crate::close::CloseCode::Normal, Some("bye"));
    enqueue(&conn.session, OpCode::Close, frame.application_data(), &ServerConfig::default(), &ExtensionRegistry::new(Vec::new()));
    assert!(!conn.session.outbound.is_empty());

    handle_writable(&conn);
    assert!(conn.session.outbound.is_empty());

    let mut buf = [0u8; 256];
    let n = client.read(&mut buf).unwrap();
    let mut offset = 0;
    let received = Frame::parse(&buf[..n], &mut offset).unwrap();
    assert_eq!(received.opcode, OpCode::Close);
    assert_eq!(&received.application_data()[2..], b"bye");
  }
}
