// Copyright 2023 Divy Srivastava <dj.srivastava23@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A multi-threaded, event-driven RFC 6455 WebSocket server core: one
//! listener thread multiplexing readiness events, two bounded worker
//! pools for handshake and frame I/O, and a cleanup thread for pings and
//! idle reaping.
//!
//! # Example
//!
//! ```no_run
//! use wsserverd::config::ServerConfig;
//! use wsserverd::dispatcher::Dispatcher;
//! use wsserverd::subprotocol::{Echo, SubprotocolRegistry};
//! use wsserverd::extension::ExtensionRegistry;
//! use std::sync::Arc;
//! use std::sync::atomic::AtomicBool;
//!
//! let config = ServerConfig::builder().port_http(8080).build();
//! let subprotocols = SubprotocolRegistry::new(vec![Box::new(Echo)], "echo");
//! let extensions = ExtensionRegistry::new(Vec::new());
//! let dispatcher = Dispatcher::new(config, subprotocols, extensions);
//! let shutdown = Arc::new(AtomicBool::new(false));
//! dispatcher.run(shutdown).unwrap();
//! ```

pub mod close;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod extension;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod pool;
pub mod ringbuf;
pub mod session;
pub mod subprotocol;

pub use config::ServerConfig;
pub use dispatcher::Dispatcher;
pub use error::{HandshakeError, ServerError, WebSocketError};
pub use frame::{Frame, OpCode};
