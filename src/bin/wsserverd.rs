//! Process entry point: builds a [`ServerConfig`], installs `env_logger`,
//! and runs the [`Dispatcher`] until Ctrl-C, grounded on the bootstrap
//! shape of `examples/original_source/src/main.c`'s `main()`
//! (config load → signal handler install → `WSS_server_start`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use wsserverd::config::ServerConfig;
use wsserverd::dispatcher::Dispatcher;
use wsserverd::extension::{ExtensionRegistry, PermessageDeflate};
use wsserverd::subprotocol::{Echo, SubprotocolRegistry};

fn main() {
  env_logger::init();

  let config = ServerConfig::builder()
    .port_http(
      std::env::var("WSSERVERD_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080),
    )
    .build();

  let subprotocols = SubprotocolRegistry::new(vec![Box::new(Echo)], "echo");
  let extensions = ExtensionRegistry::new(vec![Box::new(PermessageDeflate::default())]);
  let dispatcher = Dispatcher::new(config, subprotocols, extensions);

  let shutdown = Arc::new(AtomicBool::new(false));
  let shutdown_for_signal = shutdown.clone();
  ctrlc_handler(move || shutdown_for_signal.store(true, Ordering::SeqCst));

  if let Err(e) = dispatcher.run(shutdown) {
    log::error!("dispatcher exited: {e}");
    std::process::exit(1);
  }
}

/// Installs a `SIGINT`/`SIGTERM` handler without pulling in the `ctrlc`
/// crate; mirrors `examples/original_source/src/main.c`'s direct
/// `sigaction` install for `WSS_server_set_state(HALTING)`.
fn ctrlc_handler<F: Fn() + Send + 'static>(on_signal: F) {
  static HANDLER: std::sync::OnceLock<Box<dyn Fn() + Send + Sync>> = std::sync::OnceLock::new();
  let _ = HANDLER.set(Box::new(on_signal));

  extern "C" fn handle(_: i32) {
    if let Some(f) = HANDLER.get() {
      f();
    }
  }

  unsafe {
    libc::signal(libc::SIGINT, handle as usize);
    libc::signal(libc::SIGTERM, handle as usize);
  }
}
