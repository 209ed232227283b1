//! Server configuration (spec.md §6 "Configuration"). Loading this from
//! on-disk JSON is an external collaborator and out of scope (spec.md §1);
//! this module only owns the in-memory value and its defaults, mirrored
//! from `examples/original_source/include/config.h`.

/// Tunables the core consumes. Constructed directly or via
/// [`ServerConfig::builder`]; never parsed from a file by this crate.
#[derive(Debug, Clone)]
pub struct ServerConfig {
  pub size_uri: usize,
  pub size_header: usize,
  pub size_payload: usize,
  pub size_buffer: usize,
  pub size_ringbuffer: usize,
  pub size_frame: usize,
  pub max_frames: usize,
  pub size_thread: usize,
  pub pool_io_workers: usize,
  pub pool_io_tasks: usize,
  pub pool_connect_workers: usize,
  pub pool_connect_tasks: usize,
  pub timeout_poll: std::time::Duration,
  pub timeout_read: std::time::Duration,
  pub timeout_write: std::time::Duration,
  pub timeout_client: std::time::Duration,
  pub timeout_pings: std::time::Duration,
  pub port_http: u16,
  pub port_https: Option<u16>,
  pub hosts: Vec<String>,
  pub origins: Vec<String>,
  pub paths: Vec<String>,
  pub queries: Vec<String>,
  pub subprotocols: Vec<String>,
  pub subprotocols_default: String,
  pub extensions: Vec<String>,
  pub max_message_size: usize,
}

impl Default for ServerConfig {
  fn default() -> Self {
    ServerConfig {
      size_uri: 8192,
      size_header: 8192,
      size_payload: 65536,
      size_buffer: 16384,
      size_ringbuffer: 1 << 20,
      size_frame: 16384,
      max_frames: 64,
      size_thread: 1 << 20,
      pool_io_workers: 4,
      pool_io_tasks: 1024,
      pool_connect_workers: 2,
      pool_connect_tasks: 128,
      timeout_poll: std::time::Duration::from_secs(3),
      timeout_read: std::time::Duration::from_secs(30),
      timeout_write: std::time::Duration::from_secs(30),
      timeout_client: std::time::Duration::from_secs(300),
      timeout_pings: std::time::Duration::from_secs(60),
      port_http: 8080,
      port_https: None,
      hosts: Vec::new(),
      origins: Vec::new(),
      paths: Vec::new(),
      queries: Vec::new(),
      subprotocols: Vec::new(),
      subprotocols_default: String::from("echo"),
      extensions: Vec::new(),
      max_message_size: 64 << 20,
    }
  }
}

impl ServerConfig {
  pub fn builder() -> ServerConfigBuilder {
    ServerConfigBuilder(ServerConfig::default())
  }
}

/// Simple field-at-a-time builder; mirrors the teacher's preference for
/// small `set_*` methods over a derive-macro builder.
#[derive(Debug, Clone)]
pub struct ServerConfigBuilder(ServerConfig);

macro_rules! setter {
  ($name:ident, $ty:ty) => {
    pub fn $name(mut self, value: $ty) -> Self {
      self.0.$name = value;
      self
    }
  };
}

impl ServerConfigBuilder {
  setter!(size_uri, usize);
  setter!(size_header, usize);
  setter!(size_payload, usize);
  setter!(size_buffer, usize);
  setter!(size_ringbuffer, usize);
  setter!(size_frame, usize);
  setter!(max_frames, usize);
  setter!(pool_io_workers, usize);
  setter!(pool_io_tasks, usize);
  setter!(pool_connect_workers, usize);
  setter!(pool_connect_tasks, usize);
  setter!(timeout_poll, std::time::Duration);
  setter!(timeout_read, std::time::Duration);
  setter!(timeout_write, std::time::Duration);
  setter!(timeout_client, std::time::Duration);
  setter!(timeout_pings, std::time::Duration);
  setter!(port_http, u16);
  setter!(hosts, Vec<String>);
  setter!(origins, Vec<String>);
  setter!(paths, Vec<String>);
  setter!(queries, Vec<String>);
  setter!(subprotocols_default, String);
  setter!(max_message_size, usize);

  pub fn build(self) -> ServerConfig {
    self.0
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builder_overrides_defaults() {
    let config = ServerConfig::builder()
      .port_http(9001)
      .hosts(vec!["localhost".into()])
      .build();
    assert_eq!(config.port_http, 9001);
    assert_eq!(config.hosts, vec!["localhost".to_string()]);
    assert_eq!(config.size_frame, ServerConfig::default().size_frame);
  }
}
