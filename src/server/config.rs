//! Server configuration.

use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use crate::{DEFAULT_HOST, DEFAULT_PORT, DEFAULT_READ_BUFFER_SIZE};

/// Listener and engine settings.
///
/// Start from [`Default`] and override what differs:
///
/// ```
/// use netframe::server::ServerConfig;
/// use std::time::Duration;
///
/// let config = ServerConfig {
///     name: "lmtp".to_string(),
///     port: 7025,
///     idle_timeout: Some(Duration::from_secs(300)),
///     ..Default::default()
/// };
/// assert_eq!(config.bind_address(), "127.0.0.1:7025");
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Protocol name, used for thread names and logs
    pub name: String,
    /// Host to bind to
    pub host: String,
    /// Port to listen on; 0 picks a free port
    pub port: u16,
    /// Upper bound on worker threads running handler code
    pub worker_threads: usize,
    /// Size of every connection's read buffer, i.e. the longest PDU that is
    /// delivered in one piece
    pub read_buffer_size: usize,
    /// Queued output above this many bytes is flushed even without an
    /// explicit flush
    pub write_flush_threshold: usize,
    /// Idle connections get `on_idle_timeout` after this long without input
    pub idle_timeout: Option<Duration>,
    /// How long shutdown waits for running handler code
    pub shutdown_timeout: Duration,
    /// Server-wide defaults for connection properties
    pub properties: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "netframe".to_string(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            worker_threads: default_worker_threads(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            write_flush_threshold: 64 * 1024,
            idle_timeout: None,
            shutdown_timeout: Duration::from_secs(10),
            properties: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// Returns the bind address as a string
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Sets a server-wide property default.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Twice the available parallelism.
fn default_worker_threads() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get()) * 2
}
