//! Runtime settings for the sensor buffer and the relay server.

use std::time::Duration;

use crate::sensor::queue::DEFAULT_QUEUE_CAPACITY;

pub const DEFAULT_PORT: u16 = 8888;
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_MAX_CLIENTS: usize = 3;

#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub queue_capacity: usize,
    /// Upper bound on waiting for the reader thread in `stop()`.
    pub join_timeout: Duration,
    /// Bound on each wait for device readiness inside the reader loop.
    pub read_poll: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            join_timeout: Duration::from_secs(1),
            read_poll: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_clients: usize,
    pub backlog: i32,
    /// Dispatch loop readiness wait; also the shutdown latency bound.
    pub poll_timeout: Duration,
    /// Broadcast loop queue wait.
    pub broadcast_wait: Duration,
    /// How long a blocked client socket may stall a write before it is dropped.
    pub send_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_clients: DEFAULT_MAX_CLIENTS,
            backlog: 16,
            poll_timeout: Duration::from_secs(1),
            broadcast_wait: Duration::from_millis(500),
            send_timeout: Duration::from_millis(500),
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
