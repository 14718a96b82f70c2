use std::time::Duration;

use crate::error::{GearError, Result};

/// Default job-server port.
pub const DEFAULT_PORT: u16 = 4730;

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Deadline for echo and status round trips
    pub request_timeout_ms: u64,
    /// Deadline for establishing the TCP connection
    pub connect_timeout_ms: u64,
    /// Largest frame body accepted from the server
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            connect_timeout_ms: 5_000,
            max_frame_size: 64 * 1024 * 1024,
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

/// How the pool picks a server for each submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionMode {
    /// Probability proportional to each server's weight.
    #[default]
    Weighted,
    /// Every server equally likely.
    Uniform,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub addr: String, // host:port format
    pub weight: u32,
}

impl ServerConfig {
    /// Parse `host[:port][=weight]`. Port defaults to 4730, weight to 1.
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        let (addr, weight) = match spec.split_once('=') {
            Some((addr, weight)) => {
                let weight = weight.trim().parse::<u32>().map_err(|_| {
                    GearError::InvalidArgument(format!("invalid weight in {:?}", spec))
                })?;
                (addr.trim(), weight)
            }
            None => (spec, 1),
        };

        if addr.is_empty() {
            return Err(GearError::InvalidArgument(format!(
                "missing host in {:?}",
                spec
            )));
        }

        let addr = if addr.contains(':') {
            addr.to_string()
        } else {
            format!("{}:{}", addr, DEFAULT_PORT)
        };

        Ok(Self { addr, weight })
    }
}

#[derive(Debug, Clone, Default)]
pub struct PoolConfig {
    pub servers: Vec<ServerConfig>,
    pub client: ClientConfig,
    pub selection: SelectionMode,
}

impl PoolConfig {
    pub fn with_server(mut self, addr: impl Into<String>, weight: u32) -> Self {
        self.servers.push(ServerConfig {
            addr: addr.into(),
            weight,
        });
        self
    }

    pub fn with_selection(mut self, selection: SelectionMode) -> Self {
        self.selection = selection;
        self
    }
}
