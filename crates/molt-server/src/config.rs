//! Server configuration.
//!
//! Every option is a command-line flag that falls back to an environment
//! variable, then to a default.
//!
//! # Environment Variables
//!
//! - `MOLT_BIND_ADDR`: Listen address. `:port` binds on all interfaces. Default: `:8550`
//! - `MOLT_INBOUND_QUEUE`: Inbound frame queue per connection. Default: `1024`
//! - `MOLT_OUTBOUND_QUEUE`: Outbound frame queue per connection. Default: `1024`
//! - `MOLT_DRAIN_TIMEOUT_MS`: Upper bound on draining at shutdown. Default: `60000`
//! - `MOLT_BANNER`: Version string sent in every reply. Default: `v<crate version>`
//!
//! # Examples
//!
//! ```bash
//! MOLT_BIND_ADDR=127.0.0.1:9000 MOLT_DRAIN_TIMEOUT_MS=5000 molt-server
//! # or
//! molt-server --bind 127.0.0.1:9000 --drain-timeout-ms 5000
//! ```

use std::time::Duration;

use clap::builder::RangedU64ValueParser;
use clap::Parser;
use molt_ecdysis::{PumpOptions, DEFAULT_INBOUND_CAPACITY, DEFAULT_OUTBOUND_CAPACITY};
use tracing::info;

/// Default listen address.
pub const DEFAULT_BIND_ADDR: &str = ":8550";

/// Default drain timeout in milliseconds.
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 60_000;

/// Server configuration loaded from flags and environment variables.
#[derive(Debug, Clone, Parser)]
#[command(name = "molt-server", version, about = "Hot-reloadable websocket server")]
pub struct ServerConfig {
    /// Address to bind when starting fresh
    #[arg(long = "bind", env = "MOLT_BIND_ADDR", default_value = DEFAULT_BIND_ADDR)]
    pub bind_addr: String,

    /// Inbound frame queue capacity per connection
    #[arg(
        long,
        env = "MOLT_INBOUND_QUEUE",
        default_value_t = DEFAULT_INBOUND_CAPACITY,
        value_parser = RangedU64ValueParser::<usize>::new().range(1..)
    )]
    pub inbound_queue: usize,

    /// Outbound frame queue capacity per connection
    #[arg(
        long,
        env = "MOLT_OUTBOUND_QUEUE",
        default_value_t = DEFAULT_OUTBOUND_CAPACITY,
        value_parser = RangedU64ValueParser::<usize>::new().range(1..)
    )]
    pub outbound_queue: usize,

    /// Drain timeout in milliseconds
    #[arg(long, env = "MOLT_DRAIN_TIMEOUT_MS", default_value_t = DEFAULT_DRAIN_TIMEOUT_MS)]
    pub drain_timeout_ms: u64,

    /// Version string sent in every reply
    #[arg(long, env = "MOLT_BANNER")]
    pub banner: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            inbound_queue: DEFAULT_INBOUND_CAPACITY,
            outbound_queue: DEFAULT_OUTBOUND_CAPACITY,
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT_MS,
            banner: None,
        }
    }
}

impl ServerConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn pump_options(&self) -> PumpOptions {
        PumpOptions {
            inbound_capacity: self.inbound_queue,
            outbound_capacity: self.outbound_queue,
        }
    }

    pub fn banner(&self) -> String {
        self.banner
            .clone()
            .unwrap_or_else(|| format!("v{}", env!("CARGO_PKG_VERSION")))
    }

    /// Log the current server configuration.
    pub fn log_config(&self) {
        info!("Bind address: {}", self.bind_addr);
        info!(
            "Queue capacity: inbound {}, outbound {}",
            self.inbound_queue, self.outbound_queue
        );
        info!("Drain timeout: {}ms", self.drain_timeout_ms);
        info!("Banner: {}", self.banner());
    }

    /// Create a test configuration bound to an ephemeral local port.
    #[cfg(test)]
    pub fn test_local() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            drain_timeout_ms: 200,
            banner: Some("test".to_string()),
            ..Self::default()
        }
    }
}
