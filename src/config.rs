//! Command line configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::{engine::EngineConfig, replication::MasterAddress};

#[derive(Parser, Debug, Clone, PartialEq)]
#[command(author, version, about = "A modular key-value server speaking RESP")]
pub struct ServerConfig {
    /// Interface the listener binds to.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// TCP port the listener binds to.
    #[arg(long, default_value_t = 2000, value_parser = clap::value_parser!(u16).range(1..))]
    pub port: u16,

    /// Capacity of each session's inbound command queue.
    #[arg(long = "in-queue", default_value_t = 128, value_parser = queue_capacity)]
    pub in_queue: usize,

    /// Capacity of each session's outbound reply queue.
    #[arg(long = "out-queue", default_value_t = 128, value_parser = queue_capacity)]
    pub out_queue: usize,

    /// Dump file loaded at startup and written by SAVE.
    #[arg(long, default_value = "dump.mkv")]
    pub dump: PathBuf,

    /// Attach to a master at startup, e.g. "127.0.0.1 2000".
    #[arg(long)]
    pub replicaof: Option<MasterAddress>,

    /// How long to wait for a master to accept the connection.
    #[arg(long = "connect-timeout-ms", default_value_t = 5000)]
    pub connect_timeout_ms: u64,

    /// Default log filter, overridden by RUST_LOG.
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            in_queue_capacity: self.in_queue,
            out_queue_capacity: self.out_queue,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }
}

fn queue_capacity(value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(capacity) if capacity >= 1 => Ok(capacity),
        _ => Err(format!("queue capacity must be a positive integer, got '{}'", value)),
    }
}
