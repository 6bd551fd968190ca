//! Server configuration, parsed from the command line.

use crate::persistence::FsyncPolicy;
use crate::storage::ReaperConfig;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "tidekv", version, about = "In-memory key-value server speaking RESP")]
pub struct Config {
    /// Host to bind to
    #[arg(long, default_value = crate::DEFAULT_HOST)]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = crate::DEFAULT_PORT)]
    pub port: u16,

    /// Append-only file that successful writes are logged to
    #[arg(long, default_value = "database.aof")]
    pub aof: PathBuf,

    /// Run without an append-only file
    #[arg(long)]
    pub no_aof: bool,

    /// When to fsync the append-only file
    #[arg(long, value_enum, default_value_t = FsyncPolicy::EverySec)]
    pub appendfsync: FsyncPolicy,

    /// Longest pause between reaper passes, in milliseconds
    #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(u64).range(1..))]
    pub reaper_interval_ms: u64,

    /// Most keys the reaper removes per pass
    #[arg(long, default_value_t = 256, value_parser = clap::value_parser!(u64).range(1..))]
    pub reaper_batch: u64,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The AOF location, or `None` when persistence is disabled.
    pub fn aof_path(&self) -> Option<&PathBuf> {
        (!self.no_aof).then_some(&self.aof)
    }

    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            max_interval: Duration::from_millis(self.reaper_interval_ms),
            batch_size: self.reaper_batch as usize,
        }
    }
}
