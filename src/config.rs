use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::codec::DEFAULT_MAX_FRAME_SIZE;

pub const DEFAULT_PORT: u16 = 6379;

/// Server settings. Every option can also be given through its environment variable.
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(version, about)]
pub struct Config {
    /// The address to listen on
    #[arg(long, env = "AOFDIS_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// The port to listen on
    #[arg(short, long, env = "AOFDIS_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Path of the append-only file
    #[arg(long, env = "AOFDIS_AOF_PATH", default_value = "database.aof")]
    pub aof_path: PathBuf,

    /// How often the append-only file is synced to storage, in milliseconds
    #[arg(
        long,
        env = "AOFDIS_FLUSH_INTERVAL_MS",
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub flush_interval_ms: u64,

    /// Largest amount of buffered, not yet parsed, bytes accepted from a client
    #[arg(long, env = "AOFDIS_MAX_FRAME_SIZE", default_value_t = DEFAULT_MAX_FRAME_SIZE)]
    pub max_frame_size: usize,
}

impl Config {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            aof_path: PathBuf::from("database.aof"),
            flush_interval_ms: 1000,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}
