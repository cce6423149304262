//! Server configuration.
//!
//! Every option can be given as a command-line flag or through a
//! `SPOOLQ_*` environment variable; flags win.

use crate::{DEFAULT_CHUNK_SIZE, DEFAULT_HOST, DEFAULT_PORT};
use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "spoolq", version, about = "persistent work-queue server")]
pub struct Config {
    /// address to bind to
    #[arg(long, env = "SPOOLQ_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// port to listen on
    #[arg(short, long, env = "SPOOLQ_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// directory holding one subdirectory per queue
    #[arg(short, long, env = "SPOOLQ_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// maximum bytes moved per read or write while streaming a payload
    #[arg(
        long,
        env = "SPOOLQ_CHUNK_SIZE",
        default_value_t = DEFAULT_CHUNK_SIZE,
        value_parser = parse_chunk_size
    )]
    pub chunk_size: usize,

    /// log filter used when RUST_LOG is not set (e.g. "debug", "spoolq=trace")
    #[arg(long, env = "SPOOLQ_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Returns the bind address as a string
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_chunk_size(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("chunk size must be greater than zero".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}
