//! Error types for the replay engine: plain enums derived with
//! `derive_more`, no catch-all `anyhow`/`eyre` boxes.

use derive_more::{Display, Error, From};

/// Fatal configuration errors — refused at setup time, never surfaced mid-run.
#[derive(Debug, Display, Error, From)]
pub enum ConfigError {
    #[display(fmt = "invalid target address: {}", _0)]
    #[from(ignore)]
    InvalidTarget(#[error(not(source))] String),

    #[display(fmt = "invalid source address: {}", _0)]
    #[from(ignore)]
    InvalidSource(#[error(not(source))] String),

    #[display(fmt = "unsupported transport: {:?}", _0)]
    #[from(ignore)]
    UnsupportedTransport(#[error(not(source))] crate::replay::config::Transport),

    #[display(fmt = "max_clients must be greater than zero")]
    ZeroClients,
}

/// Errors surfaced while reading a query log for ingest.
#[derive(Debug, Display, Error, From)]
pub enum IngestError {
    #[display(fmt = "malformed query log line: {}", _0)]
    #[from(ignore)]
    MalformedLine(#[error(not(source))] String),

    Io(std::io::Error),
}
