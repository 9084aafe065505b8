use crate::streaming::protocol::PacketError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Discovery failed: {0}")]
    Discovery(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Unsafe path {path}: {reason}")]
    Path { path: PathBuf, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;
