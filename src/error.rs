//! Error types for MeshKV

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for MeshKV operations
pub type Result<T> = std::result::Result<T, MeshKvError>;

/// Custom error types for MeshKV
#[derive(Error, Debug)]
pub enum MeshKvError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Carries the reason shown to the client after `ERROR: `
    #[error("{0}")]
    Protocol(String),

    /// Unknown command keyword
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Invalid node address: {0}")]
    InvalidAddress(String),

    #[error("Peer {addr} failed: {reason}")]
    Peer { addr: String, reason: String },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Server error: {0}")]
    Server(String),
}

