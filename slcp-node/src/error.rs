//! Failure taxonomy surfaced to callers of the messenger.

use std::net::SocketAddr;
use std::path::PathBuf;

use slcp_core::transfer::SessionError;
use slcp_core::ProtocolError;

use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("no known peer with handle {0:?}")]
    UnknownPeer(String),
    #[error("cannot send {path:?}: {reason}")]
    InvalidFile { path: PathBuf, reason: String },
    #[error("image transfer timed out ({0})")]
    TransferTimeout(&'static str),
    #[error("connection refused by {0}")]
    ConnectionRefused(SocketAddr),
    #[error("connection closed after {transferred} of {expected} bytes")]
    ConnectionClosed { transferred: u64, expected: u64 },
    #[error("port {port} is already in use (is another instance running?)")]
    BindConflict {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    MalformedMessage(#[from] ProtocolError),
    #[error("image addressed to {0:?}, not to us")]
    Misaddressed(String),
    #[error("image of {size} bytes exceeds limit of {max}")]
    ImageTooLarge { size: u64, max: u64 },
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl NodeError {
    pub(crate) fn invalid_file(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        NodeError::InvalidFile {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
