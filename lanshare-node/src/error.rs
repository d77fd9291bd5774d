use std::net::SocketAddr;
use std::time::Duration;

use lanshare_core::repair::ControlParseError;
use lanshare_core::{ChunkError, FrameError};

use crate::net::Role;

pub type Result<T> = std::result::Result<T, NodeError>;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// A listener could not bind; fatal to that listener only.
    #[error("{role} listener cannot bind {addr}: {source}")]
    Bind {
        role: Role,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("send to {addr} timed out after {timeout:?}")]
    Timeout { addr: SocketAddr, timeout: Duration },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error("bad control message: {0}")]
    Control(#[from] ControlParseError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0} is empty; nothing to send")]
    EmptyFile(String),
    #[error("no peers discovered")]
    NoPeers,
}
