use crate::{id::NodeId, value::ValueError};
use std::{io, net::SocketAddr};
use thiserror::Error;

/// Failure of a single request/response exchange.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("no response in time")]
    Timeout,
    #[error("transport is not bound")]
    NotBound,
    #[error("remote error {code}: {message}")]
    Remote { code: u8, message: String },
    #[error("request cancelled")]
    Cancelled,
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// Errors of DHT operations.
#[derive(Debug, Error)]
pub enum DhtError {
    #[error("operation not supported in this mode")]
    NotSupported,
    #[error("the dht is not running")]
    NotRunning,
    #[error("request timed out")]
    Timeout,
    #[error("node id {0:x} is already used by a live node at {1}")]
    Collision(NodeId, SocketAddr),
    #[error("operation cancelled")]
    Cancelled,
    #[error("a ping to {0} is already in flight")]
    AlreadyPinging(SocketAddr),
    #[error("no contacts to send requests to")]
    NoContacts,
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("invalid value: {0}")]
    InvalidValue(#[from] ValueError),
}

/// Errors reading or writing a persisted routing table.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("routing table encoding error: {0}")]
    Bencode(#[from] serde_bencode::Error),
    #[error("routing table format version {found} is older than the required {required}")]
    Outdated { found: u32, required: u32 },
    #[error("persistence task failed: {0}")]
    Task(String),
}
