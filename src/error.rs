use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// A datagram on the discovery port that is neither a probe, a reply nor `QUIT`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("Malformed discovery datagram: {0:?}")]
    Malformed(String),

    #[error("Discovery datagram is not valid ASCII/UTF-8")]
    NotText,
}

/// Transport-level failure on a job-transfer connection.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Timed out connecting to {0}")]
    ConnectTimeout(SocketAddr),

    #[error("No data from peer for {0:?}")]
    IdleTimeout(std::time::Duration),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Connection reset: {0}")]
    Reset(#[from] std::io::Error),
}

/// A record arrived that the protocol does not allow at this point.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Expected <{expected}> record, got <{got}>")]
    UnexpectedTag { expected: String, got: String },

    #[error("Record <{tag}> is missing field <{field}>")]
    MissingField { tag: String, field: String },

    #[error("Malformed record: {0}")]
    Malformed(String),

    #[error("Unknown job status {0:?}")]
    UnknownStatus(String),

    #[error("Path {0:?} escapes the job directory")]
    UnsafePath(String),

    #[error("Invalid base64 payload: {0}")]
    InvalidPayload(String),

    #[error("Agent is busy and cannot accept another job")]
    AgentBusy,
}

/// Failure while reading or writing records on a framed stream.
#[derive(Error, Debug)]
pub enum FramingError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// The spawned job could not run to a successful exit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobExecutionError {
    #[error("Failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("Process exited with code {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("Failed to prepare job directory: {0}")]
    Workspace(String),
}

/// The batch descriptor could not be loaded.
#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid batch descriptor {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
}

#[derive(Error, Debug)]
pub enum HerdError {
    #[error("Failed to bind {what} on {addr}: {source}")]
    Bind {
        what: &'static str,
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    JobExecution(#[from] JobExecutionError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FramingError> for HerdError {
    fn from(err: FramingError) -> Self {
        match err {
            FramingError::Io(e) => HerdError::Connection(ConnectionError::Reset(e)),
            FramingError::Protocol(e) => HerdError::Protocol(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, HerdError>;
