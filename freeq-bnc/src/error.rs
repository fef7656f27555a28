//! Error types for the framing layer and the relay.

use std::io;

/// Failure to produce the next line from a connection.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
    #[error("connection closed")]
    Closed,
    #[error("connection closed mid-line ({pending} bytes pending)")]
    Truncated { pending: usize },
}

/// Errors that stop the whole relay.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid server address")]
    MissingServer,
    #[error("client queue capacity must be at least 1")]
    InvalidQueue,
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to connect to {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
    #[error("upstream read failed: {0}")]
    UpstreamRead(#[source] FrameError),
    #[error("upstream write failed: {0}")]
    UpstreamWrite(#[source] io::Error),
    #[error("upstream connection closed")]
    UpstreamClosed,
}

impl From<FrameError> for RelayError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Closed => RelayError::UpstreamClosed,
            other => RelayError::UpstreamRead(other),
        }
    }
}
