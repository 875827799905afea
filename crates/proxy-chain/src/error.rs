//! Error taxonomy for proxy-chain.
//!
//! Every failure is handled inside the handler that owns the interaction. The
//! variants here only decide whether (and with which status line) the client
//! is told about it.

use std::io;
use std::time::Duration;

/// Status code and description sent to the client for a connection failure.
pub const CONNECTION_ERROR: (u16, &str) = (500, "Connection error");

/// Status code and description sent to the client when the upstream is too slow.
pub const GATEWAY_TIMEOUT: (u16, &str) = (504, "Gateway Timeout");

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("Invalid upstream proxy configuration: {0}")]
    Configuration(String),
    #[error("Request rejected by routing callback")]
    RoutingRejected,
    #[error("Failed to reach upstream {0}: {1}")]
    UpstreamConnect(String, String),
    #[error("Upstream did not answer within {0:?}")]
    UpstreamTimeout(Duration),
    #[error("Upstream proxy answered {0} {1}")]
    UpstreamProtocol(String, String),
    #[error("Client went away: {0}")]
    ClientAbort(&'static str),
    #[error("Failed to write to client: {0}")]
    DownstreamWrite(#[source] io::Error),
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ChainError {
    /// The status line to send the client, or `None` when the failure must
    /// tear down silently (the client is gone or cannot be written to).
    pub fn status(&self) -> Option<(u16, String)> {
        match self {
            ChainError::UpstreamTimeout(_) => {
                Some((GATEWAY_TIMEOUT.0, GATEWAY_TIMEOUT.1.to_string()))
            }
            ChainError::UpstreamProtocol(code, description) => {
                let code = code.parse().unwrap_or(CONNECTION_ERROR.0);
                Some((code, description.clone()))
            }
            ChainError::BadRequest(_) => Some((400, "Bad Request".to_string())),
            ChainError::ClientAbort(_) | ChainError::DownstreamWrite(_) | ChainError::Tls(_) => {
                None
            }
            ChainError::Configuration(_)
            | ChainError::RoutingRejected
            | ChainError::UpstreamConnect(..)
            | ChainError::Http(_)
            | ChainError::Io(_) => Some((CONNECTION_ERROR.0, CONNECTION_ERROR.1.to_string())),
        }
    }
}
