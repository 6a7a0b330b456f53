//! Error types for each stage of the relay pipeline.
//!
//! Every error here is scoped to a single input line or a single event,
//! except [FatalInputError] which ends the relay loop.

use std::time::Duration;
use thiserror::Error;

/// A raw input line could not be turned into an [Envelope](crate::models::Envelope).
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty line")]
    EmptyLine,
    #[error("line is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error(transparent)]
    IncorrectJson(#[from] serde_json::Error),
}

/// An expected sub-block of an update message is absent.
///
/// This is a known no-op path: the update is skipped without emitting events.
#[derive(Debug, Error)]
pub enum ExtractionGap {
    #[error("envelope carries no neighbor block")]
    MissingNeighbor,
    #[error("neighbor message carries no update block")]
    MissingUpdate,
    #[error("unable to parse update block: {0}")]
    MalformedUpdate(serde_json::Error),
}

/// Failure reported by a broker transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("channel in invalid state: {0}")]
    InvalidState(String),
    #[error("no acknowledgement within {0:?}")]
    Timeout(Duration),
    #[error("unable to connect to {address}: {reason}")]
    Connect { address: String, reason: String },
    #[error("connection refused by broker: {0}")]
    Refused(String),
}

impl TransportError {
    /// Whether a fresh connection might succeed where this one failed.
    ///
    /// A refusal (bad credentials, unauthorized client id) will be refused
    /// again, so it is not worth a reconnect.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::ConnectionLost(_)
            | TransportError::InvalidState(_)
            | TransportError::Timeout(_)
            | TransportError::Connect { .. } => true,
            TransportError::Refused(_) => false,
        }
    }
}

/// A prefix event could not be delivered and has been dropped.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("unable to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("unable to connect to broker: {0}")]
    Connect(TransportError),
    #[error("broker rejected event: {0}")]
    Rejected(TransportError),
    #[error("publish failed ({first}) and retry failed ({retry})")]
    RetryFailed {
        first: TransportError,
        retry: TransportError,
    },
}

/// The input stream can no longer be read.
#[derive(Debug, Error)]
#[error("unable to read input: {0}")]
pub struct FatalInputError(#[from] pub std::io::Error);
