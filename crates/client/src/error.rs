//! Client error types

use protocol::{Frame, ProtocolError};
use std::io;
use thiserror::Error;

/// Errors from broker sessions
#[derive(Debug, Error)]
pub enum ApiError {
    /// Broker unreachable, refused or permission denied
    #[error("Failed to connect to broker at {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// Mid-stream fault; the connection has been closed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A frame could not be encoded or decoded
    #[error("Malformed frame: {0}")]
    Framing(#[from] ProtocolError),

    /// The call did not get a reply: I/O fault or orderly close mid-call
    #[error("Protocol error during {action}: {source}")]
    Protocol {
        action: &'static str,
        #[source]
        source: io::Error,
    },

    /// The broker answered with something other than `result: ok`
    #[error("Broker rejected {action}: {reply}")]
    Rejected { action: &'static str, reply: Frame },

    /// No open connection
    #[error("Not connected to broker")]
    NotConnected,
}

impl ApiError {
    /// Error for a connection the broker closed before replying
    pub(crate) fn closed_by_peer(action: &'static str) -> Self {
        ApiError::Protocol {
            action,
            source: io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by broker"),
        }
    }

    /// Fold transport faults seen during a call into a single protocol error
    pub(crate) fn during(self, action: &'static str) -> Self {
        match self {
            ApiError::Io(source) => ApiError::Protocol { action, source },
            ApiError::NotConnected => ApiError::Protocol {
                action,
                source: io::Error::from(io::ErrorKind::NotConnected),
            },
            other => other,
        }
    }

    /// True when the broker closed the connection in an orderly way
    pub fn is_closed_by_peer(&self) -> bool {
        matches!(
            self,
            ApiError::Protocol { source, .. } if source.kind() == io::ErrorKind::UnexpectedEof
        )
    }
}

/// Result alias for broker sessions
pub type Result<T> = std::result::Result<T, ApiError>;

/// The refresh path ran out of attempts
#[derive(Debug, Error)]
#[error("Device fetch failed after {attempts} attempts: {source}")]
pub struct RefreshError {
    pub attempts: u32,
    #[source]
    pub source: ApiError,
}

/// Errors from attach/detach requests issued through the controller
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    #[error("'{target}' is not an allowed target for {label} (allowed: {allowed:?})")]
    TargetNotAllowed {
        label: String,
        target: String,
        allowed: Vec<String>,
    },

    #[error("Broker refused request for {label}: {reply}")]
    Refused { label: String, reply: Frame },

    #[error(transparent)]
    Api(#[from] ApiError),
}
