// Error taxonomy for the monitoring engine.
//
// Every boundary-crossing call returns `Result<T, MonitorError>`; the session
// decides which failures are logged and which are handed back to the caller.

use std::io;

use thiserror::Error;

use super::model::SessionState;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Location permission denied")]
    PermissionDenied,
    #[error("Location services are disabled")]
    ServiceDisabled,
    #[error("Location request timed out")]
    Timeout,
    #[error("Invalid position reading: {0}")]
    InvalidReading(String),
    #[error("Marker feed unavailable: {0}")]
    FeedUnavailable(String),
    #[error("Malformed marker payload: {0}")]
    MalformedPayload(String),
    #[error("Subscription failed: {0}")]
    Subscription(String),
    #[error("Stream error: {message}")]
    Stream { message: String, recoverable: bool },
    #[error("Operation not valid while session is {0:?}")]
    InvalidState(SessionState),
    #[error("Sink failure: {0}")]
    Sink(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MonitorError {
    /// Failures that make another attempt pointless.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::PermissionDenied | Self::ServiceDisabled)
    }

    /// Normalizes a failure to open a subscription. Permission problems keep
    /// their identity; everything else becomes `Subscription`.
    pub fn into_subscribe_error(self) -> Self {
        match self {
            Self::PermissionDenied | Self::Subscription(_) => self,
            other => Self::Subscription(other.to_string()),
        }
    }

    /// Mid-stream errors the transport can survive.
    pub fn is_recoverable_stream_error(&self) -> bool {
        matches!(self, Self::Stream { recoverable: true, .. })
    }
}
