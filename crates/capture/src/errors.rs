//! Error types for capture sessions

use cdp_adapter::launch::LaunchCheckError;
use cdp_adapter::{AdapterError, PageSignal};
use thiserror::Error;

/// Failures surfaced by a capture session.
///
/// Cloneable so the same failure can be handed to `FrameCaptureFailed` listeners and later returned
/// from `stop()`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// Invalid options, missing encoder, unsuitable browser
    #[error("{0}")]
    Configuration(String),

    /// Operation not allowed in the current session state
    #[error("{0}")]
    Precondition(String),

    /// Stepped rendering or the protocol session failed
    #[error("{0}")]
    Protocol(String),

    /// Encoder subprocess failed
    #[error("{0}")]
    Encoder(String),

    /// The page went away or the capture ended underneath a waiter
    #[error("{0}")]
    Lifecycle(String),
}

impl CaptureError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn encoder(message: impl Into<String>) -> Self {
        Self::Encoder(message.into())
    }

    pub fn lifecycle(message: impl Into<String>) -> Self {
        Self::Lifecycle(message.into())
    }

    pub fn page_closed() -> Self {
        Self::lifecycle("Page was closed")
    }

    pub fn session_disconnected() -> Self {
        Self::protocol("Session was disconnected")
    }

    pub fn page_lost(signal: PageSignal) -> Self {
        match signal {
            PageSignal::Closed => Self::page_closed(),
            PageSignal::Disconnected => Self::session_disconnected(),
        }
    }

    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CaptureError::Configuration(_) => "configuration",
            CaptureError::Precondition(_) => "precondition",
            CaptureError::Protocol(_) => "protocol",
            CaptureError::Encoder(_) => "encoder",
            CaptureError::Lifecycle(_) => "lifecycle",
        }
    }
}

impl From<AdapterError> for CaptureError {
    fn from(err: AdapterError) -> Self {
        CaptureError::Protocol(err.to_string())
    }
}

impl From<LaunchCheckError> for CaptureError {
    fn from(err: LaunchCheckError) -> Self {
        CaptureError::Configuration(err.to_string())
    }
}

pub type CaptureResult<T> = Result<T, CaptureError>;
