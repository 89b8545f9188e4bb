//! Error types for the conversion core

use thiserror::Error;

/// Result type alias for conversion operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while converting a document
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The rendering engine could not be started
    #[error("Failed to create rendering instance: {0}")]
    PoolCreationFailed(String),

    /// The pool was drained and no longer hands out instances
    #[error("Instance pool is closed")]
    PoolClosed,

    /// Pool configuration was attempted after first use
    #[error("Pool configuration is locked once the pool has been configured or used")]
    ConfigLocked,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// Invalid conversion options supplied by the caller
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// Navigation produced no response or a non-success response
    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    /// Failed to execute a document script
    #[error("Script execution failed: {0}")]
    ScriptError(String),

    /// Failed to open or size a session surface
    #[error("Rendering failed: {0}")]
    RenderError(String),

    /// No raster size could be derived from the document and overrides
    #[error("Unable to determine dimensions: {0}")]
    DimensionsUndetermined(String),

    /// A capture (or decoding its bytes) failed
    #[error("{}", describe_capture(.chunk, .message))]
    CaptureFailed { chunk: Option<usize>, message: String },

    /// Final encoding failed
    #[error("Encoding failed: {0}")]
    CodecError(String),

    /// The request was cancelled by its deadline or an external signal
    #[error("Conversion cancelled: {0}")]
    Cancelled(String),

    /// A session could not be closed (recorded, never returned from `convert`)
    #[error("Failed to close session: {0}")]
    SessionCloseFailed(String),

    /// A state machine or signal was driven in a way it does not allow
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// CDP-specific error
    #[cfg(feature = "cdp")]
    #[error("CDP error: {0}")]
    CdpError(String),
}

impl Error {
    /// Build a `CaptureFailed` for the given chunk index
    pub fn capture(chunk: usize, message: impl Into<String>) -> Self {
        Error::CaptureFailed {
            chunk: Some(chunk),
            message: message.into(),
        }
    }

    /// Chunk index carried by a capture failure, if any
    pub fn chunk(&self) -> Option<usize> {
        match self {
            Error::CaptureFailed { chunk, .. } => *chunk,
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }
}

fn describe_capture(chunk: &Option<usize>, message: &str) -> String {
    match chunk {
        Some(index) => format!("Capture failed at chunk {}: {}", index, message),
        None => format!("Capture failed: {}", message),
    }
}

#[cfg(feature = "cdp")]
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::CdpError(format!("{:#}", err))
    }
}
