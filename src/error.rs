use thiserror::Error;

/// Errors raised by the generation layer.
#[derive(Error, Debug)]
pub enum GenError {
    /// Transport-level failure reaching the server.
    #[error("{context}: {source}")]
    Connection {
        context: String,
        source: reqwest::Error,
    },

    /// HTTP 401 with no registered credentials, or a failed re-login.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The server returned a non-2xx, non-401 response.
    #[error("server returned HTTP {status}: {body}")]
    Request { status: u16, body: String },

    /// A second `generate()` was attempted while one is already in flight.
    #[error("another generation job is already running")]
    JobAlreadyRunning,

    /// Inpaint mode was requested but the mask selects nothing.
    #[error("inpaint mode requires a non-empty mask selection")]
    EmptyMask,

    /// The active backend cannot perform the requested operation.
    #[error("{0} is not supported by the active backend")]
    UnsupportedOperation(String),

    /// `generate()` was called on a generator with no live connection.
    #[error("generator is not connected to a backend")]
    NotConnected,

    /// The URL does not look like an http(s) endpoint.
    #[error("invalid server URL: {0}")]
    InvalidUrl(String),

    /// The response was missing expected fields.
    #[error("{0}")]
    InvalidResponse(String),

    /// The backend reported a failed generation.
    #[error("generation failed: {0}")]
    GenerationFailed(String),

    /// The job was cancelled before completion.
    #[error("generation was cancelled")]
    Cancelled,

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Pixel buffer encode/decode error.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl GenError {
    /// Connection-level errors are the only ones the poll loops retry.
    pub fn is_connection(&self) -> bool {
        matches!(self, GenError::Connection { .. })
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, GenError>;
