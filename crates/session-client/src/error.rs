//! Error types surfaced to callers of the access layer

/// Errors from sending a request through the access layer.
///
/// Only `Transport`, `Timeout`, `SessionTerminated` and `Request` come out of
/// `Dispatcher::send` directly. `Authorization` and `Application` are produced by
/// `Response::error_for_status` when the caller wants non-2xx as errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No response was obtained (connect failure, reset)
    #[error("transport error: {0}")]
    Transport(String),

    /// No response was obtained before the request deadline
    #[error("request timed out: {0}")]
    Timeout(String),

    /// The server rejected the credential even after one refresh and retry
    #[error("authorization failed ({status}): {body}")]
    Authorization { status: u16, body: String },

    /// The refresh token is no longer usable; the user must log in again
    #[error("session terminated: {0}")]
    SessionTerminated(String),

    /// Any other non-2xx response
    #[error("request failed ({status}): {body}")]
    Application { status: u16, body: String },

    /// The request could not be built (bad URL, bad header value)
    #[error("invalid request: {0}")]
    Request(String),

    /// The credential file could not be written
    #[error("credential storage error: {0}")]
    Storage(String),

    /// A successful response body did not match the expected shape
    #[error("response decode error: {0}")]
    Decode(String),
}

impl Error {
    /// Whether the consuming layer should treat the user as logged out.
    pub fn is_session_terminated(&self) -> bool {
        matches!(self, Error::SessionTerminated(_))
    }

    /// Whether no response was obtained at all.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Timeout(_))
    }
}

/// Result alias for access layer operations.
pub type Result<T> = std::result::Result<T, Error>;
