//! Error types for credential storage and the refresh exchange

/// Errors from credential storage and the refresh exchange.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("refresh rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid refresh response: {0}")]
    InvalidResponse(String),

    #[error("no refresh token held")]
    MissingRefreshToken,

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
