//! Error types for authenticated requests

use session_auth::RefreshFailure;

/// Errors surfaced to callers of the request pipeline.
///
/// `Unauthorized` and `RefreshFailed` are terminal authentication errors.
/// Everything else is unrelated to the credential and is never retried here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("backend rejected the credential on attempt {attempt}")]
    Unauthorized { attempt: u32 },

    #[error("credential refresh failed: {0}")]
    RefreshFailed(#[from] RefreshFailure),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("response decode error: {0}")]
    Decode(String),
}

impl Error {
    /// Whether the caller must re-authenticate before trying again.
    pub fn is_auth_terminal(&self) -> bool {
        matches!(self, Error::Unauthorized { .. } | Error::RefreshFailed(_))
    }
}

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;
