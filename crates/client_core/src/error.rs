use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// The server answered with a non-success status; `message` is the
    /// server-provided failure text or the caller's fallback.
    #[error("{message}")]
    Server { status: StatusCode, message: String },
    #[error("not logged in: missing session token")]
    MissingToken,
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Failure taxonomy used to pick an error surface: field-level flags stay
/// component-local, transport failures become dismissible banners, business
/// outcomes render as structured detail, and environment degradation is not
/// shown as an error at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Validation,
    Transport,
    Business,
    Environment,
}

impl ApiError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ApiError::Transport(_) => FailureKind::Transport,
            ApiError::Server { status, .. } if status.is_server_error() => FailureKind::Transport,
            ApiError::Server { .. } => FailureKind::Business,
            ApiError::MissingToken => FailureKind::Validation,
        }
    }
}
