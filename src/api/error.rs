//! Errors returned by the function-management API and the single rule that
//! decides whether a failed operation is worth attempting again.

use std::error::Error;
use std::fmt;

use http::StatusCode;

/// Errors that can occur when talking to the function-management API.
#[derive(Debug)]
pub enum ApiError {
    /// The request never produced a response (connect, TLS, timeout).
    Transport(String),

    /// The API answered with a non-success status.
    Status {
        status: StatusCode,
        body: String,
    },

    /// The response body could not be decoded.
    Decode(String),

    /// The request could not be built (bad URL, bad header value).
    InvalidRequest(String),
}

impl ApiError {
    /// The HTTP status attached to this error, if the API answered at all.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "Request failed: {}", msg),
            Self::Status { status, body } if body.is_empty() => {
                write!(f, "API returned {}", status)
            }
            Self::Status { status, body } => write!(f, "API returned {}: {}", status, body),
            Self::Decode(msg) => write!(f, "Failed to decode response: {}", msg),
            Self::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
        }
    }
}

impl Error for ApiError {}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else if err.is_builder() {
            Self::InvalidRequest(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Find the first status code attached anywhere in an error's source chain.
pub fn status_code_of(err: &(dyn Error + 'static)) -> Option<StatusCode> {
    let mut current: Option<&(dyn Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(api) = e.downcast_ref::<ApiError>() {
            if let Some(status) = api.status_code() {
                return Some(status);
            }
        }
        current = e.source();
    }
    None
}

/// Precondition-failed means the function's own declared configuration
/// conflicts with its current state; nothing else is terminal.
pub fn is_retryable_status(status: Option<StatusCode>) -> bool {
    status != Some(StatusCode::PRECONDITION_FAILED)
}

/// Classify an arbitrary error as retryable or not.
pub fn is_retryable(err: &(dyn Error + 'static)) -> bool {
    is_retryable_status(status_code_of(err))
}
