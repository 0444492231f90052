use std::io;

use derive_more::{Display, Error, From};
use reqwest::StatusCode;
use serde::Deserialize;

use crate::auth::AuthError;

/// Whether repeating a failed operation may succeed.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Retryability {
    /// Transient failure, e.g. a timeout or a server error.
    #[display("retryable")]
    Retryable,
    /// Rate or quota limit hit, retry after backing off.
    #[display("retryable with backoff")]
    Backoff,
    /// Retrying won't help, e.g. missing permissions.
    #[display("fatal")]
    Fatal,
}

/// Reasons of Drive API errors that signal rate or quota limits.
const BACKOFF_REASONS: &[&str] = &[
    "rateLimitExceeded",
    "userRateLimitExceeded",
    "dailyLimitExceeded",
    "quotaExceeded",
    "storageQuotaExceeded",
];

#[derive(Debug, Display, Error, From)]
/// Errors on calls to the Google Drive API.
pub enum DriveError {
    /// The request did not complete.
    #[from]
    #[display("Request to the Drive API failed: {_0}")]
    Transport(reqwest::Error),
    /// The API answered with an error status.
    #[display("Drive API responded with {status}: {message}")]
    Api {
        status: StatusCode,
        reason: Option<String>,
        message: String,
    },
    /// No access token could be obtained.
    #[from]
    #[display("Obtaining an access token failed: {_0}")]
    Auth(AuthError),
    /// The local file can't be read.
    #[from]
    #[display("Reading the upload file failed: {_0}")]
    Io(io::Error),
    /// The upload session was not opened as expected.
    #[display("Upload session response carried no location")]
    MissingLocation,
}

impl DriveError {
    pub fn retryability(&self) -> Retryability {
        match self {
            Self::Transport(e) => classify_transport(e),
            Self::Api { status, reason, .. } => classify_status(*status, reason.as_deref()),
            Self::Auth(e) => e.retryability(),
            Self::Io(_) => Retryability::Fatal,
            Self::MissingLocation => Retryability::Retryable,
        }
    }
}

/// Classifies a failed request that never produced a response status.
pub fn classify_transport(e: &reqwest::Error) -> Retryability {
    if let Some(status) = e.status() {
        classify_status(status, None)
    } else if e.is_decode() || e.is_builder() {
        Retryability::Fatal
    } else {
        // timeouts, refused connections and broken bodies
        Retryability::Retryable
    }
}

fn classify_status(status: StatusCode, reason: Option<&str>) -> Retryability {
    if reason.is_some_and(|reason| BACKOFF_REASONS.contains(&reason))
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        Retryability::Backoff
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        Retryability::Retryable
    } else {
        Retryability::Fatal
    }
}

/// Error body of the Drive API.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    reason: Option<String>,
}

/// Passes successful responses through, turns others into [DriveError::Api].
pub(super) async fn check(response: reqwest::Response) -> Result<reqwest::Response, DriveError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let (reason, message) = match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(ErrorResponse { error }) => (
            error.errors.into_iter().find_map(|detail| detail.reason),
            error.message,
        ),
        Err(_) => (None, body),
    };

    Err(DriveError::Api {
        status,
        reason,
        message,
    })
}
