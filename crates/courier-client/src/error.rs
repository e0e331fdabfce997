// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Courier Developers. All Rights Reserved.

use crate::upload::{UploadId, UploadStatus};

/// Error type for every operation of the outbound traffic pipeline.
///
/// The first group of variants is the failure taxonomy callers are expected to
/// match on: transport failures, timeouts, HTTP status failures, caller
/// cancellation, undecodable payloads and per-file upload failures. The
/// remaining variants wrap library errors or report misuse of the API.
#[derive(Debug)]
pub enum Error {
    /// Transport-level failure (DNS, refused or reset connection). Retryable.
    Network(String),
    /// The exchange exceeded its deadline. Retryable.
    Timeout,
    /// The server answered with a non-2xx status.
    HttpStatus(u16),
    /// The operation was aborted by the caller.
    Canceled,
    /// The response payload could not be decoded.
    Validation(String),
    /// A file transfer failed. Recorded on the failed
    /// [`UploadTask`](crate::UploadTask), which can be retried.
    Upload(String),
    /// An I/O error occurred during file operations.
    IoError(std::io::Error),
    /// Configuration parsing or loading error.
    ConfigError(config::ConfigError),
    /// JSON serialization error while building a request body.
    JsonError(serde_json::Error),
    /// URL parsing or joining error.
    UrlParseError(url::ParseError),
    /// No upload task with this id is tracked by the coordinator.
    UnknownUpload(UploadId),
    /// The upload task is not in a state that allows the requested operation.
    InvalidUploadState {
        /// Upload task id.
        id: UploadId,
        /// Status the task was in when the operation was attempted.
        status: UploadStatus,
    },
    /// The request was removed from the offline queue before it was replayed.
    QueueCleared,
    /// Invalid parameters provided to an operation.
    InvalidParameters(String),
}

impl Error {
    /// Returns true for 4xx responses.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::HttpStatus(status) if (400..500).contains(status))
    }

    /// Returns true for 5xx responses.
    pub fn is_server_error(&self) -> bool {
        matches!(self, Error::HttpStatus(status) if *status >= 500)
    }

    /// Returns true for failures caused by the network rather than the server:
    /// connection errors and timeouts.
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err)
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::ConfigError(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::JsonError(err)
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::UrlParseError(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout
        } else if let Some(status) = err.status() {
            Error::HttpStatus(status.as_u16())
        } else if err.is_decode() {
            Error::Validation(err.to_string())
        } else {
            Error::Network(err.to_string())
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Network(e) => write!(f, "Network error: {}", e),
            Error::Timeout => write!(f, "Request timed out"),
            Error::HttpStatus(status) => write!(f, "HTTP error: status {}", status),
            Error::Canceled => write!(f, "Operation canceled"),
            Error::Validation(e) => write!(f, "Invalid response payload: {}", e),
            Error::Upload(e) => write!(f, "Upload failed: {}", e),
            Error::IoError(e) => write!(f, "I/O error: {}", e),
            Error::ConfigError(e) => write!(f, "Configuration error: {}", e),
            Error::JsonError(e) => write!(f, "JSON error: {}", e),
            Error::UrlParseError(e) => write!(f, "URL parse error: {}", e),
            Error::UnknownUpload(id) => write!(f, "Unknown upload: {}", id),
            Error::InvalidUploadState { id, status } => {
                write!(f, "Operation not allowed on upload {} while {}", id, status)
            }
            Error::QueueCleared => write!(f, "Queued request was cleared before replay"),
            Error::InvalidParameters(s) => write!(f, "Invalid parameters: {}", s),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(e) => Some(e),
            Error::ConfigError(e) => Some(e),
            Error::JsonError(e) => Some(e),
            Error::UrlParseError(e) => Some(e),
            _ => None,
        }
    }
}
