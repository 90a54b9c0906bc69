//! Error types for provider resolution and retrieval.

use std::path::Path;

use reqwest::StatusCode;
use thiserror::Error;
use url::Url;

/// Errors produced by providers while resolving or retrieving files.
///
/// Variants carry rendered messages rather than source errors so that a
/// terminal errored file (and the events describing it) stays cheaply
/// cloneable.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// The HTTP transport failed (connect, TLS, read, ...).
    #[error("transport error for {url}: {message}")]
    Transport {
        /// The URL the request targeted.
        url: String,
        /// Rendered transport error.
        message: String,
    },

    /// The remote answered with an unusable status code.
    #[error("unexpected status {status} for {url}")]
    Status {
        /// The URL the request targeted.
        url: String,
        /// Numeric HTTP status.
        status: u16,
    },

    /// The provider could not resolve the URL into a file.
    #[error("resolution failed for {url}: {reason}")]
    Resolution {
        /// The URL that failed to resolve.
        url: String,
        /// Why resolution failed.
        reason: String,
    },

    /// Writing the retrieved bytes to disk failed.
    #[error("writing {path}: {message}")]
    Io {
        /// Destination path.
        path: String,
        /// Rendered IO error.
        message: String,
    },

    /// The retrieved bytes do not match the advertised checksum.
    #[error("checksum mismatch for {name}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Display name of the file.
        name: String,
        /// Expected hex digest.
        expected: String,
        /// Actual hex digest of the retrieved bytes.
        actual: String,
    },
}

impl ProviderError {
    /// Creates a transport error from a failed reqwest call.
    #[must_use]
    pub fn transport(url: &Url, error: &reqwest::Error) -> Self {
        Self::Transport {
            url: url.to_string(),
            message: error.to_string(),
        }
    }

    /// Creates a status error for a non-success HTTP response.
    #[must_use]
    pub fn status(url: &Url, status: StatusCode) -> Self {
        Self::Status {
            url: url.to_string(),
            status: status.as_u16(),
        }
    }

    /// Creates a resolution failure with a human-readable reason.
    #[must_use]
    pub fn resolution(url: &Url, reason: impl Into<String>) -> Self {
        Self::Resolution {
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    /// Creates an IO error for a destination path.
    #[must_use]
    pub fn io(path: &Path, error: &std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            message: error.to_string(),
        }
    }

    /// Creates a checksum mismatch error.
    #[must_use]
    pub fn checksum_mismatch(
        name: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::ChecksumMismatch {
            name: name.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}
