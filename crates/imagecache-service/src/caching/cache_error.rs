use std::error::Error;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// An error that happens while refilling the cached artifact.
///
/// The error is handed out to every caller that waited on the same refill, which is why it
/// is [`Clone`] and only carries a rendered message of the underlying cause.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The artifact could not be fetched from the origin.
    ///
    /// This covers connection failures, DNS resolution, timeouts, non-success responses and
    /// empty response bodies alike.
    #[error("failed to fetch artifact: {0}")]
    FetchFailed(String),
    /// The fetched artifact could not be written and published to the image directory.
    #[error("failed to store artifact: {0}")]
    StoreFailed(String),
}

impl CacheError {
    /// Creates a [`FetchFailed`](Self::FetchFailed) error from the innermost cause of `error`.
    pub(crate) fn fetch_failed(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        // Special-case a few error strings
        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        if error_string.contains("SSL routines") {
            error_string = "SSL error".to_string();
        }

        Self::FetchFailed(error_string)
    }

    /// The origin did not answer within the configured download timeout.
    pub(crate) fn timeout(duration: Duration) -> Self {
        Self::FetchFailed(format!(
            "download timed out after {}",
            humantime::format_duration(duration)
        ))
    }

    /// Creates a [`StoreFailed`](Self::StoreFailed) error from an I/O error.
    pub(crate) fn store_failed(error: io::Error) -> Self {
        let dynerr: &dyn Error = &error; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr, "Failed to store artifact");
        Self::StoreFailed(error.to_string())
    }

    /// A short tag used for metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::FetchFailed(_) => "fetchfailed",
            Self::StoreFailed(_) => "storefailed",
        }
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(error: reqwest::Error) -> Self {
        Self::fetch_failed(&error)
    }
}

/// The outcome of a cache operation: either `T` or the [`CacheError`] that prevented it.
pub type CacheContents<T = ()> = Result<T, CacheError>;
