//! Fetching the artifact from its origin.

use std::fmt;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::caching::CacheContents;

mod http;

pub use self::http::HttpOrigin;

/// A browser-like user agent, as some image hosts reject requests without one.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// The source the cached artifact is fetched from.
///
/// A fetch is a single attempt: implementations do not retry, and report every failure as
/// [`CacheError::FetchFailed`](crate::caching::CacheError::FetchFailed). An empty body counts
/// as a failure.
pub trait Origin: fmt::Debug + Send + Sync + 'static {
    /// Fetches the complete artifact.
    fn fetch(&self) -> BoxFuture<'_, CacheContents<Bytes>>;
}
