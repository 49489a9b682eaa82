//! Support to download the artifact from an HTTP origin.

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use reqwest::{Client, header};
use url::Url;

use crate::caching::{CacheContents, CacheError};
use crate::utils::futures::{m, measure};
use crate::utils::http::{DownloadTimeouts, create_client};

use super::{Origin, USER_AGENT};

/// An [`Origin`] fetching the artifact with a GET request to a fixed URL.
#[derive(Debug)]
pub struct HttpOrigin {
    client: Client,
    url: Url,
    timeouts: DownloadTimeouts,
}

impl HttpOrigin {
    /// Creates an origin for `url` with its own HTTP client.
    pub fn new(url: Url, timeouts: DownloadTimeouts) -> reqwest::Result<Self> {
        let client = create_client(&timeouts)?;
        Ok(Self::with_client(client, url, timeouts))
    }

    pub fn with_client(client: Client, url: Url, timeouts: DownloadTimeouts) -> Self {
        Self {
            client,
            url,
            timeouts,
        }
    }

    async fn download(&self) -> CacheContents<Bytes> {
        tracing::debug!("Fetching artifact from `{}`", self.url);

        let response = self
            .client
            .get(self.url.clone())
            .header(header::USER_AGENT, USER_AGENT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(%status, "Origin responded with an error status");
            return Err(CacheError::FetchFailed(format!(
                "origin responded with {status}"
            )));
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(CacheError::FetchFailed(
                "origin responded with an empty body".into(),
            ));
        }

        Ok(bytes)
    }

    async fn fetch_with_timeout(&self) -> CacheContents<Bytes> {
        let max_download = self.timeouts.max_download;
        let result = match tokio::time::timeout(max_download, self.download()).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::timeout(max_download)),
        };

        match result {
            Ok(ref bytes) => {
                metric!(time_raw("origin.fetch.size") = bytes.len() as u64);
            }
            Err(ref err) => {
                tracing::warn!(url = %self.url, error = %err, "Failed to fetch artifact");
            }
        }
        metric!(
            counter("origin.fetch") += 1,
            "status" => m::result(&result),
        );

        result
    }
}

impl Origin for HttpOrigin {
    fn fetch(&self) -> BoxFuture<'_, CacheContents<Bytes>> {
        measure("origin.fetch", m::result, self.fetch_with_timeout()).boxed()
    }
}
