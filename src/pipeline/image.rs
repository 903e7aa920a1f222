// Avatar image fetching - the one network call made while building a report.
//
// An avatar is nice to have, never required: every failure collapses to an
// empty payload and the report is still delivered. The fetch is bounded by a
// request timeout so slow image hosts can't pile up delivery tasks.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use reqwest::redirect::Policy;
use tracing::{debug, warn};

/// Default upper bound on a single avatar fetch.
pub const DEFAULT_IMAGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Source of avatar payloads for reports.
#[async_trait]
pub trait AvatarFetcher: Send + Sync {
    /// Fetch `url` and return the body as unpadded base64, or "" on any failure.
    async fn fetch_base64(&self, url: &str) -> String;
}

/// Fetcher that never touches the network. Used when images are disabled.
pub struct NoopAvatarFetcher;

#[async_trait]
impl AvatarFetcher for NoopAvatarFetcher {
    async fn fetch_base64(&self, _url: &str) -> String {
        String::new()
    }
}

/// reqwest-backed avatar fetcher. Cheap to share: the client pools connections.
pub struct HttpAvatarFetcher {
    client: reqwest::Client,
}

impl HttpAvatarFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tweet-relay/", env!("CARGO_PKG_VERSION")))
            .redirect(Policy::limited(10))
            .timeout(timeout)
            .build()
            .context("Failed to build image HTTP client")?;
        Ok(Self { client })
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Avatar request failed: {url}"))?;

        if !response.status().is_success() {
            anyhow::bail!("Avatar host returned {} for {url}", response.status());
        }

        let body = response
            .bytes()
            .await
            .with_context(|| format!("Failed to read avatar body: {url}"))?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl AvatarFetcher for HttpAvatarFetcher {
    async fn fetch_base64(&self, url: &str) -> String {
        if url.is_empty() {
            return String::new();
        }
        match self.fetch_bytes(url).await {
            Ok(bytes) => {
                debug!(url, bytes = bytes.len(), "Fetched avatar");
                encode_image(&bytes)
            }
            Err(e) => {
                warn!(url, error = %e, "Avatar fetch failed, sending report without image");
                String::new()
            }
        }
    }
}

/// Standard alphabet, no padding.
pub fn encode_image(bytes: &[u8]) -> String {
    STANDARD_NO_PAD.encode(bytes)
}
