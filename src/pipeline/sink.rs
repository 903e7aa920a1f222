// Report sinks - where finished reports go.
//
// The production sink POSTs to the reporting API. The log sink prints the
// JSON instead, for dry runs against captured streams.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use super::report::NormalizedReport;

/// Default reporting API base URL.
pub const DEFAULT_REPORT_API_URL: &str = "http://www.uprightapi.cloud";

/// Path reports are POSTed to, relative to the API base URL.
pub const CREATE_POST_PATH: &str = "/post/createpost";

/// Default upper bound on a single delivery.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(15);

/// Anything that can accept a report. One call per report, no retries.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn send(&self, report: &NormalizedReport) -> Result<()>;
}

/// HTTP client for the reporting API.
pub struct ReportApiClient {
    client: reqwest::Client,
    endpoint: String,
}

impl ReportApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tweet-relay/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("Failed to build report HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), CREATE_POST_PATH),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ReportSink for ReportApiClient {
    async fn send(&self, report: &NormalizedReport) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(report)
            .send()
            .await
            .context("Report API request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Report API returned {status}: {body}");
        }

        Ok(())
    }
}

/// Dry-run sink: logs each report as JSON and reports success.
pub struct LogSink;

#[async_trait]
impl ReportSink for LogSink {
    async fn send(&self, report: &NormalizedReport) -> Result<()> {
        let json = serde_json::to_string(report).context("Failed to serialize report")?;
        info!(author = %report.author, report = %json, "Dry run: report not sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_path() {
        let client = ReportApiClient::new("http://api.example/", DEFAULT_DELIVERY_TIMEOUT).unwrap();
        assert_eq!(client.endpoint(), "http://api.example/post/createpost");
    }
}
