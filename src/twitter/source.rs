// Stream sources - the live filter stream and the seam the driver consumes.
//
// A `StreamSource` turns filter parameters into a `Subscription`: a channel of
// classified messages fed by a background reader task, mirroring how the
// stream body is read off the wire independently of whoever consumes it.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::framing::LineDecoder;
use super::models::StreamMessage;
use super::oauth::{self, Credentials};

/// Default streaming API endpoint.
pub const DEFAULT_STREAM_API_URL: &str = "https://stream.twitter.com";

/// Path of the v1.1 filter endpoint, relative to the stream API base URL.
pub const FILTER_PATH: &str = "/1.1/statuses/filter.json";

/// Messages buffered between the body reader and the driver.
const CHANNEL_CAPACITY: usize = 1024;

/// Longest silence tolerated on an open stream. The provider sends a
/// keep-alive at least every 30 seconds, so three missed ones mean the
/// connection is dead even if the socket never closes.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(90);

/// What to subscribe to.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterParams {
    /// Normalized track terms (see [`normalize_keywords`]).
    pub track: Vec<String>,
    /// BCP 47 language codes, e.g. "en". Empty means any language.
    pub language: Vec<String>,
    pub stall_warnings: bool,
}

impl FilterParams {
    pub fn new(track: &[String], language: &[String], stall_warnings: bool) -> Self {
        Self {
            track: normalize_keywords(track),
            language: language
                .iter()
                .map(|l| l.trim().to_ascii_lowercase())
                .filter(|l| !l.is_empty())
                .collect(),
            stall_warnings,
        }
    }

    /// Form parameters for the filter request.
    pub fn form_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("track", self.track.join(","))];
        if !self.language.is_empty() {
            params.push(("language", self.language.join(",")));
        }
        if self.stall_warnings {
            params.push(("stall_warnings", "true".to_string()));
        }
        params
    }

    /// Case-insensitive local match, the way the provider applies `track`.
    /// An empty track list matches everything.
    pub fn matches(&self, text: &str) -> bool {
        if self.track.is_empty() {
            return true;
        }
        let haystack = text.to_lowercase();
        self.track.iter().any(|term| haystack.contains(term.as_str()))
    }
}

/// Trim, lowercase and de-duplicate track terms, keeping first-seen order.
///
/// The provider matches track terms case-insensitively, so "#Upright" and
/// "#upright" are the same subscription.
pub fn normalize_keywords(keywords: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for keyword in keywords {
        let term = keyword.trim().to_lowercase();
        if !term.is_empty() && !out.contains(&term) {
            out.push(term);
        }
    }
    out
}

/// A live subscription: classified messages plus the task producing them.
///
/// The channel yields `Err` once if the underlying transport fails, then
/// closes. A clean end of stream just closes the channel.
pub struct Subscription {
    pub messages: mpsc::Receiver<Result<StreamMessage>>,
    cancel: CancellationToken,
    reader: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(
        messages: mpsc::Receiver<Result<StreamMessage>>,
        cancel: CancellationToken,
        reader: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            messages,
            cancel,
            reader,
        }
    }

    /// Build a subscription around a pre-filled channel, with no reader task.
    pub fn from_channel(messages: mpsc::Receiver<Result<StreamMessage>>) -> Self {
        Self::new(messages, CancellationToken::new(), None)
    }

    /// Stop the reader and close the connection. Buffered messages are dropped.
    pub fn stop(mut self) {
        self.cancel.cancel();
        self.messages.close();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Anything that can produce a filtered message stream.
#[async_trait]
pub trait StreamSource: Send + Sync {
    /// Human-readable name for logs.
    fn name(&self) -> &'static str;

    /// Establish a subscription. Returning `Err` means nothing was subscribed.
    async fn subscribe(&self, params: &FilterParams) -> Result<Subscription>;

    /// Whether the driver should reconnect when an established stream ends.
    fn reconnects(&self) -> bool {
        true
    }
}

/// OAuth-signed client for the v1.1 filter stream.
pub struct TwitterStreamClient {
    client: reqwest::Client,
    base_url: String,
    credentials: Credentials,
    stall_timeout: Duration,
}

impl TwitterStreamClient {
    pub fn new(base_url: &str, credentials: Credentials) -> Result<Self> {
        // No overall timeout: the body never ends. Connect timeout only.
        let client = reqwest::Client::builder()
            .user_agent(concat!("tweet-relay/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        })
    }

    /// Treat the stream as failed after `timeout` without any bytes,
    /// keep-alives included.
    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    fn filter_url(&self) -> String {
        format!("{}{}", self.base_url, FILTER_PATH)
    }
}

#[async_trait]
impl StreamSource for TwitterStreamClient {
    fn name(&self) -> &'static str {
        "twitter-filter"
    }

    async fn subscribe(&self, params: &FilterParams) -> Result<Subscription> {
        if params.track.is_empty() {
            anyhow::bail!("At least one track keyword is required for a filter stream");
        }

        let url = self.filter_url();
        let form = params.form_params();
        let signed: Vec<(&str, &str)> = form.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let authorization = oauth::authorization_header(&self.credentials, "POST", &url, &signed)?;

        debug!(url = %url, track = ?params.track, "Opening filter stream");

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, authorization)
            .form(&form)
            .send()
            .await
            .context("Filter stream request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Filter stream returned {status}: {body}");
        }

        info!(track = ?params.track, language = ?params.language, "Filter stream connected");

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let reader = tokio::spawn(read_body(response, tx, cancel.clone(), self.stall_timeout));

        Ok(Subscription::new(rx, cancel, Some(reader)))
    }
}

/// Pump the chunked body into the channel until it ends, fails, stalls or is
/// cancelled.
async fn read_body(
    response: reqwest::Response,
    tx: mpsc::Sender<Result<StreamMessage>>,
    cancel: CancellationToken,
    stall_timeout: Duration,
) {
    let mut body = response.bytes_stream();
    let mut decoder = LineDecoder::new();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return,
            chunk = tokio::time::timeout(stall_timeout, body.next()) => chunk,
        };

        let Ok(chunk) = chunk else {
            warn!(
                stall_secs = stall_timeout.as_secs_f64(),
                "Filter stream went silent"
            );
            let _ = tx
                .send(Err(anyhow::anyhow!(
                    "Filter stream stalled: nothing received for {stall_timeout:?}"
                )))
                .await;
            return;
        };

        match chunk {
            Some(Ok(bytes)) => {
                for line in decoder.push(&bytes) {
                    if tx.send(Ok(StreamMessage::parse(&line))).await.is_err() {
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "Filter stream body read failed");
                let _ = tx
                    .send(Err(anyhow::Error::new(e).context("Filter stream read failed")))
                    .await;
                return;
            }
            None => {
                if let Some(line) = decoder.finish() {
                    let _ = tx.send(Ok(StreamMessage::parse(&line))).await;
                }
                debug!("Filter stream body ended");
                return;
            }
        }
    }
}
