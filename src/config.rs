use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::pipeline::sink::DEFAULT_REPORT_API_URL;
use crate::twitter::oauth::Credentials;
use crate::twitter::source::{FilterParams, DEFAULT_STALL_TIMEOUT, DEFAULT_STREAM_API_URL};

/// Keywords tracked when RELAY_TRACK is unset.
pub const DEFAULT_TRACK: &str = "#upright4nigeria";

/// Central configuration loaded from environment variables.
///
/// All secrets come from env vars (never hardcoded). The .env file
/// is loaded automatically at startup via dotenvy.
#[derive(Clone)]
pub struct Config {
    /// OAuth 1.0a secrets for the filter stream. Only needed by `run`.
    pub credentials: Credentials,
    /// Raw track keywords; normalized when building [`FilterParams`].
    pub track: Vec<String>,
    pub language: Vec<String>,
    pub stall_warnings: bool,
    pub stream_api_url: String,
    /// Silence on the open stream after which it is dropped and re-established.
    pub stall_timeout: Duration,
    pub report_api_url: String,
    pub liveness_bind: String,
    pub liveness_port: u16,
    /// Upper bound on one avatar fetch.
    pub image_timeout: Duration,
    /// Upper bound on one report POST.
    pub delivery_timeout: Duration,
    /// Concurrent delivery cap; `None` means unbounded.
    pub max_in_flight: Option<usize>,
    /// How long shutdown waits for in-flight deliveries. Zero abandons them.
    pub shutdown_grace: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Everything except the stream credentials has a default. Malformed
    /// numbers or booleans are errors rather than silently defaulted.
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. `load` passes the process env.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let max_in_flight: usize = parse_or(&get, "RELAY_MAX_IN_FLIGHT", 0)?;

        Ok(Self {
            credentials: Credentials {
                consumer_key: get("TWITTER_CONSUMER_KEY").unwrap_or_default(),
                consumer_secret: get("TWITTER_CONSUMER_SECRET").unwrap_or_default(),
                access_token: get("TWITTER_ACCESS_TOKEN").unwrap_or_default(),
                access_secret: get("TWITTER_ACCESS_SECRET").unwrap_or_default(),
            },
            track: split_list(&get("RELAY_TRACK").unwrap_or_else(|| DEFAULT_TRACK.to_string())),
            language: split_list(&get("RELAY_LANGUAGE").unwrap_or_else(|| "en".to_string())),
            stall_warnings: parse_bool(&get, "RELAY_STALL_WARNINGS", true)?,
            stream_api_url: get("STREAM_API_URL")
                .unwrap_or_else(|| DEFAULT_STREAM_API_URL.to_string()),
            stall_timeout: Duration::from_secs(parse_or(
                &get,
                "RELAY_STALL_TIMEOUT_SECS",
                DEFAULT_STALL_TIMEOUT.as_secs(),
            )?),
            report_api_url: get("REPORT_API_URL")
                .unwrap_or_else(|| DEFAULT_REPORT_API_URL.to_string()),
            liveness_bind: get("RELAY_LIVENESS_BIND").unwrap_or_else(|| "0.0.0.0".to_string()),
            liveness_port: parse_or(&get, "RELAY_LIVENESS_PORT", 8080)?,
            image_timeout: Duration::from_secs(parse_or(&get, "RELAY_IMAGE_TIMEOUT_SECS", 10)?),
            delivery_timeout: Duration::from_secs(parse_or(
                &get,
                "RELAY_DELIVERY_TIMEOUT_SECS",
                15,
            )?),
            max_in_flight: (max_in_flight > 0).then_some(max_in_flight),
            shutdown_grace: Duration::from_secs(parse_or(&get, "RELAY_SHUTDOWN_GRACE_SECS", 5)?),
        })
    }

    /// Check that all four stream credentials are configured.
    /// Call this before opening the live filter stream.
    pub fn require_stream_credentials(&self) -> Result<()> {
        if !self.credentials.is_complete() {
            anyhow::bail!(
                "Stream credentials missing. Set TWITTER_CONSUMER_KEY, TWITTER_CONSUMER_SECRET,\n\
                 TWITTER_ACCESS_TOKEN and TWITTER_ACCESS_SECRET in your .env file.\n\
                 See .env.example for the required variables."
            );
        }
        Ok(())
    }

    /// Filter parameters for the stream subscription.
    pub fn filter_params(&self) -> FilterParams {
        FilterParams::new(&self.track, &self.language, self.stall_warnings)
    }

    pub fn liveness_addr(&self) -> String {
        format!("{}:{}", self.liveness_bind, self.liveness_port)
    }
}

// Credentials redact themselves; everything else is safe to print.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("credentials", &self.credentials)
            .field("track", &self.track)
            .field("language", &self.language)
            .field("stall_warnings", &self.stall_warnings)
            .field("stream_api_url", &self.stream_api_url)
            .field("stall_timeout", &self.stall_timeout)
            .field("report_api_url", &self.report_api_url)
            .field("liveness_addr", &self.liveness_addr())
            .field("image_timeout", &self.image_timeout)
            .field("delivery_timeout", &self.delivery_timeout)
            .field("max_in_flight", &self.max_in_flight)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish()
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a number, got {raw:?}")),
        None => Ok(default),
    }
}

fn parse_bool<G>(get: &G, key: &str, default: bool) -> Result<bool>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        None => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => anyhow::bail!("{key} must be true or false, got {other:?}"),
    }
}
