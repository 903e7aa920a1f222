// Stream driver - owns the subscription and demultiplexes it.
//
// States: Connecting -> Streaming -> Stopped. Failing to establish the first
// subscription is the only fatal error in the relay; `connect` surfaces it to
// the caller. Once streaming, posts go to the dispatcher, protocol notices go
// to the log, and a dropped stream is re-established with exponential backoff
// (for sources that support it) until shutdown is requested. The delay only
// resets once a stream has delivered a message, so a server that accepts and
// immediately hangs up is retried at a growing interval.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dispatch::Dispatcher;
use crate::twitter::models::{StatusNotice, StreamMessage};
use crate::twitter::source::{FilterParams, StreamSource, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    Connecting,
    Streaming,
    Stopped,
}

/// Message counts for one driver run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverSummary {
    pub posts: u64,
    pub notices: u64,
    pub other: u64,
    /// Successful re-subscriptions after the initial connect.
    pub reconnects: u64,
}

impl DriverSummary {
    /// Every message demultiplexed so far, whatever its kind.
    pub fn messages(&self) -> u64 {
        self.posts + self.notices + self.other
    }
}

/// Exponential reconnect delay: doubles per failure, capped, and reset once a
/// stream delivers a message.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

enum StreamEnd {
    Shutdown,
    Closed,
    Failed(anyhow::Error),
}

pub struct StreamDriver {
    source: Arc<dyn StreamSource>,
    params: FilterParams,
    dispatcher: Dispatcher,
    state: watch::Sender<DriverState>,
    backoff: Backoff,
}

impl StreamDriver {
    pub fn new(source: Arc<dyn StreamSource>, params: FilterParams, dispatcher: Dispatcher) -> Self {
        let (state, _) = watch::channel(DriverState::Connecting);
        Self {
            source,
            params,
            dispatcher,
            state,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Observe state transitions.
    pub fn state(&self) -> watch::Receiver<DriverState> {
        self.state.subscribe()
    }

    /// Establish the initial subscription. An error here should end the process.
    pub async fn connect(&self) -> Result<Subscription> {
        self.set_state(DriverState::Connecting);
        info!(
            source = self.source.name(),
            track = ?self.params.track,
            language = ?self.params.language,
            "Subscribing to stream"
        );
        self.source
            .subscribe(&self.params)
            .await
            .with_context(|| format!("Failed to subscribe to {}", self.source.name()))
    }

    /// Demultiplex `subscription` until shutdown, reconnecting as needed.
    pub async fn run(
        mut self,
        subscription: Subscription,
        shutdown: CancellationToken,
    ) -> DriverSummary {
        let mut summary = DriverSummary::default();
        let mut current = Some(subscription);

        loop {
            let mut subscription = match current.take() {
                Some(subscription) => subscription,
                None => {
                    self.set_state(DriverState::Connecting);
                    let attempt = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        attempt = self.source.subscribe(&self.params) => attempt,
                    };
                    match attempt {
                        Ok(subscription) => {
                            summary.reconnects += 1;
                            info!(source = self.source.name(), "Stream re-established");
                            subscription
                        }
                        Err(e) => {
                            let delay = self.backoff.next_delay();
                            warn!(
                                error = %e,
                                retry_in_ms = delay.as_millis() as u64,
                                "Reconnect failed"
                            );
                            if !sleep_unless_cancelled(delay, &shutdown).await {
                                break;
                            }
                            continue;
                        }
                    }
                }
            };

            self.set_state(DriverState::Streaming);
            let seen_before = summary.messages();
            let end = self
                .demux(&mut subscription, &shutdown, &mut summary)
                .await;
            subscription.stop();

            // A stream that closes before delivering anything keeps backing off.
            if summary.messages() > seen_before {
                self.backoff.reset();
            }

            match end {
                StreamEnd::Shutdown => break,
                StreamEnd::Closed => info!(source = self.source.name(), "Stream ended"),
                StreamEnd::Failed(e) => {
                    warn!(source = self.source.name(), error = %e, "Stream failed")
                }
            }

            if !self.source.reconnects() {
                break;
            }
            let delay = self.backoff.next_delay();
            info!(retry_in_ms = delay.as_millis() as u64, "Reconnecting");
            if !sleep_unless_cancelled(delay, &shutdown).await {
                break;
            }
        }

        self.set_state(DriverState::Stopped);
        info!(
            posts = summary.posts,
            notices = summary.notices,
            reconnects = summary.reconnects,
            "Stream stopped"
        );
        summary
    }

    async fn demux(
        &self,
        subscription: &mut Subscription,
        shutdown: &CancellationToken,
        summary: &mut DriverSummary,
    ) -> StreamEnd {
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return StreamEnd::Shutdown,
                next = subscription.messages.recv() => next,
            };

            match next {
                None => return StreamEnd::Closed,
                Some(Err(e)) => return StreamEnd::Failed(e),
                Some(Ok(StreamMessage::Post(post))) => {
                    summary.posts += 1;
                    self.dispatcher.on_post_event(*post);
                }
                Some(Ok(StreamMessage::Status(notice))) => {
                    summary.notices += 1;
                    log_notice(&notice);
                }
                Some(Ok(StreamMessage::Other(value))) => {
                    summary.other += 1;
                    debug!(message = %value, "Unhandled stream message");
                }
            }
        }
    }

    fn set_state(&self, state: DriverState) {
        self.state.send_replace(state);
    }
}

fn log_notice(notice: &StatusNotice) {
    match notice {
        StatusNotice::StallWarning {
            code,
            message,
            percent_full,
        } => warn!(code = %code, percent_full = ?percent_full, "Stall warning: {message}"),
        StatusNotice::Limit { track } => {
            info!(undelivered = track, "Stream limit notice")
        }
        StatusNotice::Disconnect {
            code,
            stream_name,
            reason,
        } => warn!(code, stream_name = %stream_name, "Stream disconnect: {reason}"),
        other => debug!(kind = other.kind(), notice = ?other, "Stream notice"),
    }
}

/// Sleep for `delay`; `false` if shutdown was requested first.
async fn sleep_unless_cancelled(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
