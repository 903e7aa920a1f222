// JSONL replay source - feeds a captured stream back through the pipeline.
//
// Each line of the file is one raw stream message, exactly as the filter
// endpoint delivers it. Posts are filtered locally with the same
// case-insensitive track match the provider applies, so a broad capture can
// be replayed against a narrower keyword set.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::models::StreamMessage;
use super::source::{FilterParams, StreamSource, Subscription};
use crate::pipeline::extract::resolve_display_text;

pub struct JsonlReplaySource {
    path: PathBuf,
}

impl JsonlReplaySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl StreamSource for JsonlReplaySource {
    fn name(&self) -> &'static str {
        "jsonl-replay"
    }

    async fn subscribe(&self, params: &FilterParams) -> Result<Subscription> {
        let file = tokio::fs::File::open(&self.path)
            .await
            .with_context(|| format!("Failed to open replay file {}", self.path.display()))?;

        info!(path = %self.path.display(), "Replaying captured stream");

        let (tx, rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let params = params.clone();

        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(file).lines();
            let mut skipped = 0usize;
            loop {
                let line = tokio::select! {
                    _ = token.cancelled() => return,
                    line = lines.next_line() => line,
                };
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx
                            .send(Err(anyhow::Error::new(e).context("Failed to read replay file")))
                            .await;
                        return;
                    }
                };
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let message = StreamMessage::parse(trimmed);
                if let StreamMessage::Post(post) = &message {
                    if !params.matches(&post.text) && !params.matches(&resolve_display_text(post))
                    {
                        skipped += 1;
                        continue;
                    }
                }
                if tx.send(Ok(message)).await.is_err() {
                    return;
                }
            }
            debug!(skipped, "Replay file exhausted");
        });

        Ok(Subscription::new(rx, cancel, Some(reader)))
    }

    fn reconnects(&self) -> bool {
        false
    }
}
