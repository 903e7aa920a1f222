use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tweet_relay::config::Config;
use tweet_relay::liveness::{self, LivenessState};
use tweet_relay::pipeline::dispatch::Dispatcher;
use tweet_relay::pipeline::driver::StreamDriver;
use tweet_relay::pipeline::image::{AvatarFetcher, HttpAvatarFetcher, NoopAvatarFetcher};
use tweet_relay::pipeline::report::build_report;
use tweet_relay::pipeline::sink::{LogSink, ReportApiClient, ReportSink};
use tweet_relay::twitter::models::StreamMessage;
use tweet_relay::twitter::replay::JsonlReplaySource;
use tweet_relay::twitter::source::{StreamSource, TwitterStreamClient};

/// Tweet Relay: forward a filtered Twitter stream to a reporting API.
///
/// Every post matching the tracked keywords becomes one normalized report,
/// delivered best-effort with no retries.
#[derive(Parser)]
#[command(name = "tweet-relay", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe to the live filter stream and relay posts until stopped
    Run,

    /// Feed a captured JSONL stream through the relay
    Replay {
        /// File with one raw stream message per line
        file: PathBuf,

        /// Log reports instead of POSTing them
        #[arg(long)]
        dry_run: bool,

        /// Seconds to wait for deliveries after the file is exhausted (default: 60)
        #[arg(long, default_value = "60")]
        drain_secs: u64,
    },

    /// Print the report each captured post would produce
    Preview {
        /// File with one raw stream message per line
        file: PathBuf,

        /// Skip avatar downloads (image stays empty)
        #[arg(long)]
        no_images: bool,

        /// Stop after this many posts
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if missing)
    let _ = dotenvy::dotenv();

    // Set up structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tweet_relay=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    let result = match cli.command {
        Commands::Run => {
            config.require_stream_credentials()?;
            let source = TwitterStreamClient::new(&config.stream_api_url, config.credentials.clone())?
                .with_stall_timeout(config.stall_timeout);
            let sink = ReportApiClient::new(&config.report_api_url, config.delivery_timeout)?;
            info!(endpoint = sink.endpoint(), "Delivering reports");
            relay(
                &config,
                Arc::new(source),
                Arc::new(sink),
                true,
                config.shutdown_grace,
            )
            .await
        }

        Commands::Replay {
            file,
            dry_run,
            drain_secs,
        } => {
            let source = JsonlReplaySource::new(file);
            let sink: Arc<dyn ReportSink> = if dry_run {
                Arc::new(LogSink)
            } else {
                Arc::new(ReportApiClient::new(
                    &config.report_api_url,
                    config.delivery_timeout,
                )?)
            };
            relay(
                &config,
                Arc::new(source),
                sink,
                false,
                Duration::from_secs(drain_secs),
            )
            .await
        }

        Commands::Preview {
            file,
            no_images,
            limit,
        } => preview(&config, file, no_images, limit).await,
    };

    if let Err(ref e) = result {
        error!("Relay exited with an error: {e:#}");
    }
    result
}

/// Wire source -> driver -> dispatcher -> sink and run until the stream
/// stops or a shutdown signal arrives.
async fn relay(
    config: &Config,
    source: Arc<dyn StreamSource>,
    sink: Arc<dyn ReportSink>,
    serve_liveness: bool,
    grace: Duration,
) -> Result<()> {
    let fetcher = Arc::new(HttpAvatarFetcher::new(config.image_timeout)?);
    let dispatcher = Dispatcher::new(fetcher, sink, config.max_in_flight);
    let driver = StreamDriver::new(source, config.filter_params(), dispatcher.clone());
    let shutdown = CancellationToken::new();

    let liveness_task = if serve_liveness {
        let listener = liveness::bind(&config.liveness_addr()).await?;
        let state = LivenessState {
            dispatcher: dispatcher.clone(),
            driver_state: driver.state(),
        };
        Some(tokio::spawn(liveness::serve(listener, state, shutdown.clone())))
    } else {
        None
    };

    // The one fatal pipeline error: no initial subscription, nothing to relay.
    let subscription = match driver.connect().await {
        Ok(subscription) => subscription,
        Err(e) => {
            shutdown.cancel();
            return Err(e);
        }
    };

    let mut demux = tokio::spawn(driver.run(subscription, shutdown.clone()));
    info!("Processing stream");

    let finished = tokio::select! {
        signal = wait_for_shutdown_signal() => {
            info!(signal, "Shutdown signal received, stopping stream");
            None
        }
        finished = &mut demux => Some(finished),
    };

    shutdown.cancel();
    let summary = match finished {
        Some(finished) => finished,
        None => demux.await,
    }
    .context("Stream driver task failed")?;

    if let Some(task) = liveness_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Liveness server stopped with an error"),
            Err(e) => warn!(error = %e, "Liveness server task failed"),
        }
    }

    let drained = dispatcher.shutdown(grace).await;
    let stats = dispatcher.stats();
    info!(
        posts = summary.posts,
        delivered = stats.delivered,
        failed = stats.failed,
        drained,
        "Relay stopped"
    );
    Ok(())
}

/// Build and print reports for a capture without delivering anything.
async fn preview(
    config: &Config,
    file: PathBuf,
    no_images: bool,
    limit: Option<usize>,
) -> Result<()> {
    let fetcher: Box<dyn AvatarFetcher> = if no_images {
        Box::new(NoopAvatarFetcher)
    } else {
        Box::new(HttpAvatarFetcher::new(config.image_timeout)?)
    };

    let handle = tokio::fs::File::open(&file)
        .await
        .with_context(|| format!("Failed to open {}", file.display()))?;
    let mut lines = tokio::io::BufReader::new(handle).lines();

    let mut posts = 0usize;
    let mut skipped = 0usize;
    while let Some(line) = lines.next_line().await.context("Failed to read capture")? {
        if line.trim().is_empty() {
            continue;
        }
        let StreamMessage::Post(post) = StreamMessage::parse(line.trim()) else {
            skipped += 1;
            continue;
        };

        posts += 1;
        let report = build_report(&post, fetcher.as_ref()).await;
        let label = if post.is_retweet() { "Retweet" } else { "Post" };
        println!(
            "{} {} by @{} ({})",
            format!("#{posts}").dimmed(),
            label.bold(),
            report.author,
            report.time
        );
        println!("{}", serde_json::to_string_pretty(&report)?);

        if limit.is_some_and(|max| posts >= max) {
            break;
        }
    }

    println!(
        "\n{} {posts} posts, {skipped} other messages",
        "Preview complete.".bold()
    );
    Ok(())
}

/// Resolve on SIGINT or SIGTERM, naming the signal.
async fn wait_for_shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
            },
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, listening for Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "Ctrl-C"
    }
}
