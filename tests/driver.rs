// Stream driver tests - scripted sources standing in for the filter stream.
//
// Each scripted subscribe call either fails, yields a finite batch of
// messages and closes, or yields a batch and stays open until shutdown.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tweet_relay::pipeline::dispatch::Dispatcher;
use tweet_relay::pipeline::driver::{Backoff, DriverState, StreamDriver};
use tweet_relay::pipeline::image::NoopAvatarFetcher;
use tweet_relay::pipeline::report::NormalizedReport;
use tweet_relay::pipeline::sink::ReportSink;
use tweet_relay::twitter::models::StreamMessage;
use tweet_relay::twitter::oauth::Credentials;
use tweet_relay::twitter::replay::JsonlReplaySource;
use tweet_relay::twitter::source::{FilterParams, StreamSource, Subscription, TwitterStreamClient};

enum Step {
    Fail,
    /// Deliver these, then close the stream.
    Closed(Vec<Result<StreamMessage>>),
    /// Deliver these and keep the stream open.
    Open(Vec<Result<StreamMessage>>),
}

struct ScriptedSource {
    steps: Mutex<VecDeque<Step>>,
    open: Mutex<Vec<mpsc::Sender<Result<StreamMessage>>>>,
    calls: AtomicUsize,
    call_times: Mutex<Vec<Instant>>,
    reconnects: bool,
}

impl ScriptedSource {
    fn new(steps: Vec<Step>, reconnects: bool) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            open: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            call_times: Mutex::new(Vec::new()),
            reconnects,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Time between consecutive subscribe calls.
    fn gaps(&self) -> Vec<Duration> {
        let times = self.call_times.lock().unwrap();
        times.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

#[async_trait]
impl StreamSource for ScriptedSource {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn subscribe(&self, _params: &FilterParams) -> Result<Subscription> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_times.lock().unwrap().push(Instant::now());
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::Open(Vec::new()));

        let (messages, keep_open) = match step {
            Step::Fail => return Err(anyhow!("connection refused")),
            Step::Closed(messages) => (messages, false),
            Step::Open(messages) => (messages, true),
        };

        let (tx, rx) = mpsc::channel(messages.len() + 1);
        for message in messages {
            tx.try_send(message).unwrap();
        }
        if keep_open {
            self.open.lock().unwrap().push(tx);
        }
        Ok(Subscription::from_channel(rx))
    }

    fn reconnects(&self) -> bool {
        self.reconnects
    }
}

#[derive(Default)]
struct CollectSink {
    reports: Mutex<Vec<NormalizedReport>>,
}

#[async_trait]
impl ReportSink for CollectSink {
    async fn send(&self, report: &NormalizedReport) -> Result<()> {
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }
}

fn post(id: &str, text: &str) -> Result<StreamMessage> {
    Ok(StreamMessage::parse(&format!(
        r#"{{"id_str": "{id}", "text": "{text}", "user": {{"screen_name": "u{id}"}}}}"#
    )))
}

fn limit_notice() -> Result<StreamMessage> {
    Ok(StreamMessage::parse(r#"{"limit": {"track": 12}}"#))
}

fn params() -> FilterParams {
    FilterParams::new(&["#upright4nigeria".to_string()], &["en".to_string()], true)
}

fn fast_backoff() -> Backoff {
    Backoff::new(Duration::from_millis(10), Duration::from_millis(40))
}

fn setup(source: Arc<ScriptedSource>) -> (StreamDriver, Dispatcher, Arc<CollectSink>) {
    let sink = Arc::new(CollectSink::default());
    let dispatcher = Dispatcher::new(Arc::new(NoopAvatarFetcher), sink.clone(), None);
    let driver =
        StreamDriver::new(source, params(), dispatcher.clone()).with_backoff(fast_backoff());
    (driver, dispatcher, sink)
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn initial_subscribe_failure_is_fatal() {
    let source = ScriptedSource::new(vec![Step::Fail], true);
    let (driver, _dispatcher, _sink) = setup(source.clone());

    let err = driver.connect().await.err().expect("connect should fail");
    assert!(format!("{err:#}").contains("Failed to subscribe to scripted"));
    assert!(format!("{err:#}").contains("connection refused"));
    assert_eq!(source.calls(), 1);
}

#[tokio::test]
async fn posts_are_dispatched_and_notices_are_not() {
    let source = ScriptedSource::new(
        vec![Step::Closed(vec![
            post("1", "first #upright4nigeria"),
            limit_notice(),
            Ok(StreamMessage::parse(r#"{"friends": [1]}"#)),
            post("2", "second #upright4nigeria"),
        ])],
        false,
    );
    let (driver, dispatcher, sink) = setup(source);

    let subscription = driver.connect().await.unwrap();
    let summary = driver.run(subscription, CancellationToken::new()).await;

    assert_eq!(summary.posts, 2);
    assert_eq!(summary.notices, 1);
    assert_eq!(summary.other, 1);
    assert_eq!(summary.reconnects, 0);

    assert!(dispatcher.shutdown(Duration::from_secs(5)).await);
    let mut authors: Vec<String> = sink
        .reports
        .lock()
        .unwrap()
        .iter()
        .map(|r| r.author.clone())
        .collect();
    authors.sort();
    assert_eq!(authors, vec!["u1", "u2"]);
}

#[tokio::test]
async fn shutdown_stops_an_open_stream() {
    let source = ScriptedSource::new(vec![Step::Open(vec![post("1", "hi")])], true);
    let (driver, dispatcher, _sink) = setup(source.clone());
    let mut state = driver.state();

    let shutdown = CancellationToken::new();
    let subscription = driver.connect().await.unwrap();
    let task = tokio::spawn(driver.run(subscription, shutdown.clone()));

    state
        .wait_for(|s| *s == DriverState::Streaming)
        .await
        .unwrap();
    eventually(|| dispatcher.stats().received == 1).await;

    shutdown.cancel();
    let summary = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("driver did not stop")
        .unwrap();

    assert_eq!(summary.posts, 1);
    assert_eq!(*state.borrow(), DriverState::Stopped);
    assert_eq!(source.calls(), 1);
}

#[tokio::test]
async fn reconnects_after_stream_end_with_backoff() {
    let source = ScriptedSource::new(
        vec![
            Step::Closed(vec![post("1", "before")]),
            Step::Fail,
            Step::Closed(vec![post("2", "after")]),
            Step::Open(vec![]),
        ],
        true,
    );
    let (driver, dispatcher, _sink) = setup(source.clone());

    let shutdown = CancellationToken::new();
    let subscription = driver.connect().await.unwrap();
    let task = tokio::spawn(driver.run(subscription, shutdown.clone()));

    eventually(|| source.calls() == 4).await;
    shutdown.cancel();
    let summary = task.await.unwrap();

    assert_eq!(summary.posts, 2);
    // The failed attempt is not a reconnect; the two later successes are.
    assert_eq!(summary.reconnects, 2);
    assert_eq!(dispatcher.stats().received, 2);
}

#[tokio::test]
async fn transport_error_triggers_reconnect() {
    let source = ScriptedSource::new(
        vec![
            Step::Closed(vec![Err(anyhow!("connection reset"))]),
            Step::Open(vec![post("1", "back")]),
        ],
        true,
    );
    let (driver, dispatcher, _sink) = setup(source.clone());

    let shutdown = CancellationToken::new();
    let subscription = driver.connect().await.unwrap();
    let task = tokio::spawn(driver.run(subscription, shutdown.clone()));

    eventually(|| dispatcher.stats().received == 1).await;
    shutdown.cancel();
    let summary = task.await.unwrap();

    assert_eq!(summary.reconnects, 1);
    assert_eq!(source.calls(), 2);
}

#[tokio::test]
async fn non_reconnecting_source_stops_at_end() {
    let source = ScriptedSource::new(vec![Step::Closed(vec![post("1", "only")])], false);
    let (driver, _dispatcher, _sink) = setup(source.clone());
    let state = driver.state();

    let subscription = driver.connect().await.unwrap();
    let summary = tokio::time::timeout(
        Duration::from_secs(5),
        driver.run(subscription, CancellationToken::new()),
    )
    .await
    .expect("driver should stop on its own");

    assert_eq!(summary.posts, 1);
    assert_eq!(source.calls(), 1);
    assert_eq!(*state.borrow(), DriverState::Stopped);
}

#[tokio::test]
async fn shutdown_during_reconnect_backoff() {
    let source = ScriptedSource::new(vec![Step::Closed(vec![]), Step::Fail], true);
    let sink = Arc::new(CollectSink::default());
    let dispatcher = Dispatcher::new(Arc::new(NoopAvatarFetcher), sink, None);
    let driver = StreamDriver::new(source.clone(), params(), dispatcher).with_backoff(
        Backoff::new(Duration::from_secs(30), Duration::from_secs(60)),
    );

    let shutdown = CancellationToken::new();
    let subscription = driver.connect().await.unwrap();
    let task = tokio::spawn(driver.run(subscription, shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.cancel();
    let summary = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("backoff sleep should be cancellable")
        .unwrap();
    assert_eq!(summary.posts, 0);
    assert_eq!(source.calls(), 1);
}

#[tokio::test]
async fn empty_streams_keep_backing_off() {
    let source = ScriptedSource::new(
        vec![
            Step::Closed(vec![]),
            Step::Closed(vec![]),
            Step::Closed(vec![]),
            Step::Closed(vec![]),
        ],
        true,
    );
    let sink = Arc::new(CollectSink::default());
    let dispatcher = Dispatcher::new(Arc::new(NoopAvatarFetcher), sink, None);
    let driver = StreamDriver::new(source.clone(), params(), dispatcher).with_backoff(
        Backoff::new(Duration::from_millis(20), Duration::from_secs(1)),
    );

    let shutdown = CancellationToken::new();
    let subscription = driver.connect().await.unwrap();
    let task = tokio::spawn(driver.run(subscription, shutdown.clone()));

    // connect + three empty reconnects + the open fallback stream
    eventually(|| source.calls() == 5).await;
    shutdown.cancel();
    task.await.unwrap();

    // Accepted-then-closed subscriptions don't reset the delay: 20, 40, 80 ms.
    let gaps = source.gaps();
    assert!(gaps[1] >= Duration::from_millis(40), "gaps: {gaps:?}");
    assert!(gaps[2] >= Duration::from_millis(80), "gaps: {gaps:?}");
    assert!(gaps[3] >= Duration::from_millis(160), "gaps: {gaps:?}");
}

#[tokio::test]
async fn delivered_message_resets_backoff() {
    let source = ScriptedSource::new(
        vec![
            Step::Closed(vec![]),
            Step::Closed(vec![]),
            Step::Closed(vec![post("1", "alive")]),
            Step::Open(vec![]),
        ],
        true,
    );
    let sink = Arc::new(CollectSink::default());
    let dispatcher = Dispatcher::new(Arc::new(NoopAvatarFetcher), sink, None);
    let driver = StreamDriver::new(source.clone(), params(), dispatcher).with_backoff(
        Backoff::new(Duration::from_millis(30), Duration::from_secs(10)),
    );

    let shutdown = CancellationToken::new();
    let subscription = driver.connect().await.unwrap();
    let task = tokio::spawn(driver.run(subscription, shutdown.clone()));

    eventually(|| source.calls() == 4).await;
    shutdown.cancel();
    task.await.unwrap();

    // 30 ms, 60 ms, then back to 30 ms (not 120 ms) after the post came through.
    let gaps = source.gaps();
    assert!(gaps[1] >= Duration::from_millis(60), "gaps: {gaps:?}");
    assert!(gaps[2] >= Duration::from_millis(30), "gaps: {gaps:?}");
    assert!(gaps[2] < Duration::from_millis(120), "gaps: {gaps:?}");
}

/// Filter-stream stand-in: every connection gets one chunked post line and
/// then silence on an open socket. Returns the base URL and an accept count.
async fn silent_stream_server() -> (String, Arc<AtomicUsize>) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::spawn(async move {
                let mut request = [0u8; 4096];
                let _ = socket.read(&mut request).await;
                let line = format!(
                    r#"{{"id_str": "{n}", "text": "quiet #upright4nigeria", "user": {{"screen_name": "u{n}"}}}}"#
                );
                let chunk = format!("{line}\r\n");
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\n\
                     transfer-encoding: chunked\r\n\r\n{:x}\r\n{chunk}\r\n",
                    chunk.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                tokio::time::sleep(Duration::from_secs(60)).await;
            });
        }
    });
    (format!("http://{addr}"), accepted)
}

#[tokio::test]
async fn stalled_live_stream_is_resubscribed() {
    let (url, accepted) = silent_stream_server().await;
    let source = TwitterStreamClient::new(&url, Credentials::default())
        .unwrap()
        .with_stall_timeout(Duration::from_millis(150));
    let sink = Arc::new(CollectSink::default());
    let dispatcher = Dispatcher::new(Arc::new(NoopAvatarFetcher), sink, None);
    let driver = StreamDriver::new(Arc::new(source), params(), dispatcher.clone())
        .with_backoff(fast_backoff());

    let shutdown = CancellationToken::new();
    let subscription = driver.connect().await.unwrap();
    let task = tokio::spawn(driver.run(subscription, shutdown.clone()));

    eventually(|| accepted.load(Ordering::SeqCst) >= 2 && dispatcher.stats().received >= 2).await;
    shutdown.cancel();
    let summary = task.await.unwrap();

    assert!(summary.reconnects >= 1);
    assert!(summary.posts >= 2);
}

// ============================================================
// JSONL replay
// ============================================================

fn write_capture(name: &str, contents: &str) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!(
        "tweet-relay-{}-{name}.jsonl",
        std::process::id()
    ));
    std::fs::write(&path, contents).unwrap();
    path
}

const CAPTURE: &str = r#"{"id_str": "1", "text": "Roads flooded #Upright4Nigeria", "user": {"screen_name": "a"}}

{"id_str": "2", "text": "nothing to see here", "user": {"screen_name": "b"}}
{"limit": {"track": 3}}
not json at all
{"id_str": "3", "text": "short", "extended_tweet": {"full_text": "long body #upright4nigeria"}, "user": {"screen_name": "c"}}
"#;

#[tokio::test]
async fn replay_filters_posts_by_keyword() {
    let path = write_capture("filter", CAPTURE);
    let source = JsonlReplaySource::new(&path);

    let mut subscription = source.subscribe(&params()).await.unwrap();
    let mut kinds = Vec::new();
    while let Some(message) = subscription.messages.recv().await {
        kinds.push(match message.unwrap() {
            StreamMessage::Post(p) => format!("post:{}", p.id_str),
            StreamMessage::Status(n) => n.kind().to_string(),
            StreamMessage::Other(_) => "other".to_string(),
        });
    }
    std::fs::remove_file(&path).ok();

    assert_eq!(kinds, vec!["post:1", "limit", "other", "post:3"]);
    assert!(!source.reconnects());
}

#[tokio::test]
async fn replay_through_driver_stops_at_eof() {
    let path = write_capture("driver", CAPTURE);
    let sink = Arc::new(CollectSink::default());
    let dispatcher = Dispatcher::new(Arc::new(NoopAvatarFetcher), sink.clone(), None);
    let driver = StreamDriver::new(
        Arc::new(JsonlReplaySource::new(&path)),
        params(),
        dispatcher.clone(),
    );

    let subscription = driver.connect().await.unwrap();
    let summary = driver.run(subscription, CancellationToken::new()).await;
    std::fs::remove_file(&path).ok();

    assert_eq!(summary.posts, 2);
    assert!(dispatcher.shutdown(Duration::from_secs(5)).await);
    let bodies: Vec<String> = {
        let mut b: Vec<String> = sink
            .reports
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.body.clone())
            .collect();
        b.sort();
        b
    };
    assert_eq!(
        bodies,
        vec!["Roads flooded #Upright4Nigeria", "long body #upright4nigeria"]
    );
}

#[tokio::test]
async fn replay_missing_file_fails_to_subscribe() {
    let source = JsonlReplaySource::new("/nonexistent/capture.jsonl");
    let err = source.subscribe(&params()).await.err().expect("should fail");
    assert!(format!("{err:#}").contains("Failed to open replay file"));
}
