use std::env;
use std::fs;
use std::io::ErrorKind;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use genfeed_contracts::events::EventLog;
use genfeed_contracts::requests::{GenerationParams, GenerationRequest, RequestFilter, RequestPage};
use genfeed_contracts::signals::parse_signal_line;
use genfeed_contracts::snapshot::SnapshotStore;
use genfeed_engine::{
    FeedConfig, FeedEngine, HttpRequestSource, InMemorySource, PollOutcome, PollWorker,
    SharedFeed, SignalOutcome, StderrNotifier,
};
use serde_json::{json, Map, Value};
use tungstenite::client::IntoClientRequest;
use tungstenite::http::header::AUTHORIZATION;
use tungstenite::http::{HeaderValue, Request};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{connect as websocket_connect, Message as WsMessage, WebSocket};

#[derive(Debug, Parser)]
#[command(name = "genfeed", version, about = "Generation request feed client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Follow the live feed: poll in-progress requests and apply realtime signals.
    Watch(WatchArgs),
    /// Run the feed against a JSON fixture and a signal JSONL file, offline.
    Replay(ReplayArgs),
    Submit(SubmitArgs),
    Delete(DeleteArgs),
    Prune(PruneArgs),
}

#[derive(Debug, Args)]
struct ApiArgs {
    /// Falls back to GENFEED_API_BASE.
    #[arg(long)]
    api_base: Option<String>,
    /// Falls back to GENFEED_API_TOKEN.
    #[arg(long)]
    api_token: Option<String>,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct WatchArgs {
    #[command(flatten)]
    api: ApiArgs,
    #[arg(long)]
    snapshot: Option<PathBuf>,
    /// Websocket URL streaming `{"status", "imageHash"}` messages.
    #[arg(long)]
    signals_ws: Option<String>,
    /// Poll by status instead of by the cached request ids.
    #[arg(long)]
    global: bool,
    #[arg(long)]
    exit_when_idle: bool,
    #[arg(long)]
    max_seconds: Option<u64>,
}

#[derive(Debug, Parser)]
struct ReplayArgs {
    /// JSON array of requests, or a single `{"items": [...]}` page.
    #[arg(long)]
    fixture: PathBuf,
    #[arg(long)]
    signals: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value_t = 20)]
    page_size: usize,
    /// Run one status poll after the signals are applied.
    #[arg(long)]
    poll: bool,
}

#[derive(Debug, Parser)]
struct SubmitArgs {
    #[command(flatten)]
    api: ApiArgs,
    #[arg(long)]
    prompt: Option<String>,
    #[arg(long)]
    quantity: Option<u64>,
    /// Extra parameters as a JSON object; `--prompt` and `--quantity` win.
    #[arg(long)]
    params: Option<String>,
}

#[derive(Debug, Parser)]
struct DeleteArgs {
    #[command(flatten)]
    api: ApiArgs,
    #[arg(long)]
    id: u64,
}

#[derive(Debug, Parser)]
struct PruneArgs {
    #[command(flatten)]
    api: ApiArgs,
    #[arg(long = "image-id", required = true)]
    image_ids: Vec<u64>,
}

const WATCH_TICK: Duration = Duration::from_millis(250);
const SIGNAL_SOCKET_READ_TIMEOUT: Duration = Duration::from_millis(500);

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("genfeed error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Watch(args) => run_watch(args),
        Command::Replay(args) => run_replay(args),
        Command::Submit(args) => run_submit(args),
        Command::Delete(args) => run_delete(args),
        Command::Prune(args) => run_prune(args),
    }
}

fn event_log(path: Option<&Path>) -> EventLog {
    match path {
        Some(path) => EventLog::to_file(path, None),
        None => EventLog::disabled(),
    }
}

fn api_token(api: &ApiArgs) -> Option<String> {
    api.api_token
        .clone()
        .or_else(|| env::var("GENFEED_API_TOKEN").ok())
        .filter(|value| !value.trim().is_empty())
}

fn http_engine(api: &ApiArgs, config: FeedConfig) -> Result<FeedEngine> {
    let api_base = api
        .api_base
        .clone()
        .or_else(|| env::var("GENFEED_API_BASE").ok())
        .ok_or_else(|| anyhow!("missing --api-base (or GENFEED_API_BASE)"))?;
    let source = HttpRequestSource::new(&api_base, api_token(api), config.http_timeout)?;
    Ok(FeedEngine::new(
        Box::new(source),
        Box::new(StderrNotifier),
        event_log(api.events.as_deref()),
        config,
    ))
}

fn lock_feed(feed: &SharedFeed) -> Result<std::sync::MutexGuard<'_, FeedEngine>> {
    feed.lock().map_err(|_| anyhow!("feed lock poisoned"))
}

fn run_watch(args: WatchArgs) -> Result<i32> {
    let mut engine = http_engine(&args.api, FeedConfig::from_env())?;
    let store = args.snapshot.as_ref().map(SnapshotStore::new);
    let now = Instant::now();
    let first_page = engine
        .fetch_page(&RequestFilter::default(), now)
        .map(|view| view.requests.len());
    if let Err(err) = first_page {
        let Some(snapshot) = store.as_ref().and_then(SnapshotStore::load) else {
            return Err(err);
        };
        eprintln!("genfeed: first page failed, resuming from snapshot: {err:#}");
        engine.restore(&snapshot, now);
    }
    if args.global {
        engine.observe_global(now);
    }

    let feed = engine.into_shared();
    let mut worker = PollWorker::spawn(feed.clone())?;
    let stop = Arc::new(AtomicBool::new(false));
    let signal_thread = match args.signals_ws.clone() {
        Some(url) => Some(spawn_signal_reader(
            url,
            api_token(&args.api),
            feed.clone(),
            stop.clone(),
        )?),
        None => None,
    };

    let started = Instant::now();
    let mut last_count: Option<usize> = None;
    let result = loop {
        thread::sleep(WATCH_TICK);
        let (count, idle) = {
            let guard = lock_feed(&feed)?;
            let count = guard.in_progress();
            if last_count != Some(count) {
                if let Some(store) = store.as_ref() {
                    save_snapshot(store, &guard)?;
                }
            }
            (count, count == 0 && (args.global || guard.next_poll_at().is_none()))
        };
        if last_count != Some(count) {
            println!("{count} generations in progress");
            last_count = Some(count);
        }
        if args.exit_when_idle && idle {
            break Ok(0);
        }
        if let Some(limit) = args.max_seconds {
            if started.elapsed() >= Duration::from_secs(limit) {
                break Ok(0);
            }
        }
        if let Some(handle) = signal_thread.as_ref() {
            if handle.is_finished() && !args.exit_when_idle && args.max_seconds.is_none() {
                break Err(anyhow!("realtime signal stream ended"));
            }
        }
    };

    stop.store(true, Ordering::SeqCst);
    worker.stop();
    if let Some(handle) = signal_thread {
        let _ = handle.join();
    }
    if let Some(store) = store.as_ref() {
        save_snapshot(store, &*lock_feed(&feed)?)?;
    }
    result
}

fn save_snapshot(store: &SnapshotStore, engine: &FeedEngine) -> Result<()> {
    let next_cursor = engine
        .cache()
        .query(&RequestFilter::default())
        .and_then(|query| query.next_cursor());
    store
        .save(&engine.cache().requests(), next_cursor)
        .with_context(|| format!("failed to save snapshot {}", store.path().display()))?;
    Ok(())
}

fn build_signal_ws_request(url: &str, api_token: Option<&str>) -> Result<Request<()>> {
    let mut request = url
        .into_client_request()
        .with_context(|| format!("invalid signal websocket url {url}"))?;
    if let Some(token) = api_token {
        request.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))
                .context("api token is not a valid header value")?,
        );
    }
    Ok(request)
}

fn spawn_signal_reader(
    url: String,
    api_token: Option<String>,
    feed: SharedFeed,
    stop: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<()>> {
    let request = build_signal_ws_request(&url, api_token.as_deref())?;
    thread::Builder::new()
        .name("genfeed-signals".to_string())
        .spawn(move || {
            if let Err(err) = read_signal_socket(request, &feed, &stop) {
                eprintln!("genfeed signals error: {err:#}");
            }
        })
        .context("failed to spawn signal reader")
}

fn read_signal_socket(
    request: Request<()>,
    feed: &SharedFeed,
    stop: &AtomicBool,
) -> Result<()> {
    let (mut socket, _response) =
        websocket_connect(request).context("signal websocket connect failed")?;
    set_signal_socket_read_timeout(&mut socket, Some(SIGNAL_SOCKET_READ_TIMEOUT));

    while !stop.load(Ordering::SeqCst) {
        let message = match socket.read() {
            Ok(message) => message,
            Err(tungstenite::Error::Io(err))
                if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                continue;
            }
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                break;
            }
            Err(err) => return Err(err).context("signal websocket read failed"),
        };
        let text = match message {
            WsMessage::Text(text) => text.to_string(),
            WsMessage::Binary(bytes) => String::from_utf8_lossy(&bytes).to_string(),
            WsMessage::Close(_) => break,
            _ => continue,
        };
        let mut guard = lock_feed(feed)?;
        apply_signal_line(&mut guard, &text);
    }
    let _ = socket.close(None);
    Ok(())
}

fn set_signal_socket_read_timeout(
    socket: &mut WebSocket<MaybeTlsStream<TcpStream>>,
    timeout: Option<Duration>,
) {
    match socket.get_mut() {
        MaybeTlsStream::Plain(stream) => {
            let _ = stream.set_read_timeout(timeout);
        }
        MaybeTlsStream::Rustls(stream) => {
            let _ = stream.get_mut().set_read_timeout(timeout);
        }
        _ => {}
    }
}

/// Applies one raw signal message. Malformed messages are logged and skipped.
fn apply_signal_line(engine: &mut FeedEngine, line: &str) -> Option<SignalOutcome> {
    match parse_signal_line(line) {
        Ok(Some(event)) => Some(engine.apply_signal(&event)),
        Ok(None) => None,
        Err(err) => {
            let message = format!("{err:#}");
            eprintln!("genfeed: skipping signal: {message}");
            engine
                .events()
                .note("signal_rejected", map_object(json!({ "error": message })));
            None
        }
    }
}

fn load_fixture(path: &Path) -> Result<Vec<GenerationRequest>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read fixture {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("fixture {} is not valid JSON", path.display()))?;
    if value.is_array() {
        return serde_json::from_value(value).context("fixture has an invalid request list");
    }
    if value.get("items").is_some() {
        let page: RequestPage =
            serde_json::from_value(value).context("fixture has an invalid request page")?;
        return Ok(page.items);
    }
    bail!("fixture must be a request array or a page with `items`")
}

fn in_memory_source(requests: Vec<GenerationRequest>, page_size: usize) -> InMemorySource {
    let source = InMemorySource::with_page_size(page_size);
    for request in requests.into_iter().rev() {
        source.push_request(request);
    }
    source
}

fn run_replay(args: ReplayArgs) -> Result<i32> {
    let requests = load_fixture(&args.fixture)?;
    let source = in_memory_source(requests, args.page_size);
    let config = FeedConfig::from_env();
    let debounce = config.poll_debounce;
    let mut engine = FeedEngine::new(
        Box::new(source),
        Box::new(StderrNotifier),
        event_log(args.events.as_deref()),
        config,
    );

    let now = Instant::now();
    let filter = RequestFilter::default();
    loop {
        engine.fetch_page(&filter, now)?;
        let has_more = engine
            .cache()
            .query(&filter)
            .is_some_and(|query| query.has_more());
        if !has_more {
            break;
        }
    }

    let mut applied = 0usize;
    let mut buffered = 0usize;
    if let Some(path) = args.signals.as_ref() {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read signals {}", path.display()))?;
        for line in raw.lines() {
            match apply_signal_line(&mut engine, line) {
                Some(SignalOutcome::Applied) => applied += 1,
                Some(SignalOutcome::Buffered { .. }) => buffered += 1,
                None => {}
            }
        }
    }

    let mut poll = Value::Null;
    if args.poll {
        poll = match engine.poll_due(now + debounce) {
            PollOutcome::Idle => json!("idle"),
            PollOutcome::Cancelled => json!("cancelled"),
            PollOutcome::Merged(merge) => json!({
                "merged": merge.merged,
                "dropped": merge.dropped,
            }),
            PollOutcome::Failed(message) => json!({ "error": message }),
        };
    }

    let report = json!({
        "requests": engine.cache().requests(),
        "in_progress": engine.in_progress(),
        "signals": { "applied": applied, "buffered": buffered },
        "pending_signals": engine.signals().hashes().collect::<Vec<_>>(),
        "poll": poll,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(0)
}

fn submit_params(args: &SubmitArgs) -> Result<GenerationParams> {
    let mut params = match args.params.as_deref() {
        Some(raw) => match serde_json::from_str::<Value>(raw).context("--params is not JSON")? {
            Value::Object(map) => map,
            _ => bail!("--params must be a JSON object"),
        },
        None => GenerationParams::new(),
    };
    if let Some(prompt) = args.prompt.as_ref() {
        params.insert("prompt".to_string(), json!(prompt));
    }
    if let Some(quantity) = args.quantity {
        params.insert("quantity".to_string(), json!(quantity));
    }
    if params.is_empty() {
        bail!("nothing to submit: pass --prompt or --params");
    }
    Ok(params)
}

fn run_submit(args: SubmitArgs) -> Result<i32> {
    let params = submit_params(&args)?;
    let mut engine = http_engine(&args.api, FeedConfig::from_env())?;
    let created = engine.create_request(&params, Instant::now())?;
    println!("{}", serde_json::to_string_pretty(&created)?);
    Ok(0)
}

fn run_delete(args: DeleteArgs) -> Result<i32> {
    let mut engine = http_engine(&args.api, FeedConfig::from_env())?;
    engine.delete_request(args.id, Instant::now())?;
    println!("deleted request {}", args.id);
    Ok(0)
}

fn run_prune(args: PruneArgs) -> Result<i32> {
    let mut engine = http_engine(&args.api, FeedConfig::from_env())?;
    let result = engine.bulk_delete_images(&args.image_ids, Instant::now())?;
    println!("deleted {} images", result.deleted);
    Ok(0)
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Instant;

    use genfeed_contracts::events::EventLog;
    use genfeed_contracts::requests::{GeneratedImage, ImageStatus, RequestFilter, RequestStatus};
    use genfeed_engine::{FeedConfig, FeedEngine, RecordingNotifier, SignalOutcome};

    use super::{
        apply_signal_line, build_signal_ws_request, in_memory_source, load_fixture,
        submit_params, ApiArgs, SubmitArgs,
    };

    fn submit_args(prompt: Option<&str>, params: Option<&str>) -> SubmitArgs {
        SubmitArgs {
            api: ApiArgs {
                api_base: None,
                api_token: None,
                events: None,
            },
            prompt: prompt.map(str::to_string),
            quantity: None,
            params: params.map(str::to_string),
        }
    }

    #[test]
    fn signal_ws_request_carries_bearer_token() -> anyhow::Result<()> {
        let request = build_signal_ws_request("wss://feed.test/signals", Some("tok"))?;
        assert_eq!(request.uri().to_string(), "wss://feed.test/signals");
        assert!(request.headers().contains_key("sec-websocket-key"));
        assert_eq!(
            request
                .headers()
                .get("authorization")
                .and_then(|value| value.to_str().ok()),
            Some("Bearer tok")
        );
        Ok(())
    }

    #[test]
    fn fixture_accepts_array_or_page() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let array = temp.path().join("array.json");
        fs::write(&array, r#"[{"id":1,"status":"Processing","images":[]}]"#)?;
        let page = temp.path().join("page.json");
        fs::write(
            &page,
            r#"{"items":[{"id":2,"status":"Succeeded","images":[]}],"nextCursor":null}"#,
        )?;
        let bad = temp.path().join("bad.json");
        fs::write(&bad, r#"{"id":3}"#)?;

        assert_eq!(load_fixture(&array)?[0].id, 1);
        assert_eq!(load_fixture(&page)?[0].status, RequestStatus::Succeeded);
        assert!(load_fixture(&bad).is_err());
        Ok(())
    }

    #[test]
    fn malformed_signal_lines_are_skipped_and_logged() -> anyhow::Result<()> {
        let request = genfeed_contracts::requests::GenerationRequest::new(
            1,
            RequestStatus::Processing,
            vec![GeneratedImage::new(Some(1), "a")],
        );
        let mut engine = FeedEngine::new(
            Box::new(in_memory_source(vec![request], 20)),
            Box::new(RecordingNotifier::new()),
            EventLog::in_memory(),
            FeedConfig::default(),
        );
        engine.fetch_page(&RequestFilter::default(), Instant::now())?;

        assert_eq!(apply_signal_line(&mut engine, "not json"), None);
        assert_eq!(apply_signal_line(&mut engine, ""), None);
        assert_eq!(
            apply_signal_line(&mut engine, r#"{"status":"Success","imageHash":"a"}"#),
            Some(SignalOutcome::Applied)
        );
        let image = engine.cache().image_by_hash("a").cloned();
        assert_eq!(image.map(|image| image.status), Some(ImageStatus::Success));
        assert!(engine
            .events()
            .recorded_types()
            .contains(&"signal_rejected".to_string()));
        Ok(())
    }

    #[test]
    fn submit_params_merge_flags_over_json() -> anyhow::Result<()> {
        let params = submit_params(&submit_args(
            Some("a harbor"),
            Some(r#"{"prompt":"ignored","steps":30}"#),
        ))?;
        assert_eq!(params["prompt"], "a harbor");
        assert_eq!(params["steps"], 30);

        assert!(submit_params(&submit_args(None, None)).is_err());
        assert!(submit_params(&submit_args(None, Some("[1]"))).is_err());
        Ok(())
    }
}
