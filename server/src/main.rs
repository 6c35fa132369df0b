use std::{io::Read, net::SocketAddr, sync::Arc, time::Instant};

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{routing::{get, post}, Json, Router, response::{Html, IntoResponse, Response}};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use tokio::sync::Mutex as AsyncMutex;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use wiki_server::attribute::parse_save_body;
use wiki_server::completion::{self, Completion};
use wiki_server::config::Config;
use wiki_server::ledger::SledLedger;
use wiki_server::render::{CacheStats, MarkdownRenderer, Renderer};
use wiki_server::store::{EntryStore, SaveOutcome, TreeNode, WIKI_TABLE};
use wiki_server::WikiError;

#[derive(Parser, Debug)]
#[command(name = "wiki-server", version, about = "Personal wiki knowledge store")]
struct Cli {
    /// Bind address for the HTTP server
    #[arg(long, env = "HTTP_BIND")]
    bind: Option<SocketAddr>,

    /// Data directory root
    #[arg(long, env = "DATA_DIR")]
    data_dir: Option<String>,

    /// Maximum number of rendered pages kept in memory
    #[arg(long, env = "RENDER_CACHE_CAPACITY")]
    cache_capacity: Option<usize>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Serve the wiki over HTTP (default)
    Serve,
    /// Render markdown from stdin to HTML on stdout
    Render,
}

struct AppState {
    start_time: Instant,
    // One lock for the whole store: requests touching the wiki are serialized.
    wiki: AsyncMutex<EntryStore>,
}

#[derive(Serialize)]
struct Health { status: &'static str }

#[derive(Serialize)]
struct StatusResponse {
    uptime_ms: u128,
    entries: usize,
    indexed: usize,
    cache: CacheStats,
}

#[derive(Serialize)]
struct SaveResponse {
    id: String,
    created: bool,
    updated: usize,
    appended: usize,
    erased: usize,
}

#[inline]
fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>, details: Option<serde_json::Value>) -> Response {
    let body = serde_json::json!({ "error": { "code": code, "message": message.into(), "details": details } });
    (status, Json(body)).into_response()
}

fn wiki_error(err: WikiError) -> Response {
    if err.status_code().is_server_error() {
        error!(error = %err, "Wiki request failed");
    } else {
        warn!(error = %err, "Wiki request rejected");
    }
    json_error(err.status_code(), err.code(), err.to_string(), None)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let env_cfg = Config::load().unwrap_or_else(|e| {
        warn!(error = %e, "Ignoring invalid environment configuration");
        Config::default()
    });
    let cfg = Config {
        bind: cli.bind.unwrap_or(env_cfg.bind),
        data_dir: cli.data_dir.clone().unwrap_or(env_cfg.data_dir),
        cache_capacity: cli.cache_capacity.unwrap_or(env_cfg.cache_capacity),
    };

    match cli.command.unwrap_or(Command::Serve) {
        Command::Render => render_stdin(),
        Command::Serve => serve(cfg).await,
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Logs go to stderr so `render` output on stdout stays clean.
    let fmt_layer = fmt::layer().with_target(false).with_ansi(false).with_writer(std::io::stderr);
    tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();
}

fn render_stdin() -> Result<()> {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;
    match MarkdownRenderer.render(&input) {
        Ok(html) => print!("{}", html),
        Err(e) => error!(error = %e, "Unable to parse the markdown"),
    }
    Ok(())
}

fn open_store(cfg: &Config) -> Result<EntryStore> {
    let root = std::path::PathBuf::from(&cfg.data_dir);
    std::fs::create_dir_all(&root)?;
    let ledger = SledLedger::open(root.join("kv"))?;
    let table = ledger.create_table(WIKI_TABLE)?;
    let (store, _report) = EntryStore::load(Box::new(table), Box::new(MarkdownRenderer), cfg.cache_capacity)?;
    Ok(store)
}

async fn serve(cfg: Config) -> Result<()> {
    let store = open_store(&cfg)?;
    let state = Arc::new(AppState { start_time: Instant::now(), wiki: AsyncMutex::new(store) });
    info!(bind = %cfg.bind, data_dir = %cfg.data_dir, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(cfg.bind).await?;
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Shutdown signal received");
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/wiki/list", get(wiki_list))
        .route("/wiki/complete", post(wiki_complete))
        .route("/wiki/get/:id", get(wiki_get))
        .route("/wiki/raw/:id", get(wiki_raw))
        .route("/wiki/save/:id", post(wiki_save))
        .route("/wiki/delete/:id", post(wiki_delete))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Health> { Json(Health { status: "ok" }) }

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let wiki = state.wiki.lock().await;
    Json(StatusResponse {
        uptime_ms: state.start_time.elapsed().as_millis(),
        entries: wiki.len(),
        indexed: wiki.index().len(),
        cache: wiki.cache_stats(),
    })
}

async fn wiki_list(State(state): State<Arc<AppState>>) -> Json<TreeNode> {
    Json(state.wiki.lock().await.list_tree())
}

async fn wiki_complete(State(state): State<Arc<AppState>>, Json(body): Json<serde_json::Value>) -> Response {
    let context = match body.get("context").and_then(|c| c.as_str()) {
        Some(c) => c,
        None => return json_error(StatusCode::BAD_REQUEST, "INVALID_INPUT", "context field required", None),
    };
    let wiki = state.wiki.lock().await;
    let completions: Vec<Completion> = completion::complete(wiki.index(), context);
    Json(completions).into_response()
}

async fn wiki_get(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.wiki.lock().await.render(&id) {
        Ok(rendered) => Html(rendered.body().to_string()).into_response(),
        Err(err) => wiki_error(err),
    }
}

async fn wiki_raw(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.wiki.lock().await.raw(&id) {
        Ok(raw) => raw.into_response(),
        Err(err) => wiki_error(err),
    }
}

async fn wiki_save(State(state): State<Arc<AppState>>, Path(id): Path<String>, Json(body): Json<serde_json::Value>) -> Response {
    let attributes = match parse_save_body(&body) {
        Ok(a) => a,
        Err(err) => return wiki_error(err),
    };
    let result = state.wiki.lock().await.save(&id, attributes);
    match result {
        Ok(outcome) => {
            let (created, o) = match outcome {
                SaveOutcome::Created(o) => (true, o),
                SaveOutcome::Updated(o) => (false, o),
            };
            Json(SaveResponse { id, created, updated: o.updated, appended: o.appended, erased: o.erased }).into_response()
        }
        Err(err) => wiki_error(err),
    }
}

async fn wiki_delete(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let result = state.wiki.lock().await.delete(&id);
    match result {
        Ok(removed) => Json(serde_json::json!({ "id": id, "deleted": true, "removed": removed })).into_response(),
        Err(err) => wiki_error(err),
    }
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
