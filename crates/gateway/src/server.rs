use std::{future::Future, path::Path};

use {
    axum::{
        Router,
        extract::{
            Query, State, WebSocketUpgrade,
            ws::{Message, WebSocket},
        },
        http::StatusCode,
        response::{IntoResponse, Json, Response},
        routing::get,
    },
    chrono::{DateTime, Local, NaiveDate, Utc},
    futures::{SinkExt, StreamExt},
    serde::{Deserialize, Serialize},
    tokio::{net::TcpListener, sync::broadcast},
    tower_http::{
        cors::{Any, CorsLayer},
        services::ServeDir,
    },
    tracing::{debug, info},
};

use crate::{
    client::CqClient,
    logs::{LogBuffer, LogEntry, LogFilter},
};

const WELCOME: &str = "connected to cqlink log stream";
const DEFAULT_LOG_LIMIT: usize = 200;

// ── Shared app state ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub client: CqClient,
    pub logs: LogBuffer,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusReport {
    pub version: String,
    pub start: DateTime<Utc>,
    pub success: u64,
    pub fails: u64,
    pub api_connected: bool,
    pub event_connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_connected: Option<bool>,
    pub pending_commands: usize,
}

// ── Router ───────────────────────────────────────────────────────────────────

/// Build the status/log router, optionally serving `webroot` under `/`.
pub fn build_app(state: AppState, webroot: Option<&Path>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/logs", get(logs_handler))
        .route("/logs/plain", get(plain_logs_handler))
        .route("/logs/ws", get(logs_ws_handler))
        .with_state(state)
        .layer(cors);

    match webroot {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router,
    }
}

/// Serve `app` on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "status server listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusReport> {
    let (success, fails) = state.logs.counts();
    Json(StatusReport {
        version: env!("CARGO_PKG_VERSION").to_string(),
        start: state.started_at,
        success,
        fails,
        api_connected: state.client.is_api_connected(),
        event_connected: state.client.is_event_connected(),
        push_connected: state.client.is_push_connected(),
        pending_commands: state.client.pending_commands(),
    })
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
    level: Option<String>,
    search: Option<String>,
}

async fn logs_handler(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    let filter = LogFilter {
        level: query.level,
        search: query.search,
    };
    Json(
        state
            .logs
            .list(&filter, query.limit.unwrap_or(DEFAULT_LOG_LIMIT)),
    )
}

#[derive(Debug, Deserialize)]
struct PlainLogsQuery {
    date: Option<String>,
}

async fn plain_logs_handler(
    State(state): State<AppState>,
    Query(query): Query<PlainLogsQuery>,
) -> Response {
    let date = match query.date.as_deref() {
        None | Some("") => Local::now().date_naive(),
        Some(raw) => match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            Ok(d) => d,
            Err(_) => {
                return (
                    StatusCode::BAD_REQUEST,
                    format!("invalid date {raw:?}, expected YYYY-MM-DD"),
                )
                    .into_response();
            },
        },
    };
    match state.logs.read_day(date) {
        Some(text) => text.into_response(),
        None => (
            StatusCode::NOT_FOUND,
            format!("no log file for {}", date.format("%Y-%m-%d")),
        )
            .into_response(),
    }
}

async fn logs_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let rx = state.logs.subscribe();
    ws.on_upgrade(move |socket| stream_logs(socket, rx))
}

async fn stream_logs(socket: WebSocket, mut rx: broadcast::Receiver<LogEntry>) {
    let (mut tx, mut incoming) = socket.split();
    if tx.send(Message::Text(WELCOME.into())).await.is_err() {
        return;
    }
    debug!("log stream client attached");

    loop {
        tokio::select! {
            entry = rx.recv() => match entry {
                Ok(entry) => {
                    let Ok(json) = serde_json::to_string(&entry) else {
                        continue;
                    };
                    if tx.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "log stream client lagging");
                },
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = incoming.next() => match msg {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {},
            },
        }
    }
    debug!("log stream client detached");
}
