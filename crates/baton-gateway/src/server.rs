use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use baton_core::HookSignal;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, ScreenshotError};
use crate::events::GatewayEvent;
use crate::screenshots::ScreenshotRuns;

const EVENT_CAPACITY: usize = 64;

struct AppState {
    events: broadcast::Sender<GatewayEvent>,
    screenshots: Arc<ScreenshotRuns>,
}

#[derive(Debug, Deserialize)]
struct LocationQuery {
    project: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunRequest {
    project: String,
    name: String,
    #[serde(default)]
    device: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompleteRequest {
    run_id: String,
}

pub struct GatewayServer {
    events: broadcast::Sender<GatewayEvent>,
    screenshots: Arc<ScreenshotRuns>,
}

impl GatewayServer {
    pub fn new(screenshots: ScreenshotRuns) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            events,
            screenshots: Arc::new(screenshots),
        }
    }

    /// Receive every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    /// Sender side of the event feed, for components that subscribe later.
    pub fn events(&self) -> broadcast::Sender<GatewayEvent> {
        self.events.clone()
    }

    pub fn router(&self) -> Router {
        let state = Arc::new(AppState {
            events: self.events.clone(),
            screenshots: self.screenshots.clone(),
        });
        Router::new()
            .route("/", get(root_handler))
            .route("/health", get(health_handler))
            .route("/hook/complete", post(hook_complete_handler))
            .route("/screenshots/location", get(screenshot_location_handler))
            .route("/screenshots/run", post(screenshot_run_handler))
            .route("/screenshots/complete", post(screenshot_complete_handler))
            .fallback(not_found)
            .method_not_allowed_fallback(not_found)
            .with_state(state)
    }

    /// Bind a loopback listener. Port `0` picks a free port.
    pub async fn bind(host: &str, port: u16) -> Result<TcpListener, GatewayError> {
        let ip: IpAddr = match host {
            "localhost" => IpAddr::from([127, 0, 0, 1]),
            other => other
                .parse()
                .map_err(|_| GatewayError::NonLoopback(other.to_string()))?,
        };
        if !ip.is_loopback() {
            return Err(GatewayError::NonLoopback(host.to_string()));
        }

        let addr = SocketAddr::new(ip, port);
        TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind {
                addr: addr.to_string(),
                source,
            })
    }

    pub async fn start(&self, host: &str, port: u16) -> Result<(), GatewayError> {
        self.serve(Self::bind(host, port).await?, std::future::pending())
            .await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), GatewayError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(addr) = listener.local_addr() {
            info!("Completion listener on http://{}", addr);
        }
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| GatewayError::ServerError(e.to_string()))
    }
}

async fn root_handler() -> Json<Value> {
    Json(json!({
        "service": "baton",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Any body, including none or garbage, counts as a completion.
async fn hook_complete_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Json<Value> {
    let signal = parse_hook_body(&body);
    debug!(
        session = signal.session.as_deref().unwrap_or("-"),
        "Completion hook received"
    );
    publish(&state, GatewayEvent::HookCompleted(signal));
    Json(json!({ "received": true }))
}

async fn screenshot_location_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LocationQuery>,
) -> Response {
    let project = query.project.unwrap_or_default();
    match state.screenshots.location(&project) {
        Ok(path) => Json(json!({ "path": path })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn screenshot_run_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request: RunRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return error_response(ScreenshotError::InvalidRequest(e.to_string())),
    };

    match state
        .screenshots
        .start_run(&request.project, &request.name, request.device.as_deref())
        .await
    {
        Ok(run) => {
            publish(
                &state,
                GatewayEvent::ScreenshotRunStarted {
                    run_id: run.run_id.clone(),
                    project: run.project.clone(),
                    path: run.path.clone(),
                },
            );
            Json(json!({ "runId": run.run_id, "path": run.path })).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn screenshot_complete_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Response {
    let request: CompleteRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return error_response(ScreenshotError::InvalidRequest(e.to_string())),
    };

    match state.screenshots.complete_run(&request.run_id).await {
        Ok(run) => {
            publish(
                &state,
                GatewayEvent::ScreenshotRunCompleted {
                    run_id: run.run_id,
                    path: run.path,
                },
            );
            Json(json!({ "completed": true })).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn not_found() -> (StatusCode, Json<Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" })))
}

fn parse_hook_body(body: &[u8]) -> HookSignal {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        if !body.is_empty() {
            debug!(len = body.len(), "Unparseable hook body, treating as bare completion");
        }
        return HookSignal::empty();
    };
    let field = |name: &str| value.get(name).and_then(Value::as_str).map(str::to_string);
    HookSignal::new(field("session"), field("timestamp"))
}

fn publish(state: &AppState, event: GatewayEvent) {
    if state.events.send(event).is_err() {
        debug!("No subscribers for gateway event");
    }
}

fn error_response(err: ScreenshotError) -> Response {
    let status = match err {
        ScreenshotError::InvalidRequest(_) | ScreenshotError::UnknownRun(_) => {
            StatusCode::BAD_REQUEST
        }
        ScreenshotError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!("Screenshot request failed: {}", err);
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}
