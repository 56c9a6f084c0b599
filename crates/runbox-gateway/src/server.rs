//! HTTP server — tool endpoints over the shared control plane
//!
//! Every tool is a `POST /api/tools/<name>` with a JSON body. Read-only
//! listings live under `GET /api/...`. Everything below `/api` needs the
//! API key when one is configured.

use anyhow::{Context, Result};
use axum::extract::{FromRequest, Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use runbox_core::{Runbox, Sandbox};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::require_api_key;
use crate::error::{ApiError, ApiResult};
use crate::protocol::*;

/// State shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub runbox: Arc<Runbox>,
    pub api_key: Option<Arc<str>>,
}

/// `Json` whose rejections use the gateway's `{error}` body
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

pub fn create_router(runbox: Arc<Runbox>, api_key: Option<String>) -> Router {
    let state = AppState {
        runbox,
        api_key: api_key.filter(|k| !k.trim().is_empty()).map(Arc::from),
    };

    let tools = Router::new()
        .route("/create_sandbox", post(create_sandbox))
        .route("/resume_sandbox", post(resume_sandbox))
        .route("/stop_sandbox", post(stop_sandbox))
        .route("/destroy_sandbox", post(destroy_sandbox))
        .route("/get_sandbox_editor_url", post(get_sandbox_editor_url))
        .route("/execute_command", post(execute_command))
        .route("/poll_command", post(poll_command))
        .route("/kill_session", post(kill_session))
        .route("/expose_port", post(expose_port))
        .route("/release_port", post(release_port))
        .route("/write_file", post(write_file))
        .route("/read_file", post(read_file))
        .route("/list_directory", post(list_directory));

    let api = Router::new()
        .nest("/tools", tools)
        .route("/sandboxes", get(list_sandboxes))
        .route("/sandboxes/{id}", get(get_sandbox))
        .route("/sandboxes/{id}/sessions", get(list_sessions))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// The HTTP surface of one control plane
pub struct GatewayServer {
    runbox: Arc<Runbox>,
    bind: String,
    api_key: Option<String>,
}

impl GatewayServer {
    pub fn new(runbox: Arc<Runbox>) -> Self {
        let gateway = &runbox.config().gateway;
        let bind = gateway.bind.clone();
        let api_key = gateway.api_key.clone();
        Self {
            runbox,
            bind,
            api_key,
        }
    }

    pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
        self.bind = bind.into();
        self
    }

    pub fn router(&self) -> Router {
        create_router(self.runbox.clone(), self.api_key.clone())
    }

    /// Bind the configured address and serve until cancelled
    pub async fn start(self, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(&self.bind)
            .await
            .with_context(|| format!("Failed to bind gateway on {}", self.bind))?;
        self.serve(listener, cancel).await
    }

    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let addr = listener.local_addr()?;
        if self.api_key.is_none() {
            warn!("No API key configured, tool endpoints are open");
        }
        info!("Gateway listening on http://{}", addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .context("Gateway server error")?;

        info!("Gateway stopped");
        Ok(())
    }
}

// ── Handlers ──

async fn root() -> Json<Value> {
    Json(json!({
        "message": "Welcome to runbox!",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "sandboxes": state.runbox.list_sandboxes().len(),
        "sessions": state.runbox.list_sessions(None).len(),
    }))
}

fn sandbox_response(runbox: &Runbox, sandbox: Sandbox, verb: &str) -> SandboxResponse {
    let url = runbox.editor_url(&sandbox.id);
    SandboxResponse {
        text: format!("Sandbox {} {}. Its editor is at {}", sandbox.id, verb, url),
        sandbox_id: sandbox.id.clone(),
        url,
        sandbox,
    }
}

async fn create_sandbox(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<CreateSandboxRequest>,
) -> ApiResult<Json<SandboxResponse>> {
    let existing = req.sandbox_id.as_deref().filter(|id| !id.is_empty());
    let sandbox = state.runbox.create_sandbox(existing).await?;
    Ok(Json(sandbox_response(&state.runbox, sandbox, "created")))
}

async fn resume_sandbox(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<SandboxRequest>,
) -> ApiResult<Json<SandboxResponse>> {
    let sandbox = state.runbox.resume_sandbox(&req.sandbox_id).await?;
    Ok(Json(sandbox_response(&state.runbox, sandbox, "is running")))
}

async fn stop_sandbox(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<SandboxRequest>,
) -> ApiResult<Json<StatusResponse>> {
    state.runbox.stop_sandbox(&req.sandbox_id).await?;
    Ok(Json(StatusResponse::new(
        "stopped",
        format!("Sandbox {} stopped; its files are kept", req.sandbox_id),
    )))
}

async fn destroy_sandbox(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<SandboxRequest>,
) -> ApiResult<Json<StatusResponse>> {
    state.runbox.destroy_sandbox(&req.sandbox_id).await?;
    Ok(Json(StatusResponse::new(
        "destroyed",
        format!("Sandbox {} and its files were removed", req.sandbox_id),
    )))
}

async fn get_sandbox_editor_url(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<SandboxRequest>,
) -> ApiResult<Json<EditorUrlResponse>> {
    runbox_core::ids::validate_id(&req.sandbox_id)?;
    Ok(Json(EditorUrlResponse {
        url: state.runbox.editor_url(&req.sandbox_id),
        sandbox_id: req.sandbox_id,
    }))
}

async fn execute_command(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<ExecuteCommandRequest>,
) -> ApiResult<Json<CommandResponse>> {
    let timeout = timeout_from_millis(req.timeout);
    let outcome = state
        .runbox
        .execute(&req.sandbox_id, &req.command, timeout)
        .await?;
    Ok(Json(CommandResponse::new(
        outcome,
        effective_timeout(&state, timeout),
    )))
}

async fn poll_command(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<PollCommandRequest>,
) -> ApiResult<Json<CommandResponse>> {
    let timeout = timeout_from_millis(req.timeout);
    let outcome = state.runbox.poll(&req.session_id, timeout).await?;
    Ok(Json(CommandResponse::new(
        outcome,
        effective_timeout(&state, timeout),
    )))
}

fn effective_timeout(state: &AppState, requested: Option<Duration>) -> Duration {
    requested.unwrap_or_else(|| state.runbox.config().sessions.default_timeout())
}

async fn kill_session(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<SessionRequest>,
) -> ApiResult<Json<StatusResponse>> {
    state.runbox.kill_session(&req.session_id)?;
    Ok(Json(StatusResponse::new(
        "killed",
        format!("Session {} was closed", req.session_id),
    )))
}

async fn expose_port(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<ExposePortRequest>,
) -> ApiResult<Json<ExposePortResponse>> {
    let service = state.runbox.expose_port(&req.sandbox_id, req.port).await?;
    let text = match req.port {
        Some(_) => format!("Service on port {} is live at {}", service.port, service.url),
        None => format!(
            "Start your service on port {}; it will be reachable at {}",
            service.port, service.url
        ),
    };
    Ok(Json(ExposePortResponse { service, text }))
}

async fn release_port(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<SandboxRequest>,
) -> ApiResult<Json<ReleasePortResponse>> {
    let port = state.runbox.release_port(&req.sandbox_id).await?;
    Ok(Json(ReleasePortResponse {
        sandbox_id: req.sandbox_id,
        port,
    }))
}

async fn write_file(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<WriteFileRequest>,
) -> ApiResult<Json<WriteFileResponse>> {
    let (sandbox_id, created) = match req.sandbox_id.filter(|id| !id.is_empty()) {
        Some(id) => (id, false),
        None => (state.runbox.create_sandbox(None).await?.id, true),
    };
    state
        .runbox
        .write_file(&sandbox_id, &req.path, &req.content)
        .await?;

    let mut text = format!("Wrote {} in sandbox {}", req.path, sandbox_id);
    if created {
        text.push_str(&format!(
            ". A new sandbox was created; its files are at {}",
            state.runbox.editor_url(&sandbox_id)
        ));
    }
    Ok(Json(WriteFileResponse {
        new_sandbox_id: created.then(|| sandbox_id.clone()),
        sandbox_id,
        path: req.path,
        text,
    }))
}

async fn read_file(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<PathRequest>,
) -> ApiResult<Json<FileResponse>> {
    let text = state.runbox.read_file(&req.sandbox_id, &req.path).await?;
    Ok(Json(FileResponse {
        path: req.path,
        text,
    }))
}

async fn list_directory(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<PathRequest>,
) -> ApiResult<Json<DirectoryResponse>> {
    let entries = state
        .runbox
        .list_directory(&req.sandbox_id, &req.path)
        .await?;
    Ok(Json(DirectoryResponse {
        path: req.path,
        entries,
    }))
}

async fn list_sandboxes(State(state): State<AppState>) -> Json<SandboxList> {
    Json(SandboxList {
        sandboxes: state.runbox.list_sandboxes(),
    })
}

async fn get_sandbox(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Sandbox>> {
    Ok(Json(state.runbox.get_sandbox(&id)?))
}

async fn list_sessions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionList>> {
    runbox_core::ids::validate_id(&id)?;
    Ok(Json(SessionList {
        sessions: state.runbox.list_sessions(Some(&id)),
    }))
}
