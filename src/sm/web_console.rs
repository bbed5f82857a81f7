//! The HTTP control surface: dashboard, JSON status, log tails, SSE streams.

use crate::sm::backend;
use crate::sm::config::AuthConfig;
use crate::sm::daemon::{self, sm_event, AddSiteRequest, EventEntry, ManagerState, OpError, SiteStatus};
use crate::sm::logtail::{self, StreamFrame};
use anyhow::{Context, Result};
use askama::Template;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt as _};

pub fn build_router(state: Arc<ManagerState>) -> Router {
    Router::new()
        .route("/", get(dashboard))
        .route("/logs/:name", get(logs_page))
        .route("/api/status", get(api_status))
        .route("/api/logs/:name", get(api_logs))
        .route("/api/events", get(api_events))
        .route("/api/reload", post(api_reload))
        .route("/api/sites", post(api_add_site))
        .route("/api/sites/delete", post(api_delete_site))
        .route("/action", post(action))
        .route("/stream/:name", get(stream_logs))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state)
}

/// Serve the console until the shutdown flag flips.
pub async fn serve(bind: &str, state: Arc<ManagerState>) -> Result<()> {
    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    sm_event(&state, "web", "-", &format!("Console listening on http://{bind}"));
    let flag = state.shutting_down.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !flag.load(Ordering::Relaxed) {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        })
        .await
        .context("web console server")?;
    Ok(())
}

async fn auth_middleware(
    State(state): State<Arc<ManagerState>>,
    req: Request,
    next: Next,
) -> Response {
    let authz = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let cfg = state.snapshot();
    if check_auth(&cfg.auth, authz) {
        next.run(req).await
    } else {
        unauthorized()
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic")],
        "Not authenticated",
    )
        .into_response()
}

/// Bearer wins when a token is configured and the client sends one; it never
/// falls through to Basic. With no credentials configured at all (empty
/// strings count as unconfigured) the console is open.
pub fn check_auth(auth: &AuthConfig, authz: &str) -> bool {
    if let Some(token) = auth.token() {
        if let Some(rest) = authz.strip_prefix("Bearer ") {
            return rest.trim() == token;
        }
    }
    if !authz.is_empty() {
        if let Some((user, pass)) = parse_basic(authz) {
            return auth.username.as_deref() == Some(user.as_str())
                && auth.password.as_deref() == Some(pass.as_str());
        }
    }
    auth.username().is_none() && auth.password().is_none() && auth.token().is_none()
}

fn parse_basic(header_val: &str) -> Option<(String, String)> {
    let (scheme, b64) = header_val.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let raw = general_purpose::STANDARD.decode(b64.trim()).ok()?;
    let raw = String::from_utf8_lossy(&raw);
    let (user, pass) = raw.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

fn op_error_response(err: &OpError) -> Response {
    let status = match err {
        OpError::SiteNotFound(_) => StatusCode::NOT_FOUND,
        OpError::DuplicateSite(_) | OpError::DuplicateSession(_) => StatusCode::CONFLICT,
        OpError::InvalidName(_)
        | OpError::InvalidWorkingDirectory(_)
        | OpError::EmptyCommand
        | OpError::InvalidPort(_)
        | OpError::UnknownOp(_) => StatusCode::BAD_REQUEST,
        OpError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string()).into_response()
}

#[derive(Template)]
#[template(path = "dashboard.html")]
struct DashboardTemplate {
    now: String,
    tmux: bool,
    config_path: String,
    sites: Vec<SiteRow>,
}

#[derive(Template)]
#[template(path = "logs.html")]
struct LogsTemplate {
    name: String,
    cwd: String,
    logfile: String,
}

/// Row view for the dashboard table, with absent values prerendered as "-".
struct SiteRow {
    name: String,
    status: &'static str,
    mode: String,
    port: String,
    cwd: String,
    cmd: String,
    log: String,
}

impl SiteRow {
    fn from_status(s: &SiteStatus) -> Self {
        Self {
            name: s.name.clone(),
            status: s.status,
            mode: s.mode.unwrap_or("-").to_string(),
            port: s
                .port
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            cwd: s.cwd.clone(),
            cmd: s.cmd.clone(),
            log: s.log.clone(),
        }
    }
}

async fn dashboard(State(state): State<Arc<ManagerState>>) -> Response {
    let statuses = daemon::status_all(&state).await;
    let tmpl = DashboardTemplate {
        now: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        tmux: backend::session_backend_available().await,
        config_path: state.config_path.display().to_string(),
        sites: statuses.iter().map(SiteRow::from_status).collect(),
    };
    match tmpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn logs_page(
    State(state): State<Arc<ManagerState>>,
    Path(name): Path<String>,
) -> Response {
    let cfg = state.snapshot();
    let Some(site) = cfg.site(&name) else {
        return op_error_response(&OpError::SiteNotFound(name));
    };
    let tmpl = LogsTemplate {
        name: site.name.clone(),
        cwd: site.cwd.display().to_string(),
        logfile: site.log_path().display().to_string(),
    };
    match tmpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn api_status(State(state): State<Arc<ManagerState>>) -> Json<Vec<SiteStatus>> {
    Json(daemon::status_all(&state).await)
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default = "default_lines")]
    lines: usize,
}

fn default_lines() -> usize {
    200
}

async fn api_logs(
    State(state): State<Arc<ManagerState>>,
    Path(name): Path<String>,
    Query(q): Query<LogsQuery>,
) -> Response {
    match daemon::tail_site(&state, &name, q.lines) {
        Ok(lines) => lines.join("\n").into_response(),
        Err(e) => op_error_response(&e),
    }
}

async fn api_events(State(state): State<Arc<ManagerState>>) -> Json<Vec<EventEntry>> {
    Json(state.events_snapshot())
}

async fn api_reload(State(state): State<Arc<ManagerState>>) -> Response {
    match daemon::reload_config(&state) {
        Ok(msg) => msg.into_response(),
        Err(e) => op_error_response(&e),
    }
}

async fn api_add_site(
    State(state): State<Arc<ManagerState>>,
    Form(req): Form<AddSiteRequest>,
) -> Response {
    match daemon::add_site(&state, &req).await {
        Ok(msg) => msg.into_response(),
        Err(e) => op_error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct DeleteForm {
    name: String,
}

async fn api_delete_site(
    State(state): State<Arc<ManagerState>>,
    Form(f): Form<DeleteForm>,
) -> Response {
    match daemon::delete_site(&state, &f.name).await {
        Ok(msg) => msg.into_response(),
        Err(e) => op_error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct ActionForm {
    name: String,
    op: String,
}

async fn action(
    State(state): State<Arc<ManagerState>>,
    Form(f): Form<ActionForm>,
) -> Response {
    match daemon::run_action(&state, &f.name, &f.op).await {
        Ok(msg) => msg.into_response(),
        Err(e) => op_error_response(&e),
    }
}

/// One SSE payload per frame: a clear marker, a batch of data lines, or a
/// comment keepalive.
pub fn encode_sse(frame: &StreamFrame) -> Bytes {
    match frame {
        StreamFrame::Clear => Bytes::from_static(b"data: __CLEAR__\n\n"),
        StreamFrame::Keepalive => Bytes::from_static(b": keep-alive\n\n"),
        StreamFrame::Lines(lines) => {
            let mut out = String::new();
            for line in lines {
                out.push_str("data: ");
                out.push_str(line);
                out.push('\n');
            }
            out.push('\n');
            Bytes::from(out)
        }
    }
}

async fn stream_logs(
    State(state): State<Arc<ManagerState>>,
    Path(name): Path<String>,
) -> Response {
    let cfg = state.snapshot();
    let Some(site) = cfg.site(&name) else {
        return op_error_response(&OpError::SiteNotFound(name));
    };
    let (tx, rx) = mpsc::channel::<StreamFrame>(64);
    daemon::tasks().spawn(logtail::follow(
        site.log_path(),
        state.shutting_down.clone(),
        tx,
    ));
    let stream = ReceiverStream::new(rx).map(|frame| Ok::<_, Infallible>(encode_sse(&frame)));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response())
}
