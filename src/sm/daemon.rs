//! Supervisor state and the operations behind every console action.

use crate::sm::asyncutil::TaskTracker;
use crate::sm::backend::{self, Backend, GroupBackend, RunMode, SessionBackend};
use crate::sm::build_info;
use crate::sm::config::{self, ManagerConfig, Site};
use crate::sm::logtail;
use crate::sm::web_console;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};

static TASKS: OnceLock<TaskTracker> = OnceLock::new();

/// Process-wide tracker for every background task the supervisor spawns.
pub fn tasks() -> &'static TaskTracker {
    TASKS.get_or_init(TaskTracker::new)
}

pub const EVENT_RING_CAP: usize = 2000;

/// One line of supervisor history, kept in a bounded in-memory ring.
#[derive(Debug, Clone, Serialize)]
pub struct EventEntry {
    pub ts: String,
    pub component: String,
    pub site: String,
    pub message: String,
}

/// Record an event and mirror it to stderr. `site` is "-" for events not tied
/// to a particular site.
pub fn sm_event(state: &ManagerState, component: &str, site: &str, message: &str) {
    let ts = chrono::Local::now()
        .format("%Y-%m-%d_%H:%M:%S%.3f")
        .to_string();
    eprintln!("{ts} [{component}] site={site} {message}");
    let mut ring = state.events.lock().unwrap_or_else(|p| p.into_inner());
    if ring.len() >= EVENT_RING_CAP {
        ring.pop_front();
    }
    ring.push_back(EventEntry {
        ts,
        component: component.to_string(),
        site: site.to_string(),
        message: message.to_string(),
    });
}

/// Everything that can go wrong in an operation. Display strings are the
/// exact texts the console shows, so handlers only pick the status code.
#[derive(Debug)]
pub enum OpError {
    SiteNotFound(String),
    InvalidName(String),
    DuplicateSite(String),
    DuplicateSession(String),
    InvalidWorkingDirectory(String),
    EmptyCommand,
    InvalidPort(String),
    UnknownOp(String),
    Internal(anyhow::Error),
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpError::SiteNotFound(_) => f.write_str("Site not found"),
            OpError::InvalidName(_) => f.write_str("Invalid name (no spaces or slashes)."),
            OpError::DuplicateSite(_) => f.write_str("A site with that name already exists."),
            OpError::DuplicateSession(name) => write!(f, "duplicate tmux session: {name}"),
            OpError::InvalidWorkingDirectory(msg) => f.write_str(msg),
            OpError::EmptyCommand => f.write_str("Command cannot be empty."),
            OpError::InvalidPort(v) => write!(f, "Invalid port: {v}"),
            OpError::UnknownOp(_) => f.write_str("Unknown op"),
            OpError::Internal(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for OpError {}

impl From<anyhow::Error> for OpError {
    fn from(e: anyhow::Error) -> Self {
        OpError::Internal(e)
    }
}

/// Shared supervisor state. The config is an immutable snapshot behind a
/// mutex; writers install a whole new snapshot, readers clone the Arc.
pub struct ManagerState {
    pub base_dir: PathBuf,
    pub config_path: PathBuf,
    pub pid_dir: PathBuf,
    pub shutting_down: Arc<AtomicBool>,
    config: Mutex<Arc<ManagerConfig>>,
    events: Mutex<VecDeque<EventEntry>>,
}

impl ManagerState {
    pub fn new(base_dir: PathBuf, pid_dir: PathBuf, cfg: ManagerConfig) -> Arc<Self> {
        let config_path = config::config_path(&base_dir);
        Arc::new(Self {
            base_dir,
            config_path,
            pid_dir,
            shutting_down: Arc::new(AtomicBool::new(false)),
            config: Mutex::new(Arc::new(cfg)),
            events: Mutex::new(VecDeque::new()),
        })
    }

    pub fn snapshot(&self) -> Arc<ManagerConfig> {
        self.config
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn install(&self, cfg: ManagerConfig) {
        *self.config.lock().unwrap_or_else(|p| p.into_inner()) = Arc::new(cfg);
    }

    /// Fresh disk read (bootstrapping if missing) installed as the new
    /// snapshot.
    pub fn reload(&self) -> Result<Arc<ManagerConfig>> {
        let cfg = config::load_or_create(&self.config_path)?;
        self.install(cfg);
        Ok(self.snapshot())
    }

    pub fn group(&self) -> GroupBackend {
        GroupBackend::new(self.pid_dir.clone())
    }

    pub fn events_snapshot(&self) -> Vec<EventEntry> {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

/// Wire shape of one row in the status table. `mode` is null when stopped;
/// a live tmux session wins over a live process group.
#[derive(Debug, Clone, Serialize)]
pub struct SiteStatus {
    pub name: String,
    pub status: &'static str,
    pub mode: Option<&'static str>,
    pub port: Option<u16>,
    pub cwd: String,
    pub cmd: String,
    pub log: String,
}

pub async fn site_status(state: &ManagerState, site: &Site) -> SiteStatus {
    let in_session =
        backend::session_backend_available().await && SessionBackend.exists(&site.name).await;
    let in_group = state.group().running(&site.name);
    let (status, mode) = if in_session {
        ("running", Some(RunMode::Session.as_str()))
    } else if in_group {
        ("running", Some(RunMode::Background.as_str()))
    } else {
        ("stopped", None)
    };
    SiteStatus {
        name: site.name.clone(),
        status,
        mode,
        port: site.port,
        cwd: site.cwd.display().to_string(),
        cmd: site.cmd.clone(),
        log: site.log_path().display().to_string(),
    }
}

pub async fn status_all(state: &ManagerState) -> Vec<SiteStatus> {
    let cfg = state.snapshot();
    let mut out = Vec::with_capacity(cfg.sites.len());
    for site in &cfg.sites {
        out.push(site_status(state, site).await);
    }
    out
}

/// Stop routing: a live session is stopped as a session; everything else
/// falls through to the process-group path, which also handles stale records.
async fn stop_dispatch(state: &ManagerState, name: &str) -> Result<String, OpError> {
    if let Backend::Session(s) = Backend::select(&state.pid_dir).await {
        if s.exists(name).await {
            return s.stop(name).await;
        }
    }
    state.group().stop(name)
}

async fn start_fresh(state: &ManagerState, site: &Site) -> Result<String, OpError> {
    Backend::select(&state.pid_dir)
        .await
        .start(&site.name, &site.cwd, &site.cmd, &site.log_path())
        .await
}

pub async fn start_site(state: &ManagerState, name: &str) -> Result<String, OpError> {
    let cfg = state.snapshot();
    let site = cfg
        .site(name)
        .ok_or_else(|| OpError::SiteNotFound(name.to_string()))?;
    let msg = match Backend::select(&state.pid_dir).await {
        Backend::Session(s) => {
            if s.exists(name).await {
                format!("{name} already running in tmux")
            } else {
                s.start(name, &site.cwd, &site.cmd, &site.log_path()).await?
            }
        }
        Backend::Group(g) => g.start(name, &site.cwd, &site.cmd, &site.log_path()).await?,
    };
    sm_event(state, "action", name, &msg);
    Ok(msg)
}

pub async fn stop_site(state: &ManagerState, name: &str) -> Result<String, OpError> {
    let cfg = state.snapshot();
    cfg.site(name)
        .ok_or_else(|| OpError::SiteNotFound(name.to_string()))?;
    let msg = stop_dispatch(state, name).await?;
    sm_event(state, "action", name, &msg);
    Ok(msg)
}

/// Stop, give the group a moment to die, start again. The start side does not
/// re-check for a leftover session, so a survivor surfaces as a duplicate.
pub async fn restart_site(state: &ManagerState, name: &str) -> Result<String, OpError> {
    let cfg = state.snapshot();
    let site = cfg
        .site(name)
        .ok_or_else(|| OpError::SiteNotFound(name.to_string()))?;
    stop_dispatch(state, name).await?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let msg = start_fresh(state, site).await?;
    sm_event(state, "action", name, &msg);
    Ok(msg)
}

pub async fn run_action(state: &ManagerState, name: &str, op: &str) -> Result<String, OpError> {
    if state.snapshot().site(name).is_none() {
        return Err(OpError::SiteNotFound(name.to_string()));
    }
    match op {
        "start" => start_site(state, name).await,
        "stop" => stop_site(state, name).await,
        "restart" => restart_site(state, name).await,
        other => Err(OpError::UnknownOp(other.to_string())),
    }
}

pub fn tail_site(state: &ManagerState, name: &str, n: usize) -> Result<Vec<String>, OpError> {
    let cfg = state.snapshot();
    let site = cfg
        .site(name)
        .ok_or_else(|| OpError::SiteNotFound(name.to_string()))?;
    Ok(logtail::tail_lines(&site.log_path(), n))
}

/// Form payload for adding a site. The console posts every field; the flag
/// fields carry "true"/"false" strings.
#[derive(Debug, Clone, Deserialize)]
pub struct AddSiteRequest {
    pub name: String,
    pub cwd: String,
    pub cmd: String,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub log: String,
    #[serde(default)]
    pub autostart: String,
    #[serde(default)]
    pub autorestart: String,
    #[serde(default)]
    pub start_after_add: String,
}

fn flag(s: &str) -> bool {
    s.eq_ignore_ascii_case("true")
}

/// Validate, persist to disk read-modify-write, install the new snapshot,
/// then optionally start. Validation order is fixed: name, duplicate, cwd,
/// cmd, port.
pub async fn add_site(state: &ManagerState, req: &AddSiteRequest) -> Result<String, OpError> {
    let name = req.name.as_str();
    if name.is_empty() || name.chars().any(|c| "/\\ \t\n\r".contains(c)) {
        return Err(OpError::InvalidName(name.to_string()));
    }
    if state.snapshot().site(name).is_some() {
        return Err(OpError::DuplicateSite(name.to_string()));
    }
    if req.cwd.is_empty() || !Path::new(&req.cwd).exists() {
        return Err(OpError::InvalidWorkingDirectory(format!(
            "CWD does not exist: {}",
            req.cwd
        )));
    }
    if req.cmd.is_empty() {
        return Err(OpError::EmptyCommand);
    }
    let port = match req.port.trim() {
        "" => None,
        v => Some(
            v.parse::<u16>()
                .map_err(|_| OpError::InvalidPort(v.to_string()))?,
        ),
    };
    let site = Site {
        name: name.to_string(),
        cwd: PathBuf::from(&req.cwd),
        cmd: req.cmd.clone(),
        port,
        log: if req.log.is_empty() {
            config::DEFAULT_LOG_FILE.to_string()
        } else {
            req.log.clone()
        },
        autostart: flag(&req.autostart),
        autorestart: flag(&req.autorestart),
    };

    let mut cfg = config::load_or_create(&state.config_path)?;
    cfg.sites.push(site.clone());
    config::write_atomic(&state.config_path, &cfg)?;
    state.install(cfg);

    if flag(&req.start_after_add) {
        match Backend::select(&state.pid_dir).await {
            Backend::Session(s) => {
                if !s.exists(name).await {
                    s.start(name, &site.cwd, &site.cmd, &site.log_path()).await?;
                }
            }
            Backend::Group(g) => {
                g.start(name, &site.cwd, &site.cmd, &site.log_path()).await?;
            }
        }
    }

    let msg = if flag(&req.start_after_add) {
        format!("Added site {name} and started")
    } else {
        format!("Added site {name}")
    };
    sm_event(state, "action", name, &msg);
    Ok(msg)
}

/// Stop first (errors abort the delete), then drop the site from the on-disk
/// config and clear any leftover run record.
pub async fn delete_site(state: &ManagerState, name: &str) -> Result<String, OpError> {
    let cfg = state.snapshot();
    cfg.site(name)
        .ok_or_else(|| OpError::SiteNotFound(name.to_string()))?;
    stop_dispatch(state, name).await?;

    let mut cfg = config::load_or_create(&state.config_path)?;
    cfg.sites.retain(|s| s.name != name);
    config::write_atomic(&state.config_path, &cfg)?;
    state.install(cfg);
    state.group().clear_record(name);

    let msg = format!("Deleted site {name}");
    sm_event(state, "action", name, &msg);
    Ok(msg)
}

pub fn reload_config(state: &ManagerState) -> Result<String, OpError> {
    state.reload()?;
    sm_event(state, "daemon", "-", "Config reloaded");
    Ok("Config reloaded".to_string())
}

pub const WATCHDOG_STARTUP_DELAY: Duration = Duration::from_secs(1);
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(3);

/// One reconcile pass: revive every site that wants to run but is not.
/// A failure on one site never blocks the rest of the pass.
pub async fn reconcile_once(state: &ManagerState) {
    let cfg = state.snapshot();
    for site in &cfg.sites {
        if state.shutting_down.load(Ordering::Relaxed) {
            return;
        }
        if !(site.autostart || site.autorestart) {
            continue;
        }
        if site_running(state, &site.name).await {
            continue;
        }
        match watchdog_start(state, site).await {
            Ok(msg) => sm_event(state, "watchdog", &site.name, &msg),
            Err(e) => sm_event(state, "watchdog", &site.name, &format!("revive failed: {e}")),
        }
    }
}

async fn site_running(state: &ManagerState, name: &str) -> bool {
    (backend::session_backend_available().await && SessionBackend.exists(name).await)
        || state.group().running(name)
}

/// Watchdog start prefers a session but falls back to a plain process group
/// when the session start fails.
async fn watchdog_start(state: &ManagerState, site: &Site) -> Result<String, OpError> {
    let logfile = site.log_path();
    match Backend::select(&state.pid_dir).await {
        Backend::Session(s) => match s.start(&site.name, &site.cwd, &site.cmd, &logfile).await {
            Ok(msg) => Ok(msg),
            Err(_) => {
                state
                    .group()
                    .start(&site.name, &site.cwd, &site.cmd, &logfile)
                    .await
            }
        },
        Backend::Group(g) => g.start(&site.name, &site.cwd, &site.cmd, &logfile).await,
    }
}

pub fn start_watchdog_thread(state: Arc<ManagerState>) {
    tasks().spawn(async move {
        tokio::time::sleep(WATCHDOG_STARTUP_DELAY).await;
        while !state.shutting_down.load(Ordering::Relaxed) {
            reconcile_once(&state).await;
            // Interval sliced so shutdown is honored promptly.
            let mut waited = Duration::ZERO;
            while waited < WATCHDOG_INTERVAL && !state.shutting_down.load(Ordering::Relaxed) {
                tokio::time::sleep(Duration::from_millis(200)).await;
                waited += Duration::from_millis(200);
            }
        }
    });
}

pub fn start_signal_listener(state: Arc<ManagerState>) {
    tasks().spawn(async move {
        let mut term = signal(SignalKind::terminate()).expect("SIGTERM handler");
        let mut int = signal(SignalKind::interrupt()).expect("SIGINT handler");
        tokio::select! {
            _ = term.recv() => sm_event(&state, "daemon", "-", "SIGTERM received, shutting down"),
            _ = int.recv() => sm_event(&state, "daemon", "-", "SIGINT received, shutting down"),
        }
        state.shutting_down.store(true, Ordering::SeqCst);
    });
}

/// Boot the supervisor and serve the console until shutdown. Managed sites
/// are deliberately left running on exit.
pub async fn run_async(
    bind: &str,
    base_dir: Option<&Path>,
    pid_dir: Option<&Path>,
) -> Result<()> {
    let base_dir = config::resolve_base_dir(base_dir);
    let pid_dir = config::resolve_pid_dir(pid_dir);
    std::fs::create_dir_all(&pid_dir)
        .with_context(|| format!("creating pid dir {}", pid_dir.display()))?;
    let cfg = config::load_or_create(&config::config_path(&base_dir))?;
    let state = ManagerState::new(base_dir, pid_dir, cfg);

    sm_event(&state, "daemon", "-", &build_info::banner());
    sm_event(
        &state,
        "daemon",
        "-",
        &format!("Loaded config from {}", state.config_path.display()),
    );
    let names: Vec<String> = state
        .snapshot()
        .sites
        .iter()
        .map(|s| s.name.clone())
        .collect();
    sm_event(&state, "daemon", "-", &format!("Sites: {names:?}"));
    sm_event(
        &state,
        "daemon",
        "-",
        &format!(
            "tmux available: {}",
            backend::session_backend_available().await
        ),
    );

    start_watchdog_thread(state.clone());
    start_signal_listener(state.clone());
    web_console::serve(bind, state.clone()).await?;

    state.shutting_down.store(true, Ordering::SeqCst);
    let remaining = tasks().drain(Duration::from_secs(5)).await;
    if remaining > 0 {
        sm_event(
            &state,
            "daemon",
            "-",
            &format!("{remaining} background tasks still active at exit"),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> (tempfile::TempDir, Arc<ManagerState>) {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base");
        let pids = dir.path().join("pids");
        std::fs::create_dir_all(&base).unwrap();
        std::fs::create_dir_all(&pids).unwrap();
        let cfg = config::load_or_create(&config::config_path(&base)).unwrap();
        (dir, ManagerState::new(base, pids, cfg))
    }

    fn add_req(name: &str, cwd: &str, cmd: &str) -> AddSiteRequest {
        AddSiteRequest {
            name: name.to_string(),
            cwd: cwd.to_string(),
            cmd: cmd.to_string(),
            port: String::new(),
            log: String::new(),
            autostart: String::new(),
            autorestart: String::new(),
            start_after_add: String::new(),
        }
    }

    fn test_site(name: &str, cwd: PathBuf, cmd: &str, autostart: bool) -> Site {
        Site {
            name: name.to_string(),
            cwd,
            cmd: cmd.to_string(),
            port: None,
            log: config::DEFAULT_LOG_FILE.to_string(),
            autostart,
            autorestart: false,
        }
    }

    #[test]
    fn op_error_messages_match_wire_text() {
        assert_eq!(OpError::SiteNotFound("x".into()).to_string(), "Site not found");
        assert_eq!(
            OpError::InvalidName("a b".into()).to_string(),
            "Invalid name (no spaces or slashes)."
        );
        assert_eq!(
            OpError::DuplicateSite("x".into()).to_string(),
            "A site with that name already exists."
        );
        assert_eq!(OpError::EmptyCommand.to_string(), "Command cannot be empty.");
        assert_eq!(OpError::InvalidPort("http".into()).to_string(), "Invalid port: http");
        assert_eq!(OpError::UnknownOp("bounce".into()).to_string(), "Unknown op");
    }

    #[tokio::test]
    async fn add_validates_then_persists() {
        let (dir, state) = test_state();
        let cwd = dir.path().join("app");
        std::fs::create_dir_all(&cwd).unwrap();
        let cwd_s = cwd.display().to_string();

        let e = add_site(&state, &add_req("has space", &cwd_s, "run")).await.unwrap_err();
        assert_eq!(e.to_string(), "Invalid name (no spaces or slashes).");

        let e = add_site(&state, &add_req("add-sm-test", "/definitely/missing/dir", "run"))
            .await
            .unwrap_err();
        assert_eq!(e.to_string(), "CWD does not exist: /definitely/missing/dir");

        let e = add_site(&state, &add_req("add-sm-test", &cwd_s, "")).await.unwrap_err();
        assert_eq!(e.to_string(), "Command cannot be empty.");

        let mut bad_port = add_req("add-sm-test", &cwd_s, "python3 app.py");
        bad_port.port = "http".to_string();
        let e = add_site(&state, &bad_port).await.unwrap_err();
        assert_eq!(e.to_string(), "Invalid port: http");

        let msg = add_site(&state, &add_req("add-sm-test", &cwd_s, "python3 app.py"))
            .await
            .unwrap();
        assert_eq!(msg, "Added site add-sm-test");
        assert!(state.snapshot().site("add-sm-test").is_some());

        let on_disk = config::load_or_create(&state.config_path).unwrap();
        assert_eq!(on_disk.sites.len(), 1);
        assert_eq!(on_disk.sites[0].log, "activity.log");
        assert!(!on_disk.sites[0].autostart);

        let e = add_site(&state, &add_req("add-sm-test", &cwd_s, "x")).await.unwrap_err();
        assert_eq!(e.to_string(), "A site with that name already exists.");
    }

    #[tokio::test]
    async fn delete_removes_site_and_record() {
        let (dir, state) = test_state();
        let cwd = dir.path().join("app");
        std::fs::create_dir_all(&cwd).unwrap();
        add_site(&state, &add_req("del-sm-test", &cwd.display().to_string(), "run"))
            .await
            .unwrap();
        std::fs::write(state.group().pid_file("del-sm-test"), "stale").unwrap();

        let msg = delete_site(&state, "del-sm-test").await.unwrap();
        assert_eq!(msg, "Deleted site del-sm-test");
        assert!(state.snapshot().site("del-sm-test").is_none());
        assert!(!state.group().pid_file("del-sm-test").exists());

        let e = delete_site(&state, "del-sm-test").await.unwrap_err();
        assert_eq!(e.to_string(), "Site not found");
    }

    #[tokio::test]
    async fn stop_without_running_process_reports_no_pid() {
        let (dir, state) = test_state();
        let cwd = dir.path().join("app");
        std::fs::create_dir_all(&cwd).unwrap();
        add_site(&state, &add_req("idle-sm-test", &cwd.display().to_string(), "run"))
            .await
            .unwrap();

        let msg = stop_site(&state, "idle-sm-test").await.unwrap();
        assert_eq!(msg, "No pid for idle-sm-test");
    }

    #[tokio::test]
    async fn action_requires_known_site_then_known_op() {
        let (dir, state) = test_state();
        let e = run_action(&state, "nope", "start").await.unwrap_err();
        assert_eq!(e.to_string(), "Site not found");

        let cwd = dir.path().join("app");
        std::fs::create_dir_all(&cwd).unwrap();
        add_site(&state, &add_req("ops-sm-test", &cwd.display().to_string(), "run"))
            .await
            .unwrap();
        let e = run_action(&state, "ops-sm-test", "bounce").await.unwrap_err();
        assert_eq!(e.to_string(), "Unknown op");
    }

    #[tokio::test]
    async fn status_reports_stopped_site_shape() {
        let (dir, state) = test_state();
        let cwd = dir.path().join("app");
        std::fs::create_dir_all(&cwd).unwrap();
        let mut req = add_req("shape-sm-test", &cwd.display().to_string(), "python3 app.py");
        req.port = "8080".to_string();
        add_site(&state, &req).await.unwrap();

        let all = status_all(&state).await;
        assert_eq!(all.len(), 1);
        let s = &all[0];
        assert_eq!(s.status, "stopped");
        assert_eq!(s.mode, None);
        assert_eq!(s.port, Some(8080));
        assert!(s.log.ends_with("activity.log"));

        let json = serde_json::to_value(s).unwrap();
        assert!(json["mode"].is_null());
        assert_eq!(json["status"], "stopped");
        assert_eq!(json["port"], 8080);
    }

    #[tokio::test]
    async fn restart_starts_a_stopped_site() {
        let (dir, state) = test_state();
        let cwd = dir.path().join("app");
        std::fs::create_dir_all(&cwd).unwrap();
        add_site(&state, &add_req("rs-sm-test", &cwd.display().to_string(), "true"))
            .await
            .unwrap();

        let msg = restart_site(&state, "rs-sm-test").await.unwrap();
        assert!(msg.starts_with("Started rs-sm-test"), "unexpected: {msg}");
        // The command exits on its own; clear whatever record is left.
        let _ = state.group().stop("rs-sm-test");
    }

    #[tokio::test]
    async fn watchdog_isolates_per_site_failures() {
        let (dir, state) = test_state();
        let good_cwd = dir.path().join("good");
        std::fs::create_dir_all(&good_cwd).unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "plain file").unwrap();

        // First site can never start: its cwd sits under a regular file.
        let mut cfg = (*state.snapshot()).clone();
        cfg.sites.push(test_site("wd-bad-sm-test", blocker.join("sub"), "true", true));
        cfg.sites.push(test_site("wd-good-sm-test", good_cwd, "true", true));
        state.install(cfg);

        reconcile_once(&state).await;

        let ev = state.events_snapshot();
        assert!(
            ev.iter()
                .any(|e| e.site == "wd-bad-sm-test" && e.message.contains("revive failed")),
            "missing failure event: {ev:?}"
        );
        assert!(
            ev.iter()
                .any(|e| e.site == "wd-good-sm-test" && e.message.starts_with("Started")),
            "missing revive event: {ev:?}"
        );
        let _ = state.group().stop("wd-good-sm-test");
    }

    #[tokio::test]
    async fn watchdog_leaves_unflagged_sites_alone() {
        let (dir, state) = test_state();
        let cwd = dir.path().join("app");
        std::fs::create_dir_all(&cwd).unwrap();
        let mut cfg = (*state.snapshot()).clone();
        cfg.sites.push(test_site("wd-off-sm-test", cwd, "true", false));
        state.install(cfg);

        reconcile_once(&state).await;

        assert!(state
            .events_snapshot()
            .iter()
            .all(|e| e.component != "watchdog"));
        assert!(!state.group().pid_file("wd-off-sm-test").exists());
    }

    #[test]
    fn reload_picks_up_disk_edits() {
        let (_dir, state) = test_state();
        let mut cfg = config::load_or_create(&state.config_path).unwrap();
        cfg.sites
            .push(test_site("rl-sm-test", std::env::temp_dir(), "true", false));
        config::write_atomic(&state.config_path, &cfg).unwrap();

        assert!(state.snapshot().site("rl-sm-test").is_none());
        assert_eq!(reload_config(&state).unwrap(), "Config reloaded");
        assert!(state.snapshot().site("rl-sm-test").is_some());
    }

    #[test]
    fn event_ring_is_capped() {
        let (_dir, state) = test_state();
        for i in 0..(EVENT_RING_CAP + 50) {
            sm_event(&state, "test", "-", &format!("m{i}"));
        }
        let ev = state.events_snapshot();
        assert_eq!(ev.len(), EVENT_RING_CAP);
        assert_eq!(ev[0].message, "m50");
    }
}
