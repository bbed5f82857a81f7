use crate::sm::daemon::OpError;
use anyhow::anyhow;
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{getpgid, Pid};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// How a running site is being controlled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Session,
    Background,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Session => "session",
            RunMode::Background => "background",
        }
    }
}

/// True iff the tmux binary is installed and invocable. Probed fresh on every
/// call so an install/uninstall is picked up immediately.
pub async fn session_backend_available() -> bool {
    match Command::new("tmux")
        .arg("-V")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(st) => st.success(),
        Err(_) => false,
    }
}

/// The two control strategies behind one surface. `select` re-probes
/// availability per call; everything that starts/stops a site goes through it.
#[derive(Debug, Clone)]
pub enum Backend {
    Session(SessionBackend),
    Group(GroupBackend),
}

impl Backend {
    pub async fn select(pid_dir: &Path) -> Backend {
        if session_backend_available().await {
            Backend::Session(SessionBackend)
        } else {
            Backend::Group(GroupBackend::new(pid_dir.to_path_buf()))
        }
    }

    pub fn mode(&self) -> RunMode {
        match self {
            Backend::Session(_) => RunMode::Session,
            Backend::Group(_) => RunMode::Background,
        }
    }

    pub async fn start(
        &self,
        name: &str,
        cwd: &Path,
        cmd: &str,
        logfile: &Path,
    ) -> Result<String, OpError> {
        match self {
            Backend::Session(s) => s.start(name, cwd, cmd, logfile).await,
            Backend::Group(g) => g.start(name, cwd, cmd, logfile).await,
        }
    }
}

/// Runs each site inside a detached tmux session named after it.
#[derive(Debug, Clone, Copy)]
pub struct SessionBackend;

impl SessionBackend {
    /// Query errors (tool missing, no such session) are "does not exist".
    pub async fn exists(&self, name: &str) -> bool {
        match Command::new("tmux")
            .args(["has-session", "-t", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(st) => st.success(),
            Err(_) => false,
        }
    }

    /// Callers check `exists` first; colliding with a live session is an error.
    pub async fn start(
        &self,
        name: &str,
        cwd: &Path,
        cmd: &str,
        logfile: &Path,
    ) -> Result<String, OpError> {
        if !cwd.exists() {
            return Err(OpError::InvalidWorkingDirectory(format!(
                "CWD does not exist: {}",
                cwd.display()
            )));
        }
        let full = format!(
            "bash -lc '{}'",
            shell_wrapper(&wrap_unbuffered(cmd).await, logfile)
        );
        let out = Command::new("tmux")
            .args(["new-session", "-d", "-s", name, "-c"])
            .arg(cwd)
            .arg(&full)
            .output()
            .await
            .map_err(|e| OpError::Internal(anyhow!("failed to run tmux new-session: {e}")))?;
        if !out.status.success() {
            let err = String::from_utf8_lossy(&out.stderr).trim().to_string();
            if err.contains("duplicate session") {
                return Err(OpError::DuplicateSession(name.to_string()));
            }
            return Err(OpError::Internal(anyhow!(
                "tmux new-session -s {name} failed: {err}"
            )));
        }
        Ok(format!("Started {name} in tmux"))
    }

    /// Synchronous from the caller's view: tmux kill-session returns once the
    /// session is gone.
    pub async fn stop(&self, name: &str) -> Result<String, OpError> {
        if !self.exists(name).await {
            return Ok(format!("Session {name} not running"));
        }
        let out = Command::new("tmux")
            .args(["kill-session", "-t", name])
            .output()
            .await
            .map_err(|e| OpError::Internal(anyhow!("failed to run tmux kill-session: {e}")))?;
        if !out.status.success() {
            return Err(OpError::Internal(anyhow!(
                "tmux kill-session -t {name} failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(format!("Stopped {name}"))
    }
}

/// Runs each site as a detached process-group leader, tracked by a pid file.
#[derive(Debug, Clone)]
pub struct GroupBackend {
    pid_dir: PathBuf,
}

impl GroupBackend {
    pub fn new(pid_dir: PathBuf) -> Self {
        Self { pid_dir }
    }

    pub fn pid_file(&self, name: &str) -> PathBuf {
        self.pid_dir.join(format!("{name}.pid"))
    }

    fn recorded_pid(&self, name: &str) -> Option<i32> {
        let raw = std::fs::read_to_string(self.pid_file(name)).ok()?;
        raw.trim().parse::<i32>().ok()
    }

    /// Zero-signal probe against the recorded pid. Absent/unparseable records
    /// and probe failures are all "not running"; a stale record is tolerated
    /// here, not deleted.
    pub fn running(&self, name: &str) -> bool {
        match self.recorded_pid(name) {
            Some(pid) => kill(Pid::from_raw(pid), None).is_ok(),
            None => false,
        }
    }

    /// Weaker precondition than the session backend: a missing cwd is created.
    pub async fn start(
        &self,
        name: &str,
        cwd: &Path,
        cmd: &str,
        logfile: &Path,
    ) -> Result<String, OpError> {
        std::fs::create_dir_all(cwd)
            .map_err(|e| OpError::Internal(anyhow!("failed to create {}: {e}", cwd.display())))?;
        if self.running(name) {
            let pid = self.recorded_pid(name).unwrap_or_default();
            return Ok(format!("{name} already running (pid {pid})"));
        }
        let inner = shell_wrapper(&wrap_unbuffered(cmd).await, logfile);
        let mut command = Command::new("bash");
        command
            .arg("-lc")
            .arg(&inner)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        unsafe {
            command.pre_exec(|| {
                // New session + process group, detached from any controlling
                // terminal, so the whole pipeline can be signaled as one group.
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let child = command
            .spawn()
            .map_err(|e| OpError::Internal(anyhow!("failed to spawn {name}: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| OpError::Internal(anyhow!("spawned {name} but no pid available")))?;
        // The child is a session leader now; dropping the handle leaves it
        // running and tokio reaps it whenever it exits.
        std::fs::write(self.pid_file(name), pid.to_string()).map_err(|e| {
            OpError::Internal(anyhow!(
                "failed to write {}: {e}",
                self.pid_file(name).display()
            ))
        })?;
        Ok(format!("Started {name} (pid {pid})"))
    }

    /// SIGTERM the whole group. The run record is removed on every outcome so
    /// a stale record can never stick around.
    pub fn stop(&self, name: &str) -> Result<String, OpError> {
        let pf = self.pid_file(name);
        if !pf.exists() {
            return Ok(format!("No pid for {name}"));
        }
        let raw = std::fs::read_to_string(&pf).unwrap_or_default();
        let Ok(pid) = raw.trim().parse::<i32>() else {
            let _ = std::fs::remove_file(&pf);
            return Ok(format!("Invalid pid file removed for {name}"));
        };
        let r = getpgid(Some(Pid::from_raw(pid))).and_then(|pgid| killpg(pgid, Signal::SIGTERM));
        let _ = std::fs::remove_file(&pf);
        match r {
            Ok(()) => Ok(format!("Stopped {name} (pid {pid})")),
            Err(Errno::ESRCH) => Ok(format!("Process not found. Cleared pid for {name}")),
            Err(e) => Ok(format!("Failed to stop {name}: {e}")),
        }
    }

    /// Best-effort record removal (site deletion).
    pub fn clear_record(&self, name: &str) {
        let _ = std::fs::remove_file(self.pid_file(name));
    }
}

/// `export PYTHONUNBUFFERED=1; [stdbuf -oL -eL] <cmd>`: line-buffered output
/// so the log file fills as the site prints, not on exit.
pub async fn wrap_unbuffered(cmd: &str) -> String {
    let prefix = "export PYTHONUNBUFFERED=1; ";
    match which("stdbuf").await {
        Some(stdbuf) => format!("{prefix}{stdbuf} -oL -eL {cmd}"),
        None => format!("{prefix}{cmd}"),
    }
}

fn shell_wrapper(wrapped: &str, logfile: &Path) -> String {
    format!("{wrapped} 2>&1 | tee -a {}", logfile.display())
}

async fn which(tool: &str) -> Option<String> {
    let out = Command::new("bash")
        .arg("-lc")
        .arg(format!("command -v {tool} || true"))
        .output()
        .await
        .ok()?;
    let s = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if s.is_empty() { None } else { Some(s) }
}
