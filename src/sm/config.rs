use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "config.json";
pub const DEFAULT_PID_DIR: &str = "/tmp/pisite_pids";
pub const DEFAULT_LOG_FILE: &str = "activity.log";

/// One managed site: a named long-running command plus where to run it and
/// where its merged stdout/stderr lands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Site {
    pub name: String,
    pub cwd: PathBuf,
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default = "default_log")]
    pub log: String,
    #[serde(default)]
    pub autostart: bool,
    #[serde(default)]
    pub autorestart: bool,
}

fn default_log() -> String {
    DEFAULT_LOG_FILE.to_string()
}

impl Site {
    /// Resolved log file path. An absolute `log` stands alone; a relative one
    /// is rooted at the site's working directory.
    pub fn log_path(&self) -> PathBuf {
        self.cwd.join(&self.log)
    }
}

/// Credentials for the web console. Empty strings count as unconfigured;
/// with nothing configured the console is open.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl AuthConfig {
    pub fn username(&self) -> Option<&str> {
        nonempty(self.username.as_deref())
    }

    pub fn password(&self) -> Option<&str> {
        nonempty(self.password.as_deref())
    }

    pub fn token(&self) -> Option<&str> {
        nonempty(self.token.as_deref())
    }
}

fn nonempty(v: Option<&str>) -> Option<&str> {
    v.filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManagerConfig {
    #[serde(default)]
    pub sites: Vec<Site>,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl ManagerConfig {
    /// The config written on first boot when no file exists yet.
    pub fn bootstrap() -> Self {
        Self {
            sites: vec![],
            auth: AuthConfig {
                username: Some("admin".to_string()),
                password: Some("password".to_string()),
                token: None,
            },
        }
    }

    pub fn site(&self, name: &str) -> Option<&Site> {
        self.sites.iter().find(|s| s.name == name)
    }
}

/// Base directory precedence: CLI flag, then PSM_BASE_DIR, then the working directory.
pub fn resolve_base_dir(cli: Option<&Path>) -> PathBuf {
    if let Some(p) = cli {
        return p.to_path_buf();
    }
    if let Some(p) = env_nonempty("PSM_BASE_DIR") {
        return PathBuf::from(p);
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Pid directory precedence: CLI flag, then PSM_PID_DIR, then /tmp/pisite_pids.
pub fn resolve_pid_dir(cli: Option<&Path>) -> PathBuf {
    if let Some(p) = cli {
        return p.to_path_buf();
    }
    if let Some(p) = env_nonempty("PSM_PID_DIR") {
        return PathBuf::from(p);
    }
    PathBuf::from(DEFAULT_PID_DIR)
}

pub fn config_path(base_dir: &Path) -> PathBuf {
    base_dir.join(CONFIG_FILE_NAME)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

/// Read the config file, bootstrapping it if missing, then apply PSM_* auth overrides.
pub fn load_or_create(path: &Path) -> anyhow::Result<ManagerConfig> {
    if !path.exists() {
        write_atomic(path, &ManagerConfig::bootstrap())?;
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", path.display()))?;
    let mut cfg: ManagerConfig = serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", path.display()))?;
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

fn apply_env_overrides(cfg: &mut ManagerConfig) {
    apply_auth_overrides(
        cfg,
        env_nonempty("PSM_USERNAME"),
        env_nonempty("PSM_PASSWORD"),
        env_nonempty("PSM_TOKEN"),
    );
}

fn apply_auth_overrides(
    cfg: &mut ManagerConfig,
    username: Option<String>,
    password: Option<String>,
    token: Option<String>,
) {
    if username.is_some() {
        cfg.auth.username = username;
    }
    if password.is_some() {
        cfg.auth.password = password;
    }
    if token.is_some() {
        cfg.auth.token = token;
    }
}

/// Crash-atomic replace: write `config.json.tmp`, fsync, rotate the live file to
/// `config.json.bak`, rename the tmp into place. A crash at any step leaves
/// either the old or the fully written new version readable.
pub fn write_atomic(path: &Path, cfg: &ManagerConfig) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(cfg)
        .map_err(|e| anyhow::anyhow!("failed to serialize config: {e}"))?;
    let tmp = path.with_extension("json.tmp");
    let bak = path.with_extension("json.bak");

    let mut f = std::fs::File::create(&tmp)
        .map_err(|e| anyhow::anyhow!("failed to create {}: {e}", tmp.display()))?;
    f.write_all(json.as_bytes())
        .map_err(|e| anyhow::anyhow!("failed to write {}: {e}", tmp.display()))?;
    f.sync_all()
        .map_err(|e| anyhow::anyhow!("failed to fsync {}: {e}", tmp.display()))?;
    drop(f);

    if path.exists() {
        std::fs::rename(path, &bak)
            .map_err(|e| anyhow::anyhow!("failed to rotate {}: {e}", bak.display()))?;
    }
    std::fs::rename(&tmp, path)
        .map_err(|e| anyhow::anyhow!("failed to install {}: {e}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_written_on_first_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = config_path(dir.path());
        let cfg = load_or_create(&path).unwrap();
        assert!(cfg.sites.is_empty());
        // The on-disk bootstrap names admin/password regardless of env overrides.
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"admin\""));
        assert!(raw.contains("\"password\""));
    }

    #[test]
    fn replace_rotates_backup_and_keeps_live_parseable() {
        let dir = tempfile::tempdir().unwrap();
        let path = config_path(dir.path());
        let old = ManagerConfig::bootstrap();
        write_atomic(&path, &old).unwrap();

        let mut new = old.clone();
        new.sites.push(Site {
            name: "blog".to_string(),
            cwd: dir.path().to_path_buf(),
            cmd: "python3 app.py".to_string(),
            port: Some(49152),
            log: default_log(),
            autostart: true,
            autorestart: false,
        });
        write_atomic(&path, &new).unwrap();

        let live: ManagerConfig =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(live.sites.len(), 1);
        assert_eq!(live.sites[0].name, "blog");

        let bak = path.with_extension("json.bak");
        let prev: ManagerConfig =
            serde_json::from_str(&std::fs::read_to_string(&bak).unwrap()).unwrap();
        assert!(prev.sites.is_empty());

        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn missing_auth_block_means_open_access() {
        let cfg: ManagerConfig = serde_json::from_str(r#"{"sites": []}"#).unwrap();
        assert!(cfg.auth.username().is_none());
        assert!(cfg.auth.password().is_none());
        assert!(cfg.auth.token().is_none());
    }

    #[test]
    fn empty_auth_strings_count_as_unconfigured() {
        let cfg: ManagerConfig =
            serde_json::from_str(r#"{"sites": [], "auth": {"username": "", "password": ""}}"#)
                .unwrap();
        assert!(cfg.auth.username().is_none());
        assert!(cfg.auth.password().is_none());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let top: Result<ManagerConfig, _> = serde_json::from_str(r#"{"sites": [], "sitez": []}"#);
        assert!(top.is_err());
        let nested: Result<ManagerConfig, _> = serde_json::from_str(
            r#"{"sites": [{"name": "a", "cwd": "/srv/a", "cmd": "true", "restart": "always"}]}"#,
        );
        assert!(nested.is_err());
    }

    #[test]
    fn auth_overrides_take_precedence() {
        let mut cfg = ManagerConfig::bootstrap();
        apply_auth_overrides(&mut cfg, Some("ops".into()), None, Some("t0k3n".into()));
        assert_eq!(cfg.auth.username(), Some("ops"));
        assert_eq!(cfg.auth.password(), Some("password"));
        assert_eq!(cfg.auth.token(), Some("t0k3n"));
    }

    #[test]
    fn log_path_resolution() {
        let rel = Site {
            name: "a".into(),
            cwd: "/srv/a".into(),
            cmd: "true".into(),
            port: None,
            log: "activity.log".into(),
            autostart: false,
            autorestart: false,
        };
        assert_eq!(rel.log_path(), PathBuf::from("/srv/a/activity.log"));

        let abs = Site { log: "/var/log/a.log".into(), ..rel };
        assert_eq!(abs.log_path(), PathBuf::from("/var/log/a.log"));
    }

    #[test]
    fn base_and_pid_dir_cli_precedence() {
        assert_eq!(
            resolve_base_dir(Some(Path::new("/srv/mgr"))),
            PathBuf::from("/srv/mgr")
        );
        assert_eq!(
            resolve_pid_dir(Some(Path::new("/run/mgr"))),
            PathBuf::from("/run/mgr")
        );
    }
}
