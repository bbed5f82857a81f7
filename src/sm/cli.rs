use crate::sm::config;
use crate::sm::daemon::{self, ManagerState};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(
    name = "sitemaster",
    version,
    about = "Web-managed supervisor for long-running site processes"
)]
pub struct Args {
    /// Address the web console listens on.
    #[arg(long, default_value = "0.0.0.0:8000")]
    pub bind: String,

    /// Directory holding config.json. Takes precedence over PSM_BASE_DIR.
    #[arg(long)]
    pub base_dir: Option<PathBuf>,

    /// Directory for background run records. Takes precedence over PSM_PID_DIR.
    #[arg(long)]
    pub pid_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Option<Cmd>,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Run the supervisor and web console (the default).
    Serve,
    /// Start one site.
    Start { name: String },
    /// Stop one site.
    Stop { name: String },
    /// Restart one site.
    Restart { name: String },
    /// Show the status of every configured site.
    Status {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Print the last lines of a site's log file.
    Logs {
        name: String,
        #[arg(short = 'n', long, default_value_t = 200)]
        lines: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

pub async fn run() -> Result<()> {
    let args = Args::parse();
    match args.cmd.unwrap_or(Cmd::Serve) {
        Cmd::Serve => {
            daemon::run_async(&args.bind, args.base_dir.as_deref(), args.pid_dir.as_deref())
                .await
        }
        cmd => {
            let state = local_state(args.base_dir.as_deref(), args.pid_dir.as_deref())?;
            match cmd {
                Cmd::Start { name } => println!("{}", daemon::start_site(&state, &name).await?),
                Cmd::Stop { name } => println!("{}", daemon::stop_site(&state, &name).await?),
                Cmd::Restart { name } => {
                    println!("{}", daemon::restart_site(&state, &name).await?)
                }
                Cmd::Status { format } => print_status(&state, format).await?,
                Cmd::Logs { name, lines } => {
                    for line in daemon::tail_site(&state, &name, lines)? {
                        println!("{line}");
                    }
                }
                Cmd::Serve => {}
            }
            Ok(())
        }
    }
}

/// One-shot commands act on the same disk and OS state the serving supervisor
/// uses, so they need no connection to it.
fn local_state(base_dir: Option<&Path>, pid_dir: Option<&Path>) -> Result<Arc<ManagerState>> {
    let base_dir = config::resolve_base_dir(base_dir);
    let pid_dir = config::resolve_pid_dir(pid_dir);
    std::fs::create_dir_all(&pid_dir)
        .with_context(|| format!("creating pid dir {}", pid_dir.display()))?;
    let cfg = config::load_or_create(&config::config_path(&base_dir))?;
    Ok(ManagerState::new(base_dir, pid_dir, cfg))
}

async fn print_status(state: &Arc<ManagerState>, format: OutputFormat) -> Result<()> {
    let statuses = daemon::status_all(state).await;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&statuses)?),
        OutputFormat::Text => {
            for s in &statuses {
                println!(
                    "{:<20} {:<8} {:<10} {:<6} {}",
                    s.name,
                    s.status,
                    s.mode.unwrap_or("-"),
                    s.port.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                    s.cmd
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn no_subcommand_means_serve_on_default_bind() {
        let args = Args::try_parse_from(["sitemaster"]).unwrap();
        assert!(args.cmd.is_none());
        assert_eq!(args.bind, "0.0.0.0:8000");
    }

    #[test]
    fn logs_takes_line_count() {
        let args = Args::try_parse_from(["sitemaster", "logs", "web", "-n", "50"]).unwrap();
        match args.cmd {
            Some(Cmd::Logs { name, lines }) => {
                assert_eq!(name, "web");
                assert_eq!(lines, 50);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn status_format_parses() {
        let args = Args::try_parse_from(["sitemaster", "status", "--format", "json"]).unwrap();
        assert!(matches!(
            args.cmd,
            Some(Cmd::Status {
                format: OutputFormat::Json
            })
        ));
    }

    #[test]
    fn dirs_accept_overrides() {
        let args = Args::try_parse_from([
            "sitemaster",
            "--base-dir",
            "/srv/mgr",
            "--pid-dir",
            "/run/mgr",
            "status",
        ])
        .unwrap();
        assert_eq!(args.base_dir.as_deref(), Some(Path::new("/srv/mgr")));
        assert_eq!(args.pid_dir.as_deref(), Some(Path::new("/run/mgr")));
    }
}
