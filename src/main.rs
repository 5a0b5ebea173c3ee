use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::{fmt, EnvFilter};

use cprobe::agent::{Agent, AgentOptions};

/// Scrapes targets through protocol plugins and ships samples to
/// Prometheus remote-write endpoints.
#[derive(Parser)]
#[command(name = "cprobe", about)]
struct Cli {
    /// Configuration directory holding `<plugin>/main*.yaml` and
    /// `writer.yaml`.
    #[arg(long = "conf.d", value_parser = existing_dir)]
    conf_dir: Option<PathBuf>,

    /// Reject unknown keys in scrape and writer configs.
    #[arg(
        long = "scrape.config.strictParse",
        default_value_t = true,
        action = ArgAction::Set
    )]
    strict_parse: bool,

    /// Log series instead of sending them to the writers.
    #[arg(long = "no-writer")]
    no_writer: bool,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,

    /// Listen address for /metrics and /healthz. Empty disables it.
    #[arg(long = "http.listen", default_value = "")]
    http_listen: String,

    /// Time allowed for running scrapes and writer queues to drain.
    #[arg(long = "shutdown.timeout", default_value = "7s", value_parser = humantime::parse_duration)]
    shutdown_timeout: Duration,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash, set by build.rs, or "unknown".
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn existing_dir(raw: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(raw);
    if path.is_dir() {
        Ok(path)
    } else {
        Err(format!("{raw} is not an existing directory"))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("cprobe {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(true).init();

    let conf_dir = cli
        .conf_dir
        .clone()
        .context("--conf.d is required (use --help for usage)")?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting cprobe",
    );

    let opts = AgentOptions {
        conf_dir,
        strict_parse: cli.strict_parse,
        no_writer: cli.no_writer,
        http_listen: cli.http_listen.clone(),
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(opts, cli.shutdown_timeout))
}

async fn run(opts: AgentOptions, shutdown_timeout: Duration) -> Result<()> {
    let mut sighup = signal(SignalKind::hangup()).context("registering SIGHUP handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;

    let agent = Agent::new(opts)?;
    if let Err(e) = agent.start().await {
        agent.stop(shutdown_timeout).await;
        return Err(e);
    }

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                tracing::info!("received SIGHUP, reloading config");
                if let Err(e) = agent.reload().await {
                    tracing::error!(error = ?e, "config reload failed, keeping running jobs");
                }
            }
            _ = sigint.recv() => {
                tracing::info!("received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                break;
            }
        }
    }

    agent.stop(shutdown_timeout).await;
    tracing::info!("cprobe stopped");
    Ok(())
}
