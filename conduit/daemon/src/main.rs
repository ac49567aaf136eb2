//! Conduit Daemon - standalone host for the loopback message bridge.
//!
//! Binds the conduit server on the loopback interface, answers the built-in
//! diagnostic routes, and runs until SIGTERM or SIGINT. Configuration
//! layers, lowest priority first: built-in defaults, the TOML config file,
//! `CONDUIT_*` environment variables, command-line flags.
//!
//! ```text
//! conduit-daemon --port 9777 --shared-key 0123456789abcdef
//! conduit-daemon -d --pid-file /run/user/1000/conduit/conduit.pid
//! ```

mod routes;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use nix::unistd::{fork, setsid, ForkResult};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use conduit_core::{
    default_config_path, load_config_from_path, ConduitConfig, ConduitServer, ConfigOverrides,
};
use routes::RouteTable;

/// Conduit daemon - loopback message bridge for local peers
#[derive(Parser, Debug)]
#[command(name = "conduit-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Interface to bind
    #[arg(long, env = "CONDUIT_HOSTNAME", value_name = "HOST")]
    hostname: Option<String>,

    /// Port to bind (0 asks the OS for an ephemeral port)
    #[arg(short = 'p', long, env = "CONDUIT_PORT", value_name = "PORT")]
    port: Option<u16>,

    /// Shared key clients must present; generated when absent or too short
    #[arg(long, env = "CONDUIT_SHARED_KEY", value_name = "KEY")]
    shared_key: Option<String>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "CONDUIT_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run as daemon (fork to background)
    #[arg(short = 'd', long)]
    daemonize: bool,

    /// PID file path (for daemon mode)
    #[arg(long, env = "CONDUIT_PID_FILE", value_name = "PATH")]
    pid_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "CONDUIT_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit log lines as JSON
    #[arg(long)]
    log_json: bool,
}

/// Default PID file location.
///
/// Uses `XDG_RUNTIME_DIR` if available, otherwise a per-user directory
/// under `/tmp`.
fn default_pid_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir)
            .join("conduit")
            .join("conduit.pid")
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/conduit-{uid}/conduit.pid"))
    }
}

/// Write the current process id to `path`, creating parent directories.
fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create PID directory {}", parent.display()))?;
    }

    let pid = std::process::id();
    let mut file = fs::File::create(path)
        .with_context(|| format!("failed to create PID file {}", path.display()))?;
    writeln!(file, "{pid}")?;

    info!(pid, path = %path.display(), "PID file written");
    Ok(())
}

/// Remove the PID file if it exists.
fn remove_pid_file(path: &Path) {
    if !path.exists() {
        return;
    }
    if let Err(e) = fs::remove_file(path) {
        warn!(error = %e, path = %path.display(), "failed to remove PID file");
    } else {
        info!(path = %path.display(), "PID file removed");
    }
}

/// Refuse to start when the PID file points at a live process. A stale
/// file is removed instead.
fn check_existing_daemon(pid_path: &Path) -> Result<()> {
    if !pid_path.exists() {
        return Ok(());
    }

    let pid_str = fs::read_to_string(pid_path)
        .with_context(|| format!("failed to read PID file {}", pid_path.display()))?;
    let pid: i32 = pid_str
        .trim()
        .parse()
        .context("PID file does not contain a process id")?;

    // Signal 0 probes for existence without delivering anything.
    if unsafe { libc::kill(pid, 0) } == 0 {
        anyhow::bail!(
            "another conduit-daemon is already running (PID {pid}); \
             stop it first or remove {} if it is stale",
            pid_path.display()
        );
    }

    warn!(pid, path = %pid_path.display(), "removing stale PID file");
    fs::remove_file(pid_path).context("failed to remove stale PID file")?;
    Ok(())
}

/// Wire up tracing. `RUST_LOG` wins when set; otherwise both the daemon
/// and the core library log at `level`.
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("conduit_daemon={level},conduit_core={level}"))
    });

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .init();
    }

    Ok(())
}

/// Detach from the terminal: double fork with a new session in between.
/// The second fork keeps the daemon from reacquiring a controlling
/// terminal.
fn daemonize() -> Result<()> {
    fork_into_child().context("first fork failed")?;
    setsid().context("setsid failed")?;
    fork_into_child().context("second fork failed")?;

    // stdio stays open, so log output still reaches the launching shell.
    // TODO: redirect stdio to /dev/null once the daemon logs to a file.
    Ok(())
}

/// Fork and exit the parent; only the child returns.
fn fork_into_child() -> Result<()> {
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => Ok(()),
        Err(e) => Err(anyhow::anyhow!(e)),
    }
}

/// CLI flags as config overrides; only flags that were given are captured.
fn cli_overrides(args: &Args) -> ConfigOverrides {
    let mut overrides = ConfigOverrides::new();
    if let Some(ref hostname) = args.hostname {
        overrides = overrides.with_hostname(hostname.clone());
    }
    if let Some(port) = args.port {
        overrides = overrides.with_port(port);
    }
    if let Some(ref key) = args.shared_key {
        overrides = overrides.with_shared_key(key.clone());
    }
    overrides
}

/// Block until SIGTERM or SIGINT arrives.
async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
    }
    Ok(())
}

async fn run(config: ConduitConfig) -> Result<()> {
    let routes = RouteTable::with_builtin_routes();
    info!(routes = ?routes.routes(), "route table ready");

    let server = ConduitServer::new(&config, Arc::new(routes));
    let port = server
        .start()
        .await
        .context("failed to start conduit server")?;
    info!(port, shared_key = %server.shared_key(), "conduit accepting connections");

    wait_for_shutdown().await?;

    server.stop().await;
    info!("conduit daemon stopped cleanly");
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_json)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "conduit daemon starting"
    );

    let config_path = args.config.clone().or_else(default_config_path);
    let mut config =
        load_config_from_path(config_path).context("failed to load configuration")?;
    cli_overrides(&args).apply(&mut config);
    info!(
        source = %config.source(),
        hostname = %config.hostname,
        port = config.port,
        "configuration resolved"
    );

    let pid_path = args.pid_file.clone().unwrap_or_else(default_pid_path);
    check_existing_daemon(&pid_path)?;

    if args.daemonize {
        // Fork before the runtime exists; tokio worker threads do not
        // survive fork().
        daemonize()?;
        info!(pid = std::process::id(), "running in the background");
    }
    write_pid_file(&pid_path)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let result = runtime.block_on(run(config));

    remove_pid_file(&pid_path);
    result
}
