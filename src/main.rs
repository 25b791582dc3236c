#![forbid(unsafe_code)]

//! `agent-intercept`: client daemon.
//!
//! Bootstraps configuration, opens the client session against the control
//! plane, and serves the IPC socket for `agent-intercept-ctl`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use agent_intercept::client::handler::ProcessSupervisor;
use agent_intercept::client::pod_access::CommandMounter;
use agent_intercept::client::session::{Collaborators, Session};
use agent_intercept::config::GlobalConfig;
use agent_intercept::driver::ndjson::NdjsonManagerClient;
use agent_intercept::ipc::server::spawn_ipc_server;
use agent_intercept::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-intercept", about = "Intercept client daemon", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the session namespace.
    #[arg(long)]
    namespace: Option<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-intercept bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Some(namespace) = args.namespace {
        config.namespace = namespace;
    }
    info!(namespace = %config.namespace, manager = %config.manager.address, "configuration loaded");

    // ── Open the session ────────────────────────────────
    let ct = CancellationToken::new();
    let collaborators = Collaborators {
        manager: Arc::new(NdjsonManagerClient::new(
            config.manager.address.clone(),
            config.timeouts.manager_api(),
            ct.clone(),
        )),
        mounter: Arc::new(CommandMounter::new(config.mount.clone())),
        supervisor: Arc::new(ProcessSupervisor),
    };
    let session = Session::start(&config, collaborators, ct.child_token());

    // ── Start IPC server ────────────────────────────────
    let ipc_handle = spawn_ipc_server(&config.ipc_name, Arc::clone(&session), ct.clone())?;

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");

    // Local resources go first, then the server is told to forget the intercepts.
    let leave = tokio::time::timeout(config.timeouts.remove(), session.clear_intercepts()).await;
    match leave {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(%err, "failed to clear intercepts"),
        Err(_) => error!("clearing intercepts timed out"),
    }

    ct.cancel();
    session.close().await;
    let _ = ipc_handle.await;
    info!("agent-intercept shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
