//! Stopping the local processes that handle intercepted traffic.

use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, error};

use crate::manager::BoxFuture;
use crate::{AppError, Result};

/// A local handler of an intercept or ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handler {
    /// Handler process id.
    Process(u32),
    /// Name or id of the container running the handler.
    Container(String),
}

impl Handler {
    /// Pick the handler from the optional pid and container. The container
    /// wins when both are set.
    #[must_use]
    pub fn from_parts(pid: u32, container: &str) -> Option<Self> {
        if !container.is_empty() {
            Some(Self::Container(container.to_owned()))
        } else if pid != 0 {
            Some(Self::Process(pid))
        } else {
            None
        }
    }
}

/// Stops intercept handlers during teardown.
pub trait HandlerSupervisor: Send + Sync {
    /// Ask the handler to terminate.
    ///
    /// # Errors
    ///
    /// Returns an error when the handler cannot be signalled. Callers log
    /// it and continue the teardown.
    fn stop(&self, handler: Handler) -> BoxFuture<'_, Result<()>>;
}

/// Stop a handler and log failures. Teardown continues regardless.
pub async fn stop_handler(supervisor: &dyn HandlerSupervisor, name: &str, handler: Option<Handler>) {
    let Some(handler) = handler else {
        return;
    };
    debug!(intercept = %name, ?handler, "terminating handler");
    if let Err(err) = supervisor.stop(handler).await {
        error!(intercept = %name, %err, "failed to stop handler");
    }
}

/// Signals handler processes with SIGTERM and stops handler containers
/// with `docker stop`.
#[derive(Debug, Default)]
pub struct ProcessSupervisor;

impl HandlerSupervisor for ProcessSupervisor {
    fn stop(&self, handler: Handler) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            match handler {
                Handler::Process(pid) => terminate(pid),
                Handler::Container(id) => stop_container(&id).await,
            }
        })
    }
}

#[cfg(unix)]
fn terminate(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| AppError::Internal(format!("pid {pid} out of range")))?;
    kill(Pid::from_raw(raw), Signal::SIGTERM)
        .map_err(|err| AppError::Internal(format!("unable to signal handler with pid {pid}: {err}")))
}

#[cfg(not(unix))]
fn terminate(pid: u32) -> Result<()> {
    Err(AppError::Internal(format!(
        "terminating handler with pid {pid} is not supported on this platform"
    )))
}

async fn stop_container(id: &str) -> Result<()> {
    let status = Command::new("docker")
        .args(["stop", id])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|err| AppError::Internal(format!("failed to run docker stop: {err}")))?;
    if status.success() {
        Ok(())
    } else {
        Err(AppError::Internal(format!("docker stop {id} failed: {status}")))
    }
}
