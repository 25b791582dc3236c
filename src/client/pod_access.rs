//! Mount and port-forward sessions for active intercepts.
//!
//! Every active intercept needs local access to its pod: a mount of the
//! agent's exported volumes and forwards of the declared local ports.
//! Intercepts that resolve to the same pod, container, ports and mount
//! target share one session. Sessions are refreshed per snapshot pass and
//! stopped when a pass no longer refreshes them or when their last holder
//! releases them.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::MountConfig;
use crate::manager::BoxFuture;
use crate::{AppError, Result};

/// How long a started mount program must stay up before it counts as mounted.
const MOUNT_SETTLE: Duration = Duration::from_millis(500);

/// Identifies a deduplicated pod access session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodAccessKey {
    /// Intercepted workload.
    pub workload: String,
    /// IP of the pod.
    pub pod_ip: String,
    /// Intercepted container.
    pub container: String,
    /// Forwarded local ports, comma separated.
    pub ports: String,
    /// Client-visible mount point, empty when nothing is mounted.
    pub mount_target: String,
}

/// Everything a [`Mounter`] needs to give local access to one pod.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodAccessParams {
    /// Intercepted workload.
    pub workload: String,
    /// IP of the pod.
    pub pod_ip: String,
    /// Intercepted container.
    pub container: String,
    /// Local ports to forward from the pod, `<port>[/<protocol>]`.
    pub local_ports: Vec<String>,
    /// Agent SFTP port.
    pub sftp_port: u16,
    /// Agent FTP port.
    pub ftp_port: u16,
    /// Server-side mount root.
    pub mount_point: String,
    /// Local mount directory.
    pub client_mount_point: String,
    /// Local bridge port to the agent's file server.
    pub local_mount_port: u16,
    /// Mount read-only.
    pub read_only: bool,
}

impl PodAccessParams {
    /// Deduplication key.
    #[must_use]
    pub fn key(&self) -> PodAccessKey {
        PodAccessKey {
            workload: self.workload.clone(),
            pod_ip: self.pod_ip.clone(),
            container: self.container.clone(),
            ports: self.local_ports.join(","),
            mount_target: if self.needs_mount() {
                self.client_mount_point.clone()
            } else {
                String::new()
            },
        }
    }

    /// Whether a file system mount is requested and possible.
    #[must_use]
    pub fn needs_mount(&self) -> bool {
        !self.client_mount_point.is_empty()
            && (self.sftp_port > 0 || self.ftp_port > 0 || self.local_mount_port > 0)
    }

    fn disable_mounts(&mut self) {
        self.sftp_port = 0;
        self.ftp_port = 0;
        self.local_mount_port = 0;
    }
}

/// Signal that the pod access of an intercept is usable.
#[derive(Debug, Clone, Default)]
pub struct Readiness(Option<watch::Receiver<bool>>);

impl Readiness {
    /// Readiness that is already reached.
    #[must_use]
    pub fn done() -> Self {
        Self(None)
    }

    /// Wait until the session reports ready. Also returns when the session
    /// ended without becoming ready; the session logs the failure.
    pub async fn wait(&mut self) {
        if let Some(rx) = &mut self.0 {
            if rx.wait_for(|ready| *ready).await.is_err() {
                debug!("pod access ended before it became ready");
            }
        }
    }
}

/// Starts the mount and bridge session of one pod.
pub trait Mounter: Send + Sync {
    /// Run the session until `scope` is cancelled, sending `true` on
    /// `ready` once the pod is accessible. The returned future completes
    /// only after every local resource of the session is released.
    fn start(
        &self,
        scope: CancellationToken,
        params: PodAccessParams,
        ready: watch::Sender<bool>,
    ) -> BoxFuture<'static, Result<()>>;
}

struct AccessEntry {
    scope: CancellationToken,
    handle: JoinHandle<()>,
    ready: watch::Receiver<bool>,
    holders: HashSet<String>,
    refreshed: bool,
}

/// Deduplicates and supervises pod access sessions.
pub struct PodAccessTracker {
    entries: Mutex<HashMap<PodAccessKey, AccessEntry>>,
    mounter: Arc<dyn Mounter>,
    mounts_enabled: bool,
    parent: CancellationToken,
}

impl PodAccessTracker {
    /// Create a tracker whose sessions are children of `parent`.
    #[must_use]
    pub fn new(mounter: Arc<dyn Mounter>, mounts_enabled: bool, parent: CancellationToken) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            mounter,
            mounts_enabled,
            parent,
        }
    }

    /// Begin a snapshot pass: every session must be refreshed again to survive.
    pub fn init_snapshot(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        for entry in entries.values_mut() {
            entry.refreshed = false;
        }
    }

    /// Reuse or start the session for `params` on behalf of intercept
    /// `holder` and mark it refreshed.
    pub fn start(&self, holder: &str, mut params: PodAccessParams) -> Readiness {
        if !self.mounts_enabled {
            params.disable_mounts();
        }
        if !params.needs_mount() && params.local_ports.is_empty() {
            return Readiness::done();
        }

        let key = params.key();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(&key) {
            entry.refreshed = true;
            entry.holders.insert(holder.to_owned());
            return Readiness(Some(entry.ready.clone()));
        }

        let scope = self.parent.child_token();
        let (ready_tx, ready_rx) = watch::channel(false);
        let span = info_span!("pod_access", workload = %key.workload, pod_ip = %key.pod_ip);
        let session = self.mounter.start(scope.clone(), params, ready_tx);
        let handle = tokio::spawn(
            async move {
                if let Err(err) = session.await {
                    error!(%err, "pod access failed");
                }
            }
            .instrument(span),
        );
        debug!(workload = %key.workload, pod_ip = %key.pod_ip, "started pod access");
        entries.insert(
            key,
            AccessEntry {
                scope,
                handle,
                ready: ready_rx.clone(),
                holders: HashSet::from([holder.to_owned()]),
                refreshed: true,
            },
        );
        Readiness(Some(ready_rx))
    }

    /// End a snapshot pass by stopping every session that was not
    /// refreshed, waiting for each to release its resources.
    pub async fn cancel_unwanted(&self) {
        let stale: Vec<(PodAccessKey, AccessEntry)> = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            let keys: Vec<PodAccessKey> = entries
                .iter()
                .filter(|(_, e)| !e.refreshed)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| entries.remove(&k).map(|e| (k, e)))
                .collect()
        };
        for (key, entry) in stale {
            debug!(workload = %key.workload, pod_ip = %key.pod_ip, "stopping unwanted pod access");
            stop(entry).await;
        }
    }

    /// Drop `holder` from every session it holds. Sessions left without
    /// holders are stopped and awaited.
    pub async fn release(&self, holder: &str) {
        let orphaned: Vec<AccessEntry> = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            let mut keys = Vec::new();
            for (key, entry) in entries.iter_mut() {
                if entry.holders.remove(holder) && entry.holders.is_empty() {
                    keys.push(key.clone());
                }
            }
            keys.iter().filter_map(|k| entries.remove(k)).collect()
        };
        for entry in orphaned {
            stop(entry).await;
        }
    }

    /// Number of running sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stop every session.
    pub async fn close(&self) {
        self.init_snapshot();
        self.cancel_unwanted().await;
    }
}

async fn stop(entry: AccessEntry) {
    entry.scope.cancel();
    if let Err(err) = entry.handle.await {
        warn!(%err, "pod access task ended abnormally");
    }
}

/// [`Mounter`] that runs an external mount program and forwards local TCP
/// ports to the pod.
pub struct CommandMounter {
    config: MountConfig,
}

impl CommandMounter {
    /// Create a mounter from the mount settings.
    #[must_use]
    pub fn new(config: MountConfig) -> Self {
        Self { config }
    }
}

impl Mounter for CommandMounter {
    fn start(
        &self,
        scope: CancellationToken,
        params: PodAccessParams,
        ready: watch::Sender<bool>,
    ) -> BoxFuture<'static, Result<()>> {
        let config = self.config.clone();
        Box::pin(async move {
            let tasks = TaskTracker::new();
            let result = run_session(&config, &params, &scope, &ready, &tasks).await;
            scope.cancel();
            tasks.close();
            tasks.wait().await;
            result
        })
    }
}

async fn run_session(
    config: &MountConfig,
    params: &PodAccessParams,
    scope: &CancellationToken,
    ready: &watch::Sender<bool>,
    tasks: &TaskTracker,
) -> Result<()> {
    for raw in &params.local_ports {
        let Some(port) = parse_local_port(raw) else {
            warn!(port = %raw, "only TCP ports can be forwarded, skipping");
            continue;
        };
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|err| AppError::Mount(format!("failed to forward port {port}: {err}")))?;
        let target = format!("{}:{port}", params.pod_ip);
        info!(port, %target, "forwarding local port");
        tasks.spawn(forward(listener, target, scope.clone(), tasks.clone()));
    }

    if params.needs_mount() {
        run_mount(config, params, scope, ready).await
    } else {
        ready.send_replace(true);
        scope.cancelled().await;
        Ok(())
    }
}

async fn run_mount(
    config: &MountConfig,
    params: &PodAccessParams,
    scope: &CancellationToken,
    ready: &watch::Sender<bool>,
) -> Result<()> {
    tokio::fs::create_dir_all(&params.client_mount_point).await?;
    let args = mount_args(config, params);
    let mut child = Command::new(&config.command)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| AppError::Mount(format!("failed to spawn {}: {err}", config.command)))?;

    info!(
        pid = child.id().unwrap_or(0),
        local = %params.client_mount_point,
        remote = %params.mount_point,
        "mount started"
    );

    tokio::select! {
        status = child.wait() => {
            return Err(AppError::Mount(format!(
                "{} exited before the mount was established: {}",
                config.command,
                status.map_or_else(|e| e.to_string(), |s| s.to_string())
            )));
        }
        () = tokio::time::sleep(MOUNT_SETTLE) => {
            ready.send_replace(true);
        }
        () = scope.cancelled() => {}
    }

    tokio::select! {
        status = child.wait() => {
            warn!(local = %params.client_mount_point, ?status, "mount program exited");
        }
        () = scope.cancelled() => {
            if let Err(err) = child.kill().await {
                warn!(%err, "failed to stop mount program");
            }
            info!(local = %params.client_mount_point, "unmounted");
        }
    }
    Ok(())
}

/// Expand the configured mount arguments for one pod.
#[must_use]
pub fn mount_args(config: &MountConfig, params: &PodAccessParams) -> Vec<String> {
    let (host, port) = if params.local_mount_port > 0 {
        ("127.0.0.1".to_owned(), params.local_mount_port)
    } else if params.sftp_port > 0 {
        (params.pod_ip.clone(), params.sftp_port)
    } else {
        (params.pod_ip.clone(), params.ftp_port)
    };
    let remote = if params.mount_point.is_empty() {
        "/"
    } else {
        params.mount_point.as_str()
    };
    let ro = if params.read_only { "ro" } else { "rw" };
    config
        .args
        .iter()
        .map(|arg| {
            arg.replace("{host}", &host)
                .replace("{port}", &port.to_string())
                .replace("{remote}", remote)
                .replace("{local}", &params.client_mount_point)
                .replace("{ro}", ro)
        })
        .collect()
}

/// Port of a `<port>[/TCP]` declaration; `None` for other protocols.
fn parse_local_port(raw: &str) -> Option<u16> {
    let (port, proto) = raw.split_once('/').unwrap_or((raw, "TCP"));
    if !proto.eq_ignore_ascii_case("TCP") {
        return None;
    }
    port.parse().ok().filter(|p| *p > 0)
}

async fn forward(listener: TcpListener, target: String, scope: CancellationToken, tasks: TaskTracker) {
    loop {
        tokio::select! {
            () = scope.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((mut inbound, _)) => {
                    let target = target.clone();
                    let scope = scope.clone();
                    tasks.spawn(async move {
                        let mut outbound = match TcpStream::connect(&target).await {
                            Ok(s) => s,
                            Err(err) => {
                                warn!(%target, %err, "forward dial failed");
                                return;
                            }
                        };
                        tokio::select! {
                            () = scope.cancelled() => {}
                            res = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => {
                                if let Err(err) = res {
                                    debug!(%target, %err, "forward ended");
                                }
                            }
                        }
                    });
                }
                Err(err) => warn!(%err, "accept failed"),
            },
        }
    }
}
