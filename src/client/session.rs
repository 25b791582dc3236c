//! Client session: owner of the current intercept and ingest sets.
//!
//! A [`Session`] keeps its view of the session's intercepts in line with
//! the snapshots pushed by the control plane (see
//! [`reconciler`](crate::client::reconciler)) and implements the calls that
//! create, remove and inspect intercepts. Intercepts, ingests, waiters and
//! API listeners share one lock; no await happens while it is held.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use axum::http::HeaderMap;
use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::client::api::{ApiReconciler, InterceptLookup, LookupResult};
use crate::client::handler::{stop_handler, Handler, HandlerSupervisor};
use crate::client::ingest::{Ingest, IngestInfo, IngestKey};
use crate::client::pod_access::{Mounter, PodAccessParams, PodAccessTracker};
use crate::client::waiters::{MountRequest, WaitOutcome, WaiterRegistry};
use crate::config::{GlobalConfig, TimeoutConfig};
use crate::driver::ManagerClient;
use crate::errors::panic_message;
use crate::models::agent::PortIdentifier;
use crate::models::intercept::{
    Disposition, InterceptInfo, InterceptSpec, SessionInfo, ENV_HANDLER_CONTAINER, MECHANISM_TCP,
};
use crate::models::result::{
    CreateInterceptRequest, InterceptErrorKind, InterceptResult, PreparedIntercept,
};
use crate::{AppError, Result};

/// External collaborators of a session.
#[derive(Clone)]
pub struct Collaborators {
    /// Control-plane client.
    pub manager: Arc<dyn ManagerClient>,
    /// Mount and port-forward sessions.
    pub mounter: Arc<dyn Mounter>,
    /// Stops intercept and ingest handlers.
    pub supervisor: Arc<dyn HandlerSupervisor>,
}

/// A locally known intercept: the server record plus client-only state.
#[derive(Debug, Clone)]
pub(crate) struct Intercept {
    /// Latest record. `client_mount_point` is client-only.
    pub(crate) info: InterceptInfo,
    pub(crate) local_mount_port: u16,
    pub(crate) read_only: bool,
    pub(crate) handler_pid: u32,
    pub(crate) handler_container: String,
    pub(crate) scope: CancellationToken,
    pub(crate) tasks: TaskTracker,
}

impl Intercept {
    pub(crate) fn new(info: InterceptInfo, scope: CancellationToken) -> Self {
        Self {
            info,
            local_mount_port: 0,
            read_only: false,
            handler_pid: 0,
            handler_container: String::new(),
            scope,
            tasks: TaskTracker::new(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.info.spec.name
    }

    pub(crate) fn handler(&self) -> Option<Handler> {
        Handler::from_parts(self.handler_pid, &self.handler_container)
    }

    /// Replace the record, keeping the client-only mount point.
    pub(crate) fn refresh(&mut self, info: InterceptInfo) {
        let client_mount_point = std::mem::take(&mut self.info.client_mount_point);
        self.info = info;
        self.info.client_mount_point = client_mount_point;
    }

    pub(crate) fn seed(&mut self, mount: &MountRequest) {
        self.info.client_mount_point.clone_from(&mount.mount_point);
        self.local_mount_port = mount.local_mount_port;
        self.read_only = mount.read_only;
    }

    pub(crate) fn pod_access_params(&self) -> PodAccessParams {
        let ii = &self.info;
        PodAccessParams {
            workload: ii.spec.agent.clone(),
            pod_ip: ii.pod_ip.clone(),
            container: ii.spec.container_name.clone(),
            local_ports: ii.spec.local_ports.clone(),
            sftp_port: ii.sftp_port,
            ftp_port: ii.ftp_port,
            mount_point: ii.mount_point.clone(),
            client_mount_point: ii.client_mount_point.clone(),
            local_mount_port: self.local_mount_port,
            read_only: self.read_only,
        }
    }
}

pub(crate) struct SessionState {
    pub(crate) intercepts: HashMap<String, Intercept>,
    pub(crate) waiters: WaiterRegistry,
    pub(crate) ingests: HashMap<IngestKey, Ingest>,
    pub(crate) api: ApiReconciler,
}

/// Backoff between attempts to reopen the snapshot stream.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub(crate) initial: Duration,
    pub(crate) max: Duration,
}

/// The client side of one connection to the control plane.
pub struct Session {
    pub(crate) info: SessionInfo,
    pub(crate) timeouts: TimeoutConfig,
    pub(crate) retry: RetryPolicy,
    pub(crate) manager: Arc<dyn ManagerClient>,
    pub(crate) supervisor: Arc<dyn HandlerSupervisor>,
    pub(crate) pod_access: Arc<PodAccessTracker>,
    pub(crate) state: Mutex<SessionState>,
    pub(crate) lookup: Arc<dyn InterceptLookup>,
    pub(crate) cancel: CancellationToken,
    pub(crate) tasks: TaskTracker,
    me: Weak<Session>,
}

struct SessionLookup(Weak<Session>);

impl InterceptLookup for SessionLookup {
    fn lookup(&self, caller_id: &str, path: &str, headers: &HeaderMap) -> LookupResult {
        match self.0.upgrade() {
            Some(session) => session.lookup(caller_id, path, headers),
            None => LookupResult {
                client_side: true,
                ..LookupResult::default()
            },
        }
    }
}

impl Session {
    /// Create a session without starting its snapshot stream. Every task
    /// of the session stops when `cancel` fires.
    #[must_use]
    pub fn new(config: &GlobalConfig, collaborators: Collaborators, cancel: CancellationToken) -> Arc<Self> {
        let info = SessionInfo {
            session_id: uuid::Uuid::new_v4().to_string(),
            client: config.client_name.clone(),
            namespace: config.namespace.clone(),
        };
        let pod_access = Arc::new(PodAccessTracker::new(
            collaborators.mounter,
            config.mounts_enabled(),
            cancel.clone(),
        ));
        Arc::new_cyclic(|me| Self {
            info,
            timeouts: config.timeouts.clone(),
            retry: RetryPolicy {
                initial: Duration::from_millis(config.manager.retry_initial_ms),
                max: Duration::from_millis(config.manager.retry_max_ms),
            },
            manager: collaborators.manager,
            supervisor: collaborators.supervisor,
            pod_access,
            state: Mutex::new(SessionState {
                intercepts: HashMap::new(),
                waiters: WaiterRegistry::new(),
                ingests: HashMap::new(),
                api: ApiReconciler::new(cancel.clone()),
            }),
            lookup: Arc::new(SessionLookup(me.clone())),
            cancel,
            tasks: TaskTracker::new(),
            me: me.clone(),
        })
    }

    /// Create a session and start consuming its snapshot stream.
    #[must_use]
    pub fn start(config: &GlobalConfig, collaborators: Collaborators, cancel: CancellationToken) -> Arc<Self> {
        let session = Self::new(config, collaborators, cancel);
        let span = info_span!("watch_intercepts", session_id = %session.info.session_id);
        session
            .tasks
            .spawn(Arc::clone(&session).watch_intercepts_handler().instrument(span));
        info!(
            session_id = %session.info.session_id,
            namespace = %session.info.namespace,
            "session started"
        );
        session
    }

    /// Identity of this session towards the control plane.
    #[must_use]
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop every background task of the session and wait for them.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        let api_tasks = self.state().api.shutdown();
        api_tasks.wait().await;
        self.pod_access.close().await;
        debug!(session_id = %self.info.session_id, "session closed");
    }

    // ── Creation ──────────────────────────────────────────────────────────

    /// Check that `request` can be created and resolve its ports with the
    /// control plane.
    ///
    /// Fills in the session namespace when the request has none and the
    /// target port from the resolved container port when it is zero.
    /// Returns `None` for a request without a workload, which has nothing
    /// to create on the server.
    ///
    /// # Errors
    ///
    /// Returns the failed [`InterceptResult`] when the namespace differs,
    /// the name, local target or mount point is taken, or the control plane
    /// rejects the request.
    pub async fn can_intercept(
        &self,
        request: &mut CreateInterceptRequest,
    ) -> std::result::Result<Option<PreparedIntercept>, Box<InterceptResult>> {
        let spec = &mut request.spec;
        if spec.namespace.is_empty() {
            spec.namespace.clone_from(&self.info.namespace);
        } else if spec.namespace != self.info.namespace {
            return Err(Box::new(InterceptResult::failure(
                InterceptErrorKind::NamespaceAmbiguity,
                &AppError::User(format!(
                    "namespace {} differs from the namespace {} of the other intercepts",
                    spec.namespace, self.info.namespace
                )),
            )));
        }

        self.ensure_no_conflict(request)?;
        if request.spec.agent.is_empty() {
            return Ok(None);
        }

        let prepared = with_timeout(
            self.timeouts.manager_api(),
            "prepare intercept",
            self.manager.prepare_intercept(&self.info, &request.spec),
        )
        .await
        .map_err(|err| traffic_manager_error(&err))?;
        if let Some(err) = prepared.to_error() {
            return Err(traffic_manager_error(&err));
        }

        if request.spec.target_port == 0 {
            request.spec.target_port = prepared.container_port;
            self.ensure_no_conflict(request)?;
        }
        Ok(Some(prepared))
    }

    /// Create an intercept and wait until it is active and its pod access
    /// is usable.
    ///
    /// A failure after the server accepted the intercept triggers a
    /// detached best-effort removal. Panics are reported as a failed result.
    pub async fn add_intercept(&self, request: CreateInterceptRequest) -> InterceptResult {
        let name = request.spec.name.clone();
        let span = info_span!("add_intercept", intercept = %name);
        match AssertUnwindSafe(self.create(request))
            .catch_unwind()
            .instrument(span)
            .await
        {
            Ok(result) => {
                if result.is_error() {
                    warn!(intercept = %name, kind = %result.error, error = %result.error_text, "intercept failed");
                }
                result
            }
            Err(panic) => {
                let err = AppError::Internal(panic_message(panic.as_ref()));
                error!(intercept = %name, %err, "add intercept panicked");
                self.state().waiters.unregister(&name);
                InterceptResult::failure(InterceptErrorKind::FailedToEstablish, &err)
            }
        }
    }

    async fn create(&self, mut request: CreateInterceptRequest) -> InterceptResult {
        let prepared = match self.can_intercept(&mut request).await {
            Err(result) => return *result,
            Ok(None) => return InterceptResult::default(),
            Ok(Some(prepared)) => prepared,
        };

        let mut spec = request.spec.clone();
        if let Err(err) = self.qualify(&mut spec, &prepared) {
            return InterceptResult::failure(InterceptErrorKind::MisconfiguredWorkload, &err);
        }
        let deadline = Instant::now() + self.timeouts.intercept();

        // Re-check under the same lock that registers the waiter so that a
        // concurrent creation of the same name or target is rejected.
        let mut rx = {
            let mut state = self.state();
            if let Some(conflict) = find_conflict(&state, &request) {
                return *conflict;
            }
            state.waiters.register(
                &spec,
                MountRequest {
                    mount_point: request.mount_point.clone(),
                    local_mount_port: request.local_mount_port,
                    read_only: request.read_only,
                },
            )
        };

        let outcome = self.await_active(&spec, deadline, &mut rx).await;
        self.state().waiters.unregister(&spec.name);

        match outcome {
            Ok(ii) => {
                info!(intercept = %spec.name, id = %ii.id, "intercept active");
                InterceptResult {
                    intercept_info: Some(ii),
                    service_uid: prepared.service_uid,
                    workload_kind: prepared.workload_kind,
                    ..InterceptResult::default()
                }
            }
            Err((kind, err, created)) => {
                if created {
                    self.spawn_failed_removal(&spec.name);
                }
                InterceptResult::failure(kind, &err)
            }
        }
    }

    /// Make the request's port identifier unambiguous and copy the
    /// resolved fields into `spec`.
    fn qualify(&self, spec: &mut InterceptSpec, prepared: &PreparedIntercept) -> Result<()> {
        spec.client.clone_from(&self.info.client);
        if spec.mechanism.is_empty() {
            spec.mechanism = MECHANISM_TCP.into();
        }
        if prepared.service_port > 0 || !prepared.service_port_name.is_empty() {
            spec.service_name.clone_from(&prepared.service_name);
            spec.service_port_name.clone_from(&prepared.service_port_name);
            spec.service_port = prepared.service_port;
            let port = if prepared.service_port_name.is_empty() {
                prepared.service_port.to_string()
            } else {
                prepared.service_port_name.clone()
            };
            spec.port_identifier = PortIdentifier::new(&prepared.protocol, &port)?.to_string();
        }
        spec.protocol.clone_from(&prepared.protocol);
        spec.container_port = prepared.container_port;
        spec.service_uid.clone_from(&prepared.service_uid);
        spec.workload_kind.clone_from(&prepared.workload_kind);
        // The agent adds a hop in each direction.
        spec.roundtrip_latency_ms = self.timeouts.roundtrip_latency_ms.saturating_mul(2);
        spec.dial_timeout_ms = self.timeouts.endpoint_dial_ms;
        Ok(())
    }

    /// Create the intercept on the server and wait for its waiter. The
    /// error carries whether the server may hold the intercept.
    async fn await_active(
        &self,
        spec: &InterceptSpec,
        deadline: Instant,
        rx: &mut mpsc::Receiver<WaitOutcome>,
    ) -> std::result::Result<InterceptInfo, (InterceptErrorKind, AppError, bool)> {
        let not_established = || {
            (
                InterceptErrorKind::FailedToEstablish,
                AppError::Timeout(format!(
                    "intercept {} was not established within {}s",
                    spec.name, self.timeouts.intercept_seconds
                )),
                true,
            )
        };

        match tokio::time::timeout_at(deadline, self.manager.create_intercept(&self.info, spec)).await {
            Ok(Ok(ii)) => debug!(intercept = %spec.name, id = %ii.id, "created intercept"),
            Ok(Err(err)) => {
                debug!(intercept = %spec.name, %err, "manager rejected intercept");
                return Err((InterceptErrorKind::TrafficManagerError, err, false));
            }
            Err(_) => return Err(not_established()),
        }

        loop {
            let delivered = tokio::select! {
                () = tokio::time::sleep_until(deadline) => return Err(not_established()),
                delivered = rx.recv() => delivered,
            };
            let Some(WaitOutcome { result, mut mounts_done }) = delivered else {
                return Err((
                    InterceptErrorKind::FailedToEstablish,
                    AppError::Cancelled(format!("creation of intercept {} was aborted", spec.name)),
                    true,
                ));
            };
            let ii = result.map_err(|err| (InterceptErrorKind::FailedToEstablish, err, true))?;
            if ii.disposition != Disposition::Active {
                continue;
            }
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => return Err(not_established()),
                () = mounts_done.wait() => return Ok(ii),
            }
        }
    }

    fn spawn_failed_removal(&self, name: &str) {
        let Some(session) = self.me.upgrade() else {
            return;
        };
        let name = name.to_owned();
        let limit = self.timeouts.remove();
        let span = info_span!("remove_failed_intercept", intercept = %name);
        self.tasks.spawn(
            async move {
                debug!("intercept failed to create, removing");
                match tokio::time::timeout(limit, session.remove_after_failure(&name)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!(%err, "failed to remove failed intercept"),
                    Err(_) => warn!("removal of failed intercept timed out"),
                }
            }
            .instrument(span),
        );
    }

    fn ensure_no_conflict(&self, request: &CreateInterceptRequest) -> std::result::Result<(), Box<InterceptResult>> {
        match find_conflict(&self.state(), request) {
            Some(conflict) => Err(conflict),
            None => Ok(()),
        }
    }

    // ── Removal ───────────────────────────────────────────────────────────

    /// Remove the intercept called `name`. Removing an unknown name is not
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns the control plane's failure to remove the intercept.
    pub async fn remove_intercept(&self, name: &str) -> Result<()> {
        debug!(intercept = %name, "removing intercept");
        match self.intercept_by_name(name) {
            Some(ic) => self.remove_local(ic).await,
            None => {
                debug!(intercept = %name, "intercept was already removed");
                Ok(())
            }
        }
    }

    async fn remove_after_failure(&self, name: &str) -> Result<()> {
        match self.intercept_by_name(name) {
            Some(ic) => self.remove_local(ic).await,
            None => self.remove_on_server(name).await,
        }
    }

    /// Tear down local resources before asking the server to forget the
    /// intercept.
    async fn remove_local(&self, ic: Intercept) -> Result<()> {
        let name = ic.name().to_owned();
        stop_handler(self.supervisor.as_ref(), &name, ic.handler()).await;

        ic.scope.cancel();
        ic.tasks.close();
        ic.tasks.wait().await;

        self.remove_on_server(&name).await
    }

    async fn remove_on_server(&self, name: &str) -> Result<()> {
        debug!(intercept = %name, "telling manager to remove intercept");
        with_timeout(
            self.timeouts.manager_api(),
            "remove intercept",
            self.manager.remove_intercept(&self.info, name),
        )
        .await
    }

    /// Remove every intercept and stop every ingest handler. Used when the
    /// session is left.
    ///
    /// # Errors
    ///
    /// Returns the first removal failure other than an already removed
    /// intercept. Remaining intercepts are still removed.
    pub async fn clear_intercepts(&self) -> Result<()> {
        let mut first_err = None;
        for ic in self.sorted_intercepts() {
            debug!(intercept = %ic.name(), "clearing intercept");
            match self.remove_local(ic).await {
                Ok(()) | Err(AppError::NotFound(_)) => {}
                Err(err) => {
                    warn!(%err, "failed to clear intercept");
                    first_err.get_or_insert(err);
                }
            }
        }

        let ingests: Vec<(IngestKey, Ingest)> = self.state().ingests.drain().collect();
        for (key, ig) in ingests {
            debug!(ingest = %key, "clearing ingest");
            stop_handler(self.supervisor.as_ref(), &key.to_string(), ig.handler()).await;
        }
        first_err.map_or(Ok(()), Err)
    }

    // ── Handlers ──────────────────────────────────────────────────────────

    /// Record the handler of an intercept (by ID) or ingest (by
    /// `workload/container`).
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] when `id` names neither.
    pub fn add_interceptor(&self, id: &str, handler: Handler) -> Result<()> {
        let (pid, container) = match handler {
            Handler::Process(pid) => (pid, String::new()),
            Handler::Container(name) => (0, name),
        };
        let mut state = self.state();
        if let Some(ic) = state.intercepts.get_mut(id) {
            debug!(id, pid, container = %container, "adding intercept handler");
            ic.handler_pid = pid;
            ic.handler_container = container;
            return Ok(());
        }
        if let Some(ig) = IngestKey::parse(id).and_then(|key| state.ingests.get_mut(&key)) {
            debug!(id, pid, container = %container, "adding ingest handler");
            ig.handler_pid = pid;
            ig.handler_container = container;
            return Ok(());
        }
        warn!(id, pid, container = %container, "found no ingest or intercept for handler");
        Err(AppError::NotFound(format!("no intercept or ingest with id {id}")))
    }

    /// Forget the handler of an intercept or ingest without stopping it.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] when `id` names neither.
    pub fn remove_interceptor(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        if let Some(ic) = state.intercepts.get_mut(id) {
            ic.handler_pid = 0;
            ic.handler_container.clear();
            return Ok(());
        }
        if let Some(ig) = IngestKey::parse(id).and_then(|key| state.ingests.get_mut(&key)) {
            ig.handler_pid = 0;
            ig.handler_container.clear();
            return Ok(());
        }
        Err(AppError::NotFound(format!("no intercept or ingest with id {id}")))
    }

    // ── Ingests ───────────────────────────────────────────────────────────

    /// Track an ingest. Adding an existing key returns the tracked info.
    pub fn add_ingest(&self, key: IngestKey, info: IngestInfo) -> IngestInfo {
        let mut state = self.state();
        let entry = state.ingests.entry(key).or_insert_with_key(|key| {
            debug!(ingest = %key, "adding ingest");
            Ingest::new(info)
        });
        entry.info.clone()
    }

    /// Stop the ingest's handler and forget it.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] when the ingest is unknown.
    pub async fn remove_ingest(&self, key: &IngestKey) -> Result<()> {
        let removed = self.state().ingests.remove(key);
        let Some(ig) = removed else {
            return Err(AppError::NotFound(format!("ingest {key} not found")));
        };
        stop_handler(self.supervisor.as_ref(), &key.to_string(), ig.handler()).await;
        Ok(())
    }

    /// Currently tracked ingests, sorted by key.
    #[must_use]
    pub fn current_ingests(&self) -> Vec<(IngestKey, IngestInfo)> {
        let mut ingests: Vec<_> = self
            .state()
            .ingests
            .iter()
            .map(|(k, ig)| (k.clone(), ig.info.clone()))
            .collect();
        ingests.sort_by(|a, b| a.0.cmp(&b.0));
        ingests
    }

    // ── Queries ───────────────────────────────────────────────────────────

    fn intercept_by_name(&self, name: &str) -> Option<Intercept> {
        self.state()
            .intercepts
            .values()
            .find(|ic| ic.name() == name)
            .cloned()
    }

    fn sorted_intercepts(&self) -> Vec<Intercept> {
        let mut ics: Vec<Intercept> = self.state().intercepts.values().cloned().collect();
        ics.sort_by(|a, b| a.name().cmp(b.name()));
        ics
    }

    /// Copy of the current intercept records, sorted by name.
    #[must_use]
    pub fn current_intercepts(&self) -> Vec<InterceptInfo> {
        self.sorted_intercepts().into_iter().map(|ic| ic.info).collect()
    }

    /// Spec of the intercept called `name`.
    #[must_use]
    pub fn get_intercept_spec(&self, name: &str) -> Option<InterceptSpec> {
        self.intercept_by_name(name).map(|ic| ic.info.spec)
    }

    /// Record of the intercept called `name`. The environment announces
    /// the handler container when there is one.
    #[must_use]
    pub fn get_intercept_info(&self, name: &str) -> Option<InterceptInfo> {
        self.intercept_by_name(name).map(|ic| {
            let mut ii = ic.info;
            if !ic.handler_container.is_empty() {
                ii.environment
                    .insert(ENV_HANDLER_CONTAINER.to_owned(), ic.handler_container);
            }
            ii
        })
    }

    /// Specs of the current intercepts of one workload.
    #[must_use]
    pub fn intercepts_for_workload(&self, workload: &str, namespace: &str) -> Vec<InterceptSpec> {
        self.sorted_intercepts()
            .into_iter()
            .filter(|ic| ic.info.spec.agent == workload && ic.info.spec.namespace == namespace)
            .map(|ic| ic.info.spec)
            .collect()
    }

    /// Whether the request to `path` with `headers` is intercepted by the
    /// intercept `caller_id`.
    #[must_use]
    pub fn lookup(&self, caller_id: &str, path: &str, headers: &HeaderMap) -> LookupResult {
        self.state().api.lookup(caller_id, path, headers)
    }

    /// Ports with a running API listener.
    #[must_use]
    pub fn api_ports(&self) -> Vec<u16> {
        self.state().api.ports()
    }

    /// Number of running pod access sessions.
    #[must_use]
    pub fn pod_access_count(&self) -> usize {
        self.pod_access.session_count()
    }

    /// Number of creations waiting for their intercept.
    #[must_use]
    pub fn pending_creations(&self) -> usize {
        self.state().waiters.len()
    }
}

fn traffic_manager_error(err: &AppError) -> Box<InterceptResult> {
    Box::new(InterceptResult::failure(InterceptErrorKind::TrafficManagerError, err))
}

async fn with_timeout<T>(limit: Duration, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(AppError::Timeout(format!("{what}: no answer within {}s", limit.as_secs()))),
    }
}

/// Conflicts of `request` with current intercepts and pending creations.
fn find_conflict(state: &SessionState, request: &CreateInterceptRequest) -> Option<Box<InterceptResult>> {
    if let Some(err) = mount_conflict(state, request) {
        return Some(Box::new(InterceptResult::failure(
            InterceptErrorKind::MountPointBusy,
            &err,
        )));
    }

    let spec = &request.spec;
    let current = state.intercepts.values().map(|ic| (&ic.info.spec, Some(&ic.info)));
    let pending = state.waiters.pending().map(|s| (s, None));
    for (other, record) in current.chain(pending) {
        if other.name == spec.name {
            return Some(Box::new(InterceptResult::failure(
                InterceptErrorKind::AlreadyExists,
                &AppError::User(format!("intercept {} already exists", spec.name)),
            )));
        }
        if spec.target_port != 0 && other.target_port == spec.target_port && other.target_host == spec.target_host {
            let mut result = InterceptResult::failure(
                InterceptErrorKind::LocalTargetInUse,
                &AppError::User(format!(
                    "{}: local target {}:{} is already used by intercept {}",
                    spec.name, spec.target_host, spec.target_port, other.name
                )),
            );
            result.intercept_info = Some(record.cloned().unwrap_or_else(|| InterceptInfo {
                spec: other.clone(),
                ..InterceptInfo::default()
            }));
            return Some(Box::new(result));
        }
    }
    None
}

fn mount_conflict(state: &SessionState, request: &CreateInterceptRequest) -> Option<AppError> {
    let current = state
        .intercepts
        .values()
        .map(|ic| (ic.name(), ic.info.client_mount_point.as_str(), ic.local_mount_port));
    let pending = state.waiters.pending().filter_map(|s| {
        state
            .waiters
            .mount_request(&s.name)
            .map(|m| (s.name.as_str(), m.mount_point.as_str(), m.local_mount_port))
    });
    for (name, mount_point, port) in current.chain(pending) {
        if !request.mount_point.is_empty() && mount_point == request.mount_point {
            return Some(AppError::User(format!(
                "mount point {mount_point} is already in use by intercept {name}"
            )));
        }
        if request.local_mount_port != 0 && port == request.local_mount_port {
            return Some(AppError::User(format!(
                "local mount port {port} is already in use by intercept {name}"
            )));
        }
    }
    None
}
