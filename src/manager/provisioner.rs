//! Agent provisioning for intercept requests.
//!
//! Before an intercept can be created the workload needs an agent
//! configuration record and at least one live agent. [`AgentProvisioner`]
//! writes or refreshes the record and then races three sources until one
//! decides the outcome: the filtered agent registry, the namespace's
//! non-normal cluster events, and the arrival deadline.

use std::fmt::Write as _;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures_util::FutureExt;
use regex::Regex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, Instrument};

use crate::config::AgentConfigSettings;
use crate::errors::panic_message;
use crate::manager::agents::{workload_filter, AgentRegistry};
use crate::manager::config_store::{AgentConfigStore, ConfigMap};
use crate::manager::generator::generate_agent_config;
use crate::manager::port_matcher::{find_intercept, find_intercept_index};
use crate::manager::ClusterApi;
use crate::models::agent::{AgentConfig, AgentInfo, AGENT_CONTAINER_NAME};
use crate::models::event::ClusterEvent;
use crate::models::intercept::{InterceptInfo, InterceptSpec, MECHANISM_TCP};
use crate::models::result::PreparedIntercept;
use crate::models::workload::{Workload, INJECT_ANNOTATION, MANUAL_INJECT_ANNOTATION};
use crate::{AppError, Result};

/// Event notes that the cluster emits while it still retries on its own.
const TRANSIENT_FAILURES: &[&str] = &[
    "waiting for ephemeral volume",
    "unbound immediate PersistentVolumeClaims",
    "skip schedule deleting pod",
    "nodes are available",
];

/// Events aggregated by the cluster repeat earlier ones.
const COMBINED_EVENT_PREFIX: &str = "(combined from similar events):";

/// Collaborators and settings of the provisioner.
pub struct AgentProvisioner {
    settings: AgentConfigSettings,
    agent_arrival: Duration,
    cluster: Arc<dyn ClusterApi>,
    store: Arc<dyn AgentConfigStore>,
    agents: Arc<AgentRegistry>,
}

/// Accepts the events concerning one workload's pods that were created
/// after the watch started.
struct EventFilter {
    start: DateTime<Utc>,
    name: String,
    pod_prefix: String,
}

impl EventFilter {
    fn new(name: &str) -> Self {
        // Event timestamps have second granularity.
        let now = Utc::now().timestamp();
        let start = Utc.timestamp_opt(now, 0).single().unwrap_or_else(Utc::now);
        Self {
            start,
            name: name.to_owned(),
            pod_prefix: format!("{name}-"),
        }
    }

    fn accepts(&self, ev: &ClusterEvent) -> bool {
        ev.creation_timestamp >= self.start
            && !ev.note.starts_with(COMBINED_EVENT_PREFIX)
            && (ev.regarding.name == self.name || ev.regarding.name.starts_with(&self.pod_prefix))
    }
}

enum EventVerdict {
    Fatal(String),
    Buffer(ClusterEvent),
}

impl AgentProvisioner {
    /// Create a provisioner.
    #[must_use]
    pub fn new(
        settings: AgentConfigSettings,
        agent_arrival: Duration,
        cluster: Arc<dyn ClusterApi>,
        store: Arc<dyn AgentConfigStore>,
        agents: Arc<AgentRegistry>,
    ) -> Self {
        Self {
            settings,
            agent_arrival,
            cluster,
            store,
            agents,
        }
    }

    /// Qualify the request's port against the workload's agent configuration,
    /// provisioning the agent first. Failures, including panics of the
    /// provisioning itself, are embedded in the result.
    pub async fn prepare_intercept(&self, spec: &InterceptSpec) -> PreparedIntercept {
        let span = info_span!(
            "prepare_intercept",
            intercept = %spec.name,
            workload = %spec.agent,
            namespace = %spec.namespace,
        );
        let outcome = AssertUnwindSafe(self.prepare(spec))
            .catch_unwind()
            .instrument(span)
            .await;
        match outcome {
            Ok(Ok(prepared)) => prepared,
            Ok(Err(err)) => {
                error!(intercept = %spec.name, %err, "prepare intercept failed");
                PreparedIntercept::from_error(&err)
            }
            Err(panic) => {
                let err = AppError::Internal(panic_message(panic.as_ref()));
                error!(intercept = %spec.name, %err, "prepare intercept panicked");
                PreparedIntercept::from_error(&err)
            }
        }
    }

    async fn prepare(&self, spec: &InterceptSpec) -> Result<PreparedIntercept> {
        let wl = self.workload(&spec.agent, &spec.namespace, &spec.workload_kind).await?;
        let (ac, _) = self.ensure_agent(&wl, is_extended(spec), Some(spec)).await?;
        let (cn, rule) = find_intercept(&ac, spec)?;
        Ok(PreparedIntercept {
            namespace: ac.namespace.clone(),
            service_uid: rule.service_uid.clone(),
            service_name: rule.service_name.clone(),
            service_port_name: rule.service_port_name.clone(),
            service_port: rule.service_port,
            container_name: cn.name.clone(),
            protocol: rule.protocol().to_owned(),
            container_port: rule.container_port,
            agent_image: ac.agent_image.clone(),
            workload_kind: ac.workload_kind.clone(),
            ..PreparedIntercept::default()
        })
    }

    /// Ensure a live agent for a workload without an intercept request.
    ///
    /// # Errors
    ///
    /// Returns `AppError::User` for unknown or ineligible workloads and the
    /// errors of [`AgentProvisioner::ensure_agent`].
    pub async fn ensure_agent_for(&self, name: &str, namespace: &str) -> Result<Vec<AgentInfo>> {
        let span = info_span!("ensure_agent", workload = %name, %namespace);
        async {
            let wl = self.workload(name, namespace, "").await?;
            let (_, agents) = self.ensure_agent(&wl, false, None).await?;
            Ok(agents)
        }
        .instrument(span)
        .await
    }

    async fn workload(&self, name: &str, namespace: &str, kind: &str) -> Result<Workload> {
        match self.cluster.get_workload(name, namespace, kind).await {
            Ok(wl) => Ok(wl),
            Err(AppError::NotFound(msg)) => {
                error!(workload = %name, %namespace, %msg, "workload not found");
                Err(AppError::User(msg))
            }
            Err(err) => Err(err),
        }
    }

    /// Guarantee a current agent configuration record and at least one
    /// live, non-blacklisted agent for `wl`. Returns the record and the
    /// agents sorted by pod name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::User` for ineligible workloads, missing image
    /// configuration, ambiguous ports and fatal cluster events, and
    /// `AppError::Timeout` with a table of relevant events when no agent
    /// arrives in time.
    pub async fn ensure_agent(
        &self,
        wl: &Workload,
        extended: bool,
        spec: Option<&InterceptSpec>,
    ) -> Result<(AgentConfig, Vec<AgentInfo>)> {
        if !self.settings.injector_enabled {
            return match self.store.get(&wl.name, &wl.namespace).await? {
                Some(ac) => {
                    let agents = self
                        .agents
                        .load_matching(|a| a.name == ac.agent_name && a.namespace == ac.namespace);
                    Ok((ac, agents))
                }
                None => Err(AppError::User(format!(
                    "agent-injector is disabled and no agent has been added manually for {}",
                    wl.qualified_name()
                ))),
            };
        }

        let deadline = Instant::now() + self.agent_arrival;
        let mut events = self.cluster.watch_events(&wl.namespace).await?;
        let filter = EventFilter::new(&wl.name);

        let ac = self
            .get_or_create_agent_config(wl, extended, spec, deadline)
            .await?;

        match self
            .wait_for_agents(&ac.agent_name, &ac.namespace, &mut events, &filter, deadline)
            .await
        {
            Ok(agents) => Ok((ac, agents)),
            Err(err) => {
                // A record without an agent would make the next attempt
                // believe the workload is already provisioned.
                if let Err(drop_err) = self.store.delete(&wl.name, &wl.namespace).await {
                    error!(
                        workload = %wl.qualified_name(),
                        %drop_err,
                        "failed to remove agent config record"
                    );
                }
                Err(err)
            }
        }
    }

    /// Read-modify-write the workload's agent configuration record.
    ///
    /// A missing record is generated. An existing record is updated when
    /// the image changed for an extended request or when the requested
    /// replace policy differs; the workload's agents are then marked
    /// inactive. When a new record is about to be created while agents of
    /// the workload are still registered, this waits for them to depart
    /// first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::User` for ineligible workloads, image problems and
    /// port match failures, and `AppError::Timeout` when stale agents do
    /// not depart before `deadline`.
    pub async fn get_or_create_agent_config(
        &self,
        wl: &Workload,
        extended: bool,
        spec: Option<&InterceptSpec>,
        deadline: Instant,
    ) -> Result<AgentConfig> {
        if !check_intercept_annotations(wl)? {
            return Err(AppError::User(format!(
                "{} {} is not interceptable",
                wl.kind,
                wl.qualified_name()
            )));
        }
        let image = validate_agent_image(
            self.settings.image.as_deref(),
            extended,
            self.settings.extended_supported,
        )?;

        if self.store.get(&wl.name, &wl.namespace).await?.is_none() {
            self.await_stale_agents(wl, deadline).await?;
        }
        let generated = generate_agent_config(wl, &image);

        let agents = &self.agents;
        let mut result: Option<AgentConfig> = None;
        let mut mutate = |cm: &mut ConfigMap| -> Result<bool> {
            let found = cm.get(&wl.name);
            let mut do_update = found.is_none();
            let mut ac = match found {
                Some(existing) => {
                    let mut ac = existing.clone();
                    if ac.agent_image != image && extended {
                        ac.agent_image.clone_from(&image);
                        do_update = true;
                    }
                    ac
                }
                None => generated.clone(),
            };
            if let Some(spec) = spec {
                let idx = find_intercept_index(&ac, spec)?;
                let cn = &mut ac.containers[idx.container];
                if cn.replace != spec.replace {
                    cn.replace = spec.replace;
                    do_update = true;
                }
            }
            let changed = do_update && found != Some(&ac);
            if changed && found.is_some() {
                // Pods of the workload are replaced once the record changes.
                let marked = agents.deactivate_workload(&wl.name, &wl.namespace);
                debug!(workload = %wl.name, marked, "marked agents inactive");
            }
            result = Some(ac.clone());
            if changed {
                cm.insert(wl.name.clone(), ac);
            }
            Ok(changed)
        };
        self.store.update(&wl.namespace, &mut mutate).await?;

        result.ok_or_else(|| {
            AppError::Internal(format!("no agent config produced for {}", wl.qualified_name()))
        })
    }

    async fn await_stale_agents(&self, wl: &Workload, deadline: Instant) -> Result<()> {
        let kind = wl.kind.clone();
        let matches = move |a: &AgentInfo| a.kind.is_empty() || a.kind == kind;
        let stale = self
            .agents
            .load_matching(|a| a.name == wl.name && a.namespace == wl.namespace && matches(a));
        if stale.is_empty() {
            return Ok(());
        }
        debug!(workload = %wl.qualified_name(), count = stale.len(), "waiting for stale agents to depart");

        let base = workload_filter(&wl.name, &wl.namespace);
        let mut sub = self
            .agents
            .subscribe(Box::new(move |a| base(a) && matches(a)));
        loop {
            match tokio::time::timeout_at(deadline, sub.next()).await {
                Err(_) => {
                    return Err(AppError::Timeout(format!(
                        "timed out waiting for stale agents of {} to depart",
                        wl.qualified_name()
                    )))
                }
                Ok(None) => {
                    return Err(AppError::Cancelled(format!(
                        "agent registry closed while waiting for stale agents of {} to depart",
                        wl.qualified_name()
                    )))
                }
                Ok(Some(agents)) if agents.is_empty() => return Ok(()),
                Ok(Some(_)) => {}
            }
        }
    }

    /// Wait until a live, non-blacklisted agent named `name` registers.
    ///
    /// # Errors
    ///
    /// Returns `AppError::User` on a fatal event and `AppError::Timeout`
    /// listing the buffered events when `deadline` passes.
    async fn wait_for_agents(
        &self,
        name: &str,
        namespace: &str,
        events: &mut mpsc::Receiver<ClusterEvent>,
        filter: &EventFilter,
        deadline: Instant,
    ) -> Result<Vec<AgentInfo>> {
        debug!(agent = %name, %namespace, "waiting for agent");
        let mut sub = self.agents.subscribe(workload_filter(name, namespace));
        let crash_rx = Regex::new(&format!(
            r"restarting failed container (\S+) in pod ([0-9A-Za-z_-]+)_{}",
            regex::escape(namespace)
        ))
        .map_err(|err| AppError::Internal(format!("invalid crash pattern: {err}")))?;

        let mut near_misses: Vec<ClusterEvent> = Vec::new();
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                ev = events.recv() => {
                    let Some(ev) = ev else {
                        return Err(AppError::Cluster("event watch closed while waiting for agent".into()));
                    };
                    if !filter.accepts(&ev) {
                        continue;
                    }
                    info!(event_type = %ev.event_type, reason = %ev.reason, note = %ev.note, "cluster event");
                    match self.classify_event(ev, &crash_rx, namespace).await {
                        EventVerdict::Fatal(msg) => return Err(AppError::User(msg)),
                        EventVerdict::Buffer(ev) => near_misses.push(ev),
                    }
                }
                snapshot = sub.next() => {
                    let Some(snapshot) = snapshot else {
                        return Err(AppError::Cancelled(format!(
                            "agent watch closed while waiting for agent {name}.{namespace} to arrive"
                        )));
                    };
                    let live: Vec<AgentInfo> = snapshot
                        .into_iter()
                        .filter(|a| {
                            let blacklisted = self.agents.is_blacklisted(&a.pod_name, &a.namespace);
                            if blacklisted {
                                debug!(pod = %a.pod_name, "pod is blacklisted");
                            }
                            !blacklisted
                        })
                        .collect();
                    if !live.is_empty() {
                        debug!(agent = %name, %namespace, count = live.len(), "agent is ready");
                        return Ok(live);
                    }
                }
                () = &mut sleep => {
                    let mut msg = format!(
                        "request timed out while waiting for agent {name}.{namespace} to arrive"
                    );
                    if !near_misses.is_empty() {
                        msg.push_str(": Events that may be relevant:\n");
                        write_event_list(&mut msg, &near_misses, Utc::now());
                    }
                    return Err(AppError::Timeout(msg));
                }
            }
        }
    }

    async fn classify_event(&self, ev: ClusterEvent, crash_rx: &Regex, namespace: &str) -> EventVerdict {
        match ev.reason.as_str() {
            "BackOff" => {
                if let Some(caps) = crash_rx.captures(&ev.note) {
                    let container = caps.get(1).map_or("", |m| m.as_str());
                    let pod = caps.get(2).map_or("", |m| m.as_str());
                    match self.cluster.pod_logs(pod, namespace, container).await {
                        Ok(log) => info!(%pod, %container, "log from failing pod\n{log}"),
                        Err(err) => error!(%pod, %container, %err, "failed to read log from failing pod"),
                    }
                }
                EventVerdict::Fatal(format!(
                    "{}\nThe logs of {} {} might provide more details",
                    ev.note, ev.regarding.kind, ev.regarding.name
                ))
            }
            "Failed" | "FailedCreate" | "FailedScheduling" => {
                if ev.event_type == "Warning"
                    && TRANSIENT_FAILURES.iter().any(|s| ev.note.contains(s))
                {
                    EventVerdict::Buffer(ev)
                } else {
                    EventVerdict::Fatal(format!(
                        "{}\nHint: if the error mentions resource quota, the traffic-agent's \
                         requested resources can be configured in the agent settings",
                        ev.note
                    ))
                }
            }
            _ => EventVerdict::Buffer(ev),
        }
    }

    /// Flip the replace policy of an ended intercept's container back so
    /// that the app container returns. The workload's agents are marked
    /// inactive and their pods blacklisted until they are replaced.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub async fn restore_app_container(&self, info: &InterceptInfo) -> Result<()> {
        let spec = &info.spec;
        let span = info_span!("restore_app_container", id = %info.id, workload = %spec.agent);
        let agents = &self.agents;
        let mut mutate = |cm: &mut ConfigMap| -> Result<bool> {
            let Some(existing) = cm.get(&spec.agent) else {
                return Ok(false);
            };
            let mut ac = existing.clone();
            let Ok(idx) = find_intercept_index(&ac, spec) else {
                return Ok(false);
            };
            if !ac.containers[idx.container].replace {
                return Ok(false);
            }
            ac.containers[idx.container].replace = false;
            agents.deactivate_workload(&spec.agent, &spec.namespace);
            for agent in agents.load_matching(|a| a.name == spec.agent && a.namespace == spec.namespace) {
                agents.blacklist(&agent.pod_name, &spec.namespace);
            }
            cm.insert(spec.agent.clone(), ac);
            Ok(true)
        };
        self.store
            .update(&spec.namespace, &mut mutate)
            .instrument(span)
            .await
    }
}

/// Whether a request needs an agent that supports more than plain TCP.
#[must_use]
pub fn is_extended(spec: &InterceptSpec) -> bool {
    !spec.mechanism.is_empty() && spec.mechanism != MECHANISM_TCP
}

/// Decide from the pod-template annotations whether the workload may get
/// an agent. An explicit inject annotation overrides the manual-injection
/// marker, and manual injection requires the agent container to be present.
///
/// # Errors
///
/// Returns `AppError::User` for an invalid annotation value or a manually
/// injected workload without agent container.
pub fn check_intercept_annotations(wl: &Workload) -> Result<bool> {
    let manual = wl
        .annotations
        .get(MANUAL_INJECT_ANNOTATION)
        .is_some_and(|v| v == "true");
    let enabled = match wl.annotations.get(INJECT_ANNOTATION).map(String::as_str) {
        None | Some("") => !manual,
        Some("enabled") => true,
        Some("false" | "disabled") => false,
        Some(other) => {
            return Err(AppError::User(format!(
                "{other} is not a valid value for the {INJECT_ANNOTATION} annotation of {}",
                wl.qualified_name()
            )))
        }
    };
    if !manual {
        return Ok(enabled);
    }
    if wl.containers.iter().any(|cn| cn.name == AGENT_CONTAINER_NAME) {
        Ok(true)
    } else {
        Err(AppError::User(format!(
            "annotation {MANUAL_INJECT_ANNOTATION}=true on {} but pod has no {AGENT_CONTAINER_NAME} container",
            wl.qualified_name()
        )))
    }
}

/// Check that an agent image is configured and supports the request.
///
/// # Errors
///
/// Returns `AppError::User` when intercepts are disabled for lack of an
/// image, or when an extended agent is required but not supported.
pub fn validate_agent_image(image: Option<&str>, extended: bool, extended_supported: bool) -> Result<String> {
    match image {
        None | Some("") => Err(AppError::User(
            "intercepts are disabled because the traffic-manager is unable to determine \
             what image to use for injected traffic-agents."
                .into(),
        )),
        Some(_) if extended && !extended_supported => Err(AppError::User(
            "traffic-manager does not support intercepts that require an extended traffic-agent"
                .into(),
        )),
        Some(image) => Ok(image.to_owned()),
    }
}

/// Render events as an aligned table with the columns
/// `AGE TYPE REASON OBJECT MESSAGE`.
pub fn write_event_list(out: &mut String, events: &[ClusterEvent], now: DateTime<Utc>) {
    let age = |e: &ClusterEvent| {
        let secs = (now - e.creation_timestamp).num_seconds().max(0);
        format_age(secs.unsigned_abs())
    };
    let mut widths = ["AGE".len(), "TYPE".len(), "REASON".len(), "OBJECT".len()];
    for e in events {
        widths[0] = widths[0].max(age(e).len());
        widths[1] = widths[1].max(e.event_type.len());
        widths[2] = widths[2].max(e.reason.len());
        widths[3] = widths[3].max(e.object().len());
    }
    let [a, t, r, o] = widths.map(|w| w + 3);
    let _ = writeln!(out, "{:<a$}{:<t$}{:<r$}{:<o$}MESSAGE", "AGE", "TYPE", "REASON", "OBJECT");
    for e in events {
        let _ = writeln!(
            out,
            "{:<a$}{:<t$}{:<r$}{:<o$}{}",
            age(e),
            e.event_type,
            e.reason,
            e.object(),
            e.note
        );
    }
}

fn format_age(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{s}s")
    }
}
