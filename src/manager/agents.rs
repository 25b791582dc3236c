//! Registry of live agent sessions.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use tokio::sync::watch;
use tracing::debug;

use crate::models::agent::AgentInfo;

/// Predicate selecting the agents a subscriber is interested in.
pub type AgentFilter = Box<dyn Fn(&AgentInfo) -> bool + Send + Sync>;

struct AgentSession {
    info: AgentInfo,
    active: bool,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<String, AgentSession>,
    blacklist: HashSet<(String, String)>,
}

impl RegistryState {
    fn snapshot(&self) -> Vec<AgentInfo> {
        self.sessions.values().map(|s| s.info.clone()).collect()
    }
}

/// Agents currently registered with the control plane.
///
/// Every registration change is published on a watch channel, so that
/// subscribers observe each new state as a whole.
pub struct AgentRegistry {
    state: Mutex<RegistryState>,
    published: watch::Sender<Vec<AgentInfo>>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        let (published, _) = watch::channel(Vec::new());
        Self {
            state: Mutex::new(RegistryState::default()),
            published,
        }
    }

    /// Register an agent session keyed by `info.session_id`.
    pub fn register(&self, info: AgentInfo) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(session_id = %info.session_id, agent = %info.name, pod = %info.pod_name, "agent arrived");
        state.sessions.insert(
            info.session_id.clone(),
            AgentSession { info, active: true },
        );
        self.published.send_replace(state.snapshot());
    }

    /// Remove an agent session.
    pub fn depart(&self, session_id: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.sessions.remove(session_id).is_some() {
            debug!(session_id, "agent departed");
            self.published.send_replace(state.snapshot());
        }
    }

    /// Registered agents accepted by `filter`, sorted by pod name.
    #[must_use]
    pub fn load_matching(&self, filter: impl Fn(&AgentInfo) -> bool) -> Vec<AgentInfo> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut agents: Vec<AgentInfo> = state
            .sessions
            .values()
            .map(|s| &s.info)
            .filter(|a| filter(a))
            .cloned()
            .collect();
        sort_agents(&mut agents);
        agents
    }

    /// Mark every session of a workload inactive. Inactive agents stay
    /// registered until their pods are replaced but no longer review
    /// intercepts. Returns the number of sessions marked.
    pub fn deactivate_workload(&self, name: &str, namespace: &str) -> usize {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut count = 0;
        for session in state.sessions.values_mut() {
            if session.info.name == name && session.info.namespace == namespace {
                session.active = false;
                count += 1;
            }
        }
        count
    }

    /// Whether a session is registered and active.
    #[must_use]
    pub fn is_active(&self, session_id: &str) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.sessions.get(session_id).is_some_and(|s| s.active)
    }

    /// Exclude a pod from agent-arrival results until it is gone.
    pub fn blacklist(&self, pod_name: &str, namespace: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .blacklist
            .insert((pod_name.to_owned(), namespace.to_owned()));
    }

    /// Whether a pod is blacklisted.
    #[must_use]
    pub fn is_blacklisted(&self, pod_name: &str, namespace: &str) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .blacklist
            .contains(&(pod_name.to_owned(), namespace.to_owned()))
    }

    /// Subscribe to the subset of agents accepted by `filter`.
    #[must_use]
    pub fn subscribe(&self, filter: AgentFilter) -> AgentSubscription {
        AgentSubscription {
            rx: self.published.subscribe(),
            filter,
            primed: false,
        }
    }
}

/// Filtered view of registry changes.
pub struct AgentSubscription {
    rx: watch::Receiver<Vec<AgentInfo>>,
    filter: AgentFilter,
    primed: bool,
}

impl AgentSubscription {
    /// The current subset on first call, then the subset after each change.
    /// Returns `None` when the registry is gone.
    ///
    /// Cancel safe.
    pub async fn next(&mut self) -> Option<Vec<AgentInfo>> {
        if self.primed {
            self.rx.changed().await.ok()?;
        } else {
            self.primed = true;
        }
        let mut agents: Vec<AgentInfo> = self
            .rx
            .borrow_and_update()
            .iter()
            .filter(|a| (self.filter)(a))
            .cloned()
            .collect();
        sort_agents(&mut agents);
        Some(agents)
    }
}

fn sort_agents(agents: &mut [AgentInfo]) {
    agents.sort_by(|a, b| a.pod_name.cmp(&b.pod_name));
}

/// Filter accepting the agents of one workload.
#[must_use]
pub fn workload_filter(name: &str, namespace: &str) -> AgentFilter {
    let name = name.to_owned();
    let namespace = namespace.to_owned();
    Box::new(move |a| a.name == name && a.namespace == namespace)
}
