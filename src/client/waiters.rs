//! Rendezvous between create-intercept calls and snapshot arrival.
//!
//! A caller registers a waiter under the intercept name before it asks the
//! control plane to create the intercept. When a snapshot shows the record
//! leaving `WAITING`, the reconciler takes the waiter out of the registry
//! and fires it once. A waiter whose caller already gave up is dropped
//! with a log line.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::debug;

use crate::client::pod_access::Readiness;
use crate::models::intercept::{InterceptInfo, InterceptSpec};
use crate::Result;

/// Slack for a notification that arrives before the caller starts receiving.
const WAITER_CAPACITY: usize = 2;

/// Mount configuration chosen by the creating caller. Copied into the
/// intercept when its record first arrives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountRequest {
    /// Local mount directory; empty for no mount.
    pub mount_point: String,
    /// Local bridge port to the agent's file server, zero for none.
    pub local_mount_port: u16,
    /// Mount read-only.
    pub read_only: bool,
}

/// Notification delivered to a waiting caller.
#[derive(Debug)]
pub struct WaitOutcome {
    /// The record on success, the reason on failure.
    pub result: Result<InterceptInfo>,
    /// Readiness of the intercept's pod access.
    pub mounts_done: Readiness,
}

/// A registered waiter.
#[derive(Debug)]
pub struct Waiter {
    /// The intercept being created.
    pub spec: InterceptSpec,
    /// Mount configuration of the caller.
    pub mount: MountRequest,
    tx: mpsc::Sender<WaitOutcome>,
}

impl Waiter {
    /// Deliver the outcome without blocking. Returns `false` when the
    /// caller stopped listening; the outcome is dropped.
    pub fn fire(self, name: &str, outcome: WaitOutcome) -> bool {
        match self.tx.try_send(outcome) {
            Ok(()) => true,
            Err(err) => {
                debug!(intercept = %name, %err, "unable to propagate intercept outcome");
                false
            }
        }
    }
}

/// Waiters keyed by intercept name.
///
/// Not synchronized itself; the owning session guards it with the same
/// lock as the intercept set.
#[derive(Debug, Default)]
pub struct WaiterRegistry {
    waiters: HashMap<String, Waiter>,
}

impl WaiterRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `spec.name`, replacing any earlier one.
    pub fn register(&mut self, spec: &InterceptSpec, mount: MountRequest) -> mpsc::Receiver<WaitOutcome> {
        let (tx, rx) = mpsc::channel(WAITER_CAPACITY);
        let waiter = Waiter {
            spec: spec.clone(),
            mount,
            tx,
        };
        if self.waiters.insert(spec.name.clone(), waiter).is_some() {
            debug!(intercept = %spec.name, "replaced pending waiter");
        }
        rx
    }

    /// Whether a waiter is registered for `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.waiters.contains_key(name)
    }

    /// Mount configuration of the waiter for `name`.
    #[must_use]
    pub fn mount_request(&self, name: &str) -> Option<&MountRequest> {
        self.waiters.get(name).map(|w| &w.mount)
    }

    /// Remove and return the waiter for `name`. At most one caller of
    /// `take` obtains a given waiter.
    pub fn take(&mut self, name: &str) -> Option<Waiter> {
        self.waiters.remove(name)
    }

    /// Fire the waiter for `name` if there is one. Returns whether the
    /// outcome was delivered.
    pub fn fire(&mut self, name: &str, outcome: WaitOutcome) -> bool {
        match self.take(name) {
            Some(waiter) => waiter.fire(name, outcome),
            None => false,
        }
    }

    /// Drop the waiter for `name`, closing its channel.
    pub fn unregister(&mut self, name: &str) {
        self.waiters.remove(name);
    }

    /// Number of registered waiters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Whether no waiter is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Specs of the intercepts still being created.
    pub fn pending(&self) -> impl Iterator<Item = &InterceptSpec> {
        self.waiters.values().map(|w| &w.spec)
    }
}
