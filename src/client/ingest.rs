//! Ingests: workload containers accessed without routing their traffic.
//!
//! An ingest is tracked by `(workload, container)` rather than by a
//! server-assigned ID. It owns a handler like an intercept does, and the
//! handler is stopped when the ingest is removed or the session is left.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::client::handler::Handler;

/// Identity of an ingest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IngestKey {
    /// Workload name.
    pub workload: String,
    /// Container name.
    pub container: String,
}

impl IngestKey {
    /// Build a key.
    #[must_use]
    pub fn new(workload: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            workload: workload.into(),
            container: container.into(),
        }
    }

    /// Parse the `workload/container` form.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let (workload, container) = raw.split_once('/')?;
        if workload.is_empty() || container.is_empty() {
            return None;
        }
        Some(Self::new(workload, container))
    }
}

impl Display for IngestKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.workload, self.container)
    }
}

/// What the client knows about an ingested container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct IngestInfo {
    /// Workload kind.
    pub workload_kind: String,
    /// IP of the ingested pod.
    pub pod_ip: String,
    /// Local directory the container's volumes are mounted on.
    pub mount_point: String,
    /// Environment of the container.
    pub environment: std::collections::HashMap<String, String>,
}

/// A tracked ingest.
#[derive(Debug, Clone, Default)]
pub struct Ingest {
    /// Details reported when the ingest was added.
    pub info: IngestInfo,
    /// Handler process id, zero for none.
    pub handler_pid: u32,
    /// Handler container, empty for none.
    pub handler_container: String,
}

impl Ingest {
    /// Create an ingest without a handler.
    #[must_use]
    pub fn new(info: IngestInfo) -> Self {
        Self {
            info,
            ..Self::default()
        }
    }

    /// The handler to stop on removal.
    #[must_use]
    pub fn handler(&self) -> Option<Handler> {
        Handler::from_parts(self.handler_pid, &self.handler_container)
    }
}
