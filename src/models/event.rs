//! Cluster events observed while waiting for an agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Object an event refers to.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct ObjectRef {
    /// Object kind, e.g. `Pod`.
    pub kind: String,
    /// Object name.
    pub name: String,
}

/// A non-normal cluster event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ClusterEvent {
    /// Event type, e.g. `Warning`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Machine readable reason, e.g. `BackOff`.
    pub reason: String,
    /// Human readable note.
    pub note: String,
    /// Object the event is about.
    pub regarding: ObjectRef,
    /// Creation time.
    pub creation_timestamp: DateTime<Utc>,
}

impl ClusterEvent {
    /// `<kind>/<name>` of the regarded object, lower-cased kind.
    #[must_use]
    pub fn object(&self) -> String {
        format!(
            "{}/{}",
            self.regarding.kind.to_ascii_lowercase(),
            self.regarding.name
        )
    }
}
