//! Cluster workloads as seen by the agent provisioner.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Pod-template annotation that enables or disables agent injection.
pub const INJECT_ANNOTATION: &str = "agent-intercept.io/inject-traffic-agent";

/// Pod-template annotation declaring that the agent is injected manually.
pub const MANUAL_INJECT_ANNOTATION: &str = "agent-intercept.io/manually-injected";

/// A named or numbered container port.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct ContainerPort {
    /// Optional port name.
    pub name: String,
    /// Port number.
    pub container_port: u16,
    /// `TCP` or `UDP`; empty means TCP.
    pub protocol: String,
}

/// A container in a workload's pod template.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct Container {
    /// Container name.
    pub name: String,
    /// Container image.
    pub image: String,
    /// Declared ports.
    pub ports: Vec<ContainerPort>,
}

/// A port exposed by a service selecting the workload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct ServicePort {
    /// Optional port name.
    pub name: String,
    /// Service port number.
    pub port: u16,
    /// Target container port, by name or number. Empty means `port`.
    pub target_port: String,
    /// `TCP` or `UDP`; empty means TCP.
    pub protocol: String,
}

/// A service selecting the workload's pods.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct Service {
    /// Service name.
    pub name: String,
    /// Service UID.
    pub uid: String,
    /// Exposed ports.
    pub ports: Vec<ServicePort>,
}

/// A deployable unit in the cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct Workload {
    /// Workload name.
    pub name: String,
    /// Namespace.
    pub namespace: String,
    /// Kind, e.g. `Deployment`.
    pub kind: String,
    /// Pod template annotations.
    pub annotations: HashMap<String, String>,
    /// Pod template containers.
    pub containers: Vec<Container>,
    /// Services whose selector matches the pod template.
    pub services: Vec<Service>,
}

impl Workload {
    /// `<name>.<namespace>`, used in messages.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.name, self.namespace)
    }
}
