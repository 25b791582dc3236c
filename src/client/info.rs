//! Presentation of intercept records for `list` and `info` output.

use std::collections::HashMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::models::intercept::{Disposition, InterceptInfo, MECHANISM_TCP};

/// Local state of an intercept's volume mount.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct MountInfo {
    /// Local mount directory.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub local_dir: String,
    /// Remote mount root.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub remote_dir: String,
    /// Why the mount is unavailable.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// User-facing view of one intercept.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct Info {
    /// Intercept ID.
    pub id: String,
    /// Intercept name.
    pub name: String,
    /// Lifecycle state.
    pub disposition: Disposition,
    /// Failure detail.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Kind of the intercepted workload.
    pub workload_kind: String,
    /// Local destination host.
    pub target_host: String,
    /// Local destination port.
    pub target_port: u16,
    /// UID of the intercepted service, empty for container ports.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub service_uid: String,
    /// Port identifier of the intercepted port.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub port_id: String,
    /// Intercepted container port.
    pub container_port: u16,
    /// Environment of the intercepted container.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub environment: HashMap<String, String>,
    /// Volume mount.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount: Option<MountInfo>,
    /// Description of the traffic filter.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub filter_desc: String,
    /// Intercept metadata.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    /// Raw mechanism arguments.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub http_filter: Vec<String>,
    /// All traffic is intercepted.
    pub global: bool,
    /// IP of the intercepted pod.
    pub pod_ip: String,
    /// Include debug fields when rendering.
    #[serde(skip)]
    pub debug: bool,
}

impl Info {
    /// Build the view of `ii`. A mount error replaces the mount details.
    #[must_use]
    pub fn new(ii: &InterceptInfo, mount_error: Option<&str>) -> Self {
        let spec = &ii.spec;
        let mount = match mount_error {
            Some(err) => Some(MountInfo {
                error: err.to_owned(),
                ..MountInfo::default()
            }),
            None if !ii.mount_point.is_empty() => Some(MountInfo {
                local_dir: ii.client_mount_point.clone(),
                remote_dir: ii.mount_point.clone(),
                error: String::new(),
            }),
            None => None,
        };
        Self {
            id: ii.id.clone(),
            name: spec.name.clone(),
            disposition: ii.disposition,
            message: ii.message.clone(),
            workload_kind: spec.workload_kind.clone(),
            target_host: spec.target_host.clone(),
            target_port: spec.target_port,
            service_uid: spec.service_uid.clone(),
            port_id: spec.port_identifier.clone(),
            container_port: spec.container_port,
            environment: ii.environment.clone(),
            mount,
            filter_desc: ii.mechanism_args_desc.clone(),
            metadata: ii.metadata.clone(),
            http_filter: spec.mechanism_args.clone(),
            global: spec.mechanism.is_empty() || spec.mechanism == MECHANISM_TCP,
            pod_ip: ii.pod_ip.clone(),
            debug: false,
        }
    }

    /// Render an aligned key/value block.
    #[must_use]
    pub fn render(&self) -> String {
        let mut kv: Vec<(&str, String)> = Vec::new();
        kv.push(("Intercept name", self.name.clone()));

        let mut state = String::new();
        if self.disposition.is_terminal_failure() {
            state.push_str("error: ");
        }
        state.push_str(&self.disposition.to_string());
        if !self.message.is_empty() {
            let _ = write!(state, ": {}", self.message);
        }
        kv.push(("State", state));
        kv.push(("Workload kind", self.workload_kind.clone()));
        if self.debug {
            kv.push(("ID", self.id.clone()));
        }
        kv.push(("Destination", join_host_port(&self.target_host, self.target_port)));

        if !self.port_id.is_empty() {
            let key = if self.service_uid.is_empty() {
                "Container Port Identifier"
            } else {
                "Service Port Identifier"
            };
            kv.push((key, self.port_id.clone()));
        }
        if self.debug {
            kv.push(("Mechanism", if self.global { "tcp" } else { "http" }.to_owned()));
            kv.push(("Mechanism Command", format!("{:?}", self.filter_desc)));
            let mut metadata: Vec<_> = self.metadata.iter().collect();
            metadata.sort();
            kv.push(("Metadata", format!("{metadata:?}")));
        }

        if let Some(m) = &self.mount {
            if !m.local_dir.is_empty() {
                kv.push(("Volume Mount Point", m.local_dir.clone()));
            } else if !m.error.is_empty() {
                kv.push(("Volume Mount Error", m.error.clone()));
            }
        }

        let intercepting = if !self.filter_desc.is_empty() {
            self.filter_desc.clone()
        } else if self.global {
            format!("using mechanism {MECHANISM_TCP:?}")
        } else {
            format!("using mechanism=\"http\" with args={:?}", self.http_filter)
        };
        kv.push(("Intercepting", intercepting));
        if self.service_uid.is_empty() {
            kv.push(("Address", join_host_port(&self.pod_ip, self.container_port)));
        }

        let width = kv.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
        let mut out = String::new();
        for (key, value) in kv {
            let _ = writeln!(out, "   {:<width$}: {value}", key);
        }
        out
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
