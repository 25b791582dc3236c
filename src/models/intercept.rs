//! Intercept records exchanged with the control plane.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Mechanism that routes all traffic for a port, without filtering.
pub const MECHANISM_TCP: &str = "tcp";

/// Agent environment variable that announces the agent's local API port.
pub const ENV_API_PORT: &str = "AGENT_API_PORT";

/// Environment key added to intercept info when its handler runs in a container.
pub const ENV_HANDLER_CONTAINER: &str = "HANDLER_CONTAINER_NAME";

/// Server-reported lifecycle state of an intercept record.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Disposition {
    /// Agent exists, injection or activation pending.
    #[default]
    Waiting,
    /// Traffic is being routed.
    Active,
    /// No agent could be found for the workload.
    NoAgent,
    /// The agent does not support the requested mechanism.
    NoMechanism,
    /// The agent declares no port matching the request.
    NoPorts,
    /// The agent reported an error.
    AgentError,
    /// The request arguments were rejected.
    BadArgs,
    /// The intercept was removed on the server.
    Removed,
    /// The creating client is gone.
    NoClient,
    /// A disposition this client does not know. Treated as a failure.
    #[serde(other)]
    Unknown,
}

impl Disposition {
    /// Every disposition other than `Waiting` and `Active` ends a pending creation.
    #[must_use]
    pub fn is_terminal_failure(self) -> bool {
        !matches!(self, Self::Waiting | Self::Active)
    }
}

impl Display for Disposition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Waiting => "WAITING",
            Self::Active => "ACTIVE",
            Self::NoAgent => "NO_AGENT",
            Self::NoMechanism => "NO_MECHANISM",
            Self::NoPorts => "NO_PORTS",
            Self::AgentError => "AGENT_ERROR",
            Self::BadArgs => "BAD_ARGS",
            Self::Removed => "REMOVED",
            Self::NoClient => "NO_CLIENT",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Everything the client asks for when creating an intercept.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct InterceptSpec {
    /// Client-unique intercept name.
    pub name: String,
    /// Identity of the creating client.
    pub client: String,
    /// Target workload (and agent) name.
    pub agent: String,
    /// Workload kind, e.g. `Deployment`.
    pub workload_kind: String,
    /// Namespace of the workload.
    pub namespace: String,
    /// Container the traffic is destined for.
    pub container_name: String,
    /// Routing mechanism; `tcp` routes everything.
    pub mechanism: String,
    /// Mechanism arguments such as header filters.
    pub mechanism_args: Vec<String>,
    /// Local destination host.
    pub target_host: String,
    /// Local destination port; zero until resolved.
    pub target_port: u16,
    /// Service name used to disambiguate the port.
    pub service_name: String,
    /// UID of the resolved service.
    pub service_uid: String,
    /// Resolved service port name.
    pub service_port_name: String,
    /// Resolved service port number.
    pub service_port: u16,
    /// Port identifier (`<name|number>[/<protocol>]`) to disambiguate the port.
    pub port_identifier: String,
    /// Resolved protocol.
    pub protocol: String,
    /// Resolved container port.
    pub container_port: u16,
    /// Additional local ports to forward from the pod.
    pub local_ports: Vec<String>,
    /// Replace the app container instead of running alongside it.
    pub replace: bool,
    /// Expected client/cluster round trip.
    pub roundtrip_latency_ms: u64,
    /// Dial timeout for the local target.
    pub dial_timeout_ms: u64,
}

/// Intercept record as pushed by the control plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct InterceptInfo {
    /// Server-assigned opaque ID.
    pub id: String,
    /// The request that created the intercept.
    pub spec: InterceptSpec,
    /// Current lifecycle state.
    pub disposition: Disposition,
    /// Detail accompanying a failure disposition.
    pub message: String,
    /// IP of the pod whose agent serves the intercept.
    pub pod_ip: String,
    /// Agent SFTP port for mounting, zero when unavailable.
    pub sftp_port: u16,
    /// Agent FTP port for mounting, zero when unavailable.
    pub ftp_port: u16,
    /// Server-visible mount root.
    pub mount_point: String,
    /// Client-visible mount point. Never set by the server.
    pub client_mount_point: String,
    /// Environment of the intercepted container.
    pub environment: HashMap<String, String>,
    /// Metadata returned to intercepted processes on a matching request.
    pub metadata: HashMap<String, String>,
    /// Header rules selecting the requests that are intercepted.
    pub headers: HashMap<String, String>,
    /// Human readable description of the mechanism filter.
    pub mechanism_args_desc: String,
}

impl InterceptInfo {
    /// Declared local ports of the intercept.
    #[must_use]
    pub fn local_ports(&self) -> &[String] {
        &self.spec.local_ports
    }

    /// Agent API port announced through the environment, if any.
    ///
    /// # Errors
    ///
    /// Returns the raw value when it is present but not a valid port.
    pub fn agent_api_port(&self) -> std::result::Result<Option<u16>, String> {
        match self.environment.get(ENV_API_PORT) {
            None => Ok(None),
            Some(raw) => match raw.parse::<u16>() {
                Ok(0) => Ok(None),
                Ok(port) => Ok(Some(port)),
                Err(_) => Err(raw.clone()),
            },
        }
    }
}

/// One full point-in-time list of the session's intercept records.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct InterceptSnapshot {
    /// Every record currently known to the control plane for this session.
    pub intercepts: Vec<InterceptInfo>,
}

/// Identifies a client session to the control plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionInfo {
    /// Session identifier.
    pub session_id: String,
    /// Client name.
    pub client: String,
    /// Session namespace.
    pub namespace: String,
}
