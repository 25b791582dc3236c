//! Agent configuration records and port identifiers.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Name of the injected agent container.
pub const AGENT_CONTAINER_NAME: &str = "traffic-agent";

/// Default protocol of a port.
pub const PROTOCOL_TCP: &str = "TCP";

/// One interceptable port declared for a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct InterceptRule {
    /// UID of the service exposing the port; empty for container-only ports.
    pub service_uid: String,
    /// Name of the service exposing the port.
    pub service_name: String,
    /// Service port name, may be empty.
    pub service_port_name: String,
    /// Service port number.
    pub service_port: u16,
    /// Container port name, may be empty.
    pub container_port_name: String,
    /// Container port number.
    pub container_port: u16,
    /// `TCP` or `UDP`.
    pub protocol: String,
}

impl InterceptRule {
    /// Protocol, defaulting to TCP.
    #[must_use]
    pub fn protocol(&self) -> &str {
        if self.protocol.is_empty() {
            PROTOCOL_TCP
        } else {
            &self.protocol
        }
    }
}

/// Per-container section of an agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct AgentContainer {
    /// Container name.
    pub name: String,
    /// Whether the agent replaces this container while it is intercepted.
    pub replace: bool,
    /// Interceptable ports.
    pub intercepts: Vec<InterceptRule>,
}

/// Persisted description of a workload's agent and interceptable ports.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct AgentConfig {
    /// Name the agent registers with; equals the workload name.
    pub agent_name: String,
    /// Namespace of the workload.
    pub namespace: String,
    /// Workload name.
    pub workload_name: String,
    /// Workload kind.
    pub workload_kind: String,
    /// Agent image.
    pub agent_image: String,
    /// Containers with interceptable ports.
    pub containers: Vec<AgentContainer>,
}

/// A live agent as registered with the control plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct AgentInfo {
    /// Control-plane session of the agent.
    pub session_id: String,
    /// Agent name; equals the workload name.
    pub name: String,
    /// Namespace.
    pub namespace: String,
    /// Workload kind.
    pub kind: String,
    /// Pod hosting the agent.
    pub pod_name: String,
    /// IP of that pod.
    pub pod_ip: String,
    /// Agent version.
    pub version: String,
}

/// Identifies a port by name or number with an optional protocol,
/// written `<name|number>[/<protocol>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortIdentifier {
    port: PortRef,
    protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PortRef {
    Number(u16),
    Name(String),
}

impl PortIdentifier {
    /// Parse a port identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::User` when the port part is neither a valid port
    /// number nor a valid port name, or the protocol is unknown.
    pub fn parse(raw: &str) -> Result<Self> {
        let (port, protocol) = match raw.split_once('/') {
            Some((port, proto)) => (port, proto.to_ascii_uppercase()),
            None => (raw, PROTOCOL_TCP.to_owned()),
        };
        if protocol != "TCP" && protocol != "UDP" {
            return Err(AppError::User(format!(
                "invalid protocol {protocol:?} in port identifier {raw:?}"
            )));
        }
        let port = match port.parse::<u16>() {
            Ok(0) => {
                return Err(AppError::User(format!(
                    "port number must be greater than zero in port identifier {raw:?}"
                )))
            }
            Ok(number) => PortRef::Number(number),
            Err(_) if is_port_name(port) => PortRef::Name(port.to_owned()),
            Err(_) => {
                return Err(AppError::User(format!(
                    "invalid port name or number in port identifier {raw:?}"
                )))
            }
        };
        Ok(Self { port, protocol })
    }

    /// Build a port identifier from a protocol and a port name or number.
    ///
    /// # Errors
    ///
    /// Same as [`PortIdentifier::parse`].
    pub fn new(protocol: &str, port: &str) -> Result<Self> {
        if protocol.is_empty() || protocol.eq_ignore_ascii_case(PROTOCOL_TCP) {
            Self::parse(port)
        } else {
            Self::parse(&format!("{port}/{protocol}"))
        }
    }

    /// Whether `rule` is exposed by its service through this identifier.
    #[must_use]
    pub fn is_for_service(&self, rule: &InterceptRule) -> bool {
        if !self.protocol.eq_ignore_ascii_case(rule.protocol()) {
            return false;
        }
        match &self.port {
            PortRef::Number(n) => *n == rule.service_port,
            PortRef::Name(name) => *name == rule.service_port_name,
        }
    }

    /// Whether `rule`'s container port is referenced by this identifier.
    #[must_use]
    pub fn is_for_container(&self, rule: &InterceptRule) -> bool {
        if !self.protocol.eq_ignore_ascii_case(rule.protocol()) {
            return false;
        }
        match &self.port {
            PortRef::Number(n) => *n == rule.container_port,
            PortRef::Name(name) => *name == rule.container_port_name,
        }
    }
}

impl Display for PortIdentifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.port {
            PortRef::Number(n) => write!(f, "{n}")?,
            PortRef::Name(name) => f.write_str(name)?,
        }
        if self.protocol != PROTOCOL_TCP {
            write!(f, "/{}", self.protocol)?;
        }
        Ok(())
    }
}

/// IANA service name: 1-15 lowercase alphanumerics or dashes, with at least
/// one letter and no leading, trailing, or doubled dash.
fn is_port_name(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 15
        && s.bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && s.bytes().any(|b| b.is_ascii_lowercase())
        && !s.starts_with('-')
        && !s.ends_with('-')
        && !s.contains("--")
}
