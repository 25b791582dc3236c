//! Global configuration parsing and validation.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::{AppError, Result};

/// Control-plane connection settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ManagerConfig {
    /// `host:port` of the control-plane endpoint.
    pub address: String,
    /// First reconnect delay after the intercept stream fails.
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,
    /// Upper bound for the reconnect delay.
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

fn default_retry_initial_ms() -> u64 {
    250
}

fn default_retry_max_ms() -> u64 {
    5000
}

/// Configurable timeout values for blocking flows.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Whole create-intercept wait, covering activation and mount readiness.
    #[serde(default = "default_intercept_seconds")]
    pub intercept_seconds: u64,
    /// Single control-plane request.
    #[serde(default = "default_manager_api_seconds")]
    pub manager_api_seconds: u64,
    /// Wait for a live agent after its configuration was written.
    #[serde(default = "default_agent_arrival_seconds")]
    pub agent_arrival_seconds: u64,
    /// Detached best-effort removal of a half-created intercept.
    #[serde(default = "default_remove_seconds")]
    pub remove_seconds: u64,
    /// Expected client/cluster round trip, forwarded to the agent.
    #[serde(default = "default_roundtrip_latency_ms")]
    pub roundtrip_latency_ms: u64,
    /// Dial timeout for the local intercept target, forwarded to the agent.
    #[serde(default = "default_endpoint_dial_ms")]
    pub endpoint_dial_ms: u64,
}

fn default_intercept_seconds() -> u64 {
    30
}

fn default_manager_api_seconds() -> u64 {
    10
}

fn default_agent_arrival_seconds() -> u64 {
    30
}

fn default_remove_seconds() -> u64 {
    5
}

fn default_roundtrip_latency_ms() -> u64 {
    2000
}

fn default_endpoint_dial_ms() -> u64 {
    3000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            intercept_seconds: default_intercept_seconds(),
            manager_api_seconds: default_manager_api_seconds(),
            agent_arrival_seconds: default_agent_arrival_seconds(),
            remove_seconds: default_remove_seconds(),
            roundtrip_latency_ms: default_roundtrip_latency_ms(),
            endpoint_dial_ms: default_endpoint_dial_ms(),
        }
    }
}

impl TimeoutConfig {
    /// Deadline for a whole create-intercept call.
    #[must_use]
    pub fn intercept(&self) -> Duration {
        Duration::from_secs(self.intercept_seconds)
    }

    /// Deadline for a single control-plane request.
    #[must_use]
    pub fn manager_api(&self) -> Duration {
        Duration::from_secs(self.manager_api_seconds)
    }

    /// Deadline for agent arrival.
    #[must_use]
    pub fn agent_arrival(&self) -> Duration {
        Duration::from_secs(self.agent_arrival_seconds)
    }

    /// Deadline for detached cleanup.
    #[must_use]
    pub fn remove(&self) -> Duration {
        Duration::from_secs(self.remove_seconds)
    }
}

/// Traffic-agent provisioning settings (control-plane side).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfigSettings {
    /// Image used for injected agents. Intercepts are disabled when absent.
    #[serde(default)]
    pub image: Option<String>,
    /// Whether the injector webhook manages agents.
    #[serde(default = "default_true")]
    pub injector_enabled: bool,
    /// Whether agents supporting non-`tcp` mechanisms can be provisioned.
    #[serde(default)]
    pub extended_supported: bool,
}

impl Default for AgentConfigSettings {
    fn default() -> Self {
        Self {
            image: None,
            injector_enabled: true,
            extended_supported: false,
        }
    }
}

/// External mount program settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct MountConfig {
    /// Whether remote volumes are mounted at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Mount program.
    #[serde(default = "default_mount_command")]
    pub command: String,
    /// Arguments; `{host}`, `{port}`, `{remote}`, `{local}` and `{ro}` are expanded.
    #[serde(default = "default_mount_args")]
    pub args: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_mount_command() -> String {
    "sshfs".into()
}

fn default_mount_args() -> Vec<String> {
    vec![
        "-f".into(),
        "-p".into(),
        "{port}".into(),
        "{host}:{remote}".into(),
        "{local}".into(),
    ]
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: default_mount_command(),
            args: default_mount_args(),
        }
    }
}

fn default_ipc_name() -> String {
    "agent-intercept".into()
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Namespace shared by every intercept of the session.
    pub namespace: String,
    /// Identifies this client to the control plane.
    pub client_name: String,
    /// Constrained execution mode: mounts are never attempted.
    #[serde(default)]
    pub pod_daemon: bool,
    /// Named pipe / Unix socket identifier.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Control-plane connection.
    pub manager: ManagerConfig,
    /// Timeout configuration for blocking flows.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Agent provisioning settings.
    #[serde(default)]
    pub agent: AgentConfigSettings,
    /// Remote volume mounting.
    #[serde(default)]
    pub mount: MountConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Whether mount sessions may be started.
    #[must_use]
    pub fn mounts_enabled(&self) -> bool {
        self.mount.enabled && !self.pod_daemon
    }

    fn validate(&mut self) -> Result<()> {
        self.namespace = self.namespace.trim().to_owned();
        if self.namespace.is_empty() {
            return Err(AppError::Config("namespace must not be empty".into()));
        }

        if self.client_name.trim().is_empty() {
            return Err(AppError::Config("client_name must not be empty".into()));
        }

        if self.manager.address.trim().is_empty() {
            return Err(AppError::Config("manager.address must not be empty".into()));
        }

        if self.manager.retry_initial_ms == 0 {
            return Err(AppError::Config(
                "manager.retry_initial_ms must be greater than zero".into(),
            ));
        }

        if self.manager.retry_max_ms < self.manager.retry_initial_ms {
            warn!(
                retry_initial_ms = self.manager.retry_initial_ms,
                retry_max_ms = self.manager.retry_max_ms,
                "retry_max_ms below retry_initial_ms, clamping"
            );
            self.manager.retry_max_ms = self.manager.retry_initial_ms;
        }

        if self.timeouts.intercept_seconds == 0 {
            return Err(AppError::Config(
                "timeouts.intercept_seconds must be greater than zero".into(),
            ));
        }

        if self.mount.enabled && self.mount.command.trim().is_empty() {
            return Err(AppError::Config(
                "mount.command must not be empty when mounts are enabled".into(),
            ));
        }

        Ok(())
    }
}
