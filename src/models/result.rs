//! Request and result types of the create-intercept flow.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::errors::ErrorCategory;
use crate::models::intercept::{InterceptInfo, InterceptSpec};
use crate::AppError;

/// Client request to create an intercept.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct CreateInterceptRequest {
    /// What to intercept.
    pub spec: InterceptSpec,
    /// Local directory the remote volumes are mounted on. Empty disables the mount.
    pub mount_point: String,
    /// Local port of a TCP bridge to the agent's file server, zero for none.
    pub local_mount_port: u16,
    /// Mount read-only.
    pub read_only: bool,
}

/// Control-plane answer to a prepare request: the request's port
/// identifiers qualified against the workload's agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct PreparedIntercept {
    /// Failure text; empty on success.
    pub error: String,
    /// Numeric [`ErrorCategory`] code of `error`.
    pub error_category: i32,
    /// Namespace of the workload.
    pub namespace: String,
    /// UID of the matched service, empty for container ports.
    pub service_uid: String,
    /// Name of the matched service.
    pub service_name: String,
    /// Name of the matched service port.
    pub service_port_name: String,
    /// Number of the matched service port.
    pub service_port: u16,
    /// Container receiving the traffic.
    pub container_name: String,
    /// Protocol of the matched port.
    pub protocol: String,
    /// Matched container port.
    pub container_port: u16,
    /// Image of the workload's agent.
    pub agent_image: String,
    /// Kind of the workload.
    pub workload_kind: String,
}

impl PreparedIntercept {
    /// Embed an error in an otherwise empty result.
    #[must_use]
    pub fn from_error(err: &AppError) -> Self {
        Self {
            error: err.message().to_owned(),
            error_category: err.category().code(),
            ..Self::default()
        }
    }

    /// The embedded error, if any.
    #[must_use]
    pub fn to_error(&self) -> Option<AppError> {
        if self.error.is_empty() {
            None
        } else {
            Some(ErrorCategory::from_code(self.error_category).into_error(self.error.clone()))
        }
    }
}

/// Kinds of create-intercept failures reported to the user.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterceptErrorKind {
    /// No error; also returned when nothing was created.
    #[default]
    Unspecified,
    /// The request namespace differs from the session namespace.
    NamespaceAmbiguity,
    /// An intercept with the same name exists.
    AlreadyExists,
    /// Another intercept routes to the same local host and port.
    LocalTargetInUse,
    /// The mount point or mount port is already used.
    MountPointBusy,
    /// The control plane rejected a request.
    TrafficManagerError,
    /// The intercept never became active and usable.
    FailedToEstablish,
    /// The workload's port configuration is inconsistent.
    MisconfiguredWorkload,
    /// No workload matching the request could be intercepted.
    NoAcceptableWorkload,
}

impl Display for InterceptErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unspecified => "unspecified",
            Self::NamespaceAmbiguity => "namespace ambiguity",
            Self::AlreadyExists => "already exists",
            Self::LocalTargetInUse => "local target in use",
            Self::MountPointBusy => "mount point busy",
            Self::TrafficManagerError => "traffic manager error",
            Self::FailedToEstablish => "failed to establish",
            Self::MisconfiguredWorkload => "misconfigured workload",
            Self::NoAcceptableWorkload => "no acceptable workload",
        };
        f.write_str(s)
    }
}

/// Outcome of a create-intercept call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct InterceptResult {
    /// Failure kind; `Unspecified` together with an empty `error_text` on success.
    pub error: InterceptErrorKind,
    /// Failure detail.
    pub error_text: String,
    /// Numeric [`ErrorCategory`] code.
    pub error_category: i32,
    /// The created record, or the conflicting one for `LocalTargetInUse`.
    pub intercept_info: Option<InterceptInfo>,
    /// UID of the intercepted service.
    pub service_uid: String,
    /// Kind of the intercepted workload.
    pub workload_kind: String,
}

impl InterceptResult {
    /// A failed result of the given kind.
    #[must_use]
    pub fn failure(kind: InterceptErrorKind, err: &AppError) -> Self {
        Self {
            error: kind,
            error_text: err.message().to_owned(),
            error_category: err.category().code(),
            ..Self::default()
        }
    }

    /// Whether the result carries a failure.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error != InterceptErrorKind::Unspecified || !self.error_text.is_empty()
    }
}
