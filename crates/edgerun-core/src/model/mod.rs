//! Core data model.
//!
//! The types exchanged with the control plane and the external
//! collaborators: instance identity and desired state, service and layer
//! descriptors, and the runner-facing run status.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Instance identity: `(service, subject, index)`.
///
/// Totally ordered; serves as the primary key for the live-instance map and
/// for override env-var targeting. Ordering is lexicographic over the three
/// fields, which also provides the deterministic tie-break for equal-priority
/// launches.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct InstanceIdent {
    /// Service identifier.
    pub service_id: String,

    /// Subject (owner) identifier.
    pub subject_id: String,

    /// Instance index within `(service, subject)`.
    pub instance: u64,
}

impl InstanceIdent {
    /// Create an ident from its three parts.
    pub fn new(service_id: impl Into<String>, subject_id: impl Into<String>, instance: u64) -> Self {
        Self {
            service_id: service_id.into(),
            subject_id: subject_id.into(),
            instance,
        }
    }

    /// Whether the ident is well formed: non-empty service and subject ids.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.service_id.is_empty() && !self.subject_id.is_empty()
    }
}

impl fmt::Display for InstanceIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.service_id, self.subject_id, self.instance)
    }
}

/// Desired-state record for one instance.
///
/// Immutable within a reconcile cycle; replaced wholesale across cycles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    /// Instance identity.
    pub ident: InstanceIdent,

    /// Launch priority; higher starts earlier.
    #[serde(default)]
    pub priority: u64,

    /// Host path of the instance's persistent storage.
    #[serde(default)]
    pub storage_path: PathBuf,

    /// Host path of the instance's state directory.
    #[serde(default)]
    pub state_path: PathBuf,

    /// UID the instance runs under.
    #[serde(default)]
    pub uid: u32,

    /// Resource limits applied at launch.
    #[serde(default)]
    pub limits: ResourceLimits,
}

impl InstanceInfo {
    /// Create an info record with default paths, UID and limits.
    pub fn new(ident: InstanceIdent, priority: u64) -> Self {
        Self {
            ident,
            priority,
            storage_path: PathBuf::new(),
            state_path: PathBuf::new(),
            uid: 0,
            limits: ResourceLimits::default(),
        }
    }
}

/// Resource limits for one instance.
///
/// A change in limits between cycles forces a restart of the instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU quota in percent of one core.
    #[serde(default)]
    pub cpu_percent: Option<u32>,

    /// RAM limit in bytes.
    #[serde(default)]
    pub ram_bytes: Option<u64>,

    /// Storage quota in bytes.
    #[serde(default)]
    pub storage_bytes: Option<u64>,
}

/// Service descriptor supplied by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Service identifier.
    pub service_id: String,

    /// Provider identifier.
    pub provider_id: String,

    /// Service version.
    pub version: String,

    /// GID assigned to the service's resources.
    #[serde(default)]
    pub gid: u32,
}

/// Resolved service record as returned by the service manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceData {
    /// Service identifier.
    pub service_id: String,

    /// Provider identifier.
    pub provider_id: String,

    /// Version of the locally materialized image.
    pub version: String,

    /// Local content-addressed image path.
    pub image_path: PathBuf,
}

/// Layer descriptor; opaque to the core and forwarded to the service
/// manager on cycle start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerInfo {
    /// Layer identifier.
    pub layer_id: String,

    /// Layer content digest.
    pub digest: String,

    /// Layer version.
    pub version: String,
}

/// Runtime state as reported by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Instance is running.
    Running,

    /// Instance exited normally or was stopped.
    Stopped,

    /// Instance failed to start or exited with a fault.
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Per-instance status pushed by the runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatus {
    /// Instance identity.
    pub ident: InstanceIdent,

    /// Reported state.
    pub state: RunState,

    /// Error descriptor accompanying a failure.
    #[serde(default)]
    pub error: Option<String>,
}
