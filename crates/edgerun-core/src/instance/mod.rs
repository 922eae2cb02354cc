//! Runtime instance records and the per-instance lifecycle state machine.
//!
//! An [`Instance`] is owned by the dispatcher and mutated only under the
//! instance-map mutex. Lifecycle transitions follow a fixed table; anything
//! outside it is rejected and logged, leaving the state unchanged.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::{InstanceIdent, InstanceInfo, RunState};

/// Per-instance lifecycle state.
///
/// ```text
///           start job submitted
/// Created ──────────────────────▶ Starting
///                                    │
///                   runner: running  │
///                                    ▼
///                                 Running ─── stop job submitted ──▶ Stopping
///                                    │                                  │
///                        runner: exit / fault                 runner: stopped
///                                    │                                  │
///                                    ▼                                  ▼
///                                  Failed                             Stopped
/// ```
///
/// `Failed` is terminal within a cycle; the next reconcile re-attempts the
/// instance as a fresh `Created`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Record created, no job submitted yet.
    Created,

    /// Start job in flight.
    Starting,

    /// Runner reported the instance running.
    Running,

    /// Stop job in flight.
    Stopping,

    /// Stopped cleanly.
    Stopped,

    /// Launch failed or the instance faulted.
    Failed,
}

impl InstanceState {
    /// Whether a transition from `self` to `next` is allowed.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Starting)
                | (Self::Starting, Self::Running | Self::Failed)
                | (Self::Running, Self::Stopping | Self::Failed)
                | (Self::Stopping, Self::Stopped | Self::Failed)
        )
    }

    /// Whether the state is terminal for the current cycle.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl From<RunState> for InstanceState {
    fn from(state: RunState) -> Self {
        match state {
            RunState::Running => Self::Running,
            RunState::Stopped => Self::Stopped,
            RunState::Failed => Self::Failed,
        }
    }
}

/// Runtime record for one live instance.
#[derive(Debug, Clone)]
pub struct Instance {
    info: InstanceInfo,
    state: InstanceState,
    service_version: String,
    last_error: Option<String>,
    env_overlay: Vec<(String, String)>,
    generation: u64,
}

impl Instance {
    /// Create a fresh record in `Created` state.
    #[must_use]
    pub fn new(info: InstanceInfo) -> Self {
        Self {
            info,
            state: InstanceState::Created,
            service_version: String::new(),
            last_error: None,
            env_overlay: Vec::new(),
            generation: 0,
        }
    }

    /// Instance identity.
    #[must_use]
    pub fn ident(&self) -> &InstanceIdent {
        &self.info.ident
    }

    /// Desired-state snapshot the instance was launched from.
    #[must_use]
    pub fn info(&self) -> &InstanceInfo {
        &self.info
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> InstanceState {
        self.state
    }

    /// Replace the desired-state snapshot across cycles.
    ///
    /// Used for instances that survive a reconcile: fields that do not force
    /// a restart (priority, paths) take effect without a relaunch.
    pub fn update_info(&mut self, info: InstanceInfo) {
        self.info = info;
    }

    /// Version of the service the instance was launched from.
    #[must_use]
    pub fn service_version(&self) -> &str {
        &self.service_version
    }

    /// Record the service version at launch time.
    pub fn set_service_version(&mut self, version: impl Into<String>) {
        self.service_version = version.into();
    }

    /// Last error reported for the instance, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Env-var overlay applied at the last launch.
    #[must_use]
    pub fn env_overlay(&self) -> &[(String, String)] {
        &self.env_overlay
    }

    /// Record the overlay applied at launch.
    pub fn set_env_overlay(&mut self, overlay: Vec<(String, String)>) {
        self.env_overlay = overlay;
    }

    /// Generation counter, incremented at every accepted transition.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Attempt a lifecycle transition.
    ///
    /// Invalid transitions are rejected: a warning is logged and the state
    /// is left unchanged. Returns whether the transition was accepted.
    pub fn transition(&mut self, next: InstanceState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                instance = %self.info.ident,
                from = %self.state,
                to = %next,
                "rejected invalid lifecycle transition"
            );
            return false;
        }

        self.state = next;
        self.generation += 1;
        true
    }

    /// Attempt a transition into a failure state, recording the error.
    ///
    /// Falls back to overwriting the error annotation even when the
    /// transition itself is rejected (an already-failed instance keeps the
    /// most recent cause).
    pub fn fail(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
        if self.state != InstanceState::Failed {
            self.transition(InstanceState::Failed);
        }
    }

    /// Apply a runner-reported run status.
    ///
    /// Returns whether the record changed.
    pub fn apply_run_state(&mut self, state: RunState, error: Option<String>) -> bool {
        let next = InstanceState::from(state);
        let mut changed = false;

        if next != self.state && self.transition(next) {
            changed = true;
        }
        if error != self.last_error {
            self.last_error = error;
            changed = true;
        }

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> Instance {
        Instance::new(InstanceInfo::new(
            InstanceIdent::new("service1", "subject1", 0),
            0,
        ))
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut instance = record();

        assert!(instance.transition(InstanceState::Starting));
        assert!(instance.transition(InstanceState::Running));
        assert!(instance.transition(InstanceState::Stopping));
        assert!(instance.transition(InstanceState::Stopped));
        assert_eq!(instance.generation(), 4);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut instance = record();

        assert!(!instance.transition(InstanceState::Running));
        assert_eq!(instance.state(), InstanceState::Created);
        assert_eq!(instance.generation(), 0);

        instance.transition(InstanceState::Starting);
        assert!(!instance.transition(InstanceState::Stopped));
        assert_eq!(instance.state(), InstanceState::Starting);
    }

    #[test]
    fn test_fail_records_error() {
        let mut instance = record();
        instance.transition(InstanceState::Starting);

        instance.fail("runner rejected start");
        assert_eq!(instance.state(), InstanceState::Failed);
        assert_eq!(instance.last_error(), Some("runner rejected start"));

        // A later failure keeps the newest cause without a state change.
        let generation = instance.generation();
        instance.fail("second cause");
        assert_eq!(instance.generation(), generation);
        assert_eq!(instance.last_error(), Some("second cause"));
    }

    #[test]
    fn test_apply_run_state_bumps_generation() {
        let mut instance = record();
        instance.transition(InstanceState::Starting);

        assert!(instance.apply_run_state(RunState::Running, None));
        assert_eq!(instance.state(), InstanceState::Running);

        // Same state and error is a no-op.
        assert!(!instance.apply_run_state(RunState::Running, None));
    }

    #[test]
    fn test_failed_is_terminal() {
        let mut instance = record();
        instance.transition(InstanceState::Starting);
        instance.fail("fault");

        assert!(!instance.transition(InstanceState::Running));
        assert!(instance.state().is_terminal());
    }
}
