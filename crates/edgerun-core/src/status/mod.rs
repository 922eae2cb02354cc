//! Status aggregation.
//!
//! Merges runner-reported status deltas into the dispatcher's live-instance
//! map and decides what may be published when. Unknown instances are dropped
//! without synthesizing records. While a reconcile is in progress every
//! update is applied but none is published: the cycle's own full snapshot
//! supersedes the individual deltas, so an external observer never sees
//! transient states.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::instance::{Instance, InstanceState};
use crate::model::{InstanceIdent, RunStatus};

/// Published per-instance status record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    /// Instance identity.
    pub ident: InstanceIdent,

    /// Version of the service the instance runs.
    pub service_version: String,

    /// Current lifecycle state.
    pub state: InstanceState,

    /// Last error reported for the instance.
    #[serde(default)]
    pub error: Option<String>,
}

impl InstanceStatus {
    /// Build a status record from a live instance.
    #[must_use]
    pub fn of(instance: &Instance) -> Self {
        Self {
            ident: instance.ident().clone(),
            service_version: instance.service_version().to_string(),
            state: instance.state(),
            error: instance.last_error().map(str::to_string),
        }
    }
}

/// Apply runner-reported deltas to the live map.
///
/// Returns the subset that must be published as an update, which is empty
/// while a reconcile is active.
pub(crate) fn ingest(
    instances: &mut BTreeMap<InstanceIdent, Instance>,
    cycle_active: bool,
    updates: &[RunStatus],
) -> Vec<InstanceStatus> {
    let mut publish = Vec::new();

    for update in updates {
        let Some(instance) = instances.get_mut(&update.ident) else {
            debug!(instance = %update.ident, "dropping run status for unknown instance");
            continue;
        };

        let changed = instance.apply_run_state(update.state, update.error.clone());

        if changed && instance.state().is_terminal() && !cycle_active {
            publish.push(InstanceStatus::of(instance));
        }
    }

    publish
}

/// Full snapshot of the live map, in ident order.
pub(crate) fn snapshot(instances: &BTreeMap<InstanceIdent, Instance>) -> Vec<InstanceStatus> {
    instances.values().map(InstanceStatus::of).collect()
}
