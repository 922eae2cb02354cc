//! Override env-var management.
//!
//! The control plane supplies sets of environment variables keyed by an
//! instance selector; the launcher overlays them onto the OCI spec env list
//! at launch time. Each variable may carry an expiry; expired variables are
//! skipped at evaluation and silently pruned from persistence at the next
//! reconcile.
//!
//! Evaluation order is by selector specificity: an exact ident beats a
//! two-field selector, which beats one field, which beats a full wildcard.
//! At equal specificity the entry later in the submitted list wins; the
//! persisted form preserves submission order, so the tie-break is stable
//! across restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Limits;
use crate::model::InstanceIdent;

/// One override environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVarInfo {
    /// Variable name.
    pub name: String,

    /// Variable value.
    pub value: String,

    /// Optional expiry; the variable is ignored once this is in the past.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl EnvVarInfo {
    /// Create a variable without expiry.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            expires_at: None,
        }
    }

    /// Whether the variable is expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }
}

/// Instance selector matching any subset of the ident fields.
///
/// `None` fields are wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceFilter {
    /// Service id to match, or any.
    #[serde(default)]
    pub service_id: Option<String>,

    /// Subject id to match, or any.
    #[serde(default)]
    pub subject_id: Option<String>,

    /// Instance index to match, or any.
    #[serde(default)]
    pub instance: Option<u64>,
}

impl InstanceFilter {
    /// Selector matching exactly one ident.
    #[must_use]
    pub fn exact(ident: &InstanceIdent) -> Self {
        Self {
            service_id: Some(ident.service_id.clone()),
            subject_id: Some(ident.subject_id.clone()),
            instance: Some(ident.instance),
        }
    }

    /// Whether the selector matches the given ident.
    #[must_use]
    pub fn matches(&self, ident: &InstanceIdent) -> bool {
        self.service_id
            .as_ref()
            .is_none_or(|id| *id == ident.service_id)
            && self
                .subject_id
                .as_ref()
                .is_none_or(|id| *id == ident.subject_id)
            && self.instance.is_none_or(|index| index == ident.instance)
    }

    /// Number of populated fields; higher is more specific.
    #[must_use]
    pub fn specificity(&self) -> u8 {
        u8::from(self.service_id.is_some())
            + u8::from(self.subject_id.is_some())
            + u8::from(self.instance.is_some())
    }
}

/// One override entry: a selector plus its variable list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVarsInstanceInfo {
    /// Instance selector.
    pub filter: InstanceFilter,

    /// Variables assigned to matching instances.
    pub vars: Vec<EnvVarInfo>,
}

/// Per-entry outcome of an override request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnvVarStatus {
    /// Entry accepted and stored.
    Applied,

    /// Entry rejected by validation.
    Invalid {
        /// Why the entry was rejected.
        reason: String,
    },

    /// Entry is valid but matches no currently-known instance.
    NotFound,
}

/// The current override set.
///
/// Owned by the dispatcher; persisted through the storage contract whenever
/// it changes.
#[derive(Debug, Clone, Default)]
pub struct EnvVarRegistry {
    entries: Vec<EnvVarsInstanceInfo>,
}

impl EnvVarRegistry {
    /// Restore the registry from its persisted form.
    #[must_use]
    pub fn from_entries(entries: Vec<EnvVarsInstanceInfo>) -> Self {
        Self { entries }
    }

    /// Current entries in evaluation order.
    #[must_use]
    pub fn entries(&self) -> &[EnvVarsInstanceInfo] {
        &self.entries
    }

    /// Replace the override set.
    ///
    /// Validates every entry against `limits`, returning one status per
    /// entry in submission order. Entries that fail validation are not
    /// stored; valid entries are, including those that currently match no
    /// instance (they may apply to instances a later goal state introduces).
    pub fn replace<'a>(
        &mut self,
        entries: Vec<EnvVarsInstanceInfo>,
        live: impl Iterator<Item = &'a InstanceIdent> + Clone,
        limits: &Limits,
    ) -> Vec<EnvVarStatus> {
        let mut statuses = Vec::with_capacity(entries.len());
        let mut accepted = Vec::with_capacity(entries.len());

        for entry in entries {
            if let Some(reason) = validate_entry(&entry, limits) {
                statuses.push(EnvVarStatus::Invalid { reason });
                continue;
            }

            let matched = live.clone().any(|ident| entry.filter.matches(ident));
            statuses.push(if matched {
                EnvVarStatus::Applied
            } else {
                EnvVarStatus::NotFound
            });
            accepted.push(entry);
        }

        self.entries = accepted;
        statuses
    }

    /// Evaluate the overlay for one instance.
    ///
    /// Returns `(name, value)` pairs sorted by name. Within the overlay the
    /// most specific matching selector wins per variable; ties go to the
    /// later entry.
    #[must_use]
    pub fn overlay_for(
        &self,
        ident: &InstanceIdent,
        now: DateTime<Utc>,
    ) -> Vec<(String, String)> {
        let mut matching: Vec<(u8, usize, &EnvVarsInstanceInfo)> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.filter.matches(ident))
            .map(|(index, entry)| (entry.filter.specificity(), index, entry))
            .collect();

        // Ascending (specificity, index): later assignments overwrite
        // earlier ones, so the most specific / latest entry ends up applied.
        matching.sort_by_key(|(specificity, index, _)| (*specificity, *index));

        let mut overlay = std::collections::BTreeMap::new();
        for (_, _, entry) in matching {
            for var in &entry.vars {
                if var.is_expired(now) {
                    continue;
                }
                overlay.insert(var.name.clone(), var.value.clone());
            }
        }

        overlay.into_iter().collect()
    }

    /// Drop expired variables, and entries left with no variables.
    ///
    /// Returns whether anything was removed (the caller re-persists the set
    /// if so).
    pub fn prune_expired(&mut self, now: DateTime<Utc>) -> bool {
        let before: usize = self.entries.iter().map(|entry| entry.vars.len()).sum();

        for entry in &mut self.entries {
            entry.vars.retain(|var| !var.is_expired(now));
        }
        self.entries.retain(|entry| !entry.vars.is_empty());

        let after: usize = self.entries.iter().map(|entry| entry.vars.len()).sum();
        after != before
    }
}

fn validate_entry(entry: &EnvVarsInstanceInfo, limits: &Limits) -> Option<String> {
    for var in &entry.vars {
        if var.name.is_empty() {
            return Some("empty variable name".to_string());
        }
        if var.name.len() > limits.max_env_name_len {
            return Some(format!(
                "variable name exceeds {} characters",
                limits.max_env_name_len
            ));
        }
        if var.name.contains('=') || var.name.contains('\0') {
            return Some(format!("variable name '{}' contains a forbidden character", var.name));
        }
        if var.value.len() > limits.max_env_value_len {
            return Some(format!(
                "value of '{}' exceeds {} characters",
                var.name, limits.max_env_value_len
            ));
        }
        if var.value.contains('\0') {
            return Some(format!("value of '{}' contains a NUL byte", var.name));
        }
    }

    None
}
