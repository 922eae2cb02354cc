//! Launcher configuration.
//!
//! All per-process knobs are passed at construction; there is no global
//! state. Collections inside the core are heap allocated but bounded: any
//! public input exceeding the configured maxima is rejected up front with
//! [`Error::InvalidArgument`](crate::Error::InvalidArgument).

use serde::{Deserialize, Serialize};

/// Launcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Number of worker threads performing start/stop jobs in parallel.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Input bounds enforced at the public surface.
    #[serde(default)]
    pub limits: Limits,
}

const fn default_num_workers() -> usize {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            limits: Limits::default(),
        }
    }
}

impl Config {
    /// Capacity of the worker-pool job queue.
    ///
    /// Sized so a full stop or start phase can be submitted without the
    /// dispatcher blocking mid-phase.
    #[must_use]
    pub fn queue_capacity(&self) -> usize {
        self.limits
            .max_instances
            .max(self.limits.max_services)
            .max(self.limits.max_layers)
    }
}

/// Maximum accepted sizes for public inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    /// Maximum number of instances in one goal state.
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,

    /// Maximum number of services in one goal state.
    #[serde(default = "default_max_services")]
    pub max_services: usize,

    /// Maximum number of layers in one goal state.
    #[serde(default = "default_max_layers")]
    pub max_layers: usize,

    /// Maximum number of override env-var entries in one request.
    #[serde(default = "default_max_override_entries")]
    pub max_override_entries: usize,

    /// Maximum accepted length of an env variable name.
    #[serde(default = "default_max_env_name_len")]
    pub max_env_name_len: usize,

    /// Maximum accepted length of an env variable value.
    #[serde(default = "default_max_env_value_len")]
    pub max_env_value_len: usize,
}

const fn default_max_instances() -> usize {
    64
}

const fn default_max_services() -> usize {
    32
}

const fn default_max_layers() -> usize {
    32
}

const fn default_max_override_entries() -> usize {
    32
}

const fn default_max_env_name_len() -> usize {
    64
}

const fn default_max_env_value_len() -> usize {
    256
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_instances: default_max_instances(),
            max_services: default_max_services(),
            max_layers: default_max_layers(),
            max_override_entries: default_max_override_entries(),
            max_env_name_len: default_max_env_name_len(),
            max_env_value_len: default_max_env_value_len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.num_workers, 5);
        assert_eq!(config.limits.max_instances, 64);
        assert_eq!(config.queue_capacity(), 64);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: Config = serde_json::from_str(r#"{"num_workers": 2}"#).unwrap();
        assert_eq!(config.num_workers, 2);
        assert_eq!(config.limits.max_services, 32);
    }

    #[test]
    fn test_queue_capacity_tracks_largest_limit() {
        let config = Config {
            limits: Limits {
                max_instances: 8,
                max_services: 100,
                ..Limits::default()
            },
            ..Config::default()
        };
        assert_eq!(config.queue_capacity(), 100);
    }
}
