//! Contracts of the launcher's external collaborators.
//!
//! The launcher owns value-semantics handles (`Arc<dyn …>`) to each
//! collaborator, wired at construction. None of them holds a reference back
//! into the launcher; the runner pushes its asynchronous status events
//! through [`Launcher::update_run_status`](crate::Launcher::update_run_status)
//! and the cloud connection state arrives through
//! [`Launcher::set_cloud_connection`](crate::Launcher::set_cloud_connection).

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::envvars::EnvVarsInstanceInfo;
use crate::error::Result;
use crate::model::{
    InstanceIdent, InstanceInfo, LayerInfo, ResourceLimits, RunStatus, ServiceData, ServiceInfo,
};
use crate::status::InstanceStatus;

/// Low-level process/container runner.
pub trait Runner: Send + Sync {
    /// Start an instance from the runtime spec in `runtime_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error when the runner rejects the start request.
    fn start_instance(&self, info: &InstanceInfo, runtime_dir: &Path) -> Result<RunStatus>;

    /// Stop an instance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`](crate::Error::NotFound) when the instance
    /// is already stopped (callers treat this as success) or another error
    /// when the stop request fails.
    fn stop_instance(&self, ident: &InstanceIdent) -> Result<()>;
}

/// Service manager materializing service images on disk.
pub trait ServiceManager: Send + Sync {
    /// Hand the desired services and layers over for processing.
    ///
    /// # Errors
    ///
    /// An error here is an infrastructure fault and aborts the cycle.
    fn process_desired_services(
        &self,
        services: &[ServiceInfo],
        layers: &[LayerInfo],
    ) -> Result<()>;

    /// Resolve a service id to its locally materialized image.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`](crate::Error::NotFound) when no usable
    /// artifact exists for the service.
    fn get_service(&self, service_id: &str) -> Result<ServiceData>;
}

/// Producer of the serialized runtime spec the runner consumes.
pub trait OciSpecProducer: Send + Sync {
    /// Write the runtime spec for one instance launch.
    ///
    /// `env_overlay` replaces colliding entries of the image's own env list.
    /// Returns the directory holding the produced spec.
    ///
    /// # Errors
    ///
    /// Returns an error when the spec cannot be generated; the instance is
    /// then marked failed without invoking the runner.
    fn produce(
        &self,
        service: &ServiceData,
        info: &InstanceInfo,
        env_overlay: &[(String, String)],
    ) -> Result<PathBuf>;
}

/// Upstream consumer of instance status reports.
pub trait StatusReceiver: Send + Sync {
    /// Full snapshot, published at the end of every reconcile cycle.
    ///
    /// # Errors
    ///
    /// Delivery failures are logged by the launcher and otherwise ignored.
    fn instances_run_status(&self, instances: Vec<InstanceStatus>) -> Result<()>;

    /// Deltas for status changes outside any cycle.
    ///
    /// # Errors
    ///
    /// Delivery failures are logged by the launcher and otherwise ignored.
    fn instances_update_status(&self, instances: Vec<InstanceStatus>) -> Result<()>;
}

/// Backing store for instance records, the operation version, override
/// env-vars and the last-online timestamp.
///
/// The backend is opaque; the launcher requires only atomic single-record
/// writes. All access is serialized through the dispatcher.
pub trait Storage: Send + Sync {
    /// Add a new instance record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyExists`](crate::Error::AlreadyExists) for a
    /// duplicate ident.
    fn add_instance(&self, instance: &InstanceInfo) -> Result<()>;

    /// Update a previously stored instance record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`](crate::Error::NotFound) when no record
    /// with the same ident exists.
    fn update_instance(&self, instance: &InstanceInfo) -> Result<()>;

    /// Remove an instance record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`](crate::Error::NotFound) when no record
    /// with the given ident exists.
    fn remove_instance(&self, ident: &InstanceIdent) -> Result<()>;

    /// All stored instance records.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the read fails.
    fn get_all_instances(&self) -> Result<Vec<InstanceInfo>>;

    /// Persisted operation version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`](crate::Error::NotFound) when no version
    /// has been stored yet.
    fn get_operation_version(&self) -> Result<u64>;

    /// Store the operation version.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the write fails.
    fn set_operation_version(&self, version: u64) -> Result<()>;

    /// Persisted override env-var set.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the read fails.
    fn get_override_env_vars(&self) -> Result<Vec<EnvVarsInstanceInfo>>;

    /// Store the override env-var set.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the write fails.
    fn set_override_env_vars(&self, overrides: &[EnvVarsInstanceInfo]) -> Result<()>;

    /// Last recorded online time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`](crate::Error::NotFound) when never
    /// recorded.
    fn get_online_time(&self) -> Result<DateTime<Utc>>;

    /// Record the online time.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the write fails.
    fn set_online_time(&self, time: DateTime<Utc>) -> Result<()>;
}

/// Resource monitor notified of instance lifecycle for metric collection.
pub trait ResourceMonitor: Send + Sync {
    /// Begin collecting metrics for a started instance.
    ///
    /// # Errors
    ///
    /// Failures are logged by the launcher and do not fail the launch.
    fn start_instance_monitoring(
        &self,
        ident: &InstanceIdent,
        limits: &ResourceLimits,
    ) -> Result<()>;

    /// Stop collecting metrics for a stopped instance.
    ///
    /// # Errors
    ///
    /// Failures are logged by the launcher and do not fail the stop.
    fn stop_instance_monitoring(&self, ident: &InstanceIdent) -> Result<()>;
}
