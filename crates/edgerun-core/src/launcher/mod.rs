//! The launcher: goal-state reconciliation over a bounded worker pool.
//!
//! All public mutating operations are serialized through a single dispatcher
//! thread; per-instance start/stop work runs in parallel on the worker pool.
//! One mutex guards the live-instance map and the service cache, held only
//! for map mutation and never across runner or OCI-spec calls.
//!
//! A reconcile cycle:
//!
//! 1. snapshot the live state (for rollback),
//! 2. hand desired services and layers to the service manager,
//! 3. refresh the service cache,
//! 4. diff desired against live,
//! 5. stop phase, drain,
//! 6. start phase in descending priority order, drain,
//! 7. persist the new instance set,
//! 8. publish the full run-status snapshot.
//!
//! Per-instance failures are recorded on the instance and reported through
//! status; only infrastructure faults (storage, service manager) abort a
//! cycle, roll the in-memory state back and surface to the caller of
//! [`Launcher::run_instances`].

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::cache::ServiceCache;
use crate::config::Config;
use crate::contract::{
    OciSpecProducer, ResourceMonitor, Runner, ServiceManager, StatusReceiver, Storage,
};
use crate::envvars::{EnvVarRegistry, EnvVarStatus, EnvVarsInstanceInfo};
use crate::error::{Error, Result};
use crate::instance::{Instance, InstanceState};
use crate::model::{InstanceIdent, InstanceInfo, LayerInfo, RunStatus, ServiceInfo};
use crate::pool::WorkerPool;
use crate::status::{self, InstanceStatus};


/// Current operation version.
///
/// Bumped whenever the on-disk layout of dependent state changes in a way
/// that existing instances cannot survive. A lower persisted value forces a
/// purge of all persisted instance records before the first reconcile.
pub const OPERATION_VERSION: u64 = 9;

/// Collaborator handles wired at construction.
///
/// The launcher owns value-semantics handles to its collaborators; none of
/// them refers back into the launcher.
#[derive(Clone)]
pub struct Dependencies {
    /// Process/container runner.
    pub runner: Arc<dyn Runner>,

    /// Service image manager.
    pub service_manager: Arc<dyn ServiceManager>,

    /// Runtime spec producer.
    pub oci_producer: Arc<dyn OciSpecProducer>,

    /// Upstream status consumer.
    pub status_receiver: Arc<dyn StatusReceiver>,

    /// Backing store.
    pub storage: Arc<dyn Storage>,

    /// Per-instance resource monitor.
    pub resource_monitor: Arc<dyn ResourceMonitor>,
}

/// Launches service instances to match the control plane's goal state.
pub struct Launcher {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    config: Config,
    deps: Dependencies,
    core: Mutex<CoreState>,
    dispatch: Mutex<DispatchState>,
    dispatch_cv: Condvar,
}

/// Live state guarded by the single core mutex.
struct CoreState {
    instances: BTreeMap<InstanceIdent, Instance>,
    services: ServiceCache,
    overrides: EnvVarRegistry,
    cycle_active: bool,
    connected: bool,
    first_connect_seen: bool,
}

struct DispatchState {
    queue: VecDeque<Command>,
    closing: bool,
}

enum Command {
    Reconcile {
        services: Vec<ServiceInfo>,
        layers: Vec<LayerInfo>,
        instances: Vec<InstanceInfo>,
        force_restart: bool,
        ticket: Arc<Ticket<Result<()>>>,
    },
    OverrideEnvVars {
        overrides: Vec<EnvVarsInstanceInfo>,
        ticket: Arc<Ticket<Result<Vec<EnvVarStatus>>>>,
    },
    CloudConnection {
        connected: bool,
    },
    RunLast,
}

impl Command {
    /// Release any caller waiting on the command without executing it.
    fn abort(self) {
        match self {
            Self::Reconcile { ticket, .. } => ticket.deliver(Err(Error::Shutdown)),
            Self::OverrideEnvVars { ticket, .. } => ticket.deliver(Err(Error::Shutdown)),
            Self::CloudConnection { .. } | Self::RunLast => {}
        }
    }
}

/// Rendezvous slot between a public caller and the dispatcher thread.
struct Ticket<T> {
    slot: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T> Ticket<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        })
    }

    fn deliver(&self, value: T) {
        *self.slot.lock().expect("lock poisoned") = Some(value);
        self.ready.notify_all();
    }

    fn wait(&self) -> T {
        let mut slot = self.slot.lock().expect("lock poisoned");
        loop {
            if let Some(value) = slot.take() {
                return value;
            }
            slot = self.ready.wait(slot).expect("lock poisoned");
        }
    }
}

impl Launcher {
    /// Create a launcher with the given collaborators and configuration.
    ///
    /// The launcher is inert until [`start`](Self::start) is called.
    #[must_use]
    pub fn new(deps: Dependencies, config: Config) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                deps,
                core: Mutex::new(CoreState {
                    instances: BTreeMap::new(),
                    services: ServiceCache::new(),
                    overrides: EnvVarRegistry::default(),
                    cycle_active: false,
                    connected: false,
                    first_connect_seen: false,
                }),
                dispatch: Mutex::new(DispatchState {
                    queue: VecDeque::new(),
                    closing: false,
                }),
                dispatch_cv: Condvar::new(),
            }),
            dispatcher: Mutex::new(None),
        }
    }

    /// Start the launcher.
    ///
    /// Applies the operation-version gate (purging persisted instance
    /// records written by an older layout), restores the override env-var
    /// set, spawns the dispatcher and worker pool, and schedules a replay of
    /// the persisted instance set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyExists`] when already started,
    /// [`Error::Shutdown`] after [`stop`](Self::stop), or a storage error
    /// when the initial reads fail.
    pub fn start(&self) -> Result<()> {
        let mut dispatcher = self.dispatcher.lock().expect("lock poisoned");
        if dispatcher.is_some() {
            return Err(Error::AlreadyExists("launcher already started".to_string()));
        }
        if self.shared.dispatch.lock().expect("lock poisoned").closing {
            return Err(Error::Shutdown);
        }

        debug!("starting launcher");

        self.prepare_storage()?;

        let pool = WorkerPool::spawn(
            self.shared.config.num_workers,
            self.shared.config.queue_capacity(),
        )?;
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("launch-dispatcher".to_string())
            .spawn(move || dispatcher_loop(&shared, &pool))
            .map_err(|err| Error::Internal(format!("failed to spawn dispatcher: {err}")))?;
        *dispatcher = Some(handle);
        drop(dispatcher);

        self.enqueue(Command::RunLast)
    }

    /// Stop the launcher.
    ///
    /// In-flight jobs run to completion; queued commands are released with
    /// [`Error::Shutdown`]; worker and dispatcher threads are joined.
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] when a thread cannot be joined.
    pub fn stop(&self) -> Result<()> {
        self.shared.dispatch.lock().expect("lock poisoned").closing = true;
        self.shared.dispatch_cv.notify_all();

        debug!("stopping launcher");

        let handle = self.dispatcher.lock().expect("lock poisoned").take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| Error::Internal("dispatcher thread panicked".to_string()))?;
        } else {
            // Never started: release any caller parked on a queued command.
            let mut dispatch = self.shared.dispatch.lock().expect("lock poisoned");
            while let Some(command) = dispatch.queue.pop_front() {
                command.abort();
            }
        }

        Ok(())
    }

    /// Run the specified instances.
    ///
    /// Atomically replaces the goal state and drives the node to it. The
    /// call is serialized with every other reconcile: a concurrent caller
    /// blocks until the previous cycle completes. Per-instance launch
    /// failures are reported through the status receiver, not here.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for malformed input (bounds
    /// exceeded, malformed ident, duplicate ident, or an instance referring
    /// to a service absent from `services`), [`Error::Shutdown`] after
    /// [`stop`](Self::stop), or the infrastructure error that aborted the
    /// cycle.
    pub fn run_instances(
        &self,
        services: Vec<ServiceInfo>,
        layers: Vec<LayerInfo>,
        instances: Vec<InstanceInfo>,
        force_restart: bool,
    ) -> Result<()> {
        self.validate_goal(&services, &layers, &instances)?;

        let ticket = Ticket::new();
        self.enqueue(Command::Reconcile {
            services,
            layers,
            instances,
            force_restart,
            ticket: Arc::clone(&ticket),
        })?;
        ticket.wait()
    }

    /// Override environment variables for matching instances.
    ///
    /// Replaces the override set, persists the accepted entries, and
    /// silently re-launches running instances whose evaluated overlay
    /// changed. Returns one status per submitted entry, in order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when the entry count exceeds the
    /// configured maximum, [`Error::Shutdown`] after [`stop`](Self::stop),
    /// or a storage error when persisting fails (the previous set stays in
    /// effect).
    pub fn override_env_vars(
        &self,
        overrides: Vec<EnvVarsInstanceInfo>,
    ) -> Result<Vec<EnvVarStatus>> {
        if overrides.len() > self.shared.config.limits.max_override_entries {
            return Err(Error::InvalidArgument(format!(
                "{} override entries exceed the configured maximum {}",
                overrides.len(),
                self.shared.config.limits.max_override_entries
            )));
        }

        let ticket = Ticket::new();
        self.enqueue(Command::OverrideEnvVars {
            overrides,
            ticket: Arc::clone(&ticket),
        })?;
        ticket.wait()
    }

    /// Record the cloud connection state.
    ///
    /// Never blocks: the first transition to connected since boot enqueues a
    /// replay of the persisted instance set on the dispatcher.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] after [`stop`](Self::stop).
    pub fn set_cloud_connection(&self, connected: bool) -> Result<()> {
        self.enqueue(Command::CloudConnection { connected })
    }

    /// Ingest run-status updates pushed by the runner.
    ///
    /// May be called concurrently with a reconcile. Unknown instances are
    /// dropped; terminal changes outside a cycle are published as an update
    /// delta.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] after [`stop`](Self::stop).
    pub fn update_run_status(&self, statuses: &[RunStatus]) -> Result<()> {
        if self.shared.dispatch.lock().expect("lock poisoned").closing {
            return Err(Error::Shutdown);
        }

        let mut core = self.shared.core.lock().expect("lock poisoned");
        let cycle_active = core.cycle_active;
        let publish = status::ingest(&mut core.instances, cycle_active, statuses);
        if !publish.is_empty() {
            if let Err(err) = self.shared.deps.status_receiver.instances_update_status(publish) {
                error!(error = %err, "sending update status failed");
            }
        }

        Ok(())
    }

    /// Current status of every live instance, in ident order.
    #[must_use]
    pub fn instance_statuses(&self) -> Vec<InstanceStatus> {
        let core = self.shared.core.lock().expect("lock poisoned");
        status::snapshot(&core.instances)
    }

    fn enqueue(&self, command: Command) -> Result<()> {
        let mut dispatch = self.shared.dispatch.lock().expect("lock poisoned");
        if dispatch.closing {
            return Err(Error::Shutdown);
        }
        dispatch.queue.push_back(command);
        drop(dispatch);
        self.shared.dispatch_cv.notify_all();
        Ok(())
    }

    fn validate_goal(
        &self,
        services: &[ServiceInfo],
        layers: &[LayerInfo],
        instances: &[InstanceInfo],
    ) -> Result<()> {
        let limits = &self.shared.config.limits;

        if services.len() > limits.max_services {
            return Err(Error::InvalidArgument(format!(
                "{} services exceed the configured maximum {}",
                services.len(),
                limits.max_services
            )));
        }
        if layers.len() > limits.max_layers {
            return Err(Error::InvalidArgument(format!(
                "{} layers exceed the configured maximum {}",
                layers.len(),
                limits.max_layers
            )));
        }
        if instances.len() > limits.max_instances {
            return Err(Error::InvalidArgument(format!(
                "{} instances exceed the configured maximum {}",
                instances.len(),
                limits.max_instances
            )));
        }

        let service_ids: HashSet<&str> =
            services.iter().map(|service| service.service_id.as_str()).collect();
        let mut seen = HashSet::new();

        for info in instances {
            if !info.ident.is_valid() {
                return Err(Error::InvalidArgument(format!(
                    "malformed instance ident '{}'",
                    info.ident
                )));
            }
            if !seen.insert(&info.ident) {
                return Err(Error::InvalidArgument(format!(
                    "duplicate instance ident '{}'",
                    info.ident
                )));
            }
            if !service_ids.contains(info.ident.service_id.as_str()) {
                return Err(Error::InvalidArgument(format!(
                    "instance '{}' references unknown service '{}'",
                    info.ident, info.ident.service_id
                )));
            }
        }

        Ok(())
    }

    /// Operation-version gate plus restore of the persisted override set.
    fn prepare_storage(&self) -> Result<()> {
        let storage = &self.shared.deps.storage;

        match storage.get_operation_version() {
            Ok(version) if version < OPERATION_VERSION => {
                info!(
                    persisted = version,
                    current = OPERATION_VERSION,
                    "operation version bumped, purging persisted instances"
                );
                for info in storage.get_all_instances()? {
                    storage.remove_instance(&info.ident)?;
                }
                storage.set_operation_version(OPERATION_VERSION)?;
            }
            Ok(_) => {}
            Err(Error::NotFound(_)) => {
                storage.set_operation_version(OPERATION_VERSION)?;
            }
            Err(err) => return Err(err),
        }

        let overrides = match storage.get_override_env_vars() {
            Ok(entries) => entries,
            Err(Error::NotFound(_)) => Vec::new(),
            Err(err) => return Err(err),
        };
        self.shared.core.lock().expect("lock poisoned").overrides =
            EnvVarRegistry::from_entries(overrides);

        Ok(())
    }
}

impl Drop for Launcher {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            error!(error = %err, "launcher shutdown failed");
        }
    }
}

fn dispatcher_loop(shared: &Arc<Shared>, pool: &WorkerPool) {
    debug!("dispatcher running");

    loop {
        let (command, closing) = {
            let mut dispatch = shared.dispatch.lock().expect("lock poisoned");
            loop {
                if let Some(command) = dispatch.queue.pop_front() {
                    break (Some(command), dispatch.closing);
                }
                if dispatch.closing {
                    break (None, true);
                }
                dispatch = shared
                    .dispatch_cv
                    .wait(dispatch)
                    .expect("lock poisoned");
            }
        };

        let Some(command) = command else { break };
        if closing {
            command.abort();
            continue;
        }

        match command {
            Command::Reconcile {
                services,
                layers,
                instances,
                force_restart,
                ticket,
            } => {
                let result = reconcile(shared, pool, &services, &layers, instances, force_restart);
                ticket.deliver(result);
            }
            Command::OverrideEnvVars { overrides, ticket } => {
                ticket.deliver(apply_overrides(shared, pool, overrides));
            }
            Command::CloudConnection { connected } => set_connection(shared, pool, connected),
            Command::RunLast => {
                if let Err(err) = run_last(shared, pool) {
                    error!(error = %err, "replay of last instances failed");
                }
            }
        }
    }

    pool.shutdown();
    debug!("dispatcher stopped");
}

/// One reconcile cycle; see the module docs for the step list.
fn reconcile(
    shared: &Arc<Shared>,
    pool: &WorkerPool,
    services: &[ServiceInfo],
    layers: &[LayerInfo],
    instances: Vec<InstanceInfo>,
    force_restart: bool,
) -> Result<()> {
    if force_restart {
        info!(instances = instances.len(), "restart instances");
    } else {
        info!(instances = instances.len(), "run instances");
    }

    let deps = &shared.deps;

    // Step 1: rollback snapshot, cycle flag, override expiry pruning.
    let (snapshot_instances, snapshot_services, pruned) = {
        let mut core = shared.core.lock().expect("lock poisoned");
        core.cycle_active = true;
        let pruned = core
            .overrides
            .prune_expired(Utc::now())
            .then(|| core.overrides.entries().to_vec());
        (core.instances.clone(), core.services.clone(), pruned)
    };
    if let Some(entries) = pruned {
        if let Err(err) = deps.storage.set_override_env_vars(&entries) {
            warn!(error = %err, "failed to persist pruned override env vars");
        }
    }

    // Step 2: service push. A fault here aborts the cycle before any
    // instance is touched.
    if let Err(err) = deps.service_manager.process_desired_services(services, layers) {
        error!(error = %err, "service manager rejected desired services");
        shared.core.lock().expect("lock poisoned").cycle_active = false;
        return Err(err);
    }

    // Step 3: cache update; lookups happen outside the core lock.
    let resolved = ServiceCache::resolve(
        deps.service_manager.as_ref(),
        services.iter().map(|service| service.service_id.as_str()),
    );
    shared.core.lock().expect("lock poisoned").services.apply(resolved);

    // Step 4: diff desired against live.
    let desired: BTreeMap<InstanceIdent, InstanceInfo> = instances
        .into_iter()
        .map(|info| (info.ident.clone(), info))
        .collect();
    let (to_stop, to_start) = {
        let core = &mut *shared.core.lock().expect("lock poisoned");

        let mut to_stop = Vec::new();
        for (ident, instance) in &core.instances {
            let keep = !force_restart
                && desired.contains_key(ident)
                && instance.state() == InstanceState::Running
                && core.services.version_of(&ident.service_id)
                    == Some(instance.service_version())
                && desired[ident].limits == instance.info().limits;
            if !keep {
                to_stop.push(ident.clone());
            }
        }

        let stopping: HashSet<&InstanceIdent> = to_stop.iter().collect();
        let surviving: HashSet<InstanceIdent> = core
            .instances
            .keys()
            .filter(|ident| !stopping.contains(*ident))
            .cloned()
            .collect();

        // Survivors adopt the new desired snapshot (non-restarting fields
        // like priority take effect without a relaunch).
        for (ident, instance) in &mut core.instances {
            if let Some(info) = desired.get(ident) {
                if surviving.contains(ident) {
                    instance.update_info(info.clone());
                }
            }
        }

        let mut to_start: Vec<InstanceInfo> = desired
            .values()
            .filter(|info| !surviving.contains(&info.ident))
            .cloned()
            .collect();
        sort_for_start(&mut to_start);

        (to_stop, to_start)
    };

    // Step 5: stop phase, fully drained before any start.
    debug!(count = to_stop.len(), "stop phase");
    for ident in to_stop {
        submit_stop(shared, pool, ident);
    }
    pool.wait_drain();

    // Step 6: start phase in descending priority order.
    debug!(count = to_start.len(), "start phase");
    for info in to_start {
        submit_start(shared, pool, info);
    }
    pool.wait_drain();

    purge_service_cache(shared);

    // Step 7: persist. Failure rolls the in-memory state back to the
    // pre-cycle snapshot.
    if let Err(err) = persist_instances(shared, &desired) {
        error!(error = %err, "storage update failed, rolling back cycle");
        let mut core = shared.core.lock().expect("lock poisoned");
        core.instances = snapshot_instances;
        core.services = snapshot_services;
        core.cycle_active = false;
        return Err(err);
    }

    // Step 8: publish.
    publish_run_status(shared);

    Ok(())
}

/// Replay the persisted instance set through the start phase only.
fn run_last(shared: &Arc<Shared>, pool: &WorkerPool) -> Result<()> {
    info!("run last instances");

    let deps = &shared.deps;
    let stored = deps.storage.get_all_instances()?;

    shared.core.lock().expect("lock poisoned").cycle_active = true;

    let resolved = ServiceCache::resolve(
        deps.service_manager.as_ref(),
        stored.iter().map(|info| info.ident.service_id.as_str()),
    );
    shared.core.lock().expect("lock poisoned").services.apply(resolved);

    let mut to_start = stored;
    sort_for_start(&mut to_start);

    debug!(count = to_start.len(), "start phase");
    for info in to_start {
        submit_start(shared, pool, info);
    }
    pool.wait_drain();

    purge_service_cache(shared);
    publish_run_status(shared);

    Ok(())
}

/// Replace the override set and silently re-launch affected instances.
fn apply_overrides(
    shared: &Arc<Shared>,
    pool: &WorkerPool,
    overrides: Vec<EnvVarsInstanceInfo>,
) -> Result<Vec<EnvVarStatus>> {
    debug!(entries = overrides.len(), "override env vars");

    let deps = &shared.deps;
    let now = Utc::now();

    let (statuses, accepted, previous, mut affected) = {
        let core = &mut *shared.core.lock().expect("lock poisoned");
        let previous = core.overrides.entries().to_vec();

        let CoreState {
            overrides: registry,
            instances,
            ..
        } = core;
        let statuses = registry.replace(overrides, instances.keys(), &shared.config.limits);
        let accepted = registry.entries().to_vec();

        let affected: Vec<InstanceInfo> = instances
            .values()
            .filter(|instance| {
                registry.overlay_for(instance.ident(), now) != instance.env_overlay()
            })
            .map(|instance| instance.info().clone())
            .collect();

        (statuses, accepted, previous, affected)
    };

    if let Err(err) = deps.storage.set_override_env_vars(&accepted) {
        error!(error = %err, "failed to persist override env vars");
        shared.core.lock().expect("lock poisoned").overrides =
            EnvVarRegistry::from_entries(previous);
        return Err(err);
    }

    if !affected.is_empty() {
        info!(count = affected.len(), "re-launching instances with changed env overlay");
        shared.core.lock().expect("lock poisoned").cycle_active = true;

        for info in &affected {
            submit_stop(shared, pool, info.ident.clone());
        }
        pool.wait_drain();

        sort_for_start(&mut affected);
        for info in affected {
            submit_start(shared, pool, info);
        }
        pool.wait_drain();

        // Silent refresh: no snapshot publication.
        shared.core.lock().expect("lock poisoned").cycle_active = false;
    }

    Ok(statuses)
}

fn set_connection(shared: &Arc<Shared>, pool: &WorkerPool, connected: bool) {
    info!(connected, "cloud connection changed");

    let first_connect = {
        let mut core = shared.core.lock().expect("lock poisoned");
        core.connected = connected;
        let first = connected && !core.first_connect_seen;
        if first {
            core.first_connect_seen = true;
        }
        first
    };

    if connected {
        if let Err(err) = shared.deps.storage.set_online_time(Utc::now()) {
            warn!(error = %err, "failed to record online time");
        }
    }

    if first_connect {
        if let Err(err) = run_last(shared, pool) {
            error!(error = %err, "replay on first connect failed");
        }
    }
}

/// Descending priority, ident as deterministic tie-break.
fn sort_for_start(infos: &mut [InstanceInfo]) {
    infos.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.ident.cmp(&b.ident)));
}

fn submit_start(shared: &Arc<Shared>, pool: &WorkerPool, info: InstanceInfo) {
    let shared = Arc::clone(shared);
    let ident = info.ident.clone();
    if let Err(err) = pool.submit(move || start_job(&shared, info)) {
        error!(instance = %ident, error = %err, "can't submit start job");
    }
}

fn submit_stop(shared: &Arc<Shared>, pool: &WorkerPool, ident: InstanceIdent) {
    let shared = Arc::clone(shared);
    let for_log = ident.clone();
    if let Err(err) = pool.submit(move || stop_job(&shared, &ident)) {
        error!(instance = %for_log, error = %err, "can't submit stop job");
    }
}

fn start_job(shared: &Arc<Shared>, info: InstanceInfo) {
    let ident = info.ident.clone();
    if catch_unwind(AssertUnwindSafe(|| start_instance(shared, info))).is_err() {
        error!(instance = %ident, "start job panicked");
        fail_instance(shared, &ident, &Error::Internal("worker fault during start".to_string()));
    }
}

fn stop_job(shared: &Arc<Shared>, ident: &InstanceIdent) {
    if catch_unwind(AssertUnwindSafe(|| stop_instance(shared, ident))).is_err() {
        error!(instance = %ident, "stop job panicked");
        fail_instance(shared, ident, &Error::Internal("worker fault during stop".to_string()));
    }
}

fn start_instance(shared: &Arc<Shared>, info: InstanceInfo) {
    let deps = &shared.deps;
    let ident = info.ident.clone();
    let now = Utc::now();

    let (service, broken_reason, overlay) = {
        let core = &mut *shared.core.lock().expect("lock poisoned");
        if core.instances.contains_key(&ident) {
            debug!(instance = %ident, "instance already live, skipping start");
            return;
        }

        let mut instance = Instance::new(info.clone());
        instance.transition(InstanceState::Starting);

        let service = core.services.get(&ident.service_id).cloned();
        let broken_reason = core
            .services
            .broken_reason(&ident.service_id)
            .map(str::to_string);
        let overlay = core.overrides.overlay_for(&ident, now);

        if let Some(service) = &service {
            instance.set_service_version(&service.version);
        }
        instance.set_env_overlay(overlay.clone());
        core.instances.insert(ident.clone(), instance);

        (service, broken_reason, overlay)
    };

    let Some(service) = service else {
        let reason = broken_reason.unwrap_or_else(|| "service not cached".to_string());
        fail_instance(shared, &ident, &Error::BrokenService(reason));
        return;
    };

    let runtime_dir = match deps.oci_producer.produce(&service, &info, &overlay) {
        Ok(dir) => dir,
        Err(err) => {
            let err = match err {
                Error::InvalidSpec(_) => err,
                other => Error::InvalidSpec(other.to_string()),
            };
            fail_instance(shared, &ident, &err);
            return;
        }
    };

    match deps.runner.start_instance(&info, &runtime_dir) {
        Ok(run_status) => {
            {
                let mut core = shared.core.lock().expect("lock poisoned");
                if let Some(instance) = core.instances.get_mut(&ident) {
                    instance.apply_run_state(run_status.state, run_status.error);
                }
            }
            if let Err(err) = deps.resource_monitor.start_instance_monitoring(&ident, &info.limits)
            {
                warn!(instance = %ident, error = %err, "can't start instance monitoring");
            }
            info!(instance = %ident, "instance started");
        }
        Err(err) => fail_instance(shared, &ident, &err),
    }
}

fn stop_instance(shared: &Arc<Shared>, ident: &InstanceIdent) {
    let deps = &shared.deps;

    {
        let mut core = shared.core.lock().expect("lock poisoned");
        let Some(instance) = core.instances.get_mut(ident) else {
            debug!(instance = %ident, "stop requested for unknown instance");
            return;
        };
        if instance.state() == InstanceState::Running {
            instance.transition(InstanceState::Stopping);
        }
    }

    match deps.runner.stop_instance(ident) {
        // An already-stopped instance counts as success.
        Ok(()) | Err(Error::NotFound(_)) => {
            shared
                .core
                .lock()
                .expect("lock poisoned")
                .instances
                .remove(ident);
            if let Err(err) = deps.resource_monitor.stop_instance_monitoring(ident) {
                warn!(instance = %ident, error = %err, "can't stop instance monitoring");
            }
            info!(instance = %ident, "instance stopped");
        }
        Err(err) => fail_instance(shared, ident, &err),
    }
}

fn fail_instance(shared: &Arc<Shared>, ident: &InstanceIdent, error: &Error) {
    warn!(instance = %ident, error = %error, "instance failed");
    let mut core = shared.core.lock().expect("lock poisoned");
    if let Some(instance) = core.instances.get_mut(ident) {
        instance.fail(error.to_string());
    }
}

fn purge_service_cache(shared: &Arc<Shared>) {
    let core = &mut *shared.core.lock().expect("lock poisoned");
    let referenced: HashSet<String> = core
        .instances
        .keys()
        .map(|ident| ident.service_id.clone())
        .collect();
    core.services.purge_unreferenced(&referenced);
}

fn persist_instances(
    shared: &Arc<Shared>,
    desired: &BTreeMap<InstanceIdent, InstanceInfo>,
) -> Result<()> {
    let storage = &shared.deps.storage;

    let stored: BTreeMap<InstanceIdent, InstanceInfo> = storage
        .get_all_instances()?
        .into_iter()
        .map(|info| (info.ident.clone(), info))
        .collect();

    for ident in stored.keys() {
        if !desired.contains_key(ident) {
            storage.remove_instance(ident)?;
        }
    }
    for (ident, info) in desired {
        match stored.get(ident) {
            None => storage.add_instance(info)?,
            Some(existing) if existing != info => storage.update_instance(info)?,
            Some(_) => {}
        }
    }

    Ok(())
}

/// Publish the full snapshot and close the cycle.
///
/// The snapshot is sent under the core lock so concurrent runner updates
/// cannot interleave an update delta with the cycle's run status.
fn publish_run_status(shared: &Arc<Shared>) {
    let mut core = shared.core.lock().expect("lock poisoned");
    let snapshot = status::snapshot(&core.instances);

    debug!(count = snapshot.len(), "send run status");
    if let Err(err) = shared.deps.status_receiver.instances_run_status(snapshot) {
        error!(error = %err, "sending run status failed");
    }

    core.cycle_active = false;
}
