//! Shared test doubles for the launcher end-to-end tests.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use edgerun_core::contract::{
    OciSpecProducer, ResourceMonitor, Runner, ServiceManager, StatusReceiver, Storage,
};
use edgerun_core::envvars::EnvVarsInstanceInfo;
use edgerun_core::launcher::Dependencies;
use edgerun_core::model::{
    InstanceIdent, InstanceInfo, LayerInfo, ResourceLimits, RunState, RunStatus, ServiceData,
    ServiceInfo,
};
use edgerun_core::{Config, Error, InstanceStatus, Launcher, Result};

/// One runner interaction, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerEvent {
    /// The runner was asked to start this instance.
    Start(InstanceIdent),
    /// The runner was asked to stop this instance.
    Stop(InstanceIdent),
}

#[derive(Default)]
pub struct MockRunner {
    pub events: Mutex<Vec<RunnerEvent>>,
    pub fail_start: Mutex<HashSet<InstanceIdent>>,
    pub start_delay: Mutex<Option<Duration>>,
}

impl MockRunner {
    pub fn starts(&self) -> Vec<InstanceIdent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                RunnerEvent::Start(ident) => Some(ident.clone()),
                RunnerEvent::Stop(_) => None,
            })
            .collect()
    }

    pub fn stops(&self) -> Vec<InstanceIdent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                RunnerEvent::Stop(ident) => Some(ident.clone()),
                RunnerEvent::Start(_) => None,
            })
            .collect()
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

impl Runner for MockRunner {
    fn start_instance(&self, info: &InstanceInfo, _runtime_dir: &Path) -> Result<RunStatus> {
        if let Some(delay) = *self.start_delay.lock().unwrap() {
            std::thread::sleep(delay);
        }

        self.events
            .lock()
            .unwrap()
            .push(RunnerEvent::Start(info.ident.clone()));

        if self.fail_start.lock().unwrap().contains(&info.ident) {
            return Err(Error::Runner("runner rejected start".to_string()));
        }

        Ok(RunStatus {
            ident: info.ident.clone(),
            state: RunState::Running,
            error: None,
        })
    }

    fn stop_instance(&self, ident: &InstanceIdent) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(RunnerEvent::Stop(ident.clone()));
        Ok(())
    }
}

/// Tracks how many reconcile cycles run at once; serialization means the
/// high-water mark never exceeds one.
#[derive(Default)]
pub struct CycleGauge {
    active: AtomicUsize,
    max: AtomicUsize,
}

impl CycleGauge {
    fn enter(&self) {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(active, Ordering::SeqCst);
    }

    fn exit(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                Some(active.saturating_sub(1))
            });
    }

    pub fn max_concurrent(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

pub struct MockServiceManager {
    pub services: Mutex<BTreeMap<String, ServiceData>>,
    pub broken: Mutex<HashSet<String>>,
    pub fail_process: AtomicBool,
    gauge: Arc<CycleGauge>,
}

impl MockServiceManager {
    fn new(gauge: Arc<CycleGauge>) -> Self {
        Self {
            services: Mutex::new(BTreeMap::new()),
            broken: Mutex::new(HashSet::new()),
            fail_process: AtomicBool::new(false),
            gauge,
        }
    }

    /// Seed resolved services without going through a cycle, as if a
    /// previous boot had materialized them.
    pub fn preload(&self, services: &[ServiceInfo]) {
        let mut current = self.services.lock().unwrap();
        for service in services {
            current.insert(service.service_id.clone(), resolve(service));
        }
    }
}

fn resolve(service: &ServiceInfo) -> ServiceData {
    ServiceData {
        service_id: service.service_id.clone(),
        provider_id: service.provider_id.clone(),
        version: service.version.clone(),
        image_path: PathBuf::from("/var/lib/edgerun/services").join(&service.service_id),
    }
}

impl ServiceManager for MockServiceManager {
    fn process_desired_services(
        &self,
        services: &[ServiceInfo],
        _layers: &[LayerInfo],
    ) -> Result<()> {
        self.gauge.enter();

        if self.fail_process.load(Ordering::SeqCst) {
            return Err(Error::Internal("service processing failed".to_string()));
        }

        let mut current = self.services.lock().unwrap();
        current.clear();
        for service in services {
            current.insert(service.service_id.clone(), resolve(service));
        }
        Ok(())
    }

    fn get_service(&self, service_id: &str) -> Result<ServiceData> {
        if self.broken.lock().unwrap().contains(service_id) {
            return Err(Error::NotFound(format!("no usable image for {service_id}")));
        }
        self.services
            .lock()
            .unwrap()
            .get(service_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("service {service_id}")))
    }
}

#[derive(Default)]
pub struct MockOciProducer {
    pub produced: Mutex<Vec<(InstanceIdent, Vec<(String, String)>)>>,
    pub fail_for: Mutex<HashSet<InstanceIdent>>,
}

impl MockOciProducer {
    /// Env overlay recorded at the most recent launch of `ident`.
    pub fn last_overlay(&self, ident: &InstanceIdent) -> Option<Vec<(String, String)>> {
        self.produced
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(produced, _)| produced == ident)
            .map(|(_, overlay)| overlay.clone())
    }
}

impl OciSpecProducer for MockOciProducer {
    fn produce(
        &self,
        _service: &ServiceData,
        info: &InstanceInfo,
        env_overlay: &[(String, String)],
    ) -> Result<PathBuf> {
        if self.fail_for.lock().unwrap().contains(&info.ident) {
            return Err(Error::InvalidSpec("spec generation failed".to_string()));
        }

        self.produced
            .lock()
            .unwrap()
            .push((info.ident.clone(), env_overlay.to_vec()));
        Ok(PathBuf::from("/run/edgerun/specs").join(info.ident.to_string()))
    }
}

pub struct RecordingReceiver {
    pub run: Mutex<Vec<Vec<InstanceStatus>>>,
    pub updates: Mutex<Vec<Vec<InstanceStatus>>>,
    gauge: Arc<CycleGauge>,
}

impl RecordingReceiver {
    fn new(gauge: Arc<CycleGauge>) -> Self {
        Self {
            run: Mutex::new(Vec::new()),
            updates: Mutex::new(Vec::new()),
            gauge,
        }
    }

    pub fn last_run_status(&self) -> Vec<InstanceStatus> {
        self.run.lock().unwrap().last().cloned().unwrap_or_default()
    }

    pub fn run_status_count(&self) -> usize {
        self.run.lock().unwrap().len()
    }
}

impl StatusReceiver for RecordingReceiver {
    fn instances_run_status(&self, instances: Vec<InstanceStatus>) -> Result<()> {
        self.gauge.exit();
        self.run.lock().unwrap().push(instances);
        Ok(())
    }

    fn instances_update_status(&self, instances: Vec<InstanceStatus>) -> Result<()> {
        self.updates.lock().unwrap().push(instances);
        Ok(())
    }
}

#[derive(Default)]
struct StoreState {
    instances: BTreeMap<InstanceIdent, InstanceInfo>,
    operation_version: Option<u64>,
    overrides: Vec<EnvVarsInstanceInfo>,
    online_time: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<StoreState>,
    pub fail_writes: AtomicBool,
}

impl MemoryStorage {
    fn check_write(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage("write failed".to_string()));
        }
        Ok(())
    }

    pub fn seed_instances(&self, instances: &[InstanceInfo]) {
        let mut state = self.state.lock().unwrap();
        for info in instances {
            state.instances.insert(info.ident.clone(), info.clone());
        }
    }

    pub fn set_operation_version_raw(&self, version: u64) {
        self.state.lock().unwrap().operation_version = Some(version);
    }

    pub fn stored_idents(&self) -> Vec<InstanceIdent> {
        self.state.lock().unwrap().instances.keys().cloned().collect()
    }

    pub fn stored_overrides(&self) -> Vec<EnvVarsInstanceInfo> {
        self.state.lock().unwrap().overrides.clone()
    }

    pub fn online_time(&self) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().online_time
    }
}

impl Storage for MemoryStorage {
    fn add_instance(&self, instance: &InstanceInfo) -> Result<()> {
        self.check_write()?;
        let mut state = self.state.lock().unwrap();
        if state.instances.contains_key(&instance.ident) {
            return Err(Error::AlreadyExists(instance.ident.to_string()));
        }
        state.instances.insert(instance.ident.clone(), instance.clone());
        Ok(())
    }

    fn update_instance(&self, instance: &InstanceInfo) -> Result<()> {
        self.check_write()?;
        let mut state = self.state.lock().unwrap();
        match state.instances.get_mut(&instance.ident) {
            Some(stored) => {
                *stored = instance.clone();
                Ok(())
            }
            None => Err(Error::NotFound(instance.ident.to_string())),
        }
    }

    fn remove_instance(&self, ident: &InstanceIdent) -> Result<()> {
        self.check_write()?;
        self.state
            .lock()
            .unwrap()
            .instances
            .remove(ident)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(ident.to_string()))
    }

    fn get_all_instances(&self) -> Result<Vec<InstanceInfo>> {
        Ok(self.state.lock().unwrap().instances.values().cloned().collect())
    }

    fn get_operation_version(&self) -> Result<u64> {
        self.state
            .lock()
            .unwrap()
            .operation_version
            .ok_or_else(|| Error::NotFound("operation version".to_string()))
    }

    fn set_operation_version(&self, version: u64) -> Result<()> {
        self.check_write()?;
        self.state.lock().unwrap().operation_version = Some(version);
        Ok(())
    }

    fn get_override_env_vars(&self) -> Result<Vec<EnvVarsInstanceInfo>> {
        Ok(self.state.lock().unwrap().overrides.clone())
    }

    fn set_override_env_vars(&self, overrides: &[EnvVarsInstanceInfo]) -> Result<()> {
        self.check_write()?;
        self.state.lock().unwrap().overrides = overrides.to_vec();
        Ok(())
    }

    fn get_online_time(&self) -> Result<DateTime<Utc>> {
        self.state
            .lock()
            .unwrap()
            .online_time
            .ok_or_else(|| Error::NotFound("online time".to_string()))
    }

    fn set_online_time(&self, time: DateTime<Utc>) -> Result<()> {
        self.check_write()?;
        self.state.lock().unwrap().online_time = Some(time);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockMonitor {
    pub active: Mutex<HashSet<InstanceIdent>>,
}

impl ResourceMonitor for MockMonitor {
    fn start_instance_monitoring(
        &self,
        ident: &InstanceIdent,
        _limits: &ResourceLimits,
    ) -> Result<()> {
        self.active.lock().unwrap().insert(ident.clone());
        Ok(())
    }

    fn stop_instance_monitoring(&self, ident: &InstanceIdent) -> Result<()> {
        self.active.lock().unwrap().remove(ident);
        Ok(())
    }
}

/// Fully wired launcher plus handles to every mock.
pub struct TestContext {
    pub launcher: Launcher,
    pub runner: Arc<MockRunner>,
    pub service_manager: Arc<MockServiceManager>,
    pub oci: Arc<MockOciProducer>,
    pub receiver: Arc<RecordingReceiver>,
    pub storage: Arc<MemoryStorage>,
    pub monitor: Arc<MockMonitor>,
    pub gauge: Arc<CycleGauge>,
}

pub fn context() -> TestContext {
    context_with(Config::default())
}

pub fn context_with(config: Config) -> TestContext {
    init_log();

    let gauge = Arc::new(CycleGauge::default());
    let runner = Arc::new(MockRunner::default());
    let service_manager = Arc::new(MockServiceManager::new(Arc::clone(&gauge)));
    let oci = Arc::new(MockOciProducer::default());
    let receiver = Arc::new(RecordingReceiver::new(Arc::clone(&gauge)));
    let storage = Arc::new(MemoryStorage::default());
    let monitor = Arc::new(MockMonitor::default());

    let launcher = Launcher::new(
        Dependencies {
            runner: Arc::clone(&runner) as Arc<dyn Runner>,
            service_manager: Arc::clone(&service_manager) as Arc<dyn ServiceManager>,
            oci_producer: Arc::clone(&oci) as Arc<dyn OciSpecProducer>,
            status_receiver: Arc::clone(&receiver) as Arc<dyn StatusReceiver>,
            storage: Arc::clone(&storage) as Arc<dyn Storage>,
            resource_monitor: Arc::clone(&monitor) as Arc<dyn ResourceMonitor>,
        },
        config,
    );

    TestContext {
        launcher,
        runner,
        service_manager,
        oci,
        receiver,
        storage,
        monitor,
        gauge,
    }
}

fn init_log() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn service(id: &str, version: &str) -> ServiceInfo {
    ServiceInfo {
        service_id: id.to_string(),
        provider_id: "provider1".to_string(),
        version: version.to_string(),
        gid: 0,
    }
}

pub fn instance(service_id: &str, index: u64) -> InstanceInfo {
    instance_with_priority(service_id, index, 0)
}

pub fn instance_with_priority(service_id: &str, index: u64, priority: u64) -> InstanceInfo {
    InstanceInfo::new(InstanceIdent::new(service_id, "subject1", index), priority)
}

pub fn ident(service_id: &str, index: u64) -> InstanceIdent {
    InstanceIdent::new(service_id, "subject1", index)
}
