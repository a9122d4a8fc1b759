//! Instance lifecycle: create → install → stopped ⇄ running → deleted.
//!
//! Records on disk are the source of truth. Container handles are never cached;
//! every operation finds the container again through the naming convention.
//! Lifecycle operations on one instance are serialised by a per-instance lock,
//! held both in memory and as a lock file so separate processes also take turns.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, MutexGuard};

use chrono::Utc;
use hatchery_instance::{
    InstanceId, InstanceState, PortMapping, PortProtocol, ResourceLimits, duplicate_internal_port,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::blueprint::BlueprintResolver;
use crate::config::AgentConfig;
use crate::console::{ConsoleSubscription, ConsoleSupervisor};
use crate::error::{OrchestratorError, Result};
use crate::filesystem::SandboxedFs;
use crate::image_resolver::{FallbackPolicy, ResolutionSession};
use crate::install::InstallationRunner;
use crate::lockfile::FileLock;
use crate::port_alloc;
use crate::runtime::{ContainerRuntime, ContainerSpec, ExecOutput, RuntimeError};
use crate::startup::{self, CompiledStartup, StartupParams};
use crate::store::{InstanceRecord, InstanceStore};

const CONTAINER_HOME: &str = "/home/container";
const MIN_MEMORY_MB: u64 = 64;

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct CreateRequest {
    pub name: String,
    pub blueprint: String,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub startup_override: Option<String>,
}

/// Settings changes; applied to the container on the next `recreate`.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct SettingsPatch {
    pub name: Option<String>,
    /// An empty string clears the override.
    pub startup_override: Option<String>,
    /// Merged over the current environment.
    pub environment: Option<BTreeMap<String, String>>,
    pub limits: Option<ResourceLimits>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Applied,
    AlreadyInState,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct InstanceView {
    #[serde(flatten)]
    pub record: InstanceRecord,
    /// Freshly derived from the runtime.
    pub status: InstanceState,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ReconcileReport {
    pub attached: Vec<InstanceId>,
    pub rolled_back: Vec<InstanceId>,
    pub deleted: Vec<InstanceId>,
    pub missing: Vec<InstanceId>,
}

fn validate_limits(limits: &ResourceLimits) -> std::result::Result<(), String> {
    if limits.memory_mb < MIN_MEMORY_MB {
        return Err(format!("memory must be at least {MIN_MEMORY_MB} MB"));
    }
    if limits.cpu_percent == 0 {
        return Err("cpu share must be greater than zero".to_string());
    }
    Ok(())
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(OrchestratorError::Cancelled(what.to_string())),
        r = fut => r,
    }
}

/// Exclusive hold on one instance for this process and every other process
/// on the same data root.
struct InstanceGuard {
    _file: FileLock,
    _local: OwnedMutexGuard<()>,
}

pub struct InstanceManager {
    config: Arc<AgentConfig>,
    runtime: Arc<dyn ContainerRuntime>,
    policy: Arc<FallbackPolicy>,
    blueprints: BlueprintResolver,
    store: InstanceStore,
    installer: InstallationRunner,
    console: ConsoleSupervisor,
    locks: std::sync::Mutex<HashMap<InstanceId, Arc<Mutex<()>>>>,
    provisioning: std::sync::Mutex<HashMap<InstanceId, CancellationToken>>,
    /// Held while ports are checked and the new record is first written.
    reservations: Mutex<()>,
}

impl InstanceManager {
    pub fn new(
        config: AgentConfig,
        runtime: Arc<dyn ContainerRuntime>,
        policy: FallbackPolicy,
    ) -> Self {
        let config = Arc::new(config);
        Self {
            blueprints: BlueprintResolver::new(config.eggs_dir.clone()),
            store: InstanceStore::new(config.state_dir()),
            installer: InstallationRunner::new(runtime.clone(), config.clone()),
            console: ConsoleSupervisor::new(runtime.clone(), config.clone()),
            policy: Arc::new(policy),
            runtime,
            config,
            locks: std::sync::Mutex::new(HashMap::new()),
            provisioning: std::sync::Mutex::new(HashMap::new()),
            reservations: Mutex::new(()),
        }
    }

    /// Builds a manager from configuration, loading custom fallback chains and
    /// creating the data layout.
    pub fn from_config(config: AgentConfig, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        let policy = match &config.fallback_chains_file {
            Some(path) => FallbackPolicy::load(path)?,
            None => FallbackPolicy::builtin(),
        };
        config.ensure_dirs()?;
        Ok(Self::new(config, runtime, policy))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn console(&self) -> &ConsoleSupervisor {
        &self.console
    }

    fn lock_for(&self, id: &InstanceId) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn lock_instance(&self, id: &InstanceId) -> Result<InstanceGuard> {
        let local = self.lock_for(id).lock_owned().await;
        let file = FileLock::acquire(self.config.instance_lock_path(id.as_str())).await?;
        Ok(InstanceGuard {
            _file: file,
            _local: local,
        })
    }

    /// Drops the in-memory lock and the lock file of an instance that is gone.
    /// Must be called while the instance is still locked.
    async fn forget_lock(&self, id: &InstanceId) {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        if let Err(e) = tokio::fs::remove_file(self.config.instance_lock_path(id.as_str())).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(instance_id = %id, error = %e, "lock file not removed");
        }
    }

    /// Loads a record under its lock; a missing record leaves no lock behind.
    async fn load_locked(&self, id: &InstanceId) -> Result<InstanceRecord> {
        let loaded = self.store.load(id).await;
        if let Err(OrchestratorError::NotFound { .. }) = &loaded {
            self.forget_lock(id).await;
        }
        loaded
    }

    fn provisioning(&self) -> MutexGuard<'_, HashMap<InstanceId, CancellationToken>> {
        self.provisioning.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn parse_id(raw: &str) -> Result<InstanceId> {
        InstanceId::parse(raw).ok_or_else(|| OrchestratorError::not_found("instance", raw))
    }

    fn container_name(&self, id: &InstanceId) -> String {
        self.config.container_name(id.as_str())
    }

    fn ensure_settled(record: &InstanceRecord) -> Result<()> {
        if record.state.is_transitional() {
            return Err(OrchestratorError::invalid(format!(
                "instance {} is {}",
                record.id, record.state
            )));
        }
        Ok(())
    }

    // ---- queries ----

    async fn derive_status(&self, record: &InstanceRecord) -> InstanceState {
        if record.state.is_transitional() {
            return record.state;
        }
        match self
            .runtime
            .inspect_container(&self.container_name(&record.id))
            .await
        {
            Ok(Some(s)) if s.running => InstanceState::Running,
            Ok(Some(_)) => InstanceState::Stopped,
            Ok(None) => InstanceState::Offline,
            Err(e) => {
                tracing::warn!(instance_id = %record.id, error = %e, "status query failed");
                InstanceState::Offline
            }
        }
    }

    async fn view(&self, record: InstanceRecord) -> InstanceView {
        let status = self.derive_status(&record).await;
        InstanceView { record, status }
    }

    pub async fn list(&self) -> Result<Vec<InstanceView>> {
        let mut out = Vec::new();
        for record in self.store.list().await? {
            out.push(self.view(record).await);
        }
        Ok(out)
    }

    pub async fn get(&self, id: &str) -> Result<InstanceView> {
        let id = Self::parse_id(id)?;
        let record = self.store.load(&id).await?;
        Ok(self.view(record).await)
    }

    async fn reserved_ports(&self) -> Result<HashSet<(u16, PortProtocol)>> {
        Ok(self
            .store
            .list()
            .await?
            .iter()
            .flat_map(|r| r.ports.iter().map(|p| (p.external, p.protocol)))
            .collect())
    }

    // ---- creation ----

    pub async fn create(&self, req: CreateRequest) -> Result<InstanceView> {
        let name = req.name.trim().to_string();
        let mut fields = BTreeMap::new();
        if name.is_empty() {
            fields.insert("name".to_string(), "is required".to_string());
        }
        if let Err(msg) = validate_limits(&req.limits) {
            fields.insert("limits".to_string(), msg);
        }
        if req.ports.iter().any(|p| p.internal == 0) {
            fields.insert("ports".to_string(), "internal port must be non-zero".to_string());
        } else if let Some(port) = duplicate_internal_port(&req.ports) {
            fields.insert("ports".to_string(), format!("internal port {port} is mapped twice"));
        }
        if !fields.is_empty() {
            return Err(OrchestratorError::invalid_fields("invalid instance", fields));
        }

        let blueprint = self.blueprints.resolve(&req.blueprint)?;
        let environment = blueprint.resolve_variables(&req.variables)?;

        let id = InstanceId::new();
        let _guard = self.lock_instance(&id).await?;
        let cancel = CancellationToken::new();
        self.provisioning().insert(id.clone(), cancel.clone());

        let result = async {
            let record = {
                let _reservations = self.reservations.lock().await;
                let _ports = FileLock::acquire(self.config.ports_lock_path()).await?;
                let ports = port_alloc::reserve_ports(&req.ports, &self.reserved_ports().await?)?;
                let record = InstanceRecord {
                    id: id.clone(),
                    name,
                    blueprint_ref: blueprint.reference.clone(),
                    blueprint,
                    environment,
                    ports,
                    limits: req.limits,
                    startup_override: req.startup_override.filter(|s| !s.trim().is_empty()),
                    startup_command: String::new(),
                    state: InstanceState::Created,
                    image: None,
                    created_at: Utc::now(),
                };
                self.store.save(&record).await?;
                record
            };
            tracing::info!(instance_id = %id, blueprint = %record.blueprint_ref, "instance created");
            self.provision(record, &cancel).await
        }
        .await;

        self.provisioning().remove(&id);
        match result {
            Ok(record) => {
                tracing::info!(instance_id = %id, image = ?record.image, "instance ready");
                Ok(InstanceView {
                    status: record.state,
                    record,
                })
            }
            Err(e) => {
                tracing::warn!(instance_id = %id, error = %e, "provisioning failed; rolling back");
                self.rollback(&id).await;
                self.forget_lock(&id).await;
                drop(_guard);
                Err(e)
            }
        }
    }

    async fn provision(
        &self,
        mut record: InstanceRecord,
        cancel: &CancellationToken,
    ) -> Result<InstanceRecord> {
        let data_dir = self.config.instance_dir(record.id.as_str());
        tokio::fs::create_dir_all(&data_dir).await?;

        record.state = InstanceState::Installing;
        self.store.save(&record).await?;

        let mut session = ResolutionSession::new(self.runtime.clone(), self.policy.clone());
        let image = cancellable(
            cancel,
            "image resolution",
            session.resolve_runtime(&record.blueprint.images),
        )
        .await?;

        let params = self.startup_params(&record);
        self.installer
            .run(
                &mut session,
                record.id.as_str(),
                &record.blueprint,
                &params.variables(),
                &data_dir,
                cancel,
            )
            .await?;

        let compiled = self.compile_startup(&record);
        cancellable(
            cancel,
            "container creation",
            self.create_container(&record, &image, &compiled),
        )
        .await?;

        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled("provisioning".into()));
        }
        record.image = Some(image);
        record.startup_command = compiled.command;
        record.state = InstanceState::Stopped;
        self.store.save(&record).await?;
        Ok(record)
    }

    /// Removes every trace of a failed or abandoned provisioning attempt. The
    /// install log is kept for diagnosis.
    async fn rollback(&self, id: &InstanceId) {
        for name in [
            self.container_name(id),
            self.config.install_container_name(id.as_str()),
        ] {
            match self.runtime.remove_container(&name, true).await {
                Ok(()) | Err(RuntimeError::NotFound(_)) => {}
                Err(e) => tracing::warn!(instance_id = %id, container = %name, error = %e, "rollback: remove failed"),
            }
        }
        let dir = self.config.instance_dir(id.as_str());
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(instance_id = %id, error = %e, "rollback: data directory not removed");
        }
        if let Err(e) = self.store.remove(id).await {
            tracing::warn!(instance_id = %id, error = %e, "rollback: record not removed");
        }
    }

    fn startup_params(&self, record: &InstanceRecord) -> StartupParams {
        StartupParams {
            memory_mb: record.limits.memory_mb,
            primary_port: record.primary_port().map(|p| p.internal),
            ip: "0.0.0.0".to_string(),
            env: record.environment.clone(),
            accept_eula: record.blueprint.requires_eula(),
        }
    }

    fn compile_startup(&self, record: &InstanceRecord) -> CompiledStartup {
        let params = self.startup_params(record);
        let template = record.startup_template();
        let missing = startup::unresolved(template, &params.variables());
        if !missing.is_empty() {
            tracing::warn!(instance_id = %record.id, ?missing, "startup template has unresolved placeholders");
        }
        startup::compile(template, &params)
    }

    async fn create_container(
        &self,
        record: &InstanceRecord,
        image: &str,
        compiled: &CompiledStartup,
    ) -> Result<()> {
        let mut env: Vec<String> = self
            .startup_params(record)
            .variables()
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        env.push(format!("STARTUP={}", compiled.command));

        let data_dir = self.config.instance_dir(record.id.as_str());
        let spec = ContainerSpec {
            name: self.container_name(&record.id),
            image: image.to_string(),
            env,
            cmd: compiled.container_cmd(),
            entrypoint: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
            working_dir: Some(CONTAINER_HOME.to_string()),
            user: Some(self.config.container_user.clone()).filter(|u| !u.is_empty()),
            binds: vec![format!("{}:{CONTAINER_HOME}", data_dir.display())],
            ports: record.ports.clone(),
            memory_mb: record.limits.memory_mb,
            cpu_percent: record.limits.cpu_percent,
            disk_mb: Some(record.limits.disk_mb)
                .filter(|d| self.config.enforce_disk_quota && *d > 0),
            stop_signal: Some(record.blueprint.stop_signal.clone()),
            labels: [
                ("hatchery.instance".to_string(), record.id.to_string()),
                ("hatchery.blueprint".to_string(), record.blueprint_ref.clone()),
            ]
            .into_iter()
            .collect(),
            restart_unless_stopped: true,
        };
        self.runtime
            .create_container(&spec)
            .await
            .map_err(|e| OrchestratorError::from_runtime("create", "image", image, e))?;
        tracing::info!(instance_id = %record.id, container = %spec.name, %image, "container created");
        Ok(())
    }

    // ---- lifecycle ----

    /// Persists `running` only after the runtime reports the container running.
    async fn confirm_running(&self, record: &mut InstanceRecord, op: &'static str) -> Result<()> {
        let name = self.container_name(&record.id);
        let status = self
            .runtime
            .inspect_container(&name)
            .await
            .map_err(|e| OrchestratorError::from_runtime(op, "container", record.id.as_str(), e))?;
        match status {
            Some(s) if s.running => {
                record.state = InstanceState::Running;
                self.store.save(record).await?;
                Ok(())
            }
            Some(s) => {
                record.state = InstanceState::Stopped;
                self.store.save(record).await?;
                Err(OrchestratorError::Runtime {
                    op,
                    message: match s.exit_code {
                        Some(code) => format!("container exited immediately (exit code {code})"),
                        None => "container is not running".to_string(),
                    },
                })
            }
            None => Err(OrchestratorError::not_found("container", record.id.as_str())),
        }
    }

    pub async fn start(&self, id: &str) -> Result<Transition> {
        let id = Self::parse_id(id)?;
        let _guard = self.lock_instance(&id).await?;

        let mut record = self.load_locked(&id).await?;
        Self::ensure_settled(&record)?;
        let transition = match self.runtime.start_container(&self.container_name(&id)).await {
            Ok(()) => Transition::Applied,
            Err(RuntimeError::NotModified(_)) => Transition::AlreadyInState,
            Err(e) => return Err(OrchestratorError::from_runtime("start", "container", id.as_str(), e)),
        };
        self.confirm_running(&mut record, "start").await?;
        self.console.attach(id.as_str()).await;
        tracing::info!(instance_id = %id, ?transition, "instance started");
        Ok(transition)
    }

    pub async fn stop(&self, id: &str) -> Result<Transition> {
        let id = Self::parse_id(id)?;
        let _guard = self.lock_instance(&id).await?;

        let mut record = self.load_locked(&id).await?;
        Self::ensure_settled(&record)?;
        let transition = match self
            .runtime
            .stop_container(&self.container_name(&id), self.config.stop_grace)
            .await
        {
            Ok(()) => Transition::Applied,
            Err(RuntimeError::NotModified(_)) => Transition::AlreadyInState,
            Err(e) => return Err(OrchestratorError::from_runtime("stop", "container", id.as_str(), e)),
        };
        self.console.detach(id.as_str()).await;
        record.state = InstanceState::Stopped;
        self.store.save(&record).await?;
        tracing::info!(instance_id = %id, ?transition, "instance stopped");
        Ok(transition)
    }

    pub async fn restart(&self, id: &str) -> Result<()> {
        let id = Self::parse_id(id)?;
        let _guard = self.lock_instance(&id).await?;

        let mut record = self.load_locked(&id).await?;
        Self::ensure_settled(&record)?;
        self.runtime
            .restart_container(&self.container_name(&id), self.config.stop_grace)
            .await
            .map_err(|e| OrchestratorError::from_runtime("restart", "container", id.as_str(), e))?;
        self.confirm_running(&mut record, "restart").await?;
        self.console.attach(id.as_str()).await;
        tracing::info!(instance_id = %id, "instance restarted");
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let id = Self::parse_id(id)?;
        let cancelled = match self.provisioning().get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        };
        let _guard = self.lock_instance(&id).await?;

        let mut record = match self.load_locked(&id).await {
            Ok(r) => r,
            // Provisioning noticed the cancellation and rolled back.
            Err(OrchestratorError::NotFound { .. }) if cancelled => {
                tracing::info!(instance_id = %id, "provisioning cancelled by delete");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        record.state = InstanceState::Deleting;
        self.store.save(&record).await?;
        self.teardown(&id).await?;
        self.forget_lock(&id).await;
        drop(_guard);
        tracing::info!(instance_id = %id, "instance deleted");
        Ok(())
    }

    /// Detaches the console before the container goes away, then removes the
    /// container, the data directory and the record, in that order.
    async fn teardown(&self, id: &InstanceId) -> Result<()> {
        self.console.detach(id.as_str()).await;
        match self.runtime.remove_container(&self.container_name(id), true).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => return Err(OrchestratorError::from_runtime("delete", "container", id.as_str(), e)),
        }
        let installer = self.config.install_container_name(id.as_str());
        match self.runtime.remove_container(&installer, true).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => tracing::warn!(instance_id = %id, container = %installer, error = %e, "delete: installer not removed"),
        }

        match tokio::fs::remove_dir_all(self.config.instance_dir(id.as_str())).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Err(e) = tokio::fs::remove_file(self.config.install_log_path(id.as_str())).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(instance_id = %id, error = %e, "delete: install log not removed");
        }
        self.store.remove(id).await?;
        self.console.forget(id.as_str()).await;
        Ok(())
    }

    /// Rebuilds the container from the persisted record without reinstalling.
    pub async fn recreate(&self, id: &str) -> Result<InstanceView> {
        let id = Self::parse_id(id)?;
        let _guard = self.lock_instance(&id).await?;

        let mut record = self.load_locked(&id).await?;
        Self::ensure_settled(&record)?;

        // Resolve first so a registry outage leaves the old container alone.
        let mut session = ResolutionSession::new(self.runtime.clone(), self.policy.clone());
        let image = session.resolve_runtime(&record.blueprint.images).await?;

        self.console.detach(id.as_str()).await;
        match self.runtime.remove_container(&self.container_name(&id), true).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => return Err(OrchestratorError::from_runtime("recreate", "container", id.as_str(), e)),
        }

        let compiled = self.compile_startup(&record);
        self.create_container(&record, &image, &compiled).await?;
        record.image = Some(image);
        record.startup_command = compiled.command;
        record.state = InstanceState::Stopped;
        self.store.save(&record).await?;
        tracing::info!(instance_id = %id, "instance recreated");
        Ok(InstanceView {
            status: InstanceState::Stopped,
            record,
        })
    }

    pub async fn update_settings(&self, id: &str, patch: SettingsPatch) -> Result<InstanceRecord> {
        let id = Self::parse_id(id)?;
        let _guard = self.lock_instance(&id).await?;

        let mut record = self.load_locked(&id).await?;
        Self::ensure_settled(&record)?;

        if let Some(name) = patch.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(OrchestratorError::invalid_fields(
                    "invalid settings",
                    BTreeMap::from([("name".to_string(), "is required".to_string())]),
                ));
            }
            record.name = name.to_string();
        }
        if let Some(env) = patch.environment {
            let mut merged = record.environment.clone();
            merged.extend(env);
            record.environment = record.blueprint.resolve_variables(&merged)?;
        }
        if let Some(limits) = patch.limits {
            validate_limits(&limits).map_err(|msg| {
                OrchestratorError::invalid_fields(
                    "invalid settings",
                    BTreeMap::from([("limits".to_string(), msg)]),
                )
            })?;
            record.limits = limits;
        }
        if let Some(startup) = patch.startup_override {
            record.startup_override = Some(startup).filter(|s| !s.trim().is_empty());
        }
        self.store.save(&record).await?;
        tracing::info!(instance_id = %id, "settings updated; recreate to apply");
        Ok(record)
    }

    // ---- console, commands, files ----

    pub async fn attach_console(&self, id: &str) -> Result<ConsoleSubscription> {
        let id = Self::parse_id(id)?;
        let record = self.store.load(&id).await?;
        // History lives in memory; a fresh process starts with none.
        self.console.prime(id.as_str()).await;
        let subscription = self.console.subscribe(id.as_str()).await;
        if self.derive_status(&record).await == InstanceState::Running {
            self.console.attach(id.as_str()).await;
        }
        Ok(subscription)
    }

    /// Runs `text` through `sh -c` inside the running container and echoes the
    /// result onto the console.
    pub async fn send_command(&self, id: &str, text: &str) -> Result<ExecOutput> {
        let id = Self::parse_id(id)?;
        let record = self.store.load(&id).await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(OrchestratorError::invalid("command is empty"));
        }
        if self.derive_status(&record).await != InstanceState::Running {
            return Err(OrchestratorError::NotRunning(id.to_string()));
        }

        self.console.emit(id.as_str(), &format!("> {text}")).await;
        let out = self
            .runtime
            .exec(
                &self.container_name(&id),
                vec!["sh".to_string(), "-c".to_string(), text.to_string()],
            )
            .await
            .map_err(|e| OrchestratorError::from_runtime("command", "container", id.as_str(), e))?;
        self.console.emit(id.as_str(), &out.output).await;
        tracing::debug!(instance_id = %id, exit_code = ?out.exit_code, "command executed");
        Ok(out)
    }

    pub async fn files(&self, id: &str) -> Result<SandboxedFs> {
        let id = Self::parse_id(id)?;
        let record = self.store.load(&id).await?;
        if record.state == InstanceState::Deleting {
            return Err(OrchestratorError::not_found("instance", id.as_str()));
        }
        Ok(SandboxedFs::new(
            self.config.instance_dir(id.as_str()),
            self.config.max_read_bytes,
        ))
    }

    // ---- startup ----

    /// Re-acquires live state after a restart of this process.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for listed in self.store.list().await? {
            let id = listed.id;
            if self.provisioning().contains_key(&id) {
                continue;
            }
            let _guard = self.lock_instance(&id).await?;
            // Another process may have moved it on while we waited.
            let mut record = match self.load_locked(&id).await {
                Ok(r) => r,
                Err(OrchestratorError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };

            match record.state {
                InstanceState::Created | InstanceState::Installing => {
                    tracing::warn!(instance_id = %id, "abandoned provisioning; rolling back");
                    self.rollback(&id).await;
                    self.forget_lock(&id).await;
                    report.rolled_back.push(id);
                }
                InstanceState::Deleting => match self.teardown(&id).await {
                    Ok(()) => {
                        self.forget_lock(&id).await;
                        report.deleted.push(id);
                    }
                    Err(e) => tracing::warn!(instance_id = %id, error = %e, "could not finish delete"),
                },
                _ => match self.derive_status(&record).await {
                    InstanceState::Running => {
                        if record.state != InstanceState::Running {
                            record.state = InstanceState::Running;
                            self.store.save(&record).await?;
                        }
                        self.console.attach(id.as_str()).await;
                        report.attached.push(id);
                    }
                    InstanceState::Offline => {
                        tracing::warn!(instance_id = %id, "container missing; recreate to repair");
                        report.missing.push(id);
                    }
                    _ => {
                        if record.state != InstanceState::Stopped {
                            record.state = InstanceState::Stopped;
                            self.store.save(&record).await?;
                        }
                    }
                },
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_resolver::{FallbackChain, INSTALLER_FAMILY};
    use crate::testing::FakeRuntime;
    use std::time::Duration;

    const GAME_EGG: &str = r##"{
        "name": "Test Game",
        "docker_images": {"Old": "X:old"},
        "startup": "run.sh -Xmx{{MEM}}M",
        "config": {"stop": "^C"},
        "scripts": {"installation": {"script": "#!/bin/bash\necho installing\n", "container": "debian:bookworm-slim", "entrypoint": "bash"}},
        "variables": [
            {"name": "Memory", "env_variable": "MEM", "default_value": "1024", "user_viewable": true, "user_editable": true, "rules": "required|integer"}
        ]
    }"##;

    struct Harness {
        dir: tempfile::TempDir,
        rt: Arc<FakeRuntime>,
        mgr: Arc<InstanceManager>,
    }

    impl Harness {
        fn container(&self, id: &InstanceId) -> String {
            format!("game_server_{id}")
        }

        fn data_dir(&self, id: &InstanceId) -> std::path::PathBuf {
            self.dir.path().join("volumes").join(id.as_str())
        }

        /// A second manager over the same data root, as after a process restart.
        fn restarted(&self) -> InstanceManager {
            InstanceManager::new(self.mgr.config().clone(), self.rt.clone(), policy())
        }
    }

    fn policy() -> FallbackPolicy {
        FallbackPolicy::new(vec![
            FallbackChain {
                family: INSTALLER_FAMILY.to_string(),
                patterns: vec![],
                images: vec!["debian:bookworm-slim".to_string()],
            },
            FallbackChain {
                family: "x".to_string(),
                patterns: vec!["x:".to_string()],
                images: vec!["X:fallback".to_string()],
            },
        ])
    }

    fn harness(rt: FakeRuntime) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::with_data_root(dir.path());
        config.console_poll_interval = Duration::from_millis(20);
        config.ensure_dirs().unwrap();

        let eggs = config.eggs_dir.join("test");
        std::fs::create_dir_all(&eggs).unwrap();
        std::fs::write(eggs.join("egg-game.json"), GAME_EGG).unwrap();
        std::fs::write(
            eggs.join("egg-unnamed.json"),
            r#"{"docker_images": {"a": "X:old"}, "startup": "./run"}"#,
        )
        .unwrap();

        let rt = Arc::new(rt.with_present("debian:bookworm-slim"));
        let mgr = Arc::new(InstanceManager::new(config, rt.clone(), policy()));
        Harness { dir, rt, mgr }
    }

    fn working() -> FakeRuntime {
        FakeRuntime::new()
            .with_pullable("X:fallback")
            .with_install_exit(0, &["installing"])
    }

    fn request(ports: Vec<PortMapping>) -> CreateRequest {
        CreateRequest {
            name: "survival".to_string(),
            blueprint: "test/game".to_string(),
            variables: BTreeMap::from([("MEM".to_string(), "2048".to_string())]),
            ports,
            limits: ResourceLimits::default(),
            startup_override: None,
        }
    }

    async fn created(h: &Harness) -> InstanceId {
        h.mgr.create(request(vec![PortMapping::tcp(25565, 0)])).await.unwrap().record.id
    }

    #[tokio::test]
    async fn create_falls_back_and_start_streams_console() {
        let h = harness(working());
        let view = h.mgr.create(request(vec![PortMapping::tcp(25565, 0)])).await.unwrap();
        let id = view.record.id.clone();

        assert_eq!(view.status, InstanceState::Stopped);
        assert_eq!(view.record.image.as_deref(), Some("X:fallback"));
        assert_eq!(view.record.startup_command, "run.sh -Xmx2048M");
        assert_ne!(view.record.ports[0].external, 0);

        let c = h.rt.container(&h.container(&id)).unwrap();
        assert!(!c.running);
        assert_eq!(c.spec.image, "X:fallback");
        assert_eq!(c.spec.stop_signal.as_deref(), Some("SIGINT"));
        assert!(c.spec.cmd[0].ends_with("exec run.sh -Xmx2048M\n"));
        assert!(c.spec.env.contains(&"SERVER_MEMORY=1024".to_string()));
        assert!(c.spec.binds[0].ends_with(":/home/container"));
        assert_eq!(h.mgr.get(id.as_str()).await.unwrap().status, InstanceState::Stopped);

        let mut sub = h.mgr.attach_console(id.as_str()).await.unwrap();
        assert_eq!(h.mgr.start(id.as_str()).await.unwrap(), Transition::Applied);
        assert_eq!(h.mgr.get(id.as_str()).await.unwrap().status, InstanceState::Running);

        let line = tokio::time::timeout(Duration::from_millis(500), sub.live.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line.text, "[Server] Starting game server");
    }

    #[tokio::test]
    async fn exhausted_images_abort_before_any_container() {
        let h = harness(FakeRuntime::new());
        let err = h.mgr.create(request(vec![])).await.unwrap_err();
        assert_eq!(err.code(), "image_resolution_exhausted");
        assert!(!h.rt.calls().iter().any(|c| c.starts_with("create:")));
        assert!(h.mgr.list().await.unwrap().is_empty());
        assert_eq!(std::fs::read_dir(h.dir.path().join("volumes")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn failed_install_leaves_nothing_behind() {
        let h = harness(
            FakeRuntime::new()
                .with_pullable("X:fallback")
                .with_install_exit(2, &["curl: (6) Could not resolve host"]),
        );
        let err = h.mgr.create(request(vec![])).await.unwrap_err();
        assert_eq!(err.code(), "installation_failed");

        let calls = h.rt.calls();
        assert!(calls.iter().any(|c| c.starts_with("create:game_server_install_")));
        assert!(calls.iter().any(|c| c.starts_with("remove:game_server_install_")));
        assert!(!calls.iter().any(|c| c.starts_with("create:") && !c.contains("_install_")));
        assert!(h.rt.container_names().is_empty());
        assert!(h.mgr.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn start_twice_is_idempotent() {
        let h = harness(working());
        let id = created(&h).await;

        assert_eq!(h.mgr.start(id.as_str()).await.unwrap(), Transition::Applied);
        assert_eq!(h.mgr.start(id.as_str()).await.unwrap(), Transition::AlreadyInState);
        assert_eq!(h.rt.container_names().len(), 1);
        assert_eq!(h.mgr.console().attached_count().await, 1);
    }

    #[tokio::test]
    async fn stop_detaches_console_and_is_idempotent() {
        let h = harness(working());
        let id = created(&h).await;
        h.mgr.start(id.as_str()).await.unwrap();

        assert_eq!(h.mgr.stop(id.as_str()).await.unwrap(), Transition::Applied);
        assert!(!h.mgr.console().is_attached(id.as_str()).await);
        assert_eq!(h.mgr.stop(id.as_str()).await.unwrap(), Transition::AlreadyInState);
        assert_eq!(h.mgr.get(id.as_str()).await.unwrap().status, InstanceState::Stopped);

        h.mgr.restart(id.as_str()).await.unwrap();
        assert_eq!(h.mgr.get(id.as_str()).await.unwrap().status, InstanceState::Running);
        assert!(h.mgr.console().is_attached(id.as_str()).await);
    }

    #[tokio::test]
    async fn crash_on_start_is_not_reported_running() {
        let h = harness(working().with_crash_on_start());
        let id = created(&h).await;
        let err = h.mgr.start(id.as_str()).await.unwrap_err();
        assert_eq!(err.code(), "runtime_rejected");
        let view = h.mgr.get(id.as_str()).await.unwrap();
        assert_eq!(view.status, InstanceState::Stopped);
        assert_eq!(view.record.state, InstanceState::Stopped);
    }

    #[tokio::test]
    async fn delete_detaches_console_before_removing_container() {
        let h = harness(working());
        let id = created(&h).await;
        let name = h.container(&id);
        h.mgr.start(id.as_str()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        h.mgr.delete(id.as_str()).await.unwrap();

        let calls = h.rt.calls();
        let removed_at = calls
            .iter()
            .position(|c| *c == format!("remove:{name}"))
            .unwrap();
        assert!(calls[..removed_at].contains(&format!("logs:{name}")));
        assert!(!calls[removed_at..].contains(&format!("logs:{name}")));
        assert!(!h.mgr.console().is_attached(id.as_str()).await);
        assert!(!h.data_dir(&id).exists());
        assert_eq!(h.mgr.get(id.as_str()).await.unwrap_err().code(), "not_found");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!h.rt.calls()[removed_at..].contains(&format!("logs:{name}")));
    }

    #[tokio::test]
    async fn delete_during_install_cancels_and_does_not_resurrect() {
        let h = harness(
            FakeRuntime::new()
                .with_pullable("X:fallback")
                .with_blocking_install(),
        );
        let mgr = h.mgr.clone();
        let create = tokio::spawn(async move { mgr.create(request(vec![])).await });

        let id = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(v) = h.mgr.list().await.unwrap().into_iter().next()
                    && v.status == InstanceState::Installing
                    && h.rt.container_names().iter().any(|n| n.contains("_install_"))
                {
                    return v.record.id;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        h.mgr.delete(id.as_str()).await.unwrap();
        let err = create.await.unwrap().unwrap_err();
        assert_eq!(err.code(), "cancelled");
        assert!(h.mgr.list().await.unwrap().is_empty());
        assert!(h.rt.container_names().is_empty());
        assert!(!h.data_dir(&id).exists());
    }

    #[tokio::test]
    async fn missing_container_is_offline_and_recreate_repairs_it() {
        let h = harness(working());
        let id = created(&h).await;
        h.rt.forget(&h.container(&id));

        assert_eq!(h.mgr.get(id.as_str()).await.unwrap().status, InstanceState::Offline);
        let err = h.mgr.start(id.as_str()).await.unwrap_err();
        assert!(err.is_container_missing());

        let view = h.mgr.recreate(id.as_str()).await.unwrap();
        assert_eq!(view.status, InstanceState::Stopped);
        assert!(h.rt.container(&h.container(&id)).is_some());
        let installs = h
            .rt
            .calls()
            .iter()
            .filter(|c| c.starts_with("create:game_server_install_"))
            .count();
        assert_eq!(installs, 1);
    }

    #[tokio::test]
    async fn settings_apply_on_recreate() {
        let h = harness(working());
        let id = created(&h).await;

        let patch = SettingsPatch {
            startup_override: Some("run.sh --fast -Xmx{{SERVER_MEMORY}}M".to_string()),
            environment: Some(BTreeMap::from([("MEM".to_string(), "4096".to_string())])),
            limits: Some(ResourceLimits {
                memory_mb: 4096,
                ..ResourceLimits::default()
            }),
            ..SettingsPatch::default()
        };
        let record = h.mgr.update_settings(id.as_str(), patch).await.unwrap();
        assert_eq!(record.environment["MEM"], "4096");
        assert_eq!(record.startup_command, "run.sh -Xmx2048M");

        let view = h.mgr.recreate(id.as_str()).await.unwrap();
        assert_eq!(view.record.startup_command, "run.sh --fast -Xmx4096M");
        let c = h.rt.container(&h.container(&id)).unwrap();
        assert_eq!(c.spec.memory_mb, 4096);

        let bad = SettingsPatch {
            environment: Some(BTreeMap::from([("MEM".to_string(), "lots".to_string())])),
            ..SettingsPatch::default()
        };
        assert_eq!(
            h.mgr.update_settings(id.as_str(), bad).await.unwrap_err().code(),
            "invalid_spec"
        );
    }

    #[tokio::test]
    async fn commands_require_running_instance_and_echo_output() {
        let h = harness(working());
        let id = created(&h).await;
        let err = h.mgr.send_command(id.as_str(), "say hi").await.unwrap_err();
        assert_eq!(err.code(), "not_running");

        h.mgr.start(id.as_str()).await.unwrap();
        let out = h.mgr.send_command(id.as_str(), "say hi").await.unwrap();
        assert_eq!(out.output, "ran: say hi\n");
        assert!(
            h.rt.calls()
                .contains(&format!("exec:{}:sh -c say hi", h.container(&id)))
        );
        let (lines, _) = h.mgr.console().history(id.as_str(), 0, 100).await;
        let texts: Vec<&str> = lines.iter().map(|l| l.text.as_str()).collect();
        assert!(texts.contains(&"> say hi"));
        assert!(texts.contains(&"ran: say hi"));
    }

    #[tokio::test]
    async fn files_round_trip_and_deny_traversal() {
        let h = harness(working());
        let id = created(&h).await;
        let files = h.mgr.files(id.as_str()).await.unwrap();

        let body = b"server-port=25565\nonline-mode=true\n";
        files.write("config/server.properties", body).await.unwrap();
        assert_eq!(files.read("config/server.properties").await.unwrap(), body);
        assert_eq!(
            files.read("../../state/anything.json").await.unwrap_err().code(),
            "access_denied"
        );
        assert_eq!(files.delete("..").await.unwrap_err().code(), "access_denied");
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_up_front() {
        let h = harness(working());

        let mut req = request(vec![PortMapping::tcp(25565, 1), PortMapping::tcp(25565, 2)]);
        req.name = " ".to_string();
        let err = h.mgr.create(req).await.unwrap_err();
        let OrchestratorError::InvalidSpec {
            field_errors: Some(fields),
            ..
        } = err
        else {
            panic!("expected field errors");
        };
        assert!(fields.contains_key("name") && fields.contains_key("ports"));

        let mut req = request(vec![]);
        req.variables.insert("MEM".to_string(), "lots".to_string());
        assert_eq!(h.mgr.create(req).await.unwrap_err().code(), "invalid_spec");

        let mut req = request(vec![]);
        req.blueprint = "test/unnamed".to_string();
        assert_eq!(h.mgr.create(req).await.unwrap_err().code(), "not_found");

        assert!(h.rt.calls().is_empty());
        assert_eq!(h.mgr.start("no-such-id").await.unwrap_err().code(), "not_found");
        assert_eq!(h.mgr.delete("../escape").await.unwrap_err().code(), "not_found");
    }

    #[tokio::test]
    async fn external_ports_are_reserved_across_instances() {
        let h = harness(working());
        h.mgr
            .create(request(vec![PortMapping::tcp(25565, 30565)]))
            .await
            .unwrap();
        let err = h
            .mgr
            .create(request(vec![PortMapping::tcp(25565, 30565)]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_spec");
        assert_eq!(h.mgr.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reconcile_reattaches_and_rolls_back() {
        let h = harness(working());
        let running = created(&h).await;
        h.mgr.start(running.as_str()).await.unwrap();
        let stopped = created(&h).await;

        let mut stuck = h.mgr.get(stopped.as_str()).await.unwrap().record;
        stuck.id = InstanceId("stuck-install".to_string());
        stuck.state = InstanceState::Installing;
        stuck.ports.clear();
        InstanceStore::new(h.mgr.config().state_dir()).save(&stuck).await.unwrap();

        let fresh = h.restarted();
        let report = fresh.reconcile().await.unwrap();
        assert_eq!(report.attached, vec![running.clone()]);
        assert_eq!(report.rolled_back, vec![stuck.id.clone()]);
        assert!(fresh.console().is_attached(running.as_str()).await);
        assert_eq!(fresh.get("stuck-install").await.unwrap_err().code(), "not_found");
        assert_eq!(fresh.get(stopped.as_str()).await.unwrap().status, InstanceState::Stopped);
    }

    #[tokio::test]
    async fn console_backlog_survives_a_process_restart() {
        let h = harness(working());
        let id = created(&h).await;
        h.mgr.start(id.as_str()).await.unwrap();
        h.rt.push_log(&h.container(&id), "Done (4.1s)! For help, type \"help\"");

        let fresh = h.restarted();
        let sub = fresh.attach_console(id.as_str()).await.unwrap();
        let texts: Vec<&str> = sub.backlog.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts[0], "[Server] Starting game server");
        assert!(texts[1].starts_with("Done"));
        assert_eq!(texts.len(), 2);
    }

    #[tokio::test]
    async fn managers_sharing_a_data_root_do_not_double_book_a_port() {
        let h = harness(working());
        let other = Arc::new(h.restarted());
        let (a, b) = tokio::join!(
            h.mgr.create(request(vec![PortMapping::tcp(25565, 30565)])),
            other.create(request(vec![PortMapping::tcp(25565, 30565)])),
        );
        let codes: Vec<&str> = [a, b]
            .into_iter()
            .filter_map(|r| r.err().map(|e| e.code()))
            .collect();
        assert_eq!(codes, vec!["invalid_spec"]);
        assert_eq!(h.mgr.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reconcile_in_another_process_waits_for_provisioning() {
        let h = harness(
            FakeRuntime::new()
                .with_pullable("X:fallback")
                .with_blocking_install(),
        );
        let mgr = h.mgr.clone();
        let create = tokio::spawn(async move { mgr.create(request(vec![])).await });
        let id = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(v) = h.mgr.list().await.unwrap().into_iter().next()
                    && v.record.state == InstanceState::Installing
                {
                    break v.record.id;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let other = Arc::new(h.restarted());
        let reconcile = tokio::spawn({
            let other = other.clone();
            async move { other.reconcile().await }
        });
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!reconcile.is_finished());
        assert_eq!(
            h.mgr.get(id.as_str()).await.unwrap().record.state,
            InstanceState::Installing
        );

        h.mgr.delete(id.as_str()).await.unwrap();
        assert_eq!(create.await.unwrap().unwrap_err().code(), "cancelled");
        let report = tokio::time::timeout(Duration::from_secs(2), reconcile)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(report.rolled_back.is_empty());
        assert!(!h.dir.path().join("state").join(format!("{id}.lock")).exists());
    }

    #[tokio::test]
    async fn delete_survives_an_unremovable_installer() {
        let h = harness(working());
        let id = created(&h).await;
        h.rt.refuse_removal(&format!("game_server_install_{id}"));

        h.mgr.delete(id.as_str()).await.unwrap();
        assert!(h.rt.container(&h.container(&id)).is_none());
        assert!(!h.data_dir(&id).exists());
        assert!(!h.dir.path().join("state").join(format!("{id}.install.log")).exists());
        assert_eq!(h.mgr.get(id.as_str()).await.unwrap_err().code(), "not_found");
    }
}
