//! Service supervisor
//!
//! Owns the lifecycle of instance processes: start, stop, restart, health
//! checks, the periodic health sweep and boot-time recovery. Operations on
//! one instance are serialized by a per-instance lock; different instances
//! proceed concurrently.
//!
//! Crash detection is polling based: the health sweep and every explicit
//! health check verify the recorded pid is alive and reconcile the record
//! to `Crashed` when it is not.

pub mod health;
pub mod process;

use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use dh_core::ipc::IpcEvent;
use dh_core::model::{HealthStatus, Instance, ProcessManager, SupervisionState};
use dh_core::pidfile::is_process_alive;
use dh_core::service::ServiceType;
use dh_core::types::InstanceId;
use dh_core::{DevhostConfig, DevhostError, Result};

use crate::events::EventBus;
use crate::store::StateStore;

use self::process::{is_no_such_process, signal_process, spawn_service};

/// First delay of the startup probe backoff
const STARTUP_POLL_INITIAL: Duration = Duration::from_millis(250);

/// Cap of the startup probe backoff
const STARTUP_POLL_MAX: Duration = Duration::from_secs(2);

/// Poll interval while waiting for a signalled process to exit
const EXIT_POLL: Duration = Duration::from_millis(100);

/// How long to wait for exit after SIGKILL
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Supervises instance processes
pub struct Supervisor {
    store: Arc<StateStore>,
    config: Arc<DevhostConfig>,
    events: EventBus,
    locks: DashMap<InstanceId, Arc<Mutex<()>>>,
    /// Handles of processes this daemon spawned
    children: DashMap<InstanceId, Child>,
    http: reqwest::Client,
}

impl Supervisor {
    pub fn new(store: Arc<StateStore>, config: Arc<DevhostConfig>, events: EventBus) -> Self {
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .unwrap_or_default();
        Self {
            store,
            config,
            events,
            locks: DashMap::new(),
            children: DashMap::new(),
            http,
        }
    }

    fn lock_for(&self, id: &InstanceId) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(id.clone()).or_default().value())
    }

    /// Installed binary for an instance's type and version
    pub fn binary_path(&self, instance: &Instance) -> PathBuf {
        self.binary_for(instance.service_type, &instance.version)
    }

    pub fn binary_for(&self, service_type: ServiceType, version: &str) -> PathBuf {
        self.config
            .bin_dir()
            .join(service_type.as_str())
            .join(version)
            .join(service_type.binary_name())
    }

    /// Log file receiving an instance's stdout and stderr
    pub fn log_path(&self, id: &InstanceId) -> PathBuf {
        self.config.logs_dir().join(format!("{}.log", id))
    }

    /// Start an instance and wait for its startup probe
    pub async fn start(&self, id: &InstanceId) -> Result<Instance> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        self.start_locked(id).await
    }

    /// Stop an instance: SIGTERM, grace period, then SIGKILL
    pub async fn stop(&self, id: &InstanceId) -> Result<Instance> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        self.stop_locked(id).await
    }

    /// Stop (when running) and start again as one serialized operation
    pub async fn restart(&self, id: &InstanceId) -> Result<Instance> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        match self.stop_locked(id).await {
            Ok(_) | Err(DevhostError::NotRunning(_)) => {}
            Err(e) => return Err(e),
        }
        self.start_locked(id).await
    }

    /// Probe an instance now and record the result
    pub async fn health_check(&self, id: &InstanceId) -> Result<HealthStatus> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        self.health_check_locked(id).await
    }

    /// Drop supervision bookkeeping for a deleted instance
    pub fn forget(&self, id: &InstanceId) {
        self.children.remove(id);
        self.locks.remove(id);
    }

    async fn start_locked(&self, id: &InstanceId) -> Result<Instance> {
        let instance = self
            .store
            .get_instance(id)
            .ok_or_else(|| DevhostError::not_found("instance", id.as_str()))?;

        if instance.running() || instance.state == SupervisionState::Starting {
            return Err(DevhostError::AlreadyRunning(instance.name));
        }

        let binary = self.binary_path(&instance);
        if !binary.is_file() {
            return Err(DevhostError::BinaryMissing { path: binary });
        }

        let instance = self
            .store
            .mutate(|s| {
                let port = s.instance_mut(id)?.port;
                if let Some(holder) = s.live_port_holder(port, id) {
                    return Err(DevhostError::PortConflict {
                        port,
                        holder: format!("instance {}", holder.name),
                    });
                }
                let instance = s.instance_mut(id)?;
                if instance.running() || instance.state == SupervisionState::Starting {
                    return Err(DevhostError::AlreadyRunning(instance.name.clone()));
                }
                instance.mark_starting()?;
                Ok(instance.clone())
            })
            .await?;
        self.events.emit(IpcEvent::InstanceChanged(instance.clone()));

        tracing::info!(
            "Starting {} ({} {}) on port {}",
            instance.name,
            instance.service_type,
            instance.version,
            instance.port
        );

        let data_dir = self.config.instance_data_dir(id.as_str());
        let launch = instance.config.launch_spec(instance.port, &data_dir);
        let spawned = spawn_service(&binary, &launch, &data_dir, &self.log_path(id)).await;

        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.settle(id, Instance::mark_stopped).await;
                return Err(DevhostError::ProcessSpawnFailed(format!(
                    "{}: {}",
                    binary.display(),
                    e
                )));
            }
        };
        let Some(pid) = child.id() else {
            self.settle(id, Instance::mark_stopped).await;
            return Err(DevhostError::ProcessSpawnFailed(format!(
                "{} exited immediately",
                instance.name
            )));
        };
        self.children.insert(id.clone(), child);

        let instance = match self.store.mutate(|s| {
            let instance = s.instance_mut(id)?;
            instance.mark_running(pid)?;
            Ok(instance.clone())
        })
        .await
        {
            Ok(instance) => instance,
            Err(e) => {
                // Never leave an unrecorded process behind
                self.terminate(id, pid).await;
                self.children.remove(id);
                self.settle(id, Instance::mark_stopped).await;
                return Err(e);
            }
        };
        self.events.emit(IpcEvent::InstanceChanged(instance.clone()));

        match self.await_startup(&instance).await {
            Ok(health) => {
                let instance = self.record_health(id, pid, health).await?;
                tracing::info!("{} running with pid {} ({:?})", instance.name, pid, health);
                Ok(instance)
            }
            Err(e) => {
                tracing::warn!("{} failed during startup: {}", instance.name, e);
                self.children.remove(id);
                self.settle(id, Instance::mark_crashed).await;
                Err(e)
            }
        }
    }

    /// Poll the health probe with backoff until healthy or out of time
    ///
    /// Fails only if the process exits during the wait.
    async fn await_startup(&self, instance: &Instance) -> Result<HealthStatus> {
        let supervisor = &self.config.supervisor;
        let probe = instance.service_type.health_probe();
        let deadline = Instant::now() + supervisor.startup_timeout;
        let mut delay = STARTUP_POLL_INITIAL;

        loop {
            if let Some(status) = self.exit_status(&instance.id) {
                return Err(DevhostError::ProcessSpawnFailed(format!(
                    "{} exited during startup ({}); see {}",
                    instance.name,
                    status,
                    self.log_path(&instance.id).display()
                )));
            }

            let health =
                health::probe(&self.http, instance.port, &probe, supervisor.health_timeout).await;
            let now = Instant::now();
            if health == HealthStatus::Healthy || now >= deadline {
                return Ok(health);
            }

            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(STARTUP_POLL_MAX);
        }
    }

    async fn stop_locked(&self, id: &InstanceId) -> Result<Instance> {
        let instance = self
            .store
            .get_instance(id)
            .ok_or_else(|| DevhostError::not_found("instance", id.as_str()))?;

        match instance.state {
            SupervisionState::Stopped => return Err(DevhostError::NotRunning(instance.name)),
            // Nothing to signal; just settle the record
            SupervisionState::Crashed | SupervisionState::Starting => {
                self.children.remove(id);
                return self.finish_stop(id).await;
            }
            SupervisionState::Running | SupervisionState::Stopping => {}
        }

        if instance.state == SupervisionState::Running {
            let stopping = self
                .store
                .mutate(|s| {
                    let instance = s.instance_mut(id)?;
                    instance.mark_stopping()?;
                    Ok(instance.clone())
                })
                .await?;
            self.events.emit(IpcEvent::InstanceChanged(stopping));
        }

        if let Some(pid) = instance.pid {
            tracing::info!("Stopping {} (pid {})", instance.name, pid);
            self.terminate(id, pid).await;
        }
        self.children.remove(id);
        self.finish_stop(id).await
    }

    async fn finish_stop(&self, id: &InstanceId) -> Result<Instance> {
        let instance = self
            .store
            .mutate(|s| {
                let instance = s.instance_mut(id)?;
                if instance.state == SupervisionState::Running {
                    instance.mark_stopping()?;
                }
                instance.mark_stopped()?;
                Ok(instance.clone())
            })
            .await?;
        self.events.emit(IpcEvent::InstanceChanged(instance.clone()));
        Ok(instance)
    }

    /// Signal a process until it is gone
    async fn terminate(&self, id: &InstanceId, pid: u32) {
        if let Err(e) = signal_process(pid, libc::SIGTERM) {
            if is_no_such_process(&e) {
                return;
            }
            tracing::warn!("SIGTERM to pid {} failed: {}", pid, e);
        }

        let deadline = Instant::now() + self.config.supervisor.stop_grace_period;
        while Instant::now() < deadline {
            if !self.process_alive(id, pid) {
                return;
            }
            tokio::time::sleep(EXIT_POLL).await;
        }

        tracing::warn!(
            "pid {} still alive after {:?}, sending SIGKILL",
            pid,
            self.config.supervisor.stop_grace_period
        );
        if let Err(e) = signal_process(pid, libc::SIGKILL) {
            if !is_no_such_process(&e) {
                tracing::warn!("SIGKILL to pid {} failed: {}", pid, e);
            }
        }

        let deadline = Instant::now() + KILL_WAIT;
        while Instant::now() < deadline {
            if !self.process_alive(id, pid) {
                return;
            }
            tokio::time::sleep(EXIT_POLL).await;
        }
        tracing::error!("pid {} survived SIGKILL", pid);
    }

    /// Exit status of a spawned child that has exited, reaping it
    fn exit_status(&self, id: &InstanceId) -> Option<ExitStatus> {
        let status = {
            let mut child = self.children.get_mut(id)?;
            match child.try_wait() {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!("Failed to poll child of {}: {}", id, e);
                    None
                }
            }
        };
        if status.is_some() {
            self.children.remove(id);
        }
        status
    }

    /// Liveness of `pid`, reaping it first when it is our child
    fn process_alive(&self, id: &InstanceId, pid: u32) -> bool {
        if self.children.contains_key(id) {
            if self.exit_status(id).is_some() {
                return false;
            }
            if self.children.contains_key(id) {
                return true;
            }
        }
        is_process_alive(pid)
    }

    /// Apply a terminal transition and publish it, logging failures
    async fn settle(&self, id: &InstanceId, transition: fn(&mut Instance) -> Result<()>) {
        let result = self
            .store
            .mutate(|s| {
                let instance = s.instance_mut(id)?;
                transition(instance)?;
                Ok(instance.clone())
            })
            .await;
        match result {
            Ok(instance) => self.events.emit(IpcEvent::InstanceChanged(instance)),
            Err(e) => tracing::error!("Failed to record state of {}: {}", id, e),
        }
    }

    async fn record_health(
        &self,
        id: &InstanceId,
        pid: u32,
        health: HealthStatus,
    ) -> Result<Instance> {
        let current = self
            .store
            .get_instance(id)
            .ok_or_else(|| DevhostError::not_found("instance", id.as_str()))?;
        if current.healthy == health || current.pid != Some(pid) {
            return Ok(current);
        }

        let instance = self
            .store
            .mutate(|s| {
                let instance = s.instance_mut(id)?;
                if instance.pid == Some(pid) {
                    instance.healthy = health;
                }
                Ok(instance.clone())
            })
            .await?;
        self.events.emit(IpcEvent::InstanceChanged(instance.clone()));
        Ok(instance)
    }

    async fn health_check_locked(&self, id: &InstanceId) -> Result<HealthStatus> {
        let instance = self
            .store
            .get_instance(id)
            .ok_or_else(|| DevhostError::not_found("instance", id.as_str()))?;

        let pid = match (instance.state, instance.pid) {
            (SupervisionState::Crashed, _) => return Ok(HealthStatus::Unhealthy),
            (_, Some(pid)) if instance.running() => pid,
            _ => return Err(DevhostError::NotRunning(instance.name)),
        };

        if !self.process_alive(id, pid) {
            self.reconcile_crash(id, pid).await;
            return Ok(HealthStatus::Unhealthy);
        }

        let health = health::probe(
            &self.http,
            instance.port,
            &instance.service_type.health_probe(),
            self.config.supervisor.health_timeout,
        )
        .await;
        self.record_health(id, pid, health).await?;
        Ok(health)
    }

    /// Mark an instance crashed if it still records the dead `pid`
    ///
    /// Safe to call repeatedly for the same death.
    async fn reconcile_crash(&self, id: &InstanceId, pid: u32) {
        let result = self
            .store
            .mutate(|s| {
                let instance = s.instance_mut(id)?;
                if instance.pid != Some(pid) || instance.state != SupervisionState::Running {
                    return Ok(None);
                }
                instance.mark_crashed()?;
                Ok(Some(instance.clone()))
            })
            .await;
        match result {
            Ok(Some(instance)) => {
                tracing::warn!("{} (pid {}) is no longer running", instance.name, pid);
                self.events.emit(IpcEvent::InstanceChanged(instance));
            }
            Ok(None) => {}
            Err(e) => tracing::error!("Failed to record crash of {}: {}", id, e),
        }
    }

    /// Health-check every running instance that is not busy
    pub async fn sweep(&self) {
        let ids: Vec<InstanceId> = self
            .store
            .snapshot()
            .instances
            .values()
            .filter(|i| i.state == SupervisionState::Running)
            .map(|i| i.id.clone())
            .collect();

        let checks = ids.iter().map(|id| async move {
            let lock = self.lock_for(id);
            let Ok(_guard) = lock.try_lock() else {
                tracing::trace!("Skipping busy instance {} in health sweep", id);
                return;
            };
            if let Err(e) = self.health_check_locked(id).await {
                tracing::debug!("Health sweep of {} failed: {}", id, e);
            }
        });
        futures::future::join_all(checks).await;
    }

    /// Reconcile persisted supervision state with reality after a restart
    ///
    /// Live processes are adopted by pid. Dead ones are marked crashed, and
    /// interrupted starts or stops are settled to stopped.
    pub async fn recover(&self) -> Result<()> {
        let snapshot = self.store.snapshot();
        let mut interrupted_stops = Vec::new();
        let mut adopted = 0usize;

        let alive: Vec<(InstanceId, bool)> = snapshot
            .instances
            .values()
            .filter(|i| i.state != SupervisionState::Stopped && i.state != SupervisionState::Crashed)
            .map(|i| (i.id.clone(), i.pid.is_some_and(is_process_alive)))
            .collect();

        if alive.is_empty() {
            return Ok(());
        }

        let changed = self
            .store
            .mutate(|s| {
                let mut changed = Vec::new();
                for (id, is_alive) in &alive {
                    let instance = s.instance_mut(id)?;
                    match (instance.state, is_alive) {
                        (SupervisionState::Running, true) => {
                            adopted += 1;
                            continue;
                        }
                        (SupervisionState::Stopping, true) => {
                            interrupted_stops.push(id.clone());
                            continue;
                        }
                        (SupervisionState::Running, false) => instance.mark_crashed()?,
                        // Interrupted start or stop with nothing left to signal
                        _ => instance.mark_stopped()?,
                    }
                    changed.push(instance.clone());
                }
                Ok(changed)
            })
            .await?;

        for instance in changed {
            tracing::info!("Recovered {} as {}", instance.name, instance.state);
            self.events.emit(IpcEvent::InstanceChanged(instance));
        }
        if adopted > 0 {
            tracing::info!("Adopted {} running instance(s)", adopted);
        }
        for id in interrupted_stops {
            if let Err(e) = self.stop(&id).await {
                tracing::warn!("Failed to finish interrupted stop of {}: {}", id, e);
            }
        }
        Ok(())
    }

    /// Stop every directly managed instance; externally managed ones keep running
    pub async fn shutdown(&self) {
        let ids: Vec<InstanceId> = self
            .store
            .snapshot()
            .instances
            .values()
            .filter(|i| i.running() && i.process_manager == ProcessManager::Direct)
            .map(|i| i.id.clone())
            .collect();

        tracing::info!("Stopping {} directly managed instance(s)", ids.len());
        let stops = ids.iter().map(|id| async move {
            if let Err(e) = self.stop(id).await {
                tracing::warn!("Failed to stop {} during shutdown: {}", id, e);
            }
        });
        futures::future::join_all(stops).await;
    }
}

/// Run the periodic health sweep until cancelled
pub async fn run_health_sweep(supervisor: Arc<Supervisor>, cancel: CancellationToken) {
    let period = supervisor.config.supervisor.sweep_interval;
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    tracing::info!("Starting health sweep (interval: {:?})", period);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                supervisor.sweep().await;
            }
            _ = cancel.cancelled() => {
                tracing::info!("Health sweep shutting down");
                break;
            }
        }
    }
}
