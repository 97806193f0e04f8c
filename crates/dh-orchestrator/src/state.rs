//! Global orchestrator state
//!
//! Wires the components together and exposes one method per control
//! operation. The IPC server and the tests drive the daemon through here.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use dh_core::ipc::{CreateDomainRequest, CreateInstanceRequest};
use dh_core::model::{Domain, HealthStatus, Instance, ParkedDirectory, SupervisionState};
use dh_core::report::{
    DaemonStatus, DnsStatus, DomainReport, ImportReport, MemberResult, ParkStatus, RefreshReport,
    StackExport, StackInfo, TrustStatus,
};
use dh_core::service::{ConfigField, ServiceConfig, ServiceType};
use dh_core::traits::{PrivilegedHelper, ReverseProxy};
use dh_core::types::StackId;
use dh_core::{DevhostConfig, DevhostError, Result};

use crate::dns::DnsResponder;
use crate::events::EventBus;
use crate::helper::HelperBridge;
use crate::instances::InstanceManager;
use crate::parking::{run_parking_refresh, ParkingEngine};
use crate::router::{CaddyProxy, DomainRouter};
use crate::stack::StackManager;
use crate::store::StateStore;
use crate::supervisor::{run_health_sweep, Supervisor};
use crate::trust::{CaReader, LocalCaReader, TrustManager};

/// Builds an [`OrchestratorState`], with seams for the external processes
pub struct OrchestratorBuilder {
    config: DevhostConfig,
    proxy: Option<Arc<dyn ReverseProxy>>,
    helper: Option<Arc<dyn PrivilegedHelper>>,
    ca_reader: Option<Arc<dyn CaReader>>,
}

impl OrchestratorBuilder {
    pub fn new(config: DevhostConfig) -> Self {
        Self {
            config,
            proxy: None,
            helper: None,
            ca_reader: None,
        }
    }

    /// Use this reverse proxy instead of invoking `caddy`
    pub fn proxy(mut self, proxy: Arc<dyn ReverseProxy>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Use this helper instead of the socket bridge
    pub fn helper(mut self, helper: Arc<dyn PrivilegedHelper>) -> Self {
        self.helper = Some(helper);
        self
    }

    pub fn ca_reader(mut self, reader: Arc<dyn CaReader>) -> Self {
        self.ca_reader = Some(reader);
        self
    }

    /// Open the state store and assemble the components
    pub async fn build(self) -> Result<OrchestratorState> {
        self.config.validate()?;
        let config = Arc::new(self.config);
        let events = EventBus::new();

        let store = Arc::new(StateStore::open(config.state_file_path()).await?);

        let proxy = self.proxy.unwrap_or_else(|| {
            Arc::new(CaddyProxy::new(
                config.proxy.binary.clone(),
                config.proxy.reload_timeout,
            ))
        });
        let helper = self
            .helper
            .unwrap_or_else(|| Arc::new(HelperBridge::new(&config.helper)));
        let ca_reader = self.ca_reader.unwrap_or_else(|| Arc::new(LocalCaReader));

        let trust = Arc::new(TrustManager::new(
            config.proxy.ca_cert_path.clone(),
            ca_reader,
            Arc::clone(&helper),
        ));
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&store),
            Arc::clone(&config),
            events.clone(),
        ));
        let router = Arc::new(DomainRouter::new(
            Arc::clone(&store),
            Arc::clone(&config),
            proxy,
            Arc::clone(&trust),
            events.clone(),
        ));
        let instances = Arc::new(InstanceManager::new(
            Arc::clone(&store),
            Arc::clone(&supervisor),
            Arc::clone(&router),
            Arc::clone(&config),
            events.clone(),
        ));
        let parking = Arc::new(ParkingEngine::new(
            Arc::clone(&store),
            Arc::clone(&router),
            Arc::clone(&config),
            events.clone(),
        ));
        let stacks = Arc::new(StackManager::new(
            Arc::clone(&store),
            Arc::clone(&supervisor),
            Arc::clone(&instances),
            Arc::clone(&router),
            Arc::clone(&config),
            events.clone(),
        ));
        let dns = Arc::new(DnsResponder::new(
            config.dns.clone(),
            config.tld.clone(),
            events.clone(),
        ));

        Ok(OrchestratorState {
            config,
            events,
            store,
            supervisor,
            router,
            instances,
            parking,
            stacks,
            trust,
            dns,
            helper,
            started_at: Instant::now(),
            cancel: CancellationToken::new(),
        })
    }
}

/// Global state for the orchestrator daemon
pub struct OrchestratorState {
    pub config: Arc<DevhostConfig>,
    pub events: EventBus,
    pub store: Arc<StateStore>,
    pub supervisor: Arc<Supervisor>,
    pub router: Arc<DomainRouter>,
    pub instances: Arc<InstanceManager>,
    pub parking: Arc<ParkingEngine>,
    pub stacks: Arc<StackManager>,
    pub trust: Arc<TrustManager>,
    pub dns: Arc<DnsResponder>,
    pub helper: Arc<dyn PrivilegedHelper>,
    started_at: Instant,
    /// Cancels long-running operations (stack start/stop, refresh) on shutdown
    cancel: CancellationToken,
}

impl OrchestratorState {
    /// Build with the real proxy, helper and CA reader
    pub async fn new(config: DevhostConfig) -> Result<Self> {
        OrchestratorBuilder::new(config).build().await
    }

    /// Token cancelled when the daemon begins shutting down
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Reconcile persisted state and re-render the proxy after a daemon restart
    pub async fn recover(&self) -> Result<()> {
        self.supervisor.recover().await?;
        match self.router.render().await {
            Ok(count) => tracing::info!("Proxy configuration rendered for {} domains", count),
            Err(e) => tracing::warn!("Initial proxy render failed: {}", e),
        }
        Ok(())
    }

    /// Spawn the health sweep and the parking refresh
    pub fn spawn_background(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(run_health_sweep(Arc::clone(&self.supervisor), cancel.clone())),
            tokio::spawn(run_parking_refresh(Arc::clone(&self.parking), cancel)),
        ]
    }

    /// Stop the DNS responder and every directly managed instance
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.dns.stop().await;
        self.supervisor.shutdown().await;
    }

    pub async fn status(&self) -> DaemonStatus {
        let snapshot = self.store.snapshot();
        DaemonStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            instance_count: snapshot.instances.len(),
            running_count: snapshot
                .instances
                .values()
                .filter(|i| i.state == SupervisionState::Running)
                .count(),
            domain_count: snapshot.domains.len(),
            stack_count: snapshot.stacks.len(),
            parked_count: snapshot.parked.len(),
            tld: self.config.tld.clone(),
            dns: self.dns.status().await,
        }
    }

    // ---- instances ----

    pub fn list_instances(&self) -> Vec<Instance> {
        self.instances.list()
    }

    pub fn get_instance(&self, reference: &str) -> Result<Instance> {
        self.instances.get(reference)
    }

    pub async fn create_instance(&self, request: CreateInstanceRequest) -> Result<Instance> {
        self.instances.create(request).await
    }

    pub async fn start_instance(&self, reference: &str) -> Result<Instance> {
        let id = self.instances.get(reference)?.id;
        self.supervisor.start(&id).await
    }

    pub async fn stop_instance(&self, reference: &str) -> Result<Instance> {
        let id = self.instances.get(reference)?.id;
        self.supervisor.stop(&id).await
    }

    pub async fn restart_instance(&self, reference: &str) -> Result<Instance> {
        let id = self.instances.get(reference)?.id;
        self.supervisor.restart(&id).await
    }

    pub async fn delete_instance(&self, reference: &str) -> Result<()> {
        self.instances.delete(reference).await
    }

    pub async fn rename_instance(&self, reference: &str, new_name: &str) -> Result<Instance> {
        self.instances.rename(reference, new_name).await
    }

    pub async fn change_instance_version(&self, reference: &str, version: &str) -> Result<Instance> {
        self.instances.change_version(reference, version).await
    }

    pub async fn update_instance_config(
        &self,
        reference: &str,
        config: ServiceConfig,
    ) -> Result<Instance> {
        self.instances.update_config(reference, config).await
    }

    pub async fn check_instance_health(&self, reference: &str) -> Result<(Instance, HealthStatus)> {
        let id = self.instances.get(reference)?.id;
        let healthy = self.supervisor.health_check(&id).await?;
        Ok((self.instances.get(id.as_str())?, healthy))
    }

    pub fn config_schema(&self, service_type: ServiceType) -> Vec<ConfigField> {
        service_type.config_schema()
    }

    // ---- domains ----

    pub fn list_domains(&self) -> Vec<Domain> {
        self.router.list_domains()
    }

    pub async fn create_domain(&self, request: CreateDomainRequest) -> Result<DomainReport> {
        self.router.create_domain(request).await
    }

    pub async fn delete_domain(&self, name: &str) -> Result<()> {
        self.router.delete_domain(name).await
    }

    pub async fn update_domain_ssl(&self, name: &str, ssl_enabled: bool) -> Result<DomainReport> {
        self.router.update_ssl(name, ssl_enabled).await
    }

    // ---- parking ----

    pub fn list_parked(&self) -> Vec<ParkedDirectory> {
        self.parking.list()
    }

    pub async fn park(
        &self,
        path: &Path,
        upstream_port: Option<u16>,
    ) -> Result<(ParkedDirectory, RefreshReport)> {
        self.parking.park(path, upstream_port, &self.cancel).await
    }

    pub async fn forget(&self, path: &Path) -> Result<()> {
        self.parking.forget(path).await
    }

    pub async fn refresh_parked(&self, path: &Path) -> Result<RefreshReport> {
        let report = self.parking.refresh(path, &self.cancel).await?;
        if report.cancelled {
            return Err(DevhostError::Cancelled);
        }
        Ok(report)
    }

    pub async fn park_status(&self, path: &Path) -> ParkStatus {
        self.parking.status(path).await
    }

    // ---- stacks ----

    pub fn list_stacks(&self) -> Vec<StackInfo> {
        self.stacks.list()
    }

    pub fn get_stack(&self, reference: &str) -> Result<StackInfo> {
        self.stacks.get(reference)
    }

    pub async fn create_stack(
        &self,
        name: &str,
        description: Option<String>,
        members: &[String],
    ) -> Result<StackInfo> {
        self.stacks.create(name, description, members).await
    }

    pub async fn delete_stack(&self, reference: &str, cascade: bool) -> Result<()> {
        self.stacks.delete(reference, cascade).await
    }

    pub async fn add_to_stack(&self, stack: &str, instance: &str) -> Result<StackInfo> {
        self.stacks.add_member(stack, instance).await
    }

    pub async fn remove_from_stack(&self, stack: &str, instance: &str) -> Result<StackInfo> {
        self.stacks.remove_member(stack, instance).await
    }

    pub async fn start_stack(&self, reference: &str) -> Result<(StackId, Vec<MemberResult>)> {
        self.stacks.start(reference, &self.cancel).await
    }

    pub async fn stop_stack(&self, reference: &str) -> Result<(StackId, Vec<MemberResult>)> {
        self.stacks.stop(reference, &self.cancel).await
    }

    pub fn export_stack(&self, reference: &str) -> Result<StackExport> {
        self.stacks.export(reference)
    }

    pub async fn import_stack(&self, document: StackExport) -> Result<ImportReport> {
        self.stacks.import(document).await
    }

    // ---- trust and dns ----

    pub async fn trust_status(&self) -> Result<TrustStatus> {
        self.trust.get_trust_status().await
    }

    pub async fn dns_status(&self) -> DnsStatus {
        self.dns.status().await
    }

    pub async fn restart_dns(&self) -> Result<DnsStatus> {
        self.dns.restart().await
    }
}
