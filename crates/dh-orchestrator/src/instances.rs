//! Instance registry operations
//!
//! Creation, deletion and edits of instances. Process control lives in the
//! supervisor and routing in the domain router; this module composes them
//! and rolls back partial work when a later step fails.

use std::sync::Arc;

use dh_core::ipc::{CreateDomainRequest, CreateInstanceRequest, IpcEvent, TargetSpec};
use dh_core::model::{Instance, SupervisionState};
use dh_core::naming::{normalize_subdomain, validate_name};
use dh_core::service::ServiceConfig;
use dh_core::types::InstanceId;
use dh_core::{DevhostConfig, DevhostError, Result};

use crate::events::EventBus;
use crate::router::DomainRouter;
use crate::store::{Snapshot, StateStore};
use crate::supervisor::process::port_is_free;
use crate::supervisor::Supervisor;

/// How many ports past the preferred one allocation will try
const PORT_SEARCH_SPAN: u16 = 1000;

/// How an instance's port is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortChoice {
    /// Exactly this port, or `PortConflict`
    Explicit(u16),
    /// This port if free, else the next free one after it
    Preferred(u16),
}

pub struct InstanceManager {
    store: Arc<StateStore>,
    supervisor: Arc<Supervisor>,
    router: Arc<DomainRouter>,
    config: Arc<DevhostConfig>,
    events: EventBus,
}

impl InstanceManager {
    pub fn new(
        store: Arc<StateStore>,
        supervisor: Arc<Supervisor>,
        router: Arc<DomainRouter>,
        config: Arc<DevhostConfig>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            supervisor,
            router,
            config,
            events,
        }
    }

    pub fn list(&self) -> Vec<Instance> {
        self.store.list_instances()
    }

    pub fn get(&self, reference: &str) -> Result<Instance> {
        self.store.find_instance(reference)
    }

    /// Create an instance, optionally routing and starting it
    ///
    /// If routing or autostart fails the instance is removed again.
    pub async fn create(&self, request: CreateInstanceRequest) -> Result<Instance> {
        let choice = match request.port {
            Some(port) => PortChoice::Explicit(port),
            None => PortChoice::Preferred(request.service_type.default_port()),
        };
        self.create_with(request, choice).await
    }

    pub async fn create_with(
        &self,
        request: CreateInstanceRequest,
        port: PortChoice,
    ) -> Result<Instance> {
        validate_name("instance", &request.name)?;
        if request.version.trim().is_empty() {
            return Err(DevhostError::validation("version must not be empty"));
        }
        let config = request
            .config
            .clone()
            .unwrap_or_else(|| ServiceConfig::default_for(request.service_type));
        if config.service_type() != request.service_type {
            return Err(DevhostError::validation(format!(
                "{} configuration given for a {} instance",
                config.service_type(),
                request.service_type
            )));
        }
        if let PortChoice::Explicit(0) = port {
            return Err(DevhostError::validation("port must be non-zero"));
        }
        if let Some(domain) = &request.domain {
            normalize_subdomain(domain, &self.config.tld)?;
        }
        if request.autostart {
            let binary = self
                .supervisor
                .binary_for(request.service_type, &request.version);
            if !binary.is_file() {
                return Err(DevhostError::BinaryMissing { path: binary });
            }
        }

        let instance = self
            .store
            .mutate(|s| {
                if s.instance_by_name(&request.name).is_some() {
                    return Err(DevhostError::already_exists("instance", &request.name));
                }
                let port = allocate_port(s, port)?;
                config.validate(port)?;
                let mut instance = Instance::new(&request.name, config, &request.version, port);
                instance.process_manager = request.process_manager;
                s.instances.insert(instance.id.clone(), instance.clone());
                Ok(instance)
            })
            .await?;
        tracing::info!(
            "Created {} ({} {}) on port {}",
            instance.name,
            instance.service_type,
            instance.version,
            instance.port
        );
        self.events.emit(IpcEvent::InstanceChanged(instance.clone()));

        if let Some(domain) = request.domain {
            let routed = self
                .router
                .create_domain(CreateDomainRequest {
                    name: domain,
                    target: TargetSpec::Instance(instance.id.to_string()),
                    ssl_enabled: request.ssl_enabled,
                })
                .await;
            if let Err(e) = routed {
                self.discard(&instance.id).await;
                return Err(e);
            }
        }

        if request.autostart {
            if let Err(e) = self.supervisor.start(&instance.id).await {
                tracing::warn!("Autostart of {} failed, removing it: {}", instance.name, e);
                if let Err(retract_err) = self.router.retract_instance(&instance.id).await {
                    tracing::error!("Failed to retract routes of {}: {}", instance.name, retract_err);
                }
                self.discard(&instance.id).await;
                return Err(e);
            }
        }

        self.get(instance.id.as_str())
    }

    /// Remove a half-created instance and any domain still routed to it
    async fn discard(&self, id: &InstanceId) {
        let domains = match self.store.delete_instance(id).await {
            Ok((_, domains)) => domains,
            Err(e) => {
                tracing::error!("Failed to roll back instance {}: {}", id, e);
                return;
            }
        };
        self.supervisor.forget(id);
        for domain in &domains {
            self.events.emit(IpcEvent::DomainRemoved {
                full_domain: domain.full_domain.clone(),
            });
        }
        self.events.emit(IpcEvent::InstanceRemoved {
            instance_id: id.clone(),
        });

        if !domains.is_empty() {
            if let Err(e) = self.router.render().await {
                tracing::warn!("Proxy still lists routes of discarded instance {}: {}", id, e);
            }
        }
    }

    /// Stop, unroute and remove an instance and its data
    pub async fn delete(&self, reference: &str) -> Result<()> {
        let instance = self.get(reference)?;
        let id = instance.id.clone();

        if instance.state != SupervisionState::Stopped {
            match self.supervisor.stop(&id).await {
                Ok(_) | Err(DevhostError::NotRunning(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.router.retract_instance(&id).await?;

        self.store
            .mutate(|s| {
                if !s.domains_for_instance(&id).is_empty() {
                    return Err(DevhostError::validation(format!(
                        "{} gained a domain while being deleted",
                        instance.name
                    )));
                }
                s.instances.remove(&id);
                Ok(())
            })
            .await?;
        self.supervisor.forget(&id);

        let data_dir = self.config.instance_data_dir(id.as_str());
        if let Err(e) = tokio::fs::remove_dir_all(&data_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove {}: {}", data_dir.display(), e);
            }
        }

        tracing::info!("Deleted {}", instance.name);
        self.events.emit(IpcEvent::InstanceRemoved { instance_id: id });
        Ok(())
    }

    pub async fn rename(&self, reference: &str, new_name: &str) -> Result<Instance> {
        validate_name("instance", new_name)?;
        let id = self.get(reference)?.id;
        let instance = self
            .store
            .mutate(|s| {
                if s
                    .instance_by_name(new_name)
                    .is_some_and(|other| other.id != id)
                {
                    return Err(DevhostError::already_exists("instance", new_name));
                }
                let instance = s.instance_mut(&id)?;
                instance.name = new_name.to_string();
                instance.updated_at = dh_core::model::now_millis();
                Ok(instance.clone())
            })
            .await?;
        self.events.emit(IpcEvent::InstanceChanged(instance.clone()));
        Ok(instance)
    }

    /// Switch to another installed version; only while stopped
    pub async fn change_version(&self, reference: &str, version: &str) -> Result<Instance> {
        let version = version.trim();
        if version.is_empty() {
            return Err(DevhostError::validation("version must not be empty"));
        }
        let current = self.get(reference)?;
        let mut candidate = current.clone();
        candidate.version = version.to_string();
        let binary = self.supervisor.binary_path(&candidate);
        if !binary.is_file() {
            return Err(DevhostError::BinaryMissing { path: binary });
        }

        let instance = self
            .store
            .mutate(|s| {
                let instance = s.instance_mut(&current.id)?;
                if instance.state.claims_port() {
                    return Err(DevhostError::AlreadyRunning(format!(
                        "stop {} before changing its version",
                        instance.name
                    )));
                }
                instance.version = version.to_string();
                instance.updated_at = dh_core::model::now_millis();
                Ok(instance.clone())
            })
            .await?;
        self.events.emit(IpcEvent::InstanceChanged(instance.clone()));
        Ok(instance)
    }

    /// Replace the type-specific configuration; applies on the next start
    pub async fn update_config(&self, reference: &str, config: ServiceConfig) -> Result<Instance> {
        let id = self.get(reference)?.id;
        let instance = self
            .store
            .mutate(|s| {
                let instance = s.instance_mut(&id)?;
                if config.service_type() != instance.service_type {
                    return Err(DevhostError::validation(format!(
                        "{} configuration given for a {} instance",
                        config.service_type(),
                        instance.service_type
                    )));
                }
                config.validate(instance.port)?;
                instance.config = config;
                instance.updated_at = dh_core::model::now_millis();
                Ok(instance.clone())
            })
            .await?;
        self.events.emit(IpcEvent::InstanceChanged(instance.clone()));
        Ok(instance)
    }
}

/// Choose a port no instance is registered on
fn allocate_port(snapshot: &Snapshot, choice: PortChoice) -> Result<u16> {
    match choice {
        PortChoice::Explicit(port) => match snapshot.port_holder(port, None) {
            Some(holder) => Err(DevhostError::PortConflict {
                port,
                holder: format!("instance {}", holder.name),
            }),
            None => Ok(port),
        },
        PortChoice::Preferred(start) => {
            let start = start.max(1);
            let end = start.saturating_add(PORT_SEARCH_SPAN);
            (start..=end)
                .find(|&port| snapshot.port_holder(port, None).is_none() && port_is_free(port))
                .ok_or_else(|| DevhostError::PortConflict {
                    port: start,
                    holder: format!("every port up to {}", end),
                })
        }
    }
}
