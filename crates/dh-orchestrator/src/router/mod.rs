//! Domain router
//!
//! Maps names under the local tld to instances or raw ports and keeps the
//! reverse proxy in step with the registry. The router is the only writer
//! of the proxy configuration directory. Every change is rendered and
//! reloaded; when the proxy refuses it, the registry change is reverted so
//! the registry and the running proxy never disagree.

pub mod caddy;
pub mod render;

use std::sync::Arc;

use tokio::sync::Mutex;

use dh_core::ipc::{CreateDomainRequest, IpcEvent, TargetSpec};
use dh_core::model::{Domain, DomainTarget};
use dh_core::naming::{full_domain, normalize_subdomain};
use dh_core::report::DomainReport;
use dh_core::traits::ReverseProxy;
use dh_core::types::InstanceId;
use dh_core::{DevhostConfig, DevhostError, Result};

use crate::events::EventBus;
use crate::retry::retry_once;
use crate::store::{Snapshot, StateStore};
use crate::trust::TrustManager;

pub use self::caddy::CaddyProxy;

/// One entry of a batched routing change
#[derive(Debug, Clone)]
pub enum DomainChange {
    Add(Domain),
    /// Full domain to remove
    Remove(String),
}

/// What a batch actually changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Additions skipped because the name is already taken
    pub skipped: Vec<String>,
}

impl AppliedChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub struct DomainRouter {
    store: Arc<StateStore>,
    config: Arc<DevhostConfig>,
    proxy: Arc<dyn ReverseProxy>,
    trust: Arc<TrustManager>,
    events: EventBus,
    render_lock: Mutex<()>,
}

impl DomainRouter {
    pub fn new(
        store: Arc<StateStore>,
        config: Arc<DevhostConfig>,
        proxy: Arc<dyn ReverseProxy>,
        trust: Arc<TrustManager>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            config,
            proxy,
            trust,
            events,
            render_lock: Mutex::new(()),
        }
    }

    /// Normalize a subdomain or full name to the full domain
    pub fn full_name(&self, name: &str) -> Result<String> {
        let subdomain = normalize_subdomain(name, &self.config.tld)?;
        Ok(full_domain(&subdomain, &self.config.tld))
    }

    pub fn list_domains(&self) -> Vec<Domain> {
        self.store.list_domains()
    }

    pub fn get_domain(&self, name: &str) -> Result<Domain> {
        let full = self.full_name(name)?;
        self.store
            .get_domain(&full)
            .ok_or_else(|| DevhostError::not_found("domain", full))
    }

    /// Create a domain and reload the proxy
    pub async fn create_domain(&self, request: CreateDomainRequest) -> Result<DomainReport> {
        let subdomain = normalize_subdomain(&request.name, &self.config.tld)?;
        let target = match request.target {
            TargetSpec::Instance(reference) => {
                DomainTarget::Instance(self.store.find_instance(&reference)?.id)
            }
            TargetSpec::Port(0) => return Err(DevhostError::validation("target port must be non-zero")),
            TargetSpec::Port(port) => DomainTarget::Port(port),
        };
        let domain = Domain::new(subdomain, &self.config.tld, target, request.ssl_enabled);

        let inserted = domain.clone();
        self.store.mutate(move |s| s.insert_domain(inserted)).await?;

        let full = domain.full_domain.clone();
        self.publish(move |s| {
            s.remove_domain(&full);
            Ok(())
        })
        .await?;

        tracing::info!("Routed {} to {:?}", domain.full_domain, domain.target);
        self.announce_domain(&domain);
        let warnings = self.tls_warnings(&domain).await;
        Ok(DomainReport { domain, warnings })
    }

    /// Remove a domain and reload the proxy
    pub async fn delete_domain(&self, name: &str) -> Result<()> {
        let full = self.full_name(name)?;
        let removed = self
            .store
            .mutate(|s| {
                s.remove_domain(&full)
                    .ok_or_else(|| DevhostError::not_found("domain", full.clone()))
            })
            .await?;

        let restore = removed.clone();
        self.publish(move |s| s.insert_domain(restore)).await?;

        tracing::info!("Removed route {}", full);
        self.events.emit(IpcEvent::DomainRemoved {
            full_domain: full,
        });
        self.announce_instance(removed.instance_id());
        Ok(())
    }

    /// Toggle TLS for a domain
    pub async fn update_ssl(&self, name: &str, ssl_enabled: bool) -> Result<DomainReport> {
        let full = self.full_name(name)?;
        let (domain, previous) = self
            .store
            .mutate(|s| {
                let domain = s
                    .domains
                    .get_mut(&full)
                    .ok_or_else(|| DevhostError::not_found("domain", full.clone()))?;
                let previous = domain.ssl_enabled;
                domain.ssl_enabled = ssl_enabled;
                Ok((domain.clone(), previous))
            })
            .await?;

        if previous != ssl_enabled {
            let key = full.clone();
            self.publish(move |s| {
                if let Some(domain) = s.domains.get_mut(&key) {
                    domain.ssl_enabled = previous;
                }
                Ok(())
            })
            .await?;
            self.events.emit(IpcEvent::DomainChanged(domain.clone()));
        }

        let warnings = self.tls_warnings(&domain).await;
        Ok(DomainReport { domain, warnings })
    }

    /// Apply several additions and removals with a single reload
    ///
    /// Additions whose name is already taken are skipped, never overwritten.
    pub async fn apply_changes(&self, changes: Vec<DomainChange>) -> Result<AppliedChanges> {
        let (applied, added, removed) = self
            .store
            .mutate(|s| {
                let mut applied = AppliedChanges::default();
                let mut added = Vec::new();
                let mut removed = Vec::new();
                for change in changes {
                    match change {
                        DomainChange::Add(domain) => {
                            if s.domains.contains_key(&domain.full_domain) {
                                applied.skipped.push(domain.full_domain);
                                continue;
                            }
                            applied.added.push(domain.full_domain.clone());
                            s.insert_domain(domain.clone())?;
                            added.push(domain);
                        }
                        DomainChange::Remove(full) => {
                            if let Some(domain) = s.remove_domain(&full) {
                                applied.removed.push(full);
                                removed.push(domain);
                            }
                        }
                    }
                }
                Ok((applied, added, removed))
            })
            .await?;

        if applied.is_empty() {
            return Ok(applied);
        }

        let (revert_added, revert_removed) = (applied.added.clone(), removed.clone());
        self.publish(move |s| {
            for full in &revert_added {
                s.remove_domain(full);
            }
            for domain in revert_removed {
                s.insert_domain(domain)?;
            }
            Ok(())
        })
        .await?;

        for domain in &added {
            self.announce_domain(domain);
        }
        for domain in &removed {
            self.events.emit(IpcEvent::DomainRemoved {
                full_domain: domain.full_domain.clone(),
            });
            self.announce_instance(domain.instance_id());
        }
        Ok(applied)
    }

    /// Remove every domain routed to an instance
    pub async fn retract_instance(&self, id: &InstanceId) -> Result<Vec<String>> {
        let names: Vec<String> = self
            .store
            .snapshot()
            .domains_for_instance(id)
            .into_iter()
            .map(|d| d.full_domain.clone())
            .collect();
        if names.is_empty() {
            return Ok(names);
        }
        let applied = self
            .apply_changes(names.into_iter().map(DomainChange::Remove).collect())
            .await?;
        Ok(applied.removed)
    }

    /// Render the current registry and reload the proxy, retrying once
    pub async fn render(&self) -> Result<usize> {
        retry_once("proxy reload", || self.render_once()).await
    }

    async fn render_once(&self) -> Result<usize> {
        let _guard = self.render_lock.lock().await;
        let snapshot = self.store.snapshot();
        let domain_count = snapshot.domains.len();
        if !self.config.proxy.enabled {
            return Ok(domain_count);
        }

        let ca_exists = self.trust.ca_exists().await;
        let rendered = render::render_config(&snapshot, &self.config, ca_exists);
        let dir = self.config.proxy_config_dir();
        let pending = render::write_config(&dir, &rendered).await.map_err(|e| {
            DevhostError::ProxyReloadFailed(format!("cannot write {}: {}", dir.display(), e))
        })?;

        match self.proxy.reload(&pending.global_path()).await {
            Ok(()) => {
                if let Err(e) = pending.commit().await {
                    tracing::warn!("Failed to drop previous proxy config: {}", e);
                }
                tracing::debug!("{} reloaded with {} domains", self.proxy.name(), domain_count);
                self.events.emit(IpcEvent::ProxyReloaded { domain_count });
                Ok(domain_count)
            }
            Err(e) => {
                tracing::warn!("{} rejected the new config: {}", self.proxy.name(), e);
                if let Err(restore_err) = pending.restore().await {
                    tracing::error!("Failed to restore previous proxy config: {}", restore_err);
                }
                Err(e)
            }
        }
    }

    /// Render and reload; on failure undo the registry change with `revert`
    async fn publish<R>(&self, revert: R) -> Result<()>
    where
        R: FnOnce(&mut Snapshot) -> Result<()>,
    {
        match self.render().await {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::warn!("Reverting routing change: {}", e);
                if let Err(revert_err) = self.store.mutate(revert).await {
                    tracing::error!("Failed to revert routing change: {}", revert_err);
                }
                Err(e)
            }
        }
    }

    async fn tls_warnings(&self, domain: &Domain) -> Vec<String> {
        if domain.ssl_enabled && !self.trust.ca_exists().await {
            vec![format!(
                "local CA not found at {}; {} is served over plain HTTP until it exists",
                self.trust.ca_path().display(),
                domain.full_domain
            )]
        } else {
            Vec::new()
        }
    }

    fn announce_domain(&self, domain: &Domain) {
        self.events.emit(IpcEvent::DomainChanged(domain.clone()));
        self.announce_instance(domain.instance_id());
    }

    fn announce_instance(&self, id: Option<&InstanceId>) {
        if let Some(instance) = id.and_then(|id| self.store.get_instance(id)) {
            self.events.emit(IpcEvent::InstanceChanged(instance));
        }
    }
}
