//! Parking engine
//!
//! A parked directory turns each of its immediate subdirectories into a
//! domain: `~/Sites/blog` becomes `blog.test`. Refresh reconciles the
//! derived domains with the directory listing through the domain router,
//! never touching explicit domains. It is idempotent; a second refresh with
//! nothing changed on disk writes nothing.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use dh_core::ipc::IpcEvent;
use dh_core::model::{Domain, DomainOrigin, DomainTarget, ParkedDirectory};
use dh_core::naming::{full_domain, sanitize_label};
use dh_core::report::{ParkStatus, RefreshReport};
use dh_core::{DevhostConfig, DevhostError, Result};

use crate::events::EventBus;
use crate::router::{DomainChange, DomainRouter};
use crate::store::StateStore;

pub struct ParkingEngine {
    store: Arc<StateStore>,
    router: Arc<DomainRouter>,
    config: Arc<DevhostConfig>,
    events: EventBus,
}

impl ParkingEngine {
    pub fn new(
        store: Arc<StateStore>,
        router: Arc<DomainRouter>,
        config: Arc<DevhostConfig>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            router,
            config,
            events,
        }
    }

    pub fn list(&self) -> Vec<ParkedDirectory> {
        self.store.list_parked()
    }

    /// Park a directory and derive its domains
    ///
    /// Parking a path that is already parked changes nothing.
    pub async fn park(
        &self,
        path: &Path,
        upstream_port: Option<u16>,
        cancel: &CancellationToken,
    ) -> Result<(ParkedDirectory, RefreshReport)> {
        let path = canonical_dir(path).await?;
        if let Some(existing) = self.store.get_parked(&path) {
            let report = RefreshReport {
                path: path.clone(),
                ..RefreshReport::default()
            };
            return Ok((existing, report));
        }

        let upstream_port = upstream_port.unwrap_or(self.config.parking.default_upstream_port);
        if upstream_port == 0 {
            return Err(DevhostError::validation("upstream port must be non-zero"));
        }

        let parked = ParkedDirectory::new(path.clone(), upstream_port);
        let inserted = parked.clone();
        self.store
            .mutate(move |s| {
                if s.parked.contains_key(&inserted.path) {
                    return Err(DevhostError::already_exists(
                        "parked directory",
                        inserted.path.display().to_string(),
                    ));
                }
                s.parked.insert(inserted.path.clone(), inserted);
                Ok(())
            })
            .await?;
        tracing::info!("Parked {} (upstream port {})", path.display(), upstream_port);
        self.events.emit(IpcEvent::ParkedChanged(parked));

        let report = self.refresh(&path, cancel).await?;
        let parked = self
            .store
            .get_parked(&path)
            .ok_or_else(|| DevhostError::not_found("parked directory", path.display().to_string()))?;
        Ok((parked, report))
    }

    /// Stop watching a directory and remove every domain derived from it
    pub async fn forget(&self, path: &Path) -> Result<()> {
        let path = self.resolve_parked_path(path).await?;

        let mut names: Vec<String> = self
            .store
            .snapshot()
            .domains_parked_under(&path)
            .into_iter()
            .map(|d| d.full_domain.clone())
            .collect();
        if let Some(parked) = self.store.get_parked(&path) {
            for cached in parked.derived_domains {
                if !names.contains(&cached) {
                    names.push(cached);
                }
            }
        }

        // Only remove names that really are derived from this parent
        let snapshot = self.store.snapshot();
        let changes = names
            .into_iter()
            .filter(|name| {
                snapshot
                    .domain(name)
                    .is_some_and(|d| d.is_parked_under(&path))
            })
            .map(DomainChange::Remove)
            .collect();
        self.router.apply_changes(changes).await?;

        self.store.delete_parked(&path).await?;
        tracing::info!("Forgot parked directory {}", path.display());
        self.events.emit(IpcEvent::ParkedRemoved { path });
        Ok(())
    }

    /// Reconcile derived domains with the directory listing
    ///
    /// Cancellation is honoured while listing. Once the listing is complete
    /// the changes are applied as one batch.
    pub async fn refresh(&self, path: &Path, cancel: &CancellationToken) -> Result<RefreshReport> {
        let path = self.resolve_parked_path(path).await?;
        let parked = self
            .store
            .get_parked(&path)
            .ok_or_else(|| DevhostError::not_found("parked directory", path.display().to_string()))?;

        let mut report = RefreshReport {
            path: path.clone(),
            ..RefreshReport::default()
        };
        if !parked.enabled {
            return Ok(report);
        }

        let Some(desired) = self.scan(&parked, &mut report, cancel).await? else {
            report.cancelled = true;
            return Ok(report);
        };

        let snapshot = self.store.snapshot();
        let current: Vec<&Domain> = snapshot.domains_parked_under(&path);

        let mut changes = Vec::new();
        for domain in &current {
            if !desired.contains_key(&domain.full_domain) {
                changes.push(DomainChange::Remove(domain.full_domain.clone()));
            }
        }
        for (full, child) in &desired {
            match snapshot.domain(full) {
                Some(existing) if existing.is_parked_under(&path) => {}
                Some(_) => report.skipped.push(full.clone()),
                None => changes.push(DomainChange::Add(self.derived_domain(&parked, full, child))),
            }
        }

        let applied = self.router.apply_changes(changes).await?;
        report.added = applied.added;
        report.removed = applied.removed;
        report.skipped.extend(applied.skipped);

        let derived: std::collections::BTreeSet<String> = self
            .store
            .snapshot()
            .domains_parked_under(&path)
            .into_iter()
            .map(|d| d.full_domain.clone())
            .collect();
        if derived != parked.derived_domains {
            let updated = self
                .store
                .mutate(|s| {
                    let entry = s.parked.get_mut(&path).ok_or_else(|| {
                        DevhostError::not_found("parked directory", path.display().to_string())
                    })?;
                    entry.derived_domains = derived;
                    Ok(entry.clone())
                })
                .await?;
            self.events.emit(IpcEvent::ParkedChanged(updated));
        }

        if !report.is_noop() {
            tracing::info!(
                "Refreshed {}: +{} -{}",
                path.display(),
                report.added.len(),
                report.removed.len()
            );
        }
        Ok(report)
    }

    /// Full domain -> child directory for every usable child
    ///
    /// Returns None when cancelled before the listing completed.
    async fn scan(
        &self,
        parked: &ParkedDirectory,
        report: &mut RefreshReport,
        cancel: &CancellationToken,
    ) -> Result<Option<BTreeMap<String, PathBuf>>> {
        let mut desired = BTreeMap::new();
        let mut entries = match tokio::fs::read_dir(&parked.path).await {
            Ok(entries) => entries,
            // A vanished parent derives nothing
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!("Parked directory {} no longer exists", parked.path.display());
                return Ok(Some(desired));
            }
            Err(e) => return Err(e.into()),
        };

        let mut children = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                children.push((name, entry.path()));
            }
        }
        children.sort();

        for (name, child) in children {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let is_dir = match tokio::fs::metadata(&child).await {
                Ok(meta) => meta.is_dir(),
                Err(_) => false,
            };
            if !is_dir {
                continue;
            }
            let Some(label) = sanitize_label(&name) else {
                report.skipped.push(name);
                continue;
            };
            let full = full_domain(&label, &self.config.tld);
            if desired.contains_key(&full) {
                // Two children sanitize to the same label; first in name order wins
                report.skipped.push(name);
                continue;
            }
            desired.insert(full, child);
        }
        Ok(Some(desired))
    }

    fn derived_domain(&self, parked: &ParkedDirectory, full: &str, child: &Path) -> Domain {
        let label = full
            .strip_suffix(&format!(".{}", self.config.tld))
            .unwrap_or(full);
        let mut domain = Domain::new(
            label,
            &self.config.tld,
            DomainTarget::Port(parked.upstream_port),
            false,
        );
        domain.origin = DomainOrigin::Parked {
            parent: parked.path.clone(),
        };
        domain.document_root = Some(child.to_path_buf());
        domain
    }

    /// Which parked directory, if any, a path belongs to and the domain it gets
    pub async fn status(&self, path: &Path) -> ParkStatus {
        let path = match tokio::fs::canonicalize(path).await {
            Ok(canonical) => canonical,
            Err(_) => path.to_path_buf(),
        };
        let snapshot = self.store.snapshot();

        let Some(parked) = snapshot.parked_containing(&path).filter(|p| p.enabled) else {
            return ParkStatus {
                path,
                parked_parent: None,
                domain: None,
                is_parked_root: false,
            };
        };

        if path == parked.path {
            return ParkStatus {
                parked_parent: Some(parked.path.clone()),
                domain: None,
                is_parked_root: true,
                path,
            };
        }

        let domain = path
            .strip_prefix(&parked.path)
            .ok()
            .and_then(|rest| rest.components().next())
            .and_then(|child| sanitize_label(&child.as_os_str().to_string_lossy()))
            .map(|label| full_domain(&label, &self.config.tld));
        ParkStatus {
            parked_parent: Some(parked.path.clone()),
            domain,
            is_parked_root: false,
            path,
        }
    }

    /// Refresh every enabled parked directory once
    pub async fn refresh_all(&self, cancel: &CancellationToken) {
        for parked in self.store.list_parked() {
            if cancel.is_cancelled() {
                return;
            }
            if !parked.enabled {
                continue;
            }
            if let Err(e) = self.refresh(&parked.path, cancel).await {
                tracing::warn!("Refresh of {} failed: {}", parked.path.display(), e);
            }
        }
    }

    /// Match a caller-supplied path to a parked entry
    ///
    /// Accepts the path as stored or its canonical form, so forgetting works
    /// after the directory itself was deleted.
    async fn resolve_parked_path(&self, path: &Path) -> Result<PathBuf> {
        if self.store.get_parked(path).is_some() {
            return Ok(path.to_path_buf());
        }
        if let Ok(canonical) = tokio::fs::canonicalize(path).await {
            if self.store.get_parked(&canonical).is_some() {
                return Ok(canonical);
            }
        }
        Err(DevhostError::not_found(
            "parked directory",
            path.display().to_string(),
        ))
    }
}

async fn canonical_dir(path: &Path) -> Result<PathBuf> {
    if !path.is_absolute() {
        return Err(DevhostError::validation(format!(
            "parked path must be absolute: {}",
            path.display()
        )));
    }
    let canonical = tokio::fs::canonicalize(path).await.map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => DevhostError::not_found("directory", path.display().to_string()),
        _ => DevhostError::Io(e),
    })?;
    if !tokio::fs::metadata(&canonical).await?.is_dir() {
        return Err(DevhostError::validation(format!(
            "not a directory: {}",
            canonical.display()
        )));
    }
    Ok(canonical)
}

/// Run the periodic refresh of all parked directories until cancelled
pub async fn run_parking_refresh(engine: Arc<ParkingEngine>, cancel: CancellationToken) {
    let period = engine.config.parking.refresh_interval;
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    tracing::info!("Starting parked directory refresh (interval: {:?})", period);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                engine.refresh_all(&cancel).await;
            }
            _ = cancel.cancelled() => {
                tracing::info!("Parked directory refresh shutting down");
                break;
            }
        }
    }
}
