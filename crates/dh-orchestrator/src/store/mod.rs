//! Durable registry of instances, domains, stacks and parked directories
//!
//! All writes go through [`StateStore::mutate`], which serializes writers,
//! applies the change to a copy of the current snapshot, persists the copy
//! atomically (temp file, fsync, rename) and only then publishes it. A
//! failed write leaves both disk and memory untouched.

mod snapshot;

pub use snapshot::{Snapshot, SCHEMA_VERSION};

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use dh_core::model::{Domain, Instance, ParkedDirectory, Stack};
use dh_core::types::{InstanceId, StackId};
use dh_core::{DevhostError, Result};

/// Persistent registry shared by every component
pub struct StateStore {
    path: PathBuf,
    current: RwLock<Arc<Snapshot>>,
    writer: Mutex<()>,
}

impl StateStore {
    /// Load the snapshot at `path`, or start empty if there is none
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes).map_err(|e| {
                    DevhostError::PersistenceFailed(format!(
                        "corrupt state file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                if snapshot.schema_version > SCHEMA_VERSION {
                    return Err(DevhostError::PersistenceFailed(format!(
                        "state file {} has schema {} but this build understands {}",
                        path.display(),
                        snapshot.schema_version,
                        SCHEMA_VERSION
                    )));
                }
                tracing::info!(
                    "Loaded state: {} instances, {} domains, {} stacks, {} parked",
                    snapshot.instances.len(),
                    snapshot.domains.len(),
                    snapshot.stacks.len(),
                    snapshot.parked.len()
                );
                snapshot
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!("No state at {}, starting empty", path.display());
                Snapshot::default()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            current: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(()),
        })
    }

    /// Path of the snapshot file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Consistent view of the whole registry
    pub fn snapshot(&self) -> Arc<Snapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Apply `change` atomically and durably
    ///
    /// `change` runs against a private copy while the writer lock is held, so
    /// checks made inside it cannot race other writers. If it returns an
    /// error nothing is persisted.
    pub async fn mutate<T, F>(&self, change: F) -> Result<T>
    where
        F: FnOnce(&mut Snapshot) -> Result<T>,
    {
        let _writer = self.writer.lock().await;
        let mut next = (*self.snapshot()).clone();
        let out = change(&mut next)?;

        self.persist(&next).await?;

        let next = Arc::new(next);
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        Ok(out)
    }

    async fn persist(&self, snapshot: &Snapshot) -> Result<()> {
        let failed = |what: &str, e: io::Error| {
            DevhostError::PersistenceFailed(format!("{} {}: {}", what, self.path.display(), e))
        };

        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| DevhostError::PersistenceFailed(e.to_string()))?;

        let tmp = self.path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| failed("create temp for", e))?;
        file.write_all(&json).await.map_err(|e| failed("write", e))?;
        file.sync_all().await.map_err(|e| failed("sync", e))?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(failed("replace", e));
        }
        Ok(())
    }

    // ---- per-entity accessors ----

    pub fn get_instance(&self, id: &InstanceId) -> Option<Instance> {
        self.snapshot().instance(id).cloned()
    }

    /// Resolve an instance by id or name
    pub fn find_instance(&self, reference: &str) -> Result<Instance> {
        self.snapshot().find_instance(reference).cloned()
    }

    pub fn list_instances(&self) -> Vec<Instance> {
        self.snapshot().instances.values().cloned().collect()
    }

    pub async fn put_instance(&self, instance: Instance) -> Result<()> {
        self.mutate(move |s| {
            s.instances.insert(instance.id.clone(), instance);
            Ok(())
        })
        .await
    }

    /// Remove an instance together with every domain routed to it
    pub async fn delete_instance(&self, id: &InstanceId) -> Result<(Option<Instance>, Vec<Domain>)> {
        self.mutate(|s| {
            let names: Vec<String> = s
                .domains_for_instance(id)
                .into_iter()
                .map(|d| d.full_domain.clone())
                .collect();
            let domains = names.iter().filter_map(|name| s.remove_domain(name)).collect();
            Ok((s.instances.remove(id), domains))
        })
        .await
    }

    pub fn get_domain(&self, full_domain: &str) -> Option<Domain> {
        self.snapshot().domain(full_domain).cloned()
    }

    pub fn list_domains(&self) -> Vec<Domain> {
        self.snapshot().domains.values().cloned().collect()
    }

    pub async fn put_domain(&self, domain: Domain) -> Result<()> {
        self.mutate(move |s| s.insert_domain(domain)).await
    }

    pub async fn delete_domain(&self, full_domain: &str) -> Result<Option<Domain>> {
        self.mutate(|s| Ok(s.remove_domain(full_domain))).await
    }

    pub fn get_stack(&self, id: &StackId) -> Option<Stack> {
        self.snapshot().stacks.get(id).cloned()
    }

    pub fn list_stacks(&self) -> Vec<Stack> {
        self.snapshot().stacks.values().cloned().collect()
    }

    pub async fn put_stack(&self, stack: Stack) -> Result<()> {
        self.mutate(move |s| {
            s.stacks.insert(stack.id.clone(), stack);
            Ok(())
        })
        .await
    }

    pub async fn delete_stack(&self, id: &StackId) -> Result<Option<Stack>> {
        self.mutate(|s| Ok(s.stacks.remove(id))).await
    }

    pub fn get_parked(&self, path: &Path) -> Option<ParkedDirectory> {
        self.snapshot().parked.get(path).cloned()
    }

    pub fn list_parked(&self) -> Vec<ParkedDirectory> {
        self.snapshot().parked.values().cloned().collect()
    }

    pub async fn put_parked(&self, parked: ParkedDirectory) -> Result<()> {
        self.mutate(move |s| {
            s.parked.insert(parked.path.clone(), parked);
            Ok(())
        })
        .await
    }

    pub async fn delete_parked(&self, path: &Path) -> Result<Option<ParkedDirectory>> {
        self.mutate(|s| Ok(s.parked.remove(path))).await
    }
}
