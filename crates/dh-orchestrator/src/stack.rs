//! Stack manager
//!
//! Stacks group instances so they can be started, stopped, exported and
//! imported together. Membership lives on the instances (`stack_id`), so an
//! instance can belong to at most one stack.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use dh_core::ipc::{CreateDomainRequest, CreateInstanceRequest, IpcEvent, TargetSpec};
use dh_core::model::{DomainOrigin, Instance, ProcessManager, Stack};
use dh_core::naming::{full_domain, validate_name};
use dh_core::report::{
    ExportedDomain, ExportedInstance, ImportReport, MemberOutcome, MemberResult, StackExport,
    StackInfo, STACK_EXPORT_FORMAT,
};
use dh_core::types::{InstanceId, StackId};
use dh_core::{DevhostConfig, DevhostError, Result};

use crate::events::EventBus;
use crate::instances::{InstanceManager, PortChoice};
use crate::router::DomainRouter;
use crate::store::{Snapshot, StateStore};
use crate::supervisor::Supervisor;

/// Members started or stopped at once by a bulk operation
const STACK_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Copy)]
enum BulkAction {
    Start,
    Stop,
}

pub struct StackManager {
    store: Arc<StateStore>,
    supervisor: Arc<Supervisor>,
    instances: Arc<InstanceManager>,
    router: Arc<DomainRouter>,
    config: Arc<DevhostConfig>,
    events: EventBus,
}

impl StackManager {
    pub fn new(
        store: Arc<StateStore>,
        supervisor: Arc<Supervisor>,
        instances: Arc<InstanceManager>,
        router: Arc<DomainRouter>,
        config: Arc<DevhostConfig>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            supervisor,
            instances,
            router,
            config,
            events,
        }
    }

    pub fn list(&self) -> Vec<StackInfo> {
        let snapshot = self.store.snapshot();
        snapshot
            .stacks
            .values()
            .map(|stack| stack_info(&snapshot, stack))
            .collect()
    }

    pub fn get(&self, reference: &str) -> Result<StackInfo> {
        let snapshot = self.store.snapshot();
        let stack = snapshot.find_stack(reference)?;
        Ok(stack_info(&snapshot, stack))
    }

    /// Create a stack and move the referenced instances into it
    pub async fn create(
        &self,
        name: &str,
        description: Option<String>,
        members: &[String],
    ) -> Result<StackInfo> {
        validate_name("stack", name)?;
        let (stack, moved) = self
            .store
            .mutate(|s| {
                if s.stack_by_name(name).is_some() {
                    return Err(DevhostError::already_exists("stack", name));
                }
                let stack = Stack::new(name, description);
                let mut ids = Vec::new();
                for reference in members {
                    let instance = s.find_instance(reference)?;
                    check_unclaimed(s, instance, &stack.id)?;
                    ids.push(instance.id.clone());
                }
                s.stacks.insert(stack.id.clone(), stack.clone());
                let moved = join_stack(s, &ids, &stack.id)?;
                Ok((stack, moved))
            })
            .await?;

        tracing::info!("Created stack {} with {} member(s)", stack.name, moved.len());
        self.announce(&stack, moved);
        self.get(stack.id.as_str())
    }

    /// Delete a stack, either ungrouping or deleting its members
    pub async fn delete(&self, reference: &str, cascade: bool) -> Result<()> {
        let info = self.get(reference)?;
        let stack_id = info.stack.id.clone();

        if cascade {
            for member in &info.members {
                self.instances.delete(member.id.as_str()).await?;
            }
        }

        let released = self
            .store
            .mutate(|s| {
                s.stacks.remove(&stack_id);
                let mut released = Vec::new();
                for instance in s.instances.values_mut() {
                    if instance.stack_id.as_ref() == Some(&stack_id) {
                        instance.stack_id = None;
                        instance.updated_at = dh_core::model::now_millis();
                        released.push(instance.clone());
                    }
                }
                Ok(released)
            })
            .await?;

        tracing::info!(
            "Deleted stack {}{}",
            info.stack.name,
            if cascade { " and its members" } else { "" }
        );
        for instance in released {
            self.events.emit(IpcEvent::InstanceChanged(instance));
        }
        self.events.emit(IpcEvent::StackRemoved { stack_id });
        Ok(())
    }

    pub async fn add_member(&self, stack: &str, instance: &str) -> Result<StackInfo> {
        let (stack, moved) = self
            .store
            .mutate(|s| {
                let stack_id = s.find_stack(stack)?.id.clone();
                let member = s.find_instance(instance)?;
                check_unclaimed(s, member, &stack_id)?;
                let ids = [member.id.clone()];
                let moved = join_stack(s, &ids, &stack_id)?;
                Ok((touch_stack(s, &stack_id)?, moved))
            })
            .await?;
        self.announce(&stack, moved);
        self.get(stack.id.as_str())
    }

    pub async fn remove_member(&self, stack: &str, instance: &str) -> Result<StackInfo> {
        let (stack, released) = self
            .store
            .mutate(|s| {
                let stack_id = s.find_stack(stack)?.id.clone();
                let member_id = s.find_instance(instance)?.id.clone();
                let member = s.instance_mut(&member_id)?;
                if member.stack_id.as_ref() != Some(&stack_id) {
                    return Err(DevhostError::validation(format!(
                        "{} is not a member of this stack",
                        member.name
                    )));
                }
                member.stack_id = None;
                member.updated_at = dh_core::model::now_millis();
                let released = member.clone();
                Ok((touch_stack(s, &stack_id)?, vec![released]))
            })
            .await?;
        self.announce(&stack, released);
        self.get(stack.id.as_str())
    }

    /// Start every member concurrently; one failure does not stop the others
    pub async fn start(
        &self,
        reference: &str,
        cancel: &CancellationToken,
    ) -> Result<(StackId, Vec<MemberResult>)> {
        self.bulk(reference, BulkAction::Start, cancel).await
    }

    /// Stop every member concurrently; one failure does not stop the others
    pub async fn stop(
        &self,
        reference: &str,
        cancel: &CancellationToken,
    ) -> Result<(StackId, Vec<MemberResult>)> {
        self.bulk(reference, BulkAction::Stop, cancel).await
    }

    /// Fan an action out over the members
    ///
    /// Once `cancel` fires no further member is attempted; members already
    /// in flight run to completion.
    async fn bulk(
        &self,
        reference: &str,
        action: BulkAction,
        cancel: &CancellationToken,
    ) -> Result<(StackId, Vec<MemberResult>)> {
        let info = self.get(reference)?;
        tracing::info!(
            "{:?} stack {} ({} member(s))",
            action,
            info.stack.name,
            info.members.len()
        );

        let mut results: Vec<MemberResult> = stream::iter(info.members)
            .map(|member| async move {
                let outcome = if cancel.is_cancelled() {
                    MemberOutcome::Skipped
                } else {
                    let result = match action {
                        BulkAction::Start => self.supervisor.start(&member.id).await,
                        BulkAction::Stop => self.supervisor.stop(&member.id).await,
                    };
                    match result {
                        Ok(_) => MemberOutcome::Ok,
                        Err(DevhostError::AlreadyRunning(_)) | Err(DevhostError::NotRunning(_)) => {
                            MemberOutcome::Unchanged
                        }
                        Err(e) => {
                            tracing::warn!("{:?} of {} failed: {}", action, member.name, e);
                            MemberOutcome::Failed {
                                kind: e.kind(),
                                message: e.to_string(),
                            }
                        }
                    }
                };
                MemberResult {
                    instance_id: member.id,
                    name: member.name,
                    outcome,
                }
            })
            .buffer_unordered(STACK_CONCURRENCY)
            .collect()
            .await;

        results.sort_by(|a, b| a.name.cmp(&b.name));
        Ok((info.stack.id, results))
    }

    /// Portable definition of a stack, without ids or runtime state
    pub fn export(&self, reference: &str) -> Result<StackExport> {
        let snapshot = self.store.snapshot();
        let stack = snapshot.find_stack(reference)?;
        let mut members = snapshot.stack_members(&stack.id);
        members.sort_by(|a, b| a.name.cmp(&b.name));

        let instances = members
            .into_iter()
            .map(|instance| ExportedInstance {
                name: instance.name.clone(),
                service_type: instance.service_type,
                version: instance.version.clone(),
                config: instance.config.clone(),
                preferred_port: instance.port,
                domains: snapshot
                    .domains_for_instance(&instance.id)
                    .into_iter()
                    .filter(|d| d.origin == DomainOrigin::Explicit)
                    .map(|d| ExportedDomain {
                        subdomain: d.subdomain.clone(),
                        ssl_enabled: d.ssl_enabled,
                    })
                    .collect(),
            })
            .collect();

        Ok(StackExport {
            format_version: STACK_EXPORT_FORMAT,
            name: stack.name.clone(),
            description: stack.description.clone(),
            instances,
        })
    }

    /// Recreate a stack from an export with fresh ids and ports
    ///
    /// Clashing stack and instance names get a numeric suffix and domains
    /// that already exist are skipped. Anything else that fails removes what
    /// the import created so far.
    pub async fn import(&self, document: StackExport) -> Result<ImportReport> {
        if document.format_version == 0 || document.format_version > STACK_EXPORT_FORMAT {
            return Err(DevhostError::validation(format!(
                "unsupported stack export format {} (this build reads up to {})",
                document.format_version, STACK_EXPORT_FORMAT
            )));
        }
        validate_name("stack", &document.name)?;
        for exported in &document.instances {
            validate_name("instance", &exported.name)?;
            if exported.config.service_type() != exported.service_type {
                return Err(DevhostError::validation(format!(
                    "{} carries {} configuration for a {} service",
                    exported.name,
                    exported.config.service_type(),
                    exported.service_type
                )));
            }
        }

        let mut renamed = Vec::new();
        let stack = self
            .store
            .mutate(|s| {
                let name = unique_name(&document.name, |candidate| {
                    s.stack_by_name(candidate).is_some()
                });
                let stack = Stack::new(name, document.description.clone());
                s.stacks.insert(stack.id.clone(), stack.clone());
                Ok(stack)
            })
            .await?;
        if stack.name != document.name {
            renamed.push((document.name.clone(), stack.name.clone()));
        }
        self.events.emit(IpcEvent::StackChanged(stack.clone()));

        let mut created = Vec::new();
        let mut skipped_domains = Vec::new();
        let outcome = self
            .import_members(&document, &stack.id, &mut created, &mut renamed, &mut skipped_domains)
            .await;
        if let Err(e) = outcome {
            tracing::warn!("Import of stack {} failed, rolling back: {}", stack.name, e);
            self.rollback_import(&stack.id, &created).await;
            return Err(e);
        }

        let snapshot = self.store.snapshot();
        let instances = created
            .iter()
            .filter_map(|id| snapshot.instance(id).cloned())
            .collect();
        tracing::info!(
            "Imported stack {} with {} instance(s)",
            stack.name,
            created.len()
        );
        Ok(ImportReport {
            stack_id: stack.id,
            stack_name: stack.name,
            instances,
            renamed,
            skipped_domains,
        })
    }

    async fn import_members(
        &self,
        document: &StackExport,
        stack_id: &StackId,
        created: &mut Vec<InstanceId>,
        renamed: &mut Vec<(String, String)>,
        skipped_domains: &mut Vec<String>,
    ) -> Result<()> {
        for exported in &document.instances {
            let name = {
                let snapshot = self.store.snapshot();
                unique_name(&exported.name, |candidate| {
                    snapshot.instance_by_name(candidate).is_some()
                })
            };
            if name != exported.name {
                renamed.push((exported.name.clone(), name.clone()));
            }

            let mut request =
                CreateInstanceRequest::new(&name, exported.service_type, &exported.version);
            request.config = Some(exported.config.clone());
            request.process_manager = ProcessManager::Direct;
            let instance = self
                .instances
                .create_with(request, PortChoice::Preferred(exported.preferred_port))
                .await?;
            created.push(instance.id.clone());

            let ids = [instance.id.clone()];
            let moved = self
                .store
                .mutate(|s| join_stack(s, &ids, stack_id))
                .await?;
            for instance in moved {
                self.events.emit(IpcEvent::InstanceChanged(instance));
            }

            for domain in &exported.domains {
                let full = full_domain(&domain.subdomain, &self.config.tld);
                if self.store.get_domain(&full).is_some() {
                    skipped_domains.push(full);
                    continue;
                }
                let routed = self
                    .router
                    .create_domain(CreateDomainRequest {
                        name: domain.subdomain.clone(),
                        target: TargetSpec::Instance(instance.id.to_string()),
                        ssl_enabled: domain.ssl_enabled,
                    })
                    .await;
                match routed {
                    Ok(_) => {}
                    Err(DevhostError::AlreadyExists { .. }) => skipped_domains.push(full),
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    async fn rollback_import(&self, stack_id: &StackId, created: &[InstanceId]) {
        for id in created.iter().rev() {
            if let Err(e) = self.instances.delete(id.as_str()).await {
                tracing::error!("Failed to remove imported instance {}: {}", id, e);
            }
        }
        match self.store.delete_stack(stack_id).await {
            Ok(_) => self.events.emit(IpcEvent::StackRemoved {
                stack_id: stack_id.clone(),
            }),
            Err(e) => tracing::error!("Failed to remove imported stack {}: {}", stack_id, e),
        }
    }

    fn announce(&self, stack: &Stack, members: Vec<Instance>) {
        self.events.emit(IpcEvent::StackChanged(stack.clone()));
        for instance in members {
            self.events.emit(IpcEvent::InstanceChanged(instance));
        }
    }
}

fn stack_info(snapshot: &Snapshot, stack: &Stack) -> StackInfo {
    let mut members: Vec<Instance> = snapshot
        .stack_members(&stack.id)
        .into_iter()
        .cloned()
        .collect();
    members.sort_by(|a, b| a.name.cmp(&b.name));
    StackInfo {
        stack: stack.clone(),
        members,
    }
}

/// Reject an instance that already belongs to a different stack
fn check_unclaimed(snapshot: &Snapshot, instance: &Instance, stack_id: &StackId) -> Result<()> {
    match &instance.stack_id {
        Some(current) if current != stack_id => {
            let owner = snapshot
                .stacks
                .get(current)
                .map(|s| s.name.as_str())
                .unwrap_or("another stack");
            Err(DevhostError::validation(format!(
                "{} already belongs to {}",
                instance.name, owner
            )))
        }
        _ => Ok(()),
    }
}

fn join_stack(snapshot: &mut Snapshot, ids: &[InstanceId], stack_id: &StackId) -> Result<Vec<Instance>> {
    let mut moved = Vec::new();
    for id in ids {
        let instance = snapshot.instance_mut(id)?;
        if instance.stack_id.as_ref() != Some(stack_id) {
            instance.stack_id = Some(stack_id.clone());
            instance.updated_at = dh_core::model::now_millis();
            moved.push(instance.clone());
        }
    }
    Ok(moved)
}

fn touch_stack(snapshot: &mut Snapshot, stack_id: &StackId) -> Result<Stack> {
    let stack = snapshot
        .stacks
        .get_mut(stack_id)
        .ok_or_else(|| DevhostError::not_found("stack", stack_id.as_str()))?;
    stack.updated_at = dh_core::model::now_millis();
    Ok(stack.clone())
}

/// `base`, or `base-2`, `base-3`, ... whichever is free first
fn unique_name(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    (2u32..)
        .map(|n| format!("{}-{}", base, n))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| base.to_string())
}
