//! In-memory registry snapshot
//!
//! A [`Snapshot`] is the complete persisted state. The store hands out
//! immutable `Arc<Snapshot>` values to readers and applies mutations to a
//! private copy, so a reader never observes a half-applied change.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use dh_core::model::{Domain, Instance, ParkedDirectory, Stack};
use dh_core::types::{InstanceId, StackId};
use dh_core::{DevhostError, Result};

/// Current on-disk schema version
pub const SCHEMA_VERSION: u32 = 1;

fn schema_version() -> u32 {
    SCHEMA_VERSION
}

/// The whole registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default = "schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub instances: BTreeMap<InstanceId, Instance>,
    /// Keyed by full domain, which is what makes domains unique
    #[serde(default)]
    pub domains: BTreeMap<String, Domain>,
    #[serde(default)]
    pub stacks: BTreeMap<StackId, Stack>,
    #[serde(default)]
    pub parked: BTreeMap<PathBuf, ParkedDirectory>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            instances: BTreeMap::new(),
            domains: BTreeMap::new(),
            stacks: BTreeMap::new(),
            parked: BTreeMap::new(),
        }
    }
}

impl Snapshot {
    // ---- instances ----

    pub fn instance(&self, id: &InstanceId) -> Option<&Instance> {
        self.instances.get(id)
    }

    pub fn instance_mut(&mut self, id: &InstanceId) -> Result<&mut Instance> {
        self.instances
            .get_mut(id)
            .ok_or_else(|| DevhostError::not_found("instance", id.as_str()))
    }

    pub fn instance_by_name(&self, name: &str) -> Option<&Instance> {
        self.instances.values().find(|i| i.name == name)
    }

    /// Resolve an id or a name
    pub fn find_instance(&self, reference: &str) -> Result<&Instance> {
        self.instances
            .get(&InstanceId::new(reference))
            .or_else(|| self.instance_by_name(reference))
            .ok_or_else(|| DevhostError::not_found("instance", reference))
    }

    /// Instance (other than `exclude`) registered on `port`, running or not
    pub fn port_holder(&self, port: u16, exclude: Option<&InstanceId>) -> Option<&Instance> {
        self.instances
            .values()
            .find(|i| i.port == port && Some(&i.id) != exclude)
    }

    /// Instance (other than `exclude`) currently claiming `port`
    pub fn live_port_holder(&self, port: u16, exclude: &InstanceId) -> Option<&Instance> {
        self.instances
            .values()
            .find(|i| i.port == port && &i.id != exclude && i.state.claims_port())
    }

    pub fn stack_members(&self, stack_id: &StackId) -> Vec<&Instance> {
        self.instances
            .values()
            .filter(|i| i.stack_id.as_ref() == Some(stack_id))
            .collect()
    }

    // ---- domains ----

    pub fn domain(&self, full_domain: &str) -> Option<&Domain> {
        self.domains.get(full_domain)
    }

    pub fn domains_for_instance(&self, id: &InstanceId) -> Vec<&Domain> {
        self.domains
            .values()
            .filter(|d| d.instance_id() == Some(id))
            .collect()
    }

    pub fn domains_parked_under(&self, parent: &Path) -> Vec<&Domain> {
        self.domains
            .values()
            .filter(|d| d.is_parked_under(parent))
            .collect()
    }

    /// Insert a domain, attaching it to its instance
    pub fn insert_domain(&mut self, domain: Domain) -> Result<()> {
        if self.domains.contains_key(&domain.full_domain) {
            return Err(DevhostError::already_exists("domain", &domain.full_domain));
        }
        if let Some(id) = domain.instance_id() {
            self.instance_mut(id)?.attach_domain(&domain.full_domain);
        }
        self.domains.insert(domain.full_domain.clone(), domain);
        Ok(())
    }

    /// Remove a domain, detaching it from its instance
    pub fn remove_domain(&mut self, full_domain: &str) -> Option<Domain> {
        let domain = self.domains.remove(full_domain)?;
        if let Some(id) = domain.instance_id() {
            if let Some(instance) = self.instances.get_mut(id) {
                instance.detach_domain(full_domain);
            }
        }
        Some(domain)
    }

    // ---- stacks ----

    pub fn stack_by_name(&self, name: &str) -> Option<&Stack> {
        self.stacks.values().find(|s| s.name == name)
    }

    /// Resolve an id or a name
    pub fn find_stack(&self, reference: &str) -> Result<&Stack> {
        self.stacks
            .get(&StackId::new(reference))
            .or_else(|| self.stack_by_name(reference))
            .ok_or_else(|| DevhostError::not_found("stack", reference))
    }

    // ---- parked ----

    /// The parked directory that `path` is, or is inside of
    pub fn parked_containing(&self, path: &Path) -> Option<&ParkedDirectory> {
        self.parked
            .values()
            .filter(|p| path.starts_with(&p.path))
            .max_by_key(|p| p.path.components().count())
    }

    /// Check every cross-entity invariant
    ///
    /// Returns a description of the first violation found.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        let mut names = HashSet::new();
        let mut live_ports = HashSet::new();
        for (id, instance) in &self.instances {
            if id != &instance.id {
                return Err(format!("instance keyed as {} has id {}", id, instance.id));
            }
            instance.check_invariants()?;
            if !names.insert(instance.name.as_str()) {
                return Err(format!("duplicate instance name {}", instance.name));
            }
            if instance.state.claims_port() && !live_ports.insert(instance.port) {
                return Err(format!("port {} claimed twice", instance.port));
            }
            if let Some(stack_id) = &instance.stack_id {
                if !self.stacks.contains_key(stack_id) {
                    return Err(format!("{} refers to missing stack {}", instance.name, stack_id));
                }
            }
            for mapped in &instance.mapped_domains {
                match self.domains.get(mapped) {
                    Some(d) if d.instance_id() == Some(id) => {}
                    _ => return Err(format!("{} maps {} which does not route to it", instance.name, mapped)),
                }
            }
        }

        for (full, domain) in &self.domains {
            if full != &domain.full_domain {
                return Err(format!("domain keyed as {} is {}", full, domain.full_domain));
            }
            if let Some(id) = domain.instance_id() {
                match self.instances.get(id) {
                    Some(i) if i.mapped_domains.contains(full) => {}
                    Some(i) => return Err(format!("{} not listed on {}", full, i.name)),
                    None => return Err(format!("{} routes to missing instance {}", full, id)),
                }
            }
        }

        let mut stack_names = HashSet::new();
        for stack in self.stacks.values() {
            if !stack_names.insert(stack.name.as_str()) {
                return Err(format!("duplicate stack name {}", stack.name));
            }
        }
        Ok(())
    }
}
