//! Persistence port and adapters
//!
//! Every mutable record carries a `revision`. Saves succeed only when the
//! caller's revision equals the stored one; the store then bumps it and
//! returns the stored copy. A mismatch is [`Error::ConcurrencyConflict`] and
//! the caller reloads and retries the whole operation.
//!
//! - [`MemoryStore`]: mutex-guarded maps, for tests and embedding
//! - [`JsonFileStore`]: the same data persisted to one JSON file after every
//!   mutation with an atomic write

use crate::core::compile::CompiledPolicy;
use crate::core::error::{Error, Result};
use crate::core::model::{FilteringPolicy, Firewall, PolicyVersion};
use crate::orchestrator::task::{ApplicationTask, TaskState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Outcome of [`Store::insert_task`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskInsert {
    Inserted(ApplicationTask),
    /// An equivalent task already exists; it is returned unchanged
    Existing(ApplicationTask),
}

impl TaskInsert {
    pub fn into_task(self) -> ApplicationTask {
        match self {
            TaskInsert::Inserted(t) | TaskInsert::Existing(t) => t,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, TaskInsert::Inserted(_))
    }
}

pub trait Store: Send + Sync {
    fn insert_firewall(&self, firewall: &Firewall) -> Result<Firewall>;
    fn load_firewall(&self, id: Uuid) -> Result<Firewall>;
    fn find_firewall_by_name(&self, name: &str) -> Result<Option<Firewall>>;
    fn list_firewalls(&self) -> Result<Vec<Firewall>>;
    fn save_firewall(&self, firewall: &Firewall) -> Result<Firewall>;
    /// Deletes the firewall with its policies, compiled versions and tasks.
    fn delete_firewall(&self, id: Uuid) -> Result<()>;

    fn insert_policy(&self, policy: &FilteringPolicy) -> Result<FilteringPolicy>;
    fn load_policy(&self, id: Uuid) -> Result<FilteringPolicy>;
    fn list_policies(&self, firewall_id: Uuid) -> Result<Vec<FilteringPolicy>>;
    fn save_policy(&self, policy: &FilteringPolicy) -> Result<FilteringPolicy>;
    /// Deletes the policy and its compiled versions. Refused while a
    /// compiled version is applied, submitted, or targeted by an active task.
    fn delete_policy(&self, id: Uuid) -> Result<()>;

    /// Stores an immutable compiled version. Fails if the version exists.
    fn insert_compiled(&self, compiled: &CompiledPolicy) -> Result<()>;
    fn load_compiled(&self, version: PolicyVersion) -> Result<CompiledPolicy>;
    fn latest_compiled_version(&self, policy_id: Uuid) -> Result<Option<u64>>;
    fn list_compiled_versions(&self, policy_id: Uuid) -> Result<Vec<u64>>;

    /// Inserts a task unless one for the same (firewall, version) is active,
    /// or that version is applied, nothing newer is submitted, and its
    /// succeeded task exists.
    fn insert_task(&self, task: &ApplicationTask) -> Result<TaskInsert>;
    fn load_task(&self, id: Uuid) -> Result<ApplicationTask>;
    fn save_task(&self, task: &ApplicationTask) -> Result<ApplicationTask>;
    fn list_tasks(&self, firewall_id: Uuid) -> Result<Vec<ApplicationTask>>;
    fn list_active_tasks(&self) -> Result<Vec<ApplicationTask>>;
}

/// All persisted records. Shared by both adapters.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(crate) struct StoreData {
    #[serde(default)]
    firewalls: HashMap<Uuid, Firewall>,
    #[serde(default)]
    policies: HashMap<Uuid, FilteringPolicy>,
    /// Compiled versions per policy, ascending by version
    #[serde(default)]
    compiled: HashMap<Uuid, Vec<CompiledPolicy>>,
    #[serde(default)]
    tasks: HashMap<Uuid, ApplicationTask>,
}

fn not_found(entity: &'static str, id: Uuid) -> Error {
    Error::NotFound { entity, id }
}

fn conflict(entity: &'static str, id: Uuid) -> Error {
    Error::ConcurrencyConflict { entity, id }
}

impl StoreData {
    fn insert_firewall(&mut self, firewall: &Firewall) -> Result<Firewall> {
        if self.firewalls.contains_key(&firewall.id) {
            return Err(conflict("firewall", firewall.id));
        }
        if self.firewalls.values().any(|f| f.name == firewall.name) {
            return Err(Error::validation(
                "name",
                format!("firewall '{}' already exists", firewall.name),
            ));
        }
        let stored = Firewall {
            revision: 0,
            ..firewall.clone()
        };
        self.firewalls.insert(stored.id, stored.clone());
        Ok(stored)
    }

    fn save_firewall(&mut self, firewall: &Firewall) -> Result<Firewall> {
        let current = self
            .firewalls
            .get_mut(&firewall.id)
            .ok_or_else(|| not_found("firewall", firewall.id))?;
        if current.revision != firewall.revision {
            return Err(conflict("firewall", firewall.id));
        }
        *current = Firewall {
            revision: firewall.revision + 1,
            ..firewall.clone()
        };
        Ok(current.clone())
    }

    fn delete_firewall(&mut self, id: Uuid) -> Result<()> {
        if self.firewalls.remove(&id).is_none() {
            return Err(not_found("firewall", id));
        }
        let policy_ids: Vec<Uuid> = self
            .policies
            .values()
            .filter(|p| p.firewall_id == id)
            .map(|p| p.id)
            .collect();
        for pid in policy_ids {
            self.policies.remove(&pid);
            self.compiled.remove(&pid);
        }
        self.tasks.retain(|_, t| t.firewall_id != id);
        Ok(())
    }

    fn insert_policy(&mut self, policy: &FilteringPolicy) -> Result<FilteringPolicy> {
        if !self.firewalls.contains_key(&policy.firewall_id) {
            return Err(not_found("firewall", policy.firewall_id));
        }
        if self.policies.contains_key(&policy.id) {
            return Err(conflict("policy", policy.id));
        }
        let stored = FilteringPolicy {
            revision: 0,
            ..policy.clone()
        };
        self.policies.insert(stored.id, stored.clone());
        Ok(stored)
    }

    fn save_policy(&mut self, policy: &FilteringPolicy) -> Result<FilteringPolicy> {
        let current = self
            .policies
            .get_mut(&policy.id)
            .ok_or_else(|| not_found("policy", policy.id))?;
        if current.revision != policy.revision {
            return Err(conflict("policy", policy.id));
        }
        *current = FilteringPolicy {
            revision: policy.revision + 1,
            ..policy.clone()
        };
        Ok(current.clone())
    }

    fn delete_policy(&mut self, id: Uuid) -> Result<()> {
        let policy = self.policies.get(&id).ok_or_else(|| not_found("policy", id))?;
        let in_use = self.firewalls.get(&policy.firewall_id).is_some_and(|fw| {
            fw.applied.is_some_and(|v| v.policy_id == id)
                || fw.latest_submission.is_some_and(|v| v.policy_id == id)
        }) || self
            .tasks
            .values()
            .any(|t| t.target.policy_id == id && t.state.is_active());
        if in_use {
            return Err(Error::validation(
                "policy",
                "policy has an applied, submitted or in-flight version",
            ));
        }
        self.policies.remove(&id);
        self.compiled.remove(&id);
        Ok(())
    }

    fn insert_compiled(&mut self, compiled: &CompiledPolicy) -> Result<()> {
        let policy_id = compiled.version.policy_id;
        if !self.policies.contains_key(&policy_id) {
            return Err(not_found("policy", policy_id));
        }
        let versions = self.compiled.entry(policy_id).or_default();
        if versions
            .iter()
            .any(|c| c.version.version == compiled.version.version)
        {
            return Err(conflict("compiled policy", compiled.id));
        }
        versions.push(compiled.clone());
        versions.sort_by_key(|c| c.version.version);
        Ok(())
    }

    fn load_compiled(&self, version: PolicyVersion) -> Result<CompiledPolicy> {
        self.compiled
            .get(&version.policy_id)
            .and_then(|vs| vs.iter().find(|c| c.version == version))
            .cloned()
            .ok_or_else(|| not_found("compiled policy", version.policy_id))
    }

    fn compiled_versions(&self, policy_id: Uuid) -> Vec<u64> {
        self.compiled
            .get(&policy_id)
            .map(|vs| vs.iter().map(|c| c.version.version).collect())
            .unwrap_or_default()
    }

    fn insert_task(&mut self, task: &ApplicationTask) -> Result<TaskInsert> {
        let firewall = self
            .firewalls
            .get(&task.firewall_id)
            .ok_or_else(|| not_found("firewall", task.firewall_id))?;

        let same_target = |t: &&ApplicationTask| {
            t.firewall_id == task.firewall_id && t.target == task.target
        };
        if let Some(active) = self
            .tasks
            .values()
            .filter(same_target)
            .find(|t| t.state.is_active())
        {
            return Ok(TaskInsert::Existing(active.clone()));
        }
        if firewall.applied == Some(task.target)
            && firewall.latest_submission == Some(task.target)
            && let Some(done) = self
                .tasks
                .values()
                .filter(same_target)
                .filter(|t| t.state == TaskState::Succeeded)
                .max_by_key(|t| t.updated_at)
        {
            return Ok(TaskInsert::Existing(done.clone()));
        }

        let stored = ApplicationTask {
            revision: 0,
            ..task.clone()
        };
        self.tasks.insert(stored.id, stored.clone());
        Ok(TaskInsert::Inserted(stored))
    }

    fn save_task(&mut self, task: &ApplicationTask) -> Result<ApplicationTask> {
        let current = self
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| not_found("task", task.id))?;
        if current.revision != task.revision {
            return Err(conflict("task", task.id));
        }
        *current = ApplicationTask {
            revision: task.revision + 1,
            ..task.clone()
        };
        Ok(current.clone())
    }

    fn sorted_tasks(&self, filter: impl Fn(&ApplicationTask) -> bool) -> Vec<ApplicationTask> {
        let mut tasks: Vec<ApplicationTask> =
            self.tasks.values().filter(|t| filter(t)).cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }
}

/// Implements [`Store`] for an adapter exposing `read` and `write` closures
/// over [`StoreData`].
macro_rules! impl_store {
    ($ty:ty) => {
        impl $crate::store::Store for $ty {
            fn insert_firewall(&self, firewall: &Firewall) -> Result<Firewall> {
                self.write(|d| d.insert_firewall(firewall))
            }
            fn load_firewall(&self, id: Uuid) -> Result<Firewall> {
                self.read(|d| {
                    d.firewalls
                        .get(&id)
                        .cloned()
                        .ok_or_else(|| not_found("firewall", id))
                })
            }
            fn find_firewall_by_name(&self, name: &str) -> Result<Option<Firewall>> {
                self.read(|d| Ok(d.firewalls.values().find(|f| f.name == name).cloned()))
            }
            fn list_firewalls(&self) -> Result<Vec<Firewall>> {
                self.read(|d| {
                    let mut all: Vec<Firewall> = d.firewalls.values().cloned().collect();
                    all.sort_by(|a, b| a.name.cmp(&b.name));
                    Ok(all)
                })
            }
            fn save_firewall(&self, firewall: &Firewall) -> Result<Firewall> {
                self.write(|d| d.save_firewall(firewall))
            }
            fn delete_firewall(&self, id: Uuid) -> Result<()> {
                self.write(|d| d.delete_firewall(id))
            }

            fn insert_policy(&self, policy: &FilteringPolicy) -> Result<FilteringPolicy> {
                self.write(|d| d.insert_policy(policy))
            }
            fn load_policy(&self, id: Uuid) -> Result<FilteringPolicy> {
                self.read(|d| {
                    d.policies
                        .get(&id)
                        .cloned()
                        .ok_or_else(|| not_found("policy", id))
                })
            }
            fn list_policies(&self, firewall_id: Uuid) -> Result<Vec<FilteringPolicy>> {
                self.read(|d| {
                    let mut all: Vec<FilteringPolicy> = d
                        .policies
                        .values()
                        .filter(|p| p.firewall_id == firewall_id)
                        .cloned()
                        .collect();
                    all.sort_by_key(|p| (p.priority, p.created_at));
                    Ok(all)
                })
            }
            fn save_policy(&self, policy: &FilteringPolicy) -> Result<FilteringPolicy> {
                self.write(|d| d.save_policy(policy))
            }
            fn delete_policy(&self, id: Uuid) -> Result<()> {
                self.write(|d| d.delete_policy(id))
            }

            fn insert_compiled(&self, compiled: &CompiledPolicy) -> Result<()> {
                self.write(|d| d.insert_compiled(compiled))
            }
            fn load_compiled(&self, version: PolicyVersion) -> Result<CompiledPolicy> {
                self.read(|d| d.load_compiled(version))
            }
            fn latest_compiled_version(&self, policy_id: Uuid) -> Result<Option<u64>> {
                self.read(|d| Ok(d.compiled_versions(policy_id).last().copied()))
            }
            fn list_compiled_versions(&self, policy_id: Uuid) -> Result<Vec<u64>> {
                self.read(|d| Ok(d.compiled_versions(policy_id)))
            }

            fn insert_task(&self, task: &ApplicationTask) -> Result<TaskInsert> {
                self.write(|d| d.insert_task(task))
            }
            fn load_task(&self, id: Uuid) -> Result<ApplicationTask> {
                self.read(|d| d.tasks.get(&id).cloned().ok_or_else(|| not_found("task", id)))
            }
            fn save_task(&self, task: &ApplicationTask) -> Result<ApplicationTask> {
                self.write(|d| d.save_task(task))
            }
            fn list_tasks(&self, firewall_id: Uuid) -> Result<Vec<ApplicationTask>> {
                self.read(|d| Ok(d.sorted_tasks(|t| t.firewall_id == firewall_id)))
            }
            fn list_active_tasks(&self) -> Result<Vec<ApplicationTask>> {
                self.read(|d| Ok(d.sorted_tasks(|t| t.state.is_active())))
            }
        }
    };
}

mod file;

pub use file::JsonFileStore;

/// Reload attempts before a [`Error::ConcurrencyConflict`] is surfaced
const MAX_CONFLICT_RETRIES: usize = 8;

/// Loads the firewall, applies `f` and saves it, reloading on conflicts.
///
/// `f` runs once per attempt against a fresh copy, so it must not depend on
/// state captured from a previous attempt.
pub fn update_firewall<S, F>(store: &S, id: Uuid, mut f: F) -> Result<Firewall>
where
    S: Store + ?Sized,
    F: FnMut(&mut Firewall) -> Result<()>,
{
    let mut attempt = 0;
    loop {
        let mut firewall = store.load_firewall(id)?;
        f(&mut firewall)?;
        match store.save_firewall(&firewall) {
            Err(Error::ConcurrencyConflict { .. }) if attempt < MAX_CONFLICT_RETRIES => {
                attempt += 1;
                tracing::debug!(firewall = %id, attempt, "Firewall save conflicted, reloading");
            }
            other => return other,
        }
    }
}

/// Policy counterpart of [`update_firewall`].
pub fn update_policy<S, F>(store: &S, id: Uuid, mut f: F) -> Result<FilteringPolicy>
where
    S: Store + ?Sized,
    F: FnMut(&mut FilteringPolicy) -> Result<()>,
{
    let mut attempt = 0;
    loop {
        let mut policy = store.load_policy(id)?;
        f(&mut policy)?;
        match store.save_policy(&policy) {
            Err(Error::ConcurrencyConflict { .. }) if attempt < MAX_CONFLICT_RETRIES => {
                attempt += 1;
                tracing::debug!(policy = %id, attempt, "Policy save conflicted, reloading");
            }
            other => return other,
        }
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<StoreData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&StoreData) -> Result<T>) -> Result<T> {
        let data = self
            .data
            .lock()
            .map_err(|_| Error::Internal("store mutex poisoned".to_string()))?;
        f(&data)
    }

    fn write<T>(&self, f: impl FnOnce(&mut StoreData) -> Result<T>) -> Result<T> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| Error::Internal("store mutex poisoned".to_string()))?;
        f(&mut data)
    }
}

impl_store!(MemoryStore);
