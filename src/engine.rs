//! Use-case layer
//!
//! The operations an API front end would call: firewall and policy CRUD,
//! rule edits, analysis, compilation, submission and status queries. Every
//! mutation takes the caller's [`Principal`] and is audited. Edits reload and
//! retry on [`Error::ConcurrencyConflict`]; validation failures never reach
//! the store.

use crate::audit::{Auditor, EventType};
use crate::config::AppConfig;
use crate::core::analyze::ConflictReport;
use crate::core::compile::{CompiledPolicy, check_policy, compile};
use crate::core::error::{Error, Result};
use crate::core::model::{
    DefaultAction, Environment, FilteringPolicy, Firewall, MAX_RULES, PolicyStatus, PolicyVersion,
    Principal, Rule,
};
use crate::core::validate::validate;
use crate::orchestrator::Orchestrator;
use crate::orchestrator::queue::{MemoryQueue, TaskQueue};
use crate::orchestrator::target::ApplyTarget;
use crate::orchestrator::task::ApplicationTask;
use crate::store::{Store, update_policy};
use crate::validators;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Attempts at claiming the next version number when compiles race
const MAX_VERSION_CLAIMS: usize = 8;

/// Firewall record with the task most relevant to it
#[derive(Debug, Clone, Serialize)]
pub struct FirewallStatus {
    pub firewall: Firewall,
    /// Oldest unfinished task, if any
    pub active_task: Option<ApplicationTask>,
    /// Most recently created task
    pub last_task: Option<ApplicationTask>,
}

pub struct Engine<T, Q = MemoryQueue> {
    orchestrator: Orchestrator<T, Q>,
    auditor: Auditor,
}

impl<T, Q> Clone for Engine<T, Q> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: self.orchestrator.clone(),
            auditor: self.auditor.clone(),
        }
    }
}

impl<T: ApplyTarget> Engine<T, MemoryQueue> {
    /// Engine over `store` with an in-process queue.
    pub fn with_store(store: Arc<dyn Store>, target: T, config: AppConfig, auditor: Auditor) -> Self {
        let orchestrator =
            Orchestrator::with_memory_queue(store, target, config, auditor.clone());
        Self::new(orchestrator, auditor)
    }
}

impl<T: ApplyTarget, Q: TaskQueue> Engine<T, Q> {
    pub fn new(orchestrator: Orchestrator<T, Q>, auditor: Auditor) -> Self {
        Self {
            orchestrator,
            auditor,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator<T, Q> {
        &self.orchestrator
    }

    fn store(&self) -> &dyn Store {
        self.orchestrator.store()
    }

    // ── Firewalls ────────────────────────────────────────────────────

    pub async fn create_firewall(
        &self,
        principal: &Principal,
        name: &str,
        environment: Environment,
        scope: &str,
        description: Option<&str>,
    ) -> Result<Firewall> {
        let name = validators::validate_name(name).map_err(|m| Error::validation("name", m))?;
        let scope = validators::validate_scope(scope).map_err(|m| Error::validation("scope", m))?;
        let description = validators::validate_description(description)
            .map_err(|m| Error::validation("description", m))?;

        let mut firewall = Firewall::new(name, environment, scope);
        firewall.description = description;
        let firewall = self.store().insert_firewall(&firewall)?;

        info!(firewall = %firewall.name, id = %firewall.id, "Firewall created");
        self.auditor
            .record(
                EventType::CreateFirewall,
                principal,
                true,
                json!({ "firewall": firewall.id, "name": firewall.name, "environment": firewall.environment }),
                None,
            )
            .await;
        Ok(firewall)
    }

    /// Deletes a firewall with its policies and history.
    ///
    /// # Errors
    ///
    /// `Validation` while an application task is unfinished.
    pub async fn delete_firewall(&self, principal: &Principal, id: Uuid) -> Result<()> {
        let firewall = self.store().load_firewall(id)?;
        if self.store().list_tasks(id)?.iter().any(|t| t.state.is_active()) {
            return Err(Error::validation(
                "firewall",
                "an application task is still in progress",
            ));
        }
        self.store().delete_firewall(id)?;

        info!(firewall = %firewall.name, "Firewall deleted");
        self.auditor
            .record(
                EventType::DeleteFirewall,
                principal,
                true,
                json!({ "firewall": id, "name": firewall.name }),
                None,
            )
            .await;
        Ok(())
    }

    pub fn firewall(&self, id: Uuid) -> Result<Firewall> {
        self.store().load_firewall(id)
    }

    pub fn find_firewall(&self, name: &str) -> Result<Option<Firewall>> {
        self.store().find_firewall_by_name(name)
    }

    pub fn list_firewalls(&self) -> Result<Vec<Firewall>> {
        self.store().list_firewalls()
    }

    pub fn firewall_status(&self, id: Uuid) -> Result<FirewallStatus> {
        let firewall = self.store().load_firewall(id)?;
        let tasks = self.store().list_tasks(id)?;
        Ok(FirewallStatus {
            firewall,
            active_task: tasks.iter().find(|t| t.state.is_active()).cloned(),
            last_task: tasks.last().cloned(),
        })
    }

    // ── Policies ─────────────────────────────────────────────────────

    pub async fn create_policy(
        &self,
        principal: &Principal,
        firewall_id: Uuid,
        name: &str,
        default_action: DefaultAction,
        description: Option<&str>,
    ) -> Result<FilteringPolicy> {
        let name = validators::validate_name(name).map_err(|m| Error::validation("name", m))?;
        let description = validators::validate_description(description)
            .map_err(|m| Error::validation("description", m))?;

        let mut policy = FilteringPolicy::new(firewall_id, name, default_action);
        policy.description = description;
        let policy = self.store().insert_policy(&policy)?;

        info!(policy = %policy.name, id = %policy.id, "Policy created");
        self.auditor
            .record(
                EventType::CreatePolicy,
                principal,
                true,
                json!({ "policy": policy.id, "firewall": firewall_id, "name": policy.name }),
                None,
            )
            .await;
        Ok(policy)
    }

    /// Deletes a policy and its compiled versions.
    ///
    /// # Errors
    ///
    /// `Validation` while one of its versions is applied, submitted or in flight.
    pub async fn delete_policy(&self, principal: &Principal, id: Uuid) -> Result<()> {
        let policy = self.store().load_policy(id)?;
        self.store().delete_policy(id)?;

        info!(policy = %policy.name, "Policy deleted");
        self.auditor
            .record(
                EventType::DeletePolicy,
                principal,
                true,
                json!({ "policy": id, "name": policy.name }),
                None,
            )
            .await;
        Ok(())
    }

    pub fn policy(&self, id: Uuid) -> Result<FilteringPolicy> {
        self.store().load_policy(id)
    }

    /// Policies of `firewall_id`, lowest priority value first.
    pub fn policies(&self, firewall_id: Uuid) -> Result<Vec<FilteringPolicy>> {
        self.store().list_policies(firewall_id)
    }

    pub async fn set_default_action(
        &self,
        principal: &Principal,
        policy_id: Uuid,
        default_action: DefaultAction,
    ) -> Result<FilteringPolicy> {
        self.edit_policy(principal, policy_id, json!({ "op": "default", "action": default_action }), |p| {
            p.default_action = default_action;
            Ok(())
        })
        .await
    }

    pub async fn set_policy_priority(
        &self,
        principal: &Principal,
        policy_id: Uuid,
        priority: u32,
    ) -> Result<FilteringPolicy> {
        self.edit_policy(principal, policy_id, json!({ "op": "priority", "priority": priority }), |p| {
            p.priority = priority;
            Ok(())
        })
        .await
    }

    /// Activates or deactivates a policy. Compiled versions stay submittable.
    pub async fn set_policy_status(
        &self,
        principal: &Principal,
        policy_id: Uuid,
        status: PolicyStatus,
    ) -> Result<FilteringPolicy> {
        self.edit_policy(principal, policy_id, json!({ "op": "status", "status": status }), |p| {
            p.status = status;
            Ok(())
        })
        .await
    }

    // ── Rules ────────────────────────────────────────────────────────

    /// Adds `rule` at its position, shifting later rules down.
    ///
    /// # Errors
    ///
    /// `InvalidRule` with every violation when the rule does not validate,
    /// `Validation` when the policy is full or the id is taken.
    pub async fn add_rule(&self, principal: &Principal, policy_id: Uuid, rule: Rule) -> Result<FilteringPolicy> {
        validate(&rule)?;
        let rule_id = rule.id;
        self.edit_policy(principal, policy_id, json!({ "op": "add", "rule": rule_id }), |p| {
            if p.rules.len() >= MAX_RULES {
                return Err(Error::validation(
                    "rules",
                    format!("policy already has {MAX_RULES} rules"),
                ));
            }
            if p.rules.iter().any(|r| r.id == rule_id) {
                return Err(Error::validation("rule", format!("rule {rule_id} already exists")));
            }
            p.insert_rule(rule.clone());
            Ok(())
        })
        .await
    }

    /// Replaces the match criteria, action and label of an existing rule.
    /// Position and creation time are kept.
    pub async fn update_rule(&self, principal: &Principal, policy_id: Uuid, rule: Rule) -> Result<FilteringPolicy> {
        validate(&rule)?;
        let rule_id = rule.id;
        self.edit_policy(principal, policy_id, json!({ "op": "update", "rule": rule_id }), |p| {
            let existing = find_rule(p, rule_id)?;
            *existing = Rule {
                position: existing.position,
                created_at: existing.created_at,
                ..rule.clone()
            };
            Ok(())
        })
        .await
    }

    pub async fn remove_rule(&self, principal: &Principal, policy_id: Uuid, rule_id: Uuid) -> Result<FilteringPolicy> {
        self.edit_policy(principal, policy_id, json!({ "op": "remove", "rule": rule_id }), |p| {
            p.remove_rule(rule_id)
                .map(|_| ())
                .ok_or_else(|| Error::NotFound { entity: "rule", id: rule_id })
        })
        .await
    }

    /// Moves a rule to `position` (1-based, clamped to the end).
    pub async fn move_rule(
        &self,
        principal: &Principal,
        policy_id: Uuid,
        rule_id: Uuid,
        position: u32,
    ) -> Result<FilteringPolicy> {
        if position == 0 {
            return Err(Error::validation("position", "positions start at 1"));
        }
        self.edit_policy(
            principal,
            policy_id,
            json!({ "op": "move", "rule": rule_id, "position": position }),
            |p| {
                if p.move_rule(rule_id, position) {
                    Ok(())
                } else {
                    Err(Error::NotFound { entity: "rule", id: rule_id })
                }
            },
        )
        .await
    }

    pub async fn toggle_rule(
        &self,
        principal: &Principal,
        policy_id: Uuid,
        rule_id: Uuid,
        enabled: bool,
    ) -> Result<FilteringPolicy> {
        self.edit_policy(
            principal,
            policy_id,
            json!({ "op": "toggle", "rule": rule_id, "enabled": enabled }),
            |p| {
                find_rule(p, rule_id)?.enabled = enabled;
                Ok(())
            },
        )
        .await
    }

    /// Replaces every rule and the default action in one edit.
    ///
    /// The new rule set is checked as a whole first (positions and every
    /// enabled rule), so a bad import leaves the stored policy untouched.
    ///
    /// # Errors
    ///
    /// `Compile` with kind `InvalidRule` listing every problem found.
    pub async fn replace_rules(
        &self,
        principal: &Principal,
        policy_id: Uuid,
        default_action: DefaultAction,
        rules: Vec<Rule>,
    ) -> Result<FilteringPolicy> {
        let mut candidate = self.store().load_policy(policy_id)?;
        candidate.rules.clone_from(&rules);
        candidate.default_action = default_action;
        check_policy(&candidate)?;

        let count = rules.len();
        self.edit_policy(
            principal,
            policy_id,
            json!({ "op": "replace", "rules": count, "default_action": default_action }),
            |p| {
                p.rules.clone_from(&rules);
                p.default_action = default_action;
                Ok(())
            },
        )
        .await
    }

    async fn edit_policy<F>(
        &self,
        principal: &Principal,
        policy_id: Uuid,
        details: serde_json::Value,
        edit: F,
    ) -> Result<FilteringPolicy>
    where
        F: FnMut(&mut FilteringPolicy) -> Result<()>,
    {
        let policy = update_policy(self.store(), policy_id, edit)?;
        self.auditor
            .record(
                EventType::EditRule,
                principal,
                true,
                json!({ "policy": policy_id, "revision": policy.revision, "edit": details }),
                None,
            )
            .await;
        Ok(policy)
    }

    // ── Analysis & compilation ───────────────────────────────────────

    /// Validates and analyzes the stored policy without compiling it.
    ///
    /// # Errors
    ///
    /// `Compile` with kind `InvalidRule` when positions or rules are invalid.
    pub fn analyze_policy(&self, policy_id: Uuid) -> Result<ConflictReport> {
        let policy = self.store().load_policy(policy_id)?;
        let (_, report) = check_policy(&policy)?;
        Ok(report)
    }

    /// Compiles the current policy as the next version and stores it.
    ///
    /// # Errors
    ///
    /// `Compile` with every invalid rule or fatal conflict found,
    /// `Validation` when the policy is inactive.
    pub async fn compile_policy(&self, principal: &Principal, policy_id: Uuid) -> Result<CompiledPolicy> {
        let policy = self.store().load_policy(policy_id)?;
        if policy.status == PolicyStatus::Inactive {
            return Err(Error::validation("status", format!("policy '{}' is inactive", policy.name)));
        }
        let mut claims = 0;
        loop {
            let version = self.store().latest_compiled_version(policy_id)?.unwrap_or(0) + 1;
            let compiled = match compile(&policy, version) {
                Ok(c) => c,
                Err(e) => {
                    warn!(policy = %policy.name, "Compile failed: {e}");
                    self.auditor
                        .record(
                            EventType::CompilePolicy,
                            principal,
                            false,
                            json!({ "policy": policy_id, "revision": policy.revision, "kind": e.kind.to_string() }),
                            Some(e.to_string()),
                        )
                        .await;
                    return Err(e.into());
                }
            };
            match self.store().insert_compiled(&compiled) {
                Ok(()) => {
                    self.auditor
                        .record(
                            EventType::CompilePolicy,
                            principal,
                            true,
                            json!({
                                "policy": policy_id,
                                "version": version,
                                "revision": policy.revision,
                                "checksum": compiled.checksum,
                            }),
                            None,
                        )
                        .await;
                    return Ok(compiled);
                }
                // Another compile claimed this version number first
                Err(Error::ConcurrencyConflict { .. }) if claims < MAX_VERSION_CLAIMS => claims += 1,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn compiled(&self, version: PolicyVersion) -> Result<CompiledPolicy> {
        self.store().load_compiled(version)
    }

    pub fn compiled_versions(&self, policy_id: Uuid) -> Result<Vec<u64>> {
        self.store().list_compiled_versions(policy_id)
    }

    // ── Application ──────────────────────────────────────────────────

    /// Submits a compiled version for application. Idempotent per
    /// (firewall, version).
    pub async fn submit(
        &self,
        principal: &Principal,
        firewall_id: Uuid,
        version: PolicyVersion,
    ) -> Result<ApplicationTask> {
        self.orchestrator.apply(firewall_id, version, principal).await
    }

    pub fn task(&self, id: Uuid) -> Result<ApplicationTask> {
        self.store().load_task(id)
    }

    pub fn tasks(&self, firewall_id: Uuid) -> Result<Vec<ApplicationTask>> {
        self.store().list_tasks(firewall_id)
    }
}

fn find_rule(policy: &mut FilteringPolicy, rule_id: Uuid) -> Result<&mut Rule> {
    policy
        .rules
        .iter_mut()
        .find(|r| r.id == rule_id)
        .ok_or(Error::NotFound { entity: "rule", id: rule_id })
}
