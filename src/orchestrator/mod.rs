//! Application orchestrator
//!
//! Moves firewalls to submitted compiled versions through durable
//! [`ApplicationTask`] records.
//!
//! # Flow
//!
//! 1. [`Orchestrator::apply`] inserts a task (idempotent per firewall and
//!    version), marks the firewall `pending-apply` and enqueues the task.
//! 2. A worker dequeues it and calls [`Orchestrator::process`]: obsolete and
//!    deferred tasks are skipped, the firewall lease is taken, and the
//!    instructions go to the target restrictive-first under `apply_timeout`.
//! 3. Success commits the firewall's `applied` pointer before the task is
//!    marked `succeeded`. Transient failures reschedule the task with
//!    backoff and release the lease. Fatal failures and exhausted retries
//!    renew the lease and re-apply the last applied version.
//!
//! Outcomes are committed only while the worker is still the recorded lease
//! holder. A worker whose lease was taken over leaves the firewall alone.
//!
//! Every task transition is saved before the next step runs, so a crash at
//! any point leaves a state [`Orchestrator::recover`] can resume from.

pub mod lease;
pub mod queue;
pub mod retry;
pub mod target;
pub mod task;

use crate::audit::{Auditor, EventType};
use crate::config::AppConfig;
use crate::core::error::{ApplyError, Error, Result};
use crate::core::model::{Firewall, FirewallState, PolicyVersion, Principal};
use crate::core::state::transition;
use crate::store::{Store, TaskInsert, update_firewall};
use chrono::Utc;
use queue::{MemoryQueue, TaskQueue};
use serde_json::json;
use std::sync::Arc;
use target::ApplyTarget;
use task::{ApplicationTask, TaskState};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What one [`Orchestrator::process`] call did with a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Task reached a terminal state in this call
    Finished(TaskState),
    /// Transient failure; the task waits for its next attempt
    Retrying,
    /// Lease held elsewhere or attempt not due yet; requeued without an attempt
    Deferred,
    /// Already terminal or claimed by another worker
    Skipped,
}

struct Inner<T, Q> {
    store: Arc<dyn Store>,
    target: T,
    queue: Q,
    config: AppConfig,
    auditor: Auditor,
}

/// Cloneable handle; clones share the store, target and queue.
pub struct Orchestrator<T, Q = MemoryQueue> {
    inner: Arc<Inner<T, Q>>,
}

impl<T, Q> Clone for Orchestrator<T, Q> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: ApplyTarget> Orchestrator<T, MemoryQueue> {
    pub fn with_memory_queue(
        store: Arc<dyn Store>,
        target: T,
        config: AppConfig,
        auditor: Auditor,
    ) -> Self {
        Self::new(store, target, MemoryQueue::new(), config, auditor)
    }
}

impl<T: ApplyTarget, Q: TaskQueue> Orchestrator<T, Q> {
    pub fn new(store: Arc<dyn Store>, target: T, queue: Q, config: AppConfig, auditor: Auditor) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                target,
                queue,
                config: config.clamped(),
                auditor,
            }),
        }
    }

    pub fn store(&self) -> &dyn Store {
        self.inner.store.as_ref()
    }

    pub fn target(&self) -> &T {
        &self.inner.target
    }

    pub fn queue(&self) -> &Q {
        &self.inner.queue
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    /// Submits `version` for application on `firewall_id`.
    ///
    /// Submitting the same (firewall, version) again while a task is active,
    /// or after it succeeded and nothing newer was submitted, returns the
    /// existing task instead of creating another.
    ///
    /// # Errors
    ///
    /// `NotFound` when the firewall or compiled version does not exist,
    /// `Validation` when the version belongs to another firewall.
    pub async fn apply(
        &self,
        firewall_id: Uuid,
        version: PolicyVersion,
        principal: &Principal,
    ) -> Result<ApplicationTask> {
        let store = self.store();
        let compiled = store.load_compiled(version)?;
        if compiled.firewall_id != firewall_id {
            return Err(Error::validation(
                "version",
                format!("{version} was compiled for another firewall"),
            ));
        }

        let inserted = store.insert_task(&ApplicationTask::new(firewall_id, version, principal.clone()))?;
        let task = match inserted {
            TaskInsert::Existing(task) => {
                debug!(task = %task.id, state = %task.state, "Submission already known");
                return Ok(task);
            }
            TaskInsert::Inserted(task) => task,
        };

        let firewall = update_firewall(store, firewall_id, |fw| {
            fw.latest_submission = Some(version);
            transition(fw, FirewallState::PendingApply)
        })?;
        self.inner.queue.enqueue(task.id, Utc::now());

        info!(
            firewall = %firewall.name,
            task = %task.id,
            %version,
            "Submitted for application"
        );
        self.inner
            .auditor
            .record(
                EventType::SubmitApply,
                principal,
                true,
                json!({ "firewall": firewall.name, "task": task.id, "version": version.to_string() }),
                None,
            )
            .await;
        Ok(task)
    }

    /// Runs one step of `task_id` as worker `worker`.
    ///
    /// # Errors
    ///
    /// Returns store errors. Target failures are recorded on the task, not returned.
    pub async fn process(&self, task_id: Uuid, worker: Uuid) -> Result<Step> {
        let store = self.store();
        let config = &self.inner.config;
        let mut task = store.load_task(task_id)?;
        if task.state.is_terminal() {
            return Ok(Step::Skipped);
        }
        let now = Utc::now();
        if let Some(at) = task.next_attempt_at.filter(|_| task.is_deferred(now)) {
            self.inner.queue.enqueue(task.id, at);
            return Ok(Step::Deferred);
        }

        let firewall = store.load_firewall(task.firewall_id)?;
        if firewall.latest_submission != Some(task.target) {
            return self.mark_obsolete(task);
        }

        let Some(firewall) = lease::acquire(store, firewall.id, worker, config.lease_ttl())? else {
            // Lease waits do not count as attempts
            let at = Utc::now()
                + chrono::Duration::from_std(config.lease_retry_delay()).unwrap_or_default();
            self.inner.queue.enqueue(task.id, at);
            return Ok(Step::Deferred);
        };
        // A submission may have landed while the lease was being taken
        if firewall.latest_submission != Some(task.target) {
            lease::release(store, firewall.id, worker)?;
            return self.mark_obsolete(task);
        }

        task.attempts += 1;
        task.next_attempt_at = None;
        task.set_state(TaskState::Running);
        let task = match store.save_task(&task) {
            Ok(saved) => saved,
            Err(Error::ConcurrencyConflict { .. }) => {
                lease::release(store, firewall.id, worker)?;
                return Ok(Step::Skipped);
            }
            Err(e) => return Err(e),
        };
        info!(
            firewall = %firewall.name,
            task = %task.id,
            attempt = task.attempts,
            "Applying {}",
            task.target
        );

        match self.deliver(&firewall, task.target).await {
            Ok(()) => self.succeed(task, worker).await,
            Err(e) if e.is_transient() && retry::should_retry(task.attempts, &config.retry) => {
                self.schedule_retry(task, &firewall, worker, &e).await
            }
            Err(e) => self.fail(task, &firewall, worker, &e).await,
        }
    }

    /// The lease was taken over mid-attempt, so this worker records nothing
    /// on the firewall. The new holder is either driving this same task or a
    /// newer submission.
    fn lease_lost(&self, task: ApplicationTask) -> Result<Step> {
        warn!(task = %task.id, firewall = %task.firewall_id, "Lease lost during apply");
        let firewall = self.store().load_firewall(task.firewall_id)?;
        if firewall.latest_submission != Some(task.target) {
            return self.mark_obsolete(task);
        }
        Ok(Step::Skipped)
    }

    fn mark_obsolete(&self, mut task: ApplicationTask) -> Result<Step> {
        info!(task = %task.id, version = %task.target, "Superseded by a newer submission");
        task.next_attempt_at = None;
        task.set_state(TaskState::Obsolete);
        match self.store().save_task(&task) {
            Ok(_) => Ok(Step::Finished(TaskState::Obsolete)),
            Err(Error::ConcurrencyConflict { .. }) => Ok(Step::Skipped),
            Err(e) => Err(e),
        }
    }

    /// Sends the instructions of `version` to the target in delivery order.
    async fn deliver(&self, firewall: &Firewall, version: PolicyVersion) -> std::result::Result<(), ApplyError> {
        let compiled = self
            .store()
            .load_compiled(version)
            .map_err(|e| ApplyError::Transient(e.to_string()))?;
        if !compiled.verify_checksum() {
            return Err(ApplyError::Fatal(format!("checksum mismatch for {version}")));
        }
        let instructions = compiled.delivery_order();
        let timeout = self.inner.config.apply_timeout();
        tokio::time::timeout(
            timeout,
            self.inner.target.apply_instructions(firewall, &instructions),
        )
        .await
        .unwrap_or_else(|_| {
            Err(ApplyError::Transient(format!(
                "target timed out after {}s",
                timeout.as_secs()
            )))
        })
    }

    async fn succeed(&self, mut task: ApplicationTask, worker: Uuid) -> Result<Step> {
        let store = self.store();
        let target = task.target;
        let committed = update_firewall(store, task.firewall_id, |fw| {
            lease::ensure_held(fw, worker)?;
            fw.applied = Some(target);
            if fw.latest_submission == Some(target) {
                transition(fw, FirewallState::Applied)?;
            }
            lease::clear(fw, worker);
            Ok(())
        });
        let firewall = match committed {
            Ok(fw) => fw,
            Err(e) if lease::is_lost(&e) => return self.lease_lost(task),
            Err(e) => return Err(e),
        };

        task.last_error = None;
        task.set_state(TaskState::Succeeded);
        store.save_task(&task)?;

        info!(firewall = %firewall.name, task = %task.id, "Applied {target}");
        self.inner
            .auditor
            .record(
                EventType::ApplySucceeded,
                &Principal::system(),
                true,
                json!({
                    "firewall": firewall.name,
                    "task": task.id,
                    "version": target.to_string(),
                    "attempts": task.attempts,
                    "requested_by": task.principal,
                }),
                None,
            )
            .await;
        Ok(Step::Finished(TaskState::Succeeded))
    }

    async fn schedule_retry(
        &self,
        mut task: ApplicationTask,
        firewall: &Firewall,
        worker: Uuid,
        cause: &ApplyError,
    ) -> Result<Step> {
        let store = self.store();
        let delay = retry::backoff(task.attempts, &self.inner.config.retry);
        let at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();

        task.last_error = Some(cause.message().to_string());
        task.next_attempt_at = Some(at);
        task.set_state(TaskState::Retrying);
        let task = store.save_task(&task)?;
        lease::release(store, firewall.id, worker)?;
        self.inner.queue.enqueue(task.id, at);

        warn!(
            firewall = %firewall.name,
            task = %task.id,
            attempt = task.attempts,
            "Transient failure, retrying in {}ms: {}",
            delay.as_millis(),
            cause.message()
        );
        self.inner
            .auditor
            .record(
                EventType::ApplyRetry,
                &Principal::system(),
                false,
                json!({
                    "firewall": firewall.name,
                    "task": task.id,
                    "attempt": task.attempts,
                    "next_attempt_at": at,
                }),
                Some(cause.message().to_string()),
            )
            .await;
        Ok(Step::Retrying)
    }

    /// Marks the task failed and restores the previously applied version.
    async fn fail(
        &self,
        mut task: ApplicationTask,
        firewall: &Firewall,
        worker: Uuid,
        cause: &ApplyError,
    ) -> Result<Step> {
        let store = self.store();
        error!(
            firewall = %firewall.name,
            task = %task.id,
            attempts = task.attempts,
            "Application failed: {}",
            cause.message()
        );

        // Re-applied even when it equals the failed target: the attempt may
        // have left the target half-written.
        let previous = firewall.applied;
        let restored = match previous {
            Some(prev) => {
                let firewall = match lease::renew(store, firewall.id, worker, self.inner.config.lease_ttl()) {
                    Ok(fw) => fw,
                    Err(e) if lease::is_lost(&e) => return self.lease_lost(task),
                    Err(e) => return Err(e),
                };
                info!(firewall = %firewall.name, "Rolling back to {prev}");
                match self.deliver(&firewall, prev).await {
                    Ok(()) => true,
                    Err(e) => {
                        error!(firewall = %firewall.name, "Rollback to {prev} failed: {}", e.message());
                        self.inner
                            .auditor
                            .record(
                                EventType::Rollback,
                                &Principal::system(),
                                false,
                                json!({ "firewall": firewall.name, "task": task.id, "version": prev.to_string() }),
                                Some(e.message().to_string()),
                            )
                            .await;
                        false
                    }
                }
            }
            None => {
                warn!(firewall = %firewall.name, "No previous version to roll back to");
                false
            }
        };

        let target = task.target;
        let committed = update_firewall(store, firewall.id, |fw| {
            lease::ensure_held(fw, worker)?;
            if fw.latest_submission == Some(target) {
                let to = if restored {
                    FirewallState::RolledBack
                } else {
                    FirewallState::Failed
                };
                transition(fw, to)?;
            }
            lease::clear(fw, worker);
            Ok(())
        });
        let saved = match committed {
            Ok(fw) => fw,
            Err(e) if lease::is_lost(&e) => return self.lease_lost(task),
            Err(e) => return Err(e),
        };

        task.last_error = Some(cause.message().to_string());
        task.next_attempt_at = None;
        task.rolled_back = restored;
        task.set_state(TaskState::Failed);
        store.save_task(&task)?;

        self.inner
            .auditor
            .record(
                EventType::ApplyFailed,
                &Principal::system(),
                false,
                json!({
                    "firewall": saved.name,
                    "task": task.id,
                    "version": target.to_string(),
                    "attempts": task.attempts,
                    "requested_by": task.principal,
                }),
                Some(cause.message().to_string()),
            )
            .await;
        if let (true, Some(prev)) = (restored, previous) {
            info!(firewall = %saved.name, "Rolled back to {prev}");
            self.inner
                .auditor
                .record(
                    EventType::Rollback,
                    &Principal::system(),
                    true,
                    json!({ "firewall": saved.name, "task": task.id, "version": prev.to_string() }),
                    None,
                )
                .await;
        }
        Ok(Step::Finished(TaskState::Failed))
    }

    /// Re-enqueues every unfinished task, typically after a restart.
    ///
    /// Running tasks are included; [`Self::process`] waits for their lease
    /// to expire before taking them over.
    pub fn recover(&self) -> Result<usize> {
        let now = Utc::now();
        let active = self.store().list_active_tasks()?;
        for task in &active {
            let at = task.next_attempt_at.map_or(now, |at| at.max(now));
            self.inner.queue.enqueue(task.id, at);
        }
        if !active.is_empty() {
            info!("Recovered {} unfinished task(s)", active.len());
        }
        Ok(active.len())
    }

    /// Spawns `count` workers that process queued tasks until `cancel` fires.
    pub fn spawn_workers(&self, count: usize, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        (0..count.max(1))
            .map(|n| {
                let orchestrator = self.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { orchestrator.worker_loop(n, cancel).await })
            })
            .collect()
    }

    async fn worker_loop(self, n: usize, cancel: CancellationToken) {
        // Lease owner token for this worker
        let worker = Uuid::new_v4();
        debug!(worker = n, token = %worker, "Worker started");
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                task_id = self.inner.queue.dequeue() => {
                    match self.process(task_id, worker).await {
                        Ok(step) => debug!(worker = n, task = %task_id, ?step, "Step done"),
                        Err(e) => {
                            error!(worker = n, task = %task_id, "Processing failed: {e}");
                            // Store hiccup: try again later rather than dropping the task
                            let at = Utc::now()
                                + chrono::Duration::from_std(self.inner.config.lease_retry_delay())
                                    .unwrap_or_default();
                            if !matches!(e, Error::NotFound { .. }) {
                                self.inner.queue.enqueue(task_id, at);
                            }
                        }
                    }
                }
            }
        }
        debug!(worker = n, "Worker stopped");
    }

    /// Polls `task_id` until it is terminal or `timeout` elapses.
    pub async fn wait_for(&self, task_id: Uuid, timeout: std::time::Duration) -> Result<ApplicationTask> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let task = self.store().load_task(task_id)?;
            if task.state.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(task);
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::compile::{CompiledPolicy, Instruction, compile};
    use crate::core::model::{Action, DefaultAction, Environment, FilteringPolicy, Lease, Protocol, Rule};
    use crate::store::MemoryStore;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Target that answers from a script and records every call
    #[derive(Default)]
    struct ScriptedTarget {
        script: Mutex<VecDeque<std::result::Result<(), ApplyError>>>,
        calls: Mutex<Vec<Vec<Instruction>>>,
    }

    impl ScriptedTarget {
        fn with(script: Vec<std::result::Result<(), ApplyError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::default(),
            }
        }

        fn calls(&self) -> Vec<Vec<Instruction>> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ApplyTarget for ScriptedTarget {
        async fn apply_instructions(
            &self,
            _firewall: &Firewall,
            instructions: &[Instruction],
        ) -> std::result::Result<(), ApplyError> {
            self.calls.lock().unwrap().push(instructions.to_vec());
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    fn fast_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.retry.initial_backoff_ms = 1;
        config.retry.max_backoff_ms = 5;
        config.lease_retry_delay_ms = 10;
        config
    }

    struct Fixture {
        orchestrator: Orchestrator<Arc<ScriptedTarget>>,
        target: Arc<ScriptedTarget>,
        firewall: Firewall,
        policy: FilteringPolicy,
    }

    fn fixture(script: Vec<std::result::Result<(), ApplyError>>) -> Fixture {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let firewall = store
            .insert_firewall(&Firewall::new("edge", Environment::Production, ""))
            .unwrap();
        let mut policy = FilteringPolicy::new(firewall.id, "web", DefaultAction::Deny);
        policy.insert_rule(
            Rule::new(1, Protocol::Tcp, Action::Allow)
                .with_destination_ports([crate::core::model::PortRange::single(443)]),
        );
        let policy = store.insert_policy(&policy).unwrap();
        let target = Arc::new(ScriptedTarget::with(script));
        let orchestrator = Orchestrator::with_memory_queue(
            store,
            Arc::clone(&target),
            fast_config(),
            Auditor::disabled(),
        );
        Fixture {
            orchestrator,
            target,
            firewall,
            policy,
        }
    }

    fn publish(fx: &Fixture, version: u64) -> CompiledPolicy {
        let compiled = compile(&fx.policy, version).unwrap();
        fx.orchestrator.store().insert_compiled(&compiled).unwrap();
        compiled
    }

    /// Processes queued entries until the task is terminal.
    async fn drive(fx: &Fixture, task_id: Uuid) -> ApplicationTask {
        drive_with(&fx.orchestrator, task_id).await
    }

    async fn drive_with<T: ApplyTarget>(orchestrator: &Orchestrator<T>, task_id: Uuid) -> ApplicationTask {
        let worker = Uuid::new_v4();
        for _ in 0..200 {
            let id = tokio::time::timeout(Duration::from_secs(2), orchestrator.queue().dequeue())
                .await
                .unwrap();
            orchestrator.process(id, worker).await.unwrap();
            let task = orchestrator.store().load_task(task_id).unwrap();
            if task.state.is_terminal() {
                return task;
            }
        }
        panic!("task {task_id} did not finish");
    }

    #[tokio::test]
    async fn test_successful_apply_commits_pointer() {
        let fx = fixture(vec![]);
        let v1 = publish(&fx, 1).version;
        let task = fx
            .orchestrator
            .apply(fx.firewall.id, v1, &Principal::new("ops"))
            .await
            .unwrap();
        assert_eq!(
            fx.orchestrator.store().load_firewall(fx.firewall.id).unwrap().state,
            FirewallState::PendingApply
        );

        let done = drive(&fx, task.id).await;
        assert_eq!(done.state, TaskState::Succeeded);
        assert_eq!(done.attempts, 1);

        let fw = fx.orchestrator.store().load_firewall(fx.firewall.id).unwrap();
        assert_eq!(fw.applied, Some(v1));
        assert_eq!(fw.state, FirewallState::Applied);
        assert!(fw.lease.is_none());
    }

    #[tokio::test]
    async fn test_delivery_is_restrictive_first() {
        let fx = fixture(vec![]);
        let v1 = publish(&fx, 1).version;
        let task = fx.orchestrator.apply(fx.firewall.id, v1, &Principal::system()).await.unwrap();
        drive(&fx, task.id).await;

        let calls = fx.target.calls();
        assert_eq!(calls.len(), 1);
        // deny catch-all (position 2) goes out before the allow at position 1
        assert_eq!(calls[0][0].action, Action::Deny);
        assert_eq!(calls[0][0].position, 2);
        assert_eq!(calls[0][1].position, 1);
    }

    #[tokio::test]
    async fn test_resubmit_returns_same_task() {
        let fx = fixture(vec![]);
        let v1 = publish(&fx, 1).version;
        let a = fx.orchestrator.apply(fx.firewall.id, v1, &Principal::new("a")).await.unwrap();
        let b = fx.orchestrator.apply(fx.firewall.id, v1, &Principal::new("b")).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(fx.orchestrator.queue().len(), 1);

        let done = drive(&fx, a.id).await;
        let c = fx.orchestrator.apply(fx.firewall.id, v1, &Principal::new("c")).await.unwrap();
        assert_eq!(c.id, done.id);
        assert_eq!(c.state, TaskState::Succeeded);
        assert_eq!(fx.target.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_retry_with_backoff() {
        let fx = fixture(vec![
            Err(ApplyError::Transient("busy".into())),
            Err(ApplyError::Transient("busy".into())),
        ]);
        let v1 = publish(&fx, 1).version;
        let task = fx.orchestrator.apply(fx.firewall.id, v1, &Principal::system()).await.unwrap();

        let done = drive(&fx, task.id).await;
        assert_eq!(done.state, TaskState::Succeeded);
        assert_eq!(done.attempts, 3);
        assert_eq!(fx.target.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_without_previous_version() {
        let fx = fixture((0..5).map(|_| Err(ApplyError::Transient("down".into()))).collect());
        let v1 = publish(&fx, 1).version;
        let task = fx.orchestrator.apply(fx.firewall.id, v1, &Principal::system()).await.unwrap();

        let done = drive(&fx, task.id).await;
        assert_eq!(done.state, TaskState::Failed);
        assert_eq!(done.attempts, 5);
        assert_eq!(done.last_error.as_deref(), Some("down"));
        assert!(!done.rolled_back);

        let fw = fx.orchestrator.store().load_firewall(fx.firewall.id).unwrap();
        assert_eq!(fw.state, FirewallState::Failed);
        assert_eq!(fw.applied, None);
    }

    #[tokio::test]
    async fn test_fatal_failure_rolls_back_to_previous_version() {
        let fx = fixture(vec![Ok(()), Err(ApplyError::Fatal("syntax error".into()))]);
        let v1 = publish(&fx, 1).version;
        let first = fx.orchestrator.apply(fx.firewall.id, v1, &Principal::system()).await.unwrap();
        drive(&fx, first.id).await;

        let v2 = publish(&fx, 2).version;
        let second = fx.orchestrator.apply(fx.firewall.id, v2, &Principal::system()).await.unwrap();
        let done = drive(&fx, second.id).await;

        assert_eq!(done.state, TaskState::Failed);
        assert_eq!(done.attempts, 1);
        assert!(done.rolled_back);
        let fw = fx.orchestrator.store().load_firewall(fx.firewall.id).unwrap();
        assert_eq!(fw.applied, Some(v1));
        assert_eq!(fw.state, FirewallState::RolledBack);
        // v1, failed v2, v1 again
        assert_eq!(fx.target.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_newer_submission_obsoletes_queued_task() {
        let fx = fixture(vec![]);
        let v1 = publish(&fx, 1).version;
        let v2 = publish(&fx, 2).version;
        let old = fx.orchestrator.apply(fx.firewall.id, v1, &Principal::system()).await.unwrap();
        let new = fx.orchestrator.apply(fx.firewall.id, v2, &Principal::system()).await.unwrap();

        let worker = Uuid::new_v4();
        assert_eq!(
            fx.orchestrator.process(old.id, worker).await.unwrap(),
            Step::Finished(TaskState::Obsolete)
        );
        assert_eq!(
            fx.orchestrator.process(new.id, worker).await.unwrap(),
            Step::Finished(TaskState::Succeeded)
        );
        assert_eq!(fx.target.calls().len(), 1);
        assert_eq!(
            fx.orchestrator.store().load_firewall(fx.firewall.id).unwrap().applied,
            Some(v2)
        );
    }

    #[tokio::test]
    async fn test_lease_held_elsewhere_defers_without_attempt() {
        let fx = fixture(vec![]);
        let v1 = publish(&fx, 1).version;
        let task = fx.orchestrator.apply(fx.firewall.id, v1, &Principal::system()).await.unwrap();
        let other = Uuid::new_v4();
        lease::acquire(fx.orchestrator.store(), fx.firewall.id, other, Duration::from_secs(60))
            .unwrap()
            .unwrap();

        let step = fx.orchestrator.process(task.id, Uuid::new_v4()).await.unwrap();
        assert_eq!(step, Step::Deferred);
        assert_eq!(fx.orchestrator.store().load_task(task.id).unwrap().attempts, 0);
        assert!(fx.target.calls().is_empty());
    }

    #[tokio::test]
    async fn test_slow_target_times_out_as_transient() {
        struct Stalled;
        impl ApplyTarget for Stalled {
            async fn apply_instructions(
                &self,
                _firewall: &Firewall,
                _instructions: &[Instruction],
            ) -> std::result::Result<(), ApplyError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }

        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let fw = store
            .insert_firewall(&Firewall::new("slow", Environment::Staging, ""))
            .unwrap();
        let policy = store
            .insert_policy(&FilteringPolicy::new(fw.id, "p", DefaultAction::Allow))
            .unwrap();
        let compiled = compile(&policy, 1).unwrap();
        store.insert_compiled(&compiled).unwrap();

        let mut config = fast_config();
        config.apply_timeout_secs = 1;
        let orchestrator = Orchestrator::with_memory_queue(store, Stalled, config, Auditor::disabled());
        let task = orchestrator.apply(fw.id, compiled.version, &Principal::system()).await.unwrap();

        let step = orchestrator.process(task.id, Uuid::new_v4()).await.unwrap();
        assert_eq!(step, Step::Retrying);
        let task = orchestrator.store().load_task(task.id).unwrap();
        assert_eq!(task.state, TaskState::Retrying);
        assert!(task.last_error.unwrap().contains("timed out"));
        assert!(orchestrator.store().load_firewall(fw.id).unwrap().lease.is_none());
    }

    #[tokio::test]
    async fn test_workers_and_recover() {
        let fx = fixture(vec![]);
        let v1 = publish(&fx, 1).version;
        let task = fx.orchestrator.apply(fx.firewall.id, v1, &Principal::system()).await.unwrap();
        // Simulate a restart that lost the in-memory queue
        while !fx.orchestrator.queue().is_empty() {
            fx.orchestrator.queue().dequeue().await;
        }
        assert_eq!(fx.orchestrator.recover().unwrap(), 1);

        let cancel = CancellationToken::new();
        let handles = fx.orchestrator.spawn_workers(2, &cancel);
        let done = fx.orchestrator.wait_for(task.id, Duration::from_secs(5)).await.unwrap();
        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(done.state, TaskState::Succeeded);
    }

    #[tokio::test]
    async fn test_failed_reapply_of_applied_version_restores_it() {
        let fx = fixture(vec![
            Ok(()),
            Err(ApplyError::Fatal("syntax error".into())),
            Ok(()),
            Err(ApplyError::Fatal("syntax error".into())),
            Ok(()),
        ]);
        let c1 = publish(&fx, 1);
        let first = fx.orchestrator.apply(fx.firewall.id, c1.version, &Principal::system()).await.unwrap();
        drive(&fx, first.id).await;
        let v2 = publish(&fx, 2).version;
        let second = fx.orchestrator.apply(fx.firewall.id, v2, &Principal::system()).await.unwrap();
        assert!(drive(&fx, second.id).await.rolled_back);

        // v1 is still the applied version; submitting it again is a new task
        let again = fx.orchestrator.apply(fx.firewall.id, c1.version, &Principal::system()).await.unwrap();
        assert_ne!(again.id, first.id);
        let done = drive(&fx, again.id).await;

        assert_eq!(done.state, TaskState::Failed);
        assert!(done.rolled_back);
        let calls = fx.target.calls();
        assert_eq!(calls.len(), 5);
        assert_eq!(calls[4], c1.delivery_order());
        let fw = fx.orchestrator.store().load_firewall(fx.firewall.id).unwrap();
        assert_eq!(fw.applied, Some(c1.version));
        assert_eq!(fw.state, FirewallState::RolledBack);
        assert!(fw.lease.is_none());
    }

    /// Target that records the lease it sees on every call. With `thief`
    /// set, the first call ends with that owner holding a live lease, as if
    /// this worker's lease had expired mid-call and been taken over.
    struct LeaseWatchingTarget {
        store: Arc<dyn Store>,
        thief: Option<Uuid>,
        script: Mutex<VecDeque<std::result::Result<(), ApplyError>>>,
        seen: Mutex<Vec<Option<Lease>>>,
    }

    impl LeaseWatchingTarget {
        fn new(store: &Arc<dyn Store>, thief: Option<Uuid>, script: Vec<std::result::Result<(), ApplyError>>) -> Self {
            Self {
                store: Arc::clone(store),
                thief,
                script: Mutex::new(script.into()),
                seen: Mutex::default(),
            }
        }

        fn seen(&self) -> Vec<Option<Lease>> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl ApplyTarget for LeaseWatchingTarget {
        async fn apply_instructions(
            &self,
            firewall: &Firewall,
            _instructions: &[Instruction],
        ) -> std::result::Result<(), ApplyError> {
            let lease = self.store.load_firewall(firewall.id).unwrap().lease;
            let first = {
                let mut seen = self.seen.lock().unwrap();
                seen.push(lease);
                seen.len() == 1
            };
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let (true, Some(thief)) = (first, self.thief) {
                update_firewall(&*self.store, firewall.id, |fw| {
                    fw.lease = Some(Lease {
                        owner: thief,
                        expires_at: Utc::now() + chrono::Duration::seconds(60),
                    });
                    Ok(())
                })
                .unwrap();
            }
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    /// Store with one firewall already running `v1` and a compiled `v2`.
    fn running_v1() -> (Arc<dyn Store>, Firewall, PolicyVersion, PolicyVersion) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let fw = store
            .insert_firewall(&Firewall::new("edge", Environment::Production, ""))
            .unwrap();
        let mut policy = store
            .insert_policy(&FilteringPolicy::new(fw.id, "web", DefaultAction::Deny))
            .unwrap();
        let v1 = compile(&policy, 1).unwrap();
        store.insert_compiled(&v1).unwrap();
        policy.insert_rule(Rule::new(1, Protocol::Udp, Action::Allow));
        let v2 = compile(&policy, 2).unwrap();
        store.insert_compiled(&v2).unwrap();
        let fw = update_firewall(&*store, fw.id, |fw| {
            fw.applied = Some(v1.version);
            Ok(())
        })
        .unwrap();
        (store, fw, v1.version, v2.version)
    }

    #[tokio::test]
    async fn test_rollback_runs_under_a_renewed_lease() {
        let (store, fw, v1, v2) = running_v1();
        let target = Arc::new(LeaseWatchingTarget::new(
            &store,
            None,
            vec![Err(ApplyError::Fatal("syntax error".into()))],
        ));
        let orchestrator =
            Orchestrator::with_memory_queue(store, Arc::clone(&target), fast_config(), Auditor::disabled());
        let task = orchestrator.apply(fw.id, v2, &Principal::system()).await.unwrap();

        let done = drive_with(&orchestrator, task.id).await;
        assert_eq!(done.state, TaskState::Failed);
        assert!(done.rolled_back);

        let seen = target.seen();
        assert_eq!(seen.len(), 2);
        let (attempt, rollback) = (seen[0].unwrap(), seen[1].unwrap());
        assert_eq!(attempt.owner, rollback.owner);
        assert!(rollback.expires_at > attempt.expires_at);

        let fw = orchestrator.store().load_firewall(fw.id).unwrap();
        assert_eq!(fw.applied, Some(v1));
        assert_eq!(fw.state, FirewallState::RolledBack);
    }

    #[tokio::test]
    async fn test_success_is_not_committed_after_lease_takeover() {
        let (store, fw, v1, v2) = running_v1();
        let thief = Uuid::new_v4();
        let target = Arc::new(LeaseWatchingTarget::new(&store, Some(thief), vec![]));
        let orchestrator =
            Orchestrator::with_memory_queue(store, Arc::clone(&target), fast_config(), Auditor::disabled());
        let task = orchestrator.apply(fw.id, v2, &Principal::system()).await.unwrap();

        let step = orchestrator.process(task.id, Uuid::new_v4()).await.unwrap();
        assert_eq!(step, Step::Skipped);

        let fw = orchestrator.store().load_firewall(fw.id).unwrap();
        assert_eq!(fw.applied, Some(v1));
        assert_eq!(fw.state, FirewallState::PendingApply);
        assert_eq!(fw.lease.unwrap().owner, thief);
        // Left for the new lease holder to finish
        assert_eq!(orchestrator.store().load_task(task.id).unwrap().state, TaskState::Running);
    }

    #[tokio::test]
    async fn test_no_rollback_after_lease_takeover() {
        let (store, fw, v1, v2) = running_v1();
        let thief = Uuid::new_v4();
        let target = Arc::new(LeaseWatchingTarget::new(
            &store,
            Some(thief),
            vec![Err(ApplyError::Fatal("syntax error".into()))],
        ));
        let orchestrator =
            Orchestrator::with_memory_queue(store, Arc::clone(&target), fast_config(), Auditor::disabled());
        let task = orchestrator.apply(fw.id, v2, &Principal::system()).await.unwrap();

        let step = orchestrator.process(task.id, Uuid::new_v4()).await.unwrap();
        assert_eq!(step, Step::Skipped);
        // Only the failed attempt reached the target
        assert_eq!(target.seen().len(), 1);

        let fw = orchestrator.store().load_firewall(fw.id).unwrap();
        assert_eq!(fw.applied, Some(v1));
        assert_eq!(fw.state, FirewallState::PendingApply);
        assert_eq!(fw.lease.unwrap().owner, thief);
    }

    #[tokio::test]
    async fn test_expired_running_task_is_taken_over_after_recover() {
        let fx = fixture(vec![]);
        let v1 = publish(&fx, 1).version;
        let task = fx.orchestrator.apply(fx.firewall.id, v1, &Principal::system()).await.unwrap();

        // A worker took the task and died mid-attempt
        let dead = Uuid::new_v4();
        lease::acquire(fx.orchestrator.store(), fx.firewall.id, dead, Duration::from_millis(300))
            .unwrap()
            .unwrap();
        let mut running = fx.orchestrator.store().load_task(task.id).unwrap();
        running.attempts = 1;
        running.set_state(TaskState::Running);
        fx.orchestrator.store().save_task(&running).unwrap();

        // Restart: fresh queue over the same store
        let restarted = Orchestrator::with_memory_queue(
            Arc::clone(&fx.orchestrator.inner.store),
            Arc::clone(&fx.target),
            fast_config(),
            Auditor::disabled(),
        );
        assert_eq!(restarted.recover().unwrap(), 1);

        let step = restarted.process(task.id, Uuid::new_v4()).await.unwrap();
        assert_eq!(step, Step::Deferred);
        assert_eq!(restarted.store().load_task(task.id).unwrap().attempts, 1);
        assert!(fx.target.calls().is_empty());

        let done = drive_with(&restarted, task.id).await;
        assert_eq!(done.state, TaskState::Succeeded);
        assert_eq!(done.attempts, 2);
        assert_eq!(fx.target.calls().len(), 1);
        let fw = restarted.store().load_firewall(fx.firewall.id).unwrap();
        assert_eq!(fw.applied, Some(v1));
        assert!(fw.lease.is_none());
    }
}
