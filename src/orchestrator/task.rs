//! Durable application task records

use crate::core::model::{PolicyVersion, Principal};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
    /// Waiting for `next_attempt_at` after a transient failure
    Retrying,
    /// Superseded by a newer submission before it ran
    Obsolete,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Obsolete
        )
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

/// Request to bring one firewall to one compiled policy version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationTask {
    pub id: Uuid,
    pub firewall_id: Uuid,
    pub target: PolicyVersion,
    pub state: TaskState,
    /// Attempts started so far (lease waits are not counted)
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Earliest time the next attempt may start
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Set when the task failed and the previous version was restored
    #[serde(default)]
    pub rolled_back: bool,
    pub principal: Principal,
    /// Optimistic-concurrency counter, bumped by the store on every save
    #[serde(default)]
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApplicationTask {
    pub fn new(firewall_id: Uuid, target: PolicyVersion, principal: Principal) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            firewall_id,
            target,
            state: TaskState::Queued,
            attempts: 0,
            last_error: None,
            next_attempt_at: None,
            rolled_back: false,
            principal,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns `true` if the task must wait before its next attempt.
    pub fn is_deferred(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_some_and(|at| at > now)
    }

    pub(crate) fn set_state(&mut self, state: TaskState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<TaskState> = TaskState::iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(
            terminal,
            vec![TaskState::Succeeded, TaskState::Failed, TaskState::Obsolete]
        );
    }

    #[test]
    fn test_new_task_is_queued() {
        let task = ApplicationTask::new(
            Uuid::new_v4(),
            PolicyVersion::new(Uuid::new_v4(), 1),
            Principal::new("ops"),
        );
        assert_eq!(task.state, TaskState::Queued);
        assert_eq!(task.attempts, 0);
        assert!(!task.is_deferred(Utc::now()));
    }

    #[test]
    fn test_deferred_until_next_attempt() {
        let mut task = ApplicationTask::new(
            Uuid::new_v4(),
            PolicyVersion::new(Uuid::new_v4(), 1),
            Principal::system(),
        );
        let now = Utc::now();
        task.next_attempt_at = Some(now + chrono::Duration::seconds(5));
        assert!(task.is_deferred(now));
        assert!(!task.is_deferred(now + chrono::Duration::seconds(6)));
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(
            serde_json::to_string(&TaskState::Retrying).unwrap(),
            "\"retrying\""
        );
        assert_eq!(TaskState::Obsolete.to_string(), "obsolete");
    }
}
