//! Firewall lifecycle state machine
//!
//! ```text
//!            submit                 success
//!   draft ──────────► pending-apply ─────────► applied
//!                      │   ▲  ▲ │                 │
//!        rollback ok   │   │  │ │ failed          │ submit
//!   rolled-back ◄──────┘   │  │ └──────► failed   │
//!        │      submit     │  │           │       │
//!        └─────────────────┘  └───────────┴───────┘
//! ```
//!
//! `pending-apply → pending-apply` is allowed for a newer submission.

use crate::core::error::{Error, Result};
use crate::core::model::{Firewall, FirewallState};
use chrono::Utc;

impl FirewallState {
    /// Returns `true` if moving from `self` to `to` is permitted.
    pub fn can_transition_to(self, to: FirewallState) -> bool {
        use FirewallState::{Applied, Draft, Failed, PendingApply, RolledBack};
        matches!(
            (self, to),
            (Draft | Applied | RolledBack | Failed | PendingApply, PendingApply)
                | (PendingApply, Applied | Failed | RolledBack)
        )
    }

    /// Returns `true` when a compiled version is active on the target.
    pub fn has_active_version(self) -> bool {
        matches!(self, FirewallState::Applied | FirewallState::RolledBack)
    }
}

/// Moves `firewall` to `to`, refusing illegal transitions.
///
/// # Errors
///
/// Returns [`Error::InvalidTransition`] when the move is not in the table.
pub fn transition(firewall: &mut Firewall, to: FirewallState) -> Result<()> {
    if !firewall.state.can_transition_to(to) {
        return Err(Error::InvalidTransition {
            from: firewall.state.to_string(),
            to: to.to_string(),
        });
    }
    if firewall.state != to {
        tracing::debug!(
            firewall = %firewall.id,
            from = %firewall.state,
            to = %to,
            "Firewall state transition"
        );
    }
    firewall.state = to;
    firewall.updated_at = Utc::now();
    Ok(())
}
