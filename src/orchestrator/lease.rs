//! Per-firewall exclusive lease
//!
//! The lease lives on the firewall record and is taken with an optimistic
//! save, so it holds across processes sharing a store. An expired lease can
//! be taken over by anyone.

use crate::core::error::{Error, Result};
use crate::core::model::{Firewall, Lease};
use crate::store::{Store, update_firewall};
use chrono::Utc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Attempts to take the lease on `firewall_id` for `owner`.
///
/// Returns the saved firewall when the lease is held, or `None` when another
/// owner holds a live lease. Re-acquiring an own lease extends it.
pub fn acquire<S: Store + ?Sized>(
    store: &S,
    firewall_id: Uuid,
    owner: Uuid,
    ttl: Duration,
) -> Result<Option<Firewall>> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| Error::Internal(format!("lease ttl out of range: {e}")))?;
    let mut busy = false;
    let saved = update_firewall(store, firewall_id, |fw| {
        let now = Utc::now();
        busy = fw.is_leased_by_other(owner, now);
        if !busy {
            fw.lease = Some(Lease {
                owner,
                expires_at: now + ttl,
            });
        }
        Ok(())
    })?;
    if busy {
        debug!(firewall = %firewall_id, "Lease held by another worker");
        return Ok(None);
    }
    Ok(Some(saved))
}

/// Entity name carried by the conflict raised when a lease is no longer held.
pub const LEASE: &str = "lease";

/// Extends the lease by `ttl` from now, provided `owner` still holds it.
///
/// Unlike [`acquire`], an expired lease that has since been taken over is
/// not reclaimed: the call fails with a lease conflict (see [`is_lost`]).
pub fn renew<S: Store + ?Sized>(
    store: &S,
    firewall_id: Uuid,
    owner: Uuid,
    ttl: Duration,
) -> Result<Firewall> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| Error::Internal(format!("lease ttl out of range: {e}")))?;
    update_firewall(store, firewall_id, |fw| {
        ensure_held(fw, owner)?;
        fw.lease = Some(Lease {
            owner,
            expires_at: Utc::now() + ttl,
        });
        Ok(())
    })
}

/// Fails with a lease conflict unless `owner` is the recorded lease holder.
///
/// Expiry is not checked: an expired lease nobody took over still belongs
/// to its owner.
pub fn ensure_held(firewall: &Firewall, owner: Uuid) -> Result<()> {
    if firewall.lease.is_some_and(|l| l.owner == owner) {
        Ok(())
    } else {
        Err(Error::ConcurrencyConflict {
            entity: LEASE,
            id: firewall.id,
        })
    }
}

/// Returns `true` for the conflict raised by [`ensure_held`].
pub fn is_lost(error: &Error) -> bool {
    matches!(error, Error::ConcurrencyConflict { entity, .. } if *entity == LEASE)
}

/// Clears the lease if `owner` still holds it.
pub fn release<S: Store + ?Sized>(store: &S, firewall_id: Uuid, owner: Uuid) -> Result<()> {
    update_firewall(store, firewall_id, |fw| {
        clear(fw, owner);
        Ok(())
    })?;
    Ok(())
}

/// Clears the lease in place if `owner` holds it, for saves that do more than release.
pub fn clear(firewall: &mut Firewall, owner: Uuid) {
    if firewall.lease.is_some_and(|l| l.owner == owner) {
        firewall.lease = None;
    }
}
