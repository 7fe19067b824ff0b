//! Task queue port and the in-process adapter
//!
//! Delivery is at-least-once: the same task id may be handed out more than
//! once, and the orchestrator tolerates that by re-reading the durable task
//! before acting on it.

use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

pub trait TaskQueue: Send + Sync + 'static {
    /// Schedules `task_id` to become available at `ready_at`.
    fn enqueue(&self, task_id: Uuid, ready_at: DateTime<Utc>);

    /// Waits for the next task whose ready time has passed.
    fn dequeue(&self) -> impl Future<Output = Uuid> + Send;

    /// Number of entries waiting, ready or not.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ready-time ordered heap, woken by [`Notify`] on every enqueue
#[derive(Debug, Default)]
pub struct MemoryQueue {
    /// (ready time, insertion sequence, task id); the sequence keeps FIFO
    /// order among entries with the same ready time
    heap: Mutex<BinaryHeap<Reverse<(DateTime<Utc>, u64, Uuid)>>>,
    seq: Mutex<u64>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pops a ready entry, or reports how long until the earliest one is due.
    fn try_pop(&self, now: DateTime<Utc>) -> Result<Uuid, Option<Duration>> {
        let mut heap = self.heap.lock().unwrap_or_else(PoisonError::into_inner);
        match heap.peek() {
            Some(Reverse((ready_at, _, _))) if *ready_at <= now => {
                heap.pop().map(|Reverse((_, _, id))| id).ok_or(None)
            }
            Some(Reverse((ready_at, _, _))) => {
                Err(Some((*ready_at - now).to_std().unwrap_or_default()))
            }
            None => Err(None),
        }
    }
}

impl TaskQueue for MemoryQueue {
    fn enqueue(&self, task_id: Uuid, ready_at: DateTime<Utc>) {
        let seq = {
            let mut seq = self.seq.lock().unwrap_or_else(PoisonError::into_inner);
            *seq += 1;
            *seq
        };
        self.heap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Reverse((ready_at, seq, task_id)));
        self.notify.notify_waiters();
    }

    async fn dequeue(&self) -> Uuid {
        loop {
            // Registered before the heap check so an enqueue in between is not missed
            let notified = self.notify.notified();
            match self.try_pop(Utc::now()) {
                Ok(id) => return id,
                Err(Some(wait)) => {
                    tokio::select! {
                        () = notified => {}
                        () = tokio::time::sleep(wait) => {}
                    }
                }
                Err(None) => notified.await,
            }
        }
    }

    fn len(&self) -> usize {
        self.heap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
