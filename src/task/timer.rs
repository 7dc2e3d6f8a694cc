//! View-post countdown handles and events
//!
//! A countdown is a spawned task scoped to one (user, task) pair. The engine
//! owns its authoritative state; the transport only sees [`TimerEvent`]s.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::ledger::{TaskId, Transaction, UserId};

/// Lifecycle notifications for a countdown
#[derive(Debug, Clone)]
pub enum TimerEvent {
    Started {
        user_id: UserId,
        task_id: TaskId,
        duration_secs: u64,
    },
    Tick {
        user_id: UserId,
        task_id: TaskId,
        remaining_secs: u64,
    },
    /// Reward committed
    Completed {
        user_id: UserId,
        task_id: TaskId,
        transaction: Transaction,
    },
    /// Stopped before the completion step; nothing was credited
    Cancelled { user_id: UserId, task_id: TaskId },
    /// Reached expiry but the completion step was refused
    Failed {
        user_id: UserId,
        task_id: TaskId,
        reason: String,
    },
}

impl TimerEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TimerEvent::Started { .. } | TimerEvent::Tick { .. })
    }
}

/// Handle to a live countdown
#[derive(Debug, Clone)]
pub struct TimerHandle {
    /// Unique per countdown, so a restarted pair gets a new handle
    pub id: String,
    pub user_id: UserId,
    pub task_id: TaskId,
    pub duration_secs: u64,
    token: CancellationToken,
}

impl TimerHandle {
    pub(crate) fn new(user_id: UserId, task_id: TaskId, duration_secs: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            task_id,
            duration_secs,
            token: CancellationToken::new(),
        }
    }

    /// Request cancellation; a no-op once the reward has committed
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Live countdowns keyed by (user, task)
#[derive(Debug, Default)]
pub(crate) struct TimerRegistry {
    live: DashMap<(UserId, TaskId), TimerHandle>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `make()` unless a live handle exists
    ///
    /// A cancelled handle whose countdown has not wound down yet counts as
    /// gone and is replaced. Returns the registered handle and whether it is new.
    pub fn get_or_insert(
        &self,
        user_id: UserId,
        task_id: &str,
        make: impl FnOnce() -> TimerHandle,
    ) -> (TimerHandle, bool) {
        match self.live.entry((user_id, task_id.to_string())) {
            Entry::Occupied(existing) if !existing.get().is_cancelled() => {
                (existing.get().clone(), false)
            }
            Entry::Occupied(mut stale) => {
                let handle = make();
                stale.insert(handle.clone());
                (handle, true)
            }
            Entry::Vacant(slot) => {
                let handle = make();
                slot.insert(handle.clone());
                (handle, true)
            }
        }
    }

    /// Live (not cancelled) handle for the pair
    pub fn get(&self, user_id: UserId, task_id: &str) -> Option<TimerHandle> {
        self.live
            .get(&(user_id, task_id.to_string()))
            .filter(|h| !h.is_cancelled())
            .map(|h| h.value().clone())
    }

    /// Drop the entry only if it still belongs to `handle`
    pub fn release(&self, handle: &TimerHandle) {
        self.live
            .remove_if(&(handle.user_id, handle.task_id.clone()), |_, live| {
                live.id == handle.id
            });
    }

    /// Cancel every live countdown on `task_id` except `keep`; returns how many
    pub fn cancel_task(&self, task_id: &str, keep: Option<UserId>) -> usize {
        let mut cancelled = 0;
        for entry in self.live.iter() {
            let (user_id, id) = entry.key();
            if id == task_id && Some(*user_id) != keep {
                entry.value().cancel();
                cancelled += 1;
            }
        }
        cancelled
    }
}
