//! Admin conversation state
//!
//! Multi-step admin flows (typing a reject reason, an adjustment amount, a
//! setting value, a task draft) park their state here, keyed by
//! (admin id, flow kind), with a TTL. Nothing of this lives on `Account`.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::amount::Amount;
use crate::ledger::{TransactionId, UserId};
use crate::settings::SettingName;

use super::console::AdjustDirection;

/// Which multi-step flow an admin is in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowKind {
    RejectReason,
    AdjustBalance,
    EditSetting,
    CreateTask,
}

/// Partially entered task
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskDraft {
    /// "join_channel" or "view_post"
    pub kind: Option<String>,
    pub target: Option<String>,
    pub reward: Option<Amount>,
    pub max_completions: Option<u32>,
    pub duration_secs: Option<u64>,
}

/// What the next admin message should be read as
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowState {
    AwaitingRejectReason {
        transaction_id: TransactionId,
    },
    AwaitingAdjustAmount {
        user_id: UserId,
        direction: AdjustDirection,
    },
    AwaitingSettingValue {
        name: SettingName,
    },
    DraftingTask(TaskDraft),
}

impl FlowState {
    pub fn kind(&self) -> FlowKind {
        match self {
            FlowState::AwaitingRejectReason { .. } => FlowKind::RejectReason,
            FlowState::AwaitingAdjustAmount { .. } => FlowKind::AdjustBalance,
            FlowState::AwaitingSettingValue { .. } => FlowKind::EditSetting,
            FlowState::DraftingTask(_) => FlowKind::CreateTask,
        }
    }
}

struct Entry {
    state: FlowState,
    expires_at: Instant,
}

/// Session-scoped admin flow state with expiry
pub struct AdminSessions {
    ttl: Duration,
    flows: DashMap<(UserId, FlowKind), Entry>,
}

impl AdminSessions {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            flows: DashMap::new(),
        }
    }

    /// Start (or restart) a flow, replacing any previous state of its kind
    pub fn begin(&self, admin_id: UserId, state: FlowState) {
        let kind = state.kind();
        debug!(admin_id, flow = ?kind, "Admin flow started");
        self.flows.insert(
            (admin_id, kind),
            Entry {
                state,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Current state of a flow, if not expired
    pub fn peek(&self, admin_id: UserId, kind: FlowKind) -> Option<FlowState> {
        let entry = self.flows.get(&(admin_id, kind))?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.state.clone())
    }

    /// Remove and return a flow's state; expired state is discarded
    pub fn take(&self, admin_id: UserId, kind: FlowKind) -> Option<FlowState> {
        let (_, entry) = self.flows.remove(&(admin_id, kind))?;
        if entry.expires_at <= Instant::now() {
            debug!(admin_id, flow = ?kind, "Admin flow expired");
            return None;
        }
        Some(entry.state)
    }

    /// Drop every flow of one admin
    pub fn clear(&self, admin_id: UserId) {
        self.flows.retain(|(id, _), _| *id != admin_id);
    }

    /// Drop expired flows; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.flows.len();
        self.flows.retain(|_, entry| entry.expires_at > now);
        before - self.flows.len()
    }
}
