//! Core ledger rows
//!
//! Defines accounts, tasks, transactions and the settings singleton.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::amount::Amount;

/// External (chat transport) identity of a user
pub type UserId = i64;

/// Task identifier
pub type TaskId = String;

/// Transaction identifier
pub type TransactionId = String;

/// Profile fields supplied by the transport on each interaction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileFields {
    pub username: Option<String>,
    pub first_name: Option<String>,
}

/// One user's ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// External identity (immutable)
    pub user_id: UserId,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub first_name: Option<String>,

    /// Available balance, never negative
    pub balance: Amount,

    /// Funds earmarked by pending withdrawals, never negative
    pub pending_withdrawal: Amount,

    /// Code other users pass to be attributed to this account
    pub referral_code: String,

    /// Referrer, set at most once
    #[serde(default)]
    pub referred_by: Option<UserId>,

    /// Number of users attributed to this account
    #[serde(default)]
    pub referral_count: u32,

    /// Tasks this user has been rewarded for
    #[serde(default)]
    pub completed_task_ids: BTreeSet<TaskId>,

    pub joined_at: DateTime<Utc>,
}

impl Account {
    /// Create a fresh zero-balance account
    pub fn new(user_id: UserId, profile: ProfileFields, joined_at: DateTime<Utc>) -> Self {
        Self {
            user_id,
            username: profile.username,
            first_name: profile.first_name,
            balance: Amount::ZERO,
            pending_withdrawal: Amount::ZERO,
            referral_code: Self::referral_code_for(user_id),
            referred_by: None,
            referral_count: 0,
            completed_task_ids: BTreeSet::new(),
            joined_at,
        }
    }

    /// Referral code derived from the user id (used in `?start=<code>` links)
    pub fn referral_code_for(user_id: UserId) -> String {
        user_id.to_string()
    }

    /// Funds still owned by the user inside the system
    pub fn total_holdings(&self) -> Amount {
        self.balance + self.pending_withdrawal
    }

    pub fn has_completed(&self, task_id: &str) -> bool {
        self.completed_task_ids.contains(task_id)
    }
}

/// What a task asks the user to do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    /// Join a channel; verified by a membership check
    JoinChannel { channel: String },

    /// Keep a post open for `duration_secs`; verified by a supervised countdown
    ViewPost { url: String, duration_secs: u64 },
}

impl TaskKind {
    /// Channel id or post URL
    pub fn target(&self) -> &str {
        match self {
            TaskKind::JoinChannel { channel } => channel,
            TaskKind::ViewPost { url, .. } => url,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::JoinChannel { .. } => "join_channel",
            TaskKind::ViewPost { .. } => "view_post",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::JoinChannel { channel } => write!(f, "Join Channel {}", channel),
            TaskKind::ViewPost { url, duration_secs } => {
                write!(f, "View Post {} for {}s", url, duration_secs)
            }
        }
    }
}

/// A completable unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,

    #[serde(flatten)]
    pub kind: TaskKind,

    /// Reward credited per completion (positive)
    pub reward: Amount,

    /// Optional completion cap
    #[serde(default)]
    pub max_completions: Option<u32>,

    #[serde(default)]
    pub current_completions: u32,

    pub active: bool,

    pub created_at: DateTime<Utc>,
}

impl Task {
    /// True once a capped task has been completed `max_completions` times
    pub fn is_capped_out(&self) -> bool {
        self.max_completions
            .map(|max| self.current_completions >= max)
            .unwrap_or(false)
    }

    /// Record one completion, deactivating the task when the cap is reached
    pub fn record_completion(&mut self) {
        self.current_completions += 1;
        if self.is_capped_out() {
            self.active = false;
        }
    }
}

/// Kind of balance-affecting event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Referral,
    TaskReward,
    Withdrawal,
    AdminAdjustment,
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionKind::Referral => write!(f, "referral"),
            TransactionKind::TaskReward => write!(f, "task_reward"),
            TransactionKind::Withdrawal => write!(f, "withdrawal"),
            TransactionKind::AdminAdjustment => write!(f, "admin_adjustment"),
        }
    }
}

/// Transaction status; non-withdrawal records are created `Completed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Rejected,
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionStatus::Pending => write!(f, "pending"),
            TransactionStatus::Completed => write!(f, "completed"),
            TransactionStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// Append-only audit record
///
/// `amount` is the signed balance delta for credits and adjustments. For
/// withdrawals it is the requested (positive) amount; the balance delta is
/// its negation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub user_id: UserId,
    pub amount: Amount,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: String,
}

impl Transaction {
    /// Create a new record with a fresh id
    pub fn new(
        user_id: UserId,
        amount: Amount,
        kind: TransactionKind,
        status: TransactionStatus,
        timestamp: DateTime<Utc>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            amount,
            kind,
            status,
            timestamp,
            details: details.into(),
        }
    }

    /// Effect of this record on the available balance at creation time
    pub fn balance_delta(&self) -> Amount {
        match self.kind {
            TransactionKind::Withdrawal => -self.amount,
            _ => self.amount,
        }
    }

    pub fn is_pending_withdrawal(&self) -> bool {
        self.kind == TransactionKind::Withdrawal && self.status == TransactionStatus::Pending
    }
}

/// Mutable configuration singleton
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub referral_reward: Amount,
    pub min_withdrawal: Amount,
    #[serde(default)]
    pub payment_details: String,
    #[serde(default)]
    pub channel_to_join: Option<String>,
    #[serde(default)]
    pub admin_ids: BTreeSet<UserId>,
}

impl Settings {
    pub fn is_admin(&self, user_id: UserId) -> bool {
        self.admin_ids.contains(&user_id)
    }
}
