//! Admin command surface
//!
//! Every operation checks `admin_id` against the live settings before doing
//! anything. Multi-step flows keep their state in [`AdminSessions`].

use chrono::Duration as ChronoDuration;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::account::{AccountManager, AccountSummary};
use crate::amount::Amount;
use crate::error::{Error, Result};
use crate::ledger::{
    LedgerStore, Settings, Task, TaskKind, Transaction, TransactionKind, TransactionStatus, UserId,
};
use crate::settings::{SettingName, SettingsStore};
use crate::task::{check_post_url, NewTask, TaskEngine};
use crate::transport::Clock;
use crate::withdrawal::WithdrawalWorkflow;

use super::session::{AdminSessions, FlowKind, FlowState, TaskDraft};

/// Direction of a manual balance adjustment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustDirection {
    Credit,
    Debit,
}

impl fmt::Display for AdjustDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdjustDirection::Credit => write!(f, "added"),
            AdjustDirection::Debit => write!(f, "subtracted"),
        }
    }
}

impl FromStr for AdjustDirection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "add" | "credit" | "+" => Ok(AdjustDirection::Credit),
            "sub" | "subtract" | "debit" | "-" => Ok(AdjustDirection::Debit),
            other => Err(Error::InvalidInput(format!(
                "Unknown direction '{}': use add or sub",
                other
            ))),
        }
    }
}

/// Aggregate figures for the admin dashboard
#[derive(Debug, Clone, Serialize)]
pub struct AdminStats {
    pub total_users: usize,
    /// Joined within the last 30 days
    pub active_users: usize,
    pub total_referrals: u64,
    pub completed_tasks: usize,
    pub total_withdrawn: Amount,
    pub pending_withdrawals: usize,
    pub pending_amount: Amount,
}

/// Result of feeding one admin message into a live flow
#[derive(Debug, Clone)]
pub enum FlowReply {
    Rejected(Transaction),
    Adjusted(Transaction),
    SettingChanged(Settings),
    /// Draft accepted the value; the named field comes next
    NeedsField(&'static str),
    TaskCreated(Task),
}

pub struct AdminConsole {
    store: Arc<LedgerStore>,
    clock: Arc<dyn Clock>,
    accounts: Arc<AccountManager>,
    tasks: Arc<TaskEngine>,
    withdrawals: Arc<WithdrawalWorkflow>,
    settings: SettingsStore,
    sessions: Arc<AdminSessions>,
}

impl AdminConsole {
    pub fn new(
        store: Arc<LedgerStore>,
        clock: Arc<dyn Clock>,
        accounts: Arc<AccountManager>,
        tasks: Arc<TaskEngine>,
        withdrawals: Arc<WithdrawalWorkflow>,
        sessions: Arc<AdminSessions>,
    ) -> Self {
        Self {
            settings: SettingsStore::new(store.clone()),
            store,
            clock,
            accounts,
            tasks,
            withdrawals,
            sessions,
        }
    }

    fn authorize(&self, admin_id: UserId) -> Result<()> {
        if self.store.settings().is_admin(admin_id) {
            Ok(())
        } else {
            warn!(admin_id, "Rejected admin action from non-admin");
            Err(Error::Unauthorized(admin_id))
        }
    }

    // === Commands ===

    pub fn create_task(&self, admin_id: UserId, draft: NewTask) -> Result<Task> {
        self.authorize(admin_id)?;
        let task = self.tasks.create_task(draft)?;
        info!(admin_id, task_id = %task.id, "Admin created task");
        Ok(task)
    }

    pub async fn set_task_active(&self, admin_id: UserId, task_id: &str, active: bool) -> Result<Task> {
        self.authorize(admin_id)?;
        self.tasks.set_task_active(task_id, active).await
    }

    /// Every task, active or not, in creation order
    pub fn list_tasks(&self, admin_id: UserId) -> Result<Vec<Task>> {
        self.authorize(admin_id)?;
        Ok(self.store.tasks_where(|_| true))
    }

    pub fn set_setting(&self, admin_id: UserId, name: &str, value: &str) -> Result<Settings> {
        self.authorize(admin_id)?;
        let name: SettingName = name.parse()?;
        let updated = self.settings.set(name, value)?;
        info!(admin_id, setting = %name, "Admin changed setting");
        Ok(updated)
    }

    pub fn settings(&self, admin_id: UserId) -> Result<Settings> {
        self.authorize(admin_id)?;
        Ok(self.settings.current())
    }

    pub fn list_pending_withdrawals(&self, admin_id: UserId, limit: usize) -> Result<Vec<Transaction>> {
        self.authorize(admin_id)?;
        Ok(self.withdrawals.list_pending(limit))
    }

    pub async fn approve_withdrawal(&self, admin_id: UserId, transaction_id: &str) -> Result<Transaction> {
        self.withdrawals.approve(admin_id, transaction_id).await
    }

    pub async fn reject_withdrawal(
        &self,
        admin_id: UserId,
        transaction_id: &str,
        reason: &str,
    ) -> Result<Transaction> {
        self.withdrawals.reject(admin_id, transaction_id, reason).await
    }

    /// Manual credit or debit; debits never take a balance below zero
    pub async fn adjust_balance(
        &self,
        admin_id: UserId,
        user_id: UserId,
        amount: Amount,
        direction: AdjustDirection,
    ) -> Result<Transaction> {
        self.authorize(admin_id)?;
        if !amount.is_positive() {
            return Err(Error::InvalidInput("Amount must be positive".to_string()));
        }

        let delta = match direction {
            AdjustDirection::Credit => amount,
            AdjustDirection::Debit => -amount,
        };
        let details = format!("Balance {} by admin {}", direction, admin_id);
        let tx = self
            .accounts
            .apply_delta(user_id, delta, TransactionKind::AdminAdjustment, &details)
            .await?;
        info!(admin_id, user_id, delta = %delta, "Admin adjusted balance");
        Ok(tx)
    }

    pub fn lookup_user(&self, admin_id: UserId, user_id: UserId) -> Result<AccountSummary> {
        self.authorize(admin_id)?;
        self.accounts.summary(user_id)
    }

    pub fn user_history(&self, admin_id: UserId, user_id: UserId, limit: usize) -> Result<Vec<Transaction>> {
        self.authorize(admin_id)?;
        self.accounts.get(user_id)?;
        Ok(self.accounts.history(user_id, limit))
    }

    pub fn stats(&self, admin_id: UserId) -> Result<AdminStats> {
        self.authorize(admin_id)?;

        let accounts = self.store.accounts();
        let cutoff = self.clock.now() - ChronoDuration::days(30);
        let transactions = self.store.transactions_where(usize::MAX, |_| true);

        let (pending_withdrawals, pending_amount) = transactions
            .iter()
            .filter(|t| t.is_pending_withdrawal())
            .fold((0, Amount::ZERO), |(n, sum), t| (n + 1, sum + t.amount));

        Ok(AdminStats {
            total_users: accounts.len(),
            active_users: accounts.iter().filter(|a| a.joined_at >= cutoff).count(),
            total_referrals: accounts.iter().map(|a| a.referral_count as u64).sum(),
            completed_tasks: transactions
                .iter()
                .filter(|t| t.kind == TransactionKind::TaskReward)
                .count(),
            total_withdrawn: transactions
                .iter()
                .filter(|t| {
                    t.kind == TransactionKind::Withdrawal && t.status == TransactionStatus::Completed
                })
                .map(|t| t.amount)
                .sum(),
            pending_withdrawals,
            pending_amount,
        })
    }

    // === Multi-step flows ===

    pub fn begin_reject(&self, admin_id: UserId, transaction_id: &str) -> Result<()> {
        self.authorize(admin_id)?;
        let tx = self
            .store
            .read_transaction(transaction_id)
            .ok_or_else(|| Error::TransactionNotFound(transaction_id.to_string()))?;
        if !tx.is_pending_withdrawal() {
            return Err(Error::NotPending(transaction_id.to_string()));
        }
        self.sessions.begin(
            admin_id,
            FlowState::AwaitingRejectReason {
                transaction_id: transaction_id.to_string(),
            },
        );
        Ok(())
    }

    pub fn begin_adjust(&self, admin_id: UserId, user_id: UserId, direction: AdjustDirection) -> Result<()> {
        self.authorize(admin_id)?;
        self.accounts.get(user_id)?;
        self.sessions
            .begin(admin_id, FlowState::AwaitingAdjustAmount { user_id, direction });
        Ok(())
    }

    pub fn begin_setting(&self, admin_id: UserId, name: &str) -> Result<()> {
        self.authorize(admin_id)?;
        let name: SettingName = name.parse()?;
        self.sessions
            .begin(admin_id, FlowState::AwaitingSettingValue { name });
        Ok(())
    }

    pub fn begin_task_draft(&self, admin_id: UserId, kind: &str) -> Result<&'static str> {
        self.authorize(admin_id)?;
        let kind = match kind {
            "join_channel" | "view_post" => kind.to_string(),
            other => return Err(Error::InvalidInput(format!("Unknown task kind '{}'", other))),
        };
        let draft = TaskDraft {
            kind: Some(kind),
            ..Default::default()
        };
        let next = next_field(&draft).unwrap_or("target");
        self.sessions.begin(admin_id, FlowState::DraftingTask(draft));
        Ok(next)
    }

    pub fn cancel_flows(&self, admin_id: UserId) {
        self.sessions.clear(admin_id);
    }

    /// Feed a free-text admin message into whichever flow is waiting for it
    ///
    /// Returns `None` when no flow is live. Input errors keep the flow open
    /// so the admin can try again.
    pub async fn handle_input(&self, admin_id: UserId, text: &str) -> Result<Option<FlowReply>> {
        self.authorize(admin_id)?;

        const ORDER: [FlowKind; 4] = [
            FlowKind::RejectReason,
            FlowKind::AdjustBalance,
            FlowKind::EditSetting,
            FlowKind::CreateTask,
        ];
        let state = match ORDER.iter().find_map(|kind| self.sessions.take(admin_id, *kind)) {
            Some(state) => state,
            None => return Ok(None),
        };

        let result = self.run_flow(admin_id, state.clone(), text).await;
        if let Err(e) = &result {
            if matches!(
                e,
                Error::InvalidInput(_) | Error::InvalidSetting { .. } | Error::InsufficientFunds { .. }
            ) {
                self.sessions.begin(admin_id, state);
            }
        }
        result.map(Some)
    }

    /// Parse and check one draft field, so a bad value is asked for again
    /// at its own step rather than failing the finished draft
    fn fill_next_field(&self, draft: &mut TaskDraft, text: &str) -> Result<()> {
        let text = text.trim();
        match next_field(draft) {
            Some("target") => {
                let target = if text == "-" { "" } else { text };
                match draft.kind.as_deref() {
                    Some("view_post") => check_post_url(target)?,
                    _ => self.tasks.check_channel(target)?,
                };
                draft.target = Some(target.to_string());
            }
            Some("reward") => {
                let reward: Amount = text.parse()?;
                if !reward.is_positive() {
                    return Err(Error::InvalidInput("Task reward must be positive".to_string()));
                }
                draft.reward = Some(reward);
            }
            Some("duration") => {
                let secs = text.parse().map_err(|_| {
                    Error::InvalidInput(format!("'{}' is not a number of seconds", text))
                })?;
                self.tasks.check_view_duration(secs)?;
                draft.duration_secs = Some(secs);
            }
            Some("max_completions") => {
                // 0 means uncapped
                draft.max_completions = Some(text.parse().map_err(|_| {
                    Error::InvalidInput(format!("'{}' is not a completion count", text))
                })?)
            }
            _ => {}
        }
        Ok(())
    }

    async fn run_flow(&self, admin_id: UserId, state: FlowState, text: &str) -> Result<FlowReply> {
        match state {
            FlowState::AwaitingRejectReason { transaction_id } => self
                .reject_withdrawal(admin_id, &transaction_id, text)
                .await
                .map(FlowReply::Rejected),
            FlowState::AwaitingAdjustAmount { user_id, direction } => {
                let amount: Amount = text.parse()?;
                self.adjust_balance(admin_id, user_id, amount, direction)
                    .await
                    .map(FlowReply::Adjusted)
            }
            FlowState::AwaitingSettingValue { name } => self
                .set_setting(admin_id, name.as_str(), text)
                .map(FlowReply::SettingChanged),
            FlowState::DraftingTask(mut draft) => {
                self.fill_next_field(&mut draft, text)?;
                match next_field(&draft) {
                    Some(field) => {
                        self.sessions.begin(admin_id, FlowState::DraftingTask(draft));
                        Ok(FlowReply::NeedsField(field))
                    }
                    None => self
                        .create_task(admin_id, finish_draft(draft)?)
                        .map(FlowReply::TaskCreated),
                }
            }
        }
    }
}

fn next_field(draft: &TaskDraft) -> Option<&'static str> {
    let is_view = draft.kind.as_deref() == Some("view_post");
    if draft.target.is_none() {
        Some("target")
    } else if draft.reward.is_none() {
        Some("reward")
    } else if is_view && draft.duration_secs.is_none() {
        Some("duration")
    } else if draft.max_completions.is_none() {
        Some("max_completions")
    } else {
        None
    }
}

fn finish_draft(draft: TaskDraft) -> Result<NewTask> {
    let missing = |field: &str| Error::InvalidInput(format!("Task draft is missing {}", field));
    let target = draft.target.ok_or_else(|| missing("target"))?;
    let kind = match draft.kind.as_deref() {
        Some("view_post") => TaskKind::ViewPost {
            url: target,
            duration_secs: draft.duration_secs.ok_or_else(|| missing("duration"))?,
        },
        _ => TaskKind::JoinChannel { channel: target },
    };
    Ok(NewTask {
        kind,
        reward: draft.reward.ok_or_else(|| missing("reward"))?,
        max_completions: draft.max_completions.filter(|max| *max > 0),
    })
}
