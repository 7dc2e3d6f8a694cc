//! Task engine
//!
//! Owns the task catalog and the per-(user, task) completion state machine:
//! `NotStarted -> InProgress (view-post only) -> Completed`.
//!
//! Both task kinds finish through the same atomic completion step, which
//! takes the account lock and then the task lock, re-checks availability and
//! commits the credit, the completed-task mark, the completion counter and
//! the audit transaction together.

use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::account::manager::apply_balance_delta;
use crate::amount::Amount;
use crate::config::TaskConfig;
use crate::error::{Error, Result};
use crate::ledger::{
    Account, Commit, LedgerStore, Task, TaskKind, Transaction, TransactionKind, TransactionStatus,
    UserId,
};
use crate::transport::{Clock, MembershipChecker};

use super::timer::{TimerEvent, TimerHandle, TimerRegistry};

lazy_static! {
    /// `@handle` or a numeric chat id
    static ref CHANNEL_RE: Regex = Regex::new(r"^(@[A-Za-z][A-Za-z0-9_]{3,31}|-?[0-9]{5,20})$")
        .expect("Invalid channel regex");
    static ref POST_URL_RE: Regex = Regex::new(r"^https?://[^\s/]+(/\S*)?$")
        .expect("Invalid post url regex");
}

pub fn check_post_url(url: &str) -> Result<String> {
    let url = url.trim();
    if !POST_URL_RE.is_match(url) {
        return Err(Error::InvalidInput(format!("Invalid post URL '{}'", url)));
    }
    Ok(url.to_string())
}

/// Result of a completion attempt that did not fail
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// Reward credited
    Completed(Transaction),
    /// Verification not satisfied (or inconclusive); nothing changed
    NotEligibleYet,
}

impl TaskOutcome {
    pub fn transaction(&self) -> Option<&Transaction> {
        match self {
            TaskOutcome::Completed(tx) => Some(tx),
            TaskOutcome::NotEligibleYet => None,
        }
    }
}

/// Admin input for a new task
#[derive(Debug, Clone)]
pub struct NewTask {
    pub kind: TaskKind,
    pub reward: Amount,
    pub max_completions: Option<u32>,
}

enum Completion {
    Rewarded(Transaction, Task),
    Cancelled,
}

pub struct TaskEngine {
    store: Arc<LedgerStore>,
    clock: Arc<dyn Clock>,
    membership: Arc<dyn MembershipChecker>,
    config: TaskConfig,
    timers: TimerRegistry,
    events: Option<mpsc::Sender<TimerEvent>>,
}

impl TaskEngine {
    pub fn new(
        store: Arc<LedgerStore>,
        clock: Arc<dyn Clock>,
        membership: Arc<dyn MembershipChecker>,
        config: TaskConfig,
    ) -> Self {
        Self {
            store,
            clock,
            membership,
            config,
            timers: TimerRegistry::new(),
            events: None,
        }
    }

    /// Deliver countdown events to `sender`
    pub fn with_events(mut self, sender: mpsc::Sender<TimerEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    // === Catalog ===

    /// Resolve a join target; blank falls back to `channel_to_join`
    pub fn check_channel(&self, channel: &str) -> Result<String> {
        let channel = match channel.trim() {
            "" => self.store.settings().channel_to_join.ok_or_else(|| {
                Error::InvalidInput("No channel given and channel_to_join is not set".to_string())
            })?,
            given => given.to_string(),
        };
        if !CHANNEL_RE.is_match(&channel) {
            return Err(Error::InvalidInput(format!(
                "Invalid channel '{}': expected @handle or numeric id",
                channel
            )));
        }
        Ok(channel)
    }

    pub fn check_view_duration(&self, duration_secs: u64) -> Result<()> {
        if !self.config.allowed_view_durations.contains(&duration_secs) {
            return Err(Error::InvalidInput(format!(
                "Duration {}s not allowed (choose from {:?})",
                duration_secs, self.config.allowed_view_durations
            )));
        }
        Ok(())
    }

    /// Validate and store a new active task
    pub fn create_task(&self, draft: NewTask) -> Result<Task> {
        if !draft.reward.is_positive() {
            return Err(Error::InvalidInput("Task reward must be positive".to_string()));
        }
        if draft.max_completions == Some(0) {
            return Err(Error::InvalidInput(
                "max_completions must be at least 1".to_string(),
            ));
        }

        let kind = match draft.kind {
            TaskKind::JoinChannel { channel } => TaskKind::JoinChannel {
                channel: self.check_channel(&channel)?,
            },
            TaskKind::ViewPost { url, duration_secs } => {
                self.check_view_duration(duration_secs)?;
                TaskKind::ViewPost {
                    url: check_post_url(&url)?,
                    duration_secs,
                }
            }
        };

        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            reward: draft.reward,
            max_completions: draft.max_completions,
            current_completions: 0,
            active: true,
            created_at: self.clock.now(),
        };
        self.store.commit(Commit::new().task(task.clone()))?;

        info!(
            task_id = %task.id,
            kind = task.kind.label(),
            reward = %task.reward,
            max_completions = ?task.max_completions,
            "Created task"
        );
        Ok(task)
    }

    pub fn get_task(&self, task_id: &str) -> Result<Task> {
        self.store
            .read_task(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))
    }

    /// Active tasks in creation order; `None` uses the configured page size
    pub fn list_active(&self, limit: Option<usize>) -> Vec<Task> {
        let limit = limit.unwrap_or(self.config.list_page_size);
        self.store
            .tasks_where(|t| t.active && !t.is_capped_out())
            .into_iter()
            .take(limit)
            .collect()
    }

    /// Active tasks the user has not completed yet
    pub fn list_available(&self, user_id: UserId, limit: Option<usize>) -> Vec<Task> {
        let completed = self
            .store
            .read_account(user_id)
            .map(|a| a.completed_task_ids)
            .unwrap_or_default();
        let limit = limit.unwrap_or(self.config.list_page_size);
        self.store
            .tasks_where(|t| t.active && !t.is_capped_out() && !completed.contains(&t.id))
            .into_iter()
            .take(limit)
            .collect()
    }

    /// Manually (de)activate a task; deactivation cancels live countdowns
    pub async fn set_task_active(&self, task_id: &str, active: bool) -> Result<Task> {
        let task = self
            .store
            .retrying(&format!("task:{}", task_id), || async move {
                let _lock = self.store.lock_task(task_id).await?;
                let mut task = self.get_task(task_id)?;
                task.active = active;
                self.store.commit(Commit::new().task(task.clone()))?;
                Ok(task)
            })
            .await?;

        let cancelled = if active {
            0
        } else {
            self.timers.cancel_task(task_id, None)
        };
        info!(task_id, active, cancelled_timers = cancelled, "Task activity changed");
        Ok(task)
    }

    // === Join channel ===

    /// Verify membership and credit the reward
    ///
    /// Unavailable tasks fail with `TaskUnavailable`. A negative, failed or
    /// timed-out membership check yields `NotEligibleYet` with no mutation.
    pub async fn attempt_join_channel(&self, user_id: UserId, task_id: &str) -> Result<TaskOutcome> {
        let task = self.get_task(task_id)?;
        let channel = match &task.kind {
            TaskKind::JoinChannel { channel } => channel.clone(),
            other => {
                return Err(Error::InvalidInput(format!(
                    "Task {} is a {} task",
                    task_id,
                    other.label()
                )))
            }
        };
        let account = self
            .store
            .read_account(user_id)
            .ok_or(Error::AccountNotFound(user_id))?;
        ensure_available(&account, &task)?;

        if !self.check_membership(user_id, &channel).await {
            debug!(user_id, task_id, channel = %channel, "Membership not confirmed");
            return Ok(TaskOutcome::NotEligibleYet);
        }

        match self.complete(user_id, task_id, None).await? {
            Completion::Rewarded(tx, _) => Ok(TaskOutcome::Completed(tx)),
            Completion::Cancelled => Ok(TaskOutcome::NotEligibleYet),
        }
    }

    async fn check_membership(&self, user_id: UserId, channel: &str) -> bool {
        let timeout = Duration::from_millis(self.config.membership_timeout_ms);
        match tokio::time::timeout(timeout, self.membership.is_member(user_id, channel)).await {
            Ok(Ok(is_member)) => is_member,
            Ok(Err(e)) => {
                warn!(
                    user_id,
                    channel,
                    checker = self.membership.name(),
                    error = %e,
                    "Membership check failed"
                );
                false
            }
            Err(_) => {
                warn!(
                    user_id,
                    channel,
                    checker = self.membership.name(),
                    timeout_ms = self.config.membership_timeout_ms,
                    "Membership check timed out"
                );
                false
            }
        }
    }

    // === View post ===

    /// Start (or return the live) countdown for this user and task
    pub async fn start_view_post(self: &Arc<Self>, user_id: UserId, task_id: &str) -> Result<TimerHandle> {
        if let Some(live) = self.timers.get(user_id, task_id) {
            debug!(user_id, task_id, "Countdown already running");
            return Ok(live);
        }

        let task = self.get_task(task_id)?;
        let duration_secs = match task.kind {
            TaskKind::ViewPost { duration_secs, .. } => duration_secs,
            ref other => {
                return Err(Error::InvalidInput(format!(
                    "Task {} is a {} task",
                    task_id,
                    other.label()
                )))
            }
        };

        // Check and register under the account lock so a concurrent
        // completion cannot slip between the two
        let (handle, created) = self
            .store
            .retrying(&format!("account:{}", user_id), || async move {
                let _lock = self.store.lock_account(user_id).await?;
                let account = self
                    .store
                    .read_account(user_id)
                    .ok_or(Error::AccountNotFound(user_id))?;
                let task = self.get_task(task_id)?;
                ensure_available(&account, &task)?;
                Ok(self.timers.get_or_insert(user_id, task_id, || {
                    TimerHandle::new(user_id, task_id.to_string(), duration_secs)
                }))
            })
            .await?;

        if created {
            info!(user_id, task_id, duration_secs, "Started view countdown");
            let engine = Arc::clone(self);
            let countdown = handle.clone();
            tokio::spawn(async move { engine.run_countdown(countdown).await });
        }
        Ok(handle)
    }

    /// Cancel the live countdown, if any; returns whether one was running
    pub fn cancel_view_post(&self, user_id: UserId, task_id: &str) -> bool {
        match self.timers.get(user_id, task_id) {
            Some(handle) => {
                handle.cancel();
                debug!(user_id, task_id, "Cancelled view countdown");
                true
            }
            None => false,
        }
    }

    /// Live countdown for this pair, if any
    pub fn live_timer(&self, user_id: UserId, task_id: &str) -> Option<TimerHandle> {
        self.timers.get(user_id, task_id)
    }

    async fn run_countdown(&self, handle: TimerHandle) {
        let user_id = handle.user_id;
        let task_id = handle.task_id.clone();
        let token = handle.token().clone();

        let start = Instant::now();
        let deadline = start + Duration::from_secs(handle.duration_secs);
        let tick_every = Duration::from_secs(self.config.tick_interval_secs.max(1));
        let mut ticker = interval_at(start + tick_every, tick_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        self.emit(TimerEvent::Started {
            user_id,
            task_id: task_id.clone(),
            duration_secs: handle.duration_secs,
        });

        let expired = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break false,
                _ = sleep_until(deadline) => break true,
                now = ticker.tick() => {
                    let remaining = deadline.saturating_duration_since(now).as_secs();
                    if remaining > 0 {
                        self.emit(TimerEvent::Tick {
                            user_id,
                            task_id: task_id.clone(),
                            remaining_secs: remaining,
                        });
                    }
                }
            }
        };

        let event = if !expired {
            debug!(user_id, task_id = %task_id, "View countdown cancelled");
            TimerEvent::Cancelled {
                user_id,
                task_id: task_id.clone(),
            }
        } else {
            match self.complete(user_id, &task_id, Some(&token)).await {
                Ok(Completion::Rewarded(transaction, _)) => TimerEvent::Completed {
                    user_id,
                    task_id: task_id.clone(),
                    transaction,
                },
                Ok(Completion::Cancelled) => TimerEvent::Cancelled {
                    user_id,
                    task_id: task_id.clone(),
                },
                Err(e) => {
                    warn!(user_id, task_id = %task_id, error = %e, "View completion refused");
                    TimerEvent::Failed {
                        user_id,
                        task_id: task_id.clone(),
                        reason: e.to_string(),
                    }
                }
            }
        };

        self.timers.release(&handle);
        self.emit(event);
    }

    /// Never waits on the subscriber; a full or closed channel drops the event
    fn emit(&self, event: TimerEvent) {
        let Some(events) = &self.events else {
            return;
        };
        if let Err(e) = events.try_send(event) {
            let event = match e {
                mpsc::error::TrySendError::Full(event) | mpsc::error::TrySendError::Closed(event) => event,
            };
            if event.is_terminal() {
                warn!(?event, "Timer event dropped");
            } else {
                debug!("Timer event dropped");
            }
        }
    }

    // === Completion ===

    /// The atomic completion transition shared by both task kinds
    async fn complete(
        &self,
        user_id: UserId,
        task_id: &str,
        token: Option<&CancellationToken>,
    ) -> Result<Completion> {
        let completion = self
            .store
            .retrying(&format!("complete:{}:{}", user_id, task_id), || async move {
                let _account_lock = self.store.lock_account(user_id).await?;
                let _task_lock = self.store.lock_task(task_id).await?;

                let mut account = self
                    .store
                    .read_account(user_id)
                    .ok_or(Error::AccountNotFound(user_id))?;
                let mut task = self.get_task(task_id)?;
                ensure_available(&account, &task)?;

                if token.map(|t| t.is_cancelled()).unwrap_or(false) {
                    return Ok(Completion::Cancelled);
                }

                apply_balance_delta(&mut account, task.reward)?;
                account.completed_task_ids.insert(task.id.clone());
                task.record_completion();

                let details = match task.kind {
                    TaskKind::JoinChannel { .. } => format!("Completed join channel task {}", task.id),
                    TaskKind::ViewPost { .. } => format!("Completed view post task {}", task.id),
                };
                let tx = Transaction::new(
                    user_id,
                    task.reward,
                    TransactionKind::TaskReward,
                    TransactionStatus::Completed,
                    self.clock.now(),
                    details,
                );

                self.store.commit(
                    Commit::new()
                        .account(account)
                        .task(task.clone())
                        .transaction(tx.clone()),
                )?;
                Ok(Completion::Rewarded(tx, task))
            })
            .await?;

        if let Completion::Rewarded(tx, task) = &completion {
            info!(
                user_id,
                task_id,
                reward = %tx.amount,
                completions = task.current_completions,
                "Task completed"
            );
            if !task.active {
                let cancelled = self.timers.cancel_task(task_id, Some(user_id));
                info!(task_id, cancelled_timers = cancelled, "Task reached its cap");
            }
        }
        Ok(completion)
    }
}

fn ensure_available(account: &Account, task: &Task) -> Result<()> {
    if !task.active || task.is_capped_out() {
        return Err(Error::TaskUnavailable(format!("Task {} is not active", task.id)));
    }
    if account.has_completed(&task.id) {
        return Err(Error::TaskUnavailable(format!(
            "Task {} already completed",
            task.id
        )));
    }
    Ok(())
}
