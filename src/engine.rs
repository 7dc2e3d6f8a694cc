//! Engine wiring
//!
//! Builds every component over one shared [`LedgerStore`] and exposes the
//! entry points the transport layer calls per inbound event.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::account::AccountManager;
use crate::admin::{AdminConsole, AdminSessions};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::ledger::{Account, LedgerStore, ProfileFields, Settings, Transaction, UserId};
use crate::notify::Dispatcher;
use crate::referral::ReferralEngine;
use crate::task::{TaskEngine, TimerEvent};
use crate::transport::{Clock, MembershipChecker, Notifier};
use crate::withdrawal::WithdrawalWorkflow;

/// How long an admin's multi-step flow waits for its next message
const ADMIN_FLOW_TTL: Duration = Duration::from_secs(600);

/// Capabilities supplied by the chat transport
#[derive(Clone)]
pub struct Collaborators {
    pub membership: Arc<dyn MembershipChecker>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

/// Result of a user's first contact (or any later `/start`)
#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub account: Account,
    pub created: bool,
    /// Referral credit paid to the referrer, if this start attributed one
    pub referral: Option<Transaction>,
}

pub struct RewardEngine {
    config: EngineConfig,
    store: Arc<LedgerStore>,
    dispatcher: Dispatcher,
    accounts: Arc<AccountManager>,
    referrals: ReferralEngine,
    tasks: Arc<TaskEngine>,
    withdrawals: Arc<WithdrawalWorkflow>,
    admin: AdminConsole,
    sessions: Arc<AdminSessions>,
}

impl RewardEngine {
    /// Open the configured snapshot (or start empty) and wire the components
    pub async fn open(
        config: EngineConfig,
        collaborators: Collaborators,
        timer_events: Option<mpsc::Sender<TimerEvent>>,
    ) -> Result<Self> {
        let settings = config
            .defaults
            .to_settings()
            .map_err(|e| Error::InvalidInput(format!("Invalid settings defaults: {:#}", e)))?;
        let store = Arc::new(LedgerStore::open(config.store.clone(), settings).await?);
        Ok(Self::with_store(config, store, collaborators, timer_events))
    }

    pub fn with_store(
        config: EngineConfig,
        store: Arc<LedgerStore>,
        collaborators: Collaborators,
        timer_events: Option<mpsc::Sender<TimerEvent>>,
    ) -> Self {
        let Collaborators {
            membership,
            notifier,
            clock,
        } = collaborators;

        let dispatcher = Dispatcher::new(notifier, &config.notify);
        let accounts = Arc::new(AccountManager::new(store.clone(), clock.clone()));
        let referrals = ReferralEngine::new(store.clone(), clock.clone());

        let mut tasks = TaskEngine::new(store.clone(), clock.clone(), membership, config.tasks.clone());
        if let Some(events) = timer_events {
            tasks = tasks.with_events(events);
        }
        let tasks = Arc::new(tasks);

        let withdrawals = Arc::new(WithdrawalWorkflow::new(
            store.clone(),
            clock.clone(),
            dispatcher.clone(),
        ));
        let sessions = Arc::new(AdminSessions::new(ADMIN_FLOW_TTL));
        let admin = AdminConsole::new(
            store.clone(),
            clock,
            accounts.clone(),
            tasks.clone(),
            withdrawals.clone(),
            sessions.clone(),
        );

        info!(
            accounts = store.account_count(),
            snapshot = config.store.snapshot_path.as_deref().unwrap_or("(in-memory)"),
            "Reward engine ready"
        );

        Self {
            config,
            store,
            dispatcher,
            accounts,
            referrals,
            tasks,
            withdrawals,
            admin,
            sessions,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<LedgerStore> {
        &self.store
    }

    pub fn settings(&self) -> Settings {
        self.store.settings()
    }

    pub fn accounts(&self) -> &AccountManager {
        &self.accounts
    }

    pub fn referrals(&self) -> &ReferralEngine {
        &self.referrals
    }

    /// Shared handle, needed to start view countdowns
    pub fn tasks(&self) -> &Arc<TaskEngine> {
        &self.tasks
    }

    pub fn withdrawals(&self) -> &WithdrawalWorkflow {
        &self.withdrawals
    }

    pub fn admin(&self) -> &AdminConsole {
        &self.admin
    }

    /// Resolve or create the account; a brand-new account may be attributed
    /// to the owner of `referral_code`
    pub async fn start(
        &self,
        user_id: UserId,
        profile: ProfileFields,
        referral_code: Option<&str>,
    ) -> Result<StartOutcome> {
        let (account, created) = self.accounts.get_or_create(user_id, profile).await?;

        let referral = match (created, referral_code) {
            (true, Some(code)) => self.referrals.attribute(user_id, code).await?,
            (false, Some(_)) => {
                debug!(user_id, "Ignoring referral code for existing account");
                None
            }
            _ => None,
        };

        if let Some(tx) = &referral {
            let text = format!("You earned {} for inviting a new user!", tx.amount);
            self.dispatcher.notify(tx.user_id, &text).await;
        }

        let account = match referral {
            Some(_) => self.accounts.get(user_id)?,
            None => account,
        };
        Ok(StartOutcome {
            account,
            created,
            referral,
        })
    }

    pub async fn save(&self) -> Result<()> {
        self.store.save().await
    }

    /// Periodically snapshot the store until `shutdown` fires, then save once more
    pub fn spawn_autosave(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let secs = self.config.store.autosave_secs;
        if secs == 0 || self.config.store.snapshot_path.is_none() {
            return None;
        }

        let store = self.store.clone();
        let sessions = self.sessions.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(secs));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.save().await {
                            error!(error = %e, "Autosave failed");
                        }
                        let purged = sessions.purge_expired();
                        if purged > 0 {
                            debug!(purged, "Expired admin flows dropped");
                        }
                    }
                }
            }
            if let Err(e) = store.save().await {
                error!(error = %e, "Final save failed");
            }
            info!("Autosave stopped");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::AdjustDirection;
    use crate::amount::Amount;
    use crate::config::{SettingsDefaults, StoreConfig};
    use crate::transport::{RecordingNotifier, StaticMembership, SystemClock};

    fn test_config(snapshot_path: Option<String>) -> EngineConfig {
        EngineConfig {
            store: StoreConfig {
                snapshot_path,
                lock_timeout_ms: 1_000,
                autosave_secs: 5,
                ..Default::default()
            },
            defaults: SettingsDefaults {
                admin_ids: vec![1],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn collaborators(notifier: Arc<RecordingNotifier>) -> Collaborators {
        Collaborators {
            membership: Arc::new(StaticMembership::new()),
            notifier,
            clock: Arc::new(SystemClock),
        }
    }

    #[tokio::test]
    async fn test_start_attributes_only_new_accounts() {
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = RewardEngine::open(test_config(None), collaborators(notifier.clone()), None)
            .await
            .unwrap();

        engine.start(10, ProfileFields::default(), None).await.unwrap();
        let outcome = engine
            .start(20, ProfileFields::default(), Some("10"))
            .await
            .unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.account.referred_by, Some(10));
        assert!(outcome.referral.is_some());
        assert_eq!(notifier.messages_for(10).len(), 1);

        // An existing account cannot be attributed later
        engine.start(30, ProfileFields::default(), None).await.unwrap();
        let later = engine
            .start(30, ProfileFields::default(), Some("10"))
            .await
            .unwrap();
        assert!(!later.created);
        assert!(later.referral.is_none());
        assert_eq!(later.account.referred_by, None);

        let referrer = engine.accounts().get(10).unwrap();
        assert_eq!(referrer.balance, Amount::from_units(2_000));
        assert_eq!(referrer.referral_count, 1);
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json").to_string_lossy().to_string();

        {
            let engine = RewardEngine::open(
                test_config(Some(path.clone())),
                collaborators(Arc::new(RecordingNotifier::new())),
                None,
            )
            .await
            .unwrap();
            engine.start(10, ProfileFields::default(), None).await.unwrap();
            engine.start(20, ProfileFields::default(), Some("10")).await.unwrap();
            engine.save().await.unwrap();
        }

        let engine = RewardEngine::open(
            test_config(Some(path)),
            collaborators(Arc::new(RecordingNotifier::new())),
            None,
        )
        .await
        .unwrap();
        assert_eq!(engine.store().account_count(), 2);
        assert_eq!(engine.accounts().get(20).unwrap().referred_by, Some(10));
        assert_eq!(engine.accounts().history(10, 10).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_autosave_writes_final_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let engine = RewardEngine::open(
            test_config(Some(path.to_string_lossy().to_string())),
            collaborators(Arc::new(RecordingNotifier::new())),
            None,
        )
        .await
        .unwrap();
        engine.start(1, ProfileFields::default(), None).await.unwrap();

        let shutdown = CancellationToken::new();
        let handle = engine.spawn_autosave(shutdown.clone()).unwrap();
        shutdown.cancel();
        handle.await.unwrap();

        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_settled_withdrawal_survives_crash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json").to_string_lossy().to_string();

        let approved = {
            let engine = RewardEngine::open(
                test_config(Some(path.clone())),
                collaborators(Arc::new(RecordingNotifier::new())),
                None,
            )
            .await
            .unwrap();
            engine.start(20, ProfileFields::default(), None).await.unwrap();
            engine
                .admin()
                .adjust_balance(1, 20, Amount::from_units(50_000), AdjustDirection::Credit)
                .await
                .unwrap();
            let request = engine
                .withdrawals()
                .request(20, Amount::from_units(30_000))
                .await
                .unwrap();
            // Dropped without a save
            engine.withdrawals().approve(1, &request.id).await.unwrap()
        };

        let engine = RewardEngine::open(
            test_config(Some(path)),
            collaborators(Arc::new(RecordingNotifier::new())),
            None,
        )
        .await
        .unwrap();
        let account = engine.accounts().get(20).unwrap();
        assert_eq!(account.balance, Amount::from_units(20_000));
        assert_eq!(account.pending_withdrawal, Amount::ZERO);
        let restored = engine.store().read_transaction(&approved.id).unwrap();
        assert_eq!(restored.status, approved.status);
        assert!(engine.withdrawals().list_pending(10).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_autosave_purges_expired_admin_flows() {
        let dir = tempfile::tempdir().unwrap();
        let engine = RewardEngine::open(
            test_config(Some(dir.path().join("ledger.json").to_string_lossy().to_string())),
            collaborators(Arc::new(RecordingNotifier::new())),
            None,
        )
        .await
        .unwrap();
        engine.admin().begin_setting(1, "min_withdrawal").unwrap();

        let shutdown = CancellationToken::new();
        let handle = engine.spawn_autosave(shutdown.clone()).unwrap();
        tokio::time::sleep(ADMIN_FLOW_TTL + Duration::from_secs(10)).await;

        assert_eq!(engine.sessions.purge_expired(), 0);
        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_autosave_disabled_without_snapshot() {
        let engine = RewardEngine::open(
            test_config(None),
            collaborators(Arc::new(RecordingNotifier::new())),
            None,
        )
        .await
        .unwrap();
        assert!(engine.spawn_autosave(CancellationToken::new()).is_none());
    }
}
