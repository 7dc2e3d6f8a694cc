//! Account manager
//!
//! Lazily creates accounts and applies balance deltas. Every delta is
//! validated against the non-negative balance rule and committed together
//! with its audit transaction.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::amount::Amount;
use crate::error::{Error, Result};
use crate::ledger::{
    Account, LedgerStore, ProfileFields, Transaction, TransactionKind, TransactionStatus, UserId,
};
use crate::transport::Clock;

/// Read-only view of an account for rendering
#[derive(Debug, Clone, Serialize)]
pub struct AccountSummary {
    pub user_id: UserId,
    pub username: Option<String>,
    pub balance: Amount,
    pub pending_withdrawal: Amount,
    pub referral_code: String,
    pub referred_by: Option<UserId>,
    pub referral_count: u32,
    pub referral_earnings: Amount,
    pub completed_tasks: usize,
}

/// Apply a signed delta to an account copy, enforcing `balance >= 0`
pub(crate) fn apply_balance_delta(account: &mut Account, amount: Amount) -> Result<()> {
    let next = account
        .balance
        .checked_add(amount)
        .ok_or_else(|| Error::InvalidInput(format!("Amount {} overflows balance", amount)))?;

    if next.is_negative() {
        return Err(Error::InsufficientFunds {
            available: account.balance,
            required: amount.abs(),
        });
    }

    account.balance = next;
    Ok(())
}

/// Account manager
pub struct AccountManager {
    store: Arc<LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl AccountManager {
    pub fn new(store: Arc<LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Idempotent upsert
    ///
    /// Returns the account and whether it was created by this call. Existing
    /// accounts only get their profile fields refreshed.
    pub async fn get_or_create(
        &self,
        user_id: UserId,
        profile: ProfileFields,
    ) -> Result<(Account, bool)> {
        if let Some(existing) = self.store.read_account(user_id) {
            if existing.username == profile.username && existing.first_name == profile.first_name {
                return Ok((existing, false));
            }
            let (account, _) = self
                .store
                .atomic_update(user_id, |account, commit| {
                    account.username = profile.username.clone();
                    account.first_name = profile.first_name.clone();
                    Ok((commit, ()))
                })
                .await?;
            debug!(user_id, "Refreshed profile fields");
            return Ok((account, false));
        }

        let fresh = Account::new(user_id, profile, self.clock.now());
        let (account, created) = self.store.insert_account_if_absent(fresh).await?;
        if created {
            info!(user_id, "Created account");
        }
        Ok((account, created))
    }

    /// Fetch an existing account
    pub fn get(&self, user_id: UserId) -> Result<Account> {
        self.store
            .read_account(user_id)
            .ok_or(Error::AccountNotFound(user_id))
    }

    /// Atomically apply a signed balance delta and record its transaction
    ///
    /// Debits that would leave a negative balance fail with
    /// `InsufficientFunds` and change nothing.
    pub async fn apply_delta(
        &self,
        user_id: UserId,
        amount: Amount,
        kind: TransactionKind,
        details: &str,
    ) -> Result<Transaction> {
        if amount.is_zero() {
            return Err(Error::InvalidInput("Amount must be non-zero".to_string()));
        }
        if kind == TransactionKind::Withdrawal {
            return Err(Error::InvalidInput(
                "Withdrawals go through the withdrawal workflow".to_string(),
            ));
        }

        let now = self.clock.now();
        let (account, transaction) = self
            .store
            .atomic_update(user_id, |account, commit| {
                apply_balance_delta(account, amount)?;
                let transaction = Transaction::new(
                    user_id,
                    amount,
                    kind,
                    TransactionStatus::Completed,
                    now,
                    details,
                );
                Ok((commit.transaction(transaction.clone()), transaction))
            })
            .await?;

        info!(
            user_id,
            amount = %amount,
            kind = %kind,
            balance = %account.balance,
            "Applied balance delta"
        );
        Ok(transaction)
    }

    /// Newest-first transactions of one user
    pub fn history(&self, user_id: UserId, limit: usize) -> Vec<Transaction> {
        self.store
            .transactions_where(limit, |t| t.user_id == user_id)
    }

    /// Account summary including referral earnings
    pub fn summary(&self, user_id: UserId) -> Result<AccountSummary> {
        let account = self.get(user_id)?;
        let referral_earnings: Amount = self
            .store
            .transactions_where(usize::MAX, |t| {
                t.user_id == user_id && t.kind == TransactionKind::Referral
            })
            .iter()
            .map(|t| t.amount)
            .sum();

        Ok(AccountSummary {
            user_id,
            username: account.username,
            balance: account.balance,
            pending_withdrawal: account.pending_withdrawal,
            referral_code: account.referral_code,
            referred_by: account.referred_by,
            referral_count: account.referral_count,
            referral_earnings,
            completed_tasks: account.completed_task_ids.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::ledger::Settings;
    use crate::transport::SystemClock;

    fn test_manager() -> AccountManager {
        let store = Arc::new(LedgerStore::new(
            StoreConfig {
                lock_timeout_ms: 1_000,
                ..Default::default()
            },
            Settings {
                referral_reward: Amount::from_units(2_000),
                min_withdrawal: Amount::from_whole(1),
                payment_details: String::new(),
                channel_to_join: None,
                admin_ids: Default::default(),
            },
        ));
        AccountManager::new(store, Arc::new(SystemClock))
    }

    fn profile(name: &str) -> ProfileFields {
        ProfileFields {
            username: Some(name.to_string()),
            first_name: None,
        }
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let manager = test_manager();
        let (_, created) = manager.get_or_create(1, profile("alice")).await.unwrap();
        assert!(created);

        manager
            .apply_delta(1, Amount::from_whole(2), TransactionKind::AdminAdjustment, "seed")
            .await
            .unwrap();

        let (account, created) = manager.get_or_create(1, profile("alice2")).await.unwrap();
        assert!(!created);
        assert_eq!(account.balance, Amount::from_whole(2));
        assert_eq!(account.username.as_deref(), Some("alice2"));
    }

    #[tokio::test]
    async fn test_debit_cannot_go_negative() {
        let manager = test_manager();
        manager.get_or_create(2, profile("bob")).await.unwrap();
        manager
            .apply_delta(2, Amount::from_units(5_000), TransactionKind::AdminAdjustment, "")
            .await
            .unwrap();

        let result = manager
            .apply_delta(2, Amount::from_units(-5_001), TransactionKind::AdminAdjustment, "")
            .await;
        assert!(matches!(result, Err(Error::InsufficientFunds { .. })));
        assert_eq!(manager.get(2).unwrap().balance, Amount::from_units(5_000));
        assert_eq!(manager.history(2, 10).len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let manager = test_manager();
        let result = manager
            .apply_delta(77, Amount::from_whole(1), TransactionKind::TaskReward, "")
            .await;
        assert!(matches!(result, Err(Error::AccountNotFound(77))));
    }

    #[tokio::test]
    async fn test_rejects_zero_and_withdrawal_kind() {
        let manager = test_manager();
        manager.get_or_create(3, profile("carol")).await.unwrap();
        assert!(manager
            .apply_delta(3, Amount::ZERO, TransactionKind::TaskReward, "")
            .await
            .is_err());
        assert!(manager
            .apply_delta(3, Amount::from_whole(1), TransactionKind::Withdrawal, "")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_concurrent_debits_never_overdraw() {
        let manager = Arc::new(test_manager());
        manager.get_or_create(4, profile("dave")).await.unwrap();
        manager
            .apply_delta(4, Amount::from_whole(10), TransactionKind::AdminAdjustment, "")
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..25 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .apply_delta(4, Amount::from_whole(-1), TransactionKind::AdminAdjustment, "")
                    .await
            }));
        }

        let mut ok = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                ok += 1;
            }
        }

        assert_eq!(ok, 10);
        assert_eq!(manager.get(4).unwrap().balance, Amount::ZERO);
    }

    #[tokio::test]
    async fn test_summary_counts_referral_earnings() {
        let manager = test_manager();
        manager.get_or_create(5, profile("erin")).await.unwrap();
        manager
            .apply_delta(5, Amount::from_units(2_000), TransactionKind::Referral, "from 6")
            .await
            .unwrap();
        manager
            .apply_delta(5, Amount::from_units(1_000), TransactionKind::TaskReward, "t1")
            .await
            .unwrap();

        let summary = manager.summary(5).unwrap();
        assert_eq!(summary.referral_earnings, Amount::from_units(2_000));
        assert_eq!(summary.balance, Amount::from_units(3_000));
    }
}
