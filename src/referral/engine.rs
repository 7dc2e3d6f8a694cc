//! Referral engine
//!
//! Links a new user to the owner of a referral code exactly once and credits
//! the referrer. The `referred_by` check, the link, the referrer's counter and
//! the credit all commit together under both account locks.

use std::sync::Arc;
use tracing::{debug, info};

use crate::account::manager::apply_balance_delta;
use crate::error::{Error, Result};
use crate::ledger::{Commit, LedgerStore, Transaction, TransactionKind, TransactionStatus, UserId};
use crate::transport::Clock;

pub struct ReferralEngine {
    store: Arc<LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl ReferralEngine {
    pub fn new(store: Arc<LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Attribute `new_user_id` to the owner of `code`
    ///
    /// Returns `None` without changing anything when the code is unknown or
    /// the user's own, or when the user is already attributed. The reward is
    /// the `referral_reward` setting read inside the committing step. A zero
    /// reward still links the accounts but writes no transaction.
    pub async fn attribute(&self, new_user_id: UserId, code: &str) -> Result<Option<Transaction>> {
        let referrer_id = match self.store.resolve_referral_code(code) {
            Some(id) => id,
            None => {
                debug!(user_id = new_user_id, code, "Unknown referral code");
                return Ok(None);
            }
        };

        if referrer_id == new_user_id {
            debug!(user_id = new_user_id, "Ignoring self-referral");
            return Ok(None);
        }

        let key = format!("referral:{}", new_user_id);
        let outcome = self
            .store
            .retrying(&key, || self.try_attribute(new_user_id, referrer_id))
            .await?;

        if let Some(tx) = &outcome {
            info!(
                user_id = new_user_id,
                referrer_id,
                reward = %tx.amount,
                "Referral attributed"
            );
        }
        Ok(outcome)
    }

    async fn try_attribute(
        &self,
        new_user_id: UserId,
        referrer_id: UserId,
    ) -> Result<Option<Transaction>> {
        // Ascending id order so two opposite attributions cannot deadlock
        let (first, second) = if new_user_id < referrer_id {
            (new_user_id, referrer_id)
        } else {
            (referrer_id, new_user_id)
        };
        let _first = self.store.lock_account(first).await?;
        let _second = self.store.lock_account(second).await?;

        let mut referee = self
            .store
            .read_account(new_user_id)
            .ok_or(Error::AccountNotFound(new_user_id))?;
        let mut referrer = self
            .store
            .read_account(referrer_id)
            .ok_or(Error::AccountNotFound(referrer_id))?;

        if referee.referred_by.is_some() {
            debug!(user_id = new_user_id, "Already attributed");
            return Ok(None);
        }

        let reward = self.store.settings().referral_reward;
        referee.referred_by = Some(referrer_id);
        referrer.referral_count += 1;

        let mut batch = Commit::new();
        let mut credited = None;
        if reward.is_positive() {
            apply_balance_delta(&mut referrer, reward)?;
            let tx = Transaction::new(
                referrer_id,
                reward,
                TransactionKind::Referral,
                TransactionStatus::Completed,
                self.clock.now(),
                format!("Referral from user {}", new_user_id),
            );
            batch = batch.transaction(tx.clone());
            credited = Some(tx);
        }

        self.store.commit(batch.account(referee).account(referrer))?;
        Ok(credited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Amount;
    use crate::config::StoreConfig;
    use crate::ledger::{Account, ProfileFields, Settings};
    use crate::transport::SystemClock;
    use chrono::Utc;

    fn test_store(reward_units: i64) -> Arc<LedgerStore> {
        Arc::new(LedgerStore::new(
            StoreConfig {
                lock_timeout_ms: 1_000,
                ..Default::default()
            },
            Settings {
                referral_reward: Amount::from_units(reward_units),
                min_withdrawal: Amount::from_whole(1),
                payment_details: String::new(),
                channel_to_join: None,
                admin_ids: Default::default(),
            },
        ))
    }

    async fn seed(store: &LedgerStore, ids: &[UserId]) {
        for id in ids {
            store
                .insert_account_if_absent(Account::new(*id, ProfileFields::default(), Utc::now()))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_attribution_credits_referrer_once() {
        let store = test_store(2_000);
        seed(&store, &[10, 20]).await;
        let engine = ReferralEngine::new(store.clone(), Arc::new(SystemClock));

        let tx = engine.attribute(20, "10").await.unwrap().unwrap();
        assert_eq!(tx.user_id, 10);
        assert_eq!(tx.kind, TransactionKind::Referral);
        assert_eq!(tx.details, "Referral from user 20");

        assert!(engine.attribute(20, "10").await.unwrap().is_none());

        let referrer = store.read_account(10).unwrap();
        assert_eq!(referrer.balance, Amount::from_units(2_000));
        assert_eq!(referrer.referral_count, 1);
        assert_eq!(store.read_account(20).unwrap().referred_by, Some(10));
    }

    #[tokio::test]
    async fn test_self_and_unknown_codes_are_ignored() {
        let store = test_store(2_000);
        seed(&store, &[1]).await;
        let engine = ReferralEngine::new(store.clone(), Arc::new(SystemClock));

        assert!(engine.attribute(1, "1").await.unwrap().is_none());
        assert!(engine.attribute(1, "404").await.unwrap().is_none());
        assert!(engine.attribute(1, "not-a-code").await.unwrap().is_none());
        assert_eq!(store.read_account(1).unwrap().referred_by, None);
        assert!(store.transactions_where(10, |_| true).is_empty());
    }

    #[tokio::test]
    async fn test_first_referrer_wins() {
        let store = test_store(2_000);
        seed(&store, &[1, 2, 3]).await;
        let engine = ReferralEngine::new(store.clone(), Arc::new(SystemClock));

        engine.attribute(3, "1").await.unwrap();
        assert!(engine.attribute(3, "2").await.unwrap().is_none());

        assert_eq!(store.read_account(3).unwrap().referred_by, Some(1));
        assert_eq!(store.read_account(2).unwrap().balance, Amount::ZERO);
    }

    #[tokio::test]
    async fn test_concurrent_attribution_credits_once() {
        let store = test_store(2_000);
        seed(&store, &[100, 200]).await;
        let engine = Arc::new(ReferralEngine::new(store.clone(), Arc::new(SystemClock)));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move { engine.attribute(200, "100").await }));
        }

        let mut credited = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_some() {
                credited += 1;
            }
        }

        assert_eq!(credited, 1);
        let referrer = store.read_account(100).unwrap();
        assert_eq!(referrer.balance, Amount::from_units(2_000));
        assert_eq!(referrer.referral_count, 1);
    }

    #[tokio::test]
    async fn test_mutual_attribution_does_not_deadlock() {
        let store = test_store(2_000);
        seed(&store, &[7, 8]).await;
        let engine = Arc::new(ReferralEngine::new(store.clone(), Arc::new(SystemClock)));

        let a = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.attribute(7, "8").await })
        };
        let b = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.attribute(8, "7").await })
        };

        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_reward_fixed_at_attribution_time() {
        let store = test_store(2_000);
        seed(&store, &[1, 2]).await;
        let engine = ReferralEngine::new(store.clone(), Arc::new(SystemClock));

        let tx = engine.attribute(2, "1").await.unwrap().unwrap();
        store
            .update_settings(|s| {
                s.referral_reward = Amount::from_whole(5);
                Ok(())
            })
            .unwrap();

        assert_eq!(store.read_transaction(&tx.id).unwrap().amount, Amount::from_units(2_000));
        assert_eq!(store.read_account(1).unwrap().balance, Amount::from_units(2_000));
    }

    #[tokio::test]
    async fn test_zero_reward_links_without_transaction() {
        let store = test_store(0);
        seed(&store, &[1, 2]).await;
        let engine = ReferralEngine::new(store.clone(), Arc::new(SystemClock));

        assert!(engine.attribute(2, "1").await.unwrap().is_none());
        assert_eq!(store.read_account(2).unwrap().referred_by, Some(1));
        assert_eq!(store.read_account(1).unwrap().referral_count, 1);
        assert!(store.transactions_where(10, |_| true).is_empty());
    }
}
