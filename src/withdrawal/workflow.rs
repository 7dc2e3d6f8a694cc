//! Withdrawal workflow
//!
//! `Requested -> Paid | Rejected`. A request moves funds from `balance` to
//! `pending_withdrawal`; approval releases them from the system; rejection
//! moves them back. Every step commits the account row and the withdrawal
//! record together, with the account lock taken before the transaction lock.

use std::sync::Arc;
use tracing::{info, warn};

use crate::account::manager::apply_balance_delta;
use crate::amount::Amount;
use crate::error::{Error, Result};
use crate::ledger::{
    Account, Commit, LedgerStore, Transaction, TransactionKind, TransactionStatus, UserId,
};
use crate::notify::Dispatcher;
use crate::transport::Clock;

pub struct WithdrawalWorkflow {
    store: Arc<LedgerStore>,
    clock: Arc<dyn Clock>,
    dispatcher: Dispatcher,
}

impl WithdrawalWorkflow {
    pub fn new(store: Arc<LedgerStore>, clock: Arc<dyn Clock>, dispatcher: Dispatcher) -> Self {
        Self {
            store,
            clock,
            dispatcher,
        }
    }

    /// Earmark `amount` for payout and notify admins
    pub async fn request(&self, user_id: UserId, amount: Amount) -> Result<Transaction> {
        let settings = self.store.settings();
        if !amount.is_positive() {
            return Err(Error::InvalidInput("Amount must be positive".to_string()));
        }
        if amount < settings.min_withdrawal {
            return Err(Error::BelowMinimum {
                amount,
                minimum: settings.min_withdrawal,
            });
        }

        let now = self.clock.now();
        let (account, transaction) = self
            .store
            .atomic_update(user_id, |account, commit| {
                if amount > account.balance {
                    return Err(Error::InsufficientFunds {
                        available: account.balance,
                        required: amount,
                    });
                }
                apply_balance_delta(account, -amount)?;
                account.pending_withdrawal = account.pending_withdrawal + amount;

                let transaction = Transaction::new(
                    user_id,
                    amount,
                    TransactionKind::Withdrawal,
                    TransactionStatus::Pending,
                    now,
                    "Pending admin approval",
                );
                Ok((commit.transaction(transaction.clone()), transaction))
            })
            .await?;

        info!(
            user_id,
            amount = %amount,
            transaction_id = %transaction.id,
            balance = %account.balance,
            pending = %account.pending_withdrawal,
            "Withdrawal requested"
        );

        let who = account
            .username
            .as_deref()
            .map(|u| format!("@{}", u))
            .unwrap_or_else(|| user_id.to_string());
        let text = format!(
            "New withdrawal request\n\nUser: {}\nUser ID: {}\nAmount: {}\nRequest: {}",
            who, user_id, amount, transaction.id
        );
        let delivered = self
            .dispatcher
            .notify_admins(settings.admin_ids.iter(), &text)
            .await;
        if delivered < settings.admin_ids.len() {
            warn!(
                transaction_id = %transaction.id,
                delivered,
                admins = settings.admin_ids.len(),
                "Not every admin was notified"
            );
        }

        Ok(transaction)
    }

    /// Mark a pending withdrawal as paid
    pub async fn approve(&self, admin_id: UserId, transaction_id: &str) -> Result<Transaction> {
        self.authorize(admin_id)?;

        let approved = self
            .settle(transaction_id, |account, transaction| {
                account.pending_withdrawal =
                    release_pending(account.pending_withdrawal, transaction.amount)?;
                transaction.status = TransactionStatus::Completed;
                Ok(())
            })
            .await?;

        info!(
            admin_id,
            user_id = approved.user_id,
            transaction_id,
            amount = %approved.amount,
            "Withdrawal approved"
        );

        let text = format!(
            "Your withdrawal request has been approved!\n\nAmount: {}\nProcessed at: {}",
            approved.amount,
            self.clock.now().format("%Y-%m-%d %H:%M:%S")
        );
        self.dispatcher.notify(approved.user_id, &text).await;
        Ok(approved)
    }

    /// Return the funds of a pending withdrawal to the user's balance
    pub async fn reject(
        &self,
        admin_id: UserId,
        transaction_id: &str,
        reason: &str,
    ) -> Result<Transaction> {
        self.authorize(admin_id)?;
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(Error::InvalidInput("A rejection reason is required".to_string()));
        }

        let rejected = self
            .settle(transaction_id, |account, transaction| {
                account.pending_withdrawal =
                    release_pending(account.pending_withdrawal, transaction.amount)?;
                apply_balance_delta(account, transaction.amount)?;
                transaction.status = TransactionStatus::Rejected;
                transaction.details = format!("Rejected: {}", reason);
                Ok(())
            })
            .await?;

        info!(
            admin_id,
            user_id = rejected.user_id,
            transaction_id,
            amount = %rejected.amount,
            reason,
            "Withdrawal rejected"
        );

        let text = format!(
            "Your withdrawal request has been rejected\n\nAmount: {}\nReason: {}\n\nThe amount has been returned to your balance.",
            rejected.amount, reason
        );
        self.dispatcher.notify(rejected.user_id, &text).await;
        Ok(rejected)
    }

    /// Pending withdrawals, oldest first
    pub fn list_pending(&self, limit: usize) -> Vec<Transaction> {
        let mut pending = self
            .store
            .transactions_where(usize::MAX, |t| t.is_pending_withdrawal());
        pending.reverse();
        pending.truncate(limit);
        pending
    }

    fn authorize(&self, admin_id: UserId) -> Result<()> {
        if self.store.settings().is_admin(admin_id) {
            Ok(())
        } else {
            warn!(admin_id, "Rejected admin action from non-admin");
            Err(Error::Unauthorized(admin_id))
        }
    }

    /// Apply a terminal transition to a pending withdrawal and its account
    async fn settle<F>(&self, transaction_id: &str, transition: F) -> Result<Transaction>
    where
        F: Fn(&mut Account, &mut Transaction) -> Result<()>,
    {
        let owner = self
            .store
            .read_transaction(transaction_id)
            .ok_or_else(|| Error::TransactionNotFound(transaction_id.to_string()))?
            .user_id;
        let transition = &transition;

        self.store
            .retrying(&format!("withdrawal:{}", transaction_id), || async move {
                let _account_lock = self.store.lock_account(owner).await?;
                let _tx_lock = self.store.lock_transaction(transaction_id).await?;

                let mut transaction = self
                    .store
                    .read_transaction(transaction_id)
                    .ok_or_else(|| Error::TransactionNotFound(transaction_id.to_string()))?;
                if !transaction.is_pending_withdrawal() {
                    return Err(Error::NotPending(format!(
                        "Transaction {} is {} {}",
                        transaction_id, transaction.status, transaction.kind
                    )));
                }
                let mut account = self
                    .store
                    .read_account(owner)
                    .ok_or(Error::AccountNotFound(owner))?;

                transition(&mut account, &mut transaction)?;
                self.store.commit(
                    Commit::new()
                        .account(account)
                        .transaction(transaction.clone()),
                )?;
                Ok(transaction)
            })
            .await
    }
}

fn release_pending(pending: Amount, amount: Amount) -> Result<Amount> {
    match pending.checked_sub(amount) {
        Some(left) if !left.is_negative() => Ok(left),
        _ => Err(Error::InsufficientFunds {
            available: pending,
            required: amount,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NotifyConfig, StoreConfig};
    use crate::ledger::{ProfileFields, Settings};
    use crate::transport::{FailingNotifier, Notifier, RecordingNotifier, SystemClock};
    use chrono::Utc;
    use std::collections::BTreeSet;

    const ADMIN: UserId = 1;

    fn test_store() -> Arc<LedgerStore> {
        Arc::new(LedgerStore::new(
            StoreConfig {
                lock_timeout_ms: 1_000,
                ..Default::default()
            },
            Settings {
                referral_reward: Amount::from_units(2_000),
                min_withdrawal: Amount::from_whole(1),
                payment_details: String::new(),
                channel_to_join: None,
                admin_ids: BTreeSet::from([ADMIN]),
            },
        ))
    }

    async fn funded(store: &LedgerStore, user_id: UserId, whole: i64) {
        store
            .insert_account_if_absent(Account::new(user_id, ProfileFields::default(), Utc::now()))
            .await
            .unwrap();
        store
            .atomic_update(user_id, |account, commit| {
                account.balance = Amount::from_whole(whole);
                Ok((commit, ()))
            })
            .await
            .unwrap();
    }

    fn workflow(store: Arc<LedgerStore>, notifier: Arc<dyn Notifier>) -> WithdrawalWorkflow {
        WithdrawalWorkflow::new(
            store,
            Arc::new(SystemClock),
            Dispatcher::new(notifier, &NotifyConfig::default()),
        )
    }

    fn amount(s: &str) -> Amount {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_request_then_approve_scenario() {
        let store = test_store();
        funded(&store, 2, 5).await;
        let notifier = Arc::new(RecordingNotifier::new());
        let flow = workflow(store.clone(), notifier.clone());

        let tx = flow.request(2, amount("3.0000")).await.unwrap();
        assert_eq!(tx.status, TransactionStatus::Pending);
        let account = store.read_account(2).unwrap();
        assert_eq!(account.balance, amount("2.0000"));
        assert_eq!(account.pending_withdrawal, amount("3.0000"));
        assert_eq!(notifier.messages_for(ADMIN).len(), 1);

        let approved = flow.approve(ADMIN, &tx.id).await.unwrap();
        assert_eq!(approved.status, TransactionStatus::Completed);
        let account = store.read_account(2).unwrap();
        assert_eq!(account.pending_withdrawal, Amount::ZERO);
        assert_eq!(account.balance, amount("2.0000"));
        assert_eq!(notifier.messages_for(2).len(), 1);
    }

    #[tokio::test]
    async fn test_below_minimum_changes_nothing() {
        let store = test_store();
        funded(&store, 2, 5).await;
        let flow = workflow(store.clone(), Arc::new(RecordingNotifier::new()));

        let result = flow.request(2, amount("0.5000")).await;
        assert!(matches!(result, Err(Error::BelowMinimum { .. })));
        let account = store.read_account(2).unwrap();
        assert_eq!(account.balance, amount("5.0000"));
        assert_eq!(account.pending_withdrawal, Amount::ZERO);
        assert!(store.transactions_where(10, |_| true).is_empty());
    }

    #[tokio::test]
    async fn test_request_over_balance_fails() {
        let store = test_store();
        funded(&store, 2, 5).await;
        let flow = workflow(store.clone(), Arc::new(RecordingNotifier::new()));

        let result = flow.request(2, amount("5.0001")).await;
        assert!(matches!(result, Err(Error::InsufficientFunds { .. })));
        assert_eq!(store.read_account(2).unwrap().balance, amount("5.0000"));
    }

    #[tokio::test]
    async fn test_reject_round_trip_is_net_zero() {
        let store = test_store();
        funded(&store, 3, 100).await;
        let notifier = Arc::new(RecordingNotifier::new());
        let flow = workflow(store.clone(), notifier.clone());

        let tx = flow.request(3, amount("100")).await.unwrap();
        let rejected = flow.reject(ADMIN, &tx.id, "bad payment details").await.unwrap();

        assert_eq!(rejected.status, TransactionStatus::Rejected);
        assert_eq!(rejected.details, "Rejected: bad payment details");
        let account = store.read_account(3).unwrap();
        assert_eq!(account.balance, amount("100"));
        assert_eq!(account.pending_withdrawal, Amount::ZERO);
        assert!(notifier.messages_for(3)[0].contains("bad payment details"));
    }

    #[tokio::test]
    async fn test_second_approval_is_not_pending() {
        let store = test_store();
        funded(&store, 4, 10).await;
        let flow = workflow(store.clone(), Arc::new(RecordingNotifier::new()));

        let tx = flow.request(4, amount("4")).await.unwrap();
        flow.approve(ADMIN, &tx.id).await.unwrap();
        let again = flow.approve(ADMIN, &tx.id).await;
        assert!(matches!(again, Err(Error::NotPending(_))));
        assert!(matches!(
            flow.reject(ADMIN, &tx.id, "late").await,
            Err(Error::NotPending(_))
        ));

        let account = store.read_account(4).unwrap();
        assert_eq!(account.balance, amount("6"));
        assert_eq!(account.pending_withdrawal, Amount::ZERO);
    }

    #[tokio::test]
    async fn test_concurrent_approvals_apply_once() {
        let store = test_store();
        funded(&store, 4, 10).await;
        let flow = Arc::new(workflow(store.clone(), Arc::new(RecordingNotifier::new())));
        let tx = flow.request(4, amount("4")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let flow = flow.clone();
            let id = tx.id.clone();
            handles.push(tokio::spawn(async move { flow.approve(ADMIN, &id).await }));
        }
        let mut approved = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                approved += 1;
            }
        }

        assert_eq!(approved, 1);
        let account = store.read_account(4).unwrap();
        assert_eq!(account.total_holdings(), amount("6"));
    }

    #[tokio::test]
    async fn test_non_admin_and_unknown_transaction() {
        let store = test_store();
        funded(&store, 5, 10).await;
        let flow = workflow(store.clone(), Arc::new(RecordingNotifier::new()));
        let tx = flow.request(5, amount("2")).await.unwrap();

        assert!(matches!(
            flow.approve(5, &tx.id).await,
            Err(Error::Unauthorized(5))
        ));
        assert!(matches!(
            flow.approve(ADMIN, "missing").await,
            Err(Error::TransactionNotFound(_))
        ));
        assert!(matches!(
            flow.reject(ADMIN, &tx.id, "   ").await,
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(flow.list_pending(10).len(), 1);
    }

    #[tokio::test]
    async fn test_notification_failure_keeps_request() {
        let store = test_store();
        funded(&store, 6, 10).await;
        let flow = workflow(store.clone(), Arc::new(FailingNotifier));

        let tx = flow.request(6, amount("2")).await.unwrap();
        assert_eq!(store.read_transaction(&tx.id).unwrap().status, TransactionStatus::Pending);
        assert_eq!(store.read_account(6).unwrap().pending_withdrawal, amount("2"));
    }

    #[tokio::test]
    async fn test_only_approval_reduces_holdings() {
        let store = test_store();
        funded(&store, 7, 10).await;
        let flow = workflow(store.clone(), Arc::new(RecordingNotifier::new()));

        let holdings = |store: &LedgerStore| store.read_account(7).unwrap().total_holdings();
        let a = flow.request(7, amount("3")).await.unwrap();
        let b = flow.request(7, amount("2")).await.unwrap();
        assert_eq!(holdings(&store), amount("10"));

        flow.reject(ADMIN, &a.id, "duplicate").await.unwrap();
        assert_eq!(holdings(&store), amount("10"));

        flow.approve(ADMIN, &b.id).await.unwrap();
        assert_eq!(holdings(&store), amount("8"));

        let pending = flow.list_pending(10);
        assert!(pending.is_empty());
    }
}
