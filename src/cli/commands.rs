//! CLI command implementations
//!
//! Each command opens the ledger snapshot, acts as `admin_id` through the
//! admin console and saves the snapshot again after a change.

use anyhow::{Context, Result};
use dialoguer::Confirm;
use std::sync::Arc;
use tracing::info;

use crate::admin::AdjustDirection;
use crate::amount::Amount;
use crate::config::EngineConfig;
use crate::engine::{Collaborators, RewardEngine};
use crate::ledger::{TaskKind, Transaction, UserId};
use crate::task::NewTask;
use crate::transport::{NullNotifier, StaticMembership, SystemClock};

/// Open the engine the CLI works on; requires a snapshot file
pub async fn open_engine(config: &EngineConfig) -> Result<RewardEngine> {
    if config.store.snapshot_path.is_none() {
        anyhow::bail!("store.snapshot_path is not set; the CLI needs a ledger snapshot to work on");
    }

    let collaborators = Collaborators {
        membership: Arc::new(StaticMembership::new()),
        notifier: Arc::new(NullNotifier),
        clock: Arc::new(SystemClock),
    };
    RewardEngine::open(config.clone(), collaborators, None)
        .await
        .context("Failed to open ledger")
}

/// Pick the acting admin: explicit, else the first configured one
pub fn resolve_admin(engine: &RewardEngine, admin: Option<UserId>) -> Result<UserId> {
    match admin {
        Some(id) => Ok(id),
        None => engine
            .settings()
            .admin_ids
            .iter()
            .next()
            .copied()
            .context("No admin ids configured; pass --admin"),
    }
}

fn confirm(prompt: String, force: bool) -> Result<bool> {
    if force {
        return Ok(true);
    }
    let confirmed = Confirm::new().with_prompt(prompt).default(false).interact()?;
    if !confirmed {
        info!("Cancelled by user");
    }
    Ok(confirmed)
}

fn print_transactions(transactions: &[Transaction]) {
    println!(
        "{:<38} {:<12} {:<12} {:>12} {:<10} {}",
        "ID", "DATE", "USER", "AMOUNT", "STATUS", "DETAILS"
    );
    println!("{}", "-".repeat(100));
    for tx in transactions {
        println!(
            "{:<38} {:<12} {:<12} {:>12} {:<10} {}",
            tx.id,
            tx.timestamp.format("%Y-%m-%d"),
            tx.user_id,
            tx.amount.to_string(),
            tx.status.to_string(),
            tx.details
        );
    }
}

/// Show current configuration
pub fn show_config(config: &EngineConfig) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

/// Show dashboard statistics
pub async fn stats(config: &EngineConfig, admin: Option<UserId>) -> Result<()> {
    let engine = open_engine(config).await?;
    let admin_id = resolve_admin(&engine, admin)?;
    let stats = engine.admin().stats(admin_id)?;

    println!("\n=== LEDGER STATISTICS ===\n");
    println!("Total users:            {}", stats.total_users);
    println!("Active users (30 days): {}", stats.active_users);
    println!("Total referrals:        {}", stats.total_referrals);
    println!("Completed tasks:        {}", stats.completed_tasks);
    println!("Total withdrawn:        {}", stats.total_withdrawn);
    println!(
        "Pending withdrawals:    {} ({})",
        stats.pending_withdrawals, stats.pending_amount
    );
    println!();
    Ok(())
}

/// Show one user's account and recent transactions
pub async fn user(config: &EngineConfig, admin: Option<UserId>, user_id: UserId, limit: usize) -> Result<()> {
    let engine = open_engine(config).await?;
    let admin_id = resolve_admin(&engine, admin)?;
    let summary = engine.admin().lookup_user(admin_id, user_id)?;
    let history = engine.admin().user_history(admin_id, user_id, limit)?;

    println!("\n=== USER {} ===\n", user_id);
    if let Some(username) = &summary.username {
        println!("Username:          @{}", username);
    }
    println!("Balance:           {}", summary.balance);
    println!("Pending withdrawal: {}", summary.pending_withdrawal);
    println!("Referral code:     {}", summary.referral_code);
    match summary.referred_by {
        Some(referrer) => println!("Referred by:       {}", referrer),
        None => println!("Referred by:       -"),
    }
    println!(
        "Referrals:         {} (earned {})",
        summary.referral_count, summary.referral_earnings
    );
    println!("Completed tasks:   {}", summary.completed_tasks);

    println!("\n=== RECENT TRANSACTIONS ===\n");
    if history.is_empty() {
        println!("No transactions.");
    } else {
        print_transactions(&history);
    }
    println!();
    Ok(())
}

/// List every task
pub async fn tasks(config: &EngineConfig, admin: Option<UserId>) -> Result<()> {
    let engine = open_engine(config).await?;
    let admin_id = resolve_admin(&engine, admin)?;
    let tasks = engine.admin().list_tasks(admin_id)?;

    println!("\n=== TASKS ===\n");
    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    println!(
        "{:<38} {:<8} {:>10} {:<12} {}",
        "ID", "ACTIVE", "REWARD", "DONE", "TASK"
    );
    println!("{}", "-".repeat(100));
    for task in tasks {
        let done = match task.max_completions {
            Some(max) => format!("{}/{}", task.current_completions, max),
            None => task.current_completions.to_string(),
        };
        println!(
            "{:<38} {:<8} {:>10} {:<12} {}",
            task.id,
            if task.active { "yes" } else { "no" },
            task.reward.to_string(),
            done,
            task.kind
        );
    }
    println!();
    Ok(())
}

/// Create a task
pub async fn create_task(
    config: &EngineConfig,
    admin: Option<UserId>,
    kind: TaskKind,
    reward: &str,
    max_completions: Option<u32>,
) -> Result<()> {
    let reward: Amount = reward.parse().context("Invalid reward")?;
    let engine = open_engine(config).await?;
    let admin_id = resolve_admin(&engine, admin)?;

    let task = engine.admin().create_task(
        admin_id,
        NewTask {
            kind,
            reward,
            max_completions,
        },
    )?;
    engine.save().await?;

    println!("Created task {}: {} (reward {})", task.id, task.kind, task.reward);
    Ok(())
}

/// Activate or deactivate a task
pub async fn set_task_active(
    config: &EngineConfig,
    admin: Option<UserId>,
    task_id: &str,
    active: bool,
) -> Result<()> {
    let engine = open_engine(config).await?;
    let admin_id = resolve_admin(&engine, admin)?;
    let task = engine.admin().set_task_active(admin_id, task_id, active).await?;
    engine.save().await?;

    println!(
        "Task {} is now {}",
        task.id,
        if task.active { "active" } else { "inactive" }
    );
    Ok(())
}

/// Show or change a setting
pub async fn set_setting(
    config: &EngineConfig,
    admin: Option<UserId>,
    name: Option<&str>,
    value: Option<&str>,
) -> Result<()> {
    use crate::settings::SettingName;

    let engine = open_engine(config).await?;
    let admin_id = resolve_admin(&engine, admin)?;

    let settings = match (name, value) {
        (Some(name), Some(value)) => {
            let updated = engine.admin().set_setting(admin_id, name, value)?;
            engine.save().await?;
            updated
        }
        (Some(_), None) => anyhow::bail!("A value is required to change a setting"),
        _ => engine.admin().settings(admin_id)?,
    };

    println!("\n=== SETTINGS ===\n");
    for name in SettingName::ALL {
        println!("{:<18} {}", name.as_str(), name.render(&settings));
    }
    println!();
    Ok(())
}

/// List pending withdrawals, oldest first
pub async fn pending(config: &EngineConfig, admin: Option<UserId>, limit: usize) -> Result<()> {
    let engine = open_engine(config).await?;
    let admin_id = resolve_admin(&engine, admin)?;
    let pending = engine.admin().list_pending_withdrawals(admin_id, limit)?;

    println!("\n=== PENDING WITHDRAWALS ===\n");
    if pending.is_empty() {
        println!("No pending withdrawal requests.");
    } else {
        print_transactions(&pending);
    }
    println!();
    Ok(())
}

/// Approve a pending withdrawal
pub async fn approve(
    config: &EngineConfig,
    admin: Option<UserId>,
    transaction_id: &str,
    force: bool,
) -> Result<()> {
    let engine = open_engine(config).await?;
    let admin_id = resolve_admin(&engine, admin)?;

    let tx = engine
        .store()
        .read_transaction(transaction_id)
        .with_context(|| format!("Transaction {} not found", transaction_id))?;
    if !confirm(
        format!("Mark withdrawal of {} by user {} as paid?", tx.amount, tx.user_id),
        force,
    )? {
        return Ok(());
    }

    let approved = engine.admin().approve_withdrawal(admin_id, transaction_id).await?;
    engine.save().await?;
    println!("Approved withdrawal {} ({})", approved.id, approved.amount);
    Ok(())
}

/// Reject a pending withdrawal and return the funds
pub async fn reject(
    config: &EngineConfig,
    admin: Option<UserId>,
    transaction_id: &str,
    reason: &str,
    force: bool,
) -> Result<()> {
    let engine = open_engine(config).await?;
    let admin_id = resolve_admin(&engine, admin)?;

    if !confirm(
        format!("Reject withdrawal {} ({})?", transaction_id, reason),
        force,
    )? {
        return Ok(());
    }

    let rejected = engine
        .admin()
        .reject_withdrawal(admin_id, transaction_id, reason)
        .await?;
    engine.save().await?;
    println!(
        "Rejected withdrawal {}; {} returned to user {}",
        rejected.id, rejected.amount, rejected.user_id
    );
    Ok(())
}

/// Credit or debit a user's balance
pub async fn adjust(
    config: &EngineConfig,
    admin: Option<UserId>,
    user_id: UserId,
    amount: &str,
    direction: &str,
    force: bool,
) -> Result<()> {
    let amount: Amount = amount.parse().context("Invalid amount")?;
    let direction: AdjustDirection = direction.parse()?;
    let engine = open_engine(config).await?;
    let admin_id = resolve_admin(&engine, admin)?;

    if !confirm(
        format!("Balance {} {} for user {}?", direction, amount, user_id),
        force,
    )? {
        return Ok(());
    }

    engine
        .admin()
        .adjust_balance(admin_id, user_id, amount, direction)
        .await?;
    engine.save().await?;

    let account = engine.accounts().get(user_id)?;
    println!("User {} balance is now {}", user_id, account.balance);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SettingsDefaults, StoreConfig};
    use crate::ledger::ProfileFields;
    use tokio_test::{assert_err, assert_ok};

    fn test_config(path: &std::path::Path) -> EngineConfig {
        EngineConfig {
            store: StoreConfig {
                snapshot_path: Some(path.to_string_lossy().to_string()),
                ..Default::default()
            },
            defaults: SettingsDefaults {
                admin_ids: vec![7, 3],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_open_requires_snapshot() {
        let result = open_engine(&EngineConfig::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_commands_persist_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir.path().join("ledger.json"));

        {
            let engine = open_engine(&config).await.unwrap();
            engine.start(42, ProfileFields::default(), None).await.unwrap();
            engine.save().await.unwrap();
        }

        assert_ok!(adjust(&config, None, 42, "2.5", "add", true).await);
        assert_ok!(
            create_task(
                &config,
                None,
                TaskKind::JoinChannel {
                    channel: "@rewards_channel".to_string()
                },
                "0.1",
                Some(5),
            )
            .await
        );
        assert_err!(adjust(&config, None, 42, "9", "sub", true).await);

        let engine = open_engine(&config).await.unwrap();
        assert_eq!(resolve_admin(&engine, None).unwrap(), 3);
        assert_eq!(
            engine.accounts().get(42).unwrap().balance,
            Amount::from_units(25_000)
        );
        assert_eq!(engine.admin().list_tasks(3).unwrap().len(), 1);
    }
}
