//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;

use crate::amount::Amount;
use crate::ledger::{Settings, UserId};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub defaults: SettingsDefaults,
}

/// Ledger store tuning
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// JSON snapshot file; in-memory only when unset
    #[serde(default)]
    pub snapshot_path: Option<String>,
    /// How long to wait for a row lock before reporting a conflict
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Attempts before a conflict surfaces as `RetryExhausted`
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Autosave interval; 0 disables the autosave loop
    #[serde(default = "default_autosave_secs")]
    pub autosave_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            lock_timeout_ms: default_lock_timeout_ms(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            autosave_secs: default_autosave_secs(),
        }
    }
}

/// Task engine tuning
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    /// Bound on each membership check
    #[serde(default = "default_membership_timeout_ms")]
    pub membership_timeout_ms: u64,
    /// Interval between countdown tick events
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Durations a view-post task may be created with
    #[serde(default = "default_allowed_view_durations")]
    pub allowed_view_durations: Vec<u64>,
    /// Default page size for the active task listing
    #[serde(default = "default_list_page_size")]
    pub list_page_size: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            membership_timeout_ms: default_membership_timeout_ms(),
            tick_interval_secs: default_tick_interval_secs(),
            allowed_view_durations: default_allowed_view_durations(),
            list_page_size: default_list_page_size(),
        }
    }
}

/// Outbound notification tuning
#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_notify_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_notify_timeout_ms(),
        }
    }
}

/// Settings used to seed a fresh ledger
#[derive(Debug, Clone, Deserialize)]
pub struct SettingsDefaults {
    #[serde(default = "default_referral_reward")]
    pub referral_reward: String,
    #[serde(default = "default_min_withdrawal")]
    pub min_withdrawal: String,
    #[serde(default = "default_payment_details")]
    pub payment_details: String,
    #[serde(default)]
    pub channel_to_join: Option<String>,
    #[serde(default)]
    pub admin_ids: Vec<UserId>,
}

impl Default for SettingsDefaults {
    fn default() -> Self {
        Self {
            referral_reward: default_referral_reward(),
            min_withdrawal: default_min_withdrawal(),
            payment_details: default_payment_details(),
            channel_to_join: None,
            admin_ids: Vec::new(),
        }
    }
}

impl SettingsDefaults {
    /// Build the initial settings singleton
    pub fn to_settings(&self) -> Result<Settings> {
        let referral_reward: Amount = self
            .referral_reward
            .parse()
            .context("Invalid defaults.referral_reward")?;
        let min_withdrawal: Amount = self
            .min_withdrawal
            .parse()
            .context("Invalid defaults.min_withdrawal")?;

        Ok(Settings {
            referral_reward,
            min_withdrawal,
            payment_details: self.payment_details.clone(),
            channel_to_join: self.channel_to_join.clone(),
            admin_ids: self.admin_ids.iter().copied().collect::<BTreeSet<_>>(),
        })
    }
}

fn default_lock_timeout_ms() -> u64 {
    250
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    10
}

fn default_autosave_secs() -> u64 {
    30
}

fn default_membership_timeout_ms() -> u64 {
    3000
}

fn default_tick_interval_secs() -> u64 {
    1
}

fn default_allowed_view_durations() -> Vec<u64> {
    vec![15, 30, 60, 120]
}

fn default_list_page_size() -> usize {
    5
}

fn default_notify_timeout_ms() -> u64 {
    2000
}

fn default_referral_reward() -> String {
    "0.2000".to_string()
}

fn default_min_withdrawal() -> String {
    "1.0000".to_string()
}

fn default_payment_details() -> String {
    "Send your withdrawal request to our PayPal: example@example.com".to_string()
}

impl EngineConfig {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Start with defaults
            .set_default("store.lock_timeout_ms", default_lock_timeout_ms() as i64)?
            .set_default("store.max_retries", default_max_retries() as i64)?
            .set_default("tasks.membership_timeout_ms", default_membership_timeout_ms() as i64)?
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix LEDGER_)
            .add_source(
                config::Environment::with_prefix("LEDGER")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("defaults.admin_ids")
                    .with_list_parse_key("tasks.allowed_view_durations")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: EngineConfig = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.store.lock_timeout_ms == 0 {
            anyhow::bail!("store.lock_timeout_ms must be positive");
        }

        if self.store.max_retries == 0 {
            anyhow::bail!("store.max_retries must be at least 1");
        }

        if self.tasks.membership_timeout_ms == 0 {
            anyhow::bail!("tasks.membership_timeout_ms must be positive");
        }

        if self.tasks.tick_interval_secs == 0 {
            anyhow::bail!("tasks.tick_interval_secs must be positive");
        }

        if self.tasks.allowed_view_durations.is_empty() {
            anyhow::bail!("tasks.allowed_view_durations cannot be empty");
        }

        if self.tasks.allowed_view_durations.iter().any(|d| *d == 0) {
            anyhow::bail!("tasks.allowed_view_durations must all be positive");
        }

        if self.tasks.allowed_view_durations.windows(2).any(|w| w[0] >= w[1]) {
            anyhow::bail!("tasks.allowed_view_durations must be sorted and unique");
        }

        let settings = self.defaults.to_settings()?;
        if settings.referral_reward.is_negative() {
            anyhow::bail!("defaults.referral_reward cannot be negative");
        }
        if settings.min_withdrawal.is_negative() {
            anyhow::bail!("defaults.min_withdrawal cannot be negative");
        }

        if settings.admin_ids.is_empty() {
            tracing::warn!("No admin ids configured - withdrawals cannot be approved");
        }

        Ok(())
    }

    /// Get configuration for display
    pub fn masked_display(&self) -> String {
        format!(
            r#"Configuration:
  Store:
    snapshot: {}
    lock_timeout: {}ms
    max_retries: {}
    autosave: {}s
  Tasks:
    membership_timeout: {}ms
    tick_interval: {}s
    view_durations: {:?}
  Notify:
    timeout: {}ms
  Defaults:
    referral_reward: {}
    min_withdrawal: {}
    channel_to_join: {}
    admins: {}
"#,
            self.store.snapshot_path.as_deref().unwrap_or("(in-memory)"),
            self.store.lock_timeout_ms,
            self.store.max_retries,
            self.store.autosave_secs,
            self.tasks.membership_timeout_ms,
            self.tasks.tick_interval_secs,
            self.tasks.allowed_view_durations,
            self.notify.timeout_ms,
            self.defaults.referral_reward,
            self.defaults.min_withdrawal,
            self.defaults.channel_to_join.as_deref().unwrap_or("(not set)"),
            self.defaults.admin_ids.len(),
        )
    }
}
