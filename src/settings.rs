//! Settings store
//!
//! Named, validated writes to the settings singleton. Readers always go
//! through [`LedgerStore::settings`] so no component keeps a stale copy.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use crate::amount::Amount;
use crate::error::{Error, Result};
use crate::ledger::{LedgerStore, Settings, UserId};

/// Settings an admin may change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingName {
    ReferralReward,
    MinWithdrawal,
    PaymentDetails,
    ChannelToJoin,
    AdminIds,
}

impl SettingName {
    pub const ALL: [SettingName; 5] = [
        SettingName::ReferralReward,
        SettingName::MinWithdrawal,
        SettingName::PaymentDetails,
        SettingName::ChannelToJoin,
        SettingName::AdminIds,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingName::ReferralReward => "referral_reward",
            SettingName::MinWithdrawal => "min_withdrawal",
            SettingName::PaymentDetails => "payment_details",
            SettingName::ChannelToJoin => "channel_to_join",
            SettingName::AdminIds => "admin_ids",
        }
    }

    /// Current value rendered the way `set` accepts it
    pub fn render(&self, settings: &Settings) -> String {
        match self {
            SettingName::ReferralReward => settings.referral_reward.to_string(),
            SettingName::MinWithdrawal => settings.min_withdrawal.to_string(),
            SettingName::PaymentDetails => settings.payment_details.clone(),
            SettingName::ChannelToJoin => settings.channel_to_join.clone().unwrap_or_default(),
            SettingName::AdminIds => settings
                .admin_ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

impl fmt::Display for SettingName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettingName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        SettingName::ALL
            .iter()
            .copied()
            .find(|name| name.as_str() == s.trim())
            .ok_or_else(|| Error::InvalidSetting {
                name: s.to_string(),
                reason: "unknown setting".to_string(),
            })
    }
}

pub struct SettingsStore {
    store: Arc<LedgerStore>,
}

impl SettingsStore {
    pub fn new(store: Arc<LedgerStore>) -> Self {
        Self { store }
    }

    pub fn current(&self) -> Settings {
        self.store.settings()
    }

    /// Parse `value` for `name` and store it; returns the new settings
    pub fn set(&self, name: SettingName, value: &str) -> Result<Settings> {
        let invalid = |reason: String| Error::InvalidSetting {
            name: name.to_string(),
            reason,
        };
        let value = value.trim();

        let updated = self.store.update_settings(|settings| {
            match name {
                SettingName::ReferralReward | SettingName::MinWithdrawal => {
                    let amount: Amount = value.parse().map_err(|e: Error| invalid(e.to_string()))?;
                    if amount.is_negative() {
                        return Err(invalid("must not be negative".to_string()));
                    }
                    if name == SettingName::ReferralReward {
                        settings.referral_reward = amount;
                    } else {
                        settings.min_withdrawal = amount;
                    }
                }
                SettingName::PaymentDetails => {
                    if value.is_empty() {
                        return Err(invalid("must not be empty".to_string()));
                    }
                    settings.payment_details = value.to_string();
                }
                SettingName::ChannelToJoin => {
                    settings.channel_to_join = match value {
                        "" | "-" | "none" => None,
                        channel => Some(channel.to_string()),
                    };
                }
                SettingName::AdminIds => {
                    settings.admin_ids = parse_admin_ids(value).map_err(invalid)?;
                }
            }
            Ok(())
        })?;

        info!(setting = %name, value = %name.render(&updated), "Setting updated");
        Ok(updated)
    }
}

fn parse_admin_ids(value: &str) -> std::result::Result<BTreeSet<UserId>, String> {
    let ids = value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<UserId>()
                .map_err(|_| format!("'{}' is not a user id", part))
        })
        .collect::<std::result::Result<BTreeSet<_>, _>>()?;

    if ids.is_empty() {
        return Err("at least one admin id is required".to_string());
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    fn settings_store() -> SettingsStore {
        SettingsStore::new(Arc::new(LedgerStore::new(
            StoreConfig::default(),
            Settings {
                referral_reward: Amount::from_units(2_000),
                min_withdrawal: Amount::from_whole(1),
                payment_details: "paypal".to_string(),
                channel_to_join: None,
                admin_ids: BTreeSet::from([1]),
            },
        )))
    }

    #[test]
    fn test_setting_names_parse() {
        assert_eq!(
            "min_withdrawal".parse::<SettingName>().unwrap(),
            SettingName::MinWithdrawal
        );
        assert!("max_withdrawal".parse::<SettingName>().is_err());
    }

    #[test]
    fn test_amount_settings() {
        let store = settings_store();
        let updated = store.set(SettingName::ReferralReward, "0.5").unwrap();
        assert_eq!(updated.referral_reward, Amount::from_units(5_000));

        assert!(store.set(SettingName::MinWithdrawal, "-1").is_err());
        assert!(store.set(SettingName::MinWithdrawal, "abc").is_err());
        assert!(store.set(SettingName::MinWithdrawal, "1.00001").is_err());
        assert_eq!(store.current().min_withdrawal, Amount::from_whole(1));
    }

    #[test]
    fn test_admin_ids_must_be_non_empty() {
        let store = settings_store();
        let updated = store.set(SettingName::AdminIds, "3, 2,2").unwrap();
        assert_eq!(updated.admin_ids, BTreeSet::from([2, 3]));
        assert_eq!(SettingName::AdminIds.render(&updated), "2,3");

        assert!(store.set(SettingName::AdminIds, " , ").is_err());
        assert!(store.set(SettingName::AdminIds, "1,x").is_err());
        assert_eq!(store.current().admin_ids, BTreeSet::from([2, 3]));
    }

    #[test]
    fn test_channel_can_be_cleared() {
        let store = settings_store();
        store.set(SettingName::ChannelToJoin, "@news").unwrap();
        assert_eq!(store.current().channel_to_join.as_deref(), Some("@news"));
        store.set(SettingName::ChannelToJoin, "none").unwrap();
        assert_eq!(store.current().channel_to_join, None);
    }
}
