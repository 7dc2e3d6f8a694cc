//! Reward Ledger Library
//!
//! Balances earned through referrals and micro-tasks, with an admin-approved
//! withdrawal workflow. The chat transport plugs in through the traits in
//! [`transport`].

pub mod account;
pub mod admin;
pub mod amount;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod notify;
pub mod referral;
pub mod settings;
pub mod task;
pub mod transport;
pub mod withdrawal;

// Re-export commonly used types
pub use amount::Amount;
pub use config::EngineConfig;
pub use engine::{Collaborators, RewardEngine, StartOutcome};
pub use error::{Error, Result};
