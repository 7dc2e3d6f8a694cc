//! Account management
//!
//! Lazy account creation plus the atomic balance-delta operation every
//! credit and debit goes through.

pub mod manager;

pub use manager::{AccountManager, AccountSummary};
