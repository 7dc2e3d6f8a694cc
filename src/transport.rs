//! Transport-facing collaborator seams
//!
//! The chat transport supplies membership checks, message delivery and the
//! clock. The ledger only sees these traits, which keeps it testable without
//! a live bot connection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::ledger::UserId;

/// Answers "is this user a member of that channel?"
#[async_trait]
pub trait MembershipChecker: Send + Sync {
    /// Checker name for logging
    fn name(&self) -> &'static str;

    /// Errors are treated as inconclusive by the caller
    async fn is_member(&self, user_id: UserId, channel: &str) -> Result<bool>;
}

/// Delivers a text message to a user
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_id: UserId, text: &str) -> Result<()>;
}

/// Source of timestamps for new rows
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Notifier that drops every message (useful for the admin CLI)
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _user_id: UserId, _text: &str) -> Result<()> {
        Ok(())
    }
}

/// Membership answers from a fixed table of (user, channel) pairs
#[derive(Debug, Default)]
pub struct StaticMembership {
    members: Mutex<HashSet<(UserId, String)>>,
}

impl StaticMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, user_id: UserId, channel: &str) {
        self.members
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((user_id, channel.to_string()));
    }
}

#[async_trait]
impl MembershipChecker for StaticMembership {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn is_member(&self, user_id: UserId, channel: &str) -> Result<bool> {
        Ok(self
            .members
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&(user_id, channel.to_string())))
    }
}

/// Notifier that keeps every delivered message in memory
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<HashMap<UserId, Vec<String>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages delivered to `user_id`, oldest first
    pub fn messages_for(&self, user_id: UserId) -> Vec<String> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, user_id: UserId, text: &str) -> Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(user_id)
            .or_default()
            .push(text.to_string());
        Ok(())
    }
}

/// Notifier whose delivery always fails
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingNotifier;

#[async_trait]
impl Notifier for FailingNotifier {
    async fn notify(&self, user_id: UserId, _text: &str) -> Result<()> {
        Err(Error::ExternalUnavailable(format!(
            "cannot deliver to {}",
            user_id
        )))
    }
}
