//! Best-effort outbound notifications
//!
//! Delivery failures and timeouts are logged and swallowed. Callers invoke
//! these only after the financial transition has committed.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::NotifyConfig;
use crate::ledger::UserId;
use crate::transport::Notifier;

/// Bounded, non-failing wrapper around a [`Notifier`]
#[derive(Clone)]
pub struct Dispatcher {
    notifier: Arc<dyn Notifier>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, config: &NotifyConfig) -> Self {
        Self {
            notifier,
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    /// Deliver to one user; returns whether delivery succeeded
    pub async fn notify(&self, user_id: UserId, text: &str) -> bool {
        match tokio::time::timeout(self.timeout, self.notifier.notify(user_id, text)).await {
            Ok(Ok(())) => {
                debug!(user_id, "Notification delivered");
                true
            }
            Ok(Err(e)) => {
                warn!(user_id, error = %e, "Notification failed");
                false
            }
            Err(_) => {
                warn!(user_id, timeout_ms = self.timeout.as_millis() as u64, "Notification timed out");
                false
            }
        }
    }

    /// Fan out to every admin concurrently; returns the number delivered
    pub async fn notify_admins<'a>(
        &self,
        admin_ids: impl IntoIterator<Item = &'a UserId>,
        text: &str,
    ) -> usize {
        let sends = admin_ids.into_iter().map(|id| self.notify(*id, text));
        join_all(sends).await.into_iter().filter(|ok| *ok).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{FailingNotifier, RecordingNotifier};

    #[tokio::test]
    async fn test_fan_out_to_admins() {
        let recorder = Arc::new(RecordingNotifier::new());
        let dispatcher = Dispatcher::new(recorder.clone(), &NotifyConfig::default());

        let delivered = dispatcher.notify_admins(&[1, 2, 3], "new withdrawal").await;
        assert_eq!(delivered, 3);
        assert_eq!(recorder.messages_for(2), vec!["new withdrawal".to_string()]);
    }

    #[tokio::test]
    async fn test_failures_are_swallowed() {
        let dispatcher = Dispatcher::new(Arc::new(FailingNotifier), &NotifyConfig::default());
        assert!(!dispatcher.notify(9, "hello").await);
        assert_eq!(dispatcher.notify_admins(&[1, 2], "hi").await, 0);
    }
}
