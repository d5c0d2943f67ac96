//! Notifications for Warden remediation outcomes.
//!
//! Background delivery of outcome events to chat webhooks. The reconciler
//! sends an event when a remediation fails terminally or a resource leaves
//! the fleet; delivery failures are logged and never affect reconciliation.
//! Call [`Notifier::flush`] before the runtime shuts down so queued
//! deliveries are not lost.
//!
//! # Usage
//!
//! ```no_run
//! use warden_notify::{Notifier, NotifyEvent};
//!
//! # async fn demo() {
//! let notifier = Notifier::from_env();
//!
//! notifier.notify(NotifyEvent::ResourceRemoved {
//!     resource_id: "alb-1".to_string(),
//!     kind: "application_load_balancer".to_string(),
//!     reason: "resource no longer exists".to_string(),
//!     timestamp: chrono::Utc::now(),
//! });
//! notifier.flush().await;
//! # }
//! ```
//!
//! # Configuration
//!
//! - `SLACK_WEBHOOK_URL`: Slack incoming webhook (enables the Slack channel)
//! - `NOTIFY_DISABLED`: Set to "true" to disable all notifications

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channels;
pub mod error;
pub mod events;

pub use channels::slack::SlackChannel;
pub use channels::NotifyChannel;
pub use error::ChannelError;
pub use events::{NotifyEvent, Severity};

use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Environment variable to disable all notifications.
const ENV_NOTIFY_DISABLED: &str = "NOTIFY_DISABLED";

/// Fans outcome events out to the configured channels.
///
/// A notifier with no channels is inert; [`Notifier::disabled`] is simply the
/// empty set.
#[derive(Clone)]
pub struct Notifier {
    channels: Arc<[Arc<dyn NotifyChannel>]>,
    deliveries: TaskTracker,
}

impl Notifier {
    /// Build a notifier from `SLACK_WEBHOOK_URL` and `NOTIFY_DISABLED`.
    #[must_use]
    pub fn from_env() -> Self {
        let disabled = std::env::var(ENV_NOTIFY_DISABLED)
            .is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
        if disabled {
            info!("{ENV_NOTIFY_DISABLED} set, notifications off");
            return Self::disabled();
        }

        let channels: Vec<Arc<dyn NotifyChannel>> = SlackChannel::from_env()
            .into_iter()
            .map(|slack| Arc::new(slack) as Arc<dyn NotifyChannel>)
            .collect();
        match channels.len() {
            0 => debug!("No notification channels configured"),
            n => info!(channels = n, "Notifications enabled"),
        }
        Self::with_channels(channels)
    }

    #[must_use]
    pub fn with_channels(channels: Vec<Arc<dyn NotifyChannel>>) -> Self {
        Self {
            channels: channels.into(),
            deliveries: TaskTracker::new(),
        }
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self::with_channels(Vec::new())
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Deliver `event` in the background.
    ///
    /// Must be called from within a Tokio runtime. Failures are logged and
    /// never reach the caller.
    pub fn notify(&self, event: NotifyEvent) {
        if self.channels.is_empty() {
            return;
        }
        let channels = Arc::clone(&self.channels);
        self.deliveries.spawn(async move {
            deliver(&channels, &event).await;
        });
    }

    /// Wait until every delivery started so far has finished.
    pub async fn flush(&self) {
        let pending = self.deliveries.len();
        if pending > 0 {
            debug!(pending, "Waiting for notification deliveries");
        }
        self.deliveries.close();
        self.deliveries.wait().await;
        self.deliveries.reopen();
    }
}

async fn deliver(channels: &[Arc<dyn NotifyChannel>], event: &NotifyEvent) {
    for channel in channels {
        match channel.send(event).await {
            Ok(()) => {
                debug!(channel = channel.name(), title = %event.title(), "Notification delivered");
            }
            Err(e) => warn!(
                channel = channel.name(),
                resource_id = %event.resource_id(),
                error = %e,
                "Notification not delivered"
            ),
        }
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.channels.iter().map(|c| c.name()).collect();
        f.debug_struct("Notifier").field("channels", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    #[async_trait]
    impl NotifyChannel for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn send(&self, _event: &NotifyEvent) -> Result<(), ChannelError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn removed() -> NotifyEvent {
        NotifyEvent::ResourceRemoved {
            resource_id: "alb-1".to_string(),
            kind: "application_load_balancer".to_string(),
            reason: "gone".to_string(),
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_disabled_notifier_has_no_channels() {
        assert_eq!(Notifier::disabled().channel_count(), 0);
    }

    #[tokio::test]
    async fn test_disabled_notifier_flushes_at_once() {
        let notifier = Notifier::disabled();
        notifier.notify(removed());
        notifier.flush().await;
    }

    #[tokio::test]
    async fn test_flush_waits_for_background_deliveries() {
        let channel = Arc::new(Counting(AtomicUsize::new(0)));
        let shared: Arc<dyn NotifyChannel> = channel.clone();
        let notifier = Notifier::with_channels(vec![Arc::clone(&shared), shared]);

        notifier.notify(removed());
        notifier.notify(removed());
        notifier.flush().await;
        assert_eq!(channel.0.load(Ordering::SeqCst), 4);

        // Still usable after a flush.
        notifier.notify(removed());
        notifier.flush().await;
        assert_eq!(channel.0.load(Ordering::SeqCst), 6);
    }
}
