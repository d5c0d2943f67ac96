//! Notification channels.

pub mod slack;

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::events::NotifyEvent;

/// A destination for outcome events.
///
/// Channels are only constructed when configured, so `send` may assume its
/// endpoint is present.
#[async_trait]
pub trait NotifyChannel: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Deliver one event.
    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError>;
}
