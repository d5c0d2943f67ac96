//! Notification delivery errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    /// Request never got a response
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Webhook answered with a non-success status
    #[error("webhook returned {status}: {body}")]
    Rejected { status: u16, body: String },
}
