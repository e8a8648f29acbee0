//! Outbound notifications.
//!
//! Handlers reply to users through a [`Notifier`]. The transport (a chat
//! bot API, a webhook) lives outside this crate; [`LogNotifier`] is the
//! default and only writes to the log.

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `text` to `recipient_id`, with optional reply markup.
    /// Returns whether the transport accepted the message.
    async fn send(&self, recipient_id: &str, text: &str, markup: Option<&Value>) -> bool;
}

/// Notifier that records each message in the log and reports success.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, recipient_id: &str, text: &str, markup: Option<&Value>) -> bool {
        info!(
            recipient = recipient_id,
            chars = text.chars().count(),
            has_markup = markup.is_some(),
            "notification sent"
        );
        true
    }
}
