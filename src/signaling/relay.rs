use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Inbound payloads of one topic subscription.
pub type RelayInbox = mpsc::UnboundedReceiver<String>;

/// Publish/subscribe relay primitive. Payloads are opaque strings; delivery is
/// unordered across topics, best-effort and may duplicate.
#[async_trait]
pub trait Relay: Send + Sync {
    /// Resolves once the relay confirms the subscription.
    async fn subscribe(&self, topic: &str) -> Result<RelayInbox>;

    async fn publish(&self, topic: &str, payload: String) -> Result<()>;

    async fn unsubscribe(&self, topic: &str);
}
