//! In-process relay: every client of a hub sees every payload published on
//! the topics it subscribed to, including its own.

use crate::error::{Error, Result};
use crate::signaling::relay::{Relay, RelayInbox};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

type Subscribers = HashMap<String, Vec<(u64, mpsc::UnboundedSender<String>)>>;

#[derive(Default)]
struct Hub {
    topics: Mutex<Subscribers>,
    next_client: AtomicU64,
}

#[derive(Clone, Default)]
pub struct MemoryRelayHub {
    hub: Arc<Hub>,
}

impl MemoryRelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(&self) -> MemoryRelay {
        MemoryRelay {
            hub: Arc::clone(&self.hub),
            client_id: self.hub.next_client.fetch_add(1, Ordering::SeqCst),
            subscribe_delay: None,
            offline: AtomicBool::new(false),
            refuse_subscribe: AtomicBool::new(false),
            published: AtomicUsize::new(0),
            unsubscribed: AtomicUsize::new(0),
        }
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.hub
            .topics
            .lock()
            .await
            .get(topic)
            .map_or(0, |subs| subs.len())
    }
}

/// One participant's connection to a [`MemoryRelayHub`].
pub struct MemoryRelay {
    hub: Arc<Hub>,
    client_id: u64,
    subscribe_delay: Option<Duration>,
    offline: AtomicBool,
    refuse_subscribe: AtomicBool,
    published: AtomicUsize,
    unsubscribed: AtomicUsize,
}

impl MemoryRelay {
    /// Delays subscription confirmation, as a remote relay would.
    pub fn with_subscribe_delay(mut self, delay: Duration) -> Self {
        self.subscribe_delay = Some(delay);
        self
    }

    /// While offline every publish fails.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// While set every subscribe fails, as with a rejected relay login.
    pub fn set_refuse_subscribe(&self, refuse: bool) {
        self.refuse_subscribe.store(refuse, Ordering::SeqCst);
    }

    /// Successful publishes so far.
    pub fn published(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }

    pub fn unsubscribed(&self) -> usize {
        self.unsubscribed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn subscribe(&self, topic: &str) -> Result<RelayInbox> {
        if let Some(delay) = self.subscribe_delay {
            tokio::time::sleep(delay).await;
        }
        if self.refuse_subscribe.load(Ordering::SeqCst) {
            return Err(Error::Signaling(format!("subscribe to {topic} refused")));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub
            .topics
            .lock()
            .await
            .entry(topic.to_owned())
            .or_default()
            .push((self.client_id, tx));
        trace!("client {} subscribed to {}", self.client_id, topic);
        Ok(rx)
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Signaling(format!("relay offline, dropped publish on {topic}")));
        }
        let mut topics = self.hub.topics.lock().await;
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|(_, tx)| tx.send(payload.clone()).is_ok());
        }
        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) {
        let mut topics = self.hub.topics.lock().await;
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|(id, _)| *id != self.client_id);
            if subs.is_empty() {
                topics.remove(topic);
            }
        }
        self.unsubscribed.fetch_add(1, Ordering::SeqCst);
    }
}
