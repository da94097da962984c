//! Per-call wrapper around the relay: buffers outbound signals until the
//! subscription is confirmed and filters inbound traffic.

use crate::error::Error;
use crate::session::{Role, Session};
use crate::signaling::message::{Signal, SignalMessage};
use crate::signaling::relay::Relay;
use crate::utils::random_id;
use once_cell::sync::OnceCell;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Lifecycle notifications of the channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelStatus {
    Subscribed,
    SubscribeFailed(Error),
    /// A participant other than us sent a message claiming our role.
    RoleConflict { sender_id: String },
}

pub type OnMessageHdlrFn = Box<dyn Fn(SignalMessage) + Send + Sync>;
pub type OnStatusHdlrFn = Box<dyn Fn(ChannelStatus) + Send + Sync>;

enum Phase {
    Pending(VecDeque<Signal>),
    Confirmed,
    Closed,
}

struct Shared {
    relay: Arc<dyn Relay>,
    topic_prefix: String,
    instance_id: String,
    session: OnceCell<Session>,
    phase: Mutex<Phase>,
    on_message: OnceCell<OnMessageHdlrFn>,
    on_status: OnceCell<OnStatusHdlrFn>,
}

pub struct SignalingChannel {
    shared: Arc<Shared>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingChannel {
    pub fn new(relay: Arc<dyn Relay>, topic_prefix: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                relay,
                topic_prefix: topic_prefix.into(),
                instance_id: random_id(),
                session: OnceCell::new(),
                phase: Mutex::new(Phase::Pending(VecDeque::new())),
                on_message: OnceCell::new(),
                on_status: OnceCell::new(),
            }),
            pump: Mutex::new(None),
        }
    }

    /// Registers the single inbound handler. Returns `false` if one is already set.
    pub fn on_message<F>(&self, handler: F) -> bool
    where
        F: Fn(SignalMessage) + Send + Sync + 'static,
    {
        self.shared.on_message.set(Box::new(handler)).is_ok()
    }

    pub fn on_status<F>(&self, handler: F) -> bool
    where
        F: Fn(ChannelStatus) + Send + Sync + 'static,
    {
        self.shared.on_status.set(Box::new(handler)).is_ok()
    }

    /// Subscribes to the session topic and speaks as `session.role` from
    /// then on. Opening twice is a no-op.
    pub async fn open(&self, session: &Session) {
        if self.shared.session.set(session.clone()).is_err() {
            debug!("Signaling channel already open, ignoring");
            return;
        }
        if matches!(*self.shared.phase.lock().await, Phase::Closed) {
            debug!("Signaling channel closed before open, not subscribing");
            return;
        }
        info!("Opening signaling channel on {}", self.shared.topic());
        let shared = Arc::clone(&self.shared);
        *self.pump.lock().await = Some(tokio::spawn(shared.run()));
    }

    /// Publishes now when confirmed, queues before that, drops after close.
    pub async fn send(&self, signal: Signal) {
        let mut phase = self.shared.phase.lock().await;
        match &mut *phase {
            Phase::Pending(queue) => {
                debug!("Channel not confirmed, queuing {:?}", signal.kind());
                queue.push_back(signal);
            }
            Phase::Confirmed => self.shared.publish(signal).await,
            Phase::Closed => debug!("Channel closed, dropping {:?}", signal.kind()),
        }
    }

    #[cfg(test)]
    async fn is_confirmed(&self) -> bool {
        matches!(*self.shared.phase.lock().await, Phase::Confirmed)
    }

    /// Unsubscribes. Safe to call repeatedly.
    pub async fn close(&self) {
        {
            let mut phase = self.shared.phase.lock().await;
            if matches!(*phase, Phase::Closed) {
                return;
            }
            *phase = Phase::Closed;
        }
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
        if self.shared.session.get().is_some() {
            info!("Closing signaling channel on {}", self.shared.topic());
            self.shared.relay.unsubscribe(&self.shared.topic()).await;
        }
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

impl Shared {
    fn topic(&self) -> String {
        self.session
            .get()
            .map(|s| s.topic(&self.topic_prefix))
            .unwrap_or_default()
    }

    fn notify(&self, status: ChannelStatus) {
        if let Some(handler) = self.on_status.get() {
            handler(status);
        }
    }

    async fn run(self: Arc<Self>) {
        let topic = self.topic();
        let mut inbox = match self.relay.subscribe(&topic).await {
            Ok(inbox) => inbox,
            Err(e) => {
                warn!("Subscribe to {} failed: {}", topic, e);
                self.notify(ChannelStatus::SubscribeFailed(e));
                return;
            }
        };

        if !self.confirm().await {
            return;
        }
        self.notify(ChannelStatus::Subscribed);

        let mut remote_id: Option<String> = None;
        while let Some(raw) = inbox.recv().await {
            self.deliver(&raw, &mut remote_id);
        }
        debug!("Relay inbox for {} closed", topic);
    }

    /// Flushes the queue in FIFO order and switches to immediate mode. The
    /// phase lock is held throughout so concurrent sends land after the backlog.
    async fn confirm(&self) -> bool {
        let mut phase = self.phase.lock().await;
        let queue = match std::mem::replace(&mut *phase, Phase::Confirmed) {
            Phase::Pending(queue) => queue,
            Phase::Confirmed => VecDeque::new(),
            Phase::Closed => {
                *phase = Phase::Closed;
                return false;
            }
        };
        info!(
            "Subscription to {} confirmed, flushing {} queued signals",
            self.topic(),
            queue.len()
        );
        for signal in queue {
            self.publish(signal).await;
        }
        true
    }

    async fn publish(&self, signal: Signal) {
        let Some(session) = self.session.get() else {
            warn!("Publishing {:?} before open, dropped", signal.kind());
            return;
        };
        let msg = SignalMessage::new(&session.id, session.role, &self.instance_id, signal);
        let payload = match msg.encode() {
            Ok(p) => p,
            Err(e) => {
                warn!("Failed to encode {:?}: {}", msg.kind(), e);
                return;
            }
        };
        match self.relay.publish(&self.topic(), payload).await {
            Ok(()) => trace!("Published {:?}", msg.kind()),
            Err(e) => warn!("Publish of {:?} failed, not retrying: {}", msg.kind(), e),
        }
    }

    fn deliver(&self, raw: &str, remote_id: &mut Option<String>) {
        let msg = match SignalMessage::decode(raw) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Discarding undecodable relay payload: {}", e);
                return;
            }
        };

        let Some(session) = self.session.get() else {
            return;
        };
        if msg.session_id != session.id {
            debug!("Discarding {:?} for session {}", msg.kind(), msg.session_id);
            return;
        }

        if msg.sender_role == session.role {
            if msg.sender_id == self.instance_id {
                trace!("Ignoring echo of own {:?}", msg.kind());
            } else {
                warn!(
                    "Participant {} also claims role {:?}",
                    msg.sender_id, session.role
                );
                self.notify(ChannelStatus::RoleConflict {
                    sender_id: msg.sender_id,
                });
            }
            return;
        }

        match remote_id {
            Some(id) if *id != msg.sender_id => {
                warn!(
                    "Discarding {:?} from extra participant {} (peer is {})",
                    msg.kind(),
                    msg.sender_id,
                    id
                );
                return;
            }
            Some(_) => {}
            None => *remote_id = Some(msg.sender_id.clone()),
        }

        if let Some(handler) = self.on_message.get() {
            handler(msg);
        }
    }
}
