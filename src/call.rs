//! Entry point for the rest of the application: one [`Call`] per call.

use crate::config::CallConfig;
use crate::error::{Error, Result};
use crate::media::{LocalMediaStream, MediaDevices, MediaSource, SampleDevices};
use crate::negotiation::{EndReason, Event, Negotiator};
use crate::peer::connection::WebRtcPeerLinkFactory;
use crate::peer::link::PeerLinkFactory;
use crate::peer::types::RemoteMediaStream;
use crate::session::Session;
use crate::signaling::channel::SignalingChannel;
use crate::signaling::relay::Relay;
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Observable state of a call
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub status: ConnectionStatus,
    pub local_stream: Option<LocalMediaStream>,
    pub remote_stream: Option<RemoteMediaStream>,
    pub last_error: Option<Error>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            local_stream: None,
            remote_stream: None,
            last_error: None,
            audio_enabled: true,
            video_enabled: true,
        }
    }
}

const STATUS_EVENTS_CAPACITY: usize = 16;

#[derive(Clone)]
pub(crate) struct Observers {
    snapshot: watch::Sender<CallSnapshot>,
    transitions: broadcast::Sender<ConnectionStatus>,
}

impl Observers {
    fn new() -> Self {
        let (snapshot, _) = watch::channel(CallSnapshot::default());
        let (transitions, _) = broadcast::channel(STATUS_EVENTS_CAPACITY);
        Self {
            snapshot,
            transitions,
        }
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        let changed = self.snapshot.send_if_modified(|s| {
            if s.status == status {
                return false;
            }
            s.status = status;
            true
        });
        if changed {
            debug!("Connection status -> {:?}", status);
            let _ = self.transitions.send(status);
        }
    }

    pub(crate) fn update(&self, modify: impl FnOnce(&mut CallSnapshot)) {
        self.snapshot.send_modify(modify);
    }
}

/// Call lifecycle façade.
///
/// Every exit path (`end()`, remote hangup, ICE degradation, setup failure,
/// dropping the `Call`) converges on one teardown that runs exactly once.
pub struct Call {
    config: Arc<CallConfig>,
    relay: Arc<dyn Relay>,
    links: Arc<dyn PeerLinkFactory>,
    media: Arc<MediaSource>,
    initializing: AtomicBool,
    events: OnceCell<mpsc::UnboundedSender<Event>>,
    observers: Observers,
}

impl Call {
    pub fn new(
        config: CallConfig,
        relay: Arc<dyn Relay>,
        devices: Arc<dyn MediaDevices>,
        links: Arc<dyn PeerLinkFactory>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            relay,
            links,
            media: Arc::new(MediaSource::new(devices)),
            initializing: AtomicBool::new(false),
            events: OnceCell::new(),
            observers: Observers::new(),
        }
    }

    /// A call over real `webrtc` peer connections with sample-fed local tracks.
    pub fn with_webrtc(config: CallConfig, relay: Arc<dyn Relay>) -> Self {
        let links = Arc::new(WebRtcPeerLinkFactory::new(Arc::new(config.clone())));
        Self::new(config, relay, Arc::new(SampleDevices::new()), links)
    }

    /// Begins negotiation. Must run inside a tokio runtime; calls after the
    /// first are no-ops.
    #[instrument(skip(self), fields(session = %session.id, role = ?session.role))]
    pub fn start(&self, session: Session) -> Result<()> {
        if self.initializing.swap(true, Ordering::SeqCst) {
            debug!("Call already initializing, ignoring start");
            return Ok(());
        }
        if let Err(e) = self.config.validate() {
            self.observers.update(|s| s.last_error = Some(e.clone()));
            self.observers.set_status(ConnectionStatus::Error);
            return Err(e);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let channel =
            SignalingChannel::new(Arc::clone(&self.relay), self.config.topic_prefix.clone());
        {
            let tx = tx.clone();
            channel.on_message(move |msg| {
                let _ = tx.send(Event::Inbound(msg));
            });
        }
        {
            let tx = tx.clone();
            channel.on_status(move |status| {
                let _ = tx.send(Event::Channel(status));
            });
        }

        info!("Starting call");
        let negotiator = Negotiator::new(
            session,
            Arc::clone(&self.config),
            channel,
            Arc::clone(&self.media),
            Arc::clone(&self.links),
            tx.clone(),
            self.observers.clone(),
        );
        tokio::spawn(negotiator.run(rx));
        let _ = tx.send(Event::Start);
        let _ = self.events.set(tx);
        Ok(())
    }

    /// Hangs up, telling the remote side. Returns once teardown has run.
    pub async fn end(&self) {
        let Some(events) = self.events.get() else {
            return;
        };
        let (done, finished) = oneshot::channel();
        if events
            .send(Event::End {
                reason: EndReason::Local,
                done: Some(done),
            })
            .is_ok()
        {
            let _ = finished.await;
        }
    }

    /// Flips the audio tracks' enabled flag and returns the new value.
    pub async fn toggle_audio(&self) -> bool {
        let enabled = !self.media.audio_enabled();
        self.media.set_audio_enabled(enabled).await;
        self.observers.update(|s| s.audio_enabled = enabled);
        enabled
    }

    pub async fn toggle_video(&self) -> bool {
        let enabled = !self.media.video_enabled();
        self.media.set_video_enabled(enabled).await;
        self.observers.update(|s| s.video_enabled = enabled);
        enabled
    }

    pub fn status(&self) -> ConnectionStatus {
        self.observers.snapshot.borrow().status
    }

    pub fn local_stream(&self) -> Option<LocalMediaStream> {
        self.observers.snapshot.borrow().local_stream.clone()
    }

    pub fn remote_stream(&self) -> Option<RemoteMediaStream> {
        self.observers.snapshot.borrow().remote_stream.clone()
    }

    pub fn last_error(&self) -> Option<Error> {
        self.observers.snapshot.borrow().last_error.clone()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.observers.snapshot.borrow().clone()
    }

    /// Watch the full observable state.
    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.observers.snapshot.subscribe()
    }

    /// Every status transition, in order, from the moment of subscription.
    pub fn status_events(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.observers.transitions.subscribe()
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        if let Some(events) = self.events.get() {
            let _ = events.send(Event::End {
                reason: EndReason::Disposed,
                done: None,
            });
        }
    }
}
