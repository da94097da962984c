//! Call negotiation state machine.
//!
//! One task per call consumes [`Event`]s in arrival order: relay status and
//! inbound signals from the channel, media resolution, peer-link callbacks,
//! timers and teardown requests. All role asymmetry lives here.

use crate::call::{ConnectionStatus, Observers};
use crate::config::CallConfig;
use crate::error::{Error, Result};
use crate::logger::dump_candidate;
use crate::media::{LocalMediaStream, MediaSource};
use crate::peer::ice::PendingCandidates;
use crate::peer::link::{PeerLink, PeerLinkFactory};
use crate::peer::types::{
    IceCandidate, LinkEvent, OnLinkEventFn, RemoteMediaStream, SessionDescription, SignalingState,
};
use crate::session::{Role, Session};
use crate::signaling::channel::{ChannelStatus, SignalingChannel};
use crate::signaling::message::{Signal, SignalMessage};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    AwaitingRelay,
    AwaitingMedia,
    Negotiating,
    Connected,
    Ended,
    Error,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Ended | NegotiationState::Error)
    }
}

/// Why a call is being torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// `Call::end()`
    Local,
    /// The `Call` was dropped
    Disposed,
    /// The remote side sent `EndCall`
    Remote,
    LinkDegraded,
    TimedOut,
    Failed,
}

impl EndReason {
    /// Only hangups decided locally tell the remote side.
    pub fn notifies_remote(self) -> bool {
        matches!(
            self,
            EndReason::Local | EndReason::Disposed | EndReason::TimedOut
        )
    }
}

pub(crate) enum Event {
    Start,
    Channel(ChannelStatus),
    Inbound(SignalMessage),
    MediaAcquired(Result<LocalMediaStream>),
    Link(LinkEvent),
    NegotiationTimeout,
    End {
        reason: EndReason,
        done: Option<oneshot::Sender<()>>,
    },
}

pub(crate) struct Negotiator {
    session: Session,
    config: Arc<CallConfig>,
    state: NegotiationState,
    channel: SignalingChannel,
    media: Arc<MediaSource>,
    links: Arc<dyn PeerLinkFactory>,
    link: Option<Arc<dyn PeerLink>>,
    pending: PendingCandidates,
    pending_offer: Option<String>,
    relay_confirmed: bool,
    offer_sent: bool,
    remote_applied: bool,
    torn_down: bool,
    remote_stream: RemoteMediaStream,
    timeout: Option<JoinHandle<()>>,
    events: mpsc::UnboundedSender<Event>,
    observers: Observers,
}

impl Negotiator {
    pub(crate) fn new(
        session: Session,
        config: Arc<CallConfig>,
        channel: SignalingChannel,
        media: Arc<MediaSource>,
        links: Arc<dyn PeerLinkFactory>,
        events: mpsc::UnboundedSender<Event>,
        observers: Observers,
    ) -> Self {
        Self {
            session,
            config,
            state: NegotiationState::Idle,
            channel,
            media,
            links,
            link: None,
            pending: PendingCandidates::new(),
            pending_offer: None,
            relay_confirmed: false,
            offer_sent: false,
            remote_applied: false,
            torn_down: false,
            remote_stream: RemoteMediaStream::default(),
            timeout: None,
            events,
            observers,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = rx.recv().await {
            self.handle(event).await;
            if self.torn_down {
                break;
            }
        }
        debug!(
            "Negotiation for {} finished in state {:?}",
            self.session.id, self.state
        );
    }

    async fn handle(&mut self, event: Event) {
        match event {
            Event::Start => self.start().await,
            Event::Channel(ChannelStatus::Subscribed) => self.on_relay_confirmed(),
            Event::Channel(ChannelStatus::SubscribeFailed(e)) => self.fail(e).await,
            Event::Channel(ChannelStatus::RoleConflict { sender_id }) => {
                warn!(
                    "Participant {} collides with local role {:?}",
                    sender_id, self.session.role
                );
                self.fail(Error::RoleConflict(self.session.role)).await
            }
            Event::Inbound(msg) => self.on_signal(msg).await,
            Event::MediaAcquired(result) => self.on_media(result).await,
            Event::Link(event) => self.on_link_event(event).await,
            Event::NegotiationTimeout => self.on_timeout().await,
            Event::End { reason, done } => {
                self.end(reason).await;
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
        }
    }

    fn transition(&mut self, next: NegotiationState) {
        debug!("Negotiation {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    #[instrument(skip(self), fields(session = %self.session.id, role = ?self.session.role))]
    async fn start(&mut self) {
        if self.state != NegotiationState::Idle {
            debug!("Start ignored in state {:?}", self.state);
            return;
        }
        self.transition(NegotiationState::AwaitingRelay);
        self.arm_timeout();
        self.channel.open(&self.session).await;
    }

    fn on_relay_confirmed(&mut self) {
        if self.state != NegotiationState::AwaitingRelay {
            return;
        }
        self.relay_confirmed = true;
        self.observers.set_status(ConnectionStatus::Connecting);
        self.transition(NegotiationState::AwaitingMedia);

        let media = Arc::clone(&self.media);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = media.acquire().await;
            let _ = events.send(Event::MediaAcquired(result));
        });
    }

    async fn on_media(&mut self, result: Result<LocalMediaStream>) {
        if self.state != NegotiationState::AwaitingMedia {
            return;
        }
        let stream = match result {
            Ok(stream) => stream,
            Err(e) => return self.fail(e).await,
        };
        self.observers
            .update(|s| s.local_stream = Some(stream.clone()));

        let events = self.events.clone();
        let on_event: OnLinkEventFn = Arc::new(move |event| {
            let _ = events.send(Event::Link(event));
        });
        let link = match self.links.create(&stream, on_event).await {
            Ok(link) => link,
            Err(e) => {
                let e = match e {
                    Error::PeerLink(_) => e,
                    other => Error::PeerLink(other.to_string()),
                };
                return self.fail(e).await;
            }
        };
        self.link = Some(link);
        self.transition(NegotiationState::Negotiating);

        match self.session.role {
            Role::Initiator => self.send_offer().await,
            Role::Responder => {
                if let Some(sdp) = self.pending_offer.take() {
                    self.accept_offer(sdp).await;
                }
            }
        }
    }

    /// Covers the whole setup, from relay subscription to remote media.
    fn arm_timeout(&mut self) {
        let Some(period) = self.config.negotiation_timeout() else {
            return;
        };
        let events = self.events.clone();
        self.timeout = Some(tokio::spawn(async move {
            tokio::time::sleep(period).await;
            let _ = events.send(Event::NegotiationTimeout);
        }));
    }

    /// Initiator only; the `offer_sent` latch makes this one-shot per call.
    async fn send_offer(&mut self) {
        if self.session.role != Role::Initiator
            || self.state != NegotiationState::Negotiating
            || !self.relay_confirmed
            || self.offer_sent
        {
            return;
        }
        let Some(link) = self.link.clone() else {
            return;
        };
        self.offer_sent = true;

        match link.create_offer().await {
            Ok(offer) => {
                info!("Sending offer for {}", self.session.id);
                self.channel.send(Signal::Offer(offer.sdp)).await;
            }
            Err(e) => self.fail(e).await,
        }
    }

    async fn on_signal(&mut self, msg: SignalMessage) {
        if self.state.is_terminal() {
            return;
        }
        match msg.signal {
            Signal::Offer(sdp) => self.on_offer(sdp).await,
            Signal::Answer(sdp) => self.on_answer(sdp).await,
            Signal::IceCandidate(candidate) => self.on_remote_candidate(candidate).await,
            Signal::EndCall => {
                info!("Remote side ended call {}", self.session.id);
                self.end(EndReason::Remote).await
            }
        }
    }

    async fn on_offer(&mut self, sdp: String) {
        if self.session.role != Role::Responder {
            debug!("Discarding offer received as initiator");
            return;
        }
        if self.remote_applied || self.pending_offer.is_some() {
            debug!("Discarding duplicate offer");
            return;
        }
        if self.state == NegotiationState::Negotiating {
            self.accept_offer(sdp).await;
        } else {
            debug!("Peer link not ready, holding offer");
            self.pending_offer = Some(sdp);
        }
    }

    async fn accept_offer(&mut self, sdp: String) {
        let Some(link) = self.link.clone() else {
            return;
        };
        self.remote_applied = true;

        match link
            .apply_remote_description(SessionDescription::offer(sdp))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!("Peer link already holds a remote offer");
                return;
            }
            Err(e) => return self.fail(e).await,
        }

        match link.create_answer().await {
            Ok(answer) => {
                info!("Sending answer for {}", self.session.id);
                self.channel.send(Signal::Answer(answer.sdp)).await;
            }
            Err(e) => return self.fail(e).await,
        }

        self.drain_pending(&link).await;
    }

    async fn on_answer(&mut self, sdp: String) {
        if self.session.role != Role::Initiator {
            debug!("Discarding answer received as responder");
            return;
        }
        let Some(link) = self.link.clone() else {
            debug!("Discarding answer with no peer link");
            return;
        };
        if self.remote_applied {
            debug!("Discarding duplicate answer");
            return;
        }
        let state = link.signaling_state();
        if state != SignalingState::HaveLocalOffer {
            debug!("Discarding answer in signaling state {:?}", state);
            return;
        }
        self.remote_applied = true;

        match link
            .apply_remote_description(SessionDescription::answer(sdp))
            .await
        {
            Ok(true) => {
                info!("Answer applied for {}", self.session.id);
                self.drain_pending(&link).await;
            }
            Ok(false) => debug!("Peer link already holds a remote answer"),
            Err(e) => self.fail(e).await,
        }
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        dump_candidate("REMOTE", &candidate);
        if !self.remote_applied {
            if let Err(candidate) = self.pending.push(candidate) {
                self.apply_candidate(candidate).await;
            }
            return;
        }
        self.apply_candidate(candidate).await;
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        let Some(link) = &self.link else {
            return;
        };
        if let Err(e) = link.add_remote_candidate(candidate).await {
            warn!("Failed to add remote candidate: {}", e);
        }
    }

    async fn drain_pending(&mut self, link: &Arc<dyn PeerLink>) {
        let queued = self.pending.drain();
        if !queued.is_empty() {
            debug!("Applying {} pending candidates", queued.len());
        }
        for candidate in queued {
            if let Err(e) = link.add_remote_candidate(candidate).await {
                warn!("Failed to apply pending candidate: {}", e);
            }
        }
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        if self.state.is_terminal() {
            return;
        }
        match event {
            LinkEvent::LocalCandidate(candidate) => {
                self.channel.send(Signal::IceCandidate(candidate)).await;
            }
            LinkEvent::RemoteTrack(track) => {
                info!("Remote {:?} track {} received", track.kind, track.id);
                self.remote_stream.add_track(track);
                let remote = self.remote_stream.clone();
                self.observers.update(|s| s.remote_stream = Some(remote));
                if self.state == NegotiationState::Negotiating {
                    self.transition(NegotiationState::Connected);
                    self.observers.set_status(ConnectionStatus::Connected);
                }
            }
            LinkEvent::IceStateChanged(state) if state.is_degraded() => {
                warn!("ICE {:?}, ending call {}", state, self.session.id);
                self.fail_with(Error::LinkDegraded(state), EndReason::LinkDegraded)
                    .await;
            }
            LinkEvent::IceStateChanged(state) => debug!("ICE connection state {:?}", state),
        }
    }

    async fn on_timeout(&mut self) {
        if self.state.is_terminal() || self.state == NegotiationState::Connected {
            return;
        }
        let ms = self.config.negotiation_timeout_ms.unwrap_or_default();
        warn!("Call {} not connected after {} ms", self.session.id, ms);
        self.fail_with(Error::NegotiationTimeout(ms), EndReason::TimedOut)
            .await;
    }

    async fn fail(&mut self, error: Error) {
        self.fail_with(error, EndReason::Failed).await
    }

    async fn fail_with(&mut self, error: Error, reason: EndReason) {
        if self.torn_down {
            return;
        }
        if error.is_setup_failure() {
            warn!("Call {} setup failed: {}", self.session.id, error);
        } else {
            warn!("Call {} failed: {}", self.session.id, error);
        }
        self.transition(NegotiationState::Error);
        self.observers.update(|s| s.last_error = Some(error));
        self.observers.set_status(ConnectionStatus::Error);
        self.teardown(reason).await;
    }

    async fn end(&mut self, reason: EndReason) {
        if self.torn_down {
            return;
        }
        self.transition(NegotiationState::Ended);
        self.teardown(reason).await;
        self.observers.set_status(ConnectionStatus::Disconnected);
    }

    /// Shared by every exit path; runs at most once.
    async fn teardown(&mut self, reason: EndReason) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        info!("Tearing down call {} ({:?})", self.session.id, reason);

        if reason.notifies_remote() {
            self.channel.send(Signal::EndCall).await;
        }
        if let Some(timer) = self.timeout.take() {
            timer.abort();
        }
        if let Some(link) = self.link.take() {
            link.destroy().await;
        }
        self.media.release().await;
        self.channel.close().await;

        self.pending.clear();
        self.pending_offer = None;
        self.observers.update(|s| {
            s.local_stream = None;
            s.remote_stream = None;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_local_decisions_notify_remote() {
        assert!(EndReason::Local.notifies_remote());
        assert!(EndReason::Disposed.notifies_remote());
        assert!(EndReason::TimedOut.notifies_remote());
        assert!(!EndReason::Remote.notifies_remote());
        assert!(!EndReason::LinkDegraded.notifies_remote());
        assert!(!EndReason::Failed.notifies_remote());
    }

    #[test]
    fn terminal_states() {
        assert!(NegotiationState::Ended.is_terminal());
        assert!(NegotiationState::Error.is_terminal());
        assert!(!NegotiationState::Connected.is_terminal());
        assert!(!NegotiationState::Negotiating.is_terminal());
    }
}
