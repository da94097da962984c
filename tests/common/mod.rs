//! Shared fakes for call negotiation tests.

#![allow(dead_code)]

use async_trait::async_trait;
use duocall::media::{LocalMediaStream, MediaDevices, SampleDevices, TrackKind};
use duocall::peer::{
    IceCandidate, LinkEvent, OnLinkEventFn, PeerLink, PeerLinkFactory, RemoteTrack, SdpKind,
    SessionDescription, SignalingState,
};
use duocall::signaling::{MemoryRelay, MemoryRelayHub, Relay, RelayInbox, Signal, SignalKind, SignalMessage};
use duocall::{Call, CallConfig, ConnectionStatus, Error, Result, Role, Session};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, timeout, timeout_at, Instant};

pub const SESSION_ID: &str = "appt-7";

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("duocall=debug")
        .with_test_writer()
        .try_init();
}

pub fn candidate(n: u32) -> IceCandidate {
    IceCandidate::new(format!(
        "candidate:{n} 1 udp 2130706431 192.0.2.{n} {} typ host",
        5000 + n
    ))
}

// ============================================================================
// Peer link
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    CreateOffer,
    CreateAnswer,
    ApplyRemote(SdpKind),
    AddCandidate(IceCandidate),
    Destroy,
}

pub struct FakeLink {
    index: usize,
    state: Mutex<SignalingState>,
    remote_applied: Mutex<bool>,
    ops: Mutex<Vec<Op>>,
    destroyed: AtomicUsize,
    on_event: OnLinkEventFn,
    emit_candidates: bool,
}

impl FakeLink {
    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::AddCandidate(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: &Op) -> usize {
        self.ops().iter().filter(|op| *op == wanted).count()
    }

    pub fn destroy_count(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Fires a callback as the real connection would.
    pub fn emit(&self, event: LinkEvent) {
        (self.on_event)(event);
    }

    pub fn remote_track(&self, kind: TrackKind) {
        self.emit(LinkEvent::RemoteTrack(RemoteTrack {
            id: format!("{:?}-{}", kind, self.index),
            stream_id: "remote".into(),
            kind,
            source: None,
        }));
    }

    fn record(&self, op: Op) {
        self.ops.lock().unwrap().push(op);
    }

    fn local_candidate(&self) {
        if self.emit_candidates {
            self.emit(LinkEvent::LocalCandidate(candidate(100 + self.index as u32)));
        }
    }
}

#[async_trait]
impl PeerLink for FakeLink {
    async fn create_offer(&self) -> Result<SessionDescription> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != SignalingState::Stable || self.ops().contains(&Op::CreateOffer) {
                return Err(Error::OutOfTurn {
                    operation: "create_offer",
                    state: *state,
                });
            }
            *state = SignalingState::HaveLocalOffer;
        }
        self.record(Op::CreateOffer);
        self.local_candidate();
        Ok(SessionDescription::offer(format!("fake-offer-{}", self.index)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != SignalingState::HaveRemoteOffer {
                return Err(Error::OutOfTurn {
                    operation: "create_answer",
                    state: *state,
                });
            }
            *state = SignalingState::Stable;
        }
        self.record(Op::CreateAnswer);
        self.local_candidate();
        Ok(SessionDescription::answer(format!("fake-answer-{}", self.index)))
    }

    async fn apply_remote_description(&self, desc: SessionDescription) -> Result<bool> {
        let mut applied = self.remote_applied.lock().unwrap();
        if *applied {
            return Ok(false);
        }
        let mut state = self.state.lock().unwrap();
        *state = match (desc.kind, *state) {
            (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
            (SdpKind::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (_, other) => {
                return Err(Error::OutOfTurn {
                    operation: "apply_remote_description",
                    state: other,
                })
            }
        };
        *applied = true;
        drop(state);
        drop(applied);
        self.record(Op::ApplyRemote(desc.kind));
        Ok(true)
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if !*self.remote_applied.lock().unwrap() {
            return Err(Error::IceCandidate("no remote description".into()));
        }
        self.record(Op::AddCandidate(candidate));
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        *self.state.lock().unwrap()
    }

    async fn destroy(&self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        self.record(Op::Destroy);
    }
}

#[derive(Default)]
pub struct FakeLinkFactory {
    links: Mutex<Vec<Arc<FakeLink>>>,
    fail: bool,
    emit_candidates: bool,
}

impl FakeLinkFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Default::default()
        })
    }

    /// Links that emit one local candidate per local description.
    pub fn trickling() -> Arc<Self> {
        Arc::new(Self {
            emit_candidates: true,
            ..Default::default()
        })
    }

    pub fn created(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    pub fn link(&self) -> Arc<FakeLink> {
        self.links.lock().unwrap()[0].clone()
    }
}

#[async_trait]
impl PeerLinkFactory for FakeLinkFactory {
    async fn create(
        &self,
        _local: &LocalMediaStream,
        on_event: OnLinkEventFn,
    ) -> Result<Arc<dyn PeerLink>> {
        if self.fail {
            return Err(Error::PeerLink("no peer connection for you".into()));
        }
        let mut links = self.links.lock().unwrap();
        let link = Arc::new(FakeLink {
            index: links.len(),
            state: Mutex::new(SignalingState::Stable),
            remote_applied: Mutex::new(false),
            ops: Mutex::new(Vec::new()),
            destroyed: AtomicUsize::new(0),
            on_event,
            emit_candidates: self.emit_candidates,
        });
        links.push(link.clone());
        Ok(link)
    }
}

// ============================================================================
// Media devices
// ============================================================================

#[derive(Default)]
pub struct ScriptedDevices {
    delay: Option<Duration>,
    deny: bool,
    calls: AtomicUsize,
    handed_out: Mutex<Vec<LocalMediaStream>>,
}

impl ScriptedDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn delayed(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Default::default()
        })
    }

    pub fn denied() -> Arc<Self> {
        Arc::new(Self {
            deny: true,
            ..Default::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn stream(&self) -> LocalMediaStream {
        self.handed_out.lock().unwrap()[0].clone()
    }

    pub fn all_stopped(&self) -> bool {
        self.handed_out
            .lock()
            .unwrap()
            .iter()
            .all(|s| s.tracks.iter().all(|t| t.is_stopped()))
    }
}

#[async_trait]
impl MediaDevices for ScriptedDevices {
    async fn request_audio_video(&self) -> Result<LocalMediaStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            sleep(delay).await;
        }
        if self.deny {
            return Err(Error::MediaUnavailable("NotAllowedError".into()));
        }
        let stream = SampleDevices::new().request_audio_video().await?;
        self.handed_out.lock().unwrap().push(stream.clone());
        Ok(stream)
    }
}

// ============================================================================
// Call under test + remote puppet
// ============================================================================

pub struct Harness {
    pub hub: MemoryRelayHub,
    pub relay: Arc<MemoryRelay>,
    pub devices: Arc<ScriptedDevices>,
    pub links: Arc<FakeLinkFactory>,
    pub call: Call,
}

impl Harness {
    pub fn new(role: Role) -> (Self, Session) {
        Self::with(
            CallConfig::default(),
            MemoryRelayHub::new(),
            None,
            ScriptedDevices::new(),
            FakeLinkFactory::new(),
            role,
        )
    }

    pub fn with(
        config: CallConfig,
        hub: MemoryRelayHub,
        subscribe_delay: Option<Duration>,
        devices: Arc<ScriptedDevices>,
        links: Arc<FakeLinkFactory>,
        role: Role,
    ) -> (Self, Session) {
        init_logging();
        let mut relay = hub.client();
        if let Some(delay) = subscribe_delay {
            relay = relay.with_subscribe_delay(delay);
        }
        let relay = Arc::new(relay);
        let call = Call::new(config, relay.clone(), devices.clone(), links.clone());
        (
            Self {
                hub,
                relay,
                devices,
                links,
                call,
            },
            Session::new(SESSION_ID, role),
        )
    }

    pub async fn puppet(&self, role: Role) -> RemotePuppet {
        RemotePuppet::join(&self.hub, role).await
    }

    pub async fn wait_status(&self, status: ConnectionStatus) {
        let mut rx = self.call.subscribe();
        timeout(Duration::from_secs(30), async {
            loop {
                if rx.borrow_and_update().status == status {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("status never became {:?}", status));
    }

    pub async fn wait_link(&self) -> Arc<FakeLink> {
        eventually(|| self.links.created() == 1).await;
        self.links.link()
    }
}

/// Polls `cond` until it holds, advancing time in 1 ms steps.
pub async fn eventually(cond: impl Fn() -> bool) {
    for _ in 0..30_000 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not met");
}

/// A raw relay participant standing in for the remote side.
pub struct RemotePuppet {
    relay: MemoryRelay,
    inbox: RelayInbox,
    pub role: Role,
    pub sender_id: String,
}

impl RemotePuppet {
    pub async fn join(hub: &MemoryRelayHub, role: Role) -> Self {
        let relay = hub.client();
        let inbox = relay
            .subscribe(&format!("call:{}", SESSION_ID))
            .await
            .unwrap();
        Self {
            relay,
            inbox,
            role,
            sender_id: format!("puppet-{:?}", role).to_lowercase(),
        }
    }

    pub async fn send(&self, signal: Signal) {
        self.send_as(self.role, &self.sender_id, signal).await;
    }

    pub async fn send_as(&self, role: Role, sender_id: &str, signal: Signal) {
        let payload = SignalMessage::new(SESSION_ID, role, sender_id, signal)
            .encode()
            .unwrap();
        self.relay
            .publish(&format!("call:{}", SESSION_ID), payload)
            .await
            .unwrap();
    }

    /// Next message from the call under test, skipping our own echoes.
    pub async fn next(&mut self) -> SignalMessage {
        loop {
            let raw = self.inbox.recv().await.expect("relay closed");
            let msg = SignalMessage::decode(&raw).unwrap();
            if msg.sender_id != self.sender_id {
                return msg;
            }
        }
    }

    pub async fn next_kind(&mut self, kind: SignalKind) -> SignalMessage {
        timeout(Duration::from_secs(30), async {
            loop {
                let msg = self.next().await;
                if msg.kind() == kind {
                    return msg;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {:?} received", kind))
    }

    /// How many messages of `kind` arrive within `window`.
    pub async fn count_within(&mut self, kind: SignalKind, window: Duration) -> usize {
        let deadline = Instant::now() + window;
        let mut count = 0;
        while let Ok(msg) = timeout_at(deadline, self.next()).await {
            if msg.kind() == kind {
                count += 1;
            }
        }
        count
    }
}
