use crate::config::CallConfig;
use crate::error::{Error, Result};
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::media::{LocalMediaStream, TrackKind};
use crate::peer::ice::analyze_candidates;
use crate::peer::link::{PeerLink, PeerLinkFactory};
use crate::peer::types::{
    IceCandidate, IceConnectionState, LinkEvent, OnLinkEventFn, RemoteTrack, SdpKind,
    SessionDescription, SignalingState,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Builds [`WebRtcPeerLink`]s from the call's ICE settings.
pub struct WebRtcPeerLinkFactory {
    config: Arc<CallConfig>,
}

impl WebRtcPeerLinkFactory {
    pub fn new(config: Arc<CallConfig>) -> Self {
        Self { config }
    }
}

/// Peer connection configuration
fn rtc_config(config: &CallConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: config.rtc_ice_servers(),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

#[async_trait]
impl PeerLinkFactory for WebRtcPeerLinkFactory {
    #[instrument(skip_all, fields(stream = %local.id))]
    async fn create(
        &self,
        local: &LocalMediaStream,
        on_event: OnLinkEventFn,
    ) -> Result<Arc<dyn PeerLink>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::PeerLink(format!("Failed to register codecs: {}", e)))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| Error::PeerLink(format!("Failed to register interceptors: {}", e)))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(rtc_config(&self.config))
                .await
                .map_err(|e| Error::PeerLink(format!("Failed to create peer connection: {}", e)))?,
        );

        for track in &local.tracks {
            let rtp_track: Arc<dyn TrackLocal + Send + Sync> = track.rtp_track();
            let sender = match pc.add_track(rtp_track).await {
                Ok(sender) => sender,
                Err(e) => {
                    let _ = pc.close().await;
                    return Err(Error::PeerLink(format!(
                        "Failed to add {:?} track: {}",
                        track.kind(),
                        e
                    )));
                }
            };
            // Drain RTCP so the interceptors keep running
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while sender.read(&mut rtcp_buf).await.is_ok() {}
            });
        }
        info!("Peer connection created with {} local tracks", local.tracks.len());

        let ice = Arc::new(IceWatch::new(
            Arc::downgrade(&pc),
            self.config.disconnect_grace(),
            Arc::clone(&on_event),
        ));
        let link = Arc::new(WebRtcPeerLink {
            pc,
            remote_applied: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            ice,
            gathered: Arc::new(Mutex::new(Vec::new())),
        });
        link.attach(on_event);
        Ok(link)
    }
}

/// [`PeerLink`] over a `webrtc` peer connection
pub struct WebRtcPeerLink {
    pc: Arc<RTCPeerConnection>,
    remote_applied: AtomicBool,
    destroyed: AtomicBool,
    ice: Arc<IceWatch>,
    gathered: Arc<Mutex<Vec<IceCandidate>>>,
}

impl WebRtcPeerLink {
    fn attach(&self, on_event: OnLinkEventFn) {
        let on_candidate = Arc::clone(&on_event);
        let gathered = Arc::clone(&self.gathered);
        self.pc
            .on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
                let on_event = Arc::clone(&on_candidate);
                let gathered = Arc::clone(&gathered);
                Box::pin(async move {
                    let Some(c) = cand else {
                        debug!("ICE candidate gathering completed (null candidate received)");
                        analyze_candidates(&gathered.lock().await);
                        return;
                    };
                    match c.to_json() {
                        Ok(init) => {
                            let candidate = IceCandidate::from(init);
                            dump_candidate("LOCAL", &candidate);
                            gathered.lock().await.push(candidate.clone());
                            on_event(LinkEvent::LocalCandidate(candidate));
                        }
                        Err(e) => warn!("Failed to serialize local candidate: {}", e),
                    }
                })
            }));

        let on_track = Arc::clone(&on_event);
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let on_event = Arc::clone(&on_track);
                Box::pin(async move {
                    let Some(kind) = TrackKind::from_codec_type(track.kind()) else {
                        warn!("Ignoring remote track {} of unknown kind", track.id());
                        return;
                    };
                    let remote = RemoteTrack {
                        id: track.id(),
                        stream_id: track.stream_id(),
                        kind,
                        source: Some(track),
                    };
                    on_event(LinkEvent::RemoteTrack(remote));
                })
            },
        ));

        let ice = Arc::clone(&self.ice);
        self.pc
            .on_ice_connection_state_change(Box::new(move |st: RTCIceConnectionState| {
                let ice = Arc::clone(&ice);
                Box::pin(async move {
                    ice.on_state(IceConnectionState::from(st)).await;
                })
            }));
    }
}

/// Reports ICE state changes, holding back `disconnected` for the grace
/// period when one is configured.
struct IceWatch {
    pc: Weak<RTCPeerConnection>,
    grace: Option<Duration>,
    latest: Mutex<IceConnectionState>,
    /// Pending "still disconnected?" check
    pending: Mutex<Option<JoinHandle<()>>>,
    on_event: OnLinkEventFn,
}

impl IceWatch {
    fn new(pc: Weak<RTCPeerConnection>, grace: Option<Duration>, on_event: OnLinkEventFn) -> Self {
        Self {
            pc,
            grace,
            latest: Mutex::new(IceConnectionState::New),
            pending: Mutex::new(None),
            on_event,
        }
    }

    async fn on_state(self: &Arc<Self>, state: IceConnectionState) {
        debug!("ICE connection state changed to: {:?}", state);
        *self.latest.lock().await = state;

        match (state, self.grace) {
            (IceConnectionState::Connected | IceConnectionState::Completed, _) => {
                self.cancel_grace().await;
                (self.on_event)(LinkEvent::IceStateChanged(state));
            }
            (IceConnectionState::Disconnected, Some(period)) => {
                let mut pending = self.pending.lock().await;
                if pending.as_ref().is_some_and(|h| !h.is_finished()) {
                    debug!("Disconnect grace period already running");
                    return;
                }
                let watch = Arc::clone(self);
                *pending = Some(tokio::spawn(async move {
                    if let Some(pc) = watch.pc.upgrade() {
                        dump_selected_pair(&pc, "BEFORE-FAIL").await;
                    }
                    debug!("Grace period started, waiting {} ms", period.as_millis());
                    sleep(period).await;
                    let now = *watch.latest.lock().await;
                    if now.is_degraded() {
                        (watch.on_event)(LinkEvent::IceStateChanged(now));
                    } else {
                        debug!("Connection recovered during grace period");
                    }
                }));
            }
            (s, _) if s.is_degraded() => {
                self.cancel_grace().await;
                if let Some(pc) = self.pc.upgrade() {
                    dump_selected_pair(&pc, "BEFORE-FAIL").await;
                }
                (self.on_event)(LinkEvent::IceStateChanged(s));
            }
            (s, _) => (self.on_event)(LinkEvent::IceStateChanged(s)),
        }
    }

    async fn cancel_grace(&self) {
        if let Some(handle) = self.pending.lock().await.take() {
            debug!("Cancelling disconnect grace period");
            handle.abort();
        }
    }
}

#[async_trait]
impl PeerLink for WebRtcPeerLink {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let state = self.signaling_state();
        if state != SignalingState::Stable || self.pc.local_description().await.is_some() {
            return Err(Error::OutOfTurn {
                operation: "create_offer",
                state,
            });
        }

        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::Sdp(format!("Failed to create offer: {}", e)))?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| Error::Sdp(format!("Failed to set local description: {}", e)))?;
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::Sdp("No local description after setting offer".into()))?;
        Ok(SessionDescription::offer(local.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let state = self.signaling_state();
        if state != SignalingState::HaveRemoteOffer {
            return Err(Error::OutOfTurn {
                operation: "create_answer",
                state,
            });
        }

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::Sdp(format!("Failed to create answer: {}", e)))?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| Error::Sdp(format!("Failed to set local description: {}", e)))?;
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::Sdp("No local description after setting answer".into()))?;
        Ok(SessionDescription::answer(local.sdp))
    }

    async fn apply_remote_description(&self, desc: SessionDescription) -> Result<bool> {
        if self.remote_applied.load(Ordering::SeqCst) {
            debug!("Remote description already applied, ignoring {:?}", desc.kind);
            return Ok(false);
        }
        let state = self.signaling_state();
        let expected = match desc.kind {
            SdpKind::Offer => SignalingState::Stable,
            SdpKind::Answer => SignalingState::HaveLocalOffer,
        };
        if state != expected {
            return Err(Error::OutOfTurn {
                operation: "apply_remote_description",
                state,
            });
        }
        if self.remote_applied.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        let rtc = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(|e| Error::Sdp(format!("Invalid remote {:?}: {}", desc.kind, e)))?;
        self.pc
            .set_remote_description(rtc)
            .await
            .map_err(|e| Error::Sdp(format!("Failed to set remote description: {}", e)))?;
        debug!("Remote {:?} applied", desc.kind);
        Ok(true)
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if !self.remote_applied.load(Ordering::SeqCst) {
            return Err(Error::IceCandidate(
                "remote description not applied yet".into(),
            ));
        }
        self.pc
            .add_ice_candidate(candidate.into())
            .await
            .map_err(|e| Error::IceCandidate(format!("Failed to add ICE candidate: {}", e)))
    }

    fn signaling_state(&self) -> SignalingState {
        self.pc.signaling_state().into()
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ice.cancel_grace().await;
        self.pc.on_ice_candidate(Box::new(|_| Box::pin(async {})));
        self.pc.on_track(Box::new(|_, _, _| Box::pin(async {})));
        self.pc
            .on_ice_connection_state_change(Box::new(|_| Box::pin(async {})));
        if let Err(e) = self.pc.close().await {
            warn!("Failed to close peer connection: {}", e);
        }
        info!("Peer connection closed");
    }
}
