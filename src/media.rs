//! Local capture stream: acquired once per call, muted in place, released once.

use crate::error::{Error, Result};
use crate::utils::random_id;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn from_codec_type(kind: RTPCodecType) -> Option<Self> {
        match kind {
            RTPCodecType::Audio => Some(TrackKind::Audio),
            RTPCodecType::Video => Some(TrackKind::Video),
            _ => None,
        }
    }
}

/// A capture track. Disabling keeps the track negotiated and drops samples.
#[derive(Debug)]
pub struct LocalTrack {
    kind: TrackKind,
    rtp: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, rtp: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            kind,
            rtp,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        self.rtp.id()
    }

    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtp)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Feeds one encoded sample. Muted tracks swallow it.
    pub async fn write_sample(&self, sample: &Sample) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::MediaUnavailable(format!(
                "track {} is stopped",
                self.id()
            )));
        }
        if !self.is_enabled() {
            return Ok(());
        }
        self.rtp
            .write_sample(sample)
            .await
            .map_err(|e| Error::WebRtc(format!("Failed to write sample: {}", e)))
    }

    /// Writes one encoded frame lasting `duration`.
    pub async fn write_frame(&self, data: Bytes, duration: Duration) -> Result<()> {
        self.write_sample(&Sample {
            data,
            duration,
            ..Default::default()
        })
        .await
    }
}

/// Audio and video tracks of one capture.
#[derive(Debug, Clone)]
pub struct LocalMediaStream {
    pub id: String,
    pub tracks: Vec<Arc<LocalTrack>>,
}

impl LocalMediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks_of(kind) {
            track.set_enabled(enabled);
        }
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Device-media primitive.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Fails with `Error::MediaUnavailable` when capture is denied or absent.
    async fn request_audio_video(&self) -> Result<LocalMediaStream>;
}

/// Opus + VP8 tracks fed with encoded samples by the application.
#[derive(Debug, Default, Clone)]
pub struct SampleDevices;

impl SampleDevices {
    pub fn new() -> Self {
        Self
    }

    fn track(kind: TrackKind, stream_id: &str) -> Arc<LocalTrack> {
        let (mime_type, clock_rate, channels, label) = match kind {
            TrackKind::Audio => (MIME_TYPE_OPUS, 48000, 2, "audio"),
            TrackKind::Video => (MIME_TYPE_VP8, 90000, 0, "video"),
        };
        let rtp = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                clock_rate,
                channels,
                ..Default::default()
            },
            format!("{}-{}", label, random_id()),
            stream_id.to_owned(),
        ));
        Arc::new(LocalTrack::new(kind, rtp))
    }
}

#[async_trait]
impl MediaDevices for SampleDevices {
    async fn request_audio_video(&self) -> Result<LocalMediaStream> {
        let stream_id = format!("local-{}", random_id());
        let tracks = vec![
            Self::track(TrackKind::Audio, &stream_id),
            Self::track(TrackKind::Video, &stream_id),
        ];
        Ok(LocalMediaStream::new(stream_id, tracks))
    }
}

enum SourceState {
    Idle,
    Acquiring,
    Acquired(LocalMediaStream),
    Released,
}

/// Owns the local stream for one call. Nothing else stops its tracks.
pub struct MediaSource {
    devices: Arc<dyn MediaDevices>,
    state: Mutex<SourceState>,
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
}

impl MediaSource {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            state: Mutex::new(SourceState::Idle),
            audio_enabled: AtomicBool::new(true),
            video_enabled: AtomicBool::new(true),
        }
    }

    /// Requests the audio+video stream. Only the first call reaches the device.
    #[instrument(skip(self))]
    pub async fn acquire(&self) -> Result<LocalMediaStream> {
        {
            let mut state = self.state.lock().await;
            match *state {
                SourceState::Idle => *state = SourceState::Acquiring,
                SourceState::Released => {
                    return Err(Error::Cancelled("media source already released".into()))
                }
                _ => {
                    return Err(Error::MediaUnavailable(
                        "capture stream already requested for this call".into(),
                    ))
                }
            }
        }

        let result = self.devices.request_audio_video().await;

        let mut state = self.state.lock().await;
        match result {
            Ok(stream) => {
                if matches!(*state, SourceState::Released) {
                    debug!("Call ended while acquiring media, stopping stream {}", stream.id);
                    stream.stop();
                    return Err(Error::Cancelled("call ended during media acquisition".into()));
                }
                stream.set_enabled(TrackKind::Audio, self.audio_enabled());
                stream.set_enabled(TrackKind::Video, self.video_enabled());
                info!(
                    "Acquired local stream {} with {} tracks",
                    stream.id,
                    stream.tracks.len()
                );
                *state = SourceState::Acquired(stream.clone());
                Ok(stream)
            }
            Err(e) => {
                if !matches!(*state, SourceState::Released) {
                    *state = SourceState::Idle;
                }
                Err(match e {
                    Error::MediaUnavailable(_) => e,
                    other => Error::MediaUnavailable(other.to_string()),
                })
            }
        }
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::SeqCst)
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::SeqCst)
    }

    pub async fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::SeqCst);
        self.apply(TrackKind::Audio, enabled).await;
    }

    pub async fn set_video_enabled(&self, enabled: bool) {
        self.video_enabled.store(enabled, Ordering::SeqCst);
        self.apply(TrackKind::Video, enabled).await;
    }

    async fn apply(&self, kind: TrackKind, enabled: bool) {
        if let SourceState::Acquired(stream) = &*self.state.lock().await {
            debug!("Setting {:?} tracks enabled={}", kind, enabled);
            stream.set_enabled(kind, enabled);
        }
    }

    /// Stops every track. Later calls are no-ops; an acquisition still in
    /// flight is stopped as soon as it resolves.
    pub async fn release(&self) -> bool {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, SourceState::Released) {
            SourceState::Acquired(stream) => {
                info!("Releasing local stream {}", stream.id);
                stream.stop();
                true
            }
            _ => false,
        }
    }
}
