use crate::config::DEFAULT_LOG_FILTER;
use crate::peer::types::IceCandidate;
use tracing::debug;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Installs the global subscriber. `RUST_LOG` overrides the build-profile default.
pub fn try_init() -> Result<(), tracing_subscriber::util::TryInitError> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_timer(ChronoLocal::new(TIME_FORMAT.to_owned())))
        .try_init()
}

/// Like [`try_init`], ignoring an already-installed subscriber.
pub fn init() {
    let _ = try_init();
}

/// Trickle ICE trace
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    debug!(
        "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?} type={:?}",
        cand.candidate,
        cand.sdp_mid,
        cand.sdp_mline_index,
        cand.candidate_type()
    );
}

/// getStats snapshot of the nominated pair
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                debug!(
                    "STATS {moment}: {}:{} bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                );
            }
        }
    }
}
