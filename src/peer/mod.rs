pub mod connection;
pub mod ice;
pub mod link;
pub mod types;

pub use connection::{WebRtcPeerLink, WebRtcPeerLinkFactory};
pub use ice::{analyze_candidates, CandidateType, PendingCandidates};
pub use link::{PeerLink, PeerLinkFactory};
pub use types::{
    IceCandidate, IceConnectionState, LinkEvent, OnLinkEventFn, RemoteMediaStream, RemoteTrack,
    SdpKind, SessionDescription, SignalingState,
};
