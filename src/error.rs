//! Error types for call negotiation

use crate::peer::types::{IceConnectionState, SignalingState};
use crate::session::Role;

/// Result type alias using the crate [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while setting up, running or tearing down a call
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Capture device denied or absent
    #[error("Media unavailable: {0}")]
    MediaUnavailable(String),

    /// Peer connection could not be constructed
    #[error("Peer link error: {0}")]
    PeerLink(String),

    /// A negotiation step was invoked in the wrong signaling state
    #[error("{operation} invoked out of turn in signaling state {state:?}")]
    OutOfTurn {
        operation: &'static str,
        state: SignalingState,
    },

    /// SDP creation or application failed
    #[error("SDP negotiation error: {0}")]
    Sdp(String),

    /// ICE candidate could not be applied
    #[error("ICE candidate error: {0}")]
    IceCandidate(String),

    /// Relay subscribe/publish failure
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Another participant claims the local role
    #[error("Role conflict: another participant joined as {0:?}")]
    RoleConflict(Role),

    /// The media path went away (ICE disconnected, failed or closed)
    #[error("Media link degraded: ICE {0:?}")]
    LinkDegraded(IceConnectionState),

    /// Negotiation did not reach a connected state in time
    #[error("Negotiation timed out after {0} ms")]
    NegotiationTimeout(u64),

    /// The operation was abandoned because the call ended
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtc(String),
}

impl Error {
    /// Setup failures end the call without retry.
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            Error::MediaUnavailable(_) | Error::PeerLink(_) | Error::InvalidConfig(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::WebRtc(e.to_string())
    }
}
