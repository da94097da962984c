use crate::error::Result;
use crate::media::LocalMediaStream;
use crate::peer::types::{IceCandidate, OnLinkEventFn, SessionDescription, SignalingState};
use async_trait::async_trait;
use std::sync::Arc;

/// The single peer connection of a call.
///
/// Implementations report local candidates, remote tracks and ICE state
/// changes through the [`OnLinkEventFn`] handed to the factory.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Creates an offer and installs it as the local description.
    /// Fails with `Error::OutOfTurn` unless the link is `Stable`.
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Creates an answer and installs it as the local description.
    /// Fails with `Error::OutOfTurn` unless a remote offer is applied.
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Applies the remote offer or answer. Returns `false` when a remote
    /// description was already applied and this one was ignored.
    async fn apply_remote_description(&self, desc: SessionDescription) -> Result<bool>;

    /// Only valid once a remote description is applied.
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()>;

    fn signaling_state(&self) -> SignalingState;

    /// Detaches callbacks and closes the connection. Idempotent.
    async fn destroy(&self);
}

#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    /// Builds a link carrying every track of `local`.
    async fn create(
        &self,
        local: &LocalMediaStream,
        on_event: OnLinkEventFn,
    ) -> Result<Arc<dyn PeerLink>>;
}
