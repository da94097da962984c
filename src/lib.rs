//! Two-party audio/video call negotiation over an unreliable pub/sub relay.
//!
//! A [`Call`] sequences relay subscription, local media capture and the
//! offer/answer exchange, buffers ICE candidates that outrun their
//! description, and funnels every hangup path into one teardown.

pub mod call;
pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

pub use call::{Call, CallSnapshot, ConnectionStatus};
pub use config::{CallConfig, ServerConfig, ServerKind};
pub use error::{Error, Result};
pub use media::{LocalMediaStream, LocalTrack, MediaDevices, MediaSource, SampleDevices, TrackKind};
pub use negotiation::{EndReason, NegotiationState};
pub use session::{Role, Session};
