use crate::error::Result;
use crate::peer::types::IceCandidate;
use crate::session::Role;
use serde::{Deserialize, Serialize};

/// Payload of a relay message
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Signal {
    /// SDP offer, passed to the other participant unmodified
    Offer(String),
    /// SDP answer, passed to the other participant unmodified
    Answer(String),
    IceCandidate(IceCandidate),
    EndCall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    EndCall,
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::Offer(_) => SignalKind::Offer,
            Signal::Answer(_) => SignalKind::Answer,
            Signal::IceCandidate(_) => SignalKind::IceCandidate,
            Signal::EndCall => SignalKind::EndCall,
        }
    }
}

/// The only datum exchanged over the relay.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignalMessage {
    pub session_id: String,
    pub sender_role: Role,
    /// Random per-adapter id, distinguishes our own echoes from a role collision.
    pub sender_id: String,
    pub ts: i64,
    pub signal: Signal,
}

impl SignalMessage {
    pub fn new(session_id: &str, sender_role: Role, sender_id: &str, signal: Signal) -> Self {
        Self {
            session_id: session_id.to_owned(),
            sender_role,
            sender_id: sender_id.to_owned(),
            ts: chrono::Utc::now().timestamp(),
            signal,
        }
    }

    pub fn kind(&self) -> SignalKind {
        self.signal.kind()
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
