// Call configuration.
// Log verbosity follows the build profile; everything else is per call.

use crate::error::{Error, Result};
use crate::utils::add_ice_url_scheme;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use webrtc::ice_transport::ice_server::RTCIceServer;

#[cfg(debug_assertions)]
pub const DEFAULT_LOG_FILTER: &str = "duocall=debug,webrtc=warn";

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_FILTER: &str = "duocall=warn,webrtc=error";

pub const DEFAULT_TOPIC_PREFIX: &str = "call";

/// Kind of ICE server
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Stun,
    Turn,
}

/// ICE server configuration
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ServerKind,
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl ServerConfig {
    pub fn stun(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ServerKind::Stun,
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(Error::InvalidConfig(format!(
                "ICE server '{}' has an empty URL",
                self.id
            )));
        }
        if self.kind == ServerKind::Turn && (self.username.is_none() || self.credential.is_none())
        {
            return Err(Error::InvalidConfig(format!(
                "TURN server '{}' requires username and credential",
                self.id
            )));
        }
        Ok(())
    }

    pub fn to_rtc(&self) -> RTCIceServer {
        RTCIceServer {
            urls: vec![add_ice_url_scheme(self)],
            username: self.username.clone().unwrap_or_default(),
            credential: self.credential.clone().unwrap_or_default(),
        }
    }
}

/// Per-call settings shared by every component of one call.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CallConfig {
    pub ice_servers: Vec<ServerConfig>,
    pub topic_prefix: String,
    /// Give up on a call that has not connected within this many ms. Off by default.
    pub negotiation_timeout_ms: Option<u64>,
    /// How long ICE may sit in `disconnected` before the link counts as degraded.
    pub disconnect_grace_ms: Option<u64>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                ServerConfig::stun("default-stun", "stun:stun.l.google.com:19302"),
                ServerConfig::stun("default-stun-1", "stun:stun1.l.google.com:19302"),
            ],
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_owned(),
            negotiation_timeout_ms: None,
            disconnect_grace_ms: None,
        }
    }
}

impl CallConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: CallConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.topic_prefix.is_empty() {
            return Err(Error::InvalidConfig("topic_prefix cannot be empty".into()));
        }
        for server in &self.ice_servers {
            server.validate()?;
        }
        Ok(())
    }

    pub fn negotiation_timeout(&self) -> Option<Duration> {
        self.negotiation_timeout_ms.map(Duration::from_millis)
    }

    pub fn disconnect_grace(&self) -> Option<Duration> {
        self.disconnect_grace_ms.map(Duration::from_millis)
    }

    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers.iter().map(ServerConfig::to_rtc).collect()
    }
}
