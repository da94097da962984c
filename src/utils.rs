use crate::config::{ServerConfig, ServerKind};
use rand::Rng;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

// Prepend the protocol scheme to an ICE server URL when it is missing
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    const SCHEMES: [&str; 3] = ["stun:", "turn:", "turns:"];
    if SCHEMES.iter().any(|s| config.url.starts_with(s)) {
        config.url.clone()
    } else {
        let scheme = match config.kind {
            ServerKind::Turn => "turn:",
            ServerKind::Stun => "stun:",
        };
        format!("{}{}", scheme, config.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_id_is_sixteen_hex_chars() {
        let id = random_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, random_id());
    }

    #[test]
    fn scheme_added_only_when_missing() {
        let mut server = ServerConfig::stun("s", "stun.example.org:3478");
        assert_eq!(add_ice_url_scheme(&server), "stun:stun.example.org:3478");

        server.url = "turns:relay.example.org:5349".into();
        assert_eq!(add_ice_url_scheme(&server), "turns:relay.example.org:5349");

        server.kind = ServerKind::Turn;
        server.url = "relay.example.org".into();
        assert_eq!(add_ice_url_scheme(&server), "turn:relay.example.org");
    }
}
