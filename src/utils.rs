use crate::peer::types::ServerConfig;
use rand::Rng;
use sha2::{Digest, Sha256};

/// 16 hex chars of randomness; used for call ids and anonymous peer ids.
pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Stable peer id for a known user: the first 8 bytes of sha256(uid), hex.
pub fn derive_peer_id(uid: &str) -> String {
    let digest = Sha256::digest(uid.as_bytes());
    hex::encode(&digest[..8])
}

/// Prepends `stun:` to a bare host:port.
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    if config.url.starts_with("turn:") || config.url.starts_with("stun:") {
        config.url.clone()
    } else {
        let scheme = if config.r#type == "turn" { "turn:" } else { "stun:" };
        format!("{}{}", scheme, config.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_hex_and_distinct() {
        let a = random_id();
        let b = random_id();
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn derived_ids_are_stable() {
        assert_eq!(derive_peer_id("user-1"), derive_peer_id("user-1"));
        assert_ne!(derive_peer_id("user-1"), derive_peer_id("user-2"));
        assert_eq!(derive_peer_id("user-1").len(), 16);
    }

    #[test]
    fn scheme_is_added_once() {
        let bare = ServerConfig::stun("a", "stun.example.com:3478");
        assert_eq!(add_ice_url_scheme(&bare), "stun:stun.example.com:3478");

        let full = ServerConfig::stun("b", "stun:stun.example.com:3478");
        assert_eq!(add_ice_url_scheme(&full), "stun:stun.example.com:3478");
    }
}
