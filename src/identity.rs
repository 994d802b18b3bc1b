use serde::{Deserialize, Serialize};

use crate::utils::{derive_peer_id, random_id};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub peer_id: String,
    pub display_name: String,
}

/// Supplies the local user's identity to a session at construction.
pub trait IdentityProvider: Send + Sync {
    fn identity(&self) -> Identity;
}

/// A signed-in user. The peer id is derived from the user id so it stays
/// stable across joins.
pub struct StaticIdentity {
    identity: Identity,
}

impl StaticIdentity {
    pub fn new(uid: &str, display_name: impl Into<String>) -> Self {
        Self {
            identity: Identity {
                peer_id: derive_peer_id(uid),
                display_name: display_name.into(),
            },
        }
    }

    /// Uses `peer_id` as given.
    pub fn with_peer_id(peer_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            identity: Identity {
                peer_id: peer_id.into(),
                display_name: display_name.into(),
            },
        }
    }
}

impl IdentityProvider for StaticIdentity {
    fn identity(&self) -> Identity {
        self.identity.clone()
    }
}

/// A guest: random token minted once per provider.
pub struct AnonymousIdentity {
    identity: Identity,
}

impl AnonymousIdentity {
    pub fn new() -> Self {
        let token = random_id();
        Self {
            identity: Identity {
                display_name: format!("Guest {}", &token[..4]),
                peer_id: token,
            },
        }
    }
}

impl Default for AnonymousIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityProvider for AnonymousIdentity {
    fn identity(&self) -> Identity {
        self.identity.clone()
    }
}
