//! Shared protocol types: topics, peer metadata, permissions, relay options.

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::crypto::PublicKey;
use crate::errors::{PairkitError, Result};

/// Opaque relay address. The unit of publish/subscribe routing and key
/// scoping: once established, a topic maps 1:1 to a symmetric key and
/// identifies at most one live sequence.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(pub String);

impl Topic {
    /// Generate a fresh random topic (32 random bytes, hex encoded).
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Topic(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(s: &str) -> Self {
        Topic(s.to_string())
    }
}

/// Descriptive metadata a peer shares about its hosting application.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub icons: Vec<String>,
}

/// Relay protocol the peers agree to route frames over.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayProtocolOptions {
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl RelayProtocolOptions {
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            params: None,
        }
    }
}

/// Blockchain permissions negotiated for a session.
///
/// Chains are CAIP-2 style identifiers, e.g. `eip155:1`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub chains: Vec<String>,
}

impl Permissions {
    pub fn new(chains: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            chains: chains.into_iter().map(Into::into).collect(),
        }
    }

    /// Validate that the permission set is well formed: non-empty, with
    /// namespaced chain identifiers.
    pub fn validate(&self) -> Result<()> {
        if self.chains.is_empty() {
            return Err(PairkitError::InvalidParams(
                "permissions must name at least one chain".into(),
            ));
        }
        for chain in &self.chains {
            if !chain.contains(':') {
                return Err(PairkitError::InvalidParams(format!(
                    "chain identifier missing namespace: {chain}"
                )));
            }
        }
        Ok(())
    }

    /// True when every chain in `self` is covered by `granted`.
    pub fn is_subset_of(&self, granted: &Permissions) -> bool {
        self.chains.iter().all(|c| granted.chains.contains(c))
    }
}

/// One side of a pairing or session: its agreement key, controller role,
/// and optional application metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub public_key: PublicKey,
    pub controller: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<AppMetadata>,
}

/// Reason attached to rejections and deletes, surfaced to the peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reason {
    pub code: i64,
    pub message: String,
}

impl Reason {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The generic "user disconnected" reason either peer may send.
    pub fn disconnected() -> Self {
        Self::new(6000, "user disconnected")
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
