//! Key management for the pairing protocol.
//!
//! The provider owns all key material: X25519 agreement key pairs (indexed by
//! topic while a handshake is in flight) and derived per-topic symmetric keys.
//! Private key bytes never leave this module; consumers reference keys by
//! topic or by public key.
//!
//! Key derivation is HKDF-SHA256 over the X25519 shared secret. A topic's
//! symmetric key is fixed once derived: a second store for the same topic
//! keeps the first key, so both ends completing agreement near-simultaneously
//! cannot overwrite one another.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::errors::{PairkitError, Result};
use crate::types::Topic;

/// Derivation context for per-topic symmetric keys.
const KEY_AGREEMENT_CONTEXT: &[u8] = b"pairkit-topic-key-v1";

/// An X25519 public key, hex-encoded on the wire and in URIs.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s)
            .map_err(|e| PairkitError::InvalidParams(format!("bad public key hex: {e}")))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| PairkitError::InvalidParams("public key must be 32 bytes".into()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0))
    }
}

impl serde::Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> serde::Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PublicKey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// An agreement key pair. The secret half stays inside the crypto provider.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn public_key(&self) -> PublicKey {
        self.public
    }
}

impl Clone for KeyPair {
    fn clone(&self) -> Self {
        Self {
            secret: self.secret.clone(),
            public: self.public,
        }
    }
}

/// A derived 32-byte symmetric topic key. Zeroized on drop.
#[derive(Clone)]
pub struct SymmetricKey(Zeroizing<[u8; 32]>);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl PartialEq for SymmetricKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_ref() == other.0.as_ref()
    }
}

impl Eq for SymmetricKey {}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Owns agreement key pairs and derived topic keys.
#[derive(Default)]
pub struct CryptoProvider {
    topic_keys: Mutex<HashMap<Topic, SymmetricKey>>,
    topic_keypairs: Mutex<HashMap<Topic, KeyPair>>,
}

impl CryptoProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a fresh X25519 key pair.
    pub fn generate_keypair(&self) -> KeyPair {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        let secret = StaticSecret::from(seed);
        seed.zeroize();
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        KeyPair { secret, public }
    }

    /// X25519 agreement followed by HKDF-SHA256 derivation of the topic key.
    pub fn derive_symmetric_key(&self, keypair: &KeyPair, peer: &PublicKey) -> SymmetricKey {
        let shared = keypair
            .secret
            .diffie_hellman(&X25519PublicKey::from(*peer.as_bytes()));
        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut out = Zeroizing::new([0u8; 32]);
        hk.expand(KEY_AGREEMENT_CONTEXT, out.as_mut())
            .expect("32 bytes is a valid HKDF-SHA256 output length");
        SymmetricKey(out)
    }

    /// Keep an in-flight handshake's key pair addressable by topic.
    pub fn store_keypair(&self, topic: &Topic, keypair: KeyPair) {
        self.topic_keypairs
            .lock()
            .expect("keypair store lock")
            .insert(topic.clone(), keypair);
    }

    pub fn lookup_keypair(&self, topic: &Topic) -> Result<KeyPair> {
        self.topic_keypairs
            .lock()
            .expect("keypair store lock")
            .get(topic)
            .cloned()
            .ok_or_else(|| PairkitError::KeyNotFound(topic.0.clone()))
    }

    /// Store a derived topic key. First writer wins: if a key already exists
    /// for the topic the stored key is returned unchanged, so concurrent
    /// agreement completions on the same topic converge on one key.
    pub fn store_key(&self, topic: &Topic, key: SymmetricKey) -> SymmetricKey {
        self.topic_keys
            .lock()
            .expect("topic key store lock")
            .entry(topic.clone())
            .or_insert(key)
            .clone()
    }

    pub fn lookup_key(&self, topic: &Topic) -> Result<SymmetricKey> {
        self.topic_keys
            .lock()
            .expect("topic key store lock")
            .get(topic)
            .cloned()
            .ok_or_else(|| PairkitError::KeyNotFound(topic.0.clone()))
    }

    pub fn has_key(&self, topic: &Topic) -> bool {
        self.topic_keys
            .lock()
            .expect("topic key store lock")
            .contains_key(topic)
    }

    /// Drop all key material for a topic. Called when a sequence is deleted.
    pub fn remove_topic(&self, topic: &Topic) {
        self.topic_keys
            .lock()
            .expect("topic key store lock")
            .remove(topic);
        self.topic_keypairs
            .lock()
            .expect("keypair store lock")
            .remove(topic);
    }

    /// Derive, without storing, the topic key from the topic's stored key
    /// pair and the peer's public key. The caller commits the key via
    /// [`CryptoProvider::store_key`] once the first inbound frame
    /// authenticates under it.
    pub fn derive_for_topic(&self, topic: &Topic, peer: &PublicKey) -> Result<SymmetricKey> {
        let keypair = self.lookup_keypair(topic)?;
        Ok(self.derive_symmetric_key(&keypair, peer))
    }

    /// Short hex fingerprint of the topic's stored symmetric key, for
    /// out-of-band key confirmation. Hashed, never the key bytes themselves;
    /// `None` when no key is established for the topic.
    pub fn key_fingerprint(&self, topic: &Topic) -> Option<String> {
        self.topic_keys
            .lock()
            .expect("topic key store lock")
            .get(topic)
            .map(|key| {
                let mut hasher = Sha256::new();
                hasher.update(b"pairkit-key-fingerprint-v1");
                hasher.update(key.as_bytes());
                hex::encode(&hasher.finalize()[..8])
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agreement_is_symmetric() {
        let provider = CryptoProvider::new();
        let a = provider.generate_keypair();
        let b = provider.generate_keypair();

        let key_ab = provider.derive_symmetric_key(&a, &b.public_key());
        let key_ba = provider.derive_symmetric_key(&b, &a.public_key());
        assert_eq!(key_ab, key_ba);
    }

    #[test]
    fn distinct_pairs_derive_distinct_keys() {
        let provider = CryptoProvider::new();
        let a = provider.generate_keypair();
        let b = provider.generate_keypair();
        let c = provider.generate_keypair();

        let key_ab = provider.derive_symmetric_key(&a, &b.public_key());
        let key_ac = provider.derive_symmetric_key(&a, &c.public_key());
        assert_ne!(key_ab, key_ac);
    }

    #[test]
    fn first_stored_key_wins() {
        let provider = CryptoProvider::new();
        let topic = Topic::generate();
        let first = SymmetricKey::from_bytes([1u8; 32]);
        let second = SymmetricKey::from_bytes([2u8; 32]);

        assert_eq!(provider.store_key(&topic, first.clone()), first);
        // a racing second derivation must not overwrite
        assert_eq!(provider.store_key(&topic, second), first);
        assert_eq!(provider.lookup_key(&topic).unwrap(), first);
    }

    #[test]
    fn lookup_unknown_topic_fails() {
        let provider = CryptoProvider::new();
        let topic = Topic::generate();
        assert!(matches!(
            provider.lookup_key(&topic),
            Err(PairkitError::KeyNotFound(_))
        ));
    }

    #[test]
    fn derive_for_topic_uses_stored_keypair_without_storing() {
        let provider = CryptoProvider::new();
        let topic = Topic::generate();
        let local = provider.generate_keypair();
        let peer = provider.generate_keypair();

        provider.store_keypair(&topic, local.clone());
        let derived = provider.derive_for_topic(&topic, &peer.public_key()).unwrap();
        let expected = provider.derive_symmetric_key(&peer, &local.public_key());
        assert_eq!(derived, expected);
        // derivation alone commits nothing
        assert!(provider.lookup_key(&topic).is_err());
    }

    #[test]
    fn key_fingerprints_match_only_for_equal_keys() {
        let provider = CryptoProvider::new();
        let other = CryptoProvider::new();
        let topic = Topic::generate();
        assert!(provider.key_fingerprint(&topic).is_none());

        provider.store_key(&topic, SymmetricKey::from_bytes([5u8; 32]));
        other.store_key(&topic, SymmetricKey::from_bytes([5u8; 32]));
        assert_eq!(provider.key_fingerprint(&topic), other.key_fingerprint(&topic));

        let second = Topic::generate();
        provider.store_key(&second, SymmetricKey::from_bytes([6u8; 32]));
        assert_ne!(
            provider.key_fingerprint(&topic),
            provider.key_fingerprint(&second)
        );
    }

    #[test]
    fn remove_topic_clears_material() {
        let provider = CryptoProvider::new();
        let topic = Topic::generate();
        provider.store_key(&topic, SymmetricKey::from_bytes([9u8; 32]));
        provider.store_keypair(&topic, provider.generate_keypair());

        provider.remove_topic(&topic);
        assert!(provider.lookup_key(&topic).is_err());
        assert!(provider.lookup_keypair(&topic).is_err());
    }

    #[test]
    fn public_key_hex_round_trip() {
        let provider = CryptoProvider::new();
        let pk = provider.generate_keypair().public_key();
        let parsed = PublicKey::from_hex(&pk.to_string()).unwrap();
        assert_eq!(pk, parsed);

        assert!(PublicKey::from_hex("not-hex").is_err());
        assert!(PublicKey::from_hex("aabb").is_err());
    }
}
