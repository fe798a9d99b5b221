//! Authenticated encryption envelope for relay frames.
//!
//! # Wire format
//!
//! ```text
//! [1 byte version][1 byte flags][16 bytes iv][32 bytes sender key?][32 bytes mac][ciphertext]
//! ```
//!
//! Version 1 uses AES-256-CBC with PKCS7 padding and HMAC-SHA256
//! encrypt-then-MAC. The MAC covers `iv ∥ sender_key? ∥ ciphertext` and is
//! verified in constant time before any decryption, so forged frames are
//! rejected without ever touching the cipher or the JSON decoder.
//!
//! The sender key field is present only on first-contact handshake messages
//! (flag bit 0): the receiver derives a candidate key from it, and commits
//! the key only after the frame authenticates under it, so a forged first
//! contact cannot pin a bogus key on the topic. All later traffic on the
//! topic omits it.
//!
//! Encryption and MAC subkeys are derived per topic from the 32-byte topic
//! key via HKDF-SHA256, so the CBC key is never used directly as a MAC key.

use std::sync::Arc;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::crypto::{CryptoProvider, PublicKey, SymmetricKey};
use crate::errors::{PairkitError, Result};
use crate::rpc::Payload;
use crate::types::Topic;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

const ENVELOPE_VERSION: u8 = 1;
const FLAG_SENDER_KEY: u8 = 0b0000_0001;

const IV_SIZE: usize = 16;
const KEY_SIZE: usize = 32;
const MAC_SIZE: usize = 32;
/// CBC + PKCS7 always emits at least one block.
const MIN_CIPHERTEXT: usize = 16;

const ENC_SUBKEY_INFO: &[u8] = b"pairkit-enc-v1";
const MAC_SUBKEY_INFO: &[u8] = b"pairkit-mac-v1";

/// A parsed wire envelope. Structural only: holding one of these proves
/// nothing about authenticity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptionEnvelope {
    pub iv: [u8; IV_SIZE],
    pub sender_key: Option<PublicKey>,
    pub mac: [u8; MAC_SIZE],
    pub cipher_text: Vec<u8>,
}

impl EncryptionEnvelope {
    /// Frame the envelope into wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut flags = 0u8;
        if self.sender_key.is_some() {
            flags |= FLAG_SENDER_KEY;
        }
        let mut out = Vec::with_capacity(2 + IV_SIZE + KEY_SIZE + MAC_SIZE + self.cipher_text.len());
        out.push(ENVELOPE_VERSION);
        out.push(flags);
        out.extend_from_slice(&self.iv);
        if let Some(key) = &self.sender_key {
            out.extend_from_slice(key.as_bytes());
        }
        out.extend_from_slice(&self.mac);
        out.extend_from_slice(&self.cipher_text);
        out
    }

    /// Split wire bytes into envelope fields. No key lookup, no decryption.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(PairkitError::Codec("frame shorter than header".into()));
        }
        let version = bytes[0];
        if version != ENVELOPE_VERSION {
            return Err(PairkitError::Codec(format!(
                "unsupported envelope version: {version}"
            )));
        }
        let flags = bytes[1];
        if flags & !FLAG_SENDER_KEY != 0 {
            return Err(PairkitError::Codec(format!("unknown flag bits: {flags:#04x}")));
        }
        let has_sender = flags & FLAG_SENDER_KEY != 0;
        let key_len = if has_sender { KEY_SIZE } else { 0 };
        let min_len = 2 + IV_SIZE + key_len + MAC_SIZE + MIN_CIPHERTEXT;
        if bytes.len() < min_len {
            return Err(PairkitError::Codec(format!(
                "frame too short: {} bytes, need at least {min_len}",
                bytes.len()
            )));
        }

        let mut offset = 2;
        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&bytes[offset..offset + IV_SIZE]);
        offset += IV_SIZE;

        let sender_key = if has_sender {
            let mut pk = [0u8; KEY_SIZE];
            pk.copy_from_slice(&bytes[offset..offset + KEY_SIZE]);
            offset += KEY_SIZE;
            Some(PublicKey::from_bytes(pk))
        } else {
            None
        };

        let mut mac = [0u8; MAC_SIZE];
        mac.copy_from_slice(&bytes[offset..offset + MAC_SIZE]);
        offset += MAC_SIZE;

        Ok(Self {
            iv,
            sender_key,
            mac,
            cipher_text: bytes[offset..].to_vec(),
        })
    }
}

/// Serializes JSON-RPC payloads into authenticated envelopes and back.
pub struct EnvelopeCodec {
    crypto: Arc<CryptoProvider>,
}

impl EnvelopeCodec {
    pub fn new(crypto: Arc<CryptoProvider>) -> Self {
        Self { crypto }
    }

    /// Encrypt and frame a payload under the topic's established key.
    pub fn serialize(&self, payload: &Payload, topic: &Topic) -> Result<Vec<u8>> {
        let key = self.crypto.lookup_key(topic)?;
        Ok(self.seal(payload, &key, None)?.to_bytes())
    }

    /// Encrypt and frame a first-contact payload: the sender's agreement key
    /// rides inside the envelope so the receiver can derive the topic key.
    pub fn serialize_with_sender(
        &self,
        payload: &Payload,
        topic: &Topic,
        sender: PublicKey,
    ) -> Result<Vec<u8>> {
        let key = self.crypto.lookup_key(topic)?;
        Ok(self.seal(payload, &key, Some(sender))?.to_bytes())
    }

    /// Verify and decrypt a wire frame for a topic.
    ///
    /// If no key is established for the topic yet and the envelope carries a
    /// sender key, a candidate key is derived against the topic's stored key
    /// pair and committed only once the frame authenticates under it. MAC
    /// verification always precedes decryption; on mismatch the payload is
    /// never decoded and no key is stored.
    pub fn deserialize(&self, bytes: &[u8], topic: &Topic) -> Result<Payload> {
        let envelope = EncryptionEnvelope::from_bytes(bytes)?;

        match self.crypto.lookup_key(topic) {
            Ok(key) => self.open(&envelope, &key),
            Err(PairkitError::KeyNotFound(_)) => {
                let sender = envelope
                    .sender_key
                    .ok_or_else(|| PairkitError::KeyNotFound(topic.0.clone()))?;
                let candidate = self.crypto.derive_for_topic(topic, &sender)?;
                let payload = self.open(&envelope, &candidate)?;
                self.crypto.store_key(topic, candidate);
                Ok(payload)
            }
            Err(e) => Err(e),
        }
    }

    fn seal(
        &self,
        payload: &Payload,
        key: &SymmetricKey,
        sender: Option<PublicKey>,
    ) -> Result<EncryptionEnvelope> {
        let (enc_key, mac_key) = subkeys(key);
        let plaintext = serde_json::to_vec(payload)?;

        let mut iv = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);

        let cipher_text = Aes256CbcEnc::new_from_slices(enc_key.as_ref(), &iv)
            .map_err(|e| PairkitError::Codec(format!("cipher init: {e}")))?
            .encrypt_padded_vec_mut::<Pkcs7>(&plaintext);

        let mac = compute_mac(&mac_key, &iv, sender.as_ref(), &cipher_text);

        Ok(EncryptionEnvelope {
            iv,
            sender_key: sender,
            mac,
            cipher_text,
        })
    }

    fn open(&self, envelope: &EncryptionEnvelope, key: &SymmetricKey) -> Result<Payload> {
        let (enc_key, mac_key) = subkeys(key);

        // verify-then-decrypt, constant-time comparison
        let mut mac = HmacSha256::new_from_slice(mac_key.as_ref())
            .expect("HMAC accepts any key size");
        mac.update(&envelope.iv);
        if let Some(sender) = &envelope.sender_key {
            mac.update(sender.as_bytes());
        }
        mac.update(&envelope.cipher_text);
        mac.verify_slice(&envelope.mac)
            .map_err(|_| PairkitError::AuthenticationFailure)?;

        let plaintext = Aes256CbcDec::new_from_slices(enc_key.as_ref(), &envelope.iv)
            .map_err(|e| PairkitError::Codec(format!("cipher init: {e}")))?
            .decrypt_padded_vec_mut::<Pkcs7>(&envelope.cipher_text)
            .map_err(|_| PairkitError::Codec("invalid ciphertext padding".into()))?;

        serde_json::from_slice(&plaintext).map_err(Into::into)
    }
}

/// Derive the encryption and MAC subkeys for a topic key.
fn subkeys(key: &SymmetricKey) -> (Zeroizing<[u8; 32]>, Zeroizing<[u8; 32]>) {
    let hk = Hkdf::<Sha256>::new(None, key.as_bytes());
    let mut enc = Zeroizing::new([0u8; 32]);
    let mut mac = Zeroizing::new([0u8; 32]);
    hk.expand(ENC_SUBKEY_INFO, enc.as_mut())
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    hk.expand(MAC_SUBKEY_INFO, mac.as_mut())
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    (enc, mac)
}

fn compute_mac(
    mac_key: &Zeroizing<[u8; 32]>,
    iv: &[u8; IV_SIZE],
    sender: Option<&PublicKey>,
    cipher_text: &[u8],
) -> [u8; MAC_SIZE] {
    let mut mac = HmacSha256::new_from_slice(mac_key.as_ref())
        .expect("HMAC accepts any key size");
    mac.update(iv);
    if let Some(sender) = sender {
        mac.update(sender.as_bytes());
    }
    mac.update(cipher_text);
    mac.finalize().into_bytes().into()
}
