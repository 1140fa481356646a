//! Sealed envelope for secure parameter values.
//!
//! A value for a `secure` param is never stored in the clear: it is
//! sealed to the owning object's X25519 public key with an ephemeral
//! keypair, HKDF-SHA256 key derivation, and ChaCha20-Poly1305. The
//! envelope serializes as hex fields so it survives any JSON store.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

pub const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const KDF_INFO: &[u8] = b"pewter-secure-param";

#[derive(Debug, Error)]
pub enum SecureError {
    #[error("key must be {KEY_SIZE} bytes, got {0}")]
    KeyLength(usize),
    #[error("envelope is malformed: {0}")]
    Malformed(String),
    #[error("unable to seal value")]
    Seal,
    #[error("unable to open envelope")]
    Open,
    #[error("value encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// The ciphertext envelope stored in place of a secure param value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureData {
    /// Ephemeral X25519 public key used for this envelope.
    #[serde(with = "hex::serde")]
    pub key: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub nonce: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub payload: Vec<u8>,
}

fn as_key(bytes: &[u8]) -> Result<[u8; KEY_SIZE], SecureError> {
    bytes
        .try_into()
        .map_err(|_| SecureError::KeyLength(bytes.len()))
}

/// Copy secret bytes into a buffer that is wiped on drop.
fn as_secret_key(bytes: &[u8]) -> Result<Zeroizing<[u8; KEY_SIZE]>, SecureError> {
    Ok(Zeroizing::new(as_key(bytes)?))
}

fn derive_cipher(shared: &[u8; 32]) -> ChaCha20Poly1305 {
    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut okm = Zeroizing::new([0u8; KEY_SIZE]);
    // expand only fails for oversized output lengths
    hk.expand(KDF_INFO, okm.as_mut())
        .expect("HKDF output length is fixed");
    ChaCha20Poly1305::new(Key::from_slice(okm.as_ref()))
}

impl SecureData {
    /// Seal a JSON value to `peer_public` (the owning object's public
    /// key).
    pub fn seal(peer_public: &[u8], value: &serde_json::Value) -> Result<Self, SecureError> {
        let peer = PublicKey::from(as_key(peer_public)?);
        let eph = StaticSecret::random_from_rng(&mut rand::rngs::OsRng);
        let eph_pub = PublicKey::from(&eph);
        let shared = eph.diffie_hellman(&peer);
        let cipher = derive_cipher(shared.as_bytes());

        let mut nonce = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let plain = serde_json::to_vec(value)?;
        let payload = cipher
            .encrypt(Nonce::from_slice(&nonce), plain.as_slice())
            .map_err(|_| SecureError::Seal)?;

        Ok(Self {
            key: eph_pub.as_bytes().to_vec(),
            nonce: nonce.to_vec(),
            payload,
        })
    }

    /// Open the envelope with the owning object's private key.
    pub fn open(&self, private_key: &[u8]) -> Result<serde_json::Value, SecureError> {
        if self.nonce.len() != NONCE_SIZE {
            return Err(SecureError::Malformed(format!(
                "nonce must be {NONCE_SIZE} bytes, got {}",
                self.nonce.len()
            )));
        }
        let secret_bytes = as_secret_key(private_key)?;
        let secret = StaticSecret::from(*secret_bytes);
        let eph_pub = PublicKey::from(as_key(&self.key)?);
        let shared = secret.diffie_hellman(&eph_pub);
        let cipher = derive_cipher(shared.as_bytes());

        let plain = cipher
            .decrypt(Nonce::from_slice(&self.nonce), self.payload.as_slice())
            .map_err(|_| SecureError::Open)?;
        Ok(serde_json::from_slice(&plain)?)
    }
}

/// Derive the X25519 public key for a stored 32-byte private key.
pub fn public_key_for(private_key: &[u8]) -> Result<[u8; KEY_SIZE], SecureError> {
    let secret_bytes = as_secret_key(private_key)?;
    let secret = StaticSecret::from(*secret_bytes);
    Ok(*PublicKey::from(&secret).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keypair() -> ([u8; 32], [u8; 32]) {
        let mut private = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut private);
        let public = public_key_for(&private).unwrap();
        (private, public)
    }

    #[test]
    fn seal_open_roundtrip() {
        let (private, public) = keypair();
        let value = json!({"user": "root", "password": "hunter2"});
        let sealed = SecureData::seal(&public, &value).unwrap();
        assert_ne!(sealed.payload, serde_json::to_vec(&value).unwrap());
        assert_eq!(sealed.open(&private).unwrap(), value);
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let (_, public) = keypair();
        let (other_private, _) = keypair();
        let sealed = SecureData::seal(&public, &json!("secret")).unwrap();
        assert!(sealed.open(&other_private).is_err());
    }

    #[test]
    fn tampered_payload_fails() {
        let (private, public) = keypair();
        let mut sealed = SecureData::seal(&public, &json!(42)).unwrap();
        sealed.payload[0] ^= 0xff;
        assert!(sealed.open(&private).is_err());
    }

    #[test]
    fn envelope_serializes_as_hex() {
        let (_, public) = keypair();
        let sealed = SecureData::seal(&public, &json!(true)).unwrap();
        let json = serde_json::to_value(&sealed).unwrap();
        let key = json["key"].as_str().unwrap();
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        let back: SecureData = serde_json::from_value(json).unwrap();
        assert_eq!(back, sealed);
    }

    #[test]
    fn short_key_rejected() {
        assert!(matches!(
            SecureData::seal(&[0u8; 16], &json!(null)),
            Err(SecureError::KeyLength(16))
        ));
    }
}
