//! Web session handshake encryption.
//!
//! A fresh 32-byte session key is encrypted with the universe's RSA public
//! key (OAEP, SHA-1). The one-time nonce is encrypted with the session key:
//! a random IV encrypted as a single AES-256 block, followed by the
//! AES-256-CBC/PKCS#7 ciphertext under that IV.

use std::collections::HashMap;

use aes::Aes256;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};
use rand::RngCore;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use sha1::Sha1;
use tracing::{debug, warn};

use tether_core::Universe;

use crate::config::WebConfig;
use crate::error::{RuntimeError, RuntimeResult};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;

const SESSION_KEY_LEN: usize = 32;
const IV_LEN: usize = 16;

/// Output of the handshake encryption.
#[derive(Debug, Clone)]
pub struct EncryptedLogin {
    /// The session key, encrypted with the universe public key.
    pub session_key: Vec<u8>,
    /// The nonce, encrypted with the session key.
    pub encrypted_login_key: Vec<u8>,
}

/// Encrypts a one-time nonce for the handshake of a given universe.
pub trait SessionCipher: Send + Sync {
    /// Returns `None` when no key is known for `universe` or encryption fails.
    fn encrypt_nonce(&self, universe: Universe, nonce: &[u8]) -> Option<EncryptedLogin>;
}

/// RSA/AES cipher keyed by universe.
#[derive(Debug, Default)]
pub struct RsaAesCipher {
    keys: HashMap<Universe, RsaPublicKey>,
}

impl RsaAesCipher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, universe: Universe, key: RsaPublicKey) -> Self {
        self.keys.insert(universe, key);
        self
    }

    /// Loads every hex DER key in `web.universe_keys`. Unknown universe names
    /// are skipped with a warning.
    pub fn from_config(web: &WebConfig) -> RuntimeResult<Self> {
        let mut cipher = Self::new();

        for (name, key) in &web.universe_keys {
            let Some(universe) = parse_universe(name) else {
                warn!(universe = %name, "Ignoring key for unknown universe");
                continue;
            };

            let der = hex::decode(key.trim()).map_err(|e| RuntimeError::InvalidKey {
                universe: name.clone(),
                reason: e.to_string(),
            })?;
            let key = decode_public_key(&der).ok_or_else(|| RuntimeError::InvalidKey {
                universe: name.clone(),
                reason: "not a DER encoded RSA public key".to_string(),
            })?;

            debug!(universe = %universe, "Loaded handshake key");
            cipher.keys.insert(universe, key);
        }

        Ok(cipher)
    }
}

impl SessionCipher for RsaAesCipher {
    fn encrypt_nonce(&self, universe: Universe, nonce: &[u8]) -> Option<EncryptedLogin> {
        let Some(public_key) = self.keys.get(&universe) else {
            warn!(universe = %universe, "No handshake key for universe");
            return None;
        };

        let mut rng = rand::thread_rng();
        let mut key = [0u8; SESSION_KEY_LEN];
        rng.fill_bytes(&mut key);

        let session_key = match public_key.encrypt(&mut rng, Oaep::new::<Sha1>(), &key) {
            Ok(encrypted) => encrypted,
            Err(e) => {
                warn!(universe = %universe, error = %e, "Failed to encrypt session key");
                return None;
            }
        };

        let encrypted_login_key = symmetric_encrypt(&key, nonce, &mut rng)?;

        Some(EncryptedLogin {
            session_key,
            encrypted_login_key,
        })
    }
}

fn symmetric_encrypt(key: &[u8], plaintext: &[u8], rng: &mut impl RngCore) -> Option<Vec<u8>> {
    let mut iv = [0u8; IV_LEN];
    rng.fill_bytes(&mut iv);

    let mut encrypted_iv = aes::Block::from(iv);
    Aes256::new_from_slice(key)
        .ok()?
        .encrypt_block(&mut encrypted_iv);

    let body = Aes256CbcEnc::new_from_slices(key, &iv)
        .ok()?
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut output = Vec::with_capacity(IV_LEN + body.len());
    output.extend_from_slice(&encrypted_iv);
    output.extend_from_slice(&body);
    Some(output)
}

fn decode_public_key(der: &[u8]) -> Option<RsaPublicKey> {
    RsaPublicKey::from_public_key_der(der)
        .or_else(|_| RsaPublicKey::from_pkcs1_der(der))
        .ok()
}

fn parse_universe(name: &str) -> Option<Universe> {
    [
        Universe::Public,
        Universe::Beta,
        Universe::Internal,
        Universe::Dev,
    ]
    .into_iter()
    .find(|universe| universe.as_str().eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use aes::cipher::{BlockDecrypt, BlockDecryptMut};
    use rsa::RsaPrivateKey;
    use rsa::pkcs8::EncodePublicKey;

    use super::*;

    type Aes256CbcDec = cbc::Decryptor<Aes256>;

    #[test]
    fn test_nonce_round_trips_through_private_key() {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let der = private_key.to_public_key().to_public_key_der().unwrap();

        let mut web = WebConfig::default();
        web.universe_keys
            .insert("public".into(), hex::encode(der.as_bytes()));
        let cipher = RsaAesCipher::from_config(&web).unwrap();

        let login = cipher.encrypt_nonce(Universe::Public, b"nonce-1234").unwrap();

        let key = private_key
            .decrypt(Oaep::new::<Sha1>(), &login.session_key)
            .unwrap();
        assert_eq!(key.len(), SESSION_KEY_LEN);

        let (encrypted_iv, body) = login.encrypted_login_key.split_at(IV_LEN);
        let mut iv = aes::Block::clone_from_slice(encrypted_iv);
        Aes256::new_from_slice(&key).unwrap().decrypt_block(&mut iv);
        let plaintext = Aes256CbcDec::new_from_slices(&key, &iv)
            .unwrap()
            .decrypt_padded_vec_mut::<Pkcs7>(body)
            .unwrap();
        assert_eq!(plaintext, b"nonce-1234");
    }

    #[test]
    fn test_missing_universe_key() {
        let cipher = RsaAesCipher::new();
        assert!(cipher.encrypt_nonce(Universe::Beta, b"nonce").is_none());
    }

    #[test]
    fn test_bad_der_is_rejected() {
        let mut web = WebConfig::default();
        web.universe_keys.insert("public".into(), "deadbeef".into());
        assert!(matches!(
            RsaAesCipher::from_config(&web),
            Err(RuntimeError::InvalidKey { .. })
        ));
    }
}
