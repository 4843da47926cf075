//! At-rest protection for stored credentials.
//!
//! Secrets are sealed with AES-256-GCM. The key is derived with PBKDF2 from
//! the local machine and user identity, so a config file copied to another
//! machine cannot be opened there. The encoded form is
//! `base64(salt || nonce || ciphertext || tag)`.

use std::num::NonZeroU32;

use base64::{Engine as _, engine::general_purpose};
use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::pbkdf2::{PBKDF2_HMAC_SHA256, derive};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{AppError, Result};

const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;
const PBKDF2_ITERATIONS: u32 = 100_000;

pub struct SecretCipher {
    rng: SystemRandom,
    identity: String,
}

impl SecretCipher {
    pub fn new() -> Self {
        Self::with_identity(machine_identity())
    }

    /// Cipher bound to an explicit identity string instead of the machine's.
    pub fn with_identity(identity: impl Into<String>) -> Self {
        Self {
            rng: SystemRandom::new(),
            identity: identity.into(),
        }
    }

    fn key_for(&self, salt: &[u8]) -> Result<LessSafeKey> {
        let iterations = NonZeroU32::new(PBKDF2_ITERATIONS)
            .ok_or_else(|| AppError::Encryption("Invalid iteration count".to_string()))?;

        let mut key_bytes = [0u8; KEY_LEN];
        derive(
            PBKDF2_HMAC_SHA256,
            iterations,
            salt,
            self.identity.as_bytes(),
            &mut key_bytes,
        );

        let unbound = UnboundKey::new(&AES_256_GCM, &key_bytes)
            .map_err(|_| AppError::Encryption("Failed to create key".to_string()))?;
        Ok(LessSafeKey::new(unbound))
    }

    fn random<const N: usize>(&self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.rng
            .fill(&mut buf)
            .map_err(|_| AppError::Encryption("Failed to gather randomness".to_string()))?;
        Ok(buf)
    }

    pub fn seal(&self, plain: &str) -> Result<String> {
        let salt: [u8; SALT_LEN] = self.random()?;
        let nonce_bytes: [u8; NONCE_LEN] = self.random()?;
        let key = self.key_for(&salt)?;

        let mut body = plain.as_bytes().to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut body,
        )
        .map_err(|_| AppError::Encryption("Failed to encrypt secret".to_string()))?;

        let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + body.len());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&body);
        Ok(general_purpose::STANDARD.encode(out))
    }

    pub fn open(&self, sealed: &str) -> Result<String> {
        let data = general_purpose::STANDARD
            .decode(sealed)
            .map_err(|_| AppError::Encryption("Invalid base64 encoding".to_string()))?;

        if data.len() < SALT_LEN + NONCE_LEN + TAG_LEN {
            return Err(AppError::Encryption(
                "Invalid encrypted data length".to_string(),
            ));
        }

        let (salt, rest) = data.split_at(SALT_LEN);
        let (nonce_bytes, body) = rest.split_at(NONCE_LEN);
        let nonce: [u8; NONCE_LEN] = nonce_bytes
            .try_into()
            .map_err(|_| AppError::Encryption("Invalid nonce length".to_string()))?;

        let key = self.key_for(salt)?;
        let mut body = body.to_vec();
        let plain = key
            .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut body)
            .map_err(|_| AppError::Encryption("Failed to decrypt secret".to_string()))?;

        String::from_utf8(plain.to_vec())
            .map_err(|_| AppError::Encryption("Invalid UTF-8 in decrypted secret".to_string()))
    }
}

impl Default for SecretCipher {
    fn default() -> Self {
        Self::new()
    }
}

fn machine_identity() -> String {
    let hostname = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "default_host".to_string());
    let username = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "default_user".to_string());
    format!("hostdeck_{hostname}_{username}")
}

/// serde adapters for `Option<String>` secrets stored sealed.
pub mod sealed {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::SecretCipher;

    pub fn serialize<S>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(plain) => {
                let sealed = SecretCipher::new()
                    .seal(plain)
                    .map_err(serde::ser::Error::custom)?;
                serializer.serialize_some(&sealed)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sealed: Option<String> = Option::deserialize(deserializer)?;
        sealed
            .map(|s| SecretCipher::new().open(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
