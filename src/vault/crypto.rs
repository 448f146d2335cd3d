/// Credential encryption at rest (AES-256-GCM)
use crate::error::{SyncError, SyncResult};
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::{rngs::OsRng, RngCore};

const KEY_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;
const TAG_LENGTH: usize = 16;

/// Encrypts secrets for one identity.
///
/// Output is base64 of `nonce || ciphertext || tag`. The identity id is bound as
/// associated data, so a ciphertext copied onto another identity fails to decrypt.
#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    pub fn new(key: [u8; KEY_LENGTH]) -> Self {
        Self {
            cipher: Aes256Gcm::new(&key.into()),
        }
    }

    /// Load a 32-byte key given as hex or base64
    pub fn from_encoded(encoded: &str) -> SyncResult<Self> {
        let encoded = encoded.trim();
        let bytes = if encoded.len() == KEY_LENGTH * 2 && encoded.chars().all(|c| c.is_ascii_hexdigit()) {
            hex::decode(encoded).map_err(|e| SyncError::Configuration(format!("Invalid hex key: {}", e)))?
        } else {
            STANDARD
                .decode(encoded)
                .map_err(|e| SyncError::Configuration(format!("Invalid base64 key: {}", e)))?
        };

        let key: [u8; KEY_LENGTH] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            SyncError::Configuration(format!(
                "Encryption key must be {} bytes, got {}",
                KEY_LENGTH,
                bytes.len()
            ))
        })?;

        Ok(Self::new(key))
    }

    pub fn encrypt(&self, identity_id: i64, plaintext: &str) -> SyncResult<String> {
        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce_bytes);
        let aad = identity_id.to_be_bytes();

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: &aad,
                },
            )
            .map_err(|e| SyncError::Crypto(format!("Encryption failed: {}", e)))?;

        let mut out = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    /// Decrypt a stored secret; any failure means the stored credential is unusable
    pub fn decrypt(&self, identity_id: i64, encoded: &str) -> SyncResult<String> {
        let data = STANDARD
            .decode(encoded)
            .map_err(|_| SyncError::CredentialInvalid("Stored secret is not valid base64".to_string()))?;

        if data.len() < NONCE_LENGTH + TAG_LENGTH {
            return Err(SyncError::CredentialInvalid("Stored secret too short".to_string()));
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LENGTH);
        let aad = identity_id.to_be_bytes();
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| SyncError::CredentialInvalid("Stored secret cannot be decrypted".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| SyncError::CredentialInvalid("Stored secret is not UTF-8".to_string()))
    }
}
