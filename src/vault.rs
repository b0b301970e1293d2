//! Encryption of per-service signing secrets at rest.
//!
//! Secrets are sealed with AES-256-GCM under a single deployment-wide key.
//! Every call draws a fresh nonce, prepended to the output, so the same
//! plaintext never yields the same ciphertext twice.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use rand::distributions::{Alphanumeric, DistString};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::CryptoError;

const KEY_LENGTH: usize = 32;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
/// Length of generated service secrets.
pub const SECRET_LENGTH: usize = 48;

type Result<T> = std::result::Result<T, CryptoError>;

/// VaultKey holds a fixed-size key protected by Zeroizing.
#[derive(Clone)]
pub struct VaultKey(Zeroizing<[u8; KEY_LENGTH]>);

impl VaultKey {
    /// Derive a key from an operator passphrase of any length.
    pub fn derive(passphrase: impl AsRef<[u8]>) -> Self {
        let digest = Sha256::digest(passphrase.as_ref());
        let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
        key.copy_from_slice(&digest);
        Self(key)
    }

    fn as_slice(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("VaultKey(..)")
    }
}

/// Plaintext signing secret of one service.
#[derive(Clone)]
pub struct ServiceSecret(Zeroizing<String>);

impl ServiceSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(Zeroizing::new(secret.into()))
    }

    /// Generate a random alphanumeric secret.
    pub fn generate() -> Self {
        Self::new(Alphanumeric.sample_string(&mut OsRng, SECRET_LENGTH))
    }

    /// Plaintext value. Handle with care.
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for ServiceSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ServiceSecret(..)")
    }
}

/// Encrypted service secret, the only form ever persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealedSecret {
    pub service_id: String,
    /// base64(nonce || ciphertext || tag).
    pub ciphertext: String,
}

/// SecretVault provides seal/open operations with AES-256-GCM.
pub struct SecretVault {
    key: VaultKey,
}

impl SecretVault {
    /// Create a new [`SecretVault`].
    pub fn new(key: VaultKey) -> Self {
        Self { key }
    }

    pub fn from_passphrase(passphrase: impl AsRef<[u8]>) -> Self {
        Self::new(VaultKey::derive(passphrase))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.as_slice()))
    }

    /// Encrypts data returning raw bytes.
    pub fn encrypt(&self, plaintext: impl AsRef<[u8]>) -> Result<Vec<u8>> {
        // Generate random 96-bit nonce.
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let cipher_text = self
            .cipher()
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|_| CryptoError::Aead)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + cipher_text.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&cipher_text);
        Ok(out)
    }

    /// Decrypt raw data.
    pub fn decrypt(&self, data: impl AsRef<[u8]>) -> Result<Vec<u8>> {
        let data = data.as_ref();
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::TooShort {
                value: data.len(),
                expected: NONCE_SIZE + TAG_SIZE,
            });
        }

        let (nonce_bytes, cipher_text) = data.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher()
            .decrypt(nonce, cipher_text)
            .map_err(|_| CryptoError::Aead)
    }

    pub fn encrypt_to_base64(&self, plaintext: impl AsRef<[u8]>) -> Result<String> {
        Ok(STANDARD.encode(self.encrypt(plaintext)?))
    }

    pub fn decrypt_from_base64(&self, data: impl AsRef<[u8]>) -> Result<String> {
        let raw = STANDARD.decode(data)?;
        let plain = self.decrypt(raw)?;
        Ok(String::from_utf8(plain)?)
    }

    /// Encrypt a service secret for storage.
    pub fn seal(&self, service_id: impl Into<String>, secret: &ServiceSecret) -> Result<SealedSecret> {
        Ok(SealedSecret {
            service_id: service_id.into(),
            ciphertext: self.encrypt_to_base64(secret.as_bytes())?,
        })
    }

    /// Decrypt a stored ciphertext back into the service secret.
    pub fn open(&self, ciphertext: &str) -> Result<ServiceSecret> {
        self.decrypt_from_base64(ciphertext).map(ServiceSecret::new)
    }
}

impl fmt::Debug for SecretVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretVault").finish_non_exhaustive()
    }
}
