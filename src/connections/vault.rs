//! Sealed credential storage.
//!
//! OAuth access and refresh tokens are sealed with ChaCha20-Poly1305 under a
//! single service key. Callers only ever see a [`CredentialHandle`]; opening a
//! handle yields the plaintext in a zeroizing buffer.

use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::generate_random_bytes;

// =============================================================================
// Constants
// =============================================================================

/// Nonce length for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_LEN: usize = 12;

/// Key length (32 bytes)
pub const KEY_LEN: usize = 32;

// =============================================================================
// Types
// =============================================================================

/// Opaque reference to a sealed credential
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CredentialHandle(String);

impl CredentialHandle {
    pub fn new() -> Self {
        Self(format!("cred_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CredentialHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CredentialHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CredentialHandle({})", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VaultError {
    #[error("unknown credential handle {0}")]
    UnknownHandle(String),
    #[error("encryption failed: {0}")]
    Seal(String),
    #[error("credential could not be opened")]
    Open,
}

struct SealedSecret {
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
}

/// Credential vault
pub struct CredentialVault {
    key: Zeroizing<[u8; KEY_LEN]>,
    sealed: DashMap<CredentialHandle, SealedSecret>,
}

impl CredentialVault {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self {
            key: Zeroizing::new(key),
            sealed: DashMap::new(),
        }
    }

    /// Vault under a random key; sealed credentials do not survive a restart
    pub fn ephemeral() -> Self {
        Self::new(generate_random_bytes::<KEY_LEN>())
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(self.key.as_slice()))
    }

    /// Seal a secret and return its handle
    pub fn seal(&self, secret: &str) -> Result<CredentialHandle, VaultError> {
        let nonce: [u8; NONCE_LEN] = generate_random_bytes();
        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), secret.as_bytes())
            .map_err(|e| VaultError::Seal(e.to_string()))?;

        let handle = CredentialHandle::new();
        self.sealed
            .insert(handle.clone(), SealedSecret { nonce, ciphertext });
        Ok(handle)
    }

    /// Open a sealed secret
    pub fn open(&self, handle: &CredentialHandle) -> Result<Zeroizing<String>, VaultError> {
        let entry = self
            .sealed
            .get(handle)
            .ok_or_else(|| VaultError::UnknownHandle(handle.as_str().to_string()))?;

        let plaintext = Zeroizing::new(
            self.cipher()
                .decrypt(Nonce::from_slice(&entry.nonce), entry.ciphertext.as_slice())
                .map_err(|_| VaultError::Open)?,
        );

        let text = std::str::from_utf8(&plaintext).map_err(|_| VaultError::Open)?;
        Ok(Zeroizing::new(text.to_string()))
    }

    /// Drop a sealed secret. Unknown handles are ignored.
    pub fn purge(&self, handle: &CredentialHandle) {
        self.sealed.remove(handle);
    }

    pub fn len(&self) -> usize {
        self.sealed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sealed.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let vault = CredentialVault::ephemeral();
        let handle = vault.seal("ya29.access-token").unwrap();

        assert_eq!(vault.open(&handle).unwrap().as_str(), "ya29.access-token");
        assert_eq!(vault.len(), 1);
    }

    #[test]
    fn test_same_secret_gets_distinct_ciphertext() {
        let vault = CredentialVault::ephemeral();
        let a = vault.seal("same").unwrap();
        let b = vault.seal("same").unwrap();
        assert_ne!(a, b);

        let ca = vault.sealed.get(&a).unwrap().ciphertext.clone();
        let cb = vault.sealed.get(&b).unwrap().ciphertext.clone();
        assert_ne!(ca, cb);
    }

    #[test]
    fn test_purge() {
        let vault = CredentialVault::ephemeral();
        let handle = vault.seal("secret").unwrap();
        vault.purge(&handle);

        assert!(vault.is_empty());
        assert!(matches!(
            vault.open(&handle),
            Err(VaultError::UnknownHandle(_))
        ));
        vault.purge(&handle);
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let vault = CredentialVault::ephemeral();
        let handle = vault.seal("secret").unwrap();
        if let Some(mut entry) = vault.sealed.get_mut(&handle) {
            entry.ciphertext[0] ^= 0xff;
        }
        assert_eq!(vault.open(&handle).unwrap_err(), VaultError::Open);
    }
}
