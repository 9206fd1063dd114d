//! Access to the single master key, gated on a fresh credential proof.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::KeyBackend;
use crate::crypto::derive_cipher_key;

/// Length of the AES-GCM initialisation vector.
pub const IV_LEN: usize = 12;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// The key exists but may only be used right after a credential check.
    #[error("key use requires a fresh device credential check")]
    AuthenticationRequired,

    #[error("key unavailable: {0}")]
    Unavailable(String),

    /// The cipher rejected its input (tag mismatch, wrong key).
    #[error("cipher operation failed")]
    Crypto,
}

/// How the master key is named and for how long a credential proof counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPolicy {
    pub key_alias: String,
    pub domain_separator: String,
    /// Window after a successful credential check during which the key
    /// may be used. `Duration::ZERO` makes every use fail.
    pub auth_validity: Duration,
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self {
            key_alias: "SeedVaultMasterKey".to_string(),
            domain_separator: "seed-vault/aes-256-gcm/v1".to_string(),
            auth_validity: Duration::from_secs(1),
        }
    }
}

/// Owns the platform key backend and enforces the per-use credential policy.
pub struct SecretKeyProvider {
    backend: Box<dyn KeyBackend>,
    policy: KeyPolicy,
    authenticated_at: Mutex<Option<Instant>>,
}

impl SecretKeyProvider {
    pub fn new(backend: Box<dyn KeyBackend>, policy: KeyPolicy) -> Self {
        Self {
            backend,
            policy,
            authenticated_at: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> &KeyPolicy {
        &self.policy
    }

    /// Create the key if absent and return a handle to it. Idempotent.
    ///
    /// Creating the key does not authorise its use.
    pub fn ensure_key(&self) -> Result<KeyHandle<'_>, KeyError> {
        let created = self
            .backend
            .provision()
            .map_err(|e| KeyError::Unavailable(format!("{e:#}")))?;
        if created {
            log::info!("created master key {}", self.policy.key_alias);
        }
        Ok(KeyHandle { provider: self })
    }

    /// Note a successful device credential check. Opens the validity window.
    pub fn record_authentication(&self) {
        *self.lock() = Some(Instant::now());
    }

    /// Close the validity window early.
    pub fn revoke_authentication(&self) {
        self.lock().take();
    }

    pub fn is_hardware_backed(&self) -> bool {
        self.backend.is_hardware_backed()
    }

    /// Destroy the master key; every existing record becomes undecryptable.
    pub fn destroy_key(&self) -> Result<(), KeyError> {
        self.revoke_authentication();
        self.backend
            .destroy()
            .map_err(|e| KeyError::Unavailable(format!("{e:#}")))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.authenticated_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn check_fresh(&self) -> Result<(), KeyError> {
        match *self.lock() {
            Some(at) if at.elapsed() < self.policy.auth_validity => Ok(()),
            _ => Err(KeyError::AuthenticationRequired),
        }
    }

    /// Whether a credential proof is still inside its validity window.
    pub fn is_unlocked(&self) -> bool {
        self.check_fresh().is_ok()
    }
}

/// Handle to the provisioned master key.
pub struct KeyHandle<'a> {
    provider: &'a SecretKeyProvider,
}

impl KeyHandle<'_> {
    /// Check the credential window once and derive the record cipher.
    ///
    /// The returned key serves one vault operation, however many records
    /// it touches; the window is not re-checked per record.
    pub fn unlock(&self) -> Result<UnlockedKey, KeyError> {
        let provider = self.provider;
        provider.check_fresh()?;
        let ikm = provider
            .backend
            .ikm()
            .map_err(|e| KeyError::Unavailable(format!("{e:#}")))?;
        let key = derive_cipher_key(
            &ikm,
            &provider.policy.key_alias,
            &provider.policy.domain_separator,
        );
        let cipher =
            Aes256Gcm::new_from_slice(&key[..]).map_err(|e| KeyError::Unavailable(e.to_string()))?;
        Ok(UnlockedKey { cipher })
    }
}

/// Record cipher released after a fresh credential check.
pub struct UnlockedKey {
    cipher: Aes256Gcm,
}

impl UnlockedKey {
    pub fn encrypt(&self, iv: &[u8; IV_LEN], plaintext: &[u8]) -> Result<Vec<u8>, KeyError> {
        self.cipher
            .encrypt(Nonce::from_slice(iv), plaintext)
            .map_err(|_| KeyError::Crypto)
    }

    pub fn decrypt(
        &self,
        iv: &[u8; IV_LEN],
        ciphertext: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, KeyError> {
        self.cipher
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| KeyError::Crypto)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryKeyBackend;
    use anyhow::Result as AnyResult;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn provider(validity: Duration) -> SecretKeyProvider {
        SecretKeyProvider::new(
            Box::new(MemoryKeyBackend::new()),
            KeyPolicy {
                auth_validity: validity,
                ..KeyPolicy::default()
            },
        )
    }

    /// Counts how often key material is released.
    struct Counting(MemoryKeyBackend, Arc<AtomicUsize>);

    impl KeyBackend for Counting {
        fn provision(&self) -> AnyResult<bool> {
            self.0.provision()
        }
        fn ikm(&self) -> AnyResult<Zeroizing<Vec<u8>>> {
            self.1.fetch_add(1, Ordering::SeqCst);
            self.0.ikm()
        }
        fn destroy(&self) -> AnyResult<()> {
            self.0.destroy()
        }
    }

    #[test]
    fn unlock_without_credential_check_is_refused() {
        let keys = provider(Duration::from_secs(30));
        let handle = keys.ensure_key().unwrap();
        assert!(matches!(handle.unlock(), Err(KeyError::AuthenticationRequired)));
        assert!(!keys.is_unlocked());
    }

    #[test]
    fn credential_check_opens_window() {
        let keys = provider(Duration::from_secs(30));
        keys.record_authentication();
        assert!(keys.is_unlocked());
        let key = keys.ensure_key().unwrap().unlock().unwrap();
        let iv = [7u8; IV_LEN];
        let ciphertext = key.encrypt(&iv, b"phrase").unwrap();
        assert_eq!(key.decrypt(&iv, &ciphertext).unwrap().as_slice(), b"phrase");

        keys.revoke_authentication();
        assert!(matches!(
            keys.ensure_key().unwrap().unlock(),
            Err(KeyError::AuthenticationRequired)
        ));
    }

    #[test]
    fn zero_validity_never_authorises() {
        let keys = provider(Duration::ZERO);
        keys.record_authentication();
        assert!(matches!(
            keys.ensure_key().unwrap().unlock(),
            Err(KeyError::AuthenticationRequired)
        ));
    }

    #[test]
    fn unlocked_key_outlives_the_window() {
        let released = Arc::new(AtomicUsize::new(0));
        let keys = SecretKeyProvider::new(
            Box::new(Counting(MemoryKeyBackend::new(), Arc::clone(&released))),
            KeyPolicy {
                auth_validity: Duration::from_millis(20),
                ..KeyPolicy::default()
            },
        );
        keys.record_authentication();
        let key = keys.ensure_key().unwrap().unlock().unwrap();
        std::thread::sleep(Duration::from_millis(40));

        let iv = [3u8; IV_LEN];
        for _ in 0..10 {
            let ciphertext = key.encrypt(&iv, b"phrase").unwrap();
            key.decrypt(&iv, &ciphertext).unwrap();
        }
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(!keys.is_unlocked());
    }

    #[test]
    fn destroyed_key_is_unavailable_and_replaced_on_ensure() {
        let keys = provider(Duration::from_secs(30));
        keys.record_authentication();
        let iv = [1u8; IV_LEN];
        let ciphertext = keys
            .ensure_key()
            .unwrap()
            .unlock()
            .unwrap()
            .encrypt(&iv, b"phrase")
            .unwrap();

        keys.destroy_key().unwrap();
        keys.record_authentication();
        let err = KeyHandle { provider: &keys }.unlock().err().unwrap();
        assert!(matches!(err, KeyError::Unavailable(_)));

        let key = keys.ensure_key().unwrap().unlock().unwrap();
        assert_eq!(key.decrypt(&iv, &ciphertext).unwrap_err(), KeyError::Crypto);
    }
}
