pub mod auth;
pub mod backend;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod key;
pub mod scheme;
pub mod store;
pub mod vault;

#[cfg(feature = "tpm-provider")]
pub mod tpm;

pub use auth::{
    AuthConfig, AuthCoordinator, AuthError, AuthOutcome, AuthPhase, BusyPolicy, CredentialPrompt,
    PromptCompletion, PromptDispatcher, PromptInfo,
};
pub use codec::{CipherCodec, CodecError, CodecSession, SealedRecord};
pub use error::{Result, VaultError};
pub use key::{KeyError, KeyHandle, KeyPolicy, SecretKeyProvider, UnlockedKey};
pub use scheme::{CryptoScheme, PhraseCrypto, StructuralPhraseCheck};
pub use store::{FileStore, MemoryStore, SeedStore};
pub use vault::{SeedSource, SeedVault};

use anyhow::Result as AnyResult;
use zeroize::Zeroizing;

use crate::config::{BackendKind, Config};

/// Trait for platform key facilities.
///
/// A backend holds the single symmetric master key outside the vault's
/// records. Key material is read once per vault operation and fed into
/// HKDF-SHA256 together with the key alias and domain separator to derive
/// the AES-256 record key.
pub trait KeyBackend: Send + Sync {
    /// Create the key if it does not exist yet. Idempotent.
    ///
    /// Returns `true` when this call created the key.
    fn provision(&self) -> AnyResult<bool>;

    /// Return the input keying material for record key derivation.
    fn ikm(&self) -> AnyResult<Zeroizing<Vec<u8>>>;

    /// Irreversibly destroy the key. Every record encrypted under it
    /// becomes undecryptable.
    fn destroy(&self) -> AnyResult<()>;

    /// Whether the key lives in dedicated hardware.
    fn is_hardware_backed(&self) -> bool {
        false
    }
}

/// Pick the key backend named by the config.
///
/// Detection order for `auto`: TPM → key file.
pub fn detect_backend(config: &Config) -> AnyResult<Box<dyn KeyBackend>> {
    match config.vault.backend {
        BackendKind::File => Ok(Box::new(backend::FileKeyBackend::new(&config.vault.key_path))),
        BackendKind::Tpm => tpm_backend(),
        BackendKind::Auto => {
            #[cfg(feature = "tpm-provider")]
            if tpm::detect_platform() {
                log::info!("detected TPM key backend");
                return Ok(Box::new(tpm::TpmKeyBackend::default()));
            }

            log::info!("using key file {}", config.vault.key_path.display());
            Ok(Box::new(backend::FileKeyBackend::new(&config.vault.key_path)))
        }
    }
}

#[cfg(feature = "tpm-provider")]
fn tpm_backend() -> AnyResult<Box<dyn KeyBackend>> {
    if !tpm::detect_platform() {
        anyhow::bail!("TPM backend requested but no TPM device found");
    }
    Ok(Box::new(tpm::TpmKeyBackend::default()))
}

#[cfg(not(feature = "tpm-provider"))]
fn tpm_backend() -> AnyResult<Box<dyn KeyBackend>> {
    anyhow::bail!("TPM backend requested but built without the tpm-provider feature")
}
