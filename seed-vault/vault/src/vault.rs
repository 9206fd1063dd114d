//! Named seed records: create, recover, fetch and delete.

use std::collections::BTreeSet;
use zeroize::Zeroizing;

use crate::KeyBackend;
use crate::auth::{AuthCoordinator, AuthPhase, CredentialPrompt, PromptDispatcher};
use crate::codec::{CipherCodec, CodecError, CodecSession, SealedRecord};
use crate::config::Config;
use crate::error::{Result, VaultError};
use crate::key::SecretKeyProvider;
use crate::scheme::{CryptoScheme, PhraseCrypto};
use crate::store::{FileStore, SeedStore};

const STILL_LOCKED: &str = "key still requires authentication after a successful credential check";

/// Where the phrase of a new record comes from.
pub enum SeedSource {
    /// Have the crypto library generate a phrase of this many words.
    Generate { words: usize },
    /// Store a phrase supplied by the user.
    Phrase(Zeroizing<String>),
}

impl SeedSource {
    pub fn phrase(phrase: impl Into<String>) -> Self {
        SeedSource::Phrase(Zeroizing::new(phrase.into()))
    }
}

/// The seed record store.
///
/// Plaintext leaves the vault only as [`Zeroizing`] strings and only after a
/// fresh device credential check.
pub struct SeedVault {
    store: Box<dyn SeedStore>,
    codec: CipherCodec,
    auth: AuthCoordinator,
    crypto: Box<dyn PhraseCrypto>,
    reject_duplicate_phrases: bool,
}

impl SeedVault {
    pub fn new(
        store: Box<dyn SeedStore>,
        codec: CipherCodec,
        auth: AuthCoordinator,
        crypto: Box<dyn PhraseCrypto>,
    ) -> Self {
        Self {
            store,
            codec,
            auth,
            crypto,
            reject_duplicate_phrases: true,
        }
    }

    /// Assemble a file-backed vault from config. The returned dispatcher must
    /// be driven by the thread that owns the prompt.
    pub fn open(
        config: &Config,
        backend: Box<dyn KeyBackend>,
        prompt: impl CredentialPrompt + 'static,
        crypto: Box<dyn PhraseCrypto>,
    ) -> (SeedVault, PromptDispatcher) {
        let keys = SecretKeyProvider::new(backend, config.key_policy());
        let (auth, dispatcher) = AuthCoordinator::new(config.auth_config(), prompt);
        let vault = SeedVault::new(
            Box::new(FileStore::new(&config.vault.store_path)),
            CipherCodec::new(keys),
            auth,
            crypto,
        )
        .reject_duplicate_phrases(config.vault.reject_duplicate_phrases);
        (vault, dispatcher)
    }

    pub fn reject_duplicate_phrases(mut self, reject: bool) -> Self {
        self.reject_duplicate_phrases = reject;
        self
    }

    /// Create a record named `name`, returning its phrase once for backup.
    pub fn create(
        &self,
        name: &str,
        scheme: CryptoScheme,
        source: SeedSource,
    ) -> Result<Zeroizing<String>> {
        if self.contains(name)? {
            return Err(VaultError::DuplicateName(name.to_string()));
        }
        if let SeedSource::Phrase(phrase) = &source {
            if !self.crypto.validate_phrase(phrase, scheme) {
                return Err(VaultError::InvalidPhrase(scheme.to_string()));
            }
        }

        // Key creation alone proves nothing; require presence before the
        // first encryption.
        self.authenticate()?;

        let phrase = match source {
            SeedSource::Generate { words } => self
                .crypto
                .generate_phrase(scheme, words)
                .map_err(VaultError::crypto)?,
            SeedSource::Phrase(phrase) => phrase,
        };

        // One unlock covers the duplicate scan and the encryption.
        let session = self.codec.session().map_err(unlock_error)?;

        if self.reject_duplicate_phrases {
            if let Some(existing) = self.find_phrase(&session, &phrase)? {
                return Err(VaultError::DuplicatePhrase(existing));
            }
        }

        let record = session.encode(&phrase).map_err(unlock_error)?;

        if !self
            .store
            .insert_new(name, &record)
            .map_err(VaultError::storage)?
        {
            return Err(VaultError::DuplicateName(name.to_string()));
        }

        log::info!("stored seed {name:?} ({scheme})");
        Ok(phrase)
    }

    /// Store a user-supplied phrase under `name`.
    pub fn recover(
        &self,
        name: &str,
        scheme: CryptoScheme,
        phrase: &str,
    ) -> Result<Zeroizing<String>> {
        self.create(name, scheme, SeedSource::phrase(phrase))
    }

    /// Decrypt the phrase stored as `name`, prompting at most once.
    pub fn fetch(&self, name: &str) -> Result<Zeroizing<String>> {
        let record = self.load(name)?;
        let session = self.unlock()?;
        session.open(&record).map_err(|e| decode_error(name, e))
    }

    /// Decrypt several records behind a single credential check.
    pub fn fetch_many<S: AsRef<str>>(
        &self,
        names: &[S],
    ) -> Result<Vec<(String, Zeroizing<String>)>> {
        let records = names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                self.load(name).map(|record| (name, record))
            })
            .collect::<Result<Vec<_>>>()?;
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let session = self.unlock()?;
        records
            .into_iter()
            .map(|(name, record)| {
                session
                    .open(&record)
                    .map(|phrase| (name.to_string(), phrase))
                    .map_err(|e| decode_error(name, e))
            })
            .collect()
    }

    /// Remove `name`. Removing an absent name succeeds.
    pub fn delete(&self, name: &str) -> Result<()> {
        if self.store.remove(name).map_err(VaultError::storage)? {
            log::info!("deleted seed {name:?}");
        }
        Ok(())
    }

    pub fn list_names(&self) -> Result<BTreeSet<String>> {
        self.store.names().map_err(VaultError::storage)
    }

    pub fn contains(&self, name: &str) -> Result<bool> {
        self.store.contains(name).map_err(VaultError::storage)
    }

    /// Remove every record. The key survives.
    pub fn wipe(&self) -> Result<()> {
        self.store.clear().map_err(VaultError::storage)?;
        log::warn!("wiped all seeds");
        Ok(())
    }

    /// Remove every record and destroy the master key.
    pub fn factory_reset(&self) -> Result<()> {
        self.wipe()?;
        self.codec
            .keys()
            .destroy_key()
            .map_err(|e| VaultError::KeyUnavailable(e.to_string()))
    }

    /// Sign `message` with the key derived from seed `name`.
    pub fn sign(&self, name: &str, message: &[u8], scheme: CryptoScheme) -> Result<Vec<u8>> {
        let phrase = self.fetch(name)?;
        self.crypto
            .sign(&phrase, message, scheme)
            .map_err(VaultError::crypto)
    }

    pub fn derive_address(&self, name: &str, scheme: CryptoScheme) -> Result<String> {
        let phrase = self.fetch(name)?;
        self.crypto
            .derive_address(&phrase, scheme)
            .map_err(VaultError::crypto)
    }

    pub fn is_hardware_backed(&self) -> bool {
        self.codec.keys().is_hardware_backed()
    }

    pub fn auth_phase(&self) -> AuthPhase {
        self.auth.phase()
    }

    /// Cancel any pending credential check and refuse new ones.
    pub fn shutdown(&self) {
        self.auth.shutdown();
    }

    /// Read and parse `name`. A malformed record is reported before any
    /// credential check.
    fn load(&self, name: &str) -> Result<SealedRecord> {
        let transport = self
            .store
            .get(name)
            .map_err(VaultError::storage)?
            .ok_or_else(|| VaultError::NotFound(name.to_string()))?;
        SealedRecord::parse(&transport).map_err(|e| decode_error(name, e))
    }

    /// Proactive credential check, for operations that must prove presence
    /// even while the key is unlocked.
    fn authenticate(&self) -> Result<()> {
        let keys = self.codec.keys();
        self.auth
            .request_authentication_unless(|| false, || keys.record_authentication())?;
        Ok(())
    }

    /// Unlock the key, running one credential check if the window is closed.
    /// A key still locked after a successful check is fatal.
    fn unlock(&self) -> Result<CodecSession> {
        match self.codec.session() {
            Err(CodecError::AuthenticationRequired) => {}
            unlocked => return unlocked.map_err(unlock_error),
        }

        log::debug!("key needs a credential check");
        let keys = self.codec.keys();
        let mut reused = None;
        self.auth.request_authentication_unless(
            || {
                // A check that finished while this one queued counts.
                reused = self.codec.session().ok();
                reused.is_some()
            },
            || keys.record_authentication(),
        )?;

        match reused {
            Some(session) => Ok(session),
            None => self.codec.session().map_err(unlock_error),
        }
    }

    /// Name of the record already holding `phrase`, if any.
    fn find_phrase(&self, session: &CodecSession, phrase: &str) -> Result<Option<String>> {
        for name in self.list_names()? {
            let Some(record) = self.store.get(&name).map_err(VaultError::storage)? else {
                continue;
            };
            match session.decode(&record) {
                Ok(existing) if existing.as_str() == phrase => return Ok(Some(name)),
                Ok(_) => {}
                Err(e) => log::warn!("skipping unreadable seed {name:?} in duplicate check: {e}"),
            }
        }
        Ok(None)
    }
}

fn unlock_error(e: CodecError) -> VaultError {
    match e {
        CodecError::AuthenticationRequired => VaultError::KeyUnavailable(STILL_LOCKED.into()),
        CodecError::KeyUnavailable(reason) => VaultError::KeyUnavailable(reason),
        other => VaultError::KeyUnavailable(other.to_string()),
    }
}

fn decode_error(name: &str, e: CodecError) -> VaultError {
    match e {
        CodecError::AuthenticationRequired | CodecError::KeyUnavailable(_) => unlock_error(e),
        source => VaultError::CorruptRecord {
            name: name.to_string(),
            source,
        },
    }
}
