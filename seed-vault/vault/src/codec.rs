//! Seed record transport encoding: `base64(ciphertext) "-" base64(iv)`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use rand::RngCore;
use rand::rngs::OsRng;
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

use crate::key::{IV_LEN, KeyError, SecretKeyProvider, UnlockedKey};

/// Joins the two base64 fields of a transport string. Never part of the
/// standard base64 alphabet.
pub const SEPARATOR: char = '-';

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("key use requires a fresh device credential check")]
    AuthenticationRequired,

    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("record decryption failed")]
    DecryptionFailed,
}

impl From<KeyError> for CodecError {
    fn from(e: KeyError) -> Self {
        match e {
            KeyError::AuthenticationRequired => CodecError::AuthenticationRequired,
            KeyError::Unavailable(reason) => CodecError::KeyUnavailable(reason),
            KeyError::Crypto => CodecError::DecryptionFailed,
        }
    }
}

/// Encrypts seed phrases into transport strings and back.
pub struct CipherCodec {
    keys: SecretKeyProvider,
}

impl CipherCodec {
    pub fn new(keys: SecretKeyProvider) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &SecretKeyProvider {
        &self.keys
    }

    /// Unlock the key for one operation. Fails with `AuthenticationRequired`
    /// when no credential check is inside its window.
    pub fn session(&self) -> Result<CodecSession, CodecError> {
        let key = self.keys.ensure_key()?.unlock()?;
        Ok(CodecSession { key })
    }

    /// Encrypt `plaintext` under a fresh random IV.
    pub fn encode(&self, plaintext: &str) -> Result<String, CodecError> {
        self.session()?.encode(plaintext)
    }

    /// Decrypt a transport string with the record's own IV.
    pub fn decode(&self, transport: &str) -> Result<Zeroizing<String>, CodecError> {
        let record = SealedRecord::parse(transport)?;
        self.session()?.open(&record)
    }
}

/// The unlocked key of one vault operation. Encodes and decodes any number
/// of records without going back to the key backend.
pub struct CodecSession {
    key: UnlockedKey,
}

impl CodecSession {
    pub fn encode(&self, plaintext: &str) -> Result<String, CodecError> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let ciphertext = self
            .key
            .encrypt(&iv, plaintext.as_bytes())
            .map_err(|e| match e {
                // Encryption has no tag to check; a cipher failure here is the platform's.
                KeyError::Crypto => {
                    CodecError::KeyUnavailable("encryption rejected by cipher".into())
                }
                other => other.into(),
            })?;

        Ok(format!("{}{SEPARATOR}{}", B64.encode(ciphertext), B64.encode(iv)))
    }

    pub fn decode(&self, transport: &str) -> Result<Zeroizing<String>, CodecError> {
        self.open(&SealedRecord::parse(transport)?)
    }

    pub fn open(&self, record: &SealedRecord) -> Result<Zeroizing<String>, CodecError> {
        let mut plaintext = self.key.decrypt(&record.iv, &record.ciphertext)?;

        String::from_utf8(std::mem::take(&mut *plaintext))
            .map(Zeroizing::new)
            .map_err(|e| {
                e.into_bytes().zeroize();
                CodecError::DecryptionFailed
            })
    }
}

/// A transport string split into its decoded fields, checked without
/// touching the key.
pub struct SealedRecord {
    ciphertext: Vec<u8>,
    iv: [u8; IV_LEN],
}

impl SealedRecord {
    pub fn parse(transport: &str) -> Result<Self, CodecError> {
        let (ciphertext, iv) = transport
            .split_once(SEPARATOR)
            .ok_or_else(|| CodecError::MalformedRecord("missing separator".into()))?;
        if iv.contains(SEPARATOR) {
            return Err(CodecError::MalformedRecord("more than one separator".into()));
        }

        let ciphertext = decode_field(ciphertext, "ciphertext")?;
        let iv = decode_field(iv, "iv")?;
        let iv: [u8; IV_LEN] = iv.as_slice().try_into().map_err(|_| {
            CodecError::MalformedRecord(format!("iv is {} bytes, expected {IV_LEN}", iv.len()))
        })?;

        Ok(Self { ciphertext, iv })
    }
}

/// Base64 fields may carry line breaks from older encoders; whitespace is
/// not significant.
fn decode_field(field: &str, what: &str) -> Result<Vec<u8>, CodecError> {
    let compact: String = field.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if compact.is_empty() {
        return Err(CodecError::MalformedRecord(format!("empty {what}")));
    }
    B64.decode(compact.as_bytes())
        .map_err(|e| CodecError::MalformedRecord(format!("{what} is not base64: {e}")))
}
