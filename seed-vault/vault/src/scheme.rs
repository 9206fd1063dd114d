//! Crypto schemes and the native key-derivation collaborator.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CryptoScheme {
    Ed25519,
    Sr25519,
    Ecdsa,
    Ethereum,
}

impl CryptoScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            CryptoScheme::Ed25519 => "ed25519",
            CryptoScheme::Sr25519 => "sr25519",
            CryptoScheme::Ecdsa => "ecdsa",
            CryptoScheme::Ethereum => "ethereum",
        }
    }
}

impl fmt::Display for CryptoScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CryptoScheme {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ed25519" => Ok(CryptoScheme::Ed25519),
            "sr25519" => Ok(CryptoScheme::Sr25519),
            "ecdsa" => Ok(CryptoScheme::Ecdsa),
            "ethereum" => Ok(CryptoScheme::Ethereum),
            other => bail!("unknown crypto scheme {other:?}"),
        }
    }
}

/// Native key-derivation and signing library.
///
/// Only ever sees decrypted phrases, never transport strings.
pub trait PhraseCrypto: Send + Sync {
    /// Generate a new phrase of `words` words.
    fn generate_phrase(&self, scheme: CryptoScheme, words: usize) -> Result<Zeroizing<String>>;

    fn validate_phrase(&self, phrase: &str, scheme: CryptoScheme) -> bool;

    fn derive_address(&self, phrase: &str, scheme: CryptoScheme) -> Result<String>;

    fn sign(&self, phrase: &str, message: &[u8], scheme: CryptoScheme) -> Result<Vec<u8>>;
}

/// Word counts a BIP39 phrase may have.
pub const PHRASE_WORD_COUNTS: [usize; 5] = [12, 15, 18, 21, 24];

/// Phrase checks that need no native library: word count and alphabet.
///
/// Generation, address derivation and signing are reported as unsupported.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuralPhraseCheck;

impl PhraseCrypto for StructuralPhraseCheck {
    fn generate_phrase(&self, scheme: CryptoScheme, _words: usize) -> Result<Zeroizing<String>> {
        bail!("generating a {scheme} phrase requires the native crypto library")
    }

    fn validate_phrase(&self, phrase: &str, _scheme: CryptoScheme) -> bool {
        let words: Vec<&str> = phrase.split(' ').collect();
        PHRASE_WORD_COUNTS.contains(&words.len())
            && words
                .iter()
                .all(|w| !w.is_empty() && w.bytes().all(|b| b.is_ascii_lowercase()))
    }

    fn derive_address(&self, _phrase: &str, scheme: CryptoScheme) -> Result<String> {
        bail!("deriving a {scheme} address requires the native crypto library")
    }

    fn sign(&self, _phrase: &str, _message: &[u8], scheme: CryptoScheme) -> Result<Vec<u8>> {
        bail!("{scheme} signing requires the native crypto library")
    }
}
