use thiserror::Error;

use crate::auth::AuthError;
use crate::codec::CodecError;

/// Errors surfaced by [`crate::SeedVault`].
///
/// Each variant calls for a different remedy: a wrong credential, a damaged
/// record and an unknown name must never look alike.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("a seed named {0:?} already exists")]
    DuplicateName(String),

    #[error("this seed phrase is already stored as {0:?}")]
    DuplicatePhrase(String),

    #[error("no seed named {0:?}")]
    NotFound(String),

    #[error("seed phrase rejected for {0}")]
    InvalidPhrase(String),

    #[error("authentication denied: {0}")]
    AuthenticationDenied(String),

    #[error("another authentication session is in progress")]
    AuthenticationBusy,

    #[error("authentication timed out")]
    AuthenticationTimedOut,

    #[error("authentication unavailable: {0}")]
    AuthenticationUnavailable(String),

    #[error("authentication cancelled")]
    AuthenticationCancelled,

    #[error("key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("seed {name:?} is corrupt")]
    CorruptRecord {
        name: String,
        #[source]
        source: CodecError,
    },

    #[error("crypto library error: {0}")]
    Crypto(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl VaultError {
    pub(crate) fn storage(e: anyhow::Error) -> Self {
        VaultError::Storage(format!("{e:#}"))
    }

    pub(crate) fn crypto(e: anyhow::Error) -> Self {
        VaultError::Crypto(format!("{e:#}"))
    }
}

impl From<AuthError> for VaultError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Denied(reason) => VaultError::AuthenticationDenied(reason),
            AuthError::Busy => VaultError::AuthenticationBusy,
            AuthError::TimedOut(_) => VaultError::AuthenticationTimedOut,
            AuthError::Unavailable(reason) => VaultError::AuthenticationUnavailable(reason),
            AuthError::Cancelled => VaultError::AuthenticationCancelled,
        }
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
