use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Length in bytes of the AES-256 record key.
pub const CIPHER_KEY_LEN: usize = 32;

/// Derive the 32-byte AES-256 record key from backend key material.
///
/// - `ikm`: raw key material released by the key backend
/// - `key_alias`: name of the platform key; its SHA-256 is the HKDF salt
/// - `info`: domain_separator string bytes, application-specific context
pub fn derive_cipher_key(
    ikm: &[u8],
    key_alias: &str,
    domain_separator: &str,
) -> Zeroizing<[u8; CIPHER_KEY_LEN]> {
    let salt = alias_digest(key_alias);
    let hk = Hkdf::<Sha256>::new(Some(salt.as_ref()), ikm);
    let mut key = Zeroizing::new([0u8; CIPHER_KEY_LEN]);
    hk.expand(domain_separator.as_bytes(), key.as_mut())
        .expect("32 bytes is valid for HKDF-SHA256");
    key
}

fn alias_digest(key_alias: &str) -> [u8; 32] {
    Sha256::digest(key_alias.as_bytes()).into()
}
