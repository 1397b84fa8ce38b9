//! Local inspection of PKCS#12 payloads before they are shipped to keytool.

use p12_keystore::{KeyStore, KeyStoreEntry};

use crate::JksError;

/// Alias of the first key entry in a password-protected PKCS#12 bundle;
/// keytool needs it as `-srcalias`.
///
/// Entries are visited in alias order, not container order, so with several
/// key entries the alphabetically smallest alias wins.  A key bag without a
/// friendlyName is reported under its certificate subject (`CN=...`).
pub fn first_key_alias(bytes: &[u8], password: &str) -> Result<String, JksError> {
    let store = KeyStore::from_pkcs12(bytes, password)
        .map_err(|e| JksError::InvalidCertificate(format!("unreadable PKCS#12 data: {e}")))?;
    store
        .entries()
        .find_map(|(alias, entry)| match entry {
            KeyStoreEntry::PrivateKeyChain(_) => Some(alias.to_string()),
            _ => None,
        })
        .ok_or_else(|| JksError::InvalidCertificate("PKCS#12 data contains no private key entry".into()))
}
