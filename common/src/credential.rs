use std::fmt;

use log::{info, warn};
use sha2::{Digest, Sha256};

use crate::error::CredentialError;

pub const API_KEY_LENGTH: usize = 64;

/// Device credential sent in the API key header. Always exactly
/// [`API_KEY_LENGTH`] characters.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn parse(candidate: &str) -> Result<Self, CredentialError> {
        let trimmed = candidate.trim();
        match trimmed.chars().count() {
            0 => Err(CredentialError::Missing),
            API_KEY_LENGTH => Ok(Self(trimmed.to_string())),
            actual => Err(CredentialError::WrongLength {
                expected: API_KEY_LENGTH,
                actual,
            }),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short SHA-256 prefix, safe to show on status pages.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        digest[..4].iter().map(|byte| format!("{byte:02x}")).collect()
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey({})", self.fingerprint())
    }
}

/// Persistent slot for the device credential.
pub trait CredentialStore {
    type Error: fmt::Display;

    fn load(&mut self) -> Result<Option<String>, Self::Error>;
    fn save(&mut self, key: &ApiKey) -> Result<(), Self::Error>;
    fn clear(&mut self) -> Result<(), Self::Error>;
}

/// A stored key of the right length wins, then a valid fallback, otherwise none.
pub fn load_credential<S: CredentialStore>(store: &mut S, fallback: &str) -> Option<ApiKey> {
    match store.load() {
        Ok(Some(stored)) => match ApiKey::parse(&stored) {
            Ok(key) => {
                info!("using stored API key {}", key.fingerprint());
                return Some(key);
            }
            Err(err) => warn!("ignoring stored API key: {err}"),
        },
        Ok(None) => {}
        Err(err) => warn!("failed to read stored API key: {err}"),
    }

    match ApiKey::parse(fallback) {
        Ok(key) => {
            info!("using configured fallback API key {}", key.fingerprint());
            Some(key)
        }
        Err(_) => {
            warn!("no usable API key; requests will be unauthenticated");
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[derive(Debug, Default)]
    pub(crate) struct MemoryStore {
        pub value: Option<String>,
        pub fail_writes: bool,
        pub writes: usize,
    }

    impl CredentialStore for MemoryStore {
        type Error = String;

        fn load(&mut self) -> Result<Option<String>, Self::Error> {
            Ok(self.value.clone())
        }

        fn save(&mut self, key: &ApiKey) -> Result<(), Self::Error> {
            if self.fail_writes {
                return Err("flash write failed".to_string());
            }
            self.writes += 1;
            self.value = Some(key.as_str().to_string());
            Ok(())
        }

        fn clear(&mut self) -> Result<(), Self::Error> {
            self.value = None;
            Ok(())
        }
    }

    pub(crate) fn key_of(ch: char) -> String {
        std::iter::repeat(ch).take(API_KEY_LENGTH).collect()
    }

    #[test]
    fn parse_trims_and_checks_length() {
        let key = ApiKey::parse(&format!("  {}\n", key_of('a'))).unwrap();
        assert_eq!(key.as_str(), key_of('a'));

        assert_eq!(
            ApiKey::parse("short"),
            Err(CredentialError::WrongLength {
                expected: 64,
                actual: 5
            })
        );
        assert_eq!(ApiKey::parse("   "), Err(CredentialError::Missing));
    }

    #[test]
    fn fingerprint_does_not_leak_key() {
        let key = ApiKey::parse(&key_of('f')).unwrap();
        let fingerprint = key.fingerprint();

        assert_eq!(fingerprint.len(), 8);
        assert!(!format!("{key:?}").contains(&key_of('f')));
        assert_eq!(fingerprint, ApiKey::parse(&key_of('f')).unwrap().fingerprint());
        assert_ne!(fingerprint, ApiKey::parse(&key_of('e')).unwrap().fingerprint());
    }

    #[test]
    fn stored_key_takes_precedence() {
        let mut store = MemoryStore {
            value: Some(key_of('s')),
            ..MemoryStore::default()
        };

        let key = load_credential(&mut store, &key_of('d')).unwrap();

        assert_eq!(key.as_str(), key_of('s'));
    }

    #[test]
    fn falls_back_when_stored_key_is_unusable() {
        let mut store = MemoryStore {
            value: Some("truncated".to_string()),
            ..MemoryStore::default()
        };

        let key = load_credential(&mut store, &key_of('d')).unwrap();
        assert_eq!(key.as_str(), key_of('d'));

        let mut empty = MemoryStore::default();
        assert!(load_credential(&mut empty, "").is_none());
    }
}
