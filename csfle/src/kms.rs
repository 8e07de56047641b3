//! Key management abstraction for wrapping data keys under master keys.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chacha20poly1305::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng, Payload},
    ChaCha20Poly1305, Nonce,
};
use secrecy::{ExposeSecret, SecretVec};

use crate::error::KmsError;
use crate::key_vault::MasterKey;

/// Local master key size (256 bits).
pub const LOCAL_MASTER_KEY_SIZE: usize = 32;

const NONCE_SIZE: usize = 12;
const LOCAL_WRAP_AAD: &[u8] = b"csfle/local/dek";

/// Wraps and unwraps data keys under a provider's master keys.
///
/// Implementations must be thread-safe (`Send + Sync`) so a single registry
/// can serve concurrent encryption calls.
pub trait KmsProvider: Send + Sync {
    /// Provider name, as used in master key documents and configuration.
    fn name(&self) -> &'static str;

    /// Wraps (encrypts) a data key under `master_key`.
    ///
    /// # Errors
    ///
    /// Returns `KmsError::ProviderMismatch` if the master key belongs to another
    /// provider, or `KmsError::WrapFailed` if wrapping fails.
    fn wrap_key(&self, master_key: &MasterKey, dek: &[u8]) -> Result<Vec<u8>, KmsError>;

    /// Unwraps (decrypts) a data key previously wrapped under `master_key`.
    ///
    /// # Errors
    ///
    /// Returns `KmsError::UnwrapFailed` if unwrapping fails.
    fn unwrap_key(&self, master_key: &MasterKey, wrapped: &[u8]) -> Result<SecretVec<u8>, KmsError>;
}

/// Checks that `master_key` belongs to `provider`.
///
/// # Errors
///
/// Returns `KmsError::ProviderMismatch` otherwise.
pub fn ensure_provider(provider: &dyn KmsProvider, master_key: &MasterKey) -> Result<(), KmsError> {
    if master_key.provider() == provider.name() {
        Ok(())
    } else {
        Err(KmsError::ProviderMismatch {
            provider: provider.name().to_string(),
            master_key: master_key.provider().to_string(),
        })
    }
}

/// Provider holding a 256-bit master key in process memory.
///
/// Suitable for development and tests; the master key itself has to be kept
/// somewhere safe by the caller.
pub struct LocalKms {
    master_key: SecretVec<u8>,
}

impl LocalKms {
    /// Creates a provider from raw master key bytes.
    ///
    /// # Errors
    ///
    /// Returns `KmsError::InvalidMasterKey` if the key is not 32 bytes.
    pub fn new(master_key: SecretVec<u8>) -> Result<Self, KmsError> {
        let len = master_key.expose_secret().len();
        if len != LOCAL_MASTER_KEY_SIZE {
            return Err(KmsError::InvalidMasterKey(format!(
                "expected {LOCAL_MASTER_KEY_SIZE} bytes, got {len}"
            )));
        }
        Ok(Self { master_key })
    }

    /// Generates a fresh random master key.
    #[must_use]
    pub fn generate_master_key() -> SecretVec<u8> {
        let mut key = vec![0u8; LOCAL_MASTER_KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        SecretVec::new(key)
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305, KmsError> {
        ChaCha20Poly1305::new_from_slice(self.master_key.expose_secret())
            .map_err(|e| KmsError::InvalidMasterKey(e.to_string()))
    }
}

impl fmt::Debug for LocalKms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKms").field("master_key", &"[REDACTED]").finish()
    }
}

impl KmsProvider for LocalKms {
    fn name(&self) -> &'static str {
        "local"
    }

    fn wrap_key(&self, master_key: &MasterKey, dek: &[u8]) -> Result<Vec<u8>, KmsError> {
        ensure_provider(self, master_key)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce_bytes), Payload { msg: dek, aad: LOCAL_WRAP_AAD })
            .map_err(|e| KmsError::WrapFailed(format!("ChaCha20-Poly1305 wrap failed: {e}")))?;

        let mut wrapped = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        wrapped.extend_from_slice(&nonce_bytes);
        wrapped.extend_from_slice(&ciphertext);
        Ok(wrapped)
    }

    fn unwrap_key(&self, master_key: &MasterKey, wrapped: &[u8]) -> Result<SecretVec<u8>, KmsError> {
        ensure_provider(self, master_key)?;

        if wrapped.len() <= NONCE_SIZE {
            return Err(KmsError::UnwrapFailed("wrapped key truncated".to_string()));
        }
        let (nonce, ciphertext) = wrapped.split_at(NONCE_SIZE);

        let dek = self
            .cipher()?
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad: LOCAL_WRAP_AAD })
            .map_err(|_| KmsError::UnwrapFailed("authentication failed".to_string()))?;

        Ok(SecretVec::new(dek))
    }
}

/// Registry of configured providers, keyed by provider name.
#[derive(Clone, Default)]
pub struct KmsProviders {
    providers: HashMap<&'static str, Arc<dyn KmsProvider>>,
}

impl KmsProviders {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider, replacing any previous one with the same name.
    #[must_use]
    pub fn with(mut self, provider: impl KmsProvider + 'static) -> Self {
        self.providers.insert(provider.name(), Arc::new(provider));
        self
    }

    /// Returns the provider responsible for `master_key`.
    ///
    /// # Errors
    ///
    /// Returns `KmsError::ProviderNotConfigured` if no such provider is registered.
    pub fn for_master_key(&self, master_key: &MasterKey) -> Result<&dyn KmsProvider, KmsError> {
        self.providers
            .get(master_key.provider())
            .map(|provider| &**provider)
            .ok_or_else(|| KmsError::ProviderNotConfigured(master_key.provider().to_string()))
    }

    /// Names of the registered providers.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.providers.keys().copied()
    }
}

impl fmt::Debug for KmsProviders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("KmsProviders").field("providers", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> LocalKms {
        LocalKms::new(SecretVec::new(vec![42u8; LOCAL_MASTER_KEY_SIZE])).unwrap()
    }

    #[test]
    fn test_local_wrap_unwrap_round_trip() {
        let kms = local();
        let dek = [7u8; 64];

        let wrapped = kms.wrap_key(&MasterKey::Local, &dek).expect("Wrap failed");
        assert_ne!(&wrapped[NONCE_SIZE..NONCE_SIZE + dek.len()], &dek[..]);

        let unwrapped = kms.unwrap_key(&MasterKey::Local, &wrapped).expect("Unwrap failed");
        assert_eq!(unwrapped.expose_secret(), &dek.to_vec());
    }

    #[test]
    fn test_local_wrong_master_key_fails() {
        let wrapped = local().wrap_key(&MasterKey::Local, &[1u8; 64]).unwrap();
        let other = LocalKms::new(SecretVec::new(vec![1u8; LOCAL_MASTER_KEY_SIZE])).unwrap();

        let result = other.unwrap_key(&MasterKey::Local, &wrapped);
        assert!(matches!(result, Err(KmsError::UnwrapFailed(_))));
    }

    #[test]
    fn test_local_rejects_foreign_master_key() {
        let aws = MasterKey::Aws { region: "us-east-1".into(), key: "alias/demo".into(), endpoint: None };
        let result = local().wrap_key(&aws, &[0u8; 64]);
        assert!(matches!(result, Err(KmsError::ProviderMismatch { .. })));
    }

    #[test]
    fn test_local_invalid_master_key_length() {
        let result = LocalKms::new(SecretVec::new(vec![0u8; 16]));
        assert!(matches!(result, Err(KmsError::InvalidMasterKey(_))));
    }

    #[test]
    fn test_registry_lookup() {
        let providers = KmsProviders::new().with(local());

        assert_eq!(providers.for_master_key(&MasterKey::Local).unwrap().name(), "local");

        let aws = MasterKey::Aws { region: "us-east-1".into(), key: "alias/demo".into(), endpoint: None };
        let result = providers.for_master_key(&aws);
        assert!(matches!(result, Err(KmsError::ProviderNotConfigured(name)) if name == "aws"));
    }

    #[test]
    fn test_generated_master_keys_differ() {
        let k1 = LocalKms::generate_master_key();
        let k2 = LocalKms::generate_master_key();
        assert_ne!(k1.expose_secret(), k2.expose_secret());
        assert_eq!(k1.expose_secret().len(), LOCAL_MASTER_KEY_SIZE);
    }
}
