//! AWS KMS provider for `csfle`.
//!
//! Data keys are wrapped with KMS `Encrypt` and unwrapped with KMS `Decrypt`
//! under the customer master key named by each key document's master key.
//! The master key never leaves KMS.
//!
//! # Example
//!
//! ```rust,no_run
//! use csfle::key_vault::MasterKey;
//! use csfle::kms::KmsProviders;
//! use csfle_kms_aws::AwsKms;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Credentials from the AWS SDK's default chain
//! let kms = KmsProviders::new().with(AwsKms::from_env()?);
//!
//! let master_key = MasterKey::Aws {
//!     region: "us-east-1".to_string(),
//!     key: "arn:aws:kms:us-east-1:123456789012:key/12345678-1234-1234-1234-123456789012".to_string(),
//!     endpoint: None,
//! };
//! # let _ = (kms, master_key);
//! # Ok(())
//! # }
//! ```
//!
//! # AWS Configuration
//!
//! [`AwsKms::new`] takes explicit credentials (the `kmsProviders.aws` block of
//! a client configuration). [`AwsKms::from_env`] uses the SDK's default chain:
//! - Environment variables (`AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`)
//! - AWS credentials file (`~/.aws/credentials`)
//! - IAM instance profile, ECS task role, web identity token
//!
//! The provider is synchronous: every call blocks on a private
//! single-threaded runtime, so it must not be called from inside another
//! async runtime.

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use aws_sdk_kms::config::{BehaviorVersion, Builder as KmsConfigBuilder, Credentials, Region};
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::Client as KmsClient;
use csfle::config::AwsCredentials;
use csfle::error::KmsError;
use csfle::key_vault::MasterKey;
use csfle::kms::{ensure_provider, KmsProvider};
use secrecy::{ExposeSecret, SecretVec};
use thiserror::Error;
use tokio::runtime::Runtime;
use tracing::debug;

/// Provider name used in master key documents.
pub const PROVIDER_NAME: &str = "aws";

/// Errors specific to setting up the AWS provider.
#[derive(Debug, Error)]
pub enum AwsKmsError {
    /// The private runtime could not be started
    #[error("cannot start KMS runtime: {0}")]
    Runtime(#[from] std::io::Error),

    /// The master key does not name a usable key or region
    #[error("invalid KMS master key: {0}")]
    InvalidKeyId(String),
}

impl From<AwsKmsError> for KmsError {
    fn from(err: AwsKmsError) -> Self {
        match err {
            AwsKmsError::Runtime(e) => Self::Io(e),
            AwsKmsError::InvalidKeyId(msg) => Self::InvalidMasterKey(msg),
        }
    }
}

/// AWS KMS provider.
///
/// One SDK client is built lazily per (region, endpoint) pair named by the
/// master keys it sees.
pub struct AwsKms {
    runtime: Runtime,
    base: KmsConfigBuilder,
    default_region: Option<String>,
    clients: Mutex<HashMap<(String, Option<String>), KmsClient>>,
}

impl AwsKms {
    /// Creates a provider from explicit credentials.
    ///
    /// # Errors
    ///
    /// Returns `AwsKmsError::Runtime` if the runtime cannot be started.
    pub fn new(credentials: &AwsCredentials) -> Result<Self, AwsKmsError> {
        let base = KmsConfigBuilder::new()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(Credentials::new(
                credentials.access_key_id.clone(),
                credentials.secret_access_key.expose_secret().clone(),
                None,
                None,
                "csfle",
            ));
        Self::with_base(base, credentials.region.clone())
    }

    /// Creates a provider using the SDK's default credential and region chain.
    ///
    /// # Errors
    ///
    /// Returns `AwsKmsError::Runtime` if the runtime cannot be started.
    pub fn from_env() -> Result<Self, AwsKmsError> {
        let runtime = build_runtime()?;
        let sdk_config = runtime.block_on(aws_config::load_defaults(BehaviorVersion::latest()));
        let default_region = sdk_config.region().map(ToString::to_string);

        Ok(Self {
            runtime,
            base: KmsConfigBuilder::from(&sdk_config),
            default_region,
            clients: Mutex::new(HashMap::new()),
        })
    }

    fn with_base(base: KmsConfigBuilder, default_region: Option<String>) -> Result<Self, AwsKmsError> {
        Ok(Self { runtime: build_runtime()?, base, default_region, clients: Mutex::new(HashMap::new()) })
    }

    /// Resolves the SDK client and key id for an AWS master key.
    fn client_for(&self, master_key: &MasterKey) -> Result<(KmsClient, String), KmsError> {
        ensure_provider(self, master_key)?;
        let MasterKey::Aws { region, key, endpoint } = master_key else {
            return Err(AwsKmsError::InvalidKeyId("not an AWS master key".to_string()).into());
        };

        if key.is_empty() {
            return Err(AwsKmsError::InvalidKeyId("empty key id".to_string()).into());
        }
        let region = if region.is_empty() { self.default_region.clone() } else { Some(region.clone()) }
            .ok_or_else(|| AwsKmsError::InvalidKeyId(format!("no region for `{key}`")))?;

        let mut clients = self
            .clients
            .lock()
            .map_err(|_| KmsError::WrapFailed("KMS client cache poisoned".to_string()))?;
        let client = clients
            .entry((region.clone(), endpoint.clone()))
            .or_insert_with(|| {
                debug!(%region, endpoint = endpoint.as_deref(), "building KMS client");
                let mut builder = self.base.clone().region(Region::new(region));
                builder.set_endpoint_url(endpoint.clone());
                KmsClient::from_conf(builder.build())
            })
            .clone();
        Ok((client, key.clone()))
    }
}

fn build_runtime() -> Result<Runtime, AwsKmsError> {
    Ok(tokio::runtime::Builder::new_current_thread().enable_all().build()?)
}

impl fmt::Debug for AwsKms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsKms").field("default_region", &self.default_region).finish_non_exhaustive()
    }
}

impl KmsProvider for AwsKms {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn wrap_key(&self, master_key: &MasterKey, dek: &[u8]) -> Result<Vec<u8>, KmsError> {
        let (client, key_id) = self.client_for(master_key)?;

        let response = self
            .runtime
            .block_on(client.encrypt().key_id(&key_id).plaintext(Blob::new(dek.to_vec())).send())
            .map_err(|e| KmsError::WrapFailed(format!("KMS encrypt failed: {e}")))?;

        let ciphertext = response
            .ciphertext_blob()
            .ok_or_else(|| KmsError::WrapFailed("no ciphertext returned".to_string()))?;

        debug!(%key_id, "data key wrapped");
        Ok(ciphertext.as_ref().to_vec())
    }

    fn unwrap_key(&self, master_key: &MasterKey, wrapped: &[u8]) -> Result<SecretVec<u8>, KmsError> {
        let (client, key_id) = self.client_for(master_key)?;

        let response = self
            .runtime
            .block_on(client.decrypt().key_id(&key_id).ciphertext_blob(Blob::new(wrapped.to_vec())).send())
            .map_err(|e| KmsError::UnwrapFailed(format!("KMS decrypt failed: {e}")))?;

        let plaintext = response
            .plaintext()
            .ok_or_else(|| KmsError::UnwrapFailed("no plaintext returned".to_string()))?;

        debug!(%key_id, "data key unwrapped");
        Ok(SecretVec::new(plaintext.as_ref().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn provider(region: Option<&str>) -> AwsKms {
        AwsKms::new(&AwsCredentials {
            access_key_id: "AKIAEXAMPLE".to_string(),
            secret_access_key: SecretString::new("not-a-real-secret".to_string()),
            region: region.map(str::to_string),
        })
        .unwrap()
    }

    fn aws_key(region: &str, key: &str) -> MasterKey {
        MasterKey::Aws { region: region.to_string(), key: key.to_string(), endpoint: None }
    }

    #[test]
    fn test_provider_name() {
        assert_eq!(provider(None).name(), "aws");
    }

    #[test]
    fn test_rejects_local_master_key() {
        let result = provider(None).wrap_key(&MasterKey::Local, &[0; 64]);
        assert!(matches!(result, Err(KmsError::ProviderMismatch { .. })));
    }

    #[test]
    fn test_requires_region() {
        let result = provider(None).wrap_key(&aws_key("", "alias/csfle"), &[0; 64]);
        assert!(matches!(result, Err(KmsError::InvalidMasterKey(_))));
    }

    #[test]
    fn test_requires_key_id() {
        let result = provider(Some("us-east-1")).unwrap_key(&aws_key("us-east-1", ""), &[1, 2, 3]);
        assert!(matches!(result, Err(KmsError::InvalidMasterKey(_))));
    }

    #[test]
    fn test_clients_cached_per_region() {
        let kms = provider(Some("us-east-1"));
        kms.client_for(&aws_key("", "alias/a")).unwrap();
        kms.client_for(&aws_key("us-east-1", "alias/b")).unwrap();
        kms.client_for(&aws_key("eu-west-1", "alias/c")).unwrap();

        assert_eq!(kms.clients.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_debug_hides_credentials() {
        let debug = format!("{:?}", provider(Some("us-east-1")));
        assert!(!debug.contains("not-a-real-secret"));
        assert!(!debug.contains("AKIAEXAMPLE"));
    }
}
