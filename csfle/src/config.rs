//! Client configuration.
//!
//! Configurations are plain values: switching modes means building a new
//! configuration (`with_bypass`, `with_schema_map`) and a new client from it.
//!
//! ```json
//! {
//!   "kmsProviders": { "local": { "key": "<base64, 32 bytes>" } },
//!   "connectionTarget": "memory://demo",
//!   "keyVaultNamespace": "demoFLE.__keystore",
//!   "schemaMap": {},
//!   "bypassAutoEncryption": false
//! }
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use secrecy::{ExposeSecret, SecretString, SecretVec};
use serde::Deserialize;

use crate::error::Error;
use crate::kms::{KmsProviders, LocalKms};
use crate::schema::SchemaMap;

/// Scheme accepted in `connectionTarget`.
pub const MEMORY_SCHEME: &str = "memory://";

/// A `db.collection` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct Namespace {
    db: String,
    collection: String,
}

impl Namespace {
    /// Creates a namespace from its parts.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if either part is empty or the
    /// database name contains a dot.
    pub fn new(db: impl Into<String>, collection: impl Into<String>) -> Result<Self, Error> {
        let (db, collection) = (db.into(), collection.into());
        if db.is_empty() || collection.is_empty() || db.contains('.') {
            return Err(Error::InvalidConfig(format!("invalid namespace `{db}.{collection}`")));
        }
        Ok(Self { db, collection })
    }

    /// Database name.
    #[must_use]
    pub fn db(&self) -> &str {
        &self.db
    }

    /// Collection name.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }
}

impl FromStr for Namespace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (db, collection) =
            s.split_once('.').ok_or_else(|| Error::InvalidConfig(format!("invalid namespace `{s}`")))?;
        Self::new(db, collection)
    }
}

impl TryFrom<String> for Namespace {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.collection)
    }
}

/// Local master key credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalCredentials {
    /// Base64-encoded 32-byte master key
    pub key: SecretString,
}

/// AWS KMS credentials.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsCredentials {
    /// IAM access key id
    pub access_key_id: String,
    /// IAM secret access key
    pub secret_access_key: SecretString,
    /// Default region for master keys that do not name one
    #[serde(default)]
    pub region: Option<String>,
}

/// Credentials per KMS provider.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KmsCredentials {
    /// Local provider
    #[serde(default)]
    pub local: Option<LocalCredentials>,
    /// AWS provider
    #[serde(default)]
    pub aws: Option<AwsCredentials>,
}

impl KmsCredentials {
    /// Builds the local provider, if configured.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if the key is not valid base64 or not
    /// 32 bytes long.
    pub fn local_kms(&self) -> Result<Option<LocalKms>, Error> {
        let Some(local) = &self.local else { return Ok(None) };

        let bytes = STANDARD
            .decode(local.key.expose_secret().trim())
            .map_err(|e| Error::InvalidConfig(format!("local master key: {e}")))?;
        LocalKms::new(SecretVec::new(bytes))
            .map(Some)
            .map_err(|e| Error::InvalidConfig(format!("local master key: {e}")))
    }
}

/// Immutable client configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClientConfig {
    #[serde(default)]
    kms_providers: KmsCredentials,
    #[serde(default = "default_connection_target")]
    connection_target: String,
    key_vault_namespace: Namespace,
    #[serde(default)]
    schema_map: SchemaMap,
    #[serde(default)]
    bypass_auto_encryption: bool,
}

fn default_connection_target() -> String {
    MEMORY_SCHEME.to_string()
}

impl ClientConfig {
    /// Creates a configuration with no KMS providers, an empty schema map
    /// and automatic encryption enabled.
    #[must_use]
    pub fn new(key_vault_namespace: Namespace) -> Self {
        Self {
            kms_providers: KmsCredentials::default(),
            connection_target: default_connection_target(),
            key_vault_namespace,
            schema_map: SchemaMap::default(),
            bypass_auto_encryption: false,
        }
    }

    /// Parses and validates a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` for malformed JSON, an unsupported
    /// connection target, or an invalid schema map.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let config: Self = serde_json::from_str(json).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if the file cannot be read or parsed.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    fn validate(&self) -> Result<(), Error> {
        if !self.connection_target.starts_with(MEMORY_SCHEME) {
            return Err(Error::InvalidConfig(format!(
                "unsupported connection target `{}`",
                self.connection_target
            )));
        }
        for namespace in self.schema_map.namespaces() {
            namespace.parse::<Namespace>()?;
            self.schema_map.policy_table(namespace)?;
        }
        Ok(())
    }

    /// Returns a copy connecting to another store; see [`crate::store::connect`].
    #[must_use]
    pub fn with_connection_target(mut self, target: impl Into<String>) -> Self {
        self.connection_target = target.into();
        self
    }

    /// Returns a copy with local master key credentials.
    #[must_use]
    pub fn with_local_key(mut self, key: SecretString) -> Self {
        self.kms_providers.local = Some(LocalCredentials { key });
        self
    }

    /// Returns a copy with AWS credentials.
    #[must_use]
    pub fn with_aws(mut self, credentials: AwsCredentials) -> Self {
        self.kms_providers.aws = Some(credentials);
        self
    }

    /// Returns a copy with a different schema map.
    #[must_use]
    pub fn with_schema_map(mut self, schema_map: SchemaMap) -> Self {
        self.schema_map = schema_map;
        self
    }

    /// Returns a copy with automatic encryption bypassed or enabled.
    #[must_use]
    pub fn with_bypass(mut self, bypass: bool) -> Self {
        self.bypass_auto_encryption = bypass;
        self
    }

    /// Per-provider credentials.
    #[must_use]
    pub const fn kms_credentials(&self) -> &KmsCredentials {
        &self.kms_providers
    }

    /// KMS providers the core can build from this configuration (local only).
    /// Other providers are added by their crates with [`KmsProviders::with`].
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if the local key is malformed.
    pub fn kms_providers(&self) -> Result<KmsProviders, Error> {
        let providers = KmsProviders::new();
        Ok(match self.kms_providers.local_kms()? {
            Some(local) => providers.with(local),
            None => providers,
        })
    }

    /// Store connection target, opened by [`crate::client::EncryptedClient::connect`].
    #[must_use]
    pub fn connection_target(&self) -> &str {
        &self.connection_target
    }

    /// Namespace of the key vault.
    #[must_use]
    pub const fn key_vault_namespace(&self) -> &Namespace {
        &self.key_vault_namespace
    }

    /// Client-side schema map.
    #[must_use]
    pub const fn schema_map(&self) -> &SchemaMap {
        &self.schema_map
    }

    /// Whether automatic encryption is bypassed.
    #[must_use]
    pub const fn bypass_auto_encryption(&self) -> bool {
        self.bypass_auto_encryption
    }
}
