//! Field policies: which dotted paths are encrypted, how, and under which key.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::value::BsonType;

/// Encryption algorithm for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    /// Same key and plaintext always give the same ciphertext; supports equality queries.
    #[serde(alias = "AEAD_AES_256_CBC_HMAC_SHA_512-Deterministic")]
    Deterministic,
    /// Every encryption is fresh; no queries, no equality leakage.
    #[serde(alias = "AEAD_AES_256_CBC_HMAC_SHA_512-Random")]
    Randomized,
}

impl Algorithm {
    /// Tag byte stored in the ciphertext prefix.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Deterministic => 1,
            Self::Randomized => 2,
        }
    }

    /// Parses a tag byte.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Deterministic),
            2 => Some(Self::Randomized),
            _ => None,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deterministic => f.write_str("Deterministic"),
            Self::Randomized => f.write_str("Randomized"),
        }
    }
}

/// Encryption policy for a single field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPolicy {
    path: String,
    bson_type: BsonType,
    algorithm: Algorithm,
    key_alias: String,
}

impl FieldPolicy {
    /// Creates a policy.
    ///
    /// # Arguments
    ///
    /// * `path` - Dotted field path, e.g. `contact.email`
    /// * `bson_type` - Declared plaintext type
    /// * `algorithm` - Encryption algorithm
    /// * `key_alias` - Alias of the data key to encrypt with
    #[must_use]
    pub fn new(
        path: impl Into<String>,
        bson_type: BsonType,
        algorithm: Algorithm,
        key_alias: impl Into<String>,
    ) -> Self {
        Self { path: path.into(), bson_type, algorithm, key_alias: key_alias.into() }
    }

    /// Dotted field path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Declared plaintext type.
    #[must_use]
    pub const fn bson_type(&self) -> BsonType {
        self.bson_type
    }

    /// Encryption algorithm.
    #[must_use]
    pub const fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Data key alias.
    #[must_use]
    pub fn key_alias(&self) -> &str {
        &self.key_alias
    }
}

/// Immutable table of field policies for one collection.
///
/// Lookups are exact dotted-path matches; there are no wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyTable {
    policies: BTreeMap<String, FieldPolicy>,
}

impl PolicyTable {
    /// Builds a table from policies.
    ///
    /// Identical duplicates collapse into one entry.
    ///
    /// # Errors
    ///
    /// - `Error::ConflictingPolicy` if two policies for one path differ, or if
    ///   one encrypted path lies inside another
    /// - `Error::InvalidSchema` for an empty path segment, or Deterministic on
    ///   a type that does not support it
    pub fn define(policies: impl IntoIterator<Item = FieldPolicy>) -> Result<Self, Error> {
        let mut table = BTreeMap::<String, FieldPolicy>::new();

        for policy in policies {
            if policy.path.split('.').any(str::is_empty) {
                return Err(Error::InvalidSchema(format!("invalid field path `{}`", policy.path)));
            }
            if policy.algorithm == Algorithm::Deterministic && !policy.bson_type.supports_deterministic() {
                return Err(Error::InvalidSchema(format!(
                    "`{}`: deterministic encryption is not supported for {}",
                    policy.path, policy.bson_type
                )));
            }

            if let Some(existing) = table.get(&policy.path) {
                let reason = if existing.algorithm != policy.algorithm {
                    format!("algorithm {} vs {}", existing.algorithm, policy.algorithm)
                } else if existing.key_alias != policy.key_alias {
                    format!("key `{}` vs `{}`", existing.key_alias, policy.key_alias)
                } else if existing.bson_type != policy.bson_type {
                    format!("type {} vs {}", existing.bson_type, policy.bson_type)
                } else {
                    continue;
                };
                return Err(Error::ConflictingPolicy { path: policy.path, reason });
            }

            if let Some(outer) = table.keys().find(|p| is_nested(p, &policy.path) || is_nested(&policy.path, p)) {
                return Err(Error::ConflictingPolicy {
                    path: policy.path.clone(),
                    reason: format!("overlaps encrypted field `{outer}`"),
                });
            }

            table.insert(policy.path.clone(), policy);
        }

        Ok(Self { policies: table })
    }

    /// Returns the policy for an exact dotted path.
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<&FieldPolicy> {
        self.policies.get(path)
    }

    /// Iterates policies in path order.
    pub fn iter(&self) -> impl Iterator<Item = &FieldPolicy> {
        self.policies.values()
    }

    /// Number of encrypted fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Whether no field is encrypted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

/// Whether `inner` is strictly below `outer` in the document tree.
fn is_nested(outer: &str, inner: &str) -> bool {
    inner.len() > outer.len() && inner.starts_with(outer) && inner.as_bytes()[outer.len()] == b'.'
}
