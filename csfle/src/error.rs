//! Error types for `csfle` operations.

use std::fmt;

use crate::policy::Algorithm;
use crate::value::BsonType;

/// Main error type for `csfle` operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A key is already bound to this alias
    #[error("duplicate key alias: {0}")]
    DuplicateAlias(String),

    /// No key is bound to this alias
    #[error("unknown key alias: {0}")]
    UnknownAlias(String),

    /// The key vault has no record of this key id (revoked or foreign key)
    #[error("unknown key id: {0}")]
    UnknownKey(String),

    /// Two policies disagree about the same field path
    #[error("conflicting policies for field `{path}`: {reason}")]
    ConflictingPolicy {
        /// Dotted field path
        path: String,
        /// What the policies disagree on
        reason: String,
    },

    /// The value does not have the type declared by the field policy
    #[error("type mismatch at `{path}`: expected {expected}, found {found}")]
    TypeMismatch {
        /// Dotted field path (empty for explicit encryption)
        path: String,
        /// Declared type
        expected: BsonType,
        /// Actual type of the value
        found: BsonType,
    },

    /// The value is not a ciphertext produced by this library, or it failed authentication
    #[error("malformed ciphertext: {0}")]
    MalformedCiphertext(String),

    /// An external collaborator (key vault, document store, KMS transport) failed
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The value's type cannot be encrypted with this algorithm
    #[error("{algorithm} encryption is not supported for {ty}")]
    UnsupportedType {
        /// Type of the value
        ty: BsonType,
        /// Requested algorithm
        algorithm: Algorithm,
    },

    /// Equality queries are impossible on randomized fields
    #[error("cannot query on randomized field `{0}`")]
    UnqueryableField(String),

    /// The schema declaration is malformed or unsupported
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// The document store rejected a document
    #[error("document failed validation: {0}")]
    ValidationFailed(String),

    /// Client configuration is malformed
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Key management operation failed
    #[error("key management error: {0}")]
    Kms(#[from] KmsError),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::BackendUnavailable(format!("I/O error: {err}"))
    }
}

/// Errors specific to key management (master key) operations.
#[derive(Debug)]
pub enum KmsError {
    /// No provider is registered under this name
    ProviderNotConfigured(String),

    /// The master key belongs to a different provider
    ProviderMismatch {
        /// Provider asked to do the work
        provider: String,
        /// Provider named by the master key
        master_key: String,
    },

    /// Master key material is unusable
    InvalidMasterKey(String),

    /// DEK wrapping failed
    WrapFailed(String),

    /// DEK unwrapping failed
    UnwrapFailed(String),

    /// I/O operation failed
    Io(std::io::Error),
}

impl fmt::Display for KmsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProviderNotConfigured(name) => write!(f, "KMS provider not configured: {name}"),
            Self::ProviderMismatch { provider, master_key } => {
                write!(f, "provider `{provider}` cannot use a `{master_key}` master key")
            }
            Self::InvalidMasterKey(msg) => write!(f, "invalid master key: {msg}"),
            Self::WrapFailed(msg) => write!(f, "DEK wrap failed: {msg}"),
            Self::UnwrapFailed(msg) => write!(f, "DEK unwrap failed: {msg}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for KmsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for KmsError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_mismatch_display() {
        let err = Error::TypeMismatch {
            path: "ssn".to_string(),
            expected: BsonType::String,
            found: BsonType::Int,
        };
        assert_eq!(err.to_string(), "type mismatch at `ssn`: expected string, found int");
    }

    #[test]
    fn test_kms_error_converts() {
        let err: Error = KmsError::ProviderNotConfigured("aws".to_string()).into();
        assert!(matches!(err, Error::Kms(KmsError::ProviderNotConfigured(_))));
        assert_eq!(err.to_string(), "key management error: KMS provider not configured: aws");
    }
}
