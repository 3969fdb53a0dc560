//! Error types for typed persistence operations.
//!
//! Covers the failure modes of adapters, converters and state cells:
//! unsupported primitive kinds, converter failures, malformed list
//! encodings and backend I/O. Malformed stored primitives (decode drift)
//! are deliberately not an error: adapters hand back the caller's default.

use thiserror::Error;

/// What an operation was trying to do when a type turned out to be unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Writing a value through an adapter.
    Save,
    /// Reading a value through an adapter.
    Read,
    /// Restoring a typed value from its stored form.
    Restore,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Save => f.write_str("save"),
            Action::Read => f.write_str("read"),
            Action::Restore => f.write_str("restore"),
        }
    }
}

/// Errors that can occur while saving, reading or converting state.
#[derive(Debug, Error)]
pub enum SaverError {
    /// The adapter cannot represent this kind and no converter resolved it.
    #[error("unable to {action} `{key}`: type {kind} is not supported, register a type converter for it")]
    TypeUnsupported {
        key: String,
        kind: String,
        action: Action,
    },

    /// A registered converter failed to serialize or deserialize a value.
    #[error("conversion failed for {type_name}: {reason}")]
    Conversion { type_name: String, reason: String },

    /// A stored list does not follow the `[a<sep>b]` encoding.
    #[error("malformed list encoding: {0}")]
    MalformedList(String),

    /// A serialized list element contains the list separator.
    #[error("list element `{element}` contains the separator `{separator}`")]
    SeparatorInElement { separator: String, element: String },

    /// Invalid key format.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The backing store failed in a way not covered by a more specific variant.
    #[error("backend error: {0}")]
    Backend(String),

    /// A background save was cancelled before it finished.
    #[error("save cancelled")]
    Cancelled,

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A stored value could not be decrypted.
    #[error("cannot decrypt `{key}`: wrong passphrase or corrupted data")]
    Decryption { key: String },

    /// Configuration could not be parsed.
    #[error("config error: {0}")]
    Config(String),

    /// Database error from SQLx.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for persistence operations.
pub type Result<T> = std::result::Result<T, SaverError>;

impl SaverError {
    pub(crate) fn unsupported(key: &str, kind: impl Into<String>, action: Action) -> Self {
        SaverError::TypeUnsupported {
            key: key.to_string(),
            kind: kind.into(),
            action,
        }
    }

    pub(crate) fn decryption(key: &str) -> Self {
        SaverError::Decryption { key: key.to_string() }
    }

    pub(crate) fn conversion(type_name: &str, reason: impl std::fmt::Display) -> Self {
        SaverError::Conversion {
            type_name: type_name.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Returns true if a UI can keep going after this error without losing state.
    ///
    /// Cancelled saves are superseded by a newer save, and conversion failures
    /// leave the in-memory value untouched.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SaverError::Cancelled | SaverError::Conversion { .. } | SaverError::MalformedList(_)
        )
    }
}

impl From<serde_json::Error> for SaverError {
    fn from(err: serde_json::Error) -> Self {
        SaverError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for SaverError {
    fn from(err: toml::de::Error) -> Self {
        SaverError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_display() {
        let err = SaverError::unsupported("/settings/theme", "Bytes", Action::Save);
        let msg = err.to_string();
        assert!(msg.contains("unable to save"));
        assert!(msg.contains("/settings/theme"));
        assert!(msg.contains("Bytes"));
    }

    #[test]
    fn test_decryption_display() {
        let msg = SaverError::decryption("token").to_string();
        assert!(msg.contains("`token`"));
        assert!(msg.contains("wrong passphrase"));
        assert!(!SaverError::decryption("token").is_recoverable());
    }

    #[test]
    fn test_conversion_display() {
        let err = SaverError::conversion("Theme", "unknown variant");
        assert!(err.to_string().contains("Theme"));
        assert!(err.to_string().contains("unknown variant"));
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(SaverError::Cancelled.is_recoverable());
        assert!(SaverError::conversion("T", "bad").is_recoverable());
        assert!(SaverError::MalformedList("x".to_string()).is_recoverable());
        assert!(!SaverError::Backend("disk full".to_string()).is_recoverable());
        assert!(!SaverError::unsupported("k", "Bytes", Action::Read).is_recoverable());
    }
}
