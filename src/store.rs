//! DataSaver trait - the primitive store contract every backend implements.
//!
//! Backends persist [`PrimitiveValue`]s by key. They differ in which kinds
//! they support; an unsupported kind is a typed error, never a silent
//! coercion. Reads are lenient: a stored value that does not decode as the
//! requested kind yields the caller's default.

use async_trait::async_trait;
use tracing::warn;

use crate::error::{Action, Result, SaverError};
use crate::value::{PrimitiveKind, PrimitiveValue};
use crate::watch::{ChangeSender, ChangeStream};

/// Maximum key length in bytes.
pub const MAX_KEY_LENGTH: usize = 1024;

/// Validate that a key is well-formed.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(SaverError::InvalidKey("key cannot be empty".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(SaverError::InvalidKey(format!(
            "key exceeds maximum length of {} bytes",
            MAX_KEY_LENGTH
        )));
    }
    Ok(())
}

/// Decode a text-stored value as the kind of `default`.
///
/// Text backends share this: drift is logged and answered with the default.
pub(crate) fn decode_text(key: &str, text: &str, default: PrimitiveValue) -> PrimitiveValue {
    match default.kind().parse(text) {
        Some(value) => value,
        None => {
            warn!(
                "stored value for `{}` does not decode as {}, using default",
                key,
                default.kind()
            );
            default
        }
    }
}

/// Decode a text-stored value as `kind`, or `None` on drift.
pub(crate) fn parse_stored(key: &str, text: &str, kind: PrimitiveKind) -> Option<PrimitiveValue> {
    let parsed = kind.parse(text);
    if parsed.is_none() {
        warn!("stored value for `{}` does not decode as {}", key, kind);
    }
    parsed
}

/// The primitive store contract.
///
/// All backends (in-memory, file, SQLite) implement this trait. State cells
/// depend on `Arc<dyn DataSaver>`, not on specific implementations.
///
/// Each `save_data` call is atomic for its key as seen through the same
/// instance. Nothing is atomic across keys.
#[async_trait]
pub trait DataSaver: Send + Sync {
    /// Write a value. Writing `None` is equivalent to [`DataSaver::remove`].
    fn save_data(&self, key: &str, value: Option<PrimitiveValue>) -> Result<()>;

    /// Read a value as the kind of `default`.
    ///
    /// Returns `default` if the key is absent or the stored form does not
    /// decode as that kind.
    fn read_data(&self, key: &str, default: PrimitiveValue) -> Result<PrimitiveValue>;

    /// Read the stored value only if it is present and decodes as `kind`.
    ///
    /// Unlike [`DataSaver::read_data`] this tells absence and drift apart
    /// from a stored value that happens to equal a default. The fallback
    /// cannot see drift; every bundled backend overrides it.
    fn read_stored(&self, key: &str, kind: PrimitiveKind) -> Result<Option<PrimitiveValue>> {
        if !self.contains(key) {
            return Ok(None);
        }
        self.read_data(key, kind.zero()).map(Some)
    }

    /// Remove a key. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<()>;

    /// Check if a key exists.
    fn contains(&self, key: &str) -> bool;

    /// Write without blocking the caller.
    ///
    /// Defaults to the synchronous path; backends with real async I/O override it.
    async fn save_data_async(&self, key: &str, value: Option<PrimitiveValue>) -> Result<()> {
        self.save_data(key, value)
    }

    /// Whether this backend can natively store the given kind.
    fn supports(&self, _kind: PrimitiveKind) -> bool {
        true
    }

    /// The external change channel, present when change sensing is enabled.
    fn change_sender(&self) -> Option<&ChangeSender> {
        None
    }

    /// Watch for changes to a key, or a prefix when the pattern ends in `*`.
    ///
    /// Returns `None` when the backend was not built with change sensing.
    fn watch(&self, pattern: &str) -> Option<ChangeStream> {
        self.change_sender().map(|sender| sender.subscribe(pattern))
    }

    /// Fail with `TypeUnsupported` if the kind cannot be stored here.
    fn ensure_supported(&self, key: &str, kind: PrimitiveKind, action: Action) -> Result<()> {
        if self.supports(kind) {
            Ok(())
        } else {
            Err(SaverError::unsupported(key, kind.to_string(), action))
        }
    }
}
