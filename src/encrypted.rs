//! Encrypted file-backed data saver.
//!
//! Same file layout, atomic writes and monitoring as [`FileDataSaver`], but
//! every stored value is sealed with AES-256-GCM. The cipher key is the
//! SHA-256 digest of a caller-supplied passphrase. Each value gets a fresh
//! random nonce and is bound to its key, so entries cannot be swapped between
//! keys unnoticed. Keys themselves stay readable.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{debug, warn};

use crate::config::SaverConfig;
use crate::error::{Action, Result, SaverError};
use crate::file::FileDataSaver;
use crate::store::{decode_text, parse_stored, validate_key, DataSaver};
use crate::value::{PrimitiveKind, PrimitiveValue};
use crate::watch::{ChangeEvent, ChangeSender};

const NONCE_LEN: usize = 12;

struct ValueCipher {
    cipher: Aes256Gcm,
}

impl ValueCipher {
    fn new(passphrase: &str) -> Self {
        Self {
            cipher: Aes256Gcm::new(&Sha256::digest(passphrase.as_bytes())),
        }
    }

    /// Hex of `nonce || ciphertext`.
    fn seal(&self, key: &str, plain: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plain.as_bytes(),
                    aad: key.as_bytes(),
                },
            )
            .map_err(|_| SaverError::Backend(format!("cannot encrypt `{}`", key)))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(hex::encode(out))
    }

    fn open(&self, key: &str, sealed: &str) -> Result<String> {
        let bytes = hex::decode(sealed).map_err(|_| SaverError::decryption(key))?;
        if bytes.len() < NONCE_LEN {
            return Err(SaverError::decryption(key));
        }
        let (nonce, body) = bytes.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: body,
                    aad: key.as_bytes(),
                },
            )
            .map_err(|_| SaverError::decryption(key))?;
        String::from_utf8(plain).map_err(|_| SaverError::decryption(key))
    }
}

/// DataSaver over a file whose values are encrypted at rest.
///
/// By default a value that fails to decrypt reads as absent, with a warning.
/// With [`EncryptedFileDataSaver::with_integrity_check`] it is an error
/// instead, which surfaces a wrong passphrase early.
pub struct EncryptedFileDataSaver {
    file: FileDataSaver,
    cipher: ValueCipher,
    integrity_check: bool,
}

impl EncryptedFileDataSaver {
    /// Open or create the file at `path`, sealing values with `passphrase`.
    pub fn open(path: impl AsRef<Path>, passphrase: &str) -> Result<Self> {
        Ok(Self {
            file: FileDataSaver::open(path)?,
            cipher: ValueCipher::new(passphrase),
            integrity_check: false,
        })
    }

    /// Open with change sensing taken from configuration.
    pub fn with_config(path: impl AsRef<Path>, passphrase: &str, config: &SaverConfig) -> Result<Self> {
        Ok(Self {
            file: FileDataSaver::with_config(path, config)?,
            cipher: ValueCipher::new(passphrase),
            integrity_check: false,
        })
    }

    /// Fail reads with [`SaverError::Decryption`] instead of falling back to the default.
    pub fn with_integrity_check(mut self, enabled: bool) -> Self {
        self.integrity_check = enabled;
        self
    }

    /// Reload the file before reads when another writer changed it.
    pub fn with_file_monitoring(self, monitor: bool) -> Self {
        Self {
            file: self.file.with_file_monitoring(monitor),
            ..self
        }
    }

    /// Publish every save and remove on the change channel.
    pub fn sensing_external_changes(self) -> Self {
        Self {
            file: self.file.sensing_external_changes(),
            ..self
        }
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Re-read the whole file.
    pub fn reload(&self) -> Result<()> {
        self.file.reload()
    }

    fn decrypted(&self, key: &str) -> Result<Option<String>> {
        let Some(sealed) = self.file.stored_text(key) else {
            return Ok(None);
        };
        match self.cipher.open(key, &sealed) {
            Ok(plain) => Ok(Some(plain)),
            Err(err) if self.integrity_check => Err(err),
            Err(err) => {
                warn!("{}, treating it as absent", err);
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl DataSaver for EncryptedFileDataSaver {
    fn save_data(&self, key: &str, value: Option<PrimitiveValue>) -> Result<()> {
        validate_key(key)?;

        let Some(value) = value else {
            return self.remove(key);
        };
        self.ensure_supported(key, value.kind(), Action::Save)?;

        let sealed = self.cipher.seal(key, &value.to_text())?;
        debug!("encrypted save: {}", key);
        self.file.store_text(key, sealed, ChangeEvent::saved(key, value))
    }

    fn read_data(&self, key: &str, default: PrimitiveValue) -> Result<PrimitiveValue> {
        validate_key(key)?;
        self.ensure_supported(key, default.kind(), Action::Read)?;

        match self.decrypted(key)? {
            Some(plain) => Ok(decode_text(key, &plain, default)),
            None => Ok(default),
        }
    }

    fn read_stored(&self, key: &str, kind: PrimitiveKind) -> Result<Option<PrimitiveValue>> {
        validate_key(key)?;
        self.ensure_supported(key, kind, Action::Read)?;

        Ok(self.decrypted(key)?.and_then(|plain| parse_stored(key, &plain, kind)))
    }

    fn remove(&self, key: &str) -> Result<()> {
        validate_key(key)?;

        if self.file.delete_text(key)? {
            debug!("encrypted remove: {}", key);
        }
        Ok(())
    }

    fn contains(&self, key: &str) -> bool {
        self.file.contains(key)
    }

    fn supports(&self, kind: PrimitiveKind) -> bool {
        self.file.supports(kind)
    }

    fn change_sender(&self) -> Option<&ChangeSender> {
        self.file.change_sender()
    }
}
