//! File-backed data saver.
//!
//! Stores every value as text in one JSON object on disk. The file is
//! rewritten atomically (temp file, then rename) on every save and remove.
//! With file monitoring enabled, reads notice writes made by other instances
//! through the file's modification time and length.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

use crate::config::SaverConfig;
use crate::error::{Action, Result};
use crate::store::{decode_text, parse_stored, validate_key, DataSaver};
use crate::value::{PrimitiveKind, PrimitiveValue};
use crate::watch::{ChangeEvent, ChangeSender};

#[derive(Default)]
struct Snapshot {
    entries: BTreeMap<String, String>,
    stamp: Option<Stamp>,
}

/// Modification time and length of the file when it was last read or written.
type Stamp = (SystemTime, u64);

fn stamp(path: &Path) -> Option<Stamp> {
    let metadata = fs::metadata(path).ok()?;
    Some((metadata.modified().ok()?, metadata.len()))
}

/// DataSaver over a plain-text file.
///
/// Supports the scalar kinds; `Bytes` and `Structured` are rejected with
/// `TypeUnsupported`.
pub struct FileDataSaver {
    path: PathBuf,
    snapshot: RwLock<Snapshot>,
    write_lock: Mutex<()>,
    monitor: bool,
    watcher: Option<ChangeSender>,
}

impl FileDataSaver {
    /// Open or create the file at `path`, creating parent directories as needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        if !path.exists() {
            fs::write(&path, "{}")?;
        }

        let saver = Self {
            path,
            snapshot: RwLock::new(Snapshot::default()),
            write_lock: Mutex::new(()),
            monitor: false,
            watcher: None,
        };
        saver.reload()?;
        info!(
            "opened file data saver at {} ({} entries)",
            saver.path.display(),
            saver.snapshot.read().entries.len()
        );
        Ok(saver)
    }

    /// Open with change sensing taken from configuration.
    pub fn with_config(path: impl AsRef<Path>, config: &SaverConfig) -> Result<Self> {
        let mut saver = Self::open(path)?;
        if config.sense_external_change {
            saver.watcher = Some(ChangeSender::new(config.change_capacity));
        }
        Ok(saver)
    }

    /// Reload the file before reads when another writer changed it.
    pub fn with_file_monitoring(mut self, monitor: bool) -> Self {
        self.monitor = monitor;
        self
    }

    /// Publish every save and remove on the change channel.
    pub fn sensing_external_changes(mut self) -> Self {
        self.watcher = Some(ChangeSender::default());
        self
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the whole file.
    pub fn reload(&self) -> Result<()> {
        let text = fs::read_to_string(&self.path)?;
        let stamp = stamp(&self.path);
        let entries: BTreeMap<String, String> = if text.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str(&text)?
        };
        *self.snapshot.write() = Snapshot { entries, stamp };
        Ok(())
    }

    fn refresh_if_modified(&self) {
        if !self.monitor {
            return;
        }
        let current = stamp(&self.path);
        if current.is_some() && current != self.snapshot.read().stamp {
            debug!("{} changed on disk, reloading", self.path.display());
            if let Err(err) = self.reload() {
                warn!("failed to reload {}: {}", self.path.display(), err);
            }
        }
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<Option<Stamp>> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, serde_json::to_string_pretty(entries)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(stamp(&self.path))
    }

    /// Apply `edit` to a copy of the entries, write it out, then publish `event`.
    ///
    /// The event is sent before the write lock is released, so subscribers
    /// see changes in the order they reached the file.
    fn update<F>(&self, edit: F, event: ChangeEvent) -> Result<bool>
    where
        F: FnOnce(&mut BTreeMap<String, String>) -> bool,
    {
        let _guard = self.write_lock.lock();
        self.refresh_if_modified();

        let mut entries = self.snapshot.read().entries.clone();
        let changed = edit(&mut entries);
        if changed {
            let stamp = self.persist(&entries)?;
            *self.snapshot.write() = Snapshot { entries, stamp };
        }
        self.notify(event);
        Ok(changed)
    }

    /// Write the stored text of `key` and publish `event`.
    pub(crate) fn store_text(&self, key: &str, text: String, event: ChangeEvent) -> Result<()> {
        self.update(
            |entries| {
                entries.insert(key.to_string(), text);
                true
            },
            event,
        )
        .map(|_| ())
    }

    /// Stored text of `key`, after picking up external edits if monitored.
    pub(crate) fn stored_text(&self, key: &str) -> Option<String> {
        self.refresh_if_modified();
        self.snapshot.read().entries.get(key).cloned()
    }

    /// Drop `key` and publish its removal. Returns whether it was present.
    pub(crate) fn delete_text(&self, key: &str) -> Result<bool> {
        self.update(|entries| entries.remove(key).is_some(), ChangeEvent::removed(key))
    }

    fn notify(&self, event: ChangeEvent) {
        if let Some(watcher) = &self.watcher {
            watcher.send(event);
        }
    }
}

#[async_trait]
impl DataSaver for FileDataSaver {
    fn save_data(&self, key: &str, value: Option<PrimitiveValue>) -> Result<()> {
        validate_key(key)?;

        let Some(value) = value else {
            return self.remove(key);
        };
        self.ensure_supported(key, value.kind(), Action::Save)?;

        let text = value.to_text();
        debug!("file save: {} -> {}", key, text);
        self.store_text(key, text, ChangeEvent::saved(key, value))
    }

    fn read_data(&self, key: &str, default: PrimitiveValue) -> Result<PrimitiveValue> {
        validate_key(key)?;
        self.ensure_supported(key, default.kind(), Action::Read)?;

        match self.stored_text(key) {
            Some(text) => Ok(decode_text(key, &text, default)),
            None => Ok(default),
        }
    }

    fn read_stored(&self, key: &str, kind: PrimitiveKind) -> Result<Option<PrimitiveValue>> {
        validate_key(key)?;
        self.ensure_supported(key, kind, Action::Read)?;

        Ok(self.stored_text(key).and_then(|text| parse_stored(key, &text, kind)))
    }

    fn remove(&self, key: &str) -> Result<()> {
        validate_key(key)?;

        if self.delete_text(key)? {
            debug!("file remove: {}", key);
        }
        Ok(())
    }

    fn contains(&self, key: &str) -> bool {
        self.refresh_if_modified();
        self.snapshot.read().entries.contains_key(key)
    }

    fn supports(&self, kind: PrimitiveKind) -> bool {
        !matches!(kind, PrimitiveKind::Bytes | PrimitiveKind::Structured)
    }

    fn change_sender(&self) -> Option<&ChangeSender> {
        self.watcher.as_ref()
    }
}
