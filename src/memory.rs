//! In-memory data saver implementation.
//!
//! Values are kept as `PrimitiveValue`s in a `BTreeMap`. This implementation
//! is NOT durable - data is lost on process exit. Use for testing, previews
//! and development only.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::SaverConfig;
use crate::error::Result;
use crate::store::{validate_key, DataSaver};
use crate::value::{PrimitiveKind, PrimitiveValue};
use crate::watch::{ChangeEvent, ChangeSender};

/// In-memory implementation of DataSaver.
///
/// Supports every primitive kind. Counts writes so tests can observe how
/// often state cells persisted.
pub struct MemoryDataSaver {
    data: Arc<RwLock<BTreeMap<String, PrimitiveValue>>>,
    watcher: Option<ChangeSender>,
    writes: AtomicUsize,
}

impl MemoryDataSaver {
    /// Create a new empty in-memory store without change sensing.
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
            watcher: None,
            writes: AtomicUsize::new(0),
        }
    }

    /// Create a store that publishes every save and remove on its change channel.
    pub fn sensing_external_changes() -> Self {
        Self {
            watcher: Some(ChangeSender::default()),
            ..Self::new()
        }
    }

    /// Create a store from configuration.
    pub fn with_config(config: &SaverConfig) -> Self {
        Self {
            watcher: config
                .sense_external_change
                .then(|| ChangeSender::new(config.change_capacity)),
            ..Self::new()
        }
    }

    /// Number of `save_data` calls that reached the map.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Get the number of entries in the store.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Raw stored value, without kind decoding.
    pub fn get_raw(&self, key: &str) -> Option<PrimitiveValue> {
        self.data.read().get(key).cloned()
    }

    /// Clear all entries.
    pub fn clear(&self) {
        self.data.write().clear();
    }

    fn notify(&self, event: ChangeEvent) {
        if let Some(watcher) = &self.watcher {
            watcher.send(event);
        }
    }
}

impl Default for MemoryDataSaver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataSaver for MemoryDataSaver {
    fn save_data(&self, key: &str, value: Option<PrimitiveValue>) -> Result<()> {
        validate_key(key)?;

        let Some(value) = value else {
            return self.remove(key);
        };

        debug!("memory save: {} -> {:?}", key, value);
        let mut data = self.data.write();
        data.insert(key.to_string(), value.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.notify(ChangeEvent::saved(key, value));
        Ok(())
    }

    fn read_data(&self, key: &str, default: PrimitiveValue) -> Result<PrimitiveValue> {
        validate_key(key)?;

        match self.data.read().get(key) {
            Some(stored) if stored.kind() == default.kind() => Ok(stored.clone()),
            Some(stored) => {
                warn!(
                    "stored {} for `{}` requested as {}, using default",
                    stored.kind(),
                    key,
                    default.kind()
                );
                Ok(default)
            }
            None => Ok(default),
        }
    }

    fn read_stored(&self, key: &str, kind: PrimitiveKind) -> Result<Option<PrimitiveValue>> {
        validate_key(key)?;

        Ok(self.data.read().get(key).filter(|stored| stored.kind() == kind).cloned())
    }

    fn remove(&self, key: &str) -> Result<()> {
        validate_key(key)?;

        // Publish under the lock so events arrive in write order
        let mut data = self.data.write();
        if data.remove(key).is_some() {
            debug!("memory remove: {}", key);
        }
        self.notify(ChangeEvent::removed(key));
        Ok(())
    }

    fn contains(&self, key: &str) -> bool {
        self.data.read().contains_key(key)
    }

    fn change_sender(&self) -> Option<&ChangeSender> {
        self.watcher.as_ref()
    }
}
