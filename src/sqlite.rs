//! SQLite data saver implementation.
//!
//! Features:
//! - WAL mode for concurrent readers
//! - Every primitive kind, stored as text next to its kind tag
//! - Genuinely async writes through `save_data_async`
//! - In-process read cache, loaded at open and updated after each commit
//!
//! The synchronous half of [`DataSaver`] bridges onto the runtime the saver
//! was opened on. Inside a runtime this needs the multi-thread flavor.

use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, info, warn};

use crate::config::SaverConfig;
use crate::error::{Result, SaverError};
use crate::store::{decode_text, parse_stored, validate_key, DataSaver};
use crate::value::{PrimitiveKind, PrimitiveValue};
use crate::watch::{ChangeEvent, ChangeSender};

/// SQLite implementation of DataSaver.
///
/// Change notifications are in-process only (not shared across processes).
pub struct SqliteDataSaver {
    pool: SqlitePool,
    handle: Handle,
    cache: RwLock<BTreeMap<String, PrimitiveValue>>,
    /// Held from commit until the cache and the change channel have caught up.
    write_lock: tokio::sync::Mutex<()>,
    watcher: Option<ChangeSender>,
}

impl SqliteDataSaver {
    /// Open or create a SQLite database at the given path.
    ///
    /// Must be called inside a tokio runtime; synchronous operations later
    /// run on that runtime.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening SQLite data saver at {:?}", path);

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::init(pool).await
    }

    /// Create an in-memory SQLite data saver (for testing).
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // A single connection that never expires; the database lives in it
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::init(pool).await
    }

    /// Open with change sensing taken from configuration.
    pub async fn with_config(path: impl AsRef<Path>, config: &SaverConfig) -> Result<Self> {
        let mut saver = Self::open(path).await?;
        if config.sense_external_change {
            saver.watcher = Some(ChangeSender::new(config.change_capacity));
        }
        Ok(saver)
    }

    /// Publish every save and remove on the change channel.
    pub fn sensing_external_changes(mut self) -> Self {
        self.watcher = Some(ChangeSender::default());
        self
    }

    async fn init(pool: SqlitePool) -> Result<Self> {
        let saver = Self {
            pool,
            handle: Handle::current(),
            cache: RwLock::new(BTreeMap::new()),
            write_lock: tokio::sync::Mutex::new(()),
            watcher: None,
        };
        saver.init_schema().await?;
        saver.reload().await?;
        Ok(saver)
    }

    /// Initialize the database schema.
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS data_saver (
                key TEXT PRIMARY KEY NOT NULL,
                kind TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        debug!("SQLite schema initialized");
        Ok(())
    }

    /// Replace the read cache with the current table contents.
    pub async fn reload(&self) -> Result<()> {
        let rows: Vec<(String, String, String)> =
            sqlx::query_as("SELECT key, kind, value FROM data_saver ORDER BY key")
                .fetch_all(&self.pool)
                .await?;

        let mut entries = BTreeMap::new();
        for (key, kind, text) in rows {
            match parse_kind(&kind).and_then(|kind| kind.parse(&text)) {
                Some(value) => {
                    entries.insert(key, value);
                }
                None => warn!("skipping undecodable row `{}` ({})", key, kind),
            }
        }
        debug!("loaded {} SQLite entries", entries.len());
        *self.cache.write() = entries;
        Ok(())
    }

    async fn write(&self, key: &str, value: PrimitiveValue) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO data_saver (key, kind, value, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                kind = excluded.kind,
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value.kind().to_string())
        .bind(value.to_text())
        .bind(now_unix())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!("sqlite save: {} -> {:?}", key, value);
        self.cache.write().insert(key.to_string(), value.clone());
        self.notify(ChangeEvent::saved(key, value));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM data_saver WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;

        if self.cache.write().remove(key).is_some() {
            debug!("sqlite remove: {}", key);
        }
        self.notify(ChangeEvent::removed(key));
        Ok(())
    }

    /// Drive a future to completion from synchronous code.
    fn block_on<F: Future>(&self, future: F) -> Result<F::Output> {
        match Handle::try_current() {
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::CurrentThread => Err(SaverError::Backend(
                "synchronous SQLite access needs a multi-thread runtime; use save_data_async".to_string(),
            )),
            Ok(_) => Ok(tokio::task::block_in_place(|| self.handle.block_on(future))),
            Err(_) => Ok(self.handle.block_on(future)),
        }
    }

    fn notify(&self, event: ChangeEvent) {
        if let Some(watcher) = &self.watcher {
            watcher.send(event);
        }
    }
}

fn parse_kind(name: &str) -> Option<PrimitiveKind> {
    PrimitiveKind::ALL.into_iter().find(|kind| kind.to_string() == name)
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[async_trait]
impl DataSaver for SqliteDataSaver {
    fn save_data(&self, key: &str, value: Option<PrimitiveValue>) -> Result<()> {
        validate_key(key)?;
        match value {
            Some(value) => self.block_on(self.write(key, value))?,
            None => self.block_on(self.delete(key))?,
        }
    }

    fn read_data(&self, key: &str, default: PrimitiveValue) -> Result<PrimitiveValue> {
        validate_key(key)?;

        match self.cache.read().get(key) {
            Some(stored) if stored.kind() == default.kind() => Ok(stored.clone()),
            Some(stored) => Ok(decode_text(key, &stored.to_text(), default)),
            None => Ok(default),
        }
    }

    fn read_stored(&self, key: &str, kind: PrimitiveKind) -> Result<Option<PrimitiveValue>> {
        validate_key(key)?;

        Ok(match self.cache.read().get(key) {
            Some(stored) if stored.kind() == kind => Some(stored.clone()),
            Some(stored) => parse_stored(key, &stored.to_text(), kind),
            None => None,
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.block_on(self.delete(key))?
    }

    fn contains(&self, key: &str) -> bool {
        self.cache.read().contains_key(key)
    }

    async fn save_data_async(&self, key: &str, value: Option<PrimitiveValue>) -> Result<()> {
        validate_key(key)?;
        match value {
            Some(value) => self.write(key, value).await,
            None => self.delete(key).await,
        }
    }

    fn change_sender(&self) -> Option<&ChangeSender> {
        self.watcher.as_ref()
    }
}
