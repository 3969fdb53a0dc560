//! Save policies and the machinery shared by typed and list state cells.
//!
//! A cell is bound to one key of one adapter. It loads the persisted value
//! exactly once at construction, keeps the current value in memory, writes
//! through the adapter according to its [`SavePolicy`], and optionally
//! reconciles changes other writers publish on the adapter's change channel.

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::task::AbortHandle;
use tokio_stream::StreamExt;
use tracing::{debug, error, warn};

use crate::config::{SaverConfig, DEFAULT_LIST_SEPARATOR};
use crate::converter::{ConverterRegistry, TypeConverter};
use crate::error::{Result, SaverError};
use crate::scope::{SaveHandle, SaveScope};
use crate::store::{validate_key, DataSaver};
use crate::value::PrimitiveValue;
use crate::watch::ChangeEvent;

/// When a cell persists its value.
///
/// Fixed at construction. Build a new cell to change it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SavePolicy {
    /// Persist on every change of value.
    #[default]
    Immediate,
    /// Persist once, at dispose time, if the value differs from the one loaded at construction.
    OnDispose,
    /// Never persist automatically; call `save` explicitly.
    Manual,
}

/// Construction options shared by both cell kinds.
#[derive(Debug, Clone)]
pub struct CellOptions {
    pub save_policy: SavePolicy,
    /// Run writes as cancellable background tasks instead of blocking `set`.
    pub save_async: bool,
    /// Follow writes other cells or processes make to the same key.
    pub sense_external_change: bool,
    /// Per-cell converter, consulted before the registry.
    pub converter: Option<Arc<dyn TypeConverter>>,
    /// Registry to resolve converters from; the global one when unset.
    pub registry: Option<Arc<ConverterRegistry>>,
    /// Where background work runs; resolved lazily when unset.
    pub scope: Option<SaveScope>,
    /// Separator for the list encoding.
    pub list_separator: String,
}

impl Default for CellOptions {
    fn default() -> Self {
        Self {
            save_policy: SavePolicy::Immediate,
            save_async: false,
            sense_external_change: false,
            converter: None,
            registry: None,
            scope: None,
            list_separator: DEFAULT_LIST_SEPARATOR.to_string(),
        }
    }
}

impl CellOptions {
    /// Options with the list separator taken from configuration.
    pub fn from_config(config: &SaverConfig) -> Self {
        Self {
            list_separator: config.list_separator.clone(),
            ..Self::default()
        }
    }

    /// Set when the cell persists.
    pub fn with_save_policy(mut self, policy: SavePolicy) -> Self {
        self.save_policy = policy;
        self
    }

    /// Run writes as cancellable background tasks.
    pub fn with_async(mut self, save_async: bool) -> Self {
        self.save_async = save_async;
        self
    }

    /// Follow writes made to the same key through other cells.
    ///
    /// Only effective when the adapter has a change channel.
    pub fn sensing_external_change(mut self, sense: bool) -> Self {
        self.sense_external_change = sense;
        self
    }

    /// Use `converter` before anything in the registry.
    pub fn with_converter(mut self, converter: Arc<dyn TypeConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    /// Resolve converters from `registry` instead of the global one.
    pub fn with_registry(mut self, registry: Arc<ConverterRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Run background work on `scope`.
    pub fn with_scope(mut self, scope: SaveScope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Separate list elements with `separator`.
    pub fn with_list_separator(mut self, separator: impl Into<String>) -> Self {
        self.list_separator = separator.into();
        self
    }

    pub(crate) fn registry(&self) -> Arc<ConverterRegistry> {
        self.registry.clone().unwrap_or_else(ConverterRegistry::global)
    }
}

/// How a cell maps its value onto the adapter's primitives.
pub(crate) trait Codec<V>: Send + Sync + 'static {
    /// Read-through load at construction.
    fn load(&self, adapter: &dyn DataSaver, key: &str, initial: &V) -> Result<V>;

    /// The primitive to write; `None` writes null.
    fn encode(&self, key: &str, value: &V) -> Result<Option<PrimitiveValue>>;

    /// Decode a value observed on the change channel.
    fn decode_change(&self, key: &str, value: Option<PrimitiveValue>, initial: &V) -> Result<V>;
}

struct Inner<V, C> {
    adapter: Arc<dyn DataSaver>,
    key: String,
    initial: V,
    loaded: V,
    value: RwLock<V>,
    codec: C,
    policy: SavePolicy,
    save_async: bool,
    scope: OnceLock<SaveScope>,
    /// Observer handle of the latest background save, until taken.
    pending: Mutex<Option<SaveHandle>>,
    /// Cancel switch of the latest background save. Never handed out.
    in_flight: Mutex<Option<AbortHandle>>,
    generation: Arc<AtomicU64>,
    write_gate: Arc<tokio::sync::Mutex<()>>,
    watcher: Mutex<Option<AbortHandle>>,
    /// Value to adopt when the echo of our own removal arrives.
    removal_echo: Mutex<Option<V>>,
}

impl<V, C> Inner<V, C>
where
    V: Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
    C: Codec<V>,
{
    fn scope(&self) -> Result<SaveScope> {
        if let Some(scope) = self.scope.get() {
            return Ok(scope.clone());
        }
        let scope = SaveScope::ambient()?;
        Ok(self.scope.get_or_init(|| scope).clone())
    }

    fn write(&self, encoded: Option<PrimitiveValue>) -> Result<()> {
        if !self.save_async {
            debug!("save(async: false): {} -> {:?}", self.key, encoded);
            return self.adapter.save_data(&self.key, encoded);
        }

        let scope = self.scope()?;
        let adapter = self.adapter.clone();
        let key = self.key.clone();
        let gate = self.write_gate.clone();
        let latest = self.generation.clone();

        let mut in_flight = self.in_flight.lock();
        let generation = self.supersede(&mut in_flight);
        let task = scope.spawn(async move {
            let _permit = gate.lock().await;
            // An abort can land too late; a superseded save must still not write
            if latest.load(Ordering::SeqCst) != generation {
                return Err(SaverError::Cancelled);
            }
            debug!("save(async: true): {} -> {:?}", key, encoded);
            adapter.save_data_async(&key, encoded).await
        });
        *in_flight = Some(task.abort_handle());
        *self.pending.lock() = Some(SaveHandle::new(task));
        Ok(())
    }

    /// Cancel the in-flight save and start a new generation.
    fn supersede(&self, in_flight: &mut Option<AbortHandle>) -> u64 {
        if let Some(previous) = in_flight.take() {
            previous.abort();
        }
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn apply_change(&self, event: ChangeEvent) {
        let decoded = match event.value {
            None => match self.removal_echo.lock().take() {
                Some(replacement) => Ok(replacement),
                None => self.codec.decode_change(&self.key, None, &self.initial),
            },
            value => self.codec.decode_change(&self.key, value, &self.initial),
        };
        match decoded {
            Ok(incoming) => {
                let mut current = self.value.write();
                if *current != incoming {
                    debug!("external change: {} -> {:?}", self.key, incoming);
                    *current = incoming;
                }
            }
            Err(err) => {
                error!("cannot apply external change for `{}`: {}", self.key, err);
            }
        }
    }
}

impl<V, C> Drop for Inner<V, C> {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.get_mut().take() {
            watcher.abort();
        }
    }
}

/// A live, key-bound value. Wrapped by the public cell types.
pub(crate) struct Cell<V, C> {
    inner: Arc<Inner<V, C>>,
}

impl<V, C> Cell<V, C>
where
    V: Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
    C: Codec<V>,
{
    pub(crate) fn new(
        adapter: Arc<dyn DataSaver>,
        key: String,
        initial: V,
        codec: C,
        options: &CellOptions,
    ) -> Result<Self> {
        validate_key(&key)?;

        let loaded = codec.load(adapter.as_ref(), &key, &initial)?;
        debug!("loaded {} -> {:?}", key, loaded);

        let scope = OnceLock::new();
        if let Some(injected) = &options.scope {
            let _ = scope.set(injected.clone());
        }

        let cell = Self {
            inner: Arc::new(Inner {
                adapter,
                key,
                initial,
                value: RwLock::new(loaded.clone()),
                loaded,
                codec,
                policy: options.save_policy,
                save_async: options.save_async,
                scope,
                pending: Mutex::new(None),
                in_flight: Mutex::new(None),
                generation: Arc::new(AtomicU64::new(0)),
                write_gate: Arc::new(tokio::sync::Mutex::new(())),
                watcher: Mutex::new(None),
                removal_echo: Mutex::new(None),
            }),
        };

        if options.sense_external_change {
            cell.watch_external_changes()?;
        }
        Ok(cell)
    }

    fn watch_external_changes(&self) -> Result<()> {
        let Some(mut changes) = self.inner.adapter.watch(&self.inner.key) else {
            warn!(
                "cell `{}` asked to sense external changes, but its adapter has no change channel",
                self.inner.key
            );
            return Ok(());
        };

        let scope = self.inner.scope()?;
        let weak: Weak<Inner<V, C>> = Arc::downgrade(&self.inner);
        let task = scope.spawn(async move {
            while let Some(event) = changes.next().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.apply_change(event);
            }
        });
        *self.inner.watcher.lock() = Some(task.abort_handle());
        Ok(())
    }

    pub(crate) fn key(&self) -> &str {
        &self.inner.key
    }

    pub(crate) fn save_policy(&self) -> SavePolicy {
        self.inner.policy
    }

    pub(crate) fn get(&self) -> V {
        self.inner.value.read().clone()
    }

    pub(crate) fn set(&self, value: V) -> Result<()> {
        let changed = {
            let mut current = self.inner.value.write();
            let changed = *current != value;
            *current = value;
            changed
        };
        if changed && self.inner.policy == SavePolicy::Immediate {
            self.save()
        } else {
            Ok(())
        }
    }

    pub(crate) fn set_without_save(&self, value: V) {
        *self.inner.value.write() = value;
    }

    pub(crate) fn save(&self) -> Result<()> {
        let value = self.get();
        let encoded = self.inner.codec.encode(&self.inner.key, &value)?;
        self.inner.write(encoded)
    }

    pub(crate) fn remove_with(&self, replacement: V) -> Result<()> {
        {
            let mut in_flight = self.inner.in_flight.lock();
            self.inner.supersede(&mut in_flight);
        }

        // Our own Removed echo resolves to the replacement, not the initial value
        let sensing = self.inner.watcher.lock().is_some();
        if sensing {
            *self.inner.removal_echo.lock() = Some(replacement.clone());
        }
        if let Err(err) = self.inner.adapter.remove(&self.inner.key) {
            self.inner.removal_echo.lock().take();
            return Err(err);
        }
        debug!("remove: {}, value replaced with {:?}", self.inner.key, replacement);
        *self.inner.value.write() = replacement;
        Ok(())
    }

    pub(crate) fn initial(&self) -> &V {
        &self.inner.initial
    }

    pub(crate) fn value_changed_since_init(&self) -> bool {
        *self.inner.value.read() != self.inner.loaded
    }

    pub(crate) fn take_pending_save(&self) -> Option<SaveHandle> {
        self.inner.pending.lock().take()
    }

    pub(crate) fn is_saving(&self) -> bool {
        self.inner
            .in_flight
            .lock()
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }

    pub(crate) fn dispose(self) -> Result<Option<SaveHandle>> {
        debug!("dispose: {}", self.inner.key);
        if let Some(watcher) = self.inner.watcher.lock().take() {
            watcher.abort();
        }
        if self.inner.policy == SavePolicy::OnDispose && self.value_changed_since_init() {
            self.save()?;
        }
        Ok(self.take_pending_save())
    }
}
