//! Typed state cells.
//!
//! [`DataSaverState`] binds one value of type `T` to a key. Native primitives
//! are written as themselves; other types are serialized to a string by the
//! cell's own converter or the registry, and restored the same way.

use std::any::type_name;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cell::{Cell, CellOptions, Codec, SavePolicy};
use crate::converter::{as_any, ConverterRegistry, TypeConverter};
use crate::error::{Action, Result, SaverError};
use crate::scope::SaveHandle;
use crate::store::DataSaver;
use crate::value::{PrimitiveKind, PrimitiveValue, StateValue};

/// Maps a single `T` onto primitives: per-cell converter, then registry, then native.
pub(crate) struct ScalarCodec<T> {
    registry: Arc<ConverterRegistry>,
    converter: Option<Arc<dyn TypeConverter>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: StateValue> ScalarCodec<T> {
    pub(crate) fn new(options: &CellOptions) -> Self {
        Self {
            registry: options.registry(),
            converter: options.converter.clone(),
            _marker: PhantomData,
        }
    }

    fn find_saver<'a>(&self, value: &'a T) -> Option<(Arc<dyn TypeConverter>, &'a dyn std::any::Any)> {
        // A nullable value is tried as a whole first, then by its payload
        for candidate in [Some(as_any(value)), value.inner_any()].into_iter().flatten() {
            if let Some(converter) = self.converter.as_ref().filter(|c| c.accepts(candidate)) {
                return Some((converter.clone(), candidate));
            }
            if let Some(converter) = self.registry.find_saver(candidate) {
                return Some((converter, candidate));
            }
        }
        None
    }

    fn find_restorer(&self) -> Option<Arc<dyn TypeConverter>> {
        T::restore_type_ids().into_iter().find_map(|type_id| {
            self.converter
                .clone()
                .filter(|c| c.restores(type_id))
                .or_else(|| self.registry.find_restorer(type_id))
        })
    }

    fn restore_with(&self, restorer: &dyn TypeConverter, raw: &str) -> Result<T> {
        let restored = restorer.restore(raw)?;
        T::from_restored(restored).ok_or_else(|| {
            SaverError::conversion(type_name::<T>(), "converter produced a value of another type")
        })
    }

    /// Text form of one value, for list encoding.
    pub(crate) fn to_text(&self, key: &str, value: &T) -> Result<String> {
        if let Some((converter, candidate)) = self.find_saver(value) {
            return converter.save(candidate);
        }
        if value.is_null() {
            return Err(SaverError::conversion(type_name::<T>(), "null list elements cannot be saved"));
        }
        value
            .to_primitive()
            .map(|primitive| primitive.to_text())
            .ok_or_else(|| SaverError::unsupported(key, type_name::<T>(), Action::Save))
    }

    /// Parse one value from its text form, for list decoding.
    pub(crate) fn from_text(&self, key: &str, text: &str) -> Result<T> {
        if let Some(restorer) = self.find_restorer() {
            return self.restore_with(restorer.as_ref(), text);
        }
        let kind = T::primitive_kind()
            .ok_or_else(|| SaverError::unsupported(key, type_name::<T>(), Action::Restore))?;
        kind.parse(text)
            .and_then(T::from_primitive)
            .ok_or_else(|| SaverError::conversion(type_name::<T>(), format!("`{}` is not a valid {}", text, kind)))
    }
}

impl<T: StateValue> Codec<T> for ScalarCodec<T> {
    fn load(&self, adapter: &dyn DataSaver, key: &str, initial: &T) -> Result<T> {
        if !adapter.contains(key) {
            return Ok(initial.clone());
        }

        // A stored value of another kind is drift, never a zero-ish value
        if let Some(restorer) = self.find_restorer() {
            let Some(raw) = adapter.read_stored(key, PrimitiveKind::Str)? else {
                warn!("`{}` does not hold text, using initial value", key);
                return Ok(initial.clone());
            };
            return match self.restore_with(restorer.as_ref(), &raw.to_text()) {
                Ok(value) => Ok(value),
                Err(err) => {
                    warn!("error while restoring `{}`, using initial value: {}", key, err);
                    Ok(initial.clone())
                }
            };
        }

        let kind = T::primitive_kind()
            .ok_or_else(|| SaverError::unsupported(key, type_name::<T>(), Action::Restore))?;
        Ok(adapter
            .read_stored(key, kind)?
            .and_then(T::from_primitive)
            .unwrap_or_else(|| initial.clone()))
    }

    fn encode(&self, key: &str, value: &T) -> Result<Option<PrimitiveValue>> {
        if let Some((converter, candidate)) = self.find_saver(value) {
            let converted = converter.save(candidate)?;
            debug!("converted {} -> {:?} (as {})", key, value, converted);
            return Ok(Some(PrimitiveValue::Str(converted)));
        }
        if value.is_null() {
            return Ok(None);
        }
        value
            .to_primitive()
            .map(Some)
            .ok_or_else(|| SaverError::unsupported(key, type_name::<T>(), Action::Save))
    }

    fn decode_change(&self, key: &str, value: Option<PrimitiveValue>, initial: &T) -> Result<T> {
        let Some(value) = value else {
            return Ok(T::null().unwrap_or_else(|| initial.clone()));
        };
        if let PrimitiveValue::Str(raw) = &value {
            if let Some(restorer) = self.find_restorer() {
                return self.restore_with(restorer.as_ref(), raw);
            }
        }
        let kind = value.kind();
        T::from_primitive(value)
            .ok_or_else(|| SaverError::unsupported(key, kind.to_string(), Action::Restore))
    }
}

/// A persisted value of type `T` bound to one key.
///
/// `set` updates the in-memory value immediately and then persists per the
/// cell's [`SavePolicy`]. The binding layer must call [`DataSaverState::dispose`]
/// exactly once when the owning scope ends.
///
/// ```rust
/// use std::sync::Arc;
/// use univrs_datasaver::{CellOptions, DataSaver, DataSaverState, MemoryDataSaver, PrimitiveValue};
///
/// let store = Arc::new(MemoryDataSaver::new());
/// let count = DataSaverState::new(store.clone(), "count", 0i32, CellOptions::default()).unwrap();
///
/// count.set(1).unwrap();
/// assert_eq!(store.read_data("count", PrimitiveValue::Int(0)).unwrap(), PrimitiveValue::Int(1));
///
/// count.remove().unwrap();
/// assert!(!store.contains("count"));
/// assert_eq!(count.get(), 0);
/// ```
pub struct DataSaverState<T: StateValue> {
    cell: Cell<T, ScalarCodec<T>>,
}

impl<T: StateValue> DataSaverState<T> {
    /// Create a cell, loading the persisted value if the key exists.
    ///
    /// Fails when the key holds a value of a type that has neither a native
    /// primitive form nor a registered converter.
    pub fn new(
        adapter: Arc<dyn DataSaver>,
        key: impl Into<String>,
        initial: T,
        options: CellOptions,
    ) -> Result<Self> {
        let codec = ScalarCodec::new(&options);
        let cell = Cell::new(adapter, key.into(), initial, codec, &options)?;
        Ok(Self { cell })
    }

    /// The key this cell is bound to.
    pub fn key(&self) -> &str {
        self.cell.key()
    }

    /// The policy fixed at construction.
    pub fn save_policy(&self) -> SavePolicy {
        self.cell.save_policy()
    }

    /// Current in-memory value.
    pub fn get(&self) -> T {
        self.cell.get()
    }

    /// Update the value and persist it if the policy says so.
    ///
    /// The in-memory value is updated even when the write fails.
    pub fn set(&self, value: T) -> Result<()> {
        self.cell.set(value)
    }

    /// Update the value without persisting it.
    pub fn set_without_save(&self, value: T) {
        self.cell.set_without_save(value)
    }

    /// Persist the current value now, regardless of policy.
    pub fn save(&self) -> Result<()> {
        self.cell.save()
    }

    /// Remove the key and reset the value to the initial value.
    pub fn remove(&self) -> Result<()> {
        self.cell.remove_with(self.cell.initial().clone())
    }

    /// Remove the key and reset the value to `replacement`, without saving it.
    pub fn remove_with(&self, replacement: T) -> Result<()> {
        self.cell.remove_with(replacement)
    }

    /// Whether the value differs from the one loaded at construction.
    pub fn value_changed_since_init(&self) -> bool {
        self.cell.value_changed_since_init()
    }

    /// Take the observer handle of the latest background save, if any.
    ///
    /// Taking it does not stop a later save from cancelling this one.
    pub fn take_pending_save(&self) -> Option<SaveHandle> {
        self.cell.take_pending_save()
    }

    /// Whether a background save is still running.
    pub fn is_saving(&self) -> bool {
        self.cell.is_saving()
    }

    /// End the cell's life, saving once first under [`SavePolicy::OnDispose`].
    ///
    /// Returns the handle of a background save still in flight.
    pub fn dispose(self) -> Result<Option<SaveHandle>> {
        self.cell.dispose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDataSaver;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        age: u32,
    }

    impl StateValue for Profile {}

    fn isolated() -> (Arc<MemoryDataSaver>, Arc<ConverterRegistry>) {
        let registry = Arc::new(ConverterRegistry::new());
        registry.register_json::<Profile>();
        (Arc::new(MemoryDataSaver::new()), registry)
    }

    fn options(registry: &Arc<ConverterRegistry>) -> CellOptions {
        CellOptions::default().with_registry(registry.clone())
    }

    #[test]
    fn test_absent_key_uses_initial_without_io() {
        let (store, registry) = isolated();
        let cell = DataSaverState::new(store.clone(), "count", 5i32, options(&registry)).unwrap();
        assert_eq!(cell.get(), 5);
        assert_eq!(store.write_count(), 0);
        assert!(!store.contains("count"));
    }

    #[test]
    fn test_loads_native_value() {
        let (store, registry) = isolated();
        store.save_data("volume", Some(PrimitiveValue::Double(0.75))).unwrap();

        let cell = DataSaverState::new(store.clone(), "volume", 1.0f64, options(&registry)).unwrap();
        assert_eq!(cell.get(), 0.75);
        assert!(!cell.value_changed_since_init());
    }

    #[test]
    fn test_immediate_policy_persists_on_change() {
        let (store, registry) = isolated();
        let cell = DataSaverState::new(store.clone(), "count", 0i32, options(&registry)).unwrap();

        cell.set(1).unwrap();
        assert_eq!(
            store.read_data("count", PrimitiveValue::Int(0)).unwrap(),
            PrimitiveValue::Int(1)
        );

        // Same value again is not a change
        cell.set(1).unwrap();
        assert_eq!(store.write_count(), 1);
    }

    #[test]
    fn test_manual_policy_waits_for_save() {
        let (store, registry) = isolated();
        let cell = DataSaverState::new(
            store.clone(),
            "draft",
            String::new(),
            options(&registry).with_save_policy(SavePolicy::Manual),
        )
        .unwrap();

        cell.set("hello".to_string()).unwrap();
        assert_eq!(cell.get(), "hello");
        assert!(!store.contains("draft"));

        cell.save().unwrap();
        assert_eq!(store.get_raw("draft"), Some("hello".into()));
    }

    #[test]
    fn test_custom_type_round_trips_through_converter() {
        let (store, registry) = isolated();
        let initial = Profile {
            name: "anon".to_string(),
            age: 0,
        };
        let cell = DataSaverState::new(store.clone(), "profile", initial.clone(), options(&registry)).unwrap();

        let ada = Profile {
            name: "ada".to_string(),
            age: 36,
        };
        cell.set(ada.clone()).unwrap();
        assert!(matches!(store.get_raw("profile"), Some(PrimitiveValue::Str(_))));

        let reloaded = DataSaverState::new(store.clone(), "profile", initial, options(&registry)).unwrap();
        assert_eq!(reloaded.get(), ada);
    }

    #[test]
    fn test_corrupt_custom_value_falls_back_to_initial() {
        let (store, registry) = isolated();
        store.save_data("profile", Some("{broken".into())).unwrap();

        let initial = Profile {
            name: "anon".to_string(),
            age: 0,
        };
        let cell = DataSaverState::new(store.clone(), "profile", initial.clone(), options(&registry)).unwrap();
        assert_eq!(cell.get(), initial);
    }

    #[test]
    fn test_stored_number_under_text_key_keeps_initial() {
        let (store, registry) = isolated();
        store.save_data("theme", Some(PrimitiveValue::Int(5))).unwrap();

        let cell = DataSaverState::new(store.clone(), "theme", "light".to_string(), options(&registry)).unwrap();
        assert_eq!(cell.get(), "light");
        assert!(!cell.value_changed_since_init());
    }

    #[test]
    fn test_nullable_number_drift_keeps_initial_null() {
        let (store, registry) = isolated();
        store.save_data("limit", Some("garbage".into())).unwrap();

        let cell = DataSaverState::<Option<i64>>::new(store.clone(), "limit", None, options(&registry)).unwrap();
        assert_eq!(cell.get(), None);

        let bounded = DataSaverState::new(store.clone(), "limit", Some(10i64), options(&registry)).unwrap();
        assert_eq!(bounded.get(), Some(10));
    }

    #[test]
    fn test_custom_type_without_converter_fails_construction() {
        #[derive(Debug, Clone, PartialEq)]
        struct Unregistered(u8);
        impl StateValue for Unregistered {}

        let (store, registry) = isolated();
        store.save_data("mystery", Some("1".into())).unwrap();

        let result = DataSaverState::new(store.clone(), "mystery", Unregistered(0), options(&registry));
        assert!(matches!(result, Err(SaverError::TypeUnsupported { .. })));
    }

    #[test]
    fn test_save_without_converter_is_unsupported_but_value_kept() {
        #[derive(Debug, Clone, PartialEq)]
        struct Unregistered(u8);
        impl StateValue for Unregistered {}

        let (store, registry) = isolated();
        let cell = DataSaverState::new(store.clone(), "mystery", Unregistered(0), options(&registry)).unwrap();

        let err = cell.set(Unregistered(1)).unwrap_err();
        assert!(matches!(err, SaverError::TypeUnsupported { action: Action::Save, .. }));
        assert_eq!(cell.get(), Unregistered(1));
    }

    #[test]
    fn test_cell_converter_overrides_registry() {
        let (store, registry) = isolated();
        let shouting = Arc::new(crate::converter::TypedConverter::<String>::new(
            |s: &String| s.to_uppercase(),
            |raw: &str| Ok::<_, String>(raw.to_lowercase()),
        ));
        let cell = DataSaverState::new(
            store.clone(),
            "greeting",
            String::new(),
            options(&registry).with_converter(shouting),
        )
        .unwrap();

        cell.set("hi".to_string()).unwrap();
        assert_eq!(store.get_raw("greeting"), Some("HI".into()));
    }

    #[test]
    fn test_nullable_none_removes_key() {
        let (store, registry) = isolated();
        let cell = DataSaverState::new(store.clone(), "nickname", Some("al".to_string()), options(&registry))
            .unwrap();

        cell.set(Some("bo".to_string())).unwrap();
        assert!(store.contains("nickname"));
        cell.set(None).unwrap();
        assert!(!store.contains("nickname"));
    }

    #[test]
    fn test_nullable_custom_uses_inner_converter() {
        let (store, registry) = isolated();
        let cell = DataSaverState::<Option<Profile>>::new(store.clone(), "maybe", None, options(&registry)).unwrap();

        let bo = Profile {
            name: "bo".to_string(),
            age: 3,
        };
        cell.set(Some(bo.clone())).unwrap();

        let reloaded = DataSaverState::<Option<Profile>>::new(store.clone(), "maybe", None, options(&registry)).unwrap();
        assert_eq!(reloaded.get(), Some(bo));
    }

    #[test]
    fn test_remove_resets_to_initial() {
        let (store, registry) = isolated();
        let cell = DataSaverState::new(store.clone(), "count", 0i32, options(&registry)).unwrap();
        cell.set(4).unwrap();

        cell.remove().unwrap();
        assert!(!store.contains("count"));
        assert_eq!(cell.get(), 0);

        cell.remove_with(9).unwrap();
        assert_eq!(cell.get(), 9);
        assert!(!store.contains("count"));
    }

    #[test]
    fn test_dispose_saves_only_when_changed() {
        let (store, registry) = isolated();
        let opts = options(&registry).with_save_policy(SavePolicy::OnDispose);

        let untouched = DataSaverState::new(store.clone(), "a", 1i64, opts.clone()).unwrap();
        untouched.set(2).unwrap();
        untouched.set(1).unwrap();
        untouched.dispose().unwrap();
        assert_eq!(store.write_count(), 0);

        let changed = DataSaverState::new(store.clone(), "a", 1i64, opts).unwrap();
        changed.set(2).unwrap();
        assert_eq!(store.write_count(), 0);
        changed.dispose().unwrap();
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.get_raw("a"), Some(PrimitiveValue::Long(2)));
    }

    #[tokio::test]
    async fn test_async_save_is_observable() {
        let (store, registry) = isolated();
        let cell = DataSaverState::new(store.clone(), "count", 0i32, options(&registry).with_async(true)).unwrap();

        cell.set(3).unwrap();
        assert_eq!(cell.get(), 3);
        cell.take_pending_save().unwrap().wait().await.unwrap();
        assert_eq!(store.get_raw("count"), Some(PrimitiveValue::Int(3)));
    }

    #[tokio::test]
    async fn test_async_rewrite_cancels_previous() {
        let (store, registry) = isolated();
        let cell = DataSaverState::new(store.clone(), "count", 0i32, options(&registry).with_async(true)).unwrap();

        // Nothing has been polled yet on this single-threaded runtime
        cell.set(1).unwrap();
        cell.set(2).unwrap();
        cell.set(3).unwrap();
        cell.take_pending_save().unwrap().wait().await.unwrap();

        assert_eq!(store.get_raw("count"), Some(PrimitiveValue::Int(3)));
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_taken_handle_is_still_superseded() {
        let (store, registry) = isolated();
        let cell = DataSaverState::new(store.clone(), "count", 0i32, options(&registry).with_async(true)).unwrap();

        cell.set(1).unwrap();
        let first = cell.take_pending_save().unwrap();
        cell.set(2).unwrap();
        let second = cell.take_pending_save().unwrap();

        assert!(matches!(first.wait().await, Err(SaverError::Cancelled)));
        second.wait().await.unwrap();
        assert_eq!(store.get_raw("count"), Some(PrimitiveValue::Int(2)));
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_latest_async_save_wins_on_many_threads() {
        for round in 0..20 {
            let (store, registry) = isolated();
            let key = format!("count-{}", round);
            let cell = DataSaverState::new(store.clone(), key.as_str(), 0i32, options(&registry).with_async(true))
                .unwrap();

            let mut handles = Vec::new();
            for value in 1..=8 {
                cell.set(value).unwrap();
                handles.extend(cell.take_pending_save());
            }
            for handle in handles {
                let _ = handle.wait().await;
            }
            assert_eq!(store.get_raw(&key), Some(PrimitiveValue::Int(8)));
        }
    }

    #[tokio::test]
    async fn test_remove_with_survives_own_removal_echo() {
        let store = Arc::new(MemoryDataSaver::sensing_external_changes());
        let registry = Arc::new(ConverterRegistry::new());
        let cell = DataSaverState::new(
            store.clone(),
            "count",
            0i32,
            options(&registry).sensing_external_change(true),
        )
        .unwrap();

        cell.set(4).unwrap();
        cell.remove_with(9).unwrap();
        assert_eq!(cell.get(), 9);

        // Let the reconciliation task drain both events
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(cell.get(), 9);
        assert!(!store.contains("count"));

        // A removal made elsewhere still resets to the initial value
        cell.set(3).unwrap();
        store.remove("count").unwrap();
        for _ in 0..100 {
            if cell.get() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(cell.get(), 0);
    }

    #[tokio::test]
    async fn test_external_change_is_applied_without_saving() {
        let store = Arc::new(MemoryDataSaver::sensing_external_changes());
        let registry = Arc::new(ConverterRegistry::new());
        let cell = DataSaverState::new(
            store.clone(),
            "theme",
            "light".to_string(),
            options(&registry).sensing_external_change(true),
        )
        .unwrap();

        store.save_data("theme", Some("dark".into())).unwrap();
        for _ in 0..100 {
            if cell.get() == "dark" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(cell.get(), "dark");
        assert_eq!(store.write_count(), 1);

        store.remove("theme").unwrap();
        for _ in 0..100 {
            if cell.get() == "light" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(cell.get(), "light");
    }
}
