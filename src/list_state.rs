//! List state cells and the delimited list encoding.
//!
//! A whole list is stored as one string: `[` + elements joined by the
//! separator + `]`. The empty list is `[]`. Elements are serialized with the
//! same converter resolution a scalar cell uses.

use std::sync::Arc;
use tracing::warn;

use crate::cell::{Cell, CellOptions, Codec, SavePolicy};
use crate::error::{Result, SaverError};
use crate::scope::SaveHandle;
use crate::state::ScalarCodec;
use crate::store::DataSaver;
use crate::value::{PrimitiveKind, PrimitiveValue, StateValue};

/// Encode a list with `encode` for each element.
///
/// Fails with [`SaverError::SeparatorInElement`] when an encoded element
/// contains the separator, since it could not be decoded back.
pub fn encode_list<T, F>(items: &[T], separator: &str, mut encode: F) -> Result<String>
where
    F: FnMut(&T) -> Result<String>,
{
    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        let part = encode(item)?;
        if part.contains(separator) {
            return Err(SaverError::SeparatorInElement {
                separator: separator.to_string(),
                element: part,
            });
        }
        parts.push(part);
    }
    Ok(format!("[{}]", parts.join(separator)))
}

/// Decode a list produced by [`encode_list`].
pub fn decode_list<T, F>(encoded: &str, separator: &str, decode: F) -> Result<Vec<T>>
where
    F: FnMut(&str) -> Result<T>,
{
    let body = encoded
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or_else(|| SaverError::MalformedList(format!("`{}` is not enclosed in brackets", encoded)))?;
    if body.is_empty() {
        return Ok(Vec::new());
    }
    body.split(separator).map(decode).collect()
}

pub(crate) struct ListCodec<T> {
    element: ScalarCodec<T>,
    separator: String,
}

impl<T: StateValue> ListCodec<T> {
    pub(crate) fn new(options: &CellOptions) -> Result<Self> {
        if options.list_separator.is_empty() {
            return Err(SaverError::Config("list separator must not be empty".to_string()));
        }
        Ok(Self {
            element: ScalarCodec::new(options),
            separator: options.list_separator.clone(),
        })
    }

    fn encode_items(&self, key: &str, items: &[T]) -> Result<String> {
        encode_list(items, &self.separator, |item| self.element.to_text(key, item))
    }

    fn decode_items(&self, key: &str, encoded: &str) -> Result<Vec<T>> {
        decode_list(encoded, &self.separator, |part| self.element.from_text(key, part))
    }
}

impl<T: StateValue> Codec<Vec<T>> for ListCodec<T> {
    fn load(&self, adapter: &dyn DataSaver, key: &str, initial: &Vec<T>) -> Result<Vec<T>> {
        let Some(stored) = adapter.read_stored(key, PrimitiveKind::Str)? else {
            return Ok(initial.clone());
        };
        match self.decode_items(key, &stored.to_text()) {
            Ok(items) => Ok(items),
            Err(err @ SaverError::TypeUnsupported { .. }) => Err(err),
            Err(err) => {
                warn!("error while restoring list `{}`, using initial value: {}", key, err);
                Ok(initial.clone())
            }
        }
    }

    fn encode(&self, key: &str, value: &Vec<T>) -> Result<Option<PrimitiveValue>> {
        self.encode_items(key, value).map(|encoded| Some(PrimitiveValue::Str(encoded)))
    }

    fn decode_change(&self, key: &str, value: Option<PrimitiveValue>, initial: &Vec<T>) -> Result<Vec<T>> {
        match value {
            None => Ok(initial.clone()),
            Some(PrimitiveValue::Str(encoded)) => self.decode_items(key, &encoded),
            Some(other) => Err(SaverError::MalformedList(format!(
                "expected a string for `{}`, found {}",
                key,
                other.kind()
            ))),
        }
    }
}

/// A persisted ordered list bound to one key.
///
/// Behaves like [`crate::DataSaverState`] with a `Vec<T>` value; lists are
/// compared element-wise, so setting an equal list never writes.
pub struct DataSaverListState<T: StateValue> {
    cell: Cell<Vec<T>, ListCodec<T>>,
}

impl<T: StateValue> DataSaverListState<T> {
    /// Create a list cell, loading the persisted list if the key exists.
    ///
    /// A stored list that does not decode falls back to `initial`.
    pub fn new(
        adapter: Arc<dyn DataSaver>,
        key: impl Into<String>,
        initial: Vec<T>,
        options: CellOptions,
    ) -> Result<Self> {
        let codec = ListCodec::new(&options)?;
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

    /// Copy of the current list.
    pub fn get(&self) -> Vec<T> {
        self.cell.get()
    }

    /// Replace the list and persist it if the policy says so.
    ///
    /// Lists are compared element-wise; an equal list is not a change.
    pub fn set(&self, items: Vec<T>) -> Result<()> {
        self.cell.set(items)
    }

    /// Apply `f` to a copy of the list and set the result.
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<T>),
    {
        let mut items = self.get();
        f(&mut items);
        self.set(items)
    }

    /// Replace the list without persisting it.
    pub fn set_without_save(&self, items: Vec<T>) {
        self.cell.set_without_save(items)
    }

    /// Persist the current list now, regardless of policy.
    pub fn save(&self) -> Result<()> {
        self.cell.save()
    }

    /// Remove the key and reset the list to the initial list.
    pub fn remove(&self) -> Result<()> {
        self.cell.remove_with(self.cell.initial().clone())
    }

    /// Remove the key and reset the list to `replacement`, without saving it.
    pub fn remove_with(&self, replacement: Vec<T>) -> Result<()> {
        self.cell.remove_with(replacement)
    }

    /// Whether the list differs from the one loaded at construction.
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
    pub fn dispose(self) -> Result<Option<SaveHandle>> {
        self.cell.dispose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_LIST_SEPARATOR;
    use crate::converter::ConverterRegistry;
    use crate::memory::MemoryDataSaver;

    const SEP: &str = DEFAULT_LIST_SEPARATOR;

    fn plain(item: &String) -> Result<String> {
        Ok(item.clone())
    }

    fn options() -> CellOptions {
        CellOptions::default().with_registry(Arc::new(ConverterRegistry::new()))
    }

    #[test]
    fn test_encode_list_format() {
        let empty: Vec<String> = vec![];
        assert_eq!(encode_list(&empty, SEP, plain).unwrap(), "[]");

        let items = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(encode_list(&items, SEP, plain).unwrap(), "[a#@#b#@#c]");
    }

    #[test]
    fn test_decode_list() {
        let decoded: Vec<String> = decode_list("[a#@#b]", SEP, |s| Ok(s.to_string())).unwrap();
        assert_eq!(decoded, vec!["a", "b"]);

        let empty: Vec<String> = decode_list("[]", SEP, |s| Ok(s.to_string())).unwrap();
        assert!(empty.is_empty());

        let single: Vec<i32> = decode_list("[42]", SEP, |s| {
            s.parse().map_err(|e| SaverError::conversion("i32", e))
        })
        .unwrap();
        assert_eq!(single, vec![42]);
    }

    #[test]
    fn test_decode_rejects_missing_brackets() {
        let result: Result<Vec<String>> = decode_list("a#@#b", SEP, |s| Ok(s.to_string()));
        assert!(matches!(result, Err(SaverError::MalformedList(_))));
    }

    #[test]
    fn test_separator_in_element_rejected() {
        let items = vec!["fine".to_string(), "not#@#fine".to_string()];
        let err = encode_list(&items, SEP, plain).unwrap_err();
        assert!(matches!(err, SaverError::SeparatorInElement { .. }));
    }

    #[test]
    fn test_list_cell_persists_and_reloads() {
        let store = Arc::new(MemoryDataSaver::new());
        let cell = DataSaverListState::new(store.clone(), "scores", vec![1i64], options()).unwrap();

        cell.set(vec![3, 1, 2]).unwrap();
        assert_eq!(store.get_raw("scores"), Some("[3#@#1#@#2]".into()));

        let reloaded: DataSaverListState<i64> = DataSaverListState::new(store.clone(), "scores", vec![], options()).unwrap();
        assert_eq!(reloaded.get(), vec![3, 1, 2]);
    }

    #[test]
    fn test_equal_list_does_not_write() {
        let store = Arc::new(MemoryDataSaver::new());
        let cell = DataSaverListState::new(store.clone(), "tags", vec!["a".to_string()], options()).unwrap();

        cell.set(vec!["a".to_string(), "b".to_string()]).unwrap();
        cell.set(vec!["a".to_string(), "b".to_string()]).unwrap();
        assert_eq!(store.write_count(), 1);
    }

    #[test]
    fn test_update_appends() {
        let store = Arc::new(MemoryDataSaver::new());
        let cell = DataSaverListState::new(store.clone(), "flags", Vec::<bool>::new(), options()).unwrap();

        cell.update(|items| items.push(true)).unwrap();
        cell.update(|items| items.push(false)).unwrap();
        assert_eq!(store.get_raw("flags"), Some("[true#@#false]".into()));
    }

    #[test]
    fn test_custom_separator() {
        let store = Arc::new(MemoryDataSaver::new());
        let cell = DataSaverListState::new(
            store.clone(),
            "words",
            Vec::<String>::new(),
            options().with_list_separator("|"),
        )
        .unwrap();

        cell.set(vec!["x".to_string(), "y".to_string()]).unwrap();
        assert_eq!(store.get_raw("words"), Some("[x|y]".into()));
    }

    #[test]
    fn test_malformed_stored_list_falls_back_to_initial() {
        let store = Arc::new(MemoryDataSaver::new());
        store.save_data("scores", Some("3,1,2".into())).unwrap();

        let cell = DataSaverListState::new(store.clone(), "scores", vec![7i32], options()).unwrap();
        assert_eq!(cell.get(), vec![7]);
    }

    #[test]
    fn test_element_drift_falls_back_to_initial() {
        let store = Arc::new(MemoryDataSaver::new());
        store.save_data("scores", Some("[1#@#two]".into())).unwrap();

        let cell = DataSaverListState::new(store.clone(), "scores", vec![0i32], options()).unwrap();
        assert_eq!(cell.get(), vec![0]);
    }

    #[test]
    fn test_failed_save_keeps_in_memory_list() {
        let store = Arc::new(MemoryDataSaver::new());
        let cell = DataSaverListState::new(store.clone(), "tags", Vec::<String>::new(), options()).unwrap();

        let err = cell.set(vec!["a#@#b".to_string()]).unwrap_err();
        assert!(matches!(err, SaverError::SeparatorInElement { .. }));
        assert_eq!(cell.get(), vec!["a#@#b".to_string()]);
        assert!(!store.contains("tags"));
    }

    #[test]
    fn test_remove_resets_list() {
        let store = Arc::new(MemoryDataSaver::new());
        let cell = DataSaverListState::new(store.clone(), "tags", vec!["seed".to_string()], options()).unwrap();
        cell.set(vec!["x".to_string()]).unwrap();

        cell.remove().unwrap();
        assert!(!store.contains("tags"));
        assert_eq!(cell.get(), vec!["seed".to_string()]);
    }

    #[test]
    fn test_empty_separator_rejected() {
        let store = Arc::new(MemoryDataSaver::new());
        let result = DataSaverListState::new(store, "tags", Vec::<String>::new(), options().with_list_separator(""));
        assert!(matches!(result, Err(SaverError::Config(_))));
    }
}
