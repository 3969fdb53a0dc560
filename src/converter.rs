//! Type converters and the registry that resolves them.
//!
//! A converter turns values of a type that no backend stores natively into a
//! string and back. The registry keeps converters in registration order and
//! always answers with the *last* registered match, so a later, more specific
//! registration overrides an earlier, more general one.
//!
//! The registry is additive: there is no way to unregister. The process-wide
//! instance from [`ConverterRegistry::global`] is meant to be filled at
//! startup, before the first cell that needs a converter is created. Tests can
//! build isolated registries with [`ConverterRegistry::new`].

use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::error::{Result, SaverError};

/// A (predicate, serializer, deserializer) triple for one type.
pub trait TypeConverter: Send + Sync {
    /// Whether this converter can serialize the given runtime value.
    fn accepts(&self, value: &dyn Any) -> bool;

    /// Whether this converter restores values of the given declared type.
    fn restores(&self, type_id: TypeId) -> bool;

    /// Serialize an accepted value.
    fn save(&self, value: &dyn Any) -> Result<String>;

    /// Deserialize a stored string into a value of the declared type.
    fn restore(&self, raw: &str) -> Result<Box<dyn Any + Send>>;

    /// Name of the converted type, for logs and errors.
    fn type_name(&self) -> &'static str;
}

impl fmt::Debug for dyn TypeConverter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeConverter({})", self.type_name())
    }
}

type AcceptFn<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;
type SaveFn<T> = Box<dyn Fn(&T) -> Result<String> + Send + Sync>;
type RestoreFn<T> = Box<dyn Fn(&str) -> Result<T> + Send + Sync>;

/// A converter for values of type `T`, built from closures.
///
/// Accepts every `T` unless narrowed with [`TypedConverter::when`]. For a
/// nullable slot register the converter on `Option<T>`, so the predicate also
/// sees `None`.
pub struct TypedConverter<T> {
    accept: Option<AcceptFn<T>>,
    save: SaveFn<T>,
    restore: RestoreFn<T>,
}

impl<T: Send + Sync + 'static> TypedConverter<T> {
    /// Converter with an infallible serializer.
    pub fn new<S, R, E>(save: S, restore: R) -> Self
    where
        S: Fn(&T) -> String + Send + Sync + 'static,
        R: Fn(&str) -> std::result::Result<T, E> + Send + Sync + 'static,
        E: fmt::Display,
    {
        Self::fallible(move |value: &T| Ok::<_, E>(save(value)), restore)
    }

    /// Converter whose serializer can fail too.
    pub fn fallible<S, R, E1, E2>(save: S, restore: R) -> Self
    where
        S: Fn(&T) -> std::result::Result<String, E1> + Send + Sync + 'static,
        R: Fn(&str) -> std::result::Result<T, E2> + Send + Sync + 'static,
        E1: fmt::Display,
        E2: fmt::Display,
    {
        let type_name = std::any::type_name::<T>();
        Self {
            accept: None,
            save: Box::new(move |value: &T| {
                save(value).map_err(|e| SaverError::conversion(type_name, e))
            }),
            restore: Box::new(move |raw: &str| {
                restore(raw).map_err(|e| SaverError::conversion(type_name, e))
            }),
        }
    }

    /// Converter backed by `serde_json`.
    pub fn json() -> Self
    where
        T: Serialize + DeserializeOwned,
    {
        Self::fallible(
            |value: &T| serde_json::to_string(value),
            |raw: &str| serde_json::from_str::<T>(raw),
        )
    }

    /// Only accept values for which the predicate holds.
    pub fn when<A>(mut self, accept: A) -> Self
    where
        A: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.accept = Some(Box::new(accept));
        self
    }
}

impl<T: Send + Sync + 'static> TypeConverter for TypedConverter<T> {
    fn accepts(&self, value: &dyn Any) -> bool {
        match value.downcast_ref::<T>() {
            Some(v) => self.accept.as_ref().map_or(true, |accept| accept(v)),
            None => false,
        }
    }

    fn restores(&self, type_id: TypeId) -> bool {
        type_id == TypeId::of::<T>()
    }

    fn save(&self, value: &dyn Any) -> Result<String> {
        let value = value.downcast_ref::<T>().ok_or_else(|| {
            SaverError::conversion(self.type_name(), "value is not of the converter's type")
        })?;
        (self.save)(value)
    }

    fn restore(&self, raw: &str) -> Result<Box<dyn Any + Send>> {
        (self.restore)(raw).map(|v| Box::new(v) as Box<dyn Any + Send>)
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// Ordered, append-only list of converters.
pub struct ConverterRegistry {
    converters: RwLock<Vec<Arc<dyn TypeConverter>>>,
}

static GLOBAL: OnceLock<Arc<ConverterRegistry>> = OnceLock::new();

impl ConverterRegistry {
    /// A registry holding only the built-in identity converter for `String`.
    pub fn new() -> Self {
        let registry = Self {
            converters: RwLock::new(Vec::new()),
        };
        registry.register::<String, std::convert::Infallible>(|s| s.clone(), |raw| Ok(raw.to_string()));
        registry
    }

    /// The process-wide registry. Created on first use, never torn down.
    pub fn global() -> Arc<ConverterRegistry> {
        GLOBAL.get_or_init(|| Arc::new(ConverterRegistry::new())).clone()
    }

    /// Register a converter for `T`.
    pub fn register<T, E>(
        &self,
        save: impl Fn(&T) -> String + Send + Sync + 'static,
        restore: impl Fn(&str) -> std::result::Result<T, E> + Send + Sync + 'static,
    ) where
        T: Send + Sync + 'static,
        E: fmt::Display,
    {
        self.register_converter(Arc::new(TypedConverter::new(save, restore)));
    }

    /// Register a converter for `T` that only accepts values matching `accept`.
    pub fn register_when<T, E>(
        &self,
        accept: impl Fn(&T) -> bool + Send + Sync + 'static,
        save: impl Fn(&T) -> String + Send + Sync + 'static,
        restore: impl Fn(&str) -> std::result::Result<T, E> + Send + Sync + 'static,
    ) where
        T: Send + Sync + 'static,
        E: fmt::Display,
    {
        self.register_converter(Arc::new(TypedConverter::new(save, restore).when(accept)));
    }

    /// Register a JSON converter for any serde type.
    pub fn register_json<T>(&self)
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.register_converter(Arc::new(TypedConverter::<T>::json()));
    }

    /// Append a converter.
    pub fn register_converter(&self, converter: Arc<dyn TypeConverter>) {
        debug!("registering converter for {}", converter.type_name());
        self.converters.write().push(converter);
    }

    /// Last registered converter that accepts the runtime value.
    pub fn find_saver(&self, value: &dyn Any) -> Option<Arc<dyn TypeConverter>> {
        self.snapshot()
            .into_iter()
            .rev()
            .find(|converter| converter.accepts(value))
    }

    /// Last registered converter that restores the declared type.
    pub fn find_restorer(&self, type_id: TypeId) -> Option<Arc<dyn TypeConverter>> {
        self.snapshot()
            .into_iter()
            .rev()
            .find(|converter| converter.restores(type_id))
    }

    /// Number of registered converters, the built-in one included.
    pub fn len(&self) -> usize {
        self.converters.read().len()
    }

    /// Never true for a registry built with [`ConverterRegistry::new`].
    pub fn is_empty(&self) -> bool {
        self.converters.read().is_empty()
    }

    // Predicates run outside the lock so they may register converters themselves
    fn snapshot(&self) -> Vec<Arc<dyn TypeConverter>> {
        self.converters.read().clone()
    }
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.converters.read().iter()).finish()
    }
}

/// Coerce a typed reference to `&dyn Any` without adding a level of indirection.
pub(crate) fn as_any<T: 'static>(value: &T) -> &dyn Any {
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i32,
        y: i32,
    }

    fn point_converter(tag: &'static str) -> TypedConverter<Point> {
        TypedConverter::new(
            move |p: &Point| format!("{}:{},{}", tag, p.x, p.y),
            |raw: &str| -> std::result::Result<Point, String> {
                let (_, coords) = raw.split_once(':').ok_or("missing tag")?;
                let (x, y) = coords.split_once(',').ok_or("missing comma")?;
                Ok(Point {
                    x: x.parse().map_err(|e| format!("{e}"))?,
                    y: y.parse().map_err(|e| format!("{e}"))?,
                })
            },
        )
    }

    #[test]
    fn test_builtin_string_identity() {
        let registry = ConverterRegistry::new();
        assert_eq!(registry.len(), 1);

        let value = "hello".to_string();
        let saver = registry.find_saver(as_any(&value)).unwrap();
        assert_eq!(saver.save(as_any(&value)).unwrap(), "hello");

        let restorer = registry.find_restorer(TypeId::of::<String>()).unwrap();
        let restored = restorer.restore("hello").unwrap();
        assert_eq!(*restored.downcast::<String>().unwrap(), "hello");
    }

    #[test]
    fn test_no_converter_for_native_types() {
        let registry = ConverterRegistry::new();
        assert!(registry.find_saver(as_any(&5i32)).is_none());
        assert!(registry.find_restorer(TypeId::of::<i64>()).is_none());
    }

    #[test]
    fn test_last_registered_wins() {
        let registry = ConverterRegistry::new();
        registry.register_converter(Arc::new(point_converter("a")));
        registry.register_converter(Arc::new(point_converter("b")));

        let point = Point { x: 1, y: 2 };
        let saver = registry.find_saver(as_any(&point)).unwrap();
        assert_eq!(saver.save(as_any(&point)).unwrap(), "b:1,2");

        // Repeated lookups resolve the same way
        for _ in 0..3 {
            let saver = registry.find_saver(as_any(&point)).unwrap();
            assert_eq!(saver.save(as_any(&point)).unwrap(), "b:1,2");
        }
    }

    #[test]
    fn test_conditional_converter_falls_back() {
        let registry = ConverterRegistry::new();
        registry.register_converter(Arc::new(point_converter("general")));
        registry.register_converter(Arc::new(
            point_converter("origin").when(|p: &Point| p.x == 0 && p.y == 0),
        ));

        let origin = Point { x: 0, y: 0 };
        let other = Point { x: 3, y: 4 };
        let saver = registry.find_saver(as_any(&origin)).unwrap();
        assert_eq!(saver.save(as_any(&origin)).unwrap(), "origin:0,0");
        let saver = registry.find_saver(as_any(&other)).unwrap();
        assert_eq!(saver.save(as_any(&other)).unwrap(), "general:3,4");
    }

    #[test]
    fn test_json_converter() {
        let registry = ConverterRegistry::new();
        registry.register_json::<Point>();

        let point = Point { x: -1, y: 9 };
        let saved = registry
            .find_saver(as_any(&point))
            .unwrap()
            .save(as_any(&point))
            .unwrap();
        let restored = registry
            .find_restorer(TypeId::of::<Point>())
            .unwrap()
            .restore(&saved)
            .unwrap();
        assert_eq!(*restored.downcast::<Point>().unwrap(), point);
    }

    #[test]
    fn test_restore_failure_is_conversion_error() {
        let registry = ConverterRegistry::new();
        registry.register_json::<Point>();
        let err = registry
            .find_restorer(TypeId::of::<Point>())
            .unwrap()
            .restore("{not json")
            .unwrap_err();
        assert!(matches!(err, SaverError::Conversion { .. }));
    }

    #[test]
    fn test_nullable_converter_sees_none() {
        let registry = ConverterRegistry::new();
        registry.register::<Option<Point>, String>(
            |p| match p {
                Some(p) => format!("{},{}", p.x, p.y),
                None => "none".to_string(),
            },
            |raw| {
                if raw == "none" {
                    return Ok(None);
                }
                let (x, y) = raw.split_once(',').ok_or_else(|| "bad point".to_string())?;
                Ok(Some(Point {
                    x: x.parse().map_err(|_| "bad x".to_string())?,
                    y: y.parse().map_err(|_| "bad y".to_string())?,
                }))
            },
        );

        let none: Option<Point> = None;
        let saver = registry.find_saver(as_any(&none)).unwrap();
        assert_eq!(saver.save(as_any(&none)).unwrap(), "none");
    }

    #[test]
    fn test_global_is_shared() {
        let a = ConverterRegistry::global();
        let b = ConverterRegistry::global();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.find_restorer(TypeId::of::<String>()).is_some());
    }
}
