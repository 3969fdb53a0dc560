//! Primitive values and the mapping from Rust types onto them.
//!
//! Adapters only ever see [`PrimitiveValue`]. State cells move typed values
//! across that boundary through [`StateValue`]: native primitives map directly,
//! everything else goes through the converter registry as a string.

use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::fmt;

/// A value a backend can natively persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PrimitiveValue {
    Long(i64),
    Int(i32),
    Str(String),
    Bool(bool),
    Float(f32),
    Double(f64),
    Bytes(Vec<u8>),
    /// Backend-native structured blob.
    Structured(serde_json::Value),
}

/// The variant tag of a [`PrimitiveValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimitiveKind {
    Long,
    Int,
    Str,
    Bool,
    Float,
    Double,
    Bytes,
    Structured,
}

impl PrimitiveKind {
    /// All kinds, in declaration order.
    pub const ALL: [PrimitiveKind; 8] = [
        PrimitiveKind::Long,
        PrimitiveKind::Int,
        PrimitiveKind::Str,
        PrimitiveKind::Bool,
        PrimitiveKind::Float,
        PrimitiveKind::Double,
        PrimitiveKind::Bytes,
        PrimitiveKind::Structured,
    ];

    /// Parse the text form produced by [`PrimitiveValue::to_text`].
    ///
    /// Returns `None` when the text is not a valid value of this kind.
    pub fn parse(self, text: &str) -> Option<PrimitiveValue> {
        match self {
            PrimitiveKind::Long => text.parse().ok().map(PrimitiveValue::Long),
            PrimitiveKind::Int => text.parse().ok().map(PrimitiveValue::Int),
            PrimitiveKind::Str => Some(PrimitiveValue::Str(text.to_string())),
            PrimitiveKind::Bool => match text {
                "true" => Some(PrimitiveValue::Bool(true)),
                "false" => Some(PrimitiveValue::Bool(false)),
                _ => None,
            },
            PrimitiveKind::Float => text.parse().ok().map(PrimitiveValue::Float),
            PrimitiveKind::Double => text.parse().ok().map(PrimitiveValue::Double),
            PrimitiveKind::Bytes => hex::decode(text).ok().map(PrimitiveValue::Bytes),
            PrimitiveKind::Structured => serde_json::from_str(text).ok().map(PrimitiveValue::Structured),
        }
    }

    /// A placeholder value of this kind, used as the read default for nullable cells.
    pub fn zero(self) -> PrimitiveValue {
        match self {
            PrimitiveKind::Long => PrimitiveValue::Long(0),
            PrimitiveKind::Int => PrimitiveValue::Int(0),
            PrimitiveKind::Str => PrimitiveValue::Str(String::new()),
            PrimitiveKind::Bool => PrimitiveValue::Bool(false),
            PrimitiveKind::Float => PrimitiveValue::Float(0.0),
            PrimitiveKind::Double => PrimitiveValue::Double(0.0),
            PrimitiveKind::Bytes => PrimitiveValue::Bytes(Vec::new()),
            PrimitiveKind::Structured => PrimitiveValue::Structured(serde_json::Value::Null),
        }
    }
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl PrimitiveValue {
    /// The variant tag of this value.
    pub fn kind(&self) -> PrimitiveKind {
        match self {
            PrimitiveValue::Long(_) => PrimitiveKind::Long,
            PrimitiveValue::Int(_) => PrimitiveKind::Int,
            PrimitiveValue::Str(_) => PrimitiveKind::Str,
            PrimitiveValue::Bool(_) => PrimitiveKind::Bool,
            PrimitiveValue::Float(_) => PrimitiveKind::Float,
            PrimitiveValue::Double(_) => PrimitiveKind::Double,
            PrimitiveValue::Bytes(_) => PrimitiveKind::Bytes,
            PrimitiveValue::Structured(_) => PrimitiveKind::Structured,
        }
    }

    /// Text form used by text-only backends and list encoding.
    ///
    /// Bytes are hex encoded, structured blobs are compact JSON.
    pub fn to_text(&self) -> String {
        match self {
            PrimitiveValue::Long(v) => v.to_string(),
            PrimitiveValue::Int(v) => v.to_string(),
            PrimitiveValue::Str(v) => v.clone(),
            PrimitiveValue::Bool(v) => v.to_string(),
            PrimitiveValue::Float(v) => v.to_string(),
            PrimitiveValue::Double(v) => v.to_string(),
            PrimitiveValue::Bytes(v) => hex::encode(v),
            PrimitiveValue::Structured(v) => v.to_string(),
        }
    }

    /// Borrow the string payload, if this is a `Str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PrimitiveValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for PrimitiveValue {
    fn from(value: &str) -> Self {
        PrimitiveValue::Str(value.to_string())
    }
}

/// A type that can live in a state cell.
///
/// Native primitives override the primitive hooks; custom types use an empty
/// impl and rely on a registered converter:
///
/// ```rust
/// use univrs_datasaver::StateValue;
///
/// #[derive(Debug, Clone, PartialEq)]
/// struct Theme(String);
///
/// impl StateValue for Theme {}
/// ```
pub trait StateValue: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// The primitive kind this type is natively stored as, if any.
    fn primitive_kind() -> Option<PrimitiveKind> {
        None
    }

    /// Native primitive form of this value.
    fn to_primitive(&self) -> Option<PrimitiveValue> {
        None
    }

    /// Build a value from its native primitive form.
    fn from_primitive(_value: PrimitiveValue) -> Option<Self> {
        None
    }

    /// Whether the type has a null value.
    fn is_nullable() -> bool {
        false
    }

    /// The null value of a nullable type.
    fn null() -> Option<Self> {
        None
    }

    fn is_null(&self) -> bool {
        false
    }

    /// The wrapped value of a nullable type, for converter lookup.
    fn inner_any(&self) -> Option<&dyn Any> {
        None
    }

    /// Type tokens a restorer may be registered under, most specific first.
    fn restore_type_ids() -> Vec<TypeId> {
        vec![TypeId::of::<Self>()]
    }

    /// Recover a value from what a restorer produced.
    fn from_restored(value: Box<dyn Any + Send>) -> Option<Self> {
        value.downcast::<Self>().ok().map(|b| *b)
    }
}

macro_rules! native_state_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl StateValue for $ty {
                fn primitive_kind() -> Option<PrimitiveKind> {
                    Some(PrimitiveKind::$variant)
                }

                fn to_primitive(&self) -> Option<PrimitiveValue> {
                    Some(PrimitiveValue::$variant(self.clone()))
                }

                fn from_primitive(value: PrimitiveValue) -> Option<Self> {
                    match value {
                        PrimitiveValue::$variant(v) => Some(v),
                        _ => None,
                    }
                }
            }
        )*
    };
}

native_state_value! {
    i64 => Long,
    i32 => Int,
    String => Str,
    bool => Bool,
    f32 => Float,
    f64 => Double,
    Vec<u8> => Bytes,
    serde_json::Value => Structured,
}

impl<T: StateValue> StateValue for Option<T> {
    fn primitive_kind() -> Option<PrimitiveKind> {
        T::primitive_kind()
    }

    fn to_primitive(&self) -> Option<PrimitiveValue> {
        self.as_ref().and_then(T::to_primitive)
    }

    fn from_primitive(value: PrimitiveValue) -> Option<Self> {
        T::from_primitive(value).map(Some)
    }

    fn is_nullable() -> bool {
        true
    }

    fn null() -> Option<Self> {
        Some(None)
    }

    fn is_null(&self) -> bool {
        self.is_none()
    }

    fn inner_any(&self) -> Option<&dyn Any> {
        self.as_ref().map(|v| v as &dyn Any)
    }

    fn restore_type_ids() -> Vec<TypeId> {
        let mut ids = vec![TypeId::of::<Self>()];
        ids.extend(T::restore_type_ids());
        ids
    }

    fn from_restored(value: Box<dyn Any + Send>) -> Option<Self> {
        match value.downcast::<Self>() {
            Ok(v) => Some(*v),
            Err(other) => T::from_restored(other).map(Some),
        }
    }
}
