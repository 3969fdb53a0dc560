//! # univrs-datasaver
//!
//! Typed persistence for UI state. A state cell binds one value to one key of
//! a primitive store and keeps the two in sync:
//!
//! - **Primitive stores**: [`DataSaver`] backends persist [`PrimitiveValue`]s
//! - **Converters**: arbitrary types reach a store as strings through a
//!   [`ConverterRegistry`]
//! - **Save policies**: write on every change, once on dispose, or only on demand
//! - **Async saves**: cancel-then-restart background writes per cell
//! - **External changes**: cells follow writes other cells or processes make
//!
//! ## Backends
//!
//! - [`MemoryDataSaver`]: In-memory store (testing and previews)
//! - [`FileDataSaver`]: Plain-text JSON file with optional file monitoring
//! - [`EncryptedFileDataSaver`]: The same file layout with AES-256-GCM sealed values
//! - [`SqliteDataSaver`]: Embedded SQLite database with async writes
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use univrs_datasaver::{create_cell, CellOptions, MemoryDataSaver};
//!
//! fn main() -> univrs_datasaver::Result<()> {
//!     let store = Arc::new(MemoryDataSaver::new());
//!
//!     let count = create_cell(store.clone(), "count", 0i64, CellOptions::default())?;
//!     count.set(count.get() + 1)?;
//!
//!     // A new cell on the same key starts from the persisted value
//!     let again = create_cell(store, "count", 0i64, CellOptions::default())?;
//!     assert_eq!(again.get(), 1);
//!     Ok(())
//! }
//! ```
//!
//! ## Custom Types
//!
//! ```rust
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//! use univrs_datasaver::{create_cell, CellOptions, ConverterRegistry, MemoryDataSaver, StateValue};
//!
//! #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
//! struct Profile {
//!     name: String,
//!     age: u32,
//! }
//!
//! impl StateValue for Profile {}
//!
//! fn main() -> univrs_datasaver::Result<()> {
//!     ConverterRegistry::global().register_json::<Profile>();
//!
//!     let store = Arc::new(MemoryDataSaver::new());
//!     let initial = Profile { name: "anon".into(), age: 0 };
//!     let profile = create_cell(store, "profile", initial, CellOptions::default())?;
//!     profile.set(Profile { name: "ada".into(), age: 36 })?;
//!     Ok(())
//! }
//! ```
//!
//! ## Lists
//!
//! ```rust
//! use std::sync::Arc;
//! use univrs_datasaver::{create_list_cell, CellOptions, DataSaver, MemoryDataSaver, PrimitiveValue};
//!
//! fn main() -> univrs_datasaver::Result<()> {
//!     let store = Arc::new(MemoryDataSaver::new());
//!     let tags = create_list_cell(store.clone(), "tags", Vec::<String>::new(), CellOptions::default())?;
//!
//!     tags.set(vec!["red".to_string(), "blue".to_string()])?;
//!     assert_eq!(
//!         store.read_data("tags", PrimitiveValue::Str(String::new()))?,
//!         PrimitiveValue::Str("[red#@#blue]".to_string())
//!     );
//!     Ok(())
//! }
//! ```

pub mod cell;
pub mod config;
pub mod converter;
pub mod encrypted;
pub mod error;
pub mod file;
pub mod list_state;
pub mod memory;
pub mod scope;
pub mod sqlite;
pub mod state;
pub mod store;
pub mod value;
pub mod watch;

use std::fmt;
use std::sync::Arc;

// Re-export main types
pub use cell::{CellOptions, SavePolicy};
pub use config::{SaverConfig, DEFAULT_LIST_SEPARATOR};
pub use converter::{ConverterRegistry, TypeConverter, TypedConverter};
pub use encrypted::EncryptedFileDataSaver;
pub use error::{Action, Result, SaverError};
pub use file::FileDataSaver;
pub use list_state::{decode_list, encode_list, DataSaverListState};
pub use memory::MemoryDataSaver;
pub use scope::{SaveHandle, SaveScope};
pub use sqlite::SqliteDataSaver;
pub use state::DataSaverState;
pub use store::{DataSaver, MAX_KEY_LENGTH};
pub use value::{PrimitiveKind, PrimitiveValue, StateValue};
pub use watch::{ChangeEvent, ChangeKind, ChangeStream};

/// Create a typed state cell bound to `key` of `adapter`.
pub fn create_cell<T: StateValue>(
    adapter: Arc<dyn DataSaver>,
    key: impl Into<String>,
    initial: T,
    options: CellOptions,
) -> Result<DataSaverState<T>> {
    DataSaverState::new(adapter, key, initial, options)
}

/// Create a list state cell bound to `key` of `adapter`.
pub fn create_list_cell<T: StateValue>(
    adapter: Arc<dyn DataSaver>,
    key: impl Into<String>,
    initial: Vec<T>,
    options: CellOptions,
) -> Result<DataSaverListState<T>> {
    DataSaverListState::new(adapter, key, initial, options)
}

/// Register a converter on the process-wide registry.
///
/// Call at startup, before creating any cell of type `T`.
pub fn register_converter<T, E>(
    accepts: impl Fn(&T) -> bool + Send + Sync + 'static,
    serialize: impl Fn(&T) -> String + Send + Sync + 'static,
    deserialize: impl Fn(&str) -> std::result::Result<T, E> + Send + Sync + 'static,
) where
    T: Send + Sync + 'static,
    E: fmt::Display,
{
    ConverterRegistry::global().register_when(accepts, serialize, deserialize);
}

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::cell::{CellOptions, SavePolicy};
    pub use crate::converter::{ConverterRegistry, TypedConverter};
    pub use crate::encrypted::EncryptedFileDataSaver;
    pub use crate::error::{Result, SaverError};
    pub use crate::file::FileDataSaver;
    pub use crate::list_state::DataSaverListState;
    pub use crate::memory::MemoryDataSaver;
    pub use crate::sqlite::SqliteDataSaver;
    pub use crate::state::DataSaverState;
    pub use crate::store::DataSaver;
    pub use crate::value::{PrimitiveValue, StateValue};
    pub use crate::{create_cell, create_list_cell, register_converter};
}
