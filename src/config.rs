//! Runtime configuration for adapters and cells.

use serde::Deserialize;
use std::path::Path;

use crate::error::{Result, SaverError};
use crate::watch::DEFAULT_CHANGE_CAPACITY;

/// Separator between list elements in the list encoding.
///
/// Not `,`, which shows up inside JSON-serialized elements.
pub const DEFAULT_LIST_SEPARATOR: &str = "#@#";

/// Settings shared by adapters and cells.
///
/// ```rust
/// use univrs_datasaver::SaverConfig;
///
/// let config = SaverConfig::from_toml_str(r#"
///     list_separator = "|;|"
///     sense_external_change = true
/// "#).unwrap();
/// assert_eq!(config.list_separator, "|;|");
/// assert_eq!(config.change_capacity, 1024);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SaverConfig {
    /// Separator used by the list encoding.
    pub list_separator: String,
    /// Capacity of each adapter's change broadcast.
    pub change_capacity: usize,
    /// Whether adapters built from this config publish change events.
    pub sense_external_change: bool,
}

impl Default for SaverConfig {
    fn default() -> Self {
        Self {
            list_separator: DEFAULT_LIST_SEPARATOR.to_string(),
            change_capacity: DEFAULT_CHANGE_CAPACITY,
            sense_external_change: false,
        }
    }
}

impl SaverConfig {
    /// Parse a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: SaverConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    fn validate(&self) -> Result<()> {
        if self.list_separator.is_empty() {
            return Err(SaverError::Config(
                "list_separator cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}
