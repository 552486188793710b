// Dynamic device-option store.
//
// Options are the knobs the recorder can change at runtime (broadcast
// intervals, transfer sizes, ignore lists). They are identified by stable
// property keys, held in a concurrent map, and persisted to a single
// properties file of `key=value` lines. The store is an explicit value handed
// to the components that need it; there is no process-wide instance.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OptionError {
    #[error("option '{key}' value {value} is out of range [{min}, {max}]")]
    OutOfRange {
        key: String,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("option '{key}' value '{value}' is not valid")]
    InvalidValue { key: String, value: String },

    #[error("unknown option '{0}'")]
    UnknownKey(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Concurrent key/value store with typed accessors and properties-file
/// persistence. Values are stored as strings; the typed getters parse on the
/// way out so a hand-edited file degrades to the default instead of failing.
pub struct OptionStore {
    path: Option<PathBuf>,
    values: DashMap<String, String>,
}

impl OptionStore {
    /// Store with no backing file. `save` is a no-op; used by tests and
    /// anywhere persistence is not wanted.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            values: DashMap::new(),
        }
    }

    /// Loads the properties file at `path`, tolerating a missing file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, OptionError> {
        let path = path.as_ref().to_path_buf();
        let values = DashMap::new();
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                for line in text.lines() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    if let Some((key, value)) = line.split_once('=') {
                        values.insert(key.trim().to_string(), value.trim().to_string());
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Self {
            path: Some(path),
            values,
        })
    }

    /// Writes all options back out, sorted by key. Round-trip idempotent.
    pub fn save(&self) -> Result<(), OptionError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut entries: Vec<(String, String)> = self
            .values
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        entries.sort();
        let mut text = String::new();
        for (key, value) in entries {
            let _ = writeln!(text, "{key}={value}");
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Raw string form of an option, if present.
    pub fn get_raw(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.value().clone())
    }

    /// Point update without validation or persistence; the caller decides
    /// when to `save`.
    pub fn set_raw(&self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.values
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn set_bool(&self, key: &str, value: bool) {
        self.set_raw(key, if value { "true" } else { "false" });
    }

    /// Integer option with an allowed range. A missing or unparsable value
    /// falls back to `default`; a present value outside the range is a
    /// configuration error the caller must handle.
    pub fn get_integer(
        &self,
        key: &str,
        default: i64,
        min: i64,
        max: i64,
    ) -> Result<i64, OptionError> {
        let value = self
            .values
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default);
        if value < min || value > max {
            return Err(OptionError::OutOfRange {
                key: key.to_string(),
                value,
                min,
                max,
            });
        }
        Ok(value)
    }

    pub fn set_integer(&self, key: &str, value: i64, min: i64, max: i64) -> Result<(), OptionError> {
        if value < min || value > max {
            return Err(OptionError::OutOfRange {
                key: key.to_string(),
                value,
                min,
                max,
            });
        }
        self.set_raw(key, &value.to_string());
        Ok(())
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.values
            .get(key)
            .map(|v| v.value().clone())
            .unwrap_or_else(|| default.to_string())
    }

    pub fn set_string(&self, key: &str, value: &str) {
        self.set_raw(key, value);
    }

    /// Comma-separated string array; empty entries are dropped.
    pub fn get_string_array(&self, key: &str) -> Vec<String> {
        self.values
            .get(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_string_array(&self, key: &str, values: &[String]) {
        self.set_raw(key, &values.join(","));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_accessors_parse_and_default() {
        let store = OptionStore::in_memory();
        assert!(store.get_bool("missing", true));
        assert_eq!(store.get_integer("missing", 58, 0, 3600).unwrap(), 58);
        assert_eq!(store.get_string("missing", "x"), "x");
        assert!(store.get_string_array("missing").is_empty());

        store.set_bool("a.bool", false);
        store.set_integer("a.int", 100, 0, 1000).unwrap();
        store.set_string_array(
            "a.list",
            &["one".to_string(), "two".to_string()],
        );
        assert!(!store.get_bool("a.bool", true));
        assert_eq!(store.get_integer("a.int", 0, 0, 1000).unwrap(), 100);
        assert_eq!(store.get_string_array("a.list"), vec!["one", "two"]);
    }

    #[test]
    fn out_of_range_is_reported_and_value_unchanged() {
        let store = OptionStore::in_memory();
        store.set_raw("port", "99");
        assert!(matches!(
            store.get_integer("port", 7818, 1024, 65535),
            Err(OptionError::OutOfRange { .. })
        ));
        assert!(store.set_integer("port", 70000, 1024, 65535).is_err());
        assert_eq!(store.get_raw("port").as_deref(), Some("99"));
    }

    #[test]
    fn unparsable_values_degrade_to_the_default() {
        let store = OptionStore::in_memory();
        store.set_raw("interval", "soon");
        assert_eq!(store.get_integer("interval", 58, 0, 3600).unwrap(), 58);
    }

    #[test]
    fn persistence_round_trip_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.properties");

        let store = OptionStore::load(&path).unwrap();
        store.set_string("hdhr.static_addresses_csv", "192.168.1.50,192.168.1.51");
        store.set_bool("hdhr.smart_broadcast", true);
        store.set_integer("hdhr.broadcast_s", 58, 0, 3600).unwrap();
        store.save().unwrap();

        let first = std::fs::read_to_string(&path).unwrap();
        let reloaded = OptionStore::load(&path).unwrap();
        assert_eq!(
            reloaded.get_string_array("hdhr.static_addresses_csv"),
            vec!["192.168.1.50", "192.168.1.51"]
        );
        reloaded.save().unwrap();
        let second = std::fs::read_to_string(&path).unwrap();
        assert_eq!(first, second);
    }
}
