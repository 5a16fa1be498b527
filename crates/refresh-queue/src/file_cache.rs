use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tempfile::NamedTempFile;

/// Durable load/save of a JSON-serializable value at a configured file path.
///
/// This is a dumb blob store: it knows nothing about cache semantics beyond
/// "read the whole file" and "replace the whole file". Both directions are
/// best effort and never fail outward; a missing, unreadable or malformed
/// file loads as nothing, and a failed write is logged and dropped. The
/// in-memory state of the caller stays authoritative either way.
///
/// Constructed without a path, every operation is a no-op, which makes
/// persistence opt-in per queue instance.
#[derive(Debug, Clone)]
pub struct FileCache {
    path: Option<PathBuf>,
    parse_big_numbers: bool,
}

impl FileCache {
    /// Creates a store for the given path.
    ///
    /// With `parse_big_numbers` enabled, loading re-hydrates serialized
    /// big-number objects (`{"type": "BigNumber", "hex": "0x…"}`) into plain
    /// JSON numbers before deserializing into the target type.
    pub fn new(path: Option<PathBuf>, parse_big_numbers: bool) -> Self {
        FileCache {
            path,
            parse_big_numbers,
        }
    }

    /// Log tag derived from the file name.
    fn tag(&self) -> &str {
        self.path
            .as_deref()
            .and_then(Path::file_stem)
            .and_then(OsStr::to_str)
            .unwrap_or("file-cache")
    }

    /// Reads and deserializes the persisted value.
    ///
    /// Returns `None` when no path is configured, the file does not exist,
    /// or its contents cannot be parsed. Failures are logged, never raised.
    pub fn load<T: DeserializeOwned>(&self) -> Option<T> {
        let path = self.path.as_deref()?;
        match self.try_load(path) {
            Ok(value) => Some(value),
            Err(error) => {
                tracing::error!(
                    tag = self.tag(),
                    error = format!("{error:#}"),
                    "failed to load file cache"
                );
                None
            }
        }
    }

    fn try_load<T: DeserializeOwned>(&self, path: &Path) -> Result<T> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;

        let value = if self.parse_big_numbers {
            let mut value: Value = serde_json::from_str(&raw).context("invalid cache file")?;
            parse_big_numbers(&mut value);
            serde_json::from_value(value)
        } else {
            serde_json::from_str(&raw)
        };

        value.context("cache file does not match the expected layout")
    }

    /// Serializes and writes the value, replacing the previous file.
    ///
    /// Write failures are logged and swallowed; the next successful save
    /// self-heals.
    pub fn save<T: Serialize>(&self, value: &T) {
        let Some(path) = self.path.as_deref() else {
            return;
        };
        if let Err(error) = try_save(path, value) {
            tracing::error!(
                tag = self.tag(),
                error = format!("{error:#}"),
                "failed to write file cache"
            );
        }
    }
}

/// Writes through a sibling temp file and atomically moves it over the
/// destination, so a crash mid-write cannot leave a truncated cache file.
fn try_save<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .context("cache file path has no parent directory")?;
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create cache directory {}", dir.display()))?;

    let mut temp_file = NamedTempFile::new_in(dir).context("failed to create temp file")?;
    serde_json::to_writer(&mut temp_file, value).context("failed to serialize cache")?;
    temp_file
        .persist(path)
        .with_context(|| format!("failed to persist {}", path.display()))?;

    Ok(())
}

/// Re-hydrates serialized big-number objects inside a JSON value, in place.
///
/// Any object of the shape `{"type": "BigNumber", "hex": "0x…"}` whose
/// magnitude fits a JSON number is replaced by that number. The walk recurses
/// over the values of objects only; array elements are intentionally left
/// untouched, and values too large for a JSON number stay in their raw form.
pub(crate) fn parse_big_numbers(value: &mut Value) {
    if let Some(number) = as_big_number(value) {
        *value = number;
        return;
    }

    if let Value::Object(map) = value {
        for entry in map.values_mut() {
            parse_big_numbers(entry);
        }
    }
}

fn as_big_number(value: &Value) -> Option<Value> {
    let map = value.as_object()?;
    if map.get("type")?.as_str()? != "BigNumber" {
        return None;
    }
    let hex = map.get("hex")?.as_str()?;

    // ethers serializes signed values as "-0x…"
    let (negative, magnitude) = match hex.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, hex),
    };
    let magnitude = u128::from_str_radix(magnitude.strip_prefix("0x")?, 16).ok()?;

    let number = if negative {
        serde_json::Number::from(-i64::try_from(magnitude).ok()?)
    } else {
        serde_json::Number::from(u64::try_from(magnitude).ok()?)
    };
    Some(Value::Number(number))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn tempdir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir();
        let path = dir.path().join("upstream-cache.json");

        let store = FileCache::new(Some(path), false);
        let value = json!({"a": {"data": {"x": 1}, "updatedAt": "2024-05-01T00:00:00Z"}});
        store.save(&value);

        let loaded: Value = store.load().unwrap();
        assert_eq!(loaded, value);
    }

    #[test]
    fn test_save_creates_missing_directories() {
        let dir = tempdir();
        let path = dir.path().join("nested/deeper/cache.json");

        let store = FileCache::new(Some(path), false);
        store.save(&json!({"k": 1}));

        assert_eq!(store.load::<Value>().unwrap(), json!({"k": 1}));
    }

    #[test]
    fn test_missing_file_loads_as_none() {
        let dir = tempdir();
        let store = FileCache::new(Some(dir.path().join("nope.json")), false);
        assert_eq!(store.load::<Value>(), None);
    }

    #[test]
    fn test_corrupt_file_loads_as_none() {
        let dir = tempdir();
        let path = dir.path().join("corrupt.json");
        fs::write(&path, b"{not json").unwrap();

        let store = FileCache::new(Some(path), false);
        assert_eq!(store.load::<Value>(), None);
    }

    #[test]
    fn test_disabled_store_is_a_noop() {
        let store = FileCache::new(None, false);
        store.save(&json!({"k": 1}));
        assert_eq!(store.load::<Value>(), None);
    }

    #[test]
    fn test_big_number_rehydration() {
        let mut value = json!({
            "balance": {"type": "BigNumber", "hex": "0x1a"},
            "nested": {"supply": {"type": "BigNumber", "hex": "0xff"}},
            "debt": {"type": "BigNumber", "hex": "-0x05"},
            "plain": 7,
        });
        parse_big_numbers(&mut value);

        assert_eq!(
            value,
            json!({
                "balance": 26,
                "nested": {"supply": 255},
                "debt": -5,
                "plain": 7,
            })
        );
    }

    #[test]
    fn test_big_number_root_value() {
        let mut value = json!({"type": "BigNumber", "hex": "0x10"});
        parse_big_numbers(&mut value);
        assert_eq!(value, json!(16));
    }

    #[test]
    fn test_big_numbers_inside_arrays_stay_raw() {
        // Known limitation carried over from the original walk: arrays are
        // not descended into.
        let raw = json!([{"type": "BigNumber", "hex": "0x1a"}]);
        let mut value = json!({"list": raw.clone()});
        parse_big_numbers(&mut value);
        assert_eq!(value, json!({"list": raw}));
    }

    #[test]
    fn test_oversized_big_number_stays_raw() {
        let raw = json!({"type": "BigNumber", "hex": "0xffffffffffffffffff"});
        let mut value = json!({"huge": raw.clone()});
        parse_big_numbers(&mut value);
        assert_eq!(value, json!({"huge": raw}));
    }

    #[test]
    fn test_load_with_big_number_parsing() {
        let dir = tempdir();
        let path = dir.path().join("bn.json");
        fs::write(
            &path,
            br#"{"total": {"type": "BigNumber", "hex": "0x64"}}"#,
        )
        .unwrap();

        let store = FileCache::new(Some(path), true);
        let loaded: Value = store.load().unwrap();
        assert_eq!(loaded, json!({"total": 100}));
    }
}
