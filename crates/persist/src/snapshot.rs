//! On-disk cold artifacts and atomic JSON I/O.
//!
//! Layout inside the history directory:
//! ```text
//! cold_latest.json   - {turn, state}: full cold-field snapshot
//! turn_0007.json     - {turn, diff}: cold diff written at turn 7
//! ```

use saga_common::{Map, Turn, Value};
use saga_kernel::DiffEntry;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Reserved top-level key in the main file pointing at cold artifacts.
pub const COLD_REFS_KEY: &str = "_cold_refs";

/// File name of the full cold snapshot.
pub const COLD_SNAPSHOT_FILE: &str = "cold_latest.json";

/// Full cold-field snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColdSnapshot {
    pub turn: Turn,
    pub state: Map,
}

/// Cold diff recorded at one turn, relative to the previously persisted cold state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnDiff {
    pub turn: Turn,
    pub diff: Vec<DiffEntry>,
}

/// Reference block stored in the main file when cold data exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColdRefs {
    pub history_dir: String,
    pub snapshot: String,
    pub latest_turn: Turn,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_diff: Option<String>,
}

impl ColdRefs {
    /// Parse a refs block out of a loaded tree value.
    pub fn from_value(value: Value) -> Option<Self> {
        let json: serde_json::Value = value.into();
        serde_json::from_value(json).ok()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self)
            .map(Value::from)
            .unwrap_or(Value::Null)
    }

    /// History directory, resolving relative paths against `base`.
    pub fn resolve_dir(&self, base: &Path) -> PathBuf {
        let dir = PathBuf::from(&self.history_dir);
        if dir.is_absolute() {
            dir
        } else {
            base.join(dir)
        }
    }
}

/// File name of the diff written at `turn`.
pub fn diff_file_name(turn: Turn) -> String {
    format!("turn_{turn:04}.json")
}

/// Inverse of [`diff_file_name`].
pub fn parse_diff_file_name(name: &str) -> Option<Turn> {
    name.strip_prefix("turn_")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

/// Diff files in `dir` whose turn lies in `(after, through]`, ascending.
///
/// An unreadable directory yields an empty list.
pub fn diff_turns_in(dir: &Path, after: Turn, through: Turn) -> Vec<Turn> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "cannot list history directory");
            return Vec::new();
        }
    };
    let mut turns: Vec<Turn> = entries
        .filter_map(Result::ok)
        .filter_map(|e| parse_diff_file_name(&e.file_name().to_string_lossy()))
        .filter(|t| *t > after && *t <= through)
        .collect();
    turns.sort_unstable();
    turns
}

/// Serialize `value` to `path` without ever exposing a partially written file.
///
/// Writes a sibling temp file, syncs it, then renames over the target.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> std::io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

/// Read and parse a JSON file.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ReadError> {
    let bytes = std::fs::read(path)?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(ReadError::Empty);
    }
    Ok(serde_json::from_slice(&bytes)?)
}

/// Why a JSON artifact could not be read.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("file is empty")]
    Empty,
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ReadError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ReadError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn diff_file_names_roundtrip() {
        assert_eq!(diff_file_name(7), "turn_0007.json");
        assert_eq!(diff_file_name(12345), "turn_12345.json");
        assert_eq!(parse_diff_file_name("turn_0007.json"), Some(7));
        assert_eq!(parse_diff_file_name("turn_12345.json"), Some(12345));
        assert_eq!(parse_diff_file_name("cold_latest.json"), None);
        assert_eq!(parse_diff_file_name("turn_x.json"), None);
    }

    #[test]
    fn atomic_write_replaces_content() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        write_json_atomic(&path, &json!({"a": 1})).unwrap();
        write_json_atomic(&path, &json!({"b": 2})).unwrap();
        let back: serde_json::Value = read_json(&path).unwrap();
        assert_eq!(back, json!({"b": 2}));
        assert!(!tmp.path().join("state.json.tmp").exists());
    }

    #[test]
    fn read_json_classifies_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = read_json::<serde_json::Value>(&tmp.path().join("nope.json")).unwrap_err();
        assert!(missing.is_not_found());

        let empty = tmp.path().join("empty.json");
        std::fs::write(&empty, "  \n").unwrap();
        assert!(matches!(
            read_json::<serde_json::Value>(&empty),
            Err(ReadError::Empty)
        ));

        let garbage = tmp.path().join("garbage.json");
        std::fs::write(&garbage, b"\x00\xffnot json").unwrap();
        assert!(matches!(
            read_json::<serde_json::Value>(&garbage),
            Err(ReadError::Json(_))
        ));
    }

    #[test]
    fn diff_turns_in_filters_and_sorts() {
        let tmp = tempfile::tempdir().unwrap();
        for t in [9, 2, 5, 3] {
            std::fs::write(tmp.path().join(diff_file_name(t)), "{}").unwrap();
        }
        std::fs::write(tmp.path().join(COLD_SNAPSHOT_FILE), "{}").unwrap();
        assert_eq!(diff_turns_in(tmp.path(), 2, 9), vec![3, 5, 9]);
        assert!(diff_turns_in(&tmp.path().join("absent"), 0, 100).is_empty());
    }

    #[test]
    fn cold_refs_value_roundtrip() {
        let refs = ColdRefs {
            history_dir: "world_history".into(),
            snapshot: COLD_SNAPSHOT_FILE.into(),
            latest_turn: 4,
            latest_diff: None,
        };
        let value = refs.to_value();
        assert!(value.get("latest_diff").is_none());
        assert_eq!(ColdRefs::from_value(value), Some(refs));
        assert_eq!(ColdRefs::from_value(Value::from("junk")), None);
    }
}
