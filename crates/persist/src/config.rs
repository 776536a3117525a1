use saga_common::SessionId;
use saga_kernel::diff::DEFAULT_IGNORE_KEYS;
use saga_kernel::IgnoreKeys;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// History-shaped top-level keys written as snapshot + per-turn diffs.
pub const DEFAULT_COLD_FIELDS: &[&str] = &[
    "event_log",
    "entity_journals",
    "timeline",
    "recent_motifs",
    "hazard_log",
    "combat_log",
    "story_progress",
];

/// Tiered store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Main JSON file holding the hot payload.
    pub path: PathBuf,
    /// Directory for cold snapshots and diffs. Defaults to `<stem>_history`
    /// beside the main file.
    pub history_dir: Option<PathBuf>,
    /// Top-level keys treated as cold.
    pub cold_fields: Vec<String>,
    /// Keys never recorded in cold diff files.
    pub ignore_keys: IgnoreKeys,
    /// Turns between full cold snapshots. 1 writes a snapshot on every persist.
    pub snapshot_interval: u64,
    /// Relational mirror; disabled when absent.
    pub mirror: Option<MirrorConfig>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("world_state.json"),
            history_dir: None,
            cold_fields: DEFAULT_COLD_FIELDS.iter().map(|s| s.to_string()).collect(),
            ignore_keys: IgnoreKeys::new(DEFAULT_IGNORE_KEYS.iter().copied()),
            snapshot_interval: 1,
            mirror: None,
        }
    }
}

impl StoreConfig {
    /// Default configuration for a store backed by `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn with_mirror(mut self, mirror: MirrorConfig) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn with_snapshot_interval(mut self, turns: u64) -> Self {
        self.snapshot_interval = turns;
        self
    }

    /// Directory that receives cold artifacts.
    pub fn resolved_history_dir(&self) -> PathBuf {
        if let Some(dir) = &self.history_dir {
            return dir.clone();
        }
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state".to_string());
        self.parent_dir().join(format!("{stem}_history"))
    }

    /// Directory containing the main file; relative history paths resolve here.
    pub fn parent_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    pub fn is_cold(&self, key: &str) -> bool {
        self.cold_fields.iter().any(|f| f == key)
    }
}

/// Relational mirror configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// SQLite database file.
    pub path: PathBuf,
    /// Session whose rows this mirror owns.
    pub session_id: SessionId,
    /// Optional external schema applied before the built-in one.
    pub schema_path: Option<PathBuf>,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("world_mirror.db"),
            session_id: SessionId::from("default"),
            schema_path: None,
        }
    }
}

impl MirrorConfig {
    pub fn new(path: impl AsRef<Path>, session_id: SessionId) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            session_id,
            schema_path: None,
        }
    }
}
