//! File-backed tiered state store.
//!
//! Layout:
//! ```text
//! world.json               - hot payload + `_cold_refs`
//! world_history/
//!   cold_latest.json       - full snapshot of the cold fields
//!   turn_0001.json ...     - per-turn cold diffs
//! ```

use crate::config::StoreConfig;
use crate::mirror::{MirrorError, RelationalMirror, SyncReport};
use crate::snapshot::{
    diff_file_name, diff_turns_in, read_json, write_json_atomic, ColdRefs, ColdSnapshot,
    TurnDiff, COLD_REFS_KEY, COLD_SNAPSHOT_FILE,
};
use saga_common::{Map, Turn, Value};
use saga_kernel::diff::PATH_SEPARATOR;
use saga_kernel::{apply, compute_maps, IgnoreKeys, MigrationRegistry, SCHEMA_VERSION_KEY};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Top-level key of the monotonic turn counter.
pub const TURN_KEY: &str = "turn";

/// Errors from store write paths. Reads never fail; they degrade to defaults.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("relational mirror: {0}")]
    Mirror(#[from] MirrorError),
}

/// Durable store for one canonical state tree.
///
/// Cold fields are persisted as a snapshot plus per-turn diffs; everything
/// else is rewritten whole on each persist.
pub struct TieredStateStore {
    config: StoreConfig,
    history_dir: PathBuf,
    migrations: Arc<MigrationRegistry>,
    tree: Map,
    /// Cold subset as last persisted or hydrated; diffs are computed from it.
    cold_baseline: Map,
    cold_refs: Option<ColdRefs>,
    /// Turn recorded in the full cold snapshot on disk.
    snapshot_turn: Option<Turn>,
    last_persisted_turn: Option<Turn>,
    mirror: Option<RelationalMirror>,
}

impl std::fmt::Debug for TieredStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredStateStore")
            .field("path", &self.config.path)
            .field("turn", &self.turn())
            .field("snapshot_turn", &self.snapshot_turn)
            .field("mirror", &self.mirror)
            .finish_non_exhaustive()
    }
}

impl TieredStateStore {
    /// Open a store with the standard migrations.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        Self::open_with(config, Arc::new(MigrationRegistry::standard()))
    }

    /// Open a store with an injected migration registry.
    ///
    /// Only opening the relational mirror can fail; an unreadable main file
    /// yields the default tree.
    pub fn open_with(
        config: StoreConfig,
        migrations: Arc<MigrationRegistry>,
    ) -> Result<Self, StoreError> {
        let mirror = config
            .mirror
            .as_ref()
            .map(RelationalMirror::open)
            .transpose()?;
        let history_dir = config.resolved_history_dir();
        let mut store = Self {
            config,
            history_dir,
            migrations,
            tree: Map::new(),
            cold_baseline: Map::new(),
            cold_refs: None,
            snapshot_turn: None,
            last_persisted_turn: None,
            mirror,
        };
        store.load();
        Ok(store)
    }

    /// The built-in tree used when nothing usable is on disk.
    pub fn default_tree(migrations: &MigrationRegistry) -> Map {
        let mut tree = Map::new();
        migrations.migrate(&mut tree);
        tree
    }

    /// Reload from disk, replacing the in-memory tree.
    pub fn load(&mut self) {
        let _span = tracing::info_span!("store_load", path = %self.config.path.display()).entered();

        let mut tree = self.read_primary().unwrap_or_default();
        self.cold_refs = None;
        self.snapshot_turn = None;
        self.last_persisted_turn = None;

        let refs = tree.remove(COLD_REFS_KEY).and_then(|v| {
            let parsed = ColdRefs::from_value(v);
            if parsed.is_none() {
                tracing::warn!("malformed cold reference block ignored");
            }
            parsed
        });
        if let Some(refs) = refs {
            let cold = self.hydrate_cold(&refs);
            tree.extend(cold);
            self.last_persisted_turn = Some(refs.latest_turn);
            if refs.latest_turn > turn_of(&tree) {
                tree.insert(TURN_KEY.to_string(), turn_value(refs.latest_turn));
            }
            self.cold_refs = Some(refs);
        }

        let ran = self.migrations.migrate(&mut tree);
        self.cold_baseline = self.cold_subset(&tree);
        tracing::info!(
            turn = turn_of(&tree),
            keys = tree.len(),
            migrations = ran,
            cold = self.cold_baseline.len(),
            "state loaded"
        );
        self.tree = tree;
    }

    fn read_primary(&self) -> Option<Map> {
        let path = &self.config.path;
        match read_json::<Value>(path) {
            Ok(Value::Map(map)) => Some(map),
            Ok(other) => {
                tracing::warn!(
                    found = other.type_name(),
                    "state file is not an object, using defaults"
                );
                None
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!(path = %path.display(), "no state file yet, using defaults");
                None
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "state file unreadable, using defaults"
                );
                None
            }
        }
    }

    /// Rebuild the cold fields from the snapshot plus the diffs after it.
    fn hydrate_cold(&mut self, refs: &ColdRefs) -> Map {
        let dir = refs.resolve_dir(&self.config.parent_dir());
        let snapshot_path = dir.join(&refs.snapshot);
        let (mut cold, base_turn) = match read_json::<ColdSnapshot>(&snapshot_path) {
            Ok(snap) => {
                self.snapshot_turn = Some(snap.turn);
                (snap.state, snap.turn)
            }
            Err(e) => {
                tracing::warn!(
                    path = %snapshot_path.display(),
                    error = %e,
                    "cold snapshot unavailable, replaying diffs from empty"
                );
                (Map::new(), 0)
            }
        };

        for turn in diff_turns_in(&dir, base_turn, refs.latest_turn) {
            let path = dir.join(diff_file_name(turn));
            let record = match read_json::<TurnDiff>(&path) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(turn, error = %e, "skipping unreadable cold diff");
                    continue;
                }
            };
            // Apply to a scratch copy so a bad entry cannot leave a half-applied diff.
            let mut next = cold.clone();
            match apply(&mut next, &record.diff) {
                Ok(()) => {
                    tracing::trace!(turn, entries = record.diff.len(), "replayed cold diff");
                    cold = next;
                }
                Err(e) => tracing::warn!(turn, error = %e, "skipping inconsistent cold diff"),
            }
        }
        cold
    }

    /// Durably save `state`, resyncing every mirror group.
    pub fn persist(&mut self, state: &Map) -> Result<(), StoreError> {
        self.persist_inner(state, None)
    }

    /// Durably save `state`; the mirror only rebuilds groups fed by `changed`.
    pub fn persist_changed(&mut self, state: &Map, changed: &[String]) -> Result<(), StoreError> {
        self.persist_inner(state, Some(changed))
    }

    fn persist_inner(&mut self, state: &Map, changed: Option<&[String]>) -> Result<(), StoreError> {
        let mut next = state.clone();
        if next.remove(COLD_REFS_KEY).is_some() {
            tracing::warn!("reserved key {COLD_REFS_KEY} stripped from persisted state");
        }
        let version = saga_kernel::migrate::version_of(&next).max(self.migrations.target_version());
        next.insert(SCHEMA_VERSION_KEY.to_string(), Value::Int(i64::from(version)));
        let turn = turn_of(&next);
        let _span = tracing::info_span!("store_persist", turn).entered();

        // The JSON write below must happen whatever the mirror does.
        let mirrored: Result<Option<SyncReport>, MirrorError> = match self.mirror.as_mut() {
            Some(mirror) => mirror.sync(&next, changed).map(Some),
            None => Ok(None),
        };
        if let Err(e) = &mirrored {
            tracing::warn!(error = %e, "mirror sync rolled back");
        }

        let cold = self.cold_subset(&next);
        let refs = if cold.is_empty() {
            self.snapshot_turn = None;
            None
        } else {
            Some(self.write_cold(turn, &cold)?)
        };

        let mut hot: Map = next
            .iter()
            .filter(|(k, _)| !self.config.is_cold(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(refs) = &refs {
            hot.insert(COLD_REFS_KEY.to_string(), refs.to_value());
        }
        write_json_atomic(&self.config.path, &hot)?;

        tracing::debug!(
            hot = hot.len(),
            cold = cold.len(),
            snapshot_turn = ?self.snapshot_turn,
            "state persisted"
        );
        self.tree = next;
        self.cold_baseline = cold;
        self.cold_refs = refs;
        self.last_persisted_turn = Some(turn);

        if let Some(report) = mirrored? {
            tracing::trace!(groups = report.groups.len(), rows = report.rows, "mirror synced");
        }
        Ok(())
    }

    /// Write the diff for `turn` and, when due, a fresh full snapshot.
    fn write_cold(&mut self, turn: Turn, cold: &Map) -> Result<ColdRefs, StoreError> {
        std::fs::create_dir_all(&self.history_dir).map_err(|source| StoreError::CreateDir {
            path: self.history_dir.clone(),
            source,
        })?;

        let exact = compute_maps(&self.cold_baseline, cold, &IgnoreKeys::none());
        let diff: Vec<_> = exact
            .iter()
            .filter(|e| !mentions_ignored(&e.path, &self.config.ignore_keys))
            .cloned()
            .collect();

        let advanced = self.last_persisted_turn.is_none_or(|last| turn > last);
        if advanced {
            if let Some(last) = self.last_persisted_turn {
                // Turns skipped since the last persist must not replay stale files.
                self.remove_diffs(last, turn.saturating_sub(1));
            }
        }

        let diff_path = self.history_dir.join(diff_file_name(turn));
        let latest_diff = if diff.is_empty() {
            remove_if_present(&diff_path);
            None
        } else {
            write_json_atomic(&diff_path, &TurnDiff { turn, diff: diff.clone() })?;
            Some(diff_file_name(turn))
        };

        let interval = self.config.snapshot_interval.max(1);
        let snapshot_due = match self.snapshot_turn {
            None => true,
            // Re-persisting a turn would overwrite a diff that replay depends on.
            Some(_) if !advanced => true,
            // Ignored keys are absent from the diff, so only a snapshot keeps them.
            Some(_) if diff.len() != exact.len() => true,
            Some(base) => turn.saturating_sub(base) >= interval,
        };
        if snapshot_due {
            let snapshot = ColdSnapshot {
                turn,
                state: cold.clone(),
            };
            write_json_atomic(&self.history_dir.join(COLD_SNAPSHOT_FILE), &snapshot)?;
            self.snapshot_turn = Some(turn);
            tracing::debug!(turn, "cold snapshot written");
        }

        Ok(ColdRefs {
            history_dir: self.history_dir_ref(),
            snapshot: COLD_SNAPSHOT_FILE.to_string(),
            latest_turn: turn,
            latest_diff,
        })
    }

    fn remove_diffs(&self, after: Turn, through: Turn) {
        for stale in diff_turns_in(&self.history_dir, after, through) {
            remove_if_present(&self.history_dir.join(diff_file_name(stale)));
        }
    }

    /// History dir as written into the refs block: relative when it sits
    /// beside the main file.
    fn history_dir_ref(&self) -> String {
        let parent = self.config.parent_dir();
        match self.history_dir.strip_prefix(&parent) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel.display().to_string(),
            _ => self.history_dir.display().to_string(),
        }
    }

    fn cold_subset(&self, tree: &Map) -> Map {
        tree.iter()
            .filter(|(k, _)| self.config.is_cold(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Deep copy of the current tree. Later store mutations never show through.
    pub fn snapshot(&self) -> Map {
        self.tree.clone()
    }

    /// Current turn counter.
    pub fn turn(&self) -> Turn {
        turn_of(&self.tree)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn history_dir(&self) -> &Path {
        &self.history_dir
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Cold reference block written by the last persist or found on load.
    pub fn cold_refs(&self) -> Option<&ColdRefs> {
        self.cold_refs.as_ref()
    }

    pub fn mirror(&self) -> Option<&RelationalMirror> {
        self.mirror.as_ref()
    }
}

/// Turn counter of a tree, 0 when absent or not a non-negative integer.
pub fn turn_of(tree: &Map) -> Turn {
    tree.get(TURN_KEY)
        .and_then(Value::as_i64)
        .and_then(|t| Turn::try_from(t).ok())
        .unwrap_or(0)
}

fn turn_value(turn: Turn) -> Value {
    Value::Int(i64::try_from(turn).unwrap_or(i64::MAX))
}

fn mentions_ignored(path: &str, ignore: &IgnoreKeys) -> bool {
    path.split(PATH_SEPARATOR).any(|segment| ignore.contains(segment))
}

fn remove_if_present(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::trace!(path = %path.display(), "removed stale cold diff"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot remove stale cold diff")
        }
    }
}
