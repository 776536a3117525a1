use saga_common::Turn;
use serde::{Deserialize, Serialize};

/// Archive policy. The defaults match the cadence the engine was tuned for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Turns `1..=W` keep a full state copy; later turns keep only the delta.
    pub full_state_window: Turn,
    /// A summary checkpoint is built on every positive multiple of this.
    pub archive_interval: Turn,
    /// Injection happens at most once per bucket of this many turns.
    pub injection_bucket: Turn,
    /// `H`: per-entity status cap. Events are capped at `3H`, trend at `2H`.
    pub max_recent_history: usize,
    /// Event log entries kept by `compact`.
    pub compact_event_keep: usize,
    /// Events longer than this many characters count as major.
    pub major_event_min_len: usize,
    /// Run `compact` after every recorded turn with this byte threshold.
    pub auto_compact_bytes: Option<usize>,
    /// Scalar sampled into the trend timeline each turn.
    pub trend_key: String,
    /// Map of tracked entities in the full state.
    pub entities_key: String,
    /// Delta key listing newly set flags (list of names, or map of name to value).
    pub flags_key: String,
    /// Delta key listing this turn's notable events.
    pub events_key: String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            full_state_window: 5,
            archive_interval: 10,
            injection_bucket: 8,
            max_recent_history: 10,
            compact_event_keep: 50,
            major_event_min_len: 40,
            auto_compact_bytes: Some(4 * 1024 * 1024),
            trend_key: "threat_level".to_string(),
            entities_key: "npcs".to_string(),
            flags_key: "flags_added".to_string(),
            events_key: "recent_events".to_string(),
        }
    }
}

impl ArchiveConfig {
    pub fn event_cap(&self) -> usize {
        self.max_recent_history * 3
    }

    pub fn trend_cap(&self) -> usize {
        self.max_recent_history * 2
    }

    pub fn status_cap(&self) -> usize {
        self.max_recent_history
    }

    /// Whether `turn` is a summary checkpoint.
    pub fn is_checkpoint(&self, turn: Turn) -> bool {
        self.archive_interval > 0 && turn > 0 && turn % self.archive_interval == 0
    }
}
