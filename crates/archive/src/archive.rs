use crate::config::ArchiveConfig;
use crate::summary::{self, StatusEntry, SummaryView, TrendSample};
use saga_common::{Map, SessionId, Turn, Value};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, info_span};

/// Stable key for the summary built at `turn`.
pub fn checkpoint_key(turn: Turn) -> String {
    format!("checkpoint_{turn:06}")
}

/// Per-session long-horizon turn history.
///
/// `record_turn` is the only mutator of the recorded tiers. Full states are
/// kept for turns `1..=W` and never afterwards; every later turn keeps its
/// delta until `compact` clears them.
#[derive(Debug, Clone)]
pub struct TurnArchive {
    pub(crate) session_id: SessionId,
    pub(crate) config: ArchiveConfig,
    pub(crate) current_states: BTreeMap<Turn, Map>,
    pub(crate) recent_deltas: BTreeMap<Turn, Map>,
    pub(crate) summaries: BTreeMap<Turn, String>,
    pub(crate) event_log: Vec<String>,
    pub(crate) entity_status: BTreeMap<String, Vec<StatusEntry>>,
    pub(crate) trend: Vec<TrendSample>,
    pub(crate) last_turn: Turn,
    pub(crate) last_injected_bucket: Option<Turn>,
}

impl TurnArchive {
    pub fn new(session_id: SessionId, config: ArchiveConfig) -> Self {
        Self {
            session_id,
            config,
            current_states: BTreeMap::new(),
            recent_deltas: BTreeMap::new(),
            summaries: BTreeMap::new(),
            event_log: Vec::new(),
            entity_status: BTreeMap::new(),
            trend: Vec::new(),
            last_turn: 0,
            last_injected_bucket: None,
        }
    }

    /// Feed one turn into the archive.
    pub fn record_turn(&mut self, turn: Turn, full_state: &Map, delta: &Map) {
        let _span = info_span!("record_turn", session = %self.session_id, turn).entered();

        if let Some(value) = full_state.get(&self.config.trend_key).and_then(Value::as_f64) {
            self.trend.push(TrendSample { turn, value });
            truncate_front(&mut self.trend, self.config.trend_cap());
        }

        if let Some(entities) = full_state.get(&self.config.entities_key).and_then(Value::as_map) {
            let cap = self.config.status_cap();
            for (id, entity) in entities {
                let history = self.entity_status.entry(id.clone()).or_default();
                history.push(StatusEntry {
                    turn,
                    status: summary::status_line(turn, entity),
                });
                truncate_front(history, cap);
            }
        }

        let events = summary::extract_events(delta, &self.config);
        if !events.is_empty() {
            debug!(count = events.len(), "events logged");
            self.event_log.extend(events);
            truncate_front(&mut self.event_log, self.config.event_cap());
        }

        if turn <= self.config.full_state_window {
            self.current_states.insert(turn, full_state.clone());
        } else {
            self.recent_deltas.insert(turn, delta.clone());
        }
        self.last_turn = self.last_turn.max(turn);

        if self.config.is_checkpoint(turn) {
            let text = self.build_archive_summary(turn);
            info!(turn, bytes = text.len(), "archive checkpoint");
            self.summaries.insert(turn, text);
        }

        if let Some(max_bytes) = self.config.auto_compact_bytes {
            self.compact(max_bytes);
        }
    }

    /// Render the current signal as a summary for `turn`.
    pub fn build_archive_summary(&self, turn: Turn) -> String {
        SummaryView {
            turn,
            config: &self.config,
            events: &self.event_log,
            statuses: &self.entity_status,
            trend: &self.trend,
        }
        .to_string()
    }

    /// Latest summary, at most once per injection bucket.
    ///
    /// Buckets are `(turn - I) / B`. A bucket is only consumed when a summary
    /// is actually returned, so a bucket reached before the first checkpoint
    /// is retried on the next call.
    ///
    /// This mutates the archive: once a summary is returned, any further
    /// call in the same bucket returns `None`, including a repeat call for
    /// the same turn. Callers that rebuild a prompt must keep the first
    /// result.
    pub fn get_context_for_prompt(&mut self, turn: Turn) -> Option<String> {
        let interval = self.config.archive_interval;
        if turn < interval {
            return None;
        }
        let bucket = (turn - interval) / self.config.injection_bucket.max(1);
        if self.last_injected_bucket.is_some_and(|last| last >= bucket) {
            return None;
        }
        let (_, text) = self.summaries.last_key_value()?;
        let text = text.clone();
        self.last_injected_bucket = Some(bucket);
        debug!(session = %self.session_id, turn, bucket, "archive context injected");
        Some(text)
    }

    /// Clear deltas and shorten the event log when the archive outgrows `max_bytes`.
    ///
    /// Returns whether compaction ran.
    pub fn compact(&mut self, max_bytes: usize) -> bool {
        let size = self.estimated_size();
        if size <= max_bytes {
            return false;
        }
        let dropped = self.recent_deltas.len();
        self.recent_deltas.clear();
        truncate_front(&mut self.event_log, self.config.compact_event_keep);
        info!(
            session = %self.session_id,
            size,
            max_bytes,
            dropped_deltas = dropped,
            "archive compacted"
        );
        true
    }

    /// Serialized size of every tier, in bytes.
    pub fn estimated_size(&self) -> usize {
        json_len(&self.current_states)
            + json_len(&self.recent_deltas)
            + json_len(&self.summaries)
            + json_len(&self.event_log)
            + json_len(&self.entity_status)
            + json_len(&self.trend)
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    pub fn current_states(&self) -> &BTreeMap<Turn, Map> {
        &self.current_states
    }

    pub fn recent_deltas(&self) -> &BTreeMap<Turn, Map> {
        &self.recent_deltas
    }

    /// Summaries keyed by [`checkpoint_key`].
    pub fn archive_summaries(&self) -> BTreeMap<String, &str> {
        self.summaries
            .iter()
            .map(|(turn, text)| (checkpoint_key(*turn), text.as_str()))
            .collect()
    }

    pub fn latest_checkpoint(&self) -> Option<Turn> {
        self.summaries.keys().next_back().copied()
    }

    pub fn latest_summary(&self) -> Option<&str> {
        self.summaries.values().next_back().map(String::as_str)
    }

    pub fn event_log(&self) -> &[String] {
        &self.event_log
    }

    /// Status lines for one entity, oldest first.
    pub fn entity_status(&self, entity_id: &str) -> Vec<&str> {
        self.entity_status
            .get(entity_id)
            .map(|h| h.iter().map(|s| s.status.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn tracked_entities(&self) -> impl Iterator<Item = &str> {
        self.entity_status.keys().map(String::as_str)
    }

    pub fn scalar_trend(&self) -> Vec<f64> {
        self.trend.iter().map(|s| s.value).collect()
    }

    pub fn last_turn(&self) -> Turn {
        self.last_turn
    }

    pub fn last_injected_bucket(&self) -> Option<Turn> {
        self.last_injected_bucket
    }
}

fn truncate_front<T>(items: &mut Vec<T>, cap: usize) {
    if items.len() > cap {
        let excess = items.len() - cap;
        items.drain(..excess);
    }
}

fn json_len<T: Serialize + ?Sized>(value: &T) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}
