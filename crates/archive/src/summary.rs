//! Signal extraction from recorded turns and summary text rendering.

use crate::config::ArchiveConfig;
use saga_common::{Map, Turn, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Prefix marking an event produced by a newly set flag.
pub const FLAG_MARKER: &str = "FLAG SET:";

/// One status line for one entity at one turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub turn: Turn,
    pub status: String,
}

/// One sample of the tracked scalar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendSample {
    pub turn: Turn,
    pub value: f64,
}

/// Direction of the tracked scalar, first sample against last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendDirection {
    Rising,
    StableOrFalling,
}

impl TrendDirection {
    pub fn of(samples: &[TrendSample]) -> Option<Self> {
        let first = samples.first()?;
        let last = samples.last()?;
        Some(if last.value > first.value {
            TrendDirection::Rising
        } else {
            TrendDirection::StableOrFalling
        })
    }
}

impl fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrendDirection::Rising => write!(f, "rising"),
            TrendDirection::StableOrFalling => write!(f, "stable/falling"),
        }
    }
}

/// Short fixed-field status for an entity record: `T12 wounded @ mill hp=4`.
///
/// Reads `status` (or `state`), `location` and `hp` (or `health`); a
/// non-map record is rendered as its text.
pub fn status_line(turn: Turn, entity: &Value) -> String {
    let Some(record) = entity.as_map() else {
        return format!("T{turn} {}", entity.to_text());
    };
    let status = first_text(record, &["status", "state"]).unwrap_or_else(|| "active".to_string());
    let mut line = format!("T{turn} {status}");
    if let Some(location) = first_text(record, &["location"]) {
        line.push_str(" @ ");
        line.push_str(&location);
    }
    if let Some(hp) = first_text(record, &["hp", "health"]) {
        line.push_str(" hp=");
        line.push_str(&hp);
    }
    line
}

fn first_text(record: &Map, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| record.get(*k))
        .find(|v| !v.is_null())
        .map(Value::to_text)
}

/// Events worth logging from one turn's delta.
///
/// Flags arrive as a list of names or a map of name to value (falsy values
/// are not "set"). Only string entries of the events list are kept.
pub fn extract_events(delta: &Map, config: &ArchiveConfig) -> Vec<String> {
    let mut events = Vec::new();
    match delta.get(&config.flags_key) {
        Some(Value::List(names)) => {
            events.extend(names.iter().map(|n| format!("{FLAG_MARKER} {}", n.to_text())));
        }
        Some(Value::Map(flags)) => {
            events.extend(
                flags
                    .iter()
                    .filter(|(_, v)| is_set(v))
                    .map(|(name, _)| format!("{FLAG_MARKER} {name}")),
            );
        }
        _ => {}
    }
    if let Some(items) = delta.get(&config.events_key).and_then(Value::as_list) {
        events.extend(items.iter().filter_map(Value::as_str).map(str::to_string));
    }
    events
}

fn is_set(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Int(i) => *i != 0,
        _ => true,
    }
}

/// Whether an event belongs in a summary.
pub fn is_major(event: &str, min_len: usize) -> bool {
    event.starts_with(FLAG_MARKER) || event.chars().count() > min_len
}

/// Borrowed view over the signal a summary is rendered from.
pub struct SummaryView<'a> {
    pub turn: Turn,
    pub config: &'a ArchiveConfig,
    pub events: &'a [String],
    pub statuses: &'a BTreeMap<String, Vec<StatusEntry>>,
    pub trend: &'a [TrendSample],
}

impl fmt::Display for SummaryView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ARCHIVE SUMMARY @ turn {}", self.turn)?;

        let major: Vec<&String> = self
            .events
            .iter()
            .filter(|e| is_major(e, self.config.major_event_min_len))
            .collect();
        if major.is_empty() {
            writeln!(f, "Major events: none recorded")?;
        } else {
            writeln!(f, "Major events:")?;
            for event in major {
                writeln!(f, "  - {event}")?;
            }
        }

        let latest: Vec<(&String, &StatusEntry)> = self
            .statuses
            .iter()
            .filter_map(|(id, history)| history.last().map(|s| (id, s)))
            .collect();
        if !latest.is_empty() {
            writeln!(f, "Entity status:")?;
            for (id, entry) in latest {
                writeln!(f, "  - {id}: {}", entry.status)?;
            }
        }

        if let (Some(direction), Some(first), Some(last)) = (
            TrendDirection::of(self.trend),
            self.trend.first(),
            self.trend.last(),
        ) {
            write!(
                f,
                "{} trend: {direction} ({} -> {} over {} samples)",
                self.config.trend_key,
                first.value,
                last.value,
                self.trend.len()
            )?;
        }
        Ok(())
    }
}
