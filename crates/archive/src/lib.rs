//! # saga-archive
//!
//! Long-horizon turn history for one session, in three tiers:
//! full states for the opening turns, deltas for every later turn, and a
//! text summary rebuilt at each checkpoint from the event log, per-entity
//! status history and a scalar trend.
//!
//! # Invariants
//! - Full states are only stored for turns `1..=full_state_window`.
//! - Event log, status histories and trend never exceed their caps.
//! - Context is injected at most once per injection bucket.
//! - Database rows are always scoped to one session id.

mod archive;
pub mod config;
pub mod db;
mod inject;
pub mod summary;

pub use archive::{checkpoint_key, TurnArchive};
pub use config::ArchiveConfig;
pub use db::{ArchiveDb, ArchiveError, Tier};
pub use inject::inject_archive_to_prompt;
pub use summary::{StatusEntry, TrendDirection, TrendSample};
