//! Persistence: tiered JSON store with cold snapshot + diff replay, and a
//! relational mirror of selected state subsets.
//!
//! # Invariants
//! - `snapshot()` after reopening equals the last persisted tree.
//! - The main file is replaced atomically; it is never left truncated.
//! - The turn counter never decreases across a load.
//! - A missing or corrupt main file, snapshot or diff degrades to defaults.
//! - Mirror writes for one persist commit or roll back together.

pub mod config;
pub mod mirror;
pub mod snapshot;
pub mod store;

pub use config::{MirrorConfig, StoreConfig, DEFAULT_COLD_FIELDS};
pub use mirror::{MirrorError, MirrorGroup, RelationalMirror, SyncReport};
pub use snapshot::{ColdRefs, ColdSnapshot, TurnDiff, COLD_REFS_KEY, COLD_SNAPSHOT_FILE};
pub use store::{turn_of, StoreError, TieredStateStore, TURN_KEY};
