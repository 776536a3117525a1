//! Kernel: structural diffing of state trees and schema migration.
//!
//! # Invariants
//! - `apply(S, compute(S, T)) == T` for map-rooted trees whose keys contain no `.`.
//! - `compute(S, S)` is empty.
//! - Ignored keys never appear in a diff path at any depth.
//! - Migrations only fill in missing keys; they never overwrite.

pub mod diff;
pub mod migrate;

pub use diff::{apply, compute, compute_maps, DiffEntry, DiffError, DiffKind, IgnoreKeys};
pub use migrate::{set_default, MigrationRegistry, SCHEMA_VERSION_KEY};
