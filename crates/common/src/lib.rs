//! Shared types for the saga engine.
//!
//! # Invariants
//! - Maps are `BTreeMap`s, so iteration and serialization order are canonical.
//! - A `Value` tree survives a JSON round trip unchanged (finite floats only).

mod types;
mod value;

pub use types::{SessionId, Turn};
pub use value::{keyed_by_id, Map, Value};
