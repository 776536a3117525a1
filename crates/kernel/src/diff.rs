use saga_common::{Map, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Display path of entries that replace or clear the whole tree. Such entries
/// are identified by their `root` flag, so a key spelled `<root>` stays a key.
pub const ROOT_PATH: &str = "<root>";

/// Separator between map keys in a diff path.
pub const PATH_SEPARATOR: char = '.';

/// Volatile keys excluded from diffs unless a caller supplies its own set.
pub const DEFAULT_IGNORE_KEYS: &[&str] = &["last_updated", "last_touched", "updated_at"];

/// What happened at a diff path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffKind {
    Added,
    Removed,
    Changed,
}

/// One leaf-level difference between two trees.
///
/// `path` joins map keys with `.`; an empty key is an empty segment, so the
/// top-level key `""` has path `""` and its child `x` has path `".x"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub path: String,
    pub kind: DiffKind,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub root: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<Value>,
}

impl DiffEntry {
    fn added(path: String, current: Value) -> Self {
        Self {
            path,
            kind: DiffKind::Added,
            root: false,
            previous: None,
            current: Some(current),
        }
    }

    fn removed(path: String, previous: Value) -> Self {
        Self {
            path,
            kind: DiffKind::Removed,
            root: false,
            previous: Some(previous),
            current: None,
        }
    }

    fn changed(path: String, previous: Value, current: Value) -> Self {
        Self {
            path,
            kind: DiffKind::Changed,
            root: false,
            previous: Some(previous),
            current: Some(current),
        }
    }

    fn at_root(mut self) -> Self {
        self.path = ROOT_PATH.to_string();
        self.root = true;
        self
    }

    /// Whether this entry targets the whole tree.
    pub fn is_root(&self) -> bool {
        self.root
    }
}

/// Errors raised while applying a diff. A failed entry is never skipped.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DiffError {
    #[error("root replacement requires a map payload, got {found}")]
    RootReplaceNotMap { found: &'static str },
    #[error("cannot descend through {found} at '{segment}' of path '{path}'")]
    NotAMap {
        path: String,
        segment: String,
        found: &'static str,
    },
}

/// Keys excluded from diffing at every depth.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IgnoreKeys(BTreeSet<String>);

impl IgnoreKeys {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(keys.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// Compute the flat, ordered diff that turns `previous` into `current`.
///
/// Maps are walked key by key; lists and scalars are compared whole and
/// reported as a single `changed` entry. Non-map roots that differ are
/// reported at [`ROOT_PATH`].
pub fn compute(previous: &Value, current: &Value, ignore: &IgnoreKeys) -> Vec<DiffEntry> {
    let mut out = Vec::new();
    match (previous, current) {
        (Value::Map(a), Value::Map(b)) => walk_maps(a, b, None, ignore, &mut out),
        _ if previous != current => out.push(
            DiffEntry::changed(String::new(), previous.clone(), current.clone()).at_root(),
        ),
        _ => {}
    }
    out
}

/// [`compute`] for two map roots, the shape every persisted tree has.
pub fn compute_maps(previous: &Map, current: &Map, ignore: &IgnoreKeys) -> Vec<DiffEntry> {
    let mut out = Vec::new();
    walk_maps(previous, current, None, ignore, &mut out);
    out
}

/// `prefix` is `None` at the top level only; `Some("")` is a map under key `""`.
fn walk_maps(
    a: &Map,
    b: &Map,
    prefix: Option<&str>,
    ignore: &IgnoreKeys,
    out: &mut Vec<DiffEntry>,
) {
    // Both sides are BTreeMaps: merge the sorted key streams.
    let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
    for key in keys {
        if ignore.contains(key) {
            continue;
        }
        let path = join(prefix, key);
        match (a.get(key), b.get(key)) {
            (Some(Value::Map(pa)), Some(Value::Map(pb))) => {
                walk_maps(pa, pb, Some(&path), ignore, out)
            }
            (Some(pv), Some(cv)) => {
                if pv != cv {
                    out.push(DiffEntry::changed(path, pv.clone(), cv.clone()));
                }
            }
            (Some(pv), None) => out.push(DiffEntry::removed(path, pv.clone())),
            (None, Some(cv)) => out.push(DiffEntry::added(path, cv.clone())),
            (None, None) => {}
        }
    }
}

fn join(prefix: Option<&str>, key: &str) -> String {
    match prefix {
        None => key.to_string(),
        Some(prefix) => format!("{prefix}{PATH_SEPARATOR}{key}"),
    }
}

/// Apply a diff to `state` in place.
///
/// Intermediate maps along a path are created when setting a leaf. Removing a
/// leaf whose parent does not exist is a no-op.
pub fn apply(state: &mut Map, diff: &[DiffEntry]) -> Result<(), DiffError> {
    for entry in diff {
        apply_entry(state, entry)?;
    }
    Ok(())
}

fn apply_entry(state: &mut Map, entry: &DiffEntry) -> Result<(), DiffError> {
    if entry.is_root() {
        match entry.kind {
            DiffKind::Removed => state.clear(),
            DiffKind::Added | DiffKind::Changed => match &entry.current {
                Some(Value::Map(m)) => *state = m.clone(),
                other => {
                    return Err(DiffError::RootReplaceNotMap {
                        found: other.as_ref().map_or("null", Value::type_name),
                    });
                }
            },
        }
        return Ok(());
    }

    let segments: Vec<&str> = entry.path.split(PATH_SEPARATOR).collect();
    let Some((leaf, parents)) = segments.split_last() else {
        return Ok(());
    };

    let creating = entry.kind != DiffKind::Removed;
    let mut node = state;
    for segment in parents {
        if !creating && !node.contains_key(*segment) {
            return Ok(());
        }
        let child = node
            .entry((*segment).to_string())
            .or_insert_with(Value::map);
        node = match child {
            Value::Map(m) => m,
            other => {
                return Err(DiffError::NotAMap {
                    path: entry.path.clone(),
                    segment: (*segment).to_string(),
                    found: other.type_name(),
                });
            }
        };
    }

    match entry.kind {
        DiffKind::Removed => {
            node.remove(*leaf);
        }
        // A serialized `null` payload reads back as `None`.
        DiffKind::Added | DiffKind::Changed => {
            node.insert(
                (*leaf).to_string(),
                entry.current.clone().unwrap_or(Value::Null),
            );
        }
    }
    Ok(())
}
