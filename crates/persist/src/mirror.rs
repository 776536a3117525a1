//! Best-effort relational projection of selected state subsets.
//!
//! Every group is rebuilt with delete-then-insert semantics for the owning
//! session, inside one transaction per sync. A failure rolls the whole sync
//! back and is returned to the caller.

use crate::config::MirrorConfig;
use rusqlite::{params, Connection, Transaction};
use saga_common::{Map, SessionId, Value};
use std::collections::BTreeSet;
use std::path::Path;

/// Minimal schema covering every mirror table.
pub const BUILTIN_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS world_meta (
  session_id TEXT NOT NULL,
  key TEXT NOT NULL,
  value TEXT,
  PRIMARY KEY (session_id, key)
);

CREATE TABLE IF NOT EXISTS entities (
  session_id TEXT NOT NULL,
  entity_id TEXT NOT NULL,
  name TEXT,
  kind TEXT,
  status TEXT,
  location TEXT,
  payload TEXT NOT NULL,
  PRIMARY KEY (session_id, entity_id)
);

CREATE TABLE IF NOT EXISTS structures (
  session_id TEXT NOT NULL,
  structure_id TEXT NOT NULL,
  name TEXT,
  kind TEXT,
  owner TEXT,
  payload TEXT NOT NULL,
  PRIMARY KEY (session_id, structure_id)
);

CREATE TABLE IF NOT EXISTS stockpiles (
  session_id TEXT NOT NULL,
  owner_id TEXT NOT NULL,
  resource TEXT NOT NULL,
  quantity REAL NOT NULL,
  PRIMARY KEY (session_id, owner_id, resource)
);

CREATE TABLE IF NOT EXISTS trade_routes (
  session_id TEXT NOT NULL,
  route_id TEXT NOT NULL,
  origin TEXT,
  destination TEXT,
  payload TEXT NOT NULL,
  PRIMARY KEY (session_id, route_id)
);

CREATE TABLE IF NOT EXISTS scheduled_events (
  session_id TEXT NOT NULL,
  event_id TEXT NOT NULL,
  due_turn INTEGER,
  kind TEXT,
  payload TEXT NOT NULL,
  PRIMARY KEY (session_id, event_id)
);

CREATE TABLE IF NOT EXISTS timeline_events (
  session_id TEXT NOT NULL,
  seq INTEGER NOT NULL,
  turn INTEGER,
  description TEXT NOT NULL,
  payload TEXT NOT NULL,
  PRIMARY KEY (session_id, seq)
);

CREATE TABLE IF NOT EXISTS hazard_log (
  session_id TEXT NOT NULL,
  seq INTEGER NOT NULL,
  turn INTEGER,
  description TEXT NOT NULL,
  payload TEXT NOT NULL,
  PRIMARY KEY (session_id, seq)
);

CREATE TABLE IF NOT EXISTS combat_log (
  session_id TEXT NOT NULL,
  seq INTEGER NOT NULL,
  turn INTEGER,
  description TEXT NOT NULL,
  payload TEXT NOT NULL,
  PRIMARY KEY (session_id, seq)
);

CREATE TABLE IF NOT EXISTS story_progress (
  session_id TEXT NOT NULL,
  seq INTEGER NOT NULL,
  turn INTEGER,
  description TEXT NOT NULL,
  payload TEXT NOT NULL,
  PRIMARY KEY (session_id, seq)
);
"#;

/// Errors from the relational mirror.
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A set of tables rebuilt together from one part of the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MirrorGroup {
    /// Top-level scalar values.
    Meta,
    Entities,
    Structures,
    Stockpiles,
    TradeRoutes,
    ScheduledEvents,
    Timeline,
    HazardLog,
    CombatLog,
    StoryProgress,
}

impl MirrorGroup {
    pub const ALL: [MirrorGroup; 10] = [
        MirrorGroup::Meta,
        MirrorGroup::Entities,
        MirrorGroup::Structures,
        MirrorGroup::Stockpiles,
        MirrorGroup::TradeRoutes,
        MirrorGroup::ScheduledEvents,
        MirrorGroup::Timeline,
        MirrorGroup::HazardLog,
        MirrorGroup::CombatLog,
        MirrorGroup::StoryProgress,
    ];

    /// Top-level key the group is projected from. `Meta` reads every scalar.
    pub fn source_key(self) -> Option<&'static str> {
        match self {
            MirrorGroup::Meta => None,
            MirrorGroup::Entities => Some("entities"),
            MirrorGroup::Structures => Some("structures"),
            MirrorGroup::Stockpiles => Some("stockpiles"),
            MirrorGroup::TradeRoutes => Some("trade_routes"),
            MirrorGroup::ScheduledEvents => Some("scheduled_events"),
            MirrorGroup::Timeline => Some("timeline"),
            MirrorGroup::HazardLog => Some("hazard_log"),
            MirrorGroup::CombatLog => Some("combat_log"),
            MirrorGroup::StoryProgress => Some("story_progress"),
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            MirrorGroup::Meta => "world_meta",
            MirrorGroup::Entities => "entities",
            MirrorGroup::Structures => "structures",
            MirrorGroup::Stockpiles => "stockpiles",
            MirrorGroup::TradeRoutes => "trade_routes",
            MirrorGroup::ScheduledEvents => "scheduled_events",
            MirrorGroup::Timeline => "timeline_events",
            MirrorGroup::HazardLog => "hazard_log",
            MirrorGroup::CombatLog => "combat_log",
            MirrorGroup::StoryProgress => "story_progress",
        }
    }

    /// Group affected by a change to top-level `key`.
    pub fn for_key(key: &str) -> MirrorGroup {
        Self::ALL
            .into_iter()
            .find(|g| g.source_key() == Some(key))
            .unwrap_or(MirrorGroup::Meta)
    }
}

/// What one sync touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub groups: Vec<MirrorGroup>,
    pub rows: usize,
}

/// SQLite-backed mirror owned by one session.
pub struct RelationalMirror {
    conn: Connection,
    session: SessionId,
}

impl std::fmt::Debug for RelationalMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationalMirror")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl RelationalMirror {
    /// Open (or create) the mirror database and ensure its schema.
    pub fn open(config: &MirrorConfig) -> Result<Self, MirrorError> {
        let conn = Connection::open(&config.path)?;
        Self::with_connection(conn, config.session_id.clone(), config.schema_path.as_deref())
    }

    /// In-memory mirror, mostly for tests and dry runs.
    pub fn open_in_memory(session: SessionId) -> Result<Self, MirrorError> {
        Self::with_connection(Connection::open_in_memory()?, session, None)
    }

    fn with_connection(
        conn: Connection,
        session: SessionId,
        schema_path: Option<&Path>,
    ) -> Result<Self, MirrorError> {
        ensure_schema(&conn, schema_path)?;
        Ok(Self { conn, session })
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Read access for inspection queries.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Rows this session owns in `group`'s table.
    pub fn row_count(&self, group: MirrorGroup) -> Result<usize, MirrorError> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE session_id = ?1", group.table());
        let n: i64 = self
            .conn
            .query_row(&sql, params![self.session.as_str()], |row| row.get(0))?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    /// Rebuild the groups affected by `changed` (every group when `None`).
    pub fn sync(
        &mut self,
        tree: &Map,
        changed: Option<&[String]>,
    ) -> Result<SyncReport, MirrorError> {
        let groups: BTreeSet<MirrorGroup> = match changed {
            None => MirrorGroup::ALL.into_iter().collect(),
            Some(keys) => keys.iter().map(|k| MirrorGroup::for_key(k)).collect(),
        };
        let _span = tracing::debug_span!(
            "mirror_sync",
            session = %self.session,
            groups = groups.len()
        )
        .entered();

        let session = self.session.as_str();
        let tx = self.conn.transaction()?;
        let mut report = SyncReport::default();
        for group in groups {
            let rows = sync_group(&tx, session, group, tree)?;
            tracing::trace!(?group, rows, "mirror group rebuilt");
            report.groups.push(group);
            report.rows += rows;
        }
        tx.commit()?;
        Ok(report)
    }
}

/// Apply the external schema if it can be read, then the built-in one.
fn ensure_schema(conn: &Connection, schema_path: Option<&Path>) -> Result<(), MirrorError> {
    if let Some(path) = schema_path {
        match std::fs::read_to_string(path) {
            Ok(sql) => {
                if let Err(e) = conn.execute_batch(&sql) {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "external mirror schema failed, using built-in"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "external mirror schema unreadable, using built-in"
                );
            }
        }
    }
    conn.execute_batch(BUILTIN_SCHEMA)?;
    Ok(())
}

fn sync_group(
    tx: &Transaction<'_>,
    session: &str,
    group: MirrorGroup,
    tree: &Map,
) -> Result<usize, MirrorError> {
    tx.execute(
        &format!("DELETE FROM {} WHERE session_id = ?1", group.table()),
        params![session],
    )?;

    let source = match group.source_key() {
        None => return sync_meta(tx, session, tree),
        Some(key) => tree.get(key),
    };
    let Some(source) = source else {
        return Ok(0);
    };

    match group {
        MirrorGroup::Meta => Ok(0),
        MirrorGroup::Entities => sync_keyed(group, source, |id, item| {
            tx.execute(
                "INSERT INTO entities (session_id, entity_id, name, kind, status, location, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    session,
                    id,
                    field(item, "name"),
                    field(item, "kind"),
                    field(item, "status"),
                    field(item, "location"),
                    serde_json::to_string(item)?,
                ],
            )?;
            Ok(())
        }),
        MirrorGroup::Structures => sync_keyed(group, source, |id, item| {
            tx.execute(
                "INSERT INTO structures (session_id, structure_id, name, kind, owner, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    session,
                    id,
                    field(item, "name"),
                    field(item, "kind"),
                    field(item, "owner"),
                    serde_json::to_string(item)?,
                ],
            )?;
            Ok(())
        }),
        MirrorGroup::TradeRoutes => sync_keyed(group, source, |id, item| {
            tx.execute(
                "INSERT INTO trade_routes (session_id, route_id, origin, destination, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    session,
                    id,
                    field(item, "origin"),
                    field(item, "destination"),
                    serde_json::to_string(item)?,
                ],
            )?;
            Ok(())
        }),
        MirrorGroup::ScheduledEvents => sync_keyed(group, source, |id, item| {
            tx.execute(
                "INSERT INTO scheduled_events (session_id, event_id, due_turn, kind, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    session,
                    id,
                    item.get("due_turn").and_then(Value::as_i64),
                    field(item, "kind"),
                    serde_json::to_string(item)?,
                ],
            )?;
            Ok(())
        }),
        MirrorGroup::Stockpiles => sync_stockpiles(tx, session, source),
        MirrorGroup::Timeline
        | MirrorGroup::HazardLog
        | MirrorGroup::CombatLog
        | MirrorGroup::StoryProgress => sync_log(tx, session, group.table(), source),
    }
}

fn sync_meta(tx: &Transaction<'_>, session: &str, tree: &Map) -> Result<usize, MirrorError> {
    let mut rows = 0;
    for (key, value) in tree {
        if matches!(value, Value::List(_) | Value::Map(_)) {
            continue;
        }
        tx.execute(
            "INSERT INTO world_meta (session_id, key, value) VALUES (?1, ?2, ?3)",
            params![session, key, (!value.is_null()).then(|| value.to_text())],
        )?;
        rows += 1;
    }
    Ok(rows)
}

/// Insert one row per entry of an id-keyed collection.
fn sync_keyed<F>(
    group: MirrorGroup,
    source: &Value,
    mut insert: F,
) -> Result<usize, MirrorError>
where
    F: FnMut(&str, &Value) -> Result<(), MirrorError>,
{
    let Some(items) = source.as_map() else {
        tracing::debug!(?group, found = source.type_name(), "collection is not id-keyed, skipped");
        return Ok(0);
    };
    for (id, item) in items {
        insert(id, item)?;
    }
    Ok(items.len())
}

/// Stockpiles are `{owner: {resource: qty}}`; a flat `{resource: qty}` map
/// belongs to the owner `global`.
fn sync_stockpiles(
    tx: &Transaction<'_>,
    session: &str,
    source: &Value,
) -> Result<usize, MirrorError> {
    let Some(owners) = source.as_map() else {
        tracing::debug!(found = source.type_name(), "stockpiles are not a map, skipped");
        return Ok(0);
    };
    let insert = |owner: &str, resource: &str, qty: f64| {
        tx.execute(
            "INSERT OR REPLACE INTO stockpiles (session_id, owner_id, resource, quantity)
             VALUES (?1, ?2, ?3, ?4)",
            params![session, owner, resource, qty],
        )
    };
    let mut rows = 0;
    for (key, value) in owners {
        match value {
            Value::Map(resources) => {
                for (resource, qty) in resources {
                    if let Some(qty) = qty.as_f64() {
                        insert(key, resource, qty)?;
                        rows += 1;
                    }
                }
            }
            other => {
                if let Some(qty) = other.as_f64() {
                    insert("global", key, qty)?;
                    rows += 1;
                }
            }
        }
    }
    Ok(rows)
}

fn sync_log(
    tx: &Transaction<'_>,
    session: &str,
    table: &str,
    source: &Value,
) -> Result<usize, MirrorError> {
    let Some(entries) = source.as_list() else {
        tracing::debug!(table, found = source.type_name(), "log is not a list, skipped");
        return Ok(0);
    };
    let sql = format!(
        "INSERT INTO {table} (session_id, seq, turn, description, payload)
         VALUES (?1, ?2, ?3, ?4, ?5)"
    );
    for (seq, entry) in entries.iter().enumerate() {
        let (turn, description) = match entry {
            Value::Map(_) => (
                entry.get("turn").and_then(Value::as_i64),
                ["text", "description", "summary"]
                    .iter()
                    .find_map(|k| entry.get(k).map(Value::to_text))
                    .unwrap_or_else(|| entry.to_string()),
            ),
            other => (None, other.to_text()),
        };
        tx.execute(
            &sql,
            params![
                session,
                i64::try_from(seq).unwrap_or(i64::MAX),
                turn,
                description,
                serde_json::to_string(entry)?,
            ],
        )?;
    }
    Ok(entries.len())
}

fn field(item: &Value, key: &str) -> Option<String> {
    item.get(key).filter(|v| !v.is_null()).map(Value::to_text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree(v: serde_json::Value) -> Map {
        match Value::from(v) {
            Value::Map(m) => m,
            _ => unreachable!(),
        }
    }

    fn sample() -> Map {
        tree(json!({
            "turn": 4,
            "region": "Vale",
            "entities": {
                "npc_a": {"name": "Ash", "status": "wounded", "location": "mill"},
                "npc_b": {"name": "Bryn"}
            },
            "structures": {"mill": {"name": "Old Mill", "owner": "npc_a"}},
            "stockpiles": {"npc_a": {"grain": 12, "iron": 1.5}, "salt": 3},
            "trade_routes": {"r1": {"origin": "Vale", "destination": "Port"}},
            "scheduled_events": {"fair": {"due_turn": 9, "kind": "festival"}},
            "timeline": ["founded", {"turn": 2, "text": "flood"}],
            "hazard_log": [{"turn": 3, "description": "rockslide"}],
            "combat_log": [],
            "story_progress": ["act one"]
        }))
    }

    #[test]
    fn full_sync_populates_every_group() {
        let mut mirror = RelationalMirror::open_in_memory("s1".into()).unwrap();
        let report = mirror.sync(&sample(), None).unwrap();
        assert_eq!(report.groups.len(), MirrorGroup::ALL.len());
        assert_eq!(mirror.row_count(MirrorGroup::Meta).unwrap(), 2);
        assert_eq!(mirror.row_count(MirrorGroup::Entities).unwrap(), 2);
        assert_eq!(mirror.row_count(MirrorGroup::Structures).unwrap(), 1);
        assert_eq!(mirror.row_count(MirrorGroup::Stockpiles).unwrap(), 3);
        assert_eq!(mirror.row_count(MirrorGroup::TradeRoutes).unwrap(), 1);
        assert_eq!(mirror.row_count(MirrorGroup::ScheduledEvents).unwrap(), 1);
        assert_eq!(mirror.row_count(MirrorGroup::Timeline).unwrap(), 2);
        assert_eq!(mirror.row_count(MirrorGroup::HazardLog).unwrap(), 1);
        assert_eq!(mirror.row_count(MirrorGroup::CombatLog).unwrap(), 0);
        assert_eq!(mirror.row_count(MirrorGroup::StoryProgress).unwrap(), 1);

        let (status, location): (String, String) = mirror
            .connection()
            .query_row(
                "SELECT status, location FROM entities WHERE entity_id = 'npc_a'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(status, "wounded");
        assert_eq!(location, "mill");

        let flood: (i64, String) = mirror
            .connection()
            .query_row(
                "SELECT turn, description FROM timeline_events WHERE seq = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(flood, (2, "flood".to_string()));
    }

    #[test]
    fn resync_replaces_rows() {
        let mut mirror = RelationalMirror::open_in_memory("s1".into()).unwrap();
        let mut state = sample();
        mirror.sync(&state, None).unwrap();
        mirror.sync(&state, None).unwrap();
        assert_eq!(mirror.row_count(MirrorGroup::Entities).unwrap(), 2);

        state.insert("entities".into(), Value::map());
        mirror.sync(&state, None).unwrap();
        assert_eq!(mirror.row_count(MirrorGroup::Entities).unwrap(), 0);
    }

    #[test]
    fn hint_limits_resynced_groups() {
        let mut mirror = RelationalMirror::open_in_memory("s1".into()).unwrap();
        let mut state = sample();
        mirror.sync(&state, None).unwrap();

        state.insert("entities".into(), Value::map());
        state.insert("timeline".into(), Value::List(Vec::new()));
        let report = mirror.sync(&state, Some(&["timeline".to_string()])).unwrap();
        assert_eq!(report.groups, vec![MirrorGroup::Timeline]);
        assert_eq!(mirror.row_count(MirrorGroup::Timeline).unwrap(), 0);
        // untouched because not hinted
        assert_eq!(mirror.row_count(MirrorGroup::Entities).unwrap(), 2);
    }

    #[test]
    fn unknown_keys_map_to_meta() {
        assert_eq!(MirrorGroup::for_key("turn"), MirrorGroup::Meta);
        assert_eq!(MirrorGroup::for_key("hazard_log"), MirrorGroup::HazardLog);
    }

    #[test]
    fn list_shaped_collections_are_skipped() {
        let mut mirror = RelationalMirror::open_in_memory("s1".into()).unwrap();
        let state = tree(json!({"entities": [{"id": "npc_a"}]}));
        mirror.sync(&state, None).unwrap();
        assert_eq!(mirror.row_count(MirrorGroup::Entities).unwrap(), 0);
    }

    #[test]
    fn sessions_do_not_clobber_each_other() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("mirror.db");
        let mut a = RelationalMirror::open(&MirrorConfig::new(&db, "a".into())).unwrap();
        let mut b = RelationalMirror::open(&MirrorConfig::new(&db, "b".into())).unwrap();
        a.sync(&sample(), None).unwrap();
        b.sync(&Map::new(), None).unwrap();
        assert_eq!(a.row_count(MirrorGroup::Entities).unwrap(), 2);
        assert_eq!(b.row_count(MirrorGroup::Entities).unwrap(), 0);
    }

    #[test]
    fn unreadable_external_schema_falls_back() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = MirrorConfig::new(tmp.path().join("m.db"), "s".into());
        config.schema_path = Some(tmp.path().join("missing.sql"));
        let mut mirror = RelationalMirror::open(&config).unwrap();
        mirror.sync(&sample(), None).unwrap();
        assert_eq!(mirror.row_count(MirrorGroup::Entities).unwrap(), 2);
    }

    #[test]
    fn external_schema_is_applied() {
        let tmp = tempfile::tempdir().unwrap();
        let schema = tmp.path().join("schema.sql");
        std::fs::write(&schema, "CREATE TABLE IF NOT EXISTS audit (note TEXT);").unwrap();
        let mut config = MirrorConfig::new(tmp.path().join("m.db"), "s".into());
        config.schema_path = Some(schema);
        let mirror = RelationalMirror::open(&config).unwrap();
        let n: i64 = mirror
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'audit'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn failed_sync_rolls_back() {
        let mut mirror = RelationalMirror::open_in_memory("s1".into()).unwrap();
        mirror.sync(&sample(), None).unwrap();
        mirror.connection().execute_batch("DROP TABLE story_progress").unwrap();

        let mut state = sample();
        state.insert("entities".into(), Value::map());
        assert!(mirror.sync(&state, None).is_err());
        // the entities delete ran before the failure and was rolled back
        assert_eq!(mirror.row_count(MirrorGroup::Entities).unwrap(), 2);
    }
}
