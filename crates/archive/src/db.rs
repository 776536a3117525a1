//! Relational persistence for [`TurnArchive`].
//!
//! Every row carries the session id; sessions never read each other's rows.
//! Turn tiers and metadata are upserted. Trend and status rows are rebuilt
//! from memory on every save, so they stay within the in-memory caps.

use crate::archive::TurnArchive;
use crate::config::ArchiveConfig;
use crate::summary::{StatusEntry, TrendSample};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use saga_common::{Map, SessionId, Turn};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{info_span, warn};

pub const ARCHIVE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS archive_metadata (
  session_id TEXT PRIMARY KEY,
  last_turn INTEGER NOT NULL,
  last_injected_bucket INTEGER,
  event_log TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS archive_turns (
  session_id TEXT NOT NULL,
  tier TEXT NOT NULL CHECK (tier IN ('current', 'recent', 'summary')),
  turn INTEGER NOT NULL,
  payload TEXT NOT NULL,
  PRIMARY KEY (session_id, tier, turn)
);

CREATE TABLE IF NOT EXISTS archive_threats (
  session_id TEXT NOT NULL,
  turn INTEGER NOT NULL,
  value REAL NOT NULL,
  PRIMARY KEY (session_id, turn)
);

CREATE TABLE IF NOT EXISTS archive_npcs (
  session_id TEXT NOT NULL,
  entity_id TEXT NOT NULL,
  turn INTEGER NOT NULL,
  status TEXT NOT NULL,
  PRIMARY KEY (session_id, entity_id, turn)
);
"#;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Storage class of an `archive_turns` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Current,
    Recent,
    Summary,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Current, Tier::Recent, Tier::Summary];

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Current => "current",
            Tier::Recent => "recent",
            Tier::Summary => "summary",
        }
    }
}

/// SQLite database holding archives for any number of sessions.
pub struct ArchiveDb {
    conn: Connection,
}

impl std::fmt::Debug for ArchiveDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveDb").finish_non_exhaustive()
    }
}

impl ArchiveDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, ArchiveError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, ArchiveError> {
        conn.execute_batch(ARCHIVE_SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Sessions with saved metadata.
    pub fn sessions(&self) -> Result<Vec<SessionId>, ArchiveError> {
        let mut stmt = self
            .conn
            .prepare("SELECT session_id FROM archive_metadata ORDER BY session_id")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(SessionId::from(row?));
        }
        Ok(out)
    }

    pub fn tier_row_count(&self, session: &SessionId, tier: Tier) -> Result<usize, ArchiveError> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM archive_turns WHERE session_id = ?1 AND tier = ?2",
            params![session.as_str(), tier.as_str()],
            |r| r.get(0),
        )?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    pub fn trend_row_count(&self, session: &SessionId) -> Result<usize, ArchiveError> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM archive_threats WHERE session_id = ?1",
            params![session.as_str()],
            |r| r.get(0),
        )?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    pub fn status_row_count(&self, session: &SessionId) -> Result<usize, ArchiveError> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM archive_npcs WHERE session_id = ?1",
            params![session.as_str()],
            |r| r.get(0),
        )?;
        Ok(usize::try_from(n).unwrap_or(0))
    }
}

impl TurnArchive {
    /// Write every tier for this session in one transaction.
    pub fn save_to_db(&self, db: &mut ArchiveDb) -> Result<(), ArchiveError> {
        let session = self.session_id.as_str();
        let _span = info_span!("archive_save", session).entered();
        let tx = db.conn.transaction()?;

        tx.execute(
            "INSERT INTO archive_metadata
               (session_id, last_turn, last_injected_bucket, event_log, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(session_id) DO UPDATE SET
               last_turn = excluded.last_turn,
               last_injected_bucket = excluded.last_injected_bucket,
               event_log = excluded.event_log,
               updated_at = excluded.updated_at",
            params![
                session,
                sql_turn(self.last_turn),
                self.last_injected_bucket.map(sql_turn),
                serde_json::to_string(&self.event_log)?,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;

        let mut current = BTreeMap::new();
        for (turn, state) in &self.current_states {
            current.insert(*turn, serde_json::to_string(state)?);
        }
        let mut recent = BTreeMap::new();
        for (turn, delta) in &self.recent_deltas {
            recent.insert(*turn, serde_json::to_string(delta)?);
        }
        write_tier(&tx, session, Tier::Current, &current)?;
        write_tier(&tx, session, Tier::Recent, &recent)?;
        write_tier(&tx, session, Tier::Summary, &self.summaries)?;

        // Samples and statuses already evicted from memory are dropped here too.
        tx.execute("DELETE FROM archive_threats WHERE session_id = ?1", params![session])?;
        tx.execute("DELETE FROM archive_npcs WHERE session_id = ?1", params![session])?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO archive_threats (session_id, turn, value)
                 VALUES (?1, ?2, ?3)",
            )?;
            for sample in &self.trend {
                stmt.execute(params![session, sql_turn(sample.turn), sample.value])?;
            }
        }
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO archive_npcs (session_id, entity_id, turn, status)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (id, history) in &self.entity_status {
                for entry in history {
                    stmt.execute(params![
                        session,
                        id,
                        sql_turn(entry.turn),
                        entry.status
                    ])?;
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Rebuild the archive for `session_id`. A session with no saved rows
    /// yields an empty archive.
    pub fn load_from_db(
        db: &ArchiveDb,
        session_id: SessionId,
        config: ArchiveConfig,
    ) -> Result<TurnArchive, ArchiveError> {
        let _span = info_span!("archive_load", session = %session_id).entered();
        let conn = &db.conn;
        let session = session_id.as_str().to_string();
        let mut archive = TurnArchive::new(session_id, config);

        let meta = conn
            .query_row(
                "SELECT last_turn, last_injected_bucket, event_log FROM archive_metadata
                 WHERE session_id = ?1",
                params![session],
                |r| {
                    Ok((
                        r.get::<_, i64>(0)?,
                        r.get::<_, Option<i64>>(1)?,
                        r.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        if let Some((last_turn, bucket, events)) = meta {
            archive.last_turn = turn_from_sql(last_turn);
            archive.last_injected_bucket = bucket.map(turn_from_sql);
            match serde_json::from_str::<Vec<String>>(&events) {
                Ok(mut log) => {
                    let cap = archive.config.event_cap();
                    if log.len() > cap {
                        log.drain(..log.len() - cap);
                    }
                    archive.event_log = log;
                }
                Err(e) => warn!(error = %e, "discarding unreadable event log"),
            }
        }

        for (turn, payload) in read_tier(conn, &session, Tier::Current)? {
            if let Some(state) = parse_map(Tier::Current, turn, &payload) {
                archive.current_states.insert(turn, state);
            }
        }
        for (turn, payload) in read_tier(conn, &session, Tier::Recent)? {
            if let Some(delta) = parse_map(Tier::Recent, turn, &payload) {
                archive.recent_deltas.insert(turn, delta);
            }
        }
        archive.summaries = read_tier(conn, &session, Tier::Summary)?;

        {
            let mut stmt = conn.prepare(
                "SELECT turn, value FROM archive_threats WHERE session_id = ?1 ORDER BY turn",
            )?;
            let rows = stmt.query_map(params![session], |r| {
                Ok(TrendSample {
                    turn: turn_from_sql(r.get(0)?),
                    value: r.get(1)?,
                })
            })?;
            let mut trend = Vec::new();
            for row in rows {
                trend.push(row?);
            }
            let cap = archive.config.trend_cap();
            if trend.len() > cap {
                trend.drain(..trend.len() - cap);
            }
            archive.trend = trend;
        }

        {
            let mut stmt = conn.prepare(
                "SELECT entity_id, turn, status FROM archive_npcs
                 WHERE session_id = ?1 ORDER BY entity_id, turn",
            )?;
            let rows = stmt.query_map(params![session], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    StatusEntry {
                        turn: turn_from_sql(r.get(1)?),
                        status: r.get(2)?,
                    },
                ))
            })?;
            let cap = archive.config.status_cap();
            for row in rows {
                let (id, entry) = row?;
                let history = archive.entity_status.entry(id).or_default();
                history.push(entry);
                if history.len() > cap {
                    history.remove(0);
                }
            }
        }

        let newest = [
            archive.current_states.keys().next_back(),
            archive.recent_deltas.keys().next_back(),
            archive.summaries.keys().next_back(),
        ]
        .into_iter()
        .flatten()
        .copied()
        .max()
        .unwrap_or(0);
        archive.last_turn = archive.last_turn.max(newest);
        Ok(archive)
    }
}

/// Upsert every row of one tier and delete the session's rows for turns no
/// longer held in memory.
fn write_tier(
    tx: &Transaction<'_>,
    session: &str,
    tier: Tier,
    rows: &BTreeMap<Turn, String>,
) -> Result<(), ArchiveError> {
    let stored: BTreeSet<Turn> = {
        let mut stmt =
            tx.prepare("SELECT turn FROM archive_turns WHERE session_id = ?1 AND tier = ?2")?;
        let turns = stmt.query_map(params![session, tier.as_str()], |r| r.get::<_, i64>(0))?;
        let mut out = BTreeSet::new();
        for t in turns {
            out.insert(turn_from_sql(t?));
        }
        out
    };
    {
        let mut delete = tx.prepare(
            "DELETE FROM archive_turns WHERE session_id = ?1 AND tier = ?2 AND turn = ?3",
        )?;
        for turn in stored.iter().filter(|t| !rows.contains_key(*t)) {
            delete.execute(params![session, tier.as_str(), sql_turn(*turn)])?;
        }
    }
    let mut upsert = tx.prepare(
        "INSERT INTO archive_turns (session_id, tier, turn, payload) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(session_id, tier, turn) DO UPDATE SET payload = excluded.payload",
    )?;
    for (turn, payload) in rows {
        upsert.execute(params![session, tier.as_str(), sql_turn(*turn), payload])?;
    }
    Ok(())
}

fn read_tier(
    conn: &Connection,
    session: &str,
    tier: Tier,
) -> Result<BTreeMap<Turn, String>, ArchiveError> {
    let mut stmt = conn.prepare(
        "SELECT turn, payload FROM archive_turns WHERE session_id = ?1 AND tier = ?2",
    )?;
    let rows = stmt.query_map(params![session, tier.as_str()], |r| {
        Ok((turn_from_sql(r.get(0)?), r.get::<_, String>(1)?))
    })?;
    let mut out = BTreeMap::new();
    for row in rows {
        let (turn, payload) = row?;
        out.insert(turn, payload);
    }
    Ok(out)
}

fn parse_map(tier: Tier, turn: Turn, payload: &str) -> Option<Map> {
    match serde_json::from_str(payload) {
        Ok(map) => Some(map),
        Err(e) => {
            warn!(tier = tier.as_str(), turn, error = %e, "skipping unreadable archive row");
            None
        }
    }
}

fn sql_turn(turn: Turn) -> i64 {
    i64::try_from(turn).unwrap_or(i64::MAX)
}

fn turn_from_sql(turn: i64) -> Turn {
    Turn::try_from(turn).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use saga_common::Value;
    use serde_json::json;

    fn config() -> ArchiveConfig {
        ArchiveConfig {
            full_state_window: 6,
            auto_compact_bytes: None,
            ..ArchiveConfig::default()
        }
    }

    fn map(v: serde_json::Value) -> Map {
        match Value::from(v) {
            Value::Map(m) => m,
            other => panic!("expected map, got {}", other.type_name()),
        }
    }

    fn record(archive: &mut TurnArchive, turns: std::ops::RangeInclusive<Turn>, threat_base: f64) {
        for t in turns {
            let state = map(json!({
                "turn": t,
                "threat_level": threat_base + t as f64,
                "npcs": {"ada": {"status": "alive", "location": "harbor"}}
            }));
            let delta = map(json!({"turn": t, "recent_events": [format!("event {t}")]}));
            archive.record_turn(t, &state, &delta);
        }
    }

    #[test]
    fn save_and_reload_every_tier() {
        let mut db = ArchiveDb::open_in_memory().unwrap();
        let mut archive = TurnArchive::new(SessionId::from("alpha"), config());
        record(&mut archive, 1..=20, 0.0);
        assert!(archive.get_context_for_prompt(20).is_some());
        archive.save_to_db(&mut db).unwrap();

        let loaded = TurnArchive::load_from_db(&db, SessionId::from("alpha"), config()).unwrap();
        assert_eq!(loaded.current_states(), archive.current_states());
        assert_eq!(loaded.recent_deltas(), archive.recent_deltas());
        assert_eq!(loaded.archive_summaries(), archive.archive_summaries());
        assert_eq!(loaded.event_log(), archive.event_log());
        assert_eq!(loaded.scalar_trend(), archive.scalar_trend());
        assert_eq!(loaded.entity_status("ada"), archive.entity_status("ada"));
        assert_eq!(loaded.last_turn(), 20);
        assert_eq!(loaded.last_injected_bucket(), archive.last_injected_bucket());
    }

    #[test]
    fn injection_bucket_survives_reload() {
        let mut db = ArchiveDb::open_in_memory().unwrap();
        let mut archive = TurnArchive::new(SessionId::from("alpha"), config());
        record(&mut archive, 1..=18, 0.0);
        assert!(archive.get_context_for_prompt(18).is_some());
        archive.save_to_db(&mut db).unwrap();

        let mut loaded =
            TurnArchive::load_from_db(&db, SessionId::from("alpha"), config()).unwrap();
        assert_eq!(loaded.get_context_for_prompt(19), None);
        assert!(loaded.get_context_for_prompt(26).is_some());
    }

    #[test]
    fn sessions_are_isolated() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("archive.db");
        {
            let mut db = ArchiveDb::open(&path).unwrap();
            let mut a = TurnArchive::new(SessionId::from("alpha"), config());
            let mut b = TurnArchive::new(SessionId::from("beta"), config());
            record(&mut a, 1..=4, 0.0);
            record(&mut b, 1..=3, 100.0);
            a.save_to_db(&mut db).unwrap();
            b.save_to_db(&mut db).unwrap();
        }

        let db = ArchiveDb::open(&path).unwrap();
        let a = TurnArchive::load_from_db(&db, SessionId::from("alpha"), config()).unwrap();
        let b = TurnArchive::load_from_db(&db, SessionId::from("beta"), config()).unwrap();
        assert_eq!(a.current_states().len(), 4);
        assert_eq!(b.current_states().len(), 3);
        assert_eq!(a.scalar_trend(), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(b.scalar_trend(), vec![101.0, 102.0, 103.0]);
        assert!(
            a.current_states()
                .values()
                .all(|s| s.get("threat_level") != Some(&Value::Float(101.0)))
        );
        assert_eq!(
            db.sessions().unwrap(),
            vec![SessionId::from("alpha"), SessionId::from("beta")]
        );
    }

    #[test]
    fn repeated_save_does_not_duplicate_rows() {
        let mut db = ArchiveDb::open_in_memory().unwrap();
        let mut archive = TurnArchive::new(SessionId::from("alpha"), config());
        record(&mut archive, 1..=12, 0.0);
        archive.save_to_db(&mut db).unwrap();
        archive.save_to_db(&mut db).unwrap();

        let session = SessionId::from("alpha");
        assert_eq!(db.tier_row_count(&session, Tier::Current).unwrap(), 6);
        assert_eq!(db.tier_row_count(&session, Tier::Recent).unwrap(), 6);
        assert_eq!(db.tier_row_count(&session, Tier::Summary).unwrap(), 1);
        assert_eq!(db.trend_row_count(&session).unwrap(), 12);
    }

    #[test]
    fn compaction_is_persisted() {
        let mut db = ArchiveDb::open_in_memory().unwrap();
        let mut archive = TurnArchive::new(SessionId::from("alpha"), config());
        record(&mut archive, 1..=15, 0.0);
        archive.save_to_db(&mut db).unwrap();
        assert!(archive.compact(1));
        archive.save_to_db(&mut db).unwrap();

        let session = SessionId::from("alpha");
        assert_eq!(db.tier_row_count(&session, Tier::Recent).unwrap(), 0);
        let loaded = TurnArchive::load_from_db(&db, session, config()).unwrap();
        assert!(loaded.recent_deltas().is_empty());
        assert_eq!(loaded.current_states().len(), 6);
    }

    #[test]
    fn unknown_session_loads_empty() {
        let db = ArchiveDb::open_in_memory().unwrap();
        let archive = TurnArchive::load_from_db(&db, SessionId::from("ghost"), config()).unwrap();
        assert!(archive.current_states().is_empty());
        assert!(archive.scalar_trend().is_empty());
        assert_eq!(archive.last_turn(), 0);
    }

    #[test]
    fn status_history_survives_reload() {
        let mut db = ArchiveDb::open_in_memory().unwrap();
        let mut archive = TurnArchive::new(SessionId::from("alpha"), config());
        record(&mut archive, 1..=8, 0.0);
        archive.save_to_db(&mut db).unwrap();
        record(&mut archive, 9..=16, 0.0);
        archive.save_to_db(&mut db).unwrap();

        let loaded = TurnArchive::load_from_db(&db, SessionId::from("alpha"), config()).unwrap();
        let history = loaded.entity_status("ada");
        assert_eq!(history.len(), 10);
        assert_eq!(history.first(), Some(&"T7 alive @ harbor"));
        assert_eq!(history.last(), Some(&"T16 alive @ harbor"));
    }

    #[test]
    fn trend_and_status_rows_stay_bounded_over_long_campaign() {
        let mut db = ArchiveDb::open_in_memory().unwrap();
        let mut archive = TurnArchive::new(SessionId::from("alpha"), config());
        let session = SessionId::from("alpha");
        for chunk in 0..50 {
            let first = chunk * 10 + 1;
            record(&mut archive, first..=first + 9, 0.0);
            archive.save_to_db(&mut db).unwrap();
        }

        let cfg = config();
        assert_eq!(db.trend_row_count(&session).unwrap(), cfg.trend_cap());
        assert_eq!(db.status_row_count(&session).unwrap(), cfg.status_cap());

        let loaded = TurnArchive::load_from_db(&db, session, config()).unwrap();
        assert_eq!(loaded.scalar_trend(), archive.scalar_trend());
        assert_eq!(loaded.scalar_trend().first(), Some(&481.0));
        assert_eq!(loaded.entity_status("ada").first(), Some(&"T491 alive @ harbor"));
    }

    #[test]
    fn pruning_leaves_other_sessions_alone() {
        let mut db = ArchiveDb::open_in_memory().unwrap();
        let mut a = TurnArchive::new(SessionId::from("alpha"), config());
        let mut b = TurnArchive::new(SessionId::from("beta"), config());
        record(&mut a, 1..=5, 0.0);
        record(&mut b, 1..=3, 0.0);
        a.save_to_db(&mut db).unwrap();
        b.save_to_db(&mut db).unwrap();
        a.save_to_db(&mut db).unwrap();

        assert_eq!(db.trend_row_count(&SessionId::from("beta")).unwrap(), 3);
        assert_eq!(db.status_row_count(&SessionId::from("beta")).unwrap(), 3);
    }

    #[test]
    fn corrupt_row_is_skipped() {
        let mut db = ArchiveDb::open_in_memory().unwrap();
        let mut archive = TurnArchive::new(SessionId::from("alpha"), config());
        record(&mut archive, 1..=3, 0.0);
        archive.save_to_db(&mut db).unwrap();
        db.connection()
            .execute(
                "UPDATE archive_turns SET payload = 'not json' WHERE tier = 'current' AND turn = 2",
                [],
            )
            .unwrap();

        let loaded = TurnArchive::load_from_db(&db, SessionId::from("alpha"), config()).unwrap();
        assert_eq!(loaded.current_states().keys().copied().collect::<Vec<_>>(), vec![1, 3]);
    }
}
