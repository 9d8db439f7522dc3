//! SQLite persistence for proctor-daemon.
//!
//! This is the single-writer store backing the daemon. Sessions are a
//! materialized row per attempt; violations and review requests are
//! append-only child tables keyed by `(session_id, seq)`; notifications are
//! an outbox drained by the external notification service.

use chrono::{DateTime, Utc};
use proctor_protocol::{ReviewDecision, SessionStatus, Severity};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::machine::Effect;
use crate::session::{ProctoringSession, ReviewRequest, Violation};

#[derive(Debug, Clone)]
pub struct Db {
    path: PathBuf,
}

#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRow {
    pub id: i64,
    pub recipient: String,
    pub kind: String,
    pub session_id: String,
    pub payload: String,
    pub created_at: String,
}

impl Db {
    pub fn new(path: PathBuf) -> Result<Self, String> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    /// Writes the session row and the child rows named by `effects` in one
    /// transaction.
    pub fn persist(&self, session: &ProctoringSession, effects: &[Effect]) -> Result<(), String> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| format!("Failed to begin transaction: {}", err))?;
            upsert_session_row(&tx, session)?;
            for effect in effects {
                match effect {
                    Effect::ViolationAppended(seq) => {
                        let violation = session
                            .violation(*seq)
                            .ok_or_else(|| format!("Violation {} missing from session", seq))?;
                        insert_violation(&tx, &session.id, violation)?;
                    }
                    Effect::ReviewOpened(seq) | Effect::ReviewDecided(seq) => {
                        let review = session
                            .review(*seq)
                            .ok_or_else(|| format!("Review {} missing from session", seq))?;
                        upsert_review(&tx, &session.id, review)?;
                    }
                    Effect::Closed(_) => {}
                }
            }
            tx.commit()
                .map_err(|err| format!("Failed to commit session update: {}", err))
        })
    }

    pub fn load_session(&self, session_id: &str) -> Result<Option<ProctoringSession>, String> {
        self.with_connection(|conn| {
            let session = conn
                .query_row(
                    "SELECT id, exam_id, candidate_id, status, risk_score, environment_check, \
                        behavior, started_at, updated_at, ended_at, recordings \
                     FROM sessions WHERE id = ?1",
                    params![session_id],
                    session_from_row,
                )
                .optional()
                .map_err(|err| format!("Failed to query session: {}", err))?;

            match session {
                Some(row) => Ok(Some(hydrate(conn, row)?)),
                None => Ok(None),
            }
        })
    }

    /// Sessions that have not reached a terminal state, oldest first.
    pub fn list_live_sessions(&self) -> Result<Vec<ProctoringSession>, String> {
        self.with_connection(|conn| {
            let rows = {
                let mut stmt = conn
                    .prepare(
                        "SELECT id, exam_id, candidate_id, status, risk_score, environment_check, \
                            behavior, started_at, updated_at, ended_at, recordings \
                         FROM sessions WHERE status NOT IN ('terminated', 'completed') \
                         ORDER BY started_at ASC, id ASC",
                    )
                    .map_err(|err| format!("Failed to prepare sessions query: {}", err))?;
                let mapped = stmt
                    .query_map([], session_from_row)
                    .map_err(|err| format!("Failed to read session rows: {}", err))?;
                let mut rows = Vec::new();
                for row in mapped {
                    rows.push(row.map_err(|err| format!("Failed to decode session row: {}", err))?);
                }
                rows
            };

            let mut sessions = Vec::with_capacity(rows.len());
            for row in rows {
                sessions.push(hydrate(conn, row)?);
            }
            Ok(sessions)
        })
    }

    pub fn insert_notification(
        &self,
        recipient: &str,
        kind: &str,
        session_id: &str,
        payload: &Value,
        created_at: &DateTime<Utc>,
    ) -> Result<(), String> {
        let payload = serde_json::to_string(payload)
            .map_err(|err| format!("Failed to serialize notification payload: {}", err))?;
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO notifications (recipient, kind, session_id, payload, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![recipient, kind, session_id, payload, created_at.to_rfc3339()],
            )
            .map_err(|err| format!("Failed to insert notification: {}", err))?;
            Ok(())
        })
    }

    #[cfg(test)]
    pub fn list_notifications(&self, session_id: &str) -> Result<Vec<NotificationRow>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, recipient, kind, session_id, payload, created_at \
                     FROM notifications WHERE session_id = ?1 ORDER BY id ASC",
                )
                .map_err(|err| format!("Failed to prepare notifications query: {}", err))?;
            let rows = stmt
                .query_map(params![session_id], |row| {
                    Ok(NotificationRow {
                        id: row.get(0)?,
                        recipient: row.get(1)?,
                        kind: row.get(2)?,
                        session_id: row.get(3)?,
                        payload: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                })
                .map_err(|err| format!("Failed to read notification rows: {}", err))?;

            let mut entries = Vec::new();
            for row in rows {
                entries.push(row.map_err(|err| format!("Failed to decode notification: {}", err))?);
            }
            Ok(entries)
        })
    }

    fn init_schema(&self) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    exam_id TEXT NOT NULL,
                    candidate_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    risk_score INTEGER NOT NULL DEFAULT 0,
                    environment_check TEXT NOT NULL,
                    behavior TEXT NOT NULL,
                    started_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    ended_at TEXT,
                    recordings TEXT
                 );
                 CREATE INDEX IF NOT EXISTS sessions_status ON sessions (status);
                 CREATE TABLE IF NOT EXISTS violations (
                    session_id TEXT NOT NULL,
                    seq INTEGER NOT NULL,
                    violation_type TEXT NOT NULL,
                    severity TEXT NOT NULL,
                    description TEXT NOT NULL,
                    metadata TEXT NOT NULL,
                    recorded_at TEXT NOT NULL,
                    PRIMARY KEY (session_id, seq)
                 );
                 CREATE TABLE IF NOT EXISTS review_requests (
                    session_id TEXT NOT NULL,
                    seq INTEGER NOT NULL,
                    reason TEXT NOT NULL,
                    violations_snapshot TEXT NOT NULL,
                    risk_score_snapshot INTEGER NOT NULL,
                    requested_at TEXT NOT NULL,
                    decision TEXT NOT NULL,
                    decided_by TEXT,
                    decided_at TEXT,
                    comments TEXT,
                    PRIMARY KEY (session_id, seq)
                 );
                 CREATE TABLE IF NOT EXISTS notifications (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    recipient TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    session_id TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    created_at TEXT NOT NULL
                 );
                 COMMIT;",
            )
            .map_err(|err| format!("Failed to initialize schema: {}", err))
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection, String> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| format!("Failed to create daemon data dir: {}", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| format!("Failed to open sqlite db: {}", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| format!("Failed to enable WAL: {}", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| format!("Failed to set synchronous: {}", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| format!("Failed to set busy_timeout: {}", err))?;

        Ok(conn)
    }
}

/// Raw session columns, before child rows are attached.
struct SessionRow {
    id: String,
    exam_id: String,
    candidate_id: String,
    status: String,
    risk_score: i64,
    environment_check: String,
    behavior: String,
    started_at: String,
    updated_at: String,
    ended_at: Option<String>,
    recordings: Option<String>,
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: row.get(0)?,
        exam_id: row.get(1)?,
        candidate_id: row.get(2)?,
        status: row.get(3)?,
        risk_score: row.get(4)?,
        environment_check: row.get(5)?,
        behavior: row.get(6)?,
        started_at: row.get(7)?,
        updated_at: row.get(8)?,
        ended_at: row.get(9)?,
        recordings: row.get(10)?,
    })
}

fn hydrate(conn: &Connection, row: SessionRow) -> Result<ProctoringSession, String> {
    let status = SessionStatus::parse(&row.status)
        .ok_or_else(|| format!("Unknown session status '{}' for {}", row.status, row.id))?;
    let behavior: BTreeMap<String, u64> = serde_json::from_str(&row.behavior)
        .map_err(|err| format!("Failed to parse behavior counters: {}", err))?;
    let violations = load_violations(conn, &row.id)?;
    let reviews = load_reviews(conn, &row.id)?;

    Ok(ProctoringSession {
        status,
        risk_score: row.risk_score.clamp(0, 100) as u32,
        violations,
        environment_check: parse_json(&row.environment_check),
        behavior,
        reviews,
        started_at: require_time(&row.started_at, "started_at")?,
        updated_at: require_time(&row.updated_at, "updated_at")?,
        ended_at: row.ended_at.as_deref().and_then(parse_rfc3339),
        recordings: row.recordings.as_deref().map(parse_json),
        id: row.id,
        exam_id: row.exam_id,
        candidate_id: row.candidate_id,
    })
}

fn load_violations(conn: &Connection, session_id: &str) -> Result<Vec<Violation>, String> {
    let mut stmt = conn
        .prepare(
            "SELECT seq, violation_type, severity, description, metadata, recorded_at \
             FROM violations WHERE session_id = ?1 ORDER BY seq ASC",
        )
        .map_err(|err| format!("Failed to prepare violations query: {}", err))?;
    let rows = stmt
        .query_map(params![session_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })
        .map_err(|err| format!("Failed to read violation rows: {}", err))?;

    let mut violations = Vec::new();
    for row in rows {
        let (seq, violation_type, severity, description, metadata, recorded_at) =
            row.map_err(|err| format!("Failed to decode violation row: {}", err))?;
        violations.push(Violation {
            seq: seq as u32,
            violation_type,
            severity: Severity::parse(&severity)
                .ok_or_else(|| format!("Unknown severity '{}'", severity))?,
            description,
            metadata: parse_json(&metadata),
            recorded_at: require_time(&recorded_at, "recorded_at")?,
        });
    }
    Ok(violations)
}

fn load_reviews(conn: &Connection, session_id: &str) -> Result<Vec<ReviewRequest>, String> {
    let mut stmt = conn
        .prepare(
            "SELECT seq, reason, violations_snapshot, risk_score_snapshot, requested_at, \
                decision, decided_by, decided_at, comments \
             FROM review_requests WHERE session_id = ?1 ORDER BY seq ASC",
        )
        .map_err(|err| format!("Failed to prepare reviews query: {}", err))?;
    let rows = stmt
        .query_map(params![session_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<String>>(8)?,
            ))
        })
        .map_err(|err| format!("Failed to read review rows: {}", err))?;

    let mut reviews = Vec::new();
    for row in rows {
        let (seq, reason, snapshot, score, requested_at, decision, decided_by, decided_at, comments) =
            row.map_err(|err| format!("Failed to decode review row: {}", err))?;
        reviews.push(ReviewRequest {
            seq: seq as u32,
            reason,
            violations_snapshot: parse_json(&snapshot),
            risk_score_snapshot: score.clamp(0, 100) as u32,
            requested_at: require_time(&requested_at, "requested_at")?,
            decision: ReviewDecision::parse(&decision)
                .ok_or_else(|| format!("Unknown review decision '{}'", decision))?,
            decided_by,
            decided_at: decided_at.as_deref().and_then(parse_rfc3339),
            comments,
        });
    }
    Ok(reviews)
}

fn upsert_session_row(tx: &Transaction<'_>, session: &ProctoringSession) -> Result<(), String> {
    let environment_check = serde_json::to_string(&session.environment_check)
        .map_err(|err| format!("Failed to serialize environment check: {}", err))?;
    let behavior = serde_json::to_string(&session.behavior)
        .map_err(|err| format!("Failed to serialize behavior counters: {}", err))?;
    let recordings = match &session.recordings {
        Some(value) => Some(
            serde_json::to_string(value)
                .map_err(|err| format!("Failed to serialize recordings: {}", err))?,
        ),
        None => None,
    };

    tx.execute(
        "INSERT INTO sessions \
            (id, exam_id, candidate_id, status, risk_score, environment_check, behavior, \
             started_at, updated_at, ended_at, recordings) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
         ON CONFLICT(id) DO UPDATE SET \
            status = excluded.status, \
            risk_score = excluded.risk_score, \
            behavior = excluded.behavior, \
            updated_at = excluded.updated_at, \
            ended_at = excluded.ended_at, \
            recordings = excluded.recordings",
        params![
            session.id,
            session.exam_id,
            session.candidate_id,
            session.status.as_str(),
            session.risk_score,
            environment_check,
            behavior,
            session.started_at.to_rfc3339(),
            session.updated_at.to_rfc3339(),
            session.ended_at.map(|value| value.to_rfc3339()),
            recordings,
        ],
    )
    .map_err(|err| format!("Failed to upsert session: {}", err))?;
    Ok(())
}

fn insert_violation(tx: &Transaction<'_>, session_id: &str, violation: &Violation) -> Result<(), String> {
    let metadata = serde_json::to_string(&violation.metadata)
        .map_err(|err| format!("Failed to serialize violation metadata: {}", err))?;
    tx.execute(
        "INSERT INTO violations \
            (session_id, seq, violation_type, severity, description, metadata, recorded_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            session_id,
            violation.seq,
            violation.violation_type,
            violation.severity.as_str(),
            violation.description,
            metadata,
            violation.recorded_at.to_rfc3339(),
        ],
    )
    .map_err(|err| format!("Failed to insert violation: {}", err))?;
    Ok(())
}

fn upsert_review(tx: &Transaction<'_>, session_id: &str, review: &ReviewRequest) -> Result<(), String> {
    let snapshot = serde_json::to_string(&review.violations_snapshot)
        .map_err(|err| format!("Failed to serialize violations snapshot: {}", err))?;
    tx.execute(
        "INSERT INTO review_requests \
            (session_id, seq, reason, violations_snapshot, risk_score_snapshot, requested_at, \
             decision, decided_by, decided_at, comments) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
         ON CONFLICT(session_id, seq) DO UPDATE SET \
            decision = excluded.decision, \
            decided_by = excluded.decided_by, \
            decided_at = excluded.decided_at, \
            comments = excluded.comments",
        params![
            session_id,
            review.seq,
            review.reason,
            snapshot,
            review.risk_score_snapshot,
            review.requested_at.to_rfc3339(),
            review.decision.as_str(),
            review.decided_by,
            review.decided_at.map(|value| value.to_rfc3339()),
            review.comments,
        ],
    )
    .map_err(|err| format!("Failed to upsert review request: {}", err))?;
    Ok(())
}

fn parse_json(value: &str) -> Value {
    serde_json::from_str(value).unwrap_or(Value::Null)
}

fn require_time(value: &str, field: &str) -> Result<DateTime<Utc>, String> {
    parse_rfc3339(value).ok_or_else(|| format!("Invalid {} timestamp '{}'", field, value))
}

fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
