use std::path::PathBuf;

use rusqlite::{params, OptionalExtension};
use tracing::{debug, instrument};

use loom_core::files::FileTracker;
use loom_core::ids::{MessageId, SessionId};
use loom_core::messages::Message;
use loom_core::session::{MessageRecord, Session, TodoList};
use loom_core::tokens::AccumulatedTokens;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, enum_tag, parse_enum, parse_json, parse_time};
use crate::store::{SessionStore, SessionSummary};

/// SQLite-backed store. One row per session, one row per message keyed by
/// `(session_id, seq)` where `seq` is the append position.
#[derive(Clone)]
pub struct SqliteSessionStore {
    db: Database,
}

impl SqliteSessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl SessionStore for SqliteSessionStore {
    #[instrument(skip(self, session), fields(session_id = %session.id, messages = session.messages.len()))]
    fn save(&self, session: &Session) -> Result<(), StoreError> {
        let todos = serde_json::to_string(&session.todos)?;
        let files = serde_json::to_string(&session.files)?;
        let tokens = serde_json::to_string(&session.tokens)?;
        let mode = enum_tag(&session.mode)?;
        let status = enum_tag(&session.status)?;

        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO sessions (id, working_directory, mode, status, step, todos, files, tokens, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(id) DO UPDATE SET
                    working_directory = excluded.working_directory,
                    mode = excluded.mode,
                    status = excluded.status,
                    step = excluded.step,
                    todos = excluded.todos,
                    files = excluded.files,
                    tokens = excluded.tokens,
                    updated_at = excluded.updated_at",
                params![
                    session.id.as_str(),
                    session.working_directory.to_string_lossy(),
                    mode,
                    status,
                    session.step,
                    todos,
                    files,
                    tokens,
                    session.created_at.to_rfc3339(),
                    session.updated_at.to_rfc3339(),
                ],
            )?;

            {
                // Records are append-only, so only the deleted flag can change
                // for a seq that already exists.
                let mut upsert = tx.prepare_cached(
                    "INSERT INTO messages (session_id, seq, id, role, payload, token_estimate, deleted, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(session_id, seq) DO UPDATE SET deleted = excluded.deleted",
                )?;
                for (seq, record) in session.messages.iter().enumerate() {
                    let payload = serde_json::to_string(&record.message)?;
                    upsert.execute(params![
                        session.id.as_str(),
                        seq as i64,
                        record.id.as_str(),
                        record.message.role(),
                        payload,
                        record.token_estimate,
                        record.deleted,
                        record.created_at.to_rfc3339(),
                    ])?;
                }
            }

            tx.execute(
                "DELETE FROM messages WHERE session_id = ?1 AND seq >= ?2",
                params![session.id.as_str(), session.messages.len() as i64],
            )?;
            tx.commit()?;
            debug!("session saved");
            Ok(())
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    fn load(&self, id: &SessionId) -> Result<Session, StoreError> {
        self.db.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT working_directory, mode, status, step, todos, files, tokens, created_at, updated_at
                     FROM sessions WHERE id = ?1",
                    [id.as_str()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, u32>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, String>(6)?,
                            row.get::<_, String>(7)?,
                            row.get::<_, String>(8)?,
                        ))
                    },
                )
                .optional()?
                .ok_or_else(|| StoreError::SessionNotFound(id.clone()))?;
            let (working_directory, mode, status, step, todos, files, tokens, created_at, updated_at) = row;

            let mut stmt = conn.prepare(
                "SELECT id, payload, token_estimate, deleted, created_at
                 FROM messages WHERE session_id = ?1 ORDER BY seq",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            let mut messages = Vec::new();
            while let Some(row) = rows.next()? {
                messages.push(message_from_row(row)?);
            }

            Ok(Session {
                id: id.clone(),
                working_directory: PathBuf::from(working_directory),
                mode: parse_enum(&mode, "sessions", "mode")?,
                status: parse_enum(&status, "sessions", "status")?,
                step,
                messages,
                todos: parse_json::<TodoList>(&todos, "sessions", "todos")?,
                files: parse_json::<FileTracker>(&files, "sessions", "files")?,
                tokens: parse_json::<AccumulatedTokens>(&tokens, "sessions", "tokens")?,
                created_at: parse_time(&created_at, "sessions", "created_at")?,
                updated_at: parse_time(&updated_at, "sessions", "updated_at")?,
            })
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    fn archive(&self, id: &SessionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sessions SET status = 'archived', updated_at = ?1 WHERE id = ?2",
                params![chrono::Utc::now().to_rfc3339(), id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::SessionNotFound(id.clone()));
            }
            Ok(())
        })
    }

    fn list(&self, limit: usize) -> Result<Vec<SessionSummary>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT s.id, s.working_directory, s.mode, s.status, s.updated_at,
                        (SELECT COUNT(*) FROM messages m WHERE m.session_id = s.id)
                 FROM sessions s
                 ORDER BY s.updated_at DESC
                 LIMIT ?1",
            )?;
            let mut rows = stmt.query([limit as i64])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mode: String = row_helpers::get(row, 2, "sessions", "mode")?;
                let status: String = row_helpers::get(row, 3, "sessions", "status")?;
                let updated_at: String = row_helpers::get(row, 4, "sessions", "updated_at")?;
                let count: i64 = row_helpers::get(row, 5, "messages", "count")?;
                out.push(SessionSummary {
                    id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
                    working_directory: PathBuf::from(row_helpers::get::<String>(
                        row,
                        1,
                        "sessions",
                        "working_directory",
                    )?),
                    mode: parse_enum(&mode, "sessions", "mode")?,
                    status: parse_enum(&status, "sessions", "status")?,
                    message_count: count.max(0) as usize,
                    updated_at: parse_time(&updated_at, "sessions", "updated_at")?,
                });
            }
            Ok(out)
        })
    }
}

fn message_from_row(row: &rusqlite::Row<'_>) -> Result<MessageRecord, StoreError> {
    let id: String = row_helpers::get(row, 0, "messages", "id")?;
    let payload: String = row_helpers::get(row, 1, "messages", "payload")?;
    let created_at: String = row_helpers::get(row, 4, "messages", "created_at")?;
    Ok(MessageRecord {
        id: MessageId::from_raw(id),
        message: parse_json::<Message>(&payload, "messages", "payload")?,
        token_estimate: row_helpers::get(row, 2, "messages", "token_estimate")?,
        deleted: row_helpers::get(row, 3, "messages", "deleted")?,
        created_at: parse_time(&created_at, "messages", "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;

    fn store() -> SqliteSessionStore {
        SqliteSessionStore::new(Database::in_memory().unwrap())
    }

    #[test]
    fn round_trip_preserves_state() {
        contract::round_trip_preserves_state(&store());
    }

    #[test]
    fn save_is_idempotent_and_tracks_deletes() {
        contract::save_is_idempotent_and_tracks_deletes(&store());
    }

    #[test]
    fn loaded_state_is_independent() {
        contract::loaded_state_is_independent(&store());
    }

    #[test]
    fn archive_and_list() {
        contract::archive_and_list(&store());
    }

    #[test]
    fn missing_session_is_not_found() {
        contract::missing_session_is_not_found(&store());
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let session = contract::sample_session();
        SqliteSessionStore::new(Database::open(&path).unwrap())
            .save(&session)
            .unwrap();

        let reopened = SqliteSessionStore::new(Database::open(&path).unwrap());
        let loaded = reopened.load(&session.id).unwrap();
        assert_eq!(loaded.messages.len(), session.messages.len());
        assert_eq!(loaded.files, session.files);
    }

    #[test]
    fn corrupt_payload_is_reported() {
        let db = Database::in_memory().unwrap();
        let store = SqliteSessionStore::new(db.clone());
        let session = contract::sample_session();
        store.save(&session).unwrap();
        db.with_conn(|conn| {
            conn.execute("UPDATE messages SET payload = 'garbage' WHERE seq = 0", [])?;
            Ok(())
        })
        .unwrap();

        assert!(matches!(
            store.load(&session.id),
            Err(StoreError::CorruptRow { table: "messages", column: "payload", .. })
        ));
    }

    #[test]
    fn truncated_history_drops_stale_rows() {
        let db = Database::in_memory().unwrap();
        let store = SqliteSessionStore::new(db.clone());
        let mut session = contract::sample_session();
        store.save(&session).unwrap();
        session.messages.truncate(2);
        store.save(&session).unwrap();

        let rows: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
                    [session.id.as_str()],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(rows, 2);
    }
}
