use chrono::Utc;
use dashmap::DashMap;

use loom_core::ids::SessionId;
use loom_core::session::{Session, SessionStatus};

use crate::error::StoreError;
use crate::store::{SessionStore, SessionSummary};

/// In-process store for tests and ephemeral runs.
///
/// Sessions are kept serialized so a loaded copy never shares its todo list
/// or file tracker with the saved one.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: DashMap<SessionId, String>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl SessionStore for MemorySessionStore {
    fn save(&self, session: &Session) -> Result<(), StoreError> {
        let json = serde_json::to_string(session)?;
        let _ = self.sessions.insert(session.id.clone(), json);
        Ok(())
    }

    fn load(&self, id: &SessionId) -> Result<Session, StoreError> {
        let entry = self
            .sessions
            .get(id)
            .ok_or_else(|| StoreError::SessionNotFound(id.clone()))?;
        Ok(serde_json::from_str(entry.value())?)
    }

    fn archive(&self, id: &SessionId) -> Result<(), StoreError> {
        let mut session = self.load(id)?;
        session.status = SessionStatus::Archived;
        session.updated_at = Utc::now();
        self.save(&session)
    }

    fn list(&self, limit: usize) -> Result<Vec<SessionSummary>, StoreError> {
        let mut out = Vec::with_capacity(self.sessions.len());
        for entry in self.sessions.iter() {
            let session: Session = serde_json::from_str(entry.value())?;
            out.push(SessionSummary {
                message_count: session.messages.len(),
                id: session.id,
                working_directory: session.working_directory,
                mode: session.mode,
                status: session.status,
                updated_at: session.updated_at,
            });
        }
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        out.truncate(limit);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;

    #[test]
    fn round_trip_preserves_state() {
        contract::round_trip_preserves_state(&MemorySessionStore::new());
    }

    #[test]
    fn save_is_idempotent_and_tracks_deletes() {
        let store = MemorySessionStore::new();
        contract::save_is_idempotent_and_tracks_deletes(&store);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn loaded_state_is_independent() {
        contract::loaded_state_is_independent(&MemorySessionStore::new());
    }

    #[test]
    fn archive_and_list() {
        contract::archive_and_list(&MemorySessionStore::new());
    }

    #[test]
    fn missing_session_is_not_found() {
        let store = MemorySessionStore::new();
        contract::missing_session_is_not_found(&store);
        assert!(store.is_empty());
    }
}
