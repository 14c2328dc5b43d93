use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use loom_core::ids::SessionId;
use loom_core::session::{Session, SessionMode, SessionStatus};

use crate::error::StoreError;

/// Listing row; cheaper than loading the full session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub working_directory: PathBuf,
    pub mode: SessionMode,
    pub status: SessionStatus,
    pub message_count: usize,
    pub updated_at: DateTime<Utc>,
}

/// Durable home for sessions.
///
/// `save` is idempotent: saving the same session twice leaves one copy, and
/// soft-delete flags flipped since the last save are written through.
/// Sessions are archived, never removed.
pub trait SessionStore: Send + Sync {
    fn save(&self, session: &Session) -> Result<(), StoreError>;

    fn load(&self, id: &SessionId) -> Result<Session, StoreError>;

    fn archive(&self, id: &SessionId) -> Result<(), StoreError>;

    /// Most recently updated first.
    fn list(&self, limit: usize) -> Result<Vec<SessionSummary>, StoreError>;
}
