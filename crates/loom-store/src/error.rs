use loom_core::ids::SessionId;

/// Failures surfaced by [`SessionStore`](crate::SessionStore) implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Opening failed while applying pragmas or creating tables.
    #[error("database setup ({step}): {source}")]
    Setup {
        step: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: u32, supported: u32 },

    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
