use loom_core::errors::GatewayError;
use loom_core::tools::ToolError;
use loom_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("duplicate tool name: {0}")]
    DuplicateTool(String),

    #[error("unknown agent profile: {0}")]
    UnknownProfile(String),

    #[error("session {0} is archived")]
    SessionArchived(String),

    #[error("cancelled")]
    Cancelled,
}

impl EngineError {
    /// Short machine-readable kind, used in error events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Gateway(e) => e.error_kind(),
            Self::Store(_) => "store",
            Self::Tool(_) => "tool",
            Self::DuplicateTool(_) => "duplicate_tool",
            Self::UnknownProfile(_) => "unknown_profile",
            Self::SessionArchived(_) => "session_archived",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Gateway(e) => e.is_cancelled(),
            Self::Tool(ToolError::Cancelled) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_recognized_through_wrappers() {
        assert!(EngineError::Cancelled.is_cancelled());
        assert!(EngineError::Gateway(GatewayError::Cancelled).is_cancelled());
        assert!(!EngineError::Gateway(GatewayError::ProviderOverloaded).is_cancelled());
    }

    #[test]
    fn kind_delegates_to_gateway() {
        let err = EngineError::from(GatewayError::AuthenticationFailed("bad key".into()));
        assert_eq!(err.kind(), GatewayError::AuthenticationFailed(String::new()).error_kind());
        assert_eq!(EngineError::SessionArchived("s".into()).kind(), "session_archived");
    }
}
