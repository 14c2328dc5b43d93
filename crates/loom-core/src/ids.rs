//! Opaque string identifiers.
//!
//! Generated ids are `<prefix>_<uuid v7>`, so ids of one kind sort by creation
//! time. Ids handed to us from elsewhere (provider tool-call ids, ids typed on
//! the command line) are kept verbatim.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! prefixed_id {
    ($(#[$meta:meta])* $name:ident => $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            pub fn new() -> Self {
                Self(format!("{}_{}", Self::PREFIX, Uuid::now_v7()))
            }

            /// Wrap an existing id without validation.
            pub fn from_raw(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self::from_raw(raw)
            }
        }
    };
}

prefixed_id!(SessionId => "sess");
prefixed_id!(
    /// One stored message record.
    MessageId => "msg"
);
prefixed_id!(
    /// Normally assigned by the provider; generated only when a stream omits one.
    ToolCallId => "call"
);
prefixed_id!(
    /// One engine instance. Sub-agents get their own.
    AgentId => "agent"
);
