pub mod cancel;
pub mod context;
pub mod errors;
pub mod events;
pub mod files;
pub mod ids;
pub mod messages;
pub mod provider;
pub mod security;
pub mod session;
pub mod stream;
pub mod tokens;
pub mod tools;
