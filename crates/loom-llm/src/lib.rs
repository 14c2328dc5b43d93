pub mod anthropic;
pub mod assemble;
pub mod config;
mod http;
pub mod models;
pub mod openai;
pub mod reliable;
pub mod sse;
pub mod usage;

pub mod mock;

pub use anthropic::AnthropicProvider;
pub use config::{build_provider, ProviderConfig};
pub use openai::OpenAiProvider;
pub use reliable::{ReliableConfig, ReliableProvider};
