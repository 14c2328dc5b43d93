mod logging;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("log database: {0}")]
    Sink(#[from] rusqlite::Error),
    #[error("invalid log filter {filter:?}: {detail}")]
    Filter { filter: String, detail: String },
    #[error("a global subscriber is already installed")]
    AlreadyInitialized,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Default level. `RUST_LOG` wins when set.
    pub level: String,
    /// Per-module overrides, e.g. `("loom_llm", "debug")`.
    pub module_levels: Vec<(String, String)>,
    pub format: LogFormat,
    /// When set, WARN and above are also written to this SQLite file.
    pub log_db_path: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            module_levels: Vec::new(),
            format: LogFormat::default(),
            log_db_path: None,
        }
    }
}

impl TelemetryConfig {
    /// Filter directive string built from the level and overrides.
    pub fn directives(&self) -> String {
        let mut out = self.level.to_lowercase();
        for (module, level) in &self.module_levels {
            out.push_str(&format!(",{module}={}", level.to_lowercase()));
        }
        out
    }
}

/// Keeps the log sink alive for querying after init.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
}

impl TelemetryGuard {
    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }
}

/// Install the global subscriber. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let directives = config.directives();
            EnvFilter::try_new(&directives).map_err(|e| TelemetryError::Filter {
                filter: directives.clone(),
                detail: e.to_string(),
            })?
        }
    };

    let fmt_layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let log_sink = match &config.log_db_path {
        Some(path) => Some(Arc::new(SqliteLogSink::open(path)?)),
        None => None,
    };
    let sqlite_layer = log_sink.clone().map(SqliteLogLayer::new);

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .with(sqlite_layer)
        .try_init()
        .map_err(|_| TelemetryError::AlreadyInitialized)?;

    Ok(TelemetryGuard { log_sink })
}
