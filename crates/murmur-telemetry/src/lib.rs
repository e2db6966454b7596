mod logging;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Output encoding for the stdout log stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "murmur_store" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    pub format: LogFormat,
    /// Whether to persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
    /// Rows kept in the log database; older rows are pruned at startup.
    pub log_retention_rows: u32,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            format: LogFormat::Json,
            log_to_sqlite: false,
            log_db_path: PathBuf::from("data/logs.db"),
            log_retention_rows: 10_000,
        }
    }
}

/// Keeps the persisted log sink reachable for queries.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
}

impl TelemetryGuard {
    /// Access the log sink for querying persisted logs.
    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }
}

/// Filter directive string derived from the config, e.g. `info,murmur_store=debug`.
pub fn filter_directives(config: &TelemetryConfig) -> String {
    let mut directives = config.log_level.to_string().to_lowercase();
    for (module, level) in &config.module_levels {
        directives.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    directives
}

/// Parse a level name as accepted on the command line and in settings files.
pub fn parse_level(name: &str) -> Option<Level> {
    name.trim().parse().ok()
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let directives = filter_directives(&config);
    let env_filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives))
    };

    let (json_layer, pretty_layer) = match config.format {
        LogFormat::Json => (
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_span_list(true),
            ),
            None,
        ),
        LogFormat::Pretty => (None, Some(tracing_subscriber::fmt::layer().pretty())),
    };

    let (sqlite_layer, sqlite_sink) = if config.log_to_sqlite {
        match SqliteLogSink::new(&config.log_db_path) {
            Ok(sink) => {
                if let Err(e) = sink.retain_latest(config.log_retention_rows) {
                    eprintln!("murmur-telemetry: failed to prune log DB: {e}");
                }
                let sink = Arc::new(sink);
                (Some(SqliteLogLayer::new(sink.clone())), Some(sink))
            }
            Err(e) => {
                eprintln!("murmur-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(json_layer.with_filter(env_filter()))
        .with(pretty_layer.with_filter(env_filter()))
        .with(sqlite_layer)
        .init();

    TelemetryGuard {
        log_sink: sqlite_sink,
    }
}
