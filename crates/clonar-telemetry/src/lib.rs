//! Structured logging for the orchestration runtime.
//!
//! Everything is emitted through `tracing`. Stdout gets JSON lines filtered by
//! `RUST_LOG` (falling back to the configured level), and warn+ events are
//! optionally persisted to a SQLite table tagged with `session_id` and
//! `user_key` so failed or aborted sessions can be inspected after the fact.

mod logging;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "clonar_engine" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Whether to persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    /// Path to the log database.
    pub log_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            log_to_sqlite: true,
            log_db_path: default_log_db_path(),
        }
    }
}

impl TelemetryConfig {
    /// Build a config from the string level carried in settings.
    ///
    /// Unknown level names fall back to `INFO`.
    pub fn from_parts(log_level: &str, log_to_sqlite: bool, log_db_path: Option<PathBuf>) -> Self {
        Self {
            log_level: parse_level(log_level).unwrap_or(Level::INFO),
            module_levels: Vec::new(),
            log_to_sqlite,
            log_db_path: log_db_path.unwrap_or_else(default_log_db_path),
        }
    }

    fn filter_directive(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Guard returned by [`init_telemetry`]. Holds the log sink alive.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
}

impl TelemetryGuard {
    /// Access the log sink for querying persisted logs.
    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_span_list(true)
        .with_filter(env_filter);

    let (sqlite_layer, sqlite_sink) = if config.log_to_sqlite {
        match SqliteLogSink::new(&config.log_db_path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                (Some(SqliteLogLayer::new(sink.clone())), Some(sink))
            }
            Err(e) => {
                eprintln!("clonar-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    // `try_init` so a second call (tests, embedding) is harmless.
    let _ = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sqlite_layer)
        .try_init();

    TelemetryGuard { log_sink: sqlite_sink }
}

fn parse_level(raw: &str) -> Option<Level> {
    raw.trim().parse::<Level>().ok()
}

fn default_log_db_path() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".clonar")
        .join("database/logs.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_parts_parses_level() {
        let config = TelemetryConfig::from_parts("debug", false, None);
        assert_eq!(config.log_level, Level::DEBUG);
        assert!(!config.log_to_sqlite);
    }

    #[test]
    fn unknown_level_falls_back_to_info() {
        let config = TelemetryConfig::from_parts("chatty", true, Some("/tmp/x.db".into()));
        assert_eq!(config.log_level, Level::INFO);
        assert_eq!(config.log_db_path, PathBuf::from("/tmp/x.db"));
    }

    #[test]
    fn filter_directive_includes_module_levels() {
        let mut config = TelemetryConfig::default();
        config.module_levels.push(("clonar_admission".into(), Level::TRACE));
        assert_eq!(config.filter_directive(), "info,clonar_admission=trace");
    }
}
