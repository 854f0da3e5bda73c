//! Settings types. Every struct uses `#[serde(default)]` so a partial user
//! file only overrides what it names.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClonarSettings {
    pub server: ServerSettings,
    pub admission: AdmissionSettings,
    pub breaker: BreakerSettings,
    pub planner: PlannerSettings,
    pub executor: ExecutorSettings,
    pub intent: IntentSettings,
    pub sessions: SessionSettings,
    pub llm: LlmSettings,
    pub tools: ToolSettings,
    pub telemetry: TelemetrySettings,
}

/// HTTP surface settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    pub port: u16,
    /// SSE keep-alive interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// How long a queued request waits for capacity before giving up.
    pub queue_wait_timeout_ms: u64,
    /// Interval of the session / rate-window sweeper.
    pub sweep_interval_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            heartbeat_interval_ms: 15_000,
            queue_wait_timeout_ms: 30_000,
            sweep_interval_ms: 30_000,
        }
    }
}

impl ServerSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn queue_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_wait_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Admission control limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdmissionSettings {
    /// Global in-flight query cap.
    pub max_concurrent: usize,
    /// Bounded wait queue length.
    pub max_queue: usize,
    /// In-flight cap per user identity.
    pub max_per_user: usize,
    /// Requests allowed per caller key per window.
    pub rate_limit: u32,
    pub rate_window_ms: u64,
    /// Dependencies whose open breaker rejects new queries outright.
    pub required_dependencies: Vec<String>,
    /// Calls allowed per external dependency per window (0 disables).
    pub dependency_rate_limit: u32,
    pub dependency_rate_window_ms: u64,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            max_queue: 20,
            max_per_user: 2,
            rate_limit: 30,
            rate_window_ms: 60_000,
            required_dependencies: Vec::new(),
            dependency_rate_limit: 0,
            dependency_rate_window_ms: 1_000,
        }
    }
}

impl AdmissionSettings {
    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }

    pub fn dependency_rate_window(&self) -> Duration {
        Duration::from_millis(self.dependency_rate_window_ms)
    }
}

/// Circuit breaker tuning, shared by every dependency.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerSettings {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    /// Upper bound for the doubled cooldown after failed trials.
    pub max_cooldown_ms: u64,
    /// Random spread applied to reopened cooldowns, as a fraction.
    pub jitter_factor: f64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
            max_cooldown_ms: 300_000,
            jitter_factor: 0.1,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlannerSettings {
    pub timeout_ms: u64,
    /// Conversation turns included in the planning prompt.
    pub max_history: usize,
    /// Tool names the planner may emit. Empty means every tool.
    pub allowed_tools: Vec<String>,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_history: 6,
            allowed_tools: Vec::new(),
        }
    }
}

impl PlannerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutorSettings {
    pub step_timeout_ms: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            step_timeout_ms: 8_000,
        }
    }
}

impl ExecutorSettings {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IntentSettings {
    /// Minimum confidence for a stage result to be accepted.
    pub confidence_threshold: f32,
    pub classifier_timeout_ms: u64,
    pub embedding_timeout_ms: u64,
}

impl Default for IntentSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            classifier_timeout_ms: 3_000,
            embedding_timeout_ms: 2_000,
        }
    }
}

impl IntentSettings {
    pub fn classifier_timeout(&self) -> Duration {
        Duration::from_millis(self.classifier_timeout_ms)
    }

    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_millis(self.embedding_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// How long a terminated, unobserved session stays replayable.
    pub retention_ms: u64,
    /// How long a session with no subscriber keeps running before it is aborted.
    pub reconnect_grace_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            retention_ms: 300_000,
            reconnect_grace_ms: 15_000,
        }
    }
}

impl SessionSettings {
    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_millis(self.reconnect_grace_ms)
    }
}

/// Language model endpoint settings (OpenAI-compatible API).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LlmSettings {
    pub base_url: String,
    pub model: String,
    pub embedding_model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub request_timeout_ms: u64,
    pub answer_timeout_ms: u64,
    pub follow_up_timeout_ms: u64,
    pub rewrite_timeout_ms: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            request_timeout_ms: 30_000,
            answer_timeout_ms: 25_000,
            follow_up_timeout_ms: 5_000,
            rewrite_timeout_ms: 3_000,
        }
    }
}

impl LlmSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn answer_timeout(&self) -> Duration {
        Duration::from_millis(self.answer_timeout_ms)
    }

    pub fn follow_up_timeout(&self) -> Duration {
        Duration::from_millis(self.follow_up_timeout_ms)
    }

    pub fn rewrite_timeout(&self) -> Duration {
        Duration::from_millis(self.rewrite_timeout_ms)
    }
}

/// Retrieval provider settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolSettings {
    pub serpapi_endpoint: String,
    /// Environment variable holding the SerpAPI key.
    pub serpapi_key_env: String,
    /// Interface language.
    pub hl: String,
    /// Country.
    pub gl: String,
    pub max_results: usize,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            serpapi_endpoint: "https://serpapi.com/search.json".to_string(),
            serpapi_key_env: "SERPAPI_KEY".to_string(),
            hl: "en".to_string(),
            gl: "us".to_string(),
            max_results: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetrySettings {
    /// Default level, overridden by `RUST_LOG`.
    pub log_level: String,
    /// Persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    /// Log database path; defaults to `~/.clonar/database/logs.db`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_db_path: Option<String>,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_sqlite: true,
            log_db_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let s = ClonarSettings::default();
        assert_eq!(s.admission.max_concurrent, 5);
        assert_eq!(s.admission.max_queue, 20);
        assert_eq!(s.admission.rate_limit, 30);
        assert_eq!(s.admission.rate_window(), Duration::from_secs(60));
        assert_eq!(s.sessions.retention(), Duration::from_secs(300));
        assert!((s.intent.confidence_threshold - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(ClonarSettings::default()).unwrap();
        assert!(json["admission"]["maxConcurrent"].is_number());
        assert!(json["sessions"]["reconnectGraceMs"].is_number());
        assert!(json["telemetry"].get("logDbPath").is_none());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let s: ClonarSettings =
            serde_json::from_str(r#"{"admission":{"maxQueue":3}}"#).unwrap();
        assert_eq!(s.admission.max_queue, 3);
        assert_eq!(s.admission.max_concurrent, 5);
        assert_eq!(s.server.port, 8000);
    }
}
