use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use clonar_admission::{AdmissionController, RateLimiter};
use clonar_engine::QueryPipeline;
use clonar_settings::ClonarSettings;
use clonar_store::{start_sweeper, SessionStore};

use crate::handlers;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub heartbeat_interval: Duration,
    pub queue_wait_timeout: Duration,
    pub sweep_interval: Duration,
    pub reconnect_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&ClonarSettings::default())
    }
}

impl From<&ClonarSettings> for ServerConfig {
    fn from(s: &ClonarSettings) -> Self {
        Self {
            host: s.server.host.clone(),
            port: s.server.port,
            heartbeat_interval: s.server.heartbeat_interval(),
            queue_wait_timeout: s.server.queue_wait_timeout(),
            sweep_interval: s.server.sweep_interval(),
            reconnect_grace: s.sessions.reconnect_grace(),
        }
    }
}

/// Shared application state passed to Axum handlers. Built once at startup.
#[derive(Clone)]
pub struct AppState {
    pub admission: AdmissionController,
    pub sessions: Arc<SessionStore>,
    pub pipeline: Arc<QueryPipeline>,
    pub config: Arc<ServerConfig>,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        admission: AdmissionController,
        sessions: Arc<SessionStore>,
        pipeline: Arc<QueryPipeline>,
    ) -> Self {
        Self {
            admission,
            sessions,
            pipeline,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/query", post(handlers::submit_query))
        .route("/reconnect/{session_id}", post(handlers::reconnect))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Periodically drop expired rate windows (caller and per-dependency).
fn start_rate_window_purge(
    admission: AdmissionController,
    dependency_limiter: Option<Arc<RateLimiter>>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let mut purged = admission.purge_rate_windows();
                    if let Some(limiter) = &dependency_limiter {
                        purged += limiter.purge_expired();
                    }
                    if purged > 0 {
                        tracing::debug!(purged, "expired rate windows purged");
                    }
                }
            }
        }
    })
}

/// Bind, serve and start the sweepers. Returns a handle to shut it all down.
pub async fn start(state: AppState) -> Result<ServerHandle, std::io::Error> {
    let config = Arc::clone(&state.config);
    let shutdown = state.shutdown.clone();

    let sweeper = start_sweeper(
        Arc::clone(&state.sessions),
        config.sweep_interval,
        shutdown.clone(),
    );
    let purge = start_rate_window_purge(
        state.admission.clone(),
        state.pipeline.executor().rate_limiter(),
        config.sweep_interval,
        shutdown.clone(),
    );

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;
    info!(%addr, "clonar server started");

    let router = build_router(state.clone());
    let graceful = shutdown.clone();
    let server = tokio::spawn(async move {
        let service = router.into_make_service_with_connect_info::<SocketAddr>();
        if let Err(e) = axum::serve(listener, service)
            .with_graceful_shutdown(graceful.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server terminated with error");
        }
    });

    Ok(ServerHandle {
        addr,
        state,
        server,
        background: vec![sweeper, purge],
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    pub addr: SocketAddr,
    state: AppState,
    server: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Stop admitting, abort live sessions, then wait for the server and the
    /// sweepers to exit.
    pub async fn shutdown(self) {
        self.state.admission.close();
        let aborted = self.state.sessions.abort_all();
        self.state.shutdown.cancel();
        let _ = self.server.await;
        for task in self.background {
            let _ = task.await;
        }
        info!(aborted, "clonar server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clonar_admission::{AdmissionConfig, BreakerConfig, BreakerRegistry};
    use clonar_core::collaborators::PassthroughRewriter;
    use clonar_engine::{
        ExecutorConfig, IntentCascade, IntentConfig, PipelineConfig, PlannerConfig,
        RetrievalExecutor, RetrievalPlanner, ToolRegistry,
    };
    use clonar_llm::{MockAnswerGenerator, ScriptedModel};
    use clonar_store::StoreConfig;
    use serde_json::Value;

    fn admission_config(rate_limit: u32) -> AdmissionConfig {
        AdmissionConfig {
            max_concurrent: 5,
            max_queue: 20,
            max_per_user: 2,
            rate_limit,
            rate_window: Duration::from_secs(60),
            required_dependencies: Vec::new(),
        }
    }

    async fn spawn_server(rate_limit: u32) -> ServerHandle {
        let breakers = BreakerRegistry::new(BreakerConfig::default());
        let planner = RetrievalPlanner::new(
            Arc::new(ScriptedModel::always("not json")),
            PlannerConfig::default(),
        )
        .with_breakers(breakers.clone());
        let executor =
            RetrievalExecutor::new(ToolRegistry::new(), breakers.clone(), ExecutorConfig::default());
        let pipeline = QueryPipeline::new(
            IntentCascade::new(IntentConfig::default()),
            Arc::new(PassthroughRewriter),
            planner,
            executor,
            Arc::new(MockAnswerGenerator::new("Here is what I found.")),
            breakers.clone(),
            PipelineConfig::default(),
        );
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..ServerConfig::default()
        };
        let state = AppState::new(
            config,
            AdmissionController::new(admission_config(rate_limit), breakers),
            Arc::new(SessionStore::new(StoreConfig::default())),
            Arc::new(pipeline),
        );
        start(state).await.unwrap()
    }

    /// `data:` payloads of an SSE body, parsed as JSON.
    fn sse_data(body: &str) -> Vec<Value> {
        body.lines()
            .filter_map(|l| l.strip_prefix("data:"))
            .filter_map(|d| serde_json::from_str(d.trim()).ok())
            .collect()
    }

    #[tokio::test]
    async fn query_streams_start_to_end_and_replays_on_reconnect() {
        let server = spawn_server(30).await;
        let base = format!("http://{}", server.addr);
        let http = reqwest::Client::new();

        let resp = http
            .post(format!("{base}/query"))
            .json(&serde_json::json!({"query": "best budget headphones", "user_id": "alice"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert!(resp.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));
        let body = resp.text().await.unwrap();
        let events = sse_data(&body);
        assert_eq!(events[0]["type"], "start");
        assert_eq!(events.last().unwrap()["type"], "end");
        assert_eq!(events.last().unwrap()["reason"], "completed");
        assert!(body
            .lines()
            .any(|l| l.strip_prefix("event:").map(str::trim) == Some("start")));

        let session_id = events[0]["session_id"].as_str().unwrap().to_string();
        let replay = http
            .post(format!("{base}/reconnect/{session_id}"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        let replayed = sse_data(&replay);
        assert_eq!(replayed, events);

        let partial = http
            .post(format!("{base}/reconnect/{session_id}"))
            .header("last-event-id", "2")
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(sse_data(&partial)[0]["id"], 3);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_session_is_404() {
        let server = spawn_server(30).await;
        let resp = reqwest::Client::new()
            .post(format!("http://{}/reconnect/sess_missing", server.addr))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "session_not_found");
        server.shutdown().await;
    }

    #[tokio::test]
    async fn rate_limited_caller_gets_429() {
        let server = spawn_server(1).await;
        let base = format!("http://{}", server.addr);
        let http = reqwest::Client::new();
        let body = serde_json::json!({"query": "hotels in Austin", "user_id": "bob"});

        let first = http.post(format!("{base}/query")).json(&body).send().await.unwrap();
        assert_eq!(first.status(), 200);
        let _ = first.text().await.unwrap();

        let second = http.post(format!("{base}/query")).json(&body).send().await.unwrap();
        assert_eq!(second.status(), 429);
        assert!(second.headers().contains_key("retry-after"));
        let err: Value = second.json().await.unwrap();
        assert_eq!(err["error"], "rate_limited");
        assert!(err["retry_after_ms"].as_u64().unwrap() > 0);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn blank_query_is_400_and_health_reports_counts() {
        let server = spawn_server(30).await;
        let base = format!("http://{}", server.addr);
        let http = reqwest::Client::new();

        let resp = http
            .post(format!("{base}/query"))
            .json(&serde_json::json!({"query": "   "}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let health: Value = http
            .get(format!("{base}/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["admission"]["max_concurrent"], 5);
        assert_eq!(health["sessions"]["active"], 0);
        server.shutdown().await;
    }
}
