use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use clonar_admission::{AdmissionConfig, AdmissionController, BreakerConfig, BreakerRegistry};
use clonar_engine::{
    default_exemplars, register_serpapi_tools, ExecutorConfig, ExemplarIndex, IntentCascade,
    IntentConfig, PipelineConfig, PlannerConfig, QueryPipeline, RetrievalExecutor,
    RetrievalPlanner, SerpApiClient, ToolRegistry,
};
use clonar_llm::ChatClient;
use clonar_server::{AppState, ServerConfig};
use clonar_settings::ClonarSettings;
use clonar_store::{SessionStore, StoreConfig};
use clonar_telemetry::{init_telemetry, TelemetryConfig};

/// Query orchestration server.
#[derive(Debug, Parser)]
#[command(name = "clonar", version)]
struct Args {
    /// Settings file (defaults to ~/.clonar/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to listen on, overriding settings and CLONAR_PORT.
    #[arg(long)]
    port: Option<u16>,
}

fn load(args: &Args) -> anyhow::Result<ClonarSettings> {
    let mut settings = match &args.config {
        Some(path) => clonar_settings::load_settings_from_path(path),
        None => clonar_settings::load_settings(),
    }
    .context("failed to load settings")?;
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    Ok(settings)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = load(&args)?;

    let _telemetry = init_telemetry(TelemetryConfig::from_parts(
        &settings.telemetry.log_level,
        settings.telemetry.log_to_sqlite,
        settings.telemetry.log_db_path.as_ref().map(PathBuf::from),
    ));
    tracing::info!("starting clonar");

    let breakers = BreakerRegistry::new(BreakerConfig::from(&settings.breaker));
    let admission = AdmissionController::new(AdmissionConfig::from(&settings.admission), breakers.clone());

    let llm = Arc::new(ChatClient::from_settings(&settings.llm).context("failed to build model client")?);
    if !llm.has_api_key() {
        tracing::warn!(
            env = %settings.llm.api_key_env,
            "no model API key; planning, answers and classification will use fallbacks"
        );
    }

    let mut intent = IntentCascade::new(IntentConfig::from(&settings.intent)).with_classifier(llm.clone());
    if llm.has_api_key() {
        let index = ExemplarIndex::build(
            llm.as_ref(),
            &default_exemplars(),
            settings.intent.embedding_timeout(),
        )
        .await;
        tracing::info!(exemplars = index.len(), "intent exemplar index ready");
        intent = intent.with_embeddings(llm.clone(), Arc::new(index));
    }

    let serpapi = SerpApiClient::from_settings(&settings.tools).context("failed to build SerpAPI client")?;
    if !serpapi.has_api_key() {
        tracing::warn!(
            env = %settings.tools.serpapi_key_env,
            "SerpAPI key not configured; retrieval steps will fail"
        );
    }
    let mut tools = ToolRegistry::new();
    register_serpapi_tools(&mut tools, Arc::new(serpapi));

    let planner = RetrievalPlanner::new(llm.clone(), PlannerConfig::from(&settings.planner))
        .with_breakers(breakers.clone());
    let executor = RetrievalExecutor::new(tools, breakers.clone(), ExecutorConfig::from(&settings));
    let pipeline = QueryPipeline::new(
        intent,
        llm.clone(),
        planner,
        executor,
        llm,
        breakers,
        PipelineConfig::from(&settings),
    );

    let sessions = Arc::new(SessionStore::new(StoreConfig {
        retention: settings.sessions.retention(),
    }));
    let state = AppState::new(
        ServerConfig::from(&settings),
        admission,
        sessions,
        Arc::new(pipeline),
    );
    let handle = clonar_server::start(state).await.context("failed to start server")?;
    tracing::info!(port = handle.port(), "clonar ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
