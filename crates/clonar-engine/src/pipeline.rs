//! Per-query glue: intent, rewrite, filters, plan, execute, answer, follow-ups.
//! Every stage degrades instead of failing, and the session is always
//! terminated exactly once when `run` returns.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use clonar_admission::BreakerRegistry;
use clonar_core::collaborators::{
    sources_from_evidence, Answer, AnswerGenerator, Evidence, GenerationRequest, QueryRewriter,
};
use clonar_core::events::{DataPayload, Outcome};
use clonar_core::query::QueryRequest;
use clonar_settings::ClonarSettings;
use clonar_store::Session;

use crate::error::EngineError;
use crate::executor::{panic_message, RetrievalExecutor};
use crate::filters::extract_filters;
use crate::guarded::{guarded_call, CallOutcome, LLM_DEPENDENCY};
use crate::intent::IntentCascade;
use crate::planner::{PlanRequest, RetrievalPlanner};

/// Answer text is streamed in chunks of roughly this many bytes.
const TOKEN_CHUNK_BYTES: usize = 48;

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub rewrite_timeout: Duration,
    pub answer_timeout: Duration,
    pub follow_up_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&ClonarSettings::default())
    }
}

impl From<&ClonarSettings> for PipelineConfig {
    fn from(s: &ClonarSettings) -> Self {
        Self {
            rewrite_timeout: s.llm.rewrite_timeout(),
            answer_timeout: s.llm.answer_timeout(),
            follow_up_timeout: s.llm.follow_up_timeout(),
        }
    }
}

pub struct QueryPipeline {
    intent: IntentCascade,
    rewriter: Arc<dyn QueryRewriter>,
    planner: RetrievalPlanner,
    executor: RetrievalExecutor,
    generator: Arc<dyn AnswerGenerator>,
    breakers: BreakerRegistry,
    config: PipelineConfig,
}

impl QueryPipeline {
    pub fn new(
        intent: IntentCascade,
        rewriter: Arc<dyn QueryRewriter>,
        planner: RetrievalPlanner,
        executor: RetrievalExecutor,
        generator: Arc<dyn AnswerGenerator>,
        breakers: BreakerRegistry,
        config: PipelineConfig,
    ) -> Self {
        Self {
            intent,
            rewriter,
            planner,
            executor,
            generator,
            breakers,
            config,
        }
    }

    pub fn executor(&self) -> &RetrievalExecutor {
        &self.executor
    }

    /// Answer `request` into `session`, then terminate it.
    #[instrument(skip_all, fields(session_id = %session.id(), user_key = %session.user_key()))]
    pub async fn run(&self, session: Arc<Session>, request: QueryRequest) {
        let cancel = session.cancel_token();
        let result = AssertUnwindSafe(self.answer(&session, &request, &cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(EngineError::Internal(panic_message(&panic))));

        let outcome = match result {
            Ok(()) if cancel.is_cancelled() => Outcome::Aborted,
            Ok(()) => Outcome::Completed,
            Err(EngineError::Aborted) => Outcome::Aborted,
            Err(e) => {
                error!(error = %e, "query pipeline failed");
                Outcome::Errored(e.client_message().to_string())
            }
        };
        if outcome == Outcome::Aborted {
            cancel.cancel();
        }
        let _ = session.terminate(outcome);
    }

    async fn answer(
        &self,
        session: &Session,
        request: &QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let history = &request.conversation_history;

        let intent = self.intent.classify(&request.query, history, cancel).await;
        publish(session, DataPayload::block("intent", json!(intent)))?;
        ensure_live(cancel)?;

        let rewritten = self.rewrite(&request.query, request, cancel).await;
        ensure_live(cancel)?;

        let filters = request
            .filters
            .clone()
            .unwrap_or_else(|| extract_filters(&rewritten, intent.label));
        let plan_request = PlanRequest {
            rewritten_query: rewritten.clone(),
            history: history.clone(),
            memory: request.memory.clone(),
            filters,
        };
        let plan = self.planner.plan(&plan_request, cancel).await;
        ensure_live(cancel)?;
        publish(session, DataPayload::block("plan", json!(plan)))?;

        let results = self.executor.execute(&plan, session.id(), cancel).await;
        for result in &results {
            publish(session, DataPayload::block("step", json!(result)))?;
        }
        ensure_live(cancel)?;

        let evidence: Vec<Evidence> = results
            .into_iter()
            .filter(|r| r.status.is_success())
            .map(|r| Evidence {
                tool: r.tool,
                items: r.results,
            })
            .collect();
        let generation = GenerationRequest {
            query: rewritten.clone(),
            history: history.clone(),
            evidence,
        };

        let answer = match guarded_call(
            Some(&self.breakers),
            LLM_DEPENDENCY,
            self.config.answer_timeout,
            cancel,
            self.generator.generate(&generation),
        )
        .await
        {
            CallOutcome::Ok(answer) => answer,
            CallOutcome::Cancelled => return Err(EngineError::Aborted),
            other => {
                warn!(outcome = other.label(), "answer generation degraded to fallback");
                fallback_answer(&generation.evidence)
            }
        };

        for chunk in chunk_text(&answer.text, TOKEN_CHUNK_BYTES) {
            publish(session, DataPayload::token(chunk))?;
        }
        let sources = if answer.sources.is_empty() {
            sources_from_evidence(&generation.evidence)
        } else {
            answer.sources.clone()
        };
        publish(session, DataPayload::block("sources", json!(sources)))?;

        let follow_ups = guarded_call(
            Some(&self.breakers),
            LLM_DEPENDENCY,
            self.config.follow_up_timeout,
            cancel,
            self.generator.suggest_follow_ups(&rewritten, &answer.text),
        )
        .await;
        let follow_ups = match follow_ups {
            CallOutcome::Ok(list) => list,
            CallOutcome::Cancelled => return Err(EngineError::Aborted),
            other => {
                debug!(outcome = other.label(), "no follow-up suggestions");
                Vec::new()
            }
        };
        publish(session, DataPayload::block("follow_ups", json!(follow_ups)))?;

        info!(
            intent = %intent.label,
            steps = plan.steps.len(),
            sources = sources.len(),
            "query answered"
        );
        Ok(())
    }

    /// Self-contained query for follow-ups. Anything but a non-blank rewrite
    /// keeps the original.
    async fn rewrite(&self, query: &str, request: &QueryRequest, cancel: &CancellationToken) -> String {
        if request.conversation_history.is_empty() {
            return query.to_string();
        }
        let outcome = guarded_call(
            Some(&self.breakers),
            LLM_DEPENDENCY,
            self.config.rewrite_timeout,
            cancel,
            self.rewriter.rewrite(query, &request.conversation_history),
        )
        .await;
        match outcome.ok().map(|s| s.trim().to_string()) {
            Some(rewritten) if !rewritten.is_empty() => {
                debug!(rewritten = %rewritten, "query rewritten");
                rewritten
            }
            _ => query.to_string(),
        }
    }
}

fn ensure_live(cancel: &CancellationToken) -> Result<(), EngineError> {
    if cancel.is_cancelled() {
        return Err(EngineError::Aborted);
    }
    Ok(())
}

/// Publishing only fails once the session is terminal, which means it was
/// aborted underneath us.
fn publish(session: &Session, payload: DataPayload) -> Result<(), EngineError> {
    session.publish(payload).map(|_| ()).ok_or(EngineError::Aborted)
}

/// Deterministic answer used when the generator is unavailable.
fn fallback_answer(evidence: &[Evidence]) -> Answer {
    let sources = sources_from_evidence(evidence);
    let text = if sources.is_empty() {
        "I couldn't put together an answer right now. Please try again in a moment.".to_string()
    } else {
        let mut text = String::from("I couldn't write a full answer right now, but here is what I found:\n");
        for source in sources.iter().take(5) {
            text.push_str(&format!("- {} ({})\n", source.title, source.url));
        }
        text
    };
    Answer { text, sources }
}

/// Split on word boundaries into pieces of at least `min_bytes`. The pieces
/// concatenate back to `text`.
fn chunk_text(text: &str, min_bytes: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for piece in text.split_inclusive(char::is_whitespace) {
        current.push_str(piece);
        if current.len() >= min_bytes {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
