//! Narrow interfaces to the collaborators the orchestration core consumes.
//! Their internals (model prompting, provider APIs, ranking) live elsewhere.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::errors::{CollaboratorError, ToolError};
use crate::ids::SessionId;
use crate::intent::IntentLabel;
use crate::plan::ToolKind;
use crate::query::Turn;

/// Prompt handed to the planning model.
#[derive(Clone, Debug)]
pub struct PlanPrompt {
    pub system: String,
    pub user: String,
}

/// Produces raw plan text. The planner validates whatever comes back.
#[async_trait]
pub trait PlanningModel: Send + Sync {
    async fn plan(&self, prompt: &PlanPrompt) -> Result<String, CollaboratorError>;
}

/// Label plus self-reported confidence from a classifier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub label: IntentLabel,
    pub confidence: f32,
}

#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(
        &self,
        query: &str,
        context: &[Turn],
    ) -> Result<Classification, CollaboratorError>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CollaboratorError>;
}

/// Rewrites a follow-up query into a self-contained one.
#[async_trait]
pub trait QueryRewriter: Send + Sync {
    async fn rewrite(&self, query: &str, history: &[Turn]) -> Result<String, CollaboratorError>;
}

/// Returns the query unchanged.
pub struct PassthroughRewriter;

#[async_trait]
impl QueryRewriter for PassthroughRewriter {
    async fn rewrite(&self, query: &str, _history: &[Turn]) -> Result<String, CollaboratorError> {
        Ok(query.to_string())
    }
}

/// Retrieved items from one step, handed to answer generation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Evidence {
    pub tool: ToolKind,
    pub items: Vec<Value>,
}

#[derive(Clone, Debug)]
pub struct GenerationRequest {
    pub query: String,
    pub history: Vec<Turn>,
    pub evidence: Vec<Evidence>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub title: String,
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    #[serde(default)]
    pub sources: Vec<Source>,
}

/// Collect citable sources (title + link) from retrieved items.
pub fn sources_from_evidence(evidence: &[Evidence]) -> Vec<Source> {
    let mut sources: Vec<Source> = Vec::new();
    for item in evidence.iter().flat_map(|e| e.items.iter()) {
        let title = ["title", "name"]
            .iter()
            .find_map(|k| item.get(*k).and_then(Value::as_str).filter(|s| !s.is_empty()));
        let url = ["link", "product_link", "url"]
            .iter()
            .find_map(|k| item.get(*k).and_then(Value::as_str).filter(|s| !s.is_empty()));
        if let (Some(title), Some(url)) = (title, url) {
            if !sources.iter().any(|s| s.url == url) {
                sources.push(Source {
                    title: title.to_string(),
                    url: url.to_string(),
                });
            }
        }
    }
    sources
}

#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<Answer, CollaboratorError>;

    async fn suggest_follow_ups(
        &self,
        _query: &str,
        _answer: &str,
    ) -> Result<Vec<String>, CollaboratorError> {
        Ok(Vec::new())
    }
}

/// Context available to a retrieval tool during one step.
#[derive(Clone, Debug)]
pub struct StepContext {
    pub session_id: SessionId,
    /// 1-based plan index.
    pub step: usize,
    /// Fires when the client went away; tools should stop early.
    pub abort: CancellationToken,
}

/// A data-fetching function with a fixed input/output contract.
#[async_trait]
pub trait RetrievalTool: Send + Sync {
    fn kind(&self) -> ToolKind;

    /// Name of the external dependency guarded by a circuit breaker.
    fn dependency(&self) -> &str;

    async fn search(
        &self,
        args: &Map<String, Value>,
        ctx: &StepContext,
    ) -> Result<Vec<Value>, ToolError>;
}
