//! OpenAI-compatible chat and embedding client.
//!
//! One HTTP client backs every model collaborator. Upstream error bodies are
//! logged at debug level only and never copied into returned errors.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use clonar_core::collaborators::{
    Answer, AnswerGenerator, Classification, Embedder, GenerationRequest, IntentClassifier,
    PlanPrompt, PlanningModel, QueryRewriter,
};
use clonar_core::errors::CollaboratorError;
use clonar_core::intent::IntentLabel;
use clonar_core::query::Turn;
use clonar_core::text::{extract_json_array, extract_json_object};
use clonar_settings::LlmSettings;

use crate::prompts;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug)]
pub struct ChatOptions {
    /// Ask for a JSON object response.
    pub json: bool,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            json: false,
            temperature: 0.2,
            max_tokens: None,
        }
    }
}

impl ChatOptions {
    fn json() -> Self {
        Self {
            json: true,
            temperature: 0.0,
            ..Self::default()
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

pub struct ChatClient {
    http: Client,
    base_url: String,
    model: String,
    embedding_model: String,
    api_key: Option<SecretString>,
}

impl ChatClient {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        embedding_model: impl Into<String>,
        api_key: Option<SecretString>,
        request_timeout: Duration,
    ) -> Result<Self, CollaboratorError> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(request_timeout)
            .build()
            .map_err(|e| CollaboratorError::NotConfigured(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            embedding_model: embedding_model.into(),
            api_key,
        })
    }

    /// Build from settings, reading the API key from the configured env var.
    /// A missing key is not fatal: calls fail with `NotConfigured` and every
    /// caller degrades to its fallback.
    pub fn from_settings(settings: &LlmSettings) -> Result<Self, CollaboratorError> {
        let api_key = std::env::var(&settings.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
            .map(SecretString::from);
        Self::new(
            settings.base_url.clone(),
            settings.model.clone(),
            settings.embedding_model.clone(),
            api_key,
            settings.request_timeout(),
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn authorized(&self, url: &str) -> Result<reqwest::RequestBuilder, CollaboratorError> {
        let key = self
            .api_key
            .as_ref()
            .ok_or_else(|| CollaboratorError::NotConfigured("model API key".into()))?;
        Ok(self
            .http
            .post(url)
            .bearer_auth(key.expose_secret())
            .header("content-type", "application/json"))
    }

    async fn post(&self, path: &str, body: &Value) -> Result<reqwest::Response, CollaboratorError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .authorized(&url)?
            .json(body)
            .send()
            .await
            .map_err(|e| CollaboratorError::NetworkError(e.without_url().to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = resp.text().await.unwrap_or_default();
        debug!(status = status.as_u16(), body_len = body.len(), "model request failed");

        Err(match CollaboratorError::from_status(status.as_u16()) {
            CollaboratorError::RateLimited { .. } => CollaboratorError::RateLimited { retry_after },
            other => other,
        })
    }

    /// Single-turn chat completion returning the message text.
    #[instrument(skip_all, fields(model = %self.model, json = options.json))]
    pub async fn chat(
        &self,
        system: &str,
        user: &str,
        options: ChatOptions,
    ) -> Result<String, CollaboratorError> {
        let mut body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": options.temperature,
        });
        if options.json {
            body["response_format"] = json!({"type": "json_object"});
        }
        if let Some(max) = options.max_tokens {
            body["max_tokens"] = json!(max);
        }

        let resp: ChatResponse = self
            .post("/chat/completions", &body)
            .await?
            .json()
            .await
            .map_err(|e| CollaboratorError::MalformedResponse(e.to_string()))?;

        resp.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| CollaboratorError::MalformedResponse("no choices".into()))
    }

    #[instrument(skip_all, fields(model = %self.embedding_model))]
    pub async fn embedding(&self, text: &str) -> Result<Vec<f32>, CollaboratorError> {
        let body = json!({ "model": self.embedding_model, "input": text });
        let resp: EmbeddingResponse = self
            .post("/embeddings", &body)
            .await?
            .json()
            .await
            .map_err(|e| CollaboratorError::MalformedResponse(e.to_string()))?;
        resp.data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| CollaboratorError::MalformedResponse("empty embedding".into()))
    }
}

#[async_trait]
impl PlanningModel for ChatClient {
    async fn plan(&self, prompt: &PlanPrompt) -> Result<String, CollaboratorError> {
        self.chat(&prompt.system, &prompt.user, ChatOptions::json()).await
    }
}

#[async_trait]
impl IntentClassifier for ChatClient {
    async fn classify(
        &self,
        query: &str,
        context: &[Turn],
    ) -> Result<Classification, CollaboratorError> {
        let (system, user) = prompts::classify(query, context);
        let raw = self.chat(&system, &user, ChatOptions::json()).await?;
        parse_classification(&raw)
    }
}

fn parse_classification(raw: &str) -> Result<Classification, CollaboratorError> {
    let obj = extract_json_object(raw)
        .ok_or_else(|| CollaboratorError::MalformedResponse("classification is not JSON".into()))?;
    let label = obj
        .get("label")
        .and_then(Value::as_str)
        .and_then(IntentLabel::parse_loose)
        .ok_or_else(|| CollaboratorError::MalformedResponse("unknown label".into()))?;
    let confidence = obj.get("confidence").and_then(Value::as_f64).unwrap_or(0.0) as f32;
    Ok(Classification {
        label,
        confidence: confidence.clamp(0.0, 1.0),
    })
}

#[async_trait]
impl Embedder for ChatClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CollaboratorError> {
        self.embedding(text).await
    }
}

#[async_trait]
impl QueryRewriter for ChatClient {
    async fn rewrite(&self, query: &str, history: &[Turn]) -> Result<String, CollaboratorError> {
        if history.is_empty() {
            return Ok(query.to_string());
        }
        let (system, user) = prompts::rewrite(query, history);
        let text = self.chat(&system, &user, ChatOptions::default()).await?;
        let text = text.trim().trim_matches('"').trim();
        Ok(if text.is_empty() {
            query.to_string()
        } else {
            text.to_string()
        })
    }
}

#[async_trait]
impl AnswerGenerator for ChatClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<Answer, CollaboratorError> {
        let (system, user) = prompts::answer(request);
        let text = self.chat(&system, &user, ChatOptions::default()).await?;
        Ok(Answer {
            text,
            sources: prompts::sources_from_evidence(&request.evidence),
        })
    }

    async fn suggest_follow_ups(
        &self,
        query: &str,
        answer: &str,
    ) -> Result<Vec<String>, CollaboratorError> {
        let (system, user) = prompts::follow_ups(query, answer);
        let raw = self.chat(&system, &user, ChatOptions::default()).await?;
        let items = extract_json_array(&raw)
            .ok_or_else(|| CollaboratorError::MalformedResponse("follow-ups are not a JSON array".into()))?;
        Ok(items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::trim).map(str::to_string))
            .filter(|s| !s.is_empty())
            .take(3)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client(base_url: &str, key: Option<&str>) -> ChatClient {
        ChatClient::new(
            base_url,
            "test-model",
            "test-embed",
            key.map(|k| SecretString::from(k.to_string())),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn classification_parsing() {
        let c = parse_classification(r#"{"label": "Hotels", "confidence": 0.83}"#).unwrap();
        assert_eq!(c.label, IntentLabel::Hotel);
        assert!((c.confidence - 0.83).abs() < 1e-6);
        assert!(parse_classification(r#"{"label": "weather"}"#).is_err());
        assert!(parse_classification("hotel").is_err());
    }

    #[tokio::test]
    async fn missing_key_is_not_configured() {
        let err = client("http://127.0.0.1:9", None)
            .chat("s", "u", ChatOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_kind(), "not_configured");
        assert!(!err.is_dependency_failure());
    }

    #[tokio::test]
    async fn chat_returns_first_choice() {
        let router = Router::new().route(
            "/chat/completions",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["model"], "test-model");
                Json(json!({"choices": [{"message": {"content": "{\"steps\": []}"}}]}))
            }),
        );
        let base = serve(router).await;
        let text = client(&base, Some("sk-test"))
            .plan(&PlanPrompt {
                system: "s".into(),
                user: "u".into(),
            })
            .await
            .unwrap();
        assert_eq!(text, "{\"steps\": []}");
    }

    #[tokio::test]
    async fn upstream_error_body_is_not_forwarded() {
        let router = Router::new().route(
            "/chat/completions",
            post(|| async { (StatusCode::BAD_GATEWAY, "secret upstream dump") }),
        );
        let base = serve(router).await;
        let err = client(&base, Some("sk-test"))
            .chat("s", "u", ChatOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_dependency_failure());
        assert!(!err.to_string().contains("secret upstream dump"));
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let router = Router::new().route(
            "/embeddings",
            post(|| async { (StatusCode::TOO_MANY_REQUESTS, [("retry-after", "7")], "slow down") }),
        );
        let base = serve(router).await;
        let err = client(&base, Some("sk-test")).embed("hi").await.unwrap_err();
        match err {
            CollaboratorError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn follow_ups_parse_json_array() {
        let router = Router::new().route(
            "/chat/completions",
            post(|| async {
                Json(json!({"choices": [{"message": {"content": "[\"Any with pools?\", \" \", \"Cheaper?\"]"}}]}))
            }),
        );
        let base = serve(router).await;
        let out = client(&base, Some("sk-test"))
            .suggest_follow_ups("hotels in Miami", "Here are some")
            .await
            .unwrap();
        assert_eq!(out, vec!["Any with pools?".to_string(), "Cheaper?".to_string()]);
    }

    #[tokio::test]
    async fn rewrite_without_history_skips_the_model() {
        let out = client("http://127.0.0.1:9", None)
            .rewrite("hotels in Miami", &[])
            .await
            .unwrap();
        assert_eq!(out, "hotels in Miami");
    }
}
