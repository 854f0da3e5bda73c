//! Scripted collaborators for deterministic tests without API calls.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use clonar_core::collaborators::{
    Answer, AnswerGenerator, Classification, Embedder, GenerationRequest, IntentClassifier,
    PlanPrompt, PlanningModel, QueryRewriter,
};
use clonar_core::errors::CollaboratorError;
use clonar_core::intent::IntentLabel;
use clonar_core::query::Turn;

use crate::prompts;

/// One pre-programmed reply.
#[derive(Clone, Debug)]
pub enum MockReply {
    Text(String),
    Error(CollaboratorError),
    /// Wait, then yield the inner reply.
    Delay(Duration, Box<MockReply>),
    /// Never resolves. Useful for timeout tests.
    Hang,
}

impl MockReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }

    async fn resolve(self) -> Result<String, CollaboratorError> {
        let mut reply = self;
        loop {
            match reply {
                Self::Text(text) => return Ok(text),
                Self::Error(err) => return Err(err),
                Self::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    reply = *inner;
                }
                Self::Hang => std::future::pending::<()>().await,
            }
        }
    }
}

/// Returns scripted replies in order. Once the script runs out the last
/// reply repeats. Records every prompt it receives.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<MockReply>>,
    last: Mutex<Option<MockReply>>,
    prompts: Mutex<Vec<String>>,
    call_count: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            last: Mutex::new(None),
            prompts: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn always(text: impl Into<String>) -> Self {
        Self::new(vec![MockReply::text(text)])
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// User-side prompt text of every call so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    fn next_reply(&self, prompt: &str) -> MockReply {
        let _ = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.prompts.lock().push(prompt.to_string());
        let next = self.replies.lock().pop_front();
        let mut last = self.last.lock();
        match next {
            Some(reply) => {
                *last = Some(reply.clone());
                reply
            }
            None => last.clone().unwrap_or_else(|| {
                MockReply::Error(CollaboratorError::NotConfigured("empty script".into()))
            }),
        }
    }
}

#[async_trait]
impl PlanningModel for ScriptedModel {
    async fn plan(&self, prompt: &PlanPrompt) -> Result<String, CollaboratorError> {
        self.next_reply(&prompt.user).resolve().await
    }
}

#[async_trait]
impl QueryRewriter for ScriptedModel {
    async fn rewrite(&self, query: &str, _history: &[Turn]) -> Result<String, CollaboratorError> {
        self.next_reply(query).resolve().await
    }
}

/// Classifier returning a fixed result (or error) after an optional delay.
pub struct MockClassifier {
    result: Result<Classification, CollaboratorError>,
    delay: Option<Duration>,
    call_count: AtomicUsize,
}

impl MockClassifier {
    pub fn returning(label: IntentLabel, confidence: f32) -> Self {
        Self {
            result: Ok(Classification { label, confidence }),
            delay: None,
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn failing(err: CollaboratorError) -> Self {
        Self {
            result: Err(err),
            delay: None,
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl IntentClassifier for MockClassifier {
    async fn classify(&self, _query: &str, _context: &[Turn]) -> Result<Classification, CollaboratorError> {
        let _ = self.call_count.fetch_add(1, Ordering::Relaxed);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.result.clone()
    }
}

/// Deterministic bag-of-words embedder: each lowercase word is hashed into
/// one of `dims` buckets. Similar wording yields similar vectors.
pub struct MockEmbedder {
    dims: usize,
    fail: bool,
}

impl MockEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims: dims.max(1),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self { dims: 1, fail: true }
    }

    fn bucket(&self, word: &str) -> usize {
        // FNV-1a
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for b in word.bytes() {
            hash ^= u64::from(b);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        (hash % self.dims as u64) as usize
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CollaboratorError> {
        if self.fail {
            return Err(CollaboratorError::ServerError { status: 503 });
        }
        let mut v = vec![0.0_f32; self.dims];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            v[self.bucket(&word.to_lowercase())] += 1.0;
        }
        Ok(v)
    }
}

/// Answer generator that echoes the query and cites retrieved items.
pub struct MockAnswerGenerator {
    answer: Result<String, CollaboratorError>,
    follow_ups: Vec<String>,
    delay: Option<Duration>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl MockAnswerGenerator {
    pub fn new(answer: impl Into<String>) -> Self {
        Self {
            answer: Ok(answer.into()),
            follow_ups: Vec::new(),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(err: CollaboratorError) -> Self {
        Self {
            answer: Err(err),
            follow_ups: Vec::new(),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_follow_ups(mut self, follow_ups: Vec<String>) -> Self {
        self.follow_ups = follow_ups;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl AnswerGenerator for MockAnswerGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Answer, CollaboratorError> {
        self.requests.lock().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let text = self.answer.clone()?;
        Ok(Answer {
            text,
            sources: prompts::sources_from_evidence(&request.evidence),
        })
    }

    async fn suggest_follow_ups(&self, _query: &str, _answer: &str) -> Result<Vec<String>, CollaboratorError> {
        Ok(self.follow_ups.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_replies_in_order_then_repeat_last() {
        let model = ScriptedModel::new(vec![MockReply::text("a"), MockReply::text("b")]);
        let prompt = PlanPrompt {
            system: String::new(),
            user: "q".into(),
        };
        assert_eq!(model.plan(&prompt).await.unwrap(), "a");
        assert_eq!(model.plan(&prompt).await.unwrap(), "b");
        assert_eq!(model.plan(&prompt).await.unwrap(), "b");
        assert_eq!(model.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_reply_waits() {
        let model = ScriptedModel::new(vec![MockReply::delayed(
            Duration::from_secs(2),
            MockReply::text("late"),
        )]);
        let start = tokio::time::Instant::now();
        let out = model.rewrite("q", &[]).await.unwrap();
        assert_eq!(out, "late");
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn embedder_similarity_follows_wording() {
        let e = MockEmbedder::new(64);
        let a = e.embed("cheap hotel rooms").await.unwrap();
        let b = e.embed("Hotel rooms cheap!").await.unwrap();
        assert_eq!(a, b);
    }
}
