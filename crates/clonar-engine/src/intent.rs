//! Three-stage intent cascade: lexical rules, then an LLM classifier, then
//! nearest-exemplar embedding search. Each stage is a pure function of the
//! query and fixed context, so any stage can be retried on its own.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use clonar_core::collaborators::{Embedder, IntentClassifier};
use clonar_core::intent::{IntentLabel, IntentResult, IntentSource};
use clonar_core::query::Turn;
use clonar_core::timeout::{race, within, Timed};
use clonar_settings::IntentSettings;

/// Confidence assigned to a lexical match.
pub const LEXICAL_CONFIDENCE: f32 = 0.9;

/// Ordered keyword table. The first matching category wins.
static LEXICAL_RULES: LazyLock<Vec<(IntentLabel, Regex)>> = LazyLock::new(|| {
    [
        (
            IntentLabel::Hotel,
            r"\b(hotels?|motels?|resorts?|inns?|hostels?|bed and breakfast|b&b|lodging|vacation rentals?|accommodations?|airbnb|suites?)\b",
        ),
        (
            IntentLabel::Flight,
            r"\b(flights?|airfares?|airlines?|plane tickets?|fly(ing)? (from|to)|round[- ]trip|one[- ]way)\b",
        ),
        (
            IntentLabel::Movie,
            r"\b(movies?|films?|showtimes?|cinemas?|theaters? playing|box office)\b",
        ),
        (
            IntentLabel::Place,
            r"\b(restaurants?|cafes?|coffee shops?|bars?|near me|nearby|attractions?|museums?|parks?|things to do)\b",
        ),
        (
            IntentLabel::Product,
            r"\b(buy|price of|cheapest|deals? on|shop(ping)? for|for sale|discount|headphones|earbuds|laptops?|shoes|sneakers|phones?)\b",
        ),
    ]
    .into_iter()
    .map(|(label, pattern)| (label, Regex::new(&format!("(?i){pattern}")).unwrap()))
    .collect()
});

/// Stage 1. Scans the query once per category.
pub fn classify_lexical(query: &str) -> Option<IntentResult> {
    LEXICAL_RULES
        .iter()
        .find(|(_, re)| re.is_match(query))
        .map(|(label, _)| IntentResult::new(*label, LEXICAL_CONFIDENCE, IntentSource::Lexical))
}

/// Example phrasings per category, embedded once at startup.
pub fn default_exemplars() -> Vec<(IntentLabel, &'static str)> {
    vec![
        (IntentLabel::Hotel, "where should I stay for the night"),
        (IntentLabel::Hotel, "place to stay downtown with free breakfast"),
        (IntentLabel::Flight, "get me to Chicago next Friday by air"),
        (IntentLabel::Flight, "cheapest way to travel by plane to London"),
        (IntentLabel::Product, "best noise cancelling gadget to purchase"),
        (IntentLabel::Product, "recommend a gift to order online"),
        (IntentLabel::Place, "somewhere good to eat dinner tonight"),
        (IntentLabel::Place, "fun spots to visit this weekend"),
        (IntentLabel::Movie, "what is showing at the theater tonight"),
        (IntentLabel::Movie, "a good thriller to watch"),
        (IntentLabel::General, "explain how compound interest works"),
        (IntentLabel::General, "who wrote pride and prejudice"),
    ]
}

/// Precomputed exemplar embeddings.
#[derive(Debug, Default)]
pub struct ExemplarIndex {
    entries: Vec<(IntentLabel, Vec<f32>)>,
}

impl ExemplarIndex {
    pub fn from_vectors(entries: Vec<(IntentLabel, Vec<f32>)>) -> Self {
        Self {
            entries: entries.into_iter().filter(|(_, v)| norm(v) > 0.0).collect(),
        }
    }

    /// Embed every exemplar, each call bounded by `budget`. Exemplars that
    /// fail or time out are skipped.
    pub async fn build(
        embedder: &dyn Embedder,
        exemplars: &[(IntentLabel, &str)],
        budget: Duration,
    ) -> Self {
        let mut entries = Vec::with_capacity(exemplars.len());
        for (label, text) in exemplars {
            match within(budget, embedder.embed(text)).await {
                Timed::Completed(Ok(v)) => entries.push((*label, v)),
                Timed::Completed(Err(e)) => {
                    warn!(label = %label, error = %e, "exemplar embedding failed")
                }
                Timed::TimedOut(_) | Timed::Cancelled => {
                    warn!(label = %label, budget_ms = budget.as_millis() as u64, "exemplar embedding timed out")
                }
            }
        }
        Self::from_vectors(entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Category of the most similar exemplar and its cosine similarity.
    pub fn nearest(&self, query: &[f32]) -> Option<(IntentLabel, f32)> {
        self.entries
            .iter()
            .filter_map(|(label, v)| cosine(query, v).map(|s| (*label, s)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn cosine(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    let (na, nb) = (norm(a), norm(b));
    if na == 0.0 || nb == 0.0 {
        return None;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    Some(dot / (na * nb))
}

#[derive(Clone, Debug)]
pub struct IntentConfig {
    pub confidence_threshold: f32,
    pub classifier_timeout: Duration,
    pub embedding_timeout: Duration,
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self::from(&IntentSettings::default())
    }
}

impl From<&IntentSettings> for IntentConfig {
    fn from(s: &IntentSettings) -> Self {
        Self {
            confidence_threshold: s.confidence_threshold,
            classifier_timeout: s.classifier_timeout(),
            embedding_timeout: s.embedding_timeout(),
        }
    }
}

pub struct IntentCascade {
    config: IntentConfig,
    classifier: Option<Arc<dyn IntentClassifier>>,
    embedder: Option<Arc<dyn Embedder>>,
    index: Arc<ExemplarIndex>,
}

impl IntentCascade {
    pub fn new(config: IntentConfig) -> Self {
        Self {
            config,
            classifier: None,
            embedder: None,
            index: Arc::new(ExemplarIndex::default()),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn IntentClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_embeddings(mut self, embedder: Arc<dyn Embedder>, index: Arc<ExemplarIndex>) -> Self {
        self.embedder = Some(embedder);
        self.index = index;
        self
    }

    /// Run the cascade. Never fails: the worst case is `general` at 0.0.
    #[instrument(skip_all)]
    pub async fn classify(&self, query: &str, context: &[Turn], cancel: &CancellationToken) -> IntentResult {
        if let Some(result) = classify_lexical(query) {
            debug!(label = %result.label, "intent from lexical rules");
            return result;
        }

        if let Some(result) = self.classify_llm(query, context, cancel).await {
            return result;
        }

        if let Some(result) = self.classify_embedding(query, cancel).await {
            return result;
        }

        IntentResult::general()
    }

    /// Stage 2.
    pub async fn classify_llm(
        &self,
        query: &str,
        context: &[Turn],
        cancel: &CancellationToken,
    ) -> Option<IntentResult> {
        let classifier = self.classifier.as_ref()?;
        match race(self.config.classifier_timeout, cancel, classifier.classify(query, context)).await {
            Timed::Completed(Ok(c)) if c.confidence >= self.config.confidence_threshold => {
                debug!(label = %c.label, confidence = c.confidence, "intent from classifier");
                Some(IntentResult::new(c.label, c.confidence, IntentSource::Llm))
            }
            Timed::Completed(Ok(c)) => {
                debug!(label = %c.label, confidence = c.confidence, "classifier below threshold");
                None
            }
            Timed::Completed(Err(e)) => {
                warn!(error = %e, kind = e.error_kind(), "intent classifier failed");
                None
            }
            Timed::TimedOut(budget) => {
                warn!(timeout_ms = budget.as_millis() as u64, "intent classifier timed out");
                None
            }
            Timed::Cancelled => None,
        }
    }

    /// Stage 3.
    pub async fn classify_embedding(&self, query: &str, cancel: &CancellationToken) -> Option<IntentResult> {
        let embedder = self.embedder.as_ref()?;
        if self.index.is_empty() {
            return None;
        }
        let vector = match race(self.config.embedding_timeout, cancel, embedder.embed(query)).await {
            Timed::Completed(Ok(v)) => v,
            Timed::Completed(Err(e)) => {
                warn!(error = %e, "query embedding failed");
                return None;
            }
            Timed::TimedOut(_) | Timed::Cancelled => return None,
        };
        let (label, similarity) = self.index.nearest(&vector)?;
        if similarity < self.config.confidence_threshold {
            debug!(label = %label, similarity, "nearest exemplar below threshold");
            return None;
        }
        Some(IntentResult::new(label, similarity, IntentSource::Embedding))
    }
}
