//! Prompt text for the model-backed collaborators.

pub use clonar_core::collaborators::sources_from_evidence;
use clonar_core::collaborators::GenerationRequest;
use clonar_core::intent::IntentLabel;
use clonar_core::query::Turn;
use serde_json::Value;

/// Items per tool shown to the answer model.
const EVIDENCE_ITEMS_PER_TOOL: usize = 5;

fn render_history(history: &[Turn]) -> String {
    history
        .iter()
        .map(|t| format!("{}: {}", t.role, t.content))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn classify(query: &str, context: &[Turn]) -> (String, String) {
    let labels = IntentLabel::ALL
        .iter()
        .map(IntentLabel::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    let system = format!(
        "You classify search queries. Allowed labels: {labels}.\n\
         Return ONLY JSON: {{\"label\": \"<label>\", \"confidence\": <0..1>}}."
    );
    let mut user = String::new();
    if !context.is_empty() {
        user.push_str("Conversation so far:\n");
        user.push_str(&render_history(context));
        user.push_str("\n\n");
    }
    user.push_str("Query: ");
    user.push_str(query);
    (system, user)
}

pub fn rewrite(query: &str, history: &[Turn]) -> (String, String) {
    let system = "Rewrite the user's latest message into a standalone search query. \
                  Resolve pronouns and references using the conversation. \
                  Return only the rewritten query text."
        .to_string();
    let user = format!(
        "Conversation:\n{}\n\nLatest message: {query}",
        render_history(history)
    );
    (system, user)
}

pub fn answer(request: &GenerationRequest) -> (String, String) {
    let system = "You answer questions using the retrieved results provided. \
                  Be concise, cite concrete items (names, prices, ratings) and never invent \
                  results that are not listed."
        .to_string();
    let mut user = String::new();
    if !request.history.is_empty() {
        user.push_str("Conversation so far:\n");
        user.push_str(&render_history(&request.history));
        user.push_str("\n\n");
    }
    user.push_str(&format!("Question: {}\n\nResults:\n", request.query));
    if request.evidence.iter().all(|e| e.items.is_empty()) {
        user.push_str("(no results were retrieved)\n");
    }
    for evidence in &request.evidence {
        let items: Vec<&Value> = evidence.items.iter().take(EVIDENCE_ITEMS_PER_TOOL).collect();
        if items.is_empty() {
            continue;
        }
        user.push_str(&format!(
            "[{}] {}\n",
            evidence.tool,
            serde_json::to_string(&items).unwrap_or_default()
        ));
    }
    (system, user)
}

pub fn follow_ups(query: &str, answer: &str) -> (String, String) {
    let system = "Suggest up to three short follow-up questions the user might ask next. \
                  Return ONLY a JSON array of strings."
        .to_string();
    let user = format!("Question: {query}\n\nAnswer: {answer}");
    (system, user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clonar_core::collaborators::Evidence;
    use clonar_core::plan::ToolKind;
    use serde_json::json;

    #[test]
    fn classify_lists_every_label() {
        let (system, user) = classify("cheap flights to Denver", &[]);
        for label in IntentLabel::ALL {
            assert!(system.contains(label.as_str()));
        }
        assert!(user.ends_with("cheap flights to Denver"));
    }

    #[test]
    fn answer_prompt_mentions_missing_results() {
        let (_, user) = answer(&GenerationRequest {
            query: "best toaster".into(),
            history: Vec::new(),
            evidence: vec![Evidence {
                tool: ToolKind::ProductSearch,
                items: Vec::new(),
            }],
        });
        assert!(user.contains("no results were retrieved"));
    }

    #[test]
    fn sources_are_deduplicated_by_url() {
        let evidence = vec![Evidence {
            tool: ToolKind::ProductSearch,
            items: vec![
                json!({"title": "Toaster A", "link": "https://a.example"}),
                json!({"title": "Toaster A again", "link": "https://a.example"}),
                json!({"name": "Hotel B", "link": "https://b.example"}),
                json!({"title": "No link"}),
            ],
        }];
        let sources = sources_from_evidence(&evidence);
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[1].title, "Hotel B");
    }
}
