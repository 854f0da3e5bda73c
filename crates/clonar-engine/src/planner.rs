//! Retrieval planner: asks the planning model for a tool plan, then runs a
//! deterministic validation and repair pipeline over whatever comes back.
//! The planner never fails; unusable output becomes a single web search.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use clonar_admission::BreakerRegistry;
use clonar_core::collaborators::{PlanPrompt, PlanningModel};
use clonar_core::plan::{
    ExtractedFilters, PlanRepair, RetrievalPlan, RetrievalStep, ToolKind, MAX_STEPS,
};
use clonar_core::query::Turn;
use clonar_core::text::extract_json_object;
use clonar_settings::PlannerSettings;

use crate::guarded::{guarded_call, LLM_DEPENDENCY};

/// Everything the planner looks at.
#[derive(Clone, Debug, Default)]
pub struct PlanRequest {
    pub rewritten_query: String,
    pub history: Vec<Turn>,
    pub memory: Vec<String>,
    pub filters: ExtractedFilters,
}

#[derive(Clone, Debug)]
pub struct PlannerConfig {
    pub timeout: Duration,
    pub max_history: usize,
    /// Tools the model may use. Empty means every tool.
    pub allowed_tools: HashSet<ToolKind>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self::from(&PlannerSettings::default())
    }
}

impl From<&PlannerSettings> for PlannerConfig {
    fn from(s: &PlannerSettings) -> Self {
        let allowed_tools = s
            .allowed_tools
            .iter()
            .filter_map(|name| {
                let kind = ToolKind::parse(name);
                if kind.is_none() {
                    warn!(tool = %name, "ignoring unknown tool in planner.allowedTools");
                }
                kind
            })
            .collect();
        Self {
            timeout: s.timeout(),
            max_history: s.max_history,
            allowed_tools,
        }
    }
}

impl PlannerConfig {
    fn allows(&self, kind: ToolKind) -> bool {
        self.allowed_tools.is_empty() || self.allowed_tools.contains(&kind)
    }

    fn catalog(&self) -> Vec<ToolKind> {
        ToolKind::ALL.into_iter().filter(|k| self.allows(*k)).collect()
    }
}

pub struct RetrievalPlanner {
    model: Arc<dyn PlanningModel>,
    config: PlannerConfig,
    breakers: Option<BreakerRegistry>,
}

impl RetrievalPlanner {
    pub fn new(model: Arc<dyn PlanningModel>, config: PlannerConfig) -> Self {
        Self {
            model,
            config,
            breakers: None,
        }
    }

    /// Guard model calls with the shared `llm` breaker.
    pub fn with_breakers(mut self, breakers: BreakerRegistry) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    pub fn build_prompt(&self, request: &PlanRequest) -> PlanPrompt {
        let mut system = String::from(
            "You plan retrieval calls that gather data to answer a user's query.\n\nTool Catalog:\n",
        );
        for kind in self.config.catalog() {
            system.push_str(&format!("- {}: {}\n", kind, kind.description()));
        }
        system.push_str("\nPlanning Rules:\n");
        system.push_str(&format!("1) Use at most {MAX_STEPS} steps.\n"));
        system.push_str("2) Use only tool names listed in the Tool Catalog.\n");
        system.push_str(
            "3) context_from_step is the 1-based index of an EARLIER step whose results inform this one; omit it otherwise.\n",
        );
        system.push_str("4) Return ONLY one JSON object, no prose.\n");

        let mut user = format!("Query:\n{}\n\n", request.rewritten_query);
        if !request.history.is_empty() {
            user.push_str("History:\n");
            let skip = request.history.len().saturating_sub(self.config.max_history);
            for turn in request.history.iter().skip(skip) {
                user.push_str(&format!("- {}: {}\n", turn.role, turn.content));
            }
            user.push('\n');
        }
        if !request.memory.is_empty() {
            user.push_str("Known about the user:\n");
            for fact in &request.memory {
                user.push_str(&format!("- {fact}\n"));
            }
            user.push('\n');
        }
        if !request.filters.is_empty() {
            user.push_str(&format!(
                "Extracted filters:\n{}\n\n",
                serde_json::to_string(&request.filters).unwrap_or_default()
            ));
        }
        user.push_str("Return a JSON object with shape:\n");
        user.push_str(r#"{"steps":[{"tool":"tool_name","args":{},"context_from_step":null}]}"#);
        user.push('\n');

        PlanPrompt { system, user }
    }

    /// Produce a validated plan. Model errors, timeouts, an open breaker and
    /// malformed output all degrade to the fallback plan.
    #[instrument(skip_all, fields(query = %request.rewritten_query))]
    pub async fn plan(&self, request: &PlanRequest, cancel: &CancellationToken) -> RetrievalPlan {
        let prompt = self.build_prompt(request);
        let outcome = guarded_call(
            self.breakers.as_ref(),
            LLM_DEPENDENCY,
            self.config.timeout,
            cancel,
            self.model.plan(&prompt),
        )
        .await;

        let label = outcome.label();
        let raw = outcome.ok();
        let plan = repair(raw.as_deref(), request, &self.config);
        if plan.is_fallback() {
            warn!(model_outcome = label, repairs = plan.repairs.len(), "planning degraded to fallback");
        } else {
            info!(steps = plan.steps.len(), repairs = plan.repairs.len(), "plan ready");
        }
        plan
    }
}

/// A step as the model wrote it, before validation.
struct DraftStep {
    position: usize,
    tool: ToolKind,
    args: Map<String, Value>,
    reference: Option<usize>,
}

fn parse_tool_name(raw: &str) -> Option<ToolKind> {
    let normalized = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
    ToolKind::parse(&normalized)
}

fn parse_reference(value: Option<&Value>) -> Result<Option<usize>, usize> {
    let n = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) if s.trim().is_empty() => return Ok(None),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        Some(_) => None,
    };
    match n {
        Some(n) if n >= 1 => Ok(Some(n as usize)),
        // Unusable reference: reported as pointing at step 0.
        _ => Err(0),
    }
}

/// Validate and repair raw model output. `None` means the model produced
/// nothing usable (error, timeout, open breaker).
pub fn repair(raw: Option<&str>, request: &PlanRequest, config: &PlannerConfig) -> RetrievalPlan {
    let mut repairs = Vec::new();

    let raw_steps = raw
        .and_then(extract_json_object)
        .and_then(|mut obj| match obj.remove("steps") {
            Some(Value::Array(steps)) => Some(steps),
            _ => None,
        });
    let raw_steps = match raw_steps {
        Some(steps) => steps,
        None => {
            repairs.push(PlanRepair::Unparseable);
            Vec::new()
        }
    };

    // 1. Unknown or disallowed tools.
    let mut drafts = Vec::new();
    for (i, raw_step) in raw_steps.into_iter().enumerate() {
        let position = i + 1;
        let Value::Object(mut obj) = raw_step else {
            repairs.push(PlanRepair::DroppedUnknownTool {
                position,
                tool: String::new(),
            });
            continue;
        };
        let tool_name = obj.get("tool").and_then(Value::as_str).unwrap_or_default().to_string();
        let Some(tool) = parse_tool_name(&tool_name).filter(|k| config.allows(*k)) else {
            repairs.push(PlanRepair::DroppedUnknownTool {
                position,
                tool: tool_name,
            });
            continue;
        };
        let args = match obj.remove("args") {
            Some(Value::Object(args)) => args,
            _ => Map::new(),
        };
        let reference = match parse_reference(obj.get("context_from_step")) {
            Ok(r) => r,
            Err(bad) => {
                repairs.push(PlanRepair::DroppedBadReference {
                    position,
                    reference: bad,
                });
                continue;
            }
        };
        drafts.push(DraftStep {
            position,
            tool,
            args,
            reference,
        });
    }

    // 2. References must point at an earlier surviving step; renumber them.
    let mut renumbered: HashMap<usize, usize> = HashMap::new();
    let mut steps: Vec<RetrievalStep> = Vec::new();
    for draft in drafts {
        let context_from_step = match draft.reference {
            None => None,
            Some(r) => match renumbered.get(&r) {
                Some(&new_index) if r < draft.position => Some(new_index),
                _ => {
                    repairs.push(PlanRepair::DroppedBadReference {
                        position: draft.position,
                        reference: r,
                    });
                    continue;
                }
            },
        };
        steps.push(RetrievalStep {
            tool: draft.tool,
            args: draft.args,
            context_from_step,
        });
        let _ = renumbered.insert(draft.position, steps.len());
    }

    // 3. Cap length. References only point backwards, so the prefix stays valid.
    if steps.len() > MAX_STEPS {
        repairs.push(PlanRepair::Truncated {
            dropped: steps.len() - MAX_STEPS,
        });
        steps.truncate(MAX_STEPS);
    }

    // 4. Free-text tools always get a query.
    for (i, step) in steps.iter_mut().enumerate() {
        if !step.tool.requires_query() {
            continue;
        }
        let blank = match step.args.get("query") {
            Some(Value::String(s)) => s.trim().is_empty(),
            Some(Value::Null) | None => true,
            Some(_) => false,
        };
        if blank {
            let _ = step
                .args
                .insert("query".into(), Value::String(request.rewritten_query.clone()));
            repairs.push(PlanRepair::InjectedQuery { step: i + 1 });
        }
    }

    // 5. Extracted filters fill gaps, never overwrite.
    for (i, step) in steps.iter_mut().enumerate() {
        let Some(filters) = request.filters.for_tool(step.tool) else {
            continue;
        };
        let mut keys = Vec::new();
        for (key, value) in filters {
            let missing = step.args.get(key).map_or(true, Value::is_null);
            if missing {
                let _ = step.args.insert(key.clone(), value.clone());
                keys.push(key.clone());
            }
        }
        if !keys.is_empty() {
            repairs.push(PlanRepair::MergedFilters { step: i + 1, keys });
        }
    }

    // 6. Nothing left: single generic search.
    if steps.is_empty() {
        let mut plan = RetrievalPlan::fallback(&request.rewritten_query);
        repairs.append(&mut plan.repairs);
        plan.repairs = repairs;
        return plan;
    }

    debug!(steps = steps.len(), repairs = repairs.len(), "plan validated");
    RetrievalPlan { steps, repairs }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clonar_core::errors::CollaboratorError;
    use clonar_llm::{MockReply, ScriptedModel};
    use serde_json::json;

    fn request(query: &str) -> PlanRequest {
        PlanRequest {
            rewritten_query: query.into(),
            ..Default::default()
        }
    }

    fn config() -> PlannerConfig {
        PlannerConfig {
            timeout: Duration::from_secs(10),
            max_history: 6,
            allowed_tools: HashSet::new(),
        }
    }

    #[test]
    fn invalid_json_falls_back_to_single_web_search() {
        let plan = repair(Some("sorry, I can't do that"), &request("hotels in Austin"), &config());
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].tool, ToolKind::WebSearch);
        assert_eq!(plan.steps[0].args["query"], "hotels in Austin");
        assert!(plan.is_fallback());
        assert!(plan.repairs.contains(&PlanRepair::Unparseable));
    }

    #[test]
    fn fenced_output_is_accepted() {
        let raw = "```json\n{\"steps\":[{\"tool\":\"hotel_search\",\"args\":{\"query\":\"Austin hotels\"}}]}\n```";
        let plan = repair(Some(raw), &request("hotels in Austin"), &config());
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].tool, ToolKind::HotelSearch);
        assert!(plan.repairs.is_empty());
    }

    #[test]
    fn unknown_tool_dropped_and_references_renumbered() {
        let raw = json!({"steps": [
            {"tool": "weather_search", "args": {}},
            {"tool": "hotel_search", "args": {"query": "hotels"}},
            {"tool": "place_search", "args": {"query": "food"}, "context_from_step": 2},
        ]})
        .to_string();
        let plan = repair(Some(&raw), &request("q"), &config());
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[1].context_from_step, Some(1));
        assert!(plan.references_are_backward());
        assert_eq!(
            plan.repairs[0],
            PlanRepair::DroppedUnknownTool {
                position: 1,
                tool: "weather_search".into()
            }
        );
    }

    #[test]
    fn forward_self_and_dropped_references_are_removed() {
        let raw = json!({"steps": [
            {"tool": "web_search", "args": {"query": "a"}, "context_from_step": 1},
            {"tool": "web_search", "args": {"query": "b"}, "context_from_step": 3},
            {"tool": "web_search", "args": {"query": "c"}},
            {"tool": "web_search", "args": {"query": "d"}, "context_from_step": 1},
            {"tool": "web_search", "args": {"query": "e"}, "context_from_step": 0},
        ]})
        .to_string();
        let plan = repair(Some(&raw), &request("q"), &config());
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].args["query"], "c");
        assert!(plan.references_are_backward());
    }

    #[test]
    fn long_plans_are_truncated() {
        let steps: Vec<Value> = (0..6)
            .map(|i| json!({"tool": "web_search", "args": {"query": format!("q{i}")}}))
            .collect();
        let raw = json!({ "steps": steps }).to_string();
        let plan = repair(Some(&raw), &request("q"), &config());
        assert_eq!(plan.steps.len(), MAX_STEPS);
        assert!(plan.repairs.contains(&PlanRepair::Truncated { dropped: 2 }));
    }

    #[test]
    fn query_injected_except_for_flights() {
        let raw = json!({"steps": [
            {"tool": "product_search", "args": {"query": "  "}},
            {"tool": "flight_search", "args": {"origin": "SFO"}},
        ]})
        .to_string();
        let plan = repair(Some(&raw), &request("cheap flights and luggage"), &config());
        assert_eq!(plan.steps[0].args["query"], "cheap flights and luggage");
        assert!(plan.steps[1].args.get("query").is_none());
        assert_eq!(plan.repairs, vec![PlanRepair::InjectedQuery { step: 1 }]);
    }

    #[test]
    fn filters_merge_without_overwriting() {
        let mut req = request("hotels in Denver under 150");
        let mut hotel = Map::new();
        hotel.insert("max_price".into(), json!(150));
        hotel.insert("location".into(), json!("Denver"));
        req.filters.hotel = Some(hotel);

        let raw = json!({"steps": [
            {"tool": "hotel_search", "args": {"query": "hotels", "location": "Boulder"}},
        ]})
        .to_string();
        let plan = repair(Some(&raw), &req, &config());
        assert_eq!(plan.steps[0].args["location"], "Boulder");
        assert_eq!(plan.steps[0].args["max_price"], 150);
        assert_eq!(
            plan.repairs,
            vec![PlanRepair::MergedFilters {
                step: 1,
                keys: vec!["max_price".into()]
            }]
        );
    }

    #[test]
    fn disallowed_tools_are_dropped() {
        let mut cfg = config();
        cfg.allowed_tools = [ToolKind::WebSearch].into_iter().collect();
        let raw = json!({"steps": [{"tool": "hotel_search", "args": {"query": "x"}}]}).to_string();
        let plan = repair(Some(&raw), &request("x"), &cfg);
        assert!(plan.is_fallback());
    }

    #[test]
    fn prompt_lists_catalog_history_and_memory() {
        let planner = RetrievalPlanner::new(Arc::new(ScriptedModel::always("{}")), config());
        let mut req = request("pet friendly hotels");
        req.history = (0..10).map(|i| Turn::user(format!("turn {i}"))).collect();
        req.memory = vec!["travels with a dog".into()];
        let prompt = planner.build_prompt(&req);
        for kind in ToolKind::ALL {
            assert!(prompt.system.contains(kind.as_str()));
        }
        assert!(prompt.user.contains("turn 9"));
        assert!(!prompt.user.contains("turn 3"));
        assert!(prompt.user.contains("travels with a dog"));
    }

    #[tokio::test]
    async fn model_error_yields_fallback() {
        let model = ScriptedModel::new(vec![MockReply::Error(CollaboratorError::ServerError { status: 500 })]);
        let planner = RetrievalPlanner::new(Arc::new(model), config());
        let plan = planner.plan(&request("concerts"), &CancellationToken::new()).await;
        assert!(plan.is_fallback());
        assert_eq!(plan.steps[0].args["query"], "concerts");
    }

    #[tokio::test(start_paused = true)]
    async fn model_timeout_yields_fallback() {
        let model = ScriptedModel::new(vec![MockReply::Hang]);
        let planner = RetrievalPlanner::new(Arc::new(model), config());
        let plan = planner.plan(&request("concerts"), &CancellationToken::new()).await;
        assert!(plan.is_fallback());
    }

    #[tokio::test]
    async fn valid_model_plan_is_used() {
        let model = ScriptedModel::always(
            r#"{"steps":[{"tool":"movie_search","args":{"query":"thrillers"}},{"tool":"place_search","context_from_step":1}]}"#,
        );
        let planner = RetrievalPlanner::new(Arc::new(model), config());
        let plan = planner.plan(&request("thriller and dinner nearby"), &CancellationToken::new()).await;
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[1].context_from_step, Some(1));
        assert_eq!(plan.steps[1].args["query"], "thriller and dinner nearby");
    }
}
