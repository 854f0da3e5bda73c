//! Retrieval executor: runs a validated plan level by level through the
//! breaker and rate-limit gates, with a hard per-step time budget.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use clonar_admission::{BreakerCheck, BreakerRegistry, RateLimiter};
use clonar_core::collaborators::StepContext;
use clonar_core::errors::ToolError;
use clonar_core::ids::SessionId;
use clonar_core::plan::{RetrievalPlan, RetrievalStep, ToolKind};
use clonar_core::timeout::{race, Timed};
use clonar_settings::ClonarSettings;

use crate::registry::ToolRegistry;

/// Titles taken from a referenced step when deriving `context`.
const CONTEXT_ITEMS: usize = 3;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    /// The call ran (or was due to run) and produced nothing usable.
    Failed { reason: String },
    /// The call was never attempted.
    Unavailable { reason: String },
}

impl StepStatus {
    fn failed(reason: &str) -> Self {
        Self::Failed {
            reason: reason.to_string(),
        }
    }

    fn unavailable(reason: &str) -> Self {
        Self::Unavailable {
            reason: reason.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StepResult {
    /// 1-based plan index.
    pub index: usize,
    pub tool: ToolKind,
    #[serde(flatten)]
    pub status: StepStatus,
    pub results: Vec<Value>,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl StepResult {
    fn empty(index: usize, tool: ToolKind, status: StepStatus) -> Self {
        Self {
            index,
            tool,
            status,
            results: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    pub step_timeout: Duration,
    /// Calls per dependency per window. Zero disables the limit.
    pub dependency_rate_limit: u32,
    pub dependency_rate_window: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from(&ClonarSettings::default())
    }
}

impl From<&ClonarSettings> for ExecutorConfig {
    fn from(s: &ClonarSettings) -> Self {
        Self {
            step_timeout: s.executor.step_timeout(),
            dependency_rate_limit: s.admission.dependency_rate_limit,
            dependency_rate_window: s.admission.dependency_rate_window(),
        }
    }
}

pub struct RetrievalExecutor {
    tools: ToolRegistry,
    breakers: BreakerRegistry,
    rate_limiter: Option<Arc<RateLimiter>>,
    config: ExecutorConfig,
}

impl RetrievalExecutor {
    pub fn new(tools: ToolRegistry, breakers: BreakerRegistry, config: ExecutorConfig) -> Self {
        let rate_limiter = (config.dependency_rate_limit > 0).then(|| {
            Arc::new(RateLimiter::new(
                config.dependency_rate_limit,
                config.dependency_rate_window,
            ))
        });
        Self {
            tools,
            breakers,
            rate_limiter,
            config,
        }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Per-dependency limiter, shared with the window sweeper.
    pub fn rate_limiter(&self) -> Option<Arc<RateLimiter>> {
        self.rate_limiter.clone()
    }

    /// Execute every step of `plan`. Results come back in plan order, one per
    /// step, whatever happened to the call.
    #[instrument(skip_all, fields(session_id = %session_id, steps = plan.steps.len()))]
    pub async fn execute(
        &self,
        plan: &RetrievalPlan,
        session_id: &SessionId,
        abort: &CancellationToken,
    ) -> Vec<StepResult> {
        let levels = dependency_levels(&plan.steps);
        let mut results: Vec<Option<StepResult>> = vec![None; plan.steps.len()];

        for level in levels {
            if abort.is_cancelled() {
                break;
            }
            let runs = level.iter().map(|&i| {
                let step = &plan.steps[i];
                let context = step
                    .context_from_step
                    .and_then(|dep| dep.checked_sub(1))
                    .and_then(|dep| results.get(dep).and_then(Option::as_ref))
                    .map(derive_context);
                self.run_step(i + 1, step, context, session_id, abort)
            });
            let finished = join_all(runs).await;
            for result in finished {
                let slot = result.index - 1;
                results[slot] = Some(result);
            }
        }

        results
            .into_iter()
            .enumerate()
            .map(|(i, r)| {
                r.unwrap_or_else(|| {
                    StepResult::empty(i + 1, plan.steps[i].tool, StepStatus::failed("aborted"))
                })
            })
            .collect()
    }

    async fn run_step(
        &self,
        index: usize,
        step: &RetrievalStep,
        context: Option<String>,
        session_id: &SessionId,
        abort: &CancellationToken,
    ) -> StepResult {
        let Some(tool) = self.tools.get(step.tool) else {
            warn!(step = index, tool = %step.tool, "no tool registered");
            return StepResult::empty(index, step.tool, StepStatus::unavailable("no_tool"));
        };
        let dependency = tool.dependency().to_string();

        let call = match self.breakers.check(&dependency) {
            BreakerCheck::Allowed(call) => call,
            BreakerCheck::Open { retry_after } => {
                info!(
                    step = index,
                    dependency = %dependency,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "step skipped, circuit open"
                );
                return StepResult::empty(index, step.tool, StepStatus::unavailable("circuit_open"));
            }
        };

        if let Some(limiter) = &self.rate_limiter {
            if limiter.check(&dependency).is_err() {
                info!(step = index, dependency = %dependency, "step skipped, dependency rate limited");
                drop(call);
                return StepResult::empty(index, step.tool, StepStatus::unavailable("rate_limited"));
            }
        }

        let mut args = step.args.clone();
        if let Some(context) = context {
            let _ = args.insert("context".into(), Value::String(context));
        }
        let ctx = StepContext {
            session_id: session_id.clone(),
            step: index,
            abort: abort.clone(),
        };

        let start = Instant::now();
        let outcome = race(
            self.config.step_timeout,
            abort,
            AssertUnwindSafe(tool.search(&args, &ctx)).catch_unwind(),
        )
        .await;
        let elapsed = start.elapsed();
        let elapsed_ms = elapsed.as_millis() as u64;

        let (status, results) = match outcome {
            Timed::Completed(Ok(Ok(items))) => {
                call.success();
                if items.is_empty() {
                    debug!(step = index, dependency = %dependency, elapsed_ms, "step returned no results");
                    (StepStatus::failed("empty"), items)
                } else {
                    debug!(step = index, dependency = %dependency, elapsed_ms, count = items.len(), "step succeeded");
                    (StepStatus::Succeeded, items)
                }
            }
            Timed::Completed(Ok(Err(e))) => {
                if counts_against_breaker(&e) {
                    call.failure();
                }
                warn!(step = index, dependency = %dependency, error = %e, elapsed_ms, "step failed");
                (StepStatus::failed("error"), Vec::new())
            }
            Timed::Completed(Err(panic)) => {
                call.failure();
                error!(
                    step = index,
                    dependency = %dependency,
                    panic = %panic_message(&panic),
                    "tool panicked during execution"
                );
                (StepStatus::failed("error"), Vec::new())
            }
            Timed::TimedOut(budget) => {
                call.failure();
                warn!(
                    step = index,
                    dependency = %dependency,
                    timeout_ms = budget.as_millis() as u64,
                    "step timed out"
                );
                (StepStatus::failed("timeout"), Vec::new())
            }
            Timed::Cancelled => {
                drop(call);
                debug!(step = index, "step aborted");
                (StepStatus::failed("aborted"), Vec::new())
            }
        };

        StepResult {
            index,
            tool: step.tool,
            status,
            results,
            elapsed,
        }
    }
}

/// Bad arguments are our fault, not the dependency's.
fn counts_against_breaker(error: &ToolError) -> bool {
    match error {
        ToolError::InvalidArguments(_) => false,
        ToolError::Upstream(e) => e.is_dependency_failure(),
        ToolError::ExecutionFailed(_) => true,
    }
}

pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

/// Group step indices (0-based) into levels. A step without a reference is
/// level 0; otherwise one level below the step it references.
pub fn dependency_levels(steps: &[RetrievalStep]) -> Vec<Vec<usize>> {
    let mut level_of = vec![0usize; steps.len()];
    let mut levels: Vec<Vec<usize>> = Vec::new();
    for (i, step) in steps.iter().enumerate() {
        let level = match step.context_from_step {
            Some(dep) if dep >= 1 && dep <= i => level_of[dep - 1] + 1,
            _ => 0,
        };
        level_of[i] = level;
        if levels.len() <= level {
            levels.resize_with(level + 1, Vec::new);
        }
        levels[level].push(i);
    }
    levels
}

/// Preference string from a finished step: names of its top results.
/// Anything but a success yields an empty string.
pub fn derive_context(result: &StepResult) -> String {
    if !result.status.is_success() {
        return String::new();
    }
    result
        .results
        .iter()
        .filter_map(item_label)
        .take(CONTEXT_ITEMS)
        .collect::<Vec<_>>()
        .join(", ")
}

fn item_label(item: &Value) -> Option<String> {
    let obj: &Map<String, Value> = item.as_object()?;
    ["title", "name"]
        .iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}
