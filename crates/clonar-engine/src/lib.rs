//! Per-query orchestration: intent cascade, filter extraction, retrieval
//! planning and execution, and the pipeline that streams it all into a session.

pub mod error;
pub mod executor;
pub mod filters;
pub mod guarded;
pub mod intent;
pub mod pipeline;
pub mod planner;
pub mod registry;
pub mod tools;

#[cfg(test)]
pub(crate) mod testing;

pub use error::EngineError;
pub use executor::{ExecutorConfig, RetrievalExecutor, StepResult, StepStatus};
pub use filters::extract_filters;
pub use guarded::{guarded_call, CallOutcome, LLM_DEPENDENCY};
pub use intent::{default_exemplars, ExemplarIndex, IntentCascade, IntentConfig};
pub use pipeline::{PipelineConfig, QueryPipeline};
pub use planner::{PlanRequest, PlannerConfig, RetrievalPlanner};
pub use registry::ToolRegistry;
pub use tools::{register_serpapi_tools, SerpApiClient, SerpApiTool, SERPAPI_DEPENDENCY};
