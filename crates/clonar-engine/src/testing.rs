//! Scripted retrieval tools for executor and pipeline tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use clonar_core::collaborators::{RetrievalTool, StepContext};
use clonar_core::errors::{CollaboratorError, ToolError};
use clonar_core::plan::ToolKind;

#[derive(Clone, Debug)]
enum Behavior {
    Items(Vec<Value>),
    Fail,
    Panic,
}

/// Tool with a fixed behavior. Records the args of every call.
pub struct StaticTool {
    kind: ToolKind,
    dependency: String,
    behavior: Behavior,
    delay: Option<Duration>,
    calls: AtomicUsize,
    seen_args: Mutex<Vec<Map<String, Value>>>,
}

impl StaticTool {
    /// Returns `items` on every call. The dependency defaults to the tool name.
    pub fn new(kind: ToolKind, items: Vec<Value>) -> Self {
        Self::with_behavior(kind, Behavior::Items(items))
    }

    /// Fails every call with a 503 from upstream.
    pub fn failing(kind: ToolKind) -> Self {
        Self::with_behavior(kind, Behavior::Fail)
    }

    pub fn panicking(kind: ToolKind) -> Self {
        Self::with_behavior(kind, Behavior::Panic)
    }

    fn with_behavior(kind: ToolKind, behavior: Behavior) -> Self {
        Self {
            kind,
            dependency: kind.as_str().to_string(),
            behavior,
            delay: None,
            calls: AtomicUsize::new(0),
            seen_args: Mutex::new(Vec::new()),
        }
    }

    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependency = dependency.into();
        self
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn seen_args(&self) -> Vec<Map<String, Value>> {
        self.seen_args.lock().clone()
    }
}

#[async_trait]
impl RetrievalTool for StaticTool {
    fn kind(&self) -> ToolKind {
        self.kind
    }

    fn dependency(&self) -> &str {
        &self.dependency
    }

    async fn search(
        &self,
        args: &Map<String, Value>,
        _ctx: &StepContext,
    ) -> Result<Vec<Value>, ToolError> {
        let _ = self.calls.fetch_add(1, Ordering::Relaxed);
        self.seen_args.lock().push(args.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.behavior {
            Behavior::Items(items) => Ok(items.clone()),
            Behavior::Fail => Err(CollaboratorError::ServerError { status: 503 }.into()),
            Behavior::Panic => panic!("tool exploded"),
        }
    }
}
