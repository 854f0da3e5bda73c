use std::collections::HashMap;
use std::sync::Arc;

use clonar_core::collaborators::RetrievalTool;
use clonar_core::plan::ToolKind;

/// Retrieval tools available to the executor, one per [`ToolKind`].
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<ToolKind, Arc<dyn RetrievalTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its own kind, replacing any previous one.
    pub fn register(&mut self, tool: Arc<dyn RetrievalTool>) {
        let _ = self.tools.insert(tool.kind(), tool);
    }

    pub fn with(mut self, tool: Arc<dyn RetrievalTool>) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, kind: ToolKind) -> Option<Arc<dyn RetrievalTool>> {
        self.tools.get(&kind).map(Arc::clone)
    }

    pub fn contains(&self, kind: ToolKind) -> bool {
        self.tools.contains_key(&kind)
    }

    /// Registered kinds in catalog order.
    pub fn kinds(&self) -> Vec<ToolKind> {
        ToolKind::ALL
            .into_iter()
            .filter(|k| self.tools.contains_key(k))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticTool;

    #[test]
    fn register_and_lookup() {
        let registry = ToolRegistry::new()
            .with(Arc::new(StaticTool::new(ToolKind::WebSearch, vec![])))
            .with(Arc::new(StaticTool::new(ToolKind::HotelSearch, vec![])));
        assert_eq!(registry.count(), 2);
        assert!(registry.contains(ToolKind::HotelSearch));
        assert!(registry.get(ToolKind::FlightSearch).is_none());
        assert_eq!(
            registry.kinds(),
            vec![ToolKind::HotelSearch, ToolKind::WebSearch]
        );
    }

    #[test]
    fn re_register_replaces() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(StaticTool::new(ToolKind::WebSearch, vec![])));
        registry.register(Arc::new(StaticTool::new(ToolKind::WebSearch, vec![])));
        assert_eq!(registry.count(), 1);
    }
}
