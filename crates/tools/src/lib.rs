//! Built-in tool implementations for axon.
//!
//! Tools are what the agentic loop executes on the model's behalf. The
//! calculator is stateless; the workflow tools edit a [`SharedWorkflow`]
//! document supplied by the embedder.

pub mod calculator;
pub mod workflow;

use axon_core::tool::ToolRegistry;
use std::sync::Arc;

pub use workflow::{SharedWorkflow, WorkflowDocument, WorkflowNode, workflow_tools};

/// Registry with the stateless built-in tools.
pub fn default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(calculator::CalculatorTool));
    registry
}

/// The default tools plus the workflow tools bound to `doc`.
pub fn registry_with_workflow(doc: &SharedWorkflow) -> ToolRegistry {
    let mut registry = default_registry();
    for tool in workflow_tools(doc) {
        registry.register(tool);
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_calculator() {
        let registry = default_registry();
        assert_eq!(registry.names(), vec!["calculator"]);
    }

    #[test]
    fn workflow_registry_adds_workflow_tools() {
        let doc = WorkflowDocument::new().shared();
        let registry = registry_with_workflow(&doc);
        assert_eq!(registry.len(), 6);
        assert!(registry.get("workflow_connect").is_some());
    }
}
