//! Workflow-document tools.
//!
//! A workflow is a graph of nodes keyed by string ID. Each node has a
//! `class_type` and named `inputs`; an input whose value is a two-element
//! array `[source_node_id, output_slot]` is a connection to another node.
//!
//! The document is owned by whoever builds the tools and shared between them
//! through a [`SharedWorkflow`] handle, so each agent (or test) can work on
//! its own document.

use async_trait::async_trait;
use axon_core::error::ToolError;
use axon_core::tool::Tool;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// One node of a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub class_type: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// If `value` is a connection, the node it points at.
fn connection_source(value: &Value) -> Option<&str> {
    match value.as_array()?.as_slice() {
        [Value::String(source), slot] if slot.is_u64() => Some(source),
        _ => None,
    }
}

/// An editable workflow graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDocument {
    nodes: BTreeMap<String, WorkflowNode>,
    #[serde(skip)]
    next_id: u64,
}

/// A workflow shared by the tools that edit it.
pub type SharedWorkflow = Arc<RwLock<WorkflowDocument>>;

impl WorkflowDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedWorkflow {
        Arc::new(RwLock::new(self))
    }

    fn allocate_id(&mut self) -> String {
        loop {
            self.next_id += 1;
            let id = self.next_id.to_string();
            if !self.nodes.contains_key(&id) {
                return id;
            }
        }
    }

    /// Add a node, returning its ID. An explicit `node_id` replaces any node
    /// already stored under it.
    pub fn add_node(
        &mut self,
        class_type: impl Into<String>,
        inputs: Map<String, Value>,
        node_id: Option<String>,
        title: Option<String>,
    ) -> String {
        let id = node_id.unwrap_or_else(|| self.allocate_id());
        let class_type = class_type.into();
        info!(node_id = %id, class_type = %class_type, "Added workflow node");
        self.nodes.insert(
            id.clone(),
            WorkflowNode {
                class_type,
                inputs,
                title,
            },
        );
        id
    }

    /// Remove a node and every connection that points at it.
    pub fn remove_node(&mut self, node_id: &str) -> Option<WorkflowNode> {
        let removed = self.nodes.remove(node_id)?;
        for (other_id, node) in &mut self.nodes {
            node.inputs.retain(|input, value| {
                let keep = connection_source(value) != Some(node_id);
                if !keep {
                    debug!(node = %other_id, input = %input, "Dropped connection to removed node");
                }
                keep
            });
        }
        info!(node_id, "Removed workflow node");
        Some(removed)
    }

    pub fn get_node(&self, node_id: &str) -> Option<&WorkflowNode> {
        self.nodes.get(node_id)
    }

    pub fn set_input(&mut self, node_id: &str, input: &str, value: Value) -> bool {
        match self.nodes.get_mut(node_id) {
            Some(node) => {
                node.inputs.insert(input.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Wire `source`'s output `slot` into `target`'s `input`.
    pub fn connect(
        &mut self,
        source: &str,
        slot: u64,
        target: &str,
        input: &str,
    ) -> Result<(), String> {
        if !self.nodes.contains_key(source) {
            return Err(format!("Source node {source} not found"));
        }
        if !self.set_input(target, input, json!([source, slot])) {
            return Err(format!("Target node {target} not found"));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The graph in `{ id: { class_type, inputs, _meta } }` form.
    pub fn to_api_json(&self) -> Value {
        let nodes = self
            .nodes
            .iter()
            .map(|(id, node)| {
                let mut entry = json!({
                    "class_type": node.class_type,
                    "inputs": node.inputs,
                });
                if let Some(title) = &node.title {
                    entry["_meta"] = json!({ "title": title });
                }
                (id.clone(), entry)
            })
            .collect();
        Value::Object(nodes)
    }
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args[key]
        .as_str()
        .ok_or_else(|| ToolError::InvalidArguments(format!("Missing '{key}' argument")))
}

fn failed(tool: &str, reason: impl Into<String>) -> ToolError {
    ToolError::ExecutionFailed {
        tool_name: tool.to_string(),
        reason: reason.into(),
    }
}

/// `workflow_get`: the whole document, or one node.
pub struct WorkflowGetTool {
    doc: SharedWorkflow,
}

#[async_trait]
impl Tool for WorkflowGetTool {
    fn name(&self) -> &str {
        "workflow_get"
    }

    fn description(&self) -> &str {
        "Get the current workflow, or a single node when node_id is given."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "node_id": { "type": "string", "description": "Optional node to fetch." }
            }
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let doc = self.doc.read();
        match args["node_id"].as_str() {
            Some(id) => {
                let node = doc
                    .get_node(id)
                    .ok_or_else(|| failed(self.name(), format!("Node {id} not found")))?;
                Ok(json!({ "node_id": id, "node": node }))
            }
            None => Ok(json!({ "node_count": doc.len(), "workflow": doc.to_api_json() })),
        }
    }
}

/// `workflow_add_node`
pub struct WorkflowAddNodeTool {
    doc: SharedWorkflow,
}

#[async_trait]
impl Tool for WorkflowAddNodeTool {
    fn name(&self) -> &str {
        "workflow_add_node"
    }

    fn description(&self) -> &str {
        "Add a node to the workflow. Returns the node ID for connecting to other nodes."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "class_type": { "type": "string", "description": "Node class, e.g. 'KSampler'." },
                "inputs": {
                    "type": "object",
                    "description": "Input values. Use [node_id, output_slot] for connections."
                },
                "node_id": { "type": "string", "description": "Optional explicit node ID." },
                "title": { "type": "string", "description": "Optional display title." }
            },
            "required": ["class_type"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let class_type = str_arg(&args, "class_type")?;
        let inputs = match &args["inputs"] {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            _ => return Err(ToolError::InvalidArguments("'inputs' must be an object".into())),
        };
        let node_id = args["node_id"].as_str().map(str::to_string);
        let title = args["title"].as_str().map(str::to_string);

        let id = self.doc.write().add_node(class_type, inputs, node_id, title);
        Ok(json!({ "node_id": id, "class_type": class_type }))
    }
}

/// `workflow_connect`
pub struct WorkflowConnectTool {
    doc: SharedWorkflow,
}

#[async_trait]
impl Tool for WorkflowConnectTool {
    fn name(&self) -> &str {
        "workflow_connect"
    }

    fn description(&self) -> &str {
        "Connect an output slot of one node to a named input of another."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "source_node_id": { "type": "string" },
                "source_output": { "type": "integer", "minimum": 0 },
                "target_node_id": { "type": "string" },
                "target_input": { "type": "string" }
            },
            "required": ["source_node_id", "source_output", "target_node_id", "target_input"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let source = str_arg(&args, "source_node_id")?;
        let target = str_arg(&args, "target_node_id")?;
        let input = str_arg(&args, "target_input")?;
        let slot = args["source_output"].as_u64().ok_or_else(|| {
            ToolError::InvalidArguments("'source_output' must be a non-negative integer".into())
        })?;

        self.doc
            .write()
            .connect(source, slot, target, input)
            .map_err(|reason| failed(self.name(), reason))?;
        Ok(json!({ "connected": [source, slot, target, input] }))
    }
}

/// `workflow_set_input`
pub struct WorkflowSetInputTool {
    doc: SharedWorkflow,
}

#[async_trait]
impl Tool for WorkflowSetInputTool {
    fn name(&self) -> &str {
        "workflow_set_input"
    }

    fn description(&self) -> &str {
        "Set one input value on a node."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "node_id": { "type": "string" },
                "input_name": { "type": "string" },
                "value": { "description": "New value. Use [node_id, output_slot] for a connection." }
            },
            "required": ["node_id", "input_name", "value"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let node_id = str_arg(&args, "node_id")?;
        let input = str_arg(&args, "input_name")?;
        let value = args
            .get("value")
            .cloned()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'value' argument".into()))?;

        if !self.doc.write().set_input(node_id, input, value.clone()) {
            return Err(failed(self.name(), format!("Node {node_id} not found")));
        }
        Ok(json!({ "node_id": node_id, "input_name": input, "value": value }))
    }
}

/// `workflow_remove_node`
pub struct WorkflowRemoveNodeTool {
    doc: SharedWorkflow,
}

#[async_trait]
impl Tool for WorkflowRemoveNodeTool {
    fn name(&self) -> &str {
        "workflow_remove_node"
    }

    fn description(&self) -> &str {
        "Remove a node. Connections pointing at it are removed too."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "node_id": { "type": "string" } },
            "required": ["node_id"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let node_id = str_arg(&args, "node_id")?;
        let removed = self
            .doc
            .write()
            .remove_node(node_id)
            .ok_or_else(|| failed(self.name(), format!("Node {node_id} not found")))?;
        Ok(json!({ "node_id": node_id, "removed_node": removed }))
    }
}

/// Every workflow tool, sharing `doc`.
pub fn workflow_tools(doc: &SharedWorkflow) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(WorkflowGetTool { doc: doc.clone() }),
        Arc::new(WorkflowAddNodeTool { doc: doc.clone() }),
        Arc::new(WorkflowConnectTool { doc: doc.clone() }),
        Arc::new(WorkflowSetInputTool { doc: doc.clone() }),
        Arc::new(WorkflowRemoveNodeTool { doc: doc.clone() }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_core::tool::{ToolExecutor, ToolRegistry};

    fn registry(doc: &SharedWorkflow) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        for tool in workflow_tools(doc) {
            registry.register(tool);
        }
        registry
    }

    #[test]
    fn ids_are_allocated_sequentially_and_skip_taken() {
        let mut doc = WorkflowDocument::new();
        doc.add_node("A", Map::new(), Some("2".into()), None);
        assert_eq!(doc.add_node("B", Map::new(), None, None), "1");
        assert_eq!(doc.add_node("C", Map::new(), None, None), "3");
    }

    #[test]
    fn remove_node_cleans_connections() {
        let mut doc = WorkflowDocument::new();
        let loader = doc.add_node("CheckpointLoaderSimple", Map::new(), None, None);
        let sampler = doc.add_node("KSampler", Map::new(), None, None);
        doc.connect(&loader, 0, &sampler, "model").unwrap();
        doc.set_input(&sampler, "steps", json!(20));

        doc.remove_node(&loader).unwrap();
        let node = doc.get_node(&sampler).unwrap();
        assert!(node.inputs.get("model").is_none());
        assert_eq!(node.inputs["steps"], 20);
    }

    #[test]
    fn connect_requires_both_nodes() {
        let mut doc = WorkflowDocument::new();
        let a = doc.add_node("A", Map::new(), None, None);
        assert!(doc.connect("missing", 0, &a, "x").is_err());
        assert!(doc.connect(&a, 0, "missing", "x").is_err());
    }

    #[test]
    fn api_json_carries_titles() {
        let mut doc = WorkflowDocument::new();
        doc.add_node("SaveImage", Map::new(), None, Some("Output".into()));
        let api = doc.to_api_json();
        assert_eq!(api["1"]["class_type"], "SaveImage");
        assert_eq!(api["1"]["_meta"]["title"], "Output");
    }

    #[tokio::test]
    async fn tools_share_one_document() {
        let doc = WorkflowDocument::new().shared();
        let tools = registry(&doc);

        let added = tools
            .execute(
                "workflow_add_node",
                json!({"class_type": "EmptyLatentImage", "inputs": {"width": 512}}),
            )
            .await
            .unwrap();
        let id = added["node_id"].as_str().unwrap().to_string();
        tools
            .execute("workflow_add_node", json!({"class_type": "KSampler", "node_id": "s"}))
            .await
            .unwrap();
        tools
            .execute(
                "workflow_connect",
                json!({
                    "source_node_id": id,
                    "source_output": 0,
                    "target_node_id": "s",
                    "target_input": "latent_image"
                }),
            )
            .await
            .unwrap();

        let got = tools.execute("workflow_get", json!({"node_id": "s"})).await.unwrap();
        assert_eq!(got["node"]["inputs"]["latent_image"], json!([id, 0]));
        assert_eq!(doc.read().len(), 2);

        tools
            .execute("workflow_remove_node", json!({"node_id": id}))
            .await
            .unwrap();
        let all = tools.execute("workflow_get", json!({})).await.unwrap();
        assert_eq!(all["node_count"], 1);
        assert!(all["workflow"]["s"]["inputs"].get("latent_image").is_none());
    }

    #[tokio::test]
    async fn missing_nodes_are_execution_failures() {
        let doc = WorkflowDocument::new().shared();
        let tools = registry(&doc);
        let err = tools
            .execute(
                "workflow_set_input",
                json!({"node_id": "9", "input_name": "seed", "value": 1}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed { .. }));

        let err = tools
            .execute("workflow_add_node", json!({"inputs": {}}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
