//! Tool registry traits and an in-memory implementation.
//!
//! A tool is addressed as `connector.tool`. The registry resolves the
//! connector, the connector resolves the tool.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use toolgate_policy::PolicyClass;

use crate::error::ToolError;

/// Invocation context handed to a tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolContext {
    pub run_id: String,
    pub tenant_id: String,
    pub tool_name: String,
    pub step_id: Option<String>,
    pub actor: Option<String>,
}

/// An executable tool with its contract.
#[async_trait]
pub trait Tool: Send + Sync {
    fn policy_class(&self) -> PolicyClass;

    /// JSON Schema the input must satisfy.
    fn input_schema(&self) -> &Value;

    /// JSON Schema the output must satisfy.
    fn output_schema(&self) -> &Value;

    async fn invoke(&self, ctx: &ToolContext, input: Value) -> Result<Value, ToolError>;
}

/// A named group of tools, typically one external service.
pub trait Connector: Send + Sync {
    fn id(&self) -> &str;

    fn tool(&self, tool_id: &str) -> Option<Arc<dyn Tool>>;

    /// Tool ids, sorted.
    fn tool_ids(&self) -> Vec<String>;
}

/// Resolves connectors by id.
pub trait ToolRegistry: Send + Sync {
    fn connector(&self, id: &str) -> Option<Arc<dyn Connector>>;
}

// ─── Closure-backed tool ──────────────────────────────────────────────────────

type Handler = dyn Fn(ToolContext, Value) -> BoxFuture<'static, Result<Value, ToolError>> + Send + Sync;

/// A [`Tool`] whose handler is a closure.
pub struct FnTool {
    policy_class: PolicyClass,
    input_schema: Value,
    output_schema: Value,
    handler: Box<Handler>,
}

impl FnTool {
    pub fn new<F>(policy_class: PolicyClass, input_schema: Value, output_schema: Value, handler: F) -> Self
    where
        F: Fn(ToolContext, Value) -> BoxFuture<'static, Result<Value, ToolError>> + Send + Sync + 'static,
    {
        Self {
            policy_class,
            input_schema,
            output_schema,
            handler: Box::new(handler),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn policy_class(&self) -> PolicyClass {
        self.policy_class
    }

    fn input_schema(&self) -> &Value {
        &self.input_schema
    }

    fn output_schema(&self) -> &Value {
        &self.output_schema
    }

    async fn invoke(&self, ctx: &ToolContext, input: Value) -> Result<Value, ToolError> {
        (self.handler)(ctx.clone(), input).await
    }
}

impl std::fmt::Debug for FnTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTool")
            .field("policy_class", &self.policy_class)
            .finish_non_exhaustive()
    }
}

// ─── In-memory registry ───────────────────────────────────────────────────────

/// Connector holding a fixed set of tools.
pub struct MemoryConnector {
    id: String,
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl MemoryConnector {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tools: HashMap::new(),
        }
    }

    pub fn with_tool(mut self, tool_id: impl Into<String>, tool: impl Tool + 'static) -> Self {
        self.tools.insert(tool_id.into(), Arc::new(tool));
        self
    }
}

impl Connector for MemoryConnector {
    fn id(&self) -> &str {
        &self.id
    }

    fn tool(&self, tool_id: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(tool_id).cloned()
    }

    fn tool_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tools.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Registry backed by a map of connectors, mutable at runtime.
#[derive(Default)]
pub struct MemoryToolRegistry {
    connectors: RwLock<HashMap<String, Arc<dyn Connector>>>,
}

impl MemoryToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `connector` under its id, replacing any previous one.
    pub fn register(&self, connector: impl Connector + 'static) {
        let id = connector.id().to_string();
        tracing::debug!(connector = %id, tools = ?connector.tool_ids(), "registered connector");
        self.connectors.write().insert(id, Arc::new(connector));
    }

    pub fn unregister(&self, id: &str) -> bool {
        self.connectors.write().remove(id).is_some()
    }

    /// Connector ids, sorted.
    pub fn connector_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connectors.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl ToolRegistry for MemoryToolRegistry {
    fn connector(&self, id: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.read().get(id).cloned()
    }
}
