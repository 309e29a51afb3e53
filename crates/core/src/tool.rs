//! Tool trait: the abstraction over agent capabilities.
//!
//! Tools are trusted in-process capabilities the model may request by
//! name. The registry validates arguments against each tool's declared
//! parameters, enforces a per-call timeout, and turns every failure into a
//! `ToolOutcome::Error` the loop can hand back to the model.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{ToolError, ToolErrorKind};
use crate::schema::{self, ParameterSpec};

/// Default per-call tool timeout.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// A request from the model to invoke a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Unique call ID within the turn (matches the model's tool_call.id)
    pub id: String,

    /// Name of the tool to invoke
    pub name: String,

    /// Arguments as a JSON value
    pub arguments: serde_json::Value,
}

/// Success payload or error descriptor of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    Success(serde_json::Value),
    Error { kind: ToolErrorKind, detail: String },
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// The JSON shown to the model and streamed in `tool_result` events.
    pub fn to_payload(&self) -> serde_json::Value {
        match self {
            Self::Success(value) => value.clone(),
            Self::Error { kind, detail } => serde_json::json!({
                "error": detail,
                "kind": kind,
            }),
        }
    }
}

impl From<ToolError> for ToolOutcome {
    fn from(err: ToolError) -> Self {
        Self::Error {
            kind: err.kind(),
            detail: err.to_string(),
        }
    }
}

/// The outcome of a `ToolCallRequest`, appended to the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallOutcome {
    /// The request id this outcome answers
    pub call_id: String,
    pub tool_name: String,
    pub outcome: ToolOutcome,
    pub duration_ms: u64,
}

/// Name, description and parameters of a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterSpec>,
}

impl ToolDescriptor {
    /// JSON Schema for the parameters (what the model sees).
    pub fn json_schema(&self) -> serde_json::Value {
        schema::to_json_schema(&self.parameters)
    }
}

/// The core Tool trait.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "policy_lookup").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// Declared parameters, used for the schema and for validation.
    fn parameters(&self) -> Vec<ParameterSpec>;

    /// Run the tool. Arguments have already been validated.
    async fn invoke(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError>;

    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

type BoxedInvoke = Box<
    dyn Fn(serde_json::Value) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, ToolError>> + Send>>
        + Send
        + Sync,
>;

/// A tool assembled from a descriptor and a closure.
struct FnTool {
    descriptor: ToolDescriptor,
    invoke: BoxedInvoke,
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn description(&self) -> &str {
        &self.descriptor.description
    }

    fn parameters(&self) -> Vec<ParameterSpec> {
        self.descriptor.parameters.clone()
    }

    async fn invoke(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        (self.invoke)(arguments).await
    }
}

/// A registry of available tools.
///
/// The agent loop uses this to:
/// 1. Get tool descriptors to send to the model
/// 2. Validate, run and time-box the invocations the model requests
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    timeout: Duration,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    /// Set the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            warn!(tool = %name, "Replacing previously registered tool");
        }
    }

    /// Register a capability from a descriptor and an async closure.
    pub fn register_fn<F, Fut>(&mut self, descriptor: ToolDescriptor, invoke: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, ToolError>> + Send + 'static,
    {
        let invoke: BoxedInvoke = Box::new(move |args| Box::pin(invoke(args)));
        self.register(Arc::new(FnTool { descriptor, invoke }));
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// All descriptors, sorted by name.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut defs: Vec<_> = self.tools.values().map(|t| t.descriptor()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Descriptors for the given names, in the given order. Unknown names
    /// are skipped.
    pub fn schemas_for(&self, names: &[&str]) -> Vec<ToolDescriptor> {
        names
            .iter()
            .filter_map(|n| self.tools.get(*n))
            .map(|t| t.descriptor())
            .collect()
    }

    /// Validate and run a tool by name, bounded by the registry timeout.
    pub async fn invoke(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        schema::validate(&tool.parameters(), &arguments).map_err(|reason| {
            ToolError::InvalidArguments {
                tool_name: name.to_string(),
                reason,
            }
        })?;

        match tokio::time::timeout(self.timeout, tool.invoke(arguments)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout {
                tool_name: name.to_string(),
                timeout_secs: self.timeout.as_secs(),
            }),
        }
    }

    /// Run one requested call and fold the result into an outcome.
    pub async fn execute(&self, call: &ToolCallRequest) -> ToolCallOutcome {
        let start = Instant::now();
        let outcome = match self.invoke(&call.name, call.arguments.clone()).await {
            Ok(value) => ToolOutcome::Success(value),
            Err(e) => {
                warn!(tool = %call.name, call_id = %call.id, error = %e, "Tool invocation failed");
                ToolOutcome::from(e)
            }
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        debug!(tool = %call.name, duration_ms, success = outcome.is_success(), "Tool finished");

        ToolCallOutcome {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            outcome,
            duration_ms,
        }
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
