//! Shared test helpers for agent loop tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anjia_core::error::GatewayError;
use anjia_core::model::{ModelGateway, ModelRequest, ModelResponse, ModelStream};
use anjia_core::schema::{ParamType, ParameterSpec};
use anjia_core::tool::{ToolCallRequest, ToolDescriptor, ToolRegistry};
use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};

use crate::stream_event::StreamEvent;

type Scripted = Result<ModelResponse, GatewayError>;

/// A gateway that replays a script of responses and errors.
///
/// Once the script runs out it repeats `fallback`, or fails with a
/// protocol error when there is none.
pub struct ScriptedGateway {
    script: Mutex<VecDeque<Scripted>>,
    fallback: Option<Scripted>,
    calls: AtomicUsize,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedGateway {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer every call with `response`.
    pub fn repeating(response: ModelResponse) -> Self {
        Self {
            fallback: Some(Ok(response)),
            ..Self::new(vec![])
        }
    }

    /// Fail every call with `err`.
    pub fn repeating_err(err: GatewayError) -> Self {
        Self {
            fallback: Some(Err(err)),
            ..Self::new(vec![])
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every request seen so far, in call order.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelGateway for ScriptedGateway {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        let next = self.script.lock().unwrap().pop_front();
        next.or_else(|| self.fallback.clone())
            .unwrap_or_else(|| Err(GatewayError::Protocol("script exhausted".into())))
    }
}

/// A gateway that blocks until its gate is opened.
pub struct GatedGateway {
    gate: Arc<Notify>,
    reply: String,
}

impl GatedGateway {
    pub fn new(gate: Arc<Notify>, reply: &str) -> Self {
        Self {
            gate,
            reply: reply.into(),
        }
    }
}

#[async_trait]
impl ModelGateway for GatedGateway {
    fn name(&self) -> &str {
        "gated"
    }

    async fn complete(&self, _request: ModelRequest) -> Result<ModelResponse, GatewayError> {
        self.gate.notified().await;
        Ok(ModelResponse::FinalText(self.reply.clone()))
    }
}

/// A streaming gateway that answers with fixed text fragments.
pub struct FragmentGateway {
    fragments: Vec<String>,
    fail_at_end: bool,
}

impl FragmentGateway {
    pub fn new(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            fail_at_end: false,
        }
    }

    /// Stream `fragments`, then break the stream with an error.
    pub fn failing_after(fragments: &[&str]) -> Self {
        Self {
            fail_at_end: true,
            ..Self::new(fragments)
        }
    }
}

#[async_trait]
impl ModelGateway for FragmentGateway {
    fn name(&self) -> &str {
        "fragments"
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn complete(&self, _request: ModelRequest) -> Result<ModelResponse, GatewayError> {
        Ok(ModelResponse::FinalText(self.fragments.concat()))
    }

    async fn stream(&self, _request: ModelRequest) -> Result<ModelStream, GatewayError> {
        let (tx, rx) = mpsc::channel(4);
        let fragments = self.fragments.clone();
        let fail = self.fail_at_end;
        tokio::spawn(async move {
            for fragment in fragments {
                if tx.send(Ok(fragment)).await.is_err() {
                    return;
                }
            }
            if fail {
                let _ = tx
                    .send(Err(GatewayError::Unavailable("stream reset".into())))
                    .await;
            }
        });
        Ok(ModelStream::Text(rx))
    }
}

/// Build a tool-call response; call ids are `call_<index>`.
pub fn tool_calls(calls: &[(&str, serde_json::Value)]) -> ModelResponse {
    ModelResponse::ToolCallsRequested(
        calls
            .iter()
            .enumerate()
            .map(|(i, (name, args))| ToolCallRequest {
                id: format!("call_{i}"),
                name: name.to_string(),
                arguments: args.clone(),
            })
            .collect(),
    )
}

/// A registry with a canned `policy_lookup`.
pub fn policy_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register_fn(
        ToolDescriptor {
            name: "policy_lookup".into(),
            description: "Canned policy lookup".into(),
            parameters: vec![
                ParameterSpec::required("location", ParamType::String, "District"),
                ParameterSpec::required("buyer_type", ParamType::String, "首套 or 二套"),
            ],
        },
        |args| async move {
            Ok(serde_json::json!({
                "location": args["location"],
                "ratio": "30%",
            }))
        },
    );
    registry
}

/// A registry with a `slow` tool that sleeps `ms` (or `default_delay`)
/// and reports how long it slept.
pub fn slow_registry(default_delay: Duration) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    let default_ms = default_delay.as_millis() as u64;
    registry.register_fn(
        ToolDescriptor {
            name: "slow".into(),
            description: "Sleeps".into(),
            parameters: vec![ParameterSpec::optional("ms", ParamType::Integer, "Delay")],
        },
        move |args| async move {
            let ms = args["ms"].as_u64().unwrap_or(default_ms);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(serde_json::json!({ "slept_ms": ms }))
        },
    );
    registry
}

/// Drain a finished turn's events.
pub async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}
