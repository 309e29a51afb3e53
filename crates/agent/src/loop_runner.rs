//! The agent turn loop.
//!
//! One call to [`AgentLoop::run_turn`] drives one user turn to completion:
//! the model is asked for an answer, any requested tools are run, their
//! results are fed back, and so on until the model answers with text or
//! the per-turn iteration budget is spent. Every step is reported through
//! an [`EventSink`].

use std::sync::Arc;
use std::time::Duration;

use anjia_config::AgentConfig;
use anjia_core::error::{GatewayError, ToolErrorKind};
use anjia_core::message::{ConversationStatus, Message};
use anjia_core::model::{ModelGateway, ModelRequest, ModelStream};
use anjia_core::tool::{ToolCallOutcome, ToolCallRequest, ToolDescriptor, ToolOutcome, ToolRegistry};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::encoder::{EncodeError, EventSink, SinkError};
use crate::prompt::DEFAULT_SYSTEM_PROMPT;
use crate::retry::RetryPolicy;
use crate::session::ConversationLease;
use crate::stream_event::{StreamEvent, TurnStatus};

/// Buffered events between a running turn and its consumer.
pub const EVENT_BUFFER: usize = 128;

const FAILURE_MESSAGE: &str = "处理失败，请稍后重试";

/// One user message to process.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub message: String,
    /// Model round trips allowed for this turn
    pub max_iterations: u32,
}

/// How a turn ended. Serializes to the non-streaming chat response.
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub status: TurnStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub iterations: u32,
    pub conversation_id: String,
}

/// Why a turn stopped before producing final text.
#[derive(Debug)]
enum Abort {
    Gateway(GatewayError),
    IterationLimit,
    Cancelled,
    Ordering(EncodeError),
}

impl From<GatewayError> for Abort {
    fn from(e: GatewayError) -> Self {
        Self::Gateway(e)
    }
}

impl From<SinkError> for Abort {
    fn from(e: SinkError) -> Self {
        match e {
            SinkError::Closed => Self::Cancelled,
            SinkError::Encode(e) => Self::Ordering(e),
        }
    }
}

/// The orchestration loop shared by all conversations.
pub struct AgentLoop {
    gateway: Arc<dyn ModelGateway>,
    tools: Arc<ToolRegistry>,
    system_prompt: String,
    retry: RetryPolicy,
    gateway_timeout: Duration,
    history_limit: usize,
    max_parallel_tools: usize,
}

impl AgentLoop {
    /// Create a new agent loop with default limits.
    pub fn new(gateway: Arc<dyn ModelGateway>, tools: Arc<ToolRegistry>) -> Self {
        Self::from_config(gateway, tools, &AgentConfig::default())
    }

    /// Create an agent loop from the `[agent]` config section.
    pub fn from_config(
        gateway: Arc<dyn ModelGateway>,
        tools: Arc<ToolRegistry>,
        config: &AgentConfig,
    ) -> Self {
        Self {
            gateway,
            tools,
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            retry: RetryPolicy::from_config(&config.retry),
            gateway_timeout: config.gateway_timeout(),
            history_limit: config.history_limit.max(1),
            max_parallel_tools: config.max_parallel_tools.max(1),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the per-call model gateway timeout.
    pub fn with_gateway_timeout(mut self, timeout: Duration) -> Self {
        self.gateway_timeout = timeout;
        self
    }

    /// Cap the number of history messages sent to the model.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    pub fn with_max_parallel_tools(mut self, max: usize) -> Self {
        self.max_parallel_tools = max.max(1);
        self
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn gateway_name(&self) -> &str {
        self.gateway.name()
    }

    /// Whether final answers reach clients in more than one chunk.
    pub fn streams_text(&self) -> bool {
        self.gateway.supports_streaming()
    }

    /// Run a turn on a spawned task; events arrive on the returned receiver.
    ///
    /// Dropping the receiver cancels the turn at its next suspension point.
    pub fn spawn_turn(
        self: &Arc<Self>,
        lease: ConversationLease,
        request: TurnRequest,
    ) -> (mpsc::Receiver<StreamEvent>, JoinHandle<TurnOutcome>) {
        let (mut sink, rx) = EventSink::channel(EVENT_BUFFER);
        let agent = Arc::clone(self);
        let handle = tokio::spawn(async move { agent.run_turn(lease, request, &mut sink).await });
        (rx, handle)
    }

    /// Drive one turn to its end. Always returns an outcome; failures are
    /// reported through the sink and the conversation status.
    pub async fn run_turn(
        &self,
        mut lease: ConversationLease,
        request: TurnRequest,
        sink: &mut EventSink,
    ) -> TurnOutcome {
        let conversation_id = lease.id.to_string();
        let max_iterations = request.max_iterations.max(1);
        info!(
            conversation_id = %conversation_id,
            max_iterations,
            new_conversation = lease.is_new(),
            gateway = self.gateway.name(),
            streaming = self.gateway.supports_streaming(),
            "Turn started"
        );

        lease.begin_turn();
        lease.push(Message::user(request.message));
        lease.checkpoint();

        let mut iterations = 0;
        let result = self
            .drive(&mut lease, &conversation_id, max_iterations, sink, &mut iterations)
            .await;

        let mut outcome = TurnOutcome {
            status: TurnStatus::Error,
            response: None,
            error: None,
            iterations,
            conversation_id: conversation_id.clone(),
        };

        let terminal = match result {
            Ok(text) => {
                lease.end_turn(ConversationStatus::Completed);
                outcome.status = TurnStatus::Success;
                outcome.response = Some(text);
                Some(StreamEvent::Done {
                    status: TurnStatus::Success,
                    iterations,
                    conversation_id: conversation_id.clone(),
                })
            }
            Err(Abort::IterationLimit) => {
                warn!(conversation_id = %conversation_id, iterations, "Iteration limit reached");
                lease.end_turn(ConversationStatus::Failed);
                outcome.error = Some(format!(
                    "Reached the limit of {max_iterations} iterations without a final answer"
                ));
                Some(StreamEvent::Done {
                    status: TurnStatus::Error,
                    iterations,
                    conversation_id: conversation_id.clone(),
                })
            }
            Err(Abort::Gateway(e)) => {
                error!(conversation_id = %conversation_id, error = %e, "Turn failed");
                lease.end_turn(ConversationStatus::Failed);
                outcome.error = Some(e.to_string());
                Some(StreamEvent::Error {
                    error: e.to_string(),
                    message: FAILURE_MESSAGE.into(),
                })
            }
            Err(Abort::Ordering(e)) => {
                error!(conversation_id = %conversation_id, error = %e, "Event ordering violated");
                lease.end_turn(ConversationStatus::Failed);
                outcome.error = Some(e.to_string());
                Some(StreamEvent::Error {
                    error: e.to_string(),
                    message: FAILURE_MESSAGE.into(),
                })
            }
            Err(Abort::Cancelled) => {
                info!(conversation_id = %conversation_id, iterations, "Client disconnected, turn cancelled");
                lease.end_turn(ConversationStatus::Failed);
                outcome.error = Some("client disconnected".into());
                None
            }
        };

        if let Some(event) = terminal
            && !sink.encoder().is_terminated()
            && let Err(e) = sink.emit(event).await
        {
            debug!(conversation_id = %conversation_id, error = %e, "Terminal event not delivered");
        }

        info!(
            conversation_id = %conversation_id,
            status = ?outcome.status,
            iterations,
            "Turn finished"
        );
        outcome
    }

    async fn drive(
        &self,
        conv: &mut ConversationLease,
        conversation_id: &str,
        max_iterations: u32,
        sink: &mut EventSink,
        iterations: &mut u32,
    ) -> Result<String, Abort> {
        let descriptors = self.tools.descriptors();

        loop {
            let message = if *iterations == 0 {
                "正在理解您的需求...".to_string()
            } else {
                format!("正在处理... (第 {} 步)", *iterations + 1)
            };
            sink.emit(StreamEvent::Thinking {
                message,
                conversation_id: conversation_id.to_string(),
            })
            .await?;

            let request = self.build_request(conv, &descriptors);
            let reply = tokio::select! {
                biased;
                _ = sink.closed() => return Err(Abort::Cancelled),
                reply = self.call_gateway(request) => reply?,
            };

            *iterations += 1;
            conv.record_iteration();
            debug!(conversation_id, iteration = *iterations, "Model round trip complete");

            match reply {
                ModelStream::ToolCalls(calls) if !calls.is_empty() => {
                    self.run_tools(conv, calls, sink).await?;
                    conv.checkpoint();
                    if *iterations >= max_iterations {
                        return Err(Abort::IterationLimit);
                    }
                }
                // No tool calls and no text counts as an empty answer.
                ModelStream::ToolCalls(_) => {
                    let (_, empty) = mpsc::channel(1);
                    return self.stream_response(conv, empty, *iterations, sink).await;
                }
                ModelStream::Text(fragments) => {
                    return self.stream_response(conv, fragments, *iterations, sink).await;
                }
            }
        }
    }

    fn build_request(&self, conv: &ConversationLease, descriptors: &[ToolDescriptor]) -> ModelRequest {
        ModelRequest {
            system_prompt: Some(self.system_prompt.clone()),
            messages: conv.history_window(self.history_limit).to_vec(),
            tools: descriptors.to_vec(),
        }
    }

    /// One gateway round trip under the retry policy, each attempt bounded
    /// by the gateway timeout.
    async fn call_gateway(&self, request: ModelRequest) -> Result<ModelStream, GatewayError> {
        let timeout = self.gateway_timeout;
        self.retry
            .run(move |attempt| {
                let request = request.clone();
                async move {
                    debug!(gateway = self.gateway.name(), attempt, "Calling model gateway");
                    tokio::time::timeout(timeout, self.gateway.stream(request))
                        .await
                        .map_err(|_| GatewayError::Timeout {
                            timeout_secs: timeout.as_secs(),
                        })?
                }
            })
            .await
    }

    /// Announce, run and report one round of tool calls.
    ///
    /// Calls run concurrently (bounded by `max_parallel_tools`); results are
    /// reported in request order once all of them have finished. If the
    /// client goes away meanwhile, the spawned invocations still run to
    /// completion but their results are dropped.
    async fn run_tools(
        &self,
        conv: &mut ConversationLease,
        calls: Vec<ToolCallRequest>,
        sink: &mut EventSink,
    ) -> Result<(), Abort> {
        for call in &calls {
            sink.emit(StreamEvent::ToolCall {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                tool_args: call.arguments.clone(),
                message: format!("正在调用 {}...", call.name),
            })
            .await?;
        }

        let permits = Arc::new(Semaphore::new(self.max_parallel_tools));
        let handles: Vec<JoinHandle<ToolCallOutcome>> = calls
            .iter()
            .cloned()
            .map(|call| {
                let tools = Arc::clone(&self.tools);
                let permits = Arc::clone(&permits);
                tokio::spawn(async move {
                    let _permit = permits.acquire_owned().await.ok();
                    tools.execute(&call).await
                })
            })
            .collect();

        let joined = tokio::select! {
            biased;
            _ = sink.closed() => return Err(Abort::Cancelled),
            joined = join_all(handles) => joined,
        };

        let outcomes: Vec<ToolCallOutcome> = calls
            .iter()
            .zip(joined)
            .map(|(call, joined)| {
                joined.unwrap_or_else(|e| {
                    error!(tool = %call.name, error = %e, "Tool task panicked");
                    ToolCallOutcome {
                        call_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        outcome: ToolOutcome::Error {
                            kind: ToolErrorKind::ExecutionError,
                            detail: format!("tool task failed: {e}"),
                        },
                        duration_ms: 0,
                    }
                })
            })
            .collect();

        // Requests and results enter the history together.
        conv.push(Message::tool_request(calls));
        for outcome in &outcomes {
            conv.push(Message::tool_result(outcome.clone()));
        }

        for outcome in outcomes {
            let message = if outcome.outcome.is_success() {
                format!("{} 执行完成", outcome.tool_name)
            } else {
                format!("{} 执行失败", outcome.tool_name)
            };
            sink.emit(StreamEvent::ToolResult {
                call_id: outcome.call_id,
                result: outcome.outcome.to_payload(),
                tool_name: outcome.tool_name,
                message,
            })
            .await?;
        }

        Ok(())
    }

    /// Stream final text to the sink and record it.
    async fn stream_response(
        &self,
        conv: &mut ConversationLease,
        mut fragments: mpsc::Receiver<Result<String, GatewayError>>,
        iterations: u32,
        sink: &mut EventSink,
    ) -> Result<String, Abort> {
        sink.emit(StreamEvent::ResponseStart {
            message: "开始生成回复...".into(),
            iterations,
        })
        .await?;

        let mut full = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = sink.closed() => return Err(Abort::Cancelled),
                next = tokio::time::timeout(self.gateway_timeout, fragments.recv()) => next,
            };

            let fragment = match next {
                Ok(Some(Ok(fragment))) => fragment,
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(None) => break,
                Err(_) => {
                    return Err(GatewayError::Timeout {
                        timeout_secs: self.gateway_timeout.as_secs(),
                    }
                    .into());
                }
            };

            if fragment.is_empty() {
                continue;
            }
            full.push_str(&fragment);
            sink.emit(StreamEvent::ResponseChunk { content: fragment }).await?;
        }

        conv.push(Message::assistant(full.clone()));
        sink.emit(StreamEvent::ResponseEnd {
            message: "回复生成完成".into(),
            full_response: full.clone(),
        })
        .await?;

        Ok(full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStore;
    use crate::test_helpers::*;
    use anjia_core::model::ModelResponse;

    fn names(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(StreamEvent::event_type).collect()
    }

    async fn run(
        agent: &AgentLoop,
        store: &SessionStore,
        id: Option<&str>,
        message: &str,
        max_iterations: u32,
    ) -> (TurnOutcome, Vec<StreamEvent>) {
        let lease = store.get_or_create(id).await.unwrap();
        let (mut sink, rx) = EventSink::channel(EVENT_BUFFER);
        let outcome = agent
            .run_turn(
                lease,
                TurnRequest {
                    message: message.into(),
                    max_iterations,
                },
                &mut sink,
            )
            .await;
        drop(sink);
        (outcome, collect(rx).await)
    }

    #[tokio::test]
    async fn direct_answer() {
        let gateway = Arc::new(ScriptedGateway::new(vec![Ok(ModelResponse::FinalText(
            "30%".into(),
        ))]));
        let agent = AgentLoop::new(gateway.clone(), Arc::new(policy_registry()));
        let store = SessionStore::default();

        let (outcome, events) = run(&agent, &store, None, "北京首套房首付比例？", 15).await;

        assert_eq!(
            names(&events),
            ["thinking", "response_start", "response_chunk", "response_end", "done"]
        );
        assert_eq!(events[2], StreamEvent::ResponseChunk { content: "30%".into() });
        match &events[4] {
            StreamEvent::Done {
                status, iterations, ..
            } => {
                assert_eq!(*status, TurnStatus::Success);
                assert_eq!(*iterations, 1);
            }
            other => panic!("expected done, got {other:?}"),
        }
        assert_eq!(outcome.status, TurnStatus::Success);
        assert_eq!(outcome.response.as_deref(), Some("30%"));

        let conv = store.get(&outcome.conversation_id).await.unwrap();
        assert_eq!(conv.status, ConversationStatus::Completed);
        assert_eq!(conv.messages.len(), 2);
        assert_eq!(conv.iterations, 1);
    }

    #[tokio::test]
    async fn tool_call_then_answer() {
        let gateway = Arc::new(ScriptedGateway::new(vec![
            Ok(tool_calls(&[(
                "policy_lookup",
                serde_json::json!({"location": "朝阳", "buyer_type": "首套"}),
            )])),
            Ok(ModelResponse::FinalText("朝阳首套首付30%".into())),
        ]));
        let agent = AgentLoop::new(gateway.clone(), Arc::new(policy_registry()));
        let store = SessionStore::default();

        let (outcome, events) = run(&agent, &store, Some("conv_b"), "朝阳首套？", 15).await;

        assert_eq!(
            names(&events),
            [
                "thinking",
                "tool_call",
                "tool_result",
                "thinking",
                "response_start",
                "response_chunk",
                "response_end",
                "done"
            ]
        );
        let data = events[2].data();
        assert_eq!(data["tool_name"], "policy_lookup");
        assert_eq!(data["result"]["ratio"], "30%");
        assert_eq!(outcome.iterations, 2);

        // The second model call saw the tool result.
        let requests = gateway.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].messages.len(), 3);
        assert_eq!(requests[1].messages[2].role, anjia_core::Role::ToolResult);
        assert_eq!(
            requests[0].system_prompt.as_deref(),
            Some(DEFAULT_SYSTEM_PROMPT)
        );
        assert_eq!(requests[0].tools.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn tool_timeout_is_reported_and_loop_continues() {
        let gateway = Arc::new(ScriptedGateway::new(vec![
            Ok(tool_calls(&[("slow", serde_json::json!({}))])),
            Ok(ModelResponse::FinalText("抱歉，查询超时".into())),
        ]));
        let tools = slow_registry(Duration::from_secs(60)).with_timeout(Duration::from_secs(1));
        let agent = AgentLoop::new(gateway.clone(), Arc::new(tools));
        let store = SessionStore::default();

        let (outcome, events) = run(&agent, &store, None, "查一下", 15).await;

        assert_eq!(names(&events)[1..3], ["tool_call", "tool_result"]);
        let result = events[2].data()["result"].clone();
        assert_eq!(result["kind"], "timeout");
        assert!(result["error"].as_str().unwrap().contains("timed out"));
        assert_eq!(gateway.calls(), 2);
        assert_eq!(outcome.status, TurnStatus::Success);
    }

    #[tokio::test]
    async fn iteration_limit_stops_after_tool_round() {
        let gateway = Arc::new(ScriptedGateway::repeating(tool_calls(&[(
            "policy_lookup",
            serde_json::json!({"location": "朝阳", "buyer_type": "首套"}),
        )])));
        let agent = AgentLoop::new(gateway.clone(), Arc::new(policy_registry()));
        let store = SessionStore::default();

        let (outcome, events) = run(&agent, &store, Some("conv_d"), "循环", 1).await;

        assert_eq!(names(&events), ["thinking", "tool_call", "tool_result", "done"]);
        assert_eq!(
            events[3].data(),
            serde_json::json!({"status": "error", "iterations": 1, "conversation_id": "conv_d"})
        );
        assert_eq!(gateway.calls(), 1);
        assert_eq!(outcome.status, TurnStatus::Error);

        // Results of the last round are kept.
        let conv = store.get("conv_d").await.unwrap();
        assert_eq!(conv.status, ConversationStatus::Failed);
        assert_eq!(conv.messages.len(), 3);
    }

    #[tokio::test]
    async fn concurrent_turn_on_same_conversation_is_busy() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let gateway = Arc::new(GatedGateway::new(gate.clone(), "done"));
        let agent = Arc::new(AgentLoop::new(gateway, Arc::new(ToolRegistry::new())));
        let store = SessionStore::default();

        let lease = store.get_or_create(Some("conv_e")).await.unwrap();
        let (mut rx, handle) = agent.spawn_turn(
            lease,
            TurnRequest {
                message: "first".into(),
                max_iterations: 15,
            },
        );
        assert_eq!(rx.recv().await.unwrap().event_type(), "thinking");

        let second = store.get_or_create(Some("conv_e")).await;
        assert!(matches!(
            second,
            Err(anjia_core::SessionError::ConversationBusy(_))
        ));

        gate.notify_one();
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.status, TurnStatus::Success);
        assert!(store.get_or_create(Some("conv_e")).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_tool_is_fed_back_to_the_model() {
        let gateway = Arc::new(ScriptedGateway::new(vec![
            Ok(tool_calls(&[("teleport", serde_json::json!({}))])),
            Ok(ModelResponse::FinalText("好的".into())),
        ]));
        let agent = AgentLoop::new(gateway.clone(), Arc::new(policy_registry()));
        let store = SessionStore::default();

        let (outcome, events) = run(&agent, &store, None, "hi", 15).await;

        assert_eq!(events[2].data()["result"]["kind"], "unknown_tool");
        assert_eq!(outcome.status, TurnStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn tools_run_concurrently_and_report_in_order() {
        let gateway = Arc::new(ScriptedGateway::new(vec![
            Ok(tool_calls(&[
                ("slow", serde_json::json!({"ms": 300})),
                ("slow", serde_json::json!({"ms": 100})),
                ("slow", serde_json::json!({"ms": 200})),
            ])),
            Ok(ModelResponse::FinalText("ok".into())),
        ]));
        let agent = AgentLoop::new(gateway, Arc::new(slow_registry(Duration::from_millis(300))));
        let store = SessionStore::default();

        let started = tokio::time::Instant::now();
        let (_, events) = run(&agent, &store, None, "go", 15).await;
        assert!(started.elapsed() < Duration::from_millis(600));

        let results: Vec<_> = events
            .iter()
            .filter(|e| e.event_type() == "tool_result")
            .map(|e| e.data()["result"]["slept_ms"].clone())
            .collect();
        assert_eq!(results, [300, 100, 200]);
    }

    #[tokio::test(start_paused = true)]
    async fn parallelism_is_bounded() {
        let gateway = Arc::new(ScriptedGateway::new(vec![
            Ok(tool_calls(&[
                ("slow", serde_json::json!({"ms": 100})),
                ("slow", serde_json::json!({"ms": 100})),
            ])),
            Ok(ModelResponse::FinalText("ok".into())),
        ]));
        let agent = AgentLoop::new(gateway, Arc::new(slow_registry(Duration::from_millis(100))))
            .with_max_parallel_tools(1);
        let store = SessionStore::default();

        let started = tokio::time::Instant::now();
        run(&agent, &store, None, "go", 15).await;
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_gateway_errors_are_retried() {
        let gateway = Arc::new(ScriptedGateway::new(vec![
            Err(GatewayError::RateLimited {
                retry_after_secs: None,
            }),
            Err(GatewayError::Unavailable("503".into())),
            Ok(ModelResponse::FinalText("ok".into())),
        ]));
        let agent = AgentLoop::new(gateway.clone(), Arc::new(ToolRegistry::new()));
        let store = SessionStore::default();

        let (outcome, events) = run(&agent, &store, None, "hi", 15).await;

        assert_eq!(gateway.calls(), 3);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(names(&events).last(), Some(&"done"));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_end_with_single_error() {
        let gateway = Arc::new(ScriptedGateway::repeating_err(GatewayError::Unavailable(
            "503".into(),
        )));
        let agent = AgentLoop::new(gateway.clone(), Arc::new(ToolRegistry::new()));
        let store = SessionStore::default();

        let (outcome, events) = run(&agent, &store, Some("conv_x"), "hi", 15).await;

        assert_eq!(names(&events), ["thinking", "error"]);
        assert!(events[1].data()["error"].as_str().unwrap().contains("503"));
        assert_eq!(gateway.calls(), 3);
        assert_eq!(outcome.iterations, 0);
        assert_eq!(
            store.get("conv_x").await.unwrap().status,
            ConversationStatus::Failed
        );
    }

    #[tokio::test]
    async fn authentication_failure_is_not_retried() {
        let gateway = Arc::new(ScriptedGateway::repeating_err(GatewayError::Authentication(
            "bad key".into(),
        )));
        let agent = AgentLoop::new(gateway.clone(), Arc::new(ToolRegistry::new()));
        let store = SessionStore::default();

        let (outcome, _) = run(&agent, &store, None, "hi", 15).await;
        assert_eq!(gateway.calls(), 1);
        assert!(outcome.error.unwrap().contains("Authentication"));
    }

    #[tokio::test(start_paused = true)]
    async fn gateway_timeout_fails_the_turn() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let gateway = Arc::new(GatedGateway::new(gate, "never"));
        let agent = AgentLoop::new(gateway, Arc::new(ToolRegistry::new()))
            .with_gateway_timeout(Duration::from_secs(5))
            .with_retry(RetryPolicy::none());
        let store = SessionStore::default();

        let (_, events) = run(&agent, &store, None, "hi", 15).await;
        assert_eq!(names(&events), ["thinking", "error"]);
        assert!(events[1].data()["error"].as_str().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn streaming_gateway_yields_ordered_chunks() {
        let gateway = Arc::new(FragmentGateway::new(&["北京", "", "首套", "30%"]));
        let agent = AgentLoop::new(gateway, Arc::new(ToolRegistry::new()));
        let store = SessionStore::default();

        let (outcome, events) = run(&agent, &store, None, "hi", 15).await;

        let chunks: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ResponseChunk { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, ["北京", "首套", "30%"]);
        assert_eq!(events[events.len() - 2].data()["full_response"], "北京首套30%");
        assert_eq!(outcome.response.as_deref(), Some("北京首套30%"));
    }

    #[tokio::test]
    async fn mid_stream_failure_ends_with_error() {
        let gateway = Arc::new(FragmentGateway::failing_after(&["部分"]));
        let agent = AgentLoop::new(gateway, Arc::new(ToolRegistry::new()));
        let store = SessionStore::default();

        let (outcome, events) = run(&agent, &store, None, "hi", 15).await;
        assert_eq!(
            names(&events),
            ["thinking", "response_start", "response_chunk", "error"]
        );
        assert_eq!(outcome.status, TurnStatus::Error);
    }

    #[tokio::test]
    async fn empty_answer_completes_normally() {
        let gateway = Arc::new(ScriptedGateway::new(vec![Ok(
            ModelResponse::ToolCallsRequested(vec![]),
        )]));
        let agent = AgentLoop::new(gateway, Arc::new(ToolRegistry::new()));
        let store = SessionStore::default();

        let (outcome, events) = run(&agent, &store, None, "hi", 15).await;
        assert_eq!(
            names(&events),
            ["thinking", "response_start", "response_end", "done"]
        );
        assert_eq!(outcome.response.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn follow_up_turn_keeps_history_and_resets_turn_counter() {
        let gateway = Arc::new(ScriptedGateway::new(vec![
            Ok(tool_calls(&[(
                "policy_lookup",
                serde_json::json!({"location": "朝阳", "buyer_type": "首套"}),
            )])),
            Ok(ModelResponse::FinalText("30%".into())),
            Ok(ModelResponse::FinalText("月供约1.6万".into())),
        ]));
        let agent = AgentLoop::new(gateway.clone(), Arc::new(policy_registry()));
        let store = SessionStore::default();

        let (first, _) = run(&agent, &store, Some("conv_f"), "首付？", 15).await;
        let (second, _) = run(&agent, &store, Some("conv_f"), "月供？", 15).await;

        assert_eq!(first.iterations, 2);
        assert_eq!(second.iterations, 1);
        assert_eq!(gateway.requests()[2].messages.len(), 5);

        let conv = store.get("conv_f").await.unwrap();
        assert_eq!(conv.iterations, 3);
        assert_eq!(conv.status, ConversationStatus::Completed);
    }

    #[tokio::test]
    async fn history_limit_trims_what_the_model_sees() {
        let gateway = Arc::new(ScriptedGateway::repeating(ModelResponse::FinalText(
            "ok".into(),
        )));
        let agent = AgentLoop::new(gateway.clone(), Arc::new(ToolRegistry::new()))
            .with_history_limit(3);
        let store = SessionStore::default();

        for msg in ["a", "b", "c"] {
            run(&agent, &store, Some("conv_h"), msg, 15).await;
        }

        let last = gateway.requests().pop().unwrap();
        assert_eq!(last.messages.len(), 3);
        assert_eq!(last.messages[0].text(), "b");
        assert_eq!(store.get("conv_h").await.unwrap().messages.len(), 6);
    }

    #[tokio::test]
    async fn disconnect_cancels_at_next_suspension_point() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let gateway = Arc::new(GatedGateway::new(gate, "never"));
        let agent = Arc::new(AgentLoop::new(gateway.clone(), Arc::new(ToolRegistry::new())));
        let store = SessionStore::default();

        let lease = store.get_or_create(Some("conv_c")).await.unwrap();
        let (mut rx, handle) = agent.spawn_turn(
            lease,
            TurnRequest {
                message: "hi".into(),
                max_iterations: 15,
            },
        );
        assert_eq!(rx.recv().await.unwrap().event_type(), "thinking");
        drop(rx);

        let outcome = handle.await.unwrap();
        assert_eq!(outcome.status, TurnStatus::Error);
        assert_eq!(outcome.error.as_deref(), Some("client disconnected"));
        assert_eq!(
            store.get("conv_c").await.unwrap().status,
            ConversationStatus::Failed
        );
    }

    #[tokio::test]
    async fn dropped_turn_future_leaves_conversation_failed() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let gateway = Arc::new(GatedGateway::new(gate, "never"));
        let agent = AgentLoop::new(gateway, Arc::new(ToolRegistry::new()));
        let store = SessionStore::default();

        let lease = store.get_or_create(Some("conv_n")).await.unwrap();
        let mut sink = EventSink::detached();
        let turn = agent.run_turn(
            lease,
            TurnRequest {
                message: "hi".into(),
                max_iterations: 15,
            },
            &mut sink,
        );
        assert!(
            tokio::time::timeout(Duration::from_millis(50), turn)
                .await
                .is_err()
        );

        let conv = store.get("conv_n").await.unwrap();
        assert_eq!(conv.status, ConversationStatus::Failed);
        assert_eq!(conv.messages.len(), 1);
        assert!(store.get_or_create(Some("conv_n")).await.is_ok());
    }

    #[test]
    fn reports_whether_text_is_streamed() {
        let chunked = AgentLoop::new(
            Arc::new(FragmentGateway::new(&["a", "b"])),
            Arc::new(ToolRegistry::new()),
        );
        assert!(chunked.streams_text());
        assert_eq!(chunked.gateway_name(), "fragments");

        let whole = AgentLoop::new(
            Arc::new(ScriptedGateway::repeating(ModelResponse::FinalText("ok".into()))),
            Arc::new(ToolRegistry::new()),
        );
        assert!(!whole.streams_text());
    }

    #[tokio::test]
    async fn custom_system_prompt_is_sent() {
        let gateway = Arc::new(ScriptedGateway::new(vec![Ok(ModelResponse::FinalText(
            "ok".into(),
        ))]));
        let agent = AgentLoop::new(gateway.clone(), Arc::new(ToolRegistry::new()))
            .with_system_prompt("You are terse.");
        let store = SessionStore::default();

        run(&agent, &store, None, "hi", 15).await;
        assert_eq!(
            gateway.requests()[0].system_prompt.as_deref(),
            Some("You are terse.")
        );
    }
}
