//! Model gateway trait, the abstraction over LLM backends.
//!
//! A gateway takes the conversation history plus the descriptors of the
//! available tools and answers with either final text or a complete list of
//! requested tool invocations. Tool requests are never delivered partially.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::GatewayError;
use crate::message::Message;
use crate::tool::{ToolCallRequest, ToolDescriptor};

/// Everything the model sees on one round trip.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    /// Instructions prepended to the history
    pub system_prompt: Option<String>,

    /// The conversation history, oldest first
    pub messages: Vec<Message>,

    /// Tools the model may request
    pub tools: Vec<ToolDescriptor>,
}

/// A complete (non-streaming) answer from the model.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelResponse {
    FinalText(String),
    ToolCallsRequested(Vec<ToolCallRequest>),
}

/// An incrementally delivered answer.
///
/// Text arrives as ordered fragments; the channel closing is the end
/// marker. An `Err` item aborts the response.
#[derive(Debug)]
pub enum ModelStream {
    Text(mpsc::Receiver<Result<String, GatewayError>>),
    ToolCalls(Vec<ToolCallRequest>),
}

/// The core gateway trait.
///
/// The agent loop calls `complete()` or `stream()` without knowing which
/// backend is behind it.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// A human-readable name for this gateway (e.g., "openai-compat").
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, GatewayError>;

    /// Whether `stream()` delivers text in more than one fragment.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Send a request and get the answer incrementally.
    ///
    /// Default implementation calls `complete()` and wraps final text as a
    /// single fragment.
    async fn stream(&self, request: ModelRequest) -> Result<ModelStream, GatewayError> {
        match self.complete(request).await? {
            ModelResponse::ToolCallsRequested(calls) => Ok(ModelStream::ToolCalls(calls)),
            ModelResponse::FinalText(text) => {
                let (tx, rx) = mpsc::channel(1);
                let _ = tx.send(Ok(text)).await;
                Ok(ModelStream::Text(rx))
            }
        }
    }
}
