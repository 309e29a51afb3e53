//! OpenAI-compatible model gateway.
//!
//! Works with: OpenAI, DashScope (Qwen), OpenRouter, Ollama, vLLM, and any
//! endpoint exposing `/chat/completions` with function calling.
//!
//! Requests are non-streaming: final text is delivered as a single
//! fragment through the default `ModelGateway::stream`.

use async_trait::async_trait;
use anjia_config::ModelConfig;
use anjia_core::error::GatewayError;
use anjia_core::message::{Message, Role};
use anjia_core::model::{ModelGateway, ModelRequest, ModelResponse};
use anjia_core::tool::{ToolCallRequest, ToolDescriptor};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// An OpenAI-compatible model gateway.
pub struct OpenAiCompatGateway {
    name: String,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    client: reqwest::Client,
}

impl OpenAiCompatGateway {
    /// Create a new OpenAI-compatible gateway.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
            client: build_client(Duration::from_secs(120)),
        }
    }

    /// Build from the `[model]` config section.
    pub fn from_config(config: &ModelConfig, timeout: Duration) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            client: build_client(timeout),
            ..Self::new(
                "openai-compat",
                config.api_url.as_str(),
                config.api_key.clone().unwrap_or_default(),
                config.model.as_str(),
            )
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Convert the system prompt and our messages to OpenAI API format.
    fn to_api_messages(system_prompt: Option<&str>, messages: &[Message]) -> Vec<ApiMessage> {
        let system = system_prompt.map(|prompt| ApiMessage {
            role: "system".into(),
            content: Some(prompt.to_string()),
            tool_calls: None,
            tool_call_id: None,
        });

        let history = messages.iter().map(|m| match m.role {
            Role::User => ApiMessage {
                role: "user".into(),
                content: Some(m.text().to_string()),
                tool_calls: None,
                tool_call_id: None,
            },
            Role::Assistant => ApiMessage {
                role: "assistant".into(),
                content: m.content.clone(),
                tool_calls: (!m.tool_calls.is_empty()).then(|| {
                    m.tool_calls
                        .iter()
                        .map(|tc| ApiToolCall {
                            id: tc.id.clone(),
                            r#type: "function".into(),
                            function: ApiFunction {
                                name: tc.name.clone(),
                                arguments: tc.arguments.to_string(),
                            },
                        })
                        .collect()
                }),
                tool_call_id: None,
            },
            Role::ToolResult => {
                let outcome = m.tool_outcome.as_ref();
                ApiMessage {
                    role: "tool".into(),
                    content: Some(
                        outcome
                            .map(|o| o.outcome.to_payload().to_string())
                            .unwrap_or_default(),
                    ),
                    tool_calls: None,
                    tool_call_id: outcome.map(|o| o.call_id.clone()),
                }
            }
        });

        system.into_iter().chain(history).collect()
    }

    /// Convert tool descriptors to OpenAI API format.
    fn to_api_tools(tools: &[ToolDescriptor]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.json_schema(),
                },
            })
            .collect()
    }

    /// Interpret a decoded completion.
    fn parse_response(response: ApiResponse) -> Result<ModelResponse, GatewayError> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::Protocol("No choices in response".into()))?;

        let calls = choice.message.tool_calls.unwrap_or_default();
        if calls.is_empty() {
            return Ok(ModelResponse::FinalText(
                choice.message.content.unwrap_or_default(),
            ));
        }

        let requests = calls
            .into_iter()
            .map(|tc| ToolCallRequest {
                id: tc.id,
                name: tc.function.name,
                arguments: parse_arguments(&tc.function.arguments),
            })
            .collect();
        Ok(ModelResponse::ToolCallsRequested(requests))
    }
}

fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            warn!(error = %e, "Falling back to default HTTP client");
            reqwest::Client::new()
        })
}

/// Arguments arrive as a JSON-encoded string. Undecodable text is passed on
/// as a string so argument validation reports it back to the model.
fn parse_arguments(raw: &str) -> serde_json::Value {
    if raw.trim().is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

/// Map a non-success HTTP status to a gateway error.
fn classify_status(status: u16, retry_after_secs: Option<u64>, body: String) -> GatewayError {
    match status {
        429 => GatewayError::RateLimited { retry_after_secs },
        401 | 403 => GatewayError::Authentication(
            "Invalid API key or insufficient permissions".into(),
        ),
        408 | 500..=599 => GatewayError::Unavailable(format!("HTTP {status}: {body}")),
        _ => GatewayError::Protocol(format!("HTTP {status}: {body}")),
    }
}

#[async_trait]
impl ModelGateway for OpenAiCompatGateway {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, GatewayError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": Self::to_api_messages(request.system_prompt.as_deref(), &request.messages),
            "temperature": self.temperature,
            "stream": false,
        });

        if let Some(max_tokens) = self.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }

        debug!(gateway = %self.name, model = %self.model, messages = request.messages.len(), "Sending completion request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        let status = response.status().as_u16();

        if status != 200 {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok());
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Model backend returned error");
            return Err(classify_status(status, retry_after, error_body));
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Protocol(format!("Failed to parse response: {e}")))?;

        Self::parse_response(api_response)
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}
