//! Turn streaming events and their wire encoding.
//!
//! `StreamEvent` is what the agent loop reports while a turn progresses.
//! Each event serializes to the wire shape `{"event": <name>, "data": {...}}`
//! that the gateway forwards to clients over SSE.
//!
//! Wire names:
//! - `thinking`:       a model call is about to be made
//! - `tool_call`:      the model requested a tool
//! - `tool_result`:    a requested tool finished (or failed)
//! - `response_start`: final text is about to stream
//! - `response_chunk`: one fragment of final text
//! - `response_end`:   final text complete
//! - `done`:           the turn is over
//! - `error`:          the turn failed

use serde::{Deserialize, Serialize};

/// Terminal status reported in `done` events and JSON responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    Thinking {
        message: String,
        conversation_id: String,
    },

    ToolCall {
        /// Pairs the call with its result; not sent to clients.
        #[serde(skip)]
        call_id: String,
        tool_name: String,
        tool_args: serde_json::Value,
        message: String,
    },

    ToolResult {
        #[serde(skip)]
        call_id: String,
        tool_name: String,
        result: serde_json::Value,
        message: String,
    },

    ResponseStart { message: String, iterations: u32 },

    ResponseChunk { content: String },

    ResponseEnd {
        message: String,
        full_response: String,
    },

    Done {
        status: TurnStatus,
        iterations: u32,
        conversation_id: String,
    },

    Error { error: String, message: String },
}

impl StreamEvent {
    /// SSE event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Thinking { .. } => "thinking",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::ResponseStart { .. } => "response_start",
            Self::ResponseChunk { .. } => "response_chunk",
            Self::ResponseEnd { .. } => "response_end",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    /// The `data` payload alone.
    pub fn data(&self) -> serde_json::Value {
        serde_json::to_value(self)
            .ok()
            .and_then(|mut v| v.get_mut("data").map(serde_json::Value::take))
            .unwrap_or(serde_json::Value::Null)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape_is_event_and_data() {
        let event = StreamEvent::Thinking {
            message: "正在分析您的问题...".into(),
            conversation_id: "conv_1234abcd".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "thinking");
        assert_eq!(json["data"]["conversation_id"], "conv_1234abcd");
    }

    #[test]
    fn done_status_is_lowercase() {
        let event = StreamEvent::Done {
            status: TurnStatus::Success,
            iterations: 1,
            conversation_id: "conv_1".into(),
        };
        assert_eq!(
            event.data(),
            serde_json::json!({"status": "success", "iterations": 1, "conversation_id": "conv_1"})
        );
        assert!(event.is_terminal());
    }

    #[test]
    fn tool_events_carry_payloads() {
        let call = StreamEvent::ToolCall {
            call_id: "call_1".into(),
            tool_name: "policy_lookup".into(),
            tool_args: serde_json::json!({"location": "朝阳"}),
            message: "调用工具: policy_lookup".into(),
        };
        assert_eq!(call.event_type(), "tool_call");
        assert_eq!(call.data()["tool_args"]["location"], "朝阳");
        assert!(call.data().get("call_id").is_none());

        let result = StreamEvent::ToolResult {
            call_id: "call_1".into(),
            tool_name: "policy_lookup".into(),
            result: serde_json::json!({"error": "timed out", "kind": "timeout"}),
            message: "工具执行失败: policy_lookup".into(),
        };
        assert_eq!(result.data()["result"]["kind"], "timeout");
        assert!(!result.is_terminal());
    }

    #[test]
    fn event_type_matches_serialized_tag() {
        let events = [
            StreamEvent::ResponseStart {
                message: String::new(),
                iterations: 1,
            },
            StreamEvent::ResponseChunk {
                content: "30%".into(),
            },
            StreamEvent::ResponseEnd {
                message: String::new(),
                full_response: "30%".into(),
            },
            StreamEvent::Error {
                error: "boom".into(),
                message: String::new(),
            },
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["event"], event.event_type());
        }
    }
}
