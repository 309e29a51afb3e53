//! # Anjia Core
//!
//! Domain types, traits, and error definitions for the Anjia tool-calling
//! agent. It depends on no web or HTTP framework; it defines the domain
//! model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! The two external collaborators of the agent loop, model backends and
//! tools, are defined as traits here. Implementations live in their
//! respective crates, and tests swap in scripted stubs.

pub mod error;
pub mod message;
pub mod model;
pub mod schema;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{GatewayError, RetryClass, SessionError, ToolError, ToolErrorKind};
pub use message::{Conversation, ConversationId, ConversationStatus, Message, Role};
pub use model::{ModelGateway, ModelRequest, ModelResponse, ModelStream};
pub use schema::{ParamType, ParameterSpec};
pub use tool::{Tool, ToolCallOutcome, ToolCallRequest, ToolDescriptor, ToolOutcome, ToolRegistry};
