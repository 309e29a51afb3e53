//! The Anjia agent loop.
//!
//! A turn follows a **think, act, observe** cycle:
//!
//! 1. **Receive** a user message for a conversation
//! 2. **Ask the model** with the system prompt, recent history and tool schemas
//! 3. **If tool calls**: run them concurrently, append the results, loop back to step 2
//! 4. **If text**: stream it to the client and finish the turn
//!
//! The loop ends when the model answers with text, the per-turn iteration
//! limit is reached, the model backend fails for good, or the client
//! disconnects. Progress is reported as [`StreamEvent`]s through an
//! [`EventSink`], whose encoder guarantees the wire ordering.

pub mod encoder;
pub mod loop_runner;
pub mod prompt;
pub mod retry;
pub mod session;
pub mod stream_event;

#[cfg(test)]
mod test_helpers;

pub use encoder::{EncodeError, EventEncoder, EventSink, SinkError};
pub use loop_runner::{AgentLoop, EVENT_BUFFER, TurnOutcome, TurnRequest};
pub use prompt::DEFAULT_SYSTEM_PROMPT;
pub use retry::RetryPolicy;
pub use session::{ConversationLease, SessionStore, SessionSummary};
pub use stream_event::{StreamEvent, TurnStatus};
