//! Event stream encoder and sink.
//!
//! The encoder is the single gate every turn event passes through. It
//! refuses events that would break the wire ordering:
//! a `tool_result` must answer the oldest outstanding `tool_call`;
//! `response_chunk`s only appear between `response_start` and
//! `response_end`; nothing follows `done` or `error`.
//!
//! `EventSink` couples an encoder with the channel the transport reads
//! from. A closed channel is how the loop learns its client went away.

use std::collections::VecDeque;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::stream_event::StreamEvent;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("event '{event}' emitted after the turn ended")]
    AfterTerminal { event: &'static str },

    #[error("event '{event}' out of order: {reason}")]
    OutOfOrder {
        event: &'static str,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Thinking / tool calls
    Working,
    /// Between response_start and response_end
    Responding,
    /// After response_end; only the terminal event may follow
    Responded,
    Terminated,
}

/// Ordering guard for one turn's event stream.
#[derive(Debug)]
pub struct EventEncoder {
    phase: Phase,
    /// Call ids of emitted tool calls still waiting for their result
    pending: VecDeque<String>,
    emitted: usize,
}

impl Default for EventEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEncoder {
    pub fn new() -> Self {
        Self {
            phase: Phase::Working,
            pending: VecDeque::new(),
            emitted: 0,
        }
    }

    /// Events accepted so far.
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    pub fn is_terminated(&self) -> bool {
        self.phase == Phase::Terminated
    }

    /// Check `event` against the stream so far and record it.
    pub fn accept(&mut self, event: &StreamEvent) -> Result<(), EncodeError> {
        let name = event.event_type();
        let out_of_order = |reason| EncodeError::OutOfOrder {
            event: name,
            reason,
        };

        if self.phase == Phase::Terminated {
            return Err(EncodeError::AfterTerminal { event: name });
        }

        match event {
            StreamEvent::Thinking { .. } | StreamEvent::ToolCall { .. } => {
                if self.phase != Phase::Working {
                    return Err(out_of_order("final response already started"));
                }
                if let StreamEvent::ToolCall { call_id, .. } = event {
                    self.pending.push_back(call_id.clone());
                } else if !self.pending.is_empty() {
                    return Err(out_of_order("tool results still outstanding"));
                }
            }
            StreamEvent::ToolResult { call_id, .. } => match self.pending.front() {
                Some(expected) if expected == call_id => {
                    self.pending.pop_front();
                }
                Some(_) => return Err(out_of_order("result does not match the oldest tool call")),
                None => return Err(out_of_order("no matching tool call")),
            },
            StreamEvent::ResponseStart { .. } => {
                if self.phase != Phase::Working {
                    return Err(out_of_order("response already started"));
                }
                if !self.pending.is_empty() {
                    return Err(out_of_order("tool results still outstanding"));
                }
                self.phase = Phase::Responding;
            }
            StreamEvent::ResponseChunk { .. } => {
                if self.phase != Phase::Responding {
                    return Err(out_of_order("chunk outside response"));
                }
            }
            StreamEvent::ResponseEnd { .. } => {
                if self.phase != Phase::Responding {
                    return Err(out_of_order("no response in progress"));
                }
                self.phase = Phase::Responded;
            }
            StreamEvent::Done { .. } => {
                if self.phase == Phase::Responding {
                    return Err(out_of_order("response not finished"));
                }
                if !self.pending.is_empty() {
                    return Err(out_of_order("tool results still outstanding"));
                }
                self.phase = Phase::Terminated;
            }
            // A failure may cut a turn short anywhere.
            StreamEvent::Error { .. } => self.phase = Phase::Terminated,
        }

        self.emitted += 1;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("event stream consumer disconnected")]
    Closed,

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Where a turn's events go.
pub struct EventSink {
    tx: Option<mpsc::Sender<StreamEvent>>,
    encoder: EventEncoder,
}

impl EventSink {
    /// A sink feeding a bounded channel, and the receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            tx: Some(tx),
            encoder: EventEncoder::new(),
        }
    }

    /// A sink with no consumer, for non-streaming callers. Events are still
    /// checked for ordering.
    pub fn detached() -> Self {
        Self {
            tx: None,
            encoder: EventEncoder::new(),
        }
    }

    /// Validate and deliver one event.
    pub async fn emit(&mut self, event: StreamEvent) -> Result<(), SinkError> {
        self.encoder.accept(&event)?;
        match &self.tx {
            Some(tx) => tx.send(event).await.map_err(|_| SinkError::Closed),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.is_closed())
    }

    /// Resolves once the consumer is gone. Never resolves for a detached sink.
    pub async fn closed(&self) {
        match &self.tx {
            Some(tx) => tx.closed().await,
            None => std::future::pending().await,
        }
    }

    pub fn encoder(&self) -> &EventEncoder {
        &self.encoder
    }
}
