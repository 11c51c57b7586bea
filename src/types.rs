//! Core type definitions for the coordination runtime.
//!
//! This module contains the data structures exchanged between backends, agent
//! runtimes and the orchestrator. The type system is organized into three
//! main categories:
//!
//! # Stream Events
//!
//! Every backend produces one uniform event stream:
//!
//! - [`StreamChunk`]: the tagged union of all stream events. Chunks are
//!   ordered per-stream; across streams ordering is only anchored at stream
//!   start and at the [`StreamChunk::Done`] sentinel.
//! - [`CompressionState`]: progress states of the reactive compression
//!   sub-protocol, carried by [`StreamChunk::CompressionStatus`].
//!
//! # Conversation
//!
//! - [`Message`]: one conversation entry with role and content. The first
//!   system message is the agent's prompt; the last message is the user turn
//!   the agent is currently answering.
//! - [`MessageRole`]: who sent the message (System, User, Assistant, Tool)
//! - [`ToolCall`]: a single tool invocation. Arguments are always carried as
//!   a serialized string across component boundaries, even when structurally
//!   a map, so every backend shares one wire shape.
//!
//! # Agent State
//!
//! - [`AgentStatus`]: the orchestrator-owned lifecycle of one agent.
//!
//! # Wire shape
//!
//! [`StreamChunk`] serializes as a record with a `type` field equal to the
//! variant name in `snake_case`; fields not applicable to the variant are
//! omitted. Serialize → parse → serialize yields the same byte sequence.
//!
//! # Example
//!
//! ```
//! use massgen::{Message, StreamChunk};
//!
//! let msg = Message::user("What's the capital of France?");
//! let chunk = StreamChunk::content("Paris");
//!
//! let wire = serde_json::to_string(&chunk).unwrap();
//! assert_eq!(wire, r#"{"type":"content","content":"Paris"}"#);
//! ```

use serde::{Deserialize, Serialize};

// ============================================================================
// STREAM EVENTS
// ============================================================================

/// Progress states of the reactive compression sub-protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionState {
    /// The outgoing history exceeded the trigger threshold.
    OverflowDetected,
    /// Compression is in progress.
    Compressing,
    /// Compression finished; `kept` and `ratio` are populated.
    Compressed,
    /// Compression could not bring the history under the target.
    Failed,
}

/// The single event type exchanged between every backend and the orchestrator.
///
/// A backend stream is *finite* and terminates with exactly one [`Done`]
/// chunk, even on error (an [`Error`] chunk precedes [`Done`]).
/// [`ToolCalls`] chunks are terminal for the model turn: after emitting one,
/// the backend emits [`Done`] without further content. The caller executes
/// the tools and resumes with a new `stream()` call whose message list
/// includes the tool results.
///
/// [`Done`]: StreamChunk::Done
/// [`Error`]: StreamChunk::Error
/// [`ToolCalls`]: StreamChunk::ToolCalls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    /// Visible assistant output. Fragments are incremental; concatenating all
    /// `content` of one turn yields the full assistant text.
    Content { content: String },

    /// The model's internal thinking, if the provider exposes it.
    Reasoning { reasoning: String },

    /// Batched tool invocations ending a turn.
    ToolCalls { tool_calls: Vec<ToolCall> },

    /// Result to be fed back to the model.
    ToolResult {
        tool_call_id: String,
        content: String,
    },

    /// Observational compression progress. Does not change the transcript the
    /// orchestrator observes, only the internal history the backend passes to
    /// the provider.
    CompressionStatus {
        status: CompressionState,
        #[serde(skip_serializing_if = "Option::is_none")]
        kept: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        ratio: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },

    /// Informational, not part of the transcript.
    Status { code: String },

    /// The turn failed. `retryable` tells the caller whether re-running the
    /// turn can succeed (transient provider failure, cancellation for
    /// restart) or not (unrecoverable overflow).
    Error { message: String, retryable: bool },

    /// Stream terminates.
    Done,
}

impl StreamChunk {
    /// Visible assistant output fragment.
    pub fn content(text: impl Into<String>) -> Self {
        StreamChunk::Content {
            content: text.into(),
        }
    }

    /// Reasoning fragment.
    pub fn reasoning(text: impl Into<String>) -> Self {
        StreamChunk::Reasoning {
            reasoning: text.into(),
        }
    }

    /// Tool-call batch ending the turn.
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        StreamChunk::ToolCalls { tool_calls: calls }
    }

    /// Tool result fed back to the model.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        StreamChunk::ToolResult {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
        }
    }

    /// Informational status chunk.
    pub fn status(code: impl Into<String>) -> Self {
        StreamChunk::Status { code: code.into() }
    }

    /// Turn failure.
    pub fn error(message: impl Into<String>, retryable: bool) -> Self {
        StreamChunk::Error {
            message: message.into(),
            retryable,
        }
    }

    /// Compression progress without payload fields.
    pub fn compression(status: CompressionState) -> Self {
        StreamChunk::CompressionStatus {
            status,
            kept: None,
            ratio: None,
            note: None,
        }
    }

    /// Whether this chunk carries model output the display should render.
    pub fn is_output(&self) -> bool {
        matches!(
            self,
            StreamChunk::Content { .. } | StreamChunk::Reasoning { .. }
        )
    }
}

// ============================================================================
// CONVERSATION
// ============================================================================

/// Who sent a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One tool invocation requested by the model.
///
/// `arguments` is always a serialized JSON string across component
/// boundaries, even when structurally a map, to give every backend one wire
/// shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Parse the argument string as JSON, mapping empty arguments to `{}`.
    pub fn parsed_arguments(&self) -> crate::Result<serde_json::Value> {
        if self.arguments.trim().is_empty() {
            return Ok(serde_json::json!({}));
        }
        serde_json::from_str(&self.arguments)
            .map_err(|e| crate::Error::stream(format!("Failed to parse tool arguments: {}", e)))
    }
}

/// One conversation entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// System prompt message.
    pub fn system(content: impl Into<String>) -> Self {
        Message::new(MessageRole::System, content)
    }

    /// User turn.
    pub fn user(content: impl Into<String>) -> Self {
        Message::new(MessageRole::User, content)
    }

    /// Plain assistant text.
    pub fn assistant(content: impl Into<String>) -> Self {
        Message::new(MessageRole::Assistant, content)
    }

    /// Assistant turn that requested tool calls.
    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    /// Tool result message answering `tool_call_id`.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

// ============================================================================
// AGENT STATE
// ============================================================================

/// Orchestrator-owned lifecycle of one agent.
///
/// Once an agent reaches [`Completed`], no further chunks from it are routed
/// except [`StreamChunk::Done`].
///
/// [`Completed`]: AgentStatus::Completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Waiting,
    Working,
    Answered,
    Voting,
    Completed,
    Error,
    Canceled,
}

impl AgentStatus {
    /// Whether the agent can produce no further output.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentStatus::Completed | AgentStatus::Error | AgentStatus::Canceled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(chunk: &StreamChunk) {
        let first = serde_json::to_string(chunk).unwrap();
        let parsed: StreamChunk = serde_json::from_str(&first).unwrap();
        let second = serde_json::to_string(&parsed).unwrap();
        assert_eq!(first, second);
        assert_eq!(&parsed, chunk);
    }

    #[test]
    fn test_chunk_round_trip_all_variants() {
        round_trip(&StreamChunk::content("Hello"));
        round_trip(&StreamChunk::reasoning("thinking..."));
        round_trip(&StreamChunk::tool_calls(vec![ToolCall::new(
            "call_1",
            "search",
            r#"{"q":"rust"}"#,
        )]));
        round_trip(&StreamChunk::tool_result("call_1", "42"));
        round_trip(&StreamChunk::CompressionStatus {
            status: CompressionState::Compressed,
            kept: Some(2),
            ratio: Some(0.18),
            note: None,
        });
        round_trip(&StreamChunk::status("restarting"));
        round_trip(&StreamChunk::error("boom", true));
        round_trip(&StreamChunk::Done);
    }

    #[test]
    fn test_chunk_wire_tag() {
        let wire = serde_json::to_string(&StreamChunk::Done).unwrap();
        assert_eq!(wire, r#"{"type":"done"}"#);

        let wire = serde_json::to_string(&StreamChunk::content("hi")).unwrap();
        assert_eq!(wire, r#"{"type":"content","content":"hi"}"#);
    }

    #[test]
    fn test_compression_chunk_omits_absent_fields() {
        let wire =
            serde_json::to_string(&StreamChunk::compression(CompressionState::Compressing))
                .unwrap();
        assert_eq!(
            wire,
            r#"{"type":"compression_status","status":"compressing"}"#
        );
    }

    #[test]
    fn test_message_constructors() {
        let msg = Message::system("You are a helpful assistant");
        assert_eq!(msg.role, MessageRole::System);
        assert!(msg.tool_calls.is_none());

        let msg = Message::tool_result("call_9", "ok");
        assert_eq!(msg.role, MessageRole::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_9"));
    }

    #[test]
    fn test_message_omits_absent_fields() {
        let wire = serde_json::to_string(&Message::user("hi")).unwrap();
        assert_eq!(wire, r#"{"role":"user","content":"hi"}"#);
    }

    #[test]
    fn test_tool_call_parsed_arguments() {
        let call = ToolCall::new("c1", "vote", r#"{"agent_id":"b"}"#);
        assert_eq!(call.parsed_arguments().unwrap()["agent_id"], "b");

        let empty = ToolCall::new("c2", "noop", "");
        assert_eq!(empty.parsed_arguments().unwrap(), serde_json::json!({}));

        let bad = ToolCall::new("c3", "noop", "{broken");
        assert!(bad.parsed_arguments().is_err());
    }

    #[test]
    fn test_agent_status_terminal() {
        assert!(AgentStatus::Completed.is_terminal());
        assert!(AgentStatus::Error.is_terminal());
        assert!(AgentStatus::Canceled.is_terminal());
        assert!(!AgentStatus::Working.is_terminal());
        assert!(!AgentStatus::Voting.is_terminal());
    }
}
