//! OpenAI-compatible adapter surface.
//!
//! The HTTP server around the orchestrator is a thin layer; everything it
//! needs beyond transport lives here as pure functions:
//!
//! - [`resolve_model`] interprets the model string of an incoming request:
//!   `massgen/path:<yaml_path>` selects a config file, `massgen/model:<model>`
//!   overrides the agent model, anything else is a plain model override.
//! - [`accumulate_stream`] folds an orchestrator chunk stream into one
//!   `chat.completion` object for `stream=false` requests.
//! - [`completion_chunk`] + [`sse_frame`] turn individual chunks into
//!   `chat.completion.chunk` SSE events for `stream=true`, terminated by
//!   [`SSE_DONE`].
//! - [`collision_error`] builds the 400 payload for client tool definitions
//!   that collide with the reserved workflow tool names.
//!
//! Workflow tool calls never leave through this surface: they are
//! coordination traffic, not completions the client should see.

use crate::backend::ChunkStream;
use crate::types::{StreamChunk, ToolCall};
use crate::workflow;
use chrono::Utc;
use futures::StreamExt;
use serde_json::{json, Value};

/// Model-string prefix selecting a config file.
const PATH_PREFIX: &str = "massgen/path:";
/// Model-string prefix overriding the agent model.
const MODEL_PREFIX: &str = "massgen/model:";

/// SSE terminator for streamed responses.
pub const SSE_DONE: &str = "data: [DONE]\n\n";

/// Outcome of interpreting an incoming request's model string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub raw_model: String,
    pub config_path: Option<String>,
    pub override_model: Option<String>,
}

/// Minimal model routing over the request's model string.
///
/// - `massgen/path:<path>` → load that config.
/// - `massgen/model:<model>` → default config with the model overridden.
/// - anything else → the default config if one is set (overriding the model
///   unless a default model is pinned), otherwise a single-agent override.
pub fn resolve_model(
    raw_model: &str,
    default_config: Option<&str>,
    default_model: Option<&str>,
) -> ResolvedModel {
    if let Some(path) = raw_model.strip_prefix(PATH_PREFIX) {
        let path = path.trim();
        return ResolvedModel {
            raw_model: raw_model.to_string(),
            config_path: (!path.is_empty()).then(|| path.to_string()),
            override_model: None,
        };
    }
    if let Some(model) = raw_model.strip_prefix(MODEL_PREFIX) {
        let model = model.trim();
        return ResolvedModel {
            raw_model: raw_model.to_string(),
            config_path: default_config.map(String::from),
            override_model: (!model.is_empty()).then(|| model.to_string()),
        };
    }

    if let Some(config) = default_config {
        let override_model = if default_model.is_some() {
            None
        } else {
            Some(raw_model.to_string())
        };
        return ResolvedModel {
            raw_model: raw_model.to_string(),
            config_path: Some(config.to_string()),
            override_model,
        };
    }

    ResolvedModel {
        raw_model: raw_model.to_string(),
        config_path: None,
        override_model: (!raw_model.is_empty()).then(|| raw_model.to_string()),
    }
}

/// The 400 payload for client tools shadowing workflow tool names, or `None`
/// when the request is clean.
pub fn collision_error<'a>(tool_names: impl IntoIterator<Item = &'a str>) -> Option<Value> {
    let collisions = workflow::collisions(tool_names);
    if collisions.is_empty() {
        return None;
    }
    Some(json!({
        "error": "tool names collide with reserved workflow tools",
        "collisions": collisions,
    }))
}

/// Normalise a tool call to the OpenAI chat.completions shape:
/// `{"id","type":"function","function":{"name","arguments":<string>}}`.
fn normalize_tool_call(call: &ToolCall, idx: usize) -> Value {
    let id = if call.id.is_empty() {
        format!("call_{}", idx)
    } else {
        call.id.clone()
    };
    json!({
        "id": id,
        "type": "function",
        "function": {
            "name": call.name,
            "arguments": call.arguments,
        }
    })
}

/// Drop workflow tool calls (coordination traffic) and normalise the rest.
pub fn filter_external_tool_calls(calls: &[ToolCall]) -> Vec<Value> {
    calls
        .iter()
        .enumerate()
        .filter(|(_, call)| !workflow::is_workflow_tool(&call.name))
        .map(|(idx, call)| normalize_tool_call(call, idx))
        .collect()
}

/// Build a complete (non-streamed) `chat.completion` object.
pub fn build_chat_completion(
    content: &str,
    tool_calls: &[Value],
    model: &str,
    finish_reason: &str,
) -> Value {
    let mut message = json!({
        "role": "assistant",
        "content": content,
    });
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls.to_vec());
    }

    json!({
        "id": format!("chatcmpl_{}", uuid::Uuid::new_v4().simple()),
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
    })
}

/// Fold an orchestrator stream into one `chat.completion` object, returning
/// it with the finish reason. In OpenAI semantics a tool call ends the turn,
/// so accumulation stops at the first external tool-call batch.
pub async fn accumulate_stream(mut stream: ChunkStream, model: &str) -> (Value, String) {
    let mut content = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    let mut finish_reason = "stop".to_string();

    while let Some(chunk) = stream.next().await {
        match chunk {
            StreamChunk::Content { content: fragment } => content.push_str(&fragment),
            StreamChunk::ToolCalls { tool_calls: calls } => {
                tool_calls = filter_external_tool_calls(&calls);
                if !tool_calls.is_empty() {
                    finish_reason = "tool_calls".to_string();
                    break;
                }
            }
            StreamChunk::Error { message, .. } => {
                content.push_str(&message);
                break;
            }
            StreamChunk::Done => break,
            // Reasoning, status and compression chunks are not part of the
            // OpenAI surface.
            _ => {}
        }
    }

    let response = build_chat_completion(&content, &tool_calls, model, &finish_reason);
    (response, finish_reason)
}

/// Map one chunk to a `chat.completion.chunk` object for SSE streaming, or
/// `None` for chunks with no OpenAI representation.
pub fn completion_chunk(
    chunk: &StreamChunk,
    model: &str,
    response_id: &str,
    created: i64,
) -> Option<Value> {
    let (delta, finish_reason) = match chunk {
        StreamChunk::Content { content } => (json!({"content": content}), Value::Null),
        StreamChunk::ToolCalls { tool_calls } => {
            let external = filter_external_tool_calls(tool_calls);
            if external.is_empty() {
                return None;
            }
            let deltas: Vec<Value> = external
                .iter()
                .enumerate()
                .map(|(idx, call)| {
                    let mut call = call.clone();
                    call["index"] = json!(idx);
                    call
                })
                .collect();
            (json!({"tool_calls": deltas}), json!("tool_calls"))
        }
        StreamChunk::Error { message, .. } => (json!({"content": message}), Value::Null),
        StreamChunk::Done => (json!({}), json!("stop")),
        _ => return None,
    };

    Some(json!({
        "id": response_id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    }))
}

/// Frame one JSON object as an SSE `data:` line.
pub fn sse_frame(value: &Value) -> String {
    format!("data: {}\n\n", value)
}
