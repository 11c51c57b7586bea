//! OpenAI-compatible chat-completions backend.
//!
//! A concrete [`Backend`] for servers speaking the OpenAI chat completions
//! API (OpenAI itself, OpenRouter, LM Studio, Ollama, vLLM, ...). The
//! adapter owns the full backend contract:
//!
//! - request building, with [`GenerationParams`] mapped to the native shape
//!   and unsupported options dropped silently,
//! - SSE parsing and tool-call delta aggregation (tool calls arrive as
//!   fragments across many chunks and are only flushed on `finish_reason`),
//! - transient-failure retry with bounded exponential backoff,
//! - proactive and reactive context compression with `compression_status`
//!   progress chunks,
//! - the streaming buffer used for overflow recovery, including
//!   `reasoning_content` deltas from providers that expose thinking.
//!
//! Errors never escape as stream panics: every failure ends the chunk
//! sequence with an `error` chunk followed by `done`.

use crate::backend::{Backend, ChunkStream, StreamRequest, StreamingBuffer};
use crate::compression::{compress, needs_compression, CompressionConfig};
use crate::hooks::HookManager;
use crate::retry::{retry_transient, RetryConfig};
use crate::types::{CompressionState, Message, MessageRole, StreamChunk, ToolCall};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Connection and behavior settings for one chat-completions endpoint.
#[derive(Debug, Clone)]
pub struct ChatCompletionsConfig {
    pub model: String,
    /// OpenAI-compatible endpoint, e.g. `http://localhost:1234/v1`.
    pub base_url: String,
    /// Many local servers ignore authentication; the default placeholder is
    /// accepted by all of them.
    pub api_key: String,
    /// HTTP timeout in seconds, per request.
    pub timeout: u64,
    pub compression: CompressionConfig,
    pub retry: RetryConfig,
}

impl ChatCompletionsConfig {
    pub fn new(model: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            base_url: base_url.into(),
            api_key: "not-needed".to_string(),
            timeout: 300,
            compression: CompressionConfig::default(),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn with_context_window(mut self, window: usize) -> Self {
        self.compression.context_window = window;
        self
    }
}

/// Streaming backend over one OpenAI-compatible server.
pub struct ChatCompletionsBackend {
    config: ChatCompletionsConfig,
    http: reqwest::Client,
    buffer: Arc<Mutex<StreamingBuffer>>,
    hooks: Mutex<Option<Arc<HookManager>>>,
}

impl ChatCompletionsBackend {
    pub fn new(config: ChatCompletionsConfig) -> Result<Self> {
        if config.model.trim().is_empty() {
            return Err(Error::config("model cannot be empty"));
        }
        if !config.base_url.starts_with("http://") && !config.base_url.starts_with("https://") {
            return Err(Error::config(
                "base_url must start with http:// or https://",
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .map_err(Error::Http)?;
        Ok(Self {
            config,
            http,
            buffer: Arc::new(Mutex::new(StreamingBuffer::new())),
            hooks: Mutex::new(None),
        })
    }

    /// The recovery transcript accumulated during the current turn.
    pub fn buffer_snapshot(&self) -> String {
        self.buffer.lock().unwrap().snapshot()
    }

    /// The installed hook manager, if any. This adapter executes no tools of
    /// its own, so the manager is held for adapters layered on top of it.
    pub fn hook_manager(&self) -> Option<Arc<HookManager>> {
        self.hooks.lock().unwrap().clone()
    }
}

#[async_trait]
impl Backend for ChatCompletionsBackend {
    async fn stream(&self, request: StreamRequest) -> Result<ChunkStream> {
        let (tx, rx) = mpsc::channel::<StreamChunk>(64);
        let driver = StreamDriver {
            config: self.config.clone(),
            http: self.http.clone(),
            buffer: self.buffer.clone(),
            request,
            tx,
        };
        tokio::spawn(driver.run());
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    fn set_hook_manager(&self, manager: Arc<HookManager>) {
        *self.hooks.lock().unwrap() = Some(manager);
    }

    fn context_window(&self) -> usize {
        self.config.compression.context_window
    }
}

/// One in-flight turn: compression, request, SSE parse.
struct StreamDriver {
    config: ChatCompletionsConfig,
    http: reqwest::Client,
    buffer: Arc<Mutex<StreamingBuffer>>,
    request: StreamRequest,
    tx: mpsc::Sender<StreamChunk>,
}

impl StreamDriver {
    async fn run(self) {
        let mut messages = self.request.messages.clone();

        // Proactive: estimate before sending.
        if needs_compression(&messages, &self.config.compression)
            && !self.compress_history(&mut messages).await
        {
            let _ = self.tx.send(StreamChunk::Done).await;
            return;
        }

        // Reactive: one compression + retry on provider overflow.
        for attempt in 0..2 {
            match self.send_request(&messages).await {
                Ok(response) => {
                    self.forward_sse(response).await;
                    let _ = self.tx.send(StreamChunk::Done).await;
                    return;
                }
                Err(e) if e.is_context_overflow() && attempt == 0 => {
                    let _ = self
                        .tx
                        .send(StreamChunk::compression(CompressionState::OverflowDetected))
                        .await;
                    if !self.compress_history(&mut messages).await {
                        let _ = self.tx.send(StreamChunk::Done).await;
                        return;
                    }
                }
                Err(e) => {
                    let _ = self
                        .tx
                        .send(StreamChunk::error(e.to_string(), e.is_retryable()))
                        .await;
                    let _ = self.tx.send(StreamChunk::Done).await;
                    return;
                }
            }
        }
    }

    /// Emit the compression status chunks and shrink `messages` in place.
    /// Returns false when even a fully collapsed history misses the target,
    /// in which case the turn ends with a non-retryable error.
    async fn compress_history(&self, messages: &mut Vec<Message>) -> bool {
        let _ = self
            .tx
            .send(StreamChunk::compression(CompressionState::Compressing))
            .await;

        let (compressed, report) = compress(messages, &self.config.compression);
        if !report.met_target {
            let _ = self
                .tx
                .send(StreamChunk::CompressionStatus {
                    status: CompressionState::Failed,
                    kept: None,
                    ratio: Some(report.ratio),
                    note: Some("history does not fit the context window".to_string()),
                })
                .await;
            let _ = self
                .tx
                .send(StreamChunk::error(
                    "context overflow: compression could not reach the target ratio",
                    false,
                ))
                .await;
            return false;
        }

        *messages = compressed;
        let _ = self
            .tx
            .send(StreamChunk::CompressionStatus {
                status: CompressionState::Compressed,
                kept: Some(report.kept),
                ratio: Some(report.ratio),
                note: None,
            })
            .await;
        true
    }

    /// POST the request, retrying transient failures with backoff.
    async fn send_request(&self, messages: &[Message]) -> Result<reqwest::Response> {
        let body = build_request_body(&self.config.model, messages, &self.request);
        let url = format!("{}/chat/completions", self.config.base_url);
        let http = self.http.clone();
        let api_key = self.config.api_key.clone();

        retry_transient(self.config.retry.clone(), move || {
            let http = http.clone();
            let url = url.clone();
            let body = body.clone();
            let api_key = api_key.clone();
            async move {
                let response = http
                    .post(&url)
                    .header("Authorization", format!("Bearer {}", api_key))
                    .header("Content-Type", "application/json")
                    .json(&body)
                    .send()
                    .await
                    .map_err(Error::Http)?;

                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown error".to_string());
                Err(classify_api_error(status.as_u16(), &body))
            }
        })
        .await
    }

    /// Parse the SSE body and forward chunks until `[DONE]` or disconnect.
    async fn forward_sse(&self, response: reqwest::Response) {
        let mut byte_stream = response.bytes_stream();
        let mut aggregator = ToolCallAggregator::new();
        let mut pending = String::new();
        let mut clean_finish = false;

        'outer: while let Some(result) = byte_stream.next().await {
            let bytes = match result {
                Ok(bytes) => bytes,
                Err(e) => {
                    let _ = self
                        .tx
                        .send(StreamChunk::error(format!("stream failed: {}", e), true))
                        .await;
                    return;
                }
            };
            pending.push_str(&String::from_utf8_lossy(&bytes));

            // SSE events are newline-delimited; a byte chunk may end
            // mid-line, so only complete lines are consumed.
            while let Some(newline) = pending.find('\n') {
                let line: String = pending.drain(..=newline).collect();
                let line = line.trim();
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    clean_finish = true;
                    break 'outer;
                }

                let wire: WireChunk = match serde_json::from_str(data) {
                    Ok(wire) => wire,
                    Err(e) => {
                        let _ = self
                            .tx
                            .send(StreamChunk::error(
                                format!("failed to parse chunk: {}", e),
                                true,
                            ))
                            .await;
                        return;
                    }
                };

                for chunk in aggregator.process(wire) {
                    match &chunk {
                        StreamChunk::Content { content } => {
                            self.buffer.lock().unwrap().push_content(content)
                        }
                        StreamChunk::Reasoning { reasoning } => {
                            self.buffer.lock().unwrap().push_reasoning(reasoning)
                        }
                        _ => {}
                    }
                    if self.tx.send(chunk).await.is_err() {
                        return;
                    }
                }
            }
        }

        if clean_finish || aggregator.finished {
            // Successful turn: the recovery buffer has served its purpose.
            self.buffer.lock().unwrap().clear();
        }
    }
}

/// Map a non-success HTTP response to the error taxonomy.
fn classify_api_error(status: u16, body: &str) -> Error {
    if crate::error::is_overflow_message(body) {
        return Error::context_overflow(body.to_string());
    }
    if status == 429 || status >= 500 {
        return Error::provider_transient(format!("API error {}: {}", status, body));
    }
    Error::provider_fatal(format!("API error {}: {}", status, body))
}

/// Build the outgoing chat.completions request. Generic parameters map to
/// their native fields; options the API has no shape for (reasoning enable,
/// web search) are dropped silently.
fn build_request_body(model: &str, messages: &[Message], request: &StreamRequest) -> Value {
    let wire_messages: Vec<Value> = messages.iter().map(message_to_wire).collect();

    let mut body = json!({
        "model": model,
        "messages": wire_messages,
        "stream": true,
    });
    if let Some(temperature) = request.params.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(max_tokens) = request.params.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(request.tools.iter().map(|t| t.to_wire()).collect());
    }
    body
}

fn message_to_wire(message: &Message) -> Value {
    let role = match message.role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::Tool => "tool",
    };
    let mut wire = json!({"role": role, "content": message.content});
    if let Some(calls) = &message.tool_calls {
        wire["tool_calls"] = Value::Array(
            calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {"name": call.name, "arguments": call.arguments},
                    })
                })
                .collect(),
        );
    }
    if let Some(id) = &message.tool_call_id {
        wire["tool_call_id"] = json!(id);
    }
    wire
}

// ============================================================================
// WIRE SHAPES AND DELTA AGGREGATION
// ============================================================================

#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChoice>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    #[serde(default)]
    delta: WireDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
    /// Reasoning stream exposed by OpenRouter/Qwen-style servers.
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<WireFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct WireFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Aggregates streaming deltas into [`StreamChunk`]s.
///
/// Content and reasoning fragments pass through immediately; tool calls are
/// assembled across chunks (arguments can split at arbitrary byte positions)
/// and flushed as one `tool_calls` chunk when a `finish_reason` arrives.
struct ToolCallAggregator {
    tool_calls: HashMap<u32, PartialToolCall>,
    finished: bool,
}

impl ToolCallAggregator {
    fn new() -> Self {
        Self {
            tool_calls: HashMap::new(),
            finished: false,
        }
    }

    fn process(&mut self, wire: WireChunk) -> Vec<StreamChunk> {
        let mut out = Vec::new();

        for choice in wire.choices {
            if let Some(reasoning) = choice.delta.reasoning_content {
                if !reasoning.is_empty() {
                    out.push(StreamChunk::reasoning(reasoning));
                }
            }
            if let Some(content) = choice.delta.content {
                if !content.is_empty() {
                    out.push(StreamChunk::content(content));
                }
            }
            if let Some(deltas) = choice.delta.tool_calls {
                for delta in deltas {
                    let entry = self.tool_calls.entry(delta.index).or_default();
                    if let Some(id) = delta.id {
                        entry.id = Some(id);
                    }
                    if let Some(function) = delta.function {
                        if let Some(name) = function.name {
                            entry.name = Some(name);
                        }
                        if let Some(arguments) = function.arguments {
                            entry.arguments.push_str(&arguments);
                        }
                    }
                }
            }

            if choice.finish_reason.is_some() {
                self.finished = true;
                if !self.tool_calls.is_empty() {
                    let mut indices: Vec<u32> = self.tool_calls.keys().copied().collect();
                    indices.sort_unstable();
                    let calls: Vec<ToolCall> = indices
                        .into_iter()
                        .filter_map(|idx| {
                            let partial = self.tool_calls.remove(&idx)?;
                            // Incomplete deltas (missing id or name) are
                            // dropped rather than surfaced half-built.
                            Some(ToolCall::new(partial.id?, partial.name?, partial.arguments))
                        })
                        .collect();
                    self.tool_calls.clear();
                    if !calls.is_empty() {
                        out.push(StreamChunk::tool_calls(calls));
                    }
                }
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::GenerationParams;
    use crate::tools::ToolSpec;

    fn wire(data: &str) -> WireChunk {
        serde_json::from_str(data).unwrap()
    }

    #[test]
    fn test_aggregator_passes_content_through() {
        let mut aggregator = ToolCallAggregator::new();
        let out = aggregator.process(wire(
            r#"{"choices":[{"delta":{"content":"Hello "},"finish_reason":null}]}"#,
        ));
        assert_eq!(out, vec![StreamChunk::content("Hello ")]);
        assert!(!aggregator.finished);

        let out = aggregator.process(wire(
            r#"{"choices":[{"delta":{"content":"world"},"finish_reason":"stop"}]}"#,
        ));
        assert_eq!(out, vec![StreamChunk::content("world")]);
        assert!(aggregator.finished);
    }

    #[test]
    fn test_aggregator_assembles_split_tool_call() {
        let mut aggregator = ToolCallAggregator::new();
        aggregator.process(wire(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_123","function":{"name":"get_weather","arguments":"{\"location\":"}}]},"finish_reason":null}]}"#,
        ));
        let out = aggregator.process(wire(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"Paris\"}"}}]},"finish_reason":"tool_calls"}]}"#,
        ));

        assert_eq!(out.len(), 1);
        match &out[0] {
            StreamChunk::ToolCalls { tool_calls } => {
                assert_eq!(tool_calls.len(), 1);
                assert_eq!(tool_calls[0].id, "call_123");
                assert_eq!(tool_calls[0].name, "get_weather");
                assert_eq!(tool_calls[0].arguments, r#"{"location":"Paris"}"#);
            }
            other => panic!("expected tool_calls, got {:?}", other),
        }
    }

    #[test]
    fn test_aggregator_orders_interleaved_tool_calls_by_index() {
        let mut aggregator = ToolCallAggregator::new();
        aggregator.process(wire(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_b","function":{"name":"second","arguments":"{}"}}]},"finish_reason":null}]}"#,
        ));
        let out = aggregator.process(wire(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"first","arguments":"{}"}}]},"finish_reason":"tool_calls"}]}"#,
        ));

        match &out[0] {
            StreamChunk::ToolCalls { tool_calls } => {
                assert_eq!(tool_calls[0].name, "first");
                assert_eq!(tool_calls[1].name, "second");
            }
            other => panic!("expected tool_calls, got {:?}", other),
        }
    }

    #[test]
    fn test_aggregator_emits_reasoning_chunks() {
        let mut aggregator = ToolCallAggregator::new();
        let out = aggregator.process(wire(
            r#"{"choices":[{"delta":{"reasoning_content":"thinking..."},"finish_reason":null}]}"#,
        ));
        assert_eq!(out, vec![StreamChunk::reasoning("thinking...")]);
    }

    #[test]
    fn test_classify_api_error() {
        assert!(classify_api_error(503, "upstream died").is_retryable());
        assert!(classify_api_error(429, "slow down").is_retryable());
        assert!(!classify_api_error(401, "bad key").is_retryable());
        assert!(
            classify_api_error(400, "This model's maximum context length is 8192 tokens")
                .is_context_overflow()
        );
    }

    #[test]
    fn test_build_request_body_maps_params() {
        let request = StreamRequest::new(vec![
            Message::system("be brief"),
            Message::user("hi"),
        ])
        .with_tools(vec![ToolSpec::new("search", "Search", json!({"type": "object"}))])
        .with_params(GenerationParams {
            temperature: Some(0.7),
            max_tokens: Some(256),
            // No native field: dropped silently.
            enable_reasoning: true,
            enable_web_search: true,
        });

        let body = build_request_body("qwen2.5-32b-instruct", &request.messages, &request);
        assert_eq!(body["model"], "qwen2.5-32b-instruct");
        assert_eq!(body["stream"], true);
        assert_eq!(body["temperature"], 0.7);
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["tools"][0]["function"]["name"], "search");
        assert!(body.get("enable_reasoning").is_none());
        assert!(body.get("web_search").is_none());
    }

    #[test]
    fn test_message_to_wire_round_trips_tool_plumbing() {
        let assistant = Message::assistant_tool_calls(
            "",
            vec![ToolCall::new("call_1", "vote", r#"{"agent_id":"b"}"#)],
        );
        let wire = message_to_wire(&assistant);
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "vote");

        let tool = Message::tool_result("call_1", "ok");
        let wire = message_to_wire(&tool);
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "call_1");
    }

    #[test]
    fn test_hook_manager_installation() {
        let backend = ChatCompletionsBackend::new(ChatCompletionsConfig::new(
            "m",
            "http://localhost:1234/v1",
        ))
        .unwrap();
        assert!(backend.hook_manager().is_none());
        backend.set_hook_manager(Arc::new(HookManager::new()));
        assert!(backend.hook_manager().is_some());
    }

    #[test]
    fn test_backend_config_validation() {
        assert!(
            ChatCompletionsBackend::new(ChatCompletionsConfig::new("", "http://localhost:1234/v1"))
                .is_err()
        );
        assert!(
            ChatCompletionsBackend::new(ChatCompletionsConfig::new("m", "localhost:1234")).is_err()
        );
        let backend = ChatCompletionsBackend::new(
            ChatCompletionsConfig::new("qwen2.5-32b-instruct", "http://localhost:1234/v1")
                .with_context_window(32_000),
        )
        .unwrap();
        assert_eq!(backend.context_window(), 32_000);
    }
}
