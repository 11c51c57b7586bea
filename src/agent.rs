//! The agent runtime.
//!
//! An [`Agent`] owns one backend, one broadcast inbox, and optionally a
//! workspace directory. One call to [`Agent::run`] answers one user turn:
//! the runtime streams the backend, executes tool calls between backend
//! turns (workflow tools are routed to the coordination layer, client tools
//! run locally), runs PreToolUse/PostToolUse hooks around every execution,
//! and keeps going until a backend turn ends without tool calls.
//!
//! The runtime is single-threaded with cooperative suspension: at most one
//! tool runs at a time per agent, while multiple agents run in parallel
//! under the orchestrator.
//!
//! Cancellation is driven by the restart token, a monotonic counter.
//! [`Agent::cancel`] bumps it; the running turn observes the change at the
//! next chunk or tool boundary and finishes with an `error { retryable:
//! true }` chunk followed by `done`.

use crate::backend::{Backend, ChunkStream, GenerationParams, StreamRequest};
use crate::broadcast::BroadcastQueue;
use crate::display::{DisplaySink, NullDisplay};
use crate::hooks::{HookDecision, HookEvent, HookManager, HookType, InjectionStrategy};
use crate::tools::{Tool, ToolSpec};
use crate::types::{Message, StreamChunk, ToolCall};
use crate::workflow;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Turn cap inside one `run()`: a backend that keeps requesting tools stops
/// getting continuations after this many tool rounds.
const MAX_TOOL_TURNS: u32 = 16;

/// The coordination operations an agent's workflow tools resolve against.
///
/// Implemented by the orchestrator; every method returns the JSON payload
/// fed back to the model as the tool result, so protocol violations surface
/// as structured errors without terminating the stream.
#[async_trait]
pub trait CoordinationHandle: Send + Sync {
    async fn submit_answer(&self, agent_id: &str, content: &str) -> String;
    async fn cast_vote(&self, agent_id: &str, target_id: &str, reason: &str) -> String;
    async fn ask_others(&self, agent_id: &str, question: &str, wait: Option<bool>) -> String;
    async fn respond_to_broadcast(
        &self,
        agent_id: &str,
        request_id: &str,
        answer: &str,
    ) -> String;
    async fn broadcast_status(&self, agent_id: &str, request_id: &str) -> String;
    async fn broadcast_responses(&self, agent_id: &str, request_id: &str) -> String;
}

/// One language-model agent: a backend, a broadcast inbox, client tools, and
/// the hook plumbing around them.
pub struct Agent {
    id: String,
    backend: Arc<dyn Backend>,
    client_tools: Vec<Arc<Tool>>,
    workflow_specs: Mutex<Vec<ToolSpec>>,
    params: GenerationParams,
    system_prompt: Option<String>,
    workspace: Option<PathBuf>,

    hooks: Mutex<Arc<HookManager>>,
    display: Mutex<Arc<dyn DisplaySink>>,
    coordination: Mutex<Option<Arc<dyn CoordinationHandle>>>,

    broadcast_queue: Arc<BroadcastQueue>,
    /// Broadcast requests delivered to the model but not yet answered.
    awaiting_response: Mutex<VecDeque<String>>,

    restart_token: AtomicU64,
    cancel_reason: Mutex<Option<String>>,

    session_id: Mutex<String>,
    orchestrator_id: Mutex<String>,
}

impl Agent {
    /// Create an agent over a backend. Client tools must not shadow the
    /// reserved workflow tool names.
    pub fn new(id: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        Self {
            id: id.into(),
            backend,
            client_tools: Vec::new(),
            workflow_specs: Mutex::new(Vec::new()),
            params: GenerationParams::default(),
            system_prompt: None,
            workspace: None,
            hooks: Mutex::new(Arc::new(HookManager::new())),
            display: Mutex::new(Arc::new(NullDisplay)),
            coordination: Mutex::new(None),
            broadcast_queue: Arc::new(BroadcastQueue::new()),
            awaiting_response: Mutex::new(VecDeque::new()),
            restart_token: AtomicU64::new(0),
            cancel_reason: Mutex::new(None),
            session_id: Mutex::new("local".to_string()),
            orchestrator_id: Mutex::new("standalone".to_string()),
        }
    }

    /// Register a client tool. Fails fast on a workflow-name collision.
    pub fn with_tool(mut self, tool: Arc<Tool>) -> crate::Result<Self> {
        workflow::ensure_no_collisions(std::slice::from_ref(tool.spec()))?;
        self.client_tools.push(tool);
        Ok(self)
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Install the shared hook manager. Also handed to the backend for
    /// adapters that execute tools on their own side of the boundary.
    pub fn set_hooks(&self, hooks: Arc<HookManager>) {
        self.backend.set_hook_manager(hooks.clone());
        *self.hooks.lock().unwrap() = hooks;
    }

    pub fn set_display(&self, display: Arc<dyn DisplaySink>) {
        *self.display.lock().unwrap() = display;
    }

    /// Advertise the coordination tools and wire their execution target.
    pub fn set_coordination(
        &self,
        handle: Arc<dyn CoordinationHandle>,
        workflow_specs: Vec<ToolSpec>,
    ) {
        *self.coordination.lock().unwrap() = Some(handle);
        *self.workflow_specs.lock().unwrap() = workflow_specs;
    }

    pub fn set_session(&self, session_id: impl Into<String>, orchestrator_id: impl Into<String>) {
        *self.session_id.lock().unwrap() = session_id.into();
        *self.orchestrator_id.lock().unwrap() = orchestrator_id.into();
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub fn workspace(&self) -> Option<&PathBuf> {
        self.workspace.as_ref()
    }

    /// The inbox handle shared with the broadcast channel's roster.
    pub fn broadcast_queue(&self) -> Arc<BroadcastQueue> {
        self.broadcast_queue.clone()
    }

    /// Append an incoming broadcast to the inbox. Delivered to the model at
    /// the next turn boundary.
    pub fn inject_broadcast(&self, request: crate::broadcast::BroadcastRequest) {
        self.broadcast_queue.push(request);
    }

    /// Current restart token. Bumped by [`Agent::cancel`].
    pub fn restart_token(&self) -> u64 {
        self.restart_token.load(Ordering::SeqCst)
    }

    /// Cancel the in-flight run. The running turn observes the token change
    /// at its next suspension point and ends with a retryable error chunk.
    pub fn cancel(&self, reason: impl Into<String>) {
        *self.cancel_reason.lock().unwrap() = Some(reason.into());
        self.restart_token.fetch_add(1, Ordering::SeqCst);
    }

    fn cancelled_since(&self, token: u64) -> bool {
        self.restart_token.load(Ordering::SeqCst) != token
    }

    fn cancel_message(&self) -> String {
        self.cancel_reason
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "cancelled".to_string())
    }

    /// Run one turn: stream the backend, interleave tool execution, honour
    /// broadcasts and cancellation. The returned stream ends with exactly
    /// one `done` chunk.
    pub fn run(self: Arc<Self>, messages: Vec<Message>) -> ChunkStream {
        let (tx, rx) = mpsc::channel::<StreamChunk>(64);

        tokio::spawn(async move {
            let token = self.restart_token();
            self.run_inner(messages, token, &tx).await;
            let _ = tx.send(StreamChunk::Done).await;
        });

        Box::pin(ReceiverStream::new(rx))
    }

    async fn run_inner(
        &self,
        mut messages: Vec<Message>,
        token: u64,
        tx: &mpsc::Sender<StreamChunk>,
    ) {
        for _turn in 0..MAX_TOOL_TURNS {
            if self.cancelled_since(token) {
                let _ = tx
                    .send(StreamChunk::error(self.cancel_message(), true))
                    .await;
                return;
            }

            self.drain_broadcasts(&mut messages);

            let mut tools = self.workflow_specs.lock().unwrap().clone();
            tools.extend(self.client_tools.iter().map(|t| t.spec().clone()));
            let request = StreamRequest::new(messages.clone())
                .with_tools(tools)
                .with_params(self.params.clone());

            let mut stream = match self.backend.stream(request).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = tx
                        .send(StreamChunk::error(e.to_string(), e.is_retryable()))
                        .await;
                    return;
                }
            };

            let mut turn_text = String::new();
            let mut tool_calls: Option<Vec<ToolCall>> = None;
            let mut failed = false;

            while let Some(chunk) = stream.next().await {
                if self.cancelled_since(token) {
                    let _ = tx
                        .send(StreamChunk::error(self.cancel_message(), true))
                        .await;
                    return;
                }
                match chunk {
                    StreamChunk::Content { ref content } => {
                        turn_text.push_str(content);
                        let _ = tx.send(chunk).await;
                    }
                    StreamChunk::ToolCalls { tool_calls: calls } => {
                        let _ = tx
                            .send(StreamChunk::tool_calls(calls.clone()))
                            .await;
                        tool_calls = Some(calls);
                    }
                    StreamChunk::Error { .. } => {
                        failed = true;
                        let _ = tx.send(chunk).await;
                    }
                    // The turn's `done` is ours to emit, once, at the end.
                    StreamChunk::Done => break,
                    other => {
                        let _ = tx.send(other).await;
                    }
                }
            }

            let Some(calls) = tool_calls else {
                // Turn ended in plain text (or error): the run is over.
                return;
            };
            if failed {
                return;
            }

            messages.push(Message::assistant_tool_calls(turn_text, calls.clone()));

            let mut user_injections: Vec<String> = Vec::new();
            for call in calls {
                if self.cancelled_since(token) {
                    let _ = tx
                        .send(StreamChunk::error(self.cancel_message(), true))
                        .await;
                    return;
                }
                let (result, injections) = self.execute_call(&call).await;
                let _ = tx
                    .send(StreamChunk::tool_result(call.id.clone(), result.clone()))
                    .await;
                messages.push(Message::tool_result(call.id.clone(), result));
                user_injections.extend(injections);
            }
            for injection in user_injections {
                messages.push(Message::user(injection));
            }
        }

        let _ = tx
            .send(StreamChunk::error(
                format!("tool turn limit reached ({})", MAX_TOOL_TURNS),
                false,
            ))
            .await;
    }

    /// Deliver queued broadcast questions as synthetic user messages and
    /// remember which requests the model owes an answer to.
    fn drain_broadcasts(&self, messages: &mut Vec<Message>) {
        for request in self.broadcast_queue.drain() {
            messages.push(Message::user(format!(
                "Broadcast question from agent {}: {}\n\
                 Answer it with the respond_to_broadcast tool before continuing.",
                request.sender_id, request.question
            )));
            self.awaiting_response.lock().unwrap().push_back(request.id);
        }
    }

    /// Run one tool call through the hook pipeline and execute it. Returns
    /// the tool result content plus any user-message injections.
    async fn execute_call(&self, call: &ToolCall) -> (String, Vec<String>) {
        let parsed_input = match call.parsed_arguments() {
            Ok(input) => input,
            Err(e) => {
                return (
                    workflow::error_payload("INVALID_ARGUMENTS", e.to_string()),
                    Vec::new(),
                );
            }
        };

        let session_id = self.session_id.lock().unwrap().clone();
        let orchestrator_id = self.orchestrator_id.lock().unwrap().clone();
        let hooks = self.hooks.lock().unwrap().clone();

        let pre = hooks
            .execute(HookEvent::new(
                HookType::PreToolUse,
                session_id.clone(),
                orchestrator_id.clone(),
                Some(self.id.clone()),
                call.name.clone(),
                parsed_input.clone(),
            ))
            .await;
        for err in &pre.hook_errors {
            log::warn!("[{}] pre-tool hook failure: {}", self.id, err);
        }

        let input = pre.updated_input.unwrap_or(parsed_input);

        let output = match pre.decision {
            HookDecision::Deny => workflow::error_payload(
                "BLOCKED_BY_HOOK",
                pre.reason
                    .unwrap_or_else(|| "tool call denied".to_string()),
            ),
            HookDecision::Ask => {
                let reason = pre.reason.as_deref().unwrap_or("confirm tool call");
                let display = self.display.lock().unwrap().clone();
                if display.confirm(&self.id, &call.name, reason).await {
                    self.dispatch(call, &input).await
                } else {
                    workflow::error_payload("BLOCKED_BY_HOOK", "declined by user")
                }
            }
            HookDecision::Allow => self.dispatch(call, &input).await,
        };

        let post = hooks
            .execute(
                HookEvent::new(
                    HookType::PostToolUse,
                    session_id,
                    orchestrator_id,
                    Some(self.id.clone()),
                    call.name.clone(),
                    input,
                )
                .with_output(output.clone()),
            )
            .await;
        for err in &post.hook_errors {
            log::warn!("[{}] post-tool hook failure: {}", self.id, err);
        }

        let mut result = output;
        for injection in post.injections_with(InjectionStrategy::ToolResult) {
            result.push('\n');
            result.push_str(&injection.content);
        }
        let user_injections = post
            .injections_with(InjectionStrategy::UserMessage)
            .into_iter()
            .map(|i| i.content.clone())
            .collect();

        (result, user_injections)
    }

    /// Route a call: workflow tools to the coordination layer, everything
    /// else to the client tool registry.
    async fn dispatch(&self, call: &ToolCall, input: &Value) -> String {
        if workflow::is_workflow_tool(&call.name) {
            return self.dispatch_workflow(&call.name, input).await;
        }

        let Some(tool) = self.client_tools.iter().find(|t| t.name() == call.name) else {
            return workflow::error_payload(
                "UNKNOWN_TOOL",
                format!("tool '{}' not found", call.name),
            );
        };
        match tool.execute(input.clone()).await {
            Ok(value) => value.to_string(),
            // Tool failures are returned to the model, never propagated as
            // backend errors.
            Err(e) => workflow::error_payload("TOOL_FAILED", e.to_string()),
        }
    }

    async fn dispatch_workflow(&self, name: &str, input: &Value) -> String {
        let handle = self.coordination.lock().unwrap().clone();
        let Some(handle) = handle else {
            return workflow::error_payload(
                "NO_COORDINATION",
                "workflow tools are unavailable outside an orchestrated session",
            );
        };

        let text = |key: &str| {
            input
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        match name {
            "new_answer" => handle.submit_answer(&self.id, &text("content")).await,
            "vote" => {
                handle
                    .cast_vote(&self.id, &text("agent_id"), &text("reason"))
                    .await
            }
            "ask_others" => {
                let wait = input.get("wait").and_then(Value::as_bool);
                handle.ask_others(&self.id, &text("question"), wait).await
            }
            "respond_to_broadcast" => {
                // Answer the oldest request the model owes a response to; a
                // guard-tripped request still sitting in the inbox counts.
                let request_id = self
                    .awaiting_response
                    .lock()
                    .unwrap()
                    .pop_front()
                    .or_else(|| self.broadcast_queue.pop().map(|r| r.id));
                match request_id {
                    Some(request_id) => {
                        handle
                            .respond_to_broadcast(&self.id, &request_id, &text("answer"))
                            .await
                    }
                    None => workflow::error_payload(
                        "NO_ACTIVE_BROADCAST",
                        "no broadcast request to respond to",
                    ),
                }
            }
            "check_broadcast_status" => {
                handle
                    .broadcast_status(&self.id, &text("request_id"))
                    .await
            }
            "get_broadcast_responses" => {
                handle
                    .broadcast_responses(&self.id, &text("request_id"))
                    .await
            }
            other => workflow::error_payload(
                "UNKNOWN_TOOL",
                format!("unrecognised workflow tool '{}'", other),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedBackend;
    use crate::hooks::{hook_fn, HookResult};
    use crate::tools::tool;
    use crate::Result;
    use serde_json::json;

    async fn collect(stream: ChunkStream) -> Vec<StreamChunk> {
        stream.collect().await
    }

    fn content_of(chunks: &[StreamChunk]) -> String {
        chunks
            .iter()
            .filter_map(|c| match c {
                StreamChunk::Content { content } => Some(content.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_plain_text_turn_passes_through() {
        let backend = Arc::new(ScriptedBackend::new(vec![vec![
            StreamChunk::content("Hi"),
        ]]));
        let agent = Arc::new(Agent::new("a", backend));

        let chunks = collect(agent.run(vec![Message::user("Hello")])).await;
        assert_eq!(content_of(&chunks), "Hi");
        assert_eq!(chunks.last(), Some(&StreamChunk::Done));
        assert_eq!(
            chunks.iter().filter(|c| **c == StreamChunk::Done).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_tool_loop_executes_and_continues() -> Result<()> {
        let backend = Arc::new(ScriptedBackend::new(vec![
            vec![StreamChunk::tool_calls(vec![ToolCall::new(
                "call_1",
                "double",
                r#"{"value": 21}"#,
            )])],
            vec![StreamChunk::content("It doubled to 42.")],
        ]));
        let double = tool("double", "Double a number")
            .param("value", "number")
            .build(|args| async move {
                Ok(json!({"result": args["value"].as_f64().unwrap_or(0.0) * 2.0}))
            });
        let agent = Arc::new(Agent::new("a", backend.clone()).with_tool(double)?);

        let chunks = collect(agent.run(vec![Message::user("double 21")])).await;
        assert!(chunks.iter().any(|c| matches!(
            c,
            StreamChunk::ToolResult { content, .. } if content.contains("42")
        )));
        assert_eq!(content_of(&chunks), "It doubled to 42.");

        // The continuation carried the assistant turn and the tool result.
        let second_request = &backend.requests()[1];
        let roles: Vec<_> = second_request
            .messages
            .iter()
            .map(|m| m.role)
            .collect();
        assert!(roles.contains(&crate::types::MessageRole::Tool));
        Ok(())
    }

    #[tokio::test]
    async fn test_denied_tool_is_skipped_with_reason() -> Result<()> {
        let backend = Arc::new(ScriptedBackend::new(vec![
            vec![StreamChunk::tool_calls(vec![ToolCall::new(
                "call_1",
                "delete_file",
                r#"{"path": "/etc/passwd"}"#,
            )])],
            vec![StreamChunk::content("understood")],
        ]));
        let dangerous = tool("delete_file", "Delete a file")
            .param("path", "string")
            .build(|_| async move {
                panic!("must not execute, hook denies this");
            });
        let agent = Agent::new("a", backend).with_tool(dangerous)?;

        let hooks = Arc::new(HookManager::new());
        hooks.register_global(
            HookType::PreToolUse,
            hook_fn("guard", |event| async move {
                if event.tool_name == "delete_file" {
                    return Ok(HookResult::deny("dangerous operation blocked"));
                }
                Ok(HookResult::allow())
            }),
        );
        agent.set_hooks(hooks);
        let agent = Arc::new(agent);

        let chunks = collect(agent.run(vec![Message::user("clean up")])).await;
        let result = chunks
            .iter()
            .find_map(|c| match c {
                StreamChunk::ToolResult { content, .. } => Some(content.clone()),
                _ => None,
            })
            .unwrap();
        assert!(result.contains("BLOCKED_BY_HOOK"));
        assert!(result.contains("dangerous operation blocked"));
        Ok(())
    }

    #[tokio::test]
    async fn test_injection_split_lands_in_continuation() -> Result<()> {
        let backend = Arc::new(ScriptedBackend::new(vec![
            vec![StreamChunk::tool_calls(vec![ToolCall::new(
                "call_1",
                "lookup",
                r#"{}"#,
            )])],
            vec![StreamChunk::content("done")],
        ]));
        let lookup = tool("lookup", "Look something up")
            .build(|_| async move { Ok(json!({"found": true})) });
        let agent = Agent::new("a", backend.clone()).with_tool(lookup)?;

        let hooks = Arc::new(HookManager::new());
        hooks.register_global(
            HookType::PostToolUse,
            hook_fn("tool-side", |_| async {
                Ok(HookResult::inject("X", InjectionStrategy::ToolResult))
            }),
        );
        hooks.register_global(
            HookType::PostToolUse,
            hook_fn("user-side", |_| async {
                Ok(HookResult::inject("Y", InjectionStrategy::UserMessage))
            }),
        );
        agent.set_hooks(hooks);
        let agent = Arc::new(agent);

        collect(agent.run(vec![Message::user("look it up")])).await;

        let continuation = &backend.requests()[1].messages;
        // ... tool result ending in "X", then a synthetic user message "Y".
        let tool_msg = continuation
            .iter()
            .find(|m| m.role == crate::types::MessageRole::Tool)
            .unwrap();
        assert!(tool_msg.content.ends_with("X"));
        let last = continuation.last().unwrap();
        assert_eq!(last.role, crate::types::MessageRole::User);
        assert_eq!(last.content, "Y");
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_tool_reports_structured_error() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            vec![StreamChunk::tool_calls(vec![ToolCall::new(
                "call_1",
                "missing_tool",
                "{}",
            )])],
            vec![],
        ]));
        let agent = Arc::new(Agent::new("a", backend));

        let chunks = collect(agent.run(vec![Message::user("go")])).await;
        let result = content_of_tool_results(&chunks);
        assert!(result.contains("UNKNOWN_TOOL"));
    }

    fn content_of_tool_results(chunks: &[StreamChunk]) -> String {
        chunks
            .iter()
            .filter_map(|c| match c {
                StreamChunk::ToolResult { content, .. } => Some(content.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_cancel_before_run_yields_error_then_done() {
        let backend = Arc::new(ScriptedBackend::new(vec![vec![
            StreamChunk::content("never seen"),
        ]]));
        let agent = Arc::new(Agent::new("a", backend));
        let stream = agent.clone().run(vec![Message::user("hello")]);

        agent.cancel("restart requested");
        // Give the turn task a chance to observe the token.
        let chunks: Vec<StreamChunk> = stream.collect().await;

        // The stream always terminates with done; if the cancel won the race
        // the error chunk precedes it and no content follows the error.
        assert_eq!(chunks.last(), Some(&StreamChunk::Done));
        if let Some(error_pos) = chunks
            .iter()
            .position(|c| matches!(c, StreamChunk::Error { .. }))
        {
            assert!(!chunks[error_pos..]
                .iter()
                .any(|c| matches!(c, StreamChunk::Content { .. })));
        }
    }

    #[tokio::test]
    async fn test_broadcast_drained_into_messages() {
        let backend = Arc::new(ScriptedBackend::new(vec![vec![StreamChunk::content(
            "ok",
        )]]));
        let agent = Arc::new(Agent::new("b", backend.clone()));

        agent.inject_broadcast(crate::broadcast::BroadcastRequest {
            id: "req-1".to_string(),
            sender_id: "a".to_string(),
            question: "Which framework?".to_string(),
            created_at: chrono::Utc::now(),
            timeout_ms: 60_000,
            response_mode: crate::broadcast::ResponseMode::Inline,
            expected_count: 1,
            received_count: 0,
            status: crate::broadcast::BroadcastStatus::Collecting,
        });

        collect(agent.clone().run(vec![Message::user("continue")])).await;

        let request = &backend.requests()[0];
        let injected = request
            .messages
            .iter()
            .find(|m| m.content.contains("Broadcast question from agent a"))
            .unwrap();
        assert!(injected.content.contains("Which framework?"));
        assert!(agent.broadcast_queue().is_empty());
    }

    #[tokio::test]
    async fn test_backend_error_surfaces_retryable_flag() {
        struct FailingBackend;
        #[async_trait]
        impl Backend for FailingBackend {
            async fn stream(&self, _request: StreamRequest) -> crate::Result<ChunkStream> {
                Err(crate::Error::provider_transient("503 upstream"))
            }
        }

        let agent = Arc::new(Agent::new("a", Arc::new(FailingBackend)));
        let chunks = collect(agent.run(vec![Message::user("hi")])).await;
        assert!(matches!(
            chunks[0],
            StreamChunk::Error { retryable: true, .. }
        ));
        assert_eq!(chunks.last(), Some(&StreamChunk::Done));
    }
}
