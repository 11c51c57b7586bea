//! The streaming backend contract.
//!
//! Every provider adapter exposes one operation:
//!
//! ```text
//! stream(request) -> async sequence of StreamChunk
//! ```
//!
//! with the following contracts:
//!
//! - The sequence is *finite* and terminates with exactly one `done` chunk,
//!   even on error (an `error` chunk precedes `done`).
//! - `tool_calls` chunks are terminal for the model turn: after emitting one,
//!   the backend emits `done` without further `content`. The caller executes
//!   the tools and resumes with a new `stream()` call whose message list
//!   includes the tool results.
//! - `content`/`reasoning` fragments are incremental; concatenating all
//!   `content` of one turn yields the full assistant text.
//!
//! Backends are capability objects behind [`Backend`], not an inheritance
//! hierarchy. Provider-specific parameter handling lives in each adapter: the
//! generic [`GenerationParams`] are mapped to the native shape and
//! unsupported options are dropped silently.
//!
//! [`ScriptedBackend`] is a deterministic in-memory adapter used by the test
//! suite and by demos: it replays a prepared list of turns and records every
//! request it receives.

use crate::hooks::HookManager;
use crate::tools::ToolSpec;
use crate::types::{Message, StreamChunk};
use crate::Result;
use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

/// Stream of chunks from one backend turn.
pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

/// Provider-agnostic generation parameters.
///
/// Each adapter translates these to its native request shape and silently
/// drops what it does not support.
#[derive(Debug, Clone, Default)]
pub struct GenerationParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Ask the provider to expose model reasoning, where supported.
    pub enable_reasoning: bool,
    /// Ask the provider to allow built-in web search, where supported.
    pub enable_web_search: bool,
}

/// One backend turn: the outgoing history, the advertised tools, and the
/// generation parameters.
#[derive(Debug, Clone, Default)]
pub struct StreamRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    pub params: GenerationParams,
}

impl StreamRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
            params: GenerationParams::default(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }
}

/// The capability every provider adapter satisfies.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Run one model turn. The returned stream honours the chunk contracts
    /// described at module level.
    async fn stream(&self, request: StreamRequest) -> Result<ChunkStream>;

    /// Install the hook manager for adapters that execute tools on their own
    /// side of the boundary. The default is a no-op; the agent runtime runs
    /// hooks for every tool it executes itself.
    fn set_hook_manager(&self, manager: Arc<HookManager>) {
        let _ = manager;
    }

    /// The provider context window, in tokens. Drives compression.
    fn context_window(&self) -> usize {
        128_000
    }
}

// ============================================================================
// STREAMING BUFFER
// ============================================================================

/// Running transcript of content and reasoning produced during a turn.
///
/// Backends keep this for recovery when a provider raises a mid-stream
/// context-overflow error. Reasoning segments are wrapped in a `[Reasoning]`
/// block so they can be told apart from visible output on replay. The buffer
/// is preserved across compression and discarded on a successful `done`.
#[derive(Debug, Default)]
pub struct StreamingBuffer {
    buffer: String,
    in_reasoning: bool,
}

impl StreamingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_content(&mut self, fragment: &str) {
        if self.in_reasoning {
            self.buffer.push_str("\n[/Reasoning]\n");
            self.in_reasoning = false;
        }
        self.buffer.push_str(fragment);
    }

    pub fn push_reasoning(&mut self, fragment: &str) {
        if !self.in_reasoning {
            if !self.buffer.is_empty() {
                self.buffer.push('\n');
            }
            self.buffer.push_str("[Reasoning]\n");
            self.in_reasoning = true;
        }
        self.buffer.push_str(fragment);
    }

    /// The transcript so far, with any open reasoning block closed.
    pub fn snapshot(&self) -> String {
        if self.in_reasoning {
            format!("{}\n[/Reasoning]\n", self.buffer)
        } else {
            self.buffer.clone()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.in_reasoning = false;
    }
}

// ============================================================================
// SCRIPTED BACKEND
// ============================================================================

/// Deterministic backend that replays prepared turns.
///
/// Each call to [`Backend::stream`] pops the next scripted turn and emits its
/// chunks in order, appending the `done` sentinel when the script omitted it.
/// Once the script is exhausted, further turns emit a single empty `done`.
/// All requests are recorded for later assertions.
///
/// # Examples
///
/// ```
/// use massgen::{ScriptedBackend, StreamChunk};
///
/// let backend = ScriptedBackend::new(vec![
///     vec![StreamChunk::content("Hi")],
/// ]);
/// ```
pub struct ScriptedBackend {
    turns: Mutex<VecDeque<Vec<StreamChunk>>>,
    delays: Mutex<VecDeque<std::time::Duration>>,
    requests: Mutex<Vec<StreamRequest>>,
    hook_manager_installed: Mutex<bool>,
    context_window: usize,
}

impl ScriptedBackend {
    /// One inner `Vec<StreamChunk>` per scripted turn.
    pub fn new(turns: Vec<Vec<StreamChunk>>) -> Self {
        Self {
            turns: Mutex::new(turns.into_iter().collect()),
            delays: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            hook_manager_installed: Mutex::new(false),
            context_window: 128_000,
        }
    }

    pub fn with_context_window(mut self, window: usize) -> Self {
        self.context_window = window;
        self
    }

    /// Sleep before emitting each turn's chunks, one entry per turn. Used by
    /// tests to sequence concurrent agents deterministically.
    pub fn with_turn_delays(self, delays: Vec<std::time::Duration>) -> Self {
        *self.delays.lock().unwrap() = delays.into_iter().collect();
        self
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Whether [`Backend::set_hook_manager`] was called.
    pub fn hook_manager_installed(&self) -> bool {
        *self.hook_manager_installed.lock().unwrap()
    }

    /// Remaining scripted turns.
    pub fn remaining_turns(&self) -> usize {
        self.turns.lock().unwrap().len()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn stream(&self, request: StreamRequest) -> Result<ChunkStream> {
        self.requests.lock().unwrap().push(request);

        let mut chunks = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        if !matches!(chunks.last(), Some(StreamChunk::Done)) {
            chunks.push(StreamChunk::Done);
        }

        let delay = self
            .delays
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        let stream = futures::stream::once(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        })
        .flat_map(move |_| futures::stream::iter(chunks.clone()));

        Ok(Box::pin(stream))
    }

    fn set_hook_manager(&self, _manager: Arc<HookManager>) {
        *self.hook_manager_installed.lock().unwrap() = true;
    }

    fn context_window(&self) -> usize {
        self.context_window
    }
}
