//! # MassGen: Multi-Agent Coordination Runtime
//!
//! Several language-model agents work on one user query in parallel, share
//! intermediate answers, vote, and converge on a single final answer. This
//! crate is the coordination kernel that makes that more than a thin LLM
//! wrapper:
//!
//! - **Orchestrator**: a parallel scheduler that drives N agents, routes
//!   their streamed output, enforces the voting/convergence protocol,
//!   restarts agents when peer answers change their context, and produces
//!   one winning answer.
//! - **Broadcast channel**: an agent-to-agent (and optionally agent-to-human)
//!   question/response bus with rate limiting, timeouts, and a deadlock
//!   guard.
//! - **Streaming backend contract**: the uniform [`StreamChunk`] interface
//!   every provider adapter satisfies, including the reactive compression
//!   sub-protocol that keeps long conversations inside each provider's
//!   context window.
//! - **Hook framework**: PreToolUse/PostToolUse interception used for
//!   cross-agent mid-stream injection and high-priority task reminders.
//! - **Plan session store**: an immutable planning artifact with drift
//!   detection.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use massgen::{
//!     Agent, ChatCompletionsBackend, ChatCompletionsConfig, CoordinationConfig, Orchestrator,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = |model: &str| -> massgen::Result<Arc<ChatCompletionsBackend>> {
//!         Ok(Arc::new(ChatCompletionsBackend::new(
//!             ChatCompletionsConfig::new(model, "http://localhost:1234/v1"),
//!         )?))
//!     };
//!
//!     let orchestrator = Orchestrator::builder(CoordinationConfig::default())
//!         .agent(Agent::new("a", backend("qwen2.5-32b-instruct")?))
//!         .agent(Agent::new("b", backend("llama3:8b")?))
//!         .build()?;
//!
//!     let winner = orchestrator.run("What's the capital of France?").await?;
//!     println!("[{}] {}", winner.agent_id, winner.content);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **types**: [`StreamChunk`], [`Message`], [`ToolCall`], status enums
//! - **backend**: the [`Backend`] capability trait, streaming buffer, and
//!   the deterministic [`ScriptedBackend`]
//! - **chat_completions**: concrete OpenAI-compatible streaming adapter
//! - **compression**: token estimation and deterministic history shrinking
//! - **hooks**: hook manager, built-in hooks, fail-open execution
//! - **broadcast**: the question/response bus
//! - **workflow**: reserved workflow tools and structured tool results
//! - **tools**: client tool registry with async handlers
//! - **agent**: the per-agent runtime ([`Agent::run`])
//! - **orchestrator**: fan-in scheduler, voting, convergence, restarts
//! - **display**: the event port UIs consume
//! - **plan**: plan-and-execute session store
//! - **config**: the session configuration tree
//! - **server**: OpenAI-compatible adapter surface (model routing, SSE)
//! - **retry**: exponential backoff with jitter

mod agent;
mod backend;
mod broadcast;
mod chat_completions;
mod compression;
mod config;
mod display;
mod error;
mod hooks;
mod orchestrator;
mod plan;
mod server;
mod tools;
mod types;
mod workflow;

/// Retry utilities with exponential backoff and jitter, public so callers
/// can wrap their own provider operations.
pub mod retry;

// --- Core Types ---

pub use types::{AgentStatus, CompressionState, Message, MessageRole, StreamChunk, ToolCall};

// --- Errors ---

pub use error::{Error, Result};

// --- Backend Contract ---

pub use backend::{
    Backend, ChunkStream, GenerationParams, ScriptedBackend, StreamRequest, StreamingBuffer,
};
pub use chat_completions::{ChatCompletionsBackend, ChatCompletionsConfig};
pub use compression::{
    compress, estimate_tokens, needs_compression, CompressionConfig, CompressionReport,
    COMPRESSION_SENTINEL,
};

// --- Hooks ---

pub use hooks::{
    hook_fn, CrossAgentUpdateHook, CrossAgentUpdates, FnHook, Hook, HookDecision, HookEvent,
    HookManager, HookResult, HookType, Injection, InjectionStrategy, TaskReminderHook,
    HIGH_PRIORITY_REMINDER,
};

// --- Broadcast Channel ---

pub use broadcast::{
    BroadcastChannel, BroadcastOutcome, BroadcastQueue, BroadcastRequest, BroadcastResponse,
    BroadcastStatus, BroadcastStatusReport, ResponseMode,
};

// --- Agents and Orchestration ---

pub use agent::{Agent, CoordinationHandle};
pub use orchestrator::{
    default_novelty, AnswerRecord, FinalAnswer, NoveltyPredicate, Orchestrator,
    OrchestratorBuilder, VoteRecord,
};
pub use workflow::{
    ensure_no_collisions, is_workflow_tool, workflow_tools, WORKFLOW_TOOL_NAMES,
};

// --- Display Port ---

pub use display::{DisplayEvent, DisplaySink, LogDisplay, NullDisplay};

// --- Tools ---

pub use tools::{tool, Tool, ToolBuilder, ToolHandler, ToolSpec};

// --- Plan Store ---

pub use plan::{PlanDiff, PlanMetadata, PlanSession, PlanStatus, PlanStorage, DEFAULT_PLANS_DIR};

// --- Configuration ---

pub use config::{
    AgentConfig, AsyncSubagentsConfig, BroadcastMode, BuiltinHook, Config, CoordinationConfig,
    HookConfig, HookEventName, OrchestratorConfig,
};

// --- Server Surface ---

pub use server::{
    accumulate_stream, build_chat_completion, collision_error, completion_chunk,
    filter_external_tool_calls, resolve_model, sse_frame, ResolvedModel, SSE_DONE,
};

/// Convenience module containing the most commonly used types and functions.
/// Import with `use massgen::prelude::*;`.
pub mod prelude {
    pub use crate::{
        tool, Agent, AgentStatus, Backend, BroadcastMode, ChatCompletionsBackend,
        ChatCompletionsConfig, ChunkStream, CoordinationConfig, DisplayEvent, DisplaySink, Error,
        FinalAnswer, HookManager, HookResult, HookType, Message, Orchestrator, Result,
        ScriptedBackend, StreamChunk, ToolCall,
    };
}
