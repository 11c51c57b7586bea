//! The display event port.
//!
//! Every user-visible event flows through one [`DisplaySink`]. The core
//! always submits whole events, never partial fields, and treats the sink as
//! append-only; ordering within one agent's chunks matches the order the
//! backend produced them. UIs (TUI, web) implement the trait and render;
//! the core ships [`NullDisplay`] for headless runs and [`LogDisplay`] which
//! forwards everything to the `log` facade.
//!
//! The sink also carries the two interactive capabilities the kernel needs
//! from a UI: confirming an `ask` hook decision and prompting the human
//! participant for a broadcast response. Both default to non-interactive
//! behavior so headless runs never block.

use crate::types::{AgentStatus, StreamChunk};
use async_trait::async_trait;

/// One user-visible event.
#[derive(Debug, Clone, PartialEq)]
pub enum DisplayEvent {
    /// A chunk from one agent's stream.
    AgentChunk {
        agent_id: String,
        chunk: StreamChunk,
    },
    /// An agent's lifecycle status changed.
    StatusChange {
        agent_id: String,
        status: AgentStatus,
    },
    /// An agent stored a new answer artifact.
    AnswerSubmitted {
        agent_id: String,
        answer_number: u32,
        content: String,
    },
    /// An agent cast a vote.
    VoteCast {
        voter_id: String,
        target_id: String,
        reason: String,
    },
    /// A broadcast question was injected.
    BroadcastQuestion {
        request_id: String,
        sender_id: String,
        question: String,
    },
    /// Synthetic orchestrator commentary (restarts, convergence progress).
    OrchestratorNote { text: String },
    /// The winning answer.
    FinalAnswer {
        agent_id: String,
        content: String,
        votes: usize,
    },
    /// A failure surfaced from one agent; other agents keep running.
    AgentError { agent_id: String, message: String },
}

/// Abstract sink all components emit user-visible events to.
#[async_trait]
pub trait DisplaySink: Send + Sync {
    /// Append one event. Implementations must not reorder events of a single
    /// agent.
    fn publish(&self, event: DisplayEvent);

    /// Resolve an `ask` hook decision. Headless implementations return
    /// `true`, degrading `ask` to `allow`.
    async fn confirm(&self, agent_id: &str, tool_name: &str, reason: &str) -> bool {
        let _ = (agent_id, tool_name, reason);
        true
    }

    /// Prompt the human participant for a broadcast response. `None` means
    /// the human skipped (or no UI is attached).
    async fn prompt_broadcast(&self, sender_id: &str, question: &str) -> Option<String> {
        let _ = (sender_id, question);
        None
    }
}

/// Sink that drops every event. Used in headless and test runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDisplay;

#[async_trait]
impl DisplaySink for NullDisplay {
    fn publish(&self, _event: DisplayEvent) {}
}

/// Sink that forwards events to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDisplay;

#[async_trait]
impl DisplaySink for LogDisplay {
    fn publish(&self, event: DisplayEvent) {
        match &event {
            DisplayEvent::AgentChunk { agent_id, chunk } => {
                log::debug!("[{}] {:?}", agent_id, chunk)
            }
            DisplayEvent::StatusChange { agent_id, status } => {
                log::info!("[{}] status -> {:?}", agent_id, status)
            }
            DisplayEvent::AnswerSubmitted {
                agent_id,
                answer_number,
                ..
            } => log::info!("[{}] submitted answer #{}", agent_id, answer_number),
            DisplayEvent::VoteCast {
                voter_id,
                target_id,
                reason,
            } => log::info!("[{}] voted for {} ({})", voter_id, target_id, reason),
            DisplayEvent::BroadcastQuestion {
                sender_id,
                question,
                ..
            } => log::info!("[broadcast] {} asks: {}", sender_id, question),
            DisplayEvent::OrchestratorNote { text } => log::info!("[orchestrator] {}", text),
            DisplayEvent::FinalAnswer {
                agent_id, votes, ..
            } => log::info!("[final] {} selected with {} vote(s)", agent_id, votes),
            DisplayEvent::AgentError { agent_id, message } => {
                log::warn!("[{}] error: {}", agent_id, message)
            }
        }
    }
}
