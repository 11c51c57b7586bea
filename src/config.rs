//! Configuration tree for a coordination session.
//!
//! The tree mirrors the recognised top-level keys of a session config file:
//! an `agent` (or `agents`) block, the `orchestrator.coordination` knobs that
//! drive voting/convergence, broadcasts and restarts, and hook registrations
//! at global (`hooks`) or per-agent (`backend.hooks`) scope. Loading the
//! file format itself (YAML) is the caller's concern; this module owns the
//! deserialized shape, its defaults, and fail-fast validation.
//!
//! Validation runs once at session start: an out-of-range
//! `voting_sensitivity`, an empty agent list, a duplicate agent id or an
//! unknown hook registration all fail before any backend stream begins.

use crate::hooks::InjectionStrategy;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Who participates in broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastMode {
    /// Broadcast tools are not advertised.
    #[default]
    Off,
    /// Agents ask and answer each other.
    Agents,
    /// Agents plus a human participant prompted through the display port.
    Human,
}

/// Hook points nameable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookEventName {
    PreToolUse,
    PostToolUse,
}

/// Built-in hooks registrable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinHook {
    /// Mid-stream delivery of accumulated cross-agent updates.
    CrossAgentUpdates,
    /// Reminder after a high-priority task completes.
    HighPriorityTaskReminder,
}

/// One hook registration from config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookConfig {
    pub event: HookEventName,
    pub builtin: BuiltinHook,
}

/// Async sub-agent result delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncSubagentsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_injection_strategy")]
    pub injection_strategy: InjectionStrategy,
}

impl Default for AsyncSubagentsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            injection_strategy: default_injection_strategy(),
        }
    }
}

fn default_injection_strategy() -> InjectionStrategy {
    InjectionStrategy::ToolResult
}

/// The voting/convergence and broadcast knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Fraction of agents that must vote for the same target to converge.
    pub voting_sensitivity: f64,
    /// Cap on `new_answer` calls per agent.
    pub max_new_answers_per_agent: u32,
    /// Textual-similarity floor for new answers; 0 disables the similarity
    /// check (identical answers are still rejected).
    pub answer_novelty_requirement: f64,
    pub broadcast: BroadcastMode,
    /// Milliseconds a broadcast `wait` blocks before timing out.
    pub broadcast_timeout: u64,
    pub max_broadcasts_per_agent: u32,
    /// Whether `ask_others` blocks for responses by default.
    pub broadcast_wait_by_default: bool,
    /// How often an agent is restarted when peer answers change under it.
    pub max_restarts: u32,
    /// Prompt template for the winner's optional extra turn. `{question}`
    /// and `{answers}` placeholders are substituted; `None` disables the
    /// post-evaluation phase.
    pub post_evaluation_template: Option<String>,
    pub async_subagents: AsyncSubagentsConfig,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            voting_sensitivity: 0.5,
            max_new_answers_per_agent: 3,
            answer_novelty_requirement: 0.0,
            broadcast: BroadcastMode::Off,
            broadcast_timeout: 60_000,
            max_broadcasts_per_agent: 2,
            broadcast_wait_by_default: true,
            max_restarts: 3,
            post_evaluation_template: None,
            async_subagents: AsyncSubagentsConfig::default(),
        }
    }
}

/// Orchestrator block: coordination plus storage paths.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub coordination: CoordinationConfig,
    pub snapshot_storage: Option<PathBuf>,
    pub agent_temporary_workspace: Option<PathBuf>,
}

/// One agent's configuration block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub context_window: Option<usize>,
    /// Per-agent hook registrations (`backend.hooks` in the file format).
    #[serde(default)]
    pub hooks: Vec<HookConfig>,
}

impl AgentConfig {
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            base_url: None,
            api_key: None,
            system_prompt: None,
            temperature: None,
            max_tokens: None,
            context_window: None,
            hooks: Vec::new(),
        }
    }
}

/// The recognised top-level configuration tree.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Single-agent shorthand; merged ahead of `agents`.
    pub agent: Option<AgentConfig>,
    pub agents: Vec<AgentConfig>,
    pub orchestrator: OrchestratorConfig,
    /// Global hook registrations.
    pub hooks: Vec<HookConfig>,
}

impl Config {
    /// All agent blocks in declaration order (`agent` first, then `agents`).
    pub fn agent_configs(&self) -> Vec<&AgentConfig> {
        self.agent.iter().chain(self.agents.iter()).collect()
    }

    pub fn coordination(&self) -> &CoordinationConfig {
        &self.orchestrator.coordination
    }

    /// Fail-fast validation, run once at session start.
    pub fn validate(&self) -> Result<()> {
        let agents = self.agent_configs();
        if agents.is_empty() {
            return Err(Error::config("no agents configured"));
        }

        let mut seen = std::collections::HashSet::new();
        for agent in &agents {
            if agent.id.trim().is_empty() {
                return Err(Error::config("agent id cannot be empty"));
            }
            if agent.model.trim().is_empty() {
                return Err(Error::config(format!(
                    "agent {} has no model configured",
                    agent.id
                )));
            }
            if !seen.insert(agent.id.as_str()) {
                return Err(Error::config(format!("duplicate agent id: {}", agent.id)));
            }
            if let Some(t) = agent.temperature {
                if !(0.0..=2.0).contains(&t) {
                    return Err(Error::config(format!(
                        "agent {}: temperature must be between 0.0 and 2.0",
                        agent.id
                    )));
                }
            }
        }

        let coordination = self.coordination();
        if !(0.0..=1.0).contains(&coordination.voting_sensitivity)
            || coordination.voting_sensitivity == 0.0
        {
            return Err(Error::config(
                "voting_sensitivity must be in (0.0, 1.0]",
            ));
        }
        if !(0.0..=1.0).contains(&coordination.answer_novelty_requirement) {
            return Err(Error::config(
                "answer_novelty_requirement must be in [0.0, 1.0]",
            ));
        }
        if coordination.max_new_answers_per_agent == 0 {
            return Err(Error::config("max_new_answers_per_agent must be at least 1"));
        }
        if coordination.max_broadcasts_per_agent == 0 {
            return Err(Error::config("max_broadcasts_per_agent must be at least 1"));
        }

        Ok(())
    }
}
