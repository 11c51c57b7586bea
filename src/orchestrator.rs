//! The orchestrator: parallel scheduler, voting, convergence, restart.
//!
//! One orchestrator drives N agents against a single user query. Every agent
//! streams chunks; the orchestrator multiplexes them into the display port
//! and into per-agent state via a classic merge-of-N-streams fan-in (one
//! forwarder task per agent feeding a single channel). Workflow tools
//! (`new_answer`, `vote`, the broadcast family) are executed through the
//! [`CoordinationHandle`] the orchestrator hands each agent, so protocol
//! rules are enforced in one place:
//!
//! - `new_answer` stores the artifact, bumps every *other* agent's restart
//!   token, and rejects calls past the per-agent cap or below the novelty
//!   floor.
//! - `vote` records the vote; a vote is valid only if the target has an
//!   answer on file.
//!
//! Convergence is re-checked whenever any vote or answer changes: once every
//! agent has voted or completed and the leading target holds at least
//! `voting_sensitivity × |agents|` votes, remaining runs are cancelled and
//! the winning answer is published. If the run drains without convergence,
//! selection falls back to the most recent valid answer. Ties break
//! deterministically: vote count, then most recent answer, then
//! lexicographic agent id.
//!
//! Failures inside one agent never terminate the others; the orchestrator
//! only stops on convergence, on all agents reaching a terminal state, or on
//! an external cancel.

use crate::agent::{Agent, CoordinationHandle};
use crate::broadcast::{BroadcastChannel, ResponseMode};
use crate::config::CoordinationConfig;
use crate::display::{DisplayEvent, DisplaySink, NullDisplay};
use crate::hooks::{
    CrossAgentUpdateHook, CrossAgentUpdates, HookManager, HookType, TaskReminderHook,
};
use crate::types::{AgentStatus, Message, StreamChunk};
use crate::workflow;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

/// Pluggable novelty check for `new_answer`: `(candidate, previous answer of
/// the same agent) -> acceptable`.
pub type NoveltyPredicate = Arc<dyn Fn(&str, Option<&str>) -> bool + Send + Sync>;

/// The default novelty predicate: rejects a candidate identical to the
/// agent's previous answer after whitespace normalisation. When
/// `requirement > 0` it also rejects candidates whose word-set similarity to
/// the previous answer exceeds `1 - requirement`.
pub fn default_novelty(requirement: f64) -> NoveltyPredicate {
    Arc::new(move |candidate, previous| {
        let Some(previous) = previous else {
            return true;
        };
        let normalize = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ");
        if normalize(candidate) == normalize(previous) {
            return false;
        }
        if requirement > 0.0 {
            return word_jaccard(candidate, previous) <= 1.0 - requirement;
        }
        true
    })
}

/// Jaccard similarity over lowercase word sets.
fn word_jaccard(a: &str, b: &str) -> f64 {
    let set_a: std::collections::HashSet<String> =
        a.split_whitespace().map(str::to_lowercase).collect();
    let set_b: std::collections::HashSet<String> =
        b.split_whitespace().map(str::to_lowercase).collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    intersection / union
}

/// One stored answer artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct AnswerRecord {
    pub content: String,
    pub at: DateTime<Utc>,
    /// Processing order, used to break timestamp ties deterministically.
    seq: u64,
}

/// One recorded vote.
#[derive(Debug, Clone, PartialEq)]
pub struct VoteRecord {
    pub target_id: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
struct AgentSlot {
    status: AgentStatus,
    current_answer: Option<AnswerRecord>,
    answer_count: u32,
    vote: Option<VoteRecord>,
    restarts: u32,
}

impl AgentSlot {
    fn new() -> Self {
        Self {
            status: AgentStatus::Waiting,
            current_answer: None,
            answer_count: 0,
            vote: None,
            restarts: 0,
        }
    }
}

/// The produced result of one orchestrated query.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalAnswer {
    pub agent_id: String,
    pub content: String,
    pub votes: usize,
    /// Whether the voting protocol converged, as opposed to falling back to
    /// the most recent valid answer at shutdown.
    pub converged: bool,
}

struct CoordinationState {
    slots: BTreeMap<String, AgentSlot>,
    seq: u64,
}

/// The shared coordination core: per-agent state, protocol enforcement, and
/// the broadcast channel. Implements [`CoordinationHandle`], which is what
/// agents call their workflow tools against.
struct Coordination {
    config: CoordinationConfig,
    agents: BTreeMap<String, Arc<Agent>>,
    channel: BroadcastChannel,
    updates: Arc<CrossAgentUpdates>,
    display: Arc<dyn DisplaySink>,
    novelty: NoveltyPredicate,
    state: Mutex<CoordinationState>,
    /// Bumped on every answer/vote change; the supervisor re-checks
    /// convergence when it ticks.
    changed_tx: watch::Sender<u64>,
}

impl Coordination {
    fn slot_snapshot(&self, agent_id: &str) -> Option<AgentSlot> {
        self.state.lock().unwrap().slots.get(agent_id).cloned()
    }

    fn mark_changed(&self) {
        self.changed_tx.send_modify(|v| *v += 1);
    }

    fn set_status(&self, agent_id: &str, status: AgentStatus) {
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.slots.get_mut(agent_id) {
            if slot.status.is_terminal() {
                return;
            }
            if slot.status != status {
                slot.status = status;
                drop(state);
                self.display.publish(DisplayEvent::StatusChange {
                    agent_id: agent_id.to_string(),
                    status,
                });
                self.mark_changed();
            }
        }
    }

    /// Store a completed agent's streamed text as its answer when it never
    /// called `new_answer`, so single-agent pass-through still selects it.
    fn record_implicit_answer(&self, agent_id: &str, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.seq += 1;
        let seq = state.seq;
        if let Some(slot) = state.slots.get_mut(agent_id) {
            if slot.current_answer.is_none() {
                slot.current_answer = Some(AnswerRecord {
                    content: text.to_string(),
                    at: Utc::now(),
                    seq,
                });
            }
        }
    }

    /// Convergence: every agent voted or terminal, and the leading target
    /// holds at least `voting_sensitivity × |agents|` votes.
    fn check_convergence(&self) -> Option<FinalAnswer> {
        let state = self.state.lock().unwrap();
        let total = state.slots.len();

        let all_settled = state
            .slots
            .values()
            .all(|slot| slot.vote.is_some() || slot.status.is_terminal());
        if !all_settled {
            return None;
        }

        let selection = Self::select(&state.slots)?;
        let needed = self.config.voting_sensitivity * total as f64;
        if (selection.votes as f64) + 1e-9 < needed {
            return None;
        }
        Some(selection)
    }

    /// Deterministic selection: highest vote count, then most recent answer,
    /// then lexicographic agent id (BTreeMap iteration order makes the last
    /// rule fall out of the comparison below).
    fn select(slots: &BTreeMap<String, AgentSlot>) -> Option<FinalAnswer> {
        let mut votes_by_target: HashMap<&str, usize> = HashMap::new();
        for slot in slots.values() {
            if let Some(vote) = &slot.vote {
                *votes_by_target.entry(vote.target_id.as_str()).or_insert(0) += 1;
            }
        }

        let mut best: Option<(&str, &AnswerRecord, usize)> = None;
        for (agent_id, slot) in slots {
            let Some(answer) = &slot.current_answer else {
                continue;
            };
            let votes = votes_by_target.get(agent_id.as_str()).copied().unwrap_or(0);
            let better = match best {
                None => true,
                Some((_, best_answer, best_votes)) => {
                    votes > best_votes || (votes == best_votes && answer.seq > best_answer.seq)
                }
            };
            if better {
                best = Some((agent_id, answer, votes));
            }
        }

        best.map(|(agent_id, answer, votes)| FinalAnswer {
            agent_id: agent_id.to_string(),
            content: answer.content.clone(),
            votes,
            converged: false,
        })
    }

    /// Fallback selection at shutdown: most recent valid answer.
    fn select_fallback(&self) -> Option<FinalAnswer> {
        Self::select(&self.state.lock().unwrap().slots)
    }

    /// Summaries of the answers on file, for restart context and
    /// post-evaluation prompts.
    fn answer_summaries(&self) -> Vec<(String, String)> {
        let state = self.state.lock().unwrap();
        state
            .slots
            .iter()
            .filter_map(|(id, slot)| {
                slot.current_answer
                    .as_ref()
                    .map(|a| (id.clone(), a.content.clone()))
            })
            .collect()
    }

    /// Clear all per-query state ahead of a fresh run.
    fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        for slot in state.slots.values_mut() {
            *slot = AgentSlot::new();
        }
        state.seq = 0;
    }

    fn restarts_of(&self, agent_id: &str) -> u32 {
        self.slot_snapshot(agent_id).map_or(0, |s| s.restarts)
    }

    fn note_restart(&self, agent_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.slots.get_mut(agent_id) {
            slot.restarts += 1;
            slot.status = AgentStatus::Working;
        }
    }
}

#[async_trait]
impl CoordinationHandle for Coordination {
    async fn submit_answer(&self, agent_id: &str, content: &str) -> String {
        if content.trim().is_empty() {
            return workflow::error_payload("EMPTY_ANSWER", "new_answer requires content");
        }

        let answer_number = {
            let mut state = self.state.lock().unwrap();
            state.seq += 1;
            let seq = state.seq;
            let Some(slot) = state.slots.get_mut(agent_id) else {
                return workflow::error_payload("UNKNOWN_AGENT", agent_id);
            };

            if slot.answer_count >= self.config.max_new_answers_per_agent {
                return workflow::error_payload(
                    "ANSWER_LIMIT",
                    format!(
                        "answer limit reached ({} of {})",
                        slot.answer_count, self.config.max_new_answers_per_agent
                    ),
                );
            }

            let previous = slot.current_answer.as_ref().map(|a| a.content.as_str());
            if !(self.novelty)(content, previous) {
                return workflow::error_payload(
                    "NOT_NOVEL",
                    "the new answer is too similar to your previous one",
                );
            }

            slot.current_answer = Some(AnswerRecord {
                content: content.to_string(),
                at: Utc::now(),
                seq,
            });
            slot.answer_count += 1;
            slot.status = AgentStatus::Answered;
            slot.answer_count
        };

        self.display.publish(DisplayEvent::AnswerSubmitted {
            agent_id: agent_id.to_string(),
            answer_number,
            content: content.to_string(),
        });
        self.display.publish(DisplayEvent::OrchestratorNote {
            text: format!("agent {} submitted answer #{}", agent_id, answer_number),
        });

        // Peers see the new answer on their next turn.
        for (peer_id, peer) in &self.agents {
            if peer_id != agent_id {
                if self.config.async_subagents.enabled {
                    self.updates.push_for(
                        peer_id.clone(),
                        format!("Peer update: agent {} submitted a new answer.", agent_id),
                    );
                }
                peer.cancel(format!("peer answer from {}", agent_id));
            }
        }

        self.mark_changed();
        workflow::ok_payload(json!({
            "status": "success",
            "answer_number": answer_number,
        }))
    }

    async fn cast_vote(&self, agent_id: &str, target_id: &str, reason: &str) -> String {
        {
            let mut state = self.state.lock().unwrap();
            let target_has_answer = state
                .slots
                .get(target_id)
                .is_some_and(|slot| slot.current_answer.is_some());
            if !target_has_answer {
                return workflow::error_payload(
                    "INVALID_VOTE",
                    format!("vote target {} has no answer on file", target_id),
                );
            }
            let Some(slot) = state.slots.get_mut(agent_id) else {
                return workflow::error_payload("UNKNOWN_AGENT", agent_id);
            };
            slot.vote = Some(VoteRecord {
                target_id: target_id.to_string(),
                reason: reason.to_string(),
            });
            slot.status = AgentStatus::Voting;
        }

        self.display.publish(DisplayEvent::VoteCast {
            voter_id: agent_id.to_string(),
            target_id: target_id.to_string(),
            reason: reason.to_string(),
        });
        self.mark_changed();
        workflow::ok_payload(json!({"status": "success", "voted_for": target_id}))
    }

    async fn ask_others(&self, agent_id: &str, question: &str, wait: Option<bool>) -> String {
        // Deadlock guard: answer the pending question first.
        if let Some(pending) = self.channel.pending_for(agent_id) {
            return workflow::pending_broadcast_payload(&pending.sender_id, &pending.question);
        }

        let request_id = match self
            .channel
            .create(agent_id, question, ResponseMode::Inline, None)
            .await
        {
            Ok(id) => id,
            Err(e) => return workflow::error_payload("BROADCAST_REJECTED", e.to_string()),
        };
        if let Err(e) = self.channel.inject(&request_id).await {
            return workflow::error_payload("BROADCAST_REJECTED", e.to_string());
        }

        let wait = wait.unwrap_or(self.config.broadcast_wait_by_default);
        if !wait {
            return workflow::ok_payload(json!({
                "request_id": request_id,
                "status": "pending",
            }));
        }

        match self.channel.wait(&request_id, None).await {
            Ok(outcome) => workflow::ok_payload(json!({
                "status": outcome.status,
                "responses": outcome.responses.iter().map(|r| json!({
                    "responder_id": r.responder_id,
                    "content": r.content,
                    "is_human": r.is_human,
                })).collect::<Vec<_>>(),
            })),
            Err(e) => workflow::error_payload("BROADCAST_FAILED", e.to_string()),
        }
    }

    async fn respond_to_broadcast(
        &self,
        agent_id: &str,
        request_id: &str,
        answer: &str,
    ) -> String {
        match self.channel.collect(request_id, agent_id, answer, false).await {
            Ok(()) => workflow::ok_payload(json!({
                "status": "success",
                "message": "response submitted",
            })),
            Err(e) => workflow::error_payload("BROADCAST_FAILED", e.to_string()),
        }
    }

    async fn broadcast_status(&self, _agent_id: &str, request_id: &str) -> String {
        match self.channel.status(request_id).await {
            Ok(report) => workflow::ok_payload(json!({
                "status": report.status,
                "response_count": report.received,
                "expected_count": report.expected,
                "waiting_for": report.waiting_for,
            })),
            Err(e) => workflow::error_payload("BROADCAST_FAILED", e.to_string()),
        }
    }

    async fn broadcast_responses(&self, _agent_id: &str, request_id: &str) -> String {
        match self.channel.responses(request_id).await {
            Ok(outcome) => workflow::ok_payload(json!({
                "status": outcome.status,
                "responses": outcome.responses.iter().map(|r| json!({
                    "responder_id": r.responder_id,
                    "content": r.content,
                    "is_human": r.is_human,
                })).collect::<Vec<_>>(),
            })),
            Err(e) => workflow::error_payload("BROADCAST_FAILED", e.to_string()),
        }
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

/// Builder for [`Orchestrator`]. Agents are taken by value so the builder
/// can finish wiring (hooks, coordination tools, session ids) before they
/// are shared.
pub struct OrchestratorBuilder {
    config: CoordinationConfig,
    agents: Vec<Agent>,
    display: Arc<dyn DisplaySink>,
    hooks: Option<Arc<HookManager>>,
    global_hook_configs: Vec<crate::config::HookConfig>,
    agent_hook_configs: Vec<(String, crate::config::HookConfig)>,
    session_id: String,
    novelty: Option<NoveltyPredicate>,
}

impl OrchestratorBuilder {
    pub fn agent(mut self, agent: Agent) -> Self {
        self.agents.push(agent);
        self
    }

    /// Take the hook registrations from a session config: top-level `hooks:`
    /// registers globally, each agent block's `hooks:` registers for that
    /// agent only.
    pub fn config_hooks(mut self, config: &crate::config::Config) -> Self {
        self.global_hook_configs.extend(config.hooks.iter().cloned());
        for agent in config.agent_configs() {
            for hook in &agent.hooks {
                self.agent_hook_configs
                    .push((agent.id.clone(), hook.clone()));
            }
        }
        self
    }

    pub fn display(mut self, display: Arc<dyn DisplaySink>) -> Self {
        self.display = display;
        self
    }

    pub fn hooks(mut self, hooks: Arc<HookManager>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn novelty_predicate(mut self, predicate: NoveltyPredicate) -> Self {
        self.novelty = Some(predicate);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        if self.agents.is_empty() {
            return Err(Error::config("no agents configured"));
        }
        let mut ids = std::collections::HashSet::new();
        for agent in &self.agents {
            if !ids.insert(agent.id().to_string()) {
                return Err(Error::config(format!("duplicate agent id: {}", agent.id())));
            }
        }

        let orchestrator_id = format!("orchestrator-{}", uuid::Uuid::new_v4());
        let hooks = self.hooks.unwrap_or_else(|| Arc::new(HookManager::new()));
        let updates = Arc::new(CrossAgentUpdates::new());

        // Mid-stream peer updates are wired automatically when async
        // sub-agents are on; everything else registers through config.
        if self.config.async_subagents.enabled {
            hooks.register_global(
                HookType::PostToolUse,
                Arc::new(CrossAgentUpdateHook::new(
                    updates.clone(),
                    self.config.async_subagents.injection_strategy,
                )),
            );
        }
        for hook_config in &self.global_hook_configs {
            let (hook_type, hook) = instantiate_builtin(hook_config, &updates, &self.config);
            hooks.register_global(hook_type, hook);
        }
        for (agent_id, hook_config) in &self.agent_hook_configs {
            let (hook_type, hook) = instantiate_builtin(hook_config, &updates, &self.config);
            hooks.register_for_agent(agent_id.clone(), hook_type, hook);
        }

        let workflow_specs = workflow::workflow_tools(
            self.config.broadcast,
            self.config.broadcast_wait_by_default,
        );

        let mut agents: BTreeMap<String, Arc<Agent>> = BTreeMap::new();
        let mut roster = HashMap::new();
        for agent in self.agents {
            agent.set_hooks(hooks.clone());
            agent.set_display(self.display.clone());
            agent.set_session(self.session_id.clone(), orchestrator_id.clone());
            roster.insert(agent.id().to_string(), agent.broadcast_queue());
            agents.insert(agent.id().to_string(), Arc::new(agent));
        }

        let channel = BroadcastChannel::new(&self.config, roster, self.display.clone());
        let slots = agents
            .keys()
            .map(|id| (id.clone(), AgentSlot::new()))
            .collect();
        let (changed_tx, _) = watch::channel(0u64);

        let coordination = Arc::new(Coordination {
            config: self.config.clone(),
            agents: agents.clone(),
            channel,
            updates,
            display: self.display.clone(),
            novelty: self
                .novelty
                .unwrap_or_else(|| default_novelty(self.config.answer_novelty_requirement)),
            state: Mutex::new(CoordinationState { slots, seq: 0 }),
            changed_tx,
        });

        for agent in agents.values() {
            agent.set_coordination(coordination.clone(), workflow_specs.clone());
        }

        Ok(Orchestrator {
            config: self.config,
            agents,
            coordination,
            display: self.display,
            session_id: self.session_id,
            orchestrator_id,
            user_cancel: AtomicBool::new(false),
        })
    }
}

/// Resolve a config hook registration to a live hook instance.
fn instantiate_builtin(
    hook_config: &crate::config::HookConfig,
    updates: &Arc<CrossAgentUpdates>,
    config: &CoordinationConfig,
) -> (HookType, Arc<dyn crate::hooks::Hook>) {
    let hook_type = match hook_config.event {
        crate::config::HookEventName::PreToolUse => HookType::PreToolUse,
        crate::config::HookEventName::PostToolUse => HookType::PostToolUse,
    };
    let hook: Arc<dyn crate::hooks::Hook> = match hook_config.builtin {
        crate::config::BuiltinHook::CrossAgentUpdates => Arc::new(CrossAgentUpdateHook::new(
            updates.clone(),
            config.async_subagents.injection_strategy,
        )),
        crate::config::BuiltinHook::HighPriorityTaskReminder => Arc::new(TaskReminderHook::new()),
    };
    (hook_type, hook)
}

/// The multi-agent scheduler for one session.
pub struct Orchestrator {
    config: CoordinationConfig,
    agents: BTreeMap<String, Arc<Agent>>,
    coordination: Arc<Coordination>,
    display: Arc<dyn DisplaySink>,
    session_id: String,
    orchestrator_id: String,
    user_cancel: AtomicBool,
}

impl Orchestrator {
    pub fn builder(config: CoordinationConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            agents: Vec::new(),
            display: Arc::new(NullDisplay),
            hooks: None,
            global_hook_configs: Vec::new(),
            agent_hook_configs: Vec::new(),
            session_id: uuid::Uuid::new_v4().to_string(),
            novelty: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn id(&self) -> &str {
        &self.orchestrator_id
    }

    /// Current status of one agent, for UIs and tests.
    pub fn agent_status(&self, agent_id: &str) -> Option<AgentStatus> {
        self.coordination.slot_snapshot(agent_id).map(|s| s.status)
    }

    /// `(answer_count, vote)` snapshot of one agent.
    pub fn agent_record(&self, agent_id: &str) -> Option<(u32, Option<VoteRecord>)> {
        self.coordination
            .slot_snapshot(agent_id)
            .map(|s| (s.answer_count, s.vote))
    }

    /// External cancel: stop all agents and fall back to the best answer on
    /// file.
    pub fn cancel(&self) {
        self.user_cancel.store(true, Ordering::SeqCst);
        for agent in self.agents.values() {
            agent.cancel("user cancel");
        }
        self.coordination.mark_changed();
    }

    /// Drive all agents against `query` until convergence (or drain) and
    /// return the winning answer. One invocation per user query; state from
    /// a previous query is cleared.
    pub async fn run(&self, query: &str) -> Result<FinalAnswer> {
        self.coordination.reset();
        self.user_cancel.store(false, Ordering::SeqCst);

        let (tx, mut rx) = mpsc::channel::<(String, StreamChunk)>(256);
        let shutdown = Arc::new(AtomicBool::new(false));

        for (agent_id, agent) in &self.agents {
            let forwarder = AgentForwarder {
                agent: agent.clone(),
                coordination: self.coordination.clone(),
                config: self.config.clone(),
                query: query.to_string(),
                tx: tx.clone(),
                shutdown: shutdown.clone(),
            };
            self.coordination.set_status(agent_id, AgentStatus::Working);
            tokio::spawn(forwarder.run());
        }
        drop(tx);

        let mut changed_rx = self.coordination.changed_tx.subscribe();
        let mut streamed_text: HashMap<String, String> = HashMap::new();
        let mut winner: Option<FinalAnswer> = None;

        loop {
            tokio::select! {
                maybe_chunk = rx.recv() => {
                    let Some((agent_id, chunk)) = maybe_chunk else {
                        break; // every forwarder has exited
                    };
                    self.route_chunk(&agent_id, chunk, &mut streamed_text);
                }
                _ = changed_rx.changed() => {}
            }

            if self.user_cancel.load(Ordering::SeqCst) {
                break;
            }
            if let Some(mut selection) = self.coordination.check_convergence() {
                selection.converged = true;
                winner = Some(selection);
                break;
            }
        }

        // Stop whatever is still running.
        shutdown.store(true, Ordering::SeqCst);
        for agent in self.agents.values() {
            agent.cancel("coordination complete");
        }

        let mut winner = match winner.or_else(|| self.coordination.select_fallback()) {
            Some(winner) => winner,
            None => {
                return Err(Error::other(
                    "no agent produced an answer before shutdown",
                ))
            }
        };

        if let Some(template) = self.config.post_evaluation_template.clone() {
            if let Some(refined) = self.post_evaluate(&winner, query, &template).await {
                winner.content = refined;
            }
        }

        self.display.publish(DisplayEvent::FinalAnswer {
            agent_id: winner.agent_id.clone(),
            content: winner.content.clone(),
            votes: winner.votes,
        });

        Ok(winner)
    }

    fn route_chunk(
        &self,
        agent_id: &str,
        chunk: StreamChunk,
        streamed_text: &mut HashMap<String, String>,
    ) {
        // Misbehaving stream guard: once terminal, only the trailing error
        // and `done` are routed.
        let terminal = self
            .agent_status(agent_id)
            .is_some_and(|s| s.is_terminal());
        if terminal
            && !matches!(chunk, StreamChunk::Done | StreamChunk::Error { .. })
        {
            return;
        }

        if let StreamChunk::Content { content } = &chunk {
            streamed_text
                .entry(agent_id.to_string())
                .or_default()
                .push_str(content);
        }

        self.display.publish(DisplayEvent::AgentChunk {
            agent_id: agent_id.to_string(),
            chunk: chunk.clone(),
        });

        match chunk {
            StreamChunk::Done => {
                if !terminal {
                    if let Some(text) = streamed_text.get(agent_id) {
                        self.coordination.record_implicit_answer(agent_id, text);
                    }
                    self.coordination
                        .set_status(agent_id, AgentStatus::Completed);
                }
            }
            StreamChunk::Error { message, .. } => {
                // The forwarder records the terminal status (error vs
                // canceled); the supervisor only surfaces the event.
                self.display.publish(DisplayEvent::AgentError {
                    agent_id: agent_id.to_string(),
                    message,
                });
            }
            _ => {}
        }
    }

    /// Give the winner one extra turn over the question and all peer
    /// answers, using the configured template.
    async fn post_evaluate(
        &self,
        winner: &FinalAnswer,
        query: &str,
        template: &str,
    ) -> Option<String> {
        let agent = self.agents.get(&winner.agent_id)?;

        let answers = self
            .coordination
            .answer_summaries()
            .iter()
            .map(|(id, content)| format!("- agent {}: {}", id, content))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = template
            .replace("{question}", query)
            .replace("{answers}", &answers);

        let mut messages = Vec::new();
        if let Some(system) = agent.system_prompt() {
            messages.push(Message::system(system));
        }
        messages.push(Message::user(prompt));

        self.display.publish(DisplayEvent::OrchestratorNote {
            text: format!("post-evaluation turn for {}", winner.agent_id),
        });

        let mut stream = agent.clone().run(messages);
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            if let StreamChunk::Content { content } = &chunk {
                text.push_str(content);
            }
            self.display.publish(DisplayEvent::AgentChunk {
                agent_id: winner.agent_id.clone(),
                chunk,
            });
        }

        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }
}

/// Per-agent forwarder task: runs the agent, relays its chunks tagged with
/// the agent id, and restarts it (up to `max_restarts`) when its restart
/// token advances mid-run because a peer's answer changed the context.
struct AgentForwarder {
    agent: Arc<Agent>,
    coordination: Arc<Coordination>,
    config: CoordinationConfig,
    query: String,
    tx: mpsc::Sender<(String, StreamChunk)>,
    shutdown: Arc<AtomicBool>,
}

impl AgentForwarder {
    async fn run(self) {
        let agent_id = self.agent.id().to_string();
        let mut messages = self.initial_messages();

        loop {
            let token_before = self.agent.restart_token();
            let mut stream = self.agent.clone().run(messages.clone());
            let mut final_error: Option<StreamChunk> = None;

            while let Some(chunk) = stream.next().await {
                match &chunk {
                    StreamChunk::Done => break,
                    StreamChunk::Error { .. } => {
                        // Hold errors back until we know whether this run is
                        // about to be restarted rather than surfaced.
                        final_error = Some(chunk);
                        continue;
                    }
                    _ => {}
                }
                if self.tx.send((agent_id.clone(), chunk)).await.is_err() {
                    return; // supervisor is gone
                }
            }

            let cancelled = self.agent.restart_token() != token_before;
            let shutting_down = self.shutdown.load(Ordering::SeqCst);
            let restarts = self.coordination.restarts_of(&agent_id);

            if cancelled && !shutting_down && restarts < self.config.max_restarts {
                self.coordination.note_restart(&agent_id);
                let note = StreamChunk::status(format!(
                    "restart {} of {}",
                    restarts + 1,
                    self.config.max_restarts
                ));
                if self.tx.send((agent_id.clone(), note)).await.is_err() {
                    return;
                }
                messages = self.restart_messages();
                continue;
            }

            if let Some(error) = final_error {
                if !shutting_down {
                    let _ = self.tx.send((agent_id.clone(), error)).await;
                }
                let status = if cancelled {
                    AgentStatus::Canceled
                } else {
                    AgentStatus::Error
                };
                self.coordination.set_status(&agent_id, status);
            }
            let _ = self.tx.send((agent_id.clone(), StreamChunk::Done)).await;
            return;
        }
    }

    fn initial_messages(&self) -> Vec<Message> {
        let mut messages = Vec::new();
        messages.push(Message::system(self.system_text()));
        messages.push(Message::user(self.query.clone()));
        messages
    }

    /// Restarted agents get a fresh user turn embedding the peer answers on
    /// file at restart time.
    fn restart_messages(&self) -> Vec<Message> {
        let mut messages = Vec::new();
        messages.push(Message::system(self.system_text()));

        let summaries = self.coordination.answer_summaries();
        let peers: Vec<String> = summaries
            .iter()
            .filter(|(id, _)| id != self.agent.id())
            .map(|(id, content)| format!("- agent {}: {}", id, content))
            .collect();

        let mut turn = self.query.clone();
        if !peers.is_empty() {
            turn.push_str("\n\nAnswers currently on file from other agents:\n");
            turn.push_str(&peers.join("\n"));
            turn.push_str(
                "\n\nReview them, then either submit an improved answer with new_answer \
                 or vote for the best one with vote.",
            );
        }
        messages.push(Message::user(turn));
        messages
    }

    fn system_text(&self) -> String {
        let peers: Vec<&str> = self
            .coordination
            .agents
            .keys()
            .map(String::as_str)
            .filter(|id| *id != self.agent.id())
            .collect();

        let mut text = String::new();
        if let Some(prompt) = self.agent.system_prompt() {
            text.push_str(prompt);
            text.push_str("\n\n");
        }
        text.push_str(&format!(
            "You are agent {} working alongside agents [{}] on the same question. \
             Submit your answer with the new_answer tool, and once you believe the best \
             available answer exists, vote for its author with the vote tool.",
            self.agent.id(),
            peers.join(", ")
        ));
        text
    }
}
