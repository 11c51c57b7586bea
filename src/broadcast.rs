//! Broadcast channel for agent-to-agent and agent-to-human communication.
//!
//! The channel manages the lifecycle of question/response exchanges:
//!
//! 1. [`BroadcastChannel::create`] allocates a request (rate-limited and
//!    deadlock-guarded).
//! 2. [`BroadcastChannel::inject`] enqueues the question into every agent
//!    except the sender, and in human mode prompts the human through the
//!    display port (blocking until response or timeout).
//! 3. [`BroadcastChannel::collect`] records responses and wakes waiters when
//!    all expected responses arrived.
//! 4. [`BroadcastChannel::wait`] blocks until completion, timeout, or cancel.
//! 5. Status/response snapshots and [`BroadcastChannel::cleanup`].
//!
//! State is scoped to one orchestrator instance and guarded by one internal
//! lock, never a process-wide singleton. The channel is composed from the
//! orchestrator's parts (the agent roster, the coordination config, the
//! display port), not from the orchestrator object itself.
//!
//! **Deadlock avoidance**: before an agent may create a new broadcast, the
//! channel inspects the agent's own queue; a pending request from another
//! agent rejects the create, and the agent must `respond_to_broadcast` first.
//! This makes the "wait for each other" cycle impossible.
//!
//! **Timeouts**: `wait` returns with status `timeout` after the deadline;
//! responses that arrive later are still recorded but do not wake waiters.

use crate::config::{BroadcastMode, CoordinationConfig};
use crate::display::{DisplayEvent, DisplaySink};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

/// Lifecycle of one broadcast request. Transitions are monotonic: once a
/// terminal state is reached the status never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastStatus {
    Pending,
    Collecting,
    Complete,
    Timeout,
    Cancelled,
}

impl BroadcastStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BroadcastStatus::Complete | BroadcastStatus::Timeout | BroadcastStatus::Cancelled
        )
    }
}

/// How the recipients should respond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    /// Answer inside the current turn.
    #[default]
    Inline,
    /// Answer at the next turn boundary.
    Background,
}

/// One question broadcast to the other agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastRequest {
    pub id: String,
    pub sender_id: String,
    pub question: String,
    pub created_at: DateTime<Utc>,
    pub timeout_ms: u64,
    pub response_mode: ResponseMode,
    pub expected_count: usize,
    pub received_count: usize,
    pub status: BroadcastStatus,
}

/// One collected response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastResponse {
    pub request_id: String,
    pub responder_id: String,
    pub content: String,
    pub at: DateTime<Utc>,
    pub is_human: bool,
}

/// Status snapshot returned by [`BroadcastChannel::status`].
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastStatusReport {
    pub status: BroadcastStatus,
    pub received: usize,
    pub expected: usize,
    /// Agents that have not responded yet.
    pub waiting_for: Vec<String>,
}

/// Outcome of [`BroadcastChannel::wait`] / [`BroadcastChannel::responses`].
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastOutcome {
    pub status: BroadcastStatus,
    pub responses: Vec<BroadcastResponse>,
}

/// One agent's inbox of pending broadcast questions. The agent runtime holds
/// the same handle and drains it at turn boundaries; broadcasts are delivered
/// in the order the channel received the `inject` calls.
#[derive(Debug, Default)]
pub struct BroadcastQueue {
    queue: std::sync::Mutex<VecDeque<BroadcastRequest>>,
}

impl BroadcastQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, request: BroadcastRequest) {
        self.queue.lock().unwrap().push_back(request);
    }

    /// The oldest pending request, without consuming it.
    pub fn peek(&self) -> Option<BroadcastRequest> {
        self.queue.lock().unwrap().front().cloned()
    }

    pub fn pop(&self) -> Option<BroadcastRequest> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn drain(&self) -> Vec<BroadcastRequest> {
        self.queue.lock().unwrap().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }
}

struct RequestState {
    request: BroadcastRequest,
    responses: Vec<BroadcastResponse>,
    status_tx: watch::Sender<BroadcastStatus>,
}

impl RequestState {
    /// Advance the status; terminal states are never left.
    fn advance(&mut self, next: BroadcastStatus) {
        if self.request.status.is_terminal() {
            return;
        }
        self.request.status = next;
        let _ = self.status_tx.send(next);
    }
}

/// The question/response bus shared by all agents of one orchestrator.
pub struct BroadcastChannel {
    mode: BroadcastMode,
    default_timeout_ms: u64,
    max_broadcasts_per_agent: usize,
    roster: HashMap<String, Arc<BroadcastQueue>>,
    display: Arc<dyn DisplaySink>,
    inner: Mutex<HashMap<String, RequestState>>,
}

impl BroadcastChannel {
    /// Compose the channel from the orchestrator's parts: the coordination
    /// config, the agent roster (id → queue handle), and the display port.
    pub fn new(
        config: &CoordinationConfig,
        roster: HashMap<String, Arc<BroadcastQueue>>,
        display: Arc<dyn DisplaySink>,
    ) -> Self {
        Self {
            mode: config.broadcast,
            default_timeout_ms: config.broadcast_timeout,
            max_broadcasts_per_agent: config.max_broadcasts_per_agent as usize,
            roster,
            display,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// The oldest broadcast waiting in `agent_id`'s queue, if any. Used by
    /// the deadlock guard before creating a new broadcast.
    pub fn pending_for(&self, agent_id: &str) -> Option<BroadcastRequest> {
        self.roster.get(agent_id).and_then(|q| q.peek())
    }

    /// Number of in-flight broadcasts created by `sender_id`.
    pub async fn active_count(&self, sender_id: &str) -> usize {
        self.inner
            .lock()
            .await
            .values()
            .filter(|s| s.request.sender_id == sender_id && !s.request.status.is_terminal())
            .count()
    }

    /// Allocate a new broadcast request.
    ///
    /// Fails when the sender is unknown, already has
    /// `max_broadcasts_per_agent` active requests, or still has a pending
    /// broadcast from another agent in its own queue (deadlock guard).
    pub async fn create(
        &self,
        sender_id: &str,
        question: impl Into<String>,
        response_mode: ResponseMode,
        timeout_ms: Option<u64>,
    ) -> Result<String> {
        if !self.roster.contains_key(sender_id) {
            return Err(Error::broadcast(format!("unknown agent: {}", sender_id)));
        }
        if let Some(pending) = self.pending_for(sender_id) {
            return Err(Error::broadcast(format!(
                "pending broadcast from {}",
                pending.sender_id
            )));
        }

        let mut inner = self.inner.lock().await;

        let active = inner
            .values()
            .filter(|s| s.request.sender_id == sender_id && !s.request.status.is_terminal())
            .count();
        if active >= self.max_broadcasts_per_agent {
            return Err(Error::broadcast(format!(
                "agent {} has reached the maximum number of active broadcasts ({})",
                sender_id, self.max_broadcasts_per_agent
            )));
        }

        let mut expected = self.roster.len().saturating_sub(1);
        if self.mode == BroadcastMode::Human {
            expected += 1;
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        let request = BroadcastRequest {
            id: request_id.clone(),
            sender_id: sender_id.to_string(),
            question: question.into(),
            created_at: Utc::now(),
            timeout_ms: timeout_ms.unwrap_or(self.default_timeout_ms),
            response_mode,
            expected_count: expected,
            received_count: 0,
            status: BroadcastStatus::Pending,
        };

        let (status_tx, _) = watch::channel(BroadcastStatus::Pending);
        inner.insert(
            request_id.clone(),
            RequestState {
                request,
                responses: Vec::new(),
                status_tx,
            },
        );

        Ok(request_id)
    }

    /// Enqueue the question into every agent except the sender. In human
    /// mode this also prompts the human through the display port and blocks
    /// until the human answers, skips, or the request times out.
    pub async fn inject(&self, request_id: &str) -> Result<()> {
        let request = {
            let mut inner = self.inner.lock().await;
            let state = inner
                .get_mut(request_id)
                .ok_or_else(|| Error::broadcast(format!("unknown broadcast request: {}", request_id)))?;
            state.advance(BroadcastStatus::Collecting);
            state.request.clone()
        };

        for (agent_id, queue) in &self.roster {
            if agent_id != &request.sender_id {
                queue.push(request.clone());
            }
        }

        self.display.publish(DisplayEvent::BroadcastQuestion {
            request_id: request.id.clone(),
            sender_id: request.sender_id.clone(),
            question: request.question.clone(),
        });

        if self.mode == BroadcastMode::Human {
            self.prompt_human(&request).await;
        }

        Ok(())
    }

    /// Prompt the human participant; pauses collection until the human
    /// responds, skips, or the request timeout elapses.
    async fn prompt_human(&self, request: &BroadcastRequest) {
        let prompt = self
            .display
            .prompt_broadcast(&request.sender_id, &request.question);
        match tokio::time::timeout(Duration::from_millis(request.timeout_ms), prompt).await {
            Ok(Some(content)) => {
                if let Err(e) = self.collect(&request.id, "human", content, true).await {
                    log::warn!("failed to record human response: {}", e);
                }
            }
            Ok(None) => log::info!("human skipped broadcast {}", request.id),
            Err(_) => log::info!("human response timed out for broadcast {}", request.id),
        }
    }

    /// Record a response from an agent or human. When the expected count is
    /// reached the request completes and waiters wake. Responses arriving
    /// after a timeout are still recorded but never re-wake waiters.
    pub async fn collect(
        &self,
        request_id: &str,
        responder_id: &str,
        content: impl Into<String>,
        is_human: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let state = inner
            .get_mut(request_id)
            .ok_or_else(|| Error::broadcast(format!("unknown broadcast request: {}", request_id)))?;

        state.responses.push(BroadcastResponse {
            request_id: request_id.to_string(),
            responder_id: responder_id.to_string(),
            content: content.into(),
            at: Utc::now(),
            is_human,
        });
        if state.request.received_count < state.request.expected_count {
            state.request.received_count += 1;
        }

        if state.request.received_count >= state.request.expected_count {
            state.advance(BroadcastStatus::Complete);
        }

        Ok(())
    }

    /// Block until the request completes, times out, or is cancelled.
    pub async fn wait(&self, request_id: &str, timeout_ms: Option<u64>) -> Result<BroadcastOutcome> {
        let (mut status_rx, timeout_ms) = {
            let inner = self.inner.lock().await;
            let state = inner
                .get(request_id)
                .ok_or_else(|| Error::broadcast(format!("unknown broadcast request: {}", request_id)))?;
            (
                state.status_tx.subscribe(),
                timeout_ms.unwrap_or(state.request.timeout_ms),
            )
        };

        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if status_rx.borrow_and_update().is_terminal() {
                return self.responses(request_id).await;
            }
            match tokio::time::timeout_at(deadline, status_rx.changed()).await {
                Ok(Ok(())) => continue,
                // Sender dropped: the request was cleaned up under us.
                Ok(Err(_)) => return self.responses(request_id).await,
                Err(_) => {
                    let mut inner = self.inner.lock().await;
                    if let Some(state) = inner.get_mut(request_id) {
                        state.advance(BroadcastStatus::Timeout);
                    }
                    drop(inner);
                    return self.responses(request_id).await;
                }
            }
        }
    }

    /// Current status, counts, and which agents are still pending.
    pub async fn status(&self, request_id: &str) -> Result<BroadcastStatusReport> {
        let inner = self.inner.lock().await;
        let state = inner
            .get(request_id)
            .ok_or_else(|| Error::broadcast(format!("unknown broadcast request: {}", request_id)))?;

        let responded: std::collections::HashSet<&str> = state
            .responses
            .iter()
            .filter(|r| !r.is_human)
            .map(|r| r.responder_id.as_str())
            .collect();
        let mut waiting_for: Vec<String> = self
            .roster
            .keys()
            .filter(|id| id.as_str() != state.request.sender_id && !responded.contains(id.as_str()))
            .cloned()
            .collect();
        waiting_for.sort();

        Ok(BroadcastStatusReport {
            status: state.request.status,
            received: state.request.received_count,
            expected: state.request.expected_count,
            waiting_for,
        })
    }

    /// Status plus all responses collected so far.
    pub async fn responses(&self, request_id: &str) -> Result<BroadcastOutcome> {
        let inner = self.inner.lock().await;
        let state = inner
            .get(request_id)
            .ok_or_else(|| Error::broadcast(format!("unknown broadcast request: {}", request_id)))?;
        Ok(BroadcastOutcome {
            status: state.request.status,
            responses: state.responses.clone(),
        })
    }

    /// Cancel an in-flight request and wake its waiters.
    pub async fn cancel(&self, request_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let state = inner
            .get_mut(request_id)
            .ok_or_else(|| Error::broadcast(format!("unknown broadcast request: {}", request_id)))?;
        state.advance(BroadcastStatus::Cancelled);
        Ok(())
    }

    /// Drop all state for a finished request.
    pub async fn cleanup(&self, request_id: &str) {
        self.inner.lock().await.remove(request_id);
    }
}
