//! Hooks system for intercepting tool calls.
//!
//! Two hook points exist: [`HookType::PreToolUse`] fires before a tool
//! executes and may deny it or rewrite its input; [`HookType::PostToolUse`]
//! fires after the result is available and may inject extra content into the
//! continuation. Hooks are registered at two scopes:
//!
//! - *Global*: apply to every tool call of every agent.
//! - *Per-agent*: apply additionally to one agent's tool calls; per-agent
//!   hooks run after global hooks, in registration order within each scope.
//!
//! The manager is fail-open: a hook that errors or panics is recorded in
//! [`HookResult::hook_errors`] and treated as `allow` with no injection, so a
//! broken hook can never wedge an agent.
//!
//! # Examples
//!
//! ```rust
//! use massgen::{hook_fn, HookResult};
//!
//! let audit = hook_fn("audit", |event| async move {
//!     if event.tool_name == "delete_file" {
//!         return Ok(HookResult::deny("dangerous operation blocked"));
//!     }
//!     Ok(HookResult::allow())
//! });
//! ```

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

/// The two tool-call interception points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookType {
    /// Before the tool executes; may deny or rewrite input.
    PreToolUse,
    /// After the result is available; may inject content.
    PostToolUse,
}

/// Context passed to every hook.
#[derive(Debug, Clone)]
pub struct HookEvent {
    pub hook_type: HookType,
    pub session_id: String,
    pub orchestrator_id: String,
    pub agent_id: Option<String>,
    pub at: DateTime<Utc>,
    pub tool_name: String,
    pub tool_input: Value,
    /// Only populated for PostToolUse.
    pub tool_output: Option<String>,
}

impl HookEvent {
    pub fn new(
        hook_type: HookType,
        session_id: impl Into<String>,
        orchestrator_id: impl Into<String>,
        agent_id: Option<String>,
        tool_name: impl Into<String>,
        tool_input: Value,
    ) -> Self {
        Self {
            hook_type,
            session_id: session_id.into(),
            orchestrator_id: orchestrator_id.into(),
            agent_id,
            at: Utc::now(),
            tool_name: tool_name.into(),
            tool_input,
            tool_output: None,
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.tool_output = Some(output.into());
        self
    }
}

/// How the decision routes the tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookDecision {
    /// Execution continues; `updated_input` (if any) replaces the arguments.
    #[default]
    Allow,
    /// The tool call is skipped; `reason` is surfaced to the model as the
    /// tool result.
    Deny,
    /// Equivalent to allow, but the UI is asked to confirm synchronously
    /// before running.
    Ask,
}

/// Where injected content lands in the continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionStrategy {
    /// Appended to the tool's own result content.
    ToolResult,
    /// Delivered as a separate synthetic user message immediately after the
    /// tool result.
    UserMessage,
}

/// Content a PostToolUse hook adds to the continuation.
#[derive(Debug, Clone, PartialEq)]
pub struct Injection {
    pub content: String,
    pub strategy: InjectionStrategy,
}

/// Decision returned by one hook, and the merged outcome of a whole pass.
#[derive(Debug, Clone, Default)]
pub struct HookResult {
    pub decision: HookDecision,
    pub reason: Option<String>,
    /// For PreToolUse: replacement tool arguments.
    pub updated_input: Option<Value>,
    /// For PostToolUse: content to add to the continuation.
    pub injections: Vec<Injection>,
    /// Failures absorbed by the fail-open policy.
    pub hook_errors: Vec<String>,
}

impl HookResult {
    /// Continue normally.
    pub fn allow() -> Self {
        Self::default()
    }

    /// Skip the tool call.
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            decision: HookDecision::Deny,
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Ask the UI to confirm before running.
    pub fn ask(reason: impl Into<String>) -> Self {
        Self {
            decision: HookDecision::Ask,
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Continue with replacement arguments.
    pub fn allow_with_input(input: Value) -> Self {
        Self {
            updated_input: Some(input),
            ..Self::default()
        }
    }

    /// Continue and inject content into the continuation.
    pub fn inject(content: impl Into<String>, strategy: InjectionStrategy) -> Self {
        Self {
            injections: vec![Injection {
                content: content.into(),
                strategy,
            }],
            ..Self::default()
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.hook_errors.is_empty()
    }

    /// Injections with the given strategy, in registration order.
    pub fn injections_with(&self, strategy: InjectionStrategy) -> Vec<&Injection> {
        self.injections
            .iter()
            .filter(|i| i.strategy == strategy)
            .collect()
    }
}

/// A tool-call interceptor.
#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, event: HookEvent) -> Result<HookResult>;
}

type HookFuture = Pin<Box<dyn Future<Output = Result<HookResult>> + Send>>;

/// A hook built from an async closure. See [`hook_fn`].
pub struct FnHook {
    name: String,
    handler: Box<dyn Fn(HookEvent) -> HookFuture + Send + Sync>,
}

/// Build a hook from an async closure.
pub fn hook_fn<F, Fut>(name: impl Into<String>, handler: F) -> Arc<FnHook>
where
    F: Fn(HookEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HookResult>> + Send + 'static,
{
    Arc::new(FnHook {
        name: name.into(),
        handler: Box::new(move |event| Box::pin(handler(event))),
    })
}

#[async_trait]
impl Hook for FnHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, event: HookEvent) -> Result<HookResult> {
        (self.handler)(event).await
    }
}

// ============================================================================
// HOOK MANAGER
// ============================================================================

/// Registry and executor for global and per-agent hooks.
///
/// One manager is shared by all agents of one orchestrator. Execution order
/// is: global hooks (registration order), then the event agent's hooks
/// (registration order). `updated_input` from one hook is what the next hook
/// sees. The first `deny` short-circuits the pass. When several hooks return
/// injections, the merged result concatenates them grouped by strategy and
/// preserves registration order within each group.
#[derive(Default)]
pub struct HookManager {
    global: Mutex<HashMap<HookType, Vec<Arc<dyn Hook>>>>,
    per_agent: Mutex<HashMap<String, HashMap<HookType, Vec<Arc<dyn Hook>>>>>,
}

impl HookManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook for every tool call of every agent.
    pub fn register_global(&self, hook_type: HookType, hook: Arc<dyn Hook>) {
        self.global
            .lock()
            .unwrap()
            .entry(hook_type)
            .or_default()
            .push(hook);
    }

    /// Register a hook for one agent's tool calls. Per-agent hooks run after
    /// global hooks.
    pub fn register_for_agent(
        &self,
        agent_id: impl Into<String>,
        hook_type: HookType,
        hook: Arc<dyn Hook>,
    ) {
        self.per_agent
            .lock()
            .unwrap()
            .entry(agent_id.into())
            .or_default()
            .entry(hook_type)
            .or_default()
            .push(hook);
    }

    fn hooks_for(&self, hook_type: HookType, agent_id: Option<&str>) -> Vec<Arc<dyn Hook>> {
        let mut hooks: Vec<Arc<dyn Hook>> = self
            .global
            .lock()
            .unwrap()
            .get(&hook_type)
            .cloned()
            .unwrap_or_default();
        if let Some(agent_id) = agent_id {
            if let Some(agent_hooks) = self.per_agent.lock().unwrap().get(agent_id) {
                hooks.extend(agent_hooks.get(&hook_type).cloned().unwrap_or_default());
            }
        }
        hooks
    }

    /// Run every matching hook for `event` and merge the outcome.
    ///
    /// Fail-open: a hook that errors or panics contributes an entry to
    /// `hook_errors` and nothing else.
    pub async fn execute(&self, event: HookEvent) -> HookResult {
        let hooks = self.hooks_for(event.hook_type, event.agent_id.as_deref());

        let mut merged = HookResult::allow();
        let mut current_input = event.tool_input.clone();

        for hook in hooks {
            let mut hook_event = event.clone();
            hook_event.tool_input = current_input.clone();

            let name = hook.name().to_string();
            // Run each hook in its own task so a panic is absorbed, not
            // propagated into the agent's tool loop.
            let outcome = tokio::spawn(async move { hook.run(hook_event).await }).await;

            let result = match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    merged.hook_errors.push(format!("{}: {}", name, e));
                    continue;
                }
                Err(join_err) => {
                    merged
                        .hook_errors
                        .push(format!("{}: panicked ({})", name, join_err));
                    continue;
                }
            };

            merged.hook_errors.extend(result.hook_errors);

            match result.decision {
                HookDecision::Deny => {
                    merged.decision = HookDecision::Deny;
                    merged.reason = result.reason;
                    return merged;
                }
                HookDecision::Ask => {
                    if merged.decision == HookDecision::Allow {
                        merged.decision = HookDecision::Ask;
                        merged.reason = result.reason.or(merged.reason.take());
                    }
                }
                HookDecision::Allow => {}
            }

            if let Some(updated) = result.updated_input {
                current_input = updated.clone();
                merged.updated_input = Some(updated);
            }
            merged.injections.extend(result.injections);
        }

        // Group injections by strategy, keeping registration order within
        // each group: tool-result injections first, then user messages.
        merged.injections.sort_by_key(|i| match i.strategy {
            InjectionStrategy::ToolResult => 0,
            InjectionStrategy::UserMessage => 1,
        });

        merged
    }
}

// ============================================================================
// BUILT-IN HOOKS
// ============================================================================

/// Cross-agent updates waiting to be injected, keyed by recipient agent.
///
/// The orchestrator pushes a note here whenever a peer answer lands; the
/// [`CrossAgentUpdateHook`] drains the recipient's queue the next time that
/// agent finishes a tool call, so updates reach the model mid-stream instead
/// of waiting for a restart.
#[derive(Default)]
pub struct CrossAgentUpdates {
    pending: Mutex<HashMap<String, Vec<String>>>,
}

impl CrossAgentUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_for(&self, agent_id: impl Into<String>, update: impl Into<String>) {
        self.pending
            .lock()
            .unwrap()
            .entry(agent_id.into())
            .or_default()
            .push(update.into());
    }

    pub fn drain_for(&self, agent_id: &str) -> Vec<String> {
        self.pending
            .lock()
            .unwrap()
            .remove(agent_id)
            .unwrap_or_default()
    }

    pub fn pending_for(&self, agent_id: &str) -> usize {
        self.pending
            .lock()
            .unwrap()
            .get(agent_id)
            .map_or(0, Vec::len)
    }
}

/// PostToolUse hook that delivers accumulated cross-agent updates as a
/// `tool_result` injection.
pub struct CrossAgentUpdateHook {
    updates: Arc<CrossAgentUpdates>,
    strategy: InjectionStrategy,
}

impl CrossAgentUpdateHook {
    pub fn new(updates: Arc<CrossAgentUpdates>, strategy: InjectionStrategy) -> Self {
        Self { updates, strategy }
    }
}

#[async_trait]
impl Hook for CrossAgentUpdateHook {
    fn name(&self) -> &str {
        "cross_agent_updates"
    }

    async fn run(&self, event: HookEvent) -> Result<HookResult> {
        let Some(agent_id) = event.agent_id.as_deref() else {
            return Ok(HookResult::allow());
        };
        let updates = self.updates.drain_for(agent_id);
        if updates.is_empty() {
            return Ok(HookResult::allow());
        }
        Ok(HookResult::inject(updates.join("\n"), self.strategy))
    }
}

/// Reminder paragraph injected when a high-priority task is reported done.
pub const HIGH_PRIORITY_REMINDER: &str = "A high-priority task was just marked completed. \
Before moving on, re-check the remaining high-priority tasks and make sure none of them \
is blocked on the one you finished. If any are, address them next.";

/// Tool-name patterns the reminder hook watches.
const TASK_TOOL_PATTERNS: [&str; 2] = ["*update_task_status", "*complete_task"];

/// PostToolUse hook that injects [`HIGH_PRIORITY_REMINDER`] as a synthetic
/// user message whenever a tool matching `*update_task_status` /
/// `*complete_task` reports a task with `priority == "high"` and
/// `status == "completed"`.
#[derive(Default)]
pub struct TaskReminderHook;

impl TaskReminderHook {
    pub fn new() -> Self {
        Self
    }

    fn matches_tool(name: &str) -> bool {
        TASK_TOOL_PATTERNS.iter().any(|p| glob_match(p, name))
    }
}

#[async_trait]
impl Hook for TaskReminderHook {
    fn name(&self) -> &str {
        "high_priority_task_reminder"
    }

    async fn run(&self, event: HookEvent) -> Result<HookResult> {
        if !Self::matches_tool(&event.tool_name) {
            return Ok(HookResult::allow());
        }

        // Tools report either flat fields or a nested `task` object.
        let task = event.tool_input.get("task").unwrap_or(&event.tool_input);
        let priority = task.get("priority").and_then(Value::as_str);
        // `complete_task` implies completion even without an explicit status.
        let completed = task.get("status").and_then(Value::as_str) == Some("completed")
            || event.tool_name.ends_with("complete_task");

        if priority == Some("high") && completed {
            return Ok(HookResult::inject(
                HIGH_PRIORITY_REMINDER,
                InjectionStrategy::UserMessage,
            ));
        }
        Ok(HookResult::allow())
    }
}

/// Minimal `*` glob matching for tool-name patterns.
pub(crate) fn glob_match(pattern: &str, name: &str) -> bool {
    fn inner(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..])),
            (Some(pc), Some(nc)) if pc == nc => inner(&p[1..], &n[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use serde_json::json;

    fn event(hook_type: HookType, tool: &str, input: Value) -> HookEvent {
        HookEvent::new(
            hook_type,
            "session-1",
            "orch-1",
            Some("agent-a".to_string()),
            tool,
            input,
        )
    }

    #[tokio::test]
    async fn test_deny_short_circuits() {
        let manager = HookManager::new();
        manager.register_global(
            HookType::PreToolUse,
            hook_fn("deny", |_| async { Ok(HookResult::deny("blocked")) }),
        );
        manager.register_global(
            HookType::PreToolUse,
            hook_fn("never", |_| async {
                panic!("must not run after deny");
            }),
        );

        let result = manager
            .execute(event(HookType::PreToolUse, "delete_file", json!({})))
            .await;
        assert_eq!(result.decision, HookDecision::Deny);
        assert_eq!(result.reason.as_deref(), Some("blocked"));
    }

    #[tokio::test]
    async fn test_updated_input_chains_through_hooks() {
        let manager = HookManager::new();
        manager.register_global(
            HookType::PreToolUse,
            hook_fn("clamp", |_| async {
                Ok(HookResult::allow_with_input(json!({"value": 100})))
            }),
        );
        manager.register_global(
            HookType::PreToolUse,
            hook_fn("check", |event| async move {
                // Sees the clamped input, not the original.
                assert_eq!(event.tool_input["value"], 100);
                Ok(HookResult::allow())
            }),
        );

        let result = manager
            .execute(event(
                HookType::PreToolUse,
                "calculate",
                json!({"value": 500}),
            ))
            .await;
        assert_eq!(result.updated_input, Some(json!({"value": 100})));
    }

    #[tokio::test]
    async fn test_per_agent_hooks_run_after_global() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let manager = HookManager::new();

        let o = order.clone();
        manager.register_for_agent(
            "agent-a",
            HookType::PostToolUse,
            hook_fn("agent", move |_| {
                let o = o.clone();
                async move {
                    o.lock().unwrap().push("agent");
                    Ok(HookResult::allow())
                }
            }),
        );
        let o = order.clone();
        manager.register_global(
            HookType::PostToolUse,
            hook_fn("global", move |_| {
                let o = o.clone();
                async move {
                    o.lock().unwrap().push("global");
                    Ok(HookResult::allow())
                }
            }),
        );

        manager
            .execute(event(HookType::PostToolUse, "tool", json!({})))
            .await;
        assert_eq!(*order.lock().unwrap(), vec!["global", "agent"]);
    }

    #[tokio::test]
    async fn test_fail_open_on_error_and_panic() {
        let manager = HookManager::new();
        manager.register_global(
            HookType::PreToolUse,
            hook_fn("broken", |_| async { Err(Error::hook("exploded")) }),
        );
        manager.register_global(
            HookType::PreToolUse,
            hook_fn("panics", |_| async { panic!("boom") }),
        );

        let result = manager
            .execute(event(HookType::PreToolUse, "tool", json!({})))
            .await;
        assert_eq!(result.decision, HookDecision::Allow);
        assert_eq!(result.hook_errors.len(), 2);
        assert!(result.hook_errors[0].contains("broken"));
        assert!(result.hook_errors[1].contains("panicked"));
    }

    #[tokio::test]
    async fn test_injections_grouped_by_strategy_in_registration_order() {
        let manager = HookManager::new();
        manager.register_global(
            HookType::PostToolUse,
            hook_fn("u1", |_| async {
                Ok(HookResult::inject("Y1", InjectionStrategy::UserMessage))
            }),
        );
        manager.register_global(
            HookType::PostToolUse,
            hook_fn("t1", |_| async {
                Ok(HookResult::inject("X1", InjectionStrategy::ToolResult))
            }),
        );
        manager.register_global(
            HookType::PostToolUse,
            hook_fn("u2", |_| async {
                Ok(HookResult::inject("Y2", InjectionStrategy::UserMessage))
            }),
        );
        manager.register_global(
            HookType::PostToolUse,
            hook_fn("t2", |_| async {
                Ok(HookResult::inject("X2", InjectionStrategy::ToolResult))
            }),
        );

        let result = manager
            .execute(event(HookType::PostToolUse, "tool", json!({})))
            .await;
        let contents: Vec<&str> = result.injections.iter().map(|i| i.content.as_str()).collect();
        assert_eq!(contents, vec!["X1", "X2", "Y1", "Y2"]);
    }

    #[tokio::test]
    async fn test_ask_decision_propagates() {
        let manager = HookManager::new();
        manager.register_global(
            HookType::PreToolUse,
            hook_fn("ask", |_| async { Ok(HookResult::ask("confirm?")) }),
        );

        let result = manager
            .execute(event(HookType::PreToolUse, "tool", json!({})))
            .await;
        assert_eq!(result.decision, HookDecision::Ask);
        assert_eq!(result.reason.as_deref(), Some("confirm?"));
    }

    #[tokio::test]
    async fn test_cross_agent_update_hook_drains_queue() {
        let updates = Arc::new(CrossAgentUpdates::new());
        updates.push_for("agent-a", "agent-b submitted answer #1");
        updates.push_for("agent-a", "agent-c submitted answer #1");

        let hook = CrossAgentUpdateHook::new(updates.clone(), InjectionStrategy::ToolResult);
        let result = hook
            .run(event(HookType::PostToolUse, "tool", json!({})))
            .await
            .unwrap();

        assert_eq!(result.injections.len(), 1);
        assert!(result.injections[0].content.contains("agent-b"));
        assert!(result.injections[0].content.contains("agent-c"));
        assert_eq!(updates.pending_for("agent-a"), 0);
    }

    #[tokio::test]
    async fn test_task_reminder_fires_on_high_priority_completion() {
        let hook = TaskReminderHook::new();

        let result = hook
            .run(event(
                HookType::PostToolUse,
                "planner__update_task_status",
                json!({"task": {"id": 3, "priority": "high", "status": "completed"}}),
            ))
            .await
            .unwrap();
        assert_eq!(result.injections.len(), 1);
        assert_eq!(result.injections[0].strategy, InjectionStrategy::UserMessage);
        assert_eq!(result.injections[0].content, HIGH_PRIORITY_REMINDER);

        // Low priority: no injection.
        let result = hook
            .run(event(
                HookType::PostToolUse,
                "planner__update_task_status",
                json!({"task": {"priority": "low", "status": "completed"}}),
            ))
            .await
            .unwrap();
        assert!(result.injections.is_empty());

        // Unrelated tool: no injection.
        let result = hook
            .run(event(HookType::PostToolUse, "search", json!({})))
            .await
            .unwrap();
        assert!(result.injections.is_empty());
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*update_task_status", "mcp__update_task_status"));
        assert!(glob_match("*complete_task", "complete_task"));
        assert!(!glob_match("*complete_task", "complete_task_v2"));
        assert!(glob_match("a*c", "abc"));
        assert!(glob_match("*", "anything"));
        assert!(!glob_match("abc", "abd"));
    }
}
