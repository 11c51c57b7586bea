//! Reserved workflow tools.
//!
//! Workflow tools are tool names the coordination layer interprets itself
//! instead of forwarding to a generic tool runner: `new_answer` and `vote`
//! drive convergence, the four broadcast tools drive the question/response
//! bus. The names are reserved: any client-provided tool that collides is
//! rejected with a configuration error before any stream begins.
//!
//! Protocol violations (invalid vote target, answer cap, broadcast rate
//! limit, deadlock guard) are returned to the model as structured JSON tool
//! results; they never terminate the stream.

use crate::config::BroadcastMode;
use crate::tools::ToolSpec;
use crate::{Error, Result};
use serde_json::{json, Value};

/// The reserved workflow tool names.
pub const WORKFLOW_TOOL_NAMES: [&str; 6] = [
    "new_answer",
    "vote",
    "ask_others",
    "respond_to_broadcast",
    "check_broadcast_status",
    "get_broadcast_responses",
];

/// Whether `name` is interpreted by the coordination layer.
pub fn is_workflow_tool(name: &str) -> bool {
    WORKFLOW_TOOL_NAMES.contains(&name)
}

/// Client tool names colliding with the reservation list.
pub fn collisions<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    names
        .into_iter()
        .filter(|n| is_workflow_tool(n))
        .map(String::from)
        .collect()
}

/// Reject client tool lists that shadow a workflow tool. Runs at session
/// start, before any stream begins.
pub fn ensure_no_collisions(tools: &[ToolSpec]) -> Result<()> {
    let found = collisions(tools.iter().map(|t| t.name.as_str()));
    if found.is_empty() {
        return Ok(());
    }
    Err(Error::config(format!(
        "client tools collide with reserved workflow tools: {}",
        found.join(", ")
    )))
}

/// The coordination tools advertised to every agent's backend.
///
/// `new_answer` and `vote` are always present. The broadcast tools appear
/// only when broadcasts are enabled: `respond_to_broadcast` in agent modes,
/// and the polling pair only when `wait_by_default` is off.
pub fn workflow_tools(broadcast: BroadcastMode, wait_by_default: bool) -> Vec<ToolSpec> {
    let mut tools = vec![new_answer_tool(), vote_tool()];

    if broadcast != BroadcastMode::Off {
        tools.push(ask_others_tool(broadcast, wait_by_default));
        if broadcast == BroadcastMode::Agents {
            tools.push(respond_to_broadcast_tool());
        }
        if !wait_by_default {
            tools.push(check_broadcast_status_tool());
            tools.push(get_broadcast_responses_tool());
        }
    }

    tools
}

fn new_answer_tool() -> ToolSpec {
    ToolSpec::new(
        "new_answer",
        "Submit your current best answer to the user's question. Other agents will see it \
         and may build on it or vote for it. Call this again only when you have a \
         substantially improved answer.",
        json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "Your complete answer, self-contained and ready to present to the user."
                }
            },
            "required": ["content"]
        }),
    )
}

fn vote_tool() -> ToolSpec {
    ToolSpec::new(
        "vote",
        "Vote for the agent whose current answer should be the final one. You may vote \
         for yourself. A vote is only valid if the target agent has submitted an answer.",
        json!({
            "type": "object",
            "properties": {
                "agent_id": {
                    "type": "string",
                    "description": "The id of the agent whose answer you endorse."
                },
                "reason": {
                    "type": "string",
                    "description": "A short justification for your vote."
                }
            },
            "required": ["agent_id", "reason"]
        }),
    )
}

fn ask_others_tool(broadcast: BroadcastMode, wait_by_default: bool) -> ToolSpec {
    let audience = if broadcast == BroadcastMode::Human {
        " and the human user"
    } else {
        ""
    };
    ToolSpec::new(
        "ask_others",
        format!(
            "Ask a question to the other agents{} for collaborative problem-solving. \
             Use this when you need input, coordination, or a decision from the team.",
            audience
        ),
        json!({
            "type": "object",
            "properties": {
                "question": {
                    "type": "string",
                    "description": format!(
                        "Your specific, actionable question for the other agents{}.",
                        audience
                    )
                },
                "wait": {
                    "type": "boolean",
                    "description": format!(
                        "Whether to wait for responses (default: {}). If true, blocks until \
                         responses are collected. If false, returns a request_id for polling.",
                        wait_by_default
                    )
                }
            },
            "required": ["question"]
        }),
    )
}

fn respond_to_broadcast_tool() -> ToolSpec {
    ToolSpec::new(
        "respond_to_broadcast",
        "Submit your response to a broadcast question from another agent. Provide a clean, \
         direct answer to what was asked.",
        json!({
            "type": "object",
            "properties": {
                "answer": {
                    "type": "string",
                    "description": "Your complete response to the broadcast question."
                }
            },
            "required": ["answer"]
        }),
    )
}

fn check_broadcast_status_tool() -> ToolSpec {
    ToolSpec::new(
        "check_broadcast_status",
        "Check the status of a broadcast request to see if responses are ready.",
        json!({
            "type": "object",
            "properties": {
                "request_id": {
                    "type": "string",
                    "description": "Request id returned by ask_others."
                }
            },
            "required": ["request_id"]
        }),
    )
}

fn get_broadcast_responses_tool() -> ToolSpec {
    ToolSpec::new(
        "get_broadcast_responses",
        "Get the collected responses for a broadcast request.",
        json!({
            "type": "object",
            "properties": {
                "request_id": {
                    "type": "string",
                    "description": "Request id returned by ask_others."
                }
            },
            "required": ["request_id"]
        }),
    )
}

// ============================================================================
// STRUCTURED TOOL RESULTS
// ============================================================================

/// Serialize a successful workflow tool result.
pub fn ok_payload(value: Value) -> String {
    value.to_string()
}

/// Serialize a structured workflow error returned as a tool result.
pub fn error_payload(code: &str, message: impl Into<String>) -> String {
    json!({"error": code, "message": message.into()}).to_string()
}

/// The deadlock-guard rejection: the sender must answer the named pending
/// broadcast before creating a new one.
pub fn pending_broadcast_payload(pending_from: &str, pending_question: &str) -> String {
    let excerpt: String = pending_question.chars().take(100).collect();
    json!({
        "error": "PENDING_BROADCAST",
        "message": format!(
            "You have a pending broadcast to respond to from {}. Call respond_to_broadcast \
             first before asking new questions.",
            pending_from
        ),
        "pending_from": pending_from,
        "pending_question": excerpt,
    })
    .to_string()
}
