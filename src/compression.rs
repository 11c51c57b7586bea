//! Reactive context compression.
//!
//! Backends use this module to keep long conversations inside a provider's
//! context window. Compression runs in two situations:
//!
//! - *Proactive*: before sending, the outgoing history is token-estimated;
//!   at or above `trigger_ratio * context_window` the history is compressed.
//! - *Reactive*: when the provider rejects a request as too long, the
//!   history is compressed and the request retried once.
//!
//! The procedure is deterministic and does not require a model call: the last
//! `tail_keep` user/assistant exchanges are kept verbatim, everything before
//! them is folded into a single synthetic system message prefixed with
//! [`COMPRESSION_SENTINEL`] so it can be detected on reload. If the result is
//! still above `target_ratio * context_window`, the tail shrinks one exchange
//! at a time until the target is met or nothing but the summary remains.
//!
//! Token counts are a character-based approximation (1 token ≈ 4 characters).
//! This is an APPROXIMATION; actual counts vary by model family, which is why
//! the trigger fires well below the real window.

use crate::types::{Message, MessageRole};

/// Sentinel prefix of the synthetic summary message. Detected on reload so a
/// compressed history is never re-summarised as ordinary conversation.
pub const COMPRESSION_SENTINEL: &str = "[COMPRESSED CONTEXT SUMMARY]";

/// Maximum characters of any single message quoted into the summary.
const SUMMARY_EXCERPT_CHARS: usize = 240;

/// Compression tuning for one backend.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Provider context window, in tokens.
    pub context_window: usize,
    /// Fraction of the window at which proactive compression triggers.
    pub trigger_ratio: f64,
    /// Fraction of the window the compressed history must fit into.
    pub target_ratio: f64,
    /// Number of most-recent user/assistant exchanges kept verbatim.
    pub tail_keep: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            context_window: 128_000,
            trigger_ratio: 0.5,
            target_ratio: 0.2,
            tail_keep: 2,
        }
    }
}

impl CompressionConfig {
    pub fn new(context_window: usize) -> Self {
        Self {
            context_window,
            ..Self::default()
        }
    }

    /// Token count at which proactive compression triggers.
    pub fn trigger_tokens(&self) -> usize {
        (self.context_window as f64 * self.trigger_ratio) as usize
    }

    /// Token count the compressed history must fit into.
    pub fn target_tokens(&self) -> usize {
        (self.context_window as f64 * self.target_ratio) as usize
    }
}

/// Outcome of one compression pass.
#[derive(Debug, Clone)]
pub struct CompressionReport {
    /// Exchanges kept verbatim at the end of the history.
    pub kept: usize,
    /// `after_tokens / context_window`.
    pub ratio: f64,
    pub before_tokens: usize,
    pub after_tokens: usize,
    /// Whether the target was met. When false the next turn must surface a
    /// non-retryable error instead of calling the provider again.
    pub met_target: bool,
}

/// Estimate token count for a message list.
///
/// Character-based approximation (1 token ≈ 4 characters) with a small
/// per-message overhead for role formatting, conservative across model
/// families.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    if messages.is_empty() {
        return 0;
    }

    let mut total_chars = 0;
    for message in messages {
        total_chars += 8; // role formatting overhead
        total_chars += message.content.len();
        if let Some(calls) = &message.tool_calls {
            for call in calls {
                total_chars += call.id.len() + call.name.len() + call.arguments.len();
            }
        }
        if let Some(id) = &message.tool_call_id {
            total_chars += id.len();
        }
    }
    total_chars += 16; // conversation-level overhead

    (total_chars + 3) / 4
}

/// Whether the outgoing history is at or above the proactive trigger.
pub fn needs_compression(messages: &[Message], config: &CompressionConfig) -> bool {
    estimate_tokens(messages) >= config.trigger_tokens()
}

/// Compress `messages` down to `[system prompt, summary, ...tail]`.
///
/// The returned list always contains the original system prompt (when
/// present) followed by a single sentinel-prefixed summary of everything that
/// was dropped, followed by the kept tail. Inspect
/// [`CompressionReport::met_target`] to learn whether the target ratio was
/// reached.
pub fn compress(
    messages: &[Message],
    config: &CompressionConfig,
) -> (Vec<Message>, CompressionReport) {
    let before_tokens = estimate_tokens(messages);
    let target = config.target_tokens();

    let (system, rest) = split_system(messages);

    let mut kept = config.tail_keep;
    loop {
        let tail_start = tail_start_index(rest, kept);
        let summary = summarize(&rest[..tail_start]);

        let mut result = Vec::with_capacity(2 + rest.len() - tail_start);
        if let Some(system) = system {
            result.push(system.clone());
        }
        if let Some(summary) = summary {
            result.push(summary);
        }
        result.extend_from_slice(&rest[tail_start..]);

        let after_tokens = estimate_tokens(&result);
        if after_tokens <= target || kept == 0 {
            let report = CompressionReport {
                kept,
                ratio: after_tokens as f64 / config.context_window as f64,
                before_tokens,
                after_tokens,
                met_target: after_tokens <= target,
            };
            return (result, report);
        }
        kept -= 1;
    }
}

/// Split off the leading system prompt, if any.
fn split_system(messages: &[Message]) -> (Option<&Message>, &[Message]) {
    match messages.first() {
        Some(first) if first.role == MessageRole::System => (Some(first), &messages[1..]),
        _ => (None, messages),
    }
}

/// Index where the kept tail begins: the `kept`-th user message from the end,
/// so each kept exchange starts at a user turn and carries its assistant and
/// tool messages with it.
fn tail_start_index(messages: &[Message], kept: usize) -> usize {
    if kept == 0 {
        return messages.len();
    }
    let mut user_seen = 0;
    for (idx, message) in messages.iter().enumerate().rev() {
        if message.role == MessageRole::User && message.tool_call_id.is_none() {
            user_seen += 1;
            if user_seen == kept {
                return idx;
            }
        }
    }
    0
}

/// Fold dropped messages into one sentinel-prefixed system message.
fn summarize(dropped: &[Message]) -> Option<Message> {
    if dropped.is_empty() {
        return None;
    }

    let mut lines = Vec::with_capacity(dropped.len() + 1);
    lines.push(COMPRESSION_SENTINEL.to_string());
    for message in dropped {
        // An earlier summary is folded in verbatim, minus its own sentinel.
        if message.role == MessageRole::System && message.content.starts_with(COMPRESSION_SENTINEL)
        {
            let prior = message.content[COMPRESSION_SENTINEL.len()..].trim_start();
            if !prior.is_empty() {
                lines.push(prior.to_string());
            }
            continue;
        }

        let role = match message.role {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        };
        let excerpt = excerpt(&message.content);
        if let Some(calls) = &message.tool_calls {
            let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
            lines.push(format!(
                "{}: {} [called: {}]",
                role,
                excerpt,
                names.join(", ")
            ));
        } else {
            lines.push(format!("{}: {}", role, excerpt));
        }
    }

    Some(Message::system(lines.join("\n")))
}

fn excerpt(content: &str) -> String {
    let trimmed = content.trim();
    if trimmed.len() <= SUMMARY_EXCERPT_CHARS {
        return trimmed.to_string();
    }
    let mut cut = SUMMARY_EXCERPT_CHARS;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &trimmed[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolCall;

    fn exchange(n: usize, filler: usize) -> Vec<Message> {
        vec![
            Message::user(format!("question {} {}", n, "x".repeat(filler))),
            Message::assistant(format!("answer {} {}", n, "y".repeat(filler))),
        ]
    }

    #[test]
    fn test_estimate_tokens_empty() {
        assert_eq!(estimate_tokens(&[]), 0);
    }

    #[test]
    fn test_estimate_tokens_counts_tool_calls() {
        let plain = vec![Message::user("hello")];
        let with_call = vec![Message::assistant_tool_calls(
            "hello",
            vec![ToolCall::new("call_1", "search", r#"{"q":"rust"}"#)],
        )];
        assert!(estimate_tokens(&with_call) > estimate_tokens(&plain));
    }

    #[test]
    fn test_needs_compression_threshold() {
        let config = CompressionConfig::new(1000);
        // ~800 tokens of content.
        let messages = vec![Message::user("x".repeat(3200))];
        assert!(needs_compression(&messages, &config));

        let small = vec![Message::user("hello")];
        assert!(!needs_compression(&small, &config));
    }

    #[test]
    fn test_compress_preserves_tail_verbatim() {
        let mut messages = vec![Message::system("prompt")];
        for n in 0..10 {
            messages.extend(exchange(n, 400));
        }

        let config = CompressionConfig {
            context_window: 8000,
            tail_keep: 2,
            ..CompressionConfig::default()
        };
        let (compressed, report) = compress(&messages, &config);

        assert_eq!(report.kept, 2);
        // System prompt survives in place.
        assert_eq!(compressed[0], Message::system("prompt"));
        // Summary carries the sentinel.
        assert!(compressed[1].content.starts_with(COMPRESSION_SENTINEL));
        // The last two exchanges appear verbatim.
        let tail = &compressed[compressed.len() - 4..];
        let expected: Vec<Message> = messages[messages.len() - 4..].to_vec();
        assert_eq!(tail, expected.as_slice());
    }

    #[test]
    fn test_compress_shrinks_tail_until_target() {
        let mut messages = vec![Message::system("prompt")];
        for n in 0..6 {
            messages.extend(exchange(n, 2000));
        }

        // Tight target: full exchanges are ~1000 tokens each, so tail_keep
        // must drop below the default to fit.
        let config = CompressionConfig {
            context_window: 4000,
            tail_keep: 2,
            target_ratio: 0.3,
            ..CompressionConfig::default()
        };
        let (_, report) = compress(&messages, &config);
        assert!(report.kept < 2);
        assert!(report.met_target);
        assert!(report.ratio <= 0.3);
    }

    #[test]
    fn test_compress_reports_failure_at_zero_tail() {
        // Even the system prompt alone exceeds the target.
        let messages = vec![
            Message::system("p".repeat(4000)),
            Message::user("q".repeat(4000)),
            Message::assistant("a".repeat(4000)),
        ];
        let config = CompressionConfig {
            context_window: 1000,
            target_ratio: 0.2,
            ..CompressionConfig::default()
        };
        let (compressed, report) = compress(&messages, &config);
        assert_eq!(report.kept, 0);
        assert!(!report.met_target);
        // Still structurally valid: system prompt then summary.
        assert_eq!(compressed[0].role, MessageRole::System);
        assert!(compressed[1].content.starts_with(COMPRESSION_SENTINEL));
    }

    #[test]
    fn test_compress_folds_prior_summary() {
        let messages = vec![
            Message::system("prompt"),
            Message::system(format!("{}\nuser: old question", COMPRESSION_SENTINEL)),
            Message::user("q".repeat(2000)),
            Message::assistant("a".repeat(2000)),
            Message::user("latest"),
            Message::assistant("reply"),
        ];
        let config = CompressionConfig {
            context_window: 2000,
            tail_keep: 1,
            ..CompressionConfig::default()
        };
        let (compressed, _) = compress(&messages, &config);
        let summary = &compressed[1].content;
        // Prior summary content is folded in without a doubled sentinel.
        assert!(summary.starts_with(COMPRESSION_SENTINEL));
        assert!(summary.contains("user: old question"));
        assert_eq!(summary.matches(COMPRESSION_SENTINEL).count(), 1);
    }

    #[test]
    fn test_divergent_ratio_is_fraction_of_window() {
        let messages = vec![Message::user("hello")];
        let config = CompressionConfig::new(1000);
        let (_, report) = compress(&messages, &config);
        assert!(report.ratio > 0.0 && report.ratio < 1.0);
    }
}
