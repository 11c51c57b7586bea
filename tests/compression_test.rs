//! Compression sub-protocol behavior through the chat-completions backend:
//! proactive triggering, status chunk ordering, tail preservation, and the
//! unrecoverable-overflow path.

use futures::StreamExt;
use massgen::retry::RetryConfig;
use massgen::{
    compress, estimate_tokens, needs_compression, Backend, ChatCompletionsBackend,
    ChatCompletionsConfig, CompressionConfig, CompressionState, Message, StreamChunk,
    StreamRequest, COMPRESSION_SENTINEL,
};
use std::time::Duration;

/// A backend pointed at a dead endpoint: compression happens before any
/// network traffic, so its chunks are observable without a server.
fn dead_backend(compression: CompressionConfig) -> ChatCompletionsBackend {
    let mut config = ChatCompletionsConfig::new("test-model", "http://127.0.0.1:9");
    config.compression = compression;
    config.retry = RetryConfig::default()
        .with_max_attempts(1)
        .with_initial_delay(Duration::from_millis(5));
    config.timeout = 2;
    ChatCompletionsBackend::new(config).unwrap()
}

/// Long early exchanges, short recent ones, so the default `tail_keep = 2`
/// fits under the target after summarising the bulk.
fn long_history() -> Vec<Message> {
    let mut messages = vec![Message::system("You are a helpful assistant")];
    for n in 0..5 {
        messages.push(Message::user(format!("q{} {}", n, "x".repeat(1200))));
        messages.push(Message::assistant(format!("a{} {}", n, "y".repeat(1200))));
    }
    messages.push(Message::user("latest short question"));
    messages.push(Message::assistant("latest short answer"));
    messages.push(Message::user("final tiny question"));
    messages
}

/// Scenario: history estimated far above `trigger_ratio * context_window`.
/// Expected chunk order: `compressing`, then `compressed` with the kept tail
/// and a ratio at or under the target, before anything else.
#[tokio::test]
async fn test_proactive_compression_chunk_order() {
    let compression = CompressionConfig {
        context_window: 4_000,
        ..CompressionConfig::default()
    };
    let messages = long_history();
    assert!(needs_compression(&messages, &compression));

    let backend = dead_backend(compression);
    let stream = backend
        .stream(StreamRequest::new(messages))
        .await
        .unwrap();
    let chunks: Vec<StreamChunk> = stream.collect().await;

    match &chunks[0] {
        StreamChunk::CompressionStatus { status, .. } => {
            assert_eq!(*status, CompressionState::Compressing)
        }
        other => panic!("expected compressing first, got {:?}", other),
    }
    match &chunks[1] {
        StreamChunk::CompressionStatus {
            status,
            kept,
            ratio,
            ..
        } => {
            assert_eq!(*status, CompressionState::Compressed);
            assert_eq!(*kept, Some(2));
            assert!(ratio.unwrap() <= 0.2 + 1e-9);
        }
        other => panic!("expected compressed second, got {:?}", other),
    }

    // The dead endpoint then fails the turn as a retryable provider error,
    // and the stream still terminates with exactly one done.
    assert!(chunks.iter().any(|c| matches!(
        c,
        StreamChunk::Error { retryable: true, .. }
    )));
    assert_eq!(
        chunks.iter().filter(|c| **c == StreamChunk::Done).count(),
        1
    );
    assert_eq!(chunks.last(), Some(&StreamChunk::Done));
}

/// When even the fully collapsed history misses the target, the backend
/// reports `failed` and surfaces a non-retryable error without touching the
/// network.
#[tokio::test]
async fn test_unrecoverable_overflow_fails_without_request() {
    let compression = CompressionConfig {
        context_window: 400,
        ..CompressionConfig::default()
    };
    // The system prompt alone blows the 80-token target.
    let messages = vec![
        Message::system("s".repeat(4_000)),
        Message::user("q".repeat(4_000)),
    ];

    let backend = dead_backend(compression);
    let started = std::time::Instant::now();
    let stream = backend
        .stream(StreamRequest::new(messages))
        .await
        .unwrap();
    let chunks: Vec<StreamChunk> = stream.collect().await;

    // No network attempt: the failure is immediate.
    assert!(started.elapsed() < Duration::from_millis(500));

    let statuses: Vec<&CompressionState> = chunks
        .iter()
        .filter_map(|c| match c {
            StreamChunk::CompressionStatus { status, .. } => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(
        statuses,
        vec![&CompressionState::Compressing, &CompressionState::Failed]
    );
    assert!(chunks.iter().any(|c| matches!(
        c,
        StreamChunk::Error { retryable: false, .. }
    )));
    assert_eq!(chunks.last(), Some(&StreamChunk::Done));
}

/// Invariant: after compression with `tail_keep = K`, the last K
/// user/assistant exchanges appear verbatim in the post-compression list.
#[test]
fn test_tail_preserved_verbatim_for_each_k() {
    let messages = long_history();
    for k in 0..=2 {
        let config = CompressionConfig {
            context_window: 4_000,
            tail_keep: k,
            target_ratio: 0.9, // generous target so exactly k is kept
            ..CompressionConfig::default()
        };
        let (compressed, report) = compress(&messages, &config);
        assert_eq!(report.kept, k);

        if k > 0 {
            // Find where the kept tail starts in the original list: the
            // k-th user message from the end.
            let mut seen = 0;
            let mut start = 0;
            for (idx, m) in messages.iter().enumerate().rev() {
                if m.role == massgen::MessageRole::User {
                    seen += 1;
                    if seen == k {
                        start = idx;
                        break;
                    }
                }
            }
            let expected = &messages[start..];
            let tail = &compressed[compressed.len() - expected.len()..];
            assert_eq!(tail, expected);
        }
    }
}

/// The summary message is detectable on reload via the sentinel prefix.
#[test]
fn test_summary_sentinel_detectable() {
    let config = CompressionConfig {
        context_window: 4_000,
        ..CompressionConfig::default()
    };
    let (compressed, _) = compress(&long_history(), &config);
    let summary = compressed
        .iter()
        .find(|m| m.content.starts_with(COMPRESSION_SENTINEL))
        .expect("summary carries the sentinel");
    assert_eq!(summary.role, massgen::MessageRole::System);
}

/// The trigger math from the estimate side: a 1000-token window with the
/// default 0.5 threshold fires at 500 estimated tokens.
#[test]
fn test_trigger_threshold_math() {
    let config = CompressionConfig {
        context_window: 1_000,
        ..CompressionConfig::default()
    };
    let messages = vec![Message::user("x".repeat(3_200))]; // ~800 tokens
    assert!(estimate_tokens(&messages) >= 500);
    assert!(needs_compression(&messages, &config));

    let light = vec![Message::user("short")];
    assert!(!needs_compression(&light, &config));
}
