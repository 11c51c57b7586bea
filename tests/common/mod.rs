//! Shared helpers for the integration tests.
#![allow(dead_code)] // not every test binary uses every helper

use massgen::{DisplayEvent, DisplaySink};
use std::sync::{Arc, Mutex};

/// Display sink that records every event for later assertions.
#[derive(Default)]
pub struct CapturingDisplay {
    events: Mutex<Vec<DisplayEvent>>,
}

impl CapturingDisplay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<DisplayEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Content fragments streamed by one agent, concatenated.
    pub fn content_for(&self, agent_id: &str) -> String {
        self.events()
            .iter()
            .filter_map(|event| match event {
                DisplayEvent::AgentChunk {
                    agent_id: id,
                    chunk: massgen::StreamChunk::Content { content },
                } if id == agent_id => Some(content.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl DisplaySink for CapturingDisplay {
    fn publish(&self, event: DisplayEvent) {
        self.events.lock().unwrap().push(event);
    }
}
