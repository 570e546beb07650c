// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use maestro_session::Message;

/// A ranked recall hit.
#[derive(Debug, Clone)]
pub struct MemoryHit {
    pub content: String,
    pub score: f32,
}

/// What `inject` adds to a prompt.
#[derive(Debug, Clone, Default)]
pub struct MemoryInjection {
    pub context_text: String,
    /// Names of the recalled memories, surfaced in a `context` event.
    pub refs: Vec<String>,
}

/// The external memory/knowledge-graph subsystem, seen from the kernel.
///
/// The kernel only ever calls these three operations: it hands finished
/// transcripts to `extract`, and enriches prompts through `inject` when a
/// request sets `orchestrate`.  Everything behind them (embeddings, recall
/// ranking, feedback) is out of scope.
#[async_trait]
pub trait MemoryService: Send + Sync {
    async fn extract(&self, session_id: &str, messages: &[Message]) -> anyhow::Result<()>;

    async fn search(&self, query: &str) -> anyhow::Result<Vec<MemoryHit>>;

    async fn inject(&self, query: &str, session_id: &str) -> anyhow::Result<MemoryInjection>;
}

/// Default wiring: remembers nothing, recalls nothing.
pub struct NullMemory;

#[async_trait]
impl MemoryService for NullMemory {
    async fn extract(&self, _session_id: &str, _messages: &[Message]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn search(&self, _query: &str) -> anyhow::Result<Vec<MemoryHit>> {
        Ok(Vec::new())
    }

    async fn inject(&self, _query: &str, _session_id: &str) -> anyhow::Result<MemoryInjection> {
        Ok(MemoryInjection::default())
    }
}
