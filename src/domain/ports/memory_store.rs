//! Memory store port.
//!
//! The vector+graph memory backend. Every operation is tenant-scoped; no
//! write happens without a `TenantContext` and tenant fields are part of
//! every stored record's key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::errors::CoreResult;
use crate::domain::models::TenantContext;

/// What kind of record a memory entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Episode,
    Document,
    Memory,
    Pattern,
}

/// One recalled record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub kind: MemoryKind,
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Relevance score assigned by the store, in [0, 1].
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

/// Options for context synthesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisOptions {
    pub include_episodes: bool,
    pub include_documents: bool,
    pub include_memories: bool,
    pub limit: usize,
    /// Token budget for the synthesized summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
    /// Page size for chunked retrieval on large corpora.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self {
            include_episodes: true,
            include_documents: true,
            include_memories: true,
            limit: 20,
            max_tokens: None,
            chunk_size: None,
        }
    }
}

/// Synthesized retrieval context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSynthesis {
    pub summary: String,
    pub relevant_memories: Vec<MemoryRecord>,
    pub relevance_score: f64,
}

/// A memory recall query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallQuery {
    pub query: String,
    pub limit: usize,
    /// Restrict to one kind; `None` recalls across kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MemoryKind>,
}

impl RecallQuery {
    pub fn new(query: impl Into<String>, limit: usize) -> Self {
        Self {
            query: query.into(),
            limit,
            kind: None,
        }
    }

    pub fn with_kind(mut self, kind: MemoryKind) -> Self {
        self.kind = Some(kind);
        self
    }
}

/// Port interface for the memory store.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Recall records relevant to a query.
    async fn recall_memory(
        &self,
        tenant: &TenantContext,
        query: RecallQuery,
    ) -> CoreResult<Vec<MemoryRecord>>;

    /// Build a bounded retrieval context for a query.
    async fn synthesize_context(
        &self,
        tenant: &TenantContext,
        query: &str,
        opts: SynthesisOptions,
    ) -> CoreResult<ContextSynthesis>;

    /// Store an episode (timeline pointer).
    async fn store_episode(
        &self,
        tenant: &TenantContext,
        content: String,
        metadata: HashMap<String, serde_json::Value>,
    ) -> CoreResult<String>;

    /// Store a document; returns the document id. This is the engine's
    /// one fatal durability write.
    async fn store_document(
        &self,
        tenant: &TenantContext,
        content: String,
        metadata: HashMap<String, serde_json::Value>,
    ) -> CoreResult<String>;

    /// Fetch a document back by id.
    async fn get_document(
        &self,
        tenant: &TenantContext,
        doc_id: &str,
    ) -> CoreResult<Option<MemoryRecord>>;

    /// Store a free-form memory entry.
    async fn store_memory(
        &self,
        tenant: &TenantContext,
        kind: MemoryKind,
        content: String,
        metadata: HashMap<String, serde_json::Value>,
    ) -> CoreResult<String>;

    /// Append a message to a conversation thread.
    async fn append_thread_message(
        &self,
        tenant: &TenantContext,
        thread_id: uuid::Uuid,
        role: &str,
        content: &str,
    ) -> CoreResult<()>;

    /// Delete records stored under a task's working namespace.
    async fn cleanup_task(&self, tenant: &TenantContext, task_id: uuid::Uuid) -> CoreResult<u64>;
}
