//! In-memory memory store.
//!
//! Reference implementation of the `MemoryStore` port. Records are keyed
//! under the tenant scope; recall ranks by token overlap decayed by age,
//! an approximation of retrievability good enough for wiring and tests.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::TenantContext;
use crate::domain::ports::{
    ContextSynthesis, MemoryKind, MemoryRecord, MemoryStore, RecallQuery, SynthesisOptions,
};

#[derive(Clone)]
struct StoredRecord {
    record: MemoryRecord,
    /// Task working namespace, when the record belongs to one.
    task_id: Option<Uuid>,
}

#[derive(Default)]
struct StoreInner {
    /// tenant scope key -> records.
    records: HashMap<String, Vec<StoredRecord>>,
    /// tenant scope key -> thread id -> (role, content) messages.
    threads: HashMap<String, HashMap<Uuid, Vec<(String, String)>>>,
}

/// In-memory `MemoryStore`.
#[derive(Default)]
pub struct InMemoryMemoryStore {
    inner: Mutex<StoreInner>,
    /// When set, document writes fail. Lets tests exercise the fatal
    /// durability path.
    fail_documents: std::sync::atomic::AtomicBool,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make future document writes fail (or succeed again).
    pub fn set_fail_documents(&self, fail: bool) {
        self.fail_documents
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// Messages of one thread, for assertions.
    pub async fn thread_messages(
        &self,
        tenant: &TenantContext,
        thread_id: Uuid,
    ) -> Vec<(String, String)> {
        self.inner
            .lock()
            .await
            .threads
            .get(&tenant.scope_key())
            .and_then(|threads| threads.get(&thread_id))
            .cloned()
            .unwrap_or_default()
    }

    /// Count of records stored for a tenant, for isolation assertions.
    pub async fn record_count(&self, tenant: &TenantContext) -> usize {
        self.inner
            .lock()
            .await
            .records
            .get(&tenant.scope_key())
            .map_or(0, Vec::len)
    }

    async fn insert(
        &self,
        tenant: &TenantContext,
        kind: MemoryKind,
        content: String,
        metadata: HashMap<String, serde_json::Value>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let task_id = metadata
            .get("task_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok());
        let record = MemoryRecord {
            id: id.clone(),
            kind,
            content,
            metadata,
            score: 1.0,
            created_at: Utc::now(),
        };
        self.inner
            .lock()
            .await
            .records
            .entry(tenant.scope_key())
            .or_default()
            .push(StoredRecord { record, task_id });
        id
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn recall_memory(
        &self,
        tenant: &TenantContext,
        query: RecallQuery,
    ) -> CoreResult<Vec<MemoryRecord>> {
        let inner = self.inner.lock().await;
        let Some(records) = inner.records.get(&tenant.scope_key()) else {
            return Ok(Vec::new());
        };

        let query_tokens = tokenize(&query.query);
        let now = Utc::now();
        let mut scored: Vec<MemoryRecord> = records
            .iter()
            .filter(|s| query.kind.is_none_or(|k| s.record.kind == k))
            .map(|s| {
                let overlap = overlap_score(&query_tokens, &tokenize(&s.record.content));
                // Exponential age decay with a one-day half-life.
                let age_days = (now - s.record.created_at).num_seconds() as f64 / 86_400.0;
                let retrievability = 0.5_f64.powf(age_days);
                let mut record = s.record.clone();
                record.score = overlap * 0.8 + retrievability * 0.2;
                record
            })
            .filter(|r| r.score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(query.limit);
        Ok(scored)
    }

    async fn synthesize_context(
        &self,
        tenant: &TenantContext,
        query: &str,
        opts: SynthesisOptions,
    ) -> CoreResult<ContextSynthesis> {
        let mut recalled = self
            .recall_memory(tenant, RecallQuery::new(query, opts.limit))
            .await?;
        recalled.retain(|r| match r.kind {
            MemoryKind::Episode => opts.include_episodes,
            MemoryKind::Document => opts.include_documents,
            MemoryKind::Memory | MemoryKind::Pattern => opts.include_memories,
        });

        // Rough 4-chars-per-token budget on the summary.
        let budget_chars = opts.max_tokens.map_or(usize::MAX, |t| t.saturating_mul(4));
        let mut summary = String::new();
        for record in &recalled {
            let chunk = opts
                .chunk_size
                .map_or_else(|| record.content.clone(), |n| record.content.chars().take(n).collect());
            if summary.len() + chunk.len() + 1 > budget_chars {
                break;
            }
            summary.push_str(&chunk);
            summary.push('\n');
        }

        let relevance_score = recalled.first().map_or(0.0, |r| r.score);
        Ok(ContextSynthesis {
            summary,
            relevant_memories: recalled,
            relevance_score,
        })
    }

    async fn store_episode(
        &self,
        tenant: &TenantContext,
        content: String,
        metadata: HashMap<String, serde_json::Value>,
    ) -> CoreResult<String> {
        Ok(self.insert(tenant, MemoryKind::Episode, content, metadata).await)
    }

    async fn store_document(
        &self,
        tenant: &TenantContext,
        content: String,
        metadata: HashMap<String, serde_json::Value>,
    ) -> CoreResult<String> {
        if self.fail_documents.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(CoreError::Durability("document store unavailable".into()));
        }
        // Idempotent by task: re-persisting a task's artifact returns the
        // existing document instead of duplicating it.
        if let Some(task_id) = metadata.get("task_id").and_then(|v| v.as_str()) {
            let inner = self.inner.lock().await;
            if let Some(records) = inner.records.get(&tenant.scope_key()) {
                if let Some(existing) = records.iter().find(|s| {
                    s.record.kind == MemoryKind::Document
                        && s.record
                            .metadata
                            .get("task_id")
                            .and_then(|v| v.as_str())
                            .is_some_and(|t| t == task_id)
                }) {
                    return Ok(existing.record.id.clone());
                }
            }
        }
        Ok(self.insert(tenant, MemoryKind::Document, content, metadata).await)
    }

    async fn get_document(
        &self,
        tenant: &TenantContext,
        doc_id: &str,
    ) -> CoreResult<Option<MemoryRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .records
            .get(&tenant.scope_key())
            .and_then(|records| {
                records
                    .iter()
                    .find(|s| s.record.kind == MemoryKind::Document && s.record.id == doc_id)
            })
            .map(|s| s.record.clone()))
    }

    async fn store_memory(
        &self,
        tenant: &TenantContext,
        kind: MemoryKind,
        content: String,
        metadata: HashMap<String, serde_json::Value>,
    ) -> CoreResult<String> {
        Ok(self.insert(tenant, kind, content, metadata).await)
    }

    async fn append_thread_message(
        &self,
        tenant: &TenantContext,
        thread_id: Uuid,
        role: &str,
        content: &str,
    ) -> CoreResult<()> {
        self.inner
            .lock()
            .await
            .threads
            .entry(tenant.scope_key())
            .or_default()
            .entry(thread_id)
            .or_default()
            .push((role.to_string(), content.to_string()));
        Ok(())
    }

    async fn cleanup_task(&self, tenant: &TenantContext, task_id: Uuid) -> CoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let Some(records) = inner.records.get_mut(&tenant.scope_key()) else {
            return Ok(0);
        };
        let before = records.len();
        // Documents survive cleanup; only working memory tied to the task
        // is removed.
        records.retain(|s| {
            s.record.kind == MemoryKind::Document || s.task_id != Some(task_id)
        });
        Ok((before - records.len()) as u64)
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(ToString::to_string)
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn overlap_score(query: &HashSet<String>, content: &HashSet<String>) -> f64 {
    if query.is_empty() {
        return 0.0;
    }
    let hits = query.intersection(content).count();
    hits as f64 / query.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> TenantContext {
        TenantContext::new("acme", "ops")
    }

    fn other_tenant() -> TenantContext {
        TenantContext::new("globex", "ops")
    }

    #[tokio::test]
    async fn test_tenant_isolation() {
        let store = InMemoryMemoryStore::new();
        store
            .store_memory(&tenant(), MemoryKind::Memory, "acme secret plan".into(), HashMap::new())
            .await
            .unwrap();

        let recalled = store
            .recall_memory(&other_tenant(), RecallQuery::new("secret plan", 10))
            .await
            .unwrap();
        assert!(recalled.is_empty(), "tenants never see each other's records");
        assert_eq!(store.record_count(&tenant()).await, 1);
        assert_eq!(store.record_count(&other_tenant()).await, 0);
    }

    #[tokio::test]
    async fn test_recall_ranks_by_overlap() {
        let store = InMemoryMemoryStore::new();
        store
            .store_memory(&tenant(), MemoryKind::Memory, "kubernetes deployment rollout".into(), HashMap::new())
            .await
            .unwrap();
        store
            .store_memory(&tenant(), MemoryKind::Memory, "gardening tips for spring".into(), HashMap::new())
            .await
            .unwrap();

        let recalled = store
            .recall_memory(&tenant(), RecallQuery::new("kubernetes rollout", 10))
            .await
            .unwrap();
        assert_eq!(recalled.len(), 1);
        assert!(recalled[0].content.contains("kubernetes"));
    }

    #[tokio::test]
    async fn test_document_roundtrip_and_idempotence() {
        let store = InMemoryMemoryStore::new();
        let task_id = Uuid::new_v4().to_string();
        let mut metadata = HashMap::new();
        metadata.insert("task_id".to_string(), serde_json::json!(task_id));

        let first = store
            .store_document(&tenant(), "artifact".into(), metadata.clone())
            .await
            .unwrap();
        let second = store
            .store_document(&tenant(), "artifact again".into(), metadata)
            .await
            .unwrap();
        assert_eq!(first, second, "one document per task");

        let doc = store.get_document(&tenant(), &first).await.unwrap().unwrap();
        assert_eq!(doc.content, "artifact");
    }

    #[tokio::test]
    async fn test_fail_documents_switch() {
        let store = InMemoryMemoryStore::new();
        store.set_fail_documents(true);
        let err = store
            .store_document(&tenant(), "artifact".into(), HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "durability_error");
    }

    #[tokio::test]
    async fn test_synthesis_respects_token_budget() {
        let store = InMemoryMemoryStore::new();
        for i in 0..10 {
            store
                .store_memory(
                    &tenant(),
                    MemoryKind::Memory,
                    format!("incident retrospective number {i} about database latency"),
                    HashMap::new(),
                )
                .await
                .unwrap();
        }

        let synthesis = store
            .synthesize_context(
                &tenant(),
                "database latency incident",
                SynthesisOptions {
                    max_tokens: Some(30),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(synthesis.summary.len() <= 30 * 4 + 1);
        assert!(synthesis.relevance_score > 0.0);
    }

    #[tokio::test]
    async fn test_cleanup_task_keeps_documents() {
        let store = InMemoryMemoryStore::new();
        let task_id = Uuid::new_v4();
        let mut metadata = HashMap::new();
        metadata.insert("task_id".to_string(), serde_json::json!(task_id.to_string()));

        store
            .store_memory(&tenant(), MemoryKind::Memory, "working note".into(), metadata.clone())
            .await
            .unwrap();
        store
            .store_document(&tenant(), "final artifact".into(), metadata)
            .await
            .unwrap();

        let removed = store.cleanup_task(&tenant(), task_id).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.record_count(&tenant()).await, 1);
    }

    #[tokio::test]
    async fn test_thread_messages() {
        let store = InMemoryMemoryStore::new();
        let thread = Uuid::new_v4();
        store
            .append_thread_message(&tenant(), thread, "user", "hello")
            .await
            .unwrap();
        store
            .append_thread_message(&tenant(), thread, "assistant", "hi")
            .await
            .unwrap();
        let messages = store.thread_messages(&tenant(), thread).await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].0, "user");
    }
}
