//! Crash recovery: pending checkpoints replay to exactly one durable
//! artifact and one commit.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use common::{fast_config, ScriptedGateway};
use nexus::domain::models::config::CheckpointConfig;
use nexus::domain::models::{Checkpoint, CheckpointState};
use nexus::domain::ports::{JobStore, MemoryStore, ModelGateway};
use nexus::infrastructure::jobstore::InMemoryJobStore;
use nexus::infrastructure::memory::InMemoryMemoryStore;
use nexus::services::CheckpointService;
use nexus::{Engine, TenantContext};

fn tenant() -> TenantContext {
    TenantContext::new("acme", "ops")
}

/// Simulate the crashed process: write the artifact document and leave a
/// pending (uncommitted) checkpoint behind.
async fn simulate_crash(
    memory: &Arc<InMemoryMemoryStore>,
    job_store: &Arc<InMemoryJobStore>,
    task_id: Uuid,
    write_document: bool,
) {
    let synthesis = serde_json::json!({
        "tenant": tenant(),
        "objective": "recover me",
        "final_output": "the synthesized artifact",
        "consensus_strength": 0.8,
        "confidence_score": 0.7,
    });

    if write_document {
        let metadata = HashMap::from([
            ("task_id".to_string(), serde_json::json!(task_id.to_string())),
            ("type".to_string(), serde_json::json!("final_artifact")),
        ]);
        memory
            .store_document(&tenant(), "the synthesized artifact".to_string(), metadata)
            .await
            .unwrap();
    }

    let checkpoints = CheckpointService::new(
        Arc::clone(job_store) as Arc<dyn JobStore>,
        CheckpointConfig::default(),
    );
    let checkpoint = Checkpoint::new(task_id, synthesis, 3, 0.8, "anthropic/claude-opus-4.6");
    checkpoints.write_checkpoint(&checkpoint).await.unwrap();
}

async fn engine_over(
    memory: Arc<InMemoryMemoryStore>,
    job_store: Arc<InMemoryJobStore>,
) -> Arc<Engine> {
    let gateway = Arc::new(ScriptedGateway::default());
    let analytics = Arc::new(
        nexus::infrastructure::analytics::SqliteAnalyticsStore::open_in_memory()
            .await
            .unwrap(),
    );
    Arc::new(Engine::new(
        fast_config(),
        gateway as Arc<dyn ModelGateway>,
        memory as Arc<dyn MemoryStore>,
        job_store as Arc<dyn JobStore>,
        analytics,
    ))
}

#[tokio::test]
async fn test_crash_between_document_and_commit() {
    let memory = Arc::new(InMemoryMemoryStore::new());
    let job_store = Arc::new(InMemoryJobStore::new());
    let task_id = Uuid::new_v4();

    // Crash after the document write, before the commit.
    simulate_crash(&memory, &job_store, task_id, true).await;
    assert_eq!(memory.record_count(&tenant()).await, 1);

    // Restart: recovery commits exactly once and does not duplicate the
    // document (P6).
    let engine = engine_over(Arc::clone(&memory), Arc::clone(&job_store)).await;
    let report = engine.start().await;
    assert_eq!(report.recovered, 1);
    assert_eq!(report.skipped, 0);

    assert_eq!(
        memory.record_count(&tenant()).await,
        1,
        "replay must not create a second artifact"
    );

    let checkpoints = CheckpointService::new(
        Arc::clone(&job_store) as Arc<dyn JobStore>,
        CheckpointConfig::default(),
    );
    assert!(checkpoints.list_pending_checkpoints().await.unwrap().is_empty());
    let committed = checkpoints.get_checkpoint(task_id).await.unwrap().unwrap();
    assert_eq!(committed.state, CheckpointState::Committed);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_crash_before_document_write() {
    let memory = Arc::new(InMemoryMemoryStore::new());
    let job_store = Arc::new(InMemoryJobStore::new());
    let task_id = Uuid::new_v4();

    // Crash before the document made it out.
    simulate_crash(&memory, &job_store, task_id, false).await;
    assert_eq!(memory.record_count(&tenant()).await, 0);

    let engine = engine_over(Arc::clone(&memory), Arc::clone(&job_store)).await;
    let report = engine.start().await;
    assert_eq!(report.recovered, 1);

    // Recovery completed the persistence this time.
    assert_eq!(memory.record_count(&tenant()).await, 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_unrecoverable_checkpoint_skipped() {
    let memory = Arc::new(InMemoryMemoryStore::new());
    let job_store = Arc::new(InMemoryJobStore::new());
    let task_id = Uuid::new_v4();

    simulate_crash(&memory, &job_store, task_id, false).await;
    memory.set_fail_documents(true);

    let engine = engine_over(Arc::clone(&memory), Arc::clone(&job_store)).await;
    let report = engine.start().await;
    assert_eq!(report.recovered, 0);
    assert_eq!(report.skipped, 1);

    // The checkpoint survives for the next startup.
    let checkpoints = CheckpointService::new(
        Arc::clone(&job_store) as Arc<dyn JobStore>,
        CheckpointConfig::default(),
    );
    assert_eq!(checkpoints.list_pending_checkpoints().await.unwrap().len(), 1);
    engine.shutdown().await;
}
