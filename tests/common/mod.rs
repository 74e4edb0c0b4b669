//! Shared test harness: a scripted gateway and engine wiring over the
//! in-memory adapters.
#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use nexus::domain::errors::{CoreError, CoreResult};
use nexus::domain::models::config::Config;
use nexus::domain::models::{RoomKey, StreamEvent};
use nexus::domain::ports::model_gateway::{
    ChunkStream, CompletionChunk, CompletionRequest, CompletionResponse, ModelGateway, ModelInfo,
    ModelPricing,
};
use nexus::infrastructure::jobstore::InMemoryJobStore;
use nexus::infrastructure::memory::InMemoryMemoryStore;
use nexus::services::stream_hub::SessionHandle;
use nexus::Engine;

/// Deterministic gateway covering the catalog, the meta-analyzer, agent
/// streams, arbitration, and synthesis.
pub struct ScriptedGateway {
    /// Number of profiles the meta-analyzer emits.
    pub profile_count: AtomicUsize,
    /// The first N streamed completions fail with a 503.
    pub fail_first_streams: AtomicU32,
    /// When set, streamed completions never yield a chunk.
    pub hang_streams: AtomicBool,
    pub stream_calls: AtomicU32,
}

impl Default for ScriptedGateway {
    fn default() -> Self {
        Self {
            profile_count: AtomicUsize::new(1),
            fail_first_streams: AtomicU32::new(0),
            hang_streams: AtomicBool::new(false),
            stream_calls: AtomicU32::new(0),
        }
    }
}

impl ScriptedGateway {
    pub fn with_profiles(count: usize) -> Self {
        let gateway = Self::default();
        gateway.profile_count.store(count, Ordering::SeqCst);
        gateway
    }

    fn profiles_json(&self) -> String {
        let roles = ["research", "coding", "review", "specialist", "synthesis"];
        let count = self.profile_count.load(Ordering::SeqCst).max(1);
        let profiles: Vec<String> = (0..count)
            .map(|i| {
                format!(
                    r#"{{"role": "{}", "specialization": "area {i}", "focus": "part {i}", "priority": {}, "reasoning_depth": "medium"}}"#,
                    roles[i % roles.len()],
                    5 + (i % 3)
                )
            })
            .collect();
        format!("[{}]", profiles.join(","))
    }
}

#[async_trait]
impl ModelGateway for ScriptedGateway {
    async fn list_models(&self) -> CoreResult<Vec<ModelInfo>> {
        let make = |id: &str, price: f64| ModelInfo {
            id: id.to_string(),
            name: id.to_string(),
            context_length: 128_000,
            pricing: ModelPricing {
                prompt: price,
                completion: price,
            },
            capabilities: vec![],
            moderated: false,
        };
        Ok(vec![
            make("anthropic/claude-opus-4.6", 0.015),
            make("anthropic/claude-sonnet-4.5", 0.003),
            make("openai/gpt-5", 0.01),
            make("mistralai/mistral-large", 0.004),
            make("google/gemini-ultra", 0.008),
        ])
    }

    async fn complete(&self, request: CompletionRequest) -> CoreResult<CompletionResponse> {
        let system = request
            .messages
            .iter()
            .find(|m| matches!(m.role, nexus::domain::ports::ChatRole::System))
            .map(|m| m.content.as_str())
            .unwrap_or("");

        let content = if system.contains("design cohorts") {
            self.profiles_json()
        } else if system.contains("arbiter") {
            "Position A stands.".to_string()
        } else if system.contains("synthesis agent") {
            "Synthesized: the agents agree on the final answer.".to_string()
        } else {
            "Short answer.".to_string()
        };
        Ok(CompletionResponse {
            model_id: request.model_id,
            content,
            tokens_used: 11,
        })
    }

    async fn complete_stream(&self, request: CompletionRequest) -> CoreResult<ChunkStream> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_streams.load(Ordering::SeqCst) {
            return Ok(futures::stream::pending().boxed());
        }
        let remaining = self.fail_first_streams.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .fail_first_streams
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(CoreError::TransientUpstream {
                message: "upstream connection reset".into(),
                status: Some(503),
            });
        }

        let chunks = vec![
            Ok(CompletionChunk {
                delta: format!("output of {} ", request.model_id),
                tokens_used: None,
            }),
            Ok(CompletionChunk {
                delta: "covering the shared objective with common terms".to_string(),
                tokens_used: Some(17),
            }),
        ];
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn health_check(&self) -> CoreResult<bool> {
        Ok(true)
    }
}

/// A fully wired engine plus handles to the adapters for assertions.
pub struct Harness {
    pub engine: Arc<Engine>,
    pub gateway: Arc<ScriptedGateway>,
    pub memory: Arc<InMemoryMemoryStore>,
    pub job_store: Arc<InMemoryJobStore>,
}

/// Test config: fast retries, small adaptive windows left at defaults
/// unless the test overrides.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.retry.base_delay_ms = 5;
    config.retry.max_retry_delay_ms = 20;
    config.spawner.timeout_ms = 2_000;
    config.spawner.retry_on_failure = false;
    config
}

pub async fn harness_with(config: Config, gateway: ScriptedGateway) -> Harness {
    let gateway = Arc::new(gateway);
    let memory = Arc::new(InMemoryMemoryStore::new());
    let job_store = Arc::new(InMemoryJobStore::new());
    let analytics = Arc::new(
        nexus::infrastructure::analytics::SqliteAnalyticsStore::open_in_memory()
            .await
            .expect("in-memory analytics"),
    );
    let engine = Arc::new(Engine::new(
        config,
        Arc::clone(&gateway) as Arc<dyn ModelGateway>,
        Arc::clone(&memory) as Arc<dyn nexus::domain::ports::MemoryStore>,
        Arc::clone(&job_store) as Arc<dyn nexus::domain::ports::JobStore>,
        analytics,
    ));
    Harness {
        engine,
        gateway,
        memory,
        job_store,
    }
}

/// Subscribe a session to a task room before submission.
pub async fn watch_task(engine: &Arc<Engine>, task_id: Uuid) -> SessionHandle {
    let hub = engine.stream_hub();
    let mut handle = hub.create_session().await;
    let _ = handle.rx.recv().await; // welcome
    hub.subscribe(handle.session_id, RoomKey::Task(task_id), vec![])
        .await
        .expect("subscribe");
    let _ = handle.rx.recv().await; // subscribed
    handle
}

/// Drain every frame currently buffered (with a short grace for
/// stragglers) and return the event wire names in order.
pub async fn drain_events(handle: &mut SessionHandle) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_millis(100), handle.rx.recv()).await {
            Ok(Some(delivery)) => events.push(delivery.frame.event),
            _ => break,
        }
    }
    events
}

pub fn event_names(events: &[StreamEvent]) -> Vec<&'static str> {
    events.iter().map(StreamEvent::wire_name).collect()
}
