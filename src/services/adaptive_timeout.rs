//! Progress-driven stall and hang detection.
//!
//! Distinct from the hard abort deadline: a per-task monitor watches byte
//! and chunk progress, emits `stall` when a task goes quiet and `hung`
//! when it stays quiet, and keeps per-(model, complexity) completion
//! history for timeout estimation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::models::config::AdaptiveTimeoutConfig;
use crate::domain::models::Complexity;

/// Signal emitted by the monitor. `Stall` is informational; `Hung` is the
/// cue for cancellation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressSignal {
    Stall { task_id: Uuid, idle_ms: u64 },
    Hung { task_id: Uuid, idle_ms: u64 },
}

struct MonitorEntry {
    model_id: String,
    complexity: Complexity,
    started: Instant,
    last_progress: Instant,
    bytes: u64,
    chunks: u64,
    stall_emitted: bool,
    hung_emitted: bool,
    tx: mpsc::UnboundedSender<ProgressSignal>,
}

/// Per-task progress monitor with historical completion estimates.
pub struct AdaptiveTimeoutManager {
    config: AdaptiveTimeoutConfig,
    tasks: Mutex<HashMap<Uuid, MonitorEntry>>,
    /// EMA of observed completion times per (model, complexity).
    history: Mutex<HashMap<(String, Complexity), f64>>,
}

impl AdaptiveTimeoutManager {
    pub fn new(config: AdaptiveTimeoutConfig) -> Self {
        Self {
            config,
            tasks: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Begin monitoring a task. The returned receiver yields stall/hung
    /// signals until the task completes or is forgotten.
    pub async fn start_monitoring(
        &self,
        task_id: Uuid,
        model_id: impl Into<String>,
        complexity: Complexity,
    ) -> mpsc::UnboundedReceiver<ProgressSignal> {
        let (tx, rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        self.tasks.lock().await.insert(
            task_id,
            MonitorEntry {
                model_id: model_id.into(),
                complexity,
                started: now,
                last_progress: now,
                bytes: 0,
                chunks: 0,
                stall_emitted: false,
                hung_emitted: false,
                tx,
            },
        );
        rx
    }

    /// Feed observed progress. Any progress resets the quiet window and
    /// re-arms the stall signal.
    pub async fn update_progress(&self, task_id: Uuid, byte_delta: u64, chunk_delta: u64) {
        if let Some(entry) = self.tasks.lock().await.get_mut(&task_id) {
            entry.bytes += byte_delta;
            entry.chunks += chunk_delta;
            entry.last_progress = Instant::now();
            entry.stall_emitted = false;
        }
    }

    /// Record a successful completion into the historical store and stop
    /// monitoring.
    pub async fn complete_task(&self, task_id: Uuid) {
        let entry = self.tasks.lock().await.remove(&task_id);
        if let Some(entry) = entry {
            #[allow(clippy::cast_precision_loss)]
            let observed_ms = entry.started.elapsed().as_millis() as f64;
            let key = (entry.model_id, entry.complexity);
            let mut history = self.history.lock().await;
            let ema = history
                .entry(key)
                .and_modify(|prev| {
                    *prev = self.config.ema_alpha * observed_ms
                        + (1.0 - self.config.ema_alpha) * *prev;
                })
                .or_insert(observed_ms);
            debug!(task_id = %task_id, observed_ms, ema_ms = *ema, "completion recorded");
        }
    }

    /// Stop monitoring without recording an observation (failure, cancel).
    pub async fn forget(&self, task_id: Uuid) {
        self.tasks.lock().await.remove(&task_id);
    }

    /// Recent-history estimate for (model, complexity), or the per-
    /// complexity default when no history exists.
    pub async fn estimated_completion_time(
        &self,
        model_id: &str,
        complexity: Complexity,
    ) -> Duration {
        let history = self.history.lock().await;
        match history.get(&(model_id.to_string(), complexity)) {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            Some(ema_ms) => Duration::from_millis(*ema_ms as u64),
            None => Duration::from_millis(complexity.default_estimate_ms()),
        }
    }

    /// One monitor pass: emit stall/hung for tasks past their quiet
    /// windows. Windows scale with complexity.
    pub async fn sweep(&self) {
        let mut tasks = self.tasks.lock().await;
        for (task_id, entry) in tasks.iter_mut() {
            let idle = entry.last_progress.elapsed();
            #[allow(clippy::cast_possible_truncation)]
            let idle_ms = idle.as_millis() as u64;
            let multiplier = Self::complexity_multiplier(entry.complexity);
            let stall_window = Self::scaled(self.config.stall_window_ms, multiplier);
            let hang_window = Self::scaled(self.config.hang_window_ms, multiplier);

            if !entry.hung_emitted && idle >= hang_window {
                entry.hung_emitted = true;
                warn!(task_id = %task_id, idle_ms, "task hung: no progress past hang window");
                let _ = entry.tx.send(ProgressSignal::Hung {
                    task_id: *task_id,
                    idle_ms,
                });
            } else if !entry.stall_emitted && idle >= stall_window {
                entry.stall_emitted = true;
                debug!(task_id = %task_id, idle_ms, "task stalled");
                let _ = entry.tx.send(ProgressSignal::Stall {
                    task_id: *task_id,
                    idle_ms,
                });
            }
        }
    }

    /// Spawn the periodic sweep loop.
    pub fn start_monitor_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let interval = Duration::from_millis(self.config.sweep_interval_ms.max(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match manager.upgrade() {
                    Some(manager) => manager.sweep().await,
                    None => break,
                }
            }
        })
    }

    /// Quiet windows grow with complexity; extreme tasks get the largest.
    fn complexity_multiplier(complexity: Complexity) -> f64 {
        match complexity {
            Complexity::Simple => 1.0,
            Complexity::Medium => 1.5,
            Complexity::Complex => 2.0,
            Complexity::Extreme => 4.0,
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    fn scaled(base_ms: u64, multiplier: f64) -> Duration {
        Duration::from_millis((base_ms as f64 * multiplier) as u64)
    }
}
