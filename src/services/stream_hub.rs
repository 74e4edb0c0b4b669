//! Session-scoped pub/sub fan-out.
//!
//! Sessions subscribe to rooms (`task:<id>`, `agent:<id>`, global) and
//! receive frames over a bounded per-session buffer. Writes beyond the
//! backpressure watermark are dropped, counted, and surfaced as a
//! `backpressure` event, so a slow subscriber never grows hub memory
//! unboundedly.

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::{HashMap, HashSet};
use std::io::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::config::StreamConfig;
use crate::domain::models::{RoomKey, SessionInfo, StreamEvent, StreamFrame, Subscription};

/// How a frame's payload is carried to the subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum FramePayload {
    /// Serialized JSON, below the compression threshold.
    Inline(String),
    /// Gzip-compressed JSON, at or above the threshold.
    Gzip(Vec<u8>),
}

/// One delivery to a session.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub frame: StreamFrame,
    pub payload: FramePayload,
}

/// Subscriber end of a session.
pub struct SessionHandle {
    pub session_id: Uuid,
    pub reconnect_token: Uuid,
    pub rx: mpsc::Receiver<Delivery>,
}

struct SessionEntry {
    info: SessionInfo,
    tx: mpsc::Sender<Delivery>,
    dropped: u64,
}

#[derive(Default)]
struct HubInner {
    sessions: HashMap<Uuid, SessionEntry>,
    /// Room membership: one entry per live subscription.
    rooms: HashMap<RoomKey, HashSet<Uuid>>,
    /// One-shot reconnect tokens.
    reconnect_tokens: HashMap<Uuid, Uuid>,
}

/// Hub counters exposed in metrics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct HubMetrics {
    pub sessions: usize,
    pub rooms: usize,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub frames_compressed: u64,
}

/// Streaming fan-out hub.
pub struct StreamHub {
    config: StreamConfig,
    inner: Mutex<HubInner>,
    sequence: AtomicU64,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    frames_compressed: AtomicU64,
}

impl StreamHub {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(HubInner::default()),
            sequence: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            frames_compressed: AtomicU64::new(0),
        }
    }

    /// Register a subscriber session. The welcome frame is already queued
    /// on the returned handle.
    pub async fn create_session(&self) -> SessionHandle {
        let session_id = Uuid::new_v4();
        let reconnect_token = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.config.buffer_capacity);

        let info = SessionInfo {
            id: session_id,
            reconnect_token,
            subscriptions: Vec::new(),
            last_ping: Utc::now(),
            connected: true,
            disconnected_at: None,
            metadata: HashMap::new(),
        };

        {
            let mut inner = self.inner.lock().await;
            inner.reconnect_tokens.insert(reconnect_token, session_id);
            inner.sessions.insert(
                session_id,
                SessionEntry {
                    info,
                    tx: tx.clone(),
                    dropped: 0,
                },
            );
        }

        let welcome = self.make_frame(
            RoomKey::Global,
            StreamEvent::Welcome {
                session_id,
                reconnect_token,
                capabilities: vec![
                    "rooms".to_string(),
                    "reconnect".to_string(),
                    "compression".to_string(),
                ],
            },
        );
        let _ = tx.try_send(self.encode(welcome));

        info!(session_id = %session_id, "stream session created");
        SessionHandle {
            session_id,
            reconnect_token,
            rx,
        }
    }

    /// Join a room. The session holds exactly one membership per
    /// subscription.
    pub async fn subscribe(
        &self,
        session_id: Uuid,
        room: RoomKey,
        filters: Vec<String>,
    ) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| CoreError::NotFound(format!("session {session_id}")))?;

        if !entry.info.subscriptions.iter().any(|s| s.room == room) {
            let mut sub = Subscription::new(room.clone());
            sub.filters = filters;
            entry.info.subscriptions.push(sub);
        }
        let confirm = self.make_frame(
            room.clone(),
            StreamEvent::Subscribed {
                room: room.as_wire(),
            },
        );
        let _ = entry.tx.try_send(self.encode(confirm));

        inner.rooms.entry(room).or_default().insert(session_id);
        Ok(())
    }

    /// Leave a room; membership and bookkeeping are both removed.
    pub async fn unsubscribe(&self, session_id: Uuid, room: &RoomKey) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| CoreError::NotFound(format!("session {session_id}")))?;

        entry.info.subscriptions.retain(|s| &s.room != room);
        let confirm = self.make_frame(
            room.clone(),
            StreamEvent::Unsubscribed {
                room: room.as_wire(),
            },
        );
        let _ = entry.tx.try_send(self.encode(confirm));

        if let Some(members) = inner.rooms.get_mut(room) {
            members.remove(&session_id);
            if members.is_empty() {
                inner.rooms.remove(room);
            }
        }
        Ok(())
    }

    /// Client ping: refreshes activity and answers with a pong frame.
    pub async fn ping(&self, session_id: Uuid) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| CoreError::NotFound(format!("session {session_id}")))?;
        entry.info.last_ping = Utc::now();
        let pong = self.make_frame(RoomKey::Global, StreamEvent::Pong);
        let _ = entry.tx.try_send(self.encode(pong));
        Ok(())
    }

    /// Mark a session disconnected. It survives for the grace window so a
    /// reconnect can restore its subscriptions.
    pub async fn disconnect(&self, session_id: Uuid) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.sessions.get_mut(&session_id) {
            entry.info.connected = false;
            entry.info.disconnected_at = Some(Utc::now());
        }
    }

    /// Redeem a reconnect token. Tokens are one-shot: a second redemption
    /// fails even with the same inputs.
    pub async fn reconnect(
        &self,
        reconnect_token: Uuid,
        old_session_id: Uuid,
    ) -> CoreResult<SessionHandle> {
        let mut inner = self.inner.lock().await;
        match inner.reconnect_tokens.remove(&reconnect_token) {
            Some(owner) if owner == old_session_id => {}
            _ => {
                return Err(CoreError::Auth("invalid reconnect token".to_string()));
            }
        }

        let old = inner
            .sessions
            .remove(&old_session_id)
            .ok_or_else(|| CoreError::NotFound(format!("session {old_session_id}")))?;

        let session_id = Uuid::new_v4();
        let new_token = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.config.buffer_capacity);

        // Re-point room memberships at the new session id.
        for sub in &old.info.subscriptions {
            if let Some(members) = inner.rooms.get_mut(&sub.room) {
                members.remove(&old_session_id);
                members.insert(session_id);
            }
        }

        let info = SessionInfo {
            id: session_id,
            reconnect_token: new_token,
            subscriptions: old.info.subscriptions,
            last_ping: Utc::now(),
            connected: true,
            disconnected_at: None,
            metadata: old.info.metadata,
        };
        inner.reconnect_tokens.insert(new_token, session_id);
        inner.sessions.insert(
            session_id,
            SessionEntry {
                info,
                tx: tx.clone(),
                dropped: 0,
            },
        );

        let welcome = self.make_frame(
            RoomKey::Global,
            StreamEvent::Welcome {
                session_id,
                reconnect_token: new_token,
                capabilities: vec!["rooms".to_string(), "reconnect".to_string()],
            },
        );
        let _ = tx.try_send(self.encode(welcome));

        Ok(SessionHandle {
            session_id,
            reconnect_token: new_token,
            rx,
        })
    }

    /// Fan an event out to a task room.
    pub async fn stream_to_task(&self, task_id: Uuid, event: StreamEvent) {
        self.publish(RoomKey::Task(task_id), event).await;
    }

    /// Fan an event out to an agent room.
    pub async fn stream_to_agent(&self, agent_id: Uuid, event: StreamEvent) {
        self.publish(RoomKey::Agent(agent_id), event).await;
    }

    /// Fan an event out to every session.
    pub async fn broadcast(&self, event: StreamEvent) {
        self.publish(RoomKey::Global, event).await;
    }

    /// Deliver an event to every member of a room, applying subscription
    /// filters and the backpressure watermark.
    pub async fn publish(&self, room: RoomKey, event: StreamEvent) {
        let frame = self.make_frame(room.clone(), event);
        let delivery = self.encode(frame);

        let mut inner = self.inner.lock().await;
        let members: Vec<Uuid> = match &room {
            RoomKey::Global => inner.sessions.keys().copied().collect(),
            key => inner
                .rooms
                .get(key)
                .map(|m| m.iter().copied().collect())
                .unwrap_or_default(),
        };

        let mut pressured: Vec<(Uuid, u64)> = Vec::new();
        for session_id in members {
            let Some(entry) = inner.sessions.get_mut(&session_id) else {
                continue;
            };
            if let Some(sub) = entry
                .info
                .subscriptions
                .iter_mut()
                .find(|s| s.room == room)
            {
                if !sub.matches(&delivery.frame.event) {
                    continue;
                }
                sub.last_activity = Utc::now();
            } else if room != RoomKey::Global {
                continue;
            }

            let buffered = self.config.buffer_capacity - entry.tx.capacity();
            if buffered >= self.config.backpressure_threshold {
                // Slow path: drop, count, and signal once per crossing.
                entry.dropped += 1;
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                pressured.push((session_id, entry.dropped));
                continue;
            }

            match entry.tx.try_send(delivery.clone()) {
                Ok(()) => {
                    self.frames_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    entry.dropped += 1;
                    self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        for (session_id, dropped) in pressured {
            let signal = self.make_frame(
                RoomKey::Global,
                StreamEvent::Backpressure {
                    session_id,
                    dropped,
                },
            );
            let encoded = self.encode(signal);
            if let Some(entry) = inner.sessions.get_mut(&session_id) {
                let _ = entry.tx.try_send(encoded);
            }
        }
    }

    /// Session bookkeeping view.
    pub async fn session_info(&self, session_id: Uuid) -> Option<SessionInfo> {
        self.inner
            .lock()
            .await
            .sessions
            .get(&session_id)
            .map(|e| e.info.clone())
    }

    /// Room membership count, for invariant checks.
    pub async fn room_members(&self, room: &RoomKey) -> usize {
        self.inner
            .lock()
            .await
            .rooms
            .get(room)
            .map_or(0, HashSet::len)
    }

    pub async fn metrics(&self) -> HubMetrics {
        let inner = self.inner.lock().await;
        HubMetrics {
            sessions: inner.sessions.len(),
            rooms: inner.rooms.len(),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_compressed: self.frames_compressed.load(Ordering::Relaxed),
        }
    }

    /// One maintenance pass: ping live sessions, sweep idle subscriptions,
    /// destroy expired disconnected sessions. Called on the maintenance
    /// loop cadence and directly from tests.
    pub async fn sweep(&self) {
        let now = Utc::now();
        let idle_cutoff = chrono::Duration::seconds(
            i64::try_from(self.config.subscription_idle_secs).unwrap_or(i64::MAX),
        );
        let grace = chrono::Duration::seconds(
            i64::try_from(self.config.session_grace_secs).unwrap_or(i64::MAX),
        );

        let mut inner = self.inner.lock().await;

        // Destroy sessions whose disconnect grace elapsed.
        let expired: Vec<Uuid> = inner
            .sessions
            .values()
            .filter(|e| {
                e.info
                    .disconnected_at
                    .is_some_and(|at| now - at > grace)
            })
            .map(|e| e.info.id)
            .collect();
        for session_id in expired {
            if let Some(entry) = inner.sessions.remove(&session_id) {
                inner.reconnect_tokens.remove(&entry.info.reconnect_token);
                for sub in &entry.info.subscriptions {
                    if let Some(members) = inner.rooms.get_mut(&sub.room) {
                        members.remove(&session_id);
                        if members.is_empty() {
                            inner.rooms.remove(&sub.room);
                        }
                    }
                }
                debug!(session_id = %session_id, "expired stream session destroyed");
            }
        }

        // Evict idle subscriptions.
        let mut evictions: Vec<(Uuid, RoomKey)> = Vec::new();
        for entry in inner.sessions.values_mut() {
            entry.info.subscriptions.retain(|sub| {
                let idle = now - sub.last_activity > idle_cutoff;
                if idle {
                    evictions.push((entry.info.id, sub.room.clone()));
                }
                !idle
            });
        }
        for (session_id, room) in evictions {
            warn!(session_id = %session_id, room = %room, "idle subscription evicted");
            if let Some(members) = inner.rooms.get_mut(&room) {
                members.remove(&session_id);
                if members.is_empty() {
                    inner.rooms.remove(&room);
                }
            }
        }

        // Ping connected sessions.
        let pong = self.make_frame(RoomKey::Global, StreamEvent::Pong);
        let encoded = self.encode(pong);
        for entry in inner.sessions.values_mut() {
            if entry.info.connected {
                let _ = entry.tx.try_send(encoded.clone());
            }
        }
    }

    /// Spawn the periodic maintenance loop. Runs until the hub is dropped
    /// by every holder.
    pub fn start_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let hub = Arc::downgrade(self);
        let interval = Duration::from_secs(self.config.ping_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match hub.upgrade() {
                    Some(hub) => hub.sweep().await,
                    None => break,
                }
            }
        })
    }

    fn make_frame(&self, room: RoomKey, event: StreamEvent) -> StreamFrame {
        StreamFrame {
            room,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            event,
        }
    }

    fn encode(&self, frame: StreamFrame) -> Delivery {
        let json = serde_json::to_string(&frame).unwrap_or_else(|_| "{}".to_string());
        let payload = if json.len() >= self.config.compress_min_bytes {
            self.frames_compressed.fetch_add(1, Ordering::Relaxed);
            let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
            if encoder.write_all(json.as_bytes()).is_ok() {
                match encoder.finish() {
                    Ok(compressed) => FramePayload::Gzip(compressed),
                    Err(_) => FramePayload::Inline(json),
                }
            } else {
                FramePayload::Inline(json)
            }
        } else {
            FramePayload::Inline(json)
        };
        Delivery { frame, payload }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub() -> StreamHub {
        StreamHub::new(StreamConfig::default())
    }

    fn small_hub(capacity: usize, threshold: usize) -> StreamHub {
        StreamHub::new(StreamConfig {
            buffer_capacity: capacity,
            backpressure_threshold: threshold,
            ..Default::default()
        })
    }

    async fn next_event(handle: &mut SessionHandle) -> StreamEvent {
        handle.rx.recv().await.expect("frame").frame.event
    }

    #[tokio::test]
    async fn test_welcome_frame() {
        let hub = hub();
        let mut handle = hub.create_session().await;
        match next_event(&mut handle).await {
            StreamEvent::Welcome { session_id, .. } => {
                assert_eq!(session_id, handle.session_id);
            }
            other => panic!("expected welcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscribe_publish_unsubscribe() {
        let hub = hub();
        let mut handle = hub.create_session().await;
        let _ = next_event(&mut handle).await; // welcome

        let task_id = Uuid::new_v4();
        let room = RoomKey::Task(task_id);
        hub.subscribe(handle.session_id, room.clone(), vec![])
            .await
            .unwrap();
        let _ = next_event(&mut handle).await; // subscribed
        assert_eq!(hub.room_members(&room).await, 1);

        hub.stream_to_task(task_id, StreamEvent::TaskStart { task_id })
            .await;
        match next_event(&mut handle).await {
            StreamEvent::TaskStart { task_id: got } => assert_eq!(got, task_id),
            other => panic!("expected task:start, got {other:?}"),
        }

        hub.unsubscribe(handle.session_id, &room).await.unwrap();
        let _ = next_event(&mut handle).await; // unsubscribed
        assert_eq!(hub.room_members(&room).await, 0);

        let info = hub.session_info(handle.session_id).await.unwrap();
        assert!(info.subscriptions.is_empty());
    }

    #[tokio::test]
    async fn test_filters_apply() {
        let hub = hub();
        let mut handle = hub.create_session().await;
        let _ = next_event(&mut handle).await;

        let task_id = Uuid::new_v4();
        let room = RoomKey::Task(task_id);
        hub.subscribe(
            handle.session_id,
            room.clone(),
            vec!["task:completed".to_string()],
        )
        .await
        .unwrap();
        let _ = next_event(&mut handle).await;

        hub.stream_to_task(task_id, StreamEvent::TaskStart { task_id })
            .await;
        hub.stream_to_task(
            task_id,
            StreamEvent::TaskCompleted {
                task_id,
                result: serde_json::json!({}),
            },
        )
        .await;

        match next_event(&mut handle).await {
            StreamEvent::TaskCompleted { .. } => {}
            other => panic!("filter should have passed only task:completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_backpressure_drops_counted() {
        let hub = small_hub(4, 2);
        let handle = hub.create_session().await;
        let task_id = Uuid::new_v4();
        hub.subscribe(handle.session_id, RoomKey::Task(task_id), vec![])
            .await
            .unwrap();

        // Never drain the receiver; flood past the watermark.
        for _ in 0..16 {
            hub.stream_to_task(task_id, StreamEvent::TaskStart { task_id })
                .await;
        }

        let metrics = hub.metrics().await;
        assert!(metrics.frames_dropped > 0, "drops must be counted");
        // The buffer never exceeds its bound regardless of flood size.
        assert!(metrics.frames_sent <= 4 + 2);
    }

    #[tokio::test]
    async fn test_reconnect_token_one_shot() {
        let hub = hub();
        let handle = hub.create_session().await;
        let task_id = Uuid::new_v4();
        hub.subscribe(handle.session_id, RoomKey::Task(task_id), vec![])
            .await
            .unwrap();
        hub.disconnect(handle.session_id).await;

        let restored = hub
            .reconnect(handle.reconnect_token, handle.session_id)
            .await
            .unwrap();
        let info = hub.session_info(restored.session_id).await.unwrap();
        assert_eq!(info.subscriptions.len(), 1);
        assert_eq!(hub.room_members(&RoomKey::Task(task_id)).await, 1);

        // Token is spent.
        assert!(hub
            .reconnect(handle.reconnect_token, handle.session_id)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_sweep_destroys_expired_sessions() {
        let hub = StreamHub::new(StreamConfig {
            session_grace_secs: 0,
            ..Default::default()
        });
        let handle = hub.create_session().await;
        let task_id = Uuid::new_v4();
        let room = RoomKey::Task(task_id);
        hub.subscribe(handle.session_id, room.clone(), vec![])
            .await
            .unwrap();

        hub.disconnect(handle.session_id).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        hub.sweep().await;

        assert!(hub.session_info(handle.session_id).await.is_none());
        assert_eq!(hub.room_members(&room).await, 0);
    }

    #[tokio::test]
    async fn test_large_frames_compressed() {
        let hub = hub();
        let mut handle = hub.create_session().await;
        let _ = handle.rx.recv().await; // welcome

        let task_id = Uuid::new_v4();
        hub.subscribe(handle.session_id, RoomKey::Task(task_id), vec![])
            .await
            .unwrap();
        let _ = handle.rx.recv().await; // subscribed

        hub.stream_to_task(
            task_id,
            StreamEvent::TaskCompleted {
                task_id,
                result: serde_json::json!({"body": "x".repeat(4096)}),
            },
        )
        .await;

        let delivery = handle.rx.recv().await.unwrap();
        assert!(matches!(delivery.payload, FramePayload::Gzip(_)));
    }
}
