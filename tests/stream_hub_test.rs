//! Stream hub round-trips and fan-out guarantees.

use std::sync::Arc;
use uuid::Uuid;

use nexus::domain::models::config::StreamConfig;
use nexus::domain::models::{RoomKey, StreamEvent};
use nexus::services::StreamHub;

async fn session(hub: &Arc<StreamHub>) -> nexus::services::SessionHandle {
    let mut handle = hub.create_session().await;
    let _ = handle.rx.recv().await; // welcome
    handle
}

#[tokio::test]
async fn test_subscribe_unsubscribe_is_neutral() {
    let hub = Arc::new(StreamHub::new(StreamConfig::default()));
    let mut handle = session(&hub).await;

    let before = hub
        .session_info(handle.session_id)
        .await
        .unwrap()
        .subscriptions
        .len();

    let room = RoomKey::Task(Uuid::new_v4());
    hub.subscribe(handle.session_id, room.clone(), vec![])
        .await
        .unwrap();
    let _ = handle.rx.recv().await;
    assert_eq!(hub.room_members(&room).await, 1);

    hub.unsubscribe(handle.session_id, &room).await.unwrap();
    let _ = handle.rx.recv().await;

    // No room membership left; subscription count back to its prior value.
    assert_eq!(hub.room_members(&room).await, 0);
    let after = hub
        .session_info(handle.session_id)
        .await
        .unwrap()
        .subscriptions
        .len();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_fanout_reaches_every_subscriber() {
    let hub = Arc::new(StreamHub::new(StreamConfig::default()));
    let task_id = Uuid::new_v4();
    let room = RoomKey::Task(task_id);

    let mut subscribers = Vec::new();
    for _ in 0..3 {
        let mut handle = session(&hub).await;
        hub.subscribe(handle.session_id, room.clone(), vec![])
            .await
            .unwrap();
        let _ = handle.rx.recv().await; // subscribed
        subscribers.push(handle);
    }

    hub.stream_to_task(task_id, StreamEvent::TaskStart { task_id })
        .await;

    for handle in &mut subscribers {
        let delivery = handle.rx.recv().await.unwrap();
        assert_eq!(delivery.frame.event.wire_name(), "task:start");
    }
}

#[tokio::test]
async fn test_per_sender_order_preserved() {
    let hub = Arc::new(StreamHub::new(StreamConfig::default()));
    let task_id = Uuid::new_v4();
    let mut handle = session(&hub).await;
    hub.subscribe(handle.session_id, RoomKey::Task(task_id), vec![])
        .await
        .unwrap();
    let _ = handle.rx.recv().await;

    for pct in [5u8, 15, 25, 70, 95, 100] {
        hub.stream_to_task(
            task_id,
            StreamEvent::TaskProgress {
                task_id,
                progress: pct,
                phase: "phase".to_string(),
                detail: None,
            },
        )
        .await;
    }

    let mut seen = Vec::new();
    for _ in 0..6 {
        if let Some(delivery) = handle.rx.recv().await {
            if let StreamEvent::TaskProgress { progress, .. } = delivery.frame.event {
                seen.push(progress);
            }
        }
    }
    assert_eq!(seen, vec![5, 15, 25, 70, 95, 100]);
}

#[tokio::test]
async fn test_agent_room_isolated_from_task_room() {
    let hub = Arc::new(StreamHub::new(StreamConfig::default()));
    let task_id = Uuid::new_v4();
    let agent_id = Uuid::new_v4();

    let mut task_watcher = session(&hub).await;
    hub.subscribe(task_watcher.session_id, RoomKey::Task(task_id), vec![])
        .await
        .unwrap();
    let _ = task_watcher.rx.recv().await;

    hub.stream_to_agent(
        agent_id,
        StreamEvent::AgentProgress {
            agent_id,
            progress: Default::default(),
        },
    )
    .await;
    hub.stream_to_task(task_id, StreamEvent::TaskStart { task_id })
        .await;

    // The task watcher sees only the task frame.
    let delivery = task_watcher.rx.recv().await.unwrap();
    assert_eq!(delivery.frame.event.wire_name(), "task:start");
}

#[tokio::test]
async fn test_bounded_memory_under_flood() {
    // Tiny buffers: a subscriber that never drains cannot grow hub memory.
    let hub = Arc::new(StreamHub::new(StreamConfig {
        buffer_capacity: 8,
        backpressure_threshold: 4,
        ..Default::default()
    }));
    let task_id = Uuid::new_v4();
    let handle = session(&hub).await;
    hub.subscribe(handle.session_id, RoomKey::Task(task_id), vec![])
        .await
        .unwrap();

    for _ in 0..1000 {
        hub.stream_to_task(task_id, StreamEvent::TaskStart { task_id })
            .await;
    }

    let metrics = hub.metrics().await;
    assert!(metrics.frames_dropped >= 990, "drops counted: {metrics:?}");
    assert!(metrics.frames_sent <= 8, "buffer never exceeds its bound");
}
