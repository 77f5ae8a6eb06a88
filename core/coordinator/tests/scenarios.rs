//! End-to-end scenarios: monitors feeding a coordinator in one process.

use std::sync::Arc;
use std::time::Duration;

use chat_tally_protocol::{GlobalAggregate, SyncMessage};
use tally_coordinator::persistence::{Entries, KvStore};
use tally_coordinator::{Coordinator, CoordinatorHandle, MemoryKv, RecordingBadge};
use tally_core::{
    normalize_all, ExtractionConfig, Extractor, FeedSender, FeedSource, Monitor, MonitorHandle,
    MonitorSettings, Node, Outbox,
};

fn spawn_coordinator() -> (CoordinatorHandle, RecordingBadge) {
    let badge = RecordingBadge::new();
    let (coordinator, handle) = Coordinator::new(Box::new(badge.clone()), "#9146ff");
    tokio::spawn(coordinator.run());
    (handle, badge)
}

/// Feed whose container is always present and starts with `existing` units.
struct StaticFeed {
    existing: Vec<Node>,
}

impl FeedSource for StaticFeed {
    fn locate_container(&mut self) -> bool {
        true
    }

    fn existing_units(&self) -> Vec<Node> {
        self.existing.clone()
    }
}

fn message(user: &str) -> Node {
    Node::element("div")
        .with_class("chat-line__message")
        .with_child(
            Node::element("span")
                .with_class("chat-author__display-name")
                .with_text(user),
        )
}

fn spawn_monitor(
    session_id: &str,
    existing: &[&str],
    outbox: Arc<dyn Outbox>,
) -> (MonitorHandle, FeedSender) {
    let feed = StaticFeed {
        existing: existing.iter().map(|user| message(user)).collect(),
    };
    let (feed_sender, feed_events) = FeedSender::channel();
    let extractor = Extractor::from_config(&ExtractionConfig::default()).expect("extractor");
    let (monitor, handle) = Monitor::new(
        session_id,
        MonitorSettings::default(),
        extractor,
        feed,
        feed_events,
        outbox,
    );
    tokio::spawn(monitor.run());
    (handle, feed_sender)
}

/// Waits for both monitors and the coordinator to drain their queues.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn overlapping_sessions_union_without_double_counting() {
    let (coordinator, _) = spawn_coordinator();
    let outbox: Arc<dyn Outbox> = Arc::new(coordinator.clone());
    let (one, _) = spawn_monitor("tab-1", &["a", "b"], Arc::clone(&outbox));
    let (two, _) = spawn_monitor("tab-2", &["B", "c"], Arc::clone(&outbox));

    one.enable();
    two.enable();
    settle().await;

    assert_eq!(
        coordinator.global().await.expect("global"),
        GlobalAggregate {
            total_unique_identities: 3,
            active_session_count: 2
        }
    );
    let first = coordinator.session("tab-1").await.expect("query");
    assert_eq!(first.map(|s| s.user_count), Some(2));
}

#[tokio::test(start_paused = true)]
async fn disabled_session_leaves_the_aggregate() {
    let (coordinator, _) = spawn_coordinator();
    let outbox: Arc<dyn Outbox> = Arc::new(coordinator.clone());
    let (one, _) = spawn_monitor("tab-1", &["a", "b"], Arc::clone(&outbox));
    let (two, _) = spawn_monitor("tab-2", &["c"], Arc::clone(&outbox));
    one.enable();
    two.enable();
    settle().await;

    two.disable();
    settle().await;

    let global = coordinator.global().await.expect("global");
    assert_eq!(global.total_unique_identities, 2);
    assert_eq!(global.active_session_count, 1);
    let stopped = coordinator.session("tab-2").await.expect("query").expect("session");
    assert_eq!(stopped.user_count, 1);
    assert!(!stopped.active);
}

#[tokio::test(start_paused = true)]
async fn stopped_monitor_leaves_the_aggregate() {
    let (coordinator, _) = spawn_coordinator();
    let outbox: Arc<dyn Outbox> = Arc::new(coordinator.clone());
    let (one, _) = spawn_monitor("tab-1", &["a", "b"], Arc::clone(&outbox));
    let (two, _) = spawn_monitor("tab-2", &["c"], Arc::clone(&outbox));
    one.enable();
    two.enable();
    settle().await;

    one.shutdown();
    drop(two);
    settle().await;

    assert_eq!(coordinator.global().await.expect("global"), GlobalAggregate::default());
    let stopped = coordinator.session("tab-1").await.expect("query").expect("session");
    assert!(!stopped.active);
    assert_eq!(stopped.user_count, 2);
}

#[tokio::test(start_paused = true)]
async fn clear_while_observing_mirrors_to_coordinator() {
    let (coordinator, badge) = spawn_coordinator();
    let (monitor, feed) = spawn_monitor("tab-1", &[], Arc::new(coordinator.clone()));
    monitor.refresh_exclusions(normalize_all(["nightbot"]));
    monitor.enable();
    settle().await;
    feed.batch(
        ["a", "b", "c", "d", "e", "nightbot"]
            .iter()
            .map(|user| message(user))
            .collect(),
    );
    settle().await;

    let before = coordinator.session("tab-1").await.expect("query").expect("session");
    assert_eq!(before.user_count, 5);
    assert_eq!(badge.last_text().as_deref(), Some("5"));

    monitor.clear();
    settle().await;

    let after = coordinator.session("tab-1").await.expect("query").expect("session");
    assert_eq!(after.user_count, 0);
    assert!(!after.active);
    assert!(after.started_at.is_none());
    assert_eq!(after.excluded_identities, vec!["nightbot"]);
    assert_eq!(badge.last_text().as_deref(), Some(""));
    assert_eq!(coordinator.global().await.expect("global"), GlobalAggregate::default());
}

#[tokio::test(start_paused = true)]
async fn retroactive_exclusion_reaches_coordinator() {
    let (coordinator, _) = spawn_coordinator();
    let (monitor, _) = spawn_monitor(
        "tab-1",
        &["alice", "spambot", "bob"],
        Arc::new(coordinator.clone()),
    );
    monitor.enable();
    settle().await;
    assert_eq!(coordinator.global().await.expect("global").total_unique_identities, 3);

    monitor.refresh_exclusions(normalize_all(["spambot"]));
    settle().await;

    let session = coordinator.session("tab-1").await.expect("query").expect("session");
    assert_eq!(session.unique_identities, vec!["alice", "bob"]);
    assert_eq!(coordinator.global().await.expect("global").total_unique_identities, 2);
}

#[tokio::test]
async fn broadcast_without_subscribers_is_a_noop() {
    let (coordinator, _) = spawn_coordinator();
    coordinator.apply(SyncMessage::SessionCleared {
        session_id: "tab-1".to_string(),
    });

    let session = coordinator.session("tab-1").await.expect("query");
    assert!(session.is_some());
}

#[tokio::test]
async fn subscribers_see_every_mutation() {
    let (coordinator, _) = spawn_coordinator();
    let mut first = coordinator.subscribe();
    let mut second = coordinator.subscribe();

    coordinator.apply(SyncMessage::WatchStarted {
        session_id: "tab-1".to_string(),
        started_at: "2026-01-31T00:00:00Z".to_string(),
    });
    assert!(coordinator.evict("tab-1").await.expect("evict"));

    for receiver in [&mut first, &mut second] {
        let started = receiver.recv().await.expect("update");
        assert_eq!(started.cause, "watch_started");
        assert_eq!(started.global.active_session_count, 1);
        let evicted = receiver.recv().await.expect("update");
        assert_eq!(evicted.cause, "evicted");
        assert!(evicted.session.is_none());
    }
}

#[tokio::test]
async fn mirror_restores_into_fresh_coordinator() {
    let storage = MemoryKv::new();
    let badge = RecordingBadge::new();
    let (coordinator, handle) = Coordinator::new(Box::new(badge.clone()), "#9146ff");
    tokio::spawn(coordinator.with_persistence(Box::new(storage.clone())).run());

    handle.apply(SyncMessage::IdentityAccepted {
        session_id: "tab-1".to_string(),
        identity: "alice".to_string(),
        is_new: true,
        current_count: 1,
    });
    handle.apply(SyncMessage::SubjectChanged {
        session_id: "tab-1".to_string(),
        subject_label: Some("somestreamer".to_string()),
    });
    let before_restart = handle.session("tab-1").await.expect("query").expect("session");
    handle.shutdown();

    let global = storage.get("global", &[]).expect("global scope");
    assert_eq!(global.get("totalUniqueIdentities"), Some(&serde_json::json!(0)));

    let (restored, handle) = Coordinator::new(Box::new(badge), "#9146ff");
    tokio::spawn(restored.with_persistence(Box::new(storage)).run());
    let session = handle.session("tab-1").await.expect("query").expect("session");
    assert_eq!(session, before_restart);
}

/// Storage that refuses every operation.
struct BrokenStorage;

impl KvStore for BrokenStorage {
    fn get(&self, _scope: &str, _keys: &[&str]) -> Result<Entries, String> {
        Err("disk unavailable".to_string())
    }

    fn set(&self, _scope: &str, _entries: &Entries) -> Result<(), String> {
        Err("disk unavailable".to_string())
    }

    fn remove_scope(&self, _scope: &str) -> Result<(), String> {
        Err("disk unavailable".to_string())
    }

    fn scopes(&self) -> Result<Vec<String>, String> {
        Err("disk unavailable".to_string())
    }
}

#[tokio::test]
async fn storage_failures_keep_memory_authoritative() {
    let (coordinator, handle) = Coordinator::new(Box::new(RecordingBadge::new()), "#9146ff");
    tokio::spawn(coordinator.with_persistence(Box::new(BrokenStorage)).run());

    handle.apply(SyncMessage::WatchStarted {
        session_id: "tab-1".to_string(),
        started_at: "2026-01-31T00:00:00Z".to_string(),
    });
    handle.apply(SyncMessage::IdentityAccepted {
        session_id: "tab-1".to_string(),
        identity: "alice".to_string(),
        is_new: true,
        current_count: 1,
    });

    assert_eq!(
        handle.global().await.expect("global"),
        GlobalAggregate {
            total_unique_identities: 1,
            active_session_count: 1
        }
    );
    assert!(handle.evict("tab-1").await.expect("evict"));
}
