//! Monitor: the extractor host for one instance.
//!
//! A monitor is a single-task actor. It owns the live [`Session`], the
//! [`WatchMachine`], the feed source and the locate-retry timer, and it is the
//! only thing that mutates them. Commands arrive on one channel, page
//! notifications on another; every state change is reported to the
//! coordinator through a best-effort [`Outbox`].
//!
//! Locate attempts: the first runs immediately on `enable`, the rest at a
//! fixed interval until the configured maximum. Disabling or clearing while
//! searching drops the pending retry.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tracing::{debug, info, trace};

use chat_tally_protocol::{SessionSnapshot, SyncMessage};

use crate::config::WatchConfig;
use crate::extractor::{AcceptedIdentity, Extractor};
use crate::feed::{FeedEvent, FeedSource};
use crate::identity::{sorted_strings, Identity};
use crate::navigation::{NavigationChange, NavigationTracker};
use crate::outbox::Outbox;
use crate::session::Session;
use crate::subject::detect_subject;
use crate::watch::{LocateOutcome, WatchMachine, WatchState};

pub enum MonitorCommand {
    Enable,
    Disable,
    Clear,
    Restart,
    RefreshExclusions(HashSet<Identity>),
    Navigate {
        url: String,
        headings: Vec<String>,
    },
    Snapshot {
        respond_to: oneshot::Sender<MonitorSnapshot>,
    },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorSnapshot {
    pub watch: WatchState,
    pub session: SessionSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSettings {
    pub locate_interval: Duration,
    pub max_locate_attempts: u32,
}

impl From<&WatchConfig> for MonitorSettings {
    fn from(config: &WatchConfig) -> Self {
        Self {
            locate_interval: Duration::from_millis(config.locate_interval_ms),
            max_locate_attempts: config.max_locate_attempts,
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from(&WatchConfig::default())
    }
}

pub struct Monitor<F: FeedSource> {
    session: Session,
    machine: WatchMachine,
    extractor: Extractor,
    feed: F,
    outbox: Arc<dyn Outbox>,
    navigation: NavigationTracker,
    locate_interval: Duration,
    retry_at: Option<Instant>,
    commands: mpsc::UnboundedReceiver<MonitorCommand>,
    feed_events: mpsc::UnboundedReceiver<FeedEvent>,
}

impl<F: FeedSource> Monitor<F> {
    pub fn new(
        session_id: impl Into<String>,
        settings: MonitorSettings,
        extractor: Extractor,
        feed: F,
        feed_events: mpsc::UnboundedReceiver<FeedEvent>,
        outbox: Arc<dyn Outbox>,
    ) -> (Self, MonitorHandle) {
        let (sender, commands) = mpsc::unbounded_channel();
        let monitor = Self {
            session: Session::new(session_id),
            machine: WatchMachine::new(settings.max_locate_attempts),
            extractor,
            feed,
            outbox,
            navigation: NavigationTracker::new(),
            locate_interval: settings.locate_interval,
            retry_at: None,
            commands,
            feed_events,
        };
        (monitor, MonitorHandle { sender })
    }

    /// Runs until `Shutdown` or until every handle is dropped. Stopping
    /// while searching or observing reports `WatchStopped` first.
    pub async fn run(mut self) {
        info!(session_id = %self.session.session_id(), "Monitor starting");
        let mut feed_open = true;

        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(MonitorCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                event = self.feed_events.recv(), if feed_open => match event {
                    Some(event) => self.handle_feed_event(event),
                    None => feed_open = false,
                },
                () = sleep_until_deadline(retry_at) => {
                    self.retry_at = None;
                    self.attempt_locate();
                }
            }
        }

        // A monitor that goes away while watching must not stay counted.
        self.disable();
        info!(
            session_id = %self.session.session_id(),
            unique = self.session.user_count(),
            "Monitor stopped"
        );
    }

    fn handle_command(&mut self, command: MonitorCommand) {
        match command {
            MonitorCommand::Enable => self.enable(),
            MonitorCommand::Disable => self.disable(),
            MonitorCommand::Clear => self.clear(),
            MonitorCommand::Restart => {
                info!(session_id = %self.session.session_id(), "Monitoring restart requested");
                self.clear();
                self.enable();
            }
            MonitorCommand::RefreshExclusions(excluded) => self.refresh_exclusions(excluded),
            MonitorCommand::Navigate { url, headings } => self.navigate(&url, &headings),
            MonitorCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
            MonitorCommand::Shutdown => {}
        }
    }

    fn handle_feed_event(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::ContainerAvailable => {
                if self.machine.is_searching() {
                    self.retry_at = None;
                    self.attempt_locate();
                }
            }
            FeedEvent::Batch(nodes) => {
                if !self.machine.is_observing() {
                    trace!(nodes = nodes.len(), "Batch ignored while not observing");
                    return;
                }
                let accepted = self
                    .extractor
                    .observe_batch(&mut self.session, &nodes, Utc::now());
                self.emit_accepted(accepted);
            }
        }
    }

    fn enable(&mut self) {
        if !self.machine.enable() {
            debug!(
                session_id = %self.session.session_id(),
                state = ?self.machine.state(),
                "Enable ignored"
            );
            return;
        }
        info!(session_id = %self.session.session_id(), "Monitoring enabled");
        self.attempt_locate();
    }

    fn attempt_locate(&mut self) {
        let found = self.feed.locate_container();
        match self.machine.record_attempt(found) {
            LocateOutcome::Located => self.begin_observing(),
            LocateOutcome::Retry { attempt } => {
                debug!(
                    session_id = %self.session.session_id(),
                    attempt,
                    "Chat container not found; retrying"
                );
                self.retry_at = Some(Instant::now() + self.locate_interval);
            }
            LocateOutcome::Exhausted { attempts } => {
                info!(
                    session_id = %self.session.session_id(),
                    attempts,
                    "Chat container not found; monitoring inactive"
                );
                self.session.stop_watch();
            }
            LocateOutcome::Ignored => {}
        }
    }

    fn begin_observing(&mut self) {
        let now = Utc::now();
        self.retry_at = None;
        self.session.start_watch(now);
        info!(session_id = %self.session.session_id(), "Chat monitoring started");
        self.outbox.send(SyncMessage::WatchStarted {
            session_id: self.session.session_id().to_string(),
            started_at: now.to_rfc3339(),
        });

        if self.session.user_count() == 0 {
            let units = self.feed.existing_units();
            let accepted = self.extractor.backfill(&mut self.session, &units, now);
            self.emit_accepted(accepted);
        }
    }

    fn disable(&mut self) {
        self.retry_at = None;
        if self.machine.disable() == WatchState::Disabled {
            return;
        }
        self.session.stop_watch();
        info!(
            session_id = %self.session.session_id(),
            unique = self.session.user_count(),
            "Monitoring disabled"
        );
        self.outbox.send(SyncMessage::WatchStopped {
            session_id: self.session.session_id().to_string(),
        });
    }

    fn clear(&mut self) {
        self.retry_at = None;
        self.machine.clear();
        self.session.clear_watch();
        info!(session_id = %self.session.session_id(), "Session cleared");
        self.outbox.send(SyncMessage::SessionCleared {
            session_id: self.session.session_id().to_string(),
        });
    }

    fn refresh_exclusions(&mut self, excluded: HashSet<Identity>) {
        let removed = self.session.refresh_exclusions(excluded);
        info!(
            session_id = %self.session.session_id(),
            excluded = self.session.excluded().len(),
            removed,
            unique = self.session.user_count(),
            "Exclusion list refreshed"
        );
        self.outbox.send(SyncMessage::ExclusionListUpdated {
            session_id: self.session.session_id().to_string(),
            exclusions: sorted_strings(self.session.excluded()),
        });
    }

    fn navigate(&mut self, url: &str, headings: &[String]) {
        match self.navigation.observe(url) {
            NavigationChange::Unchanged => return,
            NavigationChange::Changed => {
                info!(session_id = %self.session.session_id(), url, "Navigation detected");
                self.clear();
            }
            NavigationChange::Initial => {}
        }

        self.session.subject_label = detect_subject(url, headings);
        debug!(
            session_id = %self.session.session_id(),
            subject = ?self.session.subject_label,
            "Subject detected"
        );
        self.outbox.send(SyncMessage::SubjectChanged {
            session_id: self.session.session_id().to_string(),
            subject_label: self.session.subject_label.clone(),
        });
    }

    fn emit_accepted(&self, accepted: Vec<AcceptedIdentity>) {
        for entry in accepted {
            self.outbox.send(SyncMessage::IdentityAccepted {
                session_id: self.session.session_id().to_string(),
                identity: entry.identity.into_string(),
                is_new: entry.is_new,
                current_count: entry.current_count,
            });
        }
    }

    fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            watch: self.machine.state(),
            session: self.session.snapshot(),
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Cloneable command side of a [`Monitor`]. Sends to a stopped monitor are
/// dropped.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    sender: mpsc::UnboundedSender<MonitorCommand>,
}

impl MonitorHandle {
    pub fn enable(&self) {
        self.send(MonitorCommand::Enable);
    }

    pub fn disable(&self) {
        self.send(MonitorCommand::Disable);
    }

    pub fn clear(&self) {
        self.send(MonitorCommand::Clear);
    }

    pub fn restart(&self) {
        self.send(MonitorCommand::Restart);
    }

    pub fn refresh_exclusions(&self, excluded: HashSet<Identity>) {
        self.send(MonitorCommand::RefreshExclusions(excluded));
    }

    pub fn navigate(&self, url: impl Into<String>, headings: Vec<String>) {
        self.send(MonitorCommand::Navigate {
            url: url.into(),
            headings,
        });
    }

    pub fn shutdown(&self) {
        self.send(MonitorCommand::Shutdown);
    }

    /// `None` means the monitor is gone and its state is unknown.
    pub async fn snapshot(&self) -> Option<MonitorSnapshot> {
        let (respond_to, response) = oneshot::channel();
        self.send(MonitorCommand::Snapshot { respond_to });
        response.await.ok()
    }

    fn send(&self, command: MonitorCommand) {
        if self.sender.send(command).is_err() {
            debug!("Monitor command dropped; monitor is gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExtractionConfig;
    use crate::dom::Node;
    use crate::feed::FeedSender;
    use crate::identity::normalize_all;
    use crate::outbox::ChannelOutbox;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Container appears on the `available_on`-th locate attempt.
    struct ScriptedFeed {
        available_on: Option<u32>,
        attempts: Arc<AtomicU32>,
        units: Arc<Mutex<Vec<Node>>>,
    }

    impl FeedSource for ScriptedFeed {
        fn locate_container(&mut self) -> bool {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            self.available_on.map(|on| attempt >= on).unwrap_or(false)
        }

        fn existing_units(&self) -> Vec<Node> {
            self.units.lock().map(|units| units.clone()).unwrap_or_default()
        }
    }

    struct Harness {
        handle: MonitorHandle,
        feed: FeedSender,
        attempts: Arc<AtomicU32>,
        units: Arc<Mutex<Vec<Node>>>,
        messages: mpsc::UnboundedReceiver<SyncMessage>,
    }

    impl Harness {
        fn drain(&mut self) -> Vec<SyncMessage> {
            let mut out = Vec::new();
            while let Ok(message) = self.messages.try_recv() {
                out.push(message);
            }
            out
        }

        async fn snapshot(&self) -> MonitorSnapshot {
            settle().await;
            self.handle.snapshot().await.expect("monitor alive")
        }
    }

    fn message(user: &str) -> Node {
        Node::element("div")
            .with_attr("data-a-target", "chat-line-message")
            .with_child(
                Node::element("span")
                    .with_attr("data-a-target", "chat-message-username")
                    .with_text(user),
            )
    }

    fn spawn_monitor(available_on: Option<u32>, existing: &[&str]) -> Harness {
        let attempts = Arc::new(AtomicU32::new(0));
        let units = Arc::new(Mutex::new(
            existing.iter().map(|user| message(user)).collect::<Vec<_>>(),
        ));
        let feed = ScriptedFeed {
            available_on,
            attempts: Arc::clone(&attempts),
            units: Arc::clone(&units),
        };
        let (feed_sender, feed_events) = FeedSender::channel();
        let (outbox, messages) = ChannelOutbox::channel();
        let extractor = Extractor::from_config(&ExtractionConfig::default()).expect("extractor");
        let (monitor, handle) = Monitor::new(
            "tab-1",
            MonitorSettings::default(),
            extractor,
            feed,
            feed_events,
            Arc::new(outbox),
        );
        tokio::spawn(monitor.run());

        Harness {
            handle,
            feed: feed_sender,
            attempts,
            units,
            messages,
        }
    }

    /// Lets the monitor drain both channels; time is paused, so this only
    /// returns once every task is idle.
    async fn settle() {
        time::sleep(Duration::from_millis(1)).await;
    }

    fn accepted_count(messages: &[SyncMessage]) -> usize {
        messages
            .iter()
            .filter(|m| matches!(m, SyncMessage::IdentityAccepted { .. }))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn enable_backfills_existing_messages() {
        let mut harness = spawn_monitor(Some(1), &["alice", "bob", "Alice"]);
        harness.handle.enable();

        let snapshot = harness.snapshot().await;
        assert_eq!(snapshot.watch, WatchState::Observing);
        assert!(snapshot.session.active);
        assert_eq!(snapshot.session.unique_identities, vec!["alice", "bob"]);

        let messages = harness.drain();
        assert!(matches!(messages[0], SyncMessage::WatchStarted { .. }));
        assert_eq!(accepted_count(&messages), 3);
        assert!(matches!(
            &messages[3],
            SyncMessage::IdentityAccepted { identity, is_new: false, current_count: 2, .. }
                if identity == "alice"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn locate_gives_up_after_ten_attempts() {
        let mut harness = spawn_monitor(None, &["alice"]);
        harness.handle.enable();
        time::sleep(Duration::from_secs(60)).await;

        let snapshot = harness.snapshot().await;
        assert_eq!(harness.attempts.load(Ordering::SeqCst), 10);
        assert_eq!(
            snapshot.watch,
            WatchState::Searching {
                attempts: 10,
                exhausted: true
            }
        );
        assert!(!snapshot.session.active);
        assert!(harness.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_at_fixed_interval_until_found() {
        let harness = spawn_monitor(Some(3), &[]);
        harness.handle.enable();

        settle().await;
        assert_eq!(harness.attempts.load(Ordering::SeqCst), 1);
        time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(harness.attempts.load(Ordering::SeqCst), 2);
        time::sleep(Duration::from_millis(1000)).await;

        let snapshot = harness.snapshot().await;
        assert_eq!(harness.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(snapshot.watch, WatchState::Observing);
    }

    #[tokio::test(start_paused = true)]
    async fn disable_cancels_pending_retry() {
        let harness = spawn_monitor(None, &[]);
        harness.handle.enable();
        settle().await;
        harness.handle.disable();
        time::sleep(Duration::from_secs(30)).await;

        let snapshot = harness.snapshot().await;
        assert_eq!(harness.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(snapshot.watch, WatchState::Disabled);
    }

    #[tokio::test(start_paused = true)]
    async fn container_available_short_circuits_retry() {
        let harness = spawn_monitor(Some(2), &[]);
        harness.handle.enable();
        settle().await;
        harness.feed.container_available();

        let snapshot = harness.snapshot().await;
        assert_eq!(snapshot.watch, WatchState::Observing);
        assert_eq!(harness.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn batches_only_count_while_observing() {
        let mut harness = spawn_monitor(Some(1), &[]);
        harness.feed.batch(vec![message("early")]);
        settle().await;
        harness.handle.enable();
        settle().await;
        harness.feed.batch(vec![message("alice"), message("ALICE"), message("bob")]);
        settle().await;
        harness.handle.disable();
        settle().await;
        harness.feed.batch(vec![message("late")]);

        let snapshot = harness.snapshot().await;
        assert_eq!(snapshot.session.unique_identities, vec!["alice", "bob"]);
        assert!(!snapshot.session.active);

        let messages = harness.drain();
        assert_eq!(accepted_count(&messages), 3);
        assert!(matches!(messages.last(), Some(SyncMessage::WatchStopped { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn reenable_after_disable_keeps_count_without_backfill() {
        let mut harness = spawn_monitor(Some(1), &["alice"]);
        harness.handle.enable();
        settle().await;
        harness.handle.disable();
        if let Ok(mut units) = harness.units.lock() {
            units.push(message("carol"));
        }
        harness.handle.enable();

        let snapshot = harness.snapshot().await;
        assert_eq!(snapshot.session.unique_identities, vec!["alice"]);
        let messages = harness.drain();
        assert_eq!(accepted_count(&messages), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_while_observing_resets_count_and_keeps_exclusions() {
        let mut harness = spawn_monitor(Some(1), &["a", "b", "c", "d", "e"]);
        harness.handle.refresh_exclusions(normalize_all(["nightbot"]));
        harness.handle.enable();
        assert_eq!(harness.snapshot().await.session.user_count, 5);

        harness.handle.clear();
        settle().await;
        harness.feed.batch(vec![message("after_clear")]);

        let snapshot = harness.snapshot().await;
        assert_eq!(snapshot.watch, WatchState::Disabled);
        assert_eq!(snapshot.session.user_count, 0);
        assert!(!snapshot.session.active);
        assert!(snapshot.session.started_at.is_none());
        assert_eq!(snapshot.session.excluded_identities, vec!["nightbot"]);
        assert!(matches!(
            harness.drain().last(),
            Some(SyncMessage::SessionCleared { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_clears_and_backfills_again() {
        let mut harness = spawn_monitor(Some(1), &["alice"]);
        harness.handle.enable();
        settle().await;
        harness.feed.batch(vec![message("bob")]);
        settle().await;
        harness.drain();

        harness.handle.restart();
        let snapshot = harness.snapshot().await;

        assert_eq!(snapshot.watch, WatchState::Observing);
        assert_eq!(snapshot.session.unique_identities, vec!["alice"]);
        let kinds: Vec<&str> = harness.drain().iter().map(|m| m.kind()).collect();
        assert_eq!(
            kinds,
            vec!["session_cleared", "watch_started", "identity_accepted"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exclusion_refresh_removes_counted_identity() {
        let mut harness = spawn_monitor(Some(1), &["alice", "spambot", "bob"]);
        harness.handle.enable();
        assert_eq!(harness.snapshot().await.session.user_count, 3);

        harness.drain();

        harness.handle.refresh_exclusions(normalize_all(["SpamBot"]));
        settle().await;
        harness.feed.batch(vec![message("spambot")]);

        let snapshot = harness.snapshot().await;
        assert_eq!(snapshot.session.user_count, 2);
        assert_eq!(snapshot.session.unique_identities, vec!["alice", "bob"]);
        let messages = harness.drain();
        assert_eq!(accepted_count(&messages), 0);
        assert!(matches!(
            &messages[..],
            [SyncMessage::ExclusionListUpdated { exclusions, .. }] if exclusions == &vec!["spambot".to_string()]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn navigation_clears_once_per_change() {
        let mut harness = spawn_monitor(Some(1), &["alice"]);
        harness
            .handle
            .navigate("https://www.twitch.tv/first", Vec::new());
        harness.handle.enable();
        settle().await;
        harness.drain();

        harness
            .handle
            .navigate("https://www.twitch.tv/first", Vec::new());
        settle().await;
        assert!(harness.drain().is_empty());

        harness.handle.navigate(
            "https://www.twitch.tv/second",
            vec!["Second Stream".to_string()],
        );
        let snapshot = harness.snapshot().await;

        assert_eq!(snapshot.watch, WatchState::Disabled);
        assert_eq!(snapshot.session.user_count, 0);
        assert_eq!(snapshot.session.subject_label.as_deref(), Some("Second Stream"));
        let kinds: Vec<&str> = harness.drain().iter().map(|m| m.kind()).collect();
        assert_eq!(kinds, vec!["session_cleared", "subject_changed"]);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_after_shutdown_is_unknown() {
        let harness = spawn_monitor(None, &[]);
        harness.handle.shutdown();
        settle().await;
        assert!(harness.handle.snapshot().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_while_observing_reports_watch_stopped() {
        let mut harness = spawn_monitor(Some(1), &["alice", "bob"]);
        harness.handle.enable();
        settle().await;
        harness.drain();

        harness.handle.shutdown();
        settle().await;

        let messages = harness.drain();
        assert_eq!(
            messages,
            vec![SyncMessage::WatchStopped {
                session_id: "tab-1".to_string()
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_every_handle_stops_a_pending_search() {
        let mut harness = spawn_monitor(None, &[]);
        harness.handle.enable();
        settle().await;

        let Harness {
            handle,
            mut messages,
            attempts,
            ..
        } = harness;
        drop(handle);
        time::sleep(Duration::from_secs(30)).await;

        let mut kinds = Vec::new();
        while let Ok(message) = messages.try_recv() {
            kinds.push(message.kind());
        }
        assert_eq!(kinds, vec!["watch_stopped"]);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_while_disabled_is_silent() {
        let mut harness = spawn_monitor(Some(1), &[]);
        harness.handle.shutdown();
        settle().await;
        assert!(harness.drain().is_empty());
    }
}
