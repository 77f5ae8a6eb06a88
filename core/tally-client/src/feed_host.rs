//! Hosts one monitor for `tally-client feed`.
//!
//! Input is newline-delimited JSON, one operation per line:
//!
//! ```text
//! {"op":"document","document":{...}}    replace the page tree
//! {"op":"batch","nodes":[...]}          nodes appended to the chat container
//! {"op":"location","url":"..."}         page address; applied on the next poll
//! {"op":"enable"} / {"op":"disable"} / {"op":"clear"} / {"op":"restart"}
//! {"op":"exclusions","names":[...]}     replace the bot list
//! {"op":"roster","panel":{...}}         scan a roster panel for bots
//! {"op":"snapshot"}                     print the monitor state as one JSON line
//! ```
//!
//! Bad lines are logged and skipped. End of input shuts the monitor down,
//! which reports the watch as stopped.

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use chat_tally_protocol::SyncMessage;
use tally_core::{
    heading_candidates, normalize_all, DocumentFeed, DocumentHandle, Extractor, FeedSender,
    Monitor, MonitorHandle, MonitorSettings, Node, Outbox, RosterScanner, Selector, TallyConfig,
};

use crate::coordinator_client::CoordinatorClient;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FeedOp {
    Document { document: Node },
    Batch { nodes: Vec<Node> },
    Location { url: String },
    Enable,
    Disable,
    Clear,
    Restart,
    Exclusions { names: Vec<String> },
    Roster { panel: Node },
    Snapshot,
}

pub struct FeedHost {
    session_id: String,
    settings: MonitorSettings,
    extractor: Extractor,
    container_selectors: Vec<Selector>,
    subject_selectors: Vec<Selector>,
    roster: RosterScanner,
    poll_interval: Duration,
}

impl FeedHost {
    pub fn from_config(session_id: &str, config: &TallyConfig) -> Result<Self, String> {
        Ok(Self {
            session_id: session_id.to_string(),
            settings: MonitorSettings::from(&config.watch),
            extractor: Extractor::from_config(&config.extraction)?,
            container_selectors: Selector::parse_all(&config.extraction.container_selectors)?,
            subject_selectors: Selector::parse_all(&config.extraction.subject_selectors)?,
            roster: RosterScanner::from_config(&config.roster)?,
            poll_interval: Duration::from_millis(config.watch.navigation_poll_ms.max(1)),
        })
    }

    /// Runs until `input` ends, then waits for the monitor to stop.
    pub async fn run<R, W>(self, input: R, output: &mut W, outbox: Arc<dyn Outbox>)
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let feed = DocumentFeed::new(self.container_selectors.clone(), self.extractor.clone());
        let document = feed.document_handle();
        let (feed_sender, feed_events) = FeedSender::channel();
        let (monitor, handle) = Monitor::new(
            self.session_id.clone(),
            self.settings,
            self.extractor.clone(),
            feed,
            feed_events,
            outbox,
        );
        let monitor_task = tokio::spawn(monitor.run());
        info!(session_id = %self.session_id, "Feed host started");

        let mut state = HostState {
            host: &self,
            handle: handle.clone(),
            feed_sender,
            document,
            location: None,
        };

        let mut lines = input.lines();
        let mut poll = interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => state.handle_line(&line, output).await,
                    Ok(None) => break,
                    Err(err) => {
                        warn!(error = %err, "Failed to read feed input");
                        break;
                    }
                },
                _ = poll.tick() => state.poll_location(),
            }
        }

        handle.shutdown();
        if let Err(err) = monitor_task.await {
            warn!(error = %err, "Monitor task ended abnormally");
        }
        info!(session_id = %self.session_id, "Feed host stopped");
    }
}

struct HostState<'a> {
    host: &'a FeedHost,
    handle: MonitorHandle,
    feed_sender: FeedSender,
    document: DocumentHandle,
    location: Option<String>,
}

impl HostState<'_> {
    async fn handle_line<W: AsyncWrite + Unpin>(&mut self, line: &str, output: &mut W) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match serde_json::from_str::<FeedOp>(line) {
            Ok(op) => self.apply(op, output).await,
            Err(err) => warn!(error = %err, "Skipping malformed feed line"),
        }
    }

    async fn apply<W: AsyncWrite + Unpin>(&mut self, op: FeedOp, output: &mut W) {
        match op {
            FeedOp::Document { document } => {
                self.document.replace(document);
                self.feed_sender.container_available();
            }
            FeedOp::Batch { nodes } => self.feed_sender.batch(nodes),
            FeedOp::Location { url } => self.location = Some(url),
            FeedOp::Enable => self.handle.enable(),
            FeedOp::Disable => self.handle.disable(),
            FeedOp::Clear => self.handle.clear(),
            FeedOp::Restart => self.handle.restart(),
            FeedOp::Exclusions { names } => self.handle.refresh_exclusions(normalize_all(names)),
            FeedOp::Roster { panel } => {
                self.handle.refresh_exclusions(self.host.roster.discover(&panel));
            }
            FeedOp::Snapshot => self.write_snapshot(output).await,
        }
    }

    /// Hands the last reported location to the monitor, which ignores
    /// repeats of the URL it already saw.
    fn poll_location(&self) {
        let Some(url) = &self.location else {
            return;
        };
        let headings = self
            .document
            .with_document(|document| heading_candidates(document, &self.host.subject_selectors))
            .unwrap_or_default();
        self.handle.navigate(url.clone(), headings);
    }

    async fn write_snapshot<W: AsyncWrite + Unpin>(&self, output: &mut W) {
        let Some(snapshot) = self.handle.snapshot().await else {
            debug!("Monitor gone; no snapshot");
            return;
        };
        let mut payload = match serde_json::to_vec(&snapshot) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "Failed to serialize snapshot");
                return;
            }
        };
        payload.push(b'\n');
        if let Err(err) = output.write_all(&payload).await {
            warn!(error = %err, "Failed to write snapshot");
            return;
        }
        let _ = output.flush().await;
    }
}

/// Delivers monitor output to the coordinator in order. Runs until every
/// sender is gone, so messages emitted during shutdown still go out.
pub async fn forward_messages(
    client: CoordinatorClient,
    mut messages: mpsc::UnboundedReceiver<SyncMessage>,
) {
    let mut reachable = true;
    while let Some(message) = messages.recv().await {
        let kind = message.kind();
        let sender = client.clone();
        let result =
            tokio::task::spawn_blocking(move || sender.send_message_with_retry(&message)).await;
        match result {
            Ok(Ok(())) => {
                if !reachable {
                    info!("Coordinator reachable again");
                }
                reachable = true;
            }
            Ok(Err(err)) if reachable => {
                warn!(error = %err, kind, "Coordinator did not take sync message; continuing");
                reachable = false;
            }
            Ok(Err(err)) => debug!(error = %err, kind, "Sync message dropped"),
            Err(err) => warn!(error = %err, "Sync message delivery task failed"),
        }
    }
}
