//! # tally-core
//!
//! Core library for chat-tally: counting the distinct participants seen in a
//! live chat feed, per monitored instance.
//!
//! ## Design Principles
//!
//! - **Pure where possible**: normalization, session rules, extraction and the
//!   watch machine are synchronous and side-effect free. Only [`monitor`]
//!   touches the async runtime.
//! - **One owner per session**: a [`Monitor`] owns its live [`Session`]; the
//!   coordinator owns the mirrored copies. Nothing else mutates them.
//! - **Best-effort delivery**: an [`Outbox`] never blocks and never fails.
//!   Missing listeners are logged, not surfaced.
//! - **Graceful degradation**: a missing config file means defaults.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tally_core::{load_config, DocumentFeed, Extractor, FeedSender, Monitor, MonitorSettings};
//!
//! let config = load_config(None)?;
//! let extractor = Extractor::from_config(&config.extraction)?;
//! let feed = DocumentFeed::new(Selector::parse_all(&config.extraction.container_selectors)?, extractor.clone());
//! let (feed_sender, feed_events) = FeedSender::channel();
//! let (monitor, handle) = Monitor::new("tab-1", MonitorSettings::from(&config.watch), extractor, feed, feed_events, outbox);
//! tokio::spawn(monitor.run());
//! handle.enable();
//! ```

pub mod config;
pub mod dom;
pub mod error;
pub mod extractor;
pub mod feed;
pub mod identity;
pub mod monitor;
pub mod navigation;
pub mod outbox;
pub mod roster;
pub mod session;
pub mod subject;
pub mod watch;

pub use config::*;
pub use dom::{Node, Selector};
pub use error::{Result, TallyError};
pub use extractor::{AcceptedIdentity, Extractor, LabelStrategy};
pub use feed::{DocumentFeed, DocumentHandle, FeedEvent, FeedSender, FeedSource};
pub use identity::{normalize_all, sorted_strings, Identity};
pub use monitor::{Monitor, MonitorHandle, MonitorSettings, MonitorSnapshot};
pub use navigation::{NavigationChange, NavigationTracker};
pub use outbox::{ChannelOutbox, NullOutbox, Outbox};
pub use roster::RosterScanner;
pub use session::{recompute_unique, Acceptance, Session};
pub use subject::{channel_from_url, detect_subject, heading_candidates};
pub use watch::{LocateOutcome, WatchMachine, WatchState};
