//! chat-tally coordinator: the single writer for per-instance session state.
//!
//! The binary wires these together: a [`Coordinator`] task owning the
//! [`SessionStore`], a SQLite [`persistence`] mirror, a badge sink for the
//! foreground session, and the Unix socket [`server`].

pub mod badge;
pub mod coordinator;
pub mod persistence;
pub mod server;
pub mod store;

pub use badge::{badge_text, BadgeSink, LogBadge, RecordingBadge};
pub use coordinator::{Coordinator, CoordinatorCommand, CoordinatorGone, CoordinatorHandle};
pub use persistence::{KvStore, MemoryKv, SqliteKv};
pub use store::{compute_aggregate, Applied, SessionStore};
