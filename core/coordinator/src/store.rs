//! Session store owned by the coordinator task.
//!
//! Sessions are created lazily on the first message naming them and only
//! removed by explicit eviction. The global aggregate is never stored here;
//! it is derived from the sessions on demand.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use chat_tally_protocol::{GlobalAggregate, SyncMessage};
use tally_core::{normalize_all, Acceptance, Identity, Session};

/// What one applied message did to its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    pub created: bool,
    pub previous_count: usize,
    pub current_count: usize,
}

impl Applied {
    pub fn count_changed(&self) -> bool {
        self.previous_count != self.current_count
    }
}

#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<String, Session>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Inserts a restored session, replacing any existing one with that id.
    pub fn insert(&mut self, session: Session) {
        self.sessions
            .insert(session.session_id().to_string(), session);
    }

    pub fn apply(&mut self, message: &SyncMessage, now: DateTime<Utc>) -> Applied {
        let session_id = message.session_id();
        let created = !self.sessions.contains_key(session_id);
        let session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id));
        if created {
            debug!(session_id = %session_id, "Session created");
        }

        let previous_count = session.user_count();
        apply_to_session(session, message, now);

        Applied {
            created,
            previous_count,
            current_count: session.user_count(),
        }
    }

    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    /// All sessions, ordered by id.
    pub fn all(&self) -> Vec<&Session> {
        let mut sessions: Vec<&Session> = self.sessions.values().collect();
        sessions.sort_by(|a, b| a.session_id().cmp(b.session_id()));
        sessions
    }

    pub fn evict(&mut self, session_id: &str) -> Option<Session> {
        self.sessions.remove(session_id)
    }

    pub fn global(&self) -> GlobalAggregate {
        compute_aggregate(self.sessions.values())
    }
}

fn apply_to_session(session: &mut Session, message: &SyncMessage, now: DateTime<Utc>) {
    match message {
        SyncMessage::IdentityAccepted {
            identity,
            current_count,
            ..
        } => {
            let Some(identity) = Identity::normalize(identity) else {
                debug!(session_id = %session.session_id(), "Empty identity ignored");
                return;
            };
            if session.accept(identity, now) == Acceptance::Excluded {
                debug!(session_id = %session.session_id(), "Excluded identity ignored");
                return;
            }
            if session.user_count() != *current_count {
                debug!(
                    session_id = %session.session_id(),
                    reported = current_count,
                    mirrored = session.user_count(),
                    "Mirrored count differs from monitor count"
                );
            }
        }
        SyncMessage::ExclusionListUpdated { exclusions, .. } => {
            session.refresh_exclusions(normalize_all(exclusions));
        }
        SyncMessage::SessionCleared { .. } => session.clear_watch(),
        SyncMessage::WatchStarted { started_at, .. } => {
            let started_at = match DateTime::parse_from_rfc3339(started_at) {
                Ok(ts) => ts.with_timezone(&Utc),
                Err(err) => {
                    warn!(
                        session_id = %session.session_id(),
                        error = %err,
                        "Unparseable watch start; using receive time"
                    );
                    now
                }
            };
            session.start_watch(started_at);
        }
        SyncMessage::WatchStopped { .. } => session.stop_watch(),
        SyncMessage::SubjectChanged { subject_label, .. } => {
            session.subject_label = subject_label.clone();
        }
    }
}

/// Union of counted identities over active sessions. An identity counted in
/// several sessions contributes once.
pub fn compute_aggregate<'a>(sessions: impl IntoIterator<Item = &'a Session>) -> GlobalAggregate {
    let mut union: HashSet<&Identity> = HashSet::new();
    let mut active_session_count = 0;
    for session in sessions.into_iter().filter(|session| session.active) {
        active_session_count += 1;
        union.extend(session.unique().iter());
    }
    GlobalAggregate {
        total_unique_identities: union.len(),
        active_session_count,
    }
}
