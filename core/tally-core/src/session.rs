//! Per-instance session record.
//!
//! Both sides of the sync protocol keep one of these: the monitor hosting the
//! extractor owns the live copy, the coordinator mirrors it from the messages
//! it receives. All mutation goes through the methods here so both copies obey
//! the same rules:
//!
//! - `unique ∩ excluded = ∅` after every exclusion update
//! - `unique` only grows within one watch period
//! - a watch-period boundary clears `unique` but never `excluded`

use chrono::{DateTime, Utc};
use std::collections::HashSet;

use chat_tally_protocol::SessionSnapshot;

use crate::identity::{sorted_strings, Identity};

/// Outcome of offering an identity to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    New,
    Duplicate,
    Excluded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    session_id: String,
    unique: HashSet<Identity>,
    excluded: HashSet<Identity>,
    pub active: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub last_identity: Option<Identity>,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub subject_label: Option<String>,
}

impl Session {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            unique: HashSet::new(),
            excluded: HashSet::new(),
            active: false,
            started_at: None,
            last_identity: None,
            last_updated_at: None,
            subject_label: None,
        }
    }

    /// Rebuilds a session from mirrored fields, re-applying the exclusion
    /// invariant in case the stored copy predates an exclusion update.
    pub fn restore(
        session_id: impl Into<String>,
        unique: HashSet<Identity>,
        excluded: HashSet<Identity>,
    ) -> Self {
        let unique = recompute_unique(&unique, &excluded);
        Self {
            unique,
            excluded,
            ..Self::new(session_id)
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn unique(&self) -> &HashSet<Identity> {
        &self.unique
    }

    pub fn excluded(&self) -> &HashSet<Identity> {
        &self.excluded
    }

    pub fn user_count(&self) -> usize {
        self.unique.len()
    }

    pub fn is_excluded(&self, identity: &Identity) -> bool {
        self.excluded.contains(identity)
    }

    /// Offers an identity. Excluded identities leave no trace, not even in
    /// `last_identity`.
    pub fn accept(&mut self, identity: Identity, now: DateTime<Utc>) -> Acceptance {
        if self.excluded.contains(&identity) {
            return Acceptance::Excluded;
        }

        let outcome = if self.unique.insert(identity.clone()) {
            Acceptance::New
        } else {
            Acceptance::Duplicate
        };
        self.last_identity = Some(identity);
        self.last_updated_at = Some(now);
        outcome
    }

    /// Replaces the exclusion list and retroactively drops counted identities
    /// that are now excluded. Returns how many were dropped.
    pub fn refresh_exclusions(&mut self, excluded: HashSet<Identity>) -> usize {
        let before = self.unique.len();
        self.unique = recompute_unique(&self.unique, &excluded);
        self.excluded = excluded;

        if self
            .last_identity
            .as_ref()
            .map(|last| self.excluded.contains(last))
            .unwrap_or(false)
        {
            self.last_identity = None;
        }

        before - self.unique.len()
    }

    /// Begins a watch period.
    pub fn start_watch(&mut self, now: DateTime<Utc>) {
        self.active = true;
        self.started_at = Some(now);
    }

    /// Ends observation without touching the count.
    pub fn stop_watch(&mut self) {
        self.active = false;
    }

    /// Watch-period boundary (navigation, explicit reset).
    pub fn clear_watch(&mut self) {
        self.unique.clear();
        self.active = false;
        self.started_at = None;
        self.last_identity = None;
        self.last_updated_at = None;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            user_count: self.unique.len(),
            unique_identities: sorted_strings(&self.unique),
            excluded_identities: sorted_strings(&self.excluded),
            active: self.active,
            started_at: self.started_at.map(|ts| ts.to_rfc3339()),
            last_identity: self
                .last_identity
                .as_ref()
                .map(|identity| identity.as_str().to_string()),
            last_updated_at: self.last_updated_at.map(|ts| ts.to_rfc3339()),
            subject_label: self.subject_label.clone(),
        }
    }
}

/// `unique \ excluded`, as a fresh set.
pub fn recompute_unique(
    unique: &HashSet<Identity>,
    excluded: &HashSet<Identity>,
) -> HashSet<Identity> {
    unique.difference(excluded).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::normalize_all;

    fn id(raw: &str) -> Identity {
        Identity::normalize(raw).expect("identity")
    }

    fn session_with(users: &[&str]) -> Session {
        let mut session = Session::new("tab-1");
        for user in users {
            session.accept(id(user), Utc::now());
        }
        session
    }

    #[test]
    fn second_equivalent_label_is_duplicate() {
        let mut session = Session::new("tab-1");
        assert_eq!(session.accept(id("  Foo_Bar!! "), Utc::now()), Acceptance::New);
        assert_eq!(session.accept(id("foo_bar"), Utc::now()), Acceptance::Duplicate);
        assert_eq!(session.user_count(), 1);
    }

    #[test]
    fn excluded_identity_is_never_counted() {
        let mut session = Session::new("tab-1");
        session.refresh_exclusions(normalize_all(["nightbot"]));

        assert_eq!(session.accept(id("NightBot"), Utc::now()), Acceptance::Excluded);
        assert_eq!(session.user_count(), 0);
        assert!(session.last_identity.is_none());
    }

    #[test]
    fn refresh_exclusions_removes_counted_identity() {
        let mut session = session_with(&["alice", "spambot", "bob"]);

        let removed = session.refresh_exclusions(normalize_all(["spambot"]));

        assert_eq!(removed, 1);
        assert_eq!(session.user_count(), 2);
        assert!(!session.unique().contains(&id("spambot")));
        assert!(session.unique().is_disjoint(session.excluded()));
    }

    #[test]
    fn refresh_exclusions_is_idempotent() {
        let mut once = session_with(&["alice", "spambot", "bob"]);
        once.refresh_exclusions(normalize_all(["spambot", "nightbot"]));

        let mut twice = once.clone();
        let removed = twice.refresh_exclusions(normalize_all(["spambot", "nightbot"]));

        assert_eq!(removed, 0);
        assert_eq!(once.unique(), twice.unique());
    }

    #[test]
    fn refresh_exclusions_replaces_previous_list() {
        let mut session = Session::new("tab-1");
        session.refresh_exclusions(normalize_all(["nightbot"]));
        session.refresh_exclusions(normalize_all(["moobot"]));

        assert_eq!(session.accept(id("nightbot"), Utc::now()), Acceptance::New);
        assert_eq!(session.accept(id("moobot"), Utc::now()), Acceptance::Excluded);
    }

    #[test]
    fn clear_keeps_exclusions() {
        let mut session = session_with(&["a", "b", "c", "d", "e"]);
        session.refresh_exclusions(normalize_all(["nightbot"]));
        session.start_watch(Utc::now());
        let excluded_before = session.excluded().clone();

        session.clear_watch();

        assert_eq!(session.user_count(), 0);
        assert!(!session.active);
        assert!(session.started_at.is_none());
        assert_eq!(session.excluded(), &excluded_before);
    }

    #[test]
    fn stop_watch_keeps_count() {
        let mut session = session_with(&["a", "b"]);
        session.start_watch(Utc::now());
        session.stop_watch();

        assert!(!session.active);
        assert_eq!(session.user_count(), 2);
        assert!(session.started_at.is_some());
    }

    #[test]
    fn restore_enforces_exclusions() {
        let session = Session::restore(
            "tab-9",
            normalize_all(["alice", "nightbot"]),
            normalize_all(["nightbot"]),
        );
        assert_eq!(session.snapshot().unique_identities, vec!["alice"]);
        assert_eq!(session.snapshot().excluded_identities, vec!["nightbot"]);
    }

    #[test]
    fn recompute_unique_is_pure_difference() {
        let unique = normalize_all(["a", "b", "c"]);
        let excluded = normalize_all(["b", "z"]);
        let result = recompute_unique(&unique, &excluded);
        assert_eq!(result, normalize_all(["a", "c"]));
        assert_eq!(unique.len(), 3);
    }
}
