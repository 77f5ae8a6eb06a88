//! Coordinator actor.
//!
//! One task owns the [`SessionStore`] and processes commands one at a time in
//! arrival order. After each mutation it recomputes the global aggregate,
//! mirrors the touched keys to storage, refreshes the badge when the
//! foreground count moved, and broadcasts a [`StateUpdate`]. With no
//! subscribers the update is never built.

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use chat_tally_protocol::{GlobalAggregate, SessionSnapshot, StateUpdate, SyncMessage};
use tally_core::Outbox;

use crate::badge::{badge_text, BadgeSink};
use crate::persistence::{
    global_entries, load_sessions, session_activity_entries, session_entries, session_scope,
    KvStore, GLOBAL_SCOPE,
};
use crate::store::SessionStore;

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// A query whose reply never arrived. The caller should treat the state as
/// unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("coordinator is not running")]
pub struct CoordinatorGone;

pub enum CoordinatorCommand {
    Apply(SyncMessage),
    QuerySession {
        session_id: String,
        respond_to: oneshot::Sender<Option<SessionSnapshot>>,
    },
    QueryGlobal {
        respond_to: oneshot::Sender<GlobalAggregate>,
    },
    ListSessions {
        respond_to: oneshot::Sender<Vec<SessionSnapshot>>,
    },
    Evict {
        session_id: String,
        respond_to: oneshot::Sender<bool>,
    },
    SetForeground {
        session_id: String,
    },
    Shutdown,
}

pub struct Coordinator {
    store: SessionStore,
    foreground: Option<String>,
    badge: Box<dyn BadgeSink>,
    badge_color: String,
    shown_badge: Option<String>,
    persistence: Option<Box<dyn KvStore>>,
    mirrored_global: Option<GlobalAggregate>,
    commands: mpsc::UnboundedReceiver<CoordinatorCommand>,
    updates: broadcast::Sender<StateUpdate>,
}

impl Coordinator {
    pub fn new(
        badge: Box<dyn BadgeSink>,
        badge_color: impl Into<String>,
    ) -> (Self, CoordinatorHandle) {
        let (sender, commands) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let coordinator = Self {
            store: SessionStore::new(),
            foreground: None,
            badge,
            badge_color: badge_color.into(),
            shown_badge: None,
            persistence: None,
            mirrored_global: None,
            commands,
            updates: updates.clone(),
        };
        (coordinator, CoordinatorHandle { sender, updates })
    }

    /// Attaches a storage mirror and restores any sessions it holds.
    pub fn with_persistence(mut self, persistence: Box<dyn KvStore>) -> Self {
        match load_sessions(persistence.as_ref()) {
            Ok(sessions) => {
                let restored = sessions.len();
                for session in sessions {
                    self.store.insert(session);
                }
                if restored > 0 {
                    info!(restored, "Sessions restored from storage");
                }
            }
            Err(err) => warn!(error = %err, "Failed to restore sessions; starting empty"),
        }
        self.persistence = Some(persistence);
        self
    }

    pub async fn run(mut self) {
        info!(sessions = self.store.len(), "Coordinator starting");
        while let Some(command) = self.commands.recv().await {
            match command {
                CoordinatorCommand::Shutdown => break,
                command => self.handle_command(command),
            }
        }
        info!("Coordinator stopped");
    }

    fn handle_command(&mut self, command: CoordinatorCommand) {
        match command {
            CoordinatorCommand::Apply(message) => self.apply(message),
            CoordinatorCommand::QuerySession {
                session_id,
                respond_to,
            } => {
                let snapshot = self.store.get(&session_id).map(|session| session.snapshot());
                let _ = respond_to.send(snapshot);
            }
            CoordinatorCommand::QueryGlobal { respond_to } => {
                let _ = respond_to.send(self.store.global());
            }
            CoordinatorCommand::ListSessions { respond_to } => {
                let sessions = self
                    .store
                    .all()
                    .into_iter()
                    .map(|session| session.snapshot())
                    .collect();
                let _ = respond_to.send(sessions);
            }
            CoordinatorCommand::Evict {
                session_id,
                respond_to,
            } => {
                let evicted = self.evict(&session_id);
                let _ = respond_to.send(evicted);
            }
            CoordinatorCommand::SetForeground { session_id } => {
                info!(session_id = %session_id, "Foreground session set");
                self.foreground = Some(session_id);
                self.refresh_badge();
            }
            CoordinatorCommand::Shutdown => {}
        }
    }

    fn apply(&mut self, message: SyncMessage) {
        if let Err(err) = message.validate() {
            warn!(code = %err.code, message = %err.message, "Rejected sync message");
            return;
        }

        let session_id = message.session_id().to_string();
        let applied = self.store.apply(&message, Utc::now());
        debug!(
            session_id = %session_id,
            kind = message.kind(),
            unique = applied.current_count,
            "Sync message applied"
        );

        if applied.created && self.foreground.is_none() {
            self.foreground = Some(session_id.clone());
        }

        // A repeat identity only moves the activity keys.
        let repeat = matches!(message, SyncMessage::IdentityAccepted { .. })
            && !applied.created
            && !applied.count_changed();
        let global = self.store.global();
        self.mirror_session(&session_id, repeat, &global);
        if self.foreground.as_deref() == Some(session_id.as_str())
            && (applied.count_changed() || applied.created)
        {
            self.refresh_badge();
        }
        self.broadcast(&session_id, message.kind(), global);
    }

    fn evict(&mut self, session_id: &str) -> bool {
        if self.store.evict(session_id).is_none() {
            return false;
        }
        info!(session_id = %session_id, "Session evicted");

        let global = self.store.global();
        if let Some(persistence) = &self.persistence {
            if let Err(err) = persistence.remove_scope(&session_scope(session_id)) {
                warn!(
                    session_id = %session_id,
                    error = %err,
                    "Failed to remove session from storage"
                );
            }
        }
        self.mirror_global(&global);
        if self.foreground.as_deref() == Some(session_id) {
            self.refresh_badge();
        }
        self.broadcast(session_id, "evicted", global);
        true
    }

    fn mirror_session(&mut self, session_id: &str, repeat: bool, global: &GlobalAggregate) {
        let (Some(persistence), Some(session)) = (&self.persistence, self.store.get(session_id))
        else {
            return;
        };
        let entries = if repeat {
            session_activity_entries(session)
        } else {
            session_entries(session)
        };
        if let Err(err) = persistence.set(&session_scope(session_id), &entries) {
            warn!(session_id = %session_id, error = %err, "Failed to persist session");
        }
        self.mirror_global(global);
    }

    fn mirror_global(&mut self, global: &GlobalAggregate) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        if self.mirrored_global.as_ref() == Some(global) {
            return;
        }
        match persistence.set(GLOBAL_SCOPE, &global_entries(global)) {
            Ok(()) => self.mirrored_global = Some(*global),
            Err(err) => warn!(error = %err, "Failed to persist global aggregate"),
        }
    }

    fn refresh_badge(&mut self) {
        let count = self
            .foreground
            .as_deref()
            .and_then(|id| self.store.get(id))
            .map(|session| session.user_count())
            .unwrap_or(0);
        let text = badge_text(count);
        if self.shown_badge.as_deref() == Some(text.as_str()) {
            return;
        }
        self.badge.show(&text, &self.badge_color);
        self.shown_badge = Some(text);
    }

    fn broadcast(&self, session_id: &str, cause: &str, global: GlobalAggregate) {
        if self.updates.receiver_count() == 0 {
            trace!(cause, "No subscribers for state update");
            return;
        }
        let update = StateUpdate {
            session_id: session_id.to_string(),
            cause: cause.to_string(),
            session: self.store.get(session_id).map(|session| session.snapshot()),
            global,
        };
        if self.updates.send(update).is_err() {
            trace!(cause, "No subscribers for state update");
        }
    }
}

/// Cloneable front door to the coordinator task. Sends are best-effort;
/// queries report [`CoordinatorGone`] when no reply comes back.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    sender: mpsc::UnboundedSender<CoordinatorCommand>,
    updates: broadcast::Sender<StateUpdate>,
}

impl CoordinatorHandle {
    pub fn apply(&self, message: SyncMessage) {
        self.dispatch(CoordinatorCommand::Apply(message));
    }

    pub fn set_foreground(&self, session_id: impl Into<String>) {
        self.dispatch(CoordinatorCommand::SetForeground {
            session_id: session_id.into(),
        });
    }

    pub fn shutdown(&self) {
        self.dispatch(CoordinatorCommand::Shutdown);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateUpdate> {
        self.updates.subscribe()
    }

    pub async fn session(
        &self,
        session_id: impl Into<String>,
    ) -> Result<Option<SessionSnapshot>, CoordinatorGone> {
        let (respond_to, response) = oneshot::channel();
        self.dispatch(CoordinatorCommand::QuerySession {
            session_id: session_id.into(),
            respond_to,
        });
        response.await.map_err(|_| CoordinatorGone)
    }

    pub async fn global(&self) -> Result<GlobalAggregate, CoordinatorGone> {
        let (respond_to, response) = oneshot::channel();
        self.dispatch(CoordinatorCommand::QueryGlobal { respond_to });
        response.await.map_err(|_| CoordinatorGone)
    }

    pub async fn sessions(&self) -> Result<Vec<SessionSnapshot>, CoordinatorGone> {
        let (respond_to, response) = oneshot::channel();
        self.dispatch(CoordinatorCommand::ListSessions { respond_to });
        response.await.map_err(|_| CoordinatorGone)
    }

    pub async fn evict(&self, session_id: impl Into<String>) -> Result<bool, CoordinatorGone> {
        let (respond_to, response) = oneshot::channel();
        self.dispatch(CoordinatorCommand::Evict {
            session_id: session_id.into(),
            respond_to,
        });
        response.await.map_err(|_| CoordinatorGone)
    }

    fn dispatch(&self, command: CoordinatorCommand) {
        if self.sender.send(command).is_err() {
            debug!("Coordinator command dropped; coordinator is gone");
        }
    }
}

impl Outbox for CoordinatorHandle {
    fn send(&self, message: SyncMessage) {
        self.apply(message);
    }
}
