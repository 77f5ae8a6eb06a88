//! Durable mirror of coordinator state.
//!
//! Storage is a flat key-value collaborator grouped by scope: one
//! `session:<id>` scope per session and a `global` scope for the cached
//! aggregate. The mirror is written after each mutation and read once on cold
//! start. In-memory state stays authoritative: every failure here is returned
//! to the caller, which logs it and carries on.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chat_tally_protocol::GlobalAggregate;
use tally_core::{normalize_all, sorted_strings, Identity, Session};

pub const GLOBAL_SCOPE: &str = "global";
const SESSION_SCOPE_PREFIX: &str = "session:";

pub const KEY_USER_COUNT: &str = "userCount";
pub const KEY_USERS_LIST: &str = "usersList";
pub const KEY_EXCLUSIONS: &str = "exclusions";
pub const KEY_SESSION_START: &str = "sessionStartTime";
pub const KEY_SESSION_ACTIVE: &str = "sessionActive";
pub const KEY_LAST_USER: &str = "lastUser";
pub const KEY_LAST_UPDATE: &str = "lastUpdate";
pub const KEY_CURRENT_SUBJECT: &str = "currentSubject";
pub const KEY_TOTAL_UNIQUE: &str = "totalUniqueIdentities";
pub const KEY_ACTIVE_SESSIONS: &str = "activeSessionCount";

pub type Entries = BTreeMap<String, Value>;

pub trait KvStore: Send {
    /// Values for `keys` in `scope`; an empty key list reads the whole scope.
    /// Missing keys are simply absent from the result.
    fn get(&self, scope: &str, keys: &[&str]) -> Result<Entries, String>;

    fn set(&self, scope: &str, entries: &Entries) -> Result<(), String>;

    fn remove_scope(&self, scope: &str) -> Result<(), String>;

    fn scopes(&self) -> Result<Vec<String>, String>;
}

pub fn session_scope(session_id: &str) -> String {
    format!("{}{}", SESSION_SCOPE_PREFIX, session_id)
}

fn session_id_from_scope(scope: &str) -> Option<&str> {
    scope
        .strip_prefix(SESSION_SCOPE_PREFIX)
        .filter(|id| !id.is_empty())
}

pub fn session_entries(session: &Session) -> Entries {
    let mut entries = Entries::new();
    entries.insert(KEY_USER_COUNT.to_string(), json!(session.user_count()));
    entries.insert(
        KEY_USERS_LIST.to_string(),
        json!(sorted_strings(session.unique())),
    );
    entries.insert(
        KEY_EXCLUSIONS.to_string(),
        json!(sorted_strings(session.excluded())),
    );
    entries.insert(
        KEY_SESSION_START.to_string(),
        json!(session.started_at.map(|ts| ts.to_rfc3339())),
    );
    entries.insert(KEY_SESSION_ACTIVE.to_string(), json!(session.active));
    entries.insert(
        KEY_LAST_USER.to_string(),
        json!(session.last_identity.as_ref().map(Identity::as_str)),
    );
    entries.insert(
        KEY_LAST_UPDATE.to_string(),
        json!(session.last_updated_at.map(|ts| ts.to_rfc3339())),
    );
    entries.insert(
        KEY_CURRENT_SUBJECT.to_string(),
        json!(session.subject_label),
    );
    entries
}

/// Keys a repeat identity touches. The identity list itself is unchanged.
pub fn session_activity_entries(session: &Session) -> Entries {
    let mut entries = Entries::new();
    entries.insert(
        KEY_LAST_USER.to_string(),
        json!(session.last_identity.as_ref().map(Identity::as_str)),
    );
    entries.insert(
        KEY_LAST_UPDATE.to_string(),
        json!(session.last_updated_at.map(|ts| ts.to_rfc3339())),
    );
    entries
}

pub fn global_entries(aggregate: &GlobalAggregate) -> Entries {
    let mut entries = Entries::new();
    entries.insert(
        KEY_TOTAL_UNIQUE.to_string(),
        json!(aggregate.total_unique_identities),
    );
    entries.insert(
        KEY_ACTIVE_SESSIONS.to_string(),
        json!(aggregate.active_session_count),
    );
    entries
}

/// Rebuilds a session from its stored scope. Unreadable values fall back to
/// the session defaults.
pub fn restore_session(session_id: &str, entries: &Entries) -> Session {
    let unique = string_set(entries.get(KEY_USERS_LIST));
    let excluded = string_set(entries.get(KEY_EXCLUSIONS));
    let mut session = Session::restore(session_id, unique, excluded);

    session.active = entries
        .get(KEY_SESSION_ACTIVE)
        .and_then(Value::as_bool)
        .unwrap_or(false);
    session.started_at = timestamp(entries.get(KEY_SESSION_START));
    session.last_identity = entries
        .get(KEY_LAST_USER)
        .and_then(Value::as_str)
        .and_then(Identity::normalize)
        .filter(|identity| !session.is_excluded(identity));
    session.last_updated_at = timestamp(entries.get(KEY_LAST_UPDATE));
    session.subject_label = entries
        .get(KEY_CURRENT_SUBJECT)
        .and_then(Value::as_str)
        .map(str::to_string);
    session
}

/// Every session scope in the store.
pub fn load_sessions(store: &dyn KvStore) -> Result<Vec<Session>, String> {
    let mut sessions = Vec::new();
    for scope in store.scopes()? {
        let Some(session_id) = session_id_from_scope(&scope) else {
            continue;
        };
        let entries = store.get(&scope, &[])?;
        sessions.push(restore_session(session_id, &entries));
    }
    Ok(sessions)
}

fn string_set(value: Option<&Value>) -> HashSet<Identity> {
    let values: Vec<&str> = value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    normalize_all(values)
}

fn timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

fn select(entries: &Entries, keys: &[&str]) -> Entries {
    if keys.is_empty() {
        return entries.clone();
    }
    keys.iter()
        .filter_map(|key| entries.get(*key).map(|value| (key.to_string(), value.clone())))
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// SQLite
// ═══════════════════════════════════════════════════════════════════════════════

/// SQLite-backed store. Holds one connection for its lifetime; the
/// coordinator is the only writer.
pub struct SqliteKv {
    conn: Mutex<Connection>,
}

impl SqliteKv {
    pub fn new(path: PathBuf) -> Result<Self, String> {
        let store = Self {
            conn: Mutex::new(open(&path)?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS kv (
                    scope TEXT NOT NULL,
                    key TEXT NOT NULL,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (scope, key)
                 );",
            )
            .map_err(|err| format!("Failed to initialize schema: {}", err))
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| "SQLite connection lock poisoned".to_string())?;
        op(&mut conn)
    }
}

fn open(path: &Path) -> Result<Connection, String> {
    if let Some(parent) = path.parent() {
        fs_err::create_dir_all(parent)
            .map_err(|err| format!("Failed to create storage dir: {}", err))?;
    }

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

    let conn = Connection::open_with_flags(path, flags)
        .map_err(|err| format!("Failed to open sqlite db: {}", err))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|err| format!("Failed to enable WAL: {}", err))?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(|err| format!("Failed to set synchronous: {}", err))?;
    conn.pragma_update(None, "busy_timeout", 5000)
        .map_err(|err| format!("Failed to set busy_timeout: {}", err))?;

    Ok(conn)
}

impl KvStore for SqliteKv {
    fn get(&self, scope: &str, keys: &[&str]) -> Result<Entries, String> {
        let all = self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT key, value FROM kv WHERE scope = ?1")
                .map_err(|err| format!("Failed to prepare kv query: {}", err))?;
            let rows = stmt
                .query_map(params![scope], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(|err| format!("Failed to read kv rows: {}", err))?;

            let mut entries = Entries::new();
            for row in rows {
                let (key, raw) = row.map_err(|err| format!("Failed to decode kv row: {}", err))?;
                let value: Value = serde_json::from_str(&raw)
                    .map_err(|err| format!("Failed to parse value for {}: {}", key, err))?;
                entries.insert(key, value);
            }
            Ok(entries)
        })?;
        Ok(select(&all, keys))
    }

    fn set(&self, scope: &str, entries: &Entries) -> Result<(), String> {
        let updated_at = Utc::now().to_rfc3339();
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| format!("Failed to begin transaction: {}", err))?;
            for (key, value) in entries {
                let raw = serde_json::to_string(value)
                    .map_err(|err| format!("Failed to serialize {}: {}", key, err))?;
                tx.execute(
                    "INSERT INTO kv (scope, key, value, updated_at) \
                     VALUES (?1, ?2, ?3, ?4) \
                     ON CONFLICT(scope, key) DO UPDATE SET \
                        value = excluded.value, \
                        updated_at = excluded.updated_at",
                    params![scope, key, raw, updated_at],
                )
                .map_err(|err| format!("Failed to upsert {}: {}", key, err))?;
            }
            tx.commit()
                .map_err(|err| format!("Failed to commit kv update: {}", err))
        })
    }

    fn remove_scope(&self, scope: &str) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute("DELETE FROM kv WHERE scope = ?1", params![scope])
                .map_err(|err| format!("Failed to delete scope: {}", err))?;
            Ok(())
        })
    }

    fn scopes(&self) -> Result<Vec<String>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT DISTINCT scope FROM kv ORDER BY scope")
                .map_err(|err| format!("Failed to prepare scope query: {}", err))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|err| format!("Failed to read scope rows: {}", err))?;
            let mut scopes = Vec::new();
            for row in rows {
                scopes.push(row.map_err(|err| format!("Failed to decode scope: {}", err))?);
            }
            Ok(scopes)
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory
// ═══════════════════════════════════════════════════════════════════════════════

/// Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryKv {
    scopes: Arc<Mutex<BTreeMap<String, Entries>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Entries>>, String> {
        self.scopes
            .lock()
            .map_err(|_| "In-memory store lock poisoned".to_string())
    }
}

impl KvStore for MemoryKv {
    fn get(&self, scope: &str, keys: &[&str]) -> Result<Entries, String> {
        let scopes = self.lock()?;
        Ok(scopes
            .get(scope)
            .map(|entries| select(entries, keys))
            .unwrap_or_default())
    }

    fn set(&self, scope: &str, entries: &Entries) -> Result<(), String> {
        let mut scopes = self.lock()?;
        let stored = scopes.entry(scope.to_string()).or_default();
        for (key, value) in entries {
            stored.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn remove_scope(&self, scope: &str) -> Result<(), String> {
        self.lock()?.remove(scope);
        Ok(())
    }

    fn scopes(&self) -> Result<Vec<String>, String> {
        Ok(self.lock()?.keys().cloned().collect())
    }
}
