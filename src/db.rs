//! `EventStore`: the durable, ordered append log and its coordination
//! channel (spec §4.1).
//!
//! Persistence is `rusqlite` behind a shared connection, exactly as the
//! teacher's `Database` wraps `Arc<Mutex<Connection>>`. Postgres
//! LISTEN/NOTIFY has no sqlite equivalent, so it is emulated with a single
//! process-wide `tokio::sync::broadcast` channel carrying `(channel,
//! payload)` pairs; each `EventStore` handle (one per logical "connection"
//! — an agent, a wait call, the main loop) holds its own receiver and its
//! own listen-set, the same way distinct postgres connections each decide
//! which channels they LISTEN to.

mod schema;

pub use schema::{CONTEXT_KINDS, VALID_KINDS};

use crate::error::{IkigaiError, IkigaiResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex as TokioMutex};

/// Closed event kind enumeration (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Clear,
    System,
    User,
    Assistant,
    ToolCall,
    ToolResult,
    Mark,
    Rewind,
    AgentKilled,
    Command,
    Fork,
    Usage,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Clear => "clear",
            EventKind::System => "system",
            EventKind::User => "user",
            EventKind::Assistant => "assistant",
            EventKind::ToolCall => "tool_call",
            EventKind::ToolResult => "tool_result",
            EventKind::Mark => "mark",
            EventKind::Rewind => "rewind",
            EventKind::AgentKilled => "agent_killed",
            EventKind::Command => "command",
            EventKind::Fork => "fork",
            EventKind::Usage => "usage",
        }
    }

    pub fn parse(s: &str) -> IkigaiResult<Self> {
        Ok(match s {
            "clear" => EventKind::Clear,
            "system" => EventKind::System,
            "user" => EventKind::User,
            "assistant" => EventKind::Assistant,
            "tool_call" => EventKind::ToolCall,
            "tool_result" => EventKind::ToolResult,
            "mark" => EventKind::Mark,
            "rewind" => EventKind::Rewind,
            "agent_killed" => EventKind::AgentKilled,
            "command" => EventKind::Command,
            "fork" => EventKind::Fork,
            "usage" => EventKind::Usage,
            other => return Err(IkigaiError::InvalidKind(other.to_string())),
        })
    }

    /// Whether this kind is appended to the replay context (spec §4.2).
    pub fn is_context_visible(self) -> bool {
        matches!(
            self,
            EventKind::System
                | EventKind::User
                | EventKind::Assistant
                | EventKind::ToolCall
                | EventKind::ToolResult
                | EventKind::Mark
                | EventKind::Rewind
        )
    }
}

/// A record appended to the log (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub session_id: i64,
    pub agent_uuid: Option<String>,
    pub kind: String,
    pub content: Option<String>,
    pub data: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn kind(&self) -> Option<EventKind> {
        EventKind::parse(&self.kind).ok()
    }
}

/// The durable row backing one `Agent` (spec §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRow {
    pub uuid: String,
    pub session_id: i64,
    pub name: Option<String>,
    pub parent_uuid: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub fork_message_id: Option<i64>,
}

/// A persistent per-recipient mail row (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mail {
    pub id: i64,
    pub session_id: i64,
    pub from_uuid: String,
    pub to_uuid: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
}

#[derive(Default)]
struct TxState {
    depth: u32,
    pending_notifies: Vec<(String, String)>,
}

struct Shared {
    conn: StdMutex<Connection>,
    tx: StdMutex<TxState>,
    hub: broadcast::Sender<(String, String)>,
}

/// One logical connection onto the log: durable storage plus a private
/// listen-set and notification receiver.
pub struct EventStore {
    shared: Arc<Shared>,
    receiver: TokioMutex<broadcast::Receiver<(String, String)>>,
    listen_set: StdMutex<HashSet<String>>,
}

const HUB_CAPACITY: usize = 1024;

impl EventStore {
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> IkigaiResult<Self> {
        let conn = Connection::open(path).map_err(|e| IkigaiError::DbConnect(e.to_string()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> IkigaiResult<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| IkigaiError::DbConnect(e.to_string()))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> IkigaiResult<Self> {
        conn.execute_batch(schema::SCHEMA)?;
        let (hub, receiver) = broadcast::channel(HUB_CAPACITY);
        let shared = Arc::new(Shared {
            conn: StdMutex::new(conn),
            tx: StdMutex::new(TxState::default()),
            hub,
        });
        Ok(Self {
            shared,
            receiver: TokioMutex::new(receiver),
            listen_set: StdMutex::new(HashSet::new()),
        })
    }

    /// Open a new logical connection onto the same durable storage, with
    /// its own independent listen-set (mirrors opening another postgres
    /// connection against the same database).
    pub fn handle(&self) -> EventStore {
        EventStore {
            shared: self.shared.clone(),
            receiver: TokioMutex::new(self.shared.hub.subscribe()),
            listen_set: StdMutex::new(HashSet::new()),
        }
    }

    // ---------------------------------------------------------------- tx

    pub fn begin(&self) -> IkigaiResult<()> {
        let mut tx = self.shared.tx.lock().unwrap();
        if tx.depth > 0 {
            return Err(IkigaiError::InvalidArg(
                "nested transactions are not supported".into(),
            ));
        }
        self.shared
            .conn
            .lock()
            .unwrap()
            .execute_batch("BEGIN")
            .map_err(|e| IkigaiError::Io(e.to_string()))?;
        tx.depth = 1;
        Ok(())
    }

    pub fn commit(&self) -> IkigaiResult<()> {
        let pending = {
            let mut tx = self.shared.tx.lock().unwrap();
            if tx.depth == 0 {
                return Err(IkigaiError::InvalidArg("no transaction in progress".into()));
            }
            self.shared
                .conn
                .lock()
                .unwrap()
                .execute_batch("COMMIT")
                .map_err(|e| IkigaiError::Io(e.to_string()))?;
            tx.depth = 0;
            std::mem::take(&mut tx.pending_notifies)
        };
        for (channel, payload) in pending {
            let _ = self.shared.hub.send((channel, payload));
        }
        Ok(())
    }

    pub fn rollback(&self) -> IkigaiResult<()> {
        let mut tx = self.shared.tx.lock().unwrap();
        if tx.depth == 0 {
            return Err(IkigaiError::InvalidArg("no transaction in progress".into()));
        }
        self.shared
            .conn
            .lock()
            .unwrap()
            .execute_batch("ROLLBACK")
            .map_err(|e| IkigaiError::Io(e.to_string()))?;
        tx.depth = 0;
        tx.pending_notifies.clear();
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.shared.tx.lock().unwrap().depth > 0
    }

    // ------------------------------------------------------------ append

    pub fn append(
        &self,
        session_id: i64,
        agent_uuid: Option<&str>,
        kind: EventKind,
        content: Option<&str>,
        data: Option<&Value>,
    ) -> IkigaiResult<i64> {
        let conn = self.shared.conn.lock().unwrap();
        let next_id: i64 = conn.query_row(
            "SELECT COALESCE(MAX(id), 0) + 1 FROM messages WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        let now = Utc::now();
        let data_str = data.map(|v| v.to_string());
        conn.execute(
            "INSERT INTO messages (session_id, id, agent_uuid, kind, content, data, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session_id,
                next_id,
                agent_uuid,
                kind.as_str(),
                content,
                data_str,
                now.to_rfc3339(),
            ],
        )?;
        Ok(next_id)
    }

    pub fn query_events(&self, session_id: i64) -> IkigaiResult<Vec<Event>> {
        let conn = self.shared.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT session_id, id, agent_uuid, kind, content, data, created_at
             FROM messages WHERE session_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            let data_str: Option<String> = row.get(5)?;
            let created_at: String = row.get(6)?;
            Ok(Event {
                session_id: row.get(0)?,
                id: row.get(1)?,
                agent_uuid: row.get(2)?,
                kind: row.get(3)?,
                content: row.get(4)?,
                data: data_str.and_then(|s| serde_json::from_str(&s).ok()),
                created_at: parse_datetime(&created_at),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Adopt every session-global (`agent_uuid IS NULL`) event row onto
    /// `uuid`. Used once, by root-agent creation (SPEC_FULL.md §C, resolved
    /// via `original_source/db/agent_zero.c`).
    pub fn adopt_orphans(&self, session_id: i64, uuid: &str) -> IkigaiResult<usize> {
        let conn = self.shared.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE messages SET agent_uuid = ?1 WHERE session_id = ?2 AND agent_uuid IS NULL",
            params![uuid, session_id],
        )?;
        Ok(n)
    }

    pub fn create_session(&self) -> IkigaiResult<i64> {
        let conn = self.shared.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sessions (active, created_at) VALUES (1, ?1)",
            params![Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn session_exists(&self, session_id: i64) -> IkigaiResult<bool> {
        let conn = self.shared.conn.lock().unwrap();
        let found: Option<i64> = conn
            .query_row(
                "SELECT id FROM sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // -------------------------------------------------------------- agents

    #[allow(clippy::too_many_arguments)]
    pub fn insert_agent_row(
        &self,
        uuid: &str,
        session_id: i64,
        name: Option<&str>,
        parent_uuid: Option<&str>,
        status: &str,
        created_at: DateTime<Utc>,
        fork_message_id: Option<i64>,
    ) -> IkigaiResult<()> {
        let conn = self.shared.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO agents (uuid, session_id, name, parent_uuid, status, created_at, fork_message_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                uuid,
                session_id,
                name,
                parent_uuid,
                status,
                created_at.to_rfc3339(),
                fork_message_id,
            ],
        )?;
        Ok(())
    }

    pub fn update_agent_status(&self, uuid: &str, status: &str) -> IkigaiResult<()> {
        let conn = self.shared.conn.lock().unwrap();
        conn.execute(
            "UPDATE agents SET status = ?1 WHERE uuid = ?2",
            params![status, uuid],
        )?;
        Ok(())
    }

    pub fn query_agent_rows(&self, session_id: i64) -> IkigaiResult<Vec<AgentRow>> {
        let conn = self.shared.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT uuid, session_id, name, parent_uuid, status, created_at, fork_message_id
             FROM agents WHERE session_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            let created_at: String = row.get(5)?;
            Ok(AgentRow {
                uuid: row.get(0)?,
                session_id: row.get(1)?,
                name: row.get(2)?,
                parent_uuid: row.get(3)?,
                status: row.get(4)?,
                created_at: parse_datetime(&created_at),
                fork_message_id: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ---------------------------------------------------------------- mail

    pub fn insert_mail(
        &self,
        session_id: i64,
        from_uuid: &str,
        to_uuid: &str,
        body: &str,
    ) -> IkigaiResult<i64> {
        let conn = self.shared.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO mail (session_id, from_uuid, to_uuid, body, timestamp, read)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
            params![session_id, from_uuid, to_uuid, body, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Unread rows first, then newest-first within each class (spec §3).
    pub fn query_mail_inbox(
        &self,
        session_id: i64,
        to_uuid: &str,
        from_uuid: Option<&str>,
    ) -> IkigaiResult<Vec<Mail>> {
        let conn = self.shared.conn.lock().unwrap();
        let sql = "SELECT id, session_id, from_uuid, to_uuid, body, timestamp, read
                   FROM mail
                   WHERE session_id = ?1 AND to_uuid = ?2
                     AND (?3 IS NULL OR from_uuid = ?3)
                   ORDER BY read ASC, timestamp DESC";
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![session_id, to_uuid, from_uuid], |row| {
            let timestamp: String = row.get(5)?;
            let read: i64 = row.get(6)?;
            Ok(Mail {
                id: row.get(0)?,
                session_id: row.get(1)?,
                from_uuid: row.get(2)?,
                to_uuid: row.get(3)?,
                body: row.get(4)?,
                timestamp: parse_datetime(&timestamp),
                read: read != 0,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn mark_mail_read(&self, id: i64) -> IkigaiResult<()> {
        let conn = self.shared.conn.lock().unwrap();
        conn.execute("UPDATE mail SET read = 1 WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Returns `true` if a row belonging to `recipient` was deleted.
    pub fn delete_mail(&self, id: i64, recipient: &str) -> IkigaiResult<bool> {
        let conn = self.shared.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM mail WHERE id = ?1 AND to_uuid = ?2",
            params![id, recipient],
        )?;
        Ok(n > 0)
    }

    // --------------------------------------------------------- listen/notify

    pub fn listen(&self, channel: &str) -> IkigaiResult<()> {
        if self.in_transaction() {
            return Err(IkigaiError::InvalidArg(
                "listen must be called outside a transaction".into(),
            ));
        }
        self.listen_set.lock().unwrap().insert(channel.to_string());
        Ok(())
    }

    pub fn unlisten(&self, channel: &str) -> IkigaiResult<()> {
        if self.in_transaction() {
            return Err(IkigaiError::InvalidArg(
                "unlisten must be called outside a transaction".into(),
            ));
        }
        self.listen_set.lock().unwrap().remove(channel);
        Ok(())
    }

    /// Best-effort: delivery is not guaranteed if nothing is listening on
    /// `channel`, or if this call happens inside a transaction (the
    /// notification is deferred until `commit`, per spec §4.1).
    pub fn notify(&self, channel: &str, payload: &str) -> IkigaiResult<()> {
        let mut tx = self.shared.tx.lock().unwrap();
        if tx.depth > 0 {
            tx.pending_notifies
                .push((channel.to_string(), payload.to_string()));
        } else {
            drop(tx);
            let _ = self
                .shared
                .hub
                .send((channel.to_string(), payload.to_string()));
        }
        Ok(())
    }

    /// Non-blocking: invokes `callback(channel, payload)` for every
    /// pending notification on a channel this handle is listening to.
    /// Returns the number of notifications delivered.
    pub fn drain_notifications<F: FnMut(&str, &str)>(&self, mut callback: F) -> usize {
        let Ok(mut rx) = self.receiver.try_lock() else {
            return 0;
        };
        let listen_set = self.listen_set.lock().unwrap();
        let mut count = 0;
        loop {
            match rx.try_recv() {
                Ok((channel, payload)) => {
                    if listen_set.contains(&channel) {
                        callback(&channel, &payload);
                        count += 1;
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        count
    }

    /// `socket_fd()` has no real descriptor backing it in this
    /// implementation (notifications ride an in-process broadcast
    /// channel, not a socket); -1 signals "unavailable" per spec, and
    /// callers should use `block_until_notified` instead of `select`ing
    /// on this directly.
    pub fn socket_fd(&self) -> i32 {
        -1
    }

    /// Block until a notification this handle listens for arrives, or
    /// `timeout` elapses. This is the async substitute for "select on the
    /// store socket" (spec §4.6, §9): a single blocking await replaces
    /// the single blocking `select` call the spec mandates.
    pub async fn block_until_notified(&self, timeout: Duration) -> Option<(String, String)> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let mut rx = self.receiver.lock().await;
            tokio::select! {
                res = rx.recv() => {
                    match res {
                        Ok((channel, payload)) => {
                            let is_ours = self.listen_set.lock().unwrap().contains(&channel);
                            drop(rx);
                            if is_ours {
                                return Some((channel, payload));
                            }
                            // not for us; loop and keep waiting out the remaining budget
                        }
                        Err(_) => return None,
                    }
                }
                () = tokio::time::sleep(remaining) => {
                    return None;
                }
            }
        }
    }
}

pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_query_round_trip() {
        let store = EventStore::open_in_memory().unwrap();
        let session_id = store.create_session().unwrap();
        let id = store
            .append(session_id, None, EventKind::User, Some("hi"), None)
            .unwrap();
        let events = store.query_events(session_id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, id);
        assert_eq!(events[0].content.as_deref(), Some("hi"));
    }

    #[test]
    fn ids_strictly_increase_per_session() {
        let store = EventStore::open_in_memory().unwrap();
        let s1 = store.create_session().unwrap();
        let s2 = store.create_session().unwrap();
        let a = store.append(s1, None, EventKind::User, None, None).unwrap();
        let b = store.append(s1, None, EventKind::User, None, None).unwrap();
        let c = store.append(s2, None, EventKind::User, None, None).unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(c, 1);
    }

    #[test]
    fn invalid_kind_is_rejected_when_parsed_from_string() {
        assert!(EventKind::parse("not_a_kind").is_err());
        assert!(EventKind::parse("tool_call").is_ok());
    }

    #[test]
    fn transaction_defers_notify_until_commit() {
        let store = EventStore::open_in_memory().unwrap();
        store.listen("chan").unwrap();
        store.begin().unwrap();
        store.notify("chan", "payload").unwrap();
        let mut seen = 0;
        store.drain_notifications(|_, _| seen += 1);
        assert_eq!(seen, 0);
        store.commit().unwrap();
        let mut seen = 0;
        let mut got = None;
        store.drain_notifications(|c, p| {
            seen += 1;
            got = Some((c.to_string(), p.to_string()));
        });
        assert_eq!(seen, 1);
        assert_eq!(got, Some(("chan".to_string(), "payload".to_string())));
    }

    #[test]
    fn rollback_discards_pending_notify() {
        let store = EventStore::open_in_memory().unwrap();
        store.listen("chan").unwrap();
        store.begin().unwrap();
        store.notify("chan", "x").unwrap();
        store.rollback().unwrap();
        let mut seen = 0;
        store.drain_notifications(|_, _| seen += 1);
        assert_eq!(seen, 0);
    }

    #[test]
    fn orphan_adoption_updates_null_agent_uuid_rows() {
        let store = EventStore::open_in_memory().unwrap();
        let session_id = store.create_session().unwrap();
        store
            .append(session_id, None, EventKind::System, Some("boot"), None)
            .unwrap();
        let n = store.adopt_orphans(session_id, "root-uuid").unwrap();
        assert_eq!(n, 1);
        let events = store.query_events(session_id).unwrap();
        assert_eq!(events[0].agent_uuid.as_deref(), Some("root-uuid"));
    }

    #[tokio::test]
    async fn block_until_notified_returns_on_notify() {
        let store = EventStore::open_in_memory().unwrap();
        let waiter = store.handle();
        waiter.listen("agent_event_x").unwrap();
        let notifier = store.handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            notifier.notify("agent_event_x", "mail").unwrap();
        });
        let result = waiter
            .block_until_notified(Duration::from_millis(500))
            .await;
        assert_eq!(
            result,
            Some(("agent_event_x".to_string(), "mail".to_string()))
        );
    }

    #[tokio::test]
    async fn block_until_notified_times_out_without_notify() {
        let store = EventStore::open_in_memory().unwrap();
        let waiter = store.handle();
        waiter.listen("agent_event_x").unwrap();
        let result = waiter
            .block_until_notified(Duration::from_millis(30))
            .await;
        assert_eq!(result, None);
    }
}
