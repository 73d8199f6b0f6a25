//! SQL schema for the event log, agent table, and mail table.

/// Schema applied on every `EventStore::open`. `IF NOT EXISTS` everywhere
/// makes this idempotent across restarts, matching the teacher's
/// migration style (`db.rs::run_migrations`).
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY,
    active INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    session_id INTEGER NOT NULL,
    id INTEGER NOT NULL,
    agent_uuid TEXT,
    kind TEXT NOT NULL,
    content TEXT,
    data TEXT,
    created_at TEXT NOT NULL,
    PRIMARY KEY (session_id, id),
    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_session_id ON messages(session_id, id);
CREATE INDEX IF NOT EXISTS idx_messages_agent ON messages(session_id, agent_uuid);

CREATE TABLE IF NOT EXISTS agents (
    uuid TEXT PRIMARY KEY,
    session_id INTEGER NOT NULL,
    name TEXT,
    parent_uuid TEXT,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    fork_message_id INTEGER,
    FOREIGN KEY (parent_uuid) REFERENCES agents(uuid)
);

CREATE INDEX IF NOT EXISTS idx_agents_parent ON agents(parent_uuid);
CREATE INDEX IF NOT EXISTS idx_agents_session ON agents(session_id, created_at);

CREATE TABLE IF NOT EXISTS mail (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL,
    from_uuid TEXT NOT NULL,
    to_uuid TEXT NOT NULL,
    body TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    read INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_mail_inbox ON mail(session_id, to_uuid, read, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_mail_inbox_from ON mail(session_id, to_uuid, from_uuid);
"#;

/// The closed set of event kinds (spec §3).
pub const VALID_KINDS: &[&str] = &[
    "clear",
    "system",
    "user",
    "assistant",
    "tool_call",
    "tool_result",
    "mark",
    "rewind",
    "agent_killed",
    "command",
    "fork",
    "usage",
];

/// Event kinds that are conversation-visible (appended to replay context).
pub const CONTEXT_KINDS: &[&str] = &[
    "system",
    "user",
    "assistant",
    "tool_call",
    "tool_result",
    "mark",
    "rewind",
];
