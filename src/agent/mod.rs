//! The long-lived conversational actor and its in-memory registry
//! (spec §3, §4.3).

mod registry;

pub use registry::AgentRegistry;

use crate::db::Event;
use crate::replay::{apply_one, MarkEntry, ReplayEffects, ReplayOutcome};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Running,
    Dead,
    Reaped,
}

/// Everything about one agent: the durable row fields plus the in-memory
/// state Replayer reconstructs and AgentDriver mutates live.
pub struct Agent {
    pub uuid: String,
    pub parent_uuid: Option<String>,
    pub status: AgentStatus,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub fork_message_id: Option<i64>,

    pub model: Option<String>,
    pub thinking_level: Option<String>,
    pub pinned_paths: Vec<String>,
    pub toolset_filter: Option<Vec<String>>,
    pub scrollback: Vec<String>,
    pub context: Vec<Event>,
    pub marks: Vec<MarkEntry>,
    pub idle: bool,

    pub(crate) created_seq: u64,
}

impl Agent {
    pub fn new_root(uuid: String, created_at: DateTime<Utc>, created_seq: u64) -> Self {
        Agent {
            uuid,
            parent_uuid: None,
            status: AgentStatus::Running,
            name: None,
            created_at,
            fork_message_id: None,
            model: None,
            thinking_level: None,
            pinned_paths: Vec::new(),
            toolset_filter: None,
            scrollback: Vec::new(),
            context: Vec::new(),
            marks: Vec::new(),
            idle: true,
            created_seq,
        }
    }

    pub fn new_child(
        uuid: String,
        parent_uuid: String,
        fork_message_id: i64,
        created_at: DateTime<Utc>,
        created_seq: u64,
    ) -> Self {
        Agent {
            uuid,
            parent_uuid: Some(parent_uuid),
            status: AgentStatus::Running,
            name: None,
            created_at,
            fork_message_id: Some(fork_message_id),
            model: None,
            thinking_level: None,
            pinned_paths: Vec::new(),
            toolset_filter: None,
            scrollback: Vec::new(),
            context: Vec::new(),
            marks: Vec::new(),
            idle: true,
            created_seq,
        }
    }

    /// Adopts a cold-replayed outcome: overwrites context/marks/pins/
    /// toolset/model from `outcome`, discarding any prior in-memory state.
    /// Used once at startup per agent.
    pub fn apply_replay_outcome(&mut self, outcome: ReplayOutcome) {
        self.context = outcome.context.messages;
        self.marks = outcome.context.marks;
        self.pinned_paths = outcome.effects.pinned_paths;
        self.toolset_filter = outcome.effects.toolset_filter;
        if let Some(sel) = outcome.effects.model_selection {
            self.model = Some(sel.model);
            self.thinking_level = sel.thinking_level;
        }
    }

    /// Absorbs one freshly-appended event into the live in-memory state,
    /// without re-walking the whole history. Uses the same per-event
    /// logic as bulk replay (`replay::apply_one`) so live and cold paths
    /// can never diverge.
    pub fn apply_live_event(&mut self, event: &Event) {
        if event.agent_uuid.as_deref() != Some(self.uuid.as_str()) {
            return;
        }
        let mut effects = ReplayEffects {
            pinned_paths: std::mem::take(&mut self.pinned_paths),
            toolset_filter: self.toolset_filter.take(),
            model_selection: None,
        };
        apply_one(event, &mut self.context, &mut self.marks, &mut effects);
        self.pinned_paths = effects.pinned_paths;
        self.toolset_filter = effects.toolset_filter;
        if let Some(sel) = effects.model_selection {
            self.model = Some(sel.model);
            self.thinking_level = sel.thinking_level;
        }
    }

    pub fn push_scrollback(&mut self, line: impl Into<String>) {
        self.scrollback.push(line.into());
    }

    pub fn is_running(&self) -> bool {
        self.status == AgentStatus::Running
    }
}
