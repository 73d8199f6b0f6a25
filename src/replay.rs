//! Deterministic state reconstruction from an event stream (spec §4.2).
//!
//! `Replayer` turns the ordered event history for one agent back into a
//! `ReplayContext` plus the handful of in-memory fields (pins, toolset
//! filter, provider/model selection) that the history also carries.
//! Replay never fails hard: malformed `data` payloads are logged and
//! skipped, mirroring the teacher's tolerant parsing in `db.rs`'s
//! `parse_state`/`parse_message_type` helpers. The only propagated error
//! is an IO failure from the store itself, surfaced by the caller before
//! replay ever starts.

use crate::db::{Event, EventKind};
use serde_json::Value;

const INITIAL_CONTEXT_CAPACITY: usize = 16;
const INITIAL_MARK_CAPACITY: usize = 4;

/// A replay-time checkpoint (spec §3).
#[derive(Debug, Clone, PartialEq)]
pub struct MarkEntry {
    pub message_id: i64,
    pub label: Option<String>,
    pub context_idx: usize,
}

/// The reconstructed, transient view of one agent's conversation.
#[derive(Debug, Clone, Default)]
pub struct ReplayContext {
    pub messages: Vec<Event>,
    pub marks: Vec<MarkEntry>,
}

/// Model/provider selection recovered from a `command model` event.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSelection {
    pub model: String,
    pub thinking_level: Option<String>,
}

/// Side effects replay recovers beyond the context itself: the agent's
/// pin list, toolset filter, and last model selection (spec §4.2, "fork"
/// and "command" handling).
#[derive(Debug, Clone, Default)]
pub struct ReplayEffects {
    pub pinned_paths: Vec<String>,
    pub toolset_filter: Option<Vec<String>>,
    pub model_selection: Option<ModelSelection>,
}

#[derive(Debug, Clone, Default)]
pub struct ReplayOutcome {
    pub context: ReplayContext,
    pub effects: ReplayEffects,
}

pub struct Replayer;

impl Replayer {
    /// Replays every event belonging to `agent_uuid` (events for other
    /// agents, or session-global rows not yet adopted, are ignored —
    /// orphan adoption at root-agent creation is expected to have already
    /// run, per SPEC_FULL.md §C).
    pub fn replay(events: &[Event], agent_uuid: &str) -> ReplayOutcome {
        let mut context: Vec<Event> = Vec::with_capacity(INITIAL_CONTEXT_CAPACITY);
        let mut marks: Vec<MarkEntry> = Vec::with_capacity(INITIAL_MARK_CAPACITY);
        let mut effects = ReplayEffects::default();

        for event in events {
            if event.agent_uuid.as_deref() != Some(agent_uuid) {
                continue;
            }
            apply_one(event, &mut context, &mut marks, &mut effects);
        }

        ReplayOutcome {
            context: ReplayContext { messages: context, marks },
            effects,
        }
    }
}

/// Applies a single event's replay effect to `context`/`marks`/`effects`.
/// Shared between bulk replay and the live incremental path an `Agent`
/// uses to absorb one freshly-appended event without re-walking history.
pub(crate) fn apply_one(
    event: &Event,
    context: &mut Vec<Event>,
    marks: &mut Vec<MarkEntry>,
    effects: &mut ReplayEffects,
) {
    let Some(kind) = event.kind() else {
        tracing::warn!(event_id = event.id, kind = %event.kind, "unknown event kind during replay, skipping");
        return;
    };
    match kind {
        EventKind::Clear => {
            context.clear();
            marks.clear();
        }
        EventKind::System
        | EventKind::User
        | EventKind::Assistant
        | EventKind::ToolCall
        | EventKind::ToolResult => {
            context.push(event.clone());
        }
        EventKind::Mark => {
            let label = event
                .data
                .as_ref()
                .and_then(|d| d.get("label"))
                .and_then(Value::as_str)
                .map(str::to_string);
            context.push(event.clone());
            marks.push(MarkEntry {
                message_id: event.id,
                label,
                context_idx: context.len() - 1,
            });
        }
        EventKind::Rewind => {
            apply_rewind(event, context, marks);
        }
        EventKind::Fork => {
            apply_fork(event, effects);
        }
        EventKind::Command => {
            apply_command(event, effects);
        }
        EventKind::AgentKilled | EventKind::Usage => {
            // Recorded for audit/metrics; no replay-context effect.
        }
    }
}

fn apply_rewind(event: &Event, context: &mut Vec<Event>, marks: &mut Vec<MarkEntry>) {
    let target = event
        .data
        .as_ref()
        .and_then(|d| d.get("target_message_id"))
        .and_then(Value::as_i64);
    let Some(target) = target else {
        tracing::warn!(event_id = event.id, "rewind with malformed or missing target_message_id, skipping");
        return;
    };
    let Some(mark_pos) = marks.iter().position(|m| m.message_id == target) else {
        tracing::warn!(event_id = event.id, target, "rewind target mark not found, skipping");
        return;
    };
    let mark = marks[mark_pos].clone();
    context.truncate(mark.context_idx + 1);
    marks.truncate(mark_pos + 1);
    context.push(event.clone());
}

fn apply_fork(event: &Event, effects: &mut ReplayEffects) {
    let is_child = event
        .data
        .as_ref()
        .and_then(|d| d.get("role"))
        .and_then(Value::as_str)
        == Some("child");
    if !is_child {
        return;
    }
    if let Some(paths) = event.data.as_ref().and_then(|d| d.get("pinned_paths")) {
        if let Some(arr) = paths.as_array() {
            effects.pinned_paths = arr
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
        }
    }
    if let Some(filter) = event.data.as_ref().and_then(|d| d.get("toolset_filter")) {
        if let Some(arr) = filter.as_array() {
            effects.toolset_filter = Some(
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
            );
        }
    }
}

fn apply_command(event: &Event, effects: &mut ReplayEffects) {
    let Some(data) = event.data.as_ref() else {
        return;
    };
    let Some(command) = data.get("command").and_then(Value::as_str) else {
        return;
    };
    let args = data.get("args").and_then(Value::as_str).unwrap_or("");
    match command {
        "model" => {
            let (model, level) = match args.split_once('/') {
                Some((model, level)) => (model.to_string(), Some(level.to_string())),
                None => (args.to_string(), None),
            };
            if !model.is_empty() {
                effects.model_selection = Some(ModelSelection {
                    model,
                    thinking_level: level,
                });
            }
        }
        "pin" => {
            let path = args.to_string();
            if !path.is_empty() && !effects.pinned_paths.contains(&path) {
                effects.pinned_paths.push(path);
            }
        }
        "unpin" => {
            effects.pinned_paths.retain(|p| p != args);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(id: i64, agent: &str, kind: EventKind, data: Option<Value>) -> Event {
        Event {
            id,
            session_id: 1,
            agent_uuid: Some(agent.to_string()),
            kind: kind.as_str().to_string(),
            content: None,
            data,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn scenario_2_clear_and_rewind() {
        let events = vec![
            event(1, "a", EventKind::User, None),
            event(2, "a", EventKind::Mark, Some(serde_json::json!({"label": "m"}))),
            event(3, "a", EventKind::User, None),
            event(
                4,
                "a",
                EventKind::Rewind,
                Some(serde_json::json!({"target_message_id": 2})),
            ),
            event(5, "a", EventKind::User, None),
            event(6, "a", EventKind::Clear, None),
            event(7, "a", EventKind::User, None),
        ];
        let outcome = Replayer::replay(&events, "a");
        assert_eq!(outcome.context.messages.len(), 1);
        assert_eq!(outcome.context.messages[0].id, 7);
        assert!(outcome.context.marks.is_empty());
    }

    #[test]
    fn rewind_to_missing_mark_is_noop() {
        let events = vec![
            event(1, "a", EventKind::User, None),
            event(
                2,
                "a",
                EventKind::Rewind,
                Some(serde_json::json!({"target_message_id": 999})),
            ),
        ];
        let outcome = Replayer::replay(&events, "a");
        // the malformed rewind is skipped entirely, so it never enters context
        assert_eq!(outcome.context.messages.len(), 1);
    }

    #[test]
    fn pin_twice_then_unpin_leaves_list_empty() {
        let mk_cmd = |id: i64, cmd: &str, args: &str| {
            event(
                id,
                "a",
                EventKind::Command,
                Some(serde_json::json!({"command": cmd, "args": args})),
            )
        };
        let events = vec![
            mk_cmd(1, "pin", "/a.txt"),
            mk_cmd(2, "pin", "/a.txt"),
            mk_cmd(3, "unpin", "/a.txt"),
        ];
        let outcome = Replayer::replay(&events, "a");
        assert!(outcome.effects.pinned_paths.is_empty());
    }

    #[test]
    fn pins_survive_clear() {
        let mk_cmd = |id: i64, cmd: &str, args: &str| {
            event(
                id,
                "a",
                EventKind::Command,
                Some(serde_json::json!({"command": cmd, "args": args})),
            )
        };
        let events = vec![
            mk_cmd(1, "pin", "/a.txt"),
            event(2, "a", EventKind::Clear, None),
        ];
        let outcome = Replayer::replay(&events, "a");
        assert_eq!(outcome.effects.pinned_paths, vec!["/a.txt".to_string()]);
    }

    #[test]
    fn fork_child_recovers_pins_and_toolset() {
        let data = serde_json::json!({
            "role": "child",
            "pinned_paths": ["/x", "/y"],
            "toolset_filter": ["bash"],
        });
        let events = vec![event(1, "child", EventKind::Fork, Some(data))];
        let outcome = Replayer::replay(&events, "child");
        assert_eq!(outcome.effects.pinned_paths, vec!["/x", "/y"]);
        assert_eq!(
            outcome.effects.toolset_filter,
            Some(vec!["bash".to_string()])
        );
    }

    #[test]
    fn model_command_splits_on_slash() {
        let data = serde_json::json!({"command": "model", "args": "claude-4.5-sonnet/high"});
        let events = vec![event(1, "a", EventKind::Command, Some(data))];
        let outcome = Replayer::replay(&events, "a");
        let sel = outcome.effects.model_selection.unwrap();
        assert_eq!(sel.model, "claude-4.5-sonnet");
        assert_eq!(sel.thinking_level, Some("high".to_string()));
    }

    #[test]
    fn determinism_replaying_twice_yields_identical_context() {
        let events = vec![
            event(1, "a", EventKind::User, None),
            event(2, "a", EventKind::Assistant, None),
            event(3, "a", EventKind::Mark, None),
        ];
        let first = Replayer::replay(&events, "a");
        let second = Replayer::replay(&events, "a");
        assert_eq!(first.context.messages.len(), second.context.messages.len());
        assert_eq!(first.context.marks, second.context.marks);
    }

    #[test]
    fn hundred_marks_succeed() {
        let mut events = Vec::new();
        for i in 1..=100 {
            events.push(event(i, "a", EventKind::Mark, None));
        }
        let outcome = Replayer::replay(&events, "a");
        assert_eq!(outcome.context.marks.len(), 100);
    }

    fn arb_kind() -> impl proptest::strategy::Strategy<Value = EventKind> {
        use proptest::prelude::*;
        prop_oneof![
            Just(EventKind::User),
            Just(EventKind::Assistant),
            Just(EventKind::Mark),
            Just(EventKind::Clear),
        ]
    }

    proptest::proptest! {
        /// Replay is a pure fold: the same event slice always reconstructs
        /// the same context and mark stack, regardless of how many times
        /// it runs (spec §4.2's "deterministic state reconstruction").
        #[test]
        fn prop_replay_is_deterministic(kinds in proptest::collection::vec(arb_kind(), 0..40)) {
            let events: Vec<Event> = kinds
                .into_iter()
                .enumerate()
                .map(|(i, kind)| event((i + 1) as i64, "a", kind, None))
                .collect();
            let first = Replayer::replay(&events, "a");
            let second = Replayer::replay(&events, "a");
            proptest::prop_assert_eq!(first.context.messages.len(), second.context.messages.len());
            proptest::prop_assert_eq!(first.context.marks, second.context.marks);
        }

        /// The mark stack never exceeds the number of `Mark` events folded
        /// in, no matter how many `Clear`/non-mark events are interleaved.
        #[test]
        fn prop_mark_stack_bounded_by_mark_count(kinds in proptest::collection::vec(arb_kind(), 0..60)) {
            let mark_count = kinds.iter().filter(|k| **k == EventKind::Mark).count();
            let events: Vec<Event> = kinds
                .into_iter()
                .enumerate()
                .map(|(i, kind)| event((i + 1) as i64, "a", kind, None))
                .collect();
            let outcome = Replayer::replay(&events, "a");
            proptest::prop_assert!(outcome.context.marks.len() <= mark_count);
        }
    }
}
