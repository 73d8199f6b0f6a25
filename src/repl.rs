//! Thin slash-command dispatch surface (spec §4.11, §6).
//!
//! Parsing a raw terminal line into `{command, args}` is out of core
//! scope (SPEC_FULL.md §E); `ReplDriver` only interprets already-
//! tokenized pairs. Terminal rendering, scrollback wrapping, and ANSI
//! handling live outside this crate entirely — `ReplDriver` only
//! produces plain strings for the caller to display.

use crate::agent::AgentRegistry;
use crate::db::{EventKind, EventStore};
use crate::error::{IkigaiError, IkigaiResult};
use crate::lifecycle::{AgentLifecycle, KillOutcome, ReapOutcome};
use crate::mailbox::Mailbox;
use crate::wait::{NextMessageResult, WaitEngine};
use serde_json::json;
use std::sync::atomic::AtomicBool;

/// One parsed slash command, per the grammar in spec §6.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplCommand {
    Kill { target: Option<String> },
    Reap { target: Option<String> },
    Send { target: String, body: String },
    Wait,
    Model { name: String, level: Option<String> },
    System { prompt: Option<String> },
    Clear,
    Debug { on: Option<bool> },
    Mark { label: Option<String> },
    Rewind { mark_id: i64 },
    Pin { path: String },
    Unpin { path: String },
}

impl ReplCommand {
    /// Parses an already-tokenized `{command, args}` pair (the terminal's
    /// job is tokenizing a raw line into these; this crate never sees the
    /// raw line).
    pub fn parse(command: &str, args: &str) -> Result<Self, String> {
        let args = args.trim();
        match command {
            "kill" => Ok(ReplCommand::Kill { target: non_empty(args) }),
            "reap" => Ok(ReplCommand::Reap { target: non_empty(args) }),
            "send" => {
                let (target, body) = args
                    .split_once(' ')
                    .ok_or_else(|| "usage: /send <uuid> \"<body>\"".to_string())?;
                let body = body.trim().trim_matches('"').to_string();
                Ok(ReplCommand::Send { target: target.to_string(), body })
            }
            "wait" => Ok(ReplCommand::Wait),
            "model" => {
                if args.is_empty() {
                    return Err("usage: /model <name>[/<level>]".to_string());
                }
                let (name, level) = match args.split_once('/') {
                    Some((n, l)) => (n.to_string(), Some(l.to_string())),
                    None => (args.to_string(), None),
                };
                Ok(ReplCommand::Model { name, level })
            }
            "system" => Ok(ReplCommand::System { prompt: non_empty(args) }),
            "clear" => Ok(ReplCommand::Clear),
            "debug" => {
                let on = match args {
                    "on" => Some(true),
                    "off" => Some(false),
                    "" => None,
                    other => return Err(format!("usage: /debug [on|off], got {other:?}")),
                };
                Ok(ReplCommand::Debug { on })
            }
            "mark" => Ok(ReplCommand::Mark { label: non_empty(args) }),
            "rewind" => {
                let mark_id = args
                    .parse::<i64>()
                    .map_err(|_| "usage: /rewind <mark-id>".to_string())?;
                Ok(ReplCommand::Rewind { mark_id })
            }
            "pin" => {
                if args.is_empty() {
                    return Err("usage: /pin <path>".to_string());
                }
                Ok(ReplCommand::Pin { path: args.to_string() })
            }
            "unpin" => {
                if args.is_empty() {
                    return Err("usage: /unpin <path>".to_string());
                }
                Ok(ReplCommand::Unpin { path: args.to_string() })
            }
            other => Err(format!("unknown command: /{other}")),
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Outcome of dispatching one command: scrollback lines to display, plus
/// whether the current agent pointer changed (the caller needs this to
/// re-wire which `AgentDriver` subsequent input routes to).
#[derive(Debug, Default)]
pub struct ReplOutcome {
    pub scrollback: Vec<String>,
    pub current_changed: bool,
}

impl ReplOutcome {
    fn line(text: impl Into<String>) -> Self {
        ReplOutcome {
            scrollback: vec![text.into()],
            current_changed: false,
        }
    }
}

pub struct ReplDriver;

impl ReplDriver {
    /// Dispatches one command against the current agent. Commands that
    /// mutate the agent tree (`kill`, `reap`) or send mail reuse
    /// `AgentLifecycle`/`Mailbox` directly, never a bespoke code path.
    pub async fn dispatch(
        store: &EventStore,
        registry: &mut AgentRegistry,
        session_id: i64,
        current_uuid: &str,
        fork_pending: &AtomicBool,
        command: ReplCommand,
    ) -> IkigaiResult<ReplOutcome> {
        match command {
            ReplCommand::Kill { target } => {
                let target = target.unwrap_or_else(|| current_uuid.to_string());
                match AgentLifecycle::kill(store, registry, session_id, current_uuid, &target, fork_pending).await {
                    Ok(KillOutcome::Killed { count, .. }) => Ok(ReplOutcome {
                        scrollback: vec![format!("Killed {count} agent(s)")],
                        current_changed: true,
                    }),
                    Ok(KillOutcome::Rejected { message }) => Ok(ReplOutcome::line(message)),
                    Err(e) => Ok(ReplOutcome::line(e.to_string())),
                }
            }
            ReplCommand::Reap { target } => {
                let outcome = match target {
                    Some(target) => AgentLifecycle::reap_targeted(store, registry, &target).await,
                    None => AgentLifecycle::reap_all_dead(store, registry).await,
                };
                match outcome {
                    Ok(ReapOutcome::Reaped { count }) => Ok(ReplOutcome::line(format!("Reaped {count} agent(s)"))),
                    Ok(ReapOutcome::Rejected { message }) => Ok(ReplOutcome::line(message)),
                    Err(e) => Ok(ReplOutcome::line(e.to_string())),
                }
            }
            ReplCommand::Send { target, body } => {
                let mailbox = Mailbox::new(store);
                match mailbox.send(registry, session_id, current_uuid, &target, &body) {
                    Ok(_) => Ok(ReplOutcome::line(format!("Sent to {target}"))),
                    Err(e) => Ok(ReplOutcome::line(e.to_string())),
                }
            }
            ReplCommand::Wait => {
                let interrupted = AtomicBool::new(false);
                let result = WaitEngine::next_message(store, session_id, current_uuid, 0.0, &interrupted).await;
                match result {
                    NextMessageResult::Delivered { from, body } => {
                        Ok(ReplOutcome::line(format!("[{from}]: {body}")))
                    }
                    NextMessageResult::Timeout => Ok(ReplOutcome::line("No mail waiting")),
                    NextMessageResult::Interrupted => Ok(ReplOutcome::line("Wait interrupted")),
                }
            }
            ReplCommand::Model { name, level } => {
                let args = match &level {
                    Some(level) => format!("{name}/{level}"),
                    None => name,
                };
                match Self::append_command(store, registry, session_id, current_uuid, "model", &args) {
                    Ok(()) => Ok(ReplOutcome::line("Model updated")),
                    Err(e) => Ok(ReplOutcome::line(e.to_string())),
                }
            }
            ReplCommand::System { prompt } => {
                let args = prompt.unwrap_or_default();
                match Self::append_command(store, registry, session_id, current_uuid, "system", &args) {
                    Ok(()) => Ok(ReplOutcome::line("System prompt updated")),
                    Err(e) => Ok(ReplOutcome::line(e.to_string())),
                }
            }
            ReplCommand::Clear => {
                match store.append(session_id, Some(current_uuid), EventKind::Clear, None, None) {
                    Ok(_) => {
                        if let Some(agent) = registry.get_mut(current_uuid) {
                            agent.context.clear();
                            agent.marks.clear();
                        }
                        Ok(ReplOutcome::line("Context cleared"))
                    }
                    Err(e) => Ok(ReplOutcome::line(e.to_string())),
                }
            }
            ReplCommand::Debug { on } => {
                let args = match on {
                    Some(true) => "on",
                    Some(false) => "off",
                    None => "",
                };
                match Self::append_command(store, registry, session_id, current_uuid, "debug", args) {
                    Ok(()) => Ok(ReplOutcome::line("Debug mode updated")),
                    Err(e) => Ok(ReplOutcome::line(e.to_string())),
                }
            }
            ReplCommand::Mark { label } => {
                let data = label.as_ref().map(|l| json!({ "label": l }));
                match store.append(session_id, Some(current_uuid), EventKind::Mark, None, data.as_ref()) {
                    Ok(id) => {
                        if let Some(agent) = registry.get_mut(current_uuid) {
                            let context_idx = agent.context.len();
                            agent.marks.push(crate::replay::MarkEntry {
                                message_id: id,
                                label,
                                context_idx,
                            });
                        }
                        Ok(ReplOutcome::line(format!("Marked as {id}")))
                    }
                    Err(e) => Ok(ReplOutcome::line(e.to_string())),
                }
            }
            ReplCommand::Rewind { mark_id } => {
                let Some(agent) = registry.get(current_uuid) else {
                    return Ok(ReplOutcome::line(IkigaiError::not_found(format!("agent {current_uuid}")).to_string()));
                };
                if !agent.marks.iter().any(|m| m.message_id == mark_id) {
                    return Ok(ReplOutcome::line(format!("No such mark: {mark_id}")));
                }
                let data = json!({ "target_message_id": mark_id });
                match store.append(session_id, Some(current_uuid), EventKind::Rewind, None, Some(&data)) {
                    Ok(_) => {
                        if let Some(agent) = registry.get_mut(current_uuid) {
                            let pos = agent.marks.iter().position(|m| m.message_id == mark_id).unwrap();
                            let context_idx = agent.marks[pos].context_idx;
                            agent.context.truncate(context_idx + 1);
                            agent.marks.truncate(pos + 1);
                        }
                        Ok(ReplOutcome::line(format!("Rewound to mark {mark_id}")))
                    }
                    Err(e) => Ok(ReplOutcome::line(e.to_string())),
                }
            }
            ReplCommand::Pin { path } => {
                match Self::append_command(store, registry, session_id, current_uuid, "pin", &path) {
                    Ok(()) => {
                        if let Some(agent) = registry.get_mut(current_uuid) {
                            if !agent.pinned_paths.contains(&path) {
                                agent.pinned_paths.push(path.clone());
                            }
                        }
                        Ok(ReplOutcome::line(format!("Pinned {path}")))
                    }
                    Err(e) => Ok(ReplOutcome::line(e.to_string())),
                }
            }
            ReplCommand::Unpin { path } => {
                match Self::append_command(store, registry, session_id, current_uuid, "unpin", &path) {
                    Ok(()) => {
                        if let Some(agent) = registry.get_mut(current_uuid) {
                            agent.pinned_paths.retain(|p| p != &path);
                        }
                        Ok(ReplOutcome::line(format!("Unpinned {path}")))
                    }
                    Err(e) => Ok(ReplOutcome::line(e.to_string())),
                }
            }
        }
    }

    fn append_command(
        store: &EventStore,
        registry: &mut AgentRegistry,
        session_id: i64,
        current_uuid: &str,
        command: &str,
        args: &str,
    ) -> IkigaiResult<()> {
        let data = json!({ "command": command, "args": args });
        store.append(session_id, Some(current_uuid), EventKind::Command, None, Some(&data))?;
        if command == "model" {
            if let Some(agent) = registry.get_mut(current_uuid) {
                let (model, level) = match args.split_once('/') {
                    Some((m, l)) => (m.to_string(), Some(l.to_string())),
                    None => (args.to_string(), None),
                };
                agent.model = Some(model);
                agent.thinking_level = level;
            }
        }
        Ok(())
    }
}
