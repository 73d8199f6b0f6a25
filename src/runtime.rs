//! The cooperative single-threaded event loop (spec §5) binding every
//! other component together: terminal input routes to `AgentDriver` or
//! `ReplDriver`; `HttpMultiEngine::perform` advances in-flight provider
//! requests; tool invocations reuse `Mailbox`/`AgentLifecycle` directly,
//! never a bespoke path (spec §4.10).
//!
//! The reference's raw `select()` over the provider engine's fd set and
//! the event-store socket is expressed as a `tokio::select!` over a
//! terminal-input channel and a fixed poll tick, on a single-threaded
//! tokio runtime — one OS thread driving the loop end to end.

use crate::agent::{Agent, AgentRegistry};
use crate::coordination::CoordinationBus;
use crate::db::{Event, EventKind, EventStore};
use crate::driver::{AgentDriver, DriverEffect, PendingCall};
use crate::error::{IkigaiError, IkigaiResult};
use crate::lifecycle::{AgentLifecycle, KillOutcome};
use crate::llm::{
    CompletionCallback, ContentBlock, HttpMultiEngine, LlmError, Message, ModelRegistry,
    ProviderRequest, ProviderResponse, RequestId, Role, StreamCallback, ToolDefinition,
};
use crate::mailbox::Mailbox;
use crate::replay::Replayer;
use crate::repl::{ReplCommand, ReplDriver};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Already-tokenized terminal input (spec §6: the grammar is interpreted
/// at the level of `{command, args}` pairs; tokenizing a raw line is a
/// caller concern, out of core scope per SPEC_FULL.md §E).
#[derive(Debug, Clone)]
pub enum TerminalEvent {
    UserInput(String),
    Command { command: String, args: String },
}

pub struct Runtime {
    store: EventStore,
    session_id: i64,
    registry: AgentRegistry,
    models: Arc<ModelRegistry>,
    engine: HttpMultiEngine,
    drivers: HashMap<String, AgentDriver>,
    /// Which `HttpMultiEngine` request belongs to which agent, so
    /// `/kill <uuid>` and `DriverEffect::CancelProviderRequest` can cancel
    /// exactly the victim's own in-flight transfer — the engine is shared
    /// by every agent in the session (spec §4.8's multiplexing model),
    /// so cancelling by agent rather than engine-wide is required to
    /// leave unrelated agents' streams untouched.
    inflight_requests: HashMap<String, RequestId>,
    fork_pending: Arc<AtomicBool>,
    completion_tx: mpsc::UnboundedSender<(String, Result<ProviderResponse, LlmError>)>,
    completion_rx: mpsc::UnboundedReceiver<(String, Result<ProviderResponse, LlmError>)>,
    stream_tx: mpsc::UnboundedSender<(String, String)>,
    stream_rx: mpsc::UnboundedReceiver<(String, String)>,
}

impl Runtime {
    /// Ensures a root agent exists, then replays every `running` agent
    /// row back into memory, restoring the previously-current agent if
    /// it is still running, else falling back to root (SPEC_FULL.md §C).
    /// The schema carries no persisted "current agent" pointer, so
    /// "previously current" is taken to be whichever agent owns the most
    /// recent event row in the session.
    pub fn bootstrap(
        store: EventStore,
        session_id: i64,
        models: Arc<ModelRegistry>,
        http_client: reqwest::Client,
    ) -> IkigaiResult<Self> {
        let mut registry = AgentRegistry::new();
        AgentLifecycle::ensure_root(&store, &mut registry, session_id)?;

        let all_events = store.query_events(session_id)?;
        let rows = store.query_agent_rows(session_id)?;
        for row in &rows {
            if row.status != "running" {
                continue;
            }
            if registry.get(&row.uuid).is_none() {
                let seq = registry.next_seq();
                let agent = match &row.parent_uuid {
                    Some(parent) => Agent::new_child(
                        row.uuid.clone(),
                        parent.clone(),
                        row.fork_message_id.unwrap_or(0),
                        row.created_at,
                        seq,
                    ),
                    None => Agent::new_root(row.uuid.clone(), row.created_at, seq),
                };
                registry.insert(agent);
            }
            let outcome = Replayer::replay(&all_events, &row.uuid);
            registry.get_mut(&row.uuid).unwrap().apply_replay_outcome(outcome);
        }

        let restored_current = all_events
            .last()
            .and_then(|last| last.agent_uuid.clone())
            .filter(|uuid| registry.get(uuid).map(|a| a.is_running()).unwrap_or(false));
        let current = restored_current
            .or_else(|| registry.root().map(|a| a.uuid.clone()))
            .ok_or_else(|| IkigaiError::not_found("no root agent after bootstrap"))?;
        registry.switch_current(&current)?;

        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();

        Ok(Runtime {
            store,
            session_id,
            registry,
            models,
            engine: HttpMultiEngine::new(http_client),
            drivers: HashMap::new(),
            inflight_requests: HashMap::new(),
            fork_pending: Arc::new(AtomicBool::new(false)),
            completion_tx,
            completion_rx,
            stream_tx,
            stream_rx,
        })
    }

    pub fn current_uuid(&self) -> Option<&str> {
        self.registry.current_uuid()
    }

    fn driver_for(&mut self, uuid: &str) -> &mut AgentDriver {
        self.drivers.entry(uuid.to_string()).or_insert_with(AgentDriver::new)
    }

    /// Runs the cooperative loop until `input_rx` closes. Every branch
    /// body is non-blocking; the only suspension point is the `select!`
    /// itself (spec §5).
    pub async fn run(
        &mut self,
        mut input_rx: mpsc::UnboundedReceiver<TerminalEvent>,
        output: mpsc::UnboundedSender<String>,
    ) -> IkigaiResult<()> {
        let mut ticker = tokio::time::interval(Duration::from_millis(50));
        loop {
            tokio::select! {
                event = input_rx.recv() => {
                    match event {
                        Some(event) => {
                            let lines = self.handle_terminal_event(event).await?;
                            for line in lines {
                                let _ = output.send(line);
                            }
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    let lines = self.tick();
                    for line in lines {
                        let _ = output.send(line);
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_terminal_event(&mut self, event: TerminalEvent) -> IkigaiResult<Vec<String>> {
        match event {
            TerminalEvent::UserInput(text) => self.handle_input(text),
            TerminalEvent::Command { command, args } => match ReplCommand::parse(&command, &args) {
                Ok(cmd) => self.handle_command(cmd).await,
                Err(message) => Ok(vec![message]),
            },
        }
    }

    /// Advances in-flight provider requests one tick (spec §5 step 2):
    /// draining the engine invokes each finished request's callback,
    /// which was wired in `start_provider_request` to push onto
    /// `stream_tx`/`completion_tx` rather than touch the driver directly.
    pub fn tick(&mut self) -> Vec<String> {
        self.engine.perform();

        let mut lines = Vec::new();
        while let Ok((agent_uuid, chunk)) = self.stream_rx.try_recv() {
            if let Some(agent) = self.registry.get_mut(&agent_uuid) {
                agent.push_scrollback(chunk.clone());
            }
            lines.push(chunk);
        }
        while let Ok((agent_uuid, result)) = self.completion_rx.try_recv() {
            self.inflight_requests.remove(&agent_uuid);
            let effects = self.driver_for(&agent_uuid).handle_completion(result);
            match self.apply_driver_effects(&agent_uuid, effects) {
                Ok(more) => lines.extend(more),
                Err(e) => lines.push(format!("internal error: {e}")),
            }
        }
        lines
    }

    fn handle_input(&mut self, text: String) -> IkigaiResult<Vec<String>> {
        let current = self
            .registry
            .current_uuid()
            .ok_or_else(|| IkigaiError::not_found("no current agent"))?
            .to_string();

        let id = self.store.append(self.session_id, Some(&current), EventKind::User, Some(&text), None)?;
        self.absorb(&current, id, EventKind::User, Some(text.clone()), None);

        let effects = self
            .driver_for(&current)
            .handle_user_input(text)
            .map_err(|e| IkigaiError::InvalidArg(e.to_string()))?;
        self.apply_driver_effects(&current, effects)
    }

    async fn handle_command(&mut self, command: ReplCommand) -> IkigaiResult<Vec<String>> {
        let current = self
            .registry
            .current_uuid()
            .ok_or_else(|| IkigaiError::not_found("no current agent"))?
            .to_string();

        match command {
            ReplCommand::Model { name, level } => {
                let model_arg = match &level {
                    Some(l) => format!("{name}/{l}"),
                    None => name.clone(),
                };
                let effects = self.driver_for(&current).handle_model_change(model_arg);
                if let Some(DriverEffect::RejectModelChange { message }) = effects.into_iter().next() {
                    return Ok(vec![message]);
                }
                let outcome = ReplDriver::dispatch(
                    &self.store,
                    &mut self.registry,
                    self.session_id,
                    &current,
                    &self.fork_pending,
                    ReplCommand::Model { name, level },
                )
                .await?;
                Ok(outcome.scrollback)
            }
            ReplCommand::Kill { target } => {
                let victim = target.clone().unwrap_or_else(|| current.clone());
                let outcome = AgentLifecycle::kill(
                    &self.store,
                    &mut self.registry,
                    self.session_id,
                    &current,
                    &victim,
                    &self.fork_pending,
                )
                .await?;
                match outcome {
                    KillOutcome::Killed { count, victims } => {
                        // Cancel each cascaded victim's own driver/request,
                        // never the issuing (`current`) agent's — they are
                        // only the same agent when self-killing.
                        for victim_uuid in &victims {
                            let effects = self.driver_for(victim_uuid).handle_kill();
                            self.apply_driver_effects(victim_uuid, effects)?;
                        }
                        Ok(vec![format!("Killed {count} agent(s)")])
                    }
                    KillOutcome::Rejected { message } => Ok(vec![message]),
                }
            }
            other => {
                let outcome = ReplDriver::dispatch(
                    &self.store,
                    &mut self.registry,
                    self.session_id,
                    &current,
                    &self.fork_pending,
                    other,
                )
                .await?;
                Ok(outcome.scrollback)
            }
        }
    }

    fn apply_driver_effects(
        &mut self,
        agent_uuid: &str,
        effects: Vec<DriverEffect>,
    ) -> IkigaiResult<Vec<String>> {
        let mut lines = Vec::new();
        for effect in effects {
            match effect {
                DriverEffect::AppendScrollback(text) => {
                    if let Some(agent) = self.registry.get_mut(agent_uuid) {
                        agent.push_scrollback(text.clone());
                    }
                    lines.push(text);
                }
                DriverEffect::AppendStreamChunk(text) => {
                    lines.push(text);
                }
                DriverEffect::StartProviderRequest { .. } => {
                    self.start_provider_request(agent_uuid)?;
                }
                DriverEffect::ExecuteTool(call) => {
                    lines.extend(self.execute_and_continue(agent_uuid, call)?);
                }
                DriverEffect::CancelProviderRequest => {
                    if let Some(id) = self.inflight_requests.remove(agent_uuid) {
                        self.engine.cancel_one(id);
                    }
                }
                DriverEffect::ApplyModelChange(model) => {
                    if let Some(agent) = self.registry.get_mut(agent_uuid) {
                        agent.model = Some(model);
                    }
                }
                DriverEffect::RejectModelChange { message } => {
                    lines.push(message);
                }
            }
        }

        let is_idle = self
            .drivers
            .get(agent_uuid)
            .map(|d| d.state().is_idle())
            .unwrap_or(true);
        if let Some(agent) = self.registry.get_mut(agent_uuid) {
            if agent.idle != is_idle {
                agent.idle = is_idle;
                let bus = CoordinationBus::new(&self.store);
                let _ = bus.notify(agent_uuid, if is_idle { "idle" } else { "mail" });
            }
        }
        Ok(lines)
    }

    fn start_provider_request(&mut self, agent_uuid: &str) -> IkigaiResult<()> {
        let agent = self
            .registry
            .get(agent_uuid)
            .ok_or_else(|| IkigaiError::not_found(format!("agent {agent_uuid}")))?;
        let model_id = agent
            .model
            .clone()
            .unwrap_or_else(|| self.models.default_model_id().to_string());
        let adapter = self
            .models
            .get(&model_id)
            .or_else(|| self.models.default())
            .ok_or_else(|| IkigaiError::invalid_arg("no model available"))?;
        let request = build_provider_request(agent);

        let stream_tx = self.stream_tx.clone();
        let stream_uuid = agent_uuid.to_string();
        let stream_cb: StreamCallback = Box::new(move |chunk: &str| {
            let _ = stream_tx.send((stream_uuid.clone(), chunk.to_string()));
        });

        let completion_tx = self.completion_tx.clone();
        let completion_uuid = agent_uuid.to_string();
        let completion_cb: CompletionCallback = Box::new(move |result| {
            let _ = completion_tx.send((completion_uuid.clone(), result));
        });

        let request_id = adapter.start_stream(&mut self.engine, request, stream_cb, completion_cb);
        self.inflight_requests.insert(agent_uuid.to_string(), request_id);
        Ok(())
    }

    fn execute_and_continue(&mut self, agent_uuid: &str, call: PendingCall) -> IkigaiResult<Vec<String>> {
        let call_data = json!({ "id": call.id, "name": call.name, "arguments": call.arguments });
        let call_id = self.store.append(self.session_id, Some(agent_uuid), EventKind::ToolCall, None, Some(&call_data))?;
        self.absorb(agent_uuid, call_id, EventKind::ToolCall, None, Some(call_data));

        let (content, is_error) = self.execute_tool(agent_uuid, &call);

        let result_data = json!({ "tool_call_id": call.id, "content": content, "is_error": is_error });
        let result_id = self.store.append(self.session_id, Some(agent_uuid), EventKind::ToolResult, None, Some(&result_data))?;
        self.absorb(agent_uuid, result_id, EventKind::ToolResult, None, Some(result_data));

        let next_effects = self.driver_for(agent_uuid).handle_tool_result(&call.id, content, is_error);
        self.apply_driver_effects(agent_uuid, next_effects)
    }

    /// Runs one tool invocation. `send_mail` and `fork` reuse `Mailbox`
    /// and `AgentLifecycle` directly so the on-disk events and
    /// notifications are identical regardless of whether the call
    /// originated from an LLM tool call or a slash command (spec §4.10).
    /// Tool-level failures become `is_error: true` content rather than a
    /// propagated `IkigaiError`.
    fn execute_tool(&mut self, agent_uuid: &str, call: &PendingCall) -> (String, bool) {
        match call.name.as_str() {
            "send_mail" => {
                let to = call.arguments.get("to").and_then(|v| v.as_str());
                let body = call.arguments.get("body").and_then(|v| v.as_str());
                match (to, body) {
                    (Some(to), Some(body)) => {
                        let mailbox = Mailbox::new(&self.store);
                        match mailbox.send(&self.registry, self.session_id, agent_uuid, to, body) {
                            Ok(_) => (format!("Mail sent to {to}"), false),
                            Err(e) => (e.to_string(), true),
                        }
                    }
                    _ => ("send_mail requires \"to\" and \"body\" arguments".to_string(), true),
                }
            }
            "fork" => {
                let pinned_paths: Vec<String> = call
                    .arguments
                    .get("pinned_paths")
                    .and_then(|v| v.as_array())
                    .map(|arr| arr.iter().filter_map(|v| v.as_str()).map(str::to_string).collect())
                    .unwrap_or_default();
                let toolset_filter: Option<Vec<String>> = call
                    .arguments
                    .get("toolset_filter")
                    .and_then(|v| v.as_array())
                    .map(|arr| arr.iter().filter_map(|v| v.as_str()).map(str::to_string).collect());
                match AgentLifecycle::fork(
                    &self.store,
                    &mut self.registry,
                    self.session_id,
                    agent_uuid,
                    pinned_paths,
                    toolset_filter,
                    &self.fork_pending,
                ) {
                    Ok(child_uuid) => (format!("Forked child {child_uuid}"), false),
                    Err(e) => (e.to_string(), true),
                }
            }
            other => (format!("unknown tool: {other}"), true),
        }
    }

    fn absorb(&mut self, agent_uuid: &str, id: i64, kind: EventKind, content: Option<String>, data: Option<serde_json::Value>) {
        let event = Event {
            id,
            session_id: self.session_id,
            agent_uuid: Some(agent_uuid.to_string()),
            kind: kind.as_str().to_string(),
            content,
            data,
            created_at: Utc::now(),
        };
        if let Some(agent) = self.registry.get_mut(agent_uuid) {
            agent.apply_live_event(&event);
        }
    }
}

/// Translates one agent's conversation-visible context into the
/// provider-neutral request vocabulary (spec §4.9). Mark/rewind/clear
/// events are checkpoint bookkeeping only and never reach the model.
fn build_provider_request(agent: &Agent) -> ProviderRequest {
    let mut system = Vec::new();
    let mut messages = Vec::new();

    for event in &agent.context {
        let Some(kind) = event.kind() else { continue };
        match kind {
            EventKind::System => {
                if let Some(text) = &event.content {
                    system.push(text.clone());
                }
            }
            EventKind::User => {
                let text = event.content.clone().unwrap_or_default();
                messages.push(Message::new(Role::User, vec![ContentBlock::text(text)]));
            }
            EventKind::Assistant => {
                let text = event.content.clone().unwrap_or_default();
                messages.push(Message::new(Role::Assistant, vec![ContentBlock::text(text)]));
            }
            EventKind::ToolCall => {
                if let Some(data) = &event.data {
                    let id = data.get("id").and_then(|v| v.as_str()).unwrap_or_default();
                    let name = data.get("name").and_then(|v| v.as_str()).unwrap_or_default();
                    let arguments = data.get("arguments").cloned().unwrap_or(serde_json::Value::Null);
                    messages.push(Message::new(Role::Assistant, vec![ContentBlock::tool_call(id, name, arguments)]));
                }
            }
            EventKind::ToolResult => {
                if let Some(data) = &event.data {
                    let tool_call_id = data.get("tool_call_id").and_then(|v| v.as_str()).unwrap_or_default();
                    let content = data.get("content").and_then(|v| v.as_str()).unwrap_or_default();
                    let is_error = data.get("is_error").and_then(|v| v.as_bool()).unwrap_or(false);
                    messages.push(Message::new(Role::Tool, vec![ContentBlock::tool_result(tool_call_id, content, is_error)]));
                }
            }
            EventKind::Mark
            | EventKind::Rewind
            | EventKind::Clear
            | EventKind::AgentKilled
            | EventKind::Command
            | EventKind::Fork
            | EventKind::Usage => {}
        }
    }

    let mut request = ProviderRequest::new(messages);
    request.system = system;
    request.tools = tool_definitions();
    request
}

fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "send_mail".to_string(),
            description: "Send a message to another agent by uuid.".to_string(),
            parameters_schema: json!({
                "type": "object",
                "properties": {
                    "to": { "type": "string" },
                    "body": { "type": "string" },
                },
                "required": ["to", "body"],
            }),
        },
        ToolDefinition {
            name: "fork".to_string(),
            description: "Spawn a child agent, optionally with pinned paths and a restricted toolset.".to_string(),
            parameters_schema: json!({
                "type": "object",
                "properties": {
                    "pinned_paths": { "type": "array", "items": { "type": "string" } },
                    "toolset_filter": { "type": "array", "items": { "type": "string" } },
                },
            }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmConfig;

    fn bootstrap() -> Runtime {
        let store = EventStore::open_in_memory().unwrap();
        let session_id = store.create_session().unwrap();
        let models = Arc::new(ModelRegistry::new(&LlmConfig::default()));
        Runtime::bootstrap(store, session_id, models, reqwest::Client::new()).unwrap()
    }

    #[test]
    fn bootstrap_creates_root_and_sets_it_current() {
        let runtime = bootstrap();
        assert!(runtime.current_uuid().is_some());
        assert_eq!(runtime.registry.len(), 1);
    }

    #[test]
    fn bootstrap_adopts_orphaned_events_onto_fresh_root() {
        let store = EventStore::open_in_memory().unwrap();
        let session_id = store.create_session().unwrap();
        store.append(session_id, None, EventKind::User, Some("hi"), None).unwrap();
        let models = Arc::new(ModelRegistry::new(&LlmConfig::default()));
        let runtime = Runtime::bootstrap(store, session_id, models, reqwest::Client::new()).unwrap();
        let root = runtime.registry.root().unwrap();
        assert_eq!(root.context.len(), 1);
    }

    #[test]
    fn handle_input_with_no_model_available_surfaces_error() {
        let mut runtime = bootstrap();
        let result = runtime.handle_input("hello".to_string());
        assert!(result.is_err());
    }

    #[test]
    fn unknown_tool_name_reports_error_without_failing() {
        let mut runtime = bootstrap();
        let current = runtime.current_uuid().unwrap().to_string();
        let (content, is_error) = runtime.execute_tool(&current, &PendingCall {
            id: "call_1".to_string(),
            name: "bogus".to_string(),
            arguments: serde_json::json!({}),
        });
        assert!(is_error);
        assert!(content.contains("bogus"));
    }

    #[test]
    fn send_mail_tool_reuses_mailbox_and_notifies_recipient() {
        let mut runtime = bootstrap();
        let root = runtime.current_uuid().unwrap().to_string();
        let child = AgentLifecycle::fork(
            &runtime.store,
            &mut runtime.registry,
            runtime.session_id,
            &root,
            vec![],
            None,
            &runtime.fork_pending,
        )
        .unwrap();
        let (content, is_error) = runtime.execute_tool(&root, &PendingCall {
            id: "call_1".to_string(),
            name: "send_mail".to_string(),
            arguments: serde_json::json!({"to": child, "body": "hello"}),
        });
        assert!(!is_error);
        assert!(content.contains("Mail sent"));
    }

    #[tokio::test]
    async fn cancel_provider_request_only_cancels_its_own_agent() {
        let mut runtime = bootstrap();
        let root = runtime.current_uuid().unwrap().to_string();
        let child = AgentLifecycle::fork(
            &runtime.store,
            &mut runtime.registry,
            runtime.session_id,
            &root,
            vec![],
            None,
            &runtime.fork_pending,
        )
        .unwrap();

        let root_id = runtime.engine.enqueue(
            "http://127.0.0.1:1/unreachable".to_string(),
            vec![],
            String::new(),
            None,
            Some(Box::new(|_record| Ok(()))),
        );
        let child_id = runtime.engine.enqueue(
            "http://127.0.0.1:1/unreachable".to_string(),
            vec![],
            String::new(),
            None,
            Some(Box::new(|_record| Ok(()))),
        );
        runtime.inflight_requests.insert(root.clone(), root_id);
        runtime.inflight_requests.insert(child.clone(), child_id);

        runtime
            .apply_driver_effects(&root, vec![DriverEffect::CancelProviderRequest])
            .unwrap();

        assert_eq!(runtime.engine.active_count(), 1);
        assert!(!runtime.inflight_requests.contains_key(&root));
        assert!(runtime.inflight_requests.contains_key(&child));
    }

    #[tokio::test]
    async fn kill_cancels_only_the_victims_driver_not_the_issuers() {
        let mut runtime = bootstrap();
        let root = runtime.current_uuid().unwrap().to_string();
        let victim = AgentLifecycle::fork(
            &runtime.store,
            &mut runtime.registry,
            runtime.session_id,
            &root,
            vec![],
            None,
            &runtime.fork_pending,
        )
        .unwrap();

        // Both root and the victim have an in-flight request tracked.
        let root_id = runtime.engine.enqueue(
            "http://127.0.0.1:1/unreachable".to_string(),
            vec![],
            String::new(),
            None,
            Some(Box::new(|_record| Ok(()))),
        );
        let victim_id = runtime.engine.enqueue(
            "http://127.0.0.1:1/unreachable".to_string(),
            vec![],
            String::new(),
            None,
            Some(Box::new(|_record| Ok(()))),
        );
        runtime.inflight_requests.insert(root.clone(), root_id);
        runtime.inflight_requests.insert(victim.clone(), victim_id);
        runtime.driver_for(&root).handle_user_input("hi".to_string()).unwrap();
        runtime.driver_for(&victim).handle_user_input("hi".to_string()).unwrap();

        let outcome = runtime
            .handle_command(ReplCommand::Kill { target: Some(victim.clone()) })
            .await
            .unwrap();
        assert_eq!(outcome, vec!["Killed 1 agent(s)".to_string()]);

        // The victim's request was cancelled, root's survives untouched.
        assert!(!runtime.inflight_requests.contains_key(&victim));
        assert!(runtime.inflight_requests.contains_key(&root));
        assert_eq!(runtime.engine.active_count(), 1);
    }

    #[test]
    fn fork_tool_reuses_agent_lifecycle() {
        let mut runtime = bootstrap();
        let root = runtime.current_uuid().unwrap().to_string();
        let (content, is_error) = runtime.execute_tool(&root, &PendingCall {
            id: "call_1".to_string(),
            name: "fork".to_string(),
            arguments: serde_json::json!({}),
        });
        assert!(!is_error);
        assert!(content.starts_with("Forked child"));
        assert_eq!(runtime.registry.len(), 2);
    }
}
