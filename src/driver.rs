//! Per-agent state machine (spec §4.10).
//!
//! Transitions are a pure function over `(state, event) -> (state,
//! effects)`, the same shape the original conversation state machine
//! uses, scoped down to the handful of states and events this system
//! actually needs. `Effect`s are data, not actions: the event loop
//! (`runtime.rs`) is the only thing that touches `ProviderAdapter`,
//! `Mailbox`, or `AgentLifecycle`.

use crate::llm::{FinishReason, LlmError, ProviderResponse};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct PendingCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DriverState {
    Idle,
    WaitingForLlm,
    StreamingText,
    ExecutingTool {
        in_flight: PendingCall,
        remaining: Vec<PendingCall>,
    },
}

impl DriverState {
    pub fn is_idle(&self) -> bool {
        matches!(self, DriverState::Idle)
    }
}

#[derive(Debug, Clone)]
pub enum DriverEvent {
    UserInput(String),
    StreamChunk(String),
    Completion(Result<ProviderResponse, LlmError>),
    ToolResult {
        tool_call_id: String,
        content: String,
        is_error: bool,
    },
    ModelChangeRequested(String),
    KillRequested,
}

#[derive(Debug, Clone)]
pub enum DriverEffect {
    AppendScrollback(String),
    AppendStreamChunk(String),
    StartProviderRequest { input: String },
    ExecuteTool(PendingCall),
    CancelProviderRequest,
    ApplyModelChange(String),
    RejectModelChange { message: String },
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Agent is busy; cannot accept a new message while waiting on the model")]
    Busy,
}

/// Owns the current `DriverState` for one agent and exposes one method
/// per `DriverEvent` kind, each returning the effects the runtime must
/// carry out. Never touches `EventStore`/`Mailbox`/`AgentLifecycle`
/// directly (spec §4.10: "reuse ... contracts directly" happens one
/// layer up, in the runtime).
#[derive(Debug, Default)]
pub struct AgentDriver {
    state: DriverState,
}

impl Default for DriverState {
    fn default() -> Self {
        DriverState::Idle
    }
}

impl AgentDriver {
    pub fn new() -> Self {
        AgentDriver {
            state: DriverState::Idle,
        }
    }

    pub fn state(&self) -> &DriverState {
        &self.state
    }

    pub fn handle_user_input(&mut self, text: String) -> Result<Vec<DriverEffect>, DriverError> {
        match &self.state {
            DriverState::Idle => {
                self.state = DriverState::WaitingForLlm;
                Ok(vec![DriverEffect::StartProviderRequest { input: text }])
            }
            _ => Err(DriverError::Busy),
        }
    }

    pub fn handle_stream_chunk(&mut self, chunk: String) -> Vec<DriverEffect> {
        match &self.state {
            DriverState::WaitingForLlm | DriverState::StreamingText => {
                self.state = DriverState::StreamingText;
                vec![DriverEffect::AppendStreamChunk(chunk)]
            }
            _ => vec![],
        }
    }

    pub fn handle_completion(&mut self, result: Result<ProviderResponse, LlmError>) -> Vec<DriverEffect> {
        match result {
            Err(e) => {
                self.state = DriverState::Idle;
                vec![DriverEffect::AppendScrollback(format!("LLM error: {}", e.message))]
            }
            Ok(response) => {
                let calls: Vec<PendingCall> = response
                    .tool_calls()
                    .into_iter()
                    .map(|(id, name, args)| PendingCall {
                        id: id.to_string(),
                        name: name.to_string(),
                        arguments: args.clone(),
                    })
                    .collect();

                if calls.is_empty() || response.finish_reason != FinishReason::ToolUse {
                    self.state = DriverState::Idle;
                    let text = response.text();
                    if text.is_empty() {
                        vec![]
                    } else {
                        vec![DriverEffect::AppendScrollback(text)]
                    }
                } else {
                    let mut remaining = calls;
                    let first = remaining.remove(0);
                    self.state = DriverState::ExecutingTool {
                        in_flight: first.clone(),
                        remaining: remaining.clone(),
                    };
                    vec![DriverEffect::ExecuteTool(first)]
                }
            }
        }
    }

    pub fn handle_tool_result(
        &mut self,
        tool_call_id: &str,
        _content: String,
        _is_error: bool,
    ) -> Vec<DriverEffect> {
        let DriverState::ExecutingTool { in_flight, remaining } = &self.state else {
            return vec![];
        };
        if in_flight.id != tool_call_id {
            return vec![];
        }
        let mut remaining = remaining.clone();
        if remaining.is_empty() {
            self.state = DriverState::Idle;
            vec![]
        } else {
            let next = remaining.remove(0);
            self.state = DriverState::ExecutingTool {
                in_flight: next.clone(),
                remaining,
            };
            vec![DriverEffect::ExecuteTool(next)]
        }
    }

    /// `/model` is rejected while `WaitingForLLM` (spec §4.10); every
    /// other state allows it.
    pub fn handle_model_change(&mut self, model: String) -> Vec<DriverEffect> {
        if matches!(self.state, DriverState::WaitingForLlm) {
            vec![DriverEffect::RejectModelChange {
                message: "Cannot change model while waiting on a response".to_string(),
            }]
        } else {
            vec![DriverEffect::ApplyModelChange(model)]
        }
    }

    /// `/kill` is always allowed; cancels any outstanding provider
    /// request and returns the agent to `Idle`.
    pub fn handle_kill(&mut self) -> Vec<DriverEffect> {
        let was_waiting = matches!(
            self.state,
            DriverState::WaitingForLlm | DriverState::StreamingText
        );
        self.state = DriverState::Idle;
        if was_waiting {
            vec![DriverEffect::CancelProviderRequest]
        } else {
            vec![]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ContentBlock, Usage};

    fn response(finish: FinishReason, content: Vec<ContentBlock>) -> ProviderResponse {
        ProviderResponse {
            content,
            finish_reason: finish,
            usage: Usage::default(),
            provider: "test".to_string(),
        }
    }

    #[test]
    fn user_input_transitions_idle_to_waiting() {
        let mut driver = AgentDriver::new();
        let effects = driver.handle_user_input("hi".to_string()).unwrap();
        assert!(matches!(driver.state(), DriverState::WaitingForLlm));
        assert!(matches!(effects[0], DriverEffect::StartProviderRequest { .. }));
    }

    #[test]
    fn user_input_while_busy_is_rejected() {
        let mut driver = AgentDriver::new();
        driver.handle_user_input("hi".to_string()).unwrap();
        assert!(matches!(
            driver.handle_user_input("again".to_string()),
            Err(DriverError::Busy)
        ));
    }

    #[test]
    fn model_change_rejected_while_waiting_for_llm() {
        let mut driver = AgentDriver::new();
        driver.handle_user_input("hi".to_string()).unwrap();
        let effects = driver.handle_model_change("claude-4.5-opus".to_string());
        assert!(matches!(effects[0], DriverEffect::RejectModelChange { .. }));
    }

    #[test]
    fn model_change_allowed_while_idle() {
        let mut driver = AgentDriver::new();
        let effects = driver.handle_model_change("claude-4.5-opus".to_string());
        assert!(matches!(effects[0], DriverEffect::ApplyModelChange(_)));
    }

    #[test]
    fn completion_with_text_only_returns_to_idle() {
        let mut driver = AgentDriver::new();
        driver.handle_user_input("hi".to_string()).unwrap();
        let effects = driver.handle_completion(Ok(response(FinishReason::Stop, vec![ContentBlock::text("done")])));
        assert!(driver.state().is_idle());
        assert!(matches!(&effects[0], DriverEffect::AppendScrollback(s) if s == "done"));
    }

    #[test]
    fn completion_with_tool_call_enters_executing_tool() {
        let mut driver = AgentDriver::new();
        driver.handle_user_input("hi".to_string()).unwrap();
        let effects = driver.handle_completion(Ok(response(
            FinishReason::ToolUse,
            vec![ContentBlock::tool_call("call_1", "fork", serde_json::json!({}))],
        )));
        assert!(matches!(driver.state(), DriverState::ExecutingTool { .. }));
        assert!(matches!(&effects[0], DriverEffect::ExecuteTool(call) if call.id == "call_1"));
    }

    #[test]
    fn multiple_tool_calls_execute_sequentially() {
        let mut driver = AgentDriver::new();
        driver.handle_user_input("hi".to_string()).unwrap();
        driver.handle_completion(Ok(response(
            FinishReason::ToolUse,
            vec![
                ContentBlock::tool_call("call_1", "fork", serde_json::json!({})),
                ContentBlock::tool_call("call_2", "fork", serde_json::json!({})),
            ],
        )));
        let effects = driver.handle_tool_result("call_1", "ok".to_string(), false);
        assert!(matches!(&effects[0], DriverEffect::ExecuteTool(call) if call.id == "call_2"));
        let effects = driver.handle_tool_result("call_2", "ok".to_string(), false);
        assert!(effects.is_empty());
        assert!(driver.state().is_idle());
    }

    #[test]
    fn kill_while_waiting_cancels_and_returns_to_idle() {
        let mut driver = AgentDriver::new();
        driver.handle_user_input("hi".to_string()).unwrap();
        let effects = driver.handle_kill();
        assert!(driver.state().is_idle());
        assert!(matches!(effects[0], DriverEffect::CancelProviderRequest));
    }

    #[test]
    fn kill_while_idle_is_a_no_op() {
        let mut driver = AgentDriver::new();
        assert!(driver.handle_kill().is_empty());
    }

    #[test]
    fn completion_error_appends_scrollback_and_returns_to_idle() {
        let mut driver = AgentDriver::new();
        driver.handle_user_input("hi".to_string()).unwrap();
        let effects = driver.handle_completion(Err(LlmError::network("boom")));
        assert!(driver.state().is_idle());
        assert!(matches!(&effects[0], DriverEffect::AppendScrollback(s) if s.contains("boom")));
    }
}
