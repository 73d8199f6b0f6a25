//! Anthropic Claude provider adapter.

use super::error::LlmError;
use super::http_multi::HttpMultiEngine;
use super::types::{
    ContentBlock, FinishReason, ProviderRequest, ProviderResponse, Role, ToolChoice, Usage,
};
use super::{CompletionCallback, ProviderAdapter, StreamAccum, StreamCallback};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy)]
pub enum AnthropicModel {
    Claude4Opus,
    Claude4Sonnet,
    Claude35Haiku,
}

impl AnthropicModel {
    pub fn api_name(self) -> &'static str {
        match self {
            AnthropicModel::Claude4Opus => "claude-opus-4-5-20251101",
            AnthropicModel::Claude4Sonnet => "claude-sonnet-4-5-20250929",
            AnthropicModel::Claude35Haiku => "claude-haiku-4-5-20251001",
        }
    }

    pub fn model_id(self) -> &'static str {
        match self {
            AnthropicModel::Claude4Opus => "claude-4.5-opus",
            AnthropicModel::Claude4Sonnet => "claude-4.5-sonnet",
            AnthropicModel::Claude35Haiku => "claude-4.5-haiku",
        }
    }

    pub fn context_window(self) -> usize {
        200_000
    }
}

pub struct AnthropicAdapter {
    api_key: String,
    model: AnthropicModel,
    base_url: String,
    model_id: String,
}

impl AnthropicAdapter {
    pub fn new(api_key: String, model: AnthropicModel, gateway: Option<&str>) -> Self {
        let base_url = match gateway {
            Some(gw) => format!("{}/anthropic/v1/messages", gw.trim_end_matches('/')),
            None => "https://api.anthropic.com/v1/messages".to_string(),
        };
        AnthropicAdapter {
            api_key,
            model,
            base_url,
            model_id: model.model_id().to_string(),
        }
    }

    fn headers(&self) -> Vec<(String, String)> {
        vec![
            ("x-api-key".to_string(), self.api_key.clone()),
            ("anthropic-version".to_string(), "2023-06-01".to_string()),
            ("content-type".to_string(), "application/json".to_string()),
        ]
    }

    fn translate(&self, request: &ProviderRequest, stream: bool) -> String {
        let system: Vec<AnthropicSystemBlock> = request
            .system
            .iter()
            .map(|text| AnthropicSystemBlock {
                r#type: "text".to_string(),
                text: text.clone(),
            })
            .collect();

        let messages: Vec<AnthropicMessage> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| AnthropicMessage {
                role: match m.role {
                    Role::User | Role::Tool => "user".to_string(),
                    Role::Assistant => "assistant".to_string(),
                    Role::System => unreachable!(),
                },
                content: m
                    .content
                    .iter()
                    .map(|block| match block {
                        ContentBlock::Text { text } => AnthropicBlock::Text { text: text.clone() },
                        ContentBlock::ToolCall { id, name, arguments } => AnthropicBlock::ToolUse {
                            id: id.clone(),
                            name: name.clone(),
                            input: arguments.clone(),
                        },
                        ContentBlock::ToolResult {
                            tool_call_id,
                            content,
                            is_error,
                        } => AnthropicBlock::ToolResult {
                            tool_use_id: tool_call_id.clone(),
                            content: content.clone(),
                            is_error: *is_error,
                        },
                        ContentBlock::Thinking { text, signature } => AnthropicBlock::Thinking {
                            thinking: text.clone(),
                            signature: signature.clone().unwrap_or_default(),
                        },
                        ContentBlock::RedactedThinking { data } => {
                            AnthropicBlock::RedactedThinking { data: data.clone() }
                        }
                    })
                    .collect(),
            })
            .collect();

        let tool_choice = match &request.tool_choice {
            ToolChoice::Auto => None,
            ToolChoice::None => Some(AnthropicToolChoice {
                r#type: "none".to_string(),
                name: None,
            }),
            ToolChoice::Required => Some(AnthropicToolChoice {
                r#type: "any".to_string(),
                name: None,
            }),
            ToolChoice::Specific(name) => Some(AnthropicToolChoice {
                r#type: "tool".to_string(),
                name: Some(name.clone()),
            }),
        };

        let tools: Vec<AnthropicTool> = request
            .tools
            .iter()
            .map(|t| AnthropicTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.parameters_schema.clone(),
            })
            .collect();

        let body = AnthropicRequest {
            model: self.model.api_name().to_string(),
            max_tokens: request.max_output_tokens.unwrap_or(8192),
            system,
            messages,
            tools: if tools.is_empty() { None } else { Some(tools) },
            tool_choice,
            stream,
        };
        serde_json::to_string(&body).unwrap_or_default()
    }
}

impl ProviderAdapter for AnthropicAdapter {
    fn start_request(
        &self,
        engine: &mut HttpMultiEngine,
        request: ProviderRequest,
        completion_cb: CompletionCallback,
    ) -> super::RequestId {
        let body = self.translate(&request, false);
        let provider = self.model_id.clone();
        engine.enqueue(
            self.base_url.clone(),
            self.headers(),
            body,
            None,
            Some(Box::new(move |record| {
                let result = normalize_non_streaming(
                    &record.response_body,
                    record.http_code,
                    record.error_message.as_deref(),
                )
                .map(|mut r| {
                    r.provider = provider.clone();
                    r
                });
                completion_cb(result);
                Ok(())
            })),
        )
    }

    fn start_stream(
        &self,
        engine: &mut HttpMultiEngine,
        request: ProviderRequest,
        stream_cb: StreamCallback,
        completion_cb: CompletionCallback,
    ) -> super::RequestId {
        let body = self.translate(&request, true);
        let provider = self.model_id.clone();
        let accum = Arc::new(Mutex::new(StreamState::default()));
        let accum_stream = accum.clone();
        let stream_cb = Arc::new(Mutex::new(stream_cb));
        let stream_cb_inner = stream_cb.clone();

        engine.enqueue(
            self.base_url.clone(),
            self.headers(),
            body,
            Some(Box::new(move |payload: &str| {
                let mut state = accum_stream.lock().unwrap();
                state.feed(payload, &mut *stream_cb_inner.lock().unwrap());
            })),
            Some(Box::new(move |record| {
                if record.completion_type != super::CompletionType::Success {
                    completion_cb(Err(classify(
                        record.http_code,
                        record.error_message.as_deref().unwrap_or(&record.response_body),
                    )));
                    return Ok(());
                }
                let state = accum.lock().unwrap();
                let response = ProviderResponse {
                    content: state.accum.content_blocks(),
                    finish_reason: state.accum.finish_reason.unwrap_or(FinishReason::Unknown),
                    usage: state.accum.usage,
                    provider: provider.clone(),
                };
                completion_cb(Ok(response));
                Ok(())
            })),
        )
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn context_window(&self) -> usize {
        self.model.context_window()
    }
}

fn classify(status: u16, message: &str) -> LlmError {
    match status {
        401 | 403 => LlmError::auth(format!("Authentication failed: {message}")),
        429 => LlmError::rate_limit(format!("Rate limited: {message}")),
        400 => LlmError::invalid_request(format!("Invalid request: {message}")),
        500..=599 => LlmError::server_error(format!("Server error: {message}")),
        0 => LlmError::network(message.to_string()),
        _ => LlmError::unknown(format!("HTTP {status}: {message}")),
    }
}

fn normalize_non_streaming(
    body: &str,
    status: u16,
    error_message: Option<&str>,
) -> Result<ProviderResponse, LlmError> {
    if status < 200 || status >= 300 {
        return Err(classify(status, error_message.unwrap_or(body)));
    }
    let resp: AnthropicResponse =
        serde_json::from_str(body).map_err(|e| LlmError::unknown(format!("parse error: {e}")))?;
    let mut content = Vec::new();
    for block in resp.content {
        match block {
            AnthropicBlock::Text { text } if !text.is_empty() => content.push(ContentBlock::Text { text }),
            AnthropicBlock::ToolUse { id, name, input } => {
                content.push(ContentBlock::ToolCall { id, name, arguments: input })
            }
            _ => {}
        }
    }
    let finish_reason = match resp.stop_reason.as_deref() {
        Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolUse,
        _ => FinishReason::Unknown,
    };
    Ok(ProviderResponse {
        content,
        finish_reason,
        usage: Usage {
            input_tokens: resp.usage.input_tokens,
            output_tokens: resp.usage.output_tokens,
            cache_creation_tokens: resp.usage.cache_creation_input_tokens.unwrap_or(0),
            cache_read_tokens: resp.usage.cache_read_input_tokens.unwrap_or(0),
        },
        provider: String::new(),
    })
}

/// Per-request streaming state: a `StreamAccum` plus the `content_block`
/// index → tool-call-id mapping needed because Anthropic's
/// `content_block_delta` events carry only an index, not the id repeated
/// from `content_block_start` (spec §9, fragments keyed by tool_call id).
#[derive(Default)]
struct StreamState {
    accum: StreamAccum,
    index_to_tool: HashMap<usize, String>,
}

impl StreamState {
    fn feed(&mut self, payload: &str, stream_cb: &mut dyn FnMut(&str)) {
        let event: AnthropicStreamEvent = match serde_json::from_str(payload) {
            Ok(e) => e,
            Err(_) => return,
        };
        match event {
            AnthropicStreamEvent::MessageStart { message } => {
                self.accum.model = Some(message.model);
                self.accum.usage.input_tokens = message.usage.input_tokens;
            }
            AnthropicStreamEvent::ContentBlockStart { index, content_block } => {
                if let AnthropicBlock::ToolUse { id, name, .. } = content_block {
                    self.index_to_tool.insert(index, id.clone());
                    self.accum.push_tool_fragment(&id, Some(&name), "");
                }
            }
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => match delta {
                AnthropicStreamDelta::TextDelta { text } => {
                    self.accum.push_text(&text);
                    stream_cb(&text);
                }
                AnthropicStreamDelta::InputJsonDelta { partial_json } => {
                    if let Some(id) = self.index_to_tool.get(&index).cloned() {
                        self.accum.push_tool_fragment(&id, None, &partial_json);
                    }
                }
            },
            AnthropicStreamEvent::ContentBlockStop { .. } => {}
            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                self.accum.finish_reason = Some(match delta.stop_reason.as_deref() {
                    Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
                    Some("max_tokens") => FinishReason::Length,
                    Some("tool_use") => FinishReason::ToolUse,
                    _ => FinishReason::Unknown,
                });
                self.accum.usage.output_tokens = usage.output_tokens;
            }
            AnthropicStreamEvent::MessageStop | AnthropicStreamEvent::Ping => {}
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamEvent {
    MessageStart {
        message: AnthropicStreamMessage,
    },
    ContentBlockStart {
        index: usize,
        content_block: AnthropicBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: AnthropicStreamDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: AnthropicMessageDeltaInner,
        usage: AnthropicDeltaUsage,
    },
    MessageStop,
    Ping,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamMessage {
    model: String,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageDeltaInner {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicDeltaUsage {
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    system: Vec<AnthropicSystemBlock>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<AnthropicToolChoice>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct AnthropicSystemBlock {
    r#type: String,
    text: String,
}

#[derive(Debug, Serialize)]
struct AnthropicToolChoice {
    r#type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<AnthropicBlock>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
    Thinking {
        thinking: String,
        #[serde(default)]
        signature: String,
    },
    RedactedThinking {
        data: String,
    },
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicBlock>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    cache_creation_input_tokens: Option<u64>,
    cache_read_input_tokens: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_text_deltas_accumulate_and_forward() {
        let mut state = StreamState::default();
        let mut forwarded = String::new();
        let mut cb = |chunk: &str| forwarded.push_str(chunk);
        state.feed(
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            &mut cb,
        );
        state.feed(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"foo"}}"#,
            &mut cb,
        );
        state.feed(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"bar"}}"#,
            &mut cb,
        );
        assert_eq!(forwarded, "foobar");
        assert_eq!(state.accum.text, "foobar");
    }

    #[test]
    fn tool_call_fragments_accumulate_by_index_then_id() {
        let mut state = StreamState::default();
        let mut cb = |_: &str| {};
        state.feed(
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"call_1","name":"search","input":{}}}"#,
            &mut cb,
        );
        state.feed(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"q\":"}}"#,
            &mut cb,
        );
        state.feed(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"\"x\"}"}}"#,
            &mut cb,
        );
        let blocks = state.accum.content_blocks();
        assert_eq!(blocks.len(), 1);
        match &blocks[0] {
            ContentBlock::ToolCall { id, name, arguments } => {
                assert_eq!(id, "call_1");
                assert_eq!(name, "search");
                assert_eq!(arguments["q"], "x");
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn message_delta_maps_stop_reason_to_finish_reason() {
        let mut state = StreamState::default();
        let mut cb = |_: &str| {};
        state.feed(
            r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":12}}"#,
            &mut cb,
        );
        assert_eq!(state.accum.finish_reason, Some(FinishReason::ToolUse));
        assert_eq!(state.accum.usage.output_tokens, 12);
    }

    #[test]
    fn classify_maps_status_codes() {
        assert!(matches!(classify(401, "x").kind, super::super::LlmErrorKind::Auth));
        assert!(matches!(classify(429, "x").kind, super::super::LlmErrorKind::RateLimit));
        assert!(matches!(classify(500, "x").kind, super::super::LlmErrorKind::ServerError));
    }
}
