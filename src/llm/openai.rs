//! OpenAI (and OpenAI-compatible, e.g. Fireworks) chat-completions adapter.

use super::error::LlmError;
use super::http_multi::HttpMultiEngine;
use super::types::{ContentBlock, FinishReason, ProviderRequest, ProviderResponse, Role, ToolChoice, Usage};
use super::{CompletionCallback, ProviderAdapter, StreamAccum, StreamCallback};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy)]
pub enum OpenAIModel {
    Gpt5Codex,
    FireworksQwenCoder,
}

impl OpenAIModel {
    pub fn api_name(self) -> &'static str {
        match self {
            OpenAIModel::Gpt5Codex => "gpt-5.2-codex",
            OpenAIModel::FireworksQwenCoder => "accounts/fireworks/models/qwen3-coder-480b-instruct",
        }
    }

    pub fn model_id(self) -> &'static str {
        match self {
            OpenAIModel::Gpt5Codex => "gpt-5.2-codex",
            OpenAIModel::FireworksQwenCoder => "qwen3-coder-fireworks",
        }
    }

    pub fn is_fireworks(self) -> bool {
        matches!(self, OpenAIModel::FireworksQwenCoder)
    }

    pub fn context_window(self) -> usize {
        match self {
            OpenAIModel::Gpt5Codex => 128_000,
            OpenAIModel::FireworksQwenCoder => 32_768,
        }
    }
}

pub struct OpenAIAdapter {
    api_key: String,
    model: OpenAIModel,
    base_url: String,
    model_id: String,
}

impl OpenAIAdapter {
    pub fn new(api_key: String, model: OpenAIModel, gateway: Option<&str>) -> Self {
        let base_url = match (gateway, model.is_fireworks()) {
            (Some(gw), true) => format!("{}/fireworks/inference/v1/chat/completions", gw.trim_end_matches('/')),
            (Some(gw), false) => format!("{}/openai/v1/chat/completions", gw.trim_end_matches('/')),
            (None, true) => "https://api.fireworks.ai/inference/v1/chat/completions".to_string(),
            (None, false) => "https://api.openai.com/v1/chat/completions".to_string(),
        };
        OpenAIAdapter {
            api_key,
            model,
            base_url,
            model_id: model.model_id().to_string(),
        }
    }

    fn headers(&self) -> Vec<(String, String)> {
        vec![
            ("Authorization".to_string(), format!("Bearer {}", self.api_key)),
            ("Content-Type".to_string(), "application/json".to_string()),
        ]
    }

    fn translate(&self, request: &ProviderRequest, stream: bool) -> String {
        let mut messages = Vec::new();
        for text in &request.system {
            messages.push(OpenAIMessage {
                role: "system".to_string(),
                content: Some(text.clone()),
                tool_calls: None,
                tool_call_id: None,
            });
        }
        for m in &request.messages {
            let role = match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            for block in &m.content {
                match block {
                    ContentBlock::Text { text } => messages.push(OpenAIMessage {
                        role: role.to_string(),
                        content: Some(text.clone()),
                        tool_calls: None,
                        tool_call_id: None,
                    }),
                    ContentBlock::ToolCall { id, name, arguments } => messages.push(OpenAIMessage {
                        role: role.to_string(),
                        content: None,
                        tool_calls: Some(vec![OpenAIToolCall {
                            id: id.clone(),
                            r#type: "function".to_string(),
                            function: OpenAIFunctionCall {
                                name: name.clone(),
                                arguments: serde_json::to_string(arguments).unwrap_or_else(|_| "{}".to_string()),
                            },
                        }]),
                        tool_call_id: None,
                    }),
                    ContentBlock::ToolResult { tool_call_id, content, is_error } => {
                        messages.push(OpenAIMessage {
                            role: "tool".to_string(),
                            content: Some(if *is_error { format!("Error: {content}") } else { content.clone() }),
                            tool_calls: None,
                            tool_call_id: Some(tool_call_id.clone()),
                        });
                    }
                    ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. } => {}
                }
            }
        }

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|t| OpenAITool {
                        r#type: "function".to_string(),
                        function: OpenAIFunction {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: t.parameters_schema.clone(),
                        },
                    })
                    .collect(),
            )
        };

        let tool_choice = match &request.tool_choice {
            ToolChoice::Auto => Some(serde_json::json!("auto")),
            ToolChoice::None => Some(serde_json::json!("none")),
            ToolChoice::Required => Some(serde_json::json!("required")),
            ToolChoice::Specific(name) => Some(serde_json::json!({
                "type": "function",
                "function": { "name": name }
            })),
        };

        let body = OpenAIRequest {
            model: self.model.api_name().to_string(),
            messages,
            tools,
            tool_choice,
            max_tokens: request.max_output_tokens,
            stream,
        };
        serde_json::to_string(&body).unwrap_or_default()
    }
}

impl ProviderAdapter for OpenAIAdapter {
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
                let result = normalize_non_streaming(&record.response_body, record.http_code, record.error_message.as_deref())
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
        let state = Arc::new(Mutex::new(StreamState::default()));
        let state_inner = state.clone();
        let stream_cb = Arc::new(Mutex::new(stream_cb));
        let stream_cb_inner = stream_cb.clone();

        engine.enqueue(
            self.base_url.clone(),
            self.headers(),
            body,
            Some(Box::new(move |payload: &str| {
                state_inner
                    .lock()
                    .unwrap()
                    .feed(payload, &mut *stream_cb_inner.lock().unwrap());
            })),
            Some(Box::new(move |record| {
                if record.completion_type != super::CompletionType::Success {
                    completion_cb(Err(classify(
                        record.http_code,
                        record.error_message.as_deref().unwrap_or(&record.response_body),
                    )));
                    return Ok(());
                }
                let state = state.lock().unwrap();
                completion_cb(Ok(ProviderResponse {
                    content: state.accum.content_blocks(),
                    finish_reason: state.accum.finish_reason.unwrap_or(FinishReason::Unknown),
                    usage: state.accum.usage,
                    provider: provider.clone(),
                }));
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

/// Per-request streaming state: tool-call fragments in OpenAI's delta
/// format are keyed by array `index`, not by id (the id is only present
/// on the first fragment of a given call), so we track index → id here
/// the same way the Anthropic adapter tracks content_block index → id.
#[derive(Default)]
struct StreamState {
    accum: StreamAccum,
    index_to_id: std::collections::HashMap<u32, String>,
}

impl StreamState {
    fn feed(&mut self, payload: &str, stream_cb: &mut dyn FnMut(&str)) {
        if payload == "[DONE]" {
            return;
        }
        let chunk: OpenAIStreamChunk = match serde_json::from_str(payload) {
            Ok(c) => c,
            Err(_) => return,
        };
        let Some(choice) = chunk.choices.into_iter().next() else {
            return;
        };
        if let Some(text) = choice.delta.content {
            if !text.is_empty() {
                self.accum.push_text(&text);
                stream_cb(&text);
            }
        }
        for tc in choice.delta.tool_calls.unwrap_or_default() {
            let id = match tc.id {
                Some(id) => {
                    self.index_to_id.insert(tc.index, id.clone());
                    id
                }
                None => self
                    .index_to_id
                    .get(&tc.index)
                    .cloned()
                    .unwrap_or_default(),
            };
            let name = tc.function.name.as_deref();
            self.accum
                .push_tool_fragment(&id, name, tc.function.arguments.as_deref().unwrap_or(""));
        }
        if let Some(reason) = choice.finish_reason {
            self.accum.finish_reason = Some(match reason.as_str() {
                "stop" => FinishReason::Stop,
                "length" => FinishReason::Length,
                "tool_calls" => FinishReason::ToolUse,
                "content_filter" => FinishReason::ContentFilter,
                _ => FinishReason::Unknown,
            });
        }
        if let Some(usage) = chunk.usage {
            self.accum.usage.input_tokens = usage.prompt_tokens as u64;
            self.accum.usage.output_tokens = usage.completion_tokens as u64;
        }
    }
}

fn classify(status: u16, message: &str) -> LlmError {
    match status {
        401 => LlmError::auth(format!("Authentication failed: {message}")),
        429 => LlmError::rate_limit(format!("Rate limit exceeded: {message}")),
        400 => LlmError::invalid_request(format!("Invalid request: {message}")),
        500..=599 => LlmError::server_error(format!("Server error: {message}")),
        0 => LlmError::network(message.to_string()),
        _ => LlmError::unknown(format!("HTTP {status}: {message}")),
    }
}

fn normalize_non_streaming(body: &str, status: u16, error_message: Option<&str>) -> Result<ProviderResponse, LlmError> {
    if !(200..300).contains(&status) {
        return Err(classify(status, error_message.unwrap_or(body)));
    }
    let resp: OpenAIResponse = serde_json::from_str(body).map_err(|e| LlmError::unknown(format!("parse error: {e}")))?;
    let choice = resp.choices.into_iter().next().ok_or_else(|| LlmError::unknown("no choices in response"))?;
    let mut content = Vec::new();
    if let Some(text) = choice.message.content {
        if !text.is_empty() {
            content.push(ContentBlock::text(text));
        }
    }
    for tc in choice.message.tool_calls.unwrap_or_default() {
        let arguments = serde_json::from_str(&tc.function.arguments).unwrap_or_else(|_| serde_json::json!({}));
        content.push(ContentBlock::tool_call(tc.id, tc.function.name, arguments));
    }
    let finish_reason = match choice.finish_reason.as_deref() {
        Some("stop") => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some("tool_calls") => FinishReason::ToolUse,
        Some("content_filter") => FinishReason::ContentFilter,
        _ => FinishReason::Unknown,
    };
    Ok(ProviderResponse {
        content,
        finish_reason,
        usage: Usage {
            input_tokens: resp.usage.prompt_tokens as u64,
            output_tokens: resp.usage.completion_tokens as u64,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
        },
        provider: String::new(),
    })
}

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAITool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAIToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct OpenAITool {
    r#type: String,
    function: OpenAIFunction,
}

#[derive(Debug, Serialize)]
struct OpenAIFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIToolCall {
    id: String,
    r#type: String,
    function: OpenAIFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
    usage: OpenAIUsage,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChunk {
    choices: Vec<OpenAIStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChoice {
    delta: OpenAIStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAIStreamDelta {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAIStreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamToolCall {
    index: u32,
    id: Option<String>,
    function: OpenAIStreamFunctionCall,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAIStreamFunctionCall {
    name: Option<String>,
    arguments: Option<String>,
}
