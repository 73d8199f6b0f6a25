//! Google Gemini `generateContent`/`streamGenerateContent` adapter.

use super::error::LlmError;
use super::http_multi::HttpMultiEngine;
use super::types::{ContentBlock, FinishReason, ProviderRequest, ProviderResponse, Role, Usage};
use super::{CompletionCallback, ProviderAdapter, StreamAccum, StreamCallback};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy)]
pub enum GeminiModel {
    Gemini2Pro,
    Gemini2Flash,
}

impl GeminiModel {
    pub fn api_name(self) -> &'static str {
        match self {
            GeminiModel::Gemini2Pro => "gemini-2.5-pro",
            GeminiModel::Gemini2Flash => "gemini-2.5-flash",
        }
    }

    pub fn model_id(self) -> &'static str {
        match self {
            GeminiModel::Gemini2Pro => "gemini-2.5-pro",
            GeminiModel::Gemini2Flash => "gemini-2.5-flash",
        }
    }

    pub fn context_window(self) -> usize {
        1_000_000
    }
}

pub struct GeminiAdapter {
    api_key: String,
    model: GeminiModel,
    base_url_prefix: String,
    model_id: String,
}

impl GeminiAdapter {
    pub fn new(api_key: String, model: GeminiModel, gateway: Option<&str>) -> Self {
        let base_url_prefix = match gateway {
            Some(gw) => format!("{}/gemini/v1beta/models", gw.trim_end_matches('/')),
            None => "https://generativelanguage.googleapis.com/v1beta/models".to_string(),
        };
        GeminiAdapter {
            api_key,
            model,
            base_url_prefix,
            model_id: model.model_id().to_string(),
        }
    }

    fn url(&self, stream: bool) -> String {
        let method = if stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        format!(
            "{}/{}:{}&key={}",
            self.base_url_prefix,
            self.model.api_name(),
            method,
            self.api_key
        )
    }

    fn translate(&self, request: &ProviderRequest) -> GeminiRequest {
        let system_instruction = if request.system.is_empty() {
            None
        } else {
            Some(GeminiContent {
                role: None,
                parts: vec![GeminiPart::Text {
                    text: request.system.join("\n\n"),
                }],
            })
        };

        let contents = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| GeminiContent {
                role: Some(
                    match m.role {
                        Role::User | Role::Tool => "user",
                        Role::Assistant => "model",
                        Role::System => unreachable!(),
                    }
                    .to_string(),
                ),
                parts: m
                    .content
                    .iter()
                    .map(|block| match block {
                        ContentBlock::Text { text } => GeminiPart::Text { text: text.clone() },
                        ContentBlock::ToolCall { name, arguments, .. } => GeminiPart::FunctionCall {
                            function_call: GeminiFunctionCall {
                                name: name.clone(),
                                args: arguments.clone(),
                            },
                        },
                        ContentBlock::ToolResult { content, .. } => GeminiPart::FunctionResponse {
                            function_response: GeminiFunctionResponse {
                                response: serde_json::json!({ "result": content }),
                            },
                        },
                        ContentBlock::Thinking { text, .. } => GeminiPart::Text { text: text.clone() },
                        ContentBlock::RedactedThinking { .. } => GeminiPart::Text { text: String::new() },
                    })
                    .collect(),
            })
            .collect();

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(vec![GeminiToolDecl {
                function_declarations: request
                    .tools
                    .iter()
                    .map(|t| GeminiFunctionDecl {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters_schema.clone(),
                    })
                    .collect(),
            }])
        };

        GeminiRequest {
            system_instruction,
            contents,
            tools,
            generation_config: GeminiGenerationConfig {
                max_output_tokens: request.max_output_tokens,
            },
        }
    }
}

impl ProviderAdapter for GeminiAdapter {
    fn start_request(
        &self,
        engine: &mut HttpMultiEngine,
        request: ProviderRequest,
        completion_cb: CompletionCallback,
    ) -> super::RequestId {
        let body = serde_json::to_string(&self.translate(&request)).unwrap_or_default();
        let provider = self.model_id.clone();
        engine.enqueue(
            self.url(false),
            vec![("Content-Type".to_string(), "application/json".to_string())],
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
        let body = serde_json::to_string(&self.translate(&request)).unwrap_or_default();
        let provider = self.model_id.clone();
        let accum = Arc::new(Mutex::new(StreamAccum::default()));
        let accum_inner = accum.clone();
        let stream_cb = Arc::new(Mutex::new(stream_cb));
        let stream_cb_inner = stream_cb.clone();

        engine.enqueue(
            self.url(true),
            vec![("Content-Type".to_string(), "application/json".to_string())],
            body,
            Some(Box::new(move |payload: &str| {
                feed_stream_event(&mut accum_inner.lock().unwrap(), payload, &mut *stream_cb_inner.lock().unwrap());
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
                completion_cb(Ok(ProviderResponse {
                    content: state.content_blocks(),
                    finish_reason: state.finish_reason.unwrap_or(FinishReason::Unknown),
                    usage: state.usage,
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

fn feed_stream_event(accum: &mut StreamAccum, payload: &str, stream_cb: &mut dyn FnMut(&str)) {
    let chunk: GeminiResponse = match serde_json::from_str(payload) {
        Ok(c) => c,
        Err(_) => return,
    };
    apply_candidate(accum, chunk, stream_cb);
}

fn apply_candidate(accum: &mut StreamAccum, chunk: GeminiResponse, stream_cb: &mut dyn FnMut(&str)) {
    let Some(candidate) = chunk.candidates.into_iter().next() else {
        return;
    };
    for (i, part) in candidate.content.parts.into_iter().enumerate() {
        match part {
            GeminiPart::Text { text } => {
                if !text.is_empty() {
                    accum.push_text(&text);
                    stream_cb(&text);
                }
            }
            GeminiPart::FunctionCall { function_call } => {
                let id = format!("gemini_call_{i}");
                accum.push_tool_fragment(
                    &id,
                    Some(&function_call.name),
                    &serde_json::to_string(&function_call.args).unwrap_or_default(),
                );
            }
            GeminiPart::FunctionResponse { .. } => {}
        }
    }
    if let Some(reason) = candidate.finish_reason {
        accum.finish_reason = Some(match reason.as_str() {
            "STOP" => FinishReason::Stop,
            "MAX_TOKENS" => FinishReason::Length,
            "SAFETY" | "RECITATION" => FinishReason::ContentFilter,
            _ => FinishReason::Unknown,
        });
    }
    if let Some(usage) = chunk.usage_metadata {
        accum.usage.input_tokens = usage.prompt_token_count as u64;
        accum.usage.output_tokens = usage.candidates_token_count as u64;
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

fn normalize_non_streaming(body: &str, status: u16, error_message: Option<&str>) -> Result<ProviderResponse, LlmError> {
    if !(200..300).contains(&status) {
        return Err(classify(status, error_message.unwrap_or(body)));
    }
    let chunk: GeminiResponse = serde_json::from_str(body).map_err(|e| LlmError::unknown(format!("parse error: {e}")))?;
    let mut accum = StreamAccum::default();
    let mut cb = |_: &str| {};
    apply_candidate(&mut accum, chunk, &mut cb);
    Ok(ProviderResponse {
        content: accum.content_blocks(),
        finish_reason: accum.finish_reason.unwrap_or(FinishReason::Unknown),
        usage: accum.usage,
        provider: String::new(),
    })
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<GeminiToolDecl>>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged, rename_all = "camelCase")]
enum GeminiPart {
    Text {
        text: String,
    },
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: GeminiFunctionCall,
    },
    FunctionResponse {
        #[serde(rename = "functionResponse")]
        function_response: GeminiFunctionResponse,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiFunctionCall {
    name: String,
    args: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiFunctionResponse {
    response: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct GeminiToolDecl {
    function_declarations: Vec<GeminiFunctionDecl>,
}

#[derive(Debug, Serialize)]
struct GeminiFunctionDecl {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: GeminiContent,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_text_part_accumulates_and_forwards() {
        let mut accum = StreamAccum::default();
        let mut forwarded = String::new();
        let mut cb = |chunk: &str| forwarded.push_str(chunk);
        feed_stream_event(
            &mut accum,
            r#"{"candidates":[{"content":{"parts":[{"text":"foo"}]},"finishReason":null}]}"#,
            &mut cb,
        );
        feed_stream_event(
            &mut accum,
            r#"{"candidates":[{"content":{"parts":[{"text":"bar"}]},"finishReason":"STOP"}]}"#,
            &mut cb,
        );
        assert_eq!(forwarded, "foobar");
        assert_eq!(accum.finish_reason, Some(FinishReason::Stop));
    }

    #[test]
    fn function_call_part_becomes_tool_call_block() {
        let mut accum = StreamAccum::default();
        let mut cb = |_: &str| {};
        feed_stream_event(
            &mut accum,
            r#"{"candidates":[{"content":{"parts":[{"functionCall":{"name":"search","args":{"q":"x"}}}]},"finishReason":"STOP"}]}"#,
            &mut cb,
        );
        let blocks = accum.content_blocks();
        match &blocks[0] {
            ContentBlock::ToolCall { name, arguments, .. } => {
                assert_eq!(name, "search");
                assert_eq!(arguments["q"], "x");
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn safety_finish_reason_maps_to_content_filter() {
        let mut accum = StreamAccum::default();
        let mut cb = |_: &str| {};
        feed_stream_event(
            &mut accum,
            r#"{"candidates":[{"content":{"parts":[]},"finishReason":"SAFETY"}]}"#,
            &mut cb,
        );
        assert_eq!(accum.finish_reason, Some(FinishReason::ContentFilter));
    }
}
