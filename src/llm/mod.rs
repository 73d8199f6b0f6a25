//! LLM provider integration: a provider-neutral request/response
//! vocabulary (spec §4.9) sitting on top of the cooperative HTTP engine
//! (spec §4.8).

pub mod anthropic;
pub mod error;
pub mod gemini;
pub mod http_multi;
pub mod openai;
pub mod registry;
pub mod types;

pub use error::{LlmError, LlmErrorKind};
pub use http_multi::{CompletionRecord, CompletionType, HttpMultiEngine, ProviderMeta, RequestId};
pub use registry::{LlmConfig, ModelRegistry, Provider};
pub use types::*;

pub type CompletionCallback = Box<dyn FnOnce(Result<ProviderResponse, LlmError>) + Send>;
pub type StreamCallback = Box<dyn FnMut(&str) + Send>;

/// Uniform interface over one LLM provider so `AgentDriver` never
/// branches on provider identity (spec §4.9).
pub trait ProviderAdapter: Send + Sync {
    fn start_request(
        &self,
        engine: &mut HttpMultiEngine,
        request: ProviderRequest,
        completion_cb: CompletionCallback,
    ) -> RequestId;

    fn start_stream(
        &self,
        engine: &mut HttpMultiEngine,
        request: ProviderRequest,
        stream_cb: StreamCallback,
        completion_cb: CompletionCallback,
    ) -> RequestId;

    fn model_id(&self) -> &str;
    fn context_window(&self) -> usize;

    /// Provider-level cancellation is always cancel-everything; individual
    /// cancellation is outside the core contract (spec §4.8).
    fn cancel(&self, engine: &mut HttpMultiEngine) {
        engine.cancel_all();
    }
}

/// Accumulates a streamed response across SSE events so the completion
/// callback can hand `AgentDriver` a single `ProviderResponse` once the
/// transfer finishes. Each provider adapter owns one of these per
/// request, behind an `Arc<Mutex<_>>` shared between its `stream_cb`
/// (fed raw SSE data payloads by `HttpMultiEngine`) and its
/// `completion_cb` (fed the final `CompletionRecord`).
#[derive(Debug, Default)]
pub(crate) struct StreamAccum {
    pub text: String,
    pub tool_call_order: Vec<String>,
    pub tool_calls: std::collections::HashMap<String, (String, String)>,
    pub model: Option<String>,
    pub finish_reason: Option<FinishReason>,
    pub usage: Usage,
}

impl StreamAccum {
    pub fn push_text(&mut self, delta: &str) {
        self.text.push_str(delta);
    }

    /// Appends a fragment of a tool call's JSON-arguments string,
    /// registering the call under `id` on first sight (spec §9: "arguments
    /// must be accumulated by tool_call id").
    pub fn push_tool_fragment(&mut self, id: &str, name: Option<&str>, arg_fragment: &str) {
        let entry = self
            .tool_calls
            .entry(id.to_string())
            .or_insert_with(|| {
                self.tool_call_order.push(id.to_string());
                (String::new(), String::new())
            });
        if let Some(name) = name {
            if entry.0.is_empty() {
                entry.0 = name.to_string();
            }
        }
        entry.1.push_str(arg_fragment);
    }

    pub fn content_blocks(&self) -> Vec<ContentBlock> {
        let mut blocks = Vec::new();
        if !self.text.is_empty() {
            blocks.push(ContentBlock::text(self.text.clone()));
        }
        for id in &self.tool_call_order {
            if let Some((name, args)) = self.tool_calls.get(id) {
                let arguments = serde_json::from_str(args).unwrap_or_else(|_| serde_json::json!({}));
                blocks.push(ContentBlock::tool_call(id.clone(), name.clone(), arguments));
            }
        }
        blocks
    }
}
