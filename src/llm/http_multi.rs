//! Cooperative multiplexed HTTP client integrated with the event loop
//! (spec §4.8).
//!
//! The reference drives transfers through `fdset`/`perform`/`timeout`/
//! `info_read` over raw sockets. Tokio's reactor already multiplexes
//! socket readiness, so each in-flight request here is a spawned task
//! that pushes chunk/completion events onto one shared channel; `perform`
//! and `info_read` just drain that channel non-blockingly. `fdset` is
//! kept for interface parity but has nothing to populate — there is no
//! raw fd for the caller to select on — and `timeout` reports a fixed
//! short poll interval while anything is in flight, mirroring the 50 ms
//! granularity `WaitEngine` already uses for its own cooperative poll.

use crate::error::IkigaiResult;
use futures::StreamExt;
use reqwest::Client;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub type RequestId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionType {
    Success,
    ClientError,
    ServerError,
    NetworkError,
}

#[derive(Debug, Clone, Default)]
pub struct ProviderMeta {
    pub model: Option<String>,
    pub finish_reason: Option<String>,
    pub completion_tokens: Option<u64>,
    pub tool_call: Option<(String, String, String)>,
}

#[derive(Debug, Clone)]
pub struct CompletionRecord {
    pub request_id: RequestId,
    pub completion_type: CompletionType,
    pub http_code: u16,
    pub response_body: String,
    pub response_len: usize,
    pub error_message: Option<String>,
    pub provider_meta: Option<ProviderMeta>,
}

pub type StreamCallback = Box<dyn FnMut(&str) + Send>;
pub type CompletionCallback = Box<dyn FnOnce(CompletionRecord) -> IkigaiResult<()> + Send>;

enum EngineEvent {
    Chunk(RequestId, String),
    Done(RequestId, CompletionRecord),
}

struct Inflight {
    handle: JoinHandle<()>,
    stream_cb: Option<StreamCallback>,
    completion_cb: Option<CompletionCallback>,
}

pub struct HttpMultiEngine {
    client: Client,
    next_id: RequestId,
    inflight: HashMap<RequestId, Inflight>,
    tx: mpsc::UnboundedSender<EngineEvent>,
    rx: mpsc::UnboundedReceiver<EngineEvent>,
}

impl HttpMultiEngine {
    pub fn new(client: Client) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        HttpMultiEngine {
            client,
            next_id: 0,
            inflight: HashMap::new(),
            tx,
            rx,
        }
    }

    pub fn active_count(&self) -> usize {
        self.inflight.len()
    }

    /// Enqueues a request. `stream_cb`, when present, receives each SSE
    /// `data:` payload as it is parsed out of the response body (spec
    /// §4.8 step 3); its absence makes this a plain non-streaming
    /// request (`ProviderAdapter::start_request`).
    pub fn enqueue(
        &mut self,
        url: String,
        headers: Vec<(String, String)>,
        body: String,
        stream_cb: Option<StreamCallback>,
        completion_cb: Option<CompletionCallback>,
    ) -> RequestId {
        let id = self.next_id;
        self.next_id += 1;
        let wants_stream = stream_cb.is_some();
        let tx = self.tx.clone();
        let client = self.client.clone();
        let handle = tokio::spawn(async move {
            let record = perform_transfer(&client, id, &url, &headers, &body, wants_stream, &tx).await;
            let _ = tx.send(EngineEvent::Done(id, record));
        });
        self.inflight.insert(
            id,
            Inflight {
                handle,
                stream_cb,
                completion_cb,
            },
        );
        id
    }

    /// No raw fd set to populate; kept so callers that mirror the
    /// reference's loop shape have something to call.
    pub fn fdset(&self) {}

    /// Desired next wake-up, in milliseconds, while anything is in flight.
    pub fn timeout_ms(&self) -> Option<u64> {
        if self.inflight.is_empty() {
            None
        } else {
            Some(50)
        }
    }

    /// Drains pending chunk events non-blockingly, invoking each
    /// request's stream callback. Returns whether any transfer is still
    /// running.
    pub fn perform(&mut self) -> bool {
        while let Ok(event) = self.rx.try_recv() {
            match event {
                EngineEvent::Chunk(id, data) => {
                    if let Some(inflight) = self.inflight.get_mut(&id) {
                        if let Some(cb) = inflight.stream_cb.as_mut() {
                            cb(&data);
                        }
                    }
                }
                EngineEvent::Done(id, record) => {
                    self.finish(id, record);
                }
            }
        }
        !self.inflight.is_empty()
    }

    /// Drains any completions that arrived since the last `perform`,
    /// invoking and consuming each completion callback. Returns the
    /// callback results so the event loop can surface user-level errors.
    pub fn info_read(&mut self) -> Vec<IkigaiResult<()>> {
        let mut results = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            match event {
                EngineEvent::Chunk(id, data) => {
                    if let Some(inflight) = self.inflight.get_mut(&id) {
                        if let Some(cb) = inflight.stream_cb.as_mut() {
                            cb(&data);
                        }
                    }
                }
                EngineEvent::Done(id, record) => {
                    if let Some(result) = self.finish(id, record) {
                        results.push(result);
                    }
                }
            }
        }
        results
    }

    fn finish(&mut self, id: RequestId, record: CompletionRecord) -> Option<IkigaiResult<()>> {
        let inflight = self.inflight.remove(&id)?;
        inflight.completion_cb.map(|cb| cb(record))
    }

    /// Removes every active request without invoking completion
    /// callbacks; resources (spawned tasks) are aborted.
    pub fn cancel_all(&mut self) {
        for (_, inflight) in self.inflight.drain() {
            inflight.handle.abort();
        }
        while self.rx.try_recv().is_ok() {}
    }

    /// Removes one active request without invoking its completion
    /// callback; its spawned task is aborted. A no-op if `id` is unknown
    /// or already finished — every other agent's in-flight transfer is
    /// left untouched (spec §4.8's multiplexing model: many agents can
    /// have concurrent requests against the one shared engine).
    pub fn cancel_one(&mut self, id: RequestId) {
        if let Some(inflight) = self.inflight.remove(&id) {
            inflight.handle.abort();
        }
    }
}

async fn perform_transfer(
    client: &Client,
    id: RequestId,
    url: &str,
    headers: &[(String, String)],
    body: &str,
    wants_stream: bool,
    tx: &mpsc::UnboundedSender<EngineEvent>,
) -> CompletionRecord {
    let mut req = client.post(url).body(body.to_string());
    for (name, value) in headers {
        req = req.header(name, value);
    }

    let response = match req.send().await {
        Ok(r) => r,
        Err(e) => {
            return CompletionRecord {
                request_id: id,
                completion_type: CompletionType::NetworkError,
                http_code: 0,
                response_body: String::new(),
                response_len: 0,
                error_message: Some(format!("transport error: {e}")),
                provider_meta: None,
            };
        }
    };

    let status = response.status().as_u16();

    let response_body = if wants_stream {
        let mut parser = SseParser::new();
        let mut accumulated = String::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    return CompletionRecord {
                        request_id: id,
                        completion_type: CompletionType::NetworkError,
                        http_code: status,
                        response_body: accumulated,
                        response_len: 0,
                        error_message: Some(format!("transport error: {e}")),
                        provider_meta: None,
                    };
                }
            };
            let text = String::from_utf8_lossy(&chunk);
            for payload in parser.feed(&text) {
                if payload == "[DONE]" {
                    continue;
                }
                accumulated.push_str(&payload);
                let _ = tx.send(EngineEvent::Chunk(id, payload));
            }
        }
        accumulated
    } else {
        match response.text().await {
            Ok(text) => text,
            Err(e) => {
                return CompletionRecord {
                    request_id: id,
                    completion_type: CompletionType::NetworkError,
                    http_code: status,
                    response_body: String::new(),
                    response_len: 0,
                    error_message: Some(format!("transport error: {e}")),
                    provider_meta: None,
                };
            }
        }
    };

    let completion_type = categorize(status);
    let error_message = match completion_type {
        CompletionType::Success => None,
        CompletionType::ClientError | CompletionType::ServerError => {
            Some(format!("HTTP {status} error"))
        }
        CompletionType::NetworkError => Some(format!("out-of-range HTTP status {status}")),
    };

    CompletionRecord {
        request_id: id,
        completion_type,
        http_code: status,
        response_len: response_body.len(),
        response_body,
        error_message,
        provider_meta: None,
    }
}

fn categorize(status: u16) -> CompletionType {
    match status {
        200..=299 => CompletionType::Success,
        400..=499 => CompletionType::ClientError,
        500..=599 => CompletionType::ServerError,
        _ => CompletionType::NetworkError,
    }
}

/// Incremental SSE framing: splits on blank-line event boundaries and
/// extracts `data:` field content (spec §9, "streaming SSE parsing").
/// Interpreting the payload (JSON deltas, tool-call fragments) is each
/// provider adapter's concern, not this engine's.
pub(crate) struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        SseParser {
            buffer: String::new(),
        }
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let event_block: String = self.buffer.drain(..pos + 2).collect();
            let mut data_lines = Vec::new();
            for line in event_block.lines() {
                if let Some(rest) = line.strip_prefix("data:") {
                    data_lines.push(rest.trim_start().to_string());
                }
            }
            if !data_lines.is_empty() {
                out.push(data_lines.join("\n"));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn sse_parser_splits_on_blank_line_and_strips_data_prefix() {
        let mut parser = SseParser::new();
        let events = parser.feed("data: foo\n\ndata: bar\n\n");
        assert_eq!(events, vec!["foo".to_string(), "bar".to_string()]);
    }

    #[test]
    fn sse_parser_accumulates_partial_chunks_across_feeds() {
        let mut parser = SseParser::new();
        assert!(parser.feed("data: fo").is_empty());
        let events = parser.feed("o\n\n");
        assert_eq!(events, vec!["foo".to_string()]);
    }

    #[test]
    fn sse_parser_joins_multiline_data_fields() {
        let mut parser = SseParser::new();
        let events = parser.feed("data: line1\ndata: line2\n\n");
        assert_eq!(events, vec!["line1\nline2".to_string()]);
    }

    #[test]
    fn categorize_matches_scenario_5_boundaries() {
        assert_eq!(categorize(200), CompletionType::Success);
        assert_eq!(categorize(429), CompletionType::ClientError);
        assert_eq!(categorize(500), CompletionType::ServerError);
        assert_eq!(categorize(0), CompletionType::NetworkError);
        assert_eq!(categorize(999), CompletionType::NetworkError);
    }

    #[tokio::test]
    async fn cancel_all_drops_inflight_without_invoking_completion() {
        let mut engine = HttpMultiEngine::new(Client::new());
        let invoked = Arc::new(Mutex::new(false));
        let invoked2 = invoked.clone();
        engine.enqueue(
            "http://127.0.0.1:1/unreachable".to_string(),
            vec![],
            String::new(),
            None,
            Some(Box::new(move |_record| {
                *invoked2.lock().unwrap() = true;
                Ok(())
            })),
        );
        assert_eq!(engine.active_count(), 1);
        engine.cancel_all();
        assert_eq!(engine.active_count(), 0);
        assert!(!*invoked.lock().unwrap());
    }

    #[tokio::test]
    async fn cancel_one_leaves_other_requests_running() {
        let mut engine = HttpMultiEngine::new(Client::new());
        let cancelled_invoked = Arc::new(Mutex::new(false));
        let cancelled_invoked2 = cancelled_invoked.clone();
        let victim = engine.enqueue(
            "http://127.0.0.1:1/unreachable".to_string(),
            vec![],
            String::new(),
            None,
            Some(Box::new(move |_record| {
                *cancelled_invoked2.lock().unwrap() = true;
                Ok(())
            })),
        );
        let survivor = engine.enqueue(
            "http://127.0.0.1:1/also-unreachable".to_string(),
            vec![],
            String::new(),
            None,
            Some(Box::new(|_record| Ok(()))),
        );
        assert_eq!(engine.active_count(), 2);

        engine.cancel_one(victim);

        assert_eq!(engine.active_count(), 1);
        assert!(!*cancelled_invoked.lock().unwrap());
        assert!(engine.inflight.contains_key(&survivor));
    }
}
