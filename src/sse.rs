//!
//! Anthropic SSE stream fabrication.
//!
//! The upstream may answer a streaming request with true SSE (text deltas
//! or tool-call deltas), with one plain JSON object, with an HTTP error, or
//! with an opaque inline rate-limit line. Whatever arrives, the downstream
//! client gets a strictly valid Anthropic event sequence:
//!
//! `message_start` -> (`content_block_start` `content_block_delta`*
//! `content_block_stop`)* -> `message_delta` -> `message_stop` -> `[DONE]`
//!
//! Upstream input is normalised into [`UpstreamFrame`] values and a single
//! driver loop walks them. Indices are assigned in first-appearance order;
//! upstream-provided tool indices are preserved and text blocks take the
//! next free sequential index. A client disconnect aborts the machine and
//! closes the upstream body; an upstream EOF without `[DONE]` still closes
//! the stream syntactically.
//!
//! Authors:
//!   Jaro <yarenty@gmail.com>
//!
//! Copyright (c) 2026 SkyCorp

/* --- uses ------------------------------------------------------------------------------------ */

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::converter::openai_to_anthropic::{
    OpenAiResponse, map_finish_reason, message_text,
};
use crate::converter::random_hex;
use crate::converter::tool_text::extract_tool_calls;

/* --- types ----------------------------------------------------------------------------------- */

///
/// Per-stream options fixed at request time.
#[derive(Debug, Clone)]
pub struct StreamContext {
    /** model name echoed in message_start */
    pub model: String,
    /** estimated input tokens for message_start usage */
    pub input_tokens: u64,
    /** optional delay between emitted events */
    pub pacing: Option<Duration>,
}

///
/// One normalised unit of upstream input.
///
/// The classifier turns every raw line into one of these; the driver is a
/// single loop over frames rather than per-shape code paths.
#[derive(Debug)]
pub enum UpstreamFrame {
    /** an SSE `data:` payload */
    Data(Value),
    /** the `data: [DONE]` sentinel */
    Done,
    /** a complete non-streaming JSON response on one line */
    JsonEnvelope(Value),
    /** an inline rate-limit error line */
    RateLimit(String),
    /** blank line, undecodable line, or SSE comment; dropped */
    Ignored,
}

///
/// Outcome of processing one frame.
enum Flow {
    /** keep reading upstream frames */
    Continue,
    /** stream fully emitted (short path taken); stop reading */
    Finished,
    /** downstream client went away; stop immediately */
    ClientGone,
}

///
/// Channel-backed event writer with optional pacing.
///
/// Pacing only throttles; events are never reordered, dropped, or
/// coalesced. A failed send means the downstream client disconnected.
struct EventSink {
    tx: mpsc::Sender<String>,
    pacing: Option<Duration>,
}

///
/// Mutable state of one fabricated stream.
struct StreamState {
    /** next candidate sequential index */
    next_index: u64,
    /** every index ever claimed by a block */
    used_indices: BTreeSet<u64>,
    /** index of the currently open text block */
    open_text: Option<u64>,
    /** upstream tool slot -> assigned block index, for open tool blocks */
    open_tools: HashMap<u64, u64>,
    /** tool slots in opening order, for deterministic closing */
    tool_order: Vec<u64>,
    /** next synthetic slot for tool deltas without an upstream index */
    next_synthetic_slot: u64,
    /** most recently opened tool slot; unindexed fragments continue it */
    last_tool_slot: Option<u64>,
    /** whether any tool block was ever opened */
    any_tool: bool,
    /** accumulated output characters for the token estimate */
    output_chars: usize,
}

/* --- constants ------------------------------------------------------------------------------ */

/** Synthetic tool slots start far above any realistic upstream index */
const SYNTHETIC_SLOT_BASE: u64 = 1 << 32;

/** Terminal sentinel payload ending every stream */
pub const DONE_SENTINEL: &str = "[DONE]";

/* --- start of code -------------------------------------------------------------------------- */

impl EventSink {
    fn new(tx: mpsc::Sender<String>, pacing: Option<Duration>) -> Self {
        Self { tx, pacing }
    }

    ///
    /// Send one event; returns false when the client disconnected.
    async fn send(&self, event: Value) -> bool {
        if self.tx.send(event.to_string()).await.is_err() {
            return false;
        }
        if let Some(delay) = self.pacing {
            tokio::time::sleep(delay).await;
        }
        true
    }

    ///
    /// Send the terminal `[DONE]` sentinel.
    async fn send_done(&self) -> bool {
        self.tx.send(DONE_SENTINEL.to_string()).await.is_ok()
    }
}

impl StreamState {
    fn new() -> Self {
        Self {
            next_index: 0,
            used_indices: BTreeSet::new(),
            open_text: None,
            open_tools: HashMap::new(),
            tool_order: Vec::new(),
            next_synthetic_slot: SYNTHETIC_SLOT_BASE,
            last_tool_slot: None,
            any_tool: false,
            output_chars: 0,
        }
    }

    ///
    /// Claim the next free sequential index.
    fn next_free_index(&mut self) -> u64 {
        while self.used_indices.contains(&self.next_index) {
            self.next_index += 1;
        }
        let index = self.next_index;
        self.used_indices.insert(index);
        self.next_index += 1;
        index
    }

    ///
    /// Claim a specific index for a tool block, preserving the upstream
    /// number when it is still free and falling back to the next free
    /// sequential index when it is already taken.
    fn claim_tool_index(&mut self, wanted: Option<u64>) -> u64 {
        match wanted {
            Some(index) if !self.used_indices.contains(&index) => {
                self.used_indices.insert(index);
                index
            }
            _ => self.next_free_index(),
        }
    }

    /// Estimated output tokens so far, at least one.
    fn output_tokens(&self) -> u64 {
        ((self.output_chars / 4) as u64).max(1)
    }
}

/* --- event builders -------------------------------------------------------------------------- */

///
/// Build the opening `message_start` event.
fn message_start_event(ctx: &StreamContext) -> Value {
    json!({
        "type": "message_start",
        "message": {
            "id": format!("msg_{}", random_hex(24)),
            "type": "message",
            "role": "assistant",
            "content": [],
            "model": ctx.model,
            "stop_reason": null,
            "stop_sequence": null,
            "usage": { "input_tokens": ctx.input_tokens, "output_tokens": 0 }
        }
    })
}

/// Build a `content_block_start` for a text block.
fn text_block_start_event(index: u64) -> Value {
    json!({
        "type": "content_block_start",
        "index": index,
        "content_block": { "type": "text", "text": "" }
    })
}

/// Build a `content_block_start` for a tool_use block.
fn tool_block_start_event(index: u64, id: &str, name: &str) -> Value {
    json!({
        "type": "content_block_start",
        "index": index,
        "content_block": { "type": "tool_use", "id": id, "name": name, "input": {} }
    })
}

/// Build a `content_block_delta` carrying a text fragment.
fn text_delta_event(index: u64, text: &str) -> Value {
    json!({
        "type": "content_block_delta",
        "index": index,
        "delta": { "type": "text_delta", "text": text }
    })
}

/// Build a `content_block_delta` carrying an opaque JSON fragment.
fn input_json_delta_event(index: u64, partial_json: &str) -> Value {
    json!({
        "type": "content_block_delta",
        "index": index,
        "delta": { "type": "input_json_delta", "partial_json": partial_json }
    })
}

/// Build a `content_block_stop`.
fn block_stop_event(index: u64) -> Value {
    json!({ "type": "content_block_stop", "index": index })
}

/// Build the `message_delta` event.
fn message_delta_event(stop_reason: &str, output_tokens: u64) -> Value {
    json!({
        "type": "message_delta",
        "delta": { "stop_reason": stop_reason, "stop_sequence": null },
        "usage": { "output_tokens": output_tokens }
    })
}

/// Build the `message_stop` event.
fn message_stop_event() -> Value {
    json!({ "type": "message_stop" })
}

/* --- line classification --------------------------------------------------------------------- */

///
/// Split buffered bytes into complete lines and the trailing remainder.
///
/// # Arguments
///  * `content` - buffered text to split
///
/// # Returns
///  * Tuple of (complete lines, remaining buffer)
pub(crate) fn split_sse_lines(content: &str) -> (Vec<&str>, String) {
    let mut lines_to_process = Vec::new();
    let mut new_buffer = String::new();

    let ends_with_newline = content.ends_with('\n');
    let all_lines: Vec<&str> = content.lines().collect();
    let line_count = all_lines.len();

    for (i, line) in all_lines.into_iter().enumerate() {
        let is_last = i == line_count - 1;
        if is_last && !ends_with_newline {
            new_buffer = line.to_string();
        } else {
            lines_to_process.push(line);
        }
    }

    (lines_to_process, new_buffer)
}

///
/// Normalise one raw upstream line into a frame.
///
/// Lines with the `data: ` prefix carry SSE payloads; lines without it are
/// either an inline rate-limit error, a whole non-streaming JSON response,
/// or noise to be dropped.
///
/// # Arguments
///  * `line` - one raw upstream line
///
/// # Returns
///  * Classified frame
pub(crate) fn classify_line(line: &str) -> UpstreamFrame {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return UpstreamFrame::Ignored;
    }

    if let Some(payload) = trimmed.strip_prefix("data:") {
        let payload = payload.trim();
        if payload == "[DONE]" {
            return UpstreamFrame::Done;
        }
        return match serde_json::from_str::<Value>(payload) {
            Ok(value) => UpstreamFrame::Data(value),
            // Undecodable payloads are dropped, not fatal.
            Err(_) => UpstreamFrame::Ignored,
        };
    }

    if is_inline_rate_limit(trimmed) {
        let message = serde_json::from_str::<Value>(trimmed)
            .ok()
            .and_then(|v| {
                v.get("msg")
                    .or_else(|| v.get("message"))
                    .and_then(|m| m.as_str())
                    .map(|m| m.to_string())
            })
            .unwrap_or_else(|| "Rate limit exceeded".to_string());
        return UpstreamFrame::RateLimit(message);
    }

    if trimmed.contains("\"choices\"") && trimmed.contains("\"message\"") {
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            return UpstreamFrame::JsonEnvelope(value);
        }
    }

    UpstreamFrame::Ignored
}

///
/// Heuristic for inline rate-limit lines that arrive without a `data:`
/// prefix.
fn is_inline_rate_limit(line: &str) -> bool {
    if line.contains(r#""status":"429""#)
        || line.contains(r#""status": "429""#)
        || line.contains(r#""status":"449""#)
        || line.contains(r#""status": "449""#)
    {
        return true;
    }
    let lowered = line.to_lowercase();
    lowered.contains("rate limit") || (lowered.contains("exceeded") && lowered.contains("limit"))
}

///
/// Detect an error-shaped SSE payload: a top-level `status` together with
/// `msg` or `message`.
fn payload_error(value: &Value) -> Option<(String, String)> {
    let status = value.get("status")?;
    let status = match status {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let message = value
        .get("msg")
        .or_else(|| value.get("message"))
        .and_then(|m| m.as_str())?
        .to_string();
    Some((status, message))
}

///
/// Whether an error-shaped payload is a rate-limit signature.
fn is_rate_limit_payload(status: &str, message: &str) -> bool {
    if status == "429" || status == "449" {
        return true;
    }
    let lowered = message.to_lowercase();
    lowered.contains("rate limit") || (lowered.contains("exceeded") && lowered.contains("limit"))
}

/* --- stream drivers -------------------------------------------------------------------------- */

///
/// Fabricate the event stream for a live upstream response.
///
/// JSON-typed responses take the aggregation short path; everything else
/// is read line by line. The upstream body is owned by this call and is
/// closed when it returns.
///
/// # Arguments
///  * `response` - live upstream HTTP response
///  * `ctx` - per-stream options
///  * `tx` - downstream event channel
pub async fn run_message_stream(
    response: reqwest::Response,
    ctx: StreamContext,
    tx: mpsc::Sender<String>,
) {
    let is_json = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/json"))
        .unwrap_or(false);

    if is_json {
        let body = response.text().await.unwrap_or_default();
        run_aggregate_body(&body, ctx, tx).await;
        return;
    }

    run_byte_stream(response.bytes_stream(), ctx, tx).await;
}

///
/// Fabricate the event stream from a raw upstream byte stream.
///
/// This is the line-by-line driver behind [`run_message_stream`], split
/// out so the machine can be exercised without a live HTTP connection.
///
/// # Arguments
///  * `stream` - upstream body bytes
///  * `ctx` - per-stream options
///  * `tx` - downstream event channel
pub async fn run_byte_stream<S, E>(mut stream: S, ctx: StreamContext, tx: mpsc::Sender<String>)
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let sink = EventSink::new(tx, ctx.pacing);
    let mut state = StreamState::new();

    if !sink.send(message_start_event(&ctx)).await {
        return;
    }

    let mut buffer = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                // The HTTP status is already out; the failure is only
                // visible inside the stream.
                tracing::error!("Stream chunk error: {}", e);
                emit_error_close(
                    &mut state,
                    &sink,
                    &format!("[streaming_error] upstream connection lost: {}", e),
                )
                .await;
                return;
            }
        };

        let chunk_str = String::from_utf8_lossy(&chunk);
        let combined = format!("{}{}", buffer, chunk_str);
        let (lines, rest) = split_sse_lines(&combined);
        buffer = rest;

        for line in lines {
            match process_frame(&mut state, &sink, classify_line(line)).await {
                Flow::Continue => {}
                Flow::Finished | Flow::ClientGone => return,
            }
        }
    }

    // Flush a final unterminated line the upstream left behind.
    if !buffer.is_empty() {
        match process_frame(&mut state, &sink, classify_line(&buffer)).await {
            Flow::Continue => {}
            Flow::Finished | Flow::ClientGone => return,
        }
    }

    // Upstream finished (or broke) without [DONE]; close anyway so the
    // emitted stream stays syntactically valid.
    finish_stream(&mut state, &sink).await;
}

///
/// Process one classified frame; the single driver step.
async fn process_frame(state: &mut StreamState, sink: &EventSink, frame: UpstreamFrame) -> Flow {
    match frame {
        UpstreamFrame::Ignored => Flow::Continue,
        UpstreamFrame::Done => {
            if finish_stream(state, sink).await {
                Flow::Finished
            } else {
                Flow::ClientGone
            }
        }
        UpstreamFrame::RateLimit(message) => {
            let text = rate_limit_notice(&message);
            if emit_error_close(state, sink, &text).await {
                Flow::Finished
            } else {
                Flow::ClientGone
            }
        }
        UpstreamFrame::JsonEnvelope(value) => {
            if aggregate_envelope(state, sink, &value).await {
                Flow::Finished
            } else {
                Flow::ClientGone
            }
        }
        UpstreamFrame::Data(value) => process_data_payload(state, sink, &value).await,
    }
}

///
/// Process a decoded `data:` payload.
async fn process_data_payload(state: &mut StreamState, sink: &EventSink, value: &Value) -> Flow {
    // Error-shaped payloads can arrive mid-stream; rewrite them into a
    // terminal error path that still closes the stream properly.
    if let Some((status, message)) = payload_error(value) {
        let text = if is_rate_limit_payload(&status, &message) {
            rate_limit_notice(&message)
        } else {
            format!("[upstream error {}] {}", status, message)
        };
        return if emit_error_close(state, sink, &text).await {
            Flow::Finished
        } else {
            Flow::ClientGone
        };
    }

    let Some(choices) = value.get("choices").and_then(|c| c.as_array()) else {
        return Flow::Continue;
    };

    for choice in choices {
        // Prefer the streaming delta; a full message is treated as one
        // delta carrying the whole content.
        let delta = if let Some(delta) = choice.get("delta") {
            delta.clone()
        } else if let Some(message) = choice.get("message") {
            let text = message
                .get("content")
                .and_then(|c| c.as_str())
                .filter(|c| !c.is_empty())
                .or_else(|| message.get("reasoning_content").and_then(|c| c.as_str()))
                .unwrap_or_default();
            json!({ "content": text })
        } else {
            continue;
        };

        let tool_calls = delta.get("tool_calls").and_then(|t| t.as_array());
        if let Some(tool_calls) = tool_calls.filter(|calls| !calls.is_empty()) {
            for call in tool_calls {
                if !process_tool_call_delta(state, sink, call).await {
                    return Flow::ClientGone;
                }
            }
            continue;
        }

        // Legacy function_call deltas behave like a single tool call at a
        // fresh index.
        if let Some(fc) = delta.get("function_call").filter(|fc| !fc.is_null()) {
            let call = json!({
                "function": fc.clone()
            });
            if !process_tool_call_delta(state, sink, &call).await {
                return Flow::ClientGone;
            }
            continue;
        }

        let text = delta
            .get("content")
            .and_then(|c| c.as_str())
            .filter(|c| !c.is_empty())
            .or_else(|| delta.get("reasoning_content").and_then(|c| c.as_str()))
            .unwrap_or_default();

        if !text.is_empty() && !emit_text_delta(state, sink, text).await {
            return Flow::ClientGone;
        }
    }

    Flow::Continue
}

///
/// Handle one tool-call delta entry.
///
/// The first delta for a tool slot opens its block (closing any open text
/// block first); argument fragments are forwarded verbatim because the
/// upstream splits them mid-token.
async fn process_tool_call_delta(state: &mut StreamState, sink: &EventSink, call: &Value) -> bool {
    let upstream_index = call.get("index").and_then(|i| i.as_u64());
    let id = call.get("id").and_then(|i| i.as_str());
    let function = call.get("function");
    let name = function.and_then(|f| f.get("name")).and_then(|n| n.as_str());
    let arguments = function.and_then(|f| f.get("arguments")).and_then(|a| a.as_str());

    let slot = match upstream_index {
        Some(index) => index,
        None => {
            // Without an upstream index, a fragment continues the most
            // recent tool; a first-ever delta opens a synthetic slot.
            match continuation_slot(state, id, name) {
                Some(slot) => slot,
                None => {
                    let slot = state.next_synthetic_slot;
                    state.next_synthetic_slot += 1;
                    slot
                }
            }
        }
    };

    if !state.open_tools.contains_key(&slot) {
        if let Some(text_index) = state.open_text.take() {
            if !sink.send(block_stop_event(text_index)).await {
                return false;
            }
        }

        let block_index = state.claim_tool_index(upstream_index);
        let block_id = id
            .filter(|id| !id.is_empty())
            .map(|id| id.to_string())
            .unwrap_or_else(|| format!("tool_{}", random_hex(24)));

        state.open_tools.insert(slot, block_index);
        state.tool_order.push(slot);
        state.last_tool_slot = Some(slot);
        state.any_tool = true;

        if !sink
            .send(tool_block_start_event(block_index, &block_id, name.unwrap_or_default()))
            .await
        {
            return false;
        }
    }

    if let Some(fragment) = arguments.filter(|a| !a.is_empty()) {
        let block_index = state.open_tools[&slot];
        state.output_chars += fragment.len();
        if !sink.send(input_json_delta_event(block_index, fragment)).await {
            return false;
        }
    }

    true
}

///
/// Resolve the slot an unindexed tool delta belongs to.
fn continuation_slot(state: &StreamState, id: Option<&str>, name: Option<&str>) -> Option<u64> {
    // A fresh id or name starts a new tool; bare argument fragments
    // continue the last one.
    if id.is_some() || name.is_some() {
        return None;
    }
    state.last_tool_slot
}

///
/// Emit a text fragment, opening a text block when none is open.
async fn emit_text_delta(state: &mut StreamState, sink: &EventSink, text: &str) -> bool {
    let index = match state.open_text {
        Some(index) => index,
        None => {
            let index = state.next_free_index();
            state.open_text = Some(index);
            if !sink.send(text_block_start_event(index)).await {
                return false;
            }
            index
        }
    };

    state.output_chars += text.len();
    sink.send(text_delta_event(index, text)).await
}

///
/// Close every open block and end the stream.
///
/// # Returns
///  * `false` when the client disconnected mid-close
async fn finish_stream(state: &mut StreamState, sink: &EventSink) -> bool {
    if let Some(index) = state.open_text.take() {
        if !sink.send(block_stop_event(index)).await {
            return false;
        }
    }

    for slot in std::mem::take(&mut state.tool_order) {
        if let Some(index) = state.open_tools.remove(&slot) {
            if !sink.send(block_stop_event(index)).await {
                return false;
            }
        }
    }

    let stop_reason = if state.any_tool { "tool_use" } else { "end_turn" };
    if !sink.send(message_delta_event(stop_reason, state.output_tokens())).await {
        return false;
    }
    if !sink.send(message_stop_event()).await {
        return false;
    }
    sink.send_done().await
}

///
/// Terminal error path: close open blocks, surface the error as one text
/// block, and end the stream correctly bracketed.
async fn emit_error_close(state: &mut StreamState, sink: &EventSink, text: &str) -> bool {
    if let Some(index) = state.open_text.take() {
        if !sink.send(block_stop_event(index)).await {
            return false;
        }
    }
    for slot in std::mem::take(&mut state.tool_order) {
        if let Some(index) = state.open_tools.remove(&slot) {
            if !sink.send(block_stop_event(index)).await {
                return false;
            }
        }
    }

    let index = state.next_free_index();
    if !sink.send(text_block_start_event(index)).await {
        return false;
    }
    if !sink.send(text_delta_event(index, text)).await {
        return false;
    }
    if !sink.send(block_stop_event(index)).await {
        return false;
    }
    if !sink.send(message_delta_event("end_turn", 1)).await {
        return false;
    }
    if !sink.send(message_stop_event()).await {
        return false;
    }
    sink.send_done().await
}

///
/// Aggregation short path entry: the upstream ignored the streaming
/// request and answered with one JSON body.
///
/// # Arguments
///  * `body` - complete upstream response body
///  * `ctx` - per-stream options
///  * `tx` - downstream event channel
pub async fn run_aggregate_body(body: &str, ctx: StreamContext, tx: mpsc::Sender<String>) {
    let sink = EventSink::new(tx, ctx.pacing);
    let mut state = StreamState::new();

    if !sink.send(message_start_event(&ctx)).await {
        return;
    }

    match serde_json::from_str::<Value>(body) {
        Ok(value) => {
            aggregate_envelope(&mut state, &sink, &value).await;
        }
        Err(_) => {
            emit_error_close(&mut state, &sink, "[upstream error] invalid response format").await;
        }
    }
}

///
/// Synthesise the block events for a complete non-streaming response.
///
/// One text block when text is present and one tool block per call, each
/// strictly bracketed; tool calls embedded in text are recovered through
/// the extractor. Tool blocks keep the upstream-provided index when one
/// exists.
///
/// # Returns
///  * `false` when the client disconnected
async fn aggregate_envelope(state: &mut StreamState, sink: &EventSink, value: &Value) -> bool {
    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("Unknown upstream error");
        let status = error
            .get("status_code")
            .and_then(|s| s.as_u64())
            .unwrap_or(500)
            .to_string();
        let text = if is_rate_limit_payload(&status, message) {
            rate_limit_notice(message)
        } else {
            format!("[upstream error {}] {}", status, message)
        };
        return emit_error_close(state, sink, &text).await;
    }

    let response: OpenAiResponse = match serde_json::from_value(value.clone()) {
        Ok(response) => response,
        Err(_) => {
            return emit_error_close(state, sink, "[upstream error] invalid response format")
                .await;
        }
    };

    let Some(choice) = response.choices.as_ref().and_then(|c| c.first()) else {
        return emit_error_close(state, sink, "[upstream error] invalid response format").await;
    };

    let message = choice.message.as_ref();
    let text = message.map(message_text).unwrap_or_default();
    let tool_calls = message.and_then(|m| m.tool_calls.as_ref());

    let mut stop_reason = map_finish_reason(choice.finish_reason.as_deref());

    if let Some(calls) = tool_calls.filter(|calls| !calls.is_empty()) {
        if !text.is_empty() && !emit_whole_text_block(state, sink, &text).await {
            return false;
        }

        for call in calls {
            let index = state.claim_tool_index(call.index);
            let id = call
                .id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| format!("tool_{}", random_hex(24)));
            let name = call.function.name.clone().unwrap_or_default();

            if !sink.send(tool_block_start_event(index, &id, &name)).await {
                return false;
            }
            if let Some(args) = call.function.arguments.as_deref().filter(|a| !a.is_empty()) {
                state.output_chars += args.len();
                if !sink.send(input_json_delta_event(index, args)).await {
                    return false;
                }
            }
            if !sink.send(block_stop_event(index)).await {
                return false;
            }
        }
        stop_reason = "tool_use".to_string();
    } else if !text.is_empty() {
        let extracted = extract_tool_calls(&text);
        if extracted.is_empty() {
            if !emit_whole_text_block(state, sink, &text).await {
                return false;
            }
        } else {
            for call in extracted {
                let index = state.next_free_index();
                let id = format!("toolu_{}", random_hex(24));
                let args = call.arguments.to_string();

                if !sink.send(tool_block_start_event(index, &id, &call.name)).await {
                    return false;
                }
                state.output_chars += args.len();
                if !sink.send(input_json_delta_event(index, &args)).await {
                    return false;
                }
                if !sink.send(block_stop_event(index)).await {
                    return false;
                }
            }
            stop_reason = "tool_use".to_string();
        }
    } else {
        // Content is never empty: emit one empty text block.
        let index = state.next_free_index();
        if !sink.send(text_block_start_event(index)).await {
            return false;
        }
        if !sink.send(block_stop_event(index)).await {
            return false;
        }
    }

    let output_tokens = response
        .usage
        .map(|u| u.completion_tokens)
        .filter(|t| *t > 0)
        .unwrap_or_else(|| state.output_tokens())
        .max(1);

    if !sink.send(message_delta_event(&stop_reason, output_tokens)).await {
        return false;
    }
    if !sink.send(message_stop_event()).await {
        return false;
    }
    sink.send_done().await
}

///
/// Emit one complete text block (start, one delta, stop).
async fn emit_whole_text_block(state: &mut StreamState, sink: &EventSink, text: &str) -> bool {
    let index = state.next_free_index();
    state.output_chars += text.len();
    if !sink.send(text_block_start_event(index)).await {
        return false;
    }
    if !sink.send(text_delta_event(index, text)).await {
        return false;
    }
    sink.send(block_stop_event(index)).await
}

///
/// Full short-path stream carrying a rewritten error.
///
/// Used when the upstream call failed before any stream existed: the
/// downstream still receives a complete, valid SSE sequence with the error
/// as a user-visible text block.
///
/// # Arguments
///  * `text` - user-visible error text
///  * `ctx` - per-stream options
///  * `tx` - downstream event channel
pub async fn run_error_stream(text: &str, ctx: StreamContext, tx: mpsc::Sender<String>) {
    let sink = EventSink::new(tx, ctx.pacing);
    let mut state = StreamState::new();

    if !sink.send(message_start_event(&ctx)).await {
        return;
    }
    emit_error_close(&mut state, &sink, text).await;
}

///
/// User-visible text for a rate-limit short path.
pub fn rate_limit_notice(message: &str) -> String {
    format!("[rate limited] {}, please retry shortly", message)
}
