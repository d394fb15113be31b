//!
//! HTTP server implementation for the Anthropic to OpenAI proxy.
//!
//! Handles incoming Anthropic Messages requests and routes them to the
//! OpenAI-compatible upstream. Implements both streaming and non-streaming
//! responses with proper error handling and logging. Every failure leaves
//! the handler as an Anthropic error envelope - and as a fully formed SSE
//! stream when the client asked for one.
//!
//! Authors:
//!   Jaro <yarenty@gmail.com>
//!
//! Copyright (c) 2026 SkyCorp

/* --- uses ------------------------------------------------------------------------------------ */

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use bytes::Bytes;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::coalesce::{RequestCoalescer, fingerprint};
use crate::config::Config;
use crate::converter::anthropic_to_openai::{AnthropicRequest, estimate_input_tokens};
use crate::converter::{AnthropicToOpenAiConverter, OpenAiToAnthropicConverter};
use crate::error::{ProxyError, RETRY_AFTER_SECS, Result, classify_upstream};
use crate::sse::{
    StreamContext, rate_limit_notice, run_error_stream, run_message_stream,
};
use crate::upstream::{StreamOutcome, UpstreamClient};

/* --- types ----------------------------------------------------------------------------------- */

///
/// Application state containing all dependencies.
///
/// Contains all services needed for request processing; shared across
/// handlers behind an Arc.
pub struct AppState {
    /** application configuration */
    pub config: Config,
    /** outbound client for the upstream */
    pub upstream: UpstreamClient,
    /** converter from Anthropic to OpenAI request format */
    pub anthropic_to_openai: AnthropicToOpenAiConverter,
    /** converter from OpenAI to Anthropic response format */
    pub openai_to_anthropic: OpenAiToAnthropicConverter,
    /** duplicate-request coalescer */
    pub coalescer: RequestCoalescer,
    /** metrics for monitoring */
    pub metrics: AppMetrics,
}

///
/// Application metrics for monitoring and observability.
///
/// Tracks various operational metrics for monitoring service health.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /** total number of requests processed */
    pub total_requests: AtomicU64,
    /** total number of successful requests */
    pub successful_requests: AtomicU64,
    /** total number of failed requests */
    pub failed_requests: AtomicU64,
    /** total number of rate-limited upstream replies observed */
    pub rate_limit_hits: AtomicU64,
    /** total number of retry attempts made */
    pub retry_attempts: AtomicU64,
    /** total number of requests answered from the coalescer */
    pub coalesced_hits: AtomicU64,
}

/* --- constants ------------------------------------------------------------------------------ */

/** Channel buffer size for streaming responses */
const STREAMING_CHANNEL_BUFFER: usize = 100;

/** User-Agent prefixes of terminal-UI clients that benefit from pacing */
const TERMINAL_UI_PREFIXES: &[&str] =
    &["claude-cli", "claude-code", "claude-code-router", "anthropic-claude-code"];

/* --- start of code -------------------------------------------------------------------------- */

impl AppState {
    ///
    /// Create new application state with all dependencies.
    ///
    /// # Arguments
    ///  * `config` - application configuration
    ///
    /// # Returns
    ///  * Application state with initialized dependencies
    ///  * `ProxyError` if initialization fails
    pub fn new(config: Config) -> Result<Self> {
        let upstream = UpstreamClient::new(&config)?;
        let anthropic_to_openai =
            AnthropicToOpenAiConverter::new(config.server.log_level, &config.model_mappings);
        let openai_to_anthropic = OpenAiToAnthropicConverter::new(config.server.log_level);
        let coalescer = RequestCoalescer::new(&config.coalesce);
        let metrics = AppMetrics::default();

        Ok(Self { config, upstream, anthropic_to_openai, openai_to_anthropic, coalescer, metrics })
    }
}

///
/// Handle the Anthropic Messages endpoint.
///
/// Processes incoming Anthropic format requests, converts them to OpenAI
/// format, forwards to the upstream, and converts the response back.
/// Supports both streaming and non-streaming responses.
///
/// # Arguments
///  * `state` - shared application state
///  * `headers` - request headers (client detection)
///  * `body` - Anthropic format request JSON
///
/// # Returns
///  * HTTP response with Anthropic envelope or SSE stream
pub async fn messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: std::result::Result<Json<Value>, JsonRejection>,
) -> Response {
    state.metrics.total_requests.fetch_add(1, Ordering::Relaxed);

    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => {
            state.metrics.failed_requests.fetch_add(1, Ordering::Relaxed);
            let error = ProxyError::InvalidRequest(format!("Invalid JSON body: {}", rejection));
            return json_error_response(&error);
        }
    };

    let wants_stream = body.get("stream").and_then(|s| s.as_bool()).unwrap_or(false);
    let model = body.get("model").and_then(|m| m.as_str()).unwrap_or_default().to_string();

    match process_messages(state.clone(), &body, &headers).await {
        Ok(response) => {
            state.metrics.successful_requests.fetch_add(1, Ordering::Relaxed);
            response
        }
        Err(error) => {
            state.metrics.failed_requests.fetch_add(1, Ordering::Relaxed);
            tracing::error!("Request failed: {}", error);
            if wants_stream {
                sse_error_response(&state, &error, &model, &headers)
            } else {
                json_error_response(&error)
            }
        }
    }
}

///
/// Process a messages request end-to-end.
///
/// # Arguments
///  * `state` - shared application state
///  * `body` - raw JSON request body
///  * `headers` - request headers
///
/// # Returns
///  * HTTP response on success
///  * `ProxyError` on failure
async fn process_messages(
    state: Arc<AppState>,
    body: &Value,
    headers: &HeaderMap,
) -> Result<Response> {
    if let Some(user_agent) = headers.get(header::USER_AGENT).and_then(|ua| ua.to_str().ok()) {
        tracing::debug!("Client User-Agent: {}", user_agent);
    }

    if !body.is_object() {
        return Err(ProxyError::InvalidRequest("Request body must be a JSON object".to_string()));
    }

    // Missing, non-array, and malformed `messages` all surface here as
    // deserialization failures.
    let request: AnthropicRequest = serde_json::from_value(body.clone())
        .map_err(|e| ProxyError::Validation(format!("Malformed request: {}", e)))?;

    let model = request.model.clone().unwrap_or_default();
    let input_tokens = estimate_input_tokens(&request);
    log_incoming_request(&state, &request);

    let openai_request = state.anthropic_to_openai.convert(request)?;

    if openai_request.stream {
        handle_streaming_request(state, &openai_request, &model, input_tokens, headers).await
    } else {
        handle_non_streaming_request(state, body, &openai_request, &model).await
    }
}

///
/// Log details about the incoming Anthropic request.
fn log_incoming_request(state: &Arc<AppState>, request: &AnthropicRequest) {
    state.anthropic_to_openai.debug("=== Incoming Anthropic Request ===");
    state.anthropic_to_openai.debug(&format!("Model: {:?}", request.model));
    state.anthropic_to_openai.debug(&format!("Stream: {:?}", request.stream));
    state.anthropic_to_openai.debug(&format!("Messages: {}", request.messages.len()));

    if let Some(ref tools) = request.tools {
        let tool_names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        state
            .anthropic_to_openai
            .debug(&format!("Tools provided: {} ({})", tools.len(), tool_names.join(", ")));
    }
}

///
/// Handle a non-streaming request, with coalescing.
///
/// Duplicate requests within the TTL replay the cached bytes without a
/// second upstream call.
async fn handle_non_streaming_request(
    state: Arc<AppState>,
    body: &Value,
    openai_request: &crate::converter::anthropic_to_openai::OpenAiRequest,
    model: &str,
) -> Result<Response> {
    let request_fingerprint = fingerprint(body);

    if let Some(cached) = state.coalescer.lookup(&request_fingerprint) {
        state.metrics.coalesced_hits.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Coalesced duplicate request {}", &request_fingerprint[..8]);
        return Ok(cached_json_response(cached));
    }

    let reply = state.upstream.chat_completions(openai_request, &state.metrics).await?;

    if reply.status != 200 {
        return Err(classify_upstream(reply.status, &reply.body));
    }

    let openai_response: crate::converter::openai_to_anthropic::OpenAiResponse =
        serde_json::from_str(&reply.body).map_err(|e| {
            ProxyError::Upstream(format!("Unparseable upstream response: {}", e))
        })?;

    let anthropic_response = state.openai_to_anthropic.convert(openai_response, model)?;
    let bytes = Bytes::from(serde_json::to_vec(&anthropic_response)?);

    state.coalescer.store(request_fingerprint, bytes.clone());

    Ok(cached_json_response(bytes))
}

///
/// Handle a streaming request: call the upstream in stream mode and drive
/// the SSE state machine over whatever comes back.
async fn handle_streaming_request(
    state: Arc<AppState>,
    openai_request: &crate::converter::anthropic_to_openai::OpenAiRequest,
    model: &str,
    input_tokens: u64,
    headers: &HeaderMap,
) -> Result<Response> {
    let ctx = StreamContext {
        model: model.to_string(),
        input_tokens,
        pacing: pacing_for_client(&state.config, headers),
    };

    let outcome = state.upstream.chat_completions_stream(openai_request, &state.metrics).await?;

    match outcome {
        StreamOutcome::Stream(response) => {
            let (tx, rx) = mpsc::channel::<String>(STREAMING_CHANNEL_BUFFER);

            tokio::spawn(async move {
                run_message_stream(response, ctx, tx).await;
            });

            Ok(streaming_response(StatusCode::OK, rx, false))
        }
        StreamOutcome::Error(reply) => {
            let error = classify_upstream(reply.status, &reply.body);
            tracing::warn!(
                "Upstream refused streaming call with status {}: rewriting as {}",
                reply.status,
                error.kind()
            );
            Ok(error_stream_response(&error, ctx))
        }
    }
}

///
/// The pacing delay for this client, if it is a terminal-UI consumer.
fn pacing_for_client(config: &Config, headers: &HeaderMap) -> Option<std::time::Duration> {
    if is_terminal_ui_client(headers) { config.pacing_delay() } else { None }
}

///
/// Detect terminal-UI clients by User-Agent prefix.
///
/// These clients render events as they arrive and benefit from a small
/// fixed delay between events.
///
/// # Arguments
///  * `headers` - HTTP request headers
///
/// # Returns
///  * `true` if the client identifies as a known terminal UI
fn is_terminal_ui_client(headers: &HeaderMap) -> bool {
    let Some(user_agent) = headers.get(header::USER_AGENT).and_then(|ua| ua.to_str().ok()) else {
        return false;
    };
    let ua = user_agent.to_lowercase();
    TERMINAL_UI_PREFIXES.iter().any(|prefix| ua.starts_with(prefix))
}

///
/// Build the SSE response around a running event channel.
///
/// # Arguments
///  * `status` - outer HTTP status
///  * `rx` - event channel receiver
///  * `rate_limited` - whether to attach the 429 retry headers
fn streaming_response(
    status: StatusCode,
    rx: mpsc::Receiver<String>,
    rate_limited: bool,
) -> Response {
    let events = ReceiverStream::new(rx)
        .map(|data| Ok::<Event, Infallible>(Event::default().data(data)));
    let mut response = Sse::new(events).into_response();
    *response.status_mut() = status;

    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, "no-cache".parse().unwrap());
    headers.insert(header::CONNECTION, "keep-alive".parse().unwrap());
    headers.insert("x-accel-buffering", "no".parse().unwrap());

    if rate_limited {
        insert_rate_limit_headers(headers);
    }

    response
}

///
/// Full SSE stream carrying a rewritten error, with the real outer status.
///
/// Rewriting an error as a 200 stream is forbidden; the status always
/// reflects the condition, and 429 carries the retry headers.
fn error_stream_response(error: &ProxyError, ctx: StreamContext) -> Response {
    let text = if error.is_rate_limit() {
        rate_limit_notice(&error.to_string())
    } else {
        format!("[{}] {}", error.kind(), error)
    };

    let (tx, rx) = mpsc::channel::<String>(STREAMING_CHANNEL_BUFFER);
    let rate_limited = error.is_rate_limit();
    let status = error.status();

    tokio::spawn(async move {
        run_error_stream(&text, ctx, tx).await;
    });

    streaming_response(status, rx, rate_limited)
}

///
/// SSE error path entered from the top-level handler.
fn sse_error_response(
    state: &Arc<AppState>,
    error: &ProxyError,
    model: &str,
    headers: &HeaderMap,
) -> Response {
    let ctx = StreamContext {
        model: model.to_string(),
        input_tokens: 1,
        pacing: pacing_for_client(&state.config, headers),
    };
    error_stream_response(error, ctx)
}

///
/// Plain JSON error response in the Anthropic envelope.
///
/// # Arguments
///  * `error` - error to convert to HTTP response
///
/// # Returns
///  * HTTP error response with the error envelope
fn json_error_response(error: &ProxyError) -> Response {
    let mut response = (error.status(), Json(error.to_envelope())).into_response();
    if error.is_rate_limit() {
        insert_rate_limit_headers(response.headers_mut());
    }
    response
}

///
/// Attach the Anthropic retry headers that accompany every 429.
fn insert_rate_limit_headers(headers: &mut HeaderMap) {
    headers.insert("retry-after", RETRY_AFTER_SECS.parse().unwrap());
    headers.insert("anthropic-ratelimit-requests-limit", "60".parse().unwrap());
    headers.insert("anthropic-ratelimit-requests-remaining", "0".parse().unwrap());
}

///
/// JSON response from exact cached or freshly serialised bytes.
fn cached_json_response(bytes: Bytes) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        bytes,
    )
        .into_response()
}

///
/// Handle the token counting endpoint.
///
/// A trivial estimator: characters divided by four over the textual
/// content, with a floor of one.
///
/// # Arguments
///  * `body` - request with messages or text
///
/// # Returns
///  * JSON response with the estimated input token count
pub async fn count_tokens(Json(body): Json<Value>) -> Response {
    let estimated = estimate_token_count(&body);
    let model = body
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or("claude-3-5-haiku-20241022");

    Json(json!({
        "model": model,
        "usage": { "input_tokens": estimated, "output_tokens": 0 }
    }))
    .into_response()
}

///
/// Characters-divided-by-four token estimate over a count_tokens body.
fn estimate_token_count(body: &Value) -> u64 {
    let mut chars = 0usize;

    if let Some(messages) = body.get("messages").and_then(|m| m.as_array()) {
        for message in messages {
            match message.get("content") {
                Some(Value::String(text)) => chars += text.len(),
                Some(Value::Array(parts)) => {
                    for part in parts {
                        if part.get("type").and_then(|t| t.as_str()) == Some("text") {
                            chars += part
                                .get("text")
                                .and_then(|t| t.as_str())
                                .map(|t| t.len())
                                .unwrap_or(0);
                        }
                    }
                }
                _ => {}
            }
        }
    } else if let Some(text) = body.get("text").and_then(|t| t.as_str()) {
        chars += text.len();
    }

    ((chars / 4) as u64).max(1)
}

///
/// Handle the models listing endpoint.
///
/// Proxied verbatim to the upstream model list.
///
/// # Arguments
///  * `state` - shared application state
///
/// # Returns
///  * Upstream model list, or an error envelope on failure
pub async fn models(State(state): State<Arc<AppState>>) -> Response {
    match state.upstream.models().await {
        Ok(reply) if reply.status == 200 => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            reply.body,
        )
            .into_response(),
        Ok(reply) => {
            let error = classify_upstream(reply.status, &reply.body);
            json_error_response(&error)
        }
        Err(error) => json_error_response(&error),
    }
}

///
/// Handle health check endpoint.
///
/// Returns a simple health status for service monitoring with basic metrics.
///
/// # Arguments
///  * `state` - shared application state with metrics
///
/// # Returns
///  * JSON response with health status and metrics
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let total_requests = state.metrics.total_requests.load(Ordering::Relaxed);
    let successful_requests = state.metrics.successful_requests.load(Ordering::Relaxed);
    let failed_requests = state.metrics.failed_requests.load(Ordering::Relaxed);
    let rate_limit_hits = state.metrics.rate_limit_hits.load(Ordering::Relaxed);
    let retry_attempts = state.metrics.retry_attempts.load(Ordering::Relaxed);
    let coalesced_hits = state.metrics.coalesced_hits.load(Ordering::Relaxed);

    Json(json!({
      "status": "healthy",
      "timestamp": chrono::Utc::now().to_rfc3339(),
      "metrics": {
        "total_requests": total_requests,
        "successful_requests": successful_requests,
        "failed_requests": failed_requests,
        "rate_limit_hits": rate_limit_hits,
        "retry_attempts": retry_attempts,
        "coalesced_hits": coalesced_hits,
        "success_rate": if total_requests > 0 {
          (successful_requests as f64 / total_requests as f64 * 100.0).round()
        } else {
          100.0
        }
      }
    }))
}
