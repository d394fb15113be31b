//!
//! Outbound HTTP adapter for the OpenAI-compatible upstream.
//!
//! One pooled client serves every request. Two call modes exist: streaming
//! (`Accept: text/event-stream`) and non-streaming (`Accept:
//! application/json`). Rate-limited calls are retried with exponential
//! backoff and jitter; every other reply is handed back intact for the
//! caller to classify.
//!
//! Authors:
//!   Jaro <yarenty@gmail.com>
//!
//! Copyright (c) 2026 SkyCorp

/* --- uses ------------------------------------------------------------------------------------ */

use std::sync::atomic::Ordering;
use std::time::Duration;

use reqwest::Client;

use crate::config::Config;
use crate::converter::anthropic_to_openai::OpenAiRequest;
use crate::error::{ProxyError, Result, is_rate_limit_signature};
use crate::server::AppMetrics;

/* --- types ----------------------------------------------------------------------------------- */

///
/// A fully-read upstream reply.
///
/// Carries whatever the upstream answered, success or not; classification
/// happens in the caller.
#[derive(Debug)]
pub struct UpstreamReply {
    /** upstream HTTP status code */
    pub status: u16,
    /** upstream response body text */
    pub body: String,
}

///
/// Outcome of a streaming call.
///
/// A successful call yields the live response whose body the SSE state
/// machine then owns; a failed call yields the read error reply.
pub enum StreamOutcome {
    /** upstream accepted; body is the live event stream */
    Stream(reqwest::Response),
    /** upstream refused; reply body already read */
    Error(UpstreamReply),
}

///
/// Single outbound client for the configured upstream.
pub struct UpstreamClient {
    /** pooled HTTP client */
    http: Client,
    /** upstream base URL without the endpoint suffix */
    base_url: String,
    /** bearer API key */
    api_key: String,
    /** whether rate-limited calls are retried */
    retry_enabled: bool,
    /** maximum retry attempts after the initial call */
    max_attempts: u32,
}

/* --- constants ------------------------------------------------------------------------------ */

/** Content type header for JSON requests */
const CONTENT_TYPE_JSON: &str = "application/json";

/** Accept header value for streaming calls */
const ACCEPT_SSE: &str = "text/event-stream";

/** Upper bound on a single backoff sleep in seconds */
const MAX_BACKOFF_SECS: f64 = 30.0;

/** Idle connections kept per host in the pool */
const POOL_MAX_IDLE_PER_HOST: usize = 16;

/* --- start of code -------------------------------------------------------------------------- */

impl UpstreamClient {
    ///
    /// Create the upstream client from configuration.
    ///
    /// # Arguments
    ///  * `config` - application configuration
    ///
    /// # Returns
    ///  * Configured client
    ///  * `ProxyError::Config` if client construction fails
    pub fn new(config: &Config) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout())
            .read_timeout(config.read_timeout())
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build()
            .map_err(|e| ProxyError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.upstream.base_url.trim_end_matches('/').to_string(),
            api_key: config.upstream.api_key.clone(),
            retry_enabled: config.retry.enabled,
            max_attempts: config.retry.max_attempts,
        })
    }

    ///
    /// Non-streaming chat completion call with rate-limit retry.
    ///
    /// Successful (200) replies return immediately. Rate-limited replies
    /// are retried up to the configured attempt count; once retries are
    /// exhausted the last reply is returned unchanged so the caller can
    /// rewrite it. Other non-2xx replies return intact without retry.
    ///
    /// # Arguments
    ///  * `request` - translated OpenAI request
    ///  * `metrics` - operational counters
    ///
    /// # Returns
    ///  * Upstream reply (any status)
    ///  * `ProxyError` on network failure or timeout
    pub async fn chat_completions(
        &self,
        request: &OpenAiRequest,
        metrics: &AppMetrics,
    ) -> Result<UpstreamReply> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let response = self.send_chat(request, false).await?;
            let status = response.status().as_u16();
            let body = response.text().await.map_err(map_transport_error)?;
            let reply = UpstreamReply { status, body };

            if reply.status == 200 || !is_rate_limit_signature(reply.status, &reply.body) {
                return Ok(reply);
            }

            metrics.rate_limit_hits.fetch_add(1, Ordering::Relaxed);

            if !self.retry_enabled || attempt > self.max_attempts {
                tracing::error!(
                    "Rate limit retries exhausted after {} attempt(s), returning last reply",
                    attempt
                );
                return Ok(reply);
            }

            metrics.retry_attempts.fetch_add(1, Ordering::Relaxed);
            let delay = backoff_delay(attempt);
            tracing::warn!(
                "Upstream rate limited (status {}), retrying in {:.1}s (attempt {}/{})",
                reply.status,
                delay.as_secs_f64(),
                attempt,
                self.max_attempts
            );
            tokio::time::sleep(delay).await;
        }
    }

    ///
    /// Streaming chat completion call with rate-limit retry.
    ///
    /// On success the live response is returned with its body unread so
    /// the SSE state machine can consume it line by line. Failed calls
    /// have their body read for classification; rate-limited ones are
    /// retried like the non-streaming mode.
    ///
    /// # Arguments
    ///  * `request` - translated OpenAI request
    ///  * `metrics` - operational counters
    ///
    /// # Returns
    ///  * `StreamOutcome::Stream` on success, `StreamOutcome::Error` otherwise
    ///  * `ProxyError` on network failure or timeout
    pub async fn chat_completions_stream(
        &self,
        request: &OpenAiRequest,
        metrics: &AppMetrics,
    ) -> Result<StreamOutcome> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let response = self.send_chat(request, true).await?;

            if response.status().is_success() {
                return Ok(StreamOutcome::Stream(response));
            }

            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            let reply = UpstreamReply { status, body };

            if !is_rate_limit_signature(reply.status, &reply.body) {
                return Ok(StreamOutcome::Error(reply));
            }

            metrics.rate_limit_hits.fetch_add(1, Ordering::Relaxed);

            if !self.retry_enabled || attempt > self.max_attempts {
                tracing::error!(
                    "Rate limit retries exhausted after {} attempt(s) on streaming call",
                    attempt
                );
                return Ok(StreamOutcome::Error(reply));
            }

            metrics.retry_attempts.fetch_add(1, Ordering::Relaxed);
            let delay = backoff_delay(attempt);
            tracing::warn!(
                "Upstream rate limited (status {}), retrying stream in {:.1}s (attempt {}/{})",
                reply.status,
                delay.as_secs_f64(),
                attempt,
                self.max_attempts
            );
            tokio::time::sleep(delay).await;
        }
    }

    ///
    /// Fetch the upstream model list verbatim.
    ///
    /// # Returns
    ///  * Upstream reply (any status)
    ///  * `ProxyError` on network failure or timeout
    pub async fn models(&self) -> Result<UpstreamReply> {
        let response = self
            .http
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(map_transport_error)?;
        Ok(UpstreamReply { status, body })
    }

    /* --- private methods ----------------------------------------------------------------- */

    ///
    /// Issue one chat completion POST in the requested mode.
    async fn send_chat(&self, request: &OpenAiRequest, stream: bool) -> Result<reqwest::Response> {
        let accept = if stream { ACCEPT_SSE } else { CONTENT_TYPE_JSON };
        self.http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .header("Content-Type", CONTENT_TYPE_JSON)
            .header("Accept", accept)
            .json(request)
            .send()
            .await
            .map_err(map_transport_error)
    }
}

///
/// Map a reqwest transport error onto the proxy taxonomy.
///
/// Timeouts become 504, everything else (connect refusal, DNS, broken
/// pipe) becomes a 502 upstream error.
fn map_transport_error(error: reqwest::Error) -> ProxyError {
    if error.is_timeout() {
        ProxyError::Timeout(format!("Upstream request timed out: {}", error))
    } else {
        ProxyError::Upstream(format!("Upstream request failed: {}", error))
    }
}

///
/// Sleep duration before the k-th retry.
///
/// `min(2^(k-1) + U(0.1, 0.5), 30)` seconds; the jitter spreads
/// simultaneous retries apart.
fn backoff_delay(attempt: u32) -> Duration {
    use rand::Rng;

    let base = 2f64.powi(attempt.saturating_sub(1) as i32);
    let jitter = rand::rng().random_range(0.1..0.5);
    Duration::from_secs_f64((base + jitter).min(MAX_BACKOFF_SECS))
}
