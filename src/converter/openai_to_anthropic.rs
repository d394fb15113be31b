//!
//! OpenAI to Anthropic format converter for API response translation.
//!
//! Converts non-streaming OpenAI chat completion responses back to the
//! Anthropic Messages response envelope. Handles structured tool calls,
//! tool calls embedded in free text, reasoning-content fallback, stop
//! reason mapping, and usage accounting.
//!
//! Authors:
//!   Jaro <yarenty@gmail.com>
//!
//! Copyright (c) 2026 SkyCorp

/* --- uses ------------------------------------------------------------------------------------ */

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::LogLevel;
use crate::converter::random_hex;
use crate::converter::tool_text::extract_tool_calls;
use crate::error::{ProxyError, Result};

/* --- types ----------------------------------------------------------------------------------- */

///
/// OpenAI chat completion response structure.
///
/// Fields are lenient: upstreams routinely omit ids, usage, or the model
/// name, and some put thought text under `reasoning_content`.
#[derive(Debug, Deserialize)]
pub struct OpenAiResponse {
    /** upstream response identifier, often empty or `chat-…` */
    #[serde(default)]
    pub id: Option<String>,
    /** completion choices; absence marks an error reply */
    pub choices: Option<Vec<OpenAiChoice>>,
    /** token usage accounting */
    #[serde(default)]
    pub usage: Option<OpenAiUsage>,
}

///
/// A single completion choice.
#[derive(Debug, Deserialize)]
pub struct OpenAiChoice {
    /** the completed message */
    pub message: Option<OpenAiResponseMessage>,
    /** why generation stopped */
    #[serde(default)]
    pub finish_reason: Option<String>,
}

///
/// The assistant message within a completion choice.
#[derive(Debug, Deserialize)]
pub struct OpenAiResponseMessage {
    /** main text content */
    #[serde(default)]
    pub content: Option<String>,
    /** thought text some upstreams emit instead of content */
    #[serde(default)]
    pub reasoning_content: Option<String>,
    /** structured tool calls */
    #[serde(default)]
    pub tool_calls: Option<Vec<OpenAiResponseToolCall>>,
}

///
/// A structured tool call in an OpenAI response.
#[derive(Debug, Deserialize)]
pub struct OpenAiResponseToolCall {
    /** upstream call identifier */
    #[serde(default)]
    pub id: Option<String>,
    /** upstream-assigned position, preserved in the event stream */
    #[serde(default)]
    pub index: Option<u64>,
    /** function name and arguments */
    pub function: OpenAiResponseFunction,
}

///
/// Function name and arguments of a tool call.
#[derive(Debug, Deserialize)]
pub struct OpenAiResponseFunction {
    /** function name */
    #[serde(default)]
    pub name: Option<String>,
    /** arguments as a JSON string */
    #[serde(default)]
    pub arguments: Option<String>,
}

///
/// Token usage accounting from the upstream.
#[derive(Debug, Default, Deserialize)]
pub struct OpenAiUsage {
    /** tokens consumed by the prompt */
    #[serde(default)]
    pub prompt_tokens: u64,
    /** tokens generated in the completion */
    #[serde(default)]
    pub completion_tokens: u64,
}

///
/// Anthropic Messages response envelope.
#[derive(Debug, Serialize)]
pub struct AnthropicResponse {
    /** response identifier, always `msg_…` */
    pub id: String,
    /** envelope type, always "message" */
    #[serde(rename = "type")]
    pub response_type: String,
    /** role, always "assistant" */
    pub role: String,
    /** ordered content blocks; never empty */
    pub content: Vec<AnthropicResponseBlock>,
    /** model name as the client requested it */
    pub model: String,
    /** why generation stopped */
    pub stop_reason: String,
    /** token usage accounting */
    pub usage: AnthropicUsage,
}

///
/// A content block in an Anthropic response.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum AnthropicResponseBlock {
    /** text content block */
    #[serde(rename = "text")]
    Text {
        /** the text content */
        text: String,
    },
    /** tool usage block */
    #[serde(rename = "tool_use")]
    ToolUse {
        /** tool call identifier */
        id: String,
        /** function name */
        name: String,
        /** parsed function input */
        input: Value,
    },
}

///
/// Anthropic usage accounting.
#[derive(Debug, Serialize)]
pub struct AnthropicUsage {
    /** tokens consumed by the prompt */
    pub input_tokens: u64,
    /** tokens generated in the completion */
    pub output_tokens: u64,
}

///
/// Converter from OpenAI response format to Anthropic response format.
pub struct OpenAiToAnthropicConverter {
    /** logging level for debug output */
    log_level: LogLevel,
}

/* --- start of code -------------------------------------------------------------------------- */

impl OpenAiToAnthropicConverter {
    ///
    /// Create a new OpenAI to Anthropic converter.
    ///
    /// # Arguments
    ///  * `log_level` - logging level for debug output
    ///
    /// # Returns
    ///  * New converter instance
    pub fn new(log_level: LogLevel) -> Self {
        Self { log_level }
    }

    ///
    /// Convert an OpenAI response to the Anthropic response envelope.
    ///
    /// Structured tool calls win over text; text with embedded tool tags is
    /// recovered through the tool-text extractor; `reasoning_content`
    /// stands in when `content` is empty. The caller's original model name
    /// replaces whatever the upstream reported.
    ///
    /// # Arguments
    ///  * `response` - parsed OpenAI response
    ///  * `model` - model name from the original client request
    ///
    /// # Returns
    ///  * Converted Anthropic response
    ///  * `ProxyError::Upstream` when the reply has no choices
    pub fn convert(&self, response: OpenAiResponse, model: &str) -> Result<AnthropicResponse> {
        let choices = match response.choices {
            Some(choices) if !choices.is_empty() => choices,
            _ => {
                return Err(ProxyError::Upstream(
                    "Upstream response has no choices".to_string(),
                ));
            }
        };

        let id = normalize_response_id(response.id.as_deref());
        let choice = &choices[0];

        let mut content = Vec::new();
        let mut tool_use_emitted = false;

        let message = choice.message.as_ref();
        let tool_calls = message.and_then(|m| m.tool_calls.as_ref());

        if let Some(tool_calls) = tool_calls.filter(|calls| !calls.is_empty()) {
            self.debug(&format!("Response contains {} structured tool call(s)", tool_calls.len()));
            for call in tool_calls {
                content.push(AnthropicResponseBlock::ToolUse {
                    id: call
                        .id
                        .clone()
                        .filter(|id| !id.is_empty())
                        .unwrap_or_else(|| format!("toolu_{}", random_hex(24))),
                    name: call.function.name.clone().unwrap_or_default(),
                    input: parse_tool_arguments(call.function.arguments.as_deref()),
                });
            }
            tool_use_emitted = true;
        } else {
            let text = message.map(message_text).unwrap_or_default();

            if !text.is_empty() {
                let extracted = extract_tool_calls(&text);
                if extracted.is_empty() {
                    content.push(AnthropicResponseBlock::Text { text });
                } else {
                    self.debug(&format!(
                        "Recovered {} tool call(s) from response text",
                        extracted.len()
                    ));
                    for call in extracted {
                        content.push(AnthropicResponseBlock::ToolUse {
                            id: format!("toolu_{}", random_hex(24)),
                            name: call.name,
                            input: call.arguments,
                        });
                    }
                    tool_use_emitted = true;
                }
            }
        }

        // Content is never empty.
        if content.is_empty() {
            content.push(AnthropicResponseBlock::Text { text: String::new() });
        }

        let stop_reason = if tool_use_emitted {
            "tool_use".to_string()
        } else {
            map_finish_reason(choice.finish_reason.as_deref())
        };

        let usage = response.usage.unwrap_or_default();

        Ok(AnthropicResponse {
            id,
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            content,
            model: model.to_string(),
            stop_reason,
            usage: AnthropicUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            },
        })
    }

    ///
    /// Log debug message if trace logging is enabled.
    ///
    /// # Arguments
    ///  * `msg` - debug message to log
    pub(crate) fn debug(&self, msg: &str) {
        if self.log_level.is_trace_enabled() {
            tracing::debug!("[TRACE] {}", msg);
        }
    }
}

///
/// Effective text of a response message: `content` first, falling back to
/// `reasoning_content` when content is empty.
pub(crate) fn message_text(message: &OpenAiResponseMessage) -> String {
    match message.content.as_deref() {
        Some(content) if !content.is_empty() => content.to_string(),
        _ => message.reasoning_content.clone().unwrap_or_default(),
    }
}

///
/// Normalise an upstream response id into `msg_…` form.
///
/// Empty, missing, or bare `chat-` ids get a synthesised 24-hex id; any
/// other id has its `chat-` prefix rewritten to `msg_`.
///
/// # Arguments
///  * `id` - upstream id, if present
///
/// # Returns
///  * Anthropic-shaped response id
pub(crate) fn normalize_response_id(id: Option<&str>) -> String {
    match id {
        None | Some("") | Some("chat-") => format!("msg_{}", random_hex(24)),
        Some(id) => format!("msg_{}", id.strip_prefix("chat-").unwrap_or(id)),
    }
}

///
/// Map an OpenAI finish reason onto an Anthropic stop reason.
///
/// # Arguments
///  * `finish_reason` - upstream finish reason, if present
///
/// # Returns
///  * Anthropic stop reason string
pub(crate) fn map_finish_reason(finish_reason: Option<&str>) -> String {
    match finish_reason {
        Some("length") => "max_tokens",
        Some("tool_calls") => "tool_use",
        Some("content_filter") => "stop_sequence",
        _ => "end_turn",
    }
    .to_string()
}

///
/// Parse a tool call's argument string, falling back to an empty object.
pub(crate) fn parse_tool_arguments(arguments: Option<&str>) -> Value {
    arguments
        .and_then(|args| serde_json::from_str(args).ok())
        .unwrap_or_else(|| json!({}))
}
