//!
//! Anthropic to OpenAI format converter for API request translation.
//!
//! Converts incoming Anthropic Messages requests to OpenAI-compatible chat
//! completion requests. Handles message conversion, tool calling, and
//! streaming configuration while maintaining semantic equivalence between
//! the two API formats.
//!
//! Authors:
//!   Jaro <yarenty@gmail.com>
//!
//! Copyright (c) 2026 SkyCorp

/* --- uses ------------------------------------------------------------------------------------ */

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{LogLevel, ModelMapping};
use crate::error::Result;

/* --- helper functions ----------------------------------------------------------------------- */

///
/// Custom serialization helper for tools field.
///
/// Skips serialization when tools is None or empty to avoid sending an
/// invalid empty array upstream.
///
/// # Arguments
///  * `tools` - optional tools vector
///
/// # Returns
///  * true if field should be skipped (None or empty), false otherwise
fn skip_empty_tools(tools: &Option<Vec<OpenAiTool>>) -> bool {
    match tools {
        None => true,
        Some(vec) => vec.is_empty(),
    }
}

/* --- types ----------------------------------------------------------------------------------- */

///
/// Anthropic Messages request structure.
///
/// Represents an incoming request in Anthropic's Messages API format.
/// Contains messages, model configuration, an optional system preamble,
/// and optional tool definitions.
#[derive(Debug, Deserialize)]
pub struct AnthropicRequest {
    /** the model identifier to use for completion */
    pub model: Option<String>,
    /** conversation messages array */
    pub messages: Vec<AnthropicMessage>,
    /** maximum number of tokens to generate */
    pub max_tokens: Option<u32>,
    /** system preamble prepended as a system-role message */
    pub system: Option<String>,
    /** sampling temperature for response generation */
    pub temperature: Option<f64>,
    /** nucleus sampling parameter */
    pub top_p: Option<f64>,
    /** sequences that stop generation */
    pub stop_sequences: Option<Vec<String>>,
    /** whether to stream the response */
    pub stream: Option<bool>,
    /** available tools for function calling */
    pub tools: Option<Vec<AnthropicToolDef>>,
    /** tool choice configuration, forwarded verbatim */
    pub tool_choice: Option<Value>,
}

///
/// Anthropic message structure within a Messages request.
///
/// Content is either a plain string or an ordered list of typed blocks.
#[derive(Debug, Deserialize)]
pub struct AnthropicMessage {
    /** message role: user or assistant */
    pub role: String,
    /** message content, string or structured blocks */
    pub content: AnthropicContent,
}

///
/// Anthropic content union type for flexible message content.
///
/// Supports both simple string content and structured content blocks.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum AnthropicContent {
    /** simple string content */
    String(String),
    /** structured content blocks array */
    Array(Vec<AnthropicContentBlock>),
}

///
/// Anthropic content block sum type.
///
/// Tool use blocks appear on assistant messages, tool result blocks on
/// user messages that answer them.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum AnthropicContentBlock {
    /** text content block */
    #[serde(rename = "text")]
    Text {
        /** the text content */
        text: String,
    },
    /** tool usage block for function calls */
    #[serde(rename = "tool_use")]
    ToolUse {
        /** tool call identifier */
        id: String,
        /** function name */
        name: String,
        /** function input arguments */
        input: Value,
    },
    /** tool result block for function responses */
    #[serde(rename = "tool_result")]
    ToolResult {
        /** corresponding tool use identifier */
        tool_use_id: String,
        /** tool execution result payload */
        #[serde(default)]
        content: Value,
    },
}

///
/// Anthropic tool definition for function calling.
#[derive(Debug, Deserialize)]
pub struct AnthropicToolDef {
    /** function name */
    pub name: String,
    /** function description */
    #[serde(default)]
    pub description: String,
    /** JSON schema for function input */
    #[serde(default)]
    pub input_schema: Value,
}

///
/// OpenAI chat completion request structure.
///
/// Target format for requests to the OpenAI-compatible upstream.
#[derive(Debug, Serialize)]
pub struct OpenAiRequest {
    /** upstream model identifier (after mapping) */
    pub model: String,
    /** conversation messages in OpenAI format */
    pub messages: Vec<OpenAiMessage>,
    /** maximum tokens to generate */
    pub max_tokens: u32,
    /** sampling temperature */
    pub temperature: f64,
    /** nucleus sampling parameter */
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /** stop sequences */
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    /** whether to stream the response */
    pub stream: bool,
    /** available tools in OpenAI format */
    #[serde(skip_serializing_if = "skip_empty_tools")]
    pub tools: Option<Vec<OpenAiTool>>,
    /** tool choice configuration, forwarded verbatim */
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
}

///
/// OpenAI message structure for chat conversations.
#[derive(Debug, Serialize)]
pub struct OpenAiMessage {
    /** message role: system, user, assistant, or tool */
    pub role: String,
    /** message content; null on assistant messages that only call tools */
    pub content: Option<String>,
    /** tool calls made by the assistant */
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<OpenAiToolCall>>,
    /** tool call ID on tool-role messages */
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

///
/// OpenAI tool call structure for function invocations.
#[derive(Debug, Serialize)]
pub struct OpenAiToolCall {
    /** unique identifier for this tool call */
    pub id: String,
    /** tool call type, always "function" */
    #[serde(rename = "type")]
    pub call_type: String,
    /** function call details */
    pub function: OpenAiFunctionCall,
}

///
/// OpenAI function call details within a tool call.
#[derive(Debug, Serialize)]
pub struct OpenAiFunctionCall {
    /** function name to call */
    pub name: String,
    /** function arguments as a JSON string */
    pub arguments: String,
}

///
/// OpenAI tool definition for available functions.
#[derive(Debug, Serialize)]
pub struct OpenAiTool {
    /** tool type, always "function" */
    #[serde(rename = "type")]
    pub tool_type: String,
    /** function definition and schema */
    pub function: OpenAiToolFunction,
}

///
/// OpenAI function definition within a tool.
#[derive(Debug, Serialize)]
pub struct OpenAiToolFunction {
    /** function name */
    pub name: String,
    /** function description */
    pub description: String,
    /** JSON schema for function parameters */
    pub parameters: Value,
}

///
/// Converter from Anthropic format to OpenAI format.
///
/// Handles only request-direction conversion; the model mapping table is
/// built once at construction for O(1) lookups.
pub struct AnthropicToOpenAiConverter {
    /** logging level for debug output */
    log_level: LogLevel,
    /** anthropic name -> openai name lookup */
    model_map: HashMap<String, String>,
}

/* --- constants ------------------------------------------------------------------------------ */

/** Default model forwarded upstream when the client omits one */
const DEFAULT_MODEL: &str = "gpt-4";

/** Default maximum tokens if not specified */
const DEFAULT_MAX_TOKENS: u32 = 1024;

/** Default temperature if not specified */
const DEFAULT_TEMPERATURE: f64 = 0.7;

/* --- start of code -------------------------------------------------------------------------- */

impl AnthropicToOpenAiConverter {
    ///
    /// Create a new Anthropic to OpenAI converter.
    ///
    /// # Arguments
    ///  * `log_level` - logging level for debug output
    ///  * `mappings` - ordered model name mappings from configuration
    ///
    /// # Returns
    ///  * New converter instance with the mapping table built
    pub fn new(log_level: LogLevel, mappings: &[ModelMapping]) -> Self {
        let model_map = mappings
            .iter()
            .map(|m| (m.anthropic.clone(), m.openai.clone()))
            .collect();
        Self { log_level, model_map }
    }

    ///
    /// Convert an Anthropic request to OpenAI request format.
    ///
    /// Transforms the entire request structure including messages, tools,
    /// and configuration parameters. Handles the system preamble, tool use
    /// and tool result interleaving, and multipart content.
    ///
    /// # Arguments
    ///  * `request` - Anthropic format request to convert
    ///
    /// # Returns
    ///  * Converted OpenAI format request
    ///  * `ProxyError::Conversion` if conversion fails
    pub fn convert(&self, request: AnthropicRequest) -> Result<OpenAiRequest> {
        self.debug(&format!(
            "Converting {} message(s) from Anthropic to OpenAI format",
            request.messages.len()
        ));

        let mut messages = Vec::with_capacity(request.messages.len() + 1);

        if let Some(system) = &request.system {
            messages.push(OpenAiMessage {
                role: "system".to_string(),
                content: Some(system.clone()),
                tool_calls: None,
                tool_call_id: None,
            });
        }

        for msg in &request.messages {
            messages.push(self.convert_message(msg)?);
        }

        let anthropic_model =
            request.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let model = self.map_model(&anthropic_model);

        let tools = request.tools.as_deref().map(|tools| self.convert_tools(tools));

        let openai_request = OpenAiRequest {
            model,
            messages,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: request.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            top_p: request.top_p,
            stop: request.stop_sequences.clone(),
            stream: request.stream.unwrap_or(false),
            tools,
            tool_choice: request.tool_choice.clone(),
        };

        self.debug(&format!(
            "Converted OpenAI request with {} messages",
            openai_request.messages.len()
        ));

        Ok(openai_request)
    }

    ///
    /// Resolve the upstream model name for an Anthropic model name.
    ///
    /// Unknown names pass through unchanged.
    ///
    /// # Arguments
    ///  * `anthropic_model` - model name as the client sent it
    ///
    /// # Returns
    ///  * Upstream model name
    pub fn map_model(&self, anthropic_model: &str) -> String {
        self.model_map
            .get(anthropic_model)
            .cloned()
            .unwrap_or_else(|| anthropic_model.to_string())
    }

    ///
    /// Convert a single Anthropic message to OpenAI format.
    ///
    /// Role mapping:
    /// - string content passes through; any role other than assistant is
    ///   coerced to user
    /// - assistant block lists with tool_use become content + tool_calls
    /// - user block lists with tool_result become a tool-role message
    /// - text-only block lists are concatenated
    ///
    /// # Arguments
    ///  * `msg` - Anthropic message to convert
    ///
    /// # Returns
    ///  * Converted OpenAI message
    ///  * `ProxyError::Conversion` if conversion fails
    fn convert_message(&self, msg: &AnthropicMessage) -> Result<OpenAiMessage> {
        let role = if msg.role == "assistant" { "assistant" } else { "user" };

        let blocks = match &msg.content {
            AnthropicContent::String(text) => {
                return Ok(OpenAiMessage {
                    role: role.to_string(),
                    content: Some(text.clone()),
                    tool_calls: None,
                    tool_call_id: None,
                });
            }
            AnthropicContent::Array(blocks) => blocks,
        };

        let has_tool_use =
            blocks.iter().any(|b| matches!(b, AnthropicContentBlock::ToolUse { .. }));
        let has_tool_result =
            blocks.iter().any(|b| matches!(b, AnthropicContentBlock::ToolResult { .. }));

        if has_tool_use && role == "assistant" {
            self.convert_assistant_tool_message(blocks)
        } else if has_tool_result && role == "user" {
            Ok(self.convert_tool_result_message(blocks))
        } else {
            Ok(OpenAiMessage {
                role: role.to_string(),
                content: Some(concat_text_blocks(blocks)),
                tool_calls: None,
                tool_call_id: None,
            })
        }
    }

    ///
    /// Convert an assistant message containing tool_use blocks.
    ///
    /// Text blocks are concatenated into content (null when empty); each
    /// tool_use becomes one tool_call with its input JSON-stringified,
    /// preserving source order.
    ///
    /// # Arguments
    ///  * `blocks` - content blocks of the assistant message
    ///
    /// # Returns
    ///  * OpenAI assistant message with tool_calls
    fn convert_assistant_tool_message(
        &self,
        blocks: &[AnthropicContentBlock],
    ) -> Result<OpenAiMessage> {
        let mut tool_calls = Vec::new();
        let mut text = String::new();

        for block in blocks {
            match block {
                AnthropicContentBlock::ToolUse { id, name, input } => {
                    tool_calls.push(OpenAiToolCall {
                        id: id.clone(),
                        call_type: "function".to_string(),
                        function: OpenAiFunctionCall {
                            name: name.clone(),
                            arguments: serde_json::to_string(input)?,
                        },
                    });
                }
                AnthropicContentBlock::Text { text: t } => text.push_str(t),
                AnthropicContentBlock::ToolResult { .. } => {}
            }
        }

        self.debug(&format!("Converted {} tool call(s) from assistant message", tool_calls.len()));

        Ok(OpenAiMessage {
            role: "assistant".to_string(),
            content: if text.is_empty() { None } else { Some(text) },
            tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
            tool_call_id: None,
        })
    }

    ///
    /// Convert a user message containing tool_result blocks.
    ///
    /// The message becomes a tool-role message: `tool_call_id` is the
    /// referenced tool_use id and content is the result payload (objects
    /// and lists serialised to compact JSON with non-ASCII preserved).
    /// A leading text block only supplies the content when no tool result
    /// has set it yet.
    ///
    /// # Arguments
    ///  * `blocks` - content blocks of the user message
    ///
    /// # Returns
    ///  * OpenAI tool-role message
    fn convert_tool_result_message(&self, blocks: &[AnthropicContentBlock]) -> OpenAiMessage {
        let mut tool_call_id = None;
        let mut content = String::new();

        for block in blocks {
            match block {
                AnthropicContentBlock::ToolResult { tool_use_id, content: payload } => {
                    tool_call_id = Some(tool_use_id.clone());
                    content = stringify_tool_result(payload);
                    self.debug(&format!(
                        "Converted tool result for tool_use_id: {}",
                        tool_use_id
                    ));
                }
                AnthropicContentBlock::Text { text } => {
                    if content.is_empty() {
                        content = text.clone();
                    }
                }
                AnthropicContentBlock::ToolUse { .. } => {}
            }
        }

        OpenAiMessage {
            role: "tool".to_string(),
            content: Some(content),
            tool_calls: None,
            tool_call_id,
        }
    }

    ///
    /// Convert Anthropic tool definitions to OpenAI format.
    ///
    /// `input_schema` and `parameters` carry the same JSON-Schema payload.
    ///
    /// # Arguments
    ///  * `tools` - Anthropic tool definitions
    ///
    /// # Returns
    ///  * Converted OpenAI tools
    fn convert_tools(&self, tools: &[AnthropicToolDef]) -> Vec<OpenAiTool> {
        self.debug(&format!(
            "Converting {} tool(s) from Anthropic to OpenAI format",
            tools.len()
        ));
        tools
            .iter()
            .map(|tool| OpenAiTool {
                tool_type: "function".to_string(),
                function: OpenAiToolFunction {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.input_schema.clone(),
                },
            })
            .collect()
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
/// Concatenate all text blocks of a content list.
fn concat_text_blocks(blocks: &[AnthropicContentBlock]) -> String {
    let mut text = String::new();
    for block in blocks {
        if let AnthropicContentBlock::Text { text: t } = block {
            text.push_str(t);
        }
    }
    text
}

///
/// Stringify a tool result payload for the upstream content field.
///
/// Strings pass through; objects and lists serialise to compact JSON with
/// non-ASCII preserved; other scalars stringify directly.
fn stringify_tool_result(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

///
/// Estimate the input token count of a request.
///
/// Characters divided by four over the system preamble and every message's
/// text content, with a floor of one.
///
/// # Arguments
///  * `request` - Anthropic request to estimate
///
/// # Returns
///  * Estimated input token count, at least 1
pub fn estimate_input_tokens(request: &AnthropicRequest) -> u64 {
    let mut chars = 0usize;

    for msg in &request.messages {
        match &msg.content {
            AnthropicContent::String(text) => chars += text.len(),
            AnthropicContent::Array(blocks) => {
                for block in blocks {
                    if let AnthropicContentBlock::Text { text } = block {
                        chars += text.len();
                    }
                }
            }
        }
    }

    if let Some(system) = &request.system {
        chars += system.len();
    }

    ((chars / 4) as u64).max(1)
}
