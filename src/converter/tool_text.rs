//!
//! Tool call recovery from free-text model output.
//!
//! Some upstream models, when asked to call a function, answer with tagged
//! text instead of structured `tool_calls`. This module recognises five
//! known tag dialects and recovers structured calls from them. Matching is
//! first-dialect-wins: the first dialect that yields any call supplies the
//! result, and dialects are never mixed. When nothing matches, the text
//! stands as plain text.
//!
//! Authors:
//!   Jaro <yarenty@gmail.com>
//!
//! Copyright (c) 2026 SkyCorp

/* --- uses ------------------------------------------------------------------------------------ */

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value, json};

/* --- constants ------------------------------------------------------------------------------ */

/// Dialect 1: `<function=NAME>…<parameter=K>V</parameter>…</function>`
static FUNCTION_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<function=([^>]+)>(.*?)</function>").unwrap());

/// Parameter entries inside a dialect-1 function body
static PARAMETER_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<parameter=([^>]+)>(.*?)</parameter>").unwrap());

/// Dialect 2: `<function=execute><name=NAME</name><parameter=string>{…}</parameter></function>`
static EXECUTE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<function=execute><name=([^>]+)</name><parameter=string>([^<]+)</parameter></function>")
        .unwrap()
});

/// Dialect 3: `<tool_code>NAME(k='v', …)</tool_code>`
static TOOL_CODE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<tool_code>([^<]+)</tool_code>").unwrap());

/// Call shape inside a tool_code block
static CALL_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\w+)\s*\(([^)]*)\)").unwrap());

/// Shallow key=value pairs inside a tool_code call
static KEY_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(\w+)\s*=\s*["']([^"']*)["']"#).unwrap());

/// Dialect 4: fenced ```json block with tool_name / parameters
static JSON_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```json\s*(\{[^`]+\})\s*```").unwrap());

/// Dialect 5: bare JSON array `[{"name":…,"arguments":{…}}]`
static JSON_ARRAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\[\{"name":\s*"([^"]+)",\s*"arguments":\s*(\{[^}]+\})\}\]"#).unwrap()
});

/* --- types ----------------------------------------------------------------------------------- */

///
/// A tool call recovered from free text.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedToolCall {
    /** function name, dotted prefixes stripped */
    pub name: String,
    /** function arguments as a JSON object */
    pub arguments: Value,
}

/* --- start of code -------------------------------------------------------------------------- */

///
/// Recover tool calls embedded in model output text.
///
/// Tries the five dialects in order and returns the first dialect's matches
/// that yields any. Returns empty when nothing matches.
///
/// # Arguments
///  * `text` - model output text to scan
///
/// # Returns
///  * Recovered tool calls, possibly empty
pub fn extract_tool_calls(text: &str) -> Vec<ExtractedToolCall> {
    let extractors: &[fn(&str) -> Vec<ExtractedToolCall>] = &[
        extract_function_tags,
        extract_execute_tags,
        extract_tool_code,
        extract_json_fence,
        extract_json_array,
    ];

    for extract in extractors {
        let calls = extract(text);
        if !calls.is_empty() {
            return calls;
        }
    }

    Vec::new()
}

///
/// Dialect 1: per-parameter tags inside a named function element.
///
/// Parameter values are JSON-parsed where possible and kept as strings
/// otherwise. The `<function=execute>` wrapper with a `<name=` body belongs
/// to dialect 2 and is skipped here.
fn extract_function_tags(text: &str) -> Vec<ExtractedToolCall> {
    let mut calls = Vec::new();

    for capture in FUNCTION_TAG.captures_iter(text) {
        let raw_name = capture[1].trim();
        let body = &capture[2];

        if raw_name.is_empty() {
            continue;
        }
        if raw_name == "execute" && body.contains("<name=") {
            continue;
        }

        let mut arguments = Map::new();
        for param in PARAMETER_TAG.captures_iter(body) {
            let key = param[1].trim().to_string();
            let value = param[2].trim();
            let parsed = serde_json::from_str(value)
                .unwrap_or_else(|_| Value::String(value.to_string()));
            arguments.insert(key, parsed);
        }

        calls.push(ExtractedToolCall {
            name: normalize_name(raw_name),
            arguments: Value::Object(arguments),
        });
    }

    calls
}

///
/// Dialect 2: one JSON blob behind an `execute` wrapper.
fn extract_execute_tags(text: &str) -> Vec<ExtractedToolCall> {
    let mut calls = Vec::new();

    for capture in EXECUTE_TAG.captures_iter(text) {
        let raw_name = capture[1].trim();
        if raw_name.is_empty() {
            continue;
        }

        let arguments = serde_json::from_str(capture[2].trim()).unwrap_or_else(|_| json!({}));

        calls.push(ExtractedToolCall { name: normalize_name(raw_name), arguments });
    }

    calls
}

///
/// Dialect 3: Python-ish call syntax with shallow key=value arguments.
fn extract_tool_code(text: &str) -> Vec<ExtractedToolCall> {
    let mut calls = Vec::new();

    for capture in TOOL_CODE_TAG.captures_iter(text) {
        let call_text = capture[1].trim();
        if call_text.is_empty() {
            continue;
        }

        let Some(shape) = CALL_SHAPE.captures(call_text) else {
            continue;
        };

        let mut arguments = Map::new();
        for pair in KEY_VALUE.captures_iter(&shape[2]) {
            arguments.insert(pair[1].to_string(), Value::String(pair[2].to_string()));
        }

        calls.push(ExtractedToolCall {
            name: normalize_name(&shape[1]),
            arguments: Value::Object(arguments),
        });
    }

    calls
}

///
/// Dialect 4: fenced JSON object carrying tool_name and parameters.
fn extract_json_fence(text: &str) -> Vec<ExtractedToolCall> {
    let mut calls = Vec::new();

    for capture in JSON_FENCE.captures_iter(text) {
        let Ok(block) = serde_json::from_str::<Value>(&capture[1]) else {
            continue;
        };

        let Some(name) = block.get("tool_name").and_then(|n| n.as_str()) else {
            continue;
        };
        if name.is_empty() {
            continue;
        }

        let arguments = block.get("parameters").cloned().unwrap_or_else(|| json!({}));

        calls.push(ExtractedToolCall { name: normalize_name(name), arguments });
    }

    calls
}

///
/// Dialect 5: a bare single-element JSON array of name/arguments pairs.
fn extract_json_array(text: &str) -> Vec<ExtractedToolCall> {
    let mut calls = Vec::new();

    for capture in JSON_ARRAY.captures_iter(text) {
        let name = capture[1].trim();
        if name.is_empty() {
            continue;
        }

        let arguments = serde_json::from_str(&capture[2]).unwrap_or_else(|_| json!({}));

        calls.push(ExtractedToolCall { name: normalize_name(name), arguments });
    }

    calls
}

///
/// Strip any dotted prefix from a tool name (`x.y.z` -> `z`).
fn normalize_name(name: &str) -> String {
    name.rsplit('.').next().unwrap_or(name).to_string()
}
