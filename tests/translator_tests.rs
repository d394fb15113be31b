//! End-to-end translation tests.
//!
//! Covers the two non-streaming wire scenarios (plain text and tool call)
//! against exact expected envelopes, plus the round-trip property: a
//! text-only request pushed through the request translator, mirrored by a
//! simulated echo upstream, and pulled back through the response
//! translator preserves the user text.

use serde_json::{Value, json};

use anthromux::config::{LogLevel, ModelMapping};
use anthromux::converter::anthropic_to_openai::AnthropicRequest;
use anthromux::converter::openai_to_anthropic::OpenAiResponse;
use anthromux::converter::{AnthropicToOpenAiConverter, OpenAiToAnthropicConverter};

fn request_converter() -> AnthropicToOpenAiConverter {
    AnthropicToOpenAiConverter::new(LogLevel::Error, &[])
}

fn response_converter() -> OpenAiToAnthropicConverter {
    OpenAiToAnthropicConverter::new(LogLevel::Error)
}

fn parse_request(value: Value) -> AnthropicRequest {
    serde_json::from_value(value).unwrap()
}

fn parse_response(value: Value) -> OpenAiResponse {
    serde_json::from_value(value).unwrap()
}

#[test]
fn scenario_plain_text_non_streaming() {
    let request = parse_request(json!({
        "model": "claude-3-haiku-20240307",
        "max_tokens": 100,
        "messages": [{"role": "user", "content": "Say hi"}]
    }));
    let openai_request = request_converter().convert(request).unwrap();
    assert_eq!(openai_request.model, "claude-3-haiku-20240307");
    assert_eq!(openai_request.messages[0].content.as_deref(), Some("Say hi"));

    let upstream_reply = parse_response(json!({
        "id": "chat-abc",
        "choices": [{
            "message": {"role": "assistant", "content": "Hello."},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 3, "completion_tokens": 2}
    }));

    let response =
        response_converter().convert(upstream_reply, "claude-3-haiku-20240307").unwrap();
    let wire = serde_json::to_value(&response).unwrap();

    assert_eq!(
        wire,
        json!({
            "id": "msg_abc",
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": "Hello."}],
            "model": "claude-3-haiku-20240307",
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 3, "output_tokens": 2}
        })
    );
}

#[test]
fn scenario_tool_call_non_streaming() {
    let request = parse_request(json!({
        "model": "claude-3-haiku-20240307",
        "max_tokens": 100,
        "messages": [{"role": "user", "content": "What time is it?"}],
        "tools": [{
            "name": "get_time",
            "description": "",
            "input_schema": {"type": "object", "properties": {}}
        }]
    }));
    let openai_request = request_converter().convert(request).unwrap();
    let tools = openai_request.tools.as_ref().unwrap();
    assert_eq!(tools[0].function.name, "get_time");

    let upstream_reply = parse_response(json!({
        "id": "",
        "choices": [{
            "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "get_time", "arguments": "{}"}
                }]
            },
            "finish_reason": "tool_calls"
        }],
        "usage": {"prompt_tokens": 5, "completion_tokens": 1}
    }));

    let response =
        response_converter().convert(upstream_reply, "claude-3-haiku-20240307").unwrap();
    let wire = serde_json::to_value(&response).unwrap();

    let id = wire["id"].as_str().unwrap();
    assert!(id.starts_with("msg_"));
    assert_eq!(id.len(), "msg_".len() + 24);
    assert!(id["msg_".len()..].chars().all(|c| c.is_ascii_hexdigit()));

    assert_eq!(
        wire["content"],
        json!([{"type": "tool_use", "id": "call_1", "name": "get_time", "input": {}}])
    );
    assert_eq!(wire["stop_reason"], "tool_use");
    assert_eq!(wire["usage"], json!({"input_tokens": 5, "output_tokens": 1}));
}

/// Simulated echo upstream: answers with the concatenated user content of
/// the translated request.
fn echo_upstream(openai_request: &anthromux::converter::anthropic_to_openai::OpenAiRequest) -> OpenAiResponse {
    let echoed: String = openai_request
        .messages
        .iter()
        .filter(|m| m.role == "user")
        .filter_map(|m| m.content.as_deref())
        .collect();

    parse_response(json!({
        "id": "chat-echo",
        "choices": [{
            "message": {"role": "assistant", "content": echoed},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 1, "completion_tokens": 1}
    }))
}

#[test]
fn round_trip_preserves_user_text() {
    let cases = vec![
        json!({
            "model": "m",
            "messages": [{"role": "user", "content": "plain words"}]
        }),
        json!({
            "model": "m",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "multi "},
                {"type": "text", "text": "part"}
            ]}]
        }),
        json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "ignored"},
                {"role": "user", "content": " second"}
            ]
        }),
        json!({
            "model": "m",
            "messages": [{"role": "user", "content": "unicode: Grüße 你好"}]
        }),
    ];

    for case in cases {
        let original_text: String = case["messages"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|m| m["role"] == "user")
            .map(|m| match &m["content"] {
                Value::String(s) => s.clone(),
                Value::Array(parts) => parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect::<String>(),
                _ => String::new(),
            })
            .collect();

        let request = parse_request(case);
        let openai_request = request_converter().convert(request).unwrap();
        let upstream_reply = echo_upstream(&openai_request);
        let response = response_converter().convert(upstream_reply, "m").unwrap();

        let wire = serde_json::to_value(&response).unwrap();
        let round_tripped: String = wire["content"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|b| b["type"] == "text")
            .filter_map(|b| b["text"].as_str())
            .collect();

        assert_eq!(round_tripped, original_text);
    }
}

#[test]
fn model_mapping_applies_to_upstream_only() {
    let mappings = vec![ModelMapping {
        anthropic: "claude-3-5-sonnet-20241022".to_string(),
        openai: "gpt-4o".to_string(),
    }];
    let converter = AnthropicToOpenAiConverter::new(LogLevel::Error, &mappings);

    let request = parse_request(json!({
        "model": "claude-3-5-sonnet-20241022",
        "messages": [{"role": "user", "content": "hi"}]
    }));
    let openai_request = converter.convert(request).unwrap();
    assert_eq!(openai_request.model, "gpt-4o");

    // The response carries the client's model name, not the upstream's.
    let reply = parse_response(json!({
        "id": "chat-1",
        "model": "gpt-4o",
        "choices": [{"message": {"content": "hey"}, "finish_reason": "stop"}]
    }));
    let response = response_converter().convert(reply, "claude-3-5-sonnet-20241022").unwrap();
    let wire = serde_json::to_value(&response).unwrap();
    assert_eq!(wire["model"], "claude-3-5-sonnet-20241022");
}

#[test]
fn tool_conversation_full_cycle() {
    // assistant tool_use followed by user tool_result, as a client replays
    // a tool conversation.
    let request = parse_request(json!({
        "model": "m",
        "messages": [
            {"role": "user", "content": "What time is it in Berlin?"},
            {"role": "assistant", "content": [
                {"type": "text", "text": "Checking."},
                {"type": "tool_use", "id": "call_9", "name": "get_time", "input": {"tz": "Europe/Berlin"}}
            ]},
            {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "call_9", "content": "14:05"}
            ]}
        ]
    }));

    let openai_request = request_converter().convert(request).unwrap();
    assert_eq!(openai_request.messages.len(), 3);

    let assistant = &openai_request.messages[1];
    assert_eq!(assistant.role, "assistant");
    let calls = assistant.tool_calls.as_ref().unwrap();
    assert_eq!(calls[0].id, "call_9");
    assert_eq!(calls[0].function.arguments, r#"{"tz":"Europe/Berlin"}"#);

    let tool = &openai_request.messages[2];
    assert_eq!(tool.role, "tool");
    assert_eq!(tool.tool_call_id.as_deref(), Some("call_9"));
    assert_eq!(tool.content.as_deref(), Some("14:05"));
}

#[test]
fn malformed_messages_fail_deserialization() {
    // Items that are not objects, or that lack role/content, are rejected
    // before translation.
    assert!(
        serde_json::from_value::<AnthropicRequest>(json!({
            "model": "m",
            "messages": ["not an object"]
        }))
        .is_err()
    );

    assert!(
        serde_json::from_value::<AnthropicRequest>(json!({
            "model": "m",
            "messages": [{"content": "role is missing"}]
        }))
        .is_err()
    );

    assert!(
        serde_json::from_value::<AnthropicRequest>(json!({
            "model": "m",
            "messages": [{"role": "user"}]
        }))
        .is_err()
    );

    assert!(
        serde_json::from_value::<AnthropicRequest>(json!({
            "model": "m",
            "messages": "not an array"
        }))
        .is_err()
    );
}
