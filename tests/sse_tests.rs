//! Event-stream fabrication tests.
//!
//! Drives the SSE state machine over simulated upstream bodies covering
//! every shape it has to handle: true SSE text, tool-call deltas, whole
//! JSON responses, inline rate-limit lines, and premature EOF. Each test
//! checks the emitted sequence against the Anthropic event contract.

use std::convert::Infallible;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;

use anthromux::sse::{
    DONE_SENTINEL, StreamContext, run_aggregate_body, run_byte_stream, run_error_stream,
};

/// Context used by every test stream.
fn test_ctx() -> StreamContext {
    StreamContext { model: "claude-3-haiku-20240307".to_string(), input_tokens: 3, pacing: None }
}

/// Run the machine over pre-chunked upstream bytes and collect the emitted
/// payload strings.
async fn collect_stream(chunks: Vec<&str>) -> Vec<String> {
    let stream = futures::stream::iter(
        chunks
            .into_iter()
            .map(|chunk| Ok::<Bytes, Infallible>(Bytes::copy_from_slice(chunk.as_bytes())))
            .collect::<Vec<_>>(),
    );

    let (tx, mut rx) = mpsc::channel::<String>(100);
    run_byte_stream(stream, test_ctx(), tx).await;

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

/// Event type names of a collected stream, with `[DONE]` kept literal.
fn event_types(events: &[String]) -> Vec<String> {
    events
        .iter()
        .map(|event| {
            if event == DONE_SENTINEL {
                DONE_SENTINEL.to_string()
            } else {
                let value: Value = serde_json::from_str(event).expect("event is JSON");
                value["type"].as_str().expect("event has a type").to_string()
            }
        })
        .collect()
}

/// Parse every non-sentinel event.
fn parsed(events: &[String]) -> Vec<Value> {
    events
        .iter()
        .filter(|event| *event != DONE_SENTINEL)
        .map(|event| serde_json::from_str(event).unwrap())
        .collect()
}

/// Assert the universal well-formedness contract: message_start first,
/// per-index bracketing, one message_delta, one message_stop, trailing
/// [DONE], and no deltas outside their block.
fn assert_well_formed(events: &[String]) {
    let types = event_types(events);
    assert_eq!(types.first().map(String::as_str), Some("message_start"));
    assert_eq!(types.last().map(String::as_str), Some(DONE_SENTINEL));
    assert_eq!(types[types.len() - 2], "message_stop");
    assert_eq!(types[types.len() - 3], "message_delta");
    assert_eq!(types.iter().filter(|t| *t == "message_stop").count(), 1);
    assert_eq!(types.iter().filter(|t| *t == "message_delta").count(), 1);

    use std::collections::HashMap;
    let mut starts: HashMap<u64, usize> = HashMap::new();
    let mut stops: HashMap<u64, usize> = HashMap::new();
    let mut open: HashMap<u64, bool> = HashMap::new();

    for event in parsed(events) {
        let index = event.get("index").and_then(|i| i.as_u64());
        match event["type"].as_str().unwrap() {
            "content_block_start" => {
                let index = index.expect("start carries an index");
                *starts.entry(index).or_default() += 1;
                open.insert(index, true);
            }
            "content_block_delta" => {
                let index = index.expect("delta carries an index");
                assert_eq!(open.get(&index), Some(&true), "delta outside its block");
            }
            "content_block_stop" => {
                let index = index.expect("stop carries an index");
                *stops.entry(index).or_default() += 1;
                open.insert(index, false);
            }
            _ => {}
        }
    }

    assert_eq!(starts, stops, "every started block stops exactly once");
    for count in starts.values() {
        assert_eq!(*count, 1, "an index is opened exactly once");
    }
}

/// Final message_delta of a stream.
fn message_delta(events: &[String]) -> Value {
    parsed(events)
        .into_iter()
        .find(|e| e["type"] == "message_delta")
        .expect("stream has a message_delta")
}

#[tokio::test]
async fn test_streaming_text_sequence() {
    let events = collect_stream(vec![
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n",
        "data: [DONE]\n",
    ])
    .await;

    assert_eq!(
        event_types(&events),
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
            DONE_SENTINEL,
        ]
    );

    let parsed = parsed(&events);
    assert_eq!(parsed[2]["delta"]["text"], "Hel");
    assert_eq!(parsed[3]["delta"]["text"], "lo");
    assert_eq!(parsed[1]["content_block"]["type"], "text");
    assert_eq!(message_delta(&events)["delta"]["stop_reason"], "end_turn");
    assert_well_formed(&events);
}

#[tokio::test]
async fn test_streaming_tool_call_sequence() {
    let events = collect_stream(vec![
        "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"t1\",\"function\":{\"name\":\"f\"}}]}}]}\n",
        "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"x\\\":\"}}]}}]}\n",
        "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"1}\"}}]}}]}\n",
        "data: [DONE]\n",
    ])
    .await;

    let parsed = parsed(&events);
    assert_eq!(parsed[1]["type"], "content_block_start");
    assert_eq!(parsed[1]["index"], 0);
    assert_eq!(parsed[1]["content_block"]["type"], "tool_use");
    assert_eq!(parsed[1]["content_block"]["id"], "t1");
    assert_eq!(parsed[1]["content_block"]["name"], "f");
    assert_eq!(parsed[1]["content_block"]["input"], serde_json::json!({}));

    // Fragments forwarded verbatim; upstream splits mid-token.
    assert_eq!(parsed[2]["delta"]["type"], "input_json_delta");
    assert_eq!(parsed[2]["delta"]["partial_json"], "{\"x\":");
    assert_eq!(parsed[3]["delta"]["partial_json"], "1}");

    assert_eq!(message_delta(&events)["delta"]["stop_reason"], "tool_use");
    assert_well_formed(&events);
}

#[tokio::test]
async fn test_text_block_closed_before_tool_block() {
    let events = collect_stream(vec![
        "data: {\"choices\":[{\"delta\":{\"content\":\"thinking \"}}]}\n",
        "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":1,\"id\":\"t1\",\"function\":{\"name\":\"f\",\"arguments\":\"{}\"}}]}}]}\n",
        "data: [DONE]\n",
    ])
    .await;

    let types = event_types(&events);
    assert_eq!(
        types,
        vec![
            "message_start",
            "content_block_start",  // text at 0
            "content_block_delta",
            "content_block_stop",   // text closed before the tool opens
            "content_block_start",  // tool at upstream index 1
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
            DONE_SENTINEL,
        ]
    );

    let parsed = parsed(&events);
    assert_eq!(parsed[1]["index"], 0);
    assert_eq!(parsed[4]["index"], 1);
    assert_eq!(message_delta(&events)["delta"]["stop_reason"], "tool_use");
    assert_well_formed(&events);
}

#[tokio::test]
async fn test_upstream_tool_index_preserved_non_contiguous() {
    let events = collect_stream(vec![
        "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":7,\"id\":\"t7\",\"function\":{\"name\":\"f\",\"arguments\":\"{}\"}}]}}]}\n",
        "data: [DONE]\n",
    ])
    .await;

    let parsed = parsed(&events);
    assert_eq!(parsed[1]["index"], 7);
    assert_well_formed(&events);
}

#[tokio::test]
async fn test_legacy_function_call_delta() {
    let events = collect_stream(vec![
        "data: {\"choices\":[{\"delta\":{\"function_call\":{\"name\":\"legacy\"}}}]}\n",
        "data: {\"choices\":[{\"delta\":{\"function_call\":{\"arguments\":\"{\\\"a\\\":1}\"}}}]}\n",
        "data: [DONE]\n",
    ])
    .await;

    let parsed = parsed(&events);
    assert_eq!(parsed[1]["content_block"]["type"], "tool_use");
    assert_eq!(parsed[1]["content_block"]["name"], "legacy");
    assert_eq!(parsed[2]["delta"]["partial_json"], "{\"a\":1}");
    assert_eq!(message_delta(&events)["delta"]["stop_reason"], "tool_use");
    assert_well_formed(&events);
}

#[tokio::test]
async fn test_reasoning_content_deltas_forwarded() {
    let events = collect_stream(vec![
        "data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"pondering\"}}]}\n",
        "data: [DONE]\n",
    ])
    .await;

    let parsed = parsed(&events);
    assert_eq!(parsed[2]["delta"]["text"], "pondering");
    assert_well_formed(&events);
}

#[tokio::test]
async fn test_message_treated_as_single_delta() {
    let events = collect_stream(vec![
        "data: {\"choices\":[{\"message\":{\"content\":\"whole thing\"}}]}\n",
        "data: [DONE]\n",
    ])
    .await;

    let parsed = parsed(&events);
    assert_eq!(parsed[2]["delta"]["text"], "whole thing");
    assert_well_formed(&events);
}

#[tokio::test]
async fn test_chunks_split_mid_line_are_reassembled() {
    let events = collect_stream(vec![
        "data: {\"choices\":[{\"del",
        "ta\":{\"content\":\"Hel\"}}]}\ndata: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n",
        "data: [DONE]\n",
    ])
    .await;

    let parsed = parsed(&events);
    assert_eq!(parsed[2]["delta"]["text"], "Hel");
    assert_eq!(parsed[3]["delta"]["text"], "lo");
    assert_well_formed(&events);
}

#[tokio::test]
async fn test_undecodable_lines_are_dropped() {
    let events = collect_stream(vec![
        "data: {garbage\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n",
        "data: [DONE]\n",
    ])
    .await;

    let parsed = parsed(&events);
    assert_eq!(parsed[2]["delta"]["text"], "ok");
    assert_well_formed(&events);
}

#[tokio::test]
async fn test_eof_without_done_still_closes() {
    let events =
        collect_stream(vec!["data: {\"choices\":[{\"delta\":{\"content\":\"cut \"}}]}\n"]).await;

    let types = event_types(&events);
    assert_eq!(types.last().map(String::as_str), Some(DONE_SENTINEL));
    assert_well_formed(&events);
}

#[tokio::test]
async fn test_inline_rate_limit_line_short_path() {
    let events = collect_stream(vec!["{\"status\":\"449\",\"msg\":\"rate limit exceeded\"}\n"]).await;

    let types = event_types(&events);
    assert_eq!(
        types,
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
            DONE_SENTINEL,
        ]
    );

    let parsed = parsed(&events);
    let notice = parsed[2]["delta"]["text"].as_str().unwrap();
    assert!(notice.contains("rate limit exceeded"));
    assert_eq!(message_delta(&events)["delta"]["stop_reason"], "end_turn");
    assert_well_formed(&events);
}

#[tokio::test]
async fn test_mid_stream_rate_limit_payload_closes_open_blocks() {
    let events = collect_stream(vec![
        "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n",
        "data: {\"status\":\"429\",\"msg\":\"slow down\"}\n",
    ])
    .await;

    let parsed = parsed(&events);
    // The open text block at 0 is closed, then the notice goes in a new block.
    assert_eq!(parsed[3]["type"], "content_block_stop");
    assert_eq!(parsed[3]["index"], 0);
    assert_eq!(parsed[4]["type"], "content_block_start");
    assert_eq!(parsed[4]["index"], 1);
    let notice = parsed[5]["delta"]["text"].as_str().unwrap();
    assert!(notice.contains("slow down"));
    assert_well_formed(&events);
}

#[tokio::test]
async fn test_whole_json_line_takes_aggregation_path() {
    let events = collect_stream(vec![
        "{\"id\":\"chat-1\",\"choices\":[{\"message\":{\"content\":\"full answer\"},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":2,\"completion_tokens\":5}}\n",
    ])
    .await;

    let types = event_types(&events);
    assert_eq!(
        types,
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
            DONE_SENTINEL,
        ]
    );

    let parsed = parsed(&events);
    assert_eq!(parsed[2]["delta"]["text"], "full answer");
    let delta = message_delta(&events);
    assert_eq!(delta["usage"]["output_tokens"], 5);
    assert_well_formed(&events);
}

#[tokio::test]
async fn test_aggregation_with_tool_calls_preserves_indices() {
    let body = serde_json::json!({
        "id": "chat-2",
        "choices": [{
            "message": {
                "content": "calling now",
                "tool_calls": [
                    {"index": 2, "id": "c2", "function": {"name": "beta", "arguments": "{\"b\":2}"}},
                    {"index": 5, "id": "c5", "function": {"name": "gamma", "arguments": "{}"}}
                ]
            },
            "finish_reason": "tool_calls"
        }],
        "usage": {"prompt_tokens": 1, "completion_tokens": 4}
    })
    .to_string();

    let (tx, mut rx) = mpsc::channel::<String>(100);
    run_aggregate_body(&body, test_ctx(), tx).await;

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    let parsed = parsed(&events);
    // Text block takes the next free sequential index (0), tools keep 2 and 5.
    assert_eq!(parsed[1]["content_block"]["type"], "text");
    assert_eq!(parsed[1]["index"], 0);

    let tool_starts: Vec<&Value> = parsed
        .iter()
        .filter(|e| e["type"] == "content_block_start" && e["content_block"]["type"] == "tool_use")
        .collect();
    assert_eq!(tool_starts.len(), 2);
    assert_eq!(tool_starts[0]["index"], 2);
    assert_eq!(tool_starts[0]["content_block"]["name"], "beta");
    assert_eq!(tool_starts[1]["index"], 5);

    assert_eq!(message_delta(&events)["delta"]["stop_reason"], "tool_use");
    assert_well_formed(&events);
}

#[tokio::test]
async fn test_aggregation_recovers_tool_calls_from_text() {
    let body = serde_json::json!({
        "id": "chat-3",
        "choices": [{
            "message": {
                "content": "<function=tools.fetch><parameter=url>https://example.com</parameter></function>"
            },
            "finish_reason": "stop"
        }]
    })
    .to_string();

    let (tx, mut rx) = mpsc::channel::<String>(100);
    run_aggregate_body(&body, test_ctx(), tx).await;

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    let parsed = parsed(&events);
    let start = parsed
        .iter()
        .find(|e| e["type"] == "content_block_start")
        .unwrap();
    assert_eq!(start["content_block"]["type"], "tool_use");
    assert_eq!(start["content_block"]["name"], "fetch");
    assert!(start["content_block"]["id"].as_str().unwrap().starts_with("toolu_"));
    assert_eq!(message_delta(&events)["delta"]["stop_reason"], "tool_use");
    assert_well_formed(&events);
}

#[tokio::test]
async fn test_error_stream_shape() {
    let (tx, mut rx) = mpsc::channel::<String>(100);
    run_error_stream("[rate limited] slow down, please retry shortly", test_ctx(), tx).await;

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    let types = event_types(&events);
    assert_eq!(
        types,
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
            DONE_SENTINEL,
        ]
    );

    let parsed = parsed(&events);
    assert_eq!(parsed[0]["message"]["model"], "claude-3-haiku-20240307");
    assert!(parsed[2]["delta"]["text"].as_str().unwrap().contains("slow down"));
    let delta = message_delta(&events);
    assert_eq!(delta["delta"]["stop_reason"], "end_turn");
    assert!(delta["usage"]["output_tokens"].as_u64().unwrap() >= 1);
    assert_well_formed(&events);
}

#[tokio::test]
async fn test_message_start_shape() {
    let events = collect_stream(vec!["data: [DONE]\n"]).await;
    let parsed = parsed(&events);
    let start = &parsed[0];

    let id = start["message"]["id"].as_str().unwrap();
    assert!(id.starts_with("msg_"));
    assert_eq!(id.len(), "msg_".len() + 24);
    assert_eq!(start["message"]["role"], "assistant");
    assert_eq!(start["message"]["content"], serde_json::json!([]));
    assert_eq!(start["message"]["stop_reason"], Value::Null);
    assert_eq!(start["message"]["usage"]["input_tokens"], 3);
    assert_eq!(start["message"]["usage"]["output_tokens"], 0);
}

#[tokio::test]
async fn test_output_tokens_at_least_one() {
    let events = collect_stream(vec!["data: [DONE]\n"]).await;
    let delta = message_delta(&events);
    assert!(delta["usage"]["output_tokens"].as_u64().unwrap() >= 1);
}
