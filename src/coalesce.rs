//!
//! Duplicate-request coalescing.
//!
//! Clients occasionally fire the same request several times in quick
//! succession. Requests whose behaviourally relevant fields are identical
//! share an MD5 fingerprint; within the TTL a duplicate replays the cached
//! response bytes verbatim without touching the upstream. Streaming
//! requests are never coalesced.
//!
//! Authors:
//!   Jaro <yarenty@gmail.com>
//!
//! Copyright (c) 2026 SkyCorp

/* --- uses ------------------------------------------------------------------------------------ */

use bytes::Bytes;
use mini_moka::sync::Cache;
use serde_json::{Map, Value, json};

use crate::config::CoalesceConfig;

/* --- types ----------------------------------------------------------------------------------- */

///
/// Process-wide store of recent responses keyed by request fingerprint.
///
/// Values are the exact response bytes, so a replayed reply is
/// byte-identical to the first one. Entries expire after the configured
/// TTL; expired entries are dropped at lookup time.
pub struct RequestCoalescer {
    /** fingerprint -> cached response bytes */
    cache: Cache<String, Bytes>,
}

/* --- start of code -------------------------------------------------------------------------- */

impl RequestCoalescer {
    ///
    /// Create the coalescer from configuration.
    ///
    /// # Arguments
    ///  * `config` - TTL and capacity settings
    ///
    /// # Returns
    ///  * New coalescer instance
    pub fn new(config: &CoalesceConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_entries)
            .time_to_live(std::time::Duration::from_secs(config.ttl_secs))
            .build();

        Self { cache }
    }

    ///
    /// Look up a cached response for a fingerprint.
    ///
    /// # Arguments
    ///  * `fingerprint` - request fingerprint from [`fingerprint`]
    ///
    /// # Returns
    ///  * Cached response bytes when a live entry exists
    pub fn lookup(&self, fingerprint: &str) -> Option<Bytes> {
        self.cache.get(&fingerprint.to_string())
    }

    ///
    /// Store a response under a fingerprint.
    ///
    /// Concurrent writers may race; whichever completes last wins, which
    /// is fine because both responses answer the same request.
    ///
    /// # Arguments
    ///  * `fingerprint` - request fingerprint
    ///  * `response` - exact response bytes to replay
    pub fn store(&self, fingerprint: String, response: Bytes) {
        self.cache.insert(fingerprint, response);
    }
}

///
/// Compute the fingerprint of an incoming Anthropic request.
///
/// Only behaviourally relevant fields participate: the model, the
/// concatenated text of each user message (tool_use and tool_result parts
/// are dropped - duplicates meaningfully share only textual user input),
/// and the tools array verbatim. The canonical form is compact JSON with
/// sorted keys, hashed with MD5 and hex-encoded.
///
/// # Arguments
///  * `request` - raw request body
///
/// # Returns
///  * 32-character lowercase hex fingerprint
pub fn fingerprint(request: &Value) -> String {
    let messages = request
        .get("messages")
        .and_then(|m| m.as_array())
        .map(|messages| normalize_messages(messages))
        .unwrap_or_default();

    // serde_json's map keeps keys in sorted order, which makes this the
    // canonical sorted-keys form directly.
    let key_fields = json!({
        "model": request.get("model").cloned().unwrap_or(Value::Null),
        "messages": messages,
        "tools": request.get("tools").cloned().unwrap_or(Value::Null),
    });

    let canonical = key_fields.to_string();
    format!("{:x}", md5::compute(canonical.as_bytes()))
}

///
/// Reduce user messages to their concatenated text content.
fn normalize_messages(messages: &[Value]) -> Vec<Value> {
    let mut normalized = Vec::new();

    for message in messages {
        if message.get("role").and_then(|r| r.as_str()) != Some("user") {
            continue;
        }

        let content = match message.get("content") {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Array(parts)) => parts
                .iter()
                .filter(|part| part.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
                .collect::<String>(),
            _ => String::new(),
        };

        let mut entry = Map::new();
        entry.insert("role".to_string(), Value::String("user".to_string()));
        entry.insert("content".to_string(), Value::String(content));
        normalized.push(Value::Object(entry));
    }

    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CoalesceConfig {
        CoalesceConfig { ttl_secs: 300, max_entries: 16 }
    }

    #[test]
    fn test_identical_requests_share_fingerprint() {
        let a = json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]});
        let b = json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]});
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_different_text_changes_fingerprint() {
        let a = json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]});
        let b = json!({"model": "m", "messages": [{"role": "user", "content": "bye"}]});
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_assistant_messages_ignored() {
        let a = json!({"model": "m", "messages": [
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": "one"}
        ]});
        let b = json!({"model": "m", "messages": [
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": "two"}
        ]});
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_tool_parts_dropped_from_user_messages() {
        let a = json!({"model": "m", "messages": [{
            "role": "user",
            "content": [
                {"type": "text", "text": "question"},
                {"type": "tool_result", "tool_use_id": "t1", "content": "res-a"}
            ]
        }]});
        let b = json!({"model": "m", "messages": [{
            "role": "user",
            "content": [
                {"type": "text", "text": "question"},
                {"type": "tool_result", "tool_use_id": "t2", "content": "res-b"}
            ]
        }]});
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_tools_affect_fingerprint() {
        let a = json!({"model": "m", "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"name": "f", "input_schema": {}}]});
        let b = json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]});
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_is_md5_hex() {
        let fp = fingerprint(&json!({"model": "m", "messages": []}));
        assert_eq!(fp.len(), 32);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_store_and_replay_verbatim() {
        let coalescer = RequestCoalescer::new(&config());
        let request = json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]});
        let fp = fingerprint(&request);

        assert!(coalescer.lookup(&fp).is_none());

        let body = Bytes::from_static(b"{\"id\":\"msg_1\"}");
        coalescer.store(fp.clone(), body.clone());
        assert_eq!(coalescer.lookup(&fp), Some(body));
    }

    #[test]
    fn test_expired_entry_removed_on_lookup() {
        let coalescer = RequestCoalescer::new(&CoalesceConfig { ttl_secs: 1, max_entries: 16 });
        let fp = "abc".to_string();
        coalescer.store(fp.clone(), Bytes::from_static(b"x"));
        assert!(coalescer.lookup(&fp).is_some());
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(coalescer.lookup(&fp).is_none());
    }
}
