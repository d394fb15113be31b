//!
//! Format conversion modules for Anthropic and OpenAI API compatibility.
//!
//! Handles bidirectional conversion between the Anthropic Messages dialect
//! and OpenAI Chat Completions format. Each converter focuses on a specific
//! conversion direction; `tool_text` recovers tool calls that some upstream
//! models embed in free text instead of structured `tool_calls`.
//!
//! Authors:
//!   Jaro <yarenty@gmail.com>
//!
//! Copyright (c) 2026 SkyCorp

/* --- modules --------------------------------------------------------------------------------- */

pub mod anthropic_to_openai;
pub mod openai_to_anthropic;
pub mod tool_text;

/* --- start of code -------------------------------------------------------------------------- */

pub use anthropic_to_openai::AnthropicToOpenAiConverter;
pub use openai_to_anthropic::OpenAiToAnthropicConverter;

///
/// Generate a random lowercase hex string of the given length.
///
/// Used for synthesised `msg_`, `toolu_` and `tool_` identifiers.
///
/// # Arguments
///  * `len` - number of hex characters to produce
///
/// # Returns
///  * Random hex string
pub(crate) fn random_hex(len: usize) -> String {
    use rand::Rng;

    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::rng();
    (0..len).map(|_| HEX[rng.random_range(0..HEX.len())] as char).collect()
}
