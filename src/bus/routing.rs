//! Topic-exchange routing rules.
//!
//! Routing keys and binding patterns are dot-separated words. In a binding
//! pattern `*` matches exactly one word and `#` matches zero or more words.

/// Wildcard matching exactly one word.
pub const SINGLE_WORD_WILDCARD: &str = "*";
/// Wildcard matching zero or more words.
pub const MULTI_WORD_WILDCARD: &str = "#";

/// AMQP short-string limit for routing keys and binding patterns.
pub const MAX_ROUTING_KEY_LEN: usize = 255;

/// Check whether a routing key matches a binding pattern.
///
/// Matching rules:
/// - Literal words must match exactly: "order.created" matches "order.created"
/// - `*` consumes one word: "order.*" matches "order.created", not "order"
/// - `#` consumes any number of words: "order.#" matches "order" and "order.a.b"
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&MULTI_WORD_WILDCARD, rest)) => {
            (0..=key.len()).any(|skipped| words_match(rest, &key[skipped..]))
        }
        Some((&SINGLE_WORD_WILDCARD, rest)) => !key.is_empty() && words_match(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && words_match(rest, &key[1..]),
    }
}

/// Validate a binding pattern before it is sent to the broker.
///
/// Rejects empty patterns, empty words ("order..created"), patterns longer
/// than an AMQP short string, and wildcards glued to other characters
/// ("order.creat*"), which the broker would treat as literals.
pub fn validate_pattern(pattern: &str) -> Result<(), String> {
    validate_routing_key(pattern)?;
    if pattern.split('.').any(str::is_empty) {
        return Err("contains an empty word".to_string());
    }
    if let Some(word) = pattern
        .split('.')
        .find(|w| w.len() > 1 && (w.contains('*') || w.contains('#')))
    {
        return Err(format!("wildcard must be a whole word, found '{}'", word));
    }
    Ok(())
}

/// Validate a routing key (an event type) before publishing.
///
/// Only the broker's own limits apply: non-empty and at most
/// [`MAX_ROUTING_KEY_LEN`] bytes. Any other key is sent verbatim.
pub fn validate_routing_key(routing_key: &str) -> Result<(), String> {
    if routing_key.is_empty() {
        return Err("must not be empty".to_string());
    }
    if routing_key.len() > MAX_ROUTING_KEY_LEN {
        return Err(format!(
            "longer than {} bytes ({} bytes)",
            MAX_ROUTING_KEY_LEN,
            routing_key.len()
        ));
    }
    Ok(())
}
