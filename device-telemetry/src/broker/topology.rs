//! Exchange/queue topology and topic routing.

/// Names and binding of the measurement exchange and queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Topic exchange every emitter publishes to.
    pub exchange: String,
    /// Durable, non-exclusive queue drained by the consumer.
    pub queue: String,
    /// Binding pattern from queue to exchange.
    pub binding_key: String,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            exchange: "measurements".to_string(),
            queue: "devices".to_string(),
            binding_key: "#".to_string(),
        }
    }
}

/// Match a routing key against a topic binding pattern.
///
/// Words are separated by `.`; `*` matches exactly one word and `#` matches
/// zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&first, key_rest)) if word == "*" || word == first => match_words(rest, key_rest),
            _ => false,
        },
    }
}
