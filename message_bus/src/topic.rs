//! Topic-exchange routing: `.`-separated words, `*` matches exactly one
//! word, `#` matches zero or more words.

pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && matches_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && matches_words(rest, &key[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_star_matches_exactly_one_word() {
        assert!(topic_matches("integration.request.*", "integration.request.moralis-tokens"));
        assert!(!topic_matches("integration.request.*", "integration.request"));
        assert!(!topic_matches("integration.request.*", "integration.request.a.b"));
        assert!(!topic_matches("integration.request.*", "integration.result.moralis-tokens"));
    }

    #[test]
    fn test_hash_matches_zero_or_more_words() {
        assert!(topic_matches("#", "aggregation.completed"));
        assert!(topic_matches("aggregation.#", "aggregation"));
        assert!(topic_matches("aggregation.#", "aggregation.status.abc"));
        assert!(topic_matches("#.completed", "aggregation.completed"));
        assert!(!topic_matches("aggregation.#", "integration.result.x"));
    }

    #[test]
    fn test_literal_key() {
        assert!(topic_matches("aggregation.requested", "aggregation.requested"));
        assert!(!topic_matches("aggregation.requested", "aggregation.requested.v2"));
    }
}
