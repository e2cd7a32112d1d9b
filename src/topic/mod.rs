//! Topic names, topic filters and the subscription trie
//!
//! Validation follows the MQTT topic rules (section 4.7 of both v3.1.1 and
//! v5.0). The trie stores subscriptions and retained messages side by side so
//! that publish matching and retained lookup share one structure.

pub mod trie;
pub mod validation;

pub use trie::{Leaf, MatchedSubscriber, NodeId, SubscribeOutcome, SubscriptionTrie};
pub use validation::{
    filter_within_pattern, split_levels, tokenize, tokenize_with_max_levels,
    topic_matches_filter, validate_publish_topic, validate_publish_topic_with_max_levels,
    validate_topic_filter, Levels, MAX_TOPIC_LEN,
};

/// True if the filter contains a wildcard level
pub fn is_wildcard_filter(filter: &str) -> bool {
    filter.split('/').any(|level| level == "+" || level == "#")
}
