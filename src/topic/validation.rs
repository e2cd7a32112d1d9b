//! Topic tokenizer and validation
//!
//! Key rules:
//! - Topic names MUST NOT contain wildcards (+ or #)
//! - Topic filters MAY contain wildcards
//! - Multi-level wildcard (#) must occupy the whole last level
//! - Single-level wildcard (+) must occupy an entire level
//! - A leading `/` yields an empty first level, so `/a` and `a` differ
//! - Topics starting with $ are system topics and have special matching rules
//!
//! No case or encoding normalization is performed.

use smallvec::SmallVec;

use crate::error::BrokerError;

/// Maximum encoded length of a topic name or filter
pub const MAX_TOPIC_LEN: usize = 65535;

/// Topic levels in order. Typical topics fit inline without heap allocation.
pub type Levels<'a> = SmallVec<[&'a str; 8]>;

/// Split a topic into levels without validating it
#[inline]
pub fn split_levels(topic: &str) -> Levels<'_> {
    topic.split('/').collect()
}

/// Tokenize a topic filter (used in SUBSCRIBE/UNSUBSCRIBE)
pub fn tokenize(filter: &str) -> Result<Levels<'_>, BrokerError> {
    tokenize_with_max_levels(filter, 0)
}

/// Tokenize a topic filter, rejecting filters deeper than `max_topic_levels`
/// (0 = unlimited)
pub fn tokenize_with_max_levels(
    filter: &str,
    max_topic_levels: usize,
) -> Result<Levels<'_>, BrokerError> {
    check_common(filter)?;

    let levels = split_levels(filter);

    if max_topic_levels > 0 && levels.len() > max_topic_levels {
        return Err(BrokerError::InvalidTopic(
            "topic filter exceeds maximum allowed levels",
        ));
    }

    let last = levels.len() - 1;
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') {
            if *level != "#" {
                return Err(BrokerError::InvalidTopic(
                    "multi-level wildcard must occupy entire level",
                ));
            }
            if i != last {
                return Err(BrokerError::InvalidTopic(
                    "multi-level wildcard must be last level",
                ));
            }
        }

        if level.contains('+') && *level != "+" {
            return Err(BrokerError::InvalidTopic(
                "single-level wildcard must occupy entire level",
            ));
        }
    }

    Ok(levels)
}

/// Validate a topic filter without keeping its levels
pub fn validate_topic_filter(filter: &str) -> Result<(), BrokerError> {
    tokenize(filter).map(|_| ())
}

/// Validate a topic name (used in PUBLISH)
pub fn validate_publish_topic(topic: &str) -> Result<(), BrokerError> {
    validate_publish_topic_with_max_levels(topic, 0)
}

/// Validate a topic name with configurable max levels (0 = unlimited)
pub fn validate_publish_topic_with_max_levels(
    topic: &str,
    max_topic_levels: usize,
) -> Result<(), BrokerError> {
    check_common(topic)?;

    if topic.contains('+') || topic.contains('#') {
        return Err(BrokerError::InvalidTopic(
            "topic name cannot contain wildcards",
        ));
    }

    if max_topic_levels > 0 && topic.split('/').count() > max_topic_levels {
        return Err(BrokerError::InvalidTopic(
            "topic exceeds maximum allowed levels",
        ));
    }

    Ok(())
}

fn check_common(topic: &str) -> Result<(), BrokerError> {
    if topic.is_empty() {
        return Err(BrokerError::InvalidTopic("topic cannot be empty"));
    }

    if topic.len() > MAX_TOPIC_LEN {
        return Err(BrokerError::InvalidTopic("topic exceeds maximum length"));
    }

    if topic.contains('\0') {
        return Err(BrokerError::InvalidTopic(
            "topic cannot contain null character",
        ));
    }

    Ok(())
}

/// Check if a topic filter matches a topic name
///
/// Matching rules:
/// - / is the level separator
/// - + matches exactly one level
/// - # matches the parent level and any number of child levels (must be last)
/// - $-topics don't match filters starting with + or #
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let topic_levels = split_levels(topic);
    let filter_levels = split_levels(filter);

    let mut ti = 0;
    let mut fi = 0;

    while fi < filter_levels.len() {
        let filter_level = filter_levels[fi];

        if filter_level == "#" {
            return true;
        }

        if ti >= topic_levels.len() {
            return false;
        }

        if filter_level == "+" || filter_level == topic_levels[ti] {
            ti += 1;
            fi += 1;
        } else {
            return false;
        }
    }

    ti == topic_levels.len()
}

/// Check whether every topic matched by `filter` is also matched by `pattern`
///
/// Used for subscribe authorization, where the requested filter may itself
/// contain wildcards.
pub fn filter_within_pattern(filter: &str, pattern: &str) -> bool {
    if filter.starts_with('$') && (pattern.starts_with('+') || pattern.starts_with('#')) {
        return false;
    }

    let filter_levels = split_levels(filter);
    let pattern_levels = split_levels(pattern);

    for (i, p) in pattern_levels.iter().enumerate() {
        if *p == "#" {
            return true;
        }

        let Some(f) = filter_levels.get(i) else {
            return false;
        };

        match (*p, *f) {
            (_, "#") => return false,
            ("+", _) => {}
            (p, f) if p == f => {}
            _ => return false,
        }
    }

    filter_levels.len() == pattern_levels.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("test" ; "single level")]
    #[test_case("test/topic" ; "two levels")]
    #[test_case("/test/topic" ; "leading slash")]
    #[test_case("test/topic/" ; "trailing slash")]
    #[test_case("$SYS/broker" ; "system topic")]
    fn test_valid_publish_topic(topic: &str) {
        assert!(validate_publish_topic(topic).is_ok());
    }

    #[test_case("" ; "empty")]
    #[test_case("test+topic" ; "fused plus")]
    #[test_case("test#topic" ; "fused hash")]
    #[test_case("test/+/topic" ; "plus level")]
    #[test_case("test/#" ; "hash level")]
    #[test_case("a\0b" ; "null character")]
    fn test_invalid_publish_topic(topic: &str) {
        assert!(matches!(
            validate_publish_topic(topic),
            Err(BrokerError::InvalidTopic(_))
        ));
    }

    #[test_case("test", &["test"] ; "single")]
    #[test_case("a/b/c", &["a", "b", "c"] ; "three levels")]
    #[test_case("/a", &["", "a"] ; "leading slash yields empty level")]
    #[test_case("a//b", &["a", "", "b"] ; "empty middle level")]
    #[test_case("+/+/+", &["+", "+", "+"] ; "all plus")]
    #[test_case("#", &["#"] ; "bare hash")]
    #[test_case("a/+/c/#", &["a", "+", "c", "#"] ; "mixed wildcards")]
    #[test_case("$SYS/#", &["$SYS", "#"] ; "system hierarchy")]
    fn test_tokenize(filter: &str, expected: &[&str]) {
        let levels = tokenize(filter).unwrap();
        assert_eq!(levels.as_slice(), expected);
    }

    #[test_case("" ; "empty")]
    #[test_case("test+" ; "fused plus suffix")]
    #[test_case("+test" ; "fused plus prefix")]
    #[test_case("test#" ; "fused hash")]
    #[test_case("test/#/more" ; "hash not last")]
    #[test_case("#/a" ; "leading hash with more")]
    fn test_tokenize_rejects(filter: &str) {
        assert!(matches!(tokenize(filter), Err(BrokerError::InvalidTopic(_))));
    }

    #[test]
    fn test_tokenize_length_limit() {
        let long = "a".repeat(MAX_TOPIC_LEN + 1);
        assert!(tokenize(&long).is_err());
        let max = "a".repeat(MAX_TOPIC_LEN);
        assert!(tokenize(&max).is_ok());
    }

    #[test]
    fn test_tokenize_max_levels() {
        assert!(tokenize_with_max_levels("a/b/c/d/e", 0).is_ok());
        assert!(tokenize_with_max_levels("a/+/c", 3).is_ok());
        assert!(tokenize_with_max_levels("a/b/c/#", 3).is_err()); // # counts as a level
        assert!(validate_publish_topic_with_max_levels("/a/b", 3).is_ok());
        assert!(validate_publish_topic_with_max_levels("/a/b/c", 3).is_err());
    }

    #[test]
    fn test_topic_matches() {
        // Exact matches
        assert!(topic_matches_filter("test", "test"));
        assert!(topic_matches_filter("test/topic", "test/topic"));
        assert!(!topic_matches_filter("test", "test/topic"));
        assert!(!topic_matches_filter("test/topic", "test"));
        assert!(!topic_matches_filter("/a", "a"));

        // Single-level wildcard
        assert!(topic_matches_filter("a/x/c", "a/+/c"));
        assert!(!topic_matches_filter("a/x/y/c", "a/+/c"));
        assert!(!topic_matches_filter("a/c", "a/+/c"));

        // Multi-level wildcard
        assert!(topic_matches_filter("a", "a/#"));
        assert!(topic_matches_filter("a/b", "a/#"));
        assert!(topic_matches_filter("a/b/c", "a/#"));
        assert!(!topic_matches_filter("ab", "a/#"));

        // $-topics
        assert!(!topic_matches_filter("$SYS/test", "+/test"));
        assert!(!topic_matches_filter("$SYS/test", "#"));
        assert!(topic_matches_filter("$SYS/test", "$SYS/+"));
        assert!(topic_matches_filter("$SYS/test", "$SYS/#"));
    }

    #[test]
    fn test_filter_within_pattern() {
        assert!(filter_within_pattern("sensors/+/temp", "sensors/#"));
        assert!(filter_within_pattern("sensors/a/temp", "sensors/+/temp"));
        assert!(filter_within_pattern("sensors/+/temp", "sensors/+/temp"));
        assert!(!filter_within_pattern("sensors/#", "sensors/+"));
        assert!(!filter_within_pattern("#", "sensors/#"));
        assert!(!filter_within_pattern("sensors", "sensors/+"));
        assert!(filter_within_pattern("sensors", "sensors/#"));
        assert!(!filter_within_pattern("$SYS/#", "#"));
    }
}
