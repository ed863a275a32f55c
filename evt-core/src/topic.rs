//! MQTT-style topic patterns
//!
//! Patterns are `/`-separated levels. `+` matches exactly one level and `#`
//! (only valid as the final level) matches the remaining levels, including
//! none at all, so `everest/#` matches `everest` as well.

/// Single-level wildcard
pub const SINGLE_LEVEL: &str = "+";

/// Multi-level wildcard
pub const MULTI_LEVEL: &str = "#";

/// Check that a subscription pattern is well formed
pub fn is_valid_pattern(pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }

    let levels: Vec<&str> = pattern.split('/').collect();
    let last = levels.len() - 1;

    levels.iter().enumerate().all(|(i, level)| {
        if *level == MULTI_LEVEL {
            return i == last;
        }
        if *level == SINGLE_LEVEL {
            return true;
        }
        !level.contains('+') && !level.contains('#')
    })
}

/// Check that a concrete topic (used for publishing) contains no wildcards
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(SINGLE_LEVEL) && !topic.contains(MULTI_LEVEL)
}

/// Does `topic` match subscription `pattern`?
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_levels = pattern.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (pattern_levels.next(), topic_levels.next()) {
            (Some(MULTI_LEVEL), _) => return true,
            (Some(SINGLE_LEVEL), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_literal_match() {
        assert!(topic_matches("everest/ready", "everest/ready"));
        assert!(!topic_matches("everest/ready", "everest/ready/x"));
        assert!(!topic_matches("everest/ready", "everest"));
    }

    #[test]
    fn test_single_level() {
        assert!(topic_matches("everest/+/ready", "everest/probe/ready"));
        assert!(!topic_matches("everest/+/ready", "everest/a/b/ready"));
        assert!(!topic_matches("everest/+", "everest"));
    }

    #[test]
    fn test_multi_level() {
        assert!(topic_matches("everest/#", "everest/modules/probe/ready"));
        assert!(topic_matches("everest/#", "everest"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("everest/#", "other/topic"));
    }

    #[test]
    fn test_combined_wildcards() {
        assert!(topic_matches(
            "everest/modules/+/impl/+/var/#",
            "everest/modules/evse/impl/main/var/session_event"
        ));
    }

    #[test]
    fn test_pattern_validation() {
        assert!(is_valid_pattern("a/+/c/#"));
        assert!(!is_valid_pattern("a/#/c"));
        assert!(!is_valid_pattern("a/b+/c"));
        assert!(!is_valid_pattern(""));
        assert!(is_valid_topic("a/b/c"));
        assert!(!is_valid_topic("a/+/c"));
    }

    proptest! {
        #[test]
        fn literal_topic_matches_itself(levels in prop::collection::vec("[a-z0-9_]{1,8}", 1..6)) {
            let topic = levels.join("/");
            prop_assert!(topic_matches(&topic, &topic));
            prop_assert!(topic_matches("#", &topic));
        }

        #[test]
        fn single_wildcard_replaces_any_level(
            levels in prop::collection::vec("[a-z0-9_]{1,8}", 1..6),
            idx in 0usize..6,
        ) {
            let idx = idx % levels.len();
            let topic = levels.join("/");
            let mut pattern_levels = levels.clone();
            pattern_levels[idx] = SINGLE_LEVEL.to_string();
            prop_assert!(topic_matches(&pattern_levels.join("/"), &topic));
        }
    }
}
