//! Tests for capability set matching and validation

use crate::capabilities::CapabilitySet;

#[test]
fn test_subset_matching() {
    let required = CapabilitySet::from_pairs([("pool", "default"), ("os", "linux")]);
    let bot = CapabilitySet::from_pairs([
        ("pool", "default"),
        ("os", "linux"),
        ("os", "ubuntu-22.04"),
        ("cpu", "x86-64"),
    ]);

    assert!(required.is_satisfied_by(&bot));
    // Matching is directional: the bot's full set is not required by the task.
    assert!(!bot.is_satisfied_by(&required));
}

#[test]
fn test_missing_key_does_not_match() {
    let required = CapabilitySet::from_pairs([("pool", "default"), ("gpu", "nvidia")]);
    let bot = CapabilitySet::from_pairs([("pool", "default")]);
    assert!(!required.is_satisfied_by(&bot));
}

#[test]
fn test_all_values_under_a_key_are_required() {
    let required = CapabilitySet::from_pairs([("caches", "git"), ("caches", "vpython")]);
    let bot_partial = CapabilitySet::from_pairs([("caches", "git")]);
    let bot_full = CapabilitySet::from_pairs([("caches", "git"), ("caches", "vpython")]);

    assert!(!required.is_satisfied_by(&bot_partial));
    assert!(required.is_satisfied_by(&bot_full));
}

#[test]
fn test_empty_requirement_matches_any_bot() {
    let required = CapabilitySet::new();
    let bot = CapabilitySet::from_pairs([("pool", "default")]);
    assert!(required.is_satisfied_by(&bot));
}

#[test]
fn test_single_value_helpers() {
    let set = CapabilitySet::from_pairs([("id", "bot-7"), ("pool", "ci")]);
    assert_eq!(set.bot_id(), Some("bot-7"));
    assert_eq!(set.pool(), Some("ci"));

    let multi = CapabilitySet::from_pairs([("pool", "a"), ("pool", "b")]);
    assert_eq!(multi.pool(), None);
}

#[test]
fn test_validation_rejects_bad_tokens() {
    let mut set = CapabilitySet::new();
    set.insert("pool", "ok-value");
    assert!(set.validate().is_ok());

    let mut bad_value = CapabilitySet::new();
    bad_value.insert("pool", "white space");
    assert!(bad_value.validate().is_err());

    let mut bad_key = CapabilitySet::new();
    bad_key.insert("po ol", "value");
    assert!(bad_key.validate().is_err());
}

#[test]
fn test_serialization_is_deterministic() {
    let a = CapabilitySet::from_pairs([("b", "2"), ("a", "1"), ("a", "0")]);
    let b = CapabilitySet::from_pairs([("a", "0"), ("a", "1"), ("b", "2")]);
    assert_eq!(
        serde_json::to_string(&a).unwrap(),
        serde_json::to_string(&b).unwrap()
    );
}
