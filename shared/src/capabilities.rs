//! Capability sets advertised by bots and required by task slices
//!
//! A capability set is a multi-valued map: each key (e.g. `os`, `pool`)
//! carries a set of string values. A bot advertises the full set of values it
//! supports; a task slice requires a subset of them. Matching is pure subset
//! containment, there is no wildcarding.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Capability key reserved for pinning a task to a single bot.
pub const KEY_BOT_ID: &str = "id";

/// Capability key naming the pool a task is scheduled into.
pub const KEY_POOL: &str = "pool";

/// Maximum number of distinct capability keys accepted per set.
const MAX_KEYS: usize = 32;

/// Maximum number of values accepted per capability key.
const MAX_VALUES_PER_KEY: usize = 16;

/// A multi-valued key/value capability map.
///
/// BTree containers keep the serialized form deterministic, which matters
/// because capability sets participate in the idempotency properties hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(pub BTreeMap<String, BTreeSet<String>>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Adds one value under a key, creating the key as needed.
    pub fn insert(&mut self, key: &str, value: &str) {
        self.0
            .entry(key.to_string())
            .or_default()
            .insert(value.to_string());
    }

    /// Builds a set from `(key, value)` pairs. Convenient in tests and when
    /// assembling synthetic requests.
    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut set = Self::new();
        for (k, v) in pairs {
            set.insert(k, v);
        }
        set
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the single value under `key`, if there is exactly one.
    pub fn single_value(&self, key: &str) -> Option<&str> {
        let values = self.0.get(key)?;
        if values.len() == 1 {
            values.iter().next().map(|s| s.as_str())
        } else {
            None
        }
    }

    /// Returns the bot id this set pins to, if any.
    pub fn bot_id(&self) -> Option<&str> {
        self.single_value(KEY_BOT_ID)
    }

    /// Returns the pool this set names, if any.
    pub fn pool(&self) -> Option<&str> {
        self.single_value(KEY_POOL)
    }

    /// True when every required key/value of `self` is advertised by `bot`.
    ///
    /// This is the scheduler's matching primitive: a queue entry is eligible
    /// for a bot iff the slice's capability set is satisfied by the bot's.
    pub fn is_satisfied_by(&self, bot: &CapabilitySet) -> bool {
        self.0.iter().all(|(key, required)| {
            bot.0
                .get(key)
                .map(|advertised| required.is_subset(advertised))
                .unwrap_or(false)
        })
    }

    /// Validates the shape of a capability set supplied by a client or bot.
    ///
    /// Keys and values are restricted to a conservative character set so they
    /// can be logged and embedded in provider requests verbatim.
    pub fn validate(&self) -> crate::Result<()> {
        if self.0.len() > MAX_KEYS {
            anyhow::bail!(
                "Capability set has {} keys (max {})",
                self.0.len(),
                MAX_KEYS
            );
        }
        for (key, values) in &self.0 {
            validate_token(key, "capability key")?;
            if values.is_empty() {
                anyhow::bail!("Capability key '{}' has no values", key);
            }
            if values.len() > MAX_VALUES_PER_KEY {
                anyhow::bail!(
                    "Capability key '{}' has {} values (max {})",
                    key,
                    values.len(),
                    MAX_VALUES_PER_KEY
                );
            }
            for value in values {
                validate_token(value, "capability value")?;
            }
        }
        Ok(())
    }
}

/// Checks a single capability token: non-empty, bounded, printable subset.
fn validate_token(token: &str, what: &str) -> crate::Result<()> {
    if token.is_empty() {
        anyhow::bail!("Empty {}", what);
    }
    if token.len() > 128 {
        anyhow::bail!("{} too long: {} characters (max 128)", what, token.len());
    }
    if !token
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '/'))
    {
        anyhow::bail!("Invalid character in {} '{}'", what, token);
    }
    Ok(())
}
