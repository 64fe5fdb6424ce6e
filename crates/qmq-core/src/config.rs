//! Node configuration: ring sizing rules, memory budget, flush cadences.

use qmq_error::{QmqError, Result};
use serde::{Deserialize, Serialize};

/// Default ring capacity for channels without a matching prefix rule.
pub const DEFAULT_RING_CAPACITY: usize = 1024 * 1024;

/// Default interval for the memory-tier flush tick.
pub const DEFAULT_MEMORY_FLUSH_INTERVAL_MS: u64 = 250;

/// Default interval for the index rewrite tick.
pub const DEFAULT_INDEX_FLUSH_INTERVAL_SECS: u64 = 60;

/// Ring capacity override for channels whose name starts with `prefix`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixCapacity {
    pub prefix: String,
    pub capacity: usize,
}

/// Configuration of the storage engine.
///
/// The flush intervals are carried for the embedding event loop to drive;
/// the core exposes `flush`/`write_index` and keeps no timer of its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Ring capacity for channels no prefix rule matches.
    pub default_capacity: usize,
    /// Per-channel-name-prefix capacity overrides. Prefixes may not
    /// overlap (no rule's prefix may be a prefix of another's).
    pub prefix_capacities: Vec<PrefixCapacity>,
    /// Cap on the summed capacities of live memory rings. None = unbounded.
    pub memory_budget: Option<u64>,
    /// Cadence of the memory flush tick, for the embedding loop.
    pub memory_flush_interval_ms: u64,
    /// Cadence of the index rewrite tick, for the embedding loop.
    pub index_flush_interval_secs: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            default_capacity: DEFAULT_RING_CAPACITY,
            prefix_capacities: Vec::new(),
            memory_budget: None,
            memory_flush_interval_ms: DEFAULT_MEMORY_FLUSH_INTERVAL_MS,
            index_flush_interval_secs: DEFAULT_INDEX_FLUSH_INTERVAL_SECS,
        }
    }
}

impl ChannelConfig {
    /// Check the prefix rules: non-empty, unique, non-overlapping.
    pub fn validate(&self) -> Result<()> {
        for rule in &self.prefix_capacities {
            if rule.prefix.is_empty() {
                return Err(QmqError::InvalidConfig {
                    detail: "empty channel prefix".to_owned(),
                });
            }
        }
        for (index, a) in self.prefix_capacities.iter().enumerate() {
            for b in &self.prefix_capacities[index + 1..] {
                if a.prefix.starts_with(&b.prefix) || b.prefix.starts_with(&a.prefix) {
                    return Err(QmqError::InvalidConfig {
                        detail: format!(
                            "overlapping channel prefixes '{}' and '{}'",
                            a.prefix, b.prefix
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    /// Ring capacity for a channel name: the matching prefix rule wins,
    /// otherwise the default. Non-overlap makes the match unique.
    #[must_use]
    pub fn capacity_for(&self, channel: &str) -> usize {
        self.prefix_capacities
            .iter()
            .find(|rule| channel.starts_with(&rule.prefix))
            .map_or(self.default_capacity, |rule| rule.capacity)
    }
}
