//! Per-field merge strategies.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use super::{EntityKey, EntityKind};

/// How an incoming field value combines with the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeStrategy {
    /// Incoming value wins outright.
    Replace,
    /// Append incoming refs not already present, then stable-sort by the
    /// referenced entity's `created_at`.
    AppendDedupeSort,
    /// Incoming aggregate count wins outright.
    AggregateReplace,
}

/// Registry of merge strategies keyed by entity type and field name.
///
/// Fields without an entry use [`MergeStrategy::Replace`].
#[derive(Debug, Clone)]
pub struct TypePolicies {
    policies: HashMap<(EntityKind, String), MergeStrategy>,
}

impl TypePolicies {
    /// An empty registry: everything replaces.
    pub fn new() -> Self {
        Self {
            policies: HashMap::new(),
        }
    }

    pub fn with(mut self, kind: EntityKind, field: &str, strategy: MergeStrategy) -> Self {
        self.policies.insert((kind, field.to_string()), strategy);
        self
    }

    /// Strategy for a field, by its base name (arguments stripped).
    pub fn strategy_for(&self, kind: EntityKind, field: &str) -> MergeStrategy {
        self.policies
            .get(&(kind, field.to_string()))
            .copied()
            .unwrap_or(MergeStrategy::Replace)
    }
}

impl Default for TypePolicies {
    fn default() -> Self {
        Self::new()
            .with(EntityKind::Query, "chats", MergeStrategy::Replace)
            .with(EntityKind::Query, "messages", MergeStrategy::Replace)
            .with(EntityKind::Query, "chat", MergeStrategy::Replace)
            .with(EntityKind::Chat, "messages", MergeStrategy::AppendDedupeSort)
            .with(
                EntityKind::Chat,
                "messages_aggregate",
                MergeStrategy::AggregateReplace,
            )
    }
}

/// Merge two ordered ref lists.
///
/// Keeps every existing ref, appends incoming refs whose key is not yet in
/// the result, then stable-sorts by `created_at`. Refs without a timestamp
/// sort as the Unix epoch.
pub fn append_dedupe_sort<F>(
    existing: &[EntityKey],
    incoming: &[EntityKey],
    created_at: F,
) -> Vec<EntityKey>
where
    F: Fn(&EntityKey) -> Option<DateTime<Utc>>,
{
    let mut seen: HashSet<&EntityKey> = HashSet::with_capacity(existing.len() + incoming.len());
    let mut merged = Vec::with_capacity(existing.len() + incoming.len());

    for key in existing.iter().chain(incoming) {
        if seen.insert(key) {
            merged.push(key.clone());
        }
    }

    merged.sort_by_cached_key(|key| created_at(key).unwrap_or_default());
    merged
}
