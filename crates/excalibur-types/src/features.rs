//! Feature tags gating middleware applicability
//!
//! A feature set is a collection of capability tags (e.g. `tracing`,
//! `metrics`) active for a dispatch. Middleware may declare required
//! features; a middleware applies only when all of its required features
//! are present in the active set. Insertion order is irrelevant.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Well-known feature tag enabling distributed tracing middleware
pub const FEATURE_TRACING: &str = "tracing";

/// Well-known feature tag enabling metrics middleware
pub const FEATURE_METRICS: &str = "metrics";

/// An unordered set of capability tags active for a dispatch
///
/// Backed by a sorted set so that [`FeatureSet::snapshot_key`] is stable
/// regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSet {
    tags: BTreeSet<String>,
}

impl FeatureSet {
    /// Create an empty feature set
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a feature set from an iterator of tags
    pub fn from_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }

    /// Add a feature tag
    pub fn insert(&mut self, tag: impl Into<String>) {
        self.tags.insert(tag.into());
    }

    /// Remove a feature tag; returns true when it was present
    pub fn remove(&mut self, tag: &str) -> bool {
        self.tags.remove(tag)
    }

    /// Check whether a single tag is active
    pub fn contains(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Check whether every required tag is active
    pub fn contains_all<'a, I: IntoIterator<Item = &'a str>>(&self, required: I) -> bool {
        required.into_iter().all(|tag| self.tags.contains(tag))
    }

    /// Number of active tags
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// True when no tags are active
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Iterate the active tags in sorted order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(String::as_str)
    }

    /// Stable key describing this exact set, used to key pipeline caches
    ///
    /// Two sets with the same tags produce the same key regardless of how
    /// they were built.
    pub fn snapshot_key(&self) -> String {
        let mut key = String::new();
        for tag in &self.tags {
            if !key.is_empty() {
                key.push(',');
            }
            key.push_str(tag);
        }
        key
    }
}

impl<S: Into<String>> FromIterator<S> for FeatureSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::from_tags(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_all() {
        let features = FeatureSet::from_tags([FEATURE_TRACING, FEATURE_METRICS]);
        assert!(features.contains_all(["tracing"]));
        assert!(features.contains_all(["tracing", "metrics"]));
        assert!(!features.contains_all(["tracing", "audit"]));
    }

    #[test]
    fn test_snapshot_key_is_order_independent() {
        let a = FeatureSet::from_tags(["metrics", "tracing"]);
        let b = FeatureSet::from_tags(["tracing", "metrics"]);
        assert_eq!(a.snapshot_key(), b.snapshot_key());
        assert_eq!(a.snapshot_key(), "metrics,tracing");
    }

    #[test]
    fn test_empty_set_snapshot_key() {
        assert_eq!(FeatureSet::new().snapshot_key(), "");
    }
}
