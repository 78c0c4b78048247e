//! Path parameter captures.

use std::collections::BTreeMap;

use smallvec::SmallVec;

/// Parameters captured while matching a path template.
///
/// Stored inline for the common case (routes rarely declare more than a
/// couple of `{name}` segments) and exported as a sorted map when building
/// the policy input.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PathParams {
    entries: SmallVec<[(String, String); 4]>,
}

impl PathParams {
    /// Creates an empty capture set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a captured `(name, value)` pair.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Returns the value captured for `name`, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// True when nothing was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of captured parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterates over the captures in match order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Drops the most recent capture. Used to backtrack between match
    /// branches.
    pub(crate) fn pop(&mut self) {
        self.entries.pop();
    }

    /// Converts the captures into a sorted map for serialization.
    #[must_use]
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.entries.iter().cloned().collect()
    }
}
