//! Per-path method registrations.

use http::Method;
use smallvec::SmallVec;

use crate::error::{RouterError, RouterResult};
use crate::oas::RondConfig;

/// Maps HTTP methods to their [`RondConfig`] for a single path template.
///
/// Unlike a general-purpose router, registration is fallible: the same
/// method may be declared only once per template, so that a request can
/// never match two configurations.
#[derive(Debug, Clone, Default)]
pub struct PermissionSet {
    entries: SmallVec<[(Method, RondConfig); 2]>,
}

impl PermissionSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `config` for `method`.
    ///
    /// `template` is only used for the error message; the set itself is
    /// path-agnostic.
    pub fn insert(
        &mut self,
        method: Method,
        config: RondConfig,
        template: &str,
    ) -> RouterResult<()> {
        if self.entries.iter().any(|(m, _)| *m == method) {
            return Err(RouterError::ambiguous(method.as_str(), template));
        }
        self.entries.push((method, config));
        Ok(())
    }

    /// Returns the configuration registered for `method`, if any.
    #[must_use]
    pub fn get(&self, method: &Method) -> Option<&RondConfig> {
        self.entries
            .iter()
            .find(|(m, _)| m == method)
            .map(|(_, c)| c)
    }

    /// True when no method is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Methods registered on this set, in registration order.
    pub fn methods(&self) -> impl Iterator<Item = &Method> {
        self.entries.iter().map(|(m, _)| m)
    }

    /// Iterates over all registered configurations.
    pub fn configs(&self) -> impl Iterator<Item = &RondConfig> {
        self.entries.iter().map(|(_, c)| c)
    }
}
