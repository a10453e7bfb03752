//! Include/exclude path filters.
//!
//! Each filter is a regular expression with an optional sign prefix: `+` marks
//! an include pattern, `-` (or no prefix) marks an exclude pattern. Include
//! patterns take precedence when both kinds match.

use regex::Regex;

use crate::error::ConfigError;

/// Outcome of matching a path against a [`FilterSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMatch {
    /// An include pattern matched.
    Positive,
    /// An exclude pattern matched and no include pattern did.
    Negative,
    /// Nothing matched.
    None,
}

/// Compiled include and exclude patterns.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl FilterSet {
    /// Compiles the filters as written in the configuration.
    pub fn compile(filters: &[String]) -> Result<Self, ConfigError> {
        let mut set = Self::default();
        for raw in filters {
            let (positive, pattern) = match raw.strip_prefix('+') {
                Some(rest) => (true, rest),
                None => (false, raw.strip_prefix('-').unwrap_or(raw)),
            };
            if pattern.is_empty() {
                continue;
            }
            let re = Regex::new(pattern).map_err(|e| ConfigError::InvalidFilter {
                pattern: raw.clone(),
                reason: e.to_string(),
            })?;
            if positive {
                set.include.push(re);
            } else {
                set.exclude.push(re);
            }
        }
        Ok(set)
    }

    /// Returns `true` if no filters are configured.
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    /// Matches a path against the include patterns, then the exclude patterns.
    pub fn matches(&self, path: &str) -> FilterMatch {
        if self.include.iter().any(|re| re.is_match(path)) {
            FilterMatch::Positive
        } else if self.exclude.iter().any(|re| re.is_match(path)) {
            FilterMatch::Negative
        } else {
            FilterMatch::None
        }
    }

    /// Decides whether a file should go through the cache.
    pub fn allows(&self, path: &str, cache_by_default: bool) -> bool {
        match self.matches(path) {
            FilterMatch::Positive => true,
            FilterMatch::Negative => false,
            FilterMatch::None => cache_by_default,
        }
    }
}
