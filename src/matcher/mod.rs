//! URL and content-type matchers.

mod content_type;
mod url;

pub use content_type::ContentTypeFilter;
pub use url::UrlMatcher;

use crate::config::UrlPattern;

/// Trait for matching a request or response attribute.
pub trait Matcher: Send + Sync {
    /// Check if this matcher matches the subject.
    fn matches(&self, subject: &str) -> bool;

    /// Get the matcher name for debugging.
    fn name(&self) -> &'static str;
}

/// Compiled telemetry denylist: a URL is denied when any pattern matches.
#[derive(Debug, Default)]
pub struct DenyList {
    patterns: Vec<UrlMatcher>,
}

impl DenyList {
    /// Compile every configured pattern.
    pub fn compile(patterns: &[UrlPattern]) -> Result<Self, MatcherError> {
        let patterns = patterns
            .iter()
            .map(UrlMatcher::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Number of patterns.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Whether no pattern is configured.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl Matcher for DenyList {
    fn matches(&self, subject: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(subject))
    }

    fn name(&self) -> &'static str {
        "deny_list"
    }
}

/// Errors that can occur during matcher compilation.
#[derive(Debug, thiserror::Error)]
pub enum MatcherError {
    #[error("Invalid regex pattern: {0}")]
    InvalidRegex(#[from] regex::Error),

    #[error("Invalid glob pattern: {0}")]
    InvalidGlob(#[from] glob::PatternError),
}
