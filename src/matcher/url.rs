//! URL pattern matching implementation.

use super::{Matcher, MatcherError};
use crate::config::{PatternType, UrlPattern};
use glob::Pattern as GlobPattern;
use regex::Regex;

/// Compiled URL matcher.
#[derive(Debug)]
pub enum UrlMatcher {
    /// Exact string match
    Exact(String),
    /// Glob pattern match
    Glob(GlobPattern),
    /// Regex pattern match (unanchored)
    Regex(Regex),
}

impl UrlMatcher {
    /// Compile a URL matcher from configuration.
    pub fn compile(config: &UrlPattern) -> Result<Self, MatcherError> {
        match config.pattern_type {
            PatternType::Exact => Ok(Self::Exact(config.pattern.clone())),
            PatternType::Glob => {
                let pattern = GlobPattern::new(&config.pattern)?;
                Ok(Self::Glob(pattern))
            }
            PatternType::Regex => {
                let regex = Regex::new(&config.pattern)?;
                Ok(Self::Regex(regex))
            }
        }
    }
}

impl Matcher for UrlMatcher {
    fn matches(&self, url: &str) -> bool {
        match self {
            Self::Exact(pattern) => url == pattern,
            Self::Glob(pattern) => pattern.matches(url),
            Self::Regex(regex) => regex.is_match(url),
        }
    }

    fn name(&self) -> &'static str {
        "url_matcher"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(pattern: &str, pattern_type: PatternType) -> UrlMatcher {
        UrlMatcher::compile(&UrlPattern {
            pattern: pattern.to_string(),
            pattern_type,
        })
        .unwrap()
    }

    #[test]
    fn test_exact_match() {
        let matcher = compile("https://example.org/beacon", PatternType::Exact);
        assert!(matcher.matches("https://example.org/beacon"));
        assert!(!matcher.matches("https://example.org/beacon/event"));
    }

    #[test]
    fn test_glob_match() {
        let matcher = compile("https://*/beacon/*", PatternType::Glob);
        assert!(matcher.matches("https://example.org/beacon/event"));
        assert!(matcher.matches("https://mirror.test/beacon/impression"));
        assert!(!matcher.matches("https://example.org/w/api.php"));
    }

    #[test]
    fn test_regex_is_unanchored() {
        let matcher = compile(r"intake-(analytics|logging)", PatternType::Regex);
        assert!(matcher.matches("https://intake-logging.wikimedia.org/v1/events"));
        assert!(!matcher.matches("https://intake.wikimedia.org/"));
        assert_eq!(matcher.name(), "url_matcher");
    }

    #[test]
    fn test_invalid_glob() {
        let result = UrlMatcher::compile(&UrlPattern {
            pattern: "[".to_string(),
            pattern_type: PatternType::Glob,
        });
        assert!(matches!(result, Err(MatcherError::InvalidGlob(_))));
    }
}
