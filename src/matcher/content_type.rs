//! Rewritable content-type filter.

use super::Matcher;
use regex::Regex;
use std::sync::LazyLock;

/// Content types whose bodies carry rewritable text
static REWRITABLE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)json|text|xml").unwrap());

/// Text content types that are code and stay untouched
static EXCLUDED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)css|(ecma|java)script").unwrap());

/// Decides whether a response body may be rewritten from its content type.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContentTypeFilter;

impl ContentTypeFilter {
    /// Check an optional `content-type` header value; a missing value is not
    /// rewritable.
    pub fn is_rewritable(&self, content_type: Option<&str>) -> bool {
        content_type.is_some_and(|ct| self.matches(ct))
    }
}

impl Matcher for ContentTypeFilter {
    fn matches(&self, content_type: &str) -> bool {
        REWRITABLE.is_match(content_type) && !EXCLUDED.is_match(content_type)
    }

    fn name(&self) -> &'static str {
        "content_type_filter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewritable_types() {
        let filter = ContentTypeFilter;
        assert!(filter.matches("application/json; charset=utf-8"));
        assert!(filter.matches("text/html"));
        assert!(filter.matches("application/rss+xml"));
        assert!(filter.matches("TEXT/PLAIN"));
    }

    #[test]
    fn test_code_types_excluded() {
        let filter = ContentTypeFilter;
        assert!(!filter.matches("text/css"));
        assert!(!filter.matches("text/javascript"));
        assert!(!filter.matches("application/ecmascript"));
    }

    #[test]
    fn test_binary_and_missing() {
        let filter = ContentTypeFilter;
        assert!(!filter.matches("image/png"));
        assert!(!filter.is_rewritable(None));
        assert!(filter.is_rewritable(Some("application/json")));
    }
}
