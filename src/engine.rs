//! Rewrite engine: the single entry point for string rewriting.

use crate::cache::TextCache;
use crate::config::{ConfigError, MirrorConfig};
use crate::matcher::MatcherError;
use crate::rules::{Direction, RuleSet};
use tracing::{debug, info};

/// Owns one rule set and one text cache.
///
/// Outbound rewrites are memoized; inbound rewrites are computed every time.
#[derive(Debug)]
pub struct RewriteEngine {
    rules: RuleSet,
    cache: TextCache,
}

impl RewriteEngine {
    /// Build the engine for a validated configuration.
    pub fn new(config: &MirrorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let rules = RuleSet::new(&config.domains)
            .map_err(|e| ConfigError::Pattern(MatcherError::InvalidRegex(e)))?;

        info!(
            mirror = rules.mirror(),
            canonical = %config.domains.canonical,
            outbound_rules = rules.rules(Direction::Outbound).len(),
            inbound_rules = rules.rules(Direction::Inbound).len(),
            "Rewrite engine initialized"
        );

        Ok(Self {
            rules,
            cache: TextCache::new(),
        })
    }

    /// Rewrite `text` in the given direction.
    pub fn rewrite(&self, text: &str, direction: Direction) -> String {
        match direction {
            Direction::Outbound => self
                .cache
                .get_or_compute(text, direction, |s| self.rules.rewrite(s, direction)),
            Direction::Inbound => self.rules.rewrite(text, direction),
        }
    }

    /// The rule set.
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// The text cache.
    pub fn cache(&self) -> &TextCache {
        &self.cache
    }

    /// Forget every memoized rewrite.
    pub fn clear_cache(&self) {
        debug!(entries = self.cache.len(), "Clearing text cache");
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> RewriteEngine {
        RewriteEngine::new(&MirrorConfig::for_mirror("mirror.test")).unwrap()
    }

    #[test]
    fn test_outbound_is_cached() {
        let engine = engine();
        let first = engine.rewrite("https://zh.wikipedia.mirror.test/wiki/A", Direction::Outbound);
        let second = engine.rewrite("https://zh.wikipedia.mirror.test/wiki/A", Direction::Outbound);
        assert_eq!(first, "https://zh.wikipedia.org/wiki/A");
        assert_eq!(first, second);
        assert_eq!(engine.cache().misses(), 1);
        assert_eq!(engine.cache().hits(), 1);
    }

    #[test]
    fn test_inbound_bypasses_cache() {
        let engine = engine();
        let text = engine.rewrite("https://zh.wikipedia.org/wiki/A", Direction::Inbound);
        assert_eq!(text, "https://zh.wikipedia.mirror.test/wiki/A");
        assert!(engine.cache().is_empty());
    }

    #[test]
    fn test_missing_mirror_rejected() {
        let err = RewriteEngine::new(&MirrorConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingMirror));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_outbound_computed_once() {
        let engine = std::sync::Arc::new(engine());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let engine = std::sync::Arc::clone(&engine);
                tokio::spawn(async move {
                    engine.rewrite("https://zh.wikipedia.mirror.test/wiki/A", Direction::Outbound)
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), "https://zh.wikipedia.org/wiki/A");
        }
        assert_eq!(engine.cache().misses(), 1);
        assert_eq!(engine.cache().hits(), 15);
        assert_eq!(engine.cache().len(), 1);
    }

    #[test]
    fn test_clear_cache() {
        let engine = engine();
        engine.rewrite("mirror.test", Direction::Outbound);
        engine.clear_cache();
        assert!(engine.cache().is_empty());
    }
}
