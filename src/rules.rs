//! Bidirectional domain rewrite rules.
//!
//! A [`RuleSet`] is derived once from the [`DomainConfig`] and holds two ordered
//! rule lists, one per [`Direction`]. Every rule is a global, case-insensitive
//! substitution over the whole input. Rules run top to bottom, so when two rules
//! could claim the same substring the one declared first wins.

use crate::config::DomainConfig;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use tracing::trace;

/// Literal standing for the mirror domain inside text that must survive an
/// outbound pass.
pub const PLACEHOLDER: &str = "r-e-p-l-a-c-e.org";

/// Canonical path of the math render service.
const MATH_RENDER_PATH: &str = "/api/rest_v1/media/math/render/";

/// Rewrite direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Mirror text to canonical text (request decoration)
    Outbound,
    /// Canonical text to mirror text (response decoration)
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Outbound => f.write_str("outbound"),
            Self::Inbound => f.write_str("inbound"),
        }
    }
}

/// A single compiled rewrite rule.
#[derive(Debug, Clone)]
pub struct RewriteRule {
    /// Rule name (for logging)
    pub name: String,
    /// Direction the rule applies to
    pub direction: Direction,
    /// Compiled pattern
    pub pattern: Regex,
    /// Replacement template (`${1}` capture references allowed)
    pub replacement: String,
}

impl RewriteRule {
    fn new(
        name: impl Into<String>,
        direction: Direction,
        pattern: &str,
        replacement: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.into(),
            direction,
            pattern: Regex::new(&format!("(?i){}", pattern))?,
            replacement: replacement.into(),
        })
    }

    /// Apply the rule to the whole input.
    pub fn apply<'a>(&self, text: &'a str) -> Cow<'a, str> {
        self.pattern.replace_all(text, self.replacement.as_str())
    }
}

/// Ordered outbound and inbound rules for one domain family.
#[derive(Debug, Clone)]
pub struct RuleSet {
    mirror: String,
    outbound: Vec<RewriteRule>,
    inbound: Vec<RewriteRule>,
}

impl RuleSet {
    /// Derive the rule set from the domain configuration.
    pub fn new(domains: &DomainConfig) -> Result<Self, regex::Error> {
        let mirror = domains.mirror.trim().to_lowercase();
        let canonical = domains.canonical.trim().to_lowercase();
        let tld = domains.sub_brand_tld.trim().to_lowercase();

        let mirror_re = regex::escape(&mirror);
        let canonical_re = regex::escape(&canonical);
        let tld_re = regex::escape(&tld);

        let mut outbound = Vec::new();
        let mut inbound = Vec::new();

        // Escaped-regex literals as they appear in serialized site configuration
        let (first_label, rest) = mirror.split_once('.').unwrap_or((mirror.as_str(), ""));
        let escaped_rest = rest.replace('.', r"\.");
        let mut outbound_escaped = Vec::new();
        for brand in &domains.sub_brands {
            let brand = brand.to_lowercase();
            let mirror_literal = format!(r"\.{}\.(?:{}\.)?{}", brand, first_label, escaped_rest);
            let canonical_literal = format!(r"\.{}\.{}", brand, tld.replace('.', r"\."));
            inbound.push(RewriteRule::new(
                format!("escaped-{}", brand),
                Direction::Inbound,
                &regex::escape(&canonical_literal),
                escape_replacement(&mirror_literal),
            )?);
            outbound_escaped.push(RewriteRule::new(
                format!("escaped-{}", brand),
                Direction::Outbound,
                &regex::escape(&mirror_literal),
                escape_replacement(&canonical_literal),
            )?);
        }

        for alias in &domains.aliases {
            let label = alias.label.to_lowercase();
            let host = alias.host.to_lowercase();
            outbound.push(RewriteRule::new(
                format!("alias-{}", label),
                Direction::Outbound,
                &format!(r"\b{}\.{}", regex::escape(&label), mirror_re),
                escape_replacement(&host),
            )?);
            inbound.push(RewriteRule::new(
                format!("alias-{}", label),
                Direction::Inbound,
                &format!(r"\b{}", regex::escape(&host)),
                escape_replacement(&format!("{}.{}", label, mirror)),
            )?);
        }

        outbound.push(RewriteRule::new(
            "math-render",
            Direction::Outbound,
            &format!(r"latex-(png|svg)\.{}", mirror_re),
            format!("{}{}${{1}}", escape_replacement(&canonical), MATH_RENDER_PATH),
        )?);
        inbound.push(RewriteRule::new(
            "math-render",
            Direction::Inbound,
            &format!(
                r"{}{}(png|svg)\b",
                canonical_re,
                regex::escape(MATH_RENDER_PATH)
            ),
            format!("latex-${{1}}.{}", escape_replacement(&mirror)),
        )?);

        if !domains.sub_brands.is_empty() {
            let brands = domains
                .sub_brands
                .iter()
                .map(|b| regex::escape(&b.to_lowercase()))
                .collect::<Vec<_>>()
                .join("|");
            outbound.push(RewriteRule::new(
                "sub-brand",
                Direction::Outbound,
                &format!(r"({})\.{}", brands, mirror_re),
                format!("${{1}}.{}", escape_replacement(&tld)),
            )?);
            inbound.push(RewriteRule::new(
                "sub-brand",
                Direction::Inbound,
                &format!(r"\b({})\.{}\b", brands, tld_re),
                format!("${{1}}.{}", escape_replacement(&mirror)),
            )?);
        }

        outbound.push(RewriteRule::new(
            "root",
            Direction::Outbound,
            &mirror_re,
            escape_replacement(&canonical),
        )?);
        inbound.push(RewriteRule::new(
            "root",
            Direction::Inbound,
            &canonical_re,
            escape_replacement(&mirror),
        )?);

        outbound.extend(outbound_escaped);

        // Must stay after the root rule or the restored mirror domain would be
        // rewritten again.
        outbound.push(RewriteRule::new(
            "placeholder",
            Direction::Outbound,
            &regex::escape(PLACEHOLDER),
            escape_replacement(&mirror),
        )?);

        Ok(Self {
            mirror,
            outbound,
            inbound,
        })
    }

    /// Rewrite `text` in the given direction.
    pub fn rewrite(&self, text: &str, direction: Direction) -> String {
        let mut current = text.to_string();
        for rule in self.rules(direction) {
            let next = match rule.apply(&current) {
                Cow::Owned(next) => Some(next),
                Cow::Borrowed(_) => None,
            };
            if let Some(next) = next {
                trace!(rule = %rule.name, %direction, "Rewrite rule applied");
                current = next;
            }
        }
        current
    }

    /// Rules for one direction, in evaluation order.
    pub fn rules(&self, direction: Direction) -> &[RewriteRule] {
        match direction {
            Direction::Outbound => &self.outbound,
            Direction::Inbound => &self.inbound,
        }
    }

    /// The mirror domain the rules were derived from (lowercased).
    pub fn mirror(&self) -> &str {
        &self.mirror
    }
}

/// Escape `$` so a literal survives as a regex replacement.
fn escape_replacement(literal: &str) -> String {
    literal.replace('$', "$$")
}
