//! Configuration types for the mirror rewrite engine.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Regex for matching template expressions like ${...}
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").unwrap());

/// Main configuration for the rewrite engine and interceptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Configuration version
    pub version: String,
    /// Mirror and canonical domain family
    pub domains: DomainConfig,
    /// Content transform pipeline settings
    pub pipeline: PipelineSettings,
    /// Interception layer settings
    pub interception: InterceptionSettings,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            domains: DomainConfig::default(),
            pipeline: PipelineSettings::default(),
            interception: InterceptionSettings::default(),
        }
    }
}

impl MirrorConfig {
    /// Create a configuration for a mirror domain with every other setting defaulted.
    pub fn for_mirror(mirror: impl Into<String>) -> Self {
        Self {
            domains: DomainConfig {
                mirror: mirror.into(),
                ..DomainConfig::default()
            },
            ..Self::default()
        }
    }

    /// Parse a YAML configuration document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mirror = self.domains.mirror.trim();
        if mirror.is_empty() {
            return Err(ConfigError::MissingMirror);
        }
        if !mirror.contains('.') {
            return Err(ConfigError::InvalidDomain(mirror.to_string()));
        }
        if self.domains.canonical.trim().is_empty() {
            return Err(ConfigError::InvalidDomain(self.domains.canonical.clone()));
        }
        if self.pipeline.compression_level > 9 {
            return Err(ConfigError::CompressionLevel(self.pipeline.compression_level));
        }
        Ok(())
    }

    /// Interpolate `${mirror}` and `${canonical}` in a template.
    ///
    /// Other expressions (such as `${1}` capture references) are kept verbatim.
    pub fn interpolate(&self, template: &str) -> String {
        VAR_REGEX
            .replace_all(template, |caps: &regex::Captures| match &caps[1] {
                "mirror" => self.domains.mirror.clone(),
                "canonical" => self.domains.canonical.clone(),
                _ => caps[0].to_string(),
            })
            .to_string()
    }
}

/// The mirror domain and the canonical domain family it fronts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    /// Domain the mirror is served under (e.g. "mirror.test")
    pub mirror: String,
    /// Canonical root domain
    pub canonical: String,
    /// Top-level label of the sub-brand hosts (`wikipedia.org`)
    pub sub_brand_tld: String,
    /// Projects served as `<project>.<mirror>`
    pub sub_brands: Vec<String>,
    /// Service hosts that live outside the canonical family
    pub aliases: Vec<HostAlias>,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            mirror: String::new(),
            canonical: "wikimedia.org".to_string(),
            sub_brand_tld: "org".to_string(),
            sub_brands: default_sub_brands(),
            aliases: vec![
                HostAlias {
                    label: "phab".to_string(),
                    host: "phab.wmfusercontent.org".to_string(),
                },
                HostAlias {
                    label: "wma".to_string(),
                    host: "wma.wmcloud.org".to_string(),
                },
            ],
        }
    }
}

fn default_sub_brands() -> Vec<String> {
    [
        "wikibooks",
        "wikidata",
        "wikinews",
        "wikipedia",
        "wikiquote",
        "wikisource",
        "wikiversity",
        "wikivoyage",
        "wiktionary",
        "mediawiki",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// A mirror label standing for a host outside the canonical family.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostAlias {
    /// Label under the mirror domain (`phab` for `phab.<mirror>`)
    pub label: String,
    /// Canonical host the label stands for
    pub host: String,
}

/// Content transform pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Deflate level used when re-compressing blobs (0-9)
    pub compression_level: u32,
    /// Maximum body size to transform (bytes); larger bodies pass through
    pub max_body_size: usize,
    /// Request fields and parameters whose values are rewritten
    pub request_fields: Vec<String>,
    /// Response JSON fields whose values are rewritten
    pub response_fields: Vec<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            compression_level: 5,
            max_body_size: 10 * 1024 * 1024, // 10MB
            request_fields: [
                "apfrom",
                "appendtext",
                "apprefix",
                "claim",
                "content",
                "ehcontent",
                "epcontent",
                "etcontent",
                "etssummary",
                "fromtext",
                "fromtext-main",
                "html",
                "ntcontent",
                "nttopic",
                "prependtext",
                "repcontent",
                "search",
                "summary",
                "text",
                "titles",
                "totext",
                "totext-main",
                "url",
                "wikitext",
                "siteUrl",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            response_fields: [
                "*",
                "content",
                "html",
                "parsedsummary",
                "segmentedContent",
                "summary",
                "text",
                "url",
                "wikitext",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Interception layer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptionSettings {
    /// Identifying header set on requests to the mirror family
    pub header_name: String,
    /// Identifying header value (supports `${mirror}`)
    pub user_agent: String,
    /// Endpoints that are never contacted
    pub denylist: Vec<UrlPattern>,
    /// Form and query parameters removed before sending
    pub strip_params: Vec<String>,
    /// Edit tag merged into the `tags` parameter
    #[serde(default)]
    pub edit_tag: Option<EditTag>,
    /// Host/path routes tried before the host is routed by the inbound rules
    pub routes: Vec<Route>,
}

impl Default for InterceptionSettings {
    fn default() -> Self {
        Self {
            header_name: "api-user-agent".to_string(),
            user_agent: "MirrorRewrite/unofficial (${mirror})".to_string(),
            denylist: vec![UrlPattern {
                pattern: "intake-(analytics|logging)".to_string(),
                pattern_type: PatternType::Regex,
            }],
            strip_params: vec!["md5".to_string()],
            edit_tag: None,
            routes: vec![
                Route {
                    pattern: r"^xtools\.(?:wmcloud|wmflabs)\.org/api/".to_string(),
                    replacement: "xtools-api.${mirror}/".to_string(),
                    rewrite_path: true,
                },
                Route {
                    pattern: r"^wikimedia\.org/(api/rest_v1/metrics/pageviews/)".to_string(),
                    replacement: "pageviews.${mirror}/${1}".to_string(),
                    rewrite_path: true,
                },
                Route {
                    pattern: r"^recommend\.wmflabs\.org(/|$)".to_string(),
                    replacement: "recommend.${mirror}${1}".to_string(),
                    rewrite_path: false,
                },
            ],
        }
    }
}

/// URL pattern configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlPattern {
    /// The pattern to match
    pub pattern: String,
    /// Match type: exact, glob, regex
    #[serde(default = "default_pattern_type", rename = "type")]
    pub pattern_type: PatternType,
}

/// Pattern matching type.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    /// Exact string match
    Exact,
    /// Glob pattern (*, ?)
    Glob,
    /// Regular expression
    #[default]
    Regex,
}

fn default_pattern_type() -> PatternType {
    PatternType::Regex
}

/// Edit tag configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditTag {
    /// Tag value prepended to `tags`
    pub value: String,
    /// Regex over the request host selecting the wikis that accept the tag
    pub host_pattern: String,
}

/// Request URL route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    /// Regex over `host + path`
    pub pattern: String,
    /// Replacement (supports `${mirror}` and capture references)
    pub replacement: String,
    /// Rewrite the routed path from mirror to canonical form
    #[serde(default)]
    pub rewrite_path: bool,
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Mirror domain is not configured")]
    MissingMirror,

    #[error("Invalid domain: {0:?}")]
    InvalidDomain(String),

    #[error("Compression level {0} is out of range (0-9)")]
    CompressionLevel(u32),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] crate::matcher::MatcherError),
}
