//! Request URL rewriting.

use super::ContentPipeline;
use crate::config::{ConfigError, MirrorConfig};
use crate::matcher::MatcherError;
use crate::rules::Direction;
use regex::Regex;
use tracing::{debug, trace};
use url::{ParseError, Position, Url};

/// Canonical path of the math render service.
const MATH_RENDER_PATH: &str = "/api/rest_v1/media/math/render/";

/// A compiled host/path route.
#[derive(Debug)]
struct CompiledRoute {
    pattern: Regex,
    replacement: String,
    rewrite_path: bool,
}

/// A request URL resolved against the mirror origin.
#[derive(Debug, Clone)]
pub struct ResolvedUrl {
    /// Absolute URL
    pub url: Url,
    /// Whether the input was page-relative
    pub relative: bool,
}

impl ResolvedUrl {
    /// Render back in the form the URL was given in.
    pub fn render(&self) -> String {
        if self.relative {
            self.url[Position::BeforePath..].to_string()
        } else {
            self.url.to_string()
        }
    }
}

/// Routes request URLs to the mirror host family and rewrites their query.
#[derive(Debug)]
pub struct UrlTransformer {
    origin: Url,
    mirror: String,
    routes: Vec<CompiledRoute>,
}

impl UrlTransformer {
    /// Create a URL transformer from configuration.
    pub fn new(config: &MirrorConfig) -> Result<Self, ConfigError> {
        let mirror = config.domains.mirror.trim().to_lowercase();
        let origin = Url::parse(&format!("https://{}/", mirror))
            .map_err(|_| ConfigError::InvalidDomain(mirror.clone()))?;

        let mut routes = config
            .interception
            .routes
            .iter()
            .map(|route| {
                Ok(CompiledRoute {
                    pattern: Regex::new(&route.pattern).map_err(MatcherError::from)?,
                    replacement: config.interpolate(&route.replacement),
                    rewrite_path: route.rewrite_path,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let mirror_re = regex::escape(&mirror);
        let mirror_replacement = mirror.replace('$', "$$");
        let canonical = config.domains.canonical.trim().to_lowercase();
        routes.push(CompiledRoute {
            pattern: Regex::new(&format!(
                "(?i)^{}{}(png|svg)/",
                regex::escape(&canonical),
                regex::escape(MATH_RENDER_PATH)
            ))
            .map_err(MatcherError::from)?,
            replacement: format!("latex-${{1}}.{}/", mirror_replacement),
            rewrite_path: false,
        });
        routes.push(CompiledRoute {
            pattern: Regex::new(&format!("(?i)^xtools-api\\.{}/", mirror_re))
                .map_err(MatcherError::from)?,
            replacement: format!("xtools-api.{}/", mirror_replacement),
            rewrite_path: true,
        });

        Ok(Self {
            origin,
            mirror,
            routes,
        })
    }

    /// Resolve `url` against the mirror origin.
    ///
    /// Returns `None` for unparseable URLs and non-HTTP schemes.
    pub fn resolve(&self, url: &str) -> Option<ResolvedUrl> {
        let (url, relative) = match Url::parse(url) {
            Ok(url) => (url, false),
            Err(ParseError::RelativeUrlWithoutBase) => (self.origin.join(url).ok()?, true),
            Err(_) => return None,
        };
        matches!(url.scheme(), "http" | "https").then_some(ResolvedUrl { url, relative })
    }

    /// Host of `url` once resolved against the mirror origin.
    pub fn host(&self, url: &str) -> Option<String> {
        self.resolve(url)
            .and_then(|r| r.url.host_str().map(str::to_ascii_lowercase))
    }

    /// Whether `host` is the mirror domain or one of its subdomains.
    pub fn is_mirror_family(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        host == self.mirror
            || host
                .strip_suffix(self.mirror.as_str())
                .is_some_and(|prefix| prefix.ends_with('.'))
    }

    /// Route a request host to the mirror family.
    ///
    /// Routes over `host + path` are tried first and may move the path too;
    /// otherwise only the host goes through the inbound rules.
    pub fn route(&self, pipeline: &ContentPipeline, host: &str, path: &str) -> (String, String) {
        let host_path = format!("{}{}", host, path);
        for route in &self.routes {
            if !route.pattern.is_match(&host_path) {
                continue;
            }
            trace!(route = %route.pattern, host_path, "Request route matched");
            let routed = route
                .pattern
                .replace(&host_path, route.replacement.as_str());
            let (new_host, new_path) = match routed.find('/') {
                Some(i) => routed.split_at(i),
                None => (&*routed, "/"),
            };
            let new_path = if route.rewrite_path {
                pipeline.engine().rewrite(new_path, Direction::Outbound)
            } else {
                new_path.to_string()
            };
            return (new_host.to_string(), new_path);
        }
        (
            pipeline.engine().rewrite(host, Direction::Inbound),
            path.to_string(),
        )
    }

    /// Point an absolute URL at the mirror origin host.
    pub fn pin_to_origin(&self, url: &str) -> String {
        let Some(mut resolved) = self.resolve(url) else {
            return url.to_string();
        };
        if resolved.relative || resolved.url.host_str() == self.origin.host_str() {
            return url.to_string();
        }
        if let Err(e) = resolved.url.set_host(self.origin.host_str()) {
            debug!(url, error = %e, "Cannot pin URL to origin");
            return url.to_string();
        }
        resolved.render()
    }

    /// Apply `edit` to the query parameters of `url`.
    ///
    /// The query is only re-serialized when `edit` reports a change.
    pub fn edit_query<F>(&self, url: &str, edit: F) -> String
    where
        F: FnOnce(&mut Vec<(String, String)>) -> bool,
    {
        let Some(mut resolved) = self.resolve(url) else {
            return url.to_string();
        };
        let Some(query) = resolved.url.query() else {
            return url.to_string();
        };

        let mut pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        if !edit(&mut pairs) {
            return url.to_string();
        }

        if pairs.is_empty() {
            resolved.url.set_query(None);
        } else {
            resolved.url.query_pairs_mut().clear().extend_pairs(&pairs);
        }
        resolved.render()
    }

    /// Rewrite an outgoing request URL: host routing plus eligible query values.
    pub fn rewrite(&self, pipeline: &ContentPipeline, url: &str) -> String {
        let Some(mut resolved) = self.resolve(url) else {
            return url.to_string();
        };
        let mut changed = false;

        if !resolved.relative {
            if let Some(host) = resolved.url.host_str().map(str::to_string) {
                let path = resolved.url.path().to_string();
                let (new_host, new_path) = self.route(pipeline, &host, &path);
                let host_ok = new_host == host
                    || match resolved.url.set_host(Some(&new_host)) {
                        Ok(()) => true,
                        Err(e) => {
                            debug!(host = %new_host, error = %e, "Routed host rejected");
                            false
                        }
                    };
                if host_ok {
                    changed |= new_host != host;
                    if new_path != path {
                        resolved.url.set_path(&new_path);
                        changed = true;
                    }
                }
            }
        }

        if let Some(query) = resolved.url.query() {
            let mut pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect();
            if pipeline
                .forms()
                .transform_pairs(pipeline, &mut pairs, Direction::Outbound)
            {
                resolved.url.query_pairs_mut().clear().extend_pairs(&pairs);
                changed = true;
            }
        }

        if !changed {
            return url.to_string();
        }
        let rendered = resolved.render();
        debug!(from = url, to = %rendered, "Request URL rewritten");
        rendered
    }
}
