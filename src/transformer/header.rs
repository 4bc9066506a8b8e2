//! Identifying request header.

use crate::config::MirrorConfig;
use crate::context::RequestContext;
use tracing::trace;

/// Sets the identifying header on requests to the mirror family.
#[derive(Debug, Clone)]
pub struct HeaderTransformer {
    /// Header name (lowercase)
    name: String,
    /// Our value, interpolated
    value: String,
}

impl HeaderTransformer {
    /// Create a new header transformer from configuration.
    pub fn new(config: &MirrorConfig) -> Self {
        Self {
            name: config.interception.header_name.to_lowercase(),
            value: config.interpolate(&config.interception.user_agent),
        }
    }

    /// Header name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the header; an existing value is kept after ours, separated by a space.
    pub fn apply(&self, request: &mut RequestContext) {
        let merged = match request.header(&self.name) {
            Some(existing) if existing == self.value || existing.starts_with(&format!("{} ", self.value)) => {
                return;
            }
            Some(existing) if !existing.trim().is_empty() => format!("{} {}", self.value, existing),
            _ => self.value.clone(),
        };
        trace!(header = %self.name, value = %merged, "Setting identifying header");
        request.set_header(&self.name, merged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_transformer() -> HeaderTransformer {
        HeaderTransformer::new(&MirrorConfig::for_mirror("mirror.test"))
    }

    #[test]
    fn test_sets_header() {
        let transformer = make_transformer();
        let mut request = RequestContext::new("GET", "/w/api.php");
        transformer.apply(&mut request);
        assert_eq!(
            request.header("Api-User-Agent"),
            Some("MirrorRewrite/unofficial (mirror.test)")
        );
    }

    #[test]
    fn test_existing_value_appended() {
        let transformer = make_transformer();
        let mut request =
            RequestContext::new("GET", "/w/api.php").with_header("Api-User-Agent", "Gadget/1.0");
        transformer.apply(&mut request);
        assert_eq!(
            request.headers["api-user-agent"],
            vec!["MirrorRewrite/unofficial (mirror.test) Gadget/1.0".to_string()]
        );
    }

    #[test]
    fn test_apply_is_idempotent() {
        let transformer = make_transformer();
        let mut request =
            RequestContext::new("GET", "/w/api.php").with_header("api-user-agent", "Gadget/1.0");
        transformer.apply(&mut request);
        transformer.apply(&mut request);
        assert_eq!(
            request.header("api-user-agent"),
            Some("MirrorRewrite/unofficial (mirror.test) Gadget/1.0")
        );
        assert_eq!(transformer.name(), "api-user-agent");
    }
}
