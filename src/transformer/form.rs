//! Form-urlencoded parameter transformer.

use super::{ContentPipeline, TransformError, Transformer};
use crate::rules::Direction;
use url::form_urlencoded;

/// Name of the parameter carrying edit tags.
const TAGS_PARAM: &str = "tags";

/// Rewrites eligible parameter values of form bodies and query strings.
#[derive(Debug, Default)]
pub struct FormTransformer;

impl FormTransformer {
    /// Create a new form transformer.
    pub fn new() -> Self {
        Self
    }

    /// Parse an urlencoded string into ordered pairs.
    pub fn parse(&self, input: &str) -> Vec<(String, String)> {
        form_urlencoded::parse(input.trim_start_matches('?').as_bytes())
            .into_owned()
            .collect()
    }

    /// Serialize ordered pairs into an urlencoded string.
    pub fn serialize(&self, pairs: &[(String, String)]) -> String {
        form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish()
    }

    /// Rewrite the values of eligible parameters in place.
    ///
    /// Returns whether any value changed.
    pub fn transform_pairs(
        &self,
        pipeline: &ContentPipeline,
        pairs: &mut [(String, String)],
        direction: Direction,
    ) -> bool {
        let mut changed = false;
        for (key, value) in pairs.iter_mut() {
            if !pipeline.fields().contains(key, direction) {
                continue;
            }
            let rewritten = pipeline.transform_leaf(value, direction);
            if rewritten != *value {
                *value = rewritten;
                changed = true;
            }
        }
        changed
    }

    /// Remove every parameter named in `names`.
    ///
    /// Returns whether any parameter was removed.
    pub fn strip(&self, pairs: &mut Vec<(String, String)>, names: &[String]) -> bool {
        let before = pairs.len();
        pairs.retain(|(key, _)| !names.iter().any(|n| n == key));
        pairs.len() != before
    }

    /// Prepend `tag` to the `tags` parameter, adding it when absent.
    pub fn merge_tag(&self, pairs: &mut Vec<(String, String)>, tag: &str) {
        match pairs.iter_mut().find(|(key, _)| key == TAGS_PARAM) {
            Some((_, value)) if value.is_empty() => *value = tag.to_string(),
            Some((_, value)) => *value = format!("{}|{}", tag, value),
            None => pairs.push((TAGS_PARAM.to_string(), tag.to_string())),
        }
    }
}

impl Transformer for FormTransformer {
    fn transform(
        &self,
        pipeline: &ContentPipeline,
        input: &str,
        direction: Direction,
    ) -> Result<String, TransformError> {
        let mut pairs = self.parse(input);
        if !self.transform_pairs(pipeline, &mut pairs, direction) {
            return Ok(input.to_string());
        }
        Ok(self.serialize(&pairs))
    }

    fn name(&self) -> &'static str {
        "form_transformer"
    }
}
