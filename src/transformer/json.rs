//! JSON body transformer.

use super::{ContentPipeline, PayloadShape, TransformError, Transformer};
use crate::rules::Direction;
use serde_json::Value as JsonValue;

/// Rewrites the string leaves of rewrite-eligible keys in a JSON document.
///
/// A string leaf is eligible when its own key, or the key of the nearest
/// enclosing container that has one, is in the direction's field set.
#[derive(Debug, Default)]
pub struct JsonTransformer;

impl JsonTransformer {
    /// Create a new JSON transformer.
    pub fn new() -> Self {
        Self
    }

    /// Rewrite eligible leaves of a parsed document in place.
    ///
    /// Returns whether any leaf changed.
    pub fn transform_value(
        &self,
        pipeline: &ContentPipeline,
        json: &mut JsonValue,
        direction: Direction,
    ) -> bool {
        walk(pipeline, json, None, false, direction)
    }
}

impl Transformer for JsonTransformer {
    fn transform(
        &self,
        pipeline: &ContentPipeline,
        input: &str,
        direction: Direction,
    ) -> Result<String, TransformError> {
        let mut json: JsonValue = serde_json::from_str(input)
            .map_err(|e| TransformError::malformed(PayloadShape::Json, e))?;

        if !self.transform_value(pipeline, &mut json, direction) {
            return Ok(input.to_string());
        }

        serde_json::to_string(&json).map_err(|e| TransformError::malformed(PayloadShape::Json, e))
    }

    fn name(&self) -> &'static str {
        "json_transformer"
    }
}

/// Walk `value`, whose own key is `key` and whose nearest keyed ancestor is
/// eligible when `ancestor` is set.
fn walk(
    pipeline: &ContentPipeline,
    value: &mut JsonValue,
    key: Option<&str>,
    ancestor: bool,
    direction: Direction,
) -> bool {
    let fields = pipeline.fields();
    match value {
        JsonValue::String(s) => {
            let eligible = ancestor || key.is_some_and(|k| fields.contains(k, direction));
            if !eligible {
                return false;
            }
            let rewritten = pipeline.transform_leaf(s, direction);
            if rewritten == *s {
                return false;
            }
            *s = rewritten;
            true
        }
        JsonValue::Array(items) => {
            let inherited = key.map_or(ancestor, |k| fields.contains(k, direction));
            let mut changed = false;
            for item in items {
                changed |= walk(pipeline, item, None, inherited, direction);
            }
            changed
        }
        JsonValue::Object(map) => {
            let inherited = key.map_or(ancestor, |k| fields.contains(k, direction));
            let mut changed = false;
            for (k, v) in map.iter_mut() {
                changed |= walk(pipeline, v, Some(k.as_str()), inherited, direction);
            }
            changed
        }
        _ => false,
    }
}
