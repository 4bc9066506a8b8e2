//! Payload-shape-aware content transforms.
//!
//! The [`ContentPipeline`] decides once per call which [`PayloadShape`] a body
//! has and hands it to the matching [`Transformer`]. Every transformer rewrites
//! leaf strings only and leaves the surrounding structure intact.

mod compressed;
mod form;
mod header;
mod json;
mod markup;
mod url;

pub use compressed::{BlobTransformer, BLOB_PREFIX};
pub use form::FormTransformer;
pub use header::HeaderTransformer;
pub use json::JsonTransformer;
pub use markup::{MarkupMode, MarkupTransformer};
pub use url::UrlTransformer;

use crate::config::{ConfigError, MirrorConfig};
use crate::context::{Body, RequestContext, ResponseContext};
use crate::engine::RewriteEngine;
use crate::rules::Direction;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Number of leading bytes inspected when the content type is inconclusive.
const PEEK_LEN: usize = 512;

/// Trait for shape-specific body transformers.
pub trait Transformer: Send + Sync {
    /// Rewrite `input`, calling back into the pipeline for leaf strings.
    fn transform(
        &self,
        pipeline: &ContentPipeline,
        input: &str,
        direction: Direction,
    ) -> Result<String, TransformError>;

    /// Get the transformer name for debugging.
    fn name(&self) -> &'static str;
}

/// Shape of a payload, decided from its content type and a bounded peek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    /// Free text
    PlainText,
    /// JSON document
    Json,
    /// HTML document or fragment
    Html,
    /// XML document (RSS, Atom, API XML)
    Xml,
    /// `rawdeflate,`-prefixed base64 blob
    CompressedBlob,
    /// `application/x-www-form-urlencoded` parameters
    Form,
}

impl PayloadShape {
    /// Decide the shape of `body` declared as `content_type`.
    pub fn detect(content_type: Option<&str>, body: &str) -> Self {
        let peek = peek(body);
        if peek.starts_with(BLOB_PREFIX) {
            return Self::CompressedBlob;
        }

        if let Some(ct) = content_type.map(str::to_ascii_lowercase) {
            if ct.contains("x-www-form-urlencoded") {
                return Self::Form;
            }
            if ct.contains("json") {
                return Self::Json;
            }
            if ct.contains("html") {
                return Self::Html;
            }
            if ct.contains("xml") {
                return Self::Xml;
            }
            if ct.starts_with("text/") {
                return Self::PlainText;
            }
        }

        Self::sniff(peek)
    }

    fn sniff(peek: &str) -> Self {
        if peek.starts_with('{') || peek.starts_with('[') {
            return Self::Json;
        }
        if peek.starts_with('<') {
            let lower = peek.to_ascii_lowercase();
            if lower.starts_with("<?xml") && !lower.contains("<!doctype html") && !lower.contains("<html")
            {
                return Self::Xml;
            }
            return Self::Html;
        }
        if looks_like_form(peek) {
            return Self::Form;
        }
        Self::PlainText
    }
}

impl fmt::Display for PayloadShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PlainText => "plain text",
            Self::Json => "json",
            Self::Html => "html",
            Self::Xml => "xml",
            Self::CompressedBlob => "compressed blob",
            Self::Form => "form",
        };
        f.write_str(name)
    }
}

/// Leading slice of `body` without surrounding whitespace, cut on a char boundary.
fn peek(body: &str) -> &str {
    let trimmed = body.trim_start_matches(['\u{feff}', ' ', '\t', '\r', '\n']);
    let mut end = trimmed.len().min(PEEK_LEN);
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    &trimmed[..end]
}

fn looks_like_form(peek: &str) -> bool {
    !peek.is_empty()
        && !peek.contains(char::is_whitespace)
        && peek
            .split('&')
            .all(|pair| pair.split_once('=').is_some_and(|(k, _)| !k.is_empty()))
}

/// Whether a leaf string is an HTML fragment.
fn is_html_fragment(text: &str) -> bool {
    let text = text.trim();
    text.len() > 1 && text.starts_with('<') && text.ends_with('>')
}

/// Field names eligible for rewriting, per direction.
#[derive(Debug, Clone)]
pub struct FieldSets {
    request: HashSet<String>,
    response: HashSet<String>,
}

impl FieldSets {
    /// Build from the configured request and response field lists.
    pub fn new(request: &[String], response: &[String]) -> Self {
        Self {
            request: request.iter().cloned().collect(),
            response: response.iter().cloned().collect(),
        }
    }

    /// Whether `key` is eligible in `direction`.
    pub fn contains(&self, key: &str, direction: Direction) -> bool {
        match direction {
            Direction::Outbound => self.request.contains(key),
            Direction::Inbound => self.response.contains(key),
        }
    }
}

/// Content transform pipeline.
pub struct ContentPipeline {
    engine: Arc<RewriteEngine>,
    fields: FieldSets,
    max_body_size: usize,
    json: JsonTransformer,
    markup_html: MarkupTransformer,
    markup_xml: MarkupTransformer,
    blob: BlobTransformer,
    form: FormTransformer,
    url: UrlTransformer,
}

impl ContentPipeline {
    /// Build a pipeline with its own engine.
    pub fn new(config: &MirrorConfig) -> Result<Self, ConfigError> {
        let engine = Arc::new(RewriteEngine::new(config)?);
        Self::with_engine(engine, config)
    }

    /// Build a pipeline around an existing engine.
    pub fn with_engine(
        engine: Arc<RewriteEngine>,
        config: &MirrorConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let pipeline = &config.pipeline;

        Ok(Self {
            engine,
            fields: FieldSets::new(&pipeline.request_fields, &pipeline.response_fields),
            max_body_size: pipeline.max_body_size,
            json: JsonTransformer::new(),
            markup_html: MarkupTransformer::new(MarkupMode::Html),
            markup_xml: MarkupTransformer::new(MarkupMode::Xml),
            blob: BlobTransformer::new(pipeline.compression_level),
            form: FormTransformer::new(),
            url: UrlTransformer::new(config)?,
        })
    }

    /// The rewrite engine.
    pub fn engine(&self) -> &RewriteEngine {
        &self.engine
    }

    /// The URL transformer.
    pub fn urls(&self) -> &UrlTransformer {
        &self.url
    }

    /// The form transformer.
    pub fn forms(&self) -> &FormTransformer {
        &self.form
    }

    /// Rewrite-eligible field sets.
    pub fn fields(&self) -> &FieldSets {
        &self.fields
    }

    /// Rewrite an outgoing request: URL routing, query parameters and body.
    pub fn transform_outbound(&self, mut request: RequestContext) -> RequestContext {
        request.url = self.url.rewrite(self, &request.url);

        let content_type = request.content_type().map(str::to_string);
        request.body = match request.body {
            body if body.len() > self.max_body_size => {
                debug!(
                    url = %request.url,
                    size = body.len(),
                    "Request body exceeds max size, passing through"
                );
                body
            }
            Body::Text(text) => Body::Text(self.transform_body(
                &text,
                content_type.as_deref(),
                Direction::Outbound,
            )),
            Body::Form(mut pairs) => {
                self.form
                    .transform_pairs(self, &mut pairs, Direction::Outbound);
                Body::Form(pairs)
            }
            other => other,
        };

        request
    }

    /// Rewrite an incoming response body.
    pub fn transform_inbound(&self, mut response: ResponseContext) -> ResponseContext {
        if response.body.len() > self.max_body_size {
            debug!(
                url = %response.url,
                size = response.body.len(),
                "Response body exceeds max size, passing through"
            );
            return response;
        }

        let content_type = response.content_type().map(str::to_string);
        response.body =
            self.transform_body(&response.body, content_type.as_deref(), Direction::Inbound);
        response
    }

    /// Rewrite a whole body of the given content type.
    pub fn transform_body(
        &self,
        body: &str,
        content_type: Option<&str>,
        direction: Direction,
    ) -> String {
        if body.trim().is_empty() {
            return body.to_string();
        }

        let shape = PayloadShape::detect(content_type, body);
        trace!(%shape, %direction, size = body.len(), "Transforming body");

        let transformer: &dyn Transformer = match shape {
            PayloadShape::PlainText => return self.engine.rewrite(body, direction),
            PayloadShape::Json => &self.json,
            PayloadShape::Html => &self.markup_html,
            PayloadShape::Xml => &self.markup_xml,
            PayloadShape::CompressedBlob => &self.blob,
            PayloadShape::Form => &self.form,
        };

        match transformer.transform(self, body, direction) {
            Ok(rewritten) => rewritten,
            Err(e) => self.recover(e, body, direction),
        }
    }

    /// Rewrite a single JSON or form leaf.
    ///
    /// Compressed blobs are inflated first; everything else, markup included,
    /// goes through the rule set as a whole.
    pub fn transform_leaf(&self, text: &str, direction: Direction) -> String {
        if !text.starts_with(BLOB_PREFIX) {
            return self.engine.rewrite(text, direction);
        }
        self.blob
            .transform(self, text, direction)
            .unwrap_or_else(|e| self.recover(e, text, direction))
    }

    /// Rewrite a variant-island leaf: HTML fragments keep their markup structure.
    pub(crate) fn transform_fragment(&self, text: &str, direction: Direction) -> String {
        if !is_html_fragment(text) {
            return self.transform_leaf(text, direction);
        }
        self.markup_html
            .transform(self, text, direction)
            .unwrap_or_else(|e| self.recover(e, text, direction))
    }

    fn recover(&self, error: TransformError, input: &str, direction: Direction) -> String {
        match error {
            TransformError::MalformedPayload { .. } => {
                debug!(error = %error, "Falling back to plain text rewrite");
                self.engine.rewrite(input, direction)
            }
            TransformError::UnsupportedCompression(_) => {
                warn!(error = %error, "Leaving compressed blob untouched");
                input.to_string()
            }
        }
    }
}

/// Transform errors. Both kinds are recovered inside the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("Malformed {shape} payload: {reason}")]
    MalformedPayload { shape: PayloadShape, reason: String },

    #[error("Unsupported compression: {0}")]
    UnsupportedCompression(String),
}

impl TransformError {
    pub(crate) fn malformed(shape: PayloadShape, reason: impl fmt::Display) -> Self {
        Self::MalformedPayload {
            shape,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_pipeline() -> ContentPipeline {
        ContentPipeline::new(&MirrorConfig::for_mirror("mirror.test")).unwrap()
    }

    #[test]
    fn test_detect_by_content_type() {
        assert_eq!(
            PayloadShape::detect(Some("application/json; charset=utf-8"), "x"),
            PayloadShape::Json
        );
        assert_eq!(PayloadShape::detect(Some("text/html"), "x"), PayloadShape::Html);
        assert_eq!(
            PayloadShape::detect(Some("application/rss+xml"), "x"),
            PayloadShape::Xml
        );
        assert_eq!(
            PayloadShape::detect(Some("application/x-www-form-urlencoded"), "a=b"),
            PayloadShape::Form
        );
        assert_eq!(
            PayloadShape::detect(Some("text/plain"), "{\"a\":1}"),
            PayloadShape::PlainText
        );
    }

    #[test]
    fn test_detect_by_peek() {
        assert_eq!(PayloadShape::detect(None, "  {\"a\":1}"), PayloadShape::Json);
        assert_eq!(PayloadShape::detect(None, "<div>x</div>"), PayloadShape::Html);
        assert_eq!(
            PayloadShape::detect(None, "<?xml version=\"1.0\"?><rss/>"),
            PayloadShape::Xml
        );
        assert_eq!(
            PayloadShape::detect(None, "<?xml version=\"1.0\"?><!DOCTYPE html><html/>"),
            PayloadShape::Html
        );
        assert_eq!(
            PayloadShape::detect(Some("text/plain"), "rawdeflate,AAAA"),
            PayloadShape::CompressedBlob
        );
        assert_eq!(
            PayloadShape::detect(None, "action=edit&text=x"),
            PayloadShape::Form
        );
        assert_eq!(PayloadShape::detect(None, "see mirror.test"), PayloadShape::PlainText);
    }

    #[test]
    fn test_peek_respects_char_boundary() {
        let body = "é".repeat(600);
        assert!(peek(&body).len() <= PEEK_LEN);
    }

    #[test]
    fn test_plain_text_body() {
        let pipeline = make_pipeline();
        let out = pipeline.transform_body(
            "see https://zh.wikipedia.org/wiki/A",
            Some("text/plain"),
            Direction::Inbound,
        );
        assert_eq!(out, "see https://zh.wikipedia.mirror.test/wiki/A");
    }

    #[test]
    fn test_malformed_json_falls_back() {
        let pipeline = make_pipeline();
        let out = pipeline.transform_body(
            "{\"text\": \"zh.wikipedia.org\"",
            Some("application/json"),
            Direction::Inbound,
        );
        assert_eq!(out, "{\"text\": \"zh.wikipedia.mirror.test\"");
    }

    #[test]
    fn test_leaf_dispatch() {
        let pipeline = make_pipeline();
        assert_eq!(
            pipeline.transform_leaf("rawdeflate,!!!", Direction::Inbound),
            "rawdeflate,!!!"
        );
        assert_eq!(
            pipeline.transform_leaf("zh.wikipedia.mirror.test", Direction::Outbound),
            "zh.wikipedia.org"
        );
        assert_eq!(
            pipeline.transform_fragment("<a href=\"//zh.wikipedia.org/\">x</a>", Direction::Inbound),
            "<a href=\"//zh.wikipedia.mirror.test/\">x</a>"
        );
    }

    #[test]
    fn test_markup_leaf_rewritten_whole() {
        let pipeline = make_pipeline();
        let leaf = concat!(
            r#"<div title="https://en.wikipedia.mirror.test/x">"#,
            "<!-- see https://en.wikipedia.mirror.test/y -->",
            r#"<p data-mw='{"parts":[{"template":{"wt":"https://en.wikipedia.mirror.test/z"}}]}'>z</p>"#,
            "<script>var h = \"en.wikipedia.mirror.test\";</script></div>"
        );
        let out = pipeline.transform_leaf(leaf, Direction::Outbound);
        assert!(!out.contains("mirror.test"));
        assert_eq!(out, leaf.replace("en.wikipedia.mirror.test", "en.wikipedia.org"));
    }

    #[test]
    fn test_visualeditor_form_html_rewritten() {
        let pipeline = make_pipeline();
        let request = RequestContext::new("POST", "/w/api.php").with_body(Body::Form(vec![
            ("action".to_string(), "visualeditoredit".to_string()),
            (
                "html".to_string(),
                r#"<p data-mw='{"wt":"https://en.wikipedia.mirror.test/z"}'><!--mirror.test--></p>"#
                    .to_string(),
            ),
        ]));
        let out = pipeline.transform_outbound(request);
        let Body::Form(pairs) = out.body else {
            panic!("form body expected");
        };
        assert_eq!(
            pairs[1].1,
            r#"<p data-mw='{"wt":"https://en.wikipedia.org/z"}'><!--wikimedia.org--></p>"#
        );
    }

    #[test]
    fn test_oversized_response_passes_through() {
        let mut config = MirrorConfig::for_mirror("mirror.test");
        config.pipeline.max_body_size = 8;
        let pipeline = ContentPipeline::new(&config).unwrap();
        let response = ResponseContext::new("https://mirror.test/", 200, "wikimedia.org wikimedia.org")
            .with_header("content-type", "text/plain");
        let out = pipeline.transform_inbound(response);
        assert_eq!(out.body, "wikimedia.org wikimedia.org");
    }

    #[test]
    fn test_oversized_request_passes_through() {
        let mut config = MirrorConfig::for_mirror("mirror.test");
        config.pipeline.max_body_size = 8;
        let pipeline = ContentPipeline::new(&config).unwrap();
        let form = vec![("text".to_string(), "see zh.wikipedia.mirror.test".to_string())];
        let request = RequestContext::new("POST", "https://zh.wikipedia.mirror.test/w/api.php")
            .with_body(Body::Form(form.clone()));
        let out = pipeline.transform_outbound(request);
        assert_eq!(out.body, Body::Form(form));
    }

    #[test]
    fn test_form_request_body() {
        let pipeline = make_pipeline();
        let request = RequestContext::new("POST", "https://zh.wikipedia.mirror.test/w/api.php")
            .with_body(Body::Form(vec![
                ("action".to_string(), "edit".to_string()),
                ("text".to_string(), "[https://zh.wikipedia.mirror.test/wiki/A]".to_string()),
            ]));
        let out = pipeline.transform_outbound(request);
        assert_eq!(
            out.body,
            Body::Form(vec![
                ("action".to_string(), "edit".to_string()),
                ("text".to_string(), "[https://zh.wikipedia.org/wiki/A]".to_string()),
            ])
        );
        // Request URLs are routed to the mirror family
        assert_eq!(out.url, "https://zh.wikipedia.mirror.test/w/api.php");
    }

    #[test]
    fn test_binary_body_untouched() {
        let pipeline = make_pipeline();
        let request = RequestContext::new("POST", "/upload")
            .with_body(Body::Binary(b"mirror.test".to_vec()));
        let out = pipeline.transform_outbound(request);
        assert_eq!(out.body, Body::Binary(b"mirror.test".to_vec()));
    }
}
