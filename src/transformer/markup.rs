//! HTML and XML markup transformer.
//!
//! Markup is split into a flat token stream (text, tags, other markup) and
//! rewritten in three passes:
//!
//! 1. link and media attributes (`href`, `src`, `poster`, `srcset`)
//! 2. variant-data islands (`data-mw-variant` JSON)
//! 3. text nodes
//!
//! Tokens that no pass touched are emitted byte-for-byte, as is the leading XML
//! declaration and DOCTYPE.

use super::{ContentPipeline, PayloadShape, TransformError, Transformer};
use crate::rules::Direction;
use regex::Regex;
use serde_json::Value as JsonValue;
use std::borrow::Cow;
use std::ops::Range;
use std::sync::LazyLock;
use tracing::debug;

/// Regex for character references like `&amp;`, `&#39;` and `&#x27;`
static ENTITY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z][a-zA-Z0-9]*);").unwrap()
});

/// Elements whose link attributes are rewritten.
const LINK_ELEMENTS: &[&str] = &["a", "area", "audio", "base", "img", "link", "source", "video"];

/// Attributes holding URLs.
const LINK_ATTRIBUTES: &[&str] = &["href", "poster", "src", "srcset"];

/// Attribute carrying language-variant JSON.
const VARIANT_ATTRIBUTE: &str = "data-mw-variant";

/// HTML elements whose content is not markup.
const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style"];

/// XML elements whose text is rewritten.
const XML_TEXT_ELEMENTS: &[&str] = &["a", "rev", "text"];

/// Markup dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkupMode {
    /// HTML documents and fragments
    Html,
    /// XML documents (RSS, Atom, API XML)
    Xml,
}

impl MarkupMode {
    fn shape(self) -> PayloadShape {
        match self {
            Self::Html => PayloadShape::Html,
            Self::Xml => PayloadShape::Xml,
        }
    }
}

/// Markup transformer for one dialect.
#[derive(Debug)]
pub struct MarkupTransformer {
    mode: MarkupMode,
}

impl MarkupTransformer {
    /// Create a markup transformer for `mode`.
    pub fn new(mode: MarkupMode) -> Self {
        Self { mode }
    }

    /// Pass 1: link and media attributes.
    fn rewrite_links(
        &self,
        pipeline: &ContentPipeline,
        tokens: &mut [Token<'_>],
        direction: Direction,
    ) -> bool {
        let mut changed = false;
        for tag in tokens.iter_mut().filter_map(Token::as_start_tag) {
            if !LINK_ELEMENTS.contains(&tag.name.as_str()) {
                continue;
            }
            let raw = tag.raw;
            for attr in tag.attrs.iter_mut() {
                if !attr.has_value || !LINK_ATTRIBUTES.contains(&attr.name.as_str()) {
                    continue;
                }
                let value = &raw[attr.value.clone()];
                let rewritten = pipeline.engine().rewrite(value, direction);
                if rewritten != value {
                    attr.replacement = Some(rewritten);
                    changed = true;
                }
            }
        }
        changed
    }

    /// Pass 2: variant-data islands.
    fn rewrite_variants(
        &self,
        pipeline: &ContentPipeline,
        tokens: &mut [Token<'_>],
        direction: Direction,
    ) -> bool {
        let mut changed = false;
        for tag in tokens.iter_mut().filter_map(Token::as_start_tag) {
            let raw = tag.raw;
            for attr in tag.attrs.iter_mut() {
                if !attr.has_value || attr.name != VARIANT_ATTRIBUTE {
                    continue;
                }
                let decoded = decode_entities(&raw[attr.value.clone()]);
                let mut island: JsonValue = match serde_json::from_str(&decoded) {
                    Ok(island) => island,
                    Err(e) => {
                        debug!(error = %e, "Skipping unparseable variant island");
                        continue;
                    }
                };
                if !rewrite_variant_leaves(pipeline, &mut island, direction) {
                    continue;
                }
                match serde_json::to_string(&island) {
                    Ok(json) => {
                        attr.replacement = Some(encode_attribute(&json, attr.quote));
                        changed = true;
                    }
                    Err(e) => debug!(error = %e, "Failed to serialize variant island"),
                }
            }
        }
        changed
    }

    /// Pass 3: text nodes.
    fn rewrite_text(
        &self,
        pipeline: &ContentPipeline,
        tokens: &mut [Token<'_>],
        direction: Direction,
    ) -> bool {
        let mut changed = false;
        let mut xml_depth = 0usize;
        for token in tokens.iter_mut() {
            match token {
                Token::Tag(tag) if self.mode == MarkupMode::Xml => {
                    if XML_TEXT_ELEMENTS.contains(&tag.name.as_str()) && !tag.self_closing {
                        if tag.closing {
                            xml_depth = xml_depth.saturating_sub(1);
                        } else {
                            xml_depth += 1;
                        }
                    }
                }
                Token::Text {
                    raw,
                    raw_text,
                    replacement,
                } => {
                    let eligible = match self.mode {
                        MarkupMode::Html => !*raw_text,
                        MarkupMode::Xml => xml_depth > 0,
                    };
                    if !eligible || raw.trim().is_empty() {
                        continue;
                    }
                    let rewritten = pipeline.engine().rewrite(*raw, direction);
                    if rewritten != *raw {
                        *replacement = Some(rewritten);
                        changed = true;
                    }
                }
                _ => {}
            }
        }
        changed
    }
}

impl Transformer for MarkupTransformer {
    fn transform(
        &self,
        pipeline: &ContentPipeline,
        input: &str,
        direction: Direction,
    ) -> Result<String, TransformError> {
        let (prologue, body) = split_prologue(input);
        let mut tokens = tokenize(body, self.mode)?;

        let links = self.rewrite_links(pipeline, &mut tokens, direction);
        let variants = self.rewrite_variants(pipeline, &mut tokens, direction);
        let text = self.rewrite_text(pipeline, &mut tokens, direction);
        if !(links || variants || text) {
            return Ok(input.to_string());
        }

        let mut out = String::with_capacity(input.len() + input.len() / 8);
        out.push_str(prologue);
        for token in &tokens {
            token.render(&mut out);
        }
        Ok(out)
    }

    fn name(&self) -> &'static str {
        match self.mode {
            MarkupMode::Html => "html_transformer",
            MarkupMode::Xml => "xml_transformer",
        }
    }
}

// ============================================================================
// Tokens
// ============================================================================

#[derive(Debug)]
enum Token<'a> {
    /// Character data
    Text {
        raw: &'a str,
        /// Content of a script or style element
        raw_text: bool,
        replacement: Option<String>,
    },
    /// Start, end or self-closing tag
    Tag(Tag<'a>),
    /// Comment, CDATA section, declaration or processing instruction
    Markup(&'a str),
}

impl<'a> Token<'a> {
    fn text(raw: &'a str, raw_text: bool) -> Self {
        Self::Text {
            raw,
            raw_text,
            replacement: None,
        }
    }

    fn as_start_tag(&mut self) -> Option<&mut Tag<'a>> {
        match self {
            Self::Tag(tag) if !tag.closing => Some(tag),
            _ => None,
        }
    }

    fn render(&self, out: &mut String) {
        match self {
            Self::Text {
                raw, replacement, ..
            } => out.push_str(replacement.as_deref().unwrap_or(*raw)),
            Self::Tag(tag) => tag.render(out),
            Self::Markup(raw) => out.push_str(raw),
        }
    }
}

#[derive(Debug)]
struct Tag<'a> {
    raw: &'a str,
    /// Lowercased element name
    name: String,
    closing: bool,
    self_closing: bool,
    attrs: Vec<Attribute>,
}

#[derive(Debug)]
struct Attribute {
    /// Lowercased attribute name
    name: String,
    /// Byte range of the value inside the tag, quotes excluded
    value: Range<usize>,
    has_value: bool,
    quote: Option<char>,
    replacement: Option<String>,
}

impl<'a> Tag<'a> {
    fn parse(raw: &'a str) -> Self {
        let bytes = raw.as_bytes();
        let inner_end = raw.len() - 1;
        let closing = bytes.get(1) == Some(&b'/');
        let mut i = if closing { 2 } else { 1 };

        let name_start = i;
        while i < inner_end && !bytes[i].is_ascii_whitespace() && !matches!(bytes[i], b'/' | b'>') {
            i += 1;
        }
        let name = raw[name_start..i].to_ascii_lowercase();
        let self_closing = raw[..inner_end].trim_end().ends_with('/');

        let mut attrs = Vec::new();
        loop {
            while i < inner_end && (bytes[i].is_ascii_whitespace() || bytes[i] == b'/') {
                i += 1;
            }
            if i >= inner_end {
                break;
            }

            let attr_start = i;
            while i < inner_end && !bytes[i].is_ascii_whitespace() && !matches!(bytes[i], b'=' | b'/')
            {
                i += 1;
            }
            let attr_name = raw[attr_start..i].to_ascii_lowercase();

            let mut j = skip_whitespace(bytes, i, inner_end);
            if j < inner_end && bytes[j] == b'=' {
                j = skip_whitespace(bytes, j + 1, inner_end);
                let (value, quote, next) = if j < inner_end && matches!(bytes[j], b'"' | b'\'') {
                    let quote = bytes[j] as char;
                    let start = j + 1;
                    let end = raw[start..inner_end]
                        .find(quote)
                        .map_or(inner_end, |p| start + p);
                    (start..end, Some(quote), (end + 1).min(inner_end))
                } else {
                    let start = j;
                    while j < inner_end && !bytes[j].is_ascii_whitespace() {
                        j += 1;
                    }
                    (start..j, None, j)
                };
                attrs.push(Attribute {
                    name: attr_name,
                    value,
                    has_value: true,
                    quote,
                    replacement: None,
                });
                i = next;
            } else {
                attrs.push(Attribute {
                    name: attr_name,
                    value: i..i,
                    has_value: false,
                    quote: None,
                    replacement: None,
                });
                if i == attr_start {
                    i += 1;
                }
            }
        }

        Self {
            raw,
            name,
            closing,
            self_closing,
            attrs,
        }
    }

    fn render(&self, out: &mut String) {
        let mut last = 0;
        for attr in &self.attrs {
            if let Some(replacement) = &attr.replacement {
                out.push_str(&self.raw[last..attr.value.start]);
                out.push_str(replacement);
                last = attr.value.end;
            }
        }
        out.push_str(&self.raw[last..]);
    }
}

fn skip_whitespace(bytes: &[u8], mut i: usize, end: usize) -> usize {
    while i < end && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

// ============================================================================
// Tokenizer
// ============================================================================

fn tokenize(input: &str, mode: MarkupMode) -> Result<Vec<Token<'_>>, TransformError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;
    let mut text_start = 0;

    while pos < bytes.len() {
        if bytes[pos] != b'<' {
            pos += 1;
            continue;
        }

        let rest = &input[pos..];
        let len = if rest.starts_with("<!--") {
            find_end(rest, "-->", 4, mode, "comment")?
        } else if rest.starts_with("<![CDATA[") {
            find_end(rest, "]]>", 9, mode, "CDATA section")?
        } else if rest.starts_with("<!") || rest.starts_with("<?") {
            find_end(rest, ">", 2, mode, "declaration")?
        } else if is_tag_start(rest) {
            scan_tag_end(rest, mode)?
        } else {
            // A literal '<' inside text
            pos += 1;
            continue;
        };

        if text_start < pos {
            tokens.push(Token::text(&input[text_start..pos], false));
        }

        let raw = &rest[..len];
        pos += len;
        text_start = pos;

        if !raw.starts_with("<!") && !raw.starts_with("<?") {
            let tag = Tag::parse(raw);
            let raw_text = mode == MarkupMode::Html
                && !tag.closing
                && !tag.self_closing
                && RAW_TEXT_ELEMENTS.contains(&tag.name.as_str());
            let end = raw_text.then(|| raw_text_end(input, pos, &tag.name));
            tokens.push(Token::Tag(tag));

            if let Some(end) = end {
                if pos < end {
                    tokens.push(Token::text(&input[pos..end], true));
                }
                pos = end;
                text_start = pos;
            }
        } else {
            tokens.push(Token::Markup(raw));
        }
    }

    if text_start < bytes.len() {
        tokens.push(Token::text(&input[text_start..], false));
    }
    Ok(tokens)
}

/// Offset of the `</name` that closes a raw-text element opened before `from`.
fn raw_text_end(input: &str, from: usize, name: &str) -> usize {
    input[from..]
        .match_indices("</")
        .map(|(p, _)| from + p)
        .find(|&p| {
            input.as_bytes()[p + 2..]
                .get(..name.len())
                .is_some_and(|candidate| candidate.eq_ignore_ascii_case(name.as_bytes()))
        })
        .unwrap_or(input.len())
}

fn is_tag_start(rest: &str) -> bool {
    let bytes = rest.as_bytes();
    match bytes.get(1) {
        Some(b'/') => bytes.get(2).is_some_and(u8::is_ascii_alphabetic),
        Some(b) => b.is_ascii_alphabetic(),
        None => false,
    }
}

fn find_end(
    rest: &str,
    terminator: &str,
    skip: usize,
    mode: MarkupMode,
    what: &str,
) -> Result<usize, TransformError> {
    rest.get(skip..)
        .and_then(|tail| tail.find(terminator))
        .map(|p| skip + p + terminator.len())
        .ok_or_else(|| TransformError::malformed(mode.shape(), format!("unterminated {}", what)))
}

/// Length of the tag starting at `rest`, honouring quoted attribute values.
fn scan_tag_end(rest: &str, mode: MarkupMode) -> Result<usize, TransformError> {
    let mut quote: Option<u8> = None;
    let mut after_eq = false;
    for (i, &b) in rest.as_bytes().iter().enumerate().skip(1) {
        match quote {
            Some(q) => {
                if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'>' => return Ok(i + 1),
                b'=' => {
                    after_eq = true;
                    continue;
                }
                b'"' | b'\'' if after_eq => quote = Some(b),
                _ if b.is_ascii_whitespace() => continue,
                _ => {}
            },
        }
        after_eq = false;
    }
    Err(TransformError::malformed(mode.shape(), "unterminated tag"))
}

/// Split the leading XML declaration and DOCTYPE off a document.
fn split_prologue(input: &str) -> (&str, &str) {
    let mut end = 0;
    loop {
        let rest = &input[end..];
        let trimmed = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '\u{feff}');
        let skipped = rest.len() - trimmed.len();

        let len = if trimmed.starts_with("<?xml") {
            trimmed.find("?>").map(|p| p + 2)
        } else if trimmed
            .get(..9)
            .is_some_and(|s| s.eq_ignore_ascii_case("<!doctype"))
        {
            doctype_end(trimmed)
        } else {
            None
        };

        match len {
            Some(len) => end += skipped + len,
            None => break,
        }
    }
    input.split_at(end)
}

fn doctype_end(doctype: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, b) in doctype.bytes().enumerate() {
        match b {
            b'[' => depth += 1,
            b']' => depth = depth.saturating_sub(1),
            b'>' if depth == 0 => return Some(i + 1),
            _ => {}
        }
    }
    None
}

// ============================================================================
// Variant islands
// ============================================================================

/// Rewrite every `t` leaf of a variant island.
fn rewrite_variant_leaves(
    pipeline: &ContentPipeline,
    value: &mut JsonValue,
    direction: Direction,
) -> bool {
    let mut changed = false;
    match value {
        JsonValue::Object(map) => {
            for (key, value) in map.iter_mut() {
                match value {
                    JsonValue::String(text) if key == "t" => {
                        let rewritten = pipeline.transform_fragment(text, direction);
                        if rewritten != *text {
                            *text = rewritten;
                            changed = true;
                        }
                    }
                    other => changed |= rewrite_variant_leaves(pipeline, other, direction),
                }
            }
        }
        JsonValue::Array(items) => {
            for item in items {
                changed |= rewrite_variant_leaves(pipeline, item, direction);
            }
        }
        _ => {}
    }
    changed
}

/// Decode character references.
fn decode_entities(text: &str) -> Cow<'_, str> {
    ENTITY_REGEX.replace_all(text, |caps: &regex::Captures| {
        let entity = &caps[1];
        let decoded = if let Some(hex) = entity
            .strip_prefix("#x")
            .or_else(|| entity.strip_prefix("#X"))
        {
            u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
        } else if let Some(dec) = entity.strip_prefix('#') {
            dec.parse::<u32>().ok().and_then(char::from_u32)
        } else {
            match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some('\u{a0}'),
                _ => None,
            }
        };
        decoded.map_or_else(|| caps[0].to_string(), String::from)
    })
}

/// Escape text for embedding in an attribute delimited by `quote`.
fn encode_attribute(text: &str, quote: Option<char>) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 4);
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if quote != Some('\'') => out.push_str("&quot;"),
            '\'' if quote != Some('"') => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MirrorConfig;
    use serde_json::json;

    fn make_pipeline() -> ContentPipeline {
        ContentPipeline::new(&MirrorConfig::for_mirror("mirror.test")).unwrap()
    }

    fn html(input: &str, direction: Direction) -> String {
        MarkupTransformer::new(MarkupMode::Html)
            .transform(&make_pipeline(), input, direction)
            .unwrap()
    }

    fn xml(input: &str) -> String {
        MarkupTransformer::new(MarkupMode::Xml)
            .transform(&make_pipeline(), input, Direction::Inbound)
            .unwrap()
    }

    #[test]
    fn test_links_and_text_rewritten() {
        let out = html(
            r#"<p>Visit <a href="https://zh.wikipedia.org/wiki/A" title="zh.wikipedia.org">zh.wikipedia.org</a></p>"#,
            Direction::Inbound,
        );
        assert_eq!(
            out,
            r#"<p>Visit <a href="https://zh.wikipedia.mirror.test/wiki/A" title="zh.wikipedia.org">zh.wikipedia.mirror.test</a></p>"#
        );
    }

    #[test]
    fn test_media_attributes() {
        let out = html(
            "<img src=//upload.wikimedia.org/a.png srcset='//upload.wikimedia.org/b.png 2x' alt=x>",
            Direction::Inbound,
        );
        assert_eq!(
            out,
            "<img src=//upload.mirror.test/a.png srcset='//upload.mirror.test/b.png 2x' alt=x>"
        );
    }

    #[test]
    fn test_outbound_links() {
        let out = html(
            r#"<a href="//zh.wikipedia.mirror.test/wiki/A">A</a>"#,
            Direction::Outbound,
        );
        assert_eq!(out, r#"<a href="//zh.wikipedia.org/wiki/A">A</a>"#);
    }

    #[test]
    fn test_script_style_comment_cdata_untouched() {
        let input = concat!(
            "<script>var u = \"zh.wikipedia.org\"; if (a < b) {}</script>",
            "<STYLE>a[href*=\"wikimedia.org\"]{}</STYLE>",
            "<!-- zh.wikipedia.org -->",
            "<![CDATA[zh.wikipedia.org]]>",
            "<p>zh.wikipedia.org</p>"
        );
        let expected = input.replace(
            "<p>zh.wikipedia.org</p>",
            "<p>zh.wikipedia.mirror.test</p>",
        );
        assert_eq!(html(input, Direction::Inbound), expected);
    }

    #[test]
    fn test_variant_island() {
        let island = json!({"twoway": [{"l": "zh-cn", "t": "<a href=\"//zh.wikipedia.org/\">x</a>"}]});
        let expected = json!({"twoway": [{"l": "zh-cn", "t": "<a href=\"//zh.wikipedia.mirror.test/\">x</a>"}]});
        let input = format!(
            r#"<span data-mw-variant="{}"></span>"#,
            encode_attribute(&island.to_string(), Some('"'))
        );
        let out = html(&input, Direction::Inbound);
        assert_eq!(
            out,
            format!(
                r#"<span data-mw-variant="{}"></span>"#,
                encode_attribute(&expected.to_string(), Some('"'))
            )
        );
    }

    #[test]
    fn test_xml_only_listed_elements() {
        let out = xml(concat!(
            r#"<?xml version="1.0"?><api><page title="zh.wikipedia.org">"#,
            "<rev>see zh.wikipedia.org</rev></page>",
            "<other>zh.wikipedia.org</other></api>"
        ));
        assert_eq!(
            out,
            concat!(
                r#"<?xml version="1.0"?><api><page title="zh.wikipedia.org">"#,
                "<rev>see zh.wikipedia.mirror.test</rev></page>",
                "<other>zh.wikipedia.org</other></api>"
            )
        );
    }

    #[test]
    fn test_prologue_preserved() {
        let prologue = concat!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n",
            "<!DOCTYPE html PUBLIC \"-//W3C//DTD XHTML 1.0 Strict//EN\" ",
            "\"http://www.w3.org/TR/xhtml1/DTD/xhtml1-strict.dtd\">"
        );
        let input = format!(
            "{}\n<html><body><a href=\"https://wikimedia.org/\">wikimedia.org</a></body></html>",
            prologue
        );
        let out = html(&input, Direction::Inbound);
        assert!(out.starts_with(prologue));
        assert!(out.ends_with(
            "<html><body><a href=\"https://mirror.test/\">mirror.test</a></body></html>"
        ));
    }

    #[test]
    fn test_unchanged_markup_is_byte_identical() {
        let input = "<DIV  Class = 'x' data-x=\"a > b\">plain &amp; simple</DIV>";
        assert_eq!(html(input, Direction::Inbound), input);
    }

    #[test]
    fn test_literal_lt_in_text() {
        let out = html("<p>a < b zh.wikipedia.org</p>", Direction::Inbound);
        assert_eq!(out, "<p>a < b zh.wikipedia.mirror.test</p>");
    }

    #[test]
    fn test_unterminated_tag() {
        let err = MarkupTransformer::new(MarkupMode::Html)
            .transform(&make_pipeline(), "<p>x <a href=\"y\"", Direction::Inbound)
            .unwrap_err();
        assert!(matches!(err, TransformError::MalformedPayload { .. }));
    }

    #[test]
    fn test_raw_text_end() {
        let input = "<script>a</b></SCRIPT><p>x</p>";
        assert_eq!(raw_text_end(input, 8, "script"), 13);
        assert_eq!(raw_text_end("<style>a{}", 7, "style"), 10);
        assert_eq!(raw_text_end("<style>a</st", 7, "style"), 12);
    }

    #[test]
    fn test_uppercase_script_close() {
        let out = html(
            "<SCRIPT>u = 'zh.wikipedia.org'</Script><p>zh.wikipedia.org</p>",
            Direction::Inbound,
        );
        assert_eq!(
            out,
            "<SCRIPT>u = 'zh.wikipedia.org'</Script><p>zh.wikipedia.mirror.test</p>"
        );
    }

    #[test]
    fn test_entities() {
        assert_eq!(
            decode_entities("&quot;a&quot; &amp; &#39;b&#x27; &unknown;"),
            "\"a\" & 'b' &unknown;"
        );
        assert_eq!(
            encode_attribute("\"a\" & <'b'>", Some('"')),
            "&quot;a&quot; &amp; &lt;'b'&gt;"
        );
    }
}
