//! Compressed blob transformer (`rawdeflate,` + base64 raw deflate).

use super::{ContentPipeline, TransformError, Transformer};
use crate::rules::Direction;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use tracing::trace;

/// Literal prefix of a compressed blob.
pub const BLOB_PREFIX: &str = "rawdeflate,";

/// Base64 flavour of an encoded blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Encoding {
    url_safe: bool,
    padded: bool,
}

impl Encoding {
    fn detect(payload: &str) -> Self {
        let url_safe = payload.contains(['-', '_']);
        // Without a trailing '=' the padding style is only visible when the
        // length is not a multiple of four.
        let padded = payload.ends_with('=') || (payload.len() % 4 == 0 && !url_safe);
        Self { url_safe, padded }
    }

    fn decode(&self, payload: &str) -> Result<Vec<u8>, base64::DecodeError> {
        let mut normalized: String = payload
            .trim_end_matches('=')
            .chars()
            .map(|c| match c {
                '-' => '+',
                '_' => '/',
                c => c,
            })
            .collect();
        while normalized.len() % 4 != 0 {
            normalized.push('=');
        }
        STANDARD.decode(normalized)
    }

    fn encode(&self, bytes: &[u8]) -> String {
        match (self.url_safe, self.padded) {
            (true, true) => URL_SAFE.encode(bytes),
            (true, false) => URL_SAFE_NO_PAD.encode(bytes),
            (false, true) => STANDARD.encode(bytes),
            (false, false) => STANDARD_NO_PAD.encode(bytes),
        }
    }
}

/// Inflates a blob, rewrites its text and deflates it again.
#[derive(Debug)]
pub struct BlobTransformer {
    level: Compression,
}

impl BlobTransformer {
    /// Create a blob transformer re-compressing at `level` (0-9).
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }

    /// Decode and inflate a blob into its text.
    pub fn inflate(&self, blob: &str) -> Result<String, TransformError> {
        let payload = blob
            .strip_prefix(BLOB_PREFIX)
            .ok_or_else(|| TransformError::UnsupportedCompression("missing blob prefix".into()))?;
        let bytes = Encoding::detect(payload)
            .decode(payload)
            .map_err(|e| TransformError::UnsupportedCompression(format!("base64: {}", e)))?;

        let mut text = String::new();
        DeflateDecoder::new(bytes.as_slice())
            .read_to_string(&mut text)
            .map_err(|e| TransformError::UnsupportedCompression(format!("inflate: {}", e)))?;
        Ok(text)
    }

    /// Deflate and encode text into a blob using the given base64 flavour.
    fn deflate(&self, text: &str, encoding: Encoding) -> Result<String, TransformError> {
        let mut encoder = DeflateEncoder::new(Vec::new(), self.level);
        encoder
            .write_all(text.as_bytes())
            .map_err(|e| TransformError::UnsupportedCompression(format!("deflate: {}", e)))?;
        let bytes = encoder
            .finish()
            .map_err(|e| TransformError::UnsupportedCompression(format!("deflate: {}", e)))?;
        Ok(format!("{}{}", BLOB_PREFIX, encoding.encode(&bytes)))
    }

    /// Compress `text` into a padded standard-alphabet blob.
    pub fn compress(&self, text: &str) -> Result<String, TransformError> {
        self.deflate(
            text,
            Encoding {
                url_safe: false,
                padded: true,
            },
        )
    }
}

impl Transformer for BlobTransformer {
    fn transform(
        &self,
        pipeline: &ContentPipeline,
        input: &str,
        direction: Direction,
    ) -> Result<String, TransformError> {
        let blob = input.trim();
        let text = self.inflate(blob)?;
        let rewritten = pipeline.engine().rewrite(&text, direction);
        if rewritten == text {
            return Ok(input.to_string());
        }

        trace!(inflated = text.len(), %direction, "Re-compressing rewritten blob");
        let encoding = Encoding::detect(&blob[BLOB_PREFIX.len()..]);
        let deflated = self.deflate(&rewritten, encoding)?;

        let leading = &input[..input.len() - input.trim_start().len()];
        let trailing = &input[input.trim_end().len()..];
        Ok(format!("{}{}{}", leading, deflated, trailing))
    }

    fn name(&self) -> &'static str {
        "blob_transformer"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MirrorConfig;

    fn make_pipeline() -> ContentPipeline {
        let mut config = MirrorConfig::for_mirror("mirror.test");
        config.domains.canonical = "example.org".to_string();
        config.domains.sub_brands.clear();
        ContentPipeline::new(&config).unwrap()
    }

    #[test]
    fn test_blob_rewritten() {
        let pipeline = make_pipeline();
        let blobs = BlobTransformer::new(5);
        let blob = blobs.compress("link: example.org").unwrap();

        let out = blobs.transform(&pipeline, &blob, Direction::Inbound).unwrap();
        assert!(out.starts_with(BLOB_PREFIX));
        assert_eq!(blobs.inflate(&out).unwrap(), "link: mirror.test");
    }

    #[test]
    fn test_surrounding_whitespace_kept() {
        let pipeline = make_pipeline();
        let blobs = BlobTransformer::new(5);
        let blob = format!("\n {}\n", blobs.compress("link: example.org").unwrap());

        let out = blobs.transform(&pipeline, &blob, Direction::Inbound).unwrap();
        assert!(out.starts_with(&format!("\n {}", BLOB_PREFIX)));
        assert!(out.ends_with('\n'));
        assert_eq!(blobs.inflate(out.trim()).unwrap(), "link: mirror.test");
    }

    #[test]
    fn test_encoding_detection() {
        assert_eq!(
            Encoding::detect("ab-_cd"),
            Encoding {
                url_safe: true,
                padded: false
            }
        );
        assert!(Encoding::detect("abcd").padded);
        assert!(Encoding::detect("ab==").padded);
        assert!(!Encoding::detect("abc").padded);
        assert_eq!(URL_SAFE_NO_PAD.encode([0xfb, 0xff]), "-_8");
    }

    #[test]
    fn test_url_safe_blob_decoded() {
        let pipeline = make_pipeline();
        let blobs = BlobTransformer::new(5);
        let compressed = blobs
            .deflate(
                "see mirror.test",
                Encoding {
                    url_safe: true,
                    padded: false,
                },
            )
            .unwrap();
        assert!(!compressed.contains('='));
        let out = blobs
            .transform(&pipeline, &compressed, Direction::Outbound)
            .unwrap();
        assert_eq!(blobs.inflate(&out).unwrap(), "see example.org");
    }

    #[test]
    fn test_missing_padding_accepted() {
        let blobs = BlobTransformer::new(5);
        let blob = blobs.compress("a").unwrap();
        let unpadded = blob.trim_end_matches('=');
        assert_eq!(blobs.inflate(unpadded).unwrap(), "a");
    }

    #[test]
    fn test_invalid_blob() {
        let pipeline = make_pipeline();
        let blobs = BlobTransformer::new(5);
        let err = blobs
            .transform(&pipeline, "rawdeflate,@@@", Direction::Inbound)
            .unwrap_err();
        assert!(matches!(err, TransformError::UnsupportedCompression(_)));

        // Valid base64, not a deflate stream
        let err = blobs
            .transform(&pipeline, "rawdeflate,/////w==", Direction::Inbound)
            .unwrap_err();
        assert!(matches!(err, TransformError::UnsupportedCompression(_)));
    }

    #[test]
    fn test_unchanged_blob_kept() {
        let pipeline = make_pipeline();
        let blobs = BlobTransformer::new(5);
        let blob = blobs.compress("nothing to see").unwrap();
        let out = blobs.transform(&pipeline, &blob, Direction::Inbound).unwrap();
        assert_eq!(out, blob);
    }
}
