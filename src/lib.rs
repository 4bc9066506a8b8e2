//! Domain rewriting engine and HTTP interception layer for wiki mirrors.
//!
//! A mirror serves a wiki family under its own domain. This crate keeps the two
//! views consistent:
//!
//! - Outbound: mirror references in requests are rewritten to canonical hosts
//! - Inbound: canonical references in responses are rewritten to mirror hosts
//! - Payload-aware: JSON, HTML, XML, form bodies and deflate blobs keep their structure
//! - Telemetry endpoints are short-circuited and never contacted
//!
//! ## Configuration Example
//!
//! ```yaml
//! version: "1"
//! domains:
//!   mirror: "mirror.test"
//!   canonical: "wikimedia.org"
//! interception:
//!   strip_params: ["md5"]
//!   edit_tag:
//!     value: "WikiMirror"
//!     host_pattern: "^zh(\\.m)?\\.wikipedia"
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod engine;
pub mod interceptor;
pub mod matcher;
pub mod rules;
pub mod transformer;

pub use config::{ConfigError, MirrorConfig};
pub use context::{Body, RequestContext, ResponseContext};
pub use engine::RewriteEngine;
pub use interceptor::{Dispatch, Interceptor, InterceptorMetrics, NetworkError, Transport};
pub use rules::{Direction, RuleSet};
pub use transformer::{ContentPipeline, PayloadShape, TransformError};
