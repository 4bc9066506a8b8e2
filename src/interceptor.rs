//! HTTP interception layer.
//!
//! Every request made through [`Interceptor::fetch`], [`Interceptor::xhr`] or
//! [`Interceptor::beacon`] is rewritten to the canonical form before it reaches
//! the [`Transport`], and every textual response is rewritten back to the mirror
//! form before the caller sees it. Collaborators that own their I/O can call
//! [`Interceptor::prepare`] and [`Interceptor::finish`] directly.

use crate::config::{ConfigError, MirrorConfig};
use crate::context::{Body, RequestContext, ResponseContext};
use crate::matcher::{ContentTypeFilter, DenyList, Matcher, MatcherError};
use crate::transformer::{ContentPipeline, HeaderTransformer, PayloadShape};
use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// API action whose short links must point at the page origin.
const SHORTEN_ACTION: &str = "shortenurl";

/// The collaborator's network primitive.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform the real network call.
    async fn send(&self, request: RequestContext) -> Result<ResponseContext, NetworkError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, request: RequestContext) -> Result<ResponseContext, NetworkError> {
        (**self).send(request).await
    }
}

/// Transport failures, returned to the caller unmodified.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    #[error("Request timed out")]
    Timeout,

    #[error("Request aborted")]
    Aborted,

    #[error("Connection failed: {0}")]
    Connection(String),
}

/// Outcome of preparing a request.
#[derive(Debug)]
pub enum Dispatch {
    /// Rewritten request, ready to send
    Send(PreparedRequest),
    /// Denylisted request: never sent, answered with an empty success
    ShortCircuit(ResponseContext),
}

/// A request that already went through the outbound transform.
///
/// Only [`Interceptor::prepare`] creates one, so a request cannot be
/// transformed twice.
#[derive(Debug)]
pub struct PreparedRequest {
    request: RequestContext,
}

impl PreparedRequest {
    /// The rewritten request.
    pub fn request(&self) -> &RequestContext {
        &self.request
    }

    /// Take the rewritten request for sending.
    pub fn into_request(self) -> RequestContext {
        self.request
    }
}

/// Snapshot of the interceptor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InterceptorMetrics {
    /// Requests seen by any entry point
    pub requests_total: u64,
    /// Denylisted requests answered without sending
    pub short_circuited: u64,
    /// Responses that went through the inbound transform
    pub responses_transformed: u64,
    /// Responses passed through for their content type
    pub responses_passed_through: u64,
    /// Transport failures
    pub network_errors: u64,
}

/// Edit tag with its compiled host pattern.
#[derive(Debug)]
struct CompiledEditTag {
    value: String,
    hosts: Regex,
}

/// Wraps a [`Transport`] with the outbound and inbound transforms.
pub struct Interceptor<T> {
    transport: T,
    pipeline: Arc<ContentPipeline>,
    denylist: DenyList,
    content_types: ContentTypeFilter,
    header: HeaderTransformer,
    strip_params: Vec<String>,
    edit_tag: Option<CompiledEditTag>,
    requests_total: AtomicU64,
    short_circuited: AtomicU64,
    responses_transformed: AtomicU64,
    responses_passed_through: AtomicU64,
    network_errors: AtomicU64,
}

impl<T: Transport> Interceptor<T> {
    /// Create an interceptor with its own pipeline.
    pub fn new(config: &MirrorConfig, transport: T) -> Result<Self, ConfigError> {
        let pipeline = Arc::new(ContentPipeline::new(config)?);
        Self::with_pipeline(pipeline, config, transport)
    }

    /// Create an interceptor sharing an existing pipeline.
    pub fn with_pipeline(
        pipeline: Arc<ContentPipeline>,
        config: &MirrorConfig,
        transport: T,
    ) -> Result<Self, ConfigError> {
        let settings = &config.interception;
        let denylist = DenyList::compile(&settings.denylist)?;
        let edit_tag = settings
            .edit_tag
            .as_ref()
            .map(|tag| {
                Ok::<_, MatcherError>(CompiledEditTag {
                    value: tag.value.clone(),
                    hosts: Regex::new(&tag.host_pattern)?,
                })
            })
            .transpose()?;

        info!(
            denylist = denylist.len(),
            strip_params = settings.strip_params.len(),
            edit_tag = edit_tag.is_some(),
            header = %settings.header_name,
            "Interceptor initialized"
        );

        Ok(Self {
            transport,
            pipeline,
            denylist,
            content_types: ContentTypeFilter,
            header: HeaderTransformer::new(config),
            strip_params: settings.strip_params.clone(),
            edit_tag,
            requests_total: AtomicU64::new(0),
            short_circuited: AtomicU64::new(0),
            responses_transformed: AtomicU64::new(0),
            responses_passed_through: AtomicU64::new(0),
            network_errors: AtomicU64::new(0),
        })
    }

    /// Fetch-style entry point.
    pub async fn fetch(&self, request: RequestContext) -> Result<ResponseContext, NetworkError> {
        self.dispatch("fetch", request).await
    }

    /// XHR-style entry point.
    pub async fn xhr(&self, request: RequestContext) -> Result<ResponseContext, NetworkError> {
        self.dispatch("xhr", request).await
    }

    /// Beacon-style entry point: fire and forget.
    ///
    /// Returns whether the beacon was accepted; denylisted beacons report
    /// success without being sent.
    pub async fn beacon(&self, url: &str, body: Body) -> bool {
        let request = RequestContext::new("POST", url).with_body(body);
        match self.prepare(request) {
            Dispatch::ShortCircuit(_) => true,
            Dispatch::Send(prepared) => {
                match self.transport.send(prepared.into_request()).await {
                    Ok(_) => true,
                    Err(e) => {
                        self.network_errors.fetch_add(1, Ordering::Relaxed);
                        debug!(url, error = %e, "Beacon failed");
                        false
                    }
                }
            }
        }
    }

    async fn dispatch(
        &self,
        entry: &'static str,
        request: RequestContext,
    ) -> Result<ResponseContext, NetworkError> {
        let prepared = match self.prepare(request) {
            Dispatch::Send(prepared) => prepared,
            Dispatch::ShortCircuit(response) => return Ok(response),
        };

        let url = prepared.request().url.clone();
        trace!(entry, url = %url, "Sending request");

        match self.transport.send(prepared.into_request()).await {
            Ok(response) => Ok(self.finish(response)),
            Err(e) => {
                self.network_errors.fetch_add(1, Ordering::Relaxed);
                warn!(entry, url = %url, error = %e, "Request failed");
                Err(e)
            }
        }
    }

    /// The wrapped transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }
}

impl<T> Interceptor<T> {
    /// Rewrite an outgoing request, or short-circuit it when denylisted.
    pub fn prepare(&self, mut request: RequestContext) -> Dispatch {
        self.requests_total.fetch_add(1, Ordering::Relaxed);

        if self.denylist.matches(&request.url) {
            self.short_circuited.fetch_add(1, Ordering::Relaxed);
            debug!(url = %request.url, "Denylisted request short-circuited");
            return Dispatch::ShortCircuit(ResponseContext::no_content(request.url));
        }

        let urls = self.pipeline.urls();
        let forms = self.pipeline.forms();
        let original_host = urls.host(&request.url);
        let tag = self.edit_tag.as_ref().filter(|tag| {
            original_host
                .as_deref()
                .is_some_and(|host| tag.hosts.is_match(host))
        });

        if !self.strip_params.is_empty() {
            request.url = urls.edit_query(&request.url, |pairs| {
                forms.strip(pairs, &self.strip_params)
            });
        }

        let content_type = request.content_type().map(str::to_string);
        request.body = match request.body {
            Body::Form(mut pairs) => {
                forms.strip(&mut pairs, &self.strip_params);
                if let Some(tag) = tag {
                    forms.merge_tag(&mut pairs, &tag.value);
                }
                Body::Form(pairs)
            }
            Body::Text(text) => Body::Text(self.prepare_text_body(
                text,
                content_type.as_deref(),
                tag.map(|t| t.value.as_str()),
            )),
            other => other,
        };

        let action = self.body_action(&request.body, content_type.as_deref());
        if action.as_deref() == Some(SHORTEN_ACTION) {
            request.url = urls.pin_to_origin(&request.url);
        }

        let mut request = self.pipeline.transform_outbound(request);

        if let Some(host) = urls.host(&request.url) {
            if urls.is_mirror_family(&host) {
                self.header.apply(&mut request);
            }
        }

        debug!(
            method = %request.method,
            url = %request.url,
            tagged = tag.is_some(),
            "Request prepared"
        );
        Dispatch::Send(PreparedRequest { request })
    }

    /// The `action` parameter of a form request body.
    fn body_action(&self, body: &Body, content_type: Option<&str>) -> Option<String> {
        let pairs = match body {
            Body::Form(pairs) => {
                return pairs
                    .iter()
                    .find(|(key, _)| key == "action")
                    .map(|(_, value)| value.clone())
            }
            Body::Text(text) if PayloadShape::detect(content_type, text) == PayloadShape::Form => {
                self.pipeline.forms().parse(text)
            }
            _ => return None,
        };
        pairs
            .into_iter()
            .find(|(key, _)| key == "action")
            .map(|(_, value)| value)
    }

    /// Strip parameters from and tag a textual request body.
    fn prepare_text_body(&self, text: String, content_type: Option<&str>, tag: Option<&str>) -> String {
        let forms = self.pipeline.forms();
        match PayloadShape::detect(content_type, &text) {
            PayloadShape::Form => {
                let mut pairs = forms.parse(&text);
                let mut changed = forms.strip(&mut pairs, &self.strip_params);
                if let Some(tag) = tag {
                    forms.merge_tag(&mut pairs, tag);
                    changed = true;
                }
                if changed {
                    forms.serialize(&pairs)
                } else {
                    text
                }
            }
            PayloadShape::Json => match serde_json::from_str::<JsonValue>(&text) {
                Ok(JsonValue::Object(mut map)) => {
                    let before = map.len();
                    map.retain(|key, _| !self.strip_params.contains(key));
                    if map.len() == before {
                        return text;
                    }
                    serde_json::to_string(&map).unwrap_or(text)
                }
                _ => text,
            },
            _ => text,
        }
    }

    /// Rewrite a received response when its content type is textual.
    pub fn finish(&self, response: ResponseContext) -> ResponseContext {
        if !self.content_types.is_rewritable(response.content_type()) {
            self.responses_passed_through.fetch_add(1, Ordering::Relaxed);
            trace!(
                url = %response.url,
                content_type = ?response.content_type(),
                "Response passed through"
            );
            return response;
        }

        self.responses_transformed.fetch_add(1, Ordering::Relaxed);
        let response = self.pipeline.transform_inbound(response);
        debug!(url = %response.url, status = response.status, "Response transformed");
        response
    }

    /// The shared content pipeline.
    pub fn pipeline(&self) -> &ContentPipeline {
        &self.pipeline
    }

    /// Current counter values.
    pub fn metrics(&self) -> InterceptorMetrics {
        InterceptorMetrics {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            short_circuited: self.short_circuited.load(Ordering::Relaxed),
            responses_transformed: self.responses_transformed.load(Ordering::Relaxed),
            responses_passed_through: self.responses_passed_through.load(Ordering::Relaxed),
            network_errors: self.network_errors.load(Ordering::Relaxed),
        }
    }
}
