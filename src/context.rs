//! Logical request and response values passed through the interceptor.

use std::collections::HashMap;

/// Header multi-map. Names are stored lowercased.
pub type Headers = HashMap<String, Vec<String>>;

/// Request or response body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Body {
    /// No body
    #[default]
    Empty,
    /// Text body (JSON, urlencoded, markup, plain text)
    Text(String),
    /// Structured form parameters, in order; keys may repeat
    Form(Vec<(String, String)>),
    /// Opaque bytes; never rewritten
    Binary(Vec<u8>),
}

impl Body {
    /// Whether the body carries no data.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Text(s) => s.is_empty(),
            Self::Form(pairs) => pairs.is_empty(),
            Self::Binary(bytes) => bytes.is_empty(),
        }
    }

    /// Body size in bytes (form bodies count keys and values).
    pub fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Text(s) => s.len(),
            Self::Form(pairs) => pairs.iter().map(|(k, v)| k.len() + v.len()).sum(),
            Self::Binary(bytes) => bytes.len(),
        }
    }
}

/// Outgoing request produced by the collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// HTTP method
    pub method: String,
    /// Absolute or page-relative URL
    pub url: String,
    /// Request headers
    pub headers: Headers,
    /// Request body
    pub body: Body,
}

impl RequestContext {
    /// Create a request without headers or body.
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into().to_uppercase(),
            url: url.into(),
            headers: HashMap::new(),
            body: Body::Empty,
        }
    }

    /// Add a header value.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        append_header(&mut self.headers, name, value.into());
        self
    }

    /// Set the body.
    pub fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    /// Get a single header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        first_header(&self.headers, name)
    }

    /// Replace every value of a header.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers
            .insert(name.to_lowercase(), vec![value.into()]);
    }

    /// Declared content type.
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }
}

/// Incoming response returned to the collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseContext {
    /// URL the response was fetched from
    pub url: String,
    /// HTTP status code
    pub status: u16,
    /// Status text
    pub status_text: String,
    /// Response headers
    pub headers: Headers,
    /// Response body
    pub body: String,
}

impl ResponseContext {
    /// Create a response with the standard status text.
    pub fn new(url: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status,
            status_text: status_text(status),
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    /// Synthesized empty success for a request that was never sent.
    pub fn no_content(url: impl Into<String>) -> Self {
        let date = chrono::Utc::now()
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();
        Self::new(url, 204, "").with_header("date", date)
    }

    /// Add a header value.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        append_header(&mut self.headers, name, value.into());
        self
    }

    /// Get a single header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        first_header(&self.headers, name)
    }

    /// Declared content type.
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }
}

fn append_header(headers: &mut Headers, name: &str, value: String) {
    headers.entry(name.to_lowercase()).or_default().push(value);
}

fn first_header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .get(&name.to_lowercase())
        .and_then(|v| v.first())
        .map(|s| s.as_str())
}

/// Get status text for a status code.
pub fn status_text(code: u16) -> String {
    match code {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_are_case_insensitive() {
        let request = RequestContext::new("post", "https://mirror.test/w/api.php")
            .with_header("Content-Type", "application/json");
        assert_eq!(request.method, "POST");
        assert_eq!(request.header("content-type"), Some("application/json"));
        assert_eq!(request.content_type(), Some("application/json"));
        assert!(request.headers.contains_key("content-type"));
    }

    #[test]
    fn test_set_header_replaces() {
        let mut request = RequestContext::new("GET", "/")
            .with_header("X-A", "1")
            .with_header("x-a", "2");
        assert_eq!(request.headers["x-a"].len(), 2);
        request.set_header("X-A", "3");
        assert_eq!(request.headers["x-a"], vec!["3".to_string()]);
    }

    #[test]
    fn test_no_content() {
        let response = ResponseContext::no_content("https://intake-analytics.example/beacon");
        assert_eq!(response.status, 204);
        assert_eq!(response.status_text, "No Content");
        assert!(response.body.is_empty());
        assert!(response.header("date").is_some_and(|d| d.ends_with("GMT")));
    }

    #[test]
    fn test_body_helpers() {
        assert!(Body::Empty.is_empty());
        assert_eq!(Body::Text("abc".into()).len(), 3);
        assert_eq!(
            Body::Form(vec![("a".into(), "bc".into())]).len(),
            3
        );
        assert!(!Body::Binary(vec![1]).is_empty());
    }

    #[test]
    fn test_status_text() {
        assert_eq!(status_text(200), "OK");
        assert_eq!(status_text(599), "Unknown");
    }
}
