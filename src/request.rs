//! Immutable request description.
//!
//! A [`Request`] is built once from a method, a URL and a set of
//! [`RequestOptions`] (session defaults fill any field the caller left
//! unset), then shared as `Arc<Request>` for its whole lifetime: the
//! preparer, the wire layer, the future and the error taxonomy all hold
//! references to the same immutable value.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::budget::TimeBudget;
use crate::error::{ErrorKind, HttpError};
use crate::parse::HeaderMap;

/// Redirect ceiling applied whenever redirects are enabled.
pub const DEFAULT_REDIRECT_LIMIT: u32 = 30;

/// Default per-request timeout when neither the caller nor a budget
/// supplies one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Progress callback invoked as response body bytes arrive, with
/// `(expected_total, received_so_far)`. `expected_total` is 0 when the
/// response length is not known up front.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// HTTP methods this transport supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
}

impl Method {
    /// The canonical upper-case token for the request line.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
        }
    }

    /// Parse a method token (case-insensitive). Anything outside the
    /// supported set is an [`ErrorKind::InvalidMethod`] failure.
    pub fn parse(token: &str) -> Result<Self, HttpError> {
        match token.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "HEAD" => Ok(Self::Head),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            "OPTIONS" => Ok(Self::Options),
            other => Err(HttpError::new(
                ErrorKind::InvalidMethod,
                format!("the transport does not support {other}"),
            )),
        }
    }

    /// Whether a request with this method may carry a body.
    /// GET and HEAD never do.
    pub fn allows_body(&self) -> bool {
        !matches!(self, Self::Get | Self::Head)
    }

    /// Whether a response to this method carries a body at all.
    pub fn response_has_body(&self) -> bool {
        !matches!(self, Self::Head)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol-version preference carried by a request.
///
/// The wire layer speaks HTTP/1.1; the preference only takes effect when a
/// multiplex-capable transport backs the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpVersion {
    /// Plain HTTP/1.1, one exchange at a time per connection.
    #[default]
    Http11,
    /// Prefer a multiplexed protocol when the transport supports one.
    Http2,
}

/// Request body payload.
#[derive(Debug, Clone, Default)]
pub enum Body {
    /// No body.
    #[default]
    Empty,
    /// Key/value pairs, urlencoded as `application/x-www-form-urlencoded`.
    /// Pair order is retained.
    Form(Vec<(String, String)>),
    /// Raw bytes, sent as-is.
    Bytes(Vec<u8>),
    /// UTF-8 text, sent as-is.
    Text(String),
}

impl Body {
    /// True when there is nothing to send.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Form(pairs) => pairs.is_empty(),
            Self::Bytes(bytes) => bytes.is_empty(),
            Self::Text(text) => text.is_empty(),
        }
    }
}

/// Per-request options, the keyword-argument surface of [`crate::Session`].
///
/// Every field is optional; unset fields inherit the session defaults when
/// the request is built.
#[derive(Clone, Default)]
pub struct RequestOptions {
    /// Extra headers, serialized in insertion order.
    pub headers: HeaderMap,
    /// Request body.
    pub body: Body,
    /// Query parameters appended to the URL's existing query.
    pub params: Vec<(String, String)>,
    /// Cookies serialized into a single `Cookie` header.
    pub cookies: Vec<(String, String)>,
    /// Streaming flag. The whole-body path rejects `true` at submission.
    pub stream: Option<bool>,
    /// Whether to follow redirects.
    pub allow_redirects: Option<bool>,
    /// Redirect ceiling override.
    pub max_redirects: Option<u32>,
    /// Protocol-version preference.
    pub http_version: Option<HttpVersion>,
    /// Total and connect timeout.
    pub timeout: Option<Duration>,
    /// TLS certificate verification.
    pub verify: Option<bool>,
    /// Proxy map override (scheme/host → proxy URL).
    pub proxies: Option<HashMap<String, String>>,
    /// Verbose wire logging for this request.
    pub debug: bool,
    /// Progress callback.
    pub progress: Option<ProgressFn>,
    /// Per-search wall-clock budget this request counts against.
    pub budget: Option<TimeBudget>,
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("headers", &self.headers)
            .field("params", &self.params)
            .field("timeout", &self.timeout)
            .field("allow_redirects", &self.allow_redirects)
            .finish_non_exhaustive()
    }
}

/// Session-level defaults merged into unset [`RequestOptions`] fields.
#[derive(Debug, Clone)]
pub(crate) struct RequestDefaults {
    pub stream: bool,
    pub verify: bool,
    pub proxies: HashMap<String, String>,
    pub max_redirects: u32,
    pub http_version: HttpVersion,
    pub timeout: Duration,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            stream: false,
            verify: true,
            proxies: HashMap::new(),
            max_redirects: DEFAULT_REDIRECT_LIMIT,
            http_version: HttpVersion::Http11,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// An immutable description of one outbound call.
///
/// The timeout is normalised to milliseconds at construction and applied as
/// both the connect timeout and the total transfer timeout.
#[derive(Clone)]
pub struct Request {
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Body,
    params: Vec<(String, String)>,
    cookies: Vec<(String, String)>,
    stream: bool,
    allow_redirects: bool,
    max_redirects: u32,
    http_version: HttpVersion,
    timeout_ms: u64,
    verify: bool,
    proxies: HashMap<String, String>,
    debug: bool,
    progress: Option<ProgressFn>,
}

impl Request {
    /// Build a request from options plus session defaults.
    pub(crate) fn from_options(
        method: Method,
        url: &str,
        options: RequestOptions,
        defaults: &RequestDefaults,
    ) -> Self {
        let timeout = options.timeout.unwrap_or(defaults.timeout);
        Self {
            method,
            url: url.to_string(),
            headers: options.headers,
            body: options.body,
            params: options.params,
            cookies: options.cookies,
            stream: options.stream.unwrap_or(defaults.stream),
            allow_redirects: options.allow_redirects.unwrap_or(true),
            max_redirects: options.max_redirects.unwrap_or(defaults.max_redirects),
            http_version: options.http_version.unwrap_or(defaults.http_version),
            timeout_ms: timeout.as_millis() as u64,
            verify: options.verify.unwrap_or(defaults.verify),
            proxies: options.proxies.unwrap_or_else(|| defaults.proxies.clone()),
            debug: options.debug,
            progress: options.progress,
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// The URL exactly as supplied by the caller (before normalisation).
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn cookies(&self) -> &[(String, String)] {
        &self.cookies
    }

    pub fn stream(&self) -> bool {
        self.stream
    }

    pub fn allow_redirects(&self) -> bool {
        self.allow_redirects
    }

    pub fn max_redirects(&self) -> u32 {
        self.max_redirects
    }

    pub fn http_version(&self) -> HttpVersion {
        self.http_version
    }

    /// The timeout, normalised to milliseconds.
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// The timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn verify(&self) -> bool {
        self.verify
    }

    pub fn proxies(&self) -> &HashMap<String, String> {
        &self.proxies
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub(crate) fn progress(&self) -> Option<&ProgressFn> {
        self.progress.as_ref()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Request [{} {}]>", self.method.as_str(), self.url)
    }
}
