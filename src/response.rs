//! Immutable response value.
//!
//! A [`Response`] is built exactly once per completed transfer. The raw
//! header buffer is parsed at construction time by the pure functions in
//! [`crate::parse`]; from then on the value is read-only to callers. Only
//! the decoded body text is computed lazily, cached in a `OnceLock` so the
//! computation happens at most once and the value stays outwardly immutable.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::error::{ErrorKind, HttpError, Result};
use crate::parse::{
    charset_from_content_type, decode_reason, decode_text, parse_header_blocks, HeaderMap,
    ParsedHeaders,
};
use crate::request::Request;

/// Per-phase transfer timing, the native analogue of the curl timer set.
///
/// Phases are cumulative from the start of the transfer. `redirect` is the
/// time spent on all non-final hops.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timing {
    /// DNS resolution done.
    pub namelookup: Duration,
    /// TCP connection established.
    pub connect: Duration,
    /// TLS handshake done (zero for plain HTTP).
    pub appconnect: Duration,
    /// Request fully written.
    pub pretransfer: Duration,
    /// First response byte received.
    pub starttransfer: Duration,
    /// Transfer complete.
    pub total: Duration,
    /// Time consumed by redirect hops.
    pub redirect: Duration,
}

/// A completed HTTP response.
pub struct Response {
    request: Arc<Request>,
    url: String,
    content: Vec<u8>,
    raw_headers: Vec<u8>,
    parsed: ParsedHeaders,
    timing: Timing,
    elapsed: Duration,
    text: OnceLock<String>,
}

impl Response {
    /// Build a response from the raw transfer artefacts, parsing the header
    /// section once. A completely unparsable header section fails this
    /// response only.
    pub(crate) fn from_transfer(
        request: Arc<Request>,
        url: String,
        content: Vec<u8>,
        raw_headers: Vec<u8>,
        timing: Timing,
        elapsed: Duration,
    ) -> Result<Self> {
        let parsed = parse_header_blocks(&raw_headers, &url).map_err(|err| {
            HttpError::new(ErrorKind::Transport, err.to_string()).with_request(request.clone())
        })?;
        Ok(Self {
            request,
            url,
            content,
            raw_headers,
            parsed,
            timing,
            elapsed,
            text: OnceLock::new(),
        })
    }

    /// The request that produced this response.
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub(crate) fn request_arc(&self) -> Arc<Request> {
        self.request.clone()
    }

    /// The final effective URL, after any redirects.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Raw body bytes.
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Raw header bytes, one block per redirect hop plus the final response.
    pub fn raw_headers(&self) -> &[u8] {
        &self.raw_headers
    }

    /// Status code of the final response.
    pub fn status_code(&self) -> u16 {
        self.parsed.status.code
    }

    /// Protocol token from the final status line, e.g. `HTTP/1.1`.
    pub fn version(&self) -> &str {
        &self.parsed.status.version
    }

    /// Headers of the final response block.
    pub fn headers(&self) -> &HeaderMap {
        &self.parsed.headers
    }

    /// Cookie map collected leniently from all `Set-Cookie` headers.
    pub fn cookies(&self) -> &[(String, String)] {
        &self.parsed.cookies
    }

    /// Look up one cookie by name.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.parsed
            .cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Redirect history: one URL per followed hop, empty when the transfer
    /// went straight to its final destination.
    pub fn history(&self) -> &[String] {
        &self.parsed.history
    }

    /// The declared `Content-Type`, if any.
    pub fn content_type(&self) -> Option<&str> {
        self.parsed.headers.get("content-type")
    }

    /// The charset declared in the `Content-Type`, lowercased.
    pub fn encoding(&self) -> Option<String> {
        self.content_type().and_then(charset_from_content_type)
    }

    /// The reason phrase, decoded from the declared charset with a
    /// Latin-1-compatible fallback.
    pub fn reason(&self) -> String {
        decode_reason(&self.parsed.status.reason, self.encoding().as_deref())
    }

    /// The body decoded to text: declared charset first, content sniffing
    /// otherwise, with the BOM-aware UTF-8 path. Computed once and cached.
    pub fn text(&self) -> &str {
        self.text
            .get_or_init(|| decode_text(&self.content, self.encoding().as_deref()))
    }

    /// Deserialize the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(self.text())
    }

    /// Per-phase transfer timing.
    pub fn timing(&self) -> Timing {
        self.timing
    }

    /// Wall time from submission to completion.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// True iff the status code is below 400. Not a check for `200 OK`.
    pub fn ok(&self) -> bool {
        self.status_code() < 400
    }

    /// Error out for any status in `[400, 600)`; the only path that turns
    /// an HTTP error status into an [`HttpError`]. Statuses never raise on
    /// their own.
    pub fn raise_for_status(&self) -> Result<&Self> {
        let code = self.status_code();
        let class = match code {
            400..=499 => "Client Error",
            500..=599 => "Server Error",
            _ => return Ok(self),
        };
        Err(HttpError::new(
            ErrorKind::Http,
            format!("{code} {class}: {} for url: {}", self.reason(), self.url),
        )
        .with_request(self.request.clone()))
    }

    /// Release resources held by the response. There are none; the body is
    /// fully buffered, so this is a no-op kept for interface symmetry.
    pub fn close(&self) {}

    /// Scoped-use guard over the response; releases nothing on drop.
    pub fn scoped(&self) -> ResponseScope<'_> {
        ResponseScope { response: self }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Response [{}]>", self.status_code())
    }
}

/// RAII view of a [`Response`]; calls [`Response::close`] on drop.
#[derive(Debug)]
pub struct ResponseScope<'a> {
    response: &'a Response,
}

impl std::ops::Deref for ResponseScope<'_> {
    type Target = Response;

    fn deref(&self) -> &Response {
        self.response
    }
}

impl Drop for ResponseScope<'_> {
    fn drop(&mut self) {
        self.response.close();
    }
}
