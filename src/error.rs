//! Transport error taxonomy.
//!
//! Every transfer failure surfaces as a single [`HttpError`] carrying an
//! exhaustively-matchable [`ErrorKind`], the originating request and — when a
//! partial or complete response exists — the response as well. Low-level
//! transport faults are produced as [`TransportCode`] values by the wire layer
//! and translated through one static, closed [`classify`] table at completion
//! time.

use std::fmt;
use std::sync::Arc;

use crate::request::Request;
use crate::response::Response;

/// Convenience type alias for weft-http results.
pub type Result<T> = std::result::Result<T, HttpError>;

/// Low-level transport fault codes produced by the wire layer.
///
/// The set mirrors the classic libcurl error numbers for the faults this
/// transport can actually hit, so logs stay greppable against curl
/// documentation. [`TransportCode::Unknown`] covers everything unmapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportCode {
    /// The URL scheme is not one this transport speaks.
    UnsupportedProtocol,
    /// The URL could not be parsed at all.
    UrlMalformat,
    /// The proxy host did not resolve.
    CouldntResolveProxy,
    /// The target host did not resolve.
    CouldntResolveHost,
    /// TCP connect (directly or through the proxy) failed.
    CouldntConnect,
    /// The transfer exceeded its time budget.
    OperationTimedOut,
    /// TLS handshake failure.
    SslConnectError,
    /// The server certificate was rejected.
    SslCertProblem,
    /// No acceptable cipher suite.
    SslCipher,
    /// The certificate issuer was rejected.
    SslIssuerError,
    /// The redirect limit was exceeded.
    TooManyRedirects,
    /// Reading the response failed mid-transfer.
    RecvError,
    /// Writing the request failed.
    SendError,
    /// Anything the table above does not name.
    Unknown,
}

impl TransportCode {
    /// The numeric code, matching libcurl's `CURLE_*` numbering where one
    /// exists (0 for [`TransportCode::Unknown`]).
    pub fn code(self) -> u32 {
        match self {
            Self::UnsupportedProtocol => 1,
            Self::UrlMalformat => 3,
            Self::CouldntResolveProxy => 5,
            Self::CouldntResolveHost => 6,
            Self::CouldntConnect => 7,
            Self::OperationTimedOut => 28,
            Self::SslConnectError => 35,
            Self::TooManyRedirects => 47,
            Self::SendError => 55,
            Self::RecvError => 56,
            Self::SslCertProblem => 58,
            Self::SslCipher => 59,
            Self::SslIssuerError => 83,
            Self::Unknown => 0,
        }
    }
}

/// The closed set of failure kinds a caller can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The URL was somehow invalid.
    InvalidUrl,
    /// The URL scheme (e.g. `http` or `https`) is missing.
    MissingSchema,
    /// The HTTP method is not supported.
    InvalidMethod,
    /// The transfer or the wait for its result timed out.
    Timeout,
    /// A connection-level failure (resolve, connect, reset).
    Connection,
    /// A TLS failure.
    Ssl,
    /// The redirect limit was exceeded.
    TooManyRedirects,
    /// A proxy-related failure.
    Proxy,
    /// An HTTP error status surfaced via `raise_for_status`. Never produced
    /// by the transport itself.
    Http,
    /// Catch-all for unmapped transport faults.
    Transport,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidUrl => "invalid URL",
            Self::MissingSchema => "missing schema",
            Self::InvalidMethod => "invalid method",
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::Ssl => "SSL",
            Self::TooManyRedirects => "too many redirects",
            Self::Proxy => "proxy",
            Self::Http => "HTTP status",
            Self::Transport => "transport",
        };
        f.write_str(name)
    }
}

/// Map a transport fault code to exactly one [`ErrorKind`].
///
/// This is the only path from wire-level faults into the caller-visible
/// taxonomy. Codes absent from the original mapping fall through to
/// [`ErrorKind::Transport`], mirroring the catch-all of the table this is
/// derived from.
pub fn classify(code: TransportCode) -> ErrorKind {
    match code {
        TransportCode::UnsupportedProtocol | TransportCode::UrlMalformat => ErrorKind::InvalidUrl,
        TransportCode::CouldntResolveHost | TransportCode::CouldntConnect => ErrorKind::Connection,
        TransportCode::OperationTimedOut => ErrorKind::Timeout,
        TransportCode::SslConnectError
        | TransportCode::SslCertProblem
        | TransportCode::SslCipher
        | TransportCode::SslIssuerError => ErrorKind::Ssl,
        TransportCode::TooManyRedirects => ErrorKind::TooManyRedirects,
        TransportCode::CouldntResolveProxy => ErrorKind::Proxy,
        TransportCode::RecvError | TransportCode::SendError | TransportCode::Unknown => {
            ErrorKind::Transport
        }
    }
}

/// A wire-level fault before classification: a code plus human detail.
#[derive(Debug, Clone)]
pub(crate) struct TransportFault {
    pub code: TransportCode,
    pub detail: String,
    /// The connection died before yielding any response data, so the
    /// request may be replayed safely on a fresh connection.
    pub stale: bool,
}

impl TransportFault {
    pub fn new(code: TransportCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
            stale: false,
        }
    }

    pub fn stale(code: TransportCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
            stale: true,
        }
    }
}

/// A typed transport failure.
///
/// Displays as a composite of the request, the response status (if any) and
/// the transport code (if any), e.g.
/// `timeout error: request(GET "https://example.com/")`.
#[derive(Debug, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct HttpError {
    kind: ErrorKind,
    message: String,
    request: Option<Arc<Request>>,
    response: Option<Box<Response>>,
    code: Option<TransportCode>,
}

impl HttpError {
    /// Build an error of the given kind with a plain message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            request: None,
            response: None,
            code: None,
        }
    }

    /// Build an error from a wire-level fault, classifying its code through
    /// the static table.
    pub(crate) fn from_transport(
        fault: TransportFault,
        request: Arc<Request>,
        response: Option<Response>,
    ) -> Self {
        let kind = classify(fault.code);
        let mut parts = vec![format!(
            "request({} \"{}\")",
            request.method().as_str(),
            request.url()
        )];
        if let Some(resp) = &response {
            parts.push(format!("response({})", resp.status_code()));
        }
        parts.push(format!(
            "transport error({}): {}",
            fault.code.code(),
            fault.detail
        ));
        Self {
            kind,
            message: parts.join(", "),
            request: Some(request),
            response: response.map(Box::new),
            code: Some(fault.code),
        }
    }

    /// A timeout observed while waiting on a future, carrying only the
    /// request (the transfer itself may still complete in the background).
    pub(crate) fn wait_timeout(request: Arc<Request>) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!(
                "request({} \"{}\") did not complete before its deadline",
                request.method().as_str(),
                request.url()
            ),
        )
        .with_request(request)
    }

    /// Attach the originating request.
    pub fn with_request(mut self, request: Arc<Request>) -> Self {
        self.request = Some(request);
        self
    }

    /// Attach a (partial or complete) response.
    pub fn with_response(mut self, response: Response) -> Self {
        self.response = Some(Box::new(response));
        self
    }

    /// The failure kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The originating request, when known.
    pub fn request(&self) -> Option<&Request> {
        self.request.as_deref()
    }

    /// The response this failure carries, when one exists.
    pub fn response(&self) -> Option<&Response> {
        self.response.as_deref()
    }

    /// Take the carried response out of the error.
    pub fn into_response(self) -> Option<Response> {
        self.response.map(|boxed| *boxed)
    }

    /// The wire-level fault code, for failures that came off the wire.
    pub fn transport_code(&self) -> Option<TransportCode> {
        self.code
    }

    /// True for [`ErrorKind::Timeout`] failures.
    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }
}
