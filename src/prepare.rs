//! Request preparation: turn an immutable [`Request`] into a fully
//! configured, ready-to-execute transfer.
//!
//! This is where every per-request rule lives: URL normalisation and
//! requoting, query parameter encoding, proxy selection precedence, method
//! and body rules, header and cookie serialization, and the timeout applied
//! as both connect and total budget. Nothing here touches the network.

use std::sync::Arc;
use std::time::Duration;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use url::Url;

use crate::error::{ErrorKind, HttpError, Result};
use crate::pool::CookieJar;
use crate::request::{Body, Request};

/// Characters never percent-encoded (RFC 3986 unreserved set).
const UNRESERVED: &str =
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

/// Everything to percent-encode when `%` itself is trusted: all bytes
/// except unreserved characters, the reserved set and `%`.
const QUOTE_WITH_PERCENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'%')
    .remove(b'&')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b'*')
    .remove(b'+')
    .remove(b',')
    .remove(b'/')
    .remove(b':')
    .remove(b';')
    .remove(b'=')
    .remove(b'?')
    .remove(b'@')
    .remove(b'[')
    .remove(b']');

/// Same set but with `%` encoded, for URIs whose escapes are broken.
const QUOTE_WITHOUT_PERCENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b'*')
    .remove(b'+')
    .remove(b',')
    .remove(b'/')
    .remove(b':')
    .remove(b';')
    .remove(b'=')
    .remove(b'?')
    .remove(b'@')
    .remove(b'[')
    .remove(b']');

/// Proxy protocol kinds recognised in proxy URLs.
///
/// SOCKS variants are part of the recognised table but this transport only
/// tunnels through HTTP proxies; selecting a SOCKS proxy is a typed
/// [`ErrorKind::Proxy`] failure rather than an unknown-scheme one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Http,
    Https,
    Socks4,
    Socks4a,
    Socks5,
    Socks5Hostname,
}

impl ProxyKind {
    fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            "socks4" => Some(Self::Socks4),
            "socks4a" => Some(Self::Socks4a),
            "socks5" => Some(Self::Socks5),
            "socks5-hostname" => Some(Self::Socks5Hostname),
            _ => None,
        }
    }

    fn is_supported(self) -> bool {
        matches!(self, Self::Http | Self::Https)
    }
}

/// A resolved proxy target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySpec {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
}

/// A transfer fully configured from a request, ready for the wire layer.
#[derive(Debug, Clone)]
pub struct PreparedTransfer {
    pub(crate) request: Arc<Request>,
    /// The requoted final URL.
    pub(crate) url: Url,
    /// Serialized `Name: value` lines in insertion order, including the
    /// cookie header when there is one.
    pub(crate) header_lines: Vec<String>,
    /// Encoded body bytes.
    pub(crate) body: Vec<u8>,
    /// `Content-Type` implied by the body encoding, unless the caller set
    /// one explicitly.
    pub(crate) body_content_type: Option<&'static str>,
    /// Connect and total timeout.
    pub(crate) timeout: Duration,
    pub(crate) proxy: Option<ProxySpec>,
    pub(crate) allow_redirects: bool,
    pub(crate) max_redirects: u32,
}

impl PreparedTransfer {
    /// Configure a transfer from a request, merging in shared-jar cookies
    /// when the session shares them.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::MissingSchema`], [`ErrorKind::InvalidUrl`],
    /// [`ErrorKind::Proxy`] or [`ErrorKind::Transport`] (streaming
    /// unsupported), each checked before any I/O happens.
    pub(crate) fn prepare(request: Arc<Request>, jar: Option<&CookieJar>) -> Result<Self> {
        if request.stream() {
            return Err(HttpError::new(
                ErrorKind::Transport,
                "streaming responses are not supported by the whole-body path",
            )
            .with_request(request));
        }

        let body_allowed = request.method().allows_body();
        if !body_allowed && !request.body().is_empty() {
            tracing::warn!(
                method = %request.method(),
                "dropping body: method never carries one"
            );
        }

        let prepared_url = prepare_url(request.url(), request.params())
            .map_err(|err| err.with_request(request.clone()))?;
        let url = Url::parse(&prepared_url)
            .map_err(|err| {
                HttpError::new(ErrorKind::InvalidUrl, format!("{prepared_url:?}: {err}"))
                    .with_request(request.clone())
            })?;
        let scheme = url.scheme().to_ascii_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(HttpError::new(
                ErrorKind::InvalidUrl,
                format!("unsupported protocol {scheme:?}"),
            )
            .with_request(request));
        }
        let host = url
            .host_str()
            .ok_or_else(|| {
                HttpError::new(
                    ErrorKind::InvalidUrl,
                    format!("Invalid URL {prepared_url:?}: no host supplied"),
                )
                .with_request(request.clone())
            })?
            .to_string();

        let proxy = match select_proxy(&scheme, &host, request.proxies()) {
            Some(proxy_url) => Some(parse_proxy(&proxy_url).map_err(|err| err.with_request(request.clone()))?),
            None => None,
        };

        let mut header_lines: Vec<String> = request
            .headers()
            .iter()
            .map(|(name, value)| format!("{name}: {value}"))
            .collect();

        // Cookie header rebuilt from scratch per transfer: a reused handle
        // can never leak a previous request's cookies.
        let cookie_header = assemble_cookie_header(&host, request.cookies(), jar);
        if let Some(cookie_header) = cookie_header {
            header_lines.push(format!("Cookie: {cookie_header}"));
        }

        let (body, body_content_type) = if body_allowed {
            encode_body(request.body())
        } else {
            (Vec::new(), None)
        };

        Ok(Self {
            request: request.clone(),
            url,
            header_lines,
            body,
            body_content_type,
            timeout: request.timeout(),
            proxy,
            allow_redirects: request.allow_redirects(),
            max_redirects: request.max_redirects(),
        })
    }

    pub(crate) fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }
}

/// Prepare a URL: trim, validate scheme and host, default the path,
/// append query parameters and requote the whole thing.
///
/// Non-HTTP schemes such as `mailto:` pass through untouched; the caller
/// rejects them if it cannot execute them.
pub fn prepare_url(url: &str, params: &[(String, String)]) -> Result<String> {
    let url = url.trim_start();

    // Byte comparison: the prefix may end mid-character in a non-ASCII URL.
    if url.contains(':') && !url.as_bytes()[..url.len().min(4)].eq_ignore_ascii_case(b"http") {
        return Ok(url.to_string());
    }

    let mut parsed = match Url::parse(url) {
        Ok(parsed) => parsed,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            return Err(HttpError::new(
                ErrorKind::MissingSchema,
                format!("Invalid URL {url:?}: no schema supplied. Perhaps you meant http://{url}?"),
            ));
        }
        Err(url::ParseError::EmptyHost) => {
            return Err(HttpError::new(
                ErrorKind::InvalidUrl,
                format!("Invalid URL {url:?}: no host supplied"),
            ));
        }
        Err(err) => {
            return Err(HttpError::new(
                ErrorKind::InvalidUrl,
                format!("Invalid URL {url:?}: {err}"),
            ));
        }
    };
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(HttpError::new(
            ErrorKind::InvalidUrl,
            format!("Invalid URL {url:?}: no host supplied"),
        ));
    }
    // The url crate already defaults an empty path to "/" for http(s).

    if !params.is_empty() {
        let encoded: String = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish();
        let query = match parsed.query() {
            Some(existing) if !existing.is_empty() => format!("{existing}&{encoded}"),
            _ => encoded,
        };
        parsed.set_query(Some(&query));
    }

    Ok(requote_uri(parsed.as_str()))
}

/// Re-quote a URI so it is fully and consistently percent-encoded.
///
/// Unreserved characters are percent-decoded first, then everything outside
/// reserved ∪ unreserved ∪ `%` is encoded. The operation is idempotent:
/// requoting twice equals requoting once. An alphanumeric-but-not-hex escape
/// such as `%zz` triggers a fallback that quotes with `%` treated as unsafe;
/// a short or trailing `%` is left as it is.
pub fn requote_uri(uri: &str) -> String {
    match unquote_unreserved(uri) {
        Ok(unquoted) => utf8_percent_encode(&unquoted, QUOTE_WITH_PERCENT).to_string(),
        Err(_) => utf8_percent_encode(uri, QUOTE_WITHOUT_PERCENT).to_string(),
    }
}

struct BadEscape;

/// Percent-decode only escapes of unreserved characters; leave every other
/// escape untouched. An alphanumeric-but-not-hex escape is an error.
fn unquote_unreserved(uri: &str) -> std::result::Result<String, BadEscape> {
    let mut parts = uri.split('%');
    let mut out = String::with_capacity(uri.len());
    out.push_str(parts.next().unwrap_or_default());
    for part in parts {
        let hex: String = part.chars().take(2).collect();
        if hex.len() == 2 && hex.chars().all(|c| c.is_ascii_alphanumeric()) {
            let value = u8::from_str_radix(&hex, 16).map_err(|_| BadEscape)?;
            let decoded = char::from(value);
            if UNRESERVED.contains(decoded) {
                out.push(decoded);
                out.push_str(&part[2..]);
            } else {
                out.push('%');
                out.push_str(part);
            }
        } else {
            out.push('%');
            out.push_str(part);
        }
    }
    Ok(out)
}

/// Select a proxy for a scheme/host pair.
///
/// Precedence, first match wins: `scheme://host`, `scheme`, `all://host`,
/// `all`. No match means a direct connection.
pub fn select_proxy(
    scheme: &str,
    host: &str,
    proxies: &std::collections::HashMap<String, String>,
) -> Option<String> {
    let keys = [
        format!("{scheme}://{host}"),
        scheme.to_string(),
        format!("all://{host}"),
        "all".to_string(),
    ];
    keys.iter().find_map(|key| proxies.get(key).cloned())
}

fn parse_proxy(proxy_url: &str) -> Result<ProxySpec> {
    let (scheme, netloc) = proxy_url.split_once("://").ok_or_else(|| {
        HttpError::new(
            ErrorKind::Proxy,
            format!("proxy URL {proxy_url:?} has no scheme"),
        )
    })?;
    let kind = ProxyKind::from_scheme(scheme).ok_or_else(|| {
        HttpError::new(
            ErrorKind::Proxy,
            format!("unknown proxy type {scheme:?}"),
        )
    })?;
    if !kind.is_supported() {
        return Err(HttpError::new(
            ErrorKind::Proxy,
            format!("proxy type {scheme:?} is not supported by this transport"),
        ));
    }
    let netloc = netloc.trim_end_matches('/');
    let (host, port) = match netloc.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| {
                HttpError::new(
                    ErrorKind::Proxy,
                    format!("invalid proxy port in {proxy_url:?}"),
                )
            })?;
            (host.to_string(), port)
        }
        // curl's default proxy port.
        None => (netloc.to_string(), 1080),
    };
    if host.is_empty() {
        return Err(HttpError::new(
            ErrorKind::Proxy,
            format!("proxy URL {proxy_url:?} has no host"),
        ));
    }
    Ok(ProxySpec { kind, host, port })
}

/// Merge shared-jar cookies for this host with the request's own cookies
/// (request cookies win on a name clash) and serialize them in insertion
/// order. Returns `None` when there is nothing to send.
fn assemble_cookie_header(
    host: &str,
    request_cookies: &[(String, String)],
    jar: Option<&CookieJar>,
) -> Option<String> {
    let mut pairs: Vec<(String, String)> = jar
        .map(|jar| jar.cookies_for(host))
        .unwrap_or_default();
    for (name, value) in request_cookies {
        pairs.retain(|(n, _)| n != name);
        pairs.push((name.clone(), value.clone()));
    }
    if pairs.is_empty() {
        return None;
    }
    Some(
        pairs
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; "),
    )
}

fn encode_body(body: &Body) -> (Vec<u8>, Option<&'static str>) {
    match body {
        Body::Empty => (Vec::new(), None),
        Body::Form(pairs) => {
            let encoded: String = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs)
                .finish();
            (
                encoded.into_bytes(),
                Some("application/x-www-form-urlencoded"),
            )
        }
        Body::Bytes(bytes) => (bytes.clone(), None),
        Body::Text(text) => (text.clone().into_bytes(), None),
    }
}
