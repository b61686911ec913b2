//! The wire layer: plain HTTP/1.1 over TCP or TLS.
//!
//! [`execute`] drives one whole transfer — connect (directly or through an
//! HTTP proxy), write the request, read the response, follow redirects up to
//! the request's limit — and hands back the raw artefacts: the accumulated
//! header blocks of every hop, the final body and per-phase timing. All
//! failures come out as [`TransportFault`] values; classification into the
//! caller-visible taxonomy happens later.
//!
//! Connections are reused: a keep-alive connection left over from a previous
//! transfer on the same handle is tried first, with a single retry on a fresh
//! connection when the server already closed it.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::TlsConnector;
use url::Url;

use crate::error::{TransportCode, TransportFault};
use crate::parse::{parse_header_line, parse_status_line, HeaderMap, StatusLine};
use crate::pool::{Handle, SharedCaches};
use crate::prepare::{PreparedTransfer, ProxySpec};
use crate::request::{Method, ProgressFn};
use crate::response::Timing;

/// Identity of a reusable connection: same target, same TLS posture, same
/// proxy (or none).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ConnKey {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub verify: bool,
    pub proxy: Option<(String, u16)>,
}

/// An established connection, possibly TLS-wrapped, with read buffering.
pub(crate) struct Conn {
    stream: BufReader<ConnStream>,
}

enum ConnStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for ConnStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ConnStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Raw artefacts of a completed transfer.
pub(crate) struct TransferSuccess {
    /// The final effective URL after redirects.
    pub url: String,
    /// Header blocks of every hop, concatenated in order.
    pub raw_headers: Vec<u8>,
    pub body: Vec<u8>,
    pub timing: Timing,
}

struct Hop {
    status: StatusLine,
    headers: HeaderMap,
    body: Vec<u8>,
    reusable: bool,
}

/// Run a prepared transfer to completion, following redirects.
pub(crate) async fn execute(
    prepared: &PreparedTransfer,
    handle: &mut Handle,
    caches: &SharedCaches,
) -> Result<TransferSuccess, TransportFault> {
    let start = Instant::now();
    let mut timing = Timing::default();
    let mut raw_headers = Vec::new();

    let mut current_url = prepared.url.clone();
    let mut method = prepared.request.method();
    let mut body = prepared.body.clone();
    let mut body_content_type = prepared.body_content_type;
    let mut hops = 0u32;

    loop {
        let hop = perform_hop(
            prepared,
            handle,
            caches,
            &current_url,
            method,
            &body,
            body_content_type,
            start,
            &mut timing,
        )
        .await?;
        raw_headers.extend_from_slice(&hop.raw_block());

        let location = hop.headers.get("location").map(str::to_string);
        let is_redirect = matches!(hop.status.code, 301 | 302 | 303 | 307 | 308)
            && location.is_some()
            && prepared.allow_redirects;

        if !is_redirect {
            timing.total = start.elapsed();
            return Ok(TransferSuccess {
                url: current_url.to_string(),
                raw_headers,
                body: hop.body,
                timing,
            });
        }

        hops += 1;
        if hops > prepared.max_redirects {
            return Err(TransportFault::new(
                TransportCode::TooManyRedirects,
                format!("stopped after {} redirects", prepared.max_redirects),
            ));
        }
        timing.redirect = start.elapsed();

        let location = location.unwrap_or_default();
        current_url = current_url.join(&location).map_err(|err| {
            TransportFault::new(
                TransportCode::Unknown,
                format!("unresolvable redirect location {location:?}: {err}"),
            )
        })?;
        // 303 always switches to GET; 301/302 do so for POST, matching
        // long-standing client behaviour.
        if hop.status.code == 303 || (matches!(hop.status.code, 301 | 302) && method == Method::Post)
        {
            method = Method::Get;
            body = Vec::new();
            body_content_type = None;
        }
        if prepared.request.debug() {
            tracing::debug!(url = %current_url, status = hop.status.code, "following redirect");
        }
    }
}

// Raw block reconstruction lives on Hop so redirect hops and the final hop
// serialize identically.
impl Hop {
    fn raw_block(&self) -> Vec<u8> {
        let mut block = Vec::new();
        block.extend_from_slice(self.status.version.as_bytes());
        block.push(b' ');
        block.extend_from_slice(self.status.code.to_string().as_bytes());
        if !self.status.reason.is_empty() {
            block.push(b' ');
            block.extend_from_slice(&self.status.reason);
        }
        block.extend_from_slice(b"\r\n");
        for (name, value) in self.headers.iter() {
            block.extend_from_slice(name.as_bytes());
            block.extend_from_slice(b": ");
            block.extend_from_slice(value.as_bytes());
            block.extend_from_slice(b"\r\n");
        }
        block.extend_from_slice(b"\r\n");
        block
    }
}

#[allow(clippy::too_many_arguments)]
async fn perform_hop(
    prepared: &PreparedTransfer,
    handle: &mut Handle,
    caches: &SharedCaches,
    url: &Url,
    method: Method,
    body: &[u8],
    body_content_type: Option<&'static str>,
    start: Instant,
    timing: &mut Timing,
) -> Result<Hop, TransportFault> {
    let key = conn_key(url, prepared);
    let request_bytes = build_request_bytes(method, url, prepared, body, body_content_type);
    if prepared.request.debug() {
        tracing::debug!(
            method = %method,
            url = %url,
            bytes = request_bytes.len(),
            "sending request"
        );
    }

    // A parked keep-alive connection may have been closed by the server;
    // retry exactly once on a fresh one.
    if let Some(mut conn) = handle.take_parked(&key) {
        match exchange(&mut conn, &request_bytes, method, prepared.request.progress(), start, timing)
            .await
        {
            Ok(hop) => {
                finish_hop(handle, key, conn, &hop);
                return Ok(hop);
            }
            Err(fault) if fault.stale => {
                tracing::debug!(detail = %fault.detail, "stale keep-alive connection, reconnecting");
            }
            Err(fault) => return Err(fault),
        }
    }

    let mut conn = establish(url, prepared, handle.source_ip(), caches, start, timing).await?;
    let hop = exchange(&mut conn, &request_bytes, method, prepared.request.progress(), start, timing)
        .await?;
    finish_hop(handle, key, conn, &hop);
    Ok(hop)
}

fn finish_hop(handle: &mut Handle, key: ConnKey, conn: Conn, hop: &Hop) {
    if hop.reusable {
        handle.park(key, conn);
    }
}

fn conn_key(url: &Url, prepared: &PreparedTransfer) -> ConnKey {
    ConnKey {
        scheme: url.scheme().to_string(),
        host: url.host_str().unwrap_or_default().to_string(),
        port: url.port_or_known_default().unwrap_or(80),
        verify: prepared.request.verify(),
        proxy: prepared
            .proxy
            .as_ref()
            .map(|proxy| (proxy.host.clone(), proxy.port)),
    }
}

/// Open a connection to the target, via the proxy when one is selected, and
/// wrap it in TLS for https targets.
async fn establish(
    url: &Url,
    prepared: &PreparedTransfer,
    source_ip: Option<IpAddr>,
    caches: &SharedCaches,
    start: Instant,
    timing: &mut Timing,
) -> Result<Conn, TransportFault> {
    let host = url.host_str().unwrap_or_default();
    let port = url.port_or_known_default().unwrap_or(80);
    let https = url.scheme() == "https";

    let tcp = match &prepared.proxy {
        Some(proxy) => connect_via_proxy(proxy, host, port, https, source_ip, caches, timing, start).await?,
        None => {
            let addrs = caches.resolve(host, port).await?;
            timing.namelookup = start.elapsed();
            let tcp = connect_tcp(&addrs, source_ip).await.map_err(|err| {
                TransportFault::new(
                    TransportCode::CouldntConnect,
                    format!("{host}:{port}: {err}"),
                )
            })?;
            timing.connect = start.elapsed();
            tcp
        }
    };

    let stream = if https {
        let tls = tls_handshake(tcp, host, prepared.request.verify(), caches).await?;
        timing.appconnect = start.elapsed();
        ConnStream::Tls(Box::new(tls))
    } else {
        ConnStream::Plain(tcp)
    };

    Ok(Conn {
        stream: BufReader::new(stream),
    })
}

#[allow(clippy::too_many_arguments)]
async fn connect_via_proxy(
    proxy: &ProxySpec,
    host: &str,
    port: u16,
    tunnel: bool,
    source_ip: Option<IpAddr>,
    caches: &SharedCaches,
    timing: &mut Timing,
    start: Instant,
) -> Result<TcpStream, TransportFault> {
    let addrs = caches.resolve(&proxy.host, proxy.port).await.map_err(|fault| {
        TransportFault::new(TransportCode::CouldntResolveProxy, fault.detail)
    })?;
    timing.namelookup = start.elapsed();
    let mut tcp = connect_tcp(&addrs, source_ip).await.map_err(|err| {
        TransportFault::new(
            TransportCode::CouldntConnect,
            format!("proxy {}:{}: {err}", proxy.host, proxy.port),
        )
    })?;
    timing.connect = start.elapsed();

    if tunnel {
        let connect = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
        tcp.write_all(connect.as_bytes()).await.map_err(|err| {
            TransportFault::new(TransportCode::SendError, format!("proxy CONNECT: {err}"))
        })?;
        let mut reader = BufReader::new(tcp);
        let (status, _headers, _raw) = read_head(&mut reader).await?;
        if !(200..300).contains(&status.code) {
            return Err(TransportFault::new(
                TransportCode::CouldntConnect,
                format!("proxy refused CONNECT with status {}", status.code),
            ));
        }
        tcp = reader.into_inner();
    }
    Ok(tcp)
}

/// Try each resolved address in order, binding to the handle's source
/// address when its family matches.
async fn connect_tcp(addrs: &[SocketAddr], source_ip: Option<IpAddr>) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in addrs {
        let attempt = match source_ip {
            Some(ip) if ip.is_ipv4() == addr.is_ipv4() => bound_connect(ip, *addr).await,
            _ => TcpStream::connect(*addr).await,
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses")))
}

async fn bound_connect(source_ip: IpAddr, addr: SocketAddr) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.bind(SocketAddr::new(source_ip, 0))?;
    socket.connect(addr).await
}

async fn tls_handshake(
    tcp: TcpStream,
    host: &str,
    verify: bool,
    caches: &SharedCaches,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, TransportFault> {
    let connector = TlsConnector::from(caches.tls_config(verify));
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string()).map_err(|err| {
        TransportFault::new(
            TransportCode::SslConnectError,
            format!("invalid server name {host:?}: {err}"),
        )
    })?;
    connector.connect(server_name, tcp).await.map_err(|err| {
        let detail = err.to_string();
        let code = if detail.contains("certificate") || detail.contains("UnknownIssuer") {
            TransportCode::SslCertProblem
        } else {
            TransportCode::SslConnectError
        };
        TransportFault::new(code, detail)
    })
}

/// Write the request and read the whole response off one connection.
async fn exchange(
    conn: &mut Conn,
    request_bytes: &[u8],
    method: Method,
    progress: Option<&ProgressFn>,
    start: Instant,
    timing: &mut Timing,
) -> Result<Hop, TransportFault> {
    conn.stream
        .get_mut()
        .write_all(request_bytes)
        .await
        .map_err(|err| TransportFault::stale(TransportCode::SendError, err.to_string()))?;
    conn.stream
        .get_mut()
        .flush()
        .await
        .map_err(|err| TransportFault::stale(TransportCode::SendError, err.to_string()))?;
    timing.pretransfer = start.elapsed();

    let (status, headers, _raw) = read_head(&mut conn.stream).await?;
    timing.starttransfer = start.elapsed();

    let (body, body_reusable) = read_body(conn, &status, method, &headers, progress).await?;
    let reusable = body_reusable
        && status.version == "HTTP/1.1"
        && !headers
            .get("connection")
            .is_some_and(|value| value.eq_ignore_ascii_case("close"));

    Ok(Hop {
        status,
        headers,
        body,
        reusable,
    })
}

/// Read a status line plus headers up to the blank line.
///
/// Returns the parsed status, the headers and the raw bytes. An immediate
/// EOF is a receive fault, which the caller treats as a stale keep-alive
/// when the connection was reused.
async fn read_head<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<(StatusLine, HeaderMap, Vec<u8>), TransportFault> {
    let mut raw = Vec::new();
    let status_line = read_line(reader, &mut raw).await?;
    if status_line.is_empty() {
        return Err(TransportFault::stale(
            TransportCode::RecvError,
            "connection closed before the status line",
        ));
    }
    let status = parse_status_line(&status_line).ok_or_else(|| {
        TransportFault::new(
            TransportCode::RecvError,
            format!(
                "malformed status line: {:?}",
                String::from_utf8_lossy(&status_line)
            ),
        )
    })?;

    let mut headers = HeaderMap::new();
    loop {
        let line = read_line(reader, &mut raw).await?;
        if line.is_empty() {
            break;
        }
        match parse_header_line(&line) {
            Some((name, value)) => headers.append(name, value),
            None => {
                tracing::warn!(
                    line = %String::from_utf8_lossy(&line),
                    "skipping malformed header line"
                );
            }
        }
    }
    Ok((status, headers, raw))
}

/// Read one CRLF-terminated line, stripped of the terminator; the raw bytes
/// (terminator included) are appended to `raw`.
async fn read_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    raw: &mut Vec<u8>,
) -> Result<Vec<u8>, TransportFault> {
    let mut line = Vec::new();
    reader
        .read_until(b'\n', &mut line)
        .await
        .map_err(|err| TransportFault::new(TransportCode::RecvError, err.to_string()))?;
    raw.extend_from_slice(&line);
    while matches!(line.last(), Some(b'\n') | Some(b'\r')) {
        line.pop();
    }
    Ok(line)
}

/// Read the response body according to its framing. Returns the body and
/// whether the connection remains usable afterwards.
async fn read_body(
    conn: &mut Conn,
    status: &StatusLine,
    method: Method,
    headers: &HeaderMap,
    progress: Option<&ProgressFn>,
) -> Result<(Vec<u8>, bool), TransportFault> {
    if !method.response_has_body()
        || matches!(status.code, 204 | 304)
        || (100..200).contains(&status.code)
    {
        return Ok((Vec::new(), true));
    }

    if headers
        .get("transfer-encoding")
        .is_some_and(|value| value.to_ascii_lowercase().contains("chunked"))
    {
        let body = read_chunked(conn, progress).await?;
        return Ok((body, true));
    }

    if let Some(length) = headers
        .get("content-length")
        .and_then(|value| value.trim().parse::<u64>().ok())
    {
        let body = read_sized(conn, length, progress).await?;
        return Ok((body, true));
    }

    // No framing: the body runs to connection close.
    let mut body = Vec::new();
    conn.stream
        .read_to_end(&mut body)
        .await
        .map_err(|err| TransportFault::new(TransportCode::RecvError, err.to_string()))?;
    if let Some(progress) = progress {
        progress(0, body.len() as u64);
    }
    Ok((body, false))
}

async fn read_sized(
    conn: &mut Conn,
    length: u64,
    progress: Option<&ProgressFn>,
) -> Result<Vec<u8>, TransportFault> {
    let mut body = vec![0u8; length as usize];
    let mut received = 0usize;
    while received < body.len() {
        let n = conn
            .stream
            .read(&mut body[received..])
            .await
            .map_err(|err| TransportFault::new(TransportCode::RecvError, err.to_string()))?;
        if n == 0 {
            return Err(TransportFault::new(
                TransportCode::RecvError,
                format!("connection closed with {received} of {length} body bytes"),
            ));
        }
        received += n;
        if let Some(progress) = progress {
            progress(length, received as u64);
        }
    }
    Ok(body)
}

async fn read_chunked(
    conn: &mut Conn,
    progress: Option<&ProgressFn>,
) -> Result<Vec<u8>, TransportFault> {
    let mut body = Vec::new();
    loop {
        let mut raw = Vec::new();
        let size_line = read_line(&mut conn.stream, &mut raw).await?;
        let size_text = String::from_utf8_lossy(&size_line);
        let size_hex = size_text.split(';').next().unwrap_or_default().trim();
        let size = u64::from_str_radix(size_hex, 16).map_err(|_| {
            TransportFault::new(
                TransportCode::RecvError,
                format!("bad chunk size line {size_text:?}"),
            )
        })?;
        if size == 0 {
            // Trailer section runs to a blank line.
            loop {
                let line = read_line(&mut conn.stream, &mut raw).await?;
                if line.is_empty() {
                    break;
                }
            }
            break;
        }
        let start = body.len();
        body.resize(start + size as usize, 0);
        conn.stream
            .read_exact(&mut body[start..])
            .await
            .map_err(|err| TransportFault::new(TransportCode::RecvError, err.to_string()))?;
        // Chunk payload is followed by its own CRLF.
        let _ = read_line(&mut conn.stream, &mut raw).await?;
        if let Some(progress) = progress {
            progress(0, body.len() as u64);
        }
    }
    Ok(body)
}

/// Serialize a request head plus body for one hop.
fn build_request_bytes(
    method: Method,
    url: &Url,
    prepared: &PreparedTransfer,
    body: &[u8],
    body_content_type: Option<&'static str>,
) -> Vec<u8> {
    let host = url.host_str().unwrap_or_default();
    let port = url.port_or_known_default().unwrap_or(80);
    let default_port = if url.scheme() == "https" { 443 } else { 80 };
    // An http target behind a proxy uses the absolute-form request target.
    let absolute_form = prepared.proxy.is_some() && url.scheme() == "http";
    let target = if absolute_form {
        url.to_string()
    } else {
        let mut target = url.path().to_string();
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }
        target
    };

    let mut head = format!("{} {} HTTP/1.1\r\n", method.as_str(), target);
    if !has_header(&prepared.header_lines, "host") {
        if port == default_port {
            head.push_str(&format!("Host: {host}\r\n"));
        } else {
            head.push_str(&format!("Host: {host}:{port}\r\n"));
        }
    }
    if !has_header(&prepared.header_lines, "accept-encoding") {
        head.push_str("Accept-Encoding: identity\r\n");
    }
    if method.allows_body() {
        head.push_str(&format!("Content-Length: {}\r\n", body.len()));
        if let Some(content_type) = body_content_type {
            if !has_header(&prepared.header_lines, "content-type") {
                head.push_str(&format!("Content-Type: {content_type}\r\n"));
            }
        }
    }
    for line in &prepared.header_lines {
        head.push_str(line);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    let mut bytes = head.into_bytes();
    if method.allows_body() {
        bytes.extend_from_slice(body);
    }
    bytes
}

fn has_header(lines: &[String], name: &str) -> bool {
    lines.iter().any(|line| {
        line.split_once(':')
            .is_some_and(|(field, _)| field.trim().eq_ignore_ascii_case(name))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{RequestDefaults, RequestOptions};
    use std::sync::Arc;

    fn prepared_for(url: &str) -> PreparedTransfer {
        let request = Arc::new(crate::request::Request::from_options(
            Method::Get,
            url,
            RequestOptions::default(),
            &RequestDefaults::default(),
        ));
        PreparedTransfer::prepare(request, None).unwrap()
    }

    #[test]
    fn request_line_uses_path_and_query() {
        let prepared = prepared_for("http://example.com/search?q=rust");
        let bytes = build_request_bytes(Method::Get, &prepared.url, &prepared, &[], None);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("GET /search?q=rust HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com\r\n"));
        assert!(text.contains("Accept-Encoding: identity\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn host_header_carries_nondefault_port() {
        let prepared = prepared_for("http://example.com:8080/");
        let bytes = build_request_bytes(Method::Get, &prepared.url, &prepared, &[], None);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("Host: example.com:8080\r\n"));
    }

    #[test]
    fn post_carries_length_and_implied_content_type() {
        let prepared = prepared_for("http://example.com/submit");
        let bytes = build_request_bytes(
            Method::Post,
            &prepared.url,
            &prepared,
            b"q=rust",
            Some("application/x-www-form-urlencoded"),
        );
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("POST /submit HTTP/1.1\r\n"));
        assert!(text.contains("Content-Length: 6\r\n"));
        assert!(text.contains("Content-Type: application/x-www-form-urlencoded\r\n"));
        assert!(text.ends_with("\r\n\r\nq=rust"));
    }

    #[test]
    fn caller_headers_suppress_generated_ones() {
        let mut options = RequestOptions::default();
        options.headers.append("Host", "override.example");
        options.headers.append("Accept-Encoding", "gzip");
        let request = Arc::new(crate::request::Request::from_options(
            Method::Get,
            "http://example.com/",
            options,
            &RequestDefaults::default(),
        ));
        let prepared = PreparedTransfer::prepare(request, None).unwrap();
        let bytes = build_request_bytes(Method::Get, &prepared.url, &prepared, &[], None);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("Host: override.example\r\n"));
        assert!(!text.contains("Host: example.com\r\n"));
        assert!(text.contains("Accept-Encoding: gzip\r\n"));
        assert!(!text.contains("identity"));
    }

    #[test]
    fn hop_raw_block_round_trips_through_the_parser() {
        let hop = Hop {
            status: StatusLine {
                version: "HTTP/1.1".to_string(),
                code: 302,
                reason: b"Found".to_vec(),
            },
            headers: [
                ("Location".to_string(), "/next".to_string()),
                ("Server".to_string(), "t".to_string()),
            ]
            .into_iter()
            .collect(),
            body: Vec::new(),
            reusable: true,
        };
        let block = hop.raw_block();
        let parsed = crate::parse::split_header_blocks(&block);
        assert_eq!(parsed.len(), 1);
        let status = parse_status_line(&parsed[0][0]).unwrap();
        assert_eq!(status.code, 302);
    }

    #[tokio::test]
    async fn read_head_parses_status_and_headers() {
        let raw: &[u8] = b"HTTP/1.1 200 OK\r\nServer: test\r\nbroken line\r\n\r\nbody";
        let mut reader = BufReader::new(raw);
        let (status, headers, _) = read_head(&mut reader).await.unwrap();
        assert_eq!(status.code, 200);
        assert_eq!(headers.get("server"), Some("test"));
        assert_eq!(headers.len(), 1);
    }

    #[tokio::test]
    async fn read_head_reports_immediate_eof() {
        let raw: &[u8] = b"";
        let mut reader = BufReader::new(raw);
        let fault = read_head(&mut reader).await.unwrap_err();
        assert_eq!(fault.code, TransportCode::RecvError);
    }

    #[test]
    fn conn_keys_distinguish_targets_and_tls_posture() {
        let a = ConnKey {
            scheme: "https".into(),
            host: "example.com".into(),
            port: 443,
            verify: true,
            proxy: None,
        };
        let mut b = a.clone();
        assert_eq!(a, b);
        b.verify = false;
        assert_ne!(a, b);
        let mut c = a.clone();
        c.port = 8443;
        assert_ne!(a, c);
    }
}
