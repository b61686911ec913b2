//! The session: one background coordinator thread driving every transfer.
//!
//! A [`Session`] owns a dedicated I/O thread running a current-thread tokio
//! runtime. Callers submit requests over a bounded channel and get a future
//! back immediately; the coordinator spawns each transfer into a completion
//! set and loops over submissions, completions and a periodic tick. One
//! coordinator multiplexes any number of outstanding transfers, and both the
//! blocking and the async call surfaces feed the same loop.
//!
//! Shutdown is cooperative: `stop` (also run on drop) tells the coordinator
//! to take no further submissions, lets in-flight transfers finish and joins
//! the thread.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinSet;

use crate::budget::{TimeBudget, TIMEOUT_OVERHEAD};
use crate::error::{ErrorKind, HttpError, Result, TransportCode, TransportFault};
use crate::future::{AsyncResponseFuture, CompletionSender, ResponseFuture};
use crate::pool::{ConnectionPool, SharedCaches};
use crate::prepare::PreparedTransfer;
use crate::request::{HttpVersion, Method, Request, RequestDefaults, RequestOptions, DEFAULT_REDIRECT_LIMIT, DEFAULT_TIMEOUT};
use crate::response::Response;
use crate::wire;

/// Whether the wire layer can multiplex several exchanges over one
/// connection. It speaks plain HTTP/1.1, so it cannot.
pub const TRANSPORT_SUPPORTS_MULTIPLEX: bool = false;

/// How often the coordinator wakes up with nothing to do.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Connection scheduling preference for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipeliningStrategy {
    /// One exchange per connection, no reuse preference.
    Nothing,
    /// HTTP/1.1 with keep-alive reuse.
    #[default]
    Http1,
    /// Multiplex exchanges over shared connections where the transport
    /// supports it; degrades to [`PipeliningStrategy::Http1`] where not.
    Multiplex,
}

/// Session-wide configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Total transfer handles; the hard cap on concurrent transfers.
    pub pool_connections: usize,
    /// Concurrent transfers allowed per target host.
    pub max_host_connections: usize,
    /// Connection scheduling preference.
    pub pipelining: PipeliningStrategy,
    /// Local addresses to bind outgoing connections to, assigned
    /// round-robin across handles. Empty means unbound.
    pub source_ips: Vec<IpAddr>,
    /// Default TLS verification mode.
    pub verify: bool,
    /// Default proxy map (scheme or `scheme://host` to proxy URL).
    pub proxies: HashMap<String, String>,
    /// Share response cookies across requests of this session.
    pub share_cookies: bool,
    /// Default per-request timeout.
    pub timeout: Duration,
    /// Default redirect ceiling.
    pub max_redirects: u32,
    /// Capacity of the submission queue; submissions beyond it block.
    pub submit_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pool_connections: 100,
            max_host_connections: 10,
            pipelining: PipeliningStrategy::default(),
            source_ips: Vec::new(),
            verify: true,
            proxies: HashMap::new(),
            share_cookies: false,
            timeout: DEFAULT_TIMEOUT,
            max_redirects: DEFAULT_REDIRECT_LIMIT,
            submit_queue: 1024,
        }
    }
}

impl SessionConfig {
    /// Check the configuration for values that cannot work.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.pool_connections == 0 {
            return Err(config_error("pool_connections must be at least 1"));
        }
        if self.max_host_connections == 0 {
            return Err(config_error("max_host_connections must be at least 1"));
        }
        if self.max_host_connections > self.pool_connections {
            return Err(config_error(
                "max_host_connections cannot exceed pool_connections",
            ));
        }
        if self.submit_queue == 0 {
            return Err(config_error("submit_queue must be at least 1"));
        }
        if self.timeout.is_zero() {
            return Err(config_error("timeout must be non-zero"));
        }
        Ok(())
    }
}

fn config_error(message: &str) -> HttpError {
    HttpError::new(
        ErrorKind::Transport,
        format!("invalid session configuration: {message}"),
    )
}

/// Resolve the protocol preference a strategy implies, degrading when the
/// transport cannot honour it.
fn select_http_version(strategy: PipeliningStrategy) -> HttpVersion {
    match strategy {
        PipeliningStrategy::Multiplex if TRANSPORT_SUPPORTS_MULTIPLEX => HttpVersion::Http2,
        PipeliningStrategy::Multiplex => {
            tracing::warn!("multiplexing requested but the transport speaks HTTP/1.1 only");
            HttpVersion::Http11
        }
        PipeliningStrategy::Nothing | PipeliningStrategy::Http1 => HttpVersion::Http11,
    }
}

enum Command {
    Submit(Transfer),
    Shutdown,
}

struct Transfer {
    prepared: PreparedTransfer,
    sender: CompletionSender,
    submitted: Instant,
    budget: Option<TimeBudget>,
}

/// A connection-pooled HTTP client with one background I/O coordinator.
pub struct Session {
    tx: Option<mpsc::Sender<Command>>,
    thread: Option<std::thread::JoinHandle<()>>,
    defaults: RequestDefaults,
    caches: Arc<SharedCaches>,
}

impl Session {
    /// Start a session with the default configuration.
    ///
    /// # Errors
    ///
    /// See [`Session::start`].
    pub fn new() -> Result<Self> {
        Self::start(SessionConfig::default())
    }

    /// Validate the configuration and spawn the coordinator thread.
    ///
    /// # Errors
    ///
    /// Configuration validation failures, or a failure to spawn the thread.
    pub fn start(config: SessionConfig) -> Result<Self> {
        config.validate()?;

        let defaults = RequestDefaults {
            stream: false,
            verify: config.verify,
            proxies: config.proxies.clone(),
            max_redirects: config.max_redirects,
            http_version: select_http_version(config.pipelining),
            timeout: config.timeout,
        };
        let caches = Arc::new(SharedCaches::new(config.share_cookies));
        let pool = Arc::new(ConnectionPool::new(
            config.pool_connections,
            &config.source_ips,
        ));

        let (tx, rx) = mpsc::channel(config.submit_queue);
        let coordinator_caches = caches.clone();
        let max_host = config.max_host_connections;
        let thread = std::thread::Builder::new()
            .name("weft-http-io".to_string())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build();
                match runtime {
                    Ok(runtime) => {
                        runtime.block_on(coordinator_loop(rx, pool, coordinator_caches, max_host));
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "failed to build the coordinator runtime");
                    }
                }
            })
            .map_err(|err| {
                HttpError::new(
                    ErrorKind::Connection,
                    format!("failed to spawn the coordinator thread: {err}"),
                )
            })?;

        Ok(Self {
            tx: Some(tx),
            thread: Some(thread),
            defaults,
            caches,
        })
    }

    /// Submit a request and block until it completes (bounded by the
    /// request's own deadline).
    ///
    /// # Errors
    ///
    /// Any transfer failure, classified through the transport taxonomy.
    pub fn request(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> Result<Response> {
        self.submit(method, url, options)?.result(None)
    }

    /// Submit a request without waiting; the returned future resolves it.
    ///
    /// # Errors
    ///
    /// Preparation failures (bad URL, bad proxy, streaming) and submission
    /// after the session has stopped.
    pub fn submit(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> Result<ResponseFuture> {
        let (request, prepared, budget) = self.prepare(method, url, options)?;
        let (tx, rx) = std_mpsc::sync_channel(1);
        let future = ResponseFuture::new(request, rx);
        self.enqueue(prepared, CompletionSender::Blocking(tx), budget)?;
        Ok(future)
    }

    /// Async counterpart of [`Session::request`].
    ///
    /// # Errors
    ///
    /// As [`Session::request`].
    pub async fn request_async(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> Result<Response> {
        self.submit_async(method, url, options).await?.result(None).await
    }

    /// Async counterpart of [`Session::submit`].
    ///
    /// # Errors
    ///
    /// As [`Session::submit`].
    pub async fn submit_async(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> Result<AsyncResponseFuture> {
        let (request, prepared, budget) = self.prepare(method, url, options)?;
        let (tx, rx) = oneshot::channel();
        let future = AsyncResponseFuture::new(request.clone(), rx);
        let transfer = Transfer {
            prepared,
            sender: CompletionSender::Async(tx),
            submitted: Instant::now(),
            budget,
        };
        let Some(sender) = &self.tx else {
            return Err(stopped_error(request));
        };
        sender
            .send(Command::Submit(transfer))
            .await
            .map_err(|_| stopped_error(request))?;
        Ok(future)
    }

    /// `GET`, following redirects unless told otherwise.
    pub fn get(&self, url: &str, options: RequestOptions) -> Result<Response> {
        self.request(Method::Get, url, options)
    }

    /// `HEAD`; redirects are not followed unless asked for.
    pub fn head(&self, url: &str, mut options: RequestOptions) -> Result<Response> {
        options.allow_redirects.get_or_insert(false);
        self.request(Method::Head, url, options)
    }

    pub fn post(&self, url: &str, options: RequestOptions) -> Result<Response> {
        self.request(Method::Post, url, options)
    }

    pub fn put(&self, url: &str, options: RequestOptions) -> Result<Response> {
        self.request(Method::Put, url, options)
    }

    pub fn patch(&self, url: &str, options: RequestOptions) -> Result<Response> {
        self.request(Method::Patch, url, options)
    }

    pub fn delete(&self, url: &str, options: RequestOptions) -> Result<Response> {
        self.request(Method::Delete, url, options)
    }

    /// `OPTIONS`, following redirects unless told otherwise.
    pub fn options(&self, url: &str, options: RequestOptions) -> Result<Response> {
        self.request(Method::Options, url, options)
    }

    fn prepare(
        &self,
        method: Method,
        url: &str,
        mut options: RequestOptions,
    ) -> Result<(Arc<Request>, PreparedTransfer, Option<TimeBudget>)> {
        let budget = options.budget.take();
        if let Some(budget) = &budget {
            // The budget fills a missing timeout; an explicit timeout stands
            // on its own, and the over-budget check runs at completion.
            if options.timeout.is_none() {
                options.timeout = Some(budget.remaining());
            }
        }
        let request = Arc::new(Request::from_options(method, url, options, &self.defaults));
        let prepared = PreparedTransfer::prepare(request.clone(), self.caches.jar())?;
        Ok((request, prepared, budget))
    }

    fn enqueue(
        &self,
        prepared: PreparedTransfer,
        sender: CompletionSender,
        budget: Option<TimeBudget>,
    ) -> Result<()> {
        let request = prepared.request.clone();
        let transfer = Transfer {
            prepared,
            sender,
            submitted: Instant::now(),
            budget,
        };
        let Some(tx) = &self.tx else {
            return Err(stopped_error(request));
        };
        tx.blocking_send(Command::Submit(transfer))
            .map_err(|_| stopped_error(request))
    }

    /// Stop taking submissions, let in-flight transfers finish and join the
    /// coordinator thread. Idempotent; also runs on drop.
    pub fn stop(&mut self) {
        if let Some(tx) = self.tx.take() {
            // Dropping the sender ends the coordinator even when the queue
            // is full and the shutdown command cannot be enqueued.
            let _ = tx.try_send(Command::Shutdown);
        }
        if let Some(thread) = self.thread.take() {
            if let Err(err) = thread.join() {
                tracing::warn!(?err, "coordinator thread panicked");
            }
        }
    }

    /// Alias for [`Session::stop`].
    pub fn close(&mut self) {
        self.stop();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

fn stopped_error(request: Arc<Request>) -> HttpError {
    HttpError::new(ErrorKind::Connection, "the session has stopped").with_request(request)
}

/// The coordinator: one loop multiplexing submissions, transfer completions
/// and a periodic tick.
async fn coordinator_loop(
    mut rx: mpsc::Receiver<Command>,
    pool: Arc<ConnectionPool>,
    caches: Arc<SharedCaches>,
    max_host: usize,
) {
    let mut transfers = JoinSet::new();
    let mut hosts: HashMap<String, Arc<Semaphore>> = HashMap::new();
    let mut shutting_down = false;

    loop {
        if shutting_down && transfers.is_empty() {
            break;
        }
        tokio::select! {
            command = rx.recv(), if !shutting_down => match command {
                Some(Command::Submit(transfer)) => {
                    let limiter = hosts
                        .entry(transfer.prepared.host().to_string())
                        .or_insert_with(|| Arc::new(Semaphore::new(max_host)))
                        .clone();
                    let pool = pool.clone();
                    let caches = caches.clone();
                    transfers.spawn(run_transfer(transfer, pool, caches, limiter));
                }
                Some(Command::Shutdown) | None => {
                    shutting_down = true;
                }
            },
            Some(joined) = transfers.join_next() => {
                if let Err(err) = joined {
                    tracing::warn!(error = %err, "transfer task failed to join");
                }
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {
                // Each in-flight transfer holds a clone of its host limiter,
                // so a count of one means the host is idle and its entry can
                // go. A later submission recreates it with full permits.
                hosts.retain(|_, limiter| Arc::strong_count(limiter) > 1);
            }
        }
    }
    tracing::debug!("coordinator stopped");
}

async fn run_transfer(
    transfer: Transfer,
    pool: Arc<ConnectionPool>,
    caches: Arc<SharedCaches>,
    limiter: Arc<Semaphore>,
) {
    let Transfer {
        prepared,
        sender,
        submitted,
        budget,
    } = transfer;
    let outcome = drive_transfer(&prepared, submitted, budget, &pool, &caches, limiter).await;
    match &outcome {
        Ok(response) => {
            tracing::debug!(
                url = %response.url(),
                status = response.status_code(),
                elapsed_ms = response.elapsed().as_millis() as u64,
                "transfer complete"
            );
        }
        Err(err) => {
            tracing::debug!(url = %prepared.request.url(), error = %err, "transfer failed");
        }
    }
    sender.send(outcome);
}

async fn drive_transfer(
    prepared: &PreparedTransfer,
    submitted: Instant,
    budget: Option<TimeBudget>,
    pool: &Arc<ConnectionPool>,
    caches: &Arc<SharedCaches>,
    limiter: Arc<Semaphore>,
) -> Result<Response> {
    let request = prepared.request.clone();
    let deadline = prepared.timeout;

    let outcome = tokio::time::timeout(deadline, async {
        let _host_slot = limiter.acquire_owned().await.map_err(|_| {
            TransportFault::new(TransportCode::Unknown, "host limiter closed")
        })?;
        let mut handle = ConnectionPool::borrow(pool, deadline).await?;
        wire::execute(prepared, &mut handle, caches).await
    })
    .await;

    let success = match outcome {
        Err(_) => {
            return Err(HttpError::from_transport(
                TransportFault::new(
                    TransportCode::OperationTimedOut,
                    format!("transfer exceeded its {}ms deadline", request.timeout_ms()),
                ),
                request,
                None,
            ));
        }
        Ok(Err(fault)) => return Err(HttpError::from_transport(fault, request, None)),
        Ok(Ok(success)) => success,
    };

    let response = Response::from_transfer(
        request.clone(),
        success.url,
        success.body,
        success.raw_headers,
        success.timing,
        submitted.elapsed(),
    )?;
    if let Some(jar) = caches.jar() {
        jar.store(prepared.host(), response.cookies());
    }

    // A transfer that completed after its search budget ran out is a
    // timeout to the caller, but it still carries the response.
    if let Some(budget) = budget {
        if budget.exceeded(TIMEOUT_OVERHEAD) {
            return Err(HttpError::from_transport(
                TransportFault::new(
                    TransportCode::OperationTimedOut,
                    format!(
                        "completed after its {}ms budget was spent",
                        budget.total().as_millis()
                    ),
                ),
                request,
                Some(response),
            ));
        }
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn serve_once(response: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(response);
            }
        });
        format!("http://{addr}/")
    }

    #[test]
    fn validate_rejects_impossible_configs() {
        let mut config = SessionConfig::default();
        assert!(config.validate().is_ok());

        config.pool_connections = 0;
        assert!(config.validate().is_err());

        config = SessionConfig {
            max_host_connections: 200,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config = SessionConfig {
            timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn multiplex_preference_degrades_to_http1() {
        assert_eq!(
            select_http_version(PipeliningStrategy::Multiplex),
            HttpVersion::Http11
        );
        assert_eq!(
            select_http_version(PipeliningStrategy::Http1),
            HttpVersion::Http11
        );
    }

    #[test]
    fn get_against_a_local_server() {
        let url = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
        );
        let mut session = Session::new().expect("session");
        let response = session.get(&url, RequestOptions::default()).expect("response");
        assert_eq!(response.status_code(), 200);
        assert_eq!(response.text(), "hello");
        assert!(response.history().is_empty());
        session.stop();
    }

    #[test]
    fn submit_after_stop_is_a_connection_error() {
        let mut session = Session::new().expect("session");
        session.stop();
        let err = session
            .get("http://127.0.0.1:9/", RequestOptions::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[test]
    fn stop_is_idempotent() {
        let mut session = Session::new().expect("session");
        session.stop();
        session.stop();
        session.close();
    }

    #[test]
    fn silent_server_times_out_within_bound() {
        // Accepts the connection but never answers.
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        std::thread::spawn(move || {
            let held = listener.accept();
            std::thread::sleep(Duration::from_secs(5));
            drop(held);
        });

        let session = Session::new().expect("session");
        let options = RequestOptions {
            timeout: Some(Duration::from_millis(200)),
            ..Default::default()
        };
        let started = Instant::now();
        let err = session
            .get(&format!("http://{addr}/"), options)
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn invalid_url_fails_before_any_io() {
        let session = Session::new().expect("session");
        let err = session
            .get("example.com/no-schema", RequestOptions::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingSchema);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_surface_reaches_the_same_coordinator() {
        let url = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
        );
        let session = Session::new().expect("session");
        let response = session
            .request_async(Method::Get, &url, RequestOptions::default())
            .await
            .expect("response");
        assert_eq!(response.text(), "ok");
    }
}
