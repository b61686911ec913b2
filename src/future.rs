//! Futures handed back at submission time.
//!
//! Submitting a request returns immediately with a future; the transfer runs
//! on the session's coordinator thread. [`ResponseFuture`] is the blocking
//! flavour for synchronous callers, built on a rendezvous channel so the
//! coordinator never waits on a slow consumer. [`AsyncResponseFuture`] is
//! the native-async flavour, a oneshot hand-off that any runtime can await.
//!
//! A wait that runs out does not cancel the transfer: the coordinator keeps
//! driving it and the completed response is simply dropped when nobody is
//! left to receive it.

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::budget::TIMEOUT_OVERHEAD;
use crate::error::{ErrorKind, HttpError, Result};
use crate::request::Request;
use crate::response::Response;

/// The coordinator's side of a pending transfer, blocking or async.
pub(crate) enum CompletionSender {
    Blocking(mpsc::SyncSender<Result<Response>>),
    Async(oneshot::Sender<Result<Response>>),
}

impl CompletionSender {
    /// Deliver the outcome. A receiver that already gave up is fine; the
    /// outcome is dropped.
    pub fn send(self, outcome: Result<Response>) {
        match self {
            Self::Blocking(tx) => {
                let _ = tx.try_send(outcome);
            }
            Self::Async(tx) => {
                let _ = tx.send(outcome);
            }
        }
    }
}

fn abandoned(request: Arc<Request>) -> HttpError {
    HttpError::new(
        ErrorKind::Connection,
        "transfer abandoned: the session stopped before it completed",
    )
    .with_request(request)
}

/// Blocking handle to an in-flight transfer.
pub struct ResponseFuture {
    request: Arc<Request>,
    rx: mpsc::Receiver<Result<Response>>,
    submitted: Instant,
}

impl ResponseFuture {
    pub(crate) fn new(request: Arc<Request>, rx: mpsc::Receiver<Result<Response>>) -> Self {
        Self {
            request,
            rx,
            submitted: Instant::now(),
        }
    }

    /// The request this future resolves.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Time left until the request's own deadline, plus a small grace so a
    /// transfer finishing right at the deadline still gets delivered.
    fn default_wait(&self) -> Duration {
        self.request
            .timeout()
            .saturating_sub(self.submitted.elapsed())
            + TIMEOUT_OVERHEAD
    }

    /// Block until the transfer completes, the wait runs out or the session
    /// stops. `timeout` defaults to the request's remaining deadline.
    ///
    /// # Errors
    ///
    /// The transfer's own error, or [`ErrorKind::Timeout`] when the wait
    /// expires first. The transfer is not cancelled by an expired wait.
    pub fn result(self, timeout: Option<Duration>) -> Result<Response> {
        let wait = timeout.unwrap_or_else(|| self.default_wait());
        match self.rx.recv_timeout(wait) {
            Ok(outcome) => outcome,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(HttpError::wait_timeout(self.request)),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(abandoned(self.request)),
        }
    }

    /// Like [`ResponseFuture::result`] but inverted: the error if the
    /// transfer failed (or the wait expired), `None` on success.
    pub fn exception(self, timeout: Option<Duration>) -> Option<HttpError> {
        self.result(timeout).err()
    }
}

impl std::fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<ResponseFuture {:?}>", self.request)
    }
}

/// Async handle to an in-flight transfer. Awaiting it directly is
/// equivalent to `result(None)`.
pub struct AsyncResponseFuture {
    request: Arc<Request>,
    rx: oneshot::Receiver<Result<Response>>,
    submitted: Instant,
}

impl AsyncResponseFuture {
    pub(crate) fn new(request: Arc<Request>, rx: oneshot::Receiver<Result<Response>>) -> Self {
        Self {
            request,
            rx,
            submitted: Instant::now(),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    fn default_wait(&self) -> Duration {
        self.request
            .timeout()
            .saturating_sub(self.submitted.elapsed())
            + TIMEOUT_OVERHEAD
    }

    /// Await the transfer, bounded by `timeout` (the request's remaining
    /// deadline when `None`).
    ///
    /// # Errors
    ///
    /// The transfer's own error, or [`ErrorKind::Timeout`] when the wait
    /// expires first.
    pub async fn result(self, timeout: Option<Duration>) -> Result<Response> {
        let wait = timeout.unwrap_or_else(|| self.default_wait());
        match tokio::time::timeout(wait, self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(abandoned(self.request)),
            Err(_) => Err(HttpError::wait_timeout(self.request)),
        }
    }

    /// The error if the transfer failed (or the wait expired), `None` on
    /// success.
    pub async fn exception(self, timeout: Option<Duration>) -> Option<HttpError> {
        self.result(timeout).await.err()
    }
}

impl IntoFuture for AsyncResponseFuture {
    type Output = Result<Response>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.result(None))
    }
}

impl std::fmt::Debug for AsyncResponseFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<AsyncResponseFuture {:?}>", self.request)
    }
}
