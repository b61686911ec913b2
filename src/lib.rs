//! # weft-http
//!
//! Connection-pooled HTTP client for metasearch fan-out, with blocking and
//! async call surfaces over a single background I/O coordinator.
//!
//! A [`Session`] owns one dedicated thread that multiplexes every transfer;
//! callers submit requests and get a future back immediately, then wait
//! however suits them — blocking with a deadline, or natively async. The
//! crate is built for the metasearch workload: many short requests to many
//! hosts under one wall-clock budget, where a slow engine must never stall
//! the others.
//!
//! ## Design
//!
//! - One coordinator thread, N outstanding transfers, bounded submissions
//! - Fixed-size handle pool with keep-alive connection reuse
//! - Shared DNS cache, shared TLS configurations, optional shared cookies
//! - URL requoting and proxy selection with requests-compatible semantics
//! - A closed transport-error taxonomy, classified through one static table
//! - Explicit per-search time budgets instead of ambient per-thread state
//!
//! ## Example
//!
//! ```no_run
//! use weft_http::{RequestOptions, Session};
//!
//! # fn main() -> weft_http::Result<()> {
//! let session = Session::new()?;
//! let response = session.get("https://example.com/", RequestOptions::default())?;
//! println!("{} in {:?}", response.status_code(), response.elapsed());
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod budget;
pub mod error;
pub mod future;
pub mod parse;
pub mod pool;
pub mod prepare;
pub mod request;
pub mod response;
pub mod session;
mod wire;

pub use adapter::{search_with, EngineAdapter, ResultRecord};
pub use budget::{TimeBudget, TIMEOUT_OVERHEAD};
pub use error::{classify, ErrorKind, HttpError, Result, TransportCode};
pub use future::{AsyncResponseFuture, ResponseFuture};
pub use parse::HeaderMap;
pub use pool::CookieJar;
pub use prepare::{prepare_url, requote_uri, select_proxy, ProxyKind, ProxySpec};
pub use request::{
    Body, HttpVersion, Method, ProgressFn, Request, RequestOptions, DEFAULT_REDIRECT_LIMIT,
    DEFAULT_TIMEOUT,
};
pub use response::{Response, ResponseScope, Timing};
pub use session::{
    PipeliningStrategy, Session, SessionConfig, TRANSPORT_SUPPORTS_MULTIPLEX,
};
