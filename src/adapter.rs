//! Integration seam between search engines and the transport.
//!
//! A metasearch engine owns two pieces of knowledge: how to turn a query
//! into a request, and how to turn the response into result rows. Engines
//! implement [`EngineAdapter`] and [`search_with`] runs the exchange through
//! a [`Session`], so engine code never touches connections or futures.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::request::{Method, RequestOptions};
use crate::response::Response;
use crate::session::Session;

/// One normalised search result row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub url: String,
    pub title: String,
    /// Short descriptive text, empty when the engine provides none.
    #[serde(default)]
    pub snippet: String,
    /// Engine-assigned relevance, higher is better.
    #[serde(default)]
    pub score: f32,
}

/// A search engine viewed from the transport's side.
pub trait EngineAdapter: Send + Sync {
    /// Stable engine identifier, used in logs.
    fn name(&self) -> &str;

    /// Build the request for a query.
    fn build_request(&self, query: &str) -> (Method, String, RequestOptions);

    /// Parse a successful response into result rows.
    ///
    /// # Errors
    ///
    /// Parse failures; the caller attributes them to this engine.
    fn parse_response(&self, response: &Response) -> Result<Vec<ResultRecord>>;
}

/// Run one engine query through a session: build, transfer, check the
/// status, parse.
///
/// # Errors
///
/// Transfer failures, HTTP error statuses and parse failures, in that
/// order of precedence.
pub fn search_with(
    session: &Session,
    engine: &dyn EngineAdapter,
    query: &str,
) -> Result<Vec<ResultRecord>> {
    let (method, url, options) = engine.build_request(query);
    let response = session.request(method, &url, options)?;
    response.raise_for_status()?;
    let records = engine.parse_response(&response)?;
    tracing::debug!(
        engine = %engine.name(),
        results = records.len(),
        status = response.status_code(),
        "engine query complete"
    );
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, HttpError};

    struct JsonEngine;

    impl EngineAdapter for JsonEngine {
        fn name(&self) -> &str {
            "json-test"
        }

        fn build_request(&self, query: &str) -> (Method, String, RequestOptions) {
            let options = RequestOptions {
                params: vec![("q".to_string(), query.to_string())],
                ..Default::default()
            };
            (Method::Get, "http://127.0.0.1:0/search".to_string(), options)
        }

        fn parse_response(&self, response: &Response) -> Result<Vec<ResultRecord>> {
            response.json().map_err(|err| {
                HttpError::new(ErrorKind::Transport, format!("bad engine payload: {err}"))
            })
        }
    }

    #[test]
    fn result_records_round_trip_as_json() {
        let payload = r#"[{"url":"https://example.com/","title":"Example","snippet":"an example"}]"#;
        let records: Vec<ResultRecord> = serde_json::from_str(payload).expect("parse");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].title, "Example");
        assert_eq!(records[0].score, 0.0);
        let out = serde_json::to_string(&records).expect("serialize");
        assert!(out.contains("\"url\":\"https://example.com/\""));
    }

    #[test]
    fn adapter_builds_query_parameters() {
        let (method, url, options) = JsonEngine.build_request("rust");
        assert_eq!(method, Method::Get);
        assert!(url.ends_with("/search"));
        assert_eq!(options.params, vec![("q".to_string(), "rust".to_string())]);
    }
}
