//! End-to-end exercises against in-process canned servers.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use weft_http::{
    Body, ErrorKind, Method, RequestOptions, Session, SessionConfig, TimeBudget,
};

/// Serve one canned response per accepted connection, in order, recording
/// each raw request.
fn spawn_server(responses: Vec<Vec<u8>>) -> (String, mpsc::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        for response in responses {
            let Ok((mut stream, _)) = listener.accept() else {
                break;
            };
            let request = read_request(&mut stream);
            let _ = tx.send(request);
            let _ = stream.write_all(&response);
        }
    });
    (format!("http://{addr}"), rx)
}

/// Serve `count` responses over a single accepted connection, recording the
/// requests; proves keep-alive reuse.
fn spawn_keep_alive_server(response: Vec<u8>, count: usize) -> (String, mpsc::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let Ok((mut stream, _)) = listener.accept() else {
            return;
        };
        for _ in 0..count {
            let request = read_request(&mut stream);
            if request.is_empty() {
                break;
            }
            let _ = tx.send(request);
            if stream.write_all(&response).is_err() {
                break;
            }
        }
    });
    (format!("http://{addr}"), rx)
}

fn read_request(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if let Some(head_end) = find(&buf, b"\r\n\r\n") {
                    let head = String::from_utf8_lossy(&buf[..head_end]);
                    let body_len = content_length(&head);
                    if buf.len() >= head_end + 4 + body_len {
                        break;
                    }
                }
            }
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&buf).to_string()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn content_length(head: &str) -> usize {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

fn canned(status: &str, extra_headers: &[&str], body: &[u8]) -> Vec<u8> {
    let mut head = format!("HTTP/1.1 {status}\r\n");
    for header in extra_headers {
        head.push_str(header);
        head.push_str("\r\n");
    }
    head.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    ));
    let mut bytes = head.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

fn keep_alive_canned(status: &str, body: &[u8]) -> Vec<u8> {
    let head = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    let mut bytes = head.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

#[test]
fn get_returns_body_headers_and_cookies() {
    let (base, requests) = spawn_server(vec![canned(
        "200 OK",
        &[
            "Content-Type: text/plain; charset=utf-8",
            "Set-Cookie: sid=abc123; Path=/; HttpOnly",
            "Set-Cookie: this is not a cookie",
        ],
        b"hello",
    )]);
    let session = Session::new().expect("session");
    let response = session
        .get(&format!("{base}/greeting"), RequestOptions::default())
        .expect("response");

    assert_eq!(response.status_code(), 200);
    assert_eq!(response.text(), "hello");
    assert_eq!(response.reason(), "OK");
    assert!(response.ok());
    assert!(response.history().is_empty());
    assert_eq!(response.cookie("sid"), Some("abc123"));
    assert_eq!(response.cookies().len(), 1);
    assert!(response.elapsed() > Duration::ZERO);
    assert!(response.timing().total > Duration::ZERO);

    let request = requests.recv().expect("request seen");
    assert!(request.starts_with("GET /greeting HTTP/1.1\r\n"));
    assert!(request.contains("Accept-Encoding: identity\r\n"));
}

#[test]
fn concurrent_submissions_all_complete() {
    let responses = (0..5)
        .map(|_| canned("200 OK", &[], b"ok"))
        .collect::<Vec<_>>();
    let (base, _requests) = spawn_server(responses);
    let session = Session::new().expect("session");

    let futures = (0..5)
        .map(|i| {
            session
                .submit(
                    Method::Get,
                    &format!("{base}/{i}"),
                    RequestOptions::default(),
                )
                .expect("submitted")
        })
        .collect::<Vec<_>>();

    for future in futures {
        let response = future.result(Some(Duration::from_secs(5))).expect("done");
        assert_eq!(response.status_code(), 200);
    }
}

#[test]
fn redirects_are_followed_with_history() {
    let (base, requests) = spawn_server(vec![
        canned("302 Found", &["Location: /step"], b""),
        canned("200 OK", &[], b"landed"),
    ]);
    let session = Session::new().expect("session");
    let response = session
        .get(&format!("{base}/start"), RequestOptions::default())
        .expect("response");

    assert_eq!(response.status_code(), 200);
    assert_eq!(response.text(), "landed");
    assert_eq!(response.history().len(), 1);
    assert!(response.history()[0].ends_with("/step"));
    assert!(response.url().ends_with("/step"));

    let first = requests.recv().expect("first request");
    let second = requests.recv().expect("second request");
    assert!(first.starts_with("GET /start"));
    assert!(second.starts_with("GET /step"));
}

#[test]
fn disabled_redirects_surface_the_302() {
    let (base, _requests) = spawn_server(vec![canned("302 Found", &["Location: /next"], b"")]);
    let session = Session::new().expect("session");
    let options = RequestOptions {
        allow_redirects: Some(false),
        ..Default::default()
    };
    let response = session.get(&format!("{base}/start"), options).expect("response");

    assert_eq!(response.status_code(), 302);
    assert!(response.history().is_empty());
    assert_eq!(response.headers().get("location"), Some("/next"));
}

#[test]
fn redirect_limit_is_enforced() {
    let loops = (0..5)
        .map(|_| canned("302 Found", &["Location: /again"], b""))
        .collect::<Vec<_>>();
    let (base, _requests) = spawn_server(loops);
    let session = Session::new().expect("session");
    let options = RequestOptions {
        max_redirects: Some(2),
        ..Default::default()
    };
    let err = session.get(&format!("{base}/again"), options).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TooManyRedirects);
}

#[test]
fn post_redirect_downgrades_to_get() {
    let (base, requests) = spawn_server(vec![
        canned("302 Found", &["Location: /done"], b""),
        canned("200 OK", &[], b"done"),
    ]);
    let session = Session::new().expect("session");
    let options = RequestOptions {
        body: Body::Text("payload".to_string()),
        ..Default::default()
    };
    let response = session.post(&format!("{base}/form"), options).expect("response");
    assert_eq!(response.status_code(), 200);

    let first = requests.recv().expect("first");
    let second = requests.recv().expect("second");
    assert!(first.starts_with("POST /form"));
    assert!(first.ends_with("payload"));
    assert!(second.starts_with("GET /done"));
    assert!(!second.contains("payload"));
}

#[test]
fn form_bodies_are_urlencoded() {
    let (base, requests) = spawn_server(vec![canned("200 OK", &[], b"ok")]);
    let session = Session::new().expect("session");
    let options = RequestOptions {
        body: Body::Form(vec![("q".to_string(), "rust lang".to_string())]),
        ..Default::default()
    };
    session.post(&format!("{base}/search"), options).expect("response");

    let request = requests.recv().expect("request");
    assert!(request.contains("Content-Type: application/x-www-form-urlencoded\r\n"));
    assert!(request.contains("Content-Length: 11\r\n"));
    assert!(request.ends_with("q=rust+lang"));
}

#[test]
fn unquoted_paths_are_requoted_on_the_wire() {
    let (base, requests) = spawn_server(vec![canned("200 OK", &[], b"ok")]);
    let session = Session::new().expect("session");
    session
        .get(&format!("{base}/a b/caf\u{e9}"), RequestOptions::default())
        .expect("response");

    let request = requests.recv().expect("request");
    assert!(request.starts_with("GET /a%20b/caf%C3%A9 HTTP/1.1\r\n"));
}

#[test]
fn error_statuses_only_raise_on_request() {
    let (base, _requests) = spawn_server(vec![canned("503 Service Unavailable", &[], b"busy")]);
    let session = Session::new().expect("session");
    let response = session
        .get(&format!("{base}/"), RequestOptions::default())
        .expect("a 503 is still a response");

    assert_eq!(response.status_code(), 503);
    assert!(!response.ok());
    assert_eq!(response.text(), "busy");
    let err = response.raise_for_status().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Http);
    assert!(err.to_string().contains("503 Server Error"));
}

#[test]
fn head_reads_no_body() {
    let (base, requests) = spawn_server(vec![canned("200 OK", &[], b"")]);
    let session = Session::new().expect("session");
    let response = session
        .head(&format!("{base}/resource"), RequestOptions::default())
        .expect("response");
    assert_eq!(response.status_code(), 200);
    assert!(response.content().is_empty());
    let request = requests.recv().expect("request");
    assert!(request.starts_with("HEAD /resource"));
}

#[test]
fn keep_alive_connections_are_reused() {
    let (base, requests) = spawn_keep_alive_server(keep_alive_canned("200 OK", b"ok"), 2);
    let session = Session::new().expect("session");

    let first = session
        .get(&format!("{base}/one"), RequestOptions::default())
        .expect("first");
    let second = session
        .get(&format!("{base}/two"), RequestOptions::default())
        .expect("second");
    assert_eq!(first.text(), "ok");
    assert_eq!(second.text(), "ok");

    // Both requests arrived on the single accepted connection.
    assert!(requests.recv().expect("first seen").starts_with("GET /one"));
    assert!(requests.recv().expect("second seen").starts_with("GET /two"));
}

#[test]
fn shared_cookie_jar_feeds_later_requests() {
    let (base, requests) = spawn_server(vec![
        canned("200 OK", &["Set-Cookie: sid=xyz"], b"first"),
        canned("200 OK", &[], b"second"),
    ]);
    let config = SessionConfig {
        share_cookies: true,
        ..Default::default()
    };
    let session = Session::start(config).expect("session");

    session
        .get(&format!("{base}/login"), RequestOptions::default())
        .expect("first");
    session
        .get(&format!("{base}/account"), RequestOptions::default())
        .expect("second");

    let first = requests.recv().expect("first");
    let second = requests.recv().expect("second");
    assert!(!first.contains("Cookie:"));
    assert!(second.contains("Cookie: sid=xyz\r\n"));
}

#[test]
fn over_budget_completion_is_a_timeout_carrying_the_response() {
    let (base, _requests) = spawn_server(vec![canned("200 OK", &[], b"late but fine")]);
    let session = Session::new().expect("session");
    let options = RequestOptions {
        timeout: Some(Duration::from_secs(2)),
        budget: Some(TimeBudget::started_at(
            Instant::now() - Duration::from_secs(2),
            Duration::from_millis(500),
        )),
        ..Default::default()
    };
    let err = session.get(&format!("{base}/"), options).unwrap_err();

    assert!(err.is_timeout());
    let response = err.response().expect("response travels with the timeout");
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.text(), "late but fine");
}

#[test]
fn fresh_budget_fills_a_missing_timeout() {
    let (base, _requests) = spawn_server(vec![canned("200 OK", &[], b"ok")]);
    let session = Session::new().expect("session");
    let options = RequestOptions {
        budget: Some(TimeBudget::start(Duration::from_secs(3))),
        ..Default::default()
    };
    let response = session.get(&format!("{base}/"), options).expect("response");
    assert_eq!(response.status_code(), 200);
    assert!(response.request().timeout() <= Duration::from_secs(3));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_futures_resolve_concurrently() {
    let responses = (0..3)
        .map(|_| canned("200 OK", &[], b"async"))
        .collect::<Vec<_>>();
    let (base, _requests) = spawn_server(responses);
    let session = Session::new().expect("session");

    let mut futures = Vec::new();
    for i in 0..3 {
        let future = session
            .submit_async(
                Method::Get,
                &format!("{base}/{i}"),
                RequestOptions::default(),
            )
            .await
            .expect("submitted");
        futures.push(future);
    }
    let results = futures::future::join_all(futures.into_iter().map(|f| f.result(None))).await;
    for result in results {
        assert_eq!(result.expect("response").text(), "async");
    }
}
