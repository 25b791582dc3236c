//! Local API listeners started for active intercepts that announce an API port.

use std::collections::HashMap;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use agent_intercept::client::api::CALLER_ID_HEADER;
use agent_intercept::client::matcher::PATH_PREFIX;
use agent_intercept::models::intercept::{Disposition, InterceptInfo, ENV_API_PORT};

use super::test_helpers::{record, test_config, Harness};

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("addr").port()
}

fn api_record(name: &str, port: u16) -> InterceptInfo {
    let mut ii = record(name, Disposition::Active);
    ii.environment = HashMap::from([(ENV_API_PORT.to_owned(), port.to_string())]);
    ii.headers = HashMap::from([
        ("x-user".to_owned(), "alice".to_owned()),
        (PATH_PREFIX.to_owned(), "/api".to_owned()),
    ]);
    ii.metadata = HashMap::from([("team".to_owned(), "blue".to_owned())]);
    ii
}

/// Issue a GET and return the response body, retrying until the listener is up.
async fn get(port: u16, target: &str, headers: &[(&str, &str)]) -> String {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut stream = loop {
        match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(stream) => break stream,
            Err(err) => {
                assert!(tokio::time::Instant::now() < deadline, "listener on {port} never came up: {err}");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    };
    let mut request = format!("GET {target} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n");
    for (name, value) in headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await.expect("write request");

    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.expect("read response");
    assert!(raw.starts_with("HTTP/1.1 200"), "unexpected response: {raw}");
    raw.split_once("\r\n\r\n").map(|(_, body)| body.to_owned()).unwrap_or_default()
}

#[tokio::test]
async fn active_intercept_with_api_port_gets_a_listener() {
    let h = Harness::idle(&test_config());
    let port = free_port();

    h.session.handle_snapshot(vec![api_record("echo", port)]).await;
    assert_eq!(h.session.api_ports(), vec![port]);

    assert_eq!(get(port, "/healthz", &[]).await, "ok");
    let caller = (CALLER_ID_HEADER, "id-echo");
    assert_eq!(
        get(port, "/consume-here?path=/api/users", &[caller, ("x-user", "alice")]).await,
        "true"
    );
    assert_eq!(
        get(port, "/consume-here?path=/api/users", &[caller, ("x-user", "bob")]).await,
        "false"
    );
    assert_eq!(
        get(port, "/consume-here?path=/web", &[caller, ("x-user", "alice")]).await,
        "false"
    );

    let info: serde_json::Value = serde_json::from_str(
        &get(port, "/intercept-info?path=/api", &[caller, ("x-user", "alice")]).await,
    )
    .expect("json body");
    assert_eq!(info["intercepted"], true);
    assert_eq!(info["client_side"], true);
    assert_eq!(info["metadata"]["team"], "blue");

    h.session.close().await;
}

#[tokio::test]
async fn lookup_answers_per_caller() {
    let h = Harness::idle(&test_config());
    let port = free_port();
    h.session.handle_snapshot(vec![api_record("echo", port)]).await;

    let mut headers = HeaderMap::new();
    headers.insert("x-user", HeaderValue::from_static("alice"));

    let hit = h.session.lookup("id-echo", "/api", &headers);
    assert!(hit.intercepted);
    assert_eq!(hit.metadata.get("team").map(String::as_str), Some("blue"));

    let stranger = h.session.lookup("id-other", "/api", &headers);
    assert!(!stranger.intercepted);
    assert!(stranger.client_side);
    assert!(stranger.metadata.is_empty());

    h.session.close().await;
}

#[tokio::test]
async fn listeners_follow_the_snapshot() {
    let h = Harness::idle(&test_config());
    let shared = free_port();

    // Two intercepts announcing the same port share one listener.
    h.session
        .handle_snapshot(vec![api_record("echo", shared), api_record("web", shared)])
        .await;
    assert_eq!(h.session.api_ports(), vec![shared]);

    // Waiting records do not serve.
    let mut waiting = api_record("echo", shared);
    waiting.disposition = Disposition::Waiting;
    h.session.handle_snapshot(vec![waiting]).await;
    assert!(h.session.api_ports().is_empty());

    let mut bad = api_record("echo", shared);
    bad.environment.insert(ENV_API_PORT.to_owned(), "http".to_owned());
    h.session.handle_snapshot(vec![bad]).await;
    assert!(h.session.api_ports().is_empty(), "unparsable port is skipped");

    h.session.close().await;
}
