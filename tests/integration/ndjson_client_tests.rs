//! The NDJSON control-plane client against an in-process TCP peer.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use agent_intercept::driver::ndjson::NdjsonManagerClient;
use agent_intercept::driver::ManagerClient;
use agent_intercept::models::intercept::{Disposition, InterceptSpec, SessionInfo};
use agent_intercept::AppError;

/// Reply line that makes the peer close the connection.
const CLOSE: &str = "<close>";

type Replies = Arc<dyn Fn(&Value) -> Vec<String> + Send + Sync>;

/// Serve every connection with `reply`, recording each request.
async fn peer(reply: Replies) -> (String, mpsc::UnboundedReceiver<Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("addr").to_string();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let reply = Arc::clone(&reply);
            let seen = seen_tx.clone();
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut lines = BufReader::new(read).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let request: Value = serde_json::from_str(&line).expect("request json");
                    let _ = seen.send(request.clone());
                    for out in reply(&request) {
                        if out == CLOSE {
                            return;
                        }
                        write.write_all(format!("{out}\n").as_bytes()).await.expect("write");
                    }
                }
            });
        }
    });
    (address, seen_rx)
}

fn answer(request: &Value, result: &Value) -> String {
    json!({ "id": request["id"], "result": result }).to_string()
}

fn session() -> SessionInfo {
    SessionInfo {
        session_id: "s-1".into(),
        client: "dev@laptop".into(),
        namespace: "default".into(),
    }
}

fn spec() -> InterceptSpec {
    InterceptSpec {
        name: "echo".into(),
        agent: "echo".into(),
        namespace: "default".into(),
        ..InterceptSpec::default()
    }
}

fn client(address: &str, timeout: Duration) -> NdjsonManagerClient {
    NdjsonManagerClient::new(address, timeout, CancellationToken::new())
}

#[tokio::test]
async fn create_round_trips_the_record() {
    let (address, mut seen) = peer(Arc::new(|req: &Value| {
        let record = json!({
            "id": "3f2a",
            "spec": req["params"]["spec"],
            "disposition": "WAITING",
            "pod_ip": "10.1.0.4",
        });
        vec![answer(req, &record)]
    }))
    .await;
    let client = client(&address, Duration::from_secs(2));

    let ii = client.create_intercept(&session(), &spec()).await.expect("create");

    assert_eq!(ii.id, "3f2a");
    assert_eq!(ii.spec.name, "echo");
    assert_eq!(ii.disposition, Disposition::Waiting);
    let request = seen.recv().await.expect("request");
    assert_eq!(request["method"], "create_intercept");
    assert_eq!(request["params"]["session"]["session_id"], "s-1");
}

#[tokio::test]
async fn requests_share_one_connection() {
    let (address, mut seen) = peer(Arc::new(|req: &Value| vec![answer(req, &Value::Null)])).await;
    let client = client(&address, Duration::from_secs(2));

    client.remove_intercept(&session(), "a").await.expect("first");
    client.remove_intercept(&session(), "b").await.expect("second");

    let first = seen.recv().await.expect("first request");
    let second = seen.recv().await.expect("second request");
    assert_eq!(first["params"]["name"], "a");
    assert_eq!(second["params"]["name"], "b");
    assert_ne!(first["id"], second["id"]);
}

#[tokio::test]
async fn error_replies_keep_their_category() {
    let (address, _seen) = peer(Arc::new(|req: &Value| {
        let category = if req["params"]["name"] == "user" { 1 } else { 0 };
        vec![json!({
            "id": req["id"],
            "error": { "message": "intercept not found", "category": category },
        })
        .to_string()]
    }))
    .await;
    let client = client(&address, Duration::from_secs(2));

    let user = client.remove_intercept(&session(), "user").await.unwrap_err();
    assert!(matches!(user, AppError::User(ref m) if m == "intercept not found"), "{user:?}");

    let unknown = client.remove_intercept(&session(), "other").await.unwrap_err();
    assert!(matches!(unknown, AppError::Manager(_)), "{unknown:?}");
}

#[tokio::test]
async fn malformed_lines_are_skipped() {
    let (address, _seen) = peer(Arc::new(|req: &Value| {
        vec![
            "not json".to_owned(),
            json!({ "id": 9999, "result": null }).to_string(),
            answer(req, &json!({ "container_port": 8080, "protocol": "TCP" })),
        ]
    }))
    .await;
    let client = client(&address, Duration::from_secs(2));

    let prepared = client.prepare_intercept(&session(), &spec()).await.expect("prepare");

    assert_eq!(prepared.container_port, 8080);
    assert!(prepared.to_error().is_none());
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let (address, _seen) = peer(Arc::new(|_: &Value| Vec::<String>::new())).await;
    let client = client(&address, Duration::from_secs(1));

    let err = client.prepare_intercept(&session(), &spec()).await.unwrap_err();

    assert!(matches!(err, AppError::Timeout(_)), "{err:?}");
    assert_eq!(err.to_string(), "timeout: prepare_intercept: no answer within 1s");
}

#[tokio::test]
async fn closed_connection_is_reopened() {
    let (address, mut seen) = peer(Arc::new(|req: &Value| vec![answer(req, &Value::Null), CLOSE.to_owned()])).await;
    let client = client(&address, Duration::from_secs(2));

    client.remove_intercept(&session(), "a").await.expect("first");
    // Let the reader observe the end of stream.
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.remove_intercept(&session(), "b").await.expect("second");

    assert_eq!(seen.recv().await.expect("first")["params"]["name"], "a");
    assert_eq!(seen.recv().await.expect("second")["params"]["name"], "b");
}

#[tokio::test]
async fn unreachable_endpoint_is_a_manager_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let address = listener.local_addr().expect("addr").to_string();
    drop(listener);
    let client = client(&address, Duration::from_secs(1));

    let err = client.remove_intercept(&session(), "a").await.unwrap_err();

    assert!(matches!(err, AppError::Manager(ref m) if m.starts_with("failed to connect")), "{err:?}");
}

#[tokio::test]
async fn watch_delivers_pushes_until_end_of_stream() {
    let (address, mut seen) = peer(Arc::new(|req: &Value| {
        let record = json!({ "id": "3f2a", "spec": { "name": "echo" }, "disposition": "ACTIVE" });
        vec![
            answer(req, &Value::Null),
            json!({ "method": "intercepts", "params": { "intercepts": [] } }).to_string(),
            json!({ "method": "intercepts", "params": { "intercepts": [record] } }).to_string(),
            CLOSE.to_owned(),
        ]
    }))
    .await;
    let client = client(&address, Duration::from_secs(2));

    let mut stream = client.watch_intercepts(&session()).await.expect("watch");

    let first = stream.recv().await.expect("first push").expect("snapshot");
    assert!(first.is_empty());
    let second = stream.recv().await.expect("second push").expect("snapshot");
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].spec.name, "echo");
    assert_eq!(second[0].disposition, Disposition::Active);
    assert!(stream.recv().await.is_none(), "clean close ends the stream");

    let request = seen.recv().await.expect("watch request");
    assert_eq!(request["method"], "watch_intercepts");
    assert_eq!(request["params"]["namespace"], "default");
}

#[tokio::test]
async fn push_with_unfamiliar_disposition_is_delivered_whole() {
    let (address, _seen) = peer(Arc::new(|req: &Value| {
        let intercepts = json!([
            { "id": "a", "spec": { "name": "web" }, "disposition": "ACTIVE" },
            { "id": "b", "spec": { "name": "echo" }, "disposition": "NO_CLIENT", "message": "client gone" },
            { "id": "c", "spec": { "name": "api" }, "disposition": "SUSPENDED" },
        ]);
        vec![
            answer(req, &Value::Null),
            json!({ "method": "intercepts", "params": { "intercepts": intercepts } }).to_string(),
        ]
    }))
    .await;
    let client = client(&address, Duration::from_secs(2));

    let mut stream = client.watch_intercepts(&session()).await.expect("watch");
    let snapshot = tokio::time::timeout(Duration::from_secs(1), stream.recv())
        .await
        .expect("snapshot in time")
        .expect("push")
        .expect("snapshot");

    let dispositions: Vec<Disposition> = snapshot.iter().map(|ii| ii.disposition).collect();
    assert_eq!(
        dispositions,
        vec![Disposition::Active, Disposition::NoClient, Disposition::Unknown]
    );
    assert_eq!(snapshot[1].message, "client gone");
}
