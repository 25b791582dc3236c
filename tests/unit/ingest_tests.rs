//! Unit tests for ingest keys and handler selection.

use agent_intercept::client::handler::Handler;
use agent_intercept::client::ingest::{Ingest, IngestInfo, IngestKey};

#[test]
fn key_parses_workload_and_container() {
    let key = IngestKey::parse("echo/app").expect("valid key");
    assert_eq!(key, IngestKey::new("echo", "app"));
    assert_eq!(key.to_string(), "echo/app");
}

#[test]
fn malformed_keys_are_rejected() {
    assert!(IngestKey::parse("echo").is_none());
    assert!(IngestKey::parse("/app").is_none());
    assert!(IngestKey::parse("echo/").is_none());
}

#[test]
fn keys_sort_by_workload_then_container() {
    let mut keys = vec![
        IngestKey::new("web", "app"),
        IngestKey::new("echo", "sidecar"),
        IngestKey::new("echo", "app"),
    ];
    keys.sort();
    let rendered: Vec<String> = keys.iter().map(ToString::to_string).collect();
    assert_eq!(rendered, vec!["echo/app", "echo/sidecar", "web/app"]);
}

#[test]
fn container_handler_wins_over_pid() {
    assert_eq!(
        Handler::from_parts(4711, "echo-handler"),
        Some(Handler::Container("echo-handler".into()))
    );
    assert_eq!(Handler::from_parts(4711, ""), Some(Handler::Process(4711)));
    assert_eq!(Handler::from_parts(0, ""), None);
}

#[test]
fn new_ingest_has_no_handler() {
    let ingest = Ingest::new(IngestInfo {
        workload_kind: "Deployment".into(),
        pod_ip: "10.1.0.4".into(),
        ..IngestInfo::default()
    });
    assert!(ingest.handler().is_none());
    assert_eq!(ingest.info.pod_ip, "10.1.0.4");
}
