//! Unit tests for the user-facing intercept view.

use std::collections::HashMap;

use agent_intercept::client::info::Info;
use agent_intercept::models::intercept::{Disposition, InterceptInfo, InterceptSpec};

fn record() -> InterceptInfo {
    InterceptInfo {
        id: "3f2a".into(),
        spec: InterceptSpec {
            name: "echo".into(),
            agent: "echo".into(),
            namespace: "default".into(),
            workload_kind: "Deployment".into(),
            mechanism: "tcp".into(),
            target_host: "127.0.0.1".into(),
            target_port: 8080,
            service_uid: "uid-echo".into(),
            port_identifier: "http".into(),
            container_port: 8080,
            ..InterceptSpec::default()
        },
        disposition: Disposition::Active,
        pod_ip: "10.1.0.4".into(),
        mount_point: "/tel_app_mounts".into(),
        client_mount_point: "/tmp/echo".into(),
        metadata: HashMap::from([("team".to_owned(), "blue".to_owned())]),
        ..InterceptInfo::default()
    }
}

#[test]
fn active_service_intercept_renders_aligned_block() {
    let out = Info::new(&record(), None).render();
    let expected = "   Intercept name         : echo\n\
                    \x20  State                  : ACTIVE\n\
                    \x20  Workload kind          : Deployment\n\
                    \x20  Destination            : 127.0.0.1:8080\n\
                    \x20  Service Port Identifier: http\n\
                    \x20  Volume Mount Point     : /tmp/echo\n\
                    \x20  Intercepting           : using mechanism \"tcp\"\n";
    assert_eq!(out, expected);
}

#[test]
fn failed_intercept_shows_error_state() {
    let mut ii = record();
    ii.disposition = Disposition::NoAgent;
    ii.message = "no agent found for echo".into();
    let out = Info::new(&ii, None).render();
    assert!(out.contains("State                  : error: NO_AGENT: no agent found for echo"));
}

#[test]
fn container_port_intercept_shows_pod_address() {
    let mut ii = record();
    ii.spec.service_uid.clear();
    ii.spec.port_identifier = "9100".into();
    ii.spec.container_port = 9100;
    let out = Info::new(&ii, None).render();
    assert!(out.contains("Container Port Identifier: 9100"));
    assert!(out.contains("Address                  : 10.1.0.4:9100"));
}

#[test]
fn mount_error_replaces_mount_point() {
    let out = Info::new(&record(), Some("sshfs not found")).render();
    assert!(out.contains("Volume Mount Error"));
    assert!(out.contains("sshfs not found"));
    assert!(!out.contains("Volume Mount Point"));
}

#[test]
fn debug_adds_id_and_mechanism() {
    let mut info = Info::new(&record(), None);
    let plain = info.render();
    assert!(!plain.contains("ID"));

    info.debug = true;
    let out = info.render();
    assert!(out.contains(": 3f2a\n"));
    assert!(out.contains("Mechanism"));
    assert!(out.contains("(\"team\", \"blue\")"));
}

#[test]
fn http_filter_is_described() {
    let mut ii = record();
    ii.spec.mechanism = "http".into();
    ii.spec.mechanism_args = vec!["--http-header=x-user=alice".into()];
    let info = Info::new(&ii, None);
    assert!(!info.global);
    assert!(info
        .render()
        .contains("using mechanism=\"http\" with args=[\"--http-header=x-user=alice\"]"));

    ii.mechanism_args_desc = "HTTP requests with headers 'x-user: alice'".into();
    assert!(Info::new(&ii, None)
        .render()
        .contains("Intercepting           : HTTP requests with headers 'x-user: alice'"));
}

#[test]
fn ipv6_destination_is_bracketed() {
    let mut ii = record();
    ii.spec.target_host = "::1".into();
    assert!(Info::new(&ii, None).render().contains("[::1]:8080"));
}

#[test]
fn view_serializes_without_empty_fields() {
    let json = serde_json::to_value(Info::new(&record(), None)).expect("serialize");
    assert_eq!(json["name"], "echo");
    assert_eq!(json["disposition"], "ACTIVE");
    assert_eq!(json["mount"]["local_dir"], "/tmp/echo");
    assert!(json.get("message").is_none());
    assert!(json.get("debug").is_none());
}
