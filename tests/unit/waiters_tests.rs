//! Unit tests for the creation waiter registry.

use agent_intercept::client::pod_access::Readiness;
use agent_intercept::client::waiters::{MountRequest, WaitOutcome, WaiterRegistry};
use agent_intercept::models::intercept::{Disposition, InterceptInfo, InterceptSpec};
use agent_intercept::AppError;

fn spec(name: &str) -> InterceptSpec {
    InterceptSpec {
        name: name.into(),
        agent: "echo".into(),
        ..InterceptSpec::default()
    }
}

fn active(name: &str) -> WaitOutcome {
    WaitOutcome {
        result: Ok(InterceptInfo {
            id: format!("id-{name}"),
            spec: spec(name),
            disposition: Disposition::Active,
            ..InterceptInfo::default()
        }),
        mounts_done: Readiness::done(),
    }
}

#[tokio::test]
async fn fired_outcome_reaches_the_caller() {
    let mut registry = WaiterRegistry::new();
    let mut rx = registry.register(&spec("web"), MountRequest::default());
    assert!(registry.contains("web"));

    assert!(registry.fire("web", active("web")));
    assert!(registry.is_empty(), "firing takes the waiter out");

    let outcome = rx.recv().await.expect("outcome delivered");
    assert_eq!(outcome.result.expect("success").id, "id-web");
}

#[tokio::test]
async fn a_waiter_fires_at_most_once() {
    let mut registry = WaiterRegistry::new();
    let mut rx = registry.register(&spec("web"), MountRequest::default());

    let waiter = registry.take("web").expect("registered");
    assert!(registry.take("web").is_none());
    assert!(!registry.fire("web", active("web")));

    assert!(waiter.fire(
        "web",
        WaitOutcome {
            result: Err(AppError::Manager("intercept in error state NO_AGENT: none".into())),
            mounts_done: Readiness::done(),
        }
    ));
    let outcome = rx.recv().await.expect("outcome delivered");
    assert!(outcome.result.is_err());
    assert!(rx.recv().await.is_none(), "channel closes after the only outcome");
}

#[test]
fn abandoned_waiter_drops_the_outcome() {
    let mut registry = WaiterRegistry::new();
    let rx = registry.register(&spec("web"), MountRequest::default());
    drop(rx);
    assert!(!registry.fire("web", active("web")));
}

#[test]
fn unregister_closes_the_channel() {
    let mut registry = WaiterRegistry::new();
    let mut rx = registry.register(&spec("web"), MountRequest::default());
    registry.unregister("web");
    assert!(matches!(
        rx.try_recv(),
        Err(tokio::sync::mpsc::error::TryRecvError::Disconnected)
    ));
}

#[test]
fn mount_request_and_pending_specs_are_visible() {
    let mut registry = WaiterRegistry::new();
    let _web = registry.register(
        &spec("web"),
        MountRequest {
            mount_point: "/tmp/web".into(),
            local_mount_port: 7777,
            read_only: true,
        },
    );
    let _api = registry.register(&spec("api"), MountRequest::default());

    assert_eq!(registry.len(), 2);
    let mount = registry.mount_request("web").expect("mount request");
    assert_eq!(mount.mount_point, "/tmp/web");
    assert_eq!(mount.local_mount_port, 7777);
    assert!(mount.read_only);

    let mut names: Vec<&str> = registry.pending().map(|s| s.name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["api", "web"]);
}

#[test]
fn registering_again_replaces_the_waiter() {
    let mut registry = WaiterRegistry::new();
    let mut first = registry.register(&spec("web"), MountRequest::default());
    let _second = registry.register(&spec("web"), MountRequest::default());
    assert_eq!(registry.len(), 1);
    assert!(matches!(
        first.try_recv(),
        Err(tokio::sync::mpsc::error::TryRecvError::Disconnected)
    ));
}
