//! Unit tests for agent provisioning: record creation and refresh, agent
//! arrival, and the cluster events that end the wait early.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use agent_intercept::config::AgentConfigSettings;
use agent_intercept::errors::ErrorCategory;
use agent_intercept::manager::agents::AgentRegistry;
use agent_intercept::manager::config_store::{AgentConfigStore, ConfigMap, MemoryConfigStore};
use agent_intercept::manager::generator::generate_agent_config;
use agent_intercept::manager::provisioner::{
    check_intercept_annotations, is_extended, validate_agent_image, AgentProvisioner,
};
use agent_intercept::manager::{BoxFuture, ClusterApi};
use agent_intercept::models::agent::{AgentConfig, AgentInfo, AGENT_CONTAINER_NAME};
use agent_intercept::models::event::{ClusterEvent, ObjectRef};
use agent_intercept::models::intercept::{InterceptInfo, InterceptSpec};
use agent_intercept::models::workload::{
    Container, ContainerPort, Service, ServicePort, Workload, INJECT_ANNOTATION,
    MANUAL_INJECT_ANNOTATION,
};
use agent_intercept::{AppError, Result};

struct FakeCluster {
    workloads: HashMap<String, Workload>,
    events_tx: mpsc::Sender<ClusterEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ClusterEvent>>>,
    logs_requested: Mutex<Vec<String>>,
}

impl FakeCluster {
    fn new(workloads: Vec<Workload>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(16);
        Arc::new(Self {
            workloads: workloads.into_iter().map(|wl| (wl.name.clone(), wl)).collect(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            logs_requested: Mutex::new(Vec::new()),
        })
    }
}

impl ClusterApi for FakeCluster {
    fn get_workload(&self, name: &str, namespace: &str, _kind: &str) -> BoxFuture<'_, Result<Workload>> {
        let found = self
            .workloads
            .get(name)
            .filter(|wl| wl.namespace == namespace)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("workload {name}.{namespace} not found")));
        Box::pin(async move { found })
    }

    fn watch_events(&self, _namespace: &str) -> BoxFuture<'_, Result<mpsc::Receiver<ClusterEvent>>> {
        let rx = self.events_rx.lock().unwrap().take();
        Box::pin(async move { rx.ok_or_else(|| AppError::Cluster("event watch already taken".into())) })
    }

    fn pod_logs(&self, pod: &str, _namespace: &str, container: &str) -> BoxFuture<'_, Result<String>> {
        self.logs_requested.lock().unwrap().push(format!("{pod}/{container}"));
        Box::pin(async { Ok("panic: listen tcp :8080: address already in use".to_owned()) })
    }
}

struct Fixture {
    cluster: Arc<FakeCluster>,
    store: Arc<MemoryConfigStore>,
    agents: Arc<AgentRegistry>,
    provisioner: AgentProvisioner,
}

fn settings(image: Option<&str>) -> AgentConfigSettings {
    AgentConfigSettings {
        image: image.map(str::to_owned),
        injector_enabled: true,
        extended_supported: true,
    }
}

fn fixture_with(settings: AgentConfigSettings, arrival: Duration, workloads: Vec<Workload>) -> Fixture {
    let cluster = FakeCluster::new(workloads);
    let store = Arc::new(MemoryConfigStore::new());
    let agents = Arc::new(AgentRegistry::new());
    let provisioner = AgentProvisioner::new(
        settings,
        arrival,
        Arc::clone(&cluster) as Arc<dyn ClusterApi>,
        Arc::clone(&store) as Arc<dyn AgentConfigStore>,
        Arc::clone(&agents),
    );
    Fixture {
        cluster,
        store,
        agents,
        provisioner,
    }
}

fn fixture() -> Fixture {
    fixture_with(settings(Some("agent:2")), Duration::from_secs(5), vec![echo_workload()])
}

fn echo_workload() -> Workload {
    Workload {
        name: "echo".into(),
        namespace: "default".into(),
        kind: "Deployment".into(),
        annotations: HashMap::new(),
        containers: vec![Container {
            name: "app".into(),
            image: "echo:1".into(),
            ports: vec![ContainerPort {
                name: "http".into(),
                container_port: 8080,
                protocol: String::new(),
            }],
        }],
        services: vec![Service {
            name: "echo".into(),
            uid: "uid-echo".into(),
            ports: vec![ServicePort {
                name: "web".into(),
                port: 80,
                target_port: "http".into(),
                protocol: String::new(),
            }],
        }],
    }
}

fn echo_spec() -> InterceptSpec {
    InterceptSpec {
        name: "echo".into(),
        agent: "echo".into(),
        namespace: "default".into(),
        ..InterceptSpec::default()
    }
}

fn agent(session: &str, pod: &str) -> AgentInfo {
    AgentInfo {
        session_id: session.into(),
        name: "echo".into(),
        namespace: "default".into(),
        kind: "Deployment".into(),
        pod_name: pod.into(),
        pod_ip: "10.1.0.4".into(),
        version: "2.19".into(),
    }
}

fn event(reason: &str, pod: &str, note: &str) -> ClusterEvent {
    ClusterEvent {
        event_type: "Warning".into(),
        reason: reason.into(),
        note: note.into(),
        regarding: ObjectRef {
            kind: "Pod".into(),
            name: pod.into(),
        },
        // Ahead of the watch start so that the filter never drops it.
        creation_timestamp: Utc::now() + chrono::Duration::seconds(5),
    }
}

/// Register `info` once the workload has an agent config record.
fn arrive_when_provisioned(
    store: Arc<MemoryConfigStore>,
    agents: Arc<AgentRegistry>,
    info: AgentInfo,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Ok(Some(_)) = store.get(&info.name, &info.namespace).await {
                agents.register(info);
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
}

async fn seed_record(store: &MemoryConfigStore, ac: AgentConfig) {
    let mut mutate = |cm: &mut ConfigMap| -> Result<bool> {
        cm.insert(ac.workload_name.clone(), ac.clone());
        Ok(true)
    };
    store.update("default", &mut mutate).await.expect("seed record");
}

#[tokio::test]
async fn prepare_provisions_agent_and_resolves_port() {
    let fx = fixture();
    let arrival = arrive_when_provisioned(
        Arc::clone(&fx.store),
        Arc::clone(&fx.agents),
        agent("s1", "echo-7d9f-abc"),
    );

    let prepared = fx.provisioner.prepare_intercept(&echo_spec()).await;
    arrival.await.expect("arrival task");

    assert!(prepared.to_error().is_none(), "unexpected error: {}", prepared.error);
    assert_eq!(prepared.namespace, "default");
    assert_eq!(prepared.service_uid, "uid-echo");
    assert_eq!(prepared.service_name, "echo");
    assert_eq!(prepared.service_port_name, "web");
    assert_eq!(prepared.service_port, 80);
    assert_eq!(prepared.container_name, "app");
    assert_eq!(prepared.protocol, "TCP");
    assert_eq!(prepared.container_port, 8080);
    assert_eq!(prepared.agent_image, "agent:2");
    assert_eq!(prepared.workload_kind, "Deployment");

    let record = fx.store.get("echo", "default").await.expect("get").expect("record");
    assert_eq!(record.agent_image, "agent:2");
    assert_eq!(record.containers[0].intercepts.len(), 1);
}

#[tokio::test]
async fn unknown_workload_is_a_user_error() {
    let fx = fixture();
    let mut spec = echo_spec();
    spec.agent = "missing".into();

    let prepared = fx.provisioner.prepare_intercept(&spec).await;
    match prepared.to_error() {
        Some(AppError::User(msg)) => assert!(msg.contains("missing.default not found")),
        other => panic!("expected user error, got {other:?}"),
    }
}

#[tokio::test]
async fn disabled_annotation_creates_no_record() {
    let mut wl = echo_workload();
    wl.annotations.insert(INJECT_ANNOTATION.into(), "disabled".into());
    let fx = fixture_with(settings(Some("agent:2")), Duration::from_secs(5), vec![wl]);

    let prepared = fx.provisioner.prepare_intercept(&echo_spec()).await;
    assert_eq!(prepared.error, "Deployment echo.default is not interceptable");
    assert!(fx.store.get("echo", "default").await.expect("get").is_none());
}

#[tokio::test]
async fn missing_image_disables_intercepts() {
    let fx = fixture_with(settings(None), Duration::from_secs(5), vec![echo_workload()]);
    let prepared = fx.provisioner.prepare_intercept(&echo_spec()).await;
    assert!(prepared.error.starts_with("intercepts are disabled"));
    assert_eq!(
        prepared.to_error().map(|e| e.category()),
        Some(ErrorCategory::User)
    );
}

#[tokio::test]
async fn disabled_injector_requires_a_manual_record() {
    let mut s = settings(Some("agent:2"));
    s.injector_enabled = false;
    let fx = fixture_with(s, Duration::from_secs(5), vec![echo_workload()]);

    let err = fx
        .provisioner
        .ensure_agent_for("echo", "default")
        .await
        .expect_err("no record");
    assert_eq!(
        err,
        AppError::User(
            "agent-injector is disabled and no agent has been added manually for echo.default".into()
        )
    );

    seed_record(&fx.store, generate_agent_config(&echo_workload(), "agent:1")).await;
    fx.agents.register(agent("s1", "echo-a"));
    let agents = fx
        .provisioner
        .ensure_agent_for("echo", "default")
        .await
        .expect("manual record");
    assert_eq!(agents.len(), 1);
}

#[tokio::test]
async fn crash_loop_event_fails_fast_and_drops_the_record() {
    let fx = fixture();
    fx.cluster
        .events_tx
        .send(event(
            "BackOff",
            "echo-7d9f-abc",
            "Back-off restarting failed container app in pod echo-7d9f-abc_default(0c1b)",
        ))
        .await
        .expect("send event");

    let started = tokio::time::Instant::now();
    let prepared = fx.provisioner.prepare_intercept(&echo_spec()).await;
    assert!(started.elapsed() < Duration::from_secs(4), "must not wait for the deadline");

    assert!(prepared.error.contains("Back-off restarting failed container"));
    assert!(prepared.error.contains("The logs of Pod echo-7d9f-abc might provide more details"));
    assert_eq!(
        fx.cluster.logs_requested.lock().unwrap().as_slice(),
        ["echo-7d9f-abc/app".to_owned()]
    );
    assert!(
        fx.store.get("echo", "default").await.expect("get").is_none(),
        "record without agent must be removed"
    );
}

#[tokio::test]
async fn quota_failure_is_fatal_with_hint() {
    let fx = fixture();
    fx.cluster
        .events_tx
        .send(event("FailedCreate", "echo-7d9f", "exceeded quota: compute-resources"))
        .await
        .expect("send event");

    let prepared = fx.provisioner.prepare_intercept(&echo_spec()).await;
    assert!(prepared.error.starts_with("exceeded quota: compute-resources\nHint:"));
}

#[tokio::test]
async fn timeout_lists_relevant_events() {
    let fx = fixture_with(settings(Some("agent:2")), Duration::from_millis(300), vec![echo_workload()]);
    fx.cluster
        .events_tx
        .send(event("FailedScheduling", "echo-7d9f-abc", "0/3 nodes are available: 3 Insufficient cpu"))
        .await
        .expect("send event");
    fx.cluster
        .events_tx
        .send(event("Unhealthy", "echo-7d9f-abc", "Readiness probe failed"))
        .await
        .expect("send event");
    fx.cluster
        .events_tx
        .send(event("Unhealthy", "unrelated-pod", "Readiness probe failed"))
        .await
        .expect("send event");

    let err = fx
        .provisioner
        .ensure_agent_for("echo", "default")
        .await
        .expect_err("no agent arrives");
    let AppError::Timeout(msg) = err else {
        panic!("expected timeout, got {err:?}");
    };
    assert!(msg.starts_with("request timed out while waiting for agent echo.default to arrive"));
    assert!(msg.contains("Events that may be relevant:\n"));
    assert!(msg.contains("AGE"));
    assert!(msg.contains("FailedScheduling"));
    assert!(msg.contains("pod/echo-7d9f-abc"));
    assert!(!msg.contains("unrelated-pod"));
}

#[tokio::test]
async fn timeout_without_events_has_no_table() {
    let fx = fixture_with(settings(Some("agent:2")), Duration::from_millis(200), vec![echo_workload()]);
    let err = fx
        .provisioner
        .ensure_agent_for("echo", "default")
        .await
        .expect_err("no agent arrives");
    assert_eq!(
        err,
        AppError::Timeout("request timed out while waiting for agent echo.default to arrive".into())
    );
}

#[tokio::test]
async fn blacklisted_pods_do_not_count_as_arrived() {
    let fx = fixture_with(settings(Some("agent:2")), Duration::from_millis(300), vec![echo_workload()]);
    seed_record(&fx.store, generate_agent_config(&echo_workload(), "agent:2")).await;
    fx.agents.blacklist("echo-old", "default");
    fx.agents.register(agent("s1", "echo-old"));

    let err = fx
        .provisioner
        .ensure_agent_for("echo", "default")
        .await
        .expect_err("only a blacklisted agent");
    assert!(matches!(err, AppError::Timeout(_)));
}

#[tokio::test]
async fn extended_request_refreshes_image_and_deactivates_agents() {
    let fx = fixture();
    seed_record(&fx.store, generate_agent_config(&echo_workload(), "agent:1")).await;
    fx.agents.register(agent("s1", "echo-a"));

    let mut spec = echo_spec();
    spec.mechanism = "http".into();
    let prepared = fx.provisioner.prepare_intercept(&spec).await;
    assert!(prepared.to_error().is_none(), "unexpected error: {}", prepared.error);
    assert_eq!(prepared.agent_image, "agent:2");

    let record = fx.store.get("echo", "default").await.expect("get").expect("record");
    assert_eq!(record.agent_image, "agent:2");
    assert!(!fx.agents.is_active("s1"));
}

#[tokio::test]
async fn plain_request_keeps_the_recorded_image() {
    let fx = fixture();
    seed_record(&fx.store, generate_agent_config(&echo_workload(), "agent:1")).await;
    fx.agents.register(agent("s1", "echo-a"));
    let version = fx.store.version("default");

    let prepared = fx.provisioner.prepare_intercept(&echo_spec()).await;
    assert_eq!(prepared.agent_image, "agent:1");
    assert_eq!(fx.store.version("default"), version, "record is not rewritten");
    assert!(fx.agents.is_active("s1"));
}

#[tokio::test]
async fn replace_policy_change_updates_the_record() {
    let fx = fixture();
    seed_record(&fx.store, generate_agent_config(&echo_workload(), "agent:2")).await;
    fx.agents.register(agent("s1", "echo-a"));

    let mut spec = echo_spec();
    spec.replace = true;
    let prepared = fx.provisioner.prepare_intercept(&spec).await;
    assert!(prepared.to_error().is_none(), "unexpected error: {}", prepared.error);

    let record = fx.store.get("echo", "default").await.expect("get").expect("record");
    assert!(record.containers[0].replace);
    assert!(!fx.agents.is_active("s1"));
}

#[tokio::test]
async fn stale_agents_depart_before_a_new_record() {
    let fx = fixture();
    fx.agents.register(agent("stale", "echo-old"));

    let agents = Arc::clone(&fx.agents);
    let departure = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        agents.depart("stale");
    });
    let arrival = arrive_when_provisioned(
        Arc::clone(&fx.store),
        Arc::clone(&fx.agents),
        agent("fresh", "echo-new"),
    );

    let prepared = fx.provisioner.prepare_intercept(&echo_spec()).await;
    departure.await.expect("departure task");
    arrival.await.expect("arrival task");
    assert!(prepared.to_error().is_none(), "unexpected error: {}", prepared.error);
    assert!(fx.agents.is_active("fresh"));
}

#[tokio::test]
async fn restore_app_container_clears_replace_and_blacklists_pods() {
    let fx = fixture();
    let mut ac = generate_agent_config(&echo_workload(), "agent:2");
    ac.containers[0].replace = true;
    seed_record(&fx.store, ac).await;
    fx.agents.register(agent("s1", "echo-a"));

    let info = InterceptInfo {
        id: "id-1".into(),
        spec: echo_spec(),
        ..InterceptInfo::default()
    };
    fx.provisioner.restore_app_container(&info).await.expect("restore");

    let record = fx.store.get("echo", "default").await.expect("get").expect("record");
    assert!(!record.containers[0].replace);
    assert!(!fx.agents.is_active("s1"));
    assert!(fx.agents.is_blacklisted("echo-a", "default"));
}

#[test]
fn annotations_decide_eligibility() {
    let mut wl = echo_workload();
    assert_eq!(check_intercept_annotations(&wl), Ok(true));

    wl.annotations.insert(INJECT_ANNOTATION.into(), "false".into());
    assert_eq!(check_intercept_annotations(&wl), Ok(false));

    wl.annotations.insert(INJECT_ANNOTATION.into(), "enabled".into());
    assert_eq!(check_intercept_annotations(&wl), Ok(true));

    wl.annotations.insert(INJECT_ANNOTATION.into(), "sometimes".into());
    assert!(matches!(check_intercept_annotations(&wl), Err(AppError::User(_))));
}

#[test]
fn manual_injection_requires_the_agent_container() {
    let mut wl = echo_workload();
    wl.annotations.insert(MANUAL_INJECT_ANNOTATION.into(), "true".into());
    let err = check_intercept_annotations(&wl).expect_err("agent container missing");
    assert!(err.to_string().contains("has no traffic-agent container"));

    wl.containers.push(Container {
        name: AGENT_CONTAINER_NAME.into(),
        ..Container::default()
    });
    assert_eq!(check_intercept_annotations(&wl), Ok(true));
}

#[test]
fn image_validation() {
    assert_eq!(validate_agent_image(Some("agent:2"), false, false), Ok("agent:2".to_owned()));
    assert_eq!(validate_agent_image(Some("agent:2"), true, true), Ok("agent:2".to_owned()));
    assert!(validate_agent_image(Some(""), false, false).is_err());
    let err = validate_agent_image(Some("agent:2"), true, false).expect_err("extended unsupported");
    assert!(err.to_string().contains("extended traffic-agent"));
}

#[test]
fn extended_means_non_tcp_mechanism() {
    let mut spec = echo_spec();
    assert!(!is_extended(&spec));
    spec.mechanism = "tcp".into();
    assert!(!is_extended(&spec));
    spec.mechanism = "http".into();
    assert!(is_extended(&spec));
}
