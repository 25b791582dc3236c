//! Unit tests for agent configuration generation.

use agent_intercept::manager::generator::generate_agent_config;
use agent_intercept::models::agent::AGENT_CONTAINER_NAME;
use agent_intercept::models::workload::{Container, ContainerPort, Service, ServicePort, Workload};

fn port(name: &str, number: u16) -> ContainerPort {
    ContainerPort {
        name: name.into(),
        container_port: number,
        protocol: String::new(),
    }
}

fn workload(containers: Vec<Container>, services: Vec<Service>) -> Workload {
    Workload {
        name: "echo".into(),
        namespace: "default".into(),
        kind: "Deployment".into(),
        containers,
        services,
        ..Workload::default()
    }
}

#[test]
fn service_ports_resolve_by_name_and_number() {
    let wl = workload(
        vec![Container {
            name: "app".into(),
            image: "echo:1".into(),
            ports: vec![port("http", 8080), port("", 9090)],
        }],
        vec![Service {
            name: "echo".into(),
            uid: "uid-1".into(),
            ports: vec![
                ServicePort {
                    name: "web".into(),
                    port: 80,
                    target_port: "http".into(),
                    protocol: String::new(),
                },
                ServicePort {
                    name: "grpc".into(),
                    port: 9090,
                    target_port: String::new(),
                    protocol: String::new(),
                },
            ],
        }],
    );

    let ac = generate_agent_config(&wl, "agent:1");
    assert_eq!(ac.agent_name, "echo");
    assert_eq!(ac.workload_kind, "Deployment");
    assert_eq!(ac.agent_image, "agent:1");
    assert_eq!(ac.containers.len(), 1);

    let rules = &ac.containers[0].intercepts;
    assert_eq!(rules.len(), 2, "covered container ports get no extra rule");
    assert_eq!(rules[0].service_port_name, "web");
    assert_eq!(rules[0].container_port, 8080);
    assert_eq!(rules[0].container_port_name, "http");
    assert_eq!(rules[1].service_port, 9090);
    assert_eq!(rules[1].container_port, 9090);
    assert!(rules.iter().all(|r| r.protocol == "TCP"));
}

#[test]
fn untargeted_container_ports_become_container_rules() {
    let wl = workload(
        vec![Container {
            name: "app".into(),
            image: "echo:1".into(),
            ports: vec![port("metrics", 9100)],
        }],
        Vec::new(),
    );
    let ac = generate_agent_config(&wl, "agent:1");
    let rule = &ac.containers[0].intercepts[0];
    assert!(rule.service_uid.is_empty());
    assert_eq!(rule.container_port_name, "metrics");
    assert_eq!(rule.container_port, 9100);
}

#[test]
fn agent_container_and_portless_containers_are_skipped() {
    let wl = workload(
        vec![
            Container {
                name: "app".into(),
                image: "echo:1".into(),
                ports: vec![port("http", 8080)],
            },
            Container {
                name: "logger".into(),
                image: "log:1".into(),
                ports: Vec::new(),
            },
            Container {
                name: AGENT_CONTAINER_NAME.into(),
                image: "agent:1".into(),
                ports: vec![port("sftp", 2222)],
            },
        ],
        Vec::new(),
    );
    let ac = generate_agent_config(&wl, "agent:1");
    let names: Vec<&str> = ac.containers.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["app"]);
}

#[test]
fn numeric_target_resolves_on_a_sole_container() {
    let wl = workload(
        vec![Container {
            name: "app".into(),
            image: "echo:1".into(),
            ports: Vec::new(),
        }],
        vec![Service {
            name: "echo".into(),
            uid: "uid-1".into(),
            ports: vec![ServicePort {
                name: String::new(),
                port: 80,
                target_port: "8080".into(),
                protocol: String::new(),
            }],
        }],
    );
    let ac = generate_agent_config(&wl, "agent:1");
    assert_eq!(ac.containers[0].intercepts[0].container_port, 8080);
}
