//! Generates a fresh agent configuration for a workload.

use std::collections::HashSet;

use tracing::debug;

use crate::models::agent::{
    AgentConfig, AgentContainer, InterceptRule, AGENT_CONTAINER_NAME, PROTOCOL_TCP,
};
use crate::models::workload::{Container, ContainerPort, ServicePort, Workload};

/// Derive interceptable ports from the workload's containers and the
/// services selecting it.
///
/// Every service port whose target resolves to a container port yields a
/// service rule. Container ports that no service targets yield
/// container-only rules. Containers without rules are left out.
#[must_use]
pub fn generate_agent_config(wl: &Workload, agent_image: &str) -> AgentConfig {
    let app_containers: Vec<&Container> = wl
        .containers
        .iter()
        .filter(|cn| cn.name != AGENT_CONTAINER_NAME)
        .collect();

    let mut containers = Vec::new();
    for cn in &app_containers {
        let mut intercepts = Vec::new();
        let mut covered: HashSet<(u16, String)> = HashSet::new();

        for svc in &wl.services {
            for sp in &svc.ports {
                let Some(cp) = resolve_target(cn, sp, app_containers.len() == 1) else {
                    continue;
                };
                let protocol = protocol_of(&sp.protocol);
                covered.insert((cp.container_port, protocol.clone()));
                intercepts.push(InterceptRule {
                    service_uid: svc.uid.clone(),
                    service_name: svc.name.clone(),
                    service_port_name: sp.name.clone(),
                    service_port: sp.port,
                    container_port_name: cp.name.clone(),
                    container_port: cp.container_port,
                    protocol,
                });
            }
        }

        for cp in &cn.ports {
            let protocol = protocol_of(&cp.protocol);
            if covered.contains(&(cp.container_port, protocol.clone())) {
                continue;
            }
            intercepts.push(InterceptRule {
                container_port_name: cp.name.clone(),
                container_port: cp.container_port,
                protocol,
                ..InterceptRule::default()
            });
        }

        if !intercepts.is_empty() {
            containers.push(AgentContainer {
                name: cn.name.clone(),
                replace: false,
                intercepts,
            });
        }
    }

    debug!(
        workload = %wl.qualified_name(),
        containers = containers.len(),
        "generated agent config"
    );
    AgentConfig {
        agent_name: wl.name.clone(),
        namespace: wl.namespace.clone(),
        workload_name: wl.name.clone(),
        workload_kind: wl.kind.clone(),
        agent_image: agent_image.to_owned(),
        containers,
    }
}

/// Resolve a service port's target against a container. A numeric target
/// that the container does not declare still resolves when the workload has
/// a single app container.
fn resolve_target(cn: &Container, sp: &ServicePort, sole: bool) -> Option<ContainerPort> {
    let target = if sp.target_port.is_empty() {
        sp.port.to_string()
    } else {
        sp.target_port.clone()
    };
    let protocol = protocol_of(&sp.protocol);
    if let Ok(number) = target.parse::<u16>() {
        if let Some(cp) = cn
            .ports
            .iter()
            .find(|cp| cp.container_port == number && protocol_of(&cp.protocol) == protocol)
        {
            return Some(cp.clone());
        }
        return sole.then(|| ContainerPort {
            name: String::new(),
            container_port: number,
            protocol,
        });
    }
    cn.ports
        .iter()
        .find(|cp| cp.name == target && protocol_of(&cp.protocol) == protocol)
        .cloned()
}

fn protocol_of(raw: &str) -> String {
    if raw.is_empty() {
        PROTOCOL_TCP.to_owned()
    } else {
        raw.to_ascii_uppercase()
    }
}
