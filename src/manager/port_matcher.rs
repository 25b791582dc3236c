//! Resolves an intercept request against a workload's declared ports.
//!
//! A request may name a service, a container, and a port identifier, all
//! optional. The match must be unique: the first rule accepted by the
//! filters becomes the candidate and any second accepted rule is an
//! ambiguity that the user resolves by adding `--service` or `--port`.

use tracing::debug;

use crate::models::agent::{AgentConfig, AgentContainer, InterceptRule, PortIdentifier};
use crate::models::intercept::InterceptSpec;
use crate::{AppError, Result};

/// Position of a matched rule inside an [`AgentConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchIndex {
    /// Index of the container that receives the traffic.
    pub container: usize,
    /// Index of the container that declares the rule.
    pub declaring_container: usize,
    /// Index of the rule in the declaring container.
    pub rule: usize,
}

/// Find the single (container, rule) pair matching `spec`.
///
/// When the request names a container, that container is returned even if
/// the rule is declared on a sibling container.
///
/// # Errors
///
/// Returns `AppError::User` when no rule or more than one rule matches, or
/// when the port identifier is malformed.
pub fn find_intercept<'a>(
    ac: &'a AgentConfig,
    spec: &InterceptSpec,
) -> Result<(&'a AgentContainer, &'a InterceptRule)> {
    let idx = find_intercept_index(ac, spec)?;
    Ok((
        &ac.containers[idx.container],
        &ac.containers[idx.declaring_container].intercepts[idx.rule],
    ))
}

/// Same as [`find_intercept`] but returns positions, so that callers can
/// mutate the matched container.
///
/// # Errors
///
/// See [`find_intercept`].
pub fn find_intercept_index(ac: &AgentConfig, spec: &InterceptSpec) -> Result<MatchIndex> {
    let pi_raw = spec.port_identifier.as_str();
    let pi = if pi_raw.is_empty() {
        None
    } else {
        Some(PortIdentifier::parse(pi_raw)?)
    };
    let svc = spec.service_name.as_str();

    let mut found: Option<MatchIndex> = None;
    for (ci, cn) in ac.containers.iter().enumerate() {
        for (ri, rule) in cn.intercepts.iter().enumerate() {
            if !svc.is_empty() && svc != rule.service_name {
                continue;
            }
            if let Some(pi) = &pi {
                let accepted = if rule.service_uid.is_empty() {
                    pi.is_for_container(rule)
                } else {
                    pi.is_for_service(rule)
                };
                if !accepted {
                    continue;
                }
            }
            if found.is_none() {
                let container = if spec.container_name.is_empty() {
                    ci
                } else {
                    ac.containers
                        .iter()
                        .position(|cx| cx.name == spec.container_name)
                        .unwrap_or(ci)
                };
                found = Some(MatchIndex {
                    container,
                    declaring_container: ci,
                    rule: ri,
                });
                continue;
            }
            return Err(AppError::User(ambiguity_message(ac, svc, pi_raw)));
        }
    }

    if let Some(idx) = found {
        debug!(
            workload = %ac.workload_name,
            container = %ac.containers[idx.container].name,
            "resolved intercept port"
        );
        return Ok(idx);
    }

    let filter = match (svc.is_empty(), pi_raw.is_empty()) {
        (false, false) => format!(" matching service {svc}, port {pi_raw}"),
        (false, true) => format!(" matching service {svc}"),
        (true, false) => format!(" matching port {pi_raw}"),
        (true, true) => String::new(),
    };
    Err(AppError::User(format!(
        "{} {}.{} has no interceptable port{filter}",
        ac.workload_kind, ac.workload_name, ac.namespace
    )))
}

fn ambiguity_message(ac: &AgentConfig, svc: &str, pi: &str) -> String {
    let (kind, name, ns) = (&ac.workload_kind, &ac.workload_name, &ac.namespace);
    match (svc.is_empty(), pi.is_empty()) {
        (true, true) => format!(
            "{kind} {name}.{ns} has multiple interceptable ports.\n\
             Please specify the service and/or port you want to intercept \
             by passing the --service=<svc> and/or --port=<local:portName/portNumber> flag."
        ),
        (true, false) => format!(
            "{kind} {name}.{ns} has multiple interceptable services with port {pi}.\n\
             Please specify the service you want to intercept by passing the --service=<svc> flag."
        ),
        (false, true) => format!(
            "{kind} {name}.{ns} has multiple interceptable ports in service {svc}.\n\
             Please specify the port you want to intercept by passing the --port=<local:svcPortName> flag."
        ),
        (false, false) => format!(
            "{kind} {name}.{ns} intercept config is broken. Service {svc}, port {pi} is declared more than once"
        ),
    }
}
