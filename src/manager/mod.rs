//! Control-plane side of intercept creation.
//!
//! The [`provisioner::AgentProvisioner`] makes sure a workload has an agent
//! configuration record and a live agent before an intercept is created,
//! and [`port_matcher`] resolves which declared port the request targets.
//! Cluster access goes through the [`ClusterApi`] trait so that the
//! provisioner can be driven by a real cluster client or by test fakes.

pub mod agents;
pub mod config_store;
pub mod generator;
pub mod port_matcher;
pub mod provisioner;

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

use crate::models::event::ClusterEvent;
use crate::models::workload::Workload;
use crate::Result;

/// Boxed future returned by the collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Cluster operations needed to provision agents.
pub trait ClusterApi: Send + Sync {
    /// Look up a workload. An empty `kind` matches any kind.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`](crate::AppError::NotFound) when no such
    /// workload exists, or [`AppError::Cluster`](crate::AppError::Cluster) on
    /// API failure.
    fn get_workload(&self, name: &str, namespace: &str, kind: &str)
        -> BoxFuture<'_, Result<Workload>>;

    /// Watch the non-normal events of a namespace. The watch ends when the
    /// receiver is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Cluster`](crate::AppError::Cluster) if the watch
    /// cannot be established.
    fn watch_events(&self, namespace: &str)
        -> BoxFuture<'_, Result<mpsc::Receiver<ClusterEvent>>>;

    /// Fetch the log of a pod's container.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Cluster`](crate::AppError::Cluster) on failure.
    fn pod_logs(&self, pod: &str, namespace: &str, container: &str)
        -> BoxFuture<'_, Result<String>>;
}
