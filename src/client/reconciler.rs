//! Snapshot reconciliation.
//!
//! The control plane pushes the full list of the session's intercept
//! records on every change. Each list replaces the session's intercept set:
//! refreshed records keep their client-only state, new records get their
//! own cancellable scope, and records that disappeared are torn down and
//! drained before the next list is looked at. Records that left `WAITING`
//! fire their creation waiter and drive the pod access sessions.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::client::pod_access::Readiness;
use crate::client::session::{Intercept, Session, SessionState};
use crate::client::waiters::WaitOutcome;
use crate::models::intercept::{Disposition, InterceptInfo};
use crate::AppError;

impl Session {
    /// Consume the snapshot stream until the session is cancelled.
    ///
    /// A failed or ended stream counts as an empty snapshot, which tears
    /// down every local resource, and is then reopened with capped
    /// exponential backoff. A restored stream reconciles forward.
    pub(crate) async fn watch_intercepts_handler(self: Arc<Self>) {
        let mut delay = self.retry.initial;
        loop {
            let opened = tokio::select! {
                () = self.cancel.cancelled() => break,
                opened = self.manager.watch_intercepts(&self.info) => opened,
            };

            match opened {
                Err(err) => warn!(%err, "unable to watch intercepts"),
                Ok(mut stream) => loop {
                    let item = tokio::select! {
                        () = self.cancel.cancelled() => break,
                        item = stream.recv() => item,
                    };
                    match item {
                        Some(Ok(intercepts)) => {
                            delay = self.retry.initial;
                            self.handle_snapshot(intercepts).await;
                        }
                        Some(Err(err)) => {
                            warn!(%err, "intercept stream failed");
                            self.handle_snapshot(Vec::new()).await;
                            break;
                        }
                        None => {
                            debug!("intercept stream ended");
                            self.handle_snapshot(Vec::new()).await;
                            break;
                        }
                    }
                },
            }

            if self.cancel.is_cancelled() {
                break;
            }
            debug!(delay_ms = delay.as_millis(), "reopening intercept stream");
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(self.retry.max);
        }

        self.handle_snapshot(Vec::new()).await;
        debug!("stopped watching intercepts");
    }

    /// Apply one snapshot of the session's intercept records.
    ///
    /// Must not run concurrently with itself; the stream task is the only
    /// caller outside of tests.
    pub async fn handle_snapshot(&self, intercepts: Vec<InterceptInfo>) {
        self.set_current_intercepts(&intercepts).await;
        self.pod_access.init_snapshot();

        for ii in &intercepts {
            if ii.disposition == Disposition::Waiting {
                continue;
            }
            let name = ii.spec.name.as_str();

            let (waiter, params) = {
                let mut state = self.state();
                let waiter = state.waiters.take(name);
                // A cancelled scope means the intercept is being removed.
                let params = state
                    .intercepts
                    .get(&ii.id)
                    .filter(|ic| !ic.scope.is_cancelled())
                    .map(Intercept::pod_access_params);
                (waiter, params)
            };

            let result = if ii.disposition == Disposition::Active {
                if ii.spec.namespace == self.info.namespace {
                    Ok(ii.clone())
                } else {
                    Err(AppError::User(format!(
                        "active intercepts in both namespace {} and {}",
                        ii.spec.namespace, self.info.namespace
                    )))
                }
            } else {
                Err(AppError::Manager(format!(
                    "intercept in error state {}: {}",
                    ii.disposition, ii.message
                )))
            };

            let mounts_done = match (&result, params) {
                (Ok(_), Some(params)) => self.pod_access.start(&ii.id, params),
                (Err(err), _) => {
                    error!(intercept = %name, %err, "intercept not usable");
                    Readiness::done()
                }
                (Ok(_), None) => Readiness::done(),
            };

            if let Some(waiter) = waiter {
                debug!(intercept = %name, id = %ii.id, disposition = %ii.disposition, "intercept is no longer WAITING");
                waiter.fire(
                    name,
                    WaitOutcome {
                        result,
                        mounts_done,
                    },
                );
            }
        }

        self.pod_access.cancel_unwanted().await;
    }

    /// Replace the intercept set with `intercepts` and tear down the
    /// intercepts that disappeared.
    async fn set_current_intercepts(&self, intercepts: &[InterceptInfo]) {
        let removed: Vec<Intercept> = {
            let mut state = self.state();
            let mut previous = std::mem::take(&mut state.intercepts);
            let mut current = HashMap::with_capacity(intercepts.len());
            let mut summary = String::from("[");

            for (i, ii) in intercepts.iter().enumerate() {
                let ic = match previous.remove(&ii.id) {
                    Some(mut ic) => {
                        ic.refresh(ii.clone());
                        ic
                    }
                    None => {
                        debug!(intercept = %ii.spec.name, id = %ii.id, "received new intercept");
                        let mut ic = Intercept::new(ii.clone(), self.cancel.child_token());
                        if let Some(mount) = state.waiters.mount_request(&ii.spec.name) {
                            ic.seed(mount);
                        }
                        self.spawn_release_guard(&ic);
                        ic
                    }
                };
                if i > 0 {
                    summary.push(',');
                }
                let _ = write!(summary, "{}={}", ii.spec.name, ii.pod_ip);
                current.insert(ii.id.clone(), ic);
            }
            summary.push(']');
            debug!(intercepts = %summary, "set current intercepts");

            state.intercepts = current;
            let SessionState {
                intercepts: current_set,
                api,
                ..
            } = &mut *state;
            api.reconcile(current_set.values().map(|ic| &ic.info), &self.lookup);
            previous.into_values().collect()
        };

        for ic in removed {
            debug!(intercept = %ic.name(), id = %ic.info.id, "cancelling intercept");
            ic.scope.cancel();
            ic.tasks.close();
            ic.tasks.wait().await;
        }
    }

    /// Release the intercept's pod access once its scope is cancelled.
    fn spawn_release_guard(&self, ic: &Intercept) {
        let scope = ic.scope.clone();
        let pod_access = Arc::clone(&self.pod_access);
        let id = ic.info.id.clone();
        ic.tasks.spawn(async move {
            scope.cancelled().await;
            pod_access.release(&id).await;
        });
    }
}
