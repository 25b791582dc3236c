//! Local API listeners for intercepted processes.
//!
//! Agents announce an API port through their environment. For every such
//! port among the active intercepts one HTTP listener runs on
//! `127.0.0.1:<port>`, and for every such intercept one request matcher is
//! compiled from its header rules. Intercepted processes ask the listener
//! whether a given request is intercepted by them.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, Instrument};

use crate::client::matcher::RequestMatcher;
use crate::models::intercept::{Disposition, InterceptInfo};

/// Header carrying the intercept ID of the asking process.
pub const CALLER_ID_HEADER: &str = "x-intercept-caller-id";

/// Answer to an intercept-info query.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LookupResult {
    /// Whether the request is routed to the caller.
    pub intercepted: bool,
    /// Always `true`; the answer comes from the client.
    pub client_side: bool,
    /// Intercept metadata, set when intercepted.
    pub metadata: HashMap<String, String>,
}

/// Backing query of the listeners.
pub trait InterceptLookup: Send + Sync {
    /// Whether a request to `path` with `headers` is intercepted by the
    /// intercept `caller_id`.
    fn lookup(&self, caller_id: &str, path: &str, headers: &HeaderMap) -> LookupResult;
}

struct ApiMatcher {
    matcher: RequestMatcher,
    metadata: HashMap<String, String>,
}

/// Listener and matcher state. Owned by the session and mutated under its lock.
pub struct ApiReconciler {
    servers: HashMap<u16, CancellationToken>,
    matchers: HashMap<String, ApiMatcher>,
    parent: CancellationToken,
    tasks: TaskTracker,
}

impl ApiReconciler {
    /// Create a reconciler whose listeners stop with `parent`.
    #[must_use]
    pub fn new(parent: CancellationToken) -> Self {
        Self {
            servers: HashMap::new(),
            matchers: HashMap::new(),
            parent,
            tasks: TaskTracker::new(),
        }
    }

    /// Bring listeners and matchers in line with `intercepts`.
    pub fn reconcile<'a>(
        &mut self,
        intercepts: impl IntoIterator<Item = &'a InterceptInfo>,
        lookup: &Arc<dyn InterceptLookup>,
    ) {
        let mut wanted_ports: HashSet<u16> = HashSet::new();
        let mut wanted_matchers: HashMap<&str, &InterceptInfo> = HashMap::new();
        for ii in intercepts {
            if ii.disposition != Disposition::Active {
                continue;
            }
            match ii.agent_api_port() {
                Ok(Some(port)) => {
                    wanted_ports.insert(port);
                    wanted_matchers.insert(ii.id.as_str(), ii);
                }
                Ok(None) => {}
                Err(raw) => error!(
                    value = %raw,
                    agent = %ii.spec.agent,
                    namespace = %ii.spec.namespace,
                    "unable to parse agent API port"
                ),
            }
        }

        self.servers.retain(|port, token| {
            let keep = wanted_ports.contains(port);
            if !keep {
                debug!(port, "stopping API listener");
                token.cancel();
            }
            keep
        });
        for port in wanted_ports {
            if !self.servers.contains_key(&port) {
                let token = self.parent.child_token();
                self.tasks
                    .spawn(serve(port, Arc::clone(lookup), token.clone()).instrument(info_span!("api_server", port)));
                self.servers.insert(port, token);
            }
        }

        self.matchers.retain(|id, _| wanted_matchers.contains_key(id.as_str()));
        for (id, ii) in wanted_matchers {
            if self.matchers.contains_key(id) {
                continue;
            }
            match RequestMatcher::from_map(&ii.headers) {
                Ok(matcher) => {
                    debug!(id, %matcher, "added request matcher");
                    self.matchers.insert(
                        id.to_owned(),
                        ApiMatcher {
                            matcher,
                            metadata: ii.metadata.clone(),
                        },
                    );
                }
                Err(err) => error!(id, %err, "invalid header rules"),
            }
        }
    }

    /// Answer a query from the compiled matchers.
    #[must_use]
    pub fn lookup(&self, caller_id: &str, path: &str, headers: &HeaderMap) -> LookupResult {
        let mut result = LookupResult {
            client_side: true,
            ..LookupResult::default()
        };
        match self.matchers.get(caller_id) {
            None => debug!(caller_id, "no matcher found"),
            Some(am) if am.matcher.matches(path, headers) => {
                debug!(caller_id, matcher = %am.matcher, path, "request matches");
                result.intercepted = true;
                result.metadata.clone_from(&am.metadata);
            }
            Some(am) => debug!(caller_id, matcher = %am.matcher, path, "request does not match"),
        }
        result
    }

    /// Ports with a running listener.
    #[must_use]
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.servers.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Stop every listener and return a tracker to await their exit.
    pub fn shutdown(&mut self) -> TaskTracker {
        for token in self.servers.values() {
            token.cancel();
        }
        self.servers.clear();
        self.matchers.clear();
        self.tasks.close();
        self.tasks.clone()
    }
}

#[derive(Deserialize)]
struct PathQuery {
    #[serde(default)]
    path: String,
}

async fn health() -> &'static str {
    "ok"
}

async fn intercept_info(
    State(lookup): State<Arc<dyn InterceptLookup>>,
    Query(q): Query<PathQuery>,
    headers: HeaderMap,
) -> Json<LookupResult> {
    Json(lookup.lookup(caller_id(&headers), &q.path, &headers))
}

async fn consume_here(
    State(lookup): State<Arc<dyn InterceptLookup>>,
    Query(q): Query<PathQuery>,
    headers: HeaderMap,
) -> Json<bool> {
    Json(lookup.lookup(caller_id(&headers), &q.path, &headers).intercepted)
}

fn caller_id(headers: &HeaderMap) -> &str {
    headers
        .get(CALLER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// Router served on every API port.
pub fn router(lookup: Arc<dyn InterceptLookup>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/intercept-info", get(intercept_info))
        .route("/consume-here", get(consume_here))
        .with_state(lookup)
}

async fn serve(port: u16, lookup: Arc<dyn InterceptLookup>, ct: CancellationToken) {
    let bind = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = match tokio::net::TcpListener::bind(bind).await {
        Ok(l) => l,
        Err(err) => {
            error!(%bind, %err, "failed to bind API listener");
            return;
        }
    };
    info!(%bind, "API listener started");
    if let Err(err) = axum::serve(listener, router(lookup))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
    {
        error!(%bind, %err, "API listener failed");
    }
    info!(%bind, "API listener stopped");
}
