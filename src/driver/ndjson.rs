//! Newline-delimited JSON control-plane client.
//!
//! # Wire format
//!
//! | Direction | Shape                                                        |
//! |-----------|--------------------------------------------------------------|
//! | request   | `{"id": 7, "method": "create_intercept", "params": {...}}`   |
//! | response  | `{"id": 7, "result": ...}` or `{"id": 7, "error": {...}}`    |
//! | push      | `{"method": "intercepts", "params": {"intercepts": [...]}}`  |
//!
//! Request/response calls share one lazily opened connection that is
//! reopened after it drops. Each snapshot watch runs on a dedicated
//! connection whose pushes feed the returned stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::driver::codec::NdjsonCodec;
use crate::driver::{ManagerClient, SnapshotStream};
use crate::errors::ErrorCategory;
use crate::manager::BoxFuture;
use crate::models::intercept::{InterceptInfo, InterceptSnapshot, InterceptSpec, SessionInfo};
use crate::models::result::PreparedIntercept;
use crate::{AppError, Result};

const OUTBOUND_CAPACITY: usize = 64;
const SNAPSHOT_CAPACITY: usize = 16;
const PUSH_METHOD: &str = "intercepts";

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<serde_json::Value>>>>>;
type PushSender = mpsc::Sender<Result<Vec<InterceptInfo>>>;

#[derive(Serialize)]
struct Request<'a, P: Serialize> {
    id: u64,
    method: &'a str,
    params: P,
}

#[derive(Debug, Deserialize)]
struct WireError {
    message: String,
    #[serde(default)]
    category: i32,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    id: Option<u64>,
    method: Option<String>,
    #[serde(default)]
    params: serde_json::Value,
    #[serde(default)]
    result: serde_json::Value,
    error: Option<WireError>,
}

#[derive(Serialize)]
struct SpecParams<'a> {
    session: &'a SessionInfo,
    spec: &'a InterceptSpec,
}

#[derive(Serialize)]
struct RemoveParams<'a> {
    session: &'a SessionInfo,
    name: &'a str,
}

/// Removes a request's pending entry when the request ends, including
/// when the caller drops it before an answer arrives.
struct PendingEntry<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

struct Connection {
    out: mpsc::Sender<String>,
    pending: Pending,
    closed: CancellationToken,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// [`ManagerClient`] speaking newline-delimited JSON over TCP.
pub struct NdjsonManagerClient {
    address: String,
    request_timeout: Duration,
    next_id: AtomicU64,
    calls: tokio::sync::Mutex<Option<Arc<Connection>>>,
    watch: Mutex<Option<Connection>>,
    cancel: CancellationToken,
}

impl NdjsonManagerClient {
    /// Create a client for the endpoint at `address`. No connection is
    /// opened until the first request. All connections close when
    /// `cancel` fires.
    #[must_use]
    pub fn new(address: impl Into<String>, request_timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            address: address.into(),
            request_timeout,
            next_id: AtomicU64::new(1),
            calls: tokio::sync::Mutex::new(None),
            watch: Mutex::new(None),
            cancel,
        }
    }

    async fn connection(&self) -> Result<Arc<Connection>> {
        let mut guard = self.calls.lock().await;
        if let Some(conn) = guard.as_ref() {
            if !conn.closed.is_cancelled() {
                return Ok(Arc::clone(conn));
            }
            debug!(address = %self.address, "control-plane connection dropped, reconnecting");
        }
        let conn = Arc::new(open(&self.address, None, &self.cancel).await?);
        *guard = Some(Arc::clone(&conn));
        Ok(conn)
    }

    async fn request<P, R>(&self, conn: &Connection, method: &str, params: P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = serde_json::to_string(&Request { id, method, params })?;
        let (tx, rx) = oneshot::channel();
        lock(&conn.pending).insert(id, tx);
        let _entry = PendingEntry {
            pending: &conn.pending,
            id,
        };

        if conn.out.send(line).await.is_err() {
            return Err(AppError::Manager(format!("{method}: connection closed")));
        }

        let value = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(answer)) => answer?,
            Ok(Err(_)) => return Err(AppError::Manager(format!("{method}: connection closed"))),
            Err(_) => {
                return Err(AppError::Timeout(format!(
                    "{method}: no answer within {}s",
                    self.request_timeout.as_secs()
                )));
            }
        };
        Ok(serde_json::from_value(value)?)
    }

    async fn call<P, R>(&self, method: &str, params: P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let conn = self.connection().await?;
        self.request(&conn, method, params).await
    }
}

impl ManagerClient for NdjsonManagerClient {
    fn watch_intercepts(&self, session: &SessionInfo) -> BoxFuture<'_, Result<SnapshotStream>> {
        let session = session.clone();
        Box::pin(async move {
            let (push_tx, push_rx) = mpsc::channel(SNAPSHOT_CAPACITY);
            let conn = open(&self.address, Some(push_tx), &self.cancel).await?;
            self.request::<_, serde_json::Value>(&conn, "watch_intercepts", &session)
                .await?;
            // Replacing the previous watch connection closes it.
            *lock(&self.watch) = Some(conn);
            Ok(push_rx)
        })
    }

    fn prepare_intercept(
        &self,
        session: &SessionInfo,
        spec: &InterceptSpec,
    ) -> BoxFuture<'_, Result<PreparedIntercept>> {
        let session = session.clone();
        let spec = spec.clone();
        Box::pin(async move {
            self.call(
                "prepare_intercept",
                SpecParams {
                    session: &session,
                    spec: &spec,
                },
            )
            .await
        })
    }

    fn create_intercept(
        &self,
        session: &SessionInfo,
        spec: &InterceptSpec,
    ) -> BoxFuture<'_, Result<InterceptInfo>> {
        let session = session.clone();
        let spec = spec.clone();
        Box::pin(async move {
            self.call(
                "create_intercept",
                SpecParams {
                    session: &session,
                    spec: &spec,
                },
            )
            .await
        })
    }

    fn remove_intercept(&self, session: &SessionInfo, name: &str) -> BoxFuture<'_, Result<()>> {
        let session = session.clone();
        let name = name.to_owned();
        Box::pin(async move {
            let _: serde_json::Value = self
                .call(
                    "remove_intercept",
                    RemoveParams {
                        session: &session,
                        name: &name,
                    },
                )
                .await?;
            Ok(())
        })
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn open(address: &str, push: Option<PushSender>, parent: &CancellationToken) -> Result<Connection> {
    let stream = TcpStream::connect(address)
        .await
        .map_err(|err| AppError::Manager(format!("failed to connect to {address}: {err}")))?;
    let (read, write) = stream.into_split();
    let closed = parent.child_token();
    let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);

    let span = info_span!("manager_connection", %address, watch = push.is_some());
    tokio::spawn(run_writer(write, out_rx, closed.clone()).instrument(span.clone()));
    tokio::spawn(run_reader(read, Arc::clone(&pending), push, closed.clone()).instrument(span));
    debug!(%address, "connected to control plane");

    Ok(Connection {
        out: out_tx,
        pending,
        closed,
    })
}

async fn run_writer(mut write: OwnedWriteHalf, mut out: mpsc::Receiver<String>, closed: CancellationToken) {
    loop {
        tokio::select! {
            biased;

            () = closed.cancelled() => break,

            line = out.recv() => {
                let Some(line) = line else { break };
                let mut bytes = line.into_bytes();
                bytes.push(b'\n');
                if let Err(err) = write.write_all(&bytes).await {
                    warn!(%err, "write to control plane failed");
                    closed.cancel();
                    break;
                }
            }
        }
    }
}

async fn run_reader(
    read: OwnedReadHalf,
    pending: Pending,
    push: Option<PushSender>,
    closed: CancellationToken,
) {
    let mut framed = FramedRead::new(read, NdjsonCodec::new());
    let failure = loop {
        tokio::select! {
            biased;

            () = closed.cancelled() => break None,

            item = framed.next() => match item {
                None => {
                    debug!("control plane closed the connection");
                    break None;
                }
                Some(Err(err)) => {
                    warn!(%err, "control-plane stream failed");
                    break Some(err);
                }
                Some(Ok(line)) => {
                    if !dispatch(&line, &pending, push.as_ref()).await {
                        debug!("snapshot receiver dropped, closing watch");
                        break None;
                    }
                }
            }
        }
    };

    closed.cancel();
    let waiting: Vec<_> = lock(&pending).drain().map(|(_, tx)| tx).collect();
    for tx in waiting {
        let _ = tx.send(Err(AppError::Manager("connection closed".into())));
    }
    if let (Some(push), Some(err)) = (push, failure) {
        let _ = push.send(Err(err)).await;
    }
}

/// Route one inbound line. Returns `false` when the snapshot receiver is gone.
async fn dispatch(line: &str, pending: &Pending, push: Option<&PushSender>) -> bool {
    if line.trim().is_empty() {
        return true;
    }
    let envelope: Envelope = match serde_json::from_str(line) {
        Ok(env) => env,
        Err(err) => {
            warn!(%err, raw_line = %line, "malformed control-plane message, skipping");
            return true;
        }
    };

    if let Some(id) = envelope.id {
        let Some(tx) = lock(pending).remove(&id) else {
            debug!(id, "answer for unknown request");
            return true;
        };
        let answer = match envelope.error {
            Some(err) => Err(ErrorCategory::from_code(err.category).into_error(err.message)),
            None => Ok(envelope.result),
        };
        let _ = tx.send(answer);
        return true;
    }

    match (envelope.method.as_deref(), push) {
        (Some(PUSH_METHOD), Some(push)) => {
            match serde_json::from_value::<InterceptSnapshot>(envelope.params) {
                Ok(snapshot) => push.send(Ok(snapshot.intercepts)).await.is_ok(),
                Err(err) => {
                    warn!(%err, "malformed intercept snapshot, skipping");
                    true
                }
            }
        }
        (method, _) => {
            debug!(?method, "skipping unexpected control-plane message");
            true
        }
    }
}
