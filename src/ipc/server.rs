//! Local IPC server for `agent-intercept-ctl` commands.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! using the `interprocess` crate. Accepts line-delimited JSON commands and
//! routes them to the client [`Session`].
//!
//! ## Protocol
//!
//! Request (one JSON object per line):
//! ```json
//! {"command": "list"}
//! {"command": "info", "name": "web-8080"}
//! {"command": "intercept", "request": { "spec": { ... }, "mount_point": "" }}
//! {"command": "remove", "name": "web-8080"}
//! {"command": "leave"}
//! {"command": "interceptor", "id": "3f2a...", "pid": 4711}
//! {"command": "drop-interceptor", "id": "web/app"}
//! ```
//!
//! Response (one JSON object per line):
//! ```json
//! {"ok": true, "data": { ... } }
//! {"ok": false, "error": "not found"}
//! ```

use std::sync::Arc;

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::client::handler::Handler;
use crate::client::info::Info;
use crate::client::session::Session;
use crate::models::result::CreateInterceptRequest;
use crate::{AppError, Result};

/// Inbound IPC request.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct IpcRequest {
    /// Command verb.
    pub command: String,
    /// Intercept name (`info`, `remove`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Intercept ID or `workload/container` ingest key (`interceptor`, `drop-interceptor`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Handler process id (`interceptor`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Handler container (`interceptor`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    /// Creation request (`intercept`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<CreateInterceptRequest>,
    /// Include debug fields in rendered intercept info.
    #[serde(default)]
    pub debug: bool,
}

/// Outbound IPC response.
#[derive(Debug, Serialize, Deserialize)]
pub struct IpcResponse {
    /// Whether the command succeeded.
    pub ok: bool,
    /// Payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IpcResponse {
    fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Spawn the IPC server task.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    ipc_name: &str,
    session: Arc<Session>,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let name = ipc_name.to_owned();

    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "IPC server listening");

    let span = info_span!("ipc_server", name = %name);
    let handle = tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server shutting down");
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok(stream) => {
                            tokio::spawn(handle_connection(stream, Arc::clone(&session)));
                        }
                        Err(err) => warn!(%err, "IPC accept failed"),
                    }
                }
            }
        }
        .instrument(span),
    );

    Ok(handle)
}

async fn handle_connection(stream: interprocess::local_socket::tokio::Stream, session: Arc<Session>) {
    let span = info_span!("ipc_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match buf_reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let response = match serde_json::from_str::<IpcRequest>(trimmed) {
                        Ok(request) => dispatch_command(request, &session).await,
                        Err(err) => IpcResponse::error(format!("invalid json: {err}")),
                    };

                    let mut response_line = serde_json::to_string(&response).unwrap_or_else(|_| {
                        r#"{"ok":false,"error":"serialization failed"}"#.to_owned()
                    });
                    response_line.push('\n');

                    if let Err(err) = writer.write_all(response_line.as_bytes()).await {
                        warn!(%err, "failed to write ipc response");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            }
        }

        info!("IPC connection closed");
    }
    .instrument(span)
    .await;
}

/// Route an IPC command to the session.
pub async fn dispatch_command(request: IpcRequest, session: &Session) -> IpcResponse {
    let span = info_span!("ipc_command", command = %request.command);
    async move {
        match request.command.as_str() {
            "list" => handle_list(&request, session),
            "info" => handle_info(&request, session),
            "intercept" => handle_intercept(request, session).await,
            "remove" => handle_remove(&request, session).await,
            "leave" => handle_leave(session).await,
            "interceptor" => handle_interceptor(request, session),
            "drop-interceptor" => handle_drop_interceptor(&request, session),
            other => IpcResponse::error(format!("unknown command: {other}")),
        }
    }
    .instrument(span)
    .await
}

fn to_data(value: impl Serialize) -> IpcResponse {
    match serde_json::to_value(value) {
        Ok(data) => IpcResponse::success(data),
        Err(err) => IpcResponse::error(format!("serialization failed: {err}")),
    }
}

fn handle_list(request: &IpcRequest, session: &Session) -> IpcResponse {
    let intercepts: Vec<Info> = session
        .current_intercepts()
        .iter()
        .map(|ii| {
            let mut info = Info::new(ii, None);
            info.debug = request.debug;
            info
        })
        .collect();
    let ingests: Vec<serde_json::Value> = session
        .current_ingests()
        .into_iter()
        .map(|(key, ig)| serde_json::json!({ "key": key.to_string(), "info": ig }))
        .collect();
    to_data(serde_json::json!({ "intercepts": intercepts, "ingests": ingests }))
}

fn handle_info(request: &IpcRequest, session: &Session) -> IpcResponse {
    let Some(ref name) = request.name else {
        return IpcResponse::error("missing required 'name' field");
    };
    match session.get_intercept_info(name) {
        Some(ii) => to_data(ii),
        None => IpcResponse::error(format!("intercept {name} not found")),
    }
}

async fn handle_intercept(request: IpcRequest, session: &Session) -> IpcResponse {
    let Some(create) = request.request else {
        return IpcResponse::error("missing required 'request' field");
    };
    let result = session.add_intercept(create).await;
    if result.is_error() {
        IpcResponse::error(format!("{}: {}", result.error, result.error_text))
    } else {
        to_data(result)
    }
}

async fn handle_remove(request: &IpcRequest, session: &Session) -> IpcResponse {
    let Some(ref name) = request.name else {
        return IpcResponse::error("missing required 'name' field");
    };
    match session.remove_intercept(name).await {
        Ok(()) => {
            info!(intercept = %name, "removed via IPC");
            IpcResponse::success(serde_json::json!({ "name": name, "status": "removed" }))
        }
        Err(err) => IpcResponse::error(format!("failed to remove {name}: {err}")),
    }
}

async fn handle_leave(session: &Session) -> IpcResponse {
    match session.clear_intercepts().await {
        Ok(()) => IpcResponse::success(serde_json::json!({ "status": "cleared" })),
        Err(err) => IpcResponse::error(format!("failed to clear intercepts: {err}")),
    }
}

fn handle_interceptor(request: IpcRequest, session: &Session) -> IpcResponse {
    let Some(id) = request.id else {
        return IpcResponse::error("missing required 'id' field");
    };
    let container = request.container.unwrap_or_default();
    let Some(handler) = Handler::from_parts(request.pid.unwrap_or(0), &container) else {
        return IpcResponse::error("one of 'pid' or 'container' is required");
    };
    match session.add_interceptor(&id, handler) {
        Ok(()) => IpcResponse::success(serde_json::json!({ "id": id, "status": "added" })),
        Err(err) => IpcResponse::error(err.to_string()),
    }
}

fn handle_drop_interceptor(request: &IpcRequest, session: &Session) -> IpcResponse {
    let Some(ref id) = request.id else {
        return IpcResponse::error("missing required 'id' field");
    };
    match session.remove_interceptor(id) {
        Ok(()) => IpcResponse::success(serde_json::json!({ "id": id, "status": "dropped" })),
        Err(err) => IpcResponse::error(err.to_string()),
    }
}
