//! Control-plane client abstraction.
//!
//! The [`ManagerClient`] trait decouples the client session from the wire
//! protocol spoken with the control plane. The session only needs a push
//! stream of intercept snapshots plus request/response calls for prepare,
//! create and remove.

pub mod codec;
pub mod ndjson;

use tokio::sync::mpsc;

use crate::manager::BoxFuture;
use crate::models::intercept::{InterceptInfo, InterceptSpec, SessionInfo};
use crate::models::result::PreparedIntercept;
use crate::Result;

/// Receiving end of a snapshot stream. An `Err` item ends the stream.
pub type SnapshotStream = mpsc::Receiver<Result<Vec<InterceptInfo>>>;

/// Requests the client session sends to the control plane.
pub trait ManagerClient: Send + Sync {
    /// Open the push stream of intercept snapshots for `session`.
    ///
    /// The stream yields one full list per server-side change. It closes
    /// on a clean end of stream and yields an `Err` before closing when the
    /// connection fails.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Manager`](crate::AppError::Manager) if the stream
    /// cannot be opened.
    fn watch_intercepts(&self, session: &SessionInfo) -> BoxFuture<'_, Result<SnapshotStream>>;

    /// Resolve the ports of `spec` against the workload's agent
    /// configuration, provisioning the agent when needed.
    ///
    /// Resolution failures are embedded in the returned value; only
    /// transport failures are returned as `Err`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Manager`](crate::AppError::Manager) on transport failure.
    fn prepare_intercept(
        &self,
        session: &SessionInfo,
        spec: &InterceptSpec,
    ) -> BoxFuture<'_, Result<PreparedIntercept>>;

    /// Create the intercept. The returned record is usually still `WAITING`.
    ///
    /// # Errors
    ///
    /// Returns the control plane's rejection or a transport failure.
    fn create_intercept(
        &self,
        session: &SessionInfo,
        spec: &InterceptSpec,
    ) -> BoxFuture<'_, Result<InterceptInfo>>;

    /// Remove the intercept called `name`.
    ///
    /// # Errors
    ///
    /// Returns the control plane's rejection or a transport failure.
    fn remove_intercept(&self, session: &SessionInfo, name: &str) -> BoxFuture<'_, Result<()>>;
}
