//! Client side of the intercept lifecycle.
//!
//! The [`session::Session`] consumes the control plane's snapshot stream
//! and keeps waiters, pod access sessions and API listeners in line with
//! it.

pub mod api;
pub mod handler;
pub mod info;
pub mod ingest;
pub mod matcher;
pub mod pod_access;
pub mod reconciler;
pub mod session;
pub mod waiters;
