//! Domain model module declarations.

pub mod agent;
pub mod event;
pub mod intercept;
pub mod result;
pub mod workload;
