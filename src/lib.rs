#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod driver;
pub mod errors;
pub mod ipc;
pub mod manager;
pub mod models;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
