#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod errors;
pub mod host;
pub mod models;
pub mod orchestrator;

pub use config::ClientConfig;
pub use errors::{AppError, Result};
