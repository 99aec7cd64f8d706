//! Operator HTTP API for the job queues.
//!
//! This crate provides:
//! - Queue statistics, dead-letter inspection, clear, pause and resume
//! - Bearer-token operator authentication
//! - Per-IP rate limiting and request tracing
//! - Prometheus metrics

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;

pub use auth::Operator;
pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
