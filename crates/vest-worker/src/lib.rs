//! Job worker for the Vest platform.
//!
//! This crate provides:
//! - Concurrency-bounded worker pools with lock renewal and stall recovery
//! - The `JobProcessor` abstraction and typed retry classification
//! - Email, ROI distribution, report generation and notification processors
//! - A runtime with a single graceful shutdown path

pub mod config;
pub mod error;
pub mod logging;
pub mod pool;
pub mod processor;
pub mod processors;
pub mod retry;
pub mod runtime;
pub mod services;

pub use config::{SmtpConfig, WorkerConfig};
pub use error::{WorkerError, WorkerResult};
pub use logging::JobLogger;
pub use pool::{PoolConfig, WorkerPool};
pub use processor::{JobContext, JobProcessor};
pub use processors::{EmailProcessor, NotificationProcessor, ReportProcessor, RoiDistributionProcessor};
pub use runtime::WorkerRuntime;
