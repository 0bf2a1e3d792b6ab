//! Telemetry sink (component C8): a bounded non-blocking queue plus a
//! single background worker that batches and flushes to the log store,
//! and a second, smaller fire-and-forget queue for the dashboard.

pub mod dashboard;
pub mod queue;

pub use dashboard::DashboardShipper;
pub use queue::{LogQueue, LogQueueConfig};
