//! The dashboard shipper: a second, smaller fire-and-forget queue separate
//! from the log-store queue. Invoked once per request;
//! unlike [`crate::queue::LogQueue`] it drops the *newest* entry on
//! overflow rather than the oldest — a dashboard row arriving late is
//! less useful than a log-store row arriving late, so there is no reason
//! to evict history to make room for it.

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

const DASHBOARD_QUEUE_CAP: usize = 1_000;

/// Handle callers use to ship a dashboard row. Cloning is cheap — it's a
/// bounded channel sender.
#[derive(Clone)]
pub struct DashboardShipper {
    tx: mpsc::Sender<Value>,
}

impl DashboardShipper {
    /// Construct a shipper and spawn its background worker. `dashboard_url`
    /// is `None` when no dashboard is configured, in which case `ship` is
    /// still safe to call but every row is discarded.
    pub fn spawn(dashboard_url: Option<String>, http: reqwest::Client, capacity: usize) -> Self {
        let capacity = if capacity == 0 { DASHBOARD_QUEUE_CAP } else { capacity };
        let (tx, mut rx) = mpsc::channel::<Value>(capacity);

        tokio::spawn(async move {
            let Some(url) = dashboard_url else {
                // Drain and drop: keeps the channel from ever reporting
                // "full" to callers holding the other end.
                while rx.recv().await.is_some() {}
                return;
            };
            while let Some(row) = rx.recv().await {
                if let Err(e) = http.post(&url).json(&row).send().await {
                    warn!(error = %e, "dashboard ship failed, row dropped");
                }
            }
        });

        Self { tx }
    }

    /// Fire-and-forget: never blocks, never fails the caller. Overflow is
    /// silently dropped.
    pub fn ship(&self, row: Value) {
        if self.tx.try_send(row).is_err() {
            warn!("dashboard queue full, row dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ship_with_no_dashboard_url_does_not_panic() {
        let shipper = DashboardShipper::spawn(None, reqwest::Client::new(), 10);
        shipper.ship(serde_json::json!({"run_id": "r1"}));
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn overflow_beyond_capacity_is_dropped_not_blocking() {
        // capacity 1 and no receiver draining fast enough forces an overflow
        let (tx, _rx) = mpsc::channel::<Value>(1);
        let shipper = DashboardShipper { tx };
        shipper.ship(serde_json::json!({"a": 1}));
        shipper.ship(serde_json::json!({"a": 2}));
        shipper.ship(serde_json::json!({"a": 3}));
    }
}
