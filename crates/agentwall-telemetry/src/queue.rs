//! Bounded, non-blocking log queue plus its background flush worker
//! (component C8): a dedicated worker over a bounded queue rather than a
//! per-request fire-and-forget task spawn, the same shape the rate
//! limiter uses for its own idle-bucket cleanup.

use agentwall_core::RequestLogEntry;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct LogQueueConfig {
    /// Flush once queued depth reaches this many entries.
    pub batch_size: usize,
    /// Flush at least this often regardless of depth.
    pub flush_interval: Duration,
    /// Hard cap on in-memory entries; push drops the oldest beyond this.
    pub queue_capacity: usize,
    /// Cap on entries retained across a failed flush's re-queue.
    pub requeue_cap: usize,
    /// `POST` target for batched export; `None` disables flushing (the
    /// queue still accepts pushes and simply never drains them to a sink).
    pub export_url: Option<String>,
    /// Sent as `X-Internal-Secret` on every flush request.
    pub internal_secret: Option<String>,
}

impl Default for LogQueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
            queue_capacity: 10_000,
            requeue_cap: 10_000,
            export_url: None,
            internal_secret: None,
        }
    }
}

struct Inner {
    entries: VecDeque<RequestLogEntry>,
}

/// Shared handle to the bounded log queue. Cheap to clone — all state is
/// behind `Arc`.
#[derive(Clone)]
pub struct LogQueue {
    inner: Arc<parking_lot::Mutex<Inner>>,
    healthy: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    config: Arc<LogQueueConfig>,
}

impl LogQueue {
    pub fn new(config: LogQueueConfig) -> Self {
        Self {
            inner: Arc::new(parking_lot::Mutex::new(Inner { entries: VecDeque::new() })),
            healthy: Arc::new(AtomicBool::new(true)),
            dropped: Arc::new(AtomicU64::new(0)),
            config: Arc::new(config),
        }
    }

    /// Non-blocking push from the request path. If the queue is at
    /// capacity the oldest entry is dropped to make room — this must
    /// never block the hot path or fail the request.
    pub fn push(&self, entry: RequestLogEntry) {
        let mut inner = self.inner.lock();
        if inner.entries.len() >= self.config.queue_capacity {
            inner.entries.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        inner.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn drain_all(&self) -> Vec<RequestLogEntry> {
        let mut inner = self.inner.lock();
        inner.entries.drain(..).collect()
    }

    /// Put entries back at the front (oldest-first), truncating to
    /// `requeue_cap` by dropping the newest overflow — a failed flush
    /// should not be allowed to grow the queue without bound.
    fn requeue(&self, mut entries: Vec<RequestLogEntry>) {
        if entries.len() > self.config.requeue_cap {
            let drop_from = self.config.requeue_cap;
            let dropped = entries.len() - drop_from;
            entries.truncate(drop_from);
            self.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
        }
        let mut inner = self.inner.lock();
        for entry in entries.into_iter().rev() {
            inner.entries.push_front(entry);
        }
    }

    fn mark_unhealthy(&self) {
        if self.healthy.swap(false, Ordering::Relaxed) {
            warn!("telemetry sink marked unhealthy after flush failure");
        }
    }

    fn mark_healthy(&self) {
        if !self.healthy.swap(true, Ordering::Relaxed) {
            info!("telemetry sink recovered");
        }
    }

    async fn flush_once(&self, http: &reqwest::Client) {
        let batch = self.drain_all();
        if batch.is_empty() {
            return;
        }

        let Some(url) = self.config.export_url.as_ref() else {
            // No sink configured: entries are simply dropped on the floor
            // rather than accumulating forever. Callers that want local
            // durability should configure `export_url`.
            return;
        };

        let body = batch
            .iter()
            .map(|e| serde_json::to_string(e).unwrap_or_default())
            .collect::<Vec<_>>()
            .join("\n");
        let count = batch.len();

        let mut request = http.post(url).header("content-type", "application/x-ndjson").body(body);
        if let Some(secret) = &self.config.internal_secret {
            request = request.header("X-Internal-Secret", secret.clone());
        }

        match request.send().await {
            Ok(resp) if resp.status().is_success() => {
                self.mark_healthy();
            }
            Ok(resp) => {
                error!(status = %resp.status(), count, "telemetry flush rejected by log store");
                self.mark_unhealthy();
                self.requeue(batch);
            }
            Err(e) => {
                error!(error = %e, count, "telemetry flush failed");
                self.mark_unhealthy();
                self.requeue(batch);
            }
        }
    }
}

/// Spawn the long-lived background worker that drains `queue` on a
/// schedule. There is exactly one worker per queue — never a per-request
/// task.
pub fn spawn_worker(queue: LogQueue, http: reqwest::Client) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let poll_interval = Duration::from_millis(200).min(queue.config.flush_interval);
        let mut last_flush = Instant::now();

        loop {
            tokio::time::sleep(poll_interval).await;
            let depth = queue.len();
            if depth == 0 {
                last_flush = Instant::now();
                continue;
            }
            if depth >= queue.config.batch_size || last_flush.elapsed() >= queue.config.flush_interval {
                queue.flush_once(&http).await;
                last_flush = Instant::now();
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sample(run_id: &str) -> RequestLogEntry {
        RequestLogEntry {
            run_id: run_id.to_string(),
            step: 1,
            request_id: Uuid::new_v4(),
            team_id: "team".into(),
            user_id: "user".into(),
            api_key_id: None,
            model: "gpt-4".into(),
            endpoint: "/v1/chat/completions".into(),
            prompt_tokens: 10,
            completion_tokens: 5,
            cost: agentwall_core::Money::ZERO,
            total_latency_ms: 1.0,
            proxy_overhead_ms: 0.1,
            time_to_first_byte_ms: None,
            http_status: 200,
            error_text: None,
            loop_detected: false,
            similarity_score: None,
            dlp_triggered: false,
            dlp_action: None,
            message_preview: String::new(),
            response_preview: String::new(),
            caller_ip: None,
            caller_user_agent: None,
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn push_then_len_reflects_depth() {
        let queue = LogQueue::new(LogQueueConfig::default());
        queue.push(sample("r1"));
        queue.push(sample("r2"));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn overflow_drops_oldest_and_counts_it() {
        let mut config = LogQueueConfig::default();
        config.queue_capacity = 2;
        let queue = LogQueue::new(config);
        queue.push(sample("r1"));
        queue.push(sample("r2"));
        queue.push(sample("r3"));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped_count(), 1);
    }

    #[test]
    fn requeue_respects_cap() {
        let mut config = LogQueueConfig::default();
        config.requeue_cap = 1;
        let queue = LogQueue::new(config);
        queue.requeue(vec![sample("r1"), sample("r2")]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.dropped_count(), 1);
    }

    #[test]
    fn starts_healthy() {
        let queue = LogQueue::new(LogQueueConfig::default());
        assert!(queue.is_healthy());
    }

    #[test]
    fn unhealthy_then_healthy_transitions_log_once() {
        let queue = LogQueue::new(LogQueueConfig::default());
        queue.mark_unhealthy();
        assert!(!queue.is_healthy());
        queue.mark_healthy();
        assert!(queue.is_healthy());
    }

    #[test]
    fn drain_all_empties_the_queue() {
        let queue = LogQueue::new(LogQueueConfig::default());
        queue.push(sample("r1"));
        let drained = queue.drain_all();
        assert_eq!(drained.len(), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn flush_with_no_export_url_just_drains() {
        let queue = LogQueue::new(LogQueueConfig::default());
        queue.push(sample("r1"));
        let http = reqwest::Client::new();
        queue.flush_once(&http).await;
        assert!(queue.is_empty());
    }
}
