//! Prometheus-compatible `GET /metrics` endpoint, re-keyed to the counters
//! AgentWall's governance pipeline actually produces: run kills by reason,
//! DLP/loop detections, rate-limit rejections, and per-call cost/tokens.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Global metrics registry. Cheap to clone — all state lives behind `Arc`.
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    http_requests_total: AtomicU64,
    http_errors_total: AtomicU64,
    chat_completions_total: AtomicU64,
    chat_stream_completions_total: AtomicU64,
    llm_calls_total: AtomicU64,
    llm_input_tokens_total: AtomicU64,
    llm_output_tokens_total: AtomicU64,
    cost_microdollars_total: AtomicU64,
    loop_detections_total: AtomicU64,
    dlp_detections_total: AtomicU64,
    rate_limit_rejections_total: AtomicU64,
    runs_killed_step_limit_total: AtomicU64,
    runs_killed_timeout_total: AtomicU64,
    runs_killed_budget_total: AtomicU64,
    runs_killed_loop_total: AtomicU64,
    started_at: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                http_requests_total: AtomicU64::new(0),
                http_errors_total: AtomicU64::new(0),
                chat_completions_total: AtomicU64::new(0),
                chat_stream_completions_total: AtomicU64::new(0),
                llm_calls_total: AtomicU64::new(0),
                llm_input_tokens_total: AtomicU64::new(0),
                llm_output_tokens_total: AtomicU64::new(0),
                cost_microdollars_total: AtomicU64::new(0),
                loop_detections_total: AtomicU64::new(0),
                dlp_detections_total: AtomicU64::new(0),
                rate_limit_rejections_total: AtomicU64::new(0),
                runs_killed_step_limit_total: AtomicU64::new(0),
                runs_killed_timeout_total: AtomicU64::new(0),
                runs_killed_budget_total: AtomicU64::new(0),
                runs_killed_loop_total: AtomicU64::new(0),
                started_at: Instant::now(),
            }),
        }
    }

    pub fn inc_http_requests(&self) {
        self.inner.http_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_http_errors(&self) {
        self.inner.http_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_chat_completions(&self) {
        self.inner.chat_completions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_chat_stream_completions(&self) {
        self.inner.chat_stream_completions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_llm_calls(&self) {
        self.inner.llm_calls_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_llm_tokens(&self, prompt: u64, completion: u64) {
        self.inner.llm_input_tokens_total.fetch_add(prompt, Ordering::Relaxed);
        self.inner.llm_output_tokens_total.fetch_add(completion, Ordering::Relaxed);
    }

    pub fn add_cost(&self, cost: agentwall_core::Money) {
        let microdollars = (cost.as_dollars_f64() * 1_000_000.0).max(0.0) as u64;
        self.inner.cost_microdollars_total.fetch_add(microdollars, Ordering::Relaxed);
    }

    pub fn inc_loop_detections(&self) {
        self.inner.loop_detections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dlp_detections(&self) {
        self.inner.dlp_detections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rate_limit_rejections(&self) {
        self.inner.rate_limit_rejections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_run_killed(&self, kind: agentwall_core::RunLimitKind) {
        use agentwall_core::RunLimitKind;
        match kind {
            RunLimitKind::StepLimit => self.inner.runs_killed_step_limit_total.fetch_add(1, Ordering::Relaxed),
            RunLimitKind::Timeout => self.inner.runs_killed_timeout_total.fetch_add(1, Ordering::Relaxed),
            RunLimitKind::BudgetExceeded => self.inner.runs_killed_budget_total.fetch_add(1, Ordering::Relaxed),
            RunLimitKind::LoopDetected => self.inner.runs_killed_loop_total.fetch_add(1, Ordering::Relaxed),
            RunLimitKind::Killed => 0,
        };
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let m = &self.inner;
        let uptime = m.started_at.elapsed().as_secs();
        let cost_usd = m.cost_microdollars_total.load(Ordering::Relaxed) as f64 / 1_000_000.0;

        format!(
            r#"# HELP agentwall_uptime_seconds Time since the gateway started.
# TYPE agentwall_uptime_seconds gauge
agentwall_uptime_seconds {}

# HELP agentwall_http_requests_total Total HTTP requests served.
# TYPE agentwall_http_requests_total counter
agentwall_http_requests_total {}

# HELP agentwall_http_errors_total Total HTTP errors (4xx/5xx).
# TYPE agentwall_http_errors_total counter
agentwall_http_errors_total {}

# HELP agentwall_chat_completions_total Total non-streaming chat completions proxied.
# TYPE agentwall_chat_completions_total counter
agentwall_chat_completions_total {}

# HELP agentwall_chat_stream_completions_total Total streaming chat completions proxied.
# TYPE agentwall_chat_stream_completions_total counter
agentwall_chat_stream_completions_total {}

# HELP agentwall_llm_calls_total Total upstream LLM calls.
# TYPE agentwall_llm_calls_total counter
agentwall_llm_calls_total {}

# HELP agentwall_llm_input_tokens_total Total prompt tokens sent upstream.
# TYPE agentwall_llm_input_tokens_total counter
agentwall_llm_input_tokens_total {}

# HELP agentwall_llm_output_tokens_total Total completion tokens received.
# TYPE agentwall_llm_output_tokens_total counter
agentwall_llm_output_tokens_total {}

# HELP agentwall_cost_usd_total Total estimated cost in USD across all runs.
# TYPE agentwall_cost_usd_total counter
agentwall_cost_usd_total {:.6}

# HELP agentwall_loop_detections_total Total loop/oscillation detections (pre- or post-check).
# TYPE agentwall_loop_detections_total counter
agentwall_loop_detections_total {}

# HELP agentwall_dlp_detections_total Total requests with at least one DLP pattern match.
# TYPE agentwall_dlp_detections_total counter
agentwall_dlp_detections_total {}

# HELP agentwall_rate_limit_rejections_total Total requests rejected by the rate limiter.
# TYPE agentwall_rate_limit_rejections_total counter
agentwall_rate_limit_rejections_total {}

# HELP agentwall_runs_killed_total Total runs killed, by reason.
# TYPE agentwall_runs_killed_total counter
agentwall_runs_killed_total{{reason="step_limit_exceeded"}} {}
agentwall_runs_killed_total{{reason="timeout"}} {}
agentwall_runs_killed_total{{reason="budget_exceeded"}} {}
agentwall_runs_killed_total{{reason="loop_detected"}} {}
"#,
            uptime,
            m.http_requests_total.load(Ordering::Relaxed),
            m.http_errors_total.load(Ordering::Relaxed),
            m.chat_completions_total.load(Ordering::Relaxed),
            m.chat_stream_completions_total.load(Ordering::Relaxed),
            m.llm_calls_total.load(Ordering::Relaxed),
            m.llm_input_tokens_total.load(Ordering::Relaxed),
            m.llm_output_tokens_total.load(Ordering::Relaxed),
            cost_usd,
            m.loop_detections_total.load(Ordering::Relaxed),
            m.dlp_detections_total.load(Ordering::Relaxed),
            m.rate_limit_rejections_total.load(Ordering::Relaxed),
            m.runs_killed_step_limit_total.load(Ordering::Relaxed),
            m.runs_killed_timeout_total.load(Ordering::Relaxed),
            m.runs_killed_budget_total.load(Ordering::Relaxed),
            m.runs_killed_loop_total.load(Ordering::Relaxed),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_and_render() {
        let m = Metrics::new();
        m.inc_http_requests();
        m.inc_http_requests();
        m.inc_chat_completions();
        let output = m.render_prometheus();
        assert!(output.contains("agentwall_http_requests_total 2"));
        assert!(output.contains("agentwall_chat_completions_total 1"));
    }

    #[test]
    fn tokens_and_cost_accumulate() {
        let m = Metrics::new();
        m.add_llm_tokens(100, 50);
        m.add_cost(agentwall_core::Money::from_dollars_f64(0.01));
        let output = m.render_prometheus();
        assert!(output.contains("agentwall_llm_input_tokens_total 100"));
        assert!(output.contains("agentwall_cost_usd_total 0.010000"));
    }

    #[test]
    fn run_kills_are_tagged_by_reason() {
        let m = Metrics::new();
        m.inc_run_killed(agentwall_core::RunLimitKind::BudgetExceeded);
        let output = m.render_prometheus();
        assert!(output.contains(r#"agentwall_runs_killed_total{reason="budget_exceeded"} 1"#));
    }

    #[test]
    fn prometheus_format_has_help_and_type_lines() {
        let m = Metrics::new();
        let output = m.render_prometheus();
        assert!(output.contains("# HELP agentwall_uptime_seconds"));
        assert!(output.contains("# TYPE agentwall_uptime_seconds gauge"));
    }
}
