//! Circuit breaker and bounded retry around upstream calls, layered
//! *below* [`crate::provider::ProviderTable::resolve`]'s routing decision
//! and *around* [`crate::client::UpstreamClient`]'s calls. Standard
//! per-provider `CircuitBreaker`/`is_retryable` machinery for production
//! robustness against flaky upstreams. Retries never change governance
//! semantics: cost and step accounting happen exactly once, on the call
//! that ultimately returns.

use crate::client::{ClientMetrics, UpstreamClient};
use crate::provider::ResolvedRoute;
use agentwall_core::{AgentWallError, Result};
use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

const MAX_RETRIES: u32 = 3;
const BASE_DELAY_MS: u64 = 1000;

const CIRCUIT_FAILURE_THRESHOLD: u32 = 5;
const CIRCUIT_OPEN_DURATION: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

#[derive(Debug)]
struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self { state: CircuitState::Closed, consecutive_failures: 0 }
    }

    fn allow_request(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open { since } => {
                if since.elapsed() >= CIRCUIT_OPEN_DURATION {
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => false,
        }
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = CircuitState::Closed;
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= CIRCUIT_FAILURE_THRESHOLD {
            self.state = CircuitState::Open { since: Instant::now() };
        }
    }

    fn is_open(&self) -> bool {
        matches!(self.state, CircuitState::Open { .. })
    }
}

/// Whether an error is transient and worth a bounded retry: 429/500/502/503,
/// plus 529 and network-level timeouts/resets, since those are just as
/// transient.
fn is_retryable(err: &AgentWallError) -> bool {
    match err {
        AgentWallError::UpstreamStatus { status, .. } => {
            matches!(status, 429 | 500 | 502 | 503 | 529)
        }
        AgentWallError::UpstreamNetwork(msg) => {
            msg.contains("timed out") || msg.contains("connection reset") || msg.contains("connection closed")
        }
        _ => false,
    }
}

/// Wraps a [`UpstreamClient`] with a per-provider circuit breaker and
/// bounded exponential-backoff retry. Cheap to clone — the breaker map is
/// shared behind an `Arc`.
#[derive(Clone)]
pub struct Router {
    client: UpstreamClient,
    breakers: Arc<Mutex<HashMap<String, CircuitBreaker>>>,
}

impl Router {
    pub fn new(client: UpstreamClient) -> Self {
        Self { client, breakers: Arc::new(Mutex::new(HashMap::new())) }
    }

    fn allow(&self, provider: &str) -> bool {
        self.breakers.lock().entry(provider.to_string()).or_insert_with(CircuitBreaker::new).allow_request()
    }

    fn record_success(&self, provider: &str) {
        if let Some(cb) = self.breakers.lock().get_mut(provider) {
            cb.record_success();
        }
    }

    fn record_failure(&self, provider: &str) {
        let mut breakers = self.breakers.lock();
        let cb = breakers.entry(provider.to_string()).or_insert_with(CircuitBreaker::new);
        let was_open = cb.is_open();
        cb.record_failure();
        if !was_open && cb.is_open() {
            warn!(
                provider,
                "circuit breaker OPEN — provider disabled for {}s",
                CIRCUIT_OPEN_DURATION.as_secs()
            );
        }
    }

    /// Non-streaming call with retry. Does not fail over to a different
    /// route — failover (choosing a different model/provider) is a
    /// pipeline-level concern (C9), this layer only protects one resolved
    /// route from transient upstream flakiness.
    pub async fn complete(&self, route: &ResolvedRoute, body: Value) -> Result<(Value, ClientMetrics)> {
        if !self.allow(&route.provider) {
            return Err(AgentWallError::UpstreamNetwork(format!(
                "circuit breaker open for provider '{}'",
                route.provider
            )));
        }

        let mut last_err = None;
        for attempt in 0..=MAX_RETRIES {
            match self.client.complete(route, body.clone()).await {
                Ok(ok) => {
                    self.record_success(&route.provider);
                    return Ok(ok);
                }
                Err(e) if is_retryable(&e) && attempt < MAX_RETRIES => {
                    let delay = BASE_DELAY_MS * 2u64.pow(attempt);
                    warn!(
                        provider = %route.provider,
                        attempt = attempt + 1,
                        max = MAX_RETRIES,
                        delay_ms = delay,
                        error = %e,
                        "retrying after transient upstream error"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    last_err = Some(e);
                }
                Err(e) => {
                    self.record_failure(&route.provider);
                    return Err(e);
                }
            }
        }
        self.record_failure(&route.provider);
        Err(last_err.expect("loop always assigns last_err before exhausting retries"))
    }

    /// Streaming call with retry, applied only to *opening* the stream —
    /// once bytes start flowing the pipeline must forward them strictly in
    /// the order received, so retry never applies mid-stream.
    pub async fn stream(
        &self,
        route: &ResolvedRoute,
        body: Value,
    ) -> Result<(Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>, Arc<Mutex<ClientMetrics>>)> {
        if !self.allow(&route.provider) {
            return Err(AgentWallError::UpstreamNetwork(format!(
                "circuit breaker open for provider '{}'",
                route.provider
            )));
        }

        let mut last_err = None;
        for attempt in 0..=MAX_RETRIES {
            match self.client.stream(route, body.clone()).await {
                Ok(ok) => {
                    self.record_success(&route.provider);
                    return Ok(ok);
                }
                Err(e) if is_retryable(&e) && attempt < MAX_RETRIES => {
                    let delay = BASE_DELAY_MS * 2u64.pow(attempt);
                    warn!(
                        provider = %route.provider,
                        attempt = attempt + 1,
                        max = MAX_RETRIES,
                        delay_ms = delay,
                        error = %e,
                        "retrying stream open after transient upstream error"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    last_err = Some(e);
                }
                Err(e) => {
                    self.record_failure(&route.provider);
                    return Err(e);
                }
            }
        }
        self.record_failure(&route.provider);
        Err(last_err.expect("loop always assigns last_err before exhausting retries"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses_match_spec() {
        for status in [429, 500, 502, 503, 529] {
            assert!(is_retryable(&AgentWallError::UpstreamStatus {
                status,
                body: String::new(),
                provider: "openai".into(),
            }));
        }
        assert!(!is_retryable(&AgentWallError::UpstreamStatus {
            status: 400,
            body: String::new(),
            provider: "openai".into(),
        }));
    }

    #[test]
    fn network_timeout_is_retryable() {
        assert!(is_retryable(&AgentWallError::UpstreamNetwork("request timed out".into())));
    }

    #[test]
    fn circuit_breaker_opens_after_threshold_failures() {
        let mut cb = CircuitBreaker::new();
        for _ in 0..CIRCUIT_FAILURE_THRESHOLD {
            assert!(!cb.is_open());
            cb.record_failure();
        }
        assert!(cb.is_open());
    }

    #[test]
    fn circuit_breaker_closes_on_success() {
        let mut cb = CircuitBreaker::new();
        for _ in 0..CIRCUIT_FAILURE_THRESHOLD {
            cb.record_failure();
        }
        assert!(cb.is_open());
        cb.record_success();
        assert!(!cb.is_open());
    }
}
