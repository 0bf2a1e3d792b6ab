//! In-memory token-bucket rate limiter middleware, applied ahead of the
//! governance pipeline. Standard per-key token bucket, keyed by caller IP,
//! with a 429-plus-`Retry-After` response on exhaustion. A rate-limit 429
//! is a transport-level concern distinct from `run_limit_exceeded` and
//! carries no AgentWall error body.

use axum::{
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

use crate::metrics::Metrics;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub burst: u32,
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { burst: 60, refill_per_sec: 10.0 }
    }
}

#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(burst: u32) -> Self {
        Self { tokens: burst as f64, last_refill: Instant::now() }
    }

    fn try_consume(&mut self, burst: u32, refill_per_sec: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(burst as f64);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn retry_after(&self, refill_per_sec: f64) -> u64 {
        if refill_per_sec <= 0.0 {
            return 60;
        }
        let needed = 1.0 - self.tokens;
        (needed / refill_per_sec).ceil().max(1.0) as u64
    }
}

/// Shared state for the rate limiter, keyed by client IP.
#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<DashMap<IpAddr, Bucket>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self { buckets: Arc::new(DashMap::new()), config }
    }

    pub fn check(&self, ip: IpAddr) -> Result<(), u64> {
        let mut entry = self.buckets.entry(ip).or_insert_with(|| Bucket::new(self.config.burst));
        if entry.try_consume(self.config.burst, self.config.refill_per_sec) {
            Ok(())
        } else {
            Err(entry.retry_after(self.config.refill_per_sec))
        }
    }

    /// Evict buckets idle for more than 5 minutes. Intended to be called
    /// periodically from a background task, mirroring the run store's
    /// `sweep_expired`.
    pub fn cleanup(&self) {
        let cutoff = Instant::now() - std::time::Duration::from_secs(300);
        self.buckets.retain(|_ip, bucket| bucket.last_refill > cutoff);
    }
}

pub async fn rate_limit_middleware(
    axum::extract::Extension(limiter): axum::extract::Extension<RateLimiter>,
    axum::extract::Extension(metrics): axum::extract::Extension<Metrics>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let ip = extract_client_ip(&req);

    match limiter.check(ip) {
        Ok(()) => next.run(req).await,
        Err(retry_after) => {
            metrics.inc_rate_limit_rejections();
            warn!(client_ip = %ip, retry_after, "rate limited");
            let mut resp = (
                StatusCode::TOO_MANY_REQUESTS,
                format!("Rate limit exceeded. Retry after {retry_after} seconds."),
            )
                .into_response();
            resp.headers_mut().insert("retry-after", retry_after.to_string().parse().unwrap());
            resp
        }
    }
}

/// Extract the client IP from `X-Forwarded-For`, then `X-Real-IP`, falling
/// back to localhost (no `ConnectInfo` extractor wired in yet).
fn extract_client_ip(req: &Request<axum::body::Body>) -> IpAddr {
    if let Some(forwarded) = req.headers().get("x-forwarded-for")
        && let Ok(val) = forwarded.to_str()
        && let Some(first) = val.split(',').next()
        && let Ok(ip) = first.trim().parse::<IpAddr>()
    {
        return ip;
    }
    if let Some(real_ip) = req.headers().get("x-real-ip")
        && let Ok(val) = real_ip.to_str()
        && let Ok(ip) = val.trim().parse::<IpAddr>()
    {
        return ip;
    }
    IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn bucket_allows_up_to_burst() {
        let limiter = RateLimiter::new(RateLimitConfig { burst: 3, refill_per_sec: 1.0 });
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        assert!(limiter.check(ip).is_ok());
        assert!(limiter.check(ip).is_ok());
        assert!(limiter.check(ip).is_ok());
        assert!(limiter.check(ip).is_err());
    }

    #[test]
    fn different_ips_have_independent_buckets() {
        let limiter = RateLimiter::new(RateLimitConfig { burst: 1, refill_per_sec: 0.0 });
        let ip1 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let ip2 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        assert!(limiter.check(ip1).is_ok());
        assert!(limiter.check(ip1).is_err());
        assert!(limiter.check(ip2).is_ok());
    }

    #[test]
    fn retry_after_is_at_least_one_second() {
        let limiter = RateLimiter::new(RateLimitConfig { burst: 1, refill_per_sec: 1.0 });
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        limiter.check(ip).unwrap();
        let retry = limiter.check(ip).unwrap_err();
        assert!(retry >= 1);
    }

    #[test]
    fn cleanup_keeps_fresh_buckets() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        limiter.check(ip).unwrap();
        limiter.cleanup();
        assert_eq!(limiter.buckets.len(), 1);
    }
}
