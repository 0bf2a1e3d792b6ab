//! HTTP surface: `AppState`, route table, middleware layering, and
//! `start_server`. `Extension`-based middleware state, the
//! CORS/rate-limit layer order, and the `axum::serve` + `TcpListener`
//! startup shape are the conventional Axum wiring for this kind of
//! gateway, re-keyed to AgentWall's own state and routes.

pub mod identity;
pub mod metrics;
pub mod pipeline;
pub mod ratelimit;

use agentwall_core::{BudgetPolicy, RunLimits};
use agentwall_dlp::DlpMode;
use agentwall_llm::{ProviderTable, Router as LlmRouter, UpstreamClient};
use agentwall_loop::LoopDetector;
use agentwall_store::{RunStore, TeamSpend};
use agentwall_telemetry::{queue, DashboardShipper, LogQueue};
use axum::{
    extract::{ConnectInfo, Query, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json,
};
use identity::IdentityClient;
use metrics::Metrics;
use ratelimit::{RateLimitConfig, RateLimiter};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

/// Everything a request handler needs, cheap to clone — every field is
/// already `Arc`-backed internally, so `AppState` itself does not need an
/// extra `Arc` wrapper.
#[derive(Clone)]
pub struct AppState {
    pub metrics: Metrics,
    pub run_store: RunStore,
    pub team_spend: TeamSpend,
    pub identity_client: IdentityClient,
    pub dlp: agentwall_dlp::DlpScanner,
    pub dlp_mode: DlpMode,
    pub loop_detector: LoopDetector,
    pub jaccard_threshold: f64,
    pub providers: ProviderTable,
    pub router: LlmRouter,
    pub budget_policy: BudgetPolicy,
    pub default_limits: RunLimits,
    pub log_queue: LogQueue,
    pub dashboard: DashboardShipper,
}

impl AppState {
    pub fn from_config(config: &agentwall_config::schema::AgentWallConfig) -> Self {
        let mut entries = ProviderTable::default_entries();
        for (name, entry) in &config.providers.entries {
            entries.insert(
                name.clone(),
                agentwall_core::ProviderConfig {
                    name: name.clone(),
                    base_url: if entry.base_url.is_empty() {
                        entries.get(name).map(|e| e.base_url.clone()).unwrap_or_default()
                    } else {
                        entry.base_url.clone()
                    },
                    api_key: entry.api_key.clone(),
                    extra_headers: entry.extra_headers.clone().into_iter().collect(),
                },
            );
        }
        let mut aliases = ProviderTable::default_aliases();
        aliases.extend(config.providers.aliases.clone());
        let providers = ProviderTable::new(entries, aliases, config.providers.default_provider.clone());

        let budget_policy = BudgetPolicy {
            per_run_limit: agentwall_core::Money::from_dollars_f64(config.budget.per_run_limit_usd),
            daily_limit: agentwall_core::Money::from_dollars_f64(config.budget.daily_limit_usd),
            monthly_limit: agentwall_core::Money::from_dollars_f64(config.budget.monthly_limit_usd),
            alert_threshold: agentwall_core::Money::from_dollars_f64(config.budget.alert_threshold_usd),
            auto_kill_enabled: config.budget.auto_kill_enabled,
        };

        let default_limits = RunLimits {
            max_steps: config.run.default_max_steps,
            max_budget: agentwall_core::Money::from_dollars_f64(config.run.default_max_budget_usd),
            timeout_seconds: config.run.default_timeout_seconds,
        };

        let dlp_mode: DlpMode = config.dlp.mode.parse().unwrap_or(DlpMode::Mask);

        let http = reqwest::Client::new();
        let log_queue = LogQueue::new(queue::LogQueueConfig {
            batch_size: config.telemetry.batch_size,
            flush_interval: std::time::Duration::from_secs(config.telemetry.flush_interval_secs),
            queue_capacity: config.telemetry.queue_capacity,
            requeue_cap: config.telemetry.requeue_cap,
            export_url: config.telemetry.export_url.clone(),
            internal_secret: std::env::var("AGENTWALL_INTERNAL_SECRET").ok(),
        });
        queue::spawn_worker(log_queue.clone(), http.clone());
        let dashboard = DashboardShipper::spawn(None, http, config.telemetry.dashboard_queue_cap);

        let run_store = RunStore::new();
        let sweep_store = run_store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(300));
            loop {
                ticker.tick().await;
                sweep_store.sweep_expired();
            }
        });

        Self {
            metrics: Metrics::new(),
            run_store,
            team_spend: TeamSpend::new(),
            identity_client: IdentityClient::new(config.server.identity_service_url.clone()),
            dlp: agentwall_dlp::DlpScanner::new(),
            dlp_mode,
            loop_detector: LoopDetector::new(),
            jaccard_threshold: config.loop_detection.jaccard_threshold,
            providers,
            router: LlmRouter::new(UpstreamClient::new()),
            budget_policy,
            default_limits,
            log_queue,
            dashboard,
        }
    }
}

/// Build the full Axum router: governed routes plus the ambient `/health`
/// and `/metrics` endpoints alongside the gateway's core surface.
pub fn build_router(state: AppState, config: &agentwall_config::schema::AgentWallConfig) -> axum::Router {
    let rate_limiter = RateLimiter::new(RateLimitConfig {
        burst: config.server.rate_limit_burst,
        refill_per_sec: config.server.rate_limit_refill_per_sec,
    });
    let cleanup_limiter = rate_limiter.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            ticker.tick().await;
            cleanup_limiter.cleanup();
        }
    });

    let mut router = axum::Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/health", get(health))
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/metrics", get(metrics_handler))
        .layer(middleware::from_fn_with_state(config.server.api_key.clone(), auth_middleware))
        .layer(middleware::from_fn(ratelimit::rate_limit_middleware))
        .layer(axum::extract::Extension(rate_limiter))
        .layer(axum::extract::Extension(state.metrics.clone()))
        .with_state(state);

    if config.server.cors {
        router = router.layer(CorsLayer::permissive());
    }

    router
}

/// Static-API-key check on `Authorization: Bearer`. A `None` configured
/// key disables the check entirely — identity then comes solely from the
/// identity service (or standalone defaults), per
/// `ServerConfig::api_key`'s doc comment. This guards the gateway's own
/// front door; it is distinct from [`identity::IdentityClient`], which
/// resolves the per-team/user identity once past this gate.
async fn auth_middleware(
    State(configured_key): State<Option<String>>,
    headers: HeaderMap,
    req: axum::extract::Request,
    next: Next,
) -> Response {
    let Some(configured_key) = configured_key else {
        return next.run(req).await;
    };

    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match bearer {
        Some(token) if token == configured_key => next.run(req).await,
        _ => pipeline::error_response(
            &agentwall_core::AgentWallError::Auth("invalid or missing gateway API key".to_string()),
            None,
            None,
        ),
    }
}

async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Response {
    let caller_ip = resolve_caller_ip(&headers, addr.ip());
    let caller_user_agent = headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok()).map(str::to_string);
    let is_streaming = body.get("stream").and_then(Value::as_bool).unwrap_or(false);

    if is_streaming {
        pipeline::handle_chat_stream(&state, headers, query, caller_ip, caller_user_agent, body).await
    } else {
        pipeline::handle_chat(&state, headers, query, caller_ip, caller_user_agent, body).await
    }
}

async fn health(State(state): State<AppState>) -> Response {
    let body = json!({
        "status": "ok",
        "run_store_degraded": state.run_store.is_degraded(),
        "telemetry_healthy": state.log_queue.is_healthy(),
    });
    (StatusCode::OK, Json(body)).into_response()
}

/// Liveness probe: constant 200 as long as the process is scheduling
/// requests at all. Never reflects downstream state — that's `/health/ready`.
async fn health_live() -> Response {
    (StatusCode::OK, Json(json!({"status": "ok"}))).into_response()
}

/// Readiness probe: 200 iff the run store is reachable, 503 while it's
/// running in degraded (in-memory-only) mode. Distinguishing this from
/// `/health/live` lets an orchestrator stop routing traffic without
/// restarting a process that is otherwise alive.
async fn health_ready(State(state): State<AppState>) -> Response {
    if state.run_store.is_degraded() {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"status": "degraded"}))).into_response()
    } else {
        (StatusCode::OK, Json(json!({"status": "ok"}))).into_response()
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    (StatusCode::OK, [("content-type", "text/plain; version=0.0.4")], state.metrics.render_prometheus())
        .into_response()
}

/// `X-Forwarded-For` > `X-Real-IP` > the socket's own peer address.
fn resolve_caller_ip(headers: &HeaderMap, peer: IpAddr) -> IpAddr {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            if let Ok(ip) = first.trim().parse::<IpAddr>() {
                return ip;
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if let Ok(ip) = real_ip.trim().parse::<IpAddr>() {
            return ip;
        }
    }
    peer
}

/// Bind and serve forever. `listen` is `host:port` from
/// `ServerConfig::listen`.
pub async fn start_server(state: AppState, config: &agentwall_config::schema::AgentWallConfig) -> std::io::Result<()> {
    let addr: SocketAddr = config
        .server
        .listen
        .parse()
        .unwrap_or_else(|_| "0.0.0.0:8080".parse().expect("fallback listen address is valid"));

    let router = build_router(state, config);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "agentwall gateway listening");

    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn resolve_caller_ip_prefers_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        let peer: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(resolve_caller_ip(&headers, peer).to_string(), "203.0.113.9");
    }

    #[test]
    fn resolve_caller_ip_falls_back_to_peer() {
        let headers = HeaderMap::new();
        let peer: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(resolve_caller_ip(&headers, peer), peer);
    }

    #[test]
    fn app_state_from_config_builds_with_defaults() {
        let config = agentwall_config::schema::AgentWallConfig::default();
        let state = AppState::from_config(&config);
        assert!(!state.run_store.is_degraded());
    }
}
