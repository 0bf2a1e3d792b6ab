//! Upstream client (component C7): two operations, non-streaming and
//! streaming, against an OpenAI-compatible `POST /v1/chat/completions`.
//! Streaming forwards SSE bytes near-verbatim rather than reconstructing
//! an internal message type, using manual line-buffering over the
//! response byte stream and an `async_stream::stream!` to adapt it into
//! the axum response body.

use crate::provider::ResolvedRoute;
use agentwall_core::{AgentWallError, Result};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

/// Metrics gathered around one upstream call.
#[derive(Debug, Clone, Default)]
pub struct ClientMetrics {
    pub elapsed_ms: f64,
    pub bytes: usize,
    pub provider: String,
    /// Only populated for streaming calls.
    pub chunk_count: u64,
    pub total_chars: u64,
    /// Word count across all `delta.content` fragments, used by the cost
    /// estimator's `tokens ≈ words * 1.3` approximation when the upstream
    /// never sends a final `usage` frame.
    pub total_words: u64,
    pub first_chunk_ms: Option<f64>,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

/// Thin wrapper over `reqwest::Client` configured for upstream LLM calls:
/// no read timeout on the streaming path (a persistent connection is held
/// open for the life of the stream), a bounded connect timeout throughout.
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("reqwest client with static TLS config must build");
        Self { http }
    }

    fn headers(route: &ResolvedRoute) -> reqwest::header::HeaderMap {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = &route.api_key {
            if let Ok(v) = reqwest::header::HeaderValue::from_str(&format!("Bearer {key}")) {
                headers.insert(reqwest::header::AUTHORIZATION, v);
            }
        }
        for (name, value) in &route.extra_headers {
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_bytes()),
                reqwest::header::HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
        headers
    }

    /// Non-streaming call: send the JSON body, read the JSON response.
    pub async fn complete(&self, route: &ResolvedRoute, body: Value) -> Result<(Value, ClientMetrics)> {
        let url = format!("{}/v1/chat/completions", route.base_url.trim_end_matches('/'));
        let start = Instant::now();

        let response = self
            .http
            .post(&url)
            .headers(Self::headers(route))
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentWallError::UpstreamNetwork(e.to_string()))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| AgentWallError::UpstreamNetwork(e.to_string()))?;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        if !status.is_success() {
            return Err(AgentWallError::UpstreamStatus {
                status: status.as_u16(),
                body: text,
                provider: route.provider.clone(),
            });
        }

        let json: Value = serde_json::from_str(&text)?;
        let metrics = ClientMetrics {
            elapsed_ms,
            bytes: text.len(),
            provider: route.provider.clone(),
            ..Default::default()
        };
        Ok((json, metrics))
    }

    /// Streaming call: open the connection, return a byte stream of
    /// reframed `data: ...\n\n` lines plus a shared metrics handle the
    /// caller reads after the stream is fully drained.
    pub async fn stream(
        &self,
        route: &ResolvedRoute,
        body: Value,
    ) -> Result<(Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>, Arc<Mutex<ClientMetrics>>)> {
        let url = format!("{}/v1/chat/completions", route.base_url.trim_end_matches('/'));

        let response = self
            .http
            .post(&url)
            .headers(Self::headers(route))
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentWallError::UpstreamNetwork(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AgentWallError::UpstreamStatus {
                status: status.as_u16(),
                body: text,
                provider: route.provider.clone(),
            });
        }

        let metrics = Arc::new(Mutex::new(ClientMetrics {
            provider: route.provider.clone(),
            ..Default::default()
        }));
        let metrics_for_stream = Arc::clone(&metrics);
        let start = Instant::now();

        let byte_stream = async_stream::stream! {
            let mut upstream = response.bytes_stream();
            let mut buffer = BytesMut::new();

            loop {
                let chunk = match upstream.next().await {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => {
                        yield Err(AgentWallError::UpstreamNetwork(e.to_string()));
                        break;
                    }
                    None => break,
                };
                buffer.extend_from_slice(&chunk);

                while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                    let line = buffer.split_to(newline + 1);
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim_end_matches(['\r', '\n']);

                    if !line.starts_with("data: ") {
                        continue;
                    }
                    let payload = &line["data: ".len()..];

                    let mut m = metrics_for_stream.lock();
                    if m.first_chunk_ms.is_none() {
                        m.first_chunk_ms = Some(start.elapsed().as_secs_f64() * 1000.0);
                    }
                    m.chunk_count += 1;
                    drop(m);

                    if payload.trim() == "[DONE]" {
                        yield Ok(Bytes::from_static(b"data: [DONE]\n\n"));
                        metrics_for_stream.lock().elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
                        return;
                    }

                    if let Ok(parsed) = serde_json::from_str::<Value>(payload) {
                        record_deltas(&metrics_for_stream, &parsed);
                    }

                    yield Ok(Bytes::from(format!("data: {payload}\n\n")));
                }
            }

            metrics_for_stream.lock().elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        };

        Ok((Box::pin(byte_stream), metrics))
    }
}

fn record_deltas(metrics: &Arc<Mutex<ClientMetrics>>, frame: &Value) {
    let mut m = metrics.lock();
    if let Some(content) = frame
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(Value::as_str)
    {
        m.total_chars += content.chars().count() as u64;
        m.total_words += content.split_whitespace().count() as u64;
    }
    if let Some(usage) = frame.get("usage") {
        if let Some(p) = usage.get("prompt_tokens").and_then(Value::as_u64) {
            m.prompt_tokens = Some(p);
        }
        if let Some(c) = usage.get("completion_tokens").and_then(Value::as_u64) {
            m.completion_tokens = Some(c);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_carry_bearer_and_extra_headers() {
        let route = ResolvedRoute {
            provider: "openrouter".into(),
            base_url: "https://openrouter.ai/api".into(),
            api_key: Some("sk-test".into()),
            extra_headers: vec![("X-Title".into(), "AgentWall".into())],
            model: "anthropic/claude-3-opus".into(),
        };
        let headers = UpstreamClient::headers(&route);
        assert_eq!(headers.get(reqwest::header::AUTHORIZATION).unwrap(), "Bearer sk-test");
        assert_eq!(headers.get("X-Title").unwrap(), "AgentWall");
    }

    #[test]
    fn record_deltas_accumulates_content_length() {
        let metrics = Arc::new(Mutex::new(ClientMetrics::default()));
        let frame: Value = serde_json::json!({"choices": [{"delta": {"content": "hi"}}]});
        record_deltas(&metrics, &frame);
        assert_eq!(metrics.lock().total_chars, 2);
    }

    #[test]
    fn record_deltas_captures_final_usage_frame() {
        let metrics = Arc::new(Mutex::new(ClientMetrics::default()));
        let frame: Value = serde_json::json!({"usage": {"prompt_tokens": 10, "completion_tokens": 5}});
        record_deltas(&metrics, &frame);
        let m = metrics.lock();
        assert_eq!(m.prompt_tokens, Some(10));
        assert_eq!(m.completion_tokens, Some(5));
    }
}
