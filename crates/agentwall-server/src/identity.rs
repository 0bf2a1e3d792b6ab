//! Caller identity resolution. Extracts a credential from the incoming
//! request, then either
//! trusts a configured identity service or — in standalone mode, when no
//! `identity_service_url` is configured — defaults team/user to `"default"`,
//! per `agentwall-config::schema::ServerConfig::identity_service_url`'s doc
//! comment.

use agentwall_core::{AgentWallError, Identity, Result};
use axum::http::HeaderMap;
use serde::Deserialize;
use std::collections::HashMap;

const CREDENTIAL_HEADER: &str = "x-api-key";

/// Pull the caller's credential from, in order: `Authorization: Bearer`,
/// `X-API-Key`, or the `api_key` query parameter.
pub fn extract_credential(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<String> {
    if let Some(bearer) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(bearer.to_string());
    }
    if let Some(key) = headers.get(CREDENTIAL_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(key.to_string());
    }
    query.get("api_key").cloned()
}

#[derive(Debug, Deserialize)]
struct IdentityServiceLimits {
    max_steps: Option<u32>,
    daily_budget: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdentityServiceResponse {
    user_id: String,
    team_id: String,
    api_key_id: Option<String>,
    #[serde(default)]
    limits: Option<IdentityServiceLimits>,
}

/// Resolves a credential to an [`Identity`]. Holds no per-request state —
/// cheap to clone and share across the server's `AppState`.
#[derive(Clone)]
pub struct IdentityClient {
    http: reqwest::Client,
    service_url: Option<String>,
}

impl IdentityClient {
    pub fn new(service_url: Option<String>) -> Self {
        Self { http: reqwest::Client::new(), service_url }
    }

    /// Authenticate `credential` against the identity service. Errors here
    /// always surface to the caller as HTTP 401 — unlike upstream LLM
    /// failures, these are never retried by the pipeline.
    pub async fn authenticate(&self, credential: Option<&str>) -> Result<Identity> {
        let Some(url) = &self.service_url else {
            return Ok(Identity {
                user_id: "default".to_string(),
                team_id: "default".to_string(),
                api_key_id: None,
                max_steps: None,
                daily_budget: None,
            });
        };

        let Some(credential) = credential else {
            return Err(AgentWallError::Auth("missing credential".to_string()));
        };

        let response = self
            .http
            .get(format!("{}/validate", url.trim_end_matches('/')))
            .bearer_auth(credential)
            .send()
            .await
            .map_err(|e| AgentWallError::Auth(format!("identity service unreachable: {e}")))?;

        if !response.status().is_success() {
            return Err(AgentWallError::Auth(format!(
                "identity service rejected credential (status {})",
                response.status()
            )));
        }

        let parsed: IdentityServiceResponse = response
            .json()
            .await
            .map_err(|e| AgentWallError::Auth(format!("malformed identity service response: {e}")))?;

        let daily_budget = parsed
            .limits
            .as_ref()
            .and_then(|l| l.daily_budget.as_ref())
            .and_then(|s| s.parse().ok());
        let max_steps = parsed.limits.as_ref().and_then(|l| l.max_steps);

        Ok(Identity {
            user_id: parsed.user_id,
            team_id: parsed.team_id,
            api_key_id: parsed.api_key_id,
            max_steps,
            daily_budget,
        })
    }
}

/// Priority order for the run-id: the canonical header, a couple of
/// caller-header variants agents commonly send, the request body field,
/// then a server-generated UUID as the final fallback.
const RUN_ID_HEADER: &str = "x-agentwall-run-id";
const ALT_RUN_ID_HEADERS: &[&str] = &["x-run-id", "x-agent-run-id"];

pub fn extract_run_id(headers: &HeaderMap, body: &serde_json::Value) -> String {
    if let Some(v) = non_empty_header(headers, RUN_ID_HEADER) {
        return v;
    }
    for header in ALT_RUN_ID_HEADERS {
        if let Some(v) = non_empty_header(headers, header) {
            return v;
        }
    }
    if let Some(v) = body.get("agentwall_run_id").and_then(serde_json::Value::as_str) {
        if !v.is_empty() {
            return v.to_string();
        }
    }
    uuid::Uuid::new_v4().to_string()
}

fn non_empty_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).filter(|v| !v.is_empty()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn credential_prefers_bearer_over_api_key_header() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        headers.insert(CREDENTIAL_HEADER, HeaderValue::from_static("xyz"));
        let cred = extract_credential(&headers, &HashMap::new());
        assert_eq!(cred.as_deref(), Some("abc"));
    }

    #[test]
    fn credential_falls_back_to_query_param() {
        let mut query = HashMap::new();
        query.insert("api_key".to_string(), "from-query".to_string());
        let cred = extract_credential(&HeaderMap::new(), &query);
        assert_eq!(cred.as_deref(), Some("from-query"));
    }

    #[test]
    fn run_id_prefers_canonical_header() {
        let mut headers = HeaderMap::new();
        headers.insert(RUN_ID_HEADER, HeaderValue::from_static("run-123"));
        let run_id = extract_run_id(&headers, &serde_json::Value::Null);
        assert_eq!(run_id, "run-123");
    }

    #[test]
    fn run_id_falls_back_to_body_field() {
        let body = serde_json::json!({"agentwall_run_id": "run-from-body"});
        let run_id = extract_run_id(&HeaderMap::new(), &body);
        assert_eq!(run_id, "run-from-body");
    }

    #[test]
    fn run_id_generates_uuid_as_last_resort() {
        let run_id = extract_run_id(&HeaderMap::new(), &serde_json::Value::Null);
        assert!(uuid::Uuid::parse_str(&run_id).is_ok());
    }

    #[tokio::test]
    async fn standalone_mode_defaults_identity() {
        let client = IdentityClient::new(None);
        let identity = client.authenticate(None).await.unwrap();
        assert_eq!(identity.team_id, "default");
        assert_eq!(identity.user_id, "default");
    }
}
