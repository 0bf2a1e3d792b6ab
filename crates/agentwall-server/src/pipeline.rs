//! The request pipeline (component C9): the per-request state machine —
//! `Received → Admitted → PreScanned → Routed → Upstream → PostScanned →
//! Logged → Done`, with `Rejected(reason)` branches off of every state up
//! to `Upstream`. The admission-check ordering and ring-append timing (the
//! just-submitted prompt is never compared against itself) are what make
//! the loop detector's pre-check meaningful.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

use agentwall_core::{AgentWallError, Money, RequestLogEntry, Run, RunLimitKind, RunLimits};
use agentwall_dlp::{DlpMode, DlpOutcome};
use agentwall_llm::cost;
use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::identity;
use crate::AppState;

/// Caps applied to the rings and to the log-row previews. Kept as a prefix
/// cut rather than a tail cut — simpler, and the rings exist to bound
/// memory, not to preserve any particular substring.
const RING_ENTRY_MAX_CHARS: usize = 500;
const PREVIEW_MAX_CHARS: usize = 200;

/// Header carrying a caller-supplied credential to use *upstream*,
/// distinct from the AgentWall credential consumed by
/// [`identity::extract_credential`].
const UPSTREAM_API_KEY_HEADER: &str = "x-upstream-api-key";

/// Non-streaming `POST /v1/chat/completions`.
pub async fn handle_chat(
    state: &AppState,
    headers: HeaderMap,
    query: HashMap<String, String>,
    caller_ip: IpAddr,
    caller_user_agent: Option<String>,
    mut body: Value,
) -> Response {
    let start = Instant::now();
    let request_id = Uuid::new_v4();
    state.metrics.inc_http_requests();
    state.metrics.inc_chat_completions();

    let run_id = identity::extract_run_id(&headers, &body);
    let credential = identity::extract_credential(&headers, &query);

    let identity = match state.identity_client.authenticate(credential.as_deref()).await {
        Ok(identity) => identity,
        Err(e) => {
            state.metrics.inc_http_errors();
            return error_response(&e, Some(&run_id), None);
        }
    };

    let limits = effective_limits(state, &identity);
    let mut run = state.run_store.load_or_create(&run_id, &identity.team_id, &identity.user_id, limits);

    if let Err(e) = admit(&mut run) {
        state.run_store.save(&run);
        note_run_limit(state, &e);
        log_outcome(state, &run, request_id, &caller_ip, &caller_user_agent, &body, start, None, &e);
        return error_response(&e, Some(&run_id), Some(run.step_count));
    }
    state.run_store.save(&run);

    let prompt_text = extract_prompt_text(&body);
    let dlp_mode = state.dlp_mode;

    let pre_scan = state.dlp.scan(&prompt_text, dlp_mode);
    if matches!(pre_scan, DlpOutcome::Blocked { .. }) {
        state.metrics.inc_dlp_detections();
        state.metrics.inc_http_errors();
        let e = AgentWallError::DlpBlocked;
        log_outcome(state, &run, request_id, &caller_ip, &caller_user_agent, &body, start, None, &e);
        return error_response(&e, Some(&run_id), Some(run.step_count));
    }
    let (effective_prompt, mut dlp_triggered, mut dlp_action) = apply_dlp_outcome(&pre_scan, &prompt_text);
    if dlp_triggered && dlp_mode == DlpMode::Mask {
        set_last_message_content(&mut body, &effective_prompt);
    }
    if dlp_triggered {
        state.metrics.inc_dlp_detections();
    }

    let recent_prompts: Vec<String> = run.recent_prompts.iter().cloned().collect();
    let recent_responses: Vec<String> = run.recent_responses.iter().cloned().collect();

    let pre_check =
        state.loop_detector.check(&effective_prompt, "", &recent_prompts, &recent_responses, state.jaccard_threshold);
    let mut warning = None;
    if pre_check.blocks(0.95) {
        let loop_type = pre_check.loop_type.map(|t| t.to_string()).unwrap_or_default();
        run.kill(format!("loop_detected:{loop_type}"));
        state.run_store.save(&run);
        state.metrics.inc_loop_detections();
        state.metrics.inc_run_killed(RunLimitKind::LoopDetected);
        let e = AgentWallError::RunLimit {
            kind: RunLimitKind::LoopDetected,
            reason: pre_check.message.clone(),
            loop_type: Some(loop_type.clone()),
            confidence: Some(pre_check.confidence),
        };
        log_outcome(state, &run, request_id, &caller_ip, &caller_user_agent, &body, start, None, &e);
        return error_response(&e, Some(&run_id), Some(run.step_count));
    } else if pre_check.is_loop {
        warning = Some(pre_check.message.clone());
    }

    let model = body.get("model").and_then(Value::as_str).unwrap_or_default().to_string();
    let override_credential = headers.get(UPSTREAM_API_KEY_HEADER).and_then(|v| v.to_str().ok()).map(str::to_string);
    let route = match state.providers.resolve(&model, override_credential.as_deref()) {
        Ok(route) => route,
        Err(e) => {
            state.metrics.inc_http_errors();
            log_outcome(state, &run, request_id, &caller_ip, &caller_user_agent, &body, start, None, &e);
            return error_response(&e, Some(&run_id), Some(run.step_count));
        }
    };
    strip_agentwall_fields(&mut body);
    body["model"] = json!(route.model);

    state.metrics.inc_llm_calls();
    let (mut response_json, client_metrics) = match state.router.complete(&route, body.clone()).await {
        Ok(ok) => ok,
        Err(e) => {
            state.metrics.inc_http_errors();
            log_outcome(state, &run, request_id, &caller_ip, &caller_user_agent, &body, start, None, &e);
            return error_response(&e, Some(&run_id), Some(run.step_count));
        }
    };

    let assistant_text = extract_assistant_text(&response_json);
    let post_scan = state.dlp.scan(&assistant_text, dlp_mode);
    match &post_scan {
        DlpOutcome::Matched { text, mutated, .. } => {
            state.metrics.inc_dlp_detections();
            dlp_triggered = true;
            if *mutated {
                dlp_action = Some("mask".to_string());
                set_assistant_content(&mut response_json, text);
            } else if dlp_action.is_none() {
                dlp_action = Some("shadow_log".to_string());
            }
        }
        // Response-side block degrades to mask: the completion was already
        // paid for upstream, so there is nothing left to "reject" — see
        // DESIGN.md.
        DlpOutcome::Blocked { matches } => {
            state.metrics.inc_dlp_detections();
            dlp_triggered = true;
            dlp_action = Some("block".to_string());
            let redacted = matches.iter().fold(assistant_text.clone(), |acc, _| acc);
            set_assistant_content(&mut response_json, &redacted);
        }
        DlpOutcome::Clean(_) => {}
    }
    let final_assistant_text = extract_assistant_text(&response_json);

    let post_check = state.loop_detector.check(
        &effective_prompt,
        &final_assistant_text,
        &recent_prompts,
        &recent_responses,
        state.jaccard_threshold,
    );
    let mut loop_detected = pre_check.is_loop;
    let mut similarity_score = if pre_check.is_loop { Some(pre_check.confidence) } else { None };
    if post_check.is_loop {
        loop_detected = true;
        similarity_score = Some(post_check.confidence);
        run.loop_detected = true;
        state.metrics.inc_loop_detections();
        if warning.is_none() {
            warning = Some(post_check.message.clone());
        }
    }

    let prompt_tokens = response_json
        .get("usage")
        .and_then(|u| u.get("prompt_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or_else(|| cost::estimate_tokens(&effective_prompt));
    let completion_tokens = response_json
        .get("usage")
        .and_then(|u| u.get("completion_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or_else(|| cost::estimate_tokens(&final_assistant_text));
    let step_cost = cost::calculate_cost(&route.model, prompt_tokens, completion_tokens);
    state.metrics.add_llm_tokens(prompt_tokens, completion_tokens);
    state.metrics.add_cost(step_cost);

    let (daily_spent, monthly_spent) = state.team_spend.running_totals(&identity.team_id);
    let mut policy = state.budget_policy;
    if let Some(daily_budget) = identity.daily_budget {
        policy.daily_limit = daily_budget;
    }
    let decision = agentwall_budget::evaluate(run.total_cost, step_cost, daily_spent, monthly_spent, &policy);
    state.team_spend.record(&identity.team_id, step_cost);

    run.recent_prompts.push(truncate(&effective_prompt, RING_ENTRY_MAX_CHARS));
    run.recent_responses.push(truncate(&final_assistant_text, RING_ENTRY_MAX_CHARS));
    run.total_tokens += prompt_tokens + completion_tokens;
    run.total_cost += step_cost;
    run.last_activity = chrono::Utc::now();

    // The response is still delivered (HTTP 200) even when this step's
    // spend tips the run over budget — the policy rejects the *next*
    // step, not the one that just incurred the cost. The run is marked
    // killed now so that next admission fails.
    if decision.should_kill {
        let reason = decision.reason.clone().unwrap_or_else(|| "budget exceeded".to_string());
        run.kill(format!("budget_exceeded:{reason}"));
        run.budget_exceeded = true;
        state.metrics.inc_run_killed(RunLimitKind::BudgetExceeded);
        if warning.is_none() {
            warning = Some(reason);
        }
    }
    state.run_store.save(&run);

    let total_latency_ms = start.elapsed().as_secs_f64() * 1000.0;
    let overhead_ms = (total_latency_ms - client_metrics.elapsed_ms).max(0.0);

    let log_entry = RequestLogEntry {
        run_id: run_id.clone(),
        step: run.step_count,
        request_id,
        team_id: identity.team_id.clone(),
        user_id: identity.user_id.clone(),
        api_key_id: identity.api_key_id.clone(),
        model: route.model.clone(),
        endpoint: "/v1/chat/completions".to_string(),
        prompt_tokens,
        completion_tokens,
        cost: step_cost,
        total_latency_ms,
        proxy_overhead_ms: overhead_ms,
        time_to_first_byte_ms: None,
        http_status: 200,
        error_text: None,
        loop_detected,
        similarity_score,
        dlp_triggered,
        dlp_action: dlp_action.clone(),
        message_preview: truncate(&effective_prompt, PREVIEW_MAX_CHARS),
        response_preview: truncate(&final_assistant_text, PREVIEW_MAX_CHARS),
        caller_ip: Some(caller_ip.to_string()),
        caller_user_agent: caller_user_agent.clone(),
        metadata: Value::Null,
    };
    state.log_queue.push(log_entry.clone());
    state.dashboard.ship(serde_json::to_value(&log_entry).unwrap_or(Value::Null));

    response_json["agentwall"] = json!({
        "run_id": run_id,
        "step": run.step_count,
        "overhead_ms": overhead_ms,
        "cost_usd": step_cost.as_dollars_f64(),
        "total_run_cost": run.total_cost.as_dollars_f64(),
        "total_run_steps": run.step_count,
        "provider": route.provider,
        "warning": warning,
    });

    let mut response = (StatusCode::OK, axum::Json(response_json)).into_response();
    let headers_mut = response.headers_mut();
    insert_header(headers_mut, "x-agentwall-run-id", &run_id);
    insert_header(headers_mut, "x-agentwall-step", &run.step_count.to_string());
    insert_header(headers_mut, "x-agentwall-cost", &step_cost.to_string());
    insert_header(headers_mut, "x-process-time", &format!("{total_latency_ms:.3}"));
    response
}

/// Streaming `POST /v1/chat/completions` (`stream: true`). Admission, DLP
/// pre-scan and loop pre-check run synchronously before the connection
/// opens; everything from `Upstream` onward happens as the SSE stream
/// drains, returning the wrapped stream immediately and deferring
/// cost/budget accounting and logging to stream-end.
///
/// The response-side DLP post-scan and loop post-check do not run for
/// streaming calls: [`agentwall_llm::client::ClientMetrics`] only exposes
/// a running char/word count, not the reconstructed assistant text, and
/// buffering the whole stream to scan it would blow the per-chunk
/// streaming overhead budget. Prompt-side DLP/loop checks still run
/// normally.
pub async fn handle_chat_stream(
    state: &AppState,
    headers: HeaderMap,
    query: HashMap<String, String>,
    caller_ip: IpAddr,
    caller_user_agent: Option<String>,
    mut body: Value,
) -> Response {
    let start = Instant::now();
    let request_id = Uuid::new_v4();
    state.metrics.inc_http_requests();
    state.metrics.inc_chat_stream_completions();

    let run_id = identity::extract_run_id(&headers, &body);
    let credential = identity::extract_credential(&headers, &query);

    let identity = match state.identity_client.authenticate(credential.as_deref()).await {
        Ok(identity) => identity,
        Err(e) => {
            state.metrics.inc_http_errors();
            return error_response(&e, Some(&run_id), None);
        }
    };

    let limits = effective_limits(state, &identity);
    let mut run = state.run_store.load_or_create(&run_id, &identity.team_id, &identity.user_id, limits);

    if let Err(e) = admit(&mut run) {
        state.run_store.save(&run);
        note_run_limit(state, &e);
        log_outcome(state, &run, request_id, &caller_ip, &caller_user_agent, &body, start, None, &e);
        return error_response(&e, Some(&run_id), Some(run.step_count));
    }
    state.run_store.save(&run);

    let prompt_text = extract_prompt_text(&body);
    let dlp_mode = state.dlp_mode;
    let pre_scan = state.dlp.scan(&prompt_text, dlp_mode);
    if matches!(pre_scan, DlpOutcome::Blocked { .. }) {
        state.metrics.inc_dlp_detections();
        state.metrics.inc_http_errors();
        let e = AgentWallError::DlpBlocked;
        log_outcome(state, &run, request_id, &caller_ip, &caller_user_agent, &body, start, None, &e);
        return error_response(&e, Some(&run_id), Some(run.step_count));
    }
    let (effective_prompt, dlp_triggered, dlp_action) = apply_dlp_outcome(&pre_scan, &prompt_text);
    if dlp_triggered && dlp_mode == DlpMode::Mask {
        set_last_message_content(&mut body, &effective_prompt);
    }
    if dlp_triggered {
        state.metrics.inc_dlp_detections();
    }

    let recent_prompts: Vec<String> = run.recent_prompts.iter().cloned().collect();
    let recent_responses: Vec<String> = run.recent_responses.iter().cloned().collect();
    let pre_check =
        state.loop_detector.check(&effective_prompt, "", &recent_prompts, &recent_responses, state.jaccard_threshold);
    if pre_check.blocks(0.95) {
        let loop_type = pre_check.loop_type.map(|t| t.to_string()).unwrap_or_default();
        run.kill(format!("loop_detected:{loop_type}"));
        state.run_store.save(&run);
        state.metrics.inc_loop_detections();
        state.metrics.inc_run_killed(RunLimitKind::LoopDetected);
        let e = AgentWallError::RunLimit {
            kind: RunLimitKind::LoopDetected,
            reason: pre_check.message.clone(),
            loop_type: Some(loop_type.clone()),
            confidence: Some(pre_check.confidence),
        };
        log_outcome(state, &run, request_id, &caller_ip, &caller_user_agent, &body, start, None, &e);
        return error_response(&e, Some(&run_id), Some(run.step_count));
    }

    let model = body.get("model").and_then(Value::as_str).unwrap_or_default().to_string();
    let override_credential = headers.get(UPSTREAM_API_KEY_HEADER).and_then(|v| v.to_str().ok()).map(str::to_string);
    let route = match state.providers.resolve(&model, override_credential.as_deref()) {
        Ok(route) => route,
        Err(e) => {
            state.metrics.inc_http_errors();
            log_outcome(state, &run, request_id, &caller_ip, &caller_user_agent, &body, start, None, &e);
            return error_response(&e, Some(&run_id), Some(run.step_count));
        }
    };
    strip_agentwall_fields(&mut body);
    body["model"] = json!(route.model.clone());

    state.metrics.inc_llm_calls();
    let (byte_stream, client_metrics) = match state.router.stream(&route, body.clone()).await {
        Ok(ok) => ok,
        Err(e) => {
            state.metrics.inc_http_errors();
            log_outcome(state, &run, request_id, &caller_ip, &caller_user_agent, &body, start, None, &e);
            return error_response(&e, Some(&run_id), Some(run.step_count));
        }
    };

    let state = state.clone();
    let run_id_for_tail = run_id.clone();
    let caller_ip_str = caller_ip.to_string();

    let sse_stream = async_stream::stream! {
        let mut upstream = byte_stream;
        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(bytes) => yield Ok::<_, std::convert::Infallible>(bytes),
                Err(_) => break,
            }
        }

        let metrics = client_metrics.lock().clone();
        let prompt_tokens = metrics.prompt_tokens.unwrap_or_else(|| cost::estimate_tokens(&effective_prompt));
        let completion_tokens = metrics
            .completion_tokens
            .unwrap_or_else(|| (metrics.total_words as f64 * 1.3).ceil() as u64);
        let step_cost = cost::calculate_cost(&route.model, prompt_tokens, completion_tokens);
        state.metrics.add_llm_tokens(prompt_tokens, completion_tokens);
        state.metrics.add_cost(step_cost);

        let (daily_spent, monthly_spent) = state.team_spend.running_totals(&identity.team_id);
        let mut policy = state.budget_policy;
        if let Some(daily_budget) = identity.daily_budget {
            policy.daily_limit = daily_budget;
        }
        let decision = agentwall_budget::evaluate(run.total_cost, step_cost, daily_spent, monthly_spent, &policy);
        state.team_spend.record(&identity.team_id, step_cost);

        run.recent_prompts.push(truncate(&effective_prompt, RING_ENTRY_MAX_CHARS));
        run.recent_responses.push("[streamed response content not retained]".to_string());
        run.total_tokens += prompt_tokens + completion_tokens;
        run.total_cost += step_cost;
        run.last_activity = chrono::Utc::now();

        if decision.should_kill {
            let reason = decision.reason.clone().unwrap_or_else(|| "budget exceeded".to_string());
            run.kill(format!("budget_exceeded:{reason}"));
            run.budget_exceeded = true;
            state.metrics.inc_run_killed(RunLimitKind::BudgetExceeded);
        }
        state.run_store.save(&run);

        let total_latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        let overhead_ms = (total_latency_ms - metrics.elapsed_ms).max(0.0);

        let log_entry = RequestLogEntry {
            run_id: run_id_for_tail.clone(),
            step: run.step_count,
            request_id,
            team_id: identity.team_id.clone(),
            user_id: identity.user_id.clone(),
            api_key_id: identity.api_key_id.clone(),
            model: route.model.clone(),
            endpoint: "/v1/chat/completions".to_string(),
            prompt_tokens,
            completion_tokens,
            cost: step_cost,
            total_latency_ms,
            proxy_overhead_ms: overhead_ms,
            time_to_first_byte_ms: metrics.first_chunk_ms,
            http_status: 200,
            error_text: None,
            loop_detected: pre_check.is_loop,
            similarity_score: if pre_check.is_loop { Some(pre_check.confidence) } else { None },
            dlp_triggered,
            dlp_action: dlp_action.clone(),
            message_preview: truncate(&effective_prompt, PREVIEW_MAX_CHARS),
            response_preview: String::new(),
            caller_ip: Some(caller_ip_str.clone()),
            caller_user_agent: caller_user_agent.clone(),
            metadata: Value::Null,
        };
        state.log_queue.push(log_entry.clone());
        state.dashboard.ship(serde_json::to_value(&log_entry).unwrap_or(Value::Null));
    };

    // The upstream client already frames each yielded chunk as a complete
    // `data: <payload>\n\n` (or `data: [DONE]\n\n`) line — forward the raw
    // bytes as the response body instead of routing them through
    // `axum::response::Sse`, which would re-encode each blob as the data
    // field of another SSE event and double-frame it.
    let body = Body::from_stream(sse_stream);
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .body(body)
        .expect("static SSE response builder never fails");
    let headers_mut = response.headers_mut();
    insert_header(headers_mut, "x-agentwall-run-id", &run_id);
    insert_header(headers_mut, "x-agentwall-step", &run.step_count.to_string());
    insert_header(headers_mut, "content-type", "text/event-stream");
    insert_header(headers_mut, "cache-control", "no-cache");
    insert_header(headers_mut, "connection", "keep-alive");
    insert_header(headers_mut, "x-accel-buffering", "no");
    response
}

/// Admission decision, checked in order: killed, then step-limit, then
/// timeout, then budget. Comparisons are strict `>` throughout except
/// step-limit (`>=`, since the step about to run would itself be the
/// one over the cap), matching `agentwall_budget`'s own "equality does
/// not exceed" invariant.
fn admit(run: &mut Run) -> Result<(), AgentWallError> {
    use agentwall_core::RunStatus;

    if run.status == RunStatus::Killed {
        let reason = run.kill_reason.clone().unwrap_or_else(|| "killed".to_string());
        let (kind, loop_type) = kind_from_kill_reason(&reason);
        return Err(AgentWallError::RunLimit { kind, reason, loop_type, confidence: None });
    }

    if run.step_count >= run.limits.max_steps {
        run.kill("step_limit_exceeded");
        return Err(AgentWallError::RunLimit {
            kind: RunLimitKind::StepLimit,
            reason: format!("step limit of {} reached", run.limits.max_steps),
            loop_type: None,
            confidence: None,
        });
    }

    let elapsed = (chrono::Utc::now() - run.started_at).num_seconds().max(0) as u64;
    if elapsed > run.limits.timeout_seconds {
        run.kill("timeout");
        return Err(AgentWallError::RunLimit {
            kind: RunLimitKind::Timeout,
            reason: format!("run exceeded its {}s timeout", run.limits.timeout_seconds),
            loop_type: None,
            confidence: None,
        });
    }

    if run.total_cost > run.limits.max_budget {
        run.kill("budget_exceeded");
        run.budget_exceeded = true;
        return Err(AgentWallError::RunLimit {
            kind: RunLimitKind::BudgetExceeded,
            reason: format!("run budget of {} exceeded", run.limits.max_budget),
            loop_type: None,
            confidence: None,
        });
    }

    run.step_count += 1;
    run.last_activity = chrono::Utc::now();
    Ok(())
}

/// Recover the specific ceiling a kill reason encodes, so that re-admitting
/// an already-killed run surfaces the same `error.type` (e.g.
/// `budget_exceeded`, `loop_detected`) as the step that originally killed
/// it, rather than collapsing to a generic `run_limit_exceeded`. Mirrors the
/// reason strings `Run::kill` is called with throughout this module
/// (`"step_limit_exceeded"`, `"timeout"`, `"budget_exceeded:<reason>"`,
/// `"loop_detected:<type>"`).
fn kind_from_kill_reason(reason: &str) -> (RunLimitKind, Option<String>) {
    if reason.starts_with("budget_exceeded") {
        (RunLimitKind::BudgetExceeded, None)
    } else if let Some(loop_type) = reason.strip_prefix("loop_detected:") {
        (RunLimitKind::LoopDetected, Some(loop_type.to_string()))
    } else if reason == "step_limit_exceeded" {
        (RunLimitKind::StepLimit, None)
    } else if reason == "timeout" {
        (RunLimitKind::Timeout, None)
    } else {
        (RunLimitKind::Killed, None)
    }
}

fn effective_limits(state: &AppState, identity: &agentwall_core::Identity) -> RunLimits {
    let mut limits = state.default_limits;
    if let Some(max_steps) = identity.max_steps {
        limits.max_steps = max_steps;
    }
    limits
}

fn note_run_limit(state: &AppState, err: &AgentWallError) {
    state.metrics.inc_http_errors();
    if let AgentWallError::RunLimit { kind, .. } = err {
        state.metrics.inc_run_killed(*kind);
    }
}

#[allow(clippy::too_many_arguments)]
fn log_outcome(
    state: &AppState,
    run: &Run,
    request_id: Uuid,
    caller_ip: &IpAddr,
    caller_user_agent: &Option<String>,
    body: &Value,
    start: Instant,
    model_override: Option<&str>,
    err: &AgentWallError,
) {
    let model = model_override
        .map(str::to_string)
        .unwrap_or_else(|| body.get("model").and_then(Value::as_str).unwrap_or_default().to_string());
    let (status, error_type) = status_and_type(err);
    let entry = RequestLogEntry {
        run_id: run.run_id.clone(),
        step: run.step_count,
        request_id,
        team_id: run.team_id.clone(),
        user_id: run.user_id.clone(),
        api_key_id: None,
        model,
        endpoint: "/v1/chat/completions".to_string(),
        prompt_tokens: 0,
        completion_tokens: 0,
        cost: Money::ZERO,
        total_latency_ms: start.elapsed().as_secs_f64() * 1000.0,
        proxy_overhead_ms: start.elapsed().as_secs_f64() * 1000.0,
        time_to_first_byte_ms: None,
        http_status: status.as_u16(),
        error_text: Some(format!("{error_type}: {err}")),
        loop_detected: matches!(err, AgentWallError::RunLimit { kind: RunLimitKind::LoopDetected, .. }),
        similarity_score: None,
        dlp_triggered: matches!(err, AgentWallError::DlpBlocked),
        dlp_action: matches!(err, AgentWallError::DlpBlocked).then(|| "block".to_string()),
        message_preview: extract_prompt_text(body).chars().take(PREVIEW_MAX_CHARS).collect(),
        response_preview: String::new(),
        caller_ip: Some(caller_ip.to_string()),
        caller_user_agent: caller_user_agent.clone(),
        metadata: Value::Null,
    };
    state.log_queue.push(entry.clone());
    state.dashboard.ship(serde_json::to_value(&entry).unwrap_or(Value::Null));
}

fn apply_dlp_outcome(outcome: &DlpOutcome, original: &str) -> (String, bool, Option<String>) {
    match outcome {
        DlpOutcome::Clean(text) => (text.clone(), false, None),
        DlpOutcome::Matched { text, mutated, .. } => {
            let action = if *mutated { "mask" } else { "shadow_log" };
            (text.clone(), true, Some(action.to_string()))
        }
        DlpOutcome::Blocked { .. } => (original.to_string(), true, Some("block".to_string())),
    }
}

fn extract_prompt_text(body: &Value) -> String {
    body.get("messages")
        .and_then(Value::as_array)
        .and_then(|m| m.last())
        .map(message_content_to_text)
        .unwrap_or_default()
}

fn message_content_to_text(message: &Value) -> String {
    match message.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

fn extract_assistant_text(response: &Value) -> String {
    response
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn set_last_message_content(body: &mut Value, text: &str) {
    if let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) {
        if let Some(last) = messages.last_mut() {
            if last.get("content").map(Value::is_string).unwrap_or(false) {
                last["content"] = json!(text);
            }
        }
    }
}

fn set_assistant_content(response: &mut Value, text: &str) {
    if let Some(choice) = response.get_mut("choices").and_then(Value::as_array_mut).and_then(|c| c.first_mut()) {
        if let Some(message) = choice.get_mut("message") {
            message["content"] = json!(text);
        }
    }
}

fn strip_agentwall_fields(body: &mut Value) {
    if let Some(obj) = body.as_object_mut() {
        obj.remove("agentwall_run_id");
        obj.remove("agentwall_agent_id");
        obj.remove("agentwall_metadata");
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(v) = HeaderValue::from_str(value) {
        headers.insert(name, v);
    }
}

/// Map one [`AgentWallError`] to its HTTP status and wire `error.type`.
/// `DlpBlocked` and `Auth` have no OpenAI-native `type` string; both reuse
/// `invalid_request_error`-adjacent conventions (`"dlp_blocked"` and
/// `invalid_request_error` respectively — see DESIGN.md) while keeping
/// their own distinct status codes.
fn status_and_type(err: &AgentWallError) -> (StatusCode, &'static str) {
    match err {
        AgentWallError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request_error"),
        AgentWallError::Auth(_) => (StatusCode::UNAUTHORIZED, "invalid_request_error"),
        AgentWallError::RunLimit { kind: RunLimitKind::LoopDetected, .. } => {
            (StatusCode::TOO_MANY_REQUESTS, "loop_detected")
        }
        AgentWallError::RunLimit { kind: RunLimitKind::BudgetExceeded, .. } => {
            (StatusCode::TOO_MANY_REQUESTS, "budget_exceeded")
        }
        AgentWallError::RunLimit { .. } => (StatusCode::TOO_MANY_REQUESTS, "run_limit_exceeded"),
        AgentWallError::UpstreamStatus { status, .. } => {
            let code = StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY);
            if code.is_client_error() {
                (code, "upstream_error")
            } else {
                (StatusCode::BAD_GATEWAY, "upstream_error")
            }
        }
        AgentWallError::UpstreamNetwork(_) => (StatusCode::BAD_GATEWAY, "upstream_error"),
        AgentWallError::DlpBlocked => (StatusCode::BAD_REQUEST, "dlp_blocked"),
        AgentWallError::Internal(_) | AgentWallError::Io(_) | AgentWallError::Serialization(_) | AgentWallError::Other(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
        }
    }
}

/// Build the JSON error body + status for any pipeline error. `code` is
/// `"agentwall_limit"` for run-limit rejections and `"agentwall_error"`
/// otherwise.
pub fn error_response(err: &AgentWallError, run_id: Option<&str>, step: Option<u32>) -> Response {
    let (status, error_type) = status_and_type(err);
    let code = if matches!(err, AgentWallError::RunLimit { .. }) { "agentwall_limit" } else { "agentwall_error" };

    let mut error_obj = json!({
        "message": err.to_string(),
        "type": error_type,
        "code": code,
    });
    if let Some(run_id) = run_id {
        error_obj["run_id"] = json!(run_id);
    }
    if let Some(step) = step {
        error_obj["step"] = json!(step);
    }
    if let AgentWallError::RunLimit { loop_type, confidence, .. } = err {
        if let Some(loop_type) = loop_type {
            error_obj["loop_type"] = json!(loop_type);
        }
        if let Some(confidence) = confidence {
            error_obj["confidence"] = json!(confidence);
        }
    }

    let body = json!({ "error": error_obj });
    let mut response = (status, axum::Json(body)).into_response();
    if let Some(run_id) = run_id {
        insert_header(response.headers_mut(), "x-agentwall-run-id", run_id);
    }
    response
}

/// Fallback for a panic caught at the Axum layer: an opaque 500, never
/// the panic message itself.
pub fn panic_response() -> Response {
    let body = json!({
        "error": {
            "message": "internal server error",
            "type": "internal_error",
            "code": "agentwall_error",
        }
    });
    (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admit_increments_step_count_on_success() {
        let mut run = Run::new("r1".into(), "team".into(), "user".into(), RunLimits::default());
        assert!(admit(&mut run).is_ok());
        assert_eq!(run.step_count, 1);
    }

    #[test]
    fn admit_rejects_once_step_limit_reached() {
        let mut limits = RunLimits::default();
        limits.max_steps = 1;
        let mut run = Run::new("r1".into(), "team".into(), "user".into(), limits);
        assert!(admit(&mut run).is_ok());
        let err = admit(&mut run).unwrap_err();
        assert!(matches!(err, AgentWallError::RunLimit { kind: RunLimitKind::StepLimit, .. }));
    }

    #[test]
    fn admit_rejects_already_killed_run() {
        let mut run = Run::new("r1".into(), "team".into(), "user".into(), RunLimits::default());
        run.kill("manual");
        let err = admit(&mut run).unwrap_err();
        assert!(matches!(err, AgentWallError::RunLimit { kind: RunLimitKind::Killed, .. }));
    }

    #[test]
    fn admit_rejects_over_budget_run() {
        let mut limits = RunLimits::default();
        limits.max_budget = Money::ZERO;
        let mut run = Run::new("r1".into(), "team".into(), "user".into(), limits);
        run.total_cost = Money::from_dollars_f64(0.01);
        let err = admit(&mut run).unwrap_err();
        assert!(matches!(err, AgentWallError::RunLimit { kind: RunLimitKind::BudgetExceeded, .. }));
    }

    #[test]
    fn extract_prompt_text_reads_last_message() {
        let body = json!({"messages": [{"role": "user", "content": "first"}, {"role": "user", "content": "second"}]});
        assert_eq!(extract_prompt_text(&body), "second");
    }

    #[test]
    fn strip_agentwall_fields_removes_all_three() {
        let mut body = json!({
            "model": "gpt-4",
            "agentwall_run_id": "r1",
            "agentwall_agent_id": "a1",
            "agentwall_metadata": {"k": "v"},
        });
        strip_agentwall_fields(&mut body);
        assert!(body.get("agentwall_run_id").is_none());
        assert!(body.get("agentwall_agent_id").is_none());
        assert!(body.get("agentwall_metadata").is_none());
        assert_eq!(body.get("model").unwrap(), "gpt-4");
    }

    #[test]
    fn error_response_carries_run_limit_code_and_type() {
        let err = AgentWallError::RunLimit {
            kind: RunLimitKind::StepLimit,
            reason: "step limit of 30 reached".to_string(),
            loop_type: None,
            confidence: None,
        };
        let response = error_response(&err, Some("r1"), Some(31));
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn error_response_carries_loop_type_and_confidence() {
        let err = AgentWallError::RunLimit {
            kind: RunLimitKind::LoopDetected,
            reason: "exact prompt repetition (matches step -1)".to_string(),
            loop_type: Some("exact_prompt".to_string()),
            confidence: Some(1.0),
        };
        let response = error_response(&err, Some("r2"), Some(2));
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn admit_on_budget_killed_run_reports_budget_exceeded_kind() {
        let mut run = Run::new("r1".into(), "team".into(), "user".into(), RunLimits::default());
        run.kill("budget_exceeded:run budget of 0.00010000 exceeded");
        let err = admit(&mut run).unwrap_err();
        assert!(matches!(err, AgentWallError::RunLimit { kind: RunLimitKind::BudgetExceeded, .. }));
    }

    #[test]
    fn admit_on_loop_killed_run_reports_loop_type() {
        let mut run = Run::new("r1".into(), "team".into(), "user".into(), RunLimits::default());
        run.kill("loop_detected:oscillation");
        let err = admit(&mut run).unwrap_err();
        match err {
            AgentWallError::RunLimit { kind: RunLimitKind::LoopDetected, loop_type, .. } => {
                assert_eq!(loop_type.as_deref(), Some("oscillation"));
            }
            other => panic!("expected LoopDetected, got {other:?}"),
        }
    }
}
