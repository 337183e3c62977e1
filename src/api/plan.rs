use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::domain::plan::EmsPlanOutput;
use crate::ems::intent::{build_plan_intent, PlanIntent, DEFAULT_EPS_KW};
use crate::planner::RunState;

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub run: RunState,
    pub already_running: bool,
}

#[derive(Debug, Serialize)]
pub struct PlanResponse {
    pub run: RunState,
    pub plan: EmsPlanOutput,
    pub intent: PlanIntent,
}

pub async fn run_plan(State(state): State<AppState>) -> (StatusCode, Json<RunResponse>) {
    let (run, already_running) = state.planner.trigger_run().await;
    (StatusCode::ACCEPTED, Json(RunResponse { run, already_running }))
}

pub async fn latest_plan(State(state): State<AppState>) -> Response {
    match state.planner.latest() {
        Some(published) => {
            let intent = build_plan_intent(&published.plan, &state.config, DEFAULT_EPS_KW);
            Json(PlanResponse {
                run: published.run.clone(),
                plan: published.plan.clone(),
                intent,
            })
            .into_response()
        }
        None => crate::api::error::ApiError::NotFound("No plan available".to_string())
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct AwaitQuery {
    #[serde(default)]
    pub since: Option<String>,
    #[serde(default = "default_await_timeout")]
    pub timeout: u64,
}

fn default_await_timeout() -> u64 {
    30
}

/// Accepts epoch seconds or an ISO timestamp; anything unparsable counts
/// as "from the beginning".
fn parse_since(value: Option<&str>) -> f64 {
    let Some(value) = value else { return 0.0 };
    if let Ok(epoch) = value.parse::<f64>() {
        return epoch;
    }
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.timestamp_micros() as f64 / 1e6)
        .unwrap_or(0.0)
}

pub async fn await_plan(
    State(state): State<AppState>,
    Query(query): Query<AwaitQuery>,
) -> Response {
    let since_ts = parse_since(query.since.as_deref());
    let timeout = Duration::from_secs(query.timeout);
    match state.planner.await_latest(since_ts, timeout).await {
        Some(published) => {
            let intent = build_plan_intent(&published.plan, &state.config, DEFAULT_EPS_KW);
            Json(PlanResponse {
                run: published.run.clone(),
                plan: published.plan.clone(),
                intent,
            })
            .into_response()
        }
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn since_accepts_epoch_and_iso() {
        assert_eq!(parse_since(None), 0.0);
        assert_eq!(parse_since(Some("1748762400")), 1748762400.0);
        let iso = parse_since(Some("2025-06-01T08:00:00+00:00"));
        assert!(iso > 1.0e9);
        assert_eq!(parse_since(Some("not-a-time")), 0.0);
    }
}
