use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};

use crate::api::AppState;

/// EMS configuration with secrets redacted.
pub async fn get_settings(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.config.as_ref().clone())
}

/// Settings are read-only at runtime; edit the YAML and restart.
pub async fn post_settings() -> impl IntoResponse {
    StatusCode::NOT_IMPLEMENTED
}
