pub mod error;
pub mod health;
pub mod plan;
pub mod settings;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::AppConfig;
use crate::planner::Planner;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub planner: Planner,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/plan/run", post(plan::run_plan))
        .route("/plan/latest", get(plan::latest_plan))
        .route("/plan/await", get(plan::await_plan))
        .route("/settings", get(settings::get_settings).post(settings::post_settings))
        .route("/health", get(health::health))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
