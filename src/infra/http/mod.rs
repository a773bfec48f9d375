pub mod api;
mod middleware;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    middleware as axum_middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use dashcache_api_types::StatusResponse;

use crate::application::dashboard::DashboardService;
use crate::application::error::ErrorReport;
use crate::application::repos::DbError;

use self::middleware::{log_responses, set_request_context};

#[derive(Clone)]
pub struct HttpState {
    pub dashboard: DashboardService,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .merge(api::build_api_router())
        .route("/health", get(health))
        .route("/health/ready", get(readiness))
        .route("/health/db", get(db_health))
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}

async fn health(State(state): State<HttpState>) -> Json<StatusResponse> {
    Json(StatusResponse::from(&state.dashboard.status()))
}

async fn readiness(State(state): State<HttpState>) -> Response {
    let body = Json(StatusResponse::from(&state.dashboard.status()));
    if state.dashboard.is_ready() {
        (StatusCode::OK, body).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
    }
}

async fn db_health(State(state): State<HttpState>) -> Response {
    db_health_response(state.dashboard.check_database().await)
}

fn db_health_response(result: Result<(), DbError>) -> Response {
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            let mut response = StatusCode::SERVICE_UNAVAILABLE.into_response();
            ErrorReport::from_error(
                "infra::http::db_health",
                StatusCode::SERVICE_UNAVAILABLE,
                &err,
            )
            .attach(&mut response);
            response
        }
    }
}
