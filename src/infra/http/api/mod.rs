pub mod error;
pub mod handlers;
pub mod models;

use axum::{
    Router,
    routing::{get, post},
};

use crate::infra::http::HttpState;

pub fn build_api_router() -> Router<HttpState> {
    Router::new()
        .route("/api/queries", get(handlers::list_queries))
        .route("/api/queries/{name}", get(handlers::get_query_data))
        .route("/api/queries/{name}/refresh", post(handlers::refresh_query))
}
