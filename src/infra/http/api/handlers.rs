use axum::Json;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use dashcache_api_types::{QueryDataResponse, QuerySummaryDto, RefreshAcceptedDto};

use crate::application::view::ViewRequest;
use crate::infra::http::HttpState;

use super::error::ApiError;

pub async fn list_queries(State(state): State<HttpState>) -> Json<Vec<QuerySummaryDto>> {
    Json(
        state
            .dashboard
            .queries()
            .map(QuerySummaryDto::from)
            .collect(),
    )
}

pub async fn get_query_data(
    State(state): State<HttpState>,
    Path(name): Path<String>,
    view: Result<Query<ViewRequest>, QueryRejection>,
) -> Result<Json<QueryDataResponse>, ApiError> {
    let Query(request) = view.map_err(|rejection| {
        ApiError::bad_request("Invalid view parameters", Some(rejection.body_text()))
    })?;
    let view = state.dashboard.view(&name, &request)?;
    Ok(Json(QueryDataResponse::from(view)))
}

pub async fn refresh_query(
    State(state): State<HttpState>,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<RefreshAcceptedDto>), ApiError> {
    let handle = state.dashboard.request_refresh(&name)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(RefreshAcceptedDto {
            query: handle.query().to_string(),
            coalesced: handle.coalesced(),
        }),
    ))
}
