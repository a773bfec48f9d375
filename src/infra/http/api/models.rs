use dashcache_api_types::{
    CacheStateDto, ParamDto, PoolStatusDto, QueryDataResponse, QueryStatusDto, QuerySummaryDto,
    RefreshErrorDto, StatusResponse,
};

use crate::application::dashboard::{DashboardStatus, DashboardView, QueryStatus};
use crate::application::repos::PoolStatus;
use crate::application::view::NO_DATA_YET_MESSAGE;
use crate::cache::{EntryState, RefreshFailure};
use crate::domain::queries::QueryDefinition;

pub fn state_dto(state: EntryState) -> CacheStateDto {
    match state {
        EntryState::NeverFetched => CacheStateDto::NeverFetched,
        EntryState::Fresh => CacheStateDto::Fresh,
        EntryState::Stale => CacheStateDto::Stale,
        EntryState::Failed => CacheStateDto::Failed,
    }
}

impl From<&RefreshFailure> for RefreshErrorDto {
    fn from(failure: &RefreshFailure) -> Self {
        Self {
            kind: failure.kind.to_string(),
            message: failure.message.clone(),
            attempts: failure.attempts,
            at: failure.at,
        }
    }
}

impl From<&QueryDefinition> for QuerySummaryDto {
    fn from(definition: &QueryDefinition) -> Self {
        Self {
            name: definition.name.clone(),
            params: definition
                .params
                .iter()
                .map(|param| ParamDto {
                    name: param.name.clone(),
                    kind: param.kind.as_str().to_string(),
                    nullable: param.nullable,
                })
                .collect(),
            max_staleness_seconds: definition.max_staleness.as_secs(),
            expected_columns: definition.expected_columns.clone(),
        }
    }
}

impl From<DashboardView> for QueryDataResponse {
    fn from(view: DashboardView) -> Self {
        let entry = view.entry;
        let last_error = entry.last_error.as_ref().map(RefreshErrorDto::from);
        match view.table {
            Some(table) => Self {
                query: entry.query,
                state: state_dto(entry.state),
                last_updated: entry.fetched_at,
                columns: table.columns().to_vec(),
                records: table.records(),
                total_rows: table.total_rows(),
                message: table.message().map(str::to_string),
                last_error,
            },
            None => Self {
                query: entry.query,
                state: state_dto(entry.state),
                last_updated: None,
                columns: Vec::new(),
                records: Vec::new(),
                total_rows: 0,
                message: Some(NO_DATA_YET_MESSAGE.to_string()),
                last_error,
            },
        }
    }
}

impl From<&QueryStatus> for QueryStatusDto {
    fn from(status: &QueryStatus) -> Self {
        let entry = &status.entry;
        Self {
            query: entry.query.clone(),
            state: state_dto(entry.state),
            refreshing: status.refreshing,
            last_updated: entry.fetched_at,
            last_attempt: entry.last_attempt_at,
            rows: entry.payload.as_ref().map(|payload| payload.len()),
            last_error: entry.last_error.as_ref().map(RefreshErrorDto::from),
        }
    }
}

impl From<PoolStatus> for PoolStatusDto {
    fn from(pool: PoolStatus) -> Self {
        Self {
            max_connections: pool.max_connections,
            in_use: pool.in_use,
            idle: pool.idle,
        }
    }
}

impl From<&DashboardStatus> for StatusResponse {
    fn from(status: &DashboardStatus) -> Self {
        Self {
            status: if status.is_healthy() { "ok" } else { "degraded" }.to_string(),
            queries: status.queries.iter().map(QueryStatusDto::from).collect(),
            pool: status.pool.into(),
        }
    }
}
