//! Wire types for the dashcache JSON surface.
//!
//! These are shared between the server and any dashboard front end that
//! consumes cached query results over HTTP.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

/// Freshness of a cached query result as reported to readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStateDto {
    NeverFetched,
    Fresh,
    Stale,
    Failed,
}

impl CacheStateDto {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NeverFetched => "never_fetched",
            Self::Fresh => "fresh",
            Self::Stale => "stale",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshErrorDto {
    pub kind: String,
    pub message: String,
    pub attempts: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

/// Cached data for one query, optionally filtered and sorted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryDataResponse {
    pub query: String,
    pub state: CacheStateDto,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_updated: Option<OffsetDateTime>,
    pub columns: Vec<String>,
    pub records: Vec<Map<String, Value>>,
    /// Row count of the cached payload before any view filter was applied.
    pub total_rows: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<RefreshErrorDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshAcceptedDto {
    pub query: String,
    pub coalesced: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamDto {
    pub name: String,
    pub kind: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySummaryDto {
    pub name: String,
    pub params: Vec<ParamDto>,
    pub max_staleness_seconds: u64,
    pub expected_columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryStatusDto {
    pub query: String,
    pub state: CacheStateDto,
    pub refreshing: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_updated: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_attempt: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<RefreshErrorDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatusDto {
    pub max_connections: u32,
    pub in_use: u32,
    pub idle: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    /// `ok` when no query is failed, `degraded` otherwise.
    pub status: String,
    pub queries: Vec<QueryStatusDto>,
    pub pool: PoolStatusDto,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_state_serializes_snake_case() {
        let value = serde_json::to_value(CacheStateDto::NeverFetched).expect("serialize");
        assert_eq!(value, Value::String("never_fetched".to_string()));
        assert_eq!(CacheStateDto::Stale.as_str(), "stale");
    }

    #[test]
    fn data_response_omits_empty_optionals() {
        let response = QueryDataResponse {
            query: "sales_by_region".to_string(),
            state: CacheStateDto::NeverFetched,
            last_updated: None,
            columns: Vec::new(),
            records: Vec::new(),
            total_rows: 0,
            message: None,
            last_error: None,
        };
        let value = serde_json::to_value(&response).expect("serialize");
        assert!(value.get("message").is_none());
        assert!(value.get("last_error").is_none());
        assert_eq!(value["last_updated"], Value::Null);
    }
}
