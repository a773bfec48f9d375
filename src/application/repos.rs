//! Executor traits describing database adapters.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::queries::PreparedQuery;
use crate::domain::table::ResultSet;

/// Whether a failed query may succeed if simply tried again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Fatal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Transient => f.write_str("transient"),
            ErrorClass::Fatal => f.write_str("fatal"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DbError {
    #[error("no pooled connection became available within {waited_ms} ms")]
    PoolExhausted { waited_ms: u64 },
    #[error("connection error: {message}")]
    Connection { message: String },
    #[error("{class} query error{}: {message}", code_suffix(.code))]
    Query {
        class: ErrorClass,
        code: Option<u32>,
        message: String,
    },
}

fn code_suffix(code: &Option<u32>) -> String {
    code.map(|code| format!(" {code}")).unwrap_or_default()
}

impl DbError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn transient(code: Option<u32>, message: impl Into<String>) -> Self {
        Self::Query {
            class: ErrorClass::Transient,
            code,
            message: message.into(),
        }
    }

    pub fn fatal(code: Option<u32>, message: impl Into<String>) -> Self {
        Self::Query {
            class: ErrorClass::Fatal,
            code,
            message: message.into(),
        }
    }

    /// Pool exhaustion and connection failures are always worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            DbError::PoolExhausted { .. } | DbError::Connection { .. } => true,
            DbError::Query { class, .. } => *class == ErrorClass::Transient,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DbError::PoolExhausted { .. } => "pool_exhausted",
            DbError::Connection { .. } => "connection",
            DbError::Query { .. } => "query",
        }
    }
}

/// Occupancy of the connection pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatus {
    pub max_connections: u32,
    pub in_use: u32,
    pub idle: u32,
}

/// Runs prepared queries against the backing database.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn run(&self, query: &PreparedQuery) -> Result<ResultSet, DbError>;

    async fn health_check(&self) -> Result<(), DbError> {
        Ok(())
    }

    fn pool_status(&self) -> PoolStatus {
        PoolStatus::default()
    }
}
