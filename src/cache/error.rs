use thiserror::Error;

use crate::application::registry::RegistryError;
use crate::application::repos::DbError;

#[derive(Debug, Clone, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Database(#[from] DbError),
    #[error("result of `{query}` is missing expected column(s): {missing}")]
    SchemaMismatch { query: String, missing: String },
}

impl RefreshError {
    /// Only database failures classified as transient are retried.
    pub fn is_transient(&self) -> bool {
        match self {
            RefreshError::Database(err) => err.is_transient(),
            RefreshError::Registry(_) | RefreshError::SchemaMismatch { .. } => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RefreshError::Registry(err) => err.kind(),
            RefreshError::Database(err) => err.kind(),
            RefreshError::SchemaMismatch { .. } => "schema_mismatch",
        }
    }
}
