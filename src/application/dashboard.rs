//! Dashboard adapter: the read side used by request handlers.
//!
//! Every read is served from the cache store. Reads that find a stale or
//! never-fetched entry nudge the scheduler but never wait for it.

use std::sync::Arc;

use tracing::debug;

use crate::application::registry::{QueryRegistry, RegistryError};
use crate::application::repos::{DbError, PoolStatus};
use crate::application::view::{TableView, ViewRequest};
use crate::cache::{CacheEntry, EntryState, RefreshHandle, RefreshScheduler};
use crate::domain::queries::QueryDefinition;

/// Cached data for one query plus the requested view over it.
#[derive(Debug, Clone)]
pub struct DashboardView {
    pub entry: CacheEntry,
    /// `None` until the first successful fetch.
    pub table: Option<TableView>,
}

#[derive(Debug, Clone)]
pub struct QueryStatus {
    pub entry: CacheEntry,
    pub refreshing: bool,
}

#[derive(Debug, Clone)]
pub struct DashboardStatus {
    pub queries: Vec<QueryStatus>,
    pub pool: PoolStatus,
}

impl DashboardStatus {
    /// Healthy when no query is in the failed state.
    pub fn is_healthy(&self) -> bool {
        self.queries
            .iter()
            .all(|query| query.entry.state != EntryState::Failed)
    }
}

#[derive(Clone)]
pub struct DashboardService {
    scheduler: RefreshScheduler,
}

impl DashboardService {
    pub fn new(scheduler: RefreshScheduler) -> Self {
        Self { scheduler }
    }

    pub fn registry(&self) -> &Arc<QueryRegistry> {
        self.scheduler.registry()
    }

    pub fn queries(&self) -> impl Iterator<Item = &QueryDefinition> {
        self.scheduler.registry().definitions()
    }

    /// Best available data for `query`, never blocking on the database.
    pub fn get_data(&self, query: &str) -> Result<CacheEntry, RegistryError> {
        self.registry().lookup(query)?;
        let entry = self.scheduler.store().get(query);

        if matches!(entry.state, EntryState::Stale | EntryState::NeverFetched)
            && !self.scheduler.is_refreshing(query)
        {
            debug!(
                target = "dashcache::application::dashboard",
                query,
                state = %entry.state,
                "Read found outdated entry; requesting refresh"
            );
            self.scheduler.request_refresh(query)?;
        }

        Ok(entry)
    }

    pub fn view(&self, query: &str, request: &ViewRequest) -> Result<DashboardView, RegistryError> {
        let entry = self.get_data(query)?;
        let table = entry
            .payload
            .clone()
            .map(|payload| TableView::apply(payload, request));
        Ok(DashboardView { entry, table })
    }

    /// Fire-and-forget refresh; the handle may be dropped.
    pub fn request_refresh(&self, query: &str) -> Result<RefreshHandle, RegistryError> {
        self.scheduler.request_refresh(query)
    }

    pub fn status(&self) -> DashboardStatus {
        let queries = self
            .scheduler
            .store()
            .snapshot()
            .into_iter()
            .map(|entry| QueryStatus {
                refreshing: self.scheduler.is_refreshing(&entry.query),
                entry,
            })
            .collect();
        DashboardStatus {
            queries,
            pool: self.scheduler.executor().pool_status(),
        }
    }

    /// Ready once every registered query has data to serve.
    pub fn is_ready(&self) -> bool {
        self.scheduler.store().all_have_data()
    }

    pub async fn check_database(&self) -> Result<(), DbError> {
        self.scheduler.executor().health_check().await
    }
}
