//! Refresh scheduler.
//!
//! Each query name is either idle or has exactly one refresh task in flight.
//! The in-flight table maps a name to the receiving side of a `watch` channel
//! that the running task publishes its outcome on; later requests for the
//! same name subscribe to that channel instead of starting a second task.
//!
//! A refresh reads the current fetch timestamp, runs the query with retries
//! (no shared lock held), and finishes with a single compare-and-swap.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use metrics::{counter, histogram};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::application::registry::{QueryRegistry, RegistryError};
use crate::application::repos::QueryExecutor;
use crate::domain::queries::{PreparedQuery, QueryDefinition};
use crate::domain::table::ResultSet;

use super::clock::Clock;
use super::config::RefreshConfig;
use super::entry::{CacheEntry, EntryState, RefreshFailure};
use super::error::RefreshError;
use super::store::CacheStore;

const METRIC_REFRESH_TOTAL: &str = "dashcache_refresh_total";
const METRIC_REFRESH_ATTEMPT_TOTAL: &str = "dashcache_refresh_attempt_total";
const METRIC_REFRESH_MS: &str = "dashcache_refresh_ms";
const METRIC_REFRESH_COALESCED_TOTAL: &str = "dashcache_refresh_coalesced_total";

/// How a refresh ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    Refreshed {
        rows: usize,
        fetched_at: OffsetDateTime,
        attempts: u32,
    },
    Failed(RefreshFailure),
    /// Another writer replaced the entry first; nothing was written.
    Superseded,
    Cancelled,
}

impl RefreshOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshOutcome::Refreshed { .. } => "refreshed",
            RefreshOutcome::Failed(_) => "failed",
            RefreshOutcome::Superseded => "superseded",
            RefreshOutcome::Cancelled => "cancelled",
        }
    }

    pub fn is_refreshed(&self) -> bool {
        matches!(self, RefreshOutcome::Refreshed { .. })
    }
}

type OutcomeReceiver = watch::Receiver<Option<RefreshOutcome>>;

/// Handle on a requested refresh. Dropping it does not cancel the refresh.
#[derive(Debug, Clone)]
pub struct RefreshHandle {
    query: String,
    coalesced: bool,
    outcome: OutcomeReceiver,
}

impl RefreshHandle {
    pub fn query(&self) -> &str {
        &self.query
    }

    /// True when the request joined a refresh that was already running.
    pub fn coalesced(&self) -> bool {
        self.coalesced
    }

    /// Wait for the single outcome shared by every requester of this refresh.
    pub async fn outcome(mut self) -> RefreshOutcome {
        match self.outcome.wait_for(Option::is_some).await {
            Ok(value) => match &*value {
                Some(outcome) => outcome.clone(),
                None => RefreshOutcome::Cancelled,
            },
            Err(_) => RefreshOutcome::Cancelled,
        }
    }
}

struct InFlightGuard {
    query: String,
    in_flight: Arc<DashMap<String, OutcomeReceiver>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.query);
    }
}

struct SchedulerInner {
    registry: Arc<QueryRegistry>,
    store: Arc<CacheStore>,
    executor: Arc<dyn QueryExecutor>,
    clock: Arc<dyn Clock>,
    config: RefreshConfig,
    in_flight: Arc<DashMap<String, OutcomeReceiver>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

#[derive(Clone)]
pub struct RefreshScheduler {
    inner: Arc<SchedulerInner>,
}

impl RefreshScheduler {
    pub fn new(
        registry: Arc<QueryRegistry>,
        store: Arc<CacheStore>,
        executor: Arc<dyn QueryExecutor>,
        clock: Arc<dyn Clock>,
        config: RefreshConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                registry,
                store,
                executor,
                clock,
                config,
                in_flight: Arc::new(DashMap::new()),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.inner.store
    }

    pub fn registry(&self) -> &Arc<QueryRegistry> {
        &self.inner.registry
    }

    pub fn executor(&self) -> &Arc<dyn QueryExecutor> {
        &self.inner.executor
    }

    pub fn is_refreshing(&self, query: &str) -> bool {
        self.inner.in_flight.contains_key(query)
    }

    /// Start a refresh of `query`, or join the one already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn request_refresh(&self, query: &str) -> Result<RefreshHandle, RegistryError> {
        self.inner.registry.lookup(query)?;

        if self.inner.shutdown.is_cancelled() {
            let (_, outcome) = watch::channel(Some(RefreshOutcome::Cancelled));
            return Ok(RefreshHandle {
                query: query.to_string(),
                coalesced: false,
                outcome,
            });
        }

        let sender = match self.inner.in_flight.entry(query.to_string()) {
            Entry::Occupied(running) => {
                counter!(METRIC_REFRESH_COALESCED_TOTAL, "query" => query.to_string())
                    .increment(1);
                debug!(
                    target = "dashcache::cache::scheduler",
                    query, "Joined in-flight refresh"
                );
                return Ok(RefreshHandle {
                    query: query.to_string(),
                    coalesced: true,
                    outcome: running.get().clone(),
                });
            }
            Entry::Vacant(slot) => {
                let (sender, receiver) = watch::channel(None);
                slot.insert(receiver);
                sender
            }
        };
        let outcome = sender.subscribe();

        let guard = InFlightGuard {
            query: query.to_string(),
            in_flight: Arc::clone(&self.inner.in_flight),
        };
        let inner = Arc::clone(&self.inner);
        let name = query.to_string();
        self.inner.tasks.spawn(async move {
            let result = inner.refresh(&name).await;
            drop(guard);
            let _ = sender.send(Some(result));
        });

        Ok(RefreshHandle {
            query: query.to_string(),
            coalesced: false,
            outcome,
        })
    }

    /// Request a refresh of every registered query.
    pub fn warm_up(&self) -> Vec<RefreshHandle> {
        let names: Vec<String> = self.inner.registry.names().map(str::to_string).collect();
        info!(
            target = "dashcache::cache::scheduler",
            queries = names.len(),
            "Warming cache"
        );
        names
            .iter()
            .filter_map(|name| self.request_refresh(name).ok())
            .collect()
    }

    /// One sweep of the periodic timer: refresh entries that are stale, never
    /// fetched, or failed longer ago than their staleness limit.
    pub fn tick(&self) -> Vec<RefreshHandle> {
        let now = self.inner.clock.now();
        let due: Vec<String> = self
            .inner
            .registry
            .definitions()
            .filter(|definition| !self.is_refreshing(&definition.name))
            .filter(|definition| is_due(&self.inner.store.get(&definition.name), definition, now))
            .map(|definition| definition.name.clone())
            .collect();

        if !due.is_empty() {
            debug!(
                target = "dashcache::cache::scheduler",
                due = ?due,
                "Periodic refresh sweep"
            );
        }
        due.iter()
            .filter_map(|name| self.request_refresh(name).ok())
            .collect()
    }

    /// Drive [`Self::tick`] on the configured interval until shutdown.
    pub async fn run_periodic(&self) {
        let mut interval = tokio::time::interval(self.inner.config.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.tick();
                }
            }
        }
        debug!(
            target = "dashcache::cache::scheduler",
            "Periodic refresh loop stopped"
        );
    }

    /// Cancel in-flight refreshes and wait for their tasks to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!(
            target = "dashcache::cache::scheduler",
            "Refresh scheduler stopped"
        );
    }
}

fn is_due(entry: &CacheEntry, definition: &QueryDefinition, now: OffsetDateTime) -> bool {
    match entry.state {
        EntryState::NeverFetched | EntryState::Stale => true,
        EntryState::Fresh => false,
        EntryState::Failed => entry.last_attempt_at.is_none_or(|at| {
            (now - at).whole_milliseconds()
                >= i128::try_from(definition.max_staleness.as_millis()).unwrap_or(i128::MAX)
        }),
    }
}

impl SchedulerInner {
    #[instrument(skip(self), fields(query = %query))]
    async fn refresh(&self, query: &str) -> RefreshOutcome {
        let started_at = Instant::now();
        let expected = self.store.get(query).fetched_at;

        let outcome = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => RefreshOutcome::Cancelled,
            outcome = self.refresh_with_retry(query, expected) => outcome,
        };

        let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;
        counter!(
            METRIC_REFRESH_TOTAL,
            "query" => query.to_string(),
            "outcome" => outcome.as_str()
        )
        .increment(1);
        histogram!(METRIC_REFRESH_MS, "query" => query.to_string()).record(elapsed_ms);

        match &outcome {
            RefreshOutcome::Refreshed { rows, attempts, .. } => info!(
                target = "dashcache::cache::scheduler",
                query,
                rows,
                attempts,
                elapsed_ms,
                "Refresh completed"
            ),
            RefreshOutcome::Failed(failure) if failure.transient => warn!(
                target = "dashcache::cache::scheduler",
                query,
                kind = failure.kind,
                attempts = failure.attempts,
                error = %failure.message,
                "Refresh failed after retries; serving previous data"
            ),
            RefreshOutcome::Failed(failure) => error!(
                target = "dashcache::cache::scheduler",
                query,
                kind = failure.kind,
                attempts = failure.attempts,
                error = %failure.message,
                "Refresh failed"
            ),
            RefreshOutcome::Superseded => debug!(
                target = "dashcache::cache::scheduler",
                query, "Refresh superseded by a newer entry"
            ),
            RefreshOutcome::Cancelled => info!(
                target = "dashcache::cache::scheduler",
                query, "Refresh cancelled"
            ),
        }

        outcome
    }

    async fn refresh_with_retry(
        &self,
        query: &str,
        expected: Option<OffsetDateTime>,
    ) -> RefreshOutcome {
        let (definition, prepared) = match self.prepare(query) {
            Ok(prepared) => prepared,
            Err(err) => return self.record_failure(query, expected, err.into(), 1),
        };

        let policy = self.config.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            counter!(METRIC_REFRESH_ATTEMPT_TOTAL, "query" => query.to_string()).increment(1);

            let result = self
                .executor
                .run(&prepared)
                .await
                .map_err(RefreshError::from)
                .and_then(|result| check_shape(definition, result));

            match result {
                Ok(result) => return self.record_success(query, expected, result, attempt),
                Err(err) if err.is_transient() && policy.allows_retry_after(attempt) => {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        target = "dashcache::cache::scheduler",
                        query,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient refresh failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return self.record_failure(query, expected, err, attempt),
            }
        }
    }

    fn prepare(&self, query: &str) -> Result<(&QueryDefinition, PreparedQuery), RegistryError> {
        let definition = self.registry.lookup(query)?;
        let prepared = self.registry.prepare_default(query)?;
        Ok((definition, prepared))
    }

    fn record_success(
        &self,
        query: &str,
        expected: Option<OffsetDateTime>,
        result: ResultSet,
        attempts: u32,
    ) -> RefreshOutcome {
        let now = self.clock.now();
        let fetched_at = expected.map_or(now, |previous| now.max(previous));
        let rows = result.len();

        if self.store.compare_and_swap(
            query,
            expected,
            CacheEntry::fresh(query, result, fetched_at),
        ) {
            RefreshOutcome::Refreshed {
                rows,
                fetched_at,
                attempts,
            }
        } else {
            RefreshOutcome::Superseded
        }
    }

    fn record_failure(
        &self,
        query: &str,
        expected: Option<OffsetDateTime>,
        err: RefreshError,
        attempts: u32,
    ) -> RefreshOutcome {
        let failure = RefreshFailure {
            kind: err.kind(),
            message: err.to_string(),
            attempts,
            transient: err.is_transient(),
            at: self.clock.now(),
        };
        let current = self.store.get(query);
        if current.fetched_at != expected {
            return RefreshOutcome::Superseded;
        }

        if self
            .store
            .compare_and_swap(query, expected, current.into_failed(failure.clone()))
        {
            RefreshOutcome::Failed(failure)
        } else {
            RefreshOutcome::Superseded
        }
    }
}

fn check_shape(definition: &QueryDefinition, result: ResultSet) -> Result<ResultSet, RefreshError> {
    let missing: Vec<&str> = definition
        .expected_columns
        .iter()
        .filter(|column| result.column_index(column).is_none())
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        Ok(result)
    } else {
        Err(RefreshError::SchemaMismatch {
            query: definition.name.clone(),
            missing: missing.join(", "),
        })
    }
}
