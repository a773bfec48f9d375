//! Shared fixtures: an in-memory executor and small result sets.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashcache::application::registry::QueryRegistry;
use dashcache::application::repos::{DbError, PoolStatus, QueryExecutor};
use dashcache::cache::{CacheStore, Clock, RefreshConfig, RefreshScheduler, RetryPolicy};
use dashcache::domain::queries::{PreparedQuery, QueryDefinition};
use dashcache::domain::table::{CellValue, ResultSet, Row};
use time::OffsetDateTime;
use time::macros::datetime;
use tokio::sync::Semaphore;

pub type Step = Result<ResultSet, DbError>;

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: time::Duration) {
        *self.now.lock().expect("clock lock") += by;
    }

    pub fn set(&self, at: OffsetDateTime) {
        *self.now.lock().expect("clock lock") = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().expect("clock lock")
    }
}

/// Replays scripted results in order; the last one repeats once the script
/// runs out.
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<Step>>,
    last: Mutex<Option<Step>>,
    calls: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
    clock: Option<(Arc<ManualClock>, time::Duration)>,
    healthy: bool,
}

impl ScriptedExecutor {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            script: Mutex::new(steps.into_iter().collect()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
            gate: None,
            clock: None,
            healthy: true,
        }
    }

    /// Block every execution until a permit is added to `gate`.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Advance `clock` by `duration` while each query "runs".
    pub fn taking(mut self, clock: Arc<ManualClock>, duration: time::Duration) -> Self {
        self.clock = Some((clock, duration));
        self
    }

    pub fn unhealthy(mut self) -> Self {
        self.healthy = false;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        let next = self.script.lock().expect("script lock").pop_front();
        let mut last = self.last.lock().expect("last lock");
        match next {
            Some(step) => {
                *last = Some(step.clone());
                step
            }
            None => last
                .clone()
                .unwrap_or_else(|| Err(DbError::connection("script exhausted"))),
        }
    }
}

#[async_trait]
impl QueryExecutor for ScriptedExecutor {
    async fn run(&self, _query: &PreparedQuery) -> Result<ResultSet, DbError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate open").forget();
        }
        if let Some((clock, duration)) = &self.clock {
            clock.advance(*duration);
        }
        self.next_step()
    }

    async fn health_check(&self) -> Result<(), DbError> {
        if self.healthy {
            Ok(())
        } else {
            Err(DbError::connection("server unreachable"))
        }
    }

    fn pool_status(&self) -> PoolStatus {
        PoolStatus {
            max_connections: 4,
            in_use: 0,
            idle: 1,
        }
    }
}

pub fn start_time() -> time::OffsetDateTime {
    datetime!(2024-05-01 08:00:00 UTC)
}

pub fn sales_by_region(max_staleness_secs: u64) -> QueryDefinition {
    QueryDefinition {
        name: "sales_by_region".to_string(),
        sql: "SELECT region, total FROM dbo.SalesByRegion".to_string(),
        params: Vec::new(),
        max_staleness: Duration::from_secs(max_staleness_secs),
        arguments: BTreeMap::new(),
        expected_columns: vec!["region".to_string(), "total".to_string()],
    }
}

/// A `region, total` result with `rows` rows.
pub fn regions(rows: usize) -> ResultSet {
    ResultSet::new(
        vec!["region".to_string(), "total".to_string()],
        (0..rows)
            .map(|index| {
                Row::new(vec![
                    CellValue::Text(format!("region-{index}")),
                    CellValue::Int(100 * (index as i64 + 1)),
                ])
            })
            .collect(),
    )
    .expect("valid result set")
}

pub fn fast_retries() -> RefreshConfig {
    RefreshConfig {
        tick: Duration::from_secs(15),
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: 0.0,
        },
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub executor: Arc<ScriptedExecutor>,
    pub scheduler: RefreshScheduler,
}

impl Harness {
    pub fn new(
        definitions: Vec<QueryDefinition>,
        clock: Arc<ManualClock>,
        executor: ScriptedExecutor,
    ) -> Self {
        let registry = Arc::new(QueryRegistry::from_definitions(definitions).expect("registry"));
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let store = Arc::new(CacheStore::new(&registry, Arc::clone(&dyn_clock)));
        let executor = Arc::new(executor);
        let scheduler = RefreshScheduler::new(
            registry,
            store,
            executor.clone(),
            dyn_clock,
            fast_retries(),
        );
        Self {
            clock,
            executor,
            scheduler,
        }
    }
}
