//! Cache store: last good result per registered query.
//!
//! Reads clone an entry out from under a short read lock; the payload is
//! shared through an `Arc`, so readers never wait on a refresh.
//! [`CacheStore::compare_and_swap`] is the only way to change an entry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use metrics::counter;
use time::OffsetDateTime;
use tracing::debug;

use crate::application::registry::QueryRegistry;

use super::clock::Clock;
use super::entry::{CacheEntry, EntryState};
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";
const METRIC_CACHE_READS: &str = "dashcache_cache_reads_total";

pub struct CacheStore {
    order: Vec<String>,
    max_staleness: HashMap<String, Duration>,
    entries: RwLock<HashMap<String, CacheEntry>>,
    clock: Arc<dyn Clock>,
}

impl CacheStore {
    /// One never-fetched slot per registered query.
    pub fn new(registry: &QueryRegistry, clock: Arc<dyn Clock>) -> Self {
        let order: Vec<String> = registry.names().map(str::to_string).collect();
        let max_staleness = registry
            .definitions()
            .map(|definition| (definition.name.clone(), definition.max_staleness))
            .collect();
        let entries = order
            .iter()
            .map(|name| (name.clone(), CacheEntry::never_fetched(name.clone())))
            .collect();

        Self {
            order,
            max_staleness,
            entries: RwLock::new(entries),
            clock,
        }
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    /// Current entry for `query`, with staleness applied. Unknown names yield
    /// a never-fetched sentinel.
    pub fn get(&self, query: &str) -> CacheEntry {
        let stored = rw_read(&self.entries, SOURCE, "get").get(query).cloned();
        let entry = match (stored, self.max_staleness.get(query)) {
            (Some(entry), Some(limit)) => entry.observed_at(self.clock.now(), *limit),
            (Some(entry), None) => entry,
            (None, _) => CacheEntry::never_fetched(query),
        };
        counter!(METRIC_CACHE_READS, "state" => entry.state.as_str()).increment(1);
        entry
    }

    /// Replace the entry for `query` if its fetch timestamp still equals
    /// `expected`.
    ///
    /// Also refuses a replacement whose fetch timestamp is older than the
    /// stored one, so readers never see time move backwards.
    pub fn compare_and_swap(
        &self,
        query: &str,
        expected: Option<OffsetDateTime>,
        replacement: CacheEntry,
    ) -> bool {
        let mut entries = rw_write(&self.entries, SOURCE, "compare_and_swap");
        let current = entries.get(query).and_then(|entry| entry.fetched_at);

        if current != expected {
            debug!(
                target = "dashcache::cache::store",
                query,
                ?current,
                ?expected,
                result = "superseded",
                "Compare-and-swap rejected"
            );
            return false;
        }

        let regresses = match (current, replacement.fetched_at) {
            (Some(current), Some(next)) => next < current,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if regresses {
            debug!(
                target = "dashcache::cache::store",
                query,
                ?current,
                next = ?replacement.fetched_at,
                result = "regressing_timestamp",
                "Compare-and-swap rejected"
            );
            return false;
        }

        entries.insert(query.to_string(), replacement);
        true
    }

    pub fn max_staleness(&self, query: &str) -> Option<Duration> {
        self.max_staleness.get(query).copied()
    }

    /// All registered entries in registration order, staleness applied.
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        let now = self.clock.now();
        let entries = rw_read(&self.entries, SOURCE, "snapshot");
        self.order
            .iter()
            .map(|name| {
                let entry = entries
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| CacheEntry::never_fetched(name.clone()));
                match self.max_staleness.get(name) {
                    Some(limit) => entry.observed_at(now, *limit),
                    None => entry,
                }
            })
            .collect()
    }

    /// True once every registered query has a payload to serve.
    pub fn all_have_data(&self) -> bool {
        let entries = rw_read(&self.entries, SOURCE, "all_have_data");
        self.order
            .iter()
            .all(|name| entries.get(name).is_some_and(CacheEntry::has_data))
    }

    pub fn count_in_state(&self, state: EntryState) -> usize {
        self.snapshot()
            .iter()
            .filter(|entry| entry.state == state)
            .count()
    }
}
