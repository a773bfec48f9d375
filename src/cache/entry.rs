//! Cache entries and their freshness states.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;

use crate::domain::table::ResultSet;

/// Freshness of a cached query result as seen by a reader.
///
/// Only `NeverFetched`, `Fresh` and `Failed` are ever stored; `Stale` is
/// derived on read from the fetch timestamp and the query's staleness limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    NeverFetched,
    Fresh,
    Stale,
    Failed,
}

impl EntryState {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryState::NeverFetched => "never_fetched",
            EntryState::Fresh => "fresh",
            EntryState::Stale => "stale",
            EntryState::Failed => "failed",
        }
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the most recent refresh did not produce a new payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshFailure {
    pub kind: &'static str,
    pub message: String,
    pub attempts: u32,
    pub transient: bool,
    pub at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub query: String,
    pub state: EntryState,
    pub payload: Option<Arc<ResultSet>>,
    pub fetched_at: Option<OffsetDateTime>,
    pub last_attempt_at: Option<OffsetDateTime>,
    pub last_error: Option<RefreshFailure>,
}

impl CacheEntry {
    pub fn never_fetched(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            state: EntryState::NeverFetched,
            payload: None,
            fetched_at: None,
            last_attempt_at: None,
            last_error: None,
        }
    }

    pub fn fresh(query: impl Into<String>, payload: ResultSet, fetched_at: OffsetDateTime) -> Self {
        Self {
            query: query.into(),
            state: EntryState::Fresh,
            payload: Some(Arc::new(payload)),
            fetched_at: Some(fetched_at),
            last_attempt_at: Some(fetched_at),
            last_error: None,
        }
    }

    /// Same payload and fetch timestamp, marked failed with `failure`.
    pub fn into_failed(self, failure: RefreshFailure) -> Self {
        Self {
            state: EntryState::Failed,
            last_attempt_at: Some(failure.at),
            last_error: Some(failure),
            ..self
        }
    }

    pub fn has_data(&self) -> bool {
        self.payload.is_some()
    }

    pub fn row_count(&self) -> usize {
        self.payload.as_ref().map_or(0, |payload| payload.len())
    }

    /// Age of the payload at `now`, if there is one.
    pub fn age_at(&self, now: OffsetDateTime) -> Option<time::Duration> {
        self.fetched_at.map(|fetched_at| now - fetched_at)
    }

    pub(crate) fn exceeds(&self, now: OffsetDateTime, max_staleness: Duration) -> bool {
        self.age_at(now).is_some_and(|age| {
            age.whole_milliseconds() > i128::try_from(max_staleness.as_millis()).unwrap_or(i128::MAX)
        })
    }

    /// Entry as reported to readers at `now`.
    pub(crate) fn observed_at(mut self, now: OffsetDateTime, max_staleness: Duration) -> Self {
        if self.state == EntryState::Fresh && self.exceeds(now, max_staleness) {
            self.state = EntryState::Stale;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    fn payload() -> ResultSet {
        ResultSet::new(vec!["region".to_string()], Vec::new()).expect("valid set")
    }

    #[test]
    fn fresh_entry_turns_stale_after_limit() {
        let fetched = datetime!(2024-05-01 08:00:00 UTC);
        let entry = CacheEntry::fresh("sales_by_region", payload(), fetched);

        let at_limit = entry
            .clone()
            .observed_at(fetched + time::Duration::seconds(60), Duration::from_secs(60));
        assert_eq!(at_limit.state, EntryState::Fresh);

        let past_limit = entry.observed_at(
            fetched + time::Duration::seconds(90),
            Duration::from_secs(60),
        );
        assert_eq!(past_limit.state, EntryState::Stale);
        assert!(past_limit.has_data());
    }

    #[test]
    fn failed_entry_keeps_payload_and_timestamp() {
        let fetched = datetime!(2024-05-01 08:00:00 UTC);
        let failed_at = datetime!(2024-05-01 08:05:00 UTC);
        let entry = CacheEntry::fresh("sales_by_region", payload(), fetched).into_failed(
            RefreshFailure {
                kind: "connection",
                message: "connection refused".to_string(),
                attempts: 3,
                transient: true,
                at: failed_at,
            },
        );

        assert_eq!(entry.state, EntryState::Failed);
        assert_eq!(entry.fetched_at, Some(fetched));
        assert_eq!(entry.last_attempt_at, Some(failed_at));
        assert!(entry.has_data());
        assert_eq!(
            entry.clone().observed_at(failed_at, Duration::from_secs(1)).state,
            EntryState::Failed
        );
    }
}
