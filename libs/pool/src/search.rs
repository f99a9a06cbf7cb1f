//! Inventory search with retries for index lag.
//!
//! The inventory index is updated asynchronously, so a search issued right
//! after a write can come back empty even though matching machines exist.
//! [`RetrySearch`] re-issues empty searches a bounded number of times.
//!
//! An empty final result is ambiguous: the index may still be catching up,
//! or nothing matches. The ambiguity is surfaced explicitly as
//! [`SearchOutcome::Exhausted`] (or [`PoolError::SearchExhausted`] from
//! [`RetrySearch::search`]) and never as an ordinary empty list. Service
//! errors are not retried.

use std::sync::Arc;
use std::time::Duration;

use rigpool_clients::InventoryClient;
use rigpool_model::{MachineRecord, Query};
use tracing::{debug, instrument, warn};

use crate::error::{PoolError, PoolResult};

/// Retry budget for index searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchPolicy {
    /// Total number of search attempts.
    pub max_tries: u32,

    /// Wait between consecutive empty attempts.
    pub interval: Duration,
}

impl Default for SearchPolicy {
    fn default() -> Self {
        Self {
            max_tries: DEFAULT_SEARCH_TRIES,
            interval: DEFAULT_SEARCH_INTERVAL,
        }
    }
}

/// Default number of search attempts.
pub const DEFAULT_SEARCH_TRIES: u32 = 10;

/// Default wait between empty search attempts.
pub const DEFAULT_SEARCH_INTERVAL: Duration = Duration::from_secs(10);

/// Result of a retried search.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome {
    /// The first non-empty result set.
    Found(Vec<MachineRecord>),

    /// Every attempt came back empty.
    Exhausted { attempts: u32 },
}

impl SearchOutcome {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }

    /// Records found, treating exhaustion as "no matches".
    pub fn into_records(self) -> Vec<MachineRecord> {
        match self {
            Self::Found(records) => records,
            Self::Exhausted { .. } => Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct RetrySearch {
    inventory: Arc<dyn InventoryClient>,
    policy: SearchPolicy,
}

impl RetrySearch {
    pub fn new(inventory: Arc<dyn InventoryClient>, policy: SearchPolicy) -> Self {
        Self { inventory, policy }
    }

    pub fn policy(&self) -> SearchPolicy {
        self.policy
    }

    /// Search with the configured policy, failing with `SearchExhausted`.
    pub async fn search(&self, query: &Query) -> PoolResult<Vec<MachineRecord>> {
        self.search_with(query, self.policy.max_tries, self.policy.interval)
            .await
    }

    /// Search with an explicit budget, failing with `SearchExhausted`.
    pub async fn search_with(
        &self,
        query: &Query,
        max_tries: u32,
        interval: Duration,
    ) -> PoolResult<Vec<MachineRecord>> {
        match self.outcome_with(query, max_tries, interval).await? {
            SearchOutcome::Found(records) => Ok(records),
            SearchOutcome::Exhausted { attempts } => Err(PoolError::SearchExhausted {
                query: query.to_string(),
                attempts,
            }),
        }
    }

    /// Search with the configured policy, returning the typed outcome.
    pub async fn outcome(&self, query: &Query) -> PoolResult<SearchOutcome> {
        self.outcome_with(query, self.policy.max_tries, self.policy.interval)
            .await
    }

    #[instrument(skip(self, query), fields(query = %query))]
    pub async fn outcome_with(
        &self,
        query: &Query,
        max_tries: u32,
        interval: Duration,
    ) -> PoolResult<SearchOutcome> {
        let mut attempts = 0;

        while attempts < max_tries {
            let records = self.inventory.query(query).await?;
            attempts += 1;

            if !records.is_empty() {
                debug!(attempts, count = records.len(), "Search returned results");
                return Ok(SearchOutcome::Found(records));
            }

            if attempts < max_tries {
                debug!(
                    attempts,
                    remaining = max_tries - attempts,
                    interval_secs = interval.as_secs_f64(),
                    "Search returned nothing, waiting for index"
                );
                tokio::time::sleep(interval).await;
            }
        }

        warn!(attempts, "Search exhausted retries with no results");
        Ok(SearchOutcome::Exhausted { attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rigpool_clients::MemoryInventory;

    fn search(inventory: &Arc<MemoryInventory>, max_tries: u32) -> RetrySearch {
        RetrySearch::new(
            Arc::clone(inventory) as Arc<dyn InventoryClient>,
            SearchPolicy {
                max_tries,
                interval: Duration::from_secs(10),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_backend_performs_exactly_max_tries() {
        let inventory = Arc::new(MemoryInventory::new());
        let started = tokio::time::Instant::now();

        let outcome = search(&inventory, 4)
            .outcome(&Query::pool("centos"))
            .await
            .unwrap();

        assert_eq!(outcome, SearchOutcome::Exhausted { attempts: 4 });
        assert_eq!(inventory.query_count(), 4);
        // Waits only between attempts, never after the last one.
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_signals_exhaustion_as_error() {
        let inventory = Arc::new(MemoryInventory::new());

        let err = search(&inventory, 3)
            .search(&Query::pool("centos"))
            .await
            .unwrap_err();

        match err {
            PoolError::SearchExhausted { query, attempts } => {
                assert_eq!(query, "name:qa-centos-pool*");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(inventory.query_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_first_non_empty_result() {
        let inventory = Arc::new(MemoryInventory::new());
        inventory.insert_machine(MachineRecord::new("qa-centos-pool1", "10.0.0.1"));
        inventory.set_stale_searches(2);

        let records = search(&inventory, 10)
            .search(&Query::pool("centos"))
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(inventory.query_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_errors_are_not_retried() {
        let inventory = Arc::new(MemoryInventory::new());
        inventory.set_fail_searches(true);

        let err = search(&inventory, 5)
            .outcome(&Query::pool("centos"))
            .await
            .unwrap_err();

        assert!(matches!(err, PoolError::Client(_)));
        assert_eq!(inventory.query_count(), 1);
    }

    #[tokio::test]
    async fn test_zero_tries_makes_no_attempts() {
        let inventory = Arc::new(MemoryInventory::new());
        let outcome = search(&inventory, 0)
            .outcome(&Query::pool("centos"))
            .await
            .unwrap();

        assert!(outcome.is_exhausted());
        assert_eq!(inventory.query_count(), 0);
    }
}
