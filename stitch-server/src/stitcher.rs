//! The stitching loop: batched, transactional identity resolution.
//!
//! A fixed pool of workers each repeatedly pulls a locked batch of
//! unprocessed events inside a transaction, resolves every event against the
//! current profiles (create / enrich / merge), marks it processed, and
//! commits. All coordination between workers flows through the store's row
//! locks; the workers share no in-process state.

use std::sync::Arc;
use std::time::Duration;

use stitch_core::health::{HealthHandle, HealthRegistry};
use stitch_core::store::StitchStore;
use stitch_core::types::EventRecord;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long a worker may go without reporting before liveness flags it.
const LIVENESS_DEADLINE: Duration = Duration::from_secs(30);

/// Batch-fatal errors. Per-event failures are logged and skipped instead;
/// they never surface here.
#[derive(Error, Debug)]
pub enum StitchError {
    #[error("failed to begin stitching transaction: {0}")]
    Begin(stitch_core::error::StoreError),
    #[error("failed to fetch unprocessed events: {0}")]
    Fetch(stitch_core::error::StoreError),
    #[error("failed to commit stitching transaction: {0}")]
    Commit(stitch_core::error::StoreError),
    #[error("failed to roll back stitching transaction: {0}")]
    Rollback(stitch_core::error::StoreError),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct BatchOutcome {
    fetched: usize,
    created: usize,
    enriched: usize,
    merged: usize,
    skipped: usize,
}

enum EventOutcome {
    Created,
    Enriched,
    Merged,
}

pub struct StitchingService<S> {
    store: Arc<S>,
    interval: Duration,
    workers: usize,
    batch_size: usize,
}

impl<S> Clone for StitchingService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            interval: self.interval,
            workers: self.workers,
            batch_size: self.batch_size,
        }
    }
}

impl<S: StitchStore + 'static> StitchingService<S> {
    pub fn new(store: Arc<S>, interval: Duration, workers: usize, batch_size: usize) -> Self {
        Self {
            store,
            interval,
            workers,
            batch_size,
        }
    }

    /// Spawn the worker pool. Each worker registers with the health registry
    /// and runs until the token is cancelled.
    pub fn start(
        &self,
        token: &CancellationToken,
        registry: &HealthRegistry,
    ) -> Vec<JoinHandle<()>> {
        (0..self.workers)
            .map(|worker| {
                let service = self.clone();
                let token = token.clone();
                let liveness =
                    registry.register(&format!("stitcher-{worker}"), LIVENESS_DEADLINE);
                tokio::spawn(async move { service.worker_loop(worker, token, liveness).await })
            })
            .collect()
    }

    async fn worker_loop(self, worker: usize, token: CancellationToken, liveness: HealthHandle) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(worker, "stitch worker started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }
            liveness.report_healthy();

            match self.run_one_batch(&token).await {
                Ok(outcome) if outcome.fetched > 0 => {
                    info!(
                        worker,
                        fetched = outcome.fetched,
                        created = outcome.created,
                        enriched = outcome.enriched,
                        merged = outcome.merged,
                        skipped = outcome.skipped,
                        "stitched batch"
                    );
                }
                Ok(_) => {}
                Err(error) => {
                    // The batch rolled back; those events stay unprocessed
                    // and are retried on a later tick.
                    error!(worker, %error, "stitching batch failed");
                }
            }
        }

        info!(worker, "stitch worker exiting");
    }

    /// One stitching transaction: fetch a locked batch, resolve each event,
    /// commit. Every exit path ends the transaction.
    async fn run_one_batch(&self, token: &CancellationToken) -> Result<BatchOutcome, StitchError> {
        let start = tokio::time::Instant::now();
        let mut tx = self.store.begin().await.map_err(StitchError::Begin)?;

        let outcome = match self.stitch_batch(&mut tx, token).await {
            Ok(outcome) => outcome,
            Err(error) => {
                if let Err(rollback_error) = self.store.rollback(tx).await {
                    warn!(%rollback_error, "rollback failed after batch error");
                }
                return Err(error);
            }
        };

        if token.is_cancelled() {
            debug!("cancellation observed before commit, rolling back batch");
            self.store.rollback(tx).await.map_err(StitchError::Rollback)?;
            return Ok(BatchOutcome::default());
        }

        self.store.commit(tx).await.map_err(StitchError::Commit)?;

        metrics::counter!("stitch_batches_total").increment(1);
        metrics::counter!("stitch_events_created_total").increment(outcome.created as u64);
        metrics::counter!("stitch_events_enriched_total").increment(outcome.enriched as u64);
        metrics::counter!("stitch_events_merged_total").increment(outcome.merged as u64);
        metrics::counter!("stitch_events_skipped_total").increment(outcome.skipped as u64);
        metrics::histogram!("stitch_batch_duration_seconds")
            .record(start.elapsed().as_secs_f64());

        Ok(outcome)
    }

    async fn stitch_batch(
        &self,
        tx: &mut S::Tx,
        token: &CancellationToken,
    ) -> Result<BatchOutcome, StitchError> {
        let events = self
            .store
            .fetch_unprocessed(tx, self.batch_size as i64)
            .await
            .map_err(StitchError::Fetch)?;

        let mut outcome = BatchOutcome {
            fetched: events.len(),
            ..Default::default()
        };

        for event in &events {
            if token.is_cancelled() {
                break;
            }
            match self.stitch_event(tx, event).await {
                Ok(EventOutcome::Created) => outcome.created += 1,
                Ok(EventOutcome::Enriched) => outcome.enriched += 1,
                Ok(EventOutcome::Merged) => outcome.merged += 1,
                // A failed event is skipped within the same transaction: it
                // stays unmarked and is retried on a later tick, while the
                // rest of the batch still commits.
                Err(error) => {
                    warn!(event = event.id, %error, "failed to stitch event, skipping it");
                    outcome.skipped += 1;
                }
            }
        }

        Ok(outcome)
    }

    async fn stitch_event(
        &self,
        tx: &mut S::Tx,
        event: &EventRecord,
    ) -> Result<EventOutcome, stitch_core::error::StoreError> {
        let matches = self.store.profiles_matching(tx, &event.identifiers).await?;

        let outcome = match matches.len() {
            0 => {
                let profile = self.store.insert_profile(tx, &event.identifiers).await?;
                debug!(event = event.id, profile, "no profile matched, created one");
                EventOutcome::Created
            }
            1 => {
                self.store
                    .enrich_profile(tx, matches[0].id, &event.identifiers)
                    .await?;
                debug!(event = event.id, profile = matches[0].id, "enriched profile");
                EventOutcome::Enriched
            }
            _ => {
                // The event witnessed a connection between previously
                // separate profiles; collapse them to restore disjointness.
                let ids: Vec<i32> = matches.iter().map(|profile| profile.id).collect();
                self.store.merge_profiles(tx, &ids).await?;
                debug!(event = event.id, profiles = ?ids, "merged profiles linked by event");
                EventOutcome::Merged
            }
        };

        self.store.mark_processed(tx, event).await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDateTime, Utc};
    use std::collections::HashSet;
    use stitch_core::test_utils::MemoryStore;
    use stitch_core::types::{IdentifierField, Identifiers, NewEvent};

    fn service(store: &Arc<MemoryStore>) -> StitchingService<MemoryStore> {
        StitchingService::new(store.clone(), Duration::from_millis(1), 1, 100)
    }

    fn timestamp(offset_ms: i64) -> NaiveDateTime {
        Utc::now().naive_utc() + chrono::Duration::milliseconds(offset_ms)
    }

    fn event(offset_ms: i64, cookie: &str, message_id: &str, phone: &str) -> NewEvent {
        NewEvent {
            event_id: 1,
            event_timestamp: timestamp(offset_ms),
            identifiers: Identifiers::new(cookie, message_id, phone),
        }
    }

    #[tokio::test]
    async fn unmatched_event_creates_a_profile() {
        let store = Arc::new(MemoryStore::new());
        store.seed_event(&event(0, "c1", "m1", "p1"));

        let outcome = service(&store)
            .run_one_batch(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.fetched, 1);
        assert_eq!(outcome.created, 1);
        assert_eq!(store.processed_count(), 1);
        let profiles = store.all_profiles().await.unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].identifiers, Identifiers::new("c1", "m1", "p1"));
    }

    #[tokio::test]
    async fn single_match_enriches_missing_fields_only() {
        let store = Arc::new(MemoryStore::new());
        let id = store.seed_profile(Identifiers::new("c1", "m1", ""));
        store.seed_event(&event(0, "c1", "m1", "p1"));

        let outcome = service(&store)
            .run_one_batch(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.enriched, 1);
        assert_eq!(store.profile(id).unwrap(), Identifiers::new("c1", "m1", "p1"));
        assert_eq!(store.all_profiles().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unrelated_event_creates_a_distinct_profile() {
        let store = Arc::new(MemoryStore::new());
        let existing = store.seed_profile(Identifiers::new("c1", "m1", "p1"));
        store.seed_event(&event(0, "c2", "m2", "p2"));

        service(&store)
            .run_one_batch(&CancellationToken::new())
            .await
            .unwrap();

        let profiles = store.all_profiles().await.unwrap();
        assert_eq!(profiles.len(), 2);
        assert_eq!(store.profile(existing).unwrap(), Identifiers::new("c1", "m1", "p1"));
        assert_eq!(profiles[1].identifiers, Identifiers::new("c2", "m2", "p2"));
    }

    #[tokio::test]
    async fn bridging_event_merges_two_profiles() {
        let store = Arc::new(MemoryStore::new());
        let first = store.seed_profile(Identifiers::new("c1", "m1", ""));
        let second = store.seed_profile(Identifiers::new("c2", "m2", "p2"));
        // Bridges the two: message_id hits the first, cookie hits the second.
        store.seed_event(&event(0, "c2", "m1", ""));

        let outcome = service(&store)
            .run_one_batch(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.merged, 1);
        let profiles = store.all_profiles().await.unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].id, first);
        assert_eq!(profiles[0].identifiers, Identifiers::new("c1", "m1", "p2"));
        assert!(store.profile(second).is_none());
    }

    #[tokio::test]
    async fn triple_merge_is_deterministic() {
        let store = Arc::new(MemoryStore::new());
        let first = store.seed_profile(Identifiers::new("c-c", "m-c", "p1"));
        store.seed_profile(Identifiers::new("c-b", "m-b", "p2"));
        store.seed_profile(Identifiers::new("c-a", "m-a", "p3"));
        // One event linking all three profiles through different fields.
        store.seed_event(&event(0, "c-c", "m-b", "p3"));

        service(&store)
            .run_one_batch(&CancellationToken::new())
            .await
            .unwrap();

        let profiles = store.all_profiles().await.unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].id, first);
        assert_eq!(profiles[0].identifiers, Identifiers::new("c-a", "m-a", "p1"));
    }

    #[tokio::test]
    async fn duplicate_events_do_not_duplicate_profiles() {
        let store = Arc::new(MemoryStore::new());
        store.seed_event(&event(0, "c1", "m1", "p1"));
        store.seed_event(&event(1, "c1", "m1", "p1"));

        let outcome = service(&store)
            .run_one_batch(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.enriched, 1);
        assert_eq!(store.processed_count(), 2);
        assert_eq!(store.all_profiles().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn events_are_stitched_in_timestamp_order() {
        let store = Arc::new(MemoryStore::new());
        // Seeded out of order; the earlier event must win the empty fields.
        store.seed_event(&event(500, "c1", "", "p-late"));
        store.seed_event(&event(0, "c1", "", "p-early"));

        service(&store)
            .run_one_batch(&CancellationToken::new())
            .await
            .unwrap();

        let profiles = store.all_profiles().await.unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].identifiers.phone, "p-early");
    }

    #[tokio::test]
    async fn matching_is_case_sensitive() {
        let store = Arc::new(MemoryStore::new());
        store.seed_profile(Identifiers::new("Cookie", "", ""));
        store.seed_event(&event(0, "cookie", "", ""));

        service(&store)
            .run_one_batch(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(store.all_profiles().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn all_empty_events_accumulate_empty_profiles() {
        // Known degeneracy: empty fields are never matched on, so every
        // all-empty event creates another all-empty profile.
        let store = Arc::new(MemoryStore::new());
        store.seed_event(&event(0, "", "", ""));
        store.seed_event(&event(1, "", "", ""));

        service(&store)
            .run_one_batch(&CancellationToken::new())
            .await
            .unwrap();

        let profiles = store.all_profiles().await.unwrap();
        assert_eq!(profiles.len(), 2);
        assert!(profiles.iter().all(|p| p.identifiers.is_empty()));
        assert_eq!(store.processed_count(), 2);
    }

    #[tokio::test]
    async fn empty_batch_is_a_noop() {
        let store = Arc::new(MemoryStore::new());

        let outcome = service(&store)
            .run_one_batch(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, BatchOutcome::default());
    }

    #[tokio::test]
    async fn per_event_failure_skips_but_commits_the_rest() {
        let store = Arc::new(MemoryStore::new());
        store.seed_profile(Identifiers::new("c1", "", ""));
        store.seed_event(&event(0, "c1", "m1", "")); // enrich, will fail
        store.seed_event(&event(1, "c2", "", "")); // create, will fail
        store.set_fail_profile_writes(true);

        let outcome = service(&store)
            .run_one_batch(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.skipped, 2);
        assert_eq!(store.processed_count(), 0);

        // The failed events stay unprocessed and succeed on a later tick.
        store.set_fail_profile_writes(false);
        let outcome = service(&store)
            .run_one_batch(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.enriched + outcome.created, 2);
        assert_eq!(store.processed_count(), 2);
    }

    #[tokio::test]
    async fn commit_failure_leaves_the_batch_unprocessed() {
        let store = Arc::new(MemoryStore::new());
        store.seed_event(&event(0, "c1", "", ""));
        store.set_fail_commits(true);

        let result = service(&store)
            .run_one_batch(&CancellationToken::new())
            .await;

        assert!(matches!(result, Err(StitchError::Commit(_))));
        assert_eq!(store.processed_count(), 0);
        assert_eq!(store.claimed_count(), 0);
        // The failed transaction left nothing behind, profiles included.
        assert!(store.all_profiles().await.unwrap().is_empty());

        // The retry sees an empty store and creates the profile fresh.
        store.set_fail_commits(false);
        let outcome = service(&store)
            .run_one_batch(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.created, 1);
        assert_eq!(store.processed_count(), 1);
        let profiles = store.all_profiles().await.unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].identifiers, Identifiers::new("c1", "", ""));
    }

    #[tokio::test]
    async fn cancellation_before_commit_rolls_back() {
        let store = Arc::new(MemoryStore::new());
        store.seed_event(&event(0, "c1", "", ""));
        let token = CancellationToken::new();
        token.cancel();

        let outcome = service(&store).run_one_batch(&token).await.unwrap();

        assert_eq!(outcome, BatchOutcome::default());
        assert_eq!(store.processed_count(), 0);
        assert_eq!(store.claimed_count(), 0);
        assert!(store.all_profiles().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn restitching_processed_events_changes_nothing() {
        let store = Arc::new(MemoryStore::new());
        store.seed_event(&event(0, "c1", "m1", "p1"));
        let stitcher = service(&store);
        let token = CancellationToken::new();

        stitcher.run_one_batch(&token).await.unwrap();
        let before = store.all_profiles().await.unwrap();

        let outcome = stitcher.run_one_batch(&token).await.unwrap();
        assert_eq!(outcome.fetched, 0);
        assert_eq!(store.all_profiles().await.unwrap(), before);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_workers_process_every_event_exactly_once() {
        let store = Arc::new(MemoryStore::new());
        let total = 1000;
        for _ in 0..total {
            store.seed_event(&NewEvent::random());
        }

        let stitcher =
            StitchingService::new(store.clone(), Duration::from_millis(1), 4, 100);
        let token = CancellationToken::new();
        let registry = HealthRegistry::new();
        let handles = stitcher.start(&token, &registry);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while store.count_unprocessed_events().await.unwrap() > 0 || !registry.status().healthy {
            assert!(
                tokio::time::Instant::now() < deadline,
                "workers did not drain the backlog in time"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        token.cancel();
        for handle in handles {
            handle.await.unwrap();
        }

        // Every event processed exactly once: random identifiers are unique,
        // so double-claiming an event would show up as an extra profile.
        assert_eq!(store.processed_count(), total);
        let profiles = store.all_profiles().await.unwrap();
        assert_eq!(profiles.len(), total);

        // Disjointness: no non-empty value appears on two profiles.
        for field in IdentifierField::ALL {
            let mut seen = HashSet::new();
            for profile in &profiles {
                let value = profile.identifiers.get(field);
                if !value.is_empty() {
                    assert!(seen.insert(value.to_owned()), "duplicate {field:?}: {value}");
                }
            }
        }
    }
}
