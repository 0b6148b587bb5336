use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::error::StoreResult;
use crate::types::{EventRecord, IdentifierField, Identifiers, NewEvent, Profile};

/// The unit of work shared by the intake and the stitcher: event and profile
/// operations over one backing store, parameterized by an explicit
/// transaction handle.
///
/// The stitcher's correctness rests on three contracts here:
///
/// - [`fetch_unprocessed`](StitchStore::fetch_unprocessed) returns rows in
///   `event_timestamp` ascending order, exclusively locked until the
///   transaction ends, and skips rows locked by other transactions — so a
///   fleet of workers partitions the backlog without in-process
///   coordination.
/// - [`merge_profiles`](StitchStore::merge_profiles) locks rows in ascending
///   id order, keeps the lowest id, and takes the lexicographically smallest
///   non-empty value per field — deterministic, so re-observing the same
///   conflict converges on the same surviving row.
/// - [`mark_processed`](StitchStore::mark_processed) is idempotent and only
///   becomes visible at commit, together with the profile mutations.
#[async_trait]
pub trait StitchStore: Send + Sync {
    type Tx: Send;

    async fn begin(&self) -> StoreResult<Self::Tx>;
    async fn commit(&self, tx: Self::Tx) -> StoreResult<()>;
    async fn rollback(&self, tx: Self::Tx) -> StoreResult<()>;

    /// Persist a new event with `processed = false`. Pool-level: intake does
    /// not run inside stitching transactions.
    async fn insert_event(&self, event: &NewEvent) -> StoreResult<()>;

    /// Up to `limit` unprocessed events, timestamp ascending, row-locked for
    /// the lifetime of `tx`, skipping rows other transactions hold.
    async fn fetch_unprocessed(
        &self,
        tx: &mut Self::Tx,
        limit: i64,
    ) -> StoreResult<Vec<EventRecord>>;

    /// Flip the event's `processed` flag. A no-op if already set.
    async fn mark_processed(&self, tx: &mut Self::Tx, event: &EventRecord) -> StoreResult<()>;

    /// Profiles whose `field` column equals `value`, ascending id. Returns
    /// nothing for an empty `value`. Under the disjointness invariant this
    /// is at most one profile, but transient violations return several.
    async fn profiles_by_identifier(
        &self,
        tx: &mut Self::Tx,
        field: IdentifierField,
        value: &str,
    ) -> StoreResult<Vec<Profile>>;

    /// The union of [`profiles_by_identifier`](Self::profiles_by_identifier)
    /// over every non-empty field of `identifiers`, deduplicated, ascending
    /// id.
    async fn profiles_matching(
        &self,
        tx: &mut Self::Tx,
        identifiers: &Identifiers,
    ) -> StoreResult<Vec<Profile>> {
        let mut matches: Vec<Profile> = Vec::new();
        for (field, value) in identifiers.pairs() {
            if value.is_empty() {
                continue;
            }
            for profile in self.profiles_by_identifier(tx, field, value).await? {
                if !matches.iter().any(|known| known.id == profile.id) {
                    matches.push(profile);
                }
            }
        }
        if matches.is_empty() {
            tracing::debug!(?identifiers, "no profile matched any identifier");
        }
        matches.sort_by_key(|profile| profile.id);
        Ok(matches)
    }

    /// Insert a profile and return its fresh surrogate id.
    async fn insert_profile(
        &self,
        tx: &mut Self::Tx,
        identifiers: &Identifiers,
    ) -> StoreResult<i32>;

    /// Replace every identifier field of the profile.
    async fn update_profile(
        &self,
        tx: &mut Self::Tx,
        id: i32,
        identifiers: &Identifiers,
    ) -> StoreResult<()>;

    /// Fill the profile's empty fields from `identifiers`. Never overwrites
    /// a non-empty stored value.
    async fn enrich_profile(
        &self,
        tx: &mut Self::Tx,
        id: i32,
        identifiers: &Identifiers,
    ) -> StoreResult<()>;

    /// Collapse the given profiles into the one with the lowest id. A no-op
    /// for fewer than two distinct ids. Locks rows in ascending id order,
    /// writes the per-field minimum of non-empty values to the winner, and
    /// deletes the rest.
    async fn merge_profiles(&self, tx: &mut Self::Tx, ids: &[i32]) -> StoreResult<()>;

    // Diagnostic reads; none of these run inside the stitching hot path.

    async fn count_events(&self) -> StoreResult<i64>;
    async fn count_unprocessed_events(&self) -> StoreResult<i64>;
    async fn all_events(&self) -> StoreResult<Vec<EventRecord>>;
    async fn events_in_range(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> StoreResult<Vec<EventRecord>>;
    async fn all_profiles(&self) -> StoreResult<Vec<Profile>>;
}
