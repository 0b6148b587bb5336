//! An in-memory [`StitchStore`] standing in for Postgres in tests.
//!
//! It honors the contracts the stitcher leans on: fetched rows are claimed
//! and invisible to other transactions until commit or rollback (the
//! skip-locked behavior), profile ids are monotonic and never reused (ids
//! are consumed even by rolled-back inserts, like a sequence), and merge
//! follows the lowest-id / smallest-value rules. Writes are transactional:
//! `mark_processed` and every profile mutation are buffered on the
//! transaction, visible to reads within it, applied at commit, and discarded
//! on rollback or drop.
//!
//! Two failure toggles exist for error-path tests: one fails every profile
//! write, one fails commits.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::error::{StoreError, StoreResult};
use crate::store::StitchStore;
use crate::types::{EventRecord, IdentifierField, Identifiers, NewEvent, Profile};

#[derive(Debug, Clone)]
struct StoredEvent {
    id: i32,
    event_id: i16,
    event_timestamp: NaiveDateTime,
    identifiers: Identifiers,
    processed: bool,
}

impl StoredEvent {
    fn record(&self) -> EventRecord {
        EventRecord {
            id: self.id,
            event_id: self.event_id,
            event_timestamp: self.event_timestamp,
            identifiers: self.identifiers.clone(),
        }
    }
}

#[derive(Default)]
struct MemoryInner {
    events: Vec<StoredEvent>,
    next_event_id: i32,
    profiles: BTreeMap<i32, Identifiers>,
    next_profile_id: i32,
    claimed: Vec<i32>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
    fail_profile_writes: Arc<AtomicBool>,
    fail_commits: Arc<AtomicBool>,
}

pub struct MemoryTx {
    inner: Arc<Mutex<MemoryInner>>,
    claimed: Vec<i32>,
    marked: Vec<i32>,
    /// Profiles inserted or modified by this transaction, keyed by id.
    pending_profiles: BTreeMap<i32, Identifiers>,
    /// Profiles deleted by this transaction (merge losers).
    deleted_profiles: BTreeSet<i32>,
    finished: bool,
}

impl MemoryTx {
    fn release_claims(&mut self) {
        let mut inner = self.inner.lock().expect("poisoned MemoryStore lock");
        inner.claimed.retain(|id| !self.claimed.contains(id));
        self.claimed.clear();
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        // A dropped transaction behaves like a rollback: claims are released
        // and the buffered marks and profile writes are discarded.
        if !self.finished {
            self.release_claims();
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a profile directly, bypassing transactions. Test seeding only.
    pub fn seed_profile(&self, identifiers: Identifiers) -> i32 {
        let mut inner = self.inner.lock().expect("poisoned MemoryStore lock");
        inner.next_profile_id += 1;
        let id = inner.next_profile_id;
        inner.profiles.insert(id, identifiers);
        id
    }

    /// Insert an event directly, bypassing the async trait. Test seeding only.
    pub fn seed_event(&self, event: &NewEvent) -> i32 {
        let mut inner = self.inner.lock().expect("poisoned MemoryStore lock");
        inner.next_event_id += 1;
        let id = inner.next_event_id;
        inner.events.push(StoredEvent {
            id,
            event_id: event.event_id,
            event_timestamp: event.event_timestamp,
            identifiers: event.identifiers.clone(),
            processed: false,
        });
        id
    }

    pub fn profile(&self, id: i32) -> Option<Identifiers> {
        self.inner
            .lock()
            .expect("poisoned MemoryStore lock")
            .profiles
            .get(&id)
            .cloned()
    }

    pub fn processed_count(&self) -> usize {
        self.inner
            .lock()
            .expect("poisoned MemoryStore lock")
            .events
            .iter()
            .filter(|event| event.processed)
            .count()
    }

    pub fn claimed_count(&self) -> usize {
        self.inner
            .lock()
            .expect("poisoned MemoryStore lock")
            .claimed
            .len()
    }

    /// When set, every profile write (insert, update, enrich, merge) fails.
    pub fn set_fail_profile_writes(&self, fail: bool) {
        self.fail_profile_writes.store(fail, Ordering::SeqCst);
    }

    /// When set, commits fail; the transaction behaves like a rollback.
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    fn check_profile_writes(&self) -> StoreResult<()> {
        if self.fail_profile_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "profile writes are failing".to_owned(),
            ));
        }
        Ok(())
    }

    /// The profiles as this transaction sees them: the committed rows with
    /// the transaction's own deletions and writes layered on top.
    fn effective_profiles(&self, tx: &MemoryTx) -> BTreeMap<i32, Identifiers> {
        let mut profiles = self
            .inner
            .lock()
            .expect("poisoned MemoryStore lock")
            .profiles
            .clone();
        for id in &tx.deleted_profiles {
            profiles.remove(id);
        }
        for (id, identifiers) in &tx.pending_profiles {
            profiles.insert(*id, identifiers.clone());
        }
        profiles
    }
}

#[async_trait]
impl StitchStore for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> StoreResult<Self::Tx> {
        Ok(MemoryTx {
            inner: self.inner.clone(),
            claimed: Vec::new(),
            marked: Vec::new(),
            pending_profiles: BTreeMap::new(),
            deleted_profiles: BTreeSet::new(),
            finished: false,
        })
    }

    async fn commit(&self, mut tx: Self::Tx) -> StoreResult<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            tx.finished = true;
            tx.release_claims();
            return Err(StoreError::Unavailable("commits are failing".to_owned()));
        }

        {
            let mut inner = self.inner.lock().expect("poisoned MemoryStore lock");
            for id in &tx.marked {
                if let Some(event) = inner.events.iter_mut().find(|event| event.id == *id) {
                    event.processed = true;
                }
            }
            for id in &tx.deleted_profiles {
                inner.profiles.remove(id);
            }
            for (id, identifiers) in &tx.pending_profiles {
                inner.profiles.insert(*id, identifiers.clone());
            }
        }
        tx.finished = true;
        tx.release_claims();
        Ok(())
    }

    async fn rollback(&self, mut tx: Self::Tx) -> StoreResult<()> {
        tx.finished = true;
        tx.release_claims();
        Ok(())
    }

    async fn insert_event(&self, event: &NewEvent) -> StoreResult<()> {
        self.seed_event(event);
        Ok(())
    }

    async fn fetch_unprocessed(
        &self,
        tx: &mut Self::Tx,
        limit: i64,
    ) -> StoreResult<Vec<EventRecord>> {
        let mut inner = self.inner.lock().expect("poisoned MemoryStore lock");

        let mut candidates: Vec<StoredEvent> = inner
            .events
            .iter()
            .filter(|event| !event.processed && !inner.claimed.contains(&event.id))
            .cloned()
            .collect();
        candidates.sort_by_key(|event| (event.event_timestamp, event.id));
        candidates.truncate(limit.max(0) as usize);

        for event in &candidates {
            inner.claimed.push(event.id);
            tx.claimed.push(event.id);
        }

        Ok(candidates.iter().map(StoredEvent::record).collect())
    }

    async fn mark_processed(&self, tx: &mut Self::Tx, event: &EventRecord) -> StoreResult<()> {
        if !tx.marked.contains(&event.id) {
            tx.marked.push(event.id);
        }
        Ok(())
    }

    async fn profiles_by_identifier(
        &self,
        tx: &mut Self::Tx,
        field: IdentifierField,
        value: &str,
    ) -> StoreResult<Vec<Profile>> {
        if value.is_empty() {
            return Ok(Vec::new());
        }

        Ok(self
            .effective_profiles(tx)
            .iter()
            .filter(|(_, identifiers)| identifiers.get(field) == value)
            .map(|(id, identifiers)| Profile {
                id: *id,
                identifiers: identifiers.clone(),
            })
            .collect())
    }

    async fn insert_profile(
        &self,
        tx: &mut Self::Tx,
        identifiers: &Identifiers,
    ) -> StoreResult<i32> {
        self.check_profile_writes()?;

        // Ids come off the shared counter eagerly, like a sequence: a
        // rolled-back insert still consumes its id.
        let id = {
            let mut inner = self.inner.lock().expect("poisoned MemoryStore lock");
            inner.next_profile_id += 1;
            inner.next_profile_id
        };
        tx.pending_profiles.insert(id, identifiers.clone());
        Ok(id)
    }

    async fn update_profile(
        &self,
        tx: &mut Self::Tx,
        id: i32,
        identifiers: &Identifiers,
    ) -> StoreResult<()> {
        self.check_profile_writes()?;
        if self.effective_profiles(tx).contains_key(&id) {
            tx.pending_profiles.insert(id, identifiers.clone());
        }
        Ok(())
    }

    async fn enrich_profile(
        &self,
        tx: &mut Self::Tx,
        id: i32,
        identifiers: &Identifiers,
    ) -> StoreResult<()> {
        self.check_profile_writes()?;
        if let Some(mut stored) = self.effective_profiles(tx).get(&id).cloned() {
            if stored.cookie.is_empty() {
                stored.cookie = identifiers.cookie.clone();
            }
            if stored.message_id.is_empty() {
                stored.message_id = identifiers.message_id.clone();
            }
            if stored.phone.is_empty() {
                stored.phone = identifiers.phone.clone();
            }
            tx.pending_profiles.insert(id, stored);
        }
        Ok(())
    }

    async fn merge_profiles(&self, tx: &mut Self::Tx, ids: &[i32]) -> StoreResult<()> {
        self.check_profile_writes()?;

        let mut ordered = ids.to_vec();
        ordered.sort_unstable();
        ordered.dedup();
        if ordered.len() < 2 {
            return Ok(());
        }
        let winner = ordered[0];

        let effective = self.effective_profiles(tx);
        let rows: Vec<Identifiers> = ordered
            .iter()
            .filter_map(|id| effective.get(id).cloned())
            .collect();
        let merged = Identifiers::merged_over(&rows);

        if effective.contains_key(&winner) {
            tx.pending_profiles.insert(winner, merged);
        }
        for id in &ordered[1..] {
            tx.pending_profiles.remove(id);
            tx.deleted_profiles.insert(*id);
        }
        Ok(())
    }

    async fn count_events(&self) -> StoreResult<i64> {
        let inner = self.inner.lock().expect("poisoned MemoryStore lock");
        Ok(inner.events.len() as i64)
    }

    async fn count_unprocessed_events(&self) -> StoreResult<i64> {
        let inner = self.inner.lock().expect("poisoned MemoryStore lock");
        Ok(inner.events.iter().filter(|event| !event.processed).count() as i64)
    }

    async fn all_events(&self) -> StoreResult<Vec<EventRecord>> {
        let inner = self.inner.lock().expect("poisoned MemoryStore lock");
        let mut events: Vec<StoredEvent> = inner.events.clone();
        events.sort_by_key(|event| (event.event_timestamp, event.id));
        Ok(events.iter().map(StoredEvent::record).collect())
    }

    async fn events_in_range(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> StoreResult<Vec<EventRecord>> {
        let mut events: Vec<EventRecord> = self
            .all_events()
            .await?
            .into_iter()
            .filter(|event| event.event_timestamp >= start && event.event_timestamp <= end)
            .collect();
        events.sort_by_key(|event| (event.event_timestamp, event.id));
        Ok(events)
    }

    async fn all_profiles(&self) -> StoreResult<Vec<Profile>> {
        let inner = self.inner.lock().expect("poisoned MemoryStore lock");
        Ok(inner
            .profiles
            .iter()
            .map(|(id, identifiers)| Profile {
                id: *id,
                identifiers: identifiers.clone(),
            })
            .collect())
    }
}
