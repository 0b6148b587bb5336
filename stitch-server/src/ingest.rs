//! Intake: a bounded in-memory backlog bridging producers to event-store
//! insert workers.
//!
//! Producers send through the returned channel and block when the backlog is
//! full; that back-pressure is the only signal intake gives them. Workers
//! insert each event as it arrives. Ingestion is best-effort: an insert
//! failure is logged and the event is dropped, never retried.

use std::sync::Arc;

use stitch_core::store::StitchStore;
use stitch_core::types::NewEvent;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct IngestService<S> {
    store: Arc<S>,
    workers: usize,
    capacity: usize,
}

impl<S: StitchStore + 'static> IngestService<S> {
    pub fn new(store: Arc<S>, workers: usize, capacity: usize) -> Self {
        Self {
            store,
            workers,
            capacity,
        }
    }

    /// Spawn the insert workers and hand back the producer side of the
    /// backlog. Workers exit when the token is cancelled or every sender is
    /// dropped and the backlog is drained.
    pub fn start(
        &self,
        token: &CancellationToken,
    ) -> (mpsc::Sender<NewEvent>, Vec<JoinHandle<()>>) {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let receiver = Arc::new(Mutex::new(receiver));

        let handles = (0..self.workers)
            .map(|worker| {
                let store = self.store.clone();
                let receiver = receiver.clone();
                let token = token.clone();
                tokio::spawn(ingest_worker(store, receiver, token, worker))
            })
            .collect();

        (sender, handles)
    }
}

async fn ingest_worker<S: StitchStore>(
    store: Arc<S>,
    backlog: Arc<Mutex<mpsc::Receiver<NewEvent>>>,
    token: CancellationToken,
    worker: usize,
) {
    info!(worker, "ingest worker started");

    loop {
        // The lock is held only while waiting on the backlog; cancellation
        // interrupts the holder, and the other workers observe the token as
        // soon as they acquire the lock.
        let received = {
            let mut backlog = backlog.lock().await;
            tokio::select! {
                _ = token.cancelled() => None,
                event = backlog.recv() => event,
            }
        };

        let Some(event) = received else {
            break;
        };

        if let Err(error) = store.insert_event(&event).await {
            error!(worker, %error, "failed to insert event, dropping it");
            metrics::counter!("ingest_events_dropped_total").increment(1);
            continue;
        }

        metrics::counter!("ingest_events_total").increment(1);
        debug!(worker, event_id = event.event_id, "ingested event");
    }

    info!(worker, "ingest worker exiting");
}
