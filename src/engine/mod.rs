mod bookings;
mod cascade;
mod clock;
mod error;
mod overlap;
mod periods;
mod pricing;
mod search;
mod store;
#[cfg(test)]
mod tests;

pub use bookings::ReservationRequest;
pub use cascade::CascadeOutcome;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::EngineError;
pub use overlap::{covers, periods_conflict, reservations_conflict};
pub use periods::{PeriodPatch, PeriodRequest};
pub use pricing::{nights, price};
pub use store::{ReservationRef, SharedAccommodation, Tables};

use std::io;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{OwnedRwLockWriteGuard, RwLock, RwLockReadGuard, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. One flush_sync for the whole batch, then answer every sender.
///
/// Returns (closing the file) once every engine-side sender is dropped.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    tracing::debug!(path = %wal.path().display(), "WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} events: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so buffered bytes of this batch
    // cannot ride along with the next one.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// Write access to one partition, taken through the engine's commit gate.
///
/// The gate is always acquired before the partition lock. Compaction holds
/// the gate exclusively, so while a `PartitionWrite` is alive no WAL rewrite
/// can start, and while a rewrite runs no new one can be handed out.
pub(super) struct PartitionWrite<'a> {
    _commit: RwLockReadGuard<'a, ()>,
    guard: OwnedRwLockWriteGuard<AccommodationState>,
}

impl Deref for PartitionWrite<'_> {
    type Target = AccommodationState;

    fn deref(&self) -> &AccommodationState {
        &self.guard
    }
}

impl DerefMut for PartitionWrite<'_> {
    fn deref_mut(&mut self) -> &mut AccommodationState {
        &mut self.guard
    }
}

/// The reservation availability and booking engine.
///
/// State is partitioned per accommodation. Every mutation validates and
/// commits while holding its accommodation's write lock, so a
/// check-then-write sequence can never interleave with a competing writer
/// of the same accommodation.
pub struct Engine {
    pub tables: Tables,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Shared by writers, exclusive for compaction.
    commit_gate: RwLock<()>,
    pub notify: Arc<NotifyHub>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_clock(wal_path, notify, Arc::new(SystemClock))
    }

    /// Open the WAL at `wal_path`, replay it and start the writer task.
    /// Must be called from within a tokio runtime.
    pub fn with_clock(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            tables: Tables::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
            notify,
            clock,
        };

        // Sole owner of every partition here, so try_write never contends.
        // Blocking lock calls would panic inside the runtime.
        for event in &events {
            let partition = engine.tables.partition_or_create(event.accommodation_id());
            let mut guard = partition
                .try_write()
                .map_err(|_| io::Error::other("replay: partition unexpectedly locked"))?;
            engine.tables.apply(&mut guard, event);
        }
        tracing::info!(
            events = events.len(),
            periods = engine.tables.period_count(),
            reservations = engine.tables.reservation_count(),
            "replayed WAL {}",
            wal_path.display()
        );

        Ok(engine)
    }

    pub fn now(&self) -> Ms {
        self.clock.now()
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Persistence("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Persistence("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Persistence(e.to_string()))
    }

    /// WAL-append, then apply to the partition and every index, then notify.
    /// Nothing is applied when the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        acc: &mut AccommodationState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.tables.apply(acc, event);
        self.notify.send(event);
        metrics::counter!(observability::EVENTS_COMMITTED_TOTAL, "kind" => observability::event_label(event))
            .increment(1);
        Ok(())
    }

    /// Take the commit gate (shared), then the partition's write lock.
    /// Each mutation holds at most one of these at a time.
    pub(super) async fn write_partition(&self, partition: SharedAccommodation) -> PartitionWrite<'_> {
        let commit = self.commit_gate.read().await;
        PartitionWrite {
            _commit: commit,
            guard: partition.write_owned().await,
        }
    }

    /// Lookup period → accommodation, then take that partition's write lock.
    pub(super) async fn resolve_period_write(
        &self,
        period_id: &Ulid,
    ) -> Result<(Ulid, PartitionWrite<'_>), EngineError> {
        let accommodation_id = self
            .tables
            .accommodation_for_period(period_id)
            .ok_or(EngineError::NotFound(*period_id))?;
        let partition = self
            .tables
            .partition(&accommodation_id)
            .ok_or(EngineError::NotFound(*period_id))?;
        let guard = self.write_partition(partition).await;
        // The period may have been deleted while we waited for the lock.
        if guard.period(period_id).is_none() {
            return Err(EngineError::NotFound(*period_id));
        }
        Ok((accommodation_id, guard))
    }

    /// Rewrite the WAL as the minimal event list reproducing current state.
    ///
    /// The commit gate is held exclusively from the snapshot until the
    /// rewritten file is in place. Writers only lock a partition while
    /// holding the gate, so the reads below never wait on one, and no event
    /// can reach the old file after the snapshot.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.commit_gate.write().await;
        let mut events = Vec::new();
        for accommodation_id in self.tables.accommodation_ids() {
            let Some(partition) = self.tables.partition(&accommodation_id) else {
                continue;
            };
            let guard = partition.read().await;
            for period in &guard.periods {
                events.push(Event::created_period(period));
            }
            for reservation in guard.all_reservations() {
                events.push(Event::created_reservation(reservation));
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Persistence("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Persistence("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Persistence(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
