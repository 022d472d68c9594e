mod error;
mod ledger;
mod registry;

pub use error::StoreError;
pub use ledger::ReservationLedger;
pub use registry::ResourceDayRegistry;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, mpsc, oneshot};
use tokio::time::Instant;

use crate::limits::WAL_CHANNEL_DEPTH;
use crate::model::*;
use crate::wal::Wal;

/// Point in time after which an operation gives up without side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    pub fn after(timeout: Duration) -> Self {
        Self(Some(Instant::now() + timeout))
    }

    pub fn is_expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }

    pub fn check(&self) -> Result<(), StoreError> {
        if self.is_expired() {
            Err(StoreError::DeadlineExceeded)
        } else {
            Ok(())
        }
    }

    /// Drive `fut` until it completes or the deadline passes.
    pub async fn run<F: Future>(self, fut: F) -> Result<F::Output, StoreError> {
        match self.0 {
            None => Ok(fut.await),
            Some(at) => tokio::time::timeout_at(at, fut)
                .await
                .map_err(|_| StoreError::DeadlineExceeded),
        }
    }
}

// ── In-memory tables ─────────────────────────────────────

/// Live reservations in one `(resource day, date)` slot. Holding its mutex
/// is what makes count-then-insert atomic.
#[derive(Debug, Default)]
pub(crate) struct Slot {
    members: Vec<ReservationId>,
}

impl Slot {
    fn push(&mut self, id: ReservationId) {
        self.members.push(id);
    }

    fn remove(&mut self, id: ReservationId) {
        self.members.retain(|m| *m != id);
    }

    fn count_excluding(&self, except: Option<ReservationId>) -> u32 {
        self.members.iter().filter(|m| Some(**m) != except).count() as u32
    }
}

/// A vendor's reservations keyed by date, for rolling-week checks.
#[derive(Debug, Default)]
pub(crate) struct VendorBook {
    by_date: BTreeMap<NaiveDate, Vec<ReservationId>>,
}

impl VendorBook {
    fn insert(&mut self, date: NaiveDate, id: ReservationId) {
        self.by_date.entry(date).or_default().push(id);
    }

    fn remove(&mut self, date: NaiveDate, id: ReservationId) {
        if let Some(ids) = self.by_date.get_mut(&date) {
            ids.retain(|r| *r != id);
            if ids.is_empty() {
                self.by_date.remove(&date);
            }
        }
    }

    /// First reservation other than `except` dated inside `window`.
    fn first_in(&self, window: DateWindow, except: Option<ReservationId>) -> Option<ReservationId> {
        self.by_date
            .range(window.first..=window.last)
            .flat_map(|(_, ids)| ids.iter().copied())
            .find(|id| Some(*id) != except)
    }

    fn ids(&self, window: Option<DateWindow>) -> Vec<ReservationId> {
        let (first, last) = match window {
            Some(w) => (w.first, w.last),
            None => (NaiveDate::MIN, NaiveDate::MAX),
        };
        self.by_date
            .range(first..=last)
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect()
    }
}

pub(crate) struct Tables {
    days: DashMap<ResourceDayId, ResourceDay>,
    /// `label_key(label)` → id. The uniqueness index for labels.
    labels: DashMap<String, ResourceDayId>,
    reservations: DashMap<ReservationId, Reservation>,
    /// Index on `(resource_day_id, date)`. Handles are cloned out under the
    /// shard lock, and an entry is only removed by [`Tables::prune_idle`]
    /// once it is empty and the map holds its only reference.
    slots: DashMap<SlotKey, Arc<Mutex<Slot>>>,
    vendors: DashMap<VendorId, Arc<Mutex<VendorBook>>>,
}

impl Tables {
    /// Drop slot and vendor entries that hold no reservations and are not
    /// referenced by any task. Returns how many were removed.
    fn prune_idle(&self) -> usize {
        let mut pruned = 0;
        self.slots.retain(|_, slot| {
            let remove = idle(slot, |s| s.members.is_empty());
            pruned += usize::from(remove);
            !remove
        });
        self.vendors.retain(|_, book| {
            let remove = idle(book, |b| b.by_date.is_empty());
            pruned += usize::from(remove);
            !remove
        });
        pruned
    }

    /// Fold a replayed event stream into fresh tables. Runs before any task
    /// can see the tables, so it works on plain maps and wraps them at the end.
    fn rebuild(events: &[Event]) -> Self {
        let mut days: HashMap<ResourceDayId, ResourceDay> = HashMap::new();
        let mut labels: HashMap<String, ResourceDayId> = HashMap::new();
        let mut reservations: HashMap<ReservationId, Reservation> = HashMap::new();
        let mut slots: HashMap<SlotKey, Slot> = HashMap::new();
        let mut vendors: HashMap<VendorId, VendorBook> = HashMap::new();

        for event in events {
            match event {
                Event::ResourceDayCreated { id, label, capacity } => {
                    labels.insert(label_key(label), *id);
                    days.insert(
                        *id,
                        ResourceDay {
                            id: *id,
                            label: label.clone(),
                            capacity: *capacity,
                        },
                    );
                }
                Event::CapacityChanged { id, capacity } => {
                    if let Some(day) = days.get_mut(id) {
                        day.capacity = *capacity;
                    }
                }
                Event::ReservationCommitted { reservation } => {
                    slots.entry(reservation.slot()).or_default().push(reservation.id);
                    vendors
                        .entry(reservation.vendor_id)
                        .or_default()
                        .insert(reservation.date, reservation.id);
                    reservations.insert(reservation.id, reservation.clone());
                }
                Event::ReservationMoved {
                    id,
                    resource_day_id,
                    date,
                } => {
                    if let Some(r) = reservations.get_mut(id) {
                        slots.entry(r.slot()).or_default().remove(*id);
                        let book = vendors.entry(r.vendor_id).or_default();
                        book.remove(r.date, *id);
                        book.insert(*date, *id);
                        r.resource_day_id = *resource_day_id;
                        r.date = *date;
                        slots.entry(r.slot()).or_default().push(*id);
                    }
                }
                Event::ReservationCancelled { id } => {
                    if let Some(r) = reservations.remove(id) {
                        slots.entry(r.slot()).or_default().remove(*id);
                        vendors.entry(r.vendor_id).or_default().remove(r.date, *id);
                    }
                }
            }
        }

        Self {
            days: days.into_iter().collect(),
            labels: labels.into_iter().collect(),
            reservations: reservations.into_iter().collect(),
            slots: slots
                .into_iter()
                .map(|(k, s)| (k, Arc::new(Mutex::new(s))))
                .collect(),
            vendors: vendors
                .into_iter()
                .map(|(k, b)| (k, Arc::new(Mutex::new(b))))
                .collect(),
        }
    }

    /// Minimal event stream that rebuilds the current state.
    fn snapshot(&self) -> Vec<Event> {
        let mut days: Vec<ResourceDay> = self.days.iter().map(|e| e.value().clone()).collect();
        days.sort_by_key(|d| d.id);
        let mut reservations: Vec<Reservation> =
            self.reservations.iter().map(|e| e.value().clone()).collect();
        reservations.sort_by_key(|r| r.id);

        let mut events = Vec::with_capacity(days.len() + reservations.len());
        events.extend(days.into_iter().map(|d| Event::ResourceDayCreated {
            id: d.id,
            label: d.label,
            capacity: d.capacity,
        }));
        events.extend(
            reservations
                .into_iter()
                .map(|reservation| Event::ReservationCommitted { reservation }),
        );
        events
    }
}

/// Runs under the entry's shard lock, so a strong count of one means no task
/// can reach the handle and a fresh default may replace it later.
fn idle<T>(handle: &Arc<Mutex<T>>, empty: impl FnOnce(&T) -> bool) -> bool {
    Arc::strong_count(handle) == 1 && handle.try_lock().is_ok_and(|guard| empty(&guard))
}

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
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

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Each wake-up takes every append already queued and covers
/// them with one fsync; non-append commands run after the batch they follow.
async fn wal_writer_loop(mut wal: Wal<Event>, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };

        let mut batch: Vec<Pending> = vec![(event, response)];
        let mut trailing = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    trailing = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = trailing {
            handle_control(&mut wal, cmd);
        }
    }
    tracing::debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal<Event>, batch: Vec<Pending>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    // Every caller is told the batch failed, so none of it may survive in the log.
    if result.is_err()
        && let Err(e) = wal.rollback()
    {
        result = Err(e);
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(error = %e, batch = batch.len(), "WAL flush failed");
    }

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal<Event>, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.rewrite(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

// ── Store ────────────────────────────────────────────────

struct Inner {
    tables: Tables,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Shared by every commit from WAL append through apply; exclusive during
    /// compaction so the snapshot includes every acknowledged write.
    commit_gate: RwLock<()>,
    /// Serializes registry writes so the label check and insert are one step.
    registry_writes: Mutex<()>,
}

/// WAL-backed store implementing both [`ResourceDayRegistry`] and
/// [`ReservationLedger`]. Cloning is cheap; clones share state.
///
/// Lock order: vendor book, then slots in ascending `SlotKey` order, then the
/// commit gate. No operation holds more than one vendor book.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

impl Store {
    /// Recover state from `wal_path` and start the WAL writer. Must be called
    /// inside a Tokio runtime.
    pub fn open(wal_path: &Path) -> io::Result<Self> {
        let (wal, events) = Wal::<Event>::recover(wal_path)?;
        let tables = Tables::rebuild(&events);
        tracing::info!(
            path = %wal_path.display(),
            events = events.len(),
            resource_days = tables.days.len(),
            reservations = tables.reservations.len(),
            "store recovered"
        );

        let (wal_tx, wal_rx) = mpsc::channel(WAL_CHANNEL_DEPTH);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            inner: Arc::new(Inner {
                tables,
                wal_tx,
                commit_gate: RwLock::new(()),
                registry_writes: Mutex::new(()),
            }),
        })
    }

    fn tables(&self) -> &Tables {
        &self.inner.tables
    }

    async fn wal_append(&self, event: Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .wal_tx
            .send(WalCommand::Append { event, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    /// Make `event` durable, then run `apply` against the tables. The deadline
    /// is checked last before the append; once the append succeeds the change
    /// is applied regardless.
    async fn commit(
        &self,
        event: Event,
        deadline: Deadline,
        apply: impl FnOnce(&Tables),
    ) -> Result<(), StoreError> {
        let _gate = deadline.run(self.inner.commit_gate.read()).await?;
        deadline.check()?;
        self.wal_append(event).await?;
        apply(self.tables());
        Ok(())
    }

    fn slot_handle(&self, key: SlotKey) -> Arc<Mutex<Slot>> {
        self.tables().slots.entry(key).or_default().clone()
    }

    fn vendor_handle(&self, vendor_id: VendorId) -> Arc<Mutex<VendorBook>> {
        self.tables().vendors.entry(vendor_id).or_default().clone()
    }

    async fn lock_slot(
        &self,
        key: SlotKey,
        deadline: Deadline,
    ) -> Result<OwnedMutexGuard<Slot>, StoreError> {
        deadline.run(self.slot_handle(key).lock_owned()).await
    }

    /// Lock two distinct slots, lower key first. Returns guards in argument order.
    async fn lock_slot_pair(
        &self,
        a: SlotKey,
        b: SlotKey,
        deadline: Deadline,
    ) -> Result<(OwnedMutexGuard<Slot>, OwnedMutexGuard<Slot>), StoreError> {
        if a < b {
            let ga = self.lock_slot(a, deadline).await?;
            let gb = self.lock_slot(b, deadline).await?;
            Ok((ga, gb))
        } else {
            let gb = self.lock_slot(b, deadline).await?;
            let ga = self.lock_slot(a, deadline).await?;
            Ok((ga, gb))
        }
    }

    async fn lock_vendor(
        &self,
        vendor_id: VendorId,
        deadline: Deadline,
    ) -> Result<OwnedMutexGuard<VendorBook>, StoreError> {
        deadline.run(self.vendor_handle(vendor_id).lock_owned()).await
    }

    /// Rewrite the WAL as a snapshot of current state and drop idle lock
    /// entries. Returns the number of records in the new log.
    pub async fn compact(&self) -> Result<usize, StoreError> {
        let _gate = self.inner.commit_gate.write().await;
        let pruned = self.tables().prune_idle();
        tracing::debug!(pruned, "idle slot and vendor entries dropped");
        let events = self.tables().snapshot();
        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.inner
            .wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))?;
        Ok(count)
    }

    pub async fn wal_appends_since_compact(&self) -> Result<u64, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))
    }
}

/// Run a write on its own task so that dropping the caller's future cannot
/// interrupt it between the WAL append and the in-memory apply.
async fn detached<T, F>(fut: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, StoreError>> + Send + 'static,
{
    tokio::spawn(fut)
        .await
        .map_err(|e| StoreError::Wal(format!("commit task failed: {e}")))?
}
