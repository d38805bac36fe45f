mod availability;
mod calendar;
mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod queries;

pub use availability::{SlotState, booked_ms, free_busy, free_spans, is_free, slots, subtract_intervals};
pub use calendar::{
    CalendarCell, CalendarColumn, CalendarGrid, CalendarRow, CalendarView, project, visible_slots,
    week_window,
};
pub use conflict::BookingPolicy;
pub(crate) use conflict::now_ms;
pub use error::EngineError;
pub use mutations::{MemberPatch, NewBooking, Reschedule, ResourcePatch};
pub use queries::{Occupancy, ResourceFreeBusy};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

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

/// Background task that owns the WAL and batches appends for group commit:
/// block for one append, drain whatever else is queued, flush once, answer all.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };

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

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so a half-written batch does not
    // leak into the next one.
    let flush_result = wal.flush_sync();
    match append_err {
        Some(e) => Err(e),
        None => flush_result,
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
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// One space's booking engine. All mutations of a resource's ledger happen
/// under that resource's write lock.
pub struct Engine {
    pub(super) resources: DashMap<Ulid, SharedResourceState>,
    pub(super) members: DashMap<Ulid, Member>,
    /// Reverse lookup: booking id → resource id.
    pub(super) booking_index: DashMap<Ulid, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) policy: BookingPolicy,
    /// Serializes resource/member directory writes.
    pub(super) directory_lock: tokio::sync::Mutex<()>,
    /// Mutations hold it shared for their whole duration; compaction holds it
    /// exclusively so no append can slip between snapshot and swap.
    pub(super) commit_gate: RwLock<()>,
}

/// Booking ids reserved in the index ahead of their WAL append, so a second
/// insert of the same id on another resource fails instead of committing
/// too. Dropping the claim without `commit` releases the ids.
pub(super) struct IdClaim<'a> {
    index: &'a DashMap<Ulid, Ulid>,
    ids: Vec<Ulid>,
}

impl<'a> IdClaim<'a> {
    pub(super) fn new(index: &'a DashMap<Ulid, Ulid>) -> Self {
        Self { index, ids: Vec::new() }
    }

    pub(super) fn claim(&mut self, id: Ulid, resource_id: Ulid) -> Result<(), EngineError> {
        match self.index.entry(id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(resource_id);
                self.ids.push(id);
                Ok(())
            }
        }
    }

    /// The bookings are applied; keep their index entries.
    pub(super) fn commit(mut self) {
        self.ids.clear();
    }
}

impl Drop for IdClaim<'_> {
    fn drop(&mut self) {
        for id in &self.ids {
            self.index.remove(id);
        }
    }
}

/// Apply an event to one resource (caller holds the lock).
fn apply_to_resource(rs: &mut ResourceState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ResourceUpdated { resource } => {
            rs.resource = resource.clone();
        }
        Event::BookingCreated { booking } => {
            store_booking(rs, booking.clone());
            index.insert(booking.id, booking.resource_id);
        }
        Event::BookingsCreated { bookings } => {
            let resource_id = rs.resource.id;
            for booking in bookings.iter().filter(|b| b.resource_id == resource_id) {
                store_booking(rs, booking.clone());
                index.insert(booking.id, booking.resource_id);
            }
        }
        Event::BookingStatusChanged { id, status, .. } => {
            if status.holds_slot() {
                rs.ledger.set_status(*id, *status);
            } else if let Some(mut booking) = rs.ledger.remove(*id) {
                booking.status = *status;
                rs.cancelled.push(booking);
            }
        }
        Event::BookingRescheduled { from_resource, booking } => {
            if rs.resource.id == *from_resource {
                rs.forget(booking.id);
            }
            if rs.resource.id == booking.resource_id {
                store_booking(rs, booking.clone());
                index.insert(booking.id, booking.resource_id);
            }
        }
        Event::BookingDeleted { id, .. } => {
            rs.forget(*id);
            index.remove(id);
        }
        // Directory events are handled at the map level.
        Event::ResourceCreated { .. } | Event::MemberCreated { .. } | Event::MemberUpdated { .. } => {}
    }
}

fn store_booking(rs: &mut ResourceState, booking: Booking) {
    if !booking.status.holds_slot() {
        rs.cancelled.push(booking);
        return;
    }
    let id = booking.id;
    if let Err(collisions) = rs.ledger.insert(booking) {
        // Only reachable with a log written by a build without the overlap check.
        tracing::warn!(
            "dropping booking {id} on {}: overlaps {} live booking(s)",
            rs.resource.id,
            collisions.len()
        );
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, policy: BookingPolicy) -> io::Result<Self> {
        let (wal, events) = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            resources: DashMap::new(),
            members: DashMap::new(),
            booking_index: DashMap::new(),
            wal_tx,
            notify,
            policy,
            directory_lock: tokio::sync::Mutex::new(()),
            commit_gate: RwLock::new(()),
        };

        // We are the sole owner of these locks during replay, so try_write
        // always succeeds. Never block here: this may run inside the runtime.
        for event in &events {
            match event {
                Event::ResourceCreated { resource } => {
                    engine
                        .resources
                        .insert(resource.id, Arc::new(RwLock::new(ResourceState::new(resource.clone()))));
                }
                Event::MemberCreated { member } | Event::MemberUpdated { member } => {
                    engine.members.insert(member.id, member.clone());
                }
                other => {
                    for resource_id in other.resource_ids() {
                        if let Some(rs) = engine.get_resource(&resource_id)
                            && let Ok(mut guard) = rs.try_write()
                        {
                            apply_to_resource(&mut guard, other, &engine.booking_index);
                        }
                    }
                }
            }
        }

        tracing::debug!(
            "replayed {} events: {} resources, {} members, {} bookings",
            events.len(),
            engine.resources.len(),
            engine.members.len(),
            engine.booking_index.len()
        );
        Ok(engine)
    }

    pub fn policy(&self) -> BookingPolicy {
        self.policy
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
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub fn get_resource_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_index.get(booking_id).map(|e| *e.value())
    }

    /// WAL-append, then apply to every locked resource, then notify.
    pub(super) async fn persist_and_apply(
        &self,
        guards: &mut [&mut ResourceState],
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        for rs in guards.iter_mut() {
            apply_to_resource(rs, event, &self.booking_index);
        }
        for resource_id in event.resource_ids() {
            self.notify.send(resource_id, event);
        }
        Ok(())
    }

    /// Directory events (resources, members) go to the WAL without a ledger.
    pub(super) async fn persist_directory(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        for resource_id in event.resource_ids() {
            self.notify.send(resource_id, event);
        }
        Ok(())
    }

    /// Lookup booking → resource and acquire that resource's write lock.
    /// Retries if the booking moves while we wait for the lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<ResourceState>), EngineError> {
        loop {
            let resource_id = self
                .get_resource_for_booking(booking_id)
                .ok_or(EngineError::NotFound(*booking_id))?;
            let rs = self
                .get_resource(&resource_id)
                .ok_or(EngineError::NotFound(resource_id))?;
            let guard = rs.write_owned().await;
            if guard.booking(*booking_id).is_some() {
                return Ok((resource_id, guard));
            }
            if self.get_resource_for_booking(booking_id) == Some(resource_id) {
                return Err(EngineError::NotFound(*booking_id));
            }
        }
    }
}
