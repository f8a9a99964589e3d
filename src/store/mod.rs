//! Durable slot store.
//!
//! Per-tutor state lives behind one `RwLock`, so every slot transition for a
//! tutor serializes on that lock. Cross-tutor operations only touch the
//! concurrent maps. Mutations WAL-append before touching memory; startup
//! replays the log to rebuild everything.

mod bookings;
mod materializer;
mod queries;
mod transitions;

pub use materializer::run_materializer;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::config::Config;
use crate::error::BookingError;
use crate::model::{
    AvailabilityBlock, Booking, BookingStatus, Event, Hold, Slot, SlotStatus, TimeOffBlock,
    TutorState,
};
use crate::wal::Wal;

pub type SharedTutorState = Arc<RwLock<TutorState>>;
pub type SharedBooking = Arc<RwLock<Booking>>;

pub(crate) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
}

/// Background task owning the WAL. Batches whatever appends are queued when
/// it wakes, commits them with one fsync, then acks every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(WalCommand::Append { event, response }) = rx.recv().await {
        let mut batch = vec![(event, response)];
        while let Ok(WalCommand::Append { event, response }) = rx.try_recv() {
            batch.push((event, response));
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
            .record(batch.len() as f64);
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
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partial bytes from this failed
    // batch don't ride along with the next one.
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

pub struct SlotStore {
    pub(crate) tutors: DashMap<Ulid, SharedTutorState>,
    /// Reverse lookup: slot id → tutor id. Tombstoned slots stay indexed;
    /// historical bookings still resolve through them.
    pub(crate) slot_to_tutor: DashMap<Ulid, Ulid>,
    pub(crate) bookings: DashMap<Ulid, SharedBooking>,
    /// payment_ref → booking currently claiming it. Enforces uniqueness
    /// across live bookings.
    pub(crate) payment_refs: DashMap<String, Ulid>,
    pub(crate) wal_tx: mpsc::Sender<WalCommand>,
    pub config: Config,
}

impl SlotStore {
    /// Open the store at `wal_path`, replaying any existing log. Spawns the
    /// WAL writer task, so this must run inside a tokio runtime.
    pub fn open(wal_path: PathBuf, config: Config) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            tutors: DashMap::new(),
            slot_to_tutor: DashMap::new(),
            bookings: DashMap::new(),
            payment_refs: DashMap::new(),
            wal_tx,
            config,
        };

        // Sole owner of every Arc during replay, so try_write never blocks.
        // blocking_write is off the table here because open may be called
        // from async context.
        for event in &events {
            match event {
                Event::TutorRegistered {
                    id,
                    hourly_rate_cents,
                } => {
                    store.tutors.insert(
                        *id,
                        Arc::new(RwLock::new(TutorState::new(*id, *hourly_rate_cents))),
                    );
                }
                other => {
                    if let Some(tutor_id) = other.tutor_id() {
                        if let Some(entry) = store.tutors.get(&tutor_id) {
                            let ts_arc = entry.value().clone();
                            drop(entry);
                            let mut guard =
                                ts_arc.try_write().expect("replay: uncontended write");
                            store.apply_tutor_event(&mut guard, other);
                        }
                    } else {
                        store.apply_booking_event(other);
                    }
                }
            }
        }

        Ok(store)
    }

    pub fn tutor(&self, id: &Ulid) -> Option<SharedTutorState> {
        self.tutors.get(id).map(|e| e.value().clone())
    }

    pub fn tutor_ids(&self) -> Vec<Ulid> {
        self.tutors.iter().map(|e| *e.key()).collect()
    }

    pub fn tutor_for_slot(&self, slot_id: &Ulid) -> Option<Ulid> {
        self.slot_to_tutor.get(slot_id).map(|e| *e.value())
    }

    /// Write one event through the group-commit writer and wait for its
    /// fsync ack.
    pub(crate) async fn wal_append(&self, event: &Event) -> io::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "WAL writer shut down"))?;
        rx.await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "WAL writer dropped response"))?
    }

    /// WAL-append then apply to in-memory tutor state. Caller holds the
    /// tutor's write lock, so the check that justified the event still holds
    /// when it lands.
    pub(crate) async fn persist_and_apply(
        &self,
        ts: &mut TutorState,
        event: &Event,
    ) -> io::Result<()> {
        self.wal_append(event).await?;
        self.apply_tutor_event(ts, event);
        Ok(())
    }

    /// Lookup slot → tutor and take the tutor's write lock.
    pub(crate) async fn resolve_slot_write(
        &self,
        slot_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<TutorState>), BookingError> {
        let tutor_id = self
            .tutor_for_slot(slot_id)
            .ok_or(BookingError::NotFound(*slot_id))?;
        let ts = self
            .tutor(&tutor_id)
            .ok_or(BookingError::NotFound(tutor_id))?;
        Ok((tutor_id, ts.write_owned().await))
    }

    /// Apply a tutor-scoped event to state. No locking, no validation — the
    /// mutation path validated before persisting, and replay trusts the log.
    pub(crate) fn apply_tutor_event(&self, ts: &mut TutorState, event: &Event) {
        match event {
            Event::AvailabilityAdded {
                id,
                tutor_id,
                span,
                rrule,
                recurring,
            } => {
                ts.availability.push(AvailabilityBlock {
                    id: *id,
                    tutor_id: *tutor_id,
                    span: *span,
                    rrule: rrule.clone(),
                    recurring: *recurring,
                    deleted_at: None,
                });
            }
            Event::AvailabilityRevoked { id, at, .. } => {
                if let Some(block) = ts.availability.iter_mut().find(|b| b.id == *id) {
                    block.deleted_at = Some(*at);
                }
            }
            Event::TimeOffAdded { id, tutor_id, span } => {
                ts.time_off.push(TimeOffBlock {
                    id: *id,
                    tutor_id: *tutor_id,
                    span: *span,
                    deleted_at: None,
                });
            }
            Event::TimeOffRemoved { id, at, .. } => {
                if let Some(block) = ts.time_off.iter_mut().find(|t| t.id == *id) {
                    block.deleted_at = Some(*at);
                }
            }
            Event::SlotOpened { id, tutor_id, span } => {
                ts.insert_slot(Slot {
                    id: *id,
                    tutor_id: *tutor_id,
                    span: *span,
                    status: SlotStatus::Open,
                    hold: None,
                    deleted_at: None,
                });
                self.slot_to_tutor.insert(*id, *tutor_id);
            }
            Event::SlotHeld {
                id,
                holder_id,
                acquired_at,
                expires_at,
                ..
            } => {
                if let Some(slot) = ts.slot_mut(id) {
                    slot.status = SlotStatus::Held;
                    slot.hold = Some(Hold {
                        holder_id: *holder_id,
                        acquired_at: *acquired_at,
                        expires_at: *expires_at,
                    });
                }
            }
            Event::SlotReleased { id, .. } | Event::SlotReopened { id, .. } => {
                if let Some(slot) = ts.slot_mut(id) {
                    slot.status = SlotStatus::Open;
                    slot.hold = None;
                }
            }
            Event::SlotBooked { id, .. } => {
                if let Some(slot) = ts.slot_mut(id) {
                    slot.status = SlotStatus::Booked;
                    slot.hold = None;
                }
            }
            Event::SlotClosed { id, .. } => {
                if let Some(slot) = ts.slot_mut(id) {
                    slot.status = SlotStatus::Closed;
                }
            }
            Event::SlotTombstoned { id, at, .. } => {
                if let Some(slot) = ts.slot_mut(id) {
                    slot.deleted_at = Some(*at);
                }
            }
            Event::TutorRegistered { .. }
            | Event::BookingCreated { .. }
            | Event::BookingConfirmed { .. }
            | Event::BookingCalendarLinked { .. }
            | Event::BookingCanceled { .. }
            | Event::BookingCompleted { .. } => {}
        }
    }

    /// Apply a booking event during replay. Replay is single-threaded, so
    /// the try_writes never contend. Live mutations instead hold the booking
    /// lock across their persist-then-apply sequence (see bookings.rs).
    fn apply_booking_event(&self, event: &Event) {
        match event {
            Event::BookingCreated {
                id,
                student_id,
                tutor_id,
                span,
                slot_id,
                price_cents,
                payment_ref,
            } => {
                let mut booking =
                    Booking::new(*id, *student_id, *tutor_id, *span, *slot_id, *price_cents);
                if let Some(r) = payment_ref {
                    booking.payment_ref = Some(r.clone());
                    self.payment_refs.insert(r.clone(), *id);
                }
                self.bookings.insert(*id, Arc::new(RwLock::new(booking)));
            }
            Event::BookingConfirmed { id, payment_ref } => {
                if let Some(entry) = self.bookings.get(id) {
                    let mut b = entry.try_write().expect("booking: uncontended write");
                    b.status = BookingStatus::Confirmed;
                    if let Some(r) = payment_ref {
                        b.payment_ref = Some(r.clone());
                        self.payment_refs.insert(r.clone(), *id);
                    }
                }
            }
            Event::BookingCalendarLinked {
                id,
                tutor_event,
                student_event,
            } => {
                if let Some(entry) = self.bookings.get(id) {
                    let mut b = entry.try_write().expect("booking: uncontended write");
                    b.calendar_event_tutor = tutor_event.clone();
                    b.calendar_event_student = student_event.clone();
                }
            }
            Event::BookingCanceled {
                id,
                reason,
                refunded,
                ..
            } => {
                if let Some(entry) = self.bookings.get(id) {
                    let mut b = entry.try_write().expect("booking: uncontended write");
                    b.status = if *refunded {
                        BookingStatus::Refunded
                    } else {
                        BookingStatus::Canceled
                    };
                    b.append_note(reason);
                    // Terminal bookings stop claiming their payment ref.
                    if let Some(r) = &b.payment_ref {
                        self.payment_refs.remove_if(r, |_, holder| holder == id);
                    }
                }
            }
            Event::BookingCompleted { id } => {
                if let Some(entry) = self.bookings.get(id) {
                    let mut b = entry.try_write().expect("booking: uncontended write");
                    b.status = BookingStatus::Completed;
                }
            }
            _ => {}
        }
    }
}
