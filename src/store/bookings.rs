//! Booking record mutations. Each one takes the booking's own write lock,
//! checks the status table, WAL-appends, then applies to the locked record,
//! mirroring how slot transitions work against tutor state.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::error::BookingError;
use crate::limits::MAX_NOTE_LEN;
use crate::model::{Booking, BookingStatus, Event, Ms, Span};
use crate::observability;

use super::{SharedBooking, SlotStore};

impl SlotStore {
    pub fn booking(&self, id: &Ulid) -> Option<SharedBooking> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    /// The booking currently claiming `payment_ref`, if it is still live.
    /// Terminal bookings release their claim.
    pub async fn payment_ref_holder(&self, payment_ref: &str) -> Option<Ulid> {
        let holder = self.payment_refs.get(payment_ref).map(|e| *e.value())?;
        let arc = self.booking(&holder)?;
        let status = arc.read().await.status;
        (!status.is_terminal()).then_some(holder)
    }

    /// Atomically reserve `payment_ref` for `booking_id`. The map entry is
    /// the uniqueness enforcement: insert-if-vacant serializes racing
    /// claims on the shard lock, so at most one caller wins before any WAL
    /// await happens. A stale claim left by a terminal holder is evicted
    /// and the claim retried.
    async fn claim_payment_ref(
        &self,
        payment_ref: &str,
        booking_id: Ulid,
    ) -> Result<(), BookingError> {
        loop {
            // Scope the entry guard: no awaits while a shard lock is held.
            let holder = match self.payment_refs.entry(payment_ref.to_string()) {
                dashmap::Entry::Vacant(v) => {
                    v.insert(booking_id);
                    return Ok(());
                }
                dashmap::Entry::Occupied(o) => *o.get(),
            };
            if holder == booking_id {
                return Ok(());
            }
            let live = match self.booking(&holder) {
                Some(arc) => !arc.read().await.status.is_terminal(),
                // Reservation for a create that has not landed in the
                // bookings map yet.
                None => true,
            };
            if live {
                return Err(BookingError::AlreadyExists(holder));
            }
            self.payment_refs.remove_if(payment_ref, |_, h| *h == holder);
        }
    }

    fn release_payment_ref(&self, payment_ref: &str, booking_id: Ulid) {
        self.payment_refs
            .remove_if(payment_ref, |_, h| *h == booking_id);
    }

    pub async fn create_booking(
        &self,
        student_id: Ulid,
        tutor_id: Ulid,
        span: Span,
        slot_id: Ulid,
        price_cents: u32,
        payment_ref: Option<String>,
    ) -> Result<Ulid, BookingError> {
        let id = Ulid::new();
        if let Some(r) = &payment_ref {
            self.claim_payment_ref(r, id).await?;
        }

        if let Err(e) = self
            .wal_append(&Event::BookingCreated {
                id,
                student_id,
                tutor_id,
                span,
                slot_id,
                price_cents,
                payment_ref: payment_ref.clone(),
            })
            .await
        {
            if let Some(r) = &payment_ref {
                self.release_payment_ref(r, id);
            }
            return Err(BookingError::Storage(e.to_string()));
        }

        let mut booking = Booking::new(id, student_id, tutor_id, span, slot_id, price_cents);
        booking.payment_ref = payment_ref;
        self.bookings.insert(id, Arc::new(RwLock::new(booking)));
        Ok(id)
    }

    /// PendingPayment → Confirmed, recording the charge reference.
    pub async fn confirm_booking(
        &self,
        id: Ulid,
        payment_ref: Option<String>,
    ) -> Result<(), BookingError> {
        let arc = self.booking(&id).ok_or(BookingError::NotFound(id))?;
        let mut b = arc.write().await;
        if !b.status.can_become(BookingStatus::Confirmed) {
            return Err(BookingError::InvalidTransition {
                from: b.status.as_str(),
                to: BookingStatus::Confirmed.as_str(),
            });
        }
        if let Some(r) = &payment_ref {
            self.claim_payment_ref(r, id).await?;
        }

        if let Err(e) = self
            .wal_append(&Event::BookingConfirmed {
                id,
                payment_ref: payment_ref.clone(),
            })
            .await
        {
            if let Some(r) = &payment_ref {
                self.release_payment_ref(r, id);
            }
            return Err(BookingError::Storage(e.to_string()));
        }

        b.status = BookingStatus::Confirmed;
        if let Some(r) = payment_ref {
            b.payment_ref = Some(r);
        }
        metrics::counter!(observability::BOOKINGS_CONFIRMED_TOTAL).increment(1);
        info!(booking = %id, "booking confirmed");
        Ok(())
    }

    /// Attach calendar event ids once the (best-effort) calendar calls have
    /// settled. Either side may be None after a calendar failure.
    pub async fn record_calendar_events(
        &self,
        id: Ulid,
        tutor_event: Option<String>,
        student_event: Option<String>,
    ) -> Result<(), BookingError> {
        let arc = self.booking(&id).ok_or(BookingError::NotFound(id))?;
        let mut b = arc.write().await;

        self.wal_append(&Event::BookingCalendarLinked {
            id,
            tutor_event: tutor_event.clone(),
            student_event: student_event.clone(),
        })
        .await
        .map_err(|e| BookingError::Storage(e.to_string()))?;

        b.calendar_event_tutor = tutor_event;
        b.calendar_event_student = student_event;
        Ok(())
    }

    /// Terminal cancel. `refunded` picks between Canceled and Refunded; the
    /// reason lands in the booking notes. Releases the payment ref claim.
    pub async fn cancel_booking(
        &self,
        id: Ulid,
        now: Ms,
        reason: &str,
        refunded: bool,
    ) -> Result<(), BookingError> {
        let target = if refunded {
            BookingStatus::Refunded
        } else {
            BookingStatus::Canceled
        };
        let arc = self.booking(&id).ok_or(BookingError::NotFound(id))?;
        let mut b = arc.write().await;
        if !b.status.can_become(target) {
            return Err(BookingError::InvalidTransition {
                from: b.status.as_str(),
                to: target.as_str(),
            });
        }
        let mut reason = reason.to_string();
        if reason.len() > MAX_NOTE_LEN {
            let mut cut = MAX_NOTE_LEN;
            while !reason.is_char_boundary(cut) {
                cut -= 1;
            }
            reason.truncate(cut);
        }

        self.wal_append(&Event::BookingCanceled {
            id,
            at: now,
            reason: reason.clone(),
            refunded,
        })
        .await
        .map_err(|e| BookingError::Storage(e.to_string()))?;

        b.status = target;
        b.append_note(&reason);
        if let Some(r) = &b.payment_ref {
            self.payment_refs.remove_if(r, |_, holder| *holder == id);
        }
        metrics::counter!(observability::BOOKINGS_CANCELED_TOTAL, "refunded" => refunded.to_string())
            .increment(1);
        info!(booking = %id, refunded, "booking canceled");
        Ok(())
    }

    /// Confirmed → Completed, once the lesson's end time has passed.
    pub async fn complete_booking(&self, id: Ulid) -> Result<(), BookingError> {
        let arc = self.booking(&id).ok_or(BookingError::NotFound(id))?;
        let mut b = arc.write().await;
        if !b.status.can_become(BookingStatus::Completed) {
            return Err(BookingError::InvalidTransition {
                from: b.status.as_str(),
                to: BookingStatus::Completed.as_str(),
            });
        }

        self.wal_append(&Event::BookingCompleted { id })
            .await
            .map_err(|e| BookingError::Storage(e.to_string()))?;

        b.status = BookingStatus::Completed;
        metrics::counter!(observability::BOOKINGS_COMPLETED_TOTAL).increment(1);
        Ok(())
    }
}
