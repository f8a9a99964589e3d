//! Booking orchestration: the hold / confirm / cancel / reschedule flows
//! that tie the slot state machine to payments and calendars.
//!
//! Ordering rules the flows live by:
//! - money moves before the slot commits, and is compensated if the slot
//!   commit then fails;
//! - on reschedule the new slot is secured before the old one is given up;
//! - calendar and notification calls never decide the outcome of anything.

use std::future::Future;
use std::sync::Arc;

use tokio::time::timeout;
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::capabilities::{CalendarClient, Notifier, PaymentAuthorizer, PaymentMethod};
use crate::error::{BookingError, NotifyError, PaymentError};
use crate::model::{now_ms, Booking, BookingStatus, Hold, Span, HOUR_MS};
use crate::observability;
use crate::store::SlotStore;

pub struct BookingOrchestrator {
    store: Arc<SlotStore>,
    payments: Arc<dyn PaymentAuthorizer>,
    calendar: Arc<dyn CalendarClient>,
    notifier: Arc<dyn Notifier>,
}

impl BookingOrchestrator {
    pub fn new(
        store: Arc<SlotStore>,
        payments: Arc<dyn PaymentAuthorizer>,
        calendar: Arc<dyn CalendarClient>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            payments,
            calendar,
            notifier,
        }
    }

    pub fn store(&self) -> &Arc<SlotStore> {
        &self.store
    }

    /// Pin a slot for the student for the configured TTL.
    pub async fn hold_slot(&self, slot_id: Ulid, student_id: Ulid) -> Result<Hold, BookingError> {
        self.store.try_hold(slot_id, student_id, now_ms()).await
    }

    /// Turn a live hold into a confirmed booking.
    ///
    /// Authorizes payment first, then commits the slot. If the slot commit
    /// fails after money moved, the charge is compensated before the error
    /// surfaces. A compensation failure is escalated rather than absorbed.
    pub async fn confirm(
        &self,
        slot_id: Ulid,
        student_id: Ulid,
        method: PaymentMethod,
    ) -> Result<Ulid, BookingError> {
        let now = now_ms();
        let slot = self
            .store
            .get_slot(&slot_id)
            .await
            .ok_or(BookingError::NotFound(slot_id))?;
        let hold_ok = slot
            .hold
            .is_some_and(|h| h.holder_id == student_id && !h.is_expired(now));
        if !hold_ok {
            return Err(BookingError::HoldExpiredOrMismatched(slot_id));
        }

        let rate = self
            .store
            .tutor_rate(&slot.tutor_id)
            .await
            .ok_or(BookingError::NotFound(slot.tutor_id))?;
        let price_cents = (rate as i64 * slot.span.duration_ms() / HOUR_MS) as u32;

        let booking_id = self
            .store
            .create_booking(student_id, slot.tutor_id, slot.span, slot_id, price_cents, None)
            .await?;

        let payment_ref = match self.authorize(student_id, price_cents, method).await {
            Ok(r) => r,
            Err(e) => {
                // The hold stays on the slot; the reaper frees it at TTL.
                self.store
                    .cancel_booking(booking_id, now_ms(), "payment authorization failed", false)
                    .await?;
                return Err(e.into());
            }
        };

        if let Err(e) = self.store.confirm_hold(slot_id, student_id, now_ms()).await {
            self.compensate(&payment_ref, price_cents).await?;
            self.store
                .cancel_booking(booking_id, now_ms(), "slot confirmation failed", false)
                .await?;
            return Err(e);
        }

        self.store
            .confirm_booking(booking_id, Some(payment_ref))
            .await?;

        let (tutor_event, student_event) = self
            .create_calendar_events(slot.tutor_id, student_id, slot.span)
            .await;
        if tutor_event.is_some() || student_event.is_some() {
            self.store
                .record_calendar_events(booking_id, tutor_event, student_event)
                .await?;
        }

        if let Some(b) = self.store.get_booking(&booking_id).await {
            self.notify("confirmation", self.notifier.booking_confirmed(&b))
                .await;
        }

        info!(booking = %booking_id, slot = %slot_id, student = %student_id, "booking confirmed");
        Ok(booking_id)
    }

    /// Cancel a booking, optionally refunding. Refund failure aborts the
    /// cancel with the booking intact, so money and state never disagree
    /// silently.
    pub async fn cancel(
        &self,
        booking_id: Ulid,
        reason: &str,
        refund: bool,
    ) -> Result<(), BookingError> {
        let booking = self
            .store
            .get_booking(&booking_id)
            .await
            .ok_or(BookingError::NotFound(booking_id))?;
        if booking.status.is_terminal() {
            return Err(BookingError::InvalidTransition {
                from: booking.status.as_str(),
                to: BookingStatus::Canceled.as_str(),
            });
        }

        let refunded = refund && booking.payment_ref.is_some();
        if refunded {
            let r = booking.payment_ref.as_deref().unwrap_or_default();
            self.compensate(r, booking.price_cents).await?;
        }

        match self.store.release_slot(booking.slot_id).await {
            Ok(()) => {}
            Err(e) => {
                // Tombstoned or closed slot; the booking still cancels.
                warn!(booking = %booking_id, slot = %booking.slot_id, error = %e,
                    "slot not released on cancel");
            }
        }

        self.delete_calendar_events(&booking).await;
        self.store
            .cancel_booking(booking_id, now_ms(), reason, refunded)
            .await?;

        if let Some(b) = self.store.get_booking(&booking_id).await {
            self.notify("cancellation", self.notifier.booking_canceled(&b, reason))
                .await;
        }
        Ok(())
    }

    /// Move a confirmed booking to a different slot. The new slot is held
    /// and committed before the old slot or booking are touched, so a
    /// failure anywhere leaves the original booking standing.
    pub async fn reschedule(
        &self,
        booking_id: Ulid,
        new_slot_id: Ulid,
        reason: &str,
    ) -> Result<Ulid, BookingError> {
        let booking = self
            .store
            .get_booking(&booking_id)
            .await
            .ok_or(BookingError::NotFound(booking_id))?;
        if booking.status != BookingStatus::Confirmed {
            return Err(BookingError::InvalidTransition {
                from: booking.status.as_str(),
                to: "rescheduled",
            });
        }
        let new_slot = self
            .store
            .get_slot(&new_slot_id)
            .await
            .ok_or(BookingError::NotFound(new_slot_id))?;

        self.store
            .try_hold(new_slot_id, booking.student_id, now_ms())
            .await?;
        if let Err(e) = self
            .store
            .confirm_hold(new_slot_id, booking.student_id, now_ms())
            .await
        {
            let _ = self.store.release_slot(new_slot_id).await;
            return Err(e);
        }

        // New slot is secured; now retire the old side.
        if let Err(e) = self.store.release_slot(booking.slot_id).await {
            warn!(booking = %booking_id, slot = %booking.slot_id, error = %e,
                "old slot not released on reschedule");
        }
        self.store
            .cancel_booking(booking_id, now_ms(), reason, false)
            .await?;

        // The charge carries over: same price, same payment ref.
        let new_id = self
            .store
            .create_booking(
                booking.student_id,
                booking.tutor_id,
                new_slot.span,
                new_slot_id,
                booking.price_cents,
                booking.payment_ref.clone(),
            )
            .await?;
        self.store.confirm_booking(new_id, None).await?;

        self.delete_calendar_events(&booking).await;
        let (tutor_event, student_event) = self
            .create_calendar_events(booking.tutor_id, booking.student_id, new_slot.span)
            .await;
        if tutor_event.is_some() || student_event.is_some() {
            self.store
                .record_calendar_events(new_id, tutor_event, student_event)
                .await?;
        }

        if let (Some(old), Some(new)) = (
            self.store.get_booking(&booking_id).await,
            self.store.get_booking(&new_id).await,
        ) {
            self.notify("reschedule", self.notifier.booking_rescheduled(&old, &new))
                .await;
        }

        info!(old = %booking_id, new = %new_id, slot = %new_slot_id, "booking rescheduled");
        Ok(new_id)
    }

    // ── Capability plumbing ──────────────────────────────────

    async fn authorize(
        &self,
        student_id: Ulid,
        amount_cents: u32,
        method: PaymentMethod,
    ) -> Result<String, PaymentError> {
        let mut last = PaymentError::AuthorizationFailed("no attempts".into());
        for attempt in 1..=self.store.config.payment_attempts {
            match timeout(
                self.store.config.capability_timeout,
                self.payments.authorize(student_id, amount_cents, method),
            )
            .await
            {
                Ok(Ok(r)) => return Ok(r),
                Ok(Err(e)) => last = e,
                Err(_) => last = PaymentError::AuthorizationFailed("timed out".into()),
            }
            warn!(student = %student_id, attempt, error = %last, "payment authorization attempt failed");
        }
        Err(last)
    }

    async fn compensate(&self, payment_ref: &str, amount_cents: u32) -> Result<(), PaymentError> {
        let result = match timeout(
            self.store.config.capability_timeout,
            self.payments.compensate(payment_ref, amount_cents),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Err(PaymentError::CompensationFailed("timed out".into())),
        };
        match result {
            Ok(()) => {
                metrics::counter!(observability::PAYMENT_COMPENSATIONS_TOTAL).increment(1);
                Ok(())
            }
            Err(e) => {
                metrics::counter!(observability::PAYMENT_COMPENSATION_FAILURES_TOTAL).increment(1);
                error!(payment_ref, error = %e, "payment compensation failed, manual reconciliation needed");
                Err(PaymentError::CompensationFailed(e.to_string()))
            }
        }
    }

    async fn create_calendar_events(
        &self,
        tutor_id: Ulid,
        student_id: Ulid,
        span: Span,
    ) -> (Option<String>, Option<String>) {
        let tutor_event = self.create_event(tutor_id, span, "Lesson (tutor)").await;
        let student_event = self.create_event(student_id, span, "Lesson").await;
        (tutor_event, student_event)
    }

    async fn create_event(&self, owner: Ulid, span: Span, title: &str) -> Option<String> {
        let result = match timeout(
            self.store.config.capability_timeout,
            self.calendar.create_event(owner, span, title),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => {
                metrics::counter!(observability::CALENDAR_FAILURES_TOTAL).increment(1);
                warn!(owner = %owner, "calendar create timed out");
                return None;
            }
        };
        match result {
            Ok(id) => Some(id),
            Err(e) => {
                metrics::counter!(observability::CALENDAR_FAILURES_TOTAL).increment(1);
                warn!(owner = %owner, error = %e, "calendar create failed");
                None
            }
        }
    }

    /// Deliver one notification, absorbing failures. `what` labels the log
    /// line and nothing else.
    async fn notify<F>(&self, what: &'static str, delivery: F)
    where
        F: Future<Output = Result<(), NotifyError>>,
    {
        let result = match timeout(self.store.config.capability_timeout, delivery).await {
            Ok(r) => r,
            Err(_) => Err(NotifyError::Undeliverable("timed out".into())),
        };
        if let Err(e) = result {
            metrics::counter!(observability::NOTIFY_FAILURES_TOTAL).increment(1);
            warn!(what, error = %e, "notification not delivered");
        }
    }

    async fn delete_calendar_events(&self, booking: &Booking) {
        for (owner, event) in [
            (booking.tutor_id, &booking.calendar_event_tutor),
            (booking.student_id, &booking.calendar_event_student),
        ] {
            let Some(event_id) = event else { continue };
            let result = match timeout(
                self.store.config.capability_timeout,
                self.calendar.delete_event(owner, event_id),
            )
            .await
            {
                Ok(r) => r,
                Err(_) => {
                    metrics::counter!(observability::CALENDAR_FAILURES_TOTAL).increment(1);
                    continue;
                }
            };
            if let Err(e) = result {
                metrics::counter!(observability::CALENDAR_FAILURES_TOTAL).increment(1);
                warn!(owner = %owner, error = %e, "calendar delete failed");
            }
        }
    }
}
