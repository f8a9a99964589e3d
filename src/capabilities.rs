//! External capability seams. The scheduling core never talks to payment
//! or calendar providers directly; it goes through these traits so the
//! orchestrator can be driven with fakes in tests and real adapters in
//! production.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{CalendarError, NotifyError, PaymentError};
use crate::model::{Booking, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentMethod {
    Credits,
    Card,
    Subscription,
}

/// Charge authorization and its inverse. `authorize` returns an opaque
/// provider reference that later identifies the charge to `compensate`.
#[async_trait]
pub trait PaymentAuthorizer: Send + Sync {
    async fn authorize(
        &self,
        student_id: Ulid,
        amount_cents: u32,
        method: PaymentMethod,
    ) -> Result<String, PaymentError>;

    async fn compensate(&self, payment_ref: &str, amount_cents: u32) -> Result<(), PaymentError>;
}

/// External calendar integration. Every call through this trait is
/// best-effort from the core's point of view.
#[async_trait]
pub trait CalendarClient: Send + Sync {
    /// Create an event on `owner_id`'s calendar, returning the provider's
    /// event id.
    async fn create_event(
        &self,
        owner_id: Ulid,
        span: Span,
        title: &str,
    ) -> Result<String, CalendarError>;

    async fn delete_event(&self, owner_id: Ulid, event_id: &str) -> Result<(), CalendarError>;

    /// Busy intervals on the owner's external calendar within `window`.
    async fn busy_intervals(&self, owner_id: Ulid, window: Span)
        -> Result<Vec<Span>, CalendarError>;
}

/// Outbound notifications to both parties of a booking. Fire-and-forget:
/// a delivery failure is logged and counted, never surfaced to the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn booking_confirmed(&self, booking: &Booking) -> Result<(), NotifyError>;

    async fn booking_canceled(&self, booking: &Booking, reason: &str) -> Result<(), NotifyError>;

    /// Both sides of a reschedule: the canceled original and its
    /// replacement.
    async fn booking_rescheduled(
        &self,
        old: &Booking,
        new: &Booking,
    ) -> Result<(), NotifyError>;
}
