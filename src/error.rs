use ulid::Ulid;

use crate::model::Span;

/// Errors from availability publication and recurrence expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulingError {
    InvalidRecurrenceRule(String),
    HorizonExceeded { requested_days: u32, max_days: u32 },
    InvalidWindow(Span),
    UnknownTutor(Ulid),
    Storage(String),
}

impl std::fmt::Display for SchedulingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulingError::InvalidRecurrenceRule(msg) => {
                write!(f, "invalid recurrence rule: {msg}")
            }
            SchedulingError::HorizonExceeded {
                requested_days,
                max_days,
            } => write!(
                f,
                "horizon of {requested_days} days exceeds maximum of {max_days}"
            ),
            SchedulingError::InvalidWindow(span) => {
                write!(f, "invalid window [{}, {})", span.start, span.end)
            }
            SchedulingError::UnknownTutor(id) => write!(f, "unknown tutor: {id}"),
            SchedulingError::Storage(msg) => write!(f, "storage error: {msg}"),
        }
    }
}

impl std::error::Error for SchedulingError {}

/// Errors from slot transitions and the booking lifecycle. Slot-level
/// conflicts are never retried internally — they surface to the caller,
/// who must pick another slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingError {
    SlotUnavailable(Ulid),
    HoldExpiredOrMismatched(Ulid),
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
    SlotNotClosable(Ulid),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    Payment(PaymentError),
    Storage(String),
}

impl std::fmt::Display for BookingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookingError::SlotUnavailable(id) => write!(f, "slot not available: {id}"),
            BookingError::HoldExpiredOrMismatched(id) => {
                write!(f, "hold expired or held by someone else: {id}")
            }
            BookingError::InvalidTransition { from, to } => {
                write!(f, "invalid transition: {from} -> {to}")
            }
            BookingError::SlotNotClosable(id) => {
                write!(f, "slot cannot be closed while held or booked: {id}")
            }
            BookingError::NotFound(id) => write!(f, "not found: {id}"),
            BookingError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            BookingError::Payment(e) => write!(f, "payment error: {e}"),
            BookingError::Storage(msg) => write!(f, "storage error: {msg}"),
        }
    }
}

impl std::error::Error for BookingError {}

impl From<PaymentError> for BookingError {
    fn from(e: PaymentError) -> Self {
        BookingError::Payment(e)
    }
}

/// Payment capability failures. A compensation failure after a lost slot is
/// an inconsistency the system refuses to guess its way out of — it is
/// logged and escalated for manual reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentError {
    AuthorizationFailed(String),
    CompensationFailed(String),
}

impl std::fmt::Display for PaymentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentError::AuthorizationFailed(msg) => {
                write!(f, "payment authorization failed: {msg}")
            }
            PaymentError::CompensationFailed(msg) => {
                write!(f, "payment compensation failed: {msg}")
            }
        }
    }
}

impl std::error::Error for PaymentError {}

/// Calendar capability failures. Always non-fatal to booking state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalendarError {
    Unreachable(String),
}

impl std::fmt::Display for CalendarError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CalendarError::Unreachable(msg) => write!(f, "calendar unreachable: {msg}"),
        }
    }
}

impl std::error::Error for CalendarError {}

/// Notification delivery failures. Never fatal to booking state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
    Undeliverable(String),
}

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyError::Undeliverable(msg) => write!(f, "notification undeliverable: {msg}"),
        }
    }
}

impl std::error::Error for NotifyError {}
