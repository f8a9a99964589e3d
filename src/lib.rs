//! Scheduling core for a tutor marketplace.
//!
//! Tutors publish availability (one-off spans or RFC 5545 recurring rules);
//! the materializer turns that into concrete bookable slots out to a
//! rolling horizon; students hold, confirm, cancel, and reschedule through
//! the [`booking::BookingOrchestrator`]. Every state change is WAL-backed
//! and replayed on startup.
//!
//! Payments, external calendars, and notifications are reached only through
//! the traits in [`capabilities`], so the whole core runs against fakes in
//! tests.

pub mod booking;
pub mod busy_sync;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod expand;
pub mod limits;
pub mod model;
pub mod observability;
pub mod reaper;
pub mod store;
pub mod wal;

pub use booking::BookingOrchestrator;
pub use capabilities::{CalendarClient, Notifier, PaymentAuthorizer, PaymentMethod};
pub use config::Config;
pub use error::{BookingError, CalendarError, NotifyError, PaymentError, SchedulingError};
pub use store::SlotStore;
