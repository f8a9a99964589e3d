use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC — the only time type.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;
pub const MINUTE_MS: Ms = 60_000;
pub const DAY_MS: Ms = 24 * HOUR_MS;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as Ms
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// A tutor's published availability. Recurring blocks carry an RFC 5545
/// RRULE string (FREQ, INTERVAL, BYDAY, BYHOUR); the block's span supplies
/// DTSTART and the occurrence duration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityBlock {
    pub id: Ulid,
    pub tutor_id: Ulid,
    pub span: Span,
    pub rrule: Option<String>,
    pub recurring: bool,
    /// Soft-delete tombstone. Revoked blocks stay on disk; read paths skip them.
    pub deleted_at: Option<Ms>,
}

impl AvailabilityBlock {
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// A blackout window. Expanded intervals overlapping a live time-off block
/// are dropped whole — no partial slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeOffBlock {
    pub id: Ulid,
    pub tutor_id: Ulid,
    pub span: Span,
    pub deleted_at: Option<Ms>,
}

impl TimeOffBlock {
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotStatus {
    Open,
    Held,
    Booked,
    Closed,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Open => "open",
            SlotStatus::Held => "held",
            SlotStatus::Booked => "booked",
            SlotStatus::Closed => "closed",
        }
    }

    /// Total transition table. Anything not listed is rejected with
    /// `InvalidTransition` — there are no implicit default transitions.
    pub fn can_become(&self, to: SlotStatus) -> bool {
        use SlotStatus::*;
        matches!(
            (self, to),
            (Open, Held)
                | (Held, Open)
                | (Held, Booked)
                | (Booked, Open)
                | (Open, Closed)
                | (Closed, Open)
        )
    }
}

/// Ephemeral hold on a slot. Present on the slot exactly while its status
/// is `Held`; expiry is enforced passively on confirm and actively by the
/// reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub holder_id: Ulid,
    pub acquired_at: Ms,
    pub expires_at: Ms,
}

impl Hold {
    pub fn is_expired(&self, now: Ms) -> bool {
        self.expires_at <= now
    }
}

/// The materialized bookable unit. At most one non-tombstoned slot per
/// (tutor_id, span.start) — the double-booking firewall.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub tutor_id: Ulid,
    pub span: Span,
    pub status: SlotStatus,
    pub hold: Option<Hold>,
    pub deleted_at: Option<Ms>,
}

impl Slot {
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    PendingPayment,
    Confirmed,
    Canceled,
    Completed,
    Refunded,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::PendingPayment => "pending_payment",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Canceled => "canceled",
            BookingStatus::Completed => "completed",
            BookingStatus::Refunded => "refunded",
        }
    }

    pub fn can_become(&self, to: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, to),
            (PendingPayment, Confirmed)
                | (PendingPayment, Canceled)
                | (Confirmed, Canceled)
                | (Confirmed, Completed)
                | (Confirmed, Refunded)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BookingStatus::Canceled | BookingStatus::Completed | BookingStatus::Refunded
        )
    }
}

/// A student↔tutor agreement over a slot. Status is driven solely by the
/// booking orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub student_id: Ulid,
    pub tutor_id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
    pub price_cents: u32,
    /// External charge reference. Unique across live bookings once set.
    pub payment_ref: Option<String>,
    pub calendar_event_tutor: Option<String>,
    pub calendar_event_student: Option<String>,
    pub slot_id: Ulid,
    pub notes: Option<String>,
}

impl Booking {
    pub fn new(
        id: Ulid,
        student_id: Ulid,
        tutor_id: Ulid,
        span: Span,
        slot_id: Ulid,
        price_cents: u32,
    ) -> Self {
        Self {
            id,
            student_id,
            tutor_id,
            span,
            status: BookingStatus::PendingPayment,
            price_cents,
            payment_ref: None,
            calendar_event_tutor: None,
            calendar_event_student: None,
            slot_id,
            notes: None,
        }
    }

    pub fn append_note(&mut self, note: &str) {
        match &mut self.notes {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(note);
            }
            None => self.notes = Some(note.to_string()),
        }
    }
}

/// Per-tutor state: published availability, time off, and the materialized
/// slot timeline. Slots are sorted by `span.start` and include tombstoned
/// rows (historical bookings reference them).
#[derive(Debug, Clone)]
pub struct TutorState {
    pub id: Ulid,
    pub hourly_rate_cents: u32,
    pub availability: Vec<AvailabilityBlock>,
    pub time_off: Vec<TimeOffBlock>,
    pub slots: Vec<Slot>,
}

impl TutorState {
    pub fn new(id: Ulid, hourly_rate_cents: u32) -> Self {
        Self {
            id,
            hourly_rate_cents,
            availability: Vec::new(),
            time_off: Vec::new(),
            slots: Vec::new(),
        }
    }

    /// Insert a slot maintaining sort order by span.start.
    pub fn insert_slot(&mut self, slot: Slot) {
        let pos = self
            .slots
            .binary_search_by_key(&slot.span.start, |s| s.span.start)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    pub fn slot(&self, id: &Ulid) -> Option<&Slot> {
        self.slots.iter().find(|s| s.id == *id)
    }

    pub fn slot_mut(&mut self, id: &Ulid) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|s| s.id == *id)
    }

    /// The non-tombstoned slot starting exactly at `start`, if any. The
    /// uniqueness invariant guarantees at most one.
    pub fn live_slot_at(&self, start: Ms) -> Option<&Slot> {
        let first = self.slots.partition_point(|s| s.span.start < start);
        self.slots[first..]
            .iter()
            .take_while(|s| s.span.start == start)
            .find(|s| s.is_live())
    }

    /// Non-tombstoned slots whose span overlaps the query window.
    /// Binary search skips slots starting at or after `query.end`.
    pub fn live_slots_overlapping(&self, query: &Span) -> impl Iterator<Item = &Slot> {
        let right = self.slots.partition_point(|s| s.span.start < query.end);
        self.slots[..right]
            .iter()
            .filter(move |s| s.is_live() && s.span.end > query.start)
    }

    pub fn live_blocks(&self) -> impl Iterator<Item = &AvailabilityBlock> {
        self.availability.iter().filter(|b| b.is_live())
    }

    pub fn live_time_off(&self) -> Vec<TimeOffBlock> {
        self.time_off.iter().filter(|t| t.is_live()).cloned().collect()
    }
}

/// WAL record format — flat, no nesting. Every durable mutation is one of
/// these, replayed in order on startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    TutorRegistered {
        id: Ulid,
        hourly_rate_cents: u32,
    },
    AvailabilityAdded {
        id: Ulid,
        tutor_id: Ulid,
        span: Span,
        rrule: Option<String>,
        recurring: bool,
    },
    AvailabilityRevoked {
        id: Ulid,
        tutor_id: Ulid,
        at: Ms,
    },
    TimeOffAdded {
        id: Ulid,
        tutor_id: Ulid,
        span: Span,
    },
    TimeOffRemoved {
        id: Ulid,
        tutor_id: Ulid,
        at: Ms,
    },
    SlotOpened {
        id: Ulid,
        tutor_id: Ulid,
        span: Span,
    },
    SlotHeld {
        id: Ulid,
        tutor_id: Ulid,
        holder_id: Ulid,
        acquired_at: Ms,
        expires_at: Ms,
    },
    SlotReleased {
        id: Ulid,
        tutor_id: Ulid,
    },
    SlotBooked {
        id: Ulid,
        tutor_id: Ulid,
    },
    SlotClosed {
        id: Ulid,
        tutor_id: Ulid,
    },
    SlotReopened {
        id: Ulid,
        tutor_id: Ulid,
    },
    SlotTombstoned {
        id: Ulid,
        tutor_id: Ulid,
        at: Ms,
    },
    BookingCreated {
        id: Ulid,
        student_id: Ulid,
        tutor_id: Ulid,
        span: Span,
        slot_id: Ulid,
        price_cents: u32,
        payment_ref: Option<String>,
    },
    BookingConfirmed {
        id: Ulid,
        payment_ref: Option<String>,
    },
    BookingCalendarLinked {
        id: Ulid,
        tutor_event: Option<String>,
        student_event: Option<String>,
    },
    BookingCanceled {
        id: Ulid,
        at: Ms,
        reason: String,
        refunded: bool,
    },
    BookingCompleted {
        id: Ulid,
    },
}

impl Event {
    /// The tutor whose state this event mutates, if any. Booking events are
    /// applied to the booking map instead.
    pub fn tutor_id(&self) -> Option<Ulid> {
        match self {
            Event::TutorRegistered { id, .. } => Some(*id),
            Event::AvailabilityAdded { tutor_id, .. }
            | Event::AvailabilityRevoked { tutor_id, .. }
            | Event::TimeOffAdded { tutor_id, .. }
            | Event::TimeOffRemoved { tutor_id, .. }
            | Event::SlotOpened { tutor_id, .. }
            | Event::SlotHeld { tutor_id, .. }
            | Event::SlotReleased { tutor_id, .. }
            | Event::SlotBooked { tutor_id, .. }
            | Event::SlotClosed { tutor_id, .. }
            | Event::SlotReopened { tutor_id, .. }
            | Event::SlotTombstoned { tutor_id, .. } => Some(*tutor_id),
            Event::BookingCreated { .. }
            | Event::BookingConfirmed { .. }
            | Event::BookingCalendarLinked { .. }
            | Event::BookingCanceled { .. }
            | Event::BookingCompleted { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn slot_transition_table_is_total() {
        use SlotStatus::*;
        assert!(Open.can_become(Held));
        assert!(Held.can_become(Open));
        assert!(Held.can_become(Booked));
        assert!(Booked.can_become(Open));
        assert!(Open.can_become(Closed));
        assert!(Closed.can_become(Open));

        assert!(!Open.can_become(Booked)); // must pass through Held
        assert!(!Held.can_become(Closed));
        assert!(!Booked.can_become(Closed));
        assert!(!Closed.can_become(Held));
        assert!(!Booked.can_become(Held));
    }

    #[test]
    fn booking_transition_table() {
        use BookingStatus::*;
        assert!(PendingPayment.can_become(Confirmed));
        assert!(PendingPayment.can_become(Canceled));
        assert!(Confirmed.can_become(Canceled));
        assert!(Confirmed.can_become(Completed));
        assert!(Confirmed.can_become(Refunded));

        assert!(!Canceled.can_become(Confirmed));
        assert!(!Completed.can_become(Canceled));
        assert!(!Refunded.can_become(Confirmed));
        assert!(!PendingPayment.can_become(Completed));

        assert!(Canceled.is_terminal());
        assert!(Completed.is_terminal());
        assert!(Refunded.is_terminal());
        assert!(!Confirmed.is_terminal());
    }

    #[test]
    fn hold_expiry_boundary() {
        let h = Hold {
            holder_id: Ulid::new(),
            acquired_at: 1000,
            expires_at: 2000,
        };
        assert!(!h.is_expired(1999));
        assert!(h.is_expired(2000)); // expiry instant counts as expired
        assert!(h.is_expired(2001));
    }

    fn open_slot(tutor_id: Ulid, start: Ms, end: Ms) -> Slot {
        Slot {
            id: Ulid::new(),
            tutor_id,
            span: Span::new(start, end),
            status: SlotStatus::Open,
            hold: None,
            deleted_at: None,
        }
    }

    #[test]
    fn slot_ordering_maintained() {
        let tid = Ulid::new();
        let mut ts = TutorState::new(tid, 5000);
        ts.insert_slot(open_slot(tid, 300, 400));
        ts.insert_slot(open_slot(tid, 100, 200));
        ts.insert_slot(open_slot(tid, 200, 300));
        assert_eq!(ts.slots[0].span.start, 100);
        assert_eq!(ts.slots[1].span.start, 200);
        assert_eq!(ts.slots[2].span.start, 300);
    }

    #[test]
    fn live_slot_at_skips_tombstoned() {
        let tid = Ulid::new();
        let mut ts = TutorState::new(tid, 5000);
        let mut dead = open_slot(tid, 100, 200);
        dead.deleted_at = Some(50);
        ts.insert_slot(dead);
        assert!(ts.live_slot_at(100).is_none());

        let live = open_slot(tid, 100, 200);
        let live_id = live.id;
        ts.insert_slot(live);
        assert_eq!(ts.live_slot_at(100).map(|s| s.id), Some(live_id));
    }

    #[test]
    fn live_slots_overlapping_half_open() {
        let tid = Ulid::new();
        let mut ts = TutorState::new(tid, 5000);
        ts.insert_slot(open_slot(tid, 100, 200));
        ts.insert_slot(open_slot(tid, 200, 300));
        ts.insert_slot(open_slot(tid, 1000, 1100));

        let hits: Vec<_> = ts.live_slots_overlapping(&Span::new(200, 400)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(200, 300));
    }

    #[test]
    fn note_appending() {
        let mut b = Booking::new(
            Ulid::new(),
            Ulid::new(),
            Ulid::new(),
            Span::new(0, HOUR_MS),
            Ulid::new(),
            5000,
        );
        b.append_note("first");
        b.append_note("second");
        assert_eq!(b.notes.as_deref(), Some("first\nsecond"));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::SlotHeld {
            id: Ulid::new(),
            tutor_id: Ulid::new(),
            holder_id: Ulid::new(),
            acquired_at: 1000,
            expires_at: 601_000,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
