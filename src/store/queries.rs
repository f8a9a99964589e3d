//! Read paths. Everything here clones out of the locks; callers never hold
//! store state across their own awaits.

use ulid::Ulid;

use crate::error::SchedulingError;
use crate::expand;
use crate::model::{Booking, BookingStatus, Ms, Slot, SlotStatus, Span, DAY_MS};

use super::SlotStore;

impl SlotStore {
    /// Preview expansion for a tutor over the next `horizon_days` without
    /// materializing anything. Capped at the configured maximum horizon.
    pub async fn expand(
        &self,
        tutor_id: Ulid,
        horizon_days: u32,
        now: Ms,
    ) -> Result<Vec<Span>, SchedulingError> {
        if horizon_days == 0 {
            return Err(SchedulingError::InvalidWindow(Span {
                start: now,
                end: now,
            }));
        }
        if horizon_days > self.config.max_horizon_days {
            return Err(SchedulingError::HorizonExceeded {
                requested_days: horizon_days,
                max_days: self.config.max_horizon_days,
            });
        }
        let window = Span::new(now, now + horizon_days as Ms * DAY_MS);
        let ts = self
            .tutor(&tutor_id)
            .ok_or(SchedulingError::UnknownTutor(tutor_id))?;
        let guard = ts.read().await;
        expand::expand_tutor(&guard.availability, &guard.time_off, window)
    }

    /// Open, live slots overlapping `window`, sorted by start. This is the
    /// student-facing "what can I book" query, so the window is capped at
    /// the configured maximum horizon.
    pub async fn open_slots(
        &self,
        tutor_id: Ulid,
        window: Span,
    ) -> Result<Vec<Slot>, SchedulingError> {
        if window.start >= window.end {
            return Err(SchedulingError::InvalidWindow(window));
        }
        // Compare in milliseconds so a window of max days plus a partial
        // day is still over the cap.
        if window.duration_ms() > self.config.max_horizon_days as Ms * DAY_MS {
            return Err(SchedulingError::HorizonExceeded {
                requested_days: (window.duration_ms() as u64).div_ceil(DAY_MS as u64) as u32,
                max_days: self.config.max_horizon_days,
            });
        }

        let ts = self
            .tutor(&tutor_id)
            .ok_or(SchedulingError::UnknownTutor(tutor_id))?;
        let guard = ts.read().await;
        Ok(guard
            .live_slots_overlapping(&window)
            .filter(|s| s.status == SlotStatus::Open)
            .cloned()
            .collect())
    }

    /// All live slots in the window regardless of status. Tutor dashboard
    /// view.
    pub async fn slots_in_window(
        &self,
        tutor_id: Ulid,
        window: Span,
    ) -> Result<Vec<Slot>, SchedulingError> {
        let ts = self
            .tutor(&tutor_id)
            .ok_or(SchedulingError::UnknownTutor(tutor_id))?;
        let guard = ts.read().await;
        Ok(guard.live_slots_overlapping(&window).cloned().collect())
    }

    pub async fn get_slot(&self, slot_id: &Ulid) -> Option<Slot> {
        let tutor_id = self.tutor_for_slot(slot_id)?;
        let ts = self.tutor(&tutor_id)?;
        let guard = ts.read().await;
        guard.slot(slot_id).cloned()
    }

    pub async fn get_booking(&self, id: &Ulid) -> Option<Booking> {
        let arc = self.booking(id)?;
        let b = arc.read().await;
        Some(b.clone())
    }

    pub async fn bookings_for_student(&self, student_id: Ulid) -> Vec<Booking> {
        let arcs: Vec<_> = self.bookings.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for arc in arcs {
            let b = arc.read().await;
            if b.student_id == student_id {
                out.push(b.clone());
            }
        }
        out.sort_by_key(|b| b.span.start);
        out
    }

    pub async fn bookings_for_tutor(&self, tutor_id: Ulid) -> Vec<Booking> {
        let arcs: Vec<_> = self.bookings.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for arc in arcs {
            let b = arc.read().await;
            if b.tutor_id == tutor_id {
                out.push(b.clone());
            }
        }
        out.sort_by_key(|b| b.span.start);
        out
    }

    pub async fn tutor_rate(&self, tutor_id: &Ulid) -> Option<u32> {
        let ts = self.tutor(tutor_id)?;
        let guard = ts.read().await;
        Some(guard.hourly_rate_cents)
    }

    /// Slot ids carrying a hold that has expired as of `now`. The reaper
    /// releases these one by one, re-checking under each tutor lock.
    pub async fn collect_expired_holds(&self, now: Ms) -> Vec<Ulid> {
        let mut out = Vec::new();
        for tutor_id in self.tutor_ids() {
            let Some(ts) = self.tutor(&tutor_id) else {
                continue;
            };
            let guard = ts.read().await;
            out.extend(
                guard
                    .slots
                    .iter()
                    .filter(|s| {
                        s.is_live()
                            && s.status == SlotStatus::Held
                            && s.hold.is_some_and(|h| h.is_expired(now))
                    })
                    .map(|s| s.id),
            );
        }
        out
    }

    /// Confirmed bookings whose span has fully elapsed. The completion
    /// sweep marks these Completed.
    pub async fn collect_elapsed_bookings(&self, now: Ms) -> Vec<Ulid> {
        let arcs: Vec<_> = self
            .bookings
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        let mut out = Vec::new();
        for (id, arc) in arcs {
            let b = arc.read().await;
            if b.status == BookingStatus::Confirmed && b.span.end <= now {
                out.push(id);
            }
        }
        out
    }
}
