//! Validated mutations: tutor registration, availability publication, and
//! the slot state machine. Each op takes the tutor's write lock, checks the
//! transition table, persists, then applies.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};
use ulid::Ulid;

use crate::error::{BookingError, SchedulingError};
use crate::expand;
use crate::limits::{
    MAX_BLOCKS_PER_TUTOR, MAX_SPAN_DURATION_MS, MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS,
};
use crate::model::{Event, Hold, Ms, SlotStatus, Span, TutorState};
use crate::observability;

use super::SlotStore;

fn validate_span(span: Span) -> Result<(), SchedulingError> {
    if span.start >= span.end
        || span.start < MIN_VALID_TIMESTAMP_MS
        || span.end > MAX_VALID_TIMESTAMP_MS
        || span.duration_ms() > MAX_SPAN_DURATION_MS
    {
        return Err(SchedulingError::InvalidWindow(span));
    }
    Ok(())
}

impl SlotStore {
    pub async fn register_tutor(&self, hourly_rate_cents: u32) -> Result<Ulid, SchedulingError> {
        let id = Ulid::new();
        self.wal_append(&Event::TutorRegistered {
            id,
            hourly_rate_cents,
        })
        .await
        .map_err(|e| SchedulingError::Storage(e.to_string()))?;
        self.tutors.insert(
            id,
            Arc::new(RwLock::new(TutorState::new(id, hourly_rate_cents))),
        );
        info!(tutor = %id, rate_cents = hourly_rate_cents, "tutor registered");
        Ok(id)
    }

    /// Publish an availability block and materialize its slots in the same
    /// critical section, so the new slots are queryable the moment this
    /// returns. Recurring blocks are parse-checked up front.
    pub async fn add_availability(
        &self,
        tutor_id: Ulid,
        span: Span,
        rrule: Option<String>,
        recurring: bool,
        now: Ms,
    ) -> Result<Ulid, SchedulingError> {
        validate_span(span)?;
        if recurring {
            let rule = rrule
                .as_deref()
                .ok_or_else(|| {
                    SchedulingError::InvalidRecurrenceRule("recurring block without a rule".into())
                })?;
            expand::validate_rule(rule, span)?;
        }

        let ts = self
            .tutor(&tutor_id)
            .ok_or(SchedulingError::UnknownTutor(tutor_id))?;
        let mut guard = ts.write_owned().await;
        if guard.availability.iter().filter(|b| b.is_live()).count() >= MAX_BLOCKS_PER_TUTOR {
            return Err(SchedulingError::Storage(
                "availability block limit reached".into(),
            ));
        }

        let id = Ulid::new();
        self.persist_and_apply(
            &mut guard,
            &Event::AvailabilityAdded {
                id,
                tutor_id,
                span,
                rrule,
                recurring,
            },
        )
        .await
        .map_err(|e| SchedulingError::Storage(e.to_string()))?;

        self.materialize_locked(&mut guard, now).await?;
        info!(tutor = %tutor_id, block = %id, recurring, "availability published");
        Ok(id)
    }

    /// Tombstone a block, then reconcile: open slots it alone produced are
    /// tombstoned too. Held and booked slots are never touched here.
    pub async fn revoke_availability(
        &self,
        tutor_id: Ulid,
        block_id: Ulid,
        now: Ms,
    ) -> Result<(), SchedulingError> {
        let ts = self
            .tutor(&tutor_id)
            .ok_or(SchedulingError::UnknownTutor(tutor_id))?;
        let mut guard = ts.write_owned().await;
        if !guard
            .availability
            .iter()
            .any(|b| b.id == block_id && b.is_live())
        {
            return Err(SchedulingError::Storage(format!(
                "availability block not found: {block_id}"
            )));
        }

        self.persist_and_apply(
            &mut guard,
            &Event::AvailabilityRevoked {
                id: block_id,
                tutor_id,
                at: now,
            },
        )
        .await
        .map_err(|e| SchedulingError::Storage(e.to_string()))?;

        self.materialize_locked(&mut guard, now).await?;
        info!(tutor = %tutor_id, block = %block_id, "availability revoked");
        Ok(())
    }

    pub async fn add_time_off(
        &self,
        tutor_id: Ulid,
        span: Span,
        now: Ms,
    ) -> Result<Ulid, SchedulingError> {
        validate_span(span)?;
        let ts = self
            .tutor(&tutor_id)
            .ok_or(SchedulingError::UnknownTutor(tutor_id))?;
        let mut guard = ts.write_owned().await;

        let id = Ulid::new();
        self.persist_and_apply(&mut guard, &Event::TimeOffAdded { id, tutor_id, span })
            .await
            .map_err(|e| SchedulingError::Storage(e.to_string()))?;

        self.materialize_locked(&mut guard, now).await?;
        info!(tutor = %tutor_id, block = %id, "time off added");
        Ok(id)
    }

    pub async fn remove_time_off(
        &self,
        tutor_id: Ulid,
        block_id: Ulid,
        now: Ms,
    ) -> Result<(), SchedulingError> {
        let ts = self
            .tutor(&tutor_id)
            .ok_or(SchedulingError::UnknownTutor(tutor_id))?;
        let mut guard = ts.write_owned().await;
        if !guard.time_off.iter().any(|t| t.id == block_id && t.is_live()) {
            return Err(SchedulingError::Storage(format!(
                "time off block not found: {block_id}"
            )));
        }

        self.persist_and_apply(
            &mut guard,
            &Event::TimeOffRemoved {
                id: block_id,
                tutor_id,
                at: now,
            },
        )
        .await
        .map_err(|e| SchedulingError::Storage(e.to_string()))?;

        self.materialize_locked(&mut guard, now).await?;
        Ok(())
    }

    // ── Slot state machine ───────────────────────────────────

    /// Place a hold on an open slot. Loses to any live hold or booking; an
    /// expired hold still on the slot is reclaimed in place.
    pub async fn try_hold(
        &self,
        slot_id: Ulid,
        holder_id: Ulid,
        now: Ms,
    ) -> Result<Hold, BookingError> {
        let (tutor_id, mut guard) = self.resolve_slot_write(&slot_id).await?;
        let slot = guard.slot(&slot_id).ok_or(BookingError::NotFound(slot_id))?;
        if !slot.is_live() {
            return Err(BookingError::SlotUnavailable(slot_id));
        }

        match slot.status {
            SlotStatus::Open => {}
            SlotStatus::Held => {
                let expired = slot.hold.is_some_and(|h| h.is_expired(now));
                if !expired {
                    metrics::counter!(observability::HOLD_CONFLICTS_TOTAL).increment(1);
                    return Err(BookingError::SlotUnavailable(slot_id));
                }
                // Reclaim: release the stale hold first so the log stays a
                // legal transition sequence.
                self.persist_and_apply(
                    &mut guard,
                    &Event::SlotReleased {
                        id: slot_id,
                        tutor_id,
                    },
                )
                .await
                .map_err(|e| BookingError::Storage(e.to_string()))?;
            }
            SlotStatus::Booked => {
                metrics::counter!(observability::HOLD_CONFLICTS_TOTAL).increment(1);
                return Err(BookingError::SlotUnavailable(slot_id));
            }
            SlotStatus::Closed => return Err(BookingError::SlotUnavailable(slot_id)),
        }

        let hold = Hold {
            holder_id,
            acquired_at: now,
            expires_at: now + self.config.hold_ttl_ms,
        };
        self.persist_and_apply(
            &mut guard,
            &Event::SlotHeld {
                id: slot_id,
                tutor_id,
                holder_id,
                acquired_at: hold.acquired_at,
                expires_at: hold.expires_at,
            },
        )
        .await
        .map_err(|e| BookingError::Storage(e.to_string()))?;

        metrics::counter!(observability::HOLDS_PLACED_TOTAL).increment(1);
        debug!(slot = %slot_id, holder = %holder_id, expires_at = hold.expires_at, "hold placed");
        Ok(hold)
    }

    /// Held → Booked, only for the holder and only while the hold is live.
    /// Expiry is checked here even if the reaper has not run yet.
    pub async fn confirm_hold(
        &self,
        slot_id: Ulid,
        holder_id: Ulid,
        now: Ms,
    ) -> Result<(), BookingError> {
        let (tutor_id, mut guard) = self.resolve_slot_write(&slot_id).await?;
        let slot = guard.slot(&slot_id).ok_or(BookingError::NotFound(slot_id))?;
        if !slot.is_live() {
            return Err(BookingError::NotFound(slot_id));
        }
        // A slot no longer Held means the hold was lost (reaped, released,
        // or taken through to Booked), the same outcome as an expired or
        // foreign hold.
        let valid = slot.status == SlotStatus::Held
            && slot
                .hold
                .is_some_and(|h| h.holder_id == holder_id && !h.is_expired(now));
        if !valid {
            return Err(BookingError::HoldExpiredOrMismatched(slot_id));
        }

        self.persist_and_apply(
            &mut guard,
            &Event::SlotBooked {
                id: slot_id,
                tutor_id,
            },
        )
        .await
        .map_err(|e| BookingError::Storage(e.to_string()))
    }

    /// Return a held or booked slot to Open. Releasing an already open slot
    /// is a no-op, so retries are harmless.
    pub async fn release_slot(&self, slot_id: Ulid) -> Result<(), BookingError> {
        let (tutor_id, mut guard) = self.resolve_slot_write(&slot_id).await?;
        let slot = guard.slot(&slot_id).ok_or(BookingError::NotFound(slot_id))?;
        if !slot.is_live() {
            return Err(BookingError::NotFound(slot_id));
        }

        match slot.status {
            SlotStatus::Open => Ok(()),
            SlotStatus::Held | SlotStatus::Booked => self
                .persist_and_apply(
                    &mut guard,
                    &Event::SlotReleased {
                        id: slot_id,
                        tutor_id,
                    },
                )
                .await
                .map_err(|e| BookingError::Storage(e.to_string())),
            SlotStatus::Closed => Err(BookingError::InvalidTransition {
                from: SlotStatus::Closed.as_str(),
                to: SlotStatus::Open.as_str(),
            }),
        }
    }

    /// Reaper entry point: release only if the slot still carries an
    /// expired hold. Returns whether a release happened.
    pub async fn release_if_expired(&self, slot_id: Ulid, now: Ms) -> Result<bool, BookingError> {
        let (tutor_id, mut guard) = self.resolve_slot_write(&slot_id).await?;
        let Some(slot) = guard.slot(&slot_id) else {
            return Ok(false);
        };
        let expired = slot.is_live()
            && slot.status == SlotStatus::Held
            && slot.hold.is_some_and(|h| h.is_expired(now));
        if !expired {
            return Ok(false);
        }

        self.persist_and_apply(
            &mut guard,
            &Event::SlotReleased {
                id: slot_id,
                tutor_id,
            },
        )
        .await
        .map_err(|e| BookingError::Storage(e.to_string()))?;
        Ok(true)
    }

    /// Withdraw an open slot from sale. Held and booked slots are protected:
    /// a student mid-checkout never has the slot closed under them.
    pub async fn close_slot(&self, slot_id: Ulid) -> Result<(), BookingError> {
        let (tutor_id, mut guard) = self.resolve_slot_write(&slot_id).await?;
        let slot = guard.slot(&slot_id).ok_or(BookingError::NotFound(slot_id))?;
        if !slot.is_live() {
            return Err(BookingError::NotFound(slot_id));
        }

        match slot.status {
            SlotStatus::Closed => Ok(()),
            SlotStatus::Open => self
                .persist_and_apply(
                    &mut guard,
                    &Event::SlotClosed {
                        id: slot_id,
                        tutor_id,
                    },
                )
                .await
                .map_err(|e| BookingError::Storage(e.to_string())),
            SlotStatus::Held | SlotStatus::Booked => Err(BookingError::SlotNotClosable(slot_id)),
        }
    }

    pub async fn reopen_slot(&self, slot_id: Ulid) -> Result<(), BookingError> {
        let (tutor_id, mut guard) = self.resolve_slot_write(&slot_id).await?;
        let slot = guard.slot(&slot_id).ok_or(BookingError::NotFound(slot_id))?;
        if !slot.is_live() {
            return Err(BookingError::NotFound(slot_id));
        }

        match slot.status {
            SlotStatus::Open => Ok(()),
            SlotStatus::Closed => self
                .persist_and_apply(
                    &mut guard,
                    &Event::SlotReopened {
                        id: slot_id,
                        tutor_id,
                    },
                )
                .await
                .map_err(|e| BookingError::Storage(e.to_string())),
            other => Err(BookingError::InvalidTransition {
                from: other.as_str(),
                to: SlotStatus::Open.as_str(),
            }),
        }
    }
}

// Used by materializer but defined here with the other validated inserts.
impl SlotStore {
    pub(crate) async fn open_slot_locked(
        &self,
        guard: &mut TutorState,
        tutor_id: Ulid,
        span: Span,
    ) -> Result<Ulid, SchedulingError> {
        let id = Ulid::new();
        self.persist_and_apply(guard, &Event::SlotOpened { id, tutor_id, span })
            .await
            .map_err(|e| SchedulingError::Storage(e.to_string()))?;
        Ok(id)
    }
}
