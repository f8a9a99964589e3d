//! Slot materialization: turns published availability into concrete Open
//! slots out to the booking horizon, and reconciles existing slots against
//! what expansion currently says.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::error::SchedulingError;
use crate::expand;
use crate::limits::MAX_SLOTS_PER_TUTOR;
use crate::model::{now_ms, Event, Ms, SlotStatus, Span, TutorState};
use crate::observability;

use super::SlotStore;

impl SlotStore {
    /// One reconciliation pass for a tutor whose lock the caller holds.
    ///
    /// Creates an Open slot for every expanded span with no live slot at
    /// its start, and tombstones future Open slots that expansion no longer
    /// produces. Held, Booked, and Closed slots are never tombstoned here.
    /// Returns (created, tombstoned).
    pub(crate) async fn materialize_locked(
        &self,
        guard: &mut TutorState,
        now: Ms,
    ) -> Result<(u64, u64), SchedulingError> {
        let window = Span::new(now, now + self.config.horizon_ms());
        let wanted = expand::expand_tutor(&guard.availability, &guard.time_off, window)?;
        let wanted_starts: HashSet<Ms> = wanted.iter().map(|s| s.start).collect();
        let tutor_id = guard.id;

        let mut created = 0u64;
        for span in &wanted {
            if guard.live_slot_at(span.start).is_some() {
                continue;
            }
            if guard.slots.iter().filter(|s| s.is_live()).count() >= MAX_SLOTS_PER_TUTOR {
                warn!(tutor = %tutor_id, "slot limit reached, stopping materialization");
                break;
            }
            self.open_slot_locked(guard, tutor_id, *span).await?;
            created += 1;
        }

        let stale: Vec<Ulid> = guard
            .slots
            .iter()
            .filter(|s| {
                s.is_live()
                    && s.status == SlotStatus::Open
                    && s.span.start >= now
                    && !wanted_starts.contains(&s.span.start)
            })
            .map(|s| s.id)
            .collect();
        for id in &stale {
            self.persist_and_apply(
                guard,
                &Event::SlotTombstoned {
                    id: *id,
                    tutor_id,
                    at: now,
                },
            )
            .await
            .map_err(|e| SchedulingError::Storage(e.to_string()))?;
        }

        if created > 0 {
            metrics::counter!(observability::SLOTS_MATERIALIZED_TOTAL).increment(created);
        }
        if !stale.is_empty() {
            metrics::counter!(observability::SLOTS_TOMBSTONED_TOTAL)
                .increment(stale.len() as u64);
        }
        debug!(tutor = %tutor_id, created, tombstoned = stale.len(), "materialized");
        Ok((created, stale.len() as u64))
    }

    pub async fn materialize(&self, tutor_id: Ulid, now: Ms) -> Result<(u64, u64), SchedulingError> {
        let ts = self
            .tutor(&tutor_id)
            .ok_or(SchedulingError::UnknownTutor(tutor_id))?;
        let mut guard = ts.write_owned().await;
        self.materialize_locked(&mut guard, now).await
    }

    /// Full sweep. A bad rule on one tutor does not stop the others.
    pub async fn materialize_all(&self, now: Ms) {
        for tutor_id in self.tutor_ids() {
            if let Err(e) = self.materialize(tutor_id, now).await {
                warn!(tutor = %tutor_id, error = %e, "materialization failed");
            }
        }
    }
}

/// Periodic horizon roll: as the clock advances, new spans enter the window
/// and get slots. Runs until the token is cancelled.
pub async fn run_materializer(store: Arc<SlotStore>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(store.config.materializer_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("materializer shutting down");
                return;
            }
            _ = interval.tick() => {
                store.materialize_all(now_ms()).await;
            }
        }
    }
}
