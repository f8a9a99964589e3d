//! External-calendar busy sync: open slots that collide with a tutor's
//! external calendar get closed so students never book over them.

use std::sync::Arc;

use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::capabilities::CalendarClient;
use crate::error::{BookingError, CalendarError};
use crate::model::{now_ms, Ms, SlotStatus, Span};
use crate::observability;
use crate::store::SlotStore;

/// One sync pass for one tutor. Fetches busy intervals out to the booking
/// horizon, closes live Open slots that overlap one, and reopens Closed
/// slots that no longer do. Held and Booked slots are never touched.
/// Returns (closed, reopened).
pub async fn sync_tutor(
    store: &SlotStore,
    calendar: &dyn CalendarClient,
    tutor_id: Ulid,
    now: Ms,
) -> Result<(u64, u64), CalendarError> {
    let window = Span::new(now, now + store.config.horizon_ms());
    let busy = match timeout(
        store.config.capability_timeout,
        calendar.busy_intervals(tutor_id, window),
    )
    .await
    {
        Ok(r) => r?,
        Err(_) => return Err(CalendarError::Unreachable("busy fetch timed out".into())),
    };

    let slots = store
        .slots_in_window(tutor_id, window)
        .await
        .map_err(|e| CalendarError::Unreachable(e.to_string()))?;

    let mut closed = 0u64;
    let mut reopened = 0u64;
    for slot in slots {
        let is_busy = busy.iter().any(|b| b.overlaps(&slot.span));
        match slot.status {
            SlotStatus::Open if is_busy => match store.close_slot(slot.id).await {
                Ok(()) => {
                    closed += 1;
                    debug!(tutor = %tutor_id, slot = %slot.id, "slot closed by busy sync");
                }
                // Lost a race to a hold between the query and the close.
                Err(BookingError::SlotNotClosable(_)) => {}
                Err(e) => {
                    warn!(tutor = %tutor_id, slot = %slot.id, error = %e, "busy sync close failed");
                }
            },
            SlotStatus::Closed if !is_busy => match store.reopen_slot(slot.id).await {
                Ok(()) => {
                    reopened += 1;
                    debug!(tutor = %tutor_id, slot = %slot.id, "slot reopened by busy sync");
                }
                Err(e) => {
                    warn!(tutor = %tutor_id, slot = %slot.id, error = %e, "busy sync reopen failed");
                }
            },
            _ => {}
        }
    }
    Ok((closed, reopened))
}

/// Periodic sweep over every tutor. One tutor's calendar being down never
/// blocks the others.
pub async fn run_busy_sync(
    store: Arc<SlotStore>,
    calendar: Arc<dyn CalendarClient>,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(store.config.busy_sync_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("busy sync shutting down");
                return;
            }
            _ = interval.tick() => {}
        }

        let now = now_ms();
        for tutor_id in store.tutor_ids() {
            if let Err(e) = sync_tutor(&store, calendar.as_ref(), tutor_id, now).await {
                metrics::counter!(observability::BUSY_SYNC_FAILURES_TOTAL).increment(1);
                warn!(tutor = %tutor_id, error = %e, "busy sync failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::{DAY_MS, HOUR_MS};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex;

    const LESSON_START: i64 = 1_800_000_000_000;

    struct ScriptedCalendar {
        /// busy intervals per owner; missing owner means the fetch errors.
        busy: Mutex<std::collections::HashMap<Ulid, Vec<Span>>>,
    }

    #[async_trait]
    impl CalendarClient for ScriptedCalendar {
        async fn create_event(
            &self,
            _owner_id: Ulid,
            _span: Span,
            _title: &str,
        ) -> Result<String, CalendarError> {
            Ok("evt".into())
        }

        async fn delete_event(&self, _owner_id: Ulid, _event_id: &str) -> Result<(), CalendarError> {
            Ok(())
        }

        async fn busy_intervals(
            &self,
            owner_id: Ulid,
            _window: Span,
        ) -> Result<Vec<Span>, CalendarError> {
            self.busy
                .lock()
                .unwrap()
                .get(&owner_id)
                .cloned()
                .ok_or_else(|| CalendarError::Unreachable("provider error".into()))
        }
    }

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("bookable_test_busy_sync");
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(format!("{name}-{}.wal", Ulid::new()))
    }

    async fn store_with_slots(name: &str) -> (Arc<SlotStore>, Ulid, Vec<Ulid>) {
        let store = Arc::new(SlotStore::open(test_wal_path(name), Config::default()).unwrap());
        let tutor = store.register_tutor(5000).await.unwrap();
        let now = LESSON_START - DAY_MS;
        for i in 0..3 {
            let start = LESSON_START + i * HOUR_MS;
            store
                .add_availability(tutor, Span::new(start, start + HOUR_MS), None, false, now)
                .await
                .unwrap();
        }
        let slots = store
            .open_slots(tutor, Span::new(LESSON_START, LESSON_START + DAY_MS))
            .await
            .unwrap();
        (store, tutor, slots.iter().map(|s| s.id).collect())
    }

    #[tokio::test]
    async fn busy_interval_closes_overlapping_open_slots() {
        let (store, tutor, slot_ids) = store_with_slots("close_overlap").await;
        let calendar = ScriptedCalendar {
            busy: Mutex::new(
                [(
                    tutor,
                    // Covers the first two slots, misses the third.
                    vec![Span::new(LESSON_START, LESSON_START + 2 * HOUR_MS)],
                )]
                .into(),
            ),
        };

        let now = LESSON_START - DAY_MS;
        let (closed, reopened) = sync_tutor(&store, &calendar, tutor, now).await.unwrap();
        assert_eq!((closed, reopened), (2, 0));

        let statuses: Vec<_> = {
            let mut v = Vec::new();
            for id in &slot_ids {
                v.push(store.get_slot(id).await.unwrap().status);
            }
            v
        };
        assert_eq!(
            statuses,
            vec![SlotStatus::Closed, SlotStatus::Closed, SlotStatus::Open]
        );
    }

    #[tokio::test]
    async fn held_slots_survive_busy_sync() {
        let (store, tutor, slot_ids) = store_with_slots("skip_held").await;
        let student = Ulid::new();
        store
            .try_hold(slot_ids[0], student, now_ms())
            .await
            .unwrap();

        let calendar = ScriptedCalendar {
            busy: Mutex::new(
                [(tutor, vec![Span::new(LESSON_START, LESSON_START + HOUR_MS)])].into(),
            ),
        };

        let (closed, _) = sync_tutor(&store, &calendar, tutor, LESSON_START - DAY_MS)
            .await
            .unwrap();
        assert_eq!(closed, 0);
        let slot = store.get_slot(&slot_ids[0]).await.unwrap();
        assert_eq!(slot.status, SlotStatus::Held);
    }

    #[tokio::test]
    async fn provider_failure_surfaces_as_unreachable() {
        let (store, tutor, _) = store_with_slots("provider_down").await;
        let calendar = ScriptedCalendar {
            busy: Mutex::new(Default::default()),
        };

        let err = sync_tutor(&store, &calendar, tutor, LESSON_START - DAY_MS)
            .await
            .unwrap_err();
        assert!(matches!(err, CalendarError::Unreachable(_)));
    }

    #[tokio::test]
    async fn no_busy_intervals_is_a_noop() {
        let (store, tutor, slot_ids) = store_with_slots("noop").await;
        let calendar = ScriptedCalendar {
            busy: Mutex::new([(tutor, Vec::new())].into()),
        };

        let (closed, reopened) = sync_tutor(&store, &calendar, tutor, LESSON_START - DAY_MS)
            .await
            .unwrap();
        assert_eq!((closed, reopened), (0, 0));
        for id in &slot_ids {
            assert_eq!(store.get_slot(id).await.unwrap().status, SlotStatus::Open);
        }
    }

    #[tokio::test]
    async fn cleared_busy_interval_reopens_closed_slot() {
        let (store, tutor, slot_ids) = store_with_slots("reopen").await;
        let busy_span = Span::new(LESSON_START, LESSON_START + HOUR_MS);
        let calendar = ScriptedCalendar {
            busy: Mutex::new([(tutor, vec![busy_span])].into()),
        };

        let now = LESSON_START - DAY_MS;
        let (closed, _) = sync_tutor(&store, &calendar, tutor, now).await.unwrap();
        assert_eq!(closed, 1);
        assert_eq!(
            store.get_slot(&slot_ids[0]).await.unwrap().status,
            SlotStatus::Closed
        );

        // The external event goes away; the next pass restores the slot.
        calendar.busy.lock().unwrap().insert(tutor, Vec::new());
        let (closed, reopened) = sync_tutor(&store, &calendar, tutor, now).await.unwrap();
        assert_eq!((closed, reopened), (0, 1));
        assert_eq!(
            store.get_slot(&slot_ids[0]).await.unwrap().status,
            SlotStatus::Open
        );
    }
}
