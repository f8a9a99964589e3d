//! Background sweeps: expired-hold release and post-lesson completion.

use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::now_ms;
use crate::observability;
use crate::store::SlotStore;

/// Periodically release slots whose hold TTL has lapsed. Expiry is also
/// checked passively on confirm, so the reaper only bounds how long a dead
/// hold can block a slot, it is not the correctness mechanism.
pub async fn run_reaper(store: Arc<SlotStore>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(store.config.reaper_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("reaper shutting down");
                return;
            }
            _ = interval.tick() => {}
        }

        let now = now_ms();
        for slot_id in store.collect_expired_holds(now).await {
            // release_if_expired re-checks under the tutor lock; a confirm
            // that raced us wins and we skip.
            match store.release_if_expired(slot_id, now).await {
                Ok(true) => {
                    metrics::counter!(observability::HOLDS_REAPED_TOTAL).increment(1);
                    info!(slot = %slot_id, "reaped expired hold");
                }
                Ok(false) => {}
                Err(e) => debug!(slot = %slot_id, error = %e, "reaper skip"),
            }
        }
    }
}

/// Periodically move confirmed bookings whose span has elapsed into
/// Completed.
pub async fn run_completion_sweep(store: Arc<SlotStore>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(store.config.completion_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("completion sweep shutting down");
                return;
            }
            _ = interval.tick() => {}
        }

        let now = now_ms();
        for booking_id in store.collect_elapsed_bookings(now).await {
            if let Err(e) = store.complete_booking(booking_id).await {
                warn!(booking = %booking_id, error = %e, "completion sweep skip");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::{BookingStatus, SlotStatus, Span, DAY_MS, HOUR_MS};
    use std::path::PathBuf;
    use ulid::Ulid;

    const LESSON_START: i64 = 1_800_000_000_000;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("bookable_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(format!("{name}-{}.wal", Ulid::new()))
    }

    async fn store_with_slot(name: &str, cfg: Config) -> (Arc<SlotStore>, Ulid, Ulid) {
        let store = Arc::new(SlotStore::open(test_wal_path(name), cfg).unwrap());
        let tutor = store.register_tutor(5000).await.unwrap();
        let now = LESSON_START - DAY_MS;
        store
            .add_availability(
                tutor,
                Span::new(LESSON_START, LESSON_START + HOUR_MS),
                None,
                false,
                now,
            )
            .await
            .unwrap();
        let slots = store
            .open_slots(tutor, Span::new(LESSON_START, LESSON_START + DAY_MS))
            .await
            .unwrap();
        (store, tutor, slots[0].id)
    }

    #[tokio::test]
    async fn expired_holds_are_collected_and_released() {
        let (store, _, slot_id) = store_with_slot("reap", Config::default()).await;
        let holder = Ulid::new();

        let hold = store.try_hold(slot_id, holder, now_ms()).await.unwrap();
        let after_expiry = hold.expires_at + 1;

        let expired = store.collect_expired_holds(after_expiry).await;
        assert_eq!(expired, vec![slot_id]);

        assert!(store.release_if_expired(slot_id, after_expiry).await.unwrap());
        let slot = store.get_slot(&slot_id).await.unwrap();
        assert_eq!(slot.status, SlotStatus::Open);
        assert!(slot.hold.is_none());

        assert!(store.collect_expired_holds(after_expiry).await.is_empty());
    }

    #[tokio::test]
    async fn live_holds_are_not_reaped() {
        let (store, _, slot_id) = store_with_slot("no_reap", Config::default()).await;
        let holder = Ulid::new();

        store.try_hold(slot_id, holder, now_ms()).await.unwrap();
        assert!(store.collect_expired_holds(now_ms()).await.is_empty());
        assert!(!store.release_if_expired(slot_id, now_ms()).await.unwrap());

        let slot = store.get_slot(&slot_id).await.unwrap();
        assert_eq!(slot.status, SlotStatus::Held);
    }

    #[tokio::test]
    async fn reaper_loop_frees_slot_with_short_ttl() {
        let cfg = Config {
            hold_ttl_ms: 20,
            reaper_interval: std::time::Duration::from_millis(10),
            ..Config::default()
        };
        let (store, _, slot_id) = store_with_slot("loop", cfg).await;
        store.try_hold(slot_id, Ulid::new(), now_ms()).await.unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_reaper(store.clone(), shutdown.clone()));

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let slot = store.get_slot(&slot_id).await.unwrap();
        assert_eq!(slot.status, SlotStatus::Open);
    }

    #[tokio::test]
    async fn completion_sweep_finishes_elapsed_bookings() {
        let (store, tutor, slot_id) = store_with_slot("complete", Config::default()).await;
        let student = Ulid::new();

        store.try_hold(slot_id, student, now_ms()).await.unwrap();
        store.confirm_hold(slot_id, student, now_ms()).await.unwrap();
        let booking_id = store
            .create_booking(
                student,
                tutor,
                Span::new(LESSON_START, LESSON_START + HOUR_MS),
                slot_id,
                5000,
                None,
            )
            .await
            .unwrap();
        store.confirm_booking(booking_id, None).await.unwrap();

        // Not elapsed yet from the lesson's perspective.
        assert!(store.collect_elapsed_bookings(LESSON_START).await.is_empty());

        let after = LESSON_START + HOUR_MS;
        assert_eq!(store.collect_elapsed_bookings(after).await, vec![booking_id]);
        store.complete_booking(booking_id).await.unwrap();

        let booking = store.get_booking(&booking_id).await.unwrap();
        assert_eq!(booking.status, BookingStatus::Completed);
        assert!(store.collect_elapsed_bookings(after).await.is_empty());
    }
}
