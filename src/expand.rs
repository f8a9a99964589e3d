//! Recurrence expansion — availability blocks in, concrete bookable spans out.
//!
//! Wraps the `rrule` crate for RFC 5545 grammar (FREQ, INTERVAL, BYDAY,
//! BYHOUR). Pure: no I/O, no state beyond the inputs, and repeated calls
//! over the same inputs produce the same spans.

use chrono::{DateTime, Utc};
use rrule::RRuleSet;

use crate::error::SchedulingError;
use crate::limits::{MAX_OCCURRENCES, MAX_RRULE_LEN};
use crate::model::{AvailabilityBlock, Ms, Span, TimeOffBlock, HOUR_MS};

/// Expand one availability block into candidate slot spans within `window`.
///
/// `window.start` is "now": nothing is produced before it, nor before the
/// block's own start. Expansion is half-open — a span starting exactly at
/// `window.end` is excluded. Candidates overlapping any live time-off block
/// are dropped whole.
///
/// Rules carrying BYHOUR yield one-hour spans per occurrence; rules without
/// it (and non-recurring blocks) yield block-duration spans.
pub fn expand_block(
    block: &AvailabilityBlock,
    time_off: &[TimeOffBlock],
    window: Span,
) -> Result<Vec<Span>, SchedulingError> {
    if window.start >= window.end {
        return Err(SchedulingError::InvalidWindow(window));
    }
    let from = window.start.max(block.span.start);

    let candidates: Vec<Span> = if block.recurring {
        let rule = block
            .rrule
            .as_deref()
            .ok_or_else(|| {
                SchedulingError::InvalidRecurrenceRule("recurring block without a rule".into())
            })?;
        expand_rule(rule, block.span, window)?
    } else if block.span.start >= from && block.span.start < window.end {
        vec![block.span]
    } else {
        Vec::new()
    };

    Ok(candidates
        .into_iter()
        .filter(|span| span.start >= from && span.start < window.end)
        .filter(|span| {
            !time_off
                .iter()
                .any(|t| t.is_live() && t.span.overlaps(span))
        })
        .collect())
}

/// Expand all live blocks for one tutor, merged and deduplicated by start
/// instant. The dedup is the in-memory shadow of the (tutor, start)
/// uniqueness constraint: two blocks producing the same start yield one
/// candidate.
pub fn expand_tutor(
    blocks: &[AvailabilityBlock],
    time_off: &[TimeOffBlock],
    window: Span,
) -> Result<Vec<Span>, SchedulingError> {
    let mut spans = Vec::new();
    for block in blocks.iter().filter(|b| b.is_live()) {
        spans.extend(expand_block(block, time_off, window)?);
    }
    spans.sort_by_key(|s| s.start);
    spans.dedup_by_key(|s| s.start);
    Ok(spans)
}

/// Parse-check a rule at publication time so a bad rule fails fast instead
/// of surfacing later inside the materializer.
pub fn validate_rule(raw: &str, block_span: Span) -> Result<(), SchedulingError> {
    let check_window = Span::new(block_span.start, block_span.start + crate::model::DAY_MS);
    expand_rule(raw, block_span, check_window).map(|_| ())
}

fn expand_rule(raw: &str, block_span: Span, window: Span) -> Result<Vec<Span>, SchedulingError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SchedulingError::InvalidRecurrenceRule("empty RRULE".into()));
    }
    if trimmed.len() > MAX_RRULE_LEN {
        return Err(SchedulingError::InvalidRecurrenceRule("RRULE too long".into()));
    }

    // Accept both "FREQ=..." and "RRULE:FREQ=..." forms.
    let mut rule = trimmed
        .strip_prefix("RRULE:")
        .unwrap_or(trimmed)
        .to_string();
    let upper = rule.to_uppercase();
    if !upper.contains("FREQ=") {
        return Err(SchedulingError::InvalidRecurrenceRule(
            "missing FREQ part".into(),
        ));
    }

    // Bound the expansion at the horizon unless the rule bounds itself.
    // DTSTART is UTC, so UNTIL must be UTC ("Z" suffix) to parse.
    if !upper.contains("UNTIL=") && !upper.contains("COUNT=") {
        rule = format!("{};UNTIL={}", rule, ical_utc(window.end)?);
    }

    let text = format!("DTSTART:{}\nRRULE:{}", ical_utc(block_span.start)?, rule);
    let set: RRuleSet = text
        .parse()
        .map_err(|e| SchedulingError::InvalidRecurrenceRule(format!("{e}")))?;

    let duration = if upper.contains("BYHOUR=") {
        HOUR_MS
    } else {
        block_span.duration_ms()
    };

    // `.all()` caps raw instances before our half-open filtering. A rule
    // dense enough to hit the cap before covering the window would
    // silently drop occurrences, so it is rejected instead. A capped
    // expansion whose last instance already clears the window (a COUNT or
    // UNTIL far past the horizon) lost nothing we keep.
    let instances = set.all(MAX_OCCURRENCES);
    if instances.limited {
        let covered = instances
            .dates
            .last()
            .is_some_and(|dt| dt.with_timezone(&Utc).timestamp_millis() >= window.end);
        if !covered {
            return Err(SchedulingError::InvalidRecurrenceRule(format!(
                "rule exceeds {MAX_OCCURRENCES} occurrences within the window"
            )));
        }
    }
    Ok(instances
        .dates
        .into_iter()
        .map(|dt| {
            let start = dt.with_timezone(&Utc).timestamp_millis();
            Span::new(start, start + duration)
        })
        .take_while(|span| span.start < window.end)
        .collect())
}

/// Format a UTC instant as an iCalendar datetime ("20260105T160000Z").
fn ical_utc(ms: Ms) -> Result<String, SchedulingError> {
    let dt = DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or(SchedulingError::InvalidWindow(Span { start: ms, end: ms + 1 }))?;
    Ok(dt.format("%Y%m%dT%H%M%SZ").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DAY_MS;
    use chrono::TimeZone;
    use ulid::Ulid;

    fn utc_ms(y: i32, mo: u32, d: u32, h: u32) -> Ms {
        Utc.with_ymd_and_hms(y, mo, d, h, 0, 0)
            .unwrap()
            .timestamp_millis()
    }

    fn recurring_block(start: Ms, end: Ms, rule: &str) -> AvailabilityBlock {
        AvailabilityBlock {
            id: Ulid::new(),
            tutor_id: Ulid::new(),
            span: Span::new(start, end),
            rrule: Some(rule.to_string()),
            recurring: true,
            deleted_at: None,
        }
    }

    fn time_off(span: Span) -> TimeOffBlock {
        TimeOffBlock {
            id: Ulid::new(),
            tutor_id: Ulid::new(),
            span,
            deleted_at: None,
        }
    }

    // 2026-01-05 is a Monday.
    const RULE_MO_WE_HOURS: &str = "FREQ=WEEKLY;BYDAY=MO,WE;BYHOUR=16,17,18";

    #[test]
    fn weekly_byday_byhour_two_weeks() {
        let start = utc_ms(2026, 1, 5, 16);
        let block = recurring_block(start, start + HOUR_MS, RULE_MO_WE_HOURS);
        let window = Span::new(start, start + 14 * DAY_MS);

        let spans = expand_block(&block, &[], window).unwrap();
        // 3 hours x 2 days x 2 weeks
        assert_eq!(spans.len(), 12);
        for span in &spans {
            assert_eq!(span.duration_ms(), HOUR_MS);
        }
        assert_eq!(spans[0].start, start);
        assert_eq!(spans[1].start, utc_ms(2026, 1, 5, 17));
        assert_eq!(spans[2].start, utc_ms(2026, 1, 5, 18));
        assert_eq!(spans[3].start, utc_ms(2026, 1, 7, 16));
        // Week-2 Wednesday closes the window's production.
        assert_eq!(spans[11].start, utc_ms(2026, 1, 14, 18));
    }

    #[test]
    fn horizon_boundary_is_half_open() {
        let start = utc_ms(2026, 1, 5, 16);
        let block = recurring_block(start, start + HOUR_MS, "FREQ=WEEKLY;BYDAY=MO;BYHOUR=16");
        // Window ends exactly on the week-3 Monday occurrence.
        let window = Span::new(start, start + 14 * DAY_MS);

        let spans = expand_block(&block, &[], window).unwrap();
        assert_eq!(spans.len(), 2);
        assert!(spans.iter().all(|s| s.start < window.end));
    }

    #[test]
    fn time_off_drops_only_overlapping_interval() {
        let start = utc_ms(2026, 1, 5, 16);
        let block = recurring_block(start, start + HOUR_MS, RULE_MO_WE_HOURS);
        let window = Span::new(start, start + 14 * DAY_MS);

        // Blackout exactly covering week-1 Monday 17:00-18:00.
        let off = time_off(Span::new(utc_ms(2026, 1, 5, 17), utc_ms(2026, 1, 5, 18)));
        let spans = expand_block(&block, &[off], window).unwrap();

        assert_eq!(spans.len(), 11);
        assert!(spans.iter().any(|s| s.start == utc_ms(2026, 1, 5, 16)));
        assert!(spans.iter().all(|s| s.start != utc_ms(2026, 1, 5, 17)));
        assert!(spans.iter().any(|s| s.start == utc_ms(2026, 1, 5, 18)));
        // Week 2 Monday 17:00 is untouched.
        assert!(spans.iter().any(|s| s.start == utc_ms(2026, 1, 12, 17)));
    }

    #[test]
    fn partial_time_off_overlap_still_drops_whole_interval() {
        let start = utc_ms(2026, 1, 5, 16);
        let block = recurring_block(start, start + HOUR_MS, "FREQ=WEEKLY;BYDAY=MO;BYHOUR=16");
        let window = Span::new(start, start + 7 * DAY_MS);

        // 15 minutes into the slot is enough to kill it — no partial slots.
        let off = time_off(Span::new(start + 45 * 60_000, start + HOUR_MS + 1));
        let spans = expand_block(&block, &[off], window).unwrap();
        assert!(spans.is_empty());
    }

    #[test]
    fn non_recurring_block_yields_own_span() {
        let start = utc_ms(2026, 2, 1, 9);
        let block = AvailabilityBlock {
            id: Ulid::new(),
            tutor_id: Ulid::new(),
            span: Span::new(start, start + 2 * HOUR_MS),
            rrule: None,
            recurring: false,
            deleted_at: None,
        };
        let window = Span::new(start - DAY_MS, start + DAY_MS);
        let spans = expand_block(&block, &[], window).unwrap();
        assert_eq!(spans, vec![Span::new(start, start + 2 * HOUR_MS)]);
    }

    #[test]
    fn non_recurring_block_outside_window_yields_nothing() {
        let start = utc_ms(2026, 2, 1, 9);
        let block = AvailabilityBlock {
            id: Ulid::new(),
            tutor_id: Ulid::new(),
            span: Span::new(start, start + HOUR_MS),
            rrule: None,
            recurring: false,
            deleted_at: None,
        };
        // Block already started before the window opens.
        let window = Span::new(start + HOUR_MS, start + DAY_MS);
        assert!(expand_block(&block, &[], window).unwrap().is_empty());
    }

    #[test]
    fn rule_without_byhour_uses_block_duration() {
        let start = utc_ms(2026, 1, 5, 9);
        let block = recurring_block(start, start + 2 * HOUR_MS, "FREQ=WEEKLY;BYDAY=MO");
        let window = Span::new(start, start + 14 * DAY_MS);

        let spans = expand_block(&block, &[], window).unwrap();
        assert_eq!(spans.len(), 2);
        assert!(spans.iter().all(|s| s.duration_ms() == 2 * HOUR_MS));
    }

    #[test]
    fn malformed_rule_fails_fast() {
        let start = utc_ms(2026, 1, 5, 16);
        for bad in ["", "BYDAY=MO", "FREQ=SOMETIMES", "FREQ=WEEKLY;BYDAY=XX"] {
            let block = recurring_block(start, start + HOUR_MS, bad);
            let window = Span::new(start, start + DAY_MS);
            let result = expand_block(&block, &[], window);
            assert!(
                matches!(result, Err(SchedulingError::InvalidRecurrenceRule(_))),
                "expected InvalidRecurrenceRule for {bad:?}"
            );
        }
    }

    #[test]
    fn dense_rule_hitting_occurrence_cap_is_rejected() {
        let start = utc_ms(2026, 1, 5, 8);
        // 12 occurrences a day over 90 days: 1080 raw instances, past the
        // cap before the window is covered.
        let block = recurring_block(
            start,
            start + HOUR_MS,
            "FREQ=DAILY;BYHOUR=8,9,10,11,12,13,14,15,16,17,18,19",
        );
        let window = Span::new(start, start + 90 * DAY_MS);
        assert!(matches!(
            expand_block(&block, &[], window),
            Err(SchedulingError::InvalidRecurrenceRule(_))
        ));
    }

    #[test]
    fn capped_rule_covering_the_window_still_expands() {
        let start = utc_ms(2026, 1, 5, 0);
        // COUNT keeps us from injecting UNTIL; 2000 hourly instances trip
        // the cap, but the first 1000 hours already span past 14 days.
        let block = recurring_block(start, start + HOUR_MS, "FREQ=HOURLY;COUNT=2000");
        let window = Span::new(start, start + 14 * DAY_MS);
        let spans = expand_block(&block, &[], window).unwrap();
        assert_eq!(spans.len(), 14 * 24);
        assert!(spans.iter().all(|s| s.start < window.end));
    }

    #[test]
    fn recurring_block_without_rule_is_an_error() {
        let start = utc_ms(2026, 1, 5, 16);
        let mut block = recurring_block(start, start + HOUR_MS, "FREQ=DAILY");
        block.rrule = None;
        let window = Span::new(start, start + DAY_MS);
        assert!(matches!(
            expand_block(&block, &[], window),
            Err(SchedulingError::InvalidRecurrenceRule(_))
        ));
    }

    #[test]
    fn expansion_is_restartable() {
        let start = utc_ms(2026, 1, 5, 16);
        let block = recurring_block(start, start + HOUR_MS, RULE_MO_WE_HOURS);
        let window = Span::new(start, start + 14 * DAY_MS);

        let first = expand_block(&block, &[], window).unwrap();
        let second = expand_block(&block, &[], window).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn expand_tutor_dedupes_colliding_starts() {
        let start = utc_ms(2026, 1, 5, 16);
        let a = recurring_block(start, start + HOUR_MS, "FREQ=WEEKLY;BYDAY=MO;BYHOUR=16");
        let mut b = a.clone();
        b.id = Ulid::new();
        let window = Span::new(start, start + 7 * DAY_MS);

        let spans = expand_tutor(&[a, b], &[], window).unwrap();
        assert_eq!(spans.len(), 1);
    }

    #[test]
    fn expand_tutor_skips_revoked_blocks() {
        let start = utc_ms(2026, 1, 5, 16);
        let mut block = recurring_block(start, start + HOUR_MS, "FREQ=WEEKLY;BYDAY=MO;BYHOUR=16");
        block.deleted_at = Some(start);
        let window = Span::new(start, start + 7 * DAY_MS);
        assert!(expand_tutor(&[block], &[], window).unwrap().is_empty());
    }
}
