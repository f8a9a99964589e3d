//! Hard limits protecting the store from unbounded input.

use crate::model::Ms;

/// 2000-01-01T00:00:00Z.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;

/// 3000-01-01T00:00:00Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 32_503_680_000_000;

/// A single availability block or slot never spans more than 7 days.
pub const MAX_SPAN_DURATION_MS: Ms = 7 * 24 * 3_600_000;

pub const MAX_RRULE_LEN: usize = 512;

/// Cap on raw occurrences pulled from one recurrence rule per expansion.
pub const MAX_OCCURRENCES: u16 = 1000;

pub const MAX_SLOTS_PER_TUTOR: usize = 10_000;

pub const MAX_BLOCKS_PER_TUTOR: usize = 500;

pub const MAX_NOTE_LEN: usize = 2048;
