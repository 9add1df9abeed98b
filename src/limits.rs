use crate::model::{DAY_MS, Money, Ms};

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// Longest period or reservation accepted.
pub const MAX_SPAN_DURATION_MS: Ms = 5 * 366 * DAY_MS;
/// Widest search window.
pub const MAX_QUERY_WINDOW_MS: Ms = MAX_SPAN_DURATION_MS;

pub const MAX_PERIODS_PER_ACCOMMODATION: usize = 4_096;
pub const MAX_RESERVATIONS_PER_PERIOD: usize = 10_000;
pub const MAX_GUEST_COUNT: u32 = 1_000;
/// Per-night rate ceiling; keeps `nights * rate * guests` inside i64.
pub const MAX_RATE: Money = 1_000_000_000;

pub const MAX_IN_CLAUSE_IDS: usize = 1_000;
