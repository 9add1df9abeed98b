use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds (UTC) — the only time type.
pub type Ms = i64;

/// Minor currency units (e.g. cents).
pub type Money = i64;

pub const DAY_MS: Ms = 86_400_000;

/// Closed date range `[start, end]`. Which boundaries count as touching is
/// decided by the predicates in `engine::overlap`, not by the span itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn is_ordered(&self) -> bool {
        self.start < self.end
    }
}

/// How a period charges its guests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PriceConfig {
    pub per_guest: bool,
    pub rate_per_guest: Money,
    pub rate_flat: Money,
}

impl PriceConfig {
    pub fn flat(rate: Money) -> Self {
        Self { per_guest: false, rate_per_guest: 0, rate_flat: rate }
    }

    pub fn per_guest(rate: Money) -> Self {
        Self { per_guest: true, rate_per_guest: rate, rate_flat: 0 }
    }

    pub fn is_negative(&self) -> bool {
        self.rate_per_guest < 0 || self.rate_flat < 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityPeriod {
    pub id: Ulid,
    pub accommodation_id: Ulid,
    pub owner_id: Ulid,
    pub span: Span,
    pub price: PriceConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub accommodation_id: Ulid,
    pub period_id: Ulid,
    pub user_id: Ulid,
    pub span: Span,
    pub guest_count: u32,
    pub price: Money,
}

/// Everything stored for one accommodation: its periods (sorted by start)
/// and, per period, that period's reservations (sorted by start).
#[derive(Debug, Clone)]
pub struct AccommodationState {
    pub id: Ulid,
    pub periods: Vec<AvailabilityPeriod>,
    pub reservations: HashMap<Ulid, Vec<Reservation>>,
}

impl AccommodationState {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            periods: Vec::new(),
            reservations: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.periods.is_empty()
    }

    pub fn period(&self, id: &Ulid) -> Option<&AvailabilityPeriod> {
        self.periods.iter().find(|p| p.id == *id)
    }

    /// Insert period maintaining sort order by span.start.
    pub fn insert_period(&mut self, period: AvailabilityPeriod) {
        let pos = self
            .periods
            .partition_point(|p| p.span.start <= period.span.start);
        self.periods.insert(pos, period);
    }

    pub fn remove_period(&mut self, id: &Ulid) -> Option<AvailabilityPeriod> {
        let pos = self.periods.iter().position(|p| p.id == *id)?;
        self.reservations.remove(id);
        Some(self.periods.remove(pos))
    }

    /// Periods that start before `before`; anything starting later cannot
    /// conflict with a span ending at `before`.
    pub fn periods_starting_before(&self, before: Ms) -> &[AvailabilityPeriod] {
        let bound = self.periods.partition_point(|p| p.span.start < before);
        &self.periods[..bound]
    }

    pub fn reservations_of(&self, period_id: &Ulid) -> &[Reservation] {
        self.reservations
            .get(period_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn has_reservations(&self, period_id: &Ulid) -> bool {
        !self.reservations_of(period_id).is_empty()
    }

    pub fn all_reservations(&self) -> impl Iterator<Item = &Reservation> {
        self.periods
            .iter()
            .flat_map(move |p| self.reservations_of(&p.id).iter())
    }

    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let list = self.reservations.entry(reservation.period_id).or_default();
        let pos = list.partition_point(|r| r.span.start <= reservation.span.start);
        list.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, period_id: &Ulid, id: &Ulid) -> Option<Reservation> {
        let list = self.reservations.get_mut(period_id)?;
        let pos = list.iter().position(|r| r.id == *id)?;
        let removed = list.remove(pos);
        if list.is_empty() {
            self.reservations.remove(period_id);
        }
        Some(removed)
    }
}

/// WAL record and notification payload. One event per logical write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    PeriodCreated {
        id: Ulid,
        accommodation_id: Ulid,
        owner_id: Ulid,
        span: Span,
        price: PriceConfig,
    },
    PeriodUpdated {
        id: Ulid,
        accommodation_id: Ulid,
        span: Span,
        price: PriceConfig,
    },
    PeriodDeleted {
        id: Ulid,
        accommodation_id: Ulid,
    },
    ReservationCreated {
        id: Ulid,
        accommodation_id: Ulid,
        period_id: Ulid,
        user_id: Ulid,
        span: Span,
        guest_count: u32,
        price: Money,
    },
    ReservationDeleted {
        id: Ulid,
        accommodation_id: Ulid,
        period_id: Ulid,
        user_id: Ulid,
    },
}

impl Event {
    pub fn accommodation_id(&self) -> Ulid {
        match self {
            Event::PeriodCreated { accommodation_id, .. }
            | Event::PeriodUpdated { accommodation_id, .. }
            | Event::PeriodDeleted { accommodation_id, .. }
            | Event::ReservationCreated { accommodation_id, .. }
            | Event::ReservationDeleted { accommodation_id, .. } => *accommodation_id,
        }
    }

    pub fn is_reservation_event(&self) -> bool {
        matches!(
            self,
            Event::ReservationCreated { .. } | Event::ReservationDeleted { .. }
        )
    }

    pub fn created_period(period: &AvailabilityPeriod) -> Self {
        Event::PeriodCreated {
            id: period.id,
            accommodation_id: period.accommodation_id,
            owner_id: period.owner_id,
            span: period.span,
            price: period.price,
        }
    }

    pub fn created_reservation(r: &Reservation) -> Self {
        Event::ReservationCreated {
            id: r.id,
            accommodation_id: r.accommodation_id,
            period_id: r.period_id,
            user_id: r.user_id,
            span: r.span,
            guest_count: r.guest_count,
            price: r.price,
        }
    }

    pub fn deleted_reservation(r: &Reservation) -> Self {
        Event::ReservationDeleted {
            id: r.id,
            accommodation_id: r.accommodation_id,
            period_id: r.period_id,
            user_id: r.user_id,
        }
    }

    /// JSON payload handed to notification subscribers.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

// ── Identifiers ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdError {
    pub input: String,
    pub reason: &'static str,
}

impl std::fmt::Display for IdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid id {:?}: {}", self.input, self.reason)
    }
}

impl std::error::Error for IdError {}

/// Parse an identifier arriving from another service.
///
/// Accepts a canonical ULID, a UUID (hyphenated or 32 hex digits) or a
/// 24-hex-digit document id. All forms map onto the same 128-bit value.
pub fn parse_id(input: &str) -> Result<Ulid, IdError> {
    let s = input.trim();
    let err = |reason| IdError { input: input.to_string(), reason };
    match s.len() {
        26 => Ulid::from_string(s).map_err(|_| err("malformed ULID")),
        36 => {
            let bytes = s.as_bytes();
            if [8, 13, 18, 23].iter().any(|&i| bytes[i] != b'-') {
                return Err(err("malformed UUID"));
            }
            let hex: String = s.chars().filter(|c| *c != '-').collect();
            parse_hex(&hex).ok_or_else(|| err("malformed UUID"))
        }
        32 | 24 => parse_hex(s).ok_or_else(|| err("malformed hex id")),
        0 => Err(err("empty")),
        _ => Err(err("unrecognized id format")),
    }
}

fn parse_hex(s: &str) -> Option<Ulid> {
    if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u128::from_str_radix(s, 16).ok().map(Ulid::from)
}

/// Render an id as a hyphenated lowercase UUID.
pub fn format_uuid(id: Ulid) -> String {
    let hex = format!("{:032x}", u128::from(id));
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}
