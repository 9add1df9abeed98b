use crate::model::{DAY_MS, Money, PriceConfig, Span};

/// Whole nights in a stay, rounding a partial day up.
pub fn nights(span: &Span) -> i64 {
    let ms = span.duration_ms();
    if ms <= 0 {
        return 0;
    }
    (ms + DAY_MS - 1) / DAY_MS
}

pub fn price(config: &PriceConfig, span: &Span, guest_count: u32) -> Money {
    let nights = nights(span);
    if config.per_guest {
        nights
            .saturating_mul(config.rate_per_guest)
            .saturating_mul(Money::from(guest_count))
    } else {
        nights.saturating_mul(config.rate_flat)
    }
}
