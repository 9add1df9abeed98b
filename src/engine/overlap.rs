use crate::model::{Ms, Span};

fn strictly_inside(t: Ms, span: &Span) -> bool {
    span.start < t && t < span.end
}

/// Conflict rule for availability periods of the same accommodation.
///
/// Either span has an endpoint strictly inside the other, or both end on the
/// same instant. The equal-end clause fires regardless of the start dates,
/// so `[1, 10]` and `[9, 10]` conflict while `[1, 10]` and `[10, 20]` do not.
pub fn periods_conflict(a: &Span, b: &Span) -> bool {
    strictly_inside(b.start, a)
        || strictly_inside(b.end, a)
        || strictly_inside(a.start, b)
        || strictly_inside(a.end, b)
        || a.end == b.end
}

/// Conflict rule for reservations of the same period. Inclusive on both
/// ends: back-to-back stays sharing a boundary instant overlap.
pub fn reservations_conflict(a: &Span, b: &Span) -> bool {
    a.start <= b.end && a.end >= b.start
}

/// Non-strict containment of `inner` in `outer`.
pub fn covers(outer: &Span, inner: &Span) -> bool {
    outer.start <= inner.start && inner.end <= outer.end
}
