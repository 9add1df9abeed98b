use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::overlap::periods_conflict;
use super::{Engine, EngineError};

/// Host request to publish a period.
#[derive(Debug, Clone)]
pub struct PeriodRequest {
    /// Caller-chosen id; generated when absent.
    pub id: Option<Ulid>,
    pub accommodation_id: Ulid,
    pub owner_id: Ulid,
    pub span: Span,
    pub price: PriceConfig,
}

/// Fields to change on an existing period. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeriodPatch {
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub per_guest: Option<bool>,
    pub rate_per_guest: Option<Money>,
    pub rate_flat: Option<Money>,
}

impl PeriodPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn merge(&self, period: &AvailabilityPeriod) -> (Span, PriceConfig) {
        let span = Span::new(
            self.start.unwrap_or(period.span.start),
            self.end.unwrap_or(period.span.end),
        );
        let price = PriceConfig {
            per_guest: self.per_guest.unwrap_or(period.price.per_guest),
            rate_per_guest: self.rate_per_guest.unwrap_or(period.price.rate_per_guest),
            rate_flat: self.rate_flat.unwrap_or(period.price.rate_flat),
        };
        (span, price)
    }
}

pub(super) fn validate_timestamps(span: &Span) -> Result<(), EngineError> {
    for t in [span.start, span.end] {
        if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t) {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too long"));
    }
    Ok(())
}

fn validate_price(price: &PriceConfig) -> Result<(), EngineError> {
    if price.is_negative() {
        return Err(EngineError::Validation("rate cannot be negative"));
    }
    if price.rate_per_guest > MAX_RATE || price.rate_flat > MAX_RATE {
        return Err(EngineError::LimitExceeded("rate too large"));
    }
    Ok(())
}

fn validate_span(span: &Span) -> Result<(), EngineError> {
    if !span.is_ordered() {
        return Err(EngineError::Validation("start must be before end"));
    }
    validate_timestamps(span)
}

/// First period of `acc` (other than `except`) conflicting with `span`.
fn find_conflict(acc: &AccommodationState, span: &Span, except: Option<Ulid>) -> Option<Ulid> {
    // A period starting at or after `span.end` can only conflict through the
    // equal-end clause, which needs it to end at `span.end` too; such a period
    // would be degenerate and is never stored.
    acc.periods_starting_before(span.end)
        .iter()
        .filter(|p| Some(p.id) != except)
        .find(|p| periods_conflict(&p.span, span))
        .map(|p| p.id)
}

impl Engine {
    pub async fn create_period(&self, req: PeriodRequest) -> Result<Ulid, EngineError> {
        validate_price(&req.price)?;
        if req.span.start <= self.now() {
            return Err(EngineError::Validation("start must be in the future"));
        }
        validate_span(&req.span)?;

        let id = req.id.unwrap_or_else(Ulid::new);
        if self.tables.contains_period(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let partition = self.tables.partition_or_create(req.accommodation_id);
        let mut guard = self.write_partition(partition).await;
        if guard.periods.len() >= MAX_PERIODS_PER_ACCOMMODATION {
            return Err(EngineError::LimitExceeded("too many periods on accommodation"));
        }
        if let Some(other) = find_conflict(&guard, &req.span, None) {
            metrics::counter!(crate::observability::CONFLICTS_REJECTED_TOTAL, "kind" => "period")
                .increment(1);
            return Err(EngineError::Conflict(other));
        }
        // The accommodation lock does not cover a create of the same id on
        // another accommodation; the index entry does.
        if !self.tables.claim_period(id, req.accommodation_id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let period = AvailabilityPeriod {
            id,
            accommodation_id: req.accommodation_id,
            owner_id: req.owner_id,
            span: req.span,
            price: req.price,
        };
        if let Err(e) = self.persist_and_apply(&mut guard, &Event::created_period(&period)).await {
            self.tables.release_period_claim(&id, &req.accommodation_id);
            return Err(e);
        }
        Ok(id)
    }

    pub async fn update_period(
        &self,
        id: Ulid,
        requester: Ulid,
        patch: PeriodPatch,
    ) -> Result<AvailabilityPeriod, EngineError> {
        let (accommodation_id, mut guard) = self.resolve_period_write(&id).await?;
        let current = guard.period(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if current.owner_id != requester {
            return Err(EngineError::Unauthorized {
                resource: id,
                actor: requester,
            });
        }
        if guard.has_reservations(&id) {
            return Err(EngineError::BusinessRule {
                id,
                reason: "period has reservations",
            });
        }

        if patch.is_empty() {
            return Ok(current);
        }

        let (span, price) = patch.merge(&current);
        validate_price(&price)?;
        if span.start != current.span.start && span.start <= self.now() {
            return Err(EngineError::Validation("start must be in the future"));
        }
        validate_span(&span)?;
        if let Some(other) = find_conflict(&guard, &span, Some(id)) {
            metrics::counter!(crate::observability::CONFLICTS_REJECTED_TOTAL, "kind" => "period")
                .increment(1);
            return Err(EngineError::Conflict(other));
        }

        let event = Event::PeriodUpdated {
            id,
            accommodation_id,
            span,
            price,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(AvailabilityPeriod { span, price, ..current })
    }

    pub async fn get_periods_by_accommodation(&self, accommodation_id: &Ulid) -> Vec<AvailabilityPeriod> {
        match self.tables.partition(accommodation_id) {
            Some(partition) => partition.read().await.periods.clone(),
            None => Vec::new(),
        }
    }

    /// Period `id`, provided it belongs to `accommodation_id`.
    pub async fn get_period(
        &self,
        id: &Ulid,
        accommodation_id: &Ulid,
    ) -> Result<AvailabilityPeriod, EngineError> {
        let partition = self
            .tables
            .partition(accommodation_id)
            .ok_or(EngineError::NotFound(*id))?;
        let guard = partition.read().await;
        guard.period(id).cloned().ok_or(EngineError::NotFound(*id))
    }

    /// Period `id` wherever it lives.
    pub async fn find_period(&self, id: &Ulid) -> Option<AvailabilityPeriod> {
        let accommodation_id = self.tables.accommodation_for_period(id)?;
        let partition = self.tables.partition(&accommodation_id)?;
        let guard = partition.read().await;
        guard.period(id).cloned()
    }

    /// Remove a period with no dependent checks. The caller holds the
    /// partition lock and has already dealt with the period's reservations.
    pub(super) async fn delete_period_locked(
        &self,
        acc: &mut AccommodationState,
        id: Ulid,
    ) -> Result<(), EngineError> {
        let event = Event::PeriodDeleted {
            id,
            accommodation_id: acc.id,
        };
        self.persist_and_apply(acc, &event).await
    }
}
