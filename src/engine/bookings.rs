use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::overlap::{covers, reservations_conflict};
use super::periods::validate_timestamps;
use super::pricing;
use super::{Engine, EngineError};

/// Guest request to book a stay inside a period.
#[derive(Debug, Clone)]
pub struct ReservationRequest {
    /// Caller-chosen id; generated when absent.
    pub id: Option<Ulid>,
    pub period_id: Ulid,
    pub user_id: Ulid,
    pub span: Span,
    pub guest_count: u32,
}

fn validate_request(req: &ReservationRequest) -> Result<(), EngineError> {
    if req.guest_count < 1 {
        return Err(EngineError::Validation("guest count must be at least 1"));
    }
    if req.guest_count > MAX_GUEST_COUNT {
        return Err(EngineError::LimitExceeded("too many guests"));
    }
    if req.span.duration_ms() < DAY_MS {
        return Err(EngineError::Validation("duration must be at least one day"));
    }
    validate_timestamps(&req.span)
}

impl Engine {
    pub async fn create_reservation(&self, req: ReservationRequest) -> Result<Reservation, EngineError> {
        validate_request(&req)?;
        let id = req.id.unwrap_or_else(Ulid::new);
        if self.tables.contains_reservation(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let (accommodation_id, mut guard) = self.resolve_period_write(&req.period_id).await?;
        let period = guard
            .period(&req.period_id)
            .cloned()
            .ok_or(EngineError::NotFound(req.period_id))?;
        if !covers(&period.span, &req.span) {
            return Err(EngineError::Validation("reservation must fall within the period"));
        }
        let siblings = guard.reservations_of(&req.period_id);
        if siblings.len() >= MAX_RESERVATIONS_PER_PERIOD {
            return Err(EngineError::LimitExceeded("too many reservations on period"));
        }
        if let Some(other) = siblings.iter().find(|r| reservations_conflict(&r.span, &req.span)) {
            metrics::counter!(crate::observability::CONFLICTS_REJECTED_TOTAL, "kind" => "reservation")
                .increment(1);
            return Err(EngineError::Conflict(other.id));
        }
        if !self.tables.claim_reservation(id, req.period_id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let reservation = Reservation {
            id,
            accommodation_id,
            period_id: req.period_id,
            user_id: req.user_id,
            span: req.span,
            guest_count: req.guest_count,
            price: pricing::price(&period.price, &req.span, req.guest_count),
        };
        if let Err(e) = self
            .persist_and_apply(&mut guard, &Event::created_reservation(&reservation))
            .await
        {
            self.tables.release_reservation_claim(&id, &req.period_id);
            return Err(e);
        }
        Ok(reservation)
    }

    pub async fn get_reservations_by_period(&self, period_id: &Ulid) -> Vec<Reservation> {
        let Some(accommodation_id) = self.tables.accommodation_for_period(period_id) else {
            return Vec::new();
        };
        match self.tables.partition(&accommodation_id) {
            Some(partition) => partition.read().await.reservations_of(period_id).to_vec(),
            None => Vec::new(),
        }
    }

    /// Walks the by-user index and reads each partition on its own, so the
    /// result is not a single snapshot across accommodations.
    pub async fn get_reservations_by_user(&self, user_id: &Ulid) -> Vec<Reservation> {
        let mut out = Vec::new();
        for r in self.tables.user_reservations(user_id) {
            let Some(partition) = self.tables.partition(&r.accommodation_id) else {
                continue;
            };
            let guard = partition.read().await;
            if let Some(found) = guard
                .reservations_of(&r.period_id)
                .iter()
                .find(|x| x.id == r.reservation_id)
            {
                out.push(found.clone());
            }
        }
        out.sort_by_key(|r| (r.span.start, r.id));
        out
    }

    /// The user's reservations that have already ended.
    pub async fn get_expired_reservations_by_user(&self, user_id: &Ulid) -> Vec<Reservation> {
        let now = self.now();
        let mut all = self.get_reservations_by_user(user_id).await;
        all.retain(|r| r.span.end < now);
        all
    }

    /// Guest cancellation. Only the booking guest may cancel, and only
    /// before the stay starts.
    pub async fn delete_reservation(
        &self,
        id: Ulid,
        period_id: Ulid,
        requester: Ulid,
    ) -> Result<(), EngineError> {
        let (_, mut guard) = self.resolve_period_write(&period_id).await?;
        let reservation = guard
            .reservations_of(&period_id)
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if reservation.user_id != requester {
            return Err(EngineError::Unauthorized {
                resource: id,
                actor: requester,
            });
        }
        if self.now() >= reservation.span.start {
            return Err(EngineError::BusinessRule {
                id,
                reason: "reservation already started",
            });
        }
        self.persist_and_apply(&mut guard, &Event::deleted_reservation(&reservation))
            .await
    }
}
