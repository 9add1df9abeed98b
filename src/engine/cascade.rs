use std::collections::HashSet;

use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability::CASCADE_DELETIONS_TOTAL;

use super::{Engine, EngineError};

/// What a cascade removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadeOutcome {
    pub periods_removed: usize,
    pub reservations_removed: usize,
}

impl CascadeOutcome {
    fn absorb(&mut self, other: CascadeOutcome) {
        self.periods_removed += other.periods_removed;
        self.reservations_removed += other.reservations_removed;
    }
}

fn first_active<'a>(mut reservations: impl Iterator<Item = &'a Reservation>, now: Ms) -> Option<&'a Reservation> {
    reservations.find(|r| r.span.end > now)
}

impl Engine {
    /// Delete reservations, then periods, of one partition. No checks.
    async fn purge(
        &self,
        acc: &mut AccommodationState,
        reservations: Vec<Reservation>,
        period_ids: Vec<Ulid>,
    ) -> Result<CascadeOutcome, EngineError> {
        let mut outcome = CascadeOutcome::default();
        for r in &reservations {
            self.persist_and_apply(acc, &Event::deleted_reservation(r)).await?;
            outcome.reservations_removed += 1;
        }
        for id in period_ids {
            self.delete_period_locked(acc, id).await?;
            outcome.periods_removed += 1;
        }
        metrics::counter!(CASCADE_DELETIONS_TOTAL, "kind" => "reservation")
            .increment(outcome.reservations_removed as u64);
        metrics::counter!(CASCADE_DELETIONS_TOTAL, "kind" => "period")
            .increment(outcome.periods_removed as u64);
        Ok(outcome)
    }

    /// Remove every period (and its reservations) of the given
    /// accommodations, in order.
    ///
    /// An accommodation with a reservation ending in the future stops the
    /// cascade with `BusinessRule`; nothing of it is deleted, while
    /// accommodations processed before it stay deleted.
    pub async fn delete_periods_for_accommodations(
        &self,
        accommodation_ids: &[Ulid],
    ) -> Result<CascadeOutcome, EngineError> {
        let mut total = CascadeOutcome::default();
        for (i, accommodation_id) in accommodation_ids.iter().enumerate() {
            if accommodation_ids[..i].contains(accommodation_id) {
                continue;
            }
            let Some(partition) = self.tables.partition(accommodation_id) else {
                continue;
            };
            let mut guard = self.write_partition(partition).await;
            let now = self.now();
            if let Some(active) = first_active(guard.all_reservations(), now) {
                warn!(
                    accommodation = %accommodation_id,
                    reservation = %active.id,
                    "cascade stopped: active reservations exist"
                );
                return Err(EngineError::BusinessRule {
                    id: *accommodation_id,
                    reason: "active reservations exist",
                });
            }
            let reservations: Vec<Reservation> = guard.all_reservations().cloned().collect();
            let period_ids: Vec<Ulid> = guard.periods.iter().map(|p| p.id).collect();
            let outcome = self.purge(&mut guard, reservations, period_ids).await?;
            drop(guard);
            self.notify.remove(accommodation_id);

            info!(
                accommodation = %accommodation_id,
                periods = outcome.periods_removed,
                reservations = outcome.reservations_removed,
                "accommodation periods deleted"
            );
            total.absorb(outcome);
        }
        Ok(total)
    }

    /// Remove all of a user's reservations, provided none ends in the future.
    pub async fn delete_reservations_for_user(&self, user_id: Ulid) -> Result<CascadeOutcome, EngineError> {
        let now = self.now();
        let mine = self.get_reservations_by_user(&user_id).await;
        if let Some(active) = first_active(mine.iter(), now) {
            warn!(user = %user_id, reservation = %active.id, "user cascade refused: active reservations exist");
            return Err(EngineError::BusinessRule {
                id: user_id,
                reason: "user has active reservations",
            });
        }

        let mut seen = HashSet::new();
        let order: Vec<Ulid> = mine
            .iter()
            .map(|r| r.accommodation_id)
            .filter(|id| seen.insert(*id))
            .collect();

        let mut total = CascadeOutcome::default();
        for accommodation_id in order {
            let Some(partition) = self.tables.partition(&accommodation_id) else {
                continue;
            };
            let mut guard = self.write_partition(partition).await;
            // Re-check under the lock: a booking may have landed since the scan.
            let theirs: Vec<Reservation> = guard
                .all_reservations()
                .filter(|r| r.user_id == user_id)
                .cloned()
                .collect();
            if let Some(active) = first_active(theirs.iter(), self.now()) {
                warn!(user = %user_id, reservation = %active.id, "user cascade stopped: active reservation appeared");
                return Err(EngineError::BusinessRule {
                    id: user_id,
                    reason: "user has active reservations",
                });
            }
            let outcome = self.purge(&mut guard, theirs, Vec::new()).await?;
            total.absorb(outcome);
        }

        info!(user = %user_id, reservations = total.reservations_removed, "user reservations deleted");
        Ok(total)
    }

    /// Host-initiated removal of one period. Refused while any of its
    /// reservations ends in the future; ended reservations go with it.
    pub async fn delete_period(&self, id: Ulid, requester: Ulid) -> Result<CascadeOutcome, EngineError> {
        let (_, mut guard) = self.resolve_period_write(&id).await?;
        let owner = guard.period(&id).map(|p| p.owner_id).ok_or(EngineError::NotFound(id))?;
        if owner != requester {
            return Err(EngineError::Unauthorized {
                resource: id,
                actor: requester,
            });
        }
        if first_active(guard.reservations_of(&id).iter(), self.now()).is_some() {
            return Err(EngineError::BusinessRule {
                id,
                reason: "active reservations exist",
            });
        }
        let expired = guard.reservations_of(&id).to_vec();
        let outcome = self.purge(&mut guard, expired, vec![id]).await?;
        info!(period = %id, reservations = outcome.reservations_removed, "period deleted");
        Ok(outcome)
    }
}
