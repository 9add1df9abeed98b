use std::collections::HashSet;

use ulid::Ulid;

use crate::limits::{MAX_IN_CLAUSE_IDS, MAX_QUERY_WINDOW_MS};
use crate::model::*;

use super::overlap::{covers, reservations_conflict};
use super::{Engine, EngineError};

/// Whether `acc` can host a stay over `window`: some period covers the
/// window, and no reservation of a covering period touches it.
fn is_available(acc: &AccommodationState, window: &Span) -> bool {
    let mut covered = false;
    for period in acc.periods_starting_before(window.start.saturating_add(1)) {
        if !covers(&period.span, window) {
            continue;
        }
        covered = true;
        if acc
            .reservations_of(&period.id)
            .iter()
            .any(|r| reservations_conflict(&r.span, window))
        {
            return false;
        }
    }
    covered
}

impl Engine {
    /// Candidates (deduplicated, in input order) free for the whole window.
    pub async fn find_available_accommodations(
        &self,
        candidates: &[Ulid],
        window: Span,
    ) -> Result<Vec<Ulid>, EngineError> {
        if !window.is_ordered() {
            return Err(EngineError::Validation("start must be before end"));
        }
        if window.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("search window too wide"));
        }
        if candidates.len() > MAX_IN_CLAUSE_IDS {
            return Err(EngineError::LimitExceeded("too many candidate accommodations"));
        }

        let mut seen = HashSet::new();
        let mut available = Vec::new();
        for id in candidates {
            if !seen.insert(*id) {
                continue;
            }
            let Some(partition) = self.tables.partition(id) else {
                continue;
            };
            if is_available(&*partition.read().await, &window) {
                available.push(*id);
            }
        }
        Ok(available)
    }
}
