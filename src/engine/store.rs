use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

pub type SharedAccommodation = Arc<RwLock<AccommodationState>>;

/// Where a reservation lives, as recorded in the by-user index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationRef {
    pub accommodation_id: Ulid,
    pub period_id: Ulid,
    pub reservation_id: Ulid,
}

/// In-memory tables.
///
/// Periods are partitioned by accommodation, and each partition also holds
/// its reservations grouped by period. Three lookup indexes sit next to the
/// partitions; [`Tables::apply`] is the only writer and updates a partition
/// and every index for one event together.
pub struct Tables {
    partitions: DashMap<Ulid, SharedAccommodation>,
    /// period id → accommodation id
    period_index: DashMap<Ulid, Ulid>,
    /// reservation id → period id
    reservation_index: DashMap<Ulid, Ulid>,
    /// user id → that user's reservations (secondary access path)
    user_index: DashMap<Ulid, Vec<ReservationRef>>,
}

impl Default for Tables {
    fn default() -> Self {
        Self::new()
    }
}

impl Tables {
    pub fn new() -> Self {
        Self {
            partitions: DashMap::new(),
            period_index: DashMap::new(),
            reservation_index: DashMap::new(),
            user_index: DashMap::new(),
        }
    }

    // ── Partitions ───────────────────────────────────────────

    pub fn partition(&self, accommodation_id: &Ulid) -> Option<SharedAccommodation> {
        self.partitions.get(accommodation_id).map(|e| e.value().clone())
    }

    pub fn partition_or_create(&self, accommodation_id: Ulid) -> SharedAccommodation {
        self.partitions
            .entry(accommodation_id)
            .or_insert_with(|| Arc::new(RwLock::new(AccommodationState::new(accommodation_id))))
            .value()
            .clone()
    }

    pub fn accommodation_ids(&self) -> Vec<Ulid> {
        self.partitions.iter().map(|e| *e.key()).collect()
    }

    // ── Indexes ──────────────────────────────────────────────

    pub fn accommodation_for_period(&self, period_id: &Ulid) -> Option<Ulid> {
        self.period_index.get(period_id).map(|e| *e.value())
    }

    pub fn contains_period(&self, period_id: &Ulid) -> bool {
        self.period_index.contains_key(period_id)
    }

    pub fn contains_reservation(&self, reservation_id: &Ulid) -> bool {
        self.reservation_index.contains_key(reservation_id)
    }

    pub fn user_reservations(&self, user_id: &Ulid) -> Vec<ReservationRef> {
        self.user_index
            .get(user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Reserve `period_id` for `accommodation_id` before its create commits.
    /// False when the id is already taken, committed or claimed.
    pub fn claim_period(&self, period_id: Ulid, accommodation_id: Ulid) -> bool {
        match self.period_index.entry(period_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(accommodation_id);
                true
            }
        }
    }

    /// Undo a [`Tables::claim_period`] whose create did not commit.
    pub fn release_period_claim(&self, period_id: &Ulid, accommodation_id: &Ulid) {
        self.period_index
            .remove_if(period_id, |_, owner| owner == accommodation_id);
    }

    pub fn claim_reservation(&self, reservation_id: Ulid, period_id: Ulid) -> bool {
        match self.reservation_index.entry(reservation_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(period_id);
                true
            }
        }
    }

    pub fn release_reservation_claim(&self, reservation_id: &Ulid, period_id: &Ulid) {
        self.reservation_index
            .remove_if(reservation_id, |_, owner| owner == period_id);
    }

    pub fn period_count(&self) -> usize {
        self.period_index.len()
    }

    pub fn reservation_count(&self) -> usize {
        self.reservation_index.len()
    }

    fn index_reservation(&self, r: &Reservation) {
        self.reservation_index.insert(r.id, r.period_id);
        self.user_index.entry(r.user_id).or_default().push(ReservationRef {
            accommodation_id: r.accommodation_id,
            period_id: r.period_id,
            reservation_id: r.id,
        });
    }

    fn unindex_reservation(&self, reservation_id: &Ulid, user_id: &Ulid) {
        self.reservation_index.remove(reservation_id);
        let now_empty = match self.user_index.get_mut(user_id) {
            Some(mut refs) => {
                refs.retain(|r| r.reservation_id != *reservation_id);
                refs.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.user_index.remove_if(user_id, |_, refs| refs.is_empty());
        }
    }

    // ── Event application ────────────────────────────────────

    /// Apply one event to its partition (caller holds the write lock) and to
    /// every index.
    pub fn apply(&self, acc: &mut AccommodationState, event: &Event) {
        match event {
            Event::PeriodCreated {
                id,
                accommodation_id,
                owner_id,
                span,
                price,
            } => {
                acc.insert_period(AvailabilityPeriod {
                    id: *id,
                    accommodation_id: *accommodation_id,
                    owner_id: *owner_id,
                    span: *span,
                    price: *price,
                });
                self.period_index.insert(*id, *accommodation_id);
            }
            Event::PeriodUpdated { id, span, price, .. } => {
                if let Some(mut period) = acc.remove_period(id) {
                    period.span = *span;
                    period.price = *price;
                    acc.insert_period(period);
                }
            }
            Event::PeriodDeleted { id, .. } => {
                let orphans: Vec<(Ulid, Ulid)> = acc
                    .reservations_of(id)
                    .iter()
                    .map(|r| (r.id, r.user_id))
                    .collect();
                for (rid, uid) in &orphans {
                    self.unindex_reservation(rid, uid);
                }
                acc.remove_period(id);
                self.period_index.remove(id);
            }
            Event::ReservationCreated {
                id,
                accommodation_id,
                period_id,
                user_id,
                span,
                guest_count,
                price,
            } => {
                let reservation = Reservation {
                    id: *id,
                    accommodation_id: *accommodation_id,
                    period_id: *period_id,
                    user_id: *user_id,
                    span: *span,
                    guest_count: *guest_count,
                    price: *price,
                };
                self.index_reservation(&reservation);
                acc.insert_reservation(reservation);
            }
            Event::ReservationDeleted {
                id,
                period_id,
                user_id,
                ..
            } => {
                acc.remove_reservation(period_id, id);
                self.unindex_reservation(id, user_id);
            }
        }
    }
}
