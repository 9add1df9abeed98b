use super::*;
use crate::limits::*;

use chrono::NaiveDate;

const D: Ms = DAY_MS;

/// Midnight UTC of the given date.
fn day(y: i32, m: u32, d: u32) -> Ms {
    NaiveDate::from_ymd_opt(y, m, d)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        .and_utc()
        .timestamp_millis()
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("innkeep_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

/// Engine whose clock reads 2024-01-01 until a test moves it.
fn engine_at(name: &str) -> (Engine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(day(2024, 1, 1)));
    let engine = Engine::with_clock(test_wal_path(name), Arc::new(NotifyHub::new()), clock.clone()).unwrap();
    (engine, clock)
}

fn period_req(acc: Ulid, owner: Ulid, span: Span, price: PriceConfig) -> PeriodRequest {
    PeriodRequest {
        id: None,
        accommodation_id: acc,
        owner_id: owner,
        span,
        price,
    }
}

fn reservation_req(period_id: Ulid, user: Ulid, span: Span, guest_count: u32) -> ReservationRequest {
    ReservationRequest {
        id: None,
        period_id,
        user_id: user,
        span,
        guest_count,
    }
}

/// Period 2024-01-10 → 2024-01-20 at a flat 100/night.
async fn january_period(engine: &Engine, acc: Ulid, owner: Ulid) -> Ulid {
    engine
        .create_period(period_req(
            acc,
            owner,
            Span::new(day(2024, 1, 10), day(2024, 1, 20)),
            PriceConfig::flat(100),
        ))
        .await
        .unwrap()
}

// ── Reference scenarios ──────────────────────────────────

#[tokio::test]
async fn scenario_flat_rate_price() {
    let (engine, _) = engine_at("scenario_price.wal");
    let (acc, host, guest) = (Ulid::new(), Ulid::new(), Ulid::new());
    let p = january_period(&engine, acc, host).await;

    let r = engine
        .create_reservation(reservation_req(p, guest, Span::new(day(2024, 1, 12), day(2024, 1, 15)), 2))
        .await
        .unwrap();
    assert_eq!(r.price, 300);
    assert_eq!(r.accommodation_id, acc);
    assert_eq!(engine.get_reservations_by_period(&p).await, vec![r]);
}

#[tokio::test]
async fn scenario_same_day_reservation_rejected() {
    let (engine, _) = engine_at("scenario_same_day.wal");
    let p = january_period(&engine, Ulid::new(), Ulid::new()).await;

    let err = engine
        .create_reservation(reservation_req(p, Ulid::new(), Span::new(day(2024, 1, 12), day(2024, 1, 12)), 1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation("duration must be at least one day")));
    assert_eq!(err.to_string(), "validation failed: duration must be at least one day");
}

#[tokio::test]
async fn scenario_overlapping_period_rejected() {
    let (engine, _) = engine_at("scenario_overlap.wal");
    let (acc, host) = (Ulid::new(), Ulid::new());
    let p = january_period(&engine, acc, host).await;

    let err = engine
        .create_period(period_req(
            acc,
            host,
            Span::new(day(2024, 1, 18), day(2024, 1, 25)),
            PriceConfig::flat(100),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(id) if id == p));
    assert_eq!(engine.get_periods_by_accommodation(&acc).await.len(), 1);
}

#[tokio::test]
async fn scenario_cascade_blocked_by_future_reservation() {
    let (engine, _) = engine_at("scenario_cascade.wal");
    let (acc, host) = (Ulid::new(), Ulid::new());
    let p = january_period(&engine, acc, host).await;
    let p2 = engine
        .create_period(period_req(
            acc,
            host,
            Span::new(day(2024, 1, 21), day(2024, 2, 10)),
            PriceConfig::flat(100),
        ))
        .await
        .unwrap();
    engine
        .create_reservation(reservation_req(p2, Ulid::new(), Span::new(day(2024, 1, 28), day(2024, 2, 1)), 1))
        .await
        .unwrap();

    let err = engine.delete_periods_for_accommodations(&[acc]).await.unwrap_err();
    assert!(matches!(err, EngineError::BusinessRule { id, .. } if id == acc));
    assert_eq!(engine.get_periods_by_accommodation(&acc).await.len(), 2);
    assert!(engine.find_period(&p).await.is_some());
    assert_eq!(engine.get_reservations_by_period(&p2).await.len(), 1);
}

#[tokio::test]
async fn scenario_search_excludes_booked() {
    let (engine, _) = engine_at("scenario_search.wal");
    let (a1, a2, host) = (Ulid::new(), Ulid::new(), Ulid::new());
    let march = Span::new(day(2024, 2, 25), day(2024, 3, 10));
    engine.create_period(period_req(a1, host, march, PriceConfig::flat(80))).await.unwrap();
    let p2 = engine.create_period(period_req(a2, host, march, PriceConfig::flat(80))).await.unwrap();
    engine
        .create_reservation(reservation_req(p2, Ulid::new(), Span::new(day(2024, 3, 2), day(2024, 3, 3)), 1))
        .await
        .unwrap();

    let found = engine
        .find_available_accommodations(&[a1, a2], Span::new(day(2024, 3, 1), day(2024, 3, 5)))
        .await
        .unwrap();
    assert_eq!(found, vec![a1]);
}

// ── Periods ──────────────────────────────────────────────

#[tokio::test]
async fn create_period_validation() {
    let (engine, _) = engine_at("period_validation.wal");
    let (acc, host) = (Ulid::new(), Ulid::new());
    let future = Span::new(day(2024, 2, 1), day(2024, 2, 5));

    let negative = PriceConfig { per_guest: false, rate_per_guest: -1, rate_flat: 10 };
    let cases = [
        (period_req(acc, host, future, negative), "rate cannot be negative"),
        (
            period_req(acc, host, Span::new(day(2023, 12, 30), day(2024, 1, 5)), PriceConfig::flat(1)),
            "start must be in the future",
        ),
        (
            period_req(acc, host, Span::new(day(2024, 2, 5), day(2024, 2, 5)), PriceConfig::flat(1)),
            "start must be before end",
        ),
        (
            period_req(acc, host, Span::new(day(2024, 2, 5), day(2024, 2, 1)), PriceConfig::flat(1)),
            "start must be before end",
        ),
    ];
    for (req, expected) in cases {
        match engine.create_period(req).await {
            Err(EngineError::Validation(msg)) => assert_eq!(msg, expected),
            other => panic!("expected validation error {expected:?}, got {other:?}"),
        }
    }

    let too_long = Span::new(day(2024, 2, 1), day(2024, 2, 1) + MAX_SPAN_DURATION_MS + D);
    assert!(matches!(
        engine.create_period(period_req(acc, host, too_long, PriceConfig::flat(1))).await,
        Err(EngineError::LimitExceeded(_))
    ));
    assert!(matches!(
        engine
            .create_period(period_req(acc, host, future, PriceConfig::flat(MAX_RATE + 1)))
            .await,
        Err(EngineError::LimitExceeded(_))
    ));
    assert!(engine.get_periods_by_accommodation(&acc).await.is_empty());
}

#[tokio::test]
async fn create_period_duplicate_id() {
    let (engine, _) = engine_at("period_duplicate.wal");
    let id = Ulid::new();
    let mut req = period_req(
        Ulid::new(),
        Ulid::new(),
        Span::new(day(2024, 2, 1), day(2024, 2, 5)),
        PriceConfig::flat(10),
    );
    req.id = Some(id);
    assert_eq!(engine.create_period(req.clone()).await.unwrap(), id);

    // Same id on a different accommodation is still taken.
    req.accommodation_id = Ulid::new();
    assert!(matches!(engine.create_period(req).await, Err(EngineError::AlreadyExists(x)) if x == id));
}

#[tokio::test]
async fn periods_touching_at_boundary_coexist() {
    let (engine, _) = engine_at("period_touching.wal");
    let (acc, host) = (Ulid::new(), Ulid::new());
    let first = january_period(&engine, acc, host).await;
    let second = engine
        .create_period(period_req(
            acc,
            host,
            Span::new(day(2024, 1, 20), day(2024, 1, 30)),
            PriceConfig::flat(100),
        ))
        .await
        .unwrap();
    // Same end as `second`, so it conflicts even though it starts later.
    let err = engine
        .create_period(period_req(
            acc,
            host,
            Span::new(day(2024, 1, 29), day(2024, 1, 30)),
            PriceConfig::flat(100),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(id) if id == second));

    let periods = engine.get_periods_by_accommodation(&acc).await;
    assert_eq!(periods.iter().map(|p| p.id).collect::<Vec<_>>(), vec![first, second]);
}

#[tokio::test]
async fn same_span_on_other_accommodation_is_fine() {
    let (engine, _) = engine_at("period_other_acc.wal");
    let host = Ulid::new();
    january_period(&engine, Ulid::new(), host).await;
    january_period(&engine, Ulid::new(), host).await;
    assert_eq!(engine.tables.period_count(), 2);
}

#[tokio::test]
async fn get_period_checks_accommodation() {
    let (engine, _) = engine_at("period_get.wal");
    let (acc, host) = (Ulid::new(), Ulid::new());
    let p = january_period(&engine, acc, host).await;

    let found = engine.get_period(&p, &acc).await.unwrap();
    assert_eq!(found.owner_id, host);
    assert_eq!(found.price, PriceConfig::flat(100));
    assert!(matches!(engine.get_period(&p, &Ulid::new()).await, Err(EngineError::NotFound(_))));
    assert!(matches!(engine.get_period(&Ulid::new(), &acc).await, Err(EngineError::NotFound(_))));
    assert!(engine.get_periods_by_accommodation(&Ulid::new()).await.is_empty());
}

#[tokio::test]
async fn update_period_merges_patch() {
    let (engine, _) = engine_at("period_update.wal");
    let (acc, host) = (Ulid::new(), Ulid::new());
    let p = january_period(&engine, acc, host).await;

    let patch = PeriodPatch {
        end: Some(day(2024, 1, 25)),
        per_guest: Some(true),
        rate_per_guest: Some(40),
        ..Default::default()
    };
    let updated = engine.update_period(p, host, patch).await.unwrap();
    assert_eq!(updated.span, Span::new(day(2024, 1, 10), day(2024, 1, 25)));
    assert_eq!(updated.price, PriceConfig { per_guest: true, rate_per_guest: 40, rate_flat: 100 });
    assert_eq!(engine.get_period(&p, &acc).await.unwrap(), updated);
}

#[tokio::test]
async fn update_period_rules() {
    let (engine, clock) = engine_at("period_update_rules.wal");
    let (acc, host) = (Ulid::new(), Ulid::new());
    let p = january_period(&engine, acc, host).await;
    let later = engine
        .create_period(period_req(
            acc,
            host,
            Span::new(day(2024, 2, 1), day(2024, 2, 10)),
            PriceConfig::flat(100),
        ))
        .await
        .unwrap();

    // Only the owner may update.
    let err = engine.update_period(p, Ulid::new(), PeriodPatch::default()).await.unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized { resource, .. } if resource == p));

    // Overlap checks skip the period itself but see its siblings.
    let shrink = PeriodPatch { start: Some(day(2024, 1, 12)), ..Default::default() };
    engine.update_period(p, host, shrink).await.unwrap();
    let collide = PeriodPatch { end: Some(day(2024, 2, 5)), ..Default::default() };
    assert!(matches!(
        engine.update_period(p, host, collide).await,
        Err(EngineError::Conflict(id)) if id == later
    ));

    // A changed start must still lie in the future.
    clock.set(day(2024, 1, 15));
    let backdate = PeriodPatch { start: Some(day(2024, 1, 14)), ..Default::default() };
    assert!(matches!(
        engine.update_period(p, host, backdate).await,
        Err(EngineError::Validation("start must be in the future"))
    ));
    // Keeping the start while the period is running is fine.
    let extend = PeriodPatch { end: Some(day(2024, 1, 22)), ..Default::default() };
    engine.update_period(p, host, extend).await.unwrap();
    // An empty patch is a no-op returning the stored period.
    let unchanged = engine.update_period(p, host, PeriodPatch::default()).await.unwrap();
    assert_eq!(unchanged.span, Span::new(day(2024, 1, 12), day(2024, 1, 22)));

    // Reserved periods are frozen.
    engine
        .create_reservation(reservation_req(later, Ulid::new(), Span::new(day(2024, 2, 2), day(2024, 2, 4)), 1))
        .await
        .unwrap();
    let bump = PeriodPatch { rate_flat: Some(150), ..Default::default() };
    assert!(matches!(
        engine.update_period(later, host, bump).await,
        Err(EngineError::BusinessRule { .. })
    ));

    assert!(matches!(
        engine.update_period(Ulid::new(), host, PeriodPatch::default()).await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Reservations ─────────────────────────────────────────

#[tokio::test]
async fn reservation_must_fit_period() {
    let (engine, _) = engine_at("reservation_fit.wal");
    let p = january_period(&engine, Ulid::new(), Ulid::new()).await;
    let guest = Ulid::new();

    let outside = reservation_req(p, guest, Span::new(day(2024, 1, 18), day(2024, 1, 22)), 1);
    assert!(matches!(engine.create_reservation(outside).await, Err(EngineError::Validation(_))));

    let nobody = reservation_req(p, guest, Span::new(day(2024, 1, 12), day(2024, 1, 14)), 0);
    assert!(matches!(engine.create_reservation(nobody).await, Err(EngineError::Validation(_))));

    let crowd = reservation_req(p, guest, Span::new(day(2024, 1, 12), day(2024, 1, 14)), MAX_GUEST_COUNT + 1);
    assert!(matches!(engine.create_reservation(crowd).await, Err(EngineError::LimitExceeded(_))));

    let orphan = reservation_req(Ulid::new(), guest, Span::new(day(2024, 1, 12), day(2024, 1, 14)), 1);
    assert!(matches!(engine.create_reservation(orphan).await, Err(EngineError::NotFound(_))));

    // Exactly the period's bounds is allowed.
    let whole = reservation_req(p, guest, Span::new(day(2024, 1, 10), day(2024, 1, 20)), 1);
    engine.create_reservation(whole).await.unwrap();
}

#[tokio::test]
async fn sibling_reservations_conflict_at_shared_boundary() {
    let (engine, _) = engine_at("reservation_boundary.wal");
    let p = january_period(&engine, Ulid::new(), Ulid::new()).await;
    let first = engine
        .create_reservation(reservation_req(p, Ulid::new(), Span::new(day(2024, 1, 12), day(2024, 1, 15)), 1))
        .await
        .unwrap();

    let back_to_back = reservation_req(p, Ulid::new(), Span::new(day(2024, 1, 15), day(2024, 1, 17)), 1);
    assert!(matches!(
        engine.create_reservation(back_to_back).await,
        Err(EngineError::Conflict(id)) if id == first.id
    ));
    let next_day = reservation_req(p, Ulid::new(), Span::new(day(2024, 1, 16), day(2024, 1, 17)), 1);
    engine.create_reservation(next_day).await.unwrap();
}

#[tokio::test]
async fn per_guest_pricing_rounds_partial_nights_up() {
    let (engine, _) = engine_at("reservation_per_guest.wal");
    let p = engine
        .create_period(period_req(
            Ulid::new(),
            Ulid::new(),
            Span::new(day(2024, 1, 10), day(2024, 1, 20)),
            PriceConfig::per_guest(25),
        ))
        .await
        .unwrap();
    let start = day(2024, 1, 12);
    let r = engine
        .create_reservation(reservation_req(p, Ulid::new(), Span::new(start, start + 2 * D + 1), 3))
        .await
        .unwrap();
    assert_eq!(r.price, 3 * 25 * 3);
}

#[tokio::test]
async fn delete_reservation_rules() {
    let (engine, clock) = engine_at("reservation_delete.wal");
    let p = january_period(&engine, Ulid::new(), Ulid::new()).await;
    let guest = Ulid::new();
    let early = engine
        .create_reservation(reservation_req(p, guest, Span::new(day(2024, 1, 10), day(2024, 1, 12)), 1))
        .await
        .unwrap();
    let late = engine
        .create_reservation(reservation_req(p, guest, Span::new(day(2024, 1, 15), day(2024, 1, 18)), 1))
        .await
        .unwrap();

    assert!(matches!(
        engine.delete_reservation(late.id, p, Ulid::new()).await,
        Err(EngineError::Unauthorized { .. })
    ));
    assert!(matches!(
        engine.delete_reservation(Ulid::new(), p, guest).await,
        Err(EngineError::NotFound(_))
    ));

    // On the start instant it is too late.
    clock.set(day(2024, 1, 10));
    assert!(matches!(
        engine.delete_reservation(early.id, p, guest).await,
        Err(EngineError::BusinessRule { .. })
    ));

    engine.delete_reservation(late.id, p, guest).await.unwrap();
    assert_eq!(engine.get_reservations_by_period(&p).await, vec![early]);
    assert_eq!(engine.get_reservations_by_user(&guest).await.len(), 1);
}

#[tokio::test]
async fn reservations_by_user_span_accommodations() {
    let (engine, clock) = engine_at("reservation_by_user.wal");
    let host = Ulid::new();
    let guest = Ulid::new();
    let p1 = january_period(&engine, Ulid::new(), host).await;
    let p2 = january_period(&engine, Ulid::new(), host).await;

    let a = engine
        .create_reservation(reservation_req(p1, guest, Span::new(day(2024, 1, 11), day(2024, 1, 13)), 1))
        .await
        .unwrap();
    let b = engine
        .create_reservation(reservation_req(p2, guest, Span::new(day(2024, 1, 15), day(2024, 1, 19)), 2))
        .await
        .unwrap();
    engine
        .create_reservation(reservation_req(p2, Ulid::new(), Span::new(day(2024, 1, 11), day(2024, 1, 13)), 1))
        .await
        .unwrap();

    assert_eq!(engine.get_reservations_by_user(&guest).await, vec![a.clone(), b.clone()]);
    assert!(engine.get_expired_reservations_by_user(&guest).await.is_empty());

    clock.set(day(2024, 1, 14));
    assert_eq!(engine.get_expired_reservations_by_user(&guest).await, vec![a]);
    assert!(engine.get_reservations_by_user(&Ulid::new()).await.is_empty());
}

// ── Cascades ─────────────────────────────────────────────

#[tokio::test]
async fn delete_period_requires_owner_and_no_future_stays() {
    let (engine, clock) = engine_at("cascade_period.wal");
    let (acc, host, guest) = (Ulid::new(), Ulid::new(), Ulid::new());
    let p = january_period(&engine, acc, host).await;
    let r = engine
        .create_reservation(reservation_req(p, guest, Span::new(day(2024, 1, 12), day(2024, 1, 15)), 2))
        .await
        .unwrap();

    assert!(matches!(engine.delete_period(p, guest).await, Err(EngineError::Unauthorized { .. })));
    assert!(matches!(engine.delete_period(p, host).await, Err(EngineError::BusinessRule { .. })));

    // Once the stay has ended the period can go, taking the stay with it.
    clock.set(day(2024, 1, 16));
    let outcome = engine.delete_period(p, host).await.unwrap();
    assert_eq!(outcome, CascadeOutcome { periods_removed: 1, reservations_removed: 1 });
    assert!(engine.find_period(&p).await.is_none());
    assert!(!engine.tables.contains_reservation(&r.id));
    assert!(engine.get_reservations_by_user(&guest).await.is_empty());
    assert!(matches!(engine.delete_period(p, host).await, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn accommodation_cascade_stops_at_first_blocked() {
    let (engine, _) = engine_at("cascade_accommodations.wal");
    let host = Ulid::new();
    let (free, blocked, untouched) = (Ulid::new(), Ulid::new(), Ulid::new());
    january_period(&engine, free, host).await;
    let pb = january_period(&engine, blocked, host).await;
    january_period(&engine, untouched, host).await;
    engine
        .create_reservation(reservation_req(pb, Ulid::new(), Span::new(day(2024, 1, 12), day(2024, 1, 14)), 1))
        .await
        .unwrap();

    let err = engine
        .delete_periods_for_accommodations(&[free, blocked, untouched])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BusinessRule { id, .. } if id == blocked));
    assert!(engine.get_periods_by_accommodation(&free).await.is_empty());
    assert_eq!(engine.get_periods_by_accommodation(&blocked).await.len(), 1);
    assert_eq!(engine.get_periods_by_accommodation(&untouched).await.len(), 1);
}

#[tokio::test]
async fn accommodation_cascade_purges_expired_stays() {
    let (engine, clock) = engine_at("cascade_expired.wal");
    let (acc, host, guest) = (Ulid::new(), Ulid::new(), Ulid::new());
    let p = january_period(&engine, acc, host).await;
    engine
        .create_period(period_req(acc, host, Span::new(day(2024, 2, 1), day(2024, 2, 9)), PriceConfig::flat(1)))
        .await
        .unwrap();
    engine
        .create_reservation(reservation_req(p, guest, Span::new(day(2024, 1, 12), day(2024, 1, 14)), 1))
        .await
        .unwrap();

    clock.set(day(2024, 1, 14));
    let outcome = engine
        .delete_periods_for_accommodations(&[acc, acc, Ulid::new()])
        .await
        .unwrap();
    assert_eq!(outcome, CascadeOutcome { periods_removed: 2, reservations_removed: 1 });
    assert_eq!(engine.tables.period_count(), 0);
    assert_eq!(engine.tables.reservation_count(), 0);
    assert!(engine.get_reservations_by_user(&guest).await.is_empty());
}

#[tokio::test]
async fn user_cascade() {
    let (engine, clock) = engine_at("cascade_user.wal");
    let host = Ulid::new();
    let (guest, other) = (Ulid::new(), Ulid::new());
    let p1 = january_period(&engine, Ulid::new(), host).await;
    let p2 = january_period(&engine, Ulid::new(), host).await;
    for p in [p1, p2] {
        engine
            .create_reservation(reservation_req(p, guest, Span::new(day(2024, 1, 11), day(2024, 1, 13)), 1))
            .await
            .unwrap();
    }
    let kept = engine
        .create_reservation(reservation_req(p1, other, Span::new(day(2024, 1, 15), day(2024, 1, 17)), 1))
        .await
        .unwrap();

    assert!(matches!(
        engine.delete_reservations_for_user(guest).await,
        Err(EngineError::BusinessRule { id, .. }) if id == guest
    ));

    clock.set(day(2024, 1, 13));
    let outcome = engine.delete_reservations_for_user(guest).await.unwrap();
    assert_eq!(outcome, CascadeOutcome { periods_removed: 0, reservations_removed: 2 });
    assert!(engine.get_reservations_by_user(&guest).await.is_empty());
    assert_eq!(engine.get_reservations_by_period(&p1).await, vec![kept]);

    // Nothing left to remove is still a success.
    let again = engine.delete_reservations_for_user(guest).await.unwrap();
    assert_eq!(again, CascadeOutcome::default());
}

// ── Search ───────────────────────────────────────────────

#[tokio::test]
async fn search_validates_and_dedups() {
    let (engine, _) = engine_at("search_validation.wal");
    let acc = Ulid::new();
    january_period(&engine, acc, Ulid::new()).await;
    let window = Span::new(day(2024, 1, 12), day(2024, 1, 14));

    assert!(matches!(
        engine
            .find_available_accommodations(&[acc], Span::new(window.end, window.start))
            .await,
        Err(EngineError::Validation(_))
    ));
    let too_many: Vec<Ulid> = (0..=MAX_IN_CLAUSE_IDS).map(|_| Ulid::new()).collect();
    assert!(matches!(
        engine.find_available_accommodations(&too_many, window).await,
        Err(EngineError::LimitExceeded(_))
    ));

    let unknown = Ulid::new();
    let found = engine
        .find_available_accommodations(&[acc, unknown, acc], window)
        .await
        .unwrap();
    assert_eq!(found, vec![acc]);
}

#[tokio::test]
async fn search_never_returns_conflicting_accommodation() {
    let (engine, _) = engine_at("search_property.wal");
    let host = Ulid::new();
    let mut accs = Vec::new();
    for i in 0..6u32 {
        let acc = Ulid::new();
        let p = january_period(&engine, acc, host).await;
        let start = day(2024, 1, 10 + i);
        engine
            .create_reservation(reservation_req(p, Ulid::new(), Span::new(start, start + D), 1))
            .await
            .unwrap();
        accs.push(acc);
    }

    let window = Span::new(day(2024, 1, 13), day(2024, 1, 14));
    let found = engine.find_available_accommodations(&accs, window).await.unwrap();
    for acc in &found {
        for period in engine.get_periods_by_accommodation(acc).await {
            for r in engine.get_reservations_by_period(&period.id).await {
                assert!(!reservations_conflict(&r.span, &window));
            }
        }
    }
    // Stays starting on the 10th and 11th end before the window; the 15th starts after.
    assert_eq!(found, vec![accs[0], accs[1], accs[5]]);
}

// ── Invariants ───────────────────────────────────────────

#[tokio::test]
async fn stored_periods_never_conflict() {
    let (engine, _) = engine_at("invariant_periods.wal");
    let (acc, host) = (Ulid::new(), Ulid::new());
    let base = day(2024, 2, 1);
    for i in 0..40 {
        let start = base + ((i * 7) % 30) * D;
        let len = 1 + (i * 3) % 5;
        let _ = engine
            .create_period(period_req(acc, host, Span::new(start, start + len * D), PriceConfig::flat(1)))
            .await;
    }
    let periods = engine.get_periods_by_accommodation(&acc).await;
    assert!(periods.len() > 1);
    for (i, a) in periods.iter().enumerate() {
        for b in &periods[i + 1..] {
            assert!(!periods_conflict(&a.span, &b.span), "{:?} vs {:?}", a.span, b.span);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_periods_commit_once() {
    let (engine, _) = engine_at("concurrent_periods.wal");
    let engine = Arc::new(engine);
    let (acc, host) = (Ulid::new(), Ulid::new());

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let start = day(2024, 3, 1) + i * 3_600_000;
            engine
                .create_period(period_req(acc, host, Span::new(start, start + 5 * D), PriceConfig::flat(1)))
                .await
        }));
    }
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::Conflict(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(engine.get_periods_by_accommodation(&acc).await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_reservations_commit_once() {
    let (engine, _) = engine_at("concurrent_reservations.wal");
    let engine = Arc::new(engine);
    let p = january_period(&engine, Ulid::new(), Ulid::new()).await;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .create_reservation(reservation_req(p, Ulid::new(), Span::new(day(2024, 1, 12), day(2024, 1, 14)), 1))
                .await
        }));
    }
    let mut ok = 0;
    for h in handles {
        if h.await.unwrap().is_ok() {
            ok += 1;
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(engine.get_reservations_by_period(&p).await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_period_id_on_two_accommodations_commits_once() {
    let (engine, _) = engine_at("race_period_id.wal");
    let (a, b, host, id) = (Ulid::new(), Ulid::new(), Ulid::new(), Ulid::new());
    let req = |acc| PeriodRequest {
        id: Some(id),
        ..period_req(acc, host, Span::new(day(2024, 2, 1), day(2024, 2, 5)), PriceConfig::flat(10))
    };

    let (ra, rb) = tokio::join!(engine.create_period(req(a)), engine.create_period(req(b)));
    let results = [ra, rb];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(EngineError::AlreadyExists(x)) if *x == id)));

    let on_a = engine.get_periods_by_accommodation(&a).await.len();
    let on_b = engine.get_periods_by_accommodation(&b).await.len();
    assert_eq!(on_a + on_b, 1);
    let home = if on_a == 1 { a } else { b };
    assert_eq!(engine.tables.accommodation_for_period(&id), Some(home));
    assert_eq!(engine.tables.period_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_reservation_id_on_two_periods_commits_once() {
    let (engine, _) = engine_at("race_reservation_id.wal");
    let guest = Ulid::new();
    let p1 = january_period(&engine, Ulid::new(), Ulid::new()).await;
    let p2 = january_period(&engine, Ulid::new(), Ulid::new()).await;
    let id = Ulid::new();
    let req = |period| ReservationRequest {
        id: Some(id),
        ..reservation_req(period, guest, Span::new(day(2024, 1, 12), day(2024, 1, 14)), 1)
    };

    let (r1, r2) = tokio::join!(engine.create_reservation(req(p1)), engine.create_reservation(req(p2)));
    let results = [r1, r2];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(EngineError::AlreadyExists(x)) if *x == id)));

    let booked = engine.get_reservations_by_period(&p1).await.len() + engine.get_reservations_by_period(&p2).await.len();
    assert_eq!(booked, 1);
    assert_eq!(engine.tables.user_reservations(&guest).len(), 1);
    assert_eq!(engine.tables.reservation_count(), 1);
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn wal_replay_restores_state_and_user_index() {
    let path = test_wal_path("replay.wal");
    let clock = Arc::new(ManualClock::new(day(2024, 1, 1)));
    let (acc, host, guest) = (Ulid::new(), Ulid::new(), Ulid::new());
    let (p, kept, dropped);
    {
        let engine = Engine::with_clock(path.clone(), Arc::new(NotifyHub::new()), clock.clone()).unwrap();
        p = january_period(&engine, acc, host).await;
        kept = engine
            .create_reservation(reservation_req(p, guest, Span::new(day(2024, 1, 11), day(2024, 1, 13)), 2))
            .await
            .unwrap();
        dropped = engine
            .create_reservation(reservation_req(p, guest, Span::new(day(2024, 1, 15), day(2024, 1, 17)), 1))
            .await
            .unwrap();
        engine.delete_reservation(dropped.id, p, guest).await.unwrap();
        engine
            .update_period(p, host, PeriodPatch { rate_flat: Some(100), ..Default::default() })
            .await
            .unwrap_err();
    }

    let engine = Engine::with_clock(path, Arc::new(NotifyHub::new()), clock).unwrap();
    assert_eq!(engine.get_period(&p, &acc).await.unwrap().span.end, day(2024, 1, 20));
    assert_eq!(engine.get_reservations_by_period(&p).await, vec![kept.clone()]);
    assert_eq!(engine.get_reservations_by_user(&guest).await, vec![kept]);
    assert!(!engine.tables.contains_reservation(&dropped.id));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compact.wal");
    let clock = Arc::new(ManualClock::new(day(2024, 1, 1)));
    let (acc, host, guest) = (Ulid::new(), Ulid::new(), Ulid::new());
    let (p, r, after);
    {
        let engine = Engine::with_clock(path.clone(), Arc::new(NotifyHub::new()), clock.clone()).unwrap();
        p = january_period(&engine, acc, host).await;
        // Churn that compaction should fold away.
        for _ in 0..10 {
            let x = engine
                .create_reservation(reservation_req(p, guest, Span::new(day(2024, 1, 15), day(2024, 1, 17)), 1))
                .await
                .unwrap();
            engine.delete_reservation(x.id, p, guest).await.unwrap();
        }
        r = engine
            .create_reservation(reservation_req(p, guest, Span::new(day(2024, 1, 11), day(2024, 1, 13)), 1))
            .await
            .unwrap();

        let before = std::fs::metadata(&path).unwrap().len();
        assert!(engine.wal_appends_since_compact().await > 0);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        let size = std::fs::metadata(&path).unwrap().len();
        assert!(size < before, "compacted WAL ({size}) should be smaller than {before}");

        after = engine
            .create_period(period_req(acc, host, Span::new(day(2024, 2, 1), day(2024, 2, 3)), PriceConfig::flat(5)))
            .await
            .unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 1);
    }

    let engine = Engine::with_clock(path, Arc::new(NotifyHub::new()), clock).unwrap();
    let ids: Vec<Ulid> = engine.get_periods_by_accommodation(&acc).await.iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![p, after]);
    assert_eq!(engine.get_reservations_by_user(&guest).await, vec![r]);
}

#[tokio::test]
async fn failed_wal_append_leaves_state_untouched() {
    let (mut engine, _) = engine_at("wal_down.wal");
    let (acc, host, guest) = (Ulid::new(), Ulid::new(), Ulid::new());
    let p = january_period(&engine, acc, host).await;
    let mut events = engine.notify.subscribe(acc);

    // Every append now fails: the writer's receiving end is gone.
    let (dead_tx, dead_rx) = mpsc::channel(1);
    drop(dead_rx);
    engine.wal_tx = dead_tx;

    let new_id = Ulid::new();
    let mut req = period_req(acc, host, Span::new(day(2024, 2, 1), day(2024, 2, 5)), PriceConfig::flat(10));
    req.id = Some(new_id);
    assert!(matches!(engine.create_period(req).await, Err(EngineError::Persistence(_))));
    assert!(!engine.tables.contains_period(&new_id));
    assert_eq!(engine.tables.period_count(), 1);
    assert_eq!(engine.get_periods_by_accommodation(&acc).await.len(), 1);

    let rid = Ulid::new();
    let mut booking = reservation_req(p, guest, Span::new(day(2024, 1, 12), day(2024, 1, 14)), 1);
    booking.id = Some(rid);
    assert!(matches!(engine.create_reservation(booking).await, Err(EngineError::Persistence(_))));
    assert!(!engine.tables.contains_reservation(&rid));
    assert_eq!(engine.tables.reservation_count(), 0);
    assert!(engine.tables.user_reservations(&guest).is_empty());
    assert!(engine.get_reservations_by_period(&p).await.is_empty());

    assert!(matches!(engine.delete_period(p, host).await, Err(EngineError::Persistence(_))));
    assert!(engine.find_period(&p).await.is_some());
    assert!(matches!(
        engine.compact_wal().await,
        Err(EngineError::Persistence(_))
    ));
    assert!(events.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn compaction_keeps_writes_to_new_accommodations() {
    let path = test_wal_path("compact_new_acc.wal");
    let clock = Arc::new(ManualClock::new(day(2024, 1, 1)));
    let engine = Arc::new(Engine::with_clock(path.clone(), Arc::new(NotifyHub::new()), clock).unwrap());
    let (a, c, host) = (Ulid::new(), Ulid::new(), Ulid::new());
    let on_a = january_period(&engine, a, host).await;

    // Hold A so compaction stalls partway through its snapshot.
    let held = engine.tables.partition(&a).unwrap().write_owned().await;
    let compaction = tokio::spawn({
        let engine = engine.clone();
        async move { engine.compact_wal().await }
    });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let create = tokio::spawn({
        let engine = engine.clone();
        async move { january_period(&engine, c, host).await }
    });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    drop(held);

    compaction.await.unwrap().unwrap();
    let on_c = create.await.unwrap();
    assert!(engine.find_period(&on_c).await.is_some());

    let logged: Vec<Ulid> = Wal::replay(&path)
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            Event::PeriodCreated { id, .. } => Some(*id),
            _ => None,
        })
        .collect();
    assert_eq!(logged.len(), 2);
    assert!(logged.contains(&on_a));
    assert!(logged.contains(&on_c));
}

// ── Notifications ────────────────────────────────────────

#[tokio::test]
async fn committed_events_are_published() {
    let (engine, _) = engine_at("notify.wal");
    let (acc, host, guest) = (Ulid::new(), Ulid::new(), Ulid::new());
    let mut per_acc = engine.notify.subscribe(acc);
    let mut all = engine.notify.subscribe_all();

    let p = january_period(&engine, acc, host).await;
    let r = engine
        .create_reservation(reservation_req(p, guest, Span::new(day(2024, 1, 11), day(2024, 1, 13)), 1))
        .await
        .unwrap();
    // Rejected writes publish nothing.
    let _ = engine
        .create_reservation(reservation_req(p, guest, Span::new(day(2024, 1, 12), day(2024, 1, 14)), 1))
        .await
        .unwrap_err();

    assert!(matches!(per_acc.recv().await.unwrap(), Event::PeriodCreated { id, .. } if id == p));
    assert_eq!(per_acc.recv().await.unwrap(), Event::created_reservation(&r));
    assert!(per_acc.try_recv().is_err());

    assert!(matches!(all.recv().await.unwrap(), Event::PeriodCreated { .. }));
    assert!(all.recv().await.unwrap().is_reservation_event());
}
