use super::*;
use super::conflict::validate_span;
use crate::lifecycle::{BookingStatus, LifecycleError, Transition};
use crate::limits::*;

const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms
/// 2025-01-01T00:00:00Z
const T0: Ms = 1_735_689_600_000;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("bookmyroom_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn new_engine(name: &str) -> Arc<Engine> {
    Arc::new(Engine::new(test_wal_path(name)).unwrap())
}

fn room_input(name: &str) -> RoomInput {
    RoomInput {
        name: name.into(),
        description: Some("second floor".into()),
        capacity: 6,
        photo_url: None,
        is_active: true,
    }
}

async fn make_room(engine: &Arc<Engine>) -> Ulid {
    let id = Ulid::new();
    engine.create_room(id, room_input("Blue")).await.unwrap();
    id
}

fn span(start_h: i64, end_h: i64) -> Span {
    Span::new(T0 + start_h * H, T0 + end_h * H)
}

// ── Admission ────────────────────────────────────────────

#[tokio::test]
async fn reserve_on_empty_room_is_confirmed() {
    let engine = new_engine("reserve_empty.wal");
    let room = make_room(&engine).await;
    let owner = Ulid::new();

    let booking = engine
        .reserve(Ulid::new(), room, span(10, 11), owner, true)
        .await
        .unwrap();
    assert_eq!(booking.status, BookingStatus::Confirmed);
    assert_eq!(booking.owner_id, owner);
    assert_eq!(engine.get_booking(booking.id).await.unwrap(), booking);
}

#[tokio::test]
async fn back_to_back_bookings_both_admitted() {
    let engine = new_engine("back_to_back.wal");
    let room = make_room(&engine).await;

    engine.reserve(Ulid::new(), room, span(10, 11), Ulid::new(), true).await.unwrap();
    engine.reserve(Ulid::new(), room, span(11, 12), Ulid::new(), true).await.unwrap();
    engine.reserve(Ulid::new(), room, span(9, 10), Ulid::new(), true).await.unwrap();

    assert_eq!(engine.list_by_room(room, true).await.len(), 3);
}

#[tokio::test]
async fn overlapping_booking_conflicts_with_existing_id() {
    let engine = new_engine("overlap_conflict.wal");
    let room = make_room(&engine).await;
    let first = Ulid::new();
    engine.reserve(first, room, span(10, 12), Ulid::new(), true).await.unwrap();

    let result = engine
        .reserve(Ulid::new(), room, Span::new(T0 + 11 * H + 30 * M, T0 + 13 * H), Ulid::new(), true)
        .await;
    assert!(matches!(result, Err(EngineError::Conflict(id)) if id == first));

    // Contained and containing windows conflict too.
    let inner = engine.reserve(Ulid::new(), room, Span::new(T0 + 10 * H + M, T0 + 10 * H + 2 * M), Ulid::new(), true).await;
    assert!(matches!(inner, Err(EngineError::Conflict(_))));
    let outer = engine.reserve(Ulid::new(), room, span(8, 14), Ulid::new(), true).await;
    assert!(matches!(outer, Err(EngineError::Conflict(_))));

    assert_eq!(engine.list_by_room(room, false).await.len(), 1);
}

#[tokio::test]
async fn same_window_on_different_rooms_is_fine() {
    let engine = new_engine("different_rooms.wal");
    let a = make_room(&engine).await;
    let b = make_room(&engine).await;
    engine.reserve(Ulid::new(), a, span(10, 11), Ulid::new(), true).await.unwrap();
    engine.reserve(Ulid::new(), b, span(10, 11), Ulid::new(), true).await.unwrap();
}

#[tokio::test]
async fn cancelled_booking_frees_its_window() {
    let engine = new_engine("cancel_frees.wal");
    let room = make_room(&engine).await;
    let first = engine.reserve(Ulid::new(), room, span(10, 11), Ulid::new(), true).await.unwrap();

    engine.update_status(first.id, BookingStatus::Cancelled).await.unwrap();
    engine.reserve(Ulid::new(), room, span(10, 11), Ulid::new(), true).await.unwrap();

    assert_eq!(engine.list_by_room(room, true).await.len(), 1);
    assert_eq!(engine.list_by_room(room, false).await.len(), 2);
}

#[tokio::test]
async fn reserve_unknown_room_not_found() {
    let engine = new_engine("unknown_room.wal");
    let missing = Ulid::new();
    let result = engine.reserve(Ulid::new(), missing, span(1, 2), Ulid::new(), true).await;
    assert!(matches!(result, Err(EngineError::NotFound(id)) if id == missing));
}

#[tokio::test]
async fn inactive_room_admission_follows_policy() {
    let engine = new_engine("inactive_room.wal");
    let room = make_room(&engine).await;
    let mut input = room_input("Blue");
    input.is_active = false;
    engine.update_room(room, input).await.unwrap();

    let strict = engine.reserve(Ulid::new(), room, span(1, 2), Ulid::new(), true).await;
    assert!(matches!(strict, Err(EngineError::NotFound(_))));

    engine.reserve(Ulid::new(), room, span(1, 2), Ulid::new(), false).await.unwrap();
}

#[tokio::test]
async fn duplicate_booking_id_rejected() {
    let engine = new_engine("dup_booking.wal");
    let a = make_room(&engine).await;
    let b = make_room(&engine).await;
    let id = Ulid::new();
    engine.reserve(id, a, span(1, 2), Ulid::new(), true).await.unwrap();

    let again = engine.reserve(id, b, span(5, 6), Ulid::new(), true).await;
    assert!(matches!(again, Err(EngineError::AlreadyExists(x)) if x == id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_id_on_two_rooms_concurrently_admits_one() {
    let engine = new_engine("dup_booking_race.wal");

    for _ in 0..50 {
        let r1 = make_room(&engine).await;
        let r2 = make_room(&engine).await;
        let id = Ulid::new();

        let (e1, e2) = (engine.clone(), engine.clone());
        let a = tokio::spawn(async move { e1.reserve(id, r1, span(1, 2), Ulid::new(), true).await });
        let b = tokio::spawn(async move { e2.reserve(id, r2, span(1, 2), Ulid::new(), true).await });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        let (winner, loser, lost) = match (a, b) {
            (Ok(w), Err(e)) => (w, r2, e),
            (Err(e), Ok(w)) => (w, r1, e),
            other => panic!("expected exactly one admission, got {other:?}"),
        };
        assert!(matches!(lost, EngineError::AlreadyExists(x) if x == id));
        assert_eq!(engine.get_booking(id).await.unwrap().room_id, winner.room_id);
        assert!(engine.list_by_room(loser, false).await.is_empty());
    }
}

#[tokio::test]
async fn refused_booking_releases_its_id() {
    let engine = new_engine("refused_releases_id.wal");
    let room = make_room(&engine).await;
    engine.reserve(Ulid::new(), room, span(1, 3), Ulid::new(), true).await.unwrap();

    let id = Ulid::new();
    let refused = engine.reserve(id, room, span(2, 4), Ulid::new(), true).await;
    assert!(matches!(refused, Err(EngineError::Conflict(_))));
    assert!(matches!(engine.get_booking(id).await, Err(EngineError::NotFound(_))));

    let admitted = engine.reserve(id, room, span(3, 4), Ulid::new(), true).await.unwrap();
    assert_eq!(admitted.id, id);
}

#[tokio::test]
async fn span_limits_enforced() {
    let engine = new_engine("span_limits.wal");
    let room = make_room(&engine).await;

    let ancient = engine.reserve(Ulid::new(), room, Span::new(1000, 2000), Ulid::new(), true).await;
    assert!(matches!(ancient, Err(EngineError::LimitExceeded(_))));

    let too_wide = Span::new(T0, T0 + MAX_SPAN_DURATION_MS + 1);
    assert!(validate_span(&too_wide).is_err());
    assert!(validate_span(&Span::new(T0, T0 + MAX_SPAN_DURATION_MS)).is_ok());
}

#[tokio::test]
async fn concurrent_identical_requests_admit_exactly_one() {
    let engine = new_engine("race_identical.wal");
    let room = make_room(&engine).await;

    let mut handles = Vec::new();
    for _ in 0..2 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.reserve(Ulid::new(), room, span(10, 11), Ulid::new(), true).await
        }));
    }

    let mut ok = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!((ok, conflicts), (1, 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_requests_never_double_book() {
    let engine = new_engine("race_many.wal");
    let room = make_room(&engine).await;

    // 50 requests over a 10-hour day with staggered 90-minute windows.
    let mut handles = Vec::new();
    for i in 0..50 {
        let eng = engine.clone();
        let start = T0 + (i % 20) * 30 * M;
        handles.push(tokio::spawn(async move {
            eng.reserve(Ulid::new(), room, Span::new(start, start + 90 * M), Ulid::new(), true)
                .await
        }));
    }
    for h in handles {
        let _ = h.await.unwrap();
    }

    let admitted = engine.list_by_room(room, true).await;
    assert!(!admitted.is_empty());
    for (i, a) in admitted.iter().enumerate() {
        for b in &admitted[i + 1..] {
            assert!(!a.span.overlaps(&b.span), "{:?} overlaps {:?}", a.span, b.span);
        }
    }
}

#[tokio::test]
async fn dropped_caller_leaves_consistent_state() {
    let engine = new_engine("dropped_caller.wal");
    let room = make_room(&engine).await;
    let id = Ulid::new();

    let eng = engine.clone();
    let fut = eng.reserve(id, room, span(3, 4), Ulid::new(), true);
    // Poll once then drop. Either nothing happened or the booking exists everywhere.
    let _ = tokio::time::timeout(std::time::Duration::from_micros(1), fut).await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let in_room = engine.list_by_room(room, false).await.iter().any(|b| b.id == id);
    assert_eq!(in_room, engine.bookings.contains(&id));
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn cancel_twice_is_unchanged() {
    let engine = new_engine("cancel_twice.wal");
    let room = make_room(&engine).await;
    let b = engine.reserve(Ulid::new(), room, span(1, 2), Ulid::new(), true).await.unwrap();

    let (after, t) = engine.update_status(b.id, BookingStatus::Cancelled).await.unwrap();
    assert_eq!(t, Transition::Applied(BookingStatus::Cancelled));
    assert_eq!(after.status, BookingStatus::Cancelled);

    let appends = engine.wal_appends_since_compact().await;
    let (_, t) = engine.update_status(b.id, BookingStatus::Cancelled).await.unwrap();
    assert_eq!(t, Transition::Unchanged);
    assert_eq!(engine.wal_appends_since_compact().await, appends);
}

#[tokio::test]
async fn cancelled_cannot_be_revived() {
    let engine = new_engine("no_revive.wal");
    let room = make_room(&engine).await;
    let b = engine.reserve(Ulid::new(), room, span(1, 2), Ulid::new(), true).await.unwrap();
    engine.update_status(b.id, BookingStatus::Cancelled).await.unwrap();

    let result = engine.update_status(b.id, BookingStatus::Confirmed).await;
    assert!(matches!(
        result,
        Err(EngineError::Lifecycle(LifecycleError::InvalidTransition { .. }))
    ));
    assert_eq!(engine.get_booking(b.id).await.unwrap().status, BookingStatus::Cancelled);
}

#[tokio::test]
async fn confirmed_to_pending_rejected() {
    let engine = new_engine("no_backwards.wal");
    let room = make_room(&engine).await;
    let b = engine.reserve(Ulid::new(), room, span(1, 2), Ulid::new(), true).await.unwrap();
    assert!(engine.update_status(b.id, BookingStatus::Pending).await.is_err());
}

#[tokio::test]
async fn update_status_unknown_booking() {
    let engine = new_engine("status_unknown.wal");
    let result = engine.update_status(Ulid::new(), BookingStatus::Cancelled).await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}

// ── Listings ─────────────────────────────────────────────

#[tokio::test]
async fn room_listing_is_start_ascending() {
    let engine = new_engine("room_listing.wal");
    let room = make_room(&engine).await;
    for h in [5, 1, 3] {
        engine.reserve(Ulid::new(), room, span(h, h + 1), Ulid::new(), true).await.unwrap();
    }
    let starts: Vec<_> = engine.list_by_room(room, true).await.iter().map(|b| b.span.start).collect();
    assert_eq!(starts, vec![T0 + H, T0 + 3 * H, T0 + 5 * H]);
    assert!(engine.list_by_room(Ulid::new(), true).await.is_empty());
}

#[tokio::test]
async fn owner_listing_is_start_descending_across_rooms() {
    let engine = new_engine("owner_listing.wal");
    let a = make_room(&engine).await;
    let b = make_room(&engine).await;
    let owner = Ulid::new();

    engine.reserve(Ulid::new(), a, span(1, 2), owner, true).await.unwrap();
    engine.reserve(Ulid::new(), b, span(7, 8), owner, true).await.unwrap();
    let c = engine.reserve(Ulid::new(), a, span(4, 5), owner, true).await.unwrap();
    engine.reserve(Ulid::new(), a, span(9, 10), Ulid::new(), true).await.unwrap();
    engine.update_status(c.id, BookingStatus::Cancelled).await.unwrap();

    let mine = engine.list_by_owner(owner).await;
    let starts: Vec<_> = mine.iter().map(|b| b.span.start).collect();
    assert_eq!(starts, vec![T0 + 7 * H, T0 + 4 * H, T0 + H]);
    assert_eq!(mine[1].status, BookingStatus::Cancelled);
}

// ── Room catalog ─────────────────────────────────────────

#[tokio::test]
async fn create_room_duplicate_rejected() {
    let engine = new_engine("dup_room.wal");
    let room = make_room(&engine).await;
    let again = engine.create_room(room, room_input("Again")).await;
    assert!(matches!(again, Err(EngineError::AlreadyExists(_))));
}

#[tokio::test]
async fn update_room_replaces_all_fields() {
    let engine = new_engine("update_room.wal");
    let room = make_room(&engine).await;
    let input = RoomInput {
        name: "Green".into(),
        description: None,
        capacity: 12,
        photo_url: Some("https://img.example/green.jpg".into()),
        is_active: false,
    };
    let returned = engine.update_room(room, input.clone()).await.unwrap();
    let stored = engine.get_room(room).await.unwrap();
    assert_eq!(returned, stored);
    assert_eq!(stored.name, "Green");
    assert_eq!(stored.description, None);
    assert_eq!(stored.capacity, 12);
    assert!(!stored.is_active);
}

#[tokio::test]
async fn delete_room_cascades_bookings() {
    let engine = new_engine("delete_cascade.wal");
    let room = make_room(&engine).await;
    let owner = Ulid::new();
    let b = engine.reserve(Ulid::new(), room, span(1, 2), owner, true).await.unwrap();

    engine.delete_room(room).await.unwrap();

    assert!(matches!(engine.get_room(room).await, Err(EngineError::NotFound(_))));
    assert!(matches!(engine.get_booking(b.id).await, Err(EngineError::NotFound(_))));
    assert!(engine.list_by_owner(owner).await.is_empty());
    assert!(engine.list_rooms().await.is_empty());
    assert!(matches!(engine.delete_room(room).await, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn reserve_racing_delete_sees_retired_room() {
    let engine = new_engine("reserve_vs_delete.wal");
    let room = make_room(&engine).await;

    let eng = engine.clone();
    let del = tokio::spawn(async move { eng.delete_room(room).await });
    let eng = engine.clone();
    let res = tokio::spawn(async move {
        eng.reserve(Ulid::new(), room, span(1, 2), Ulid::new(), true).await
    });
    del.await.unwrap().unwrap();

    // Whatever the interleaving, an admitted booking went away with its room.
    if let Ok(b) = res.await.unwrap() {
        assert!(!engine.bookings.contains(&b.id));
        assert!(matches!(engine.get_booking(b.id).await, Err(EngineError::NotFound(_))));
    }
    assert!(engine.list_by_room(room, false).await.is_empty());
}

#[tokio::test]
async fn list_rooms_in_creation_order() {
    let engine = new_engine("list_rooms.wal");
    let a = make_room(&engine).await;
    let b = make_room(&engine).await;
    let ids: Vec<_> = engine.list_rooms().await.iter().map(|r| r.id).collect();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn room_name_limit() {
    let engine = new_engine("room_name_limit.wal");
    let result = engine
        .create_room(Ulid::new(), room_input(&"x".repeat(MAX_NAME_LEN + 1)))
        .await;
    assert!(matches!(result, Err(EngineError::LimitExceeded(_))));
}

// ── Identity registry ────────────────────────────────────

#[tokio::test]
async fn register_and_lookup_user() {
    let engine = new_engine("register_user.wal");
    let id = Ulid::new();
    let info = engine
        .register_user(id, "ada@example.com".into(), "$argon2id$h".into(), Role::Standard)
        .await
        .unwrap();
    assert_eq!(info.role, Role::Standard);
    assert_eq!(engine.user_by_email("ada@example.com").unwrap().id, id);
    assert_eq!(engine.user(&id).unwrap().email, "ada@example.com");
}

#[tokio::test]
async fn duplicate_email_rejected() {
    let engine = new_engine("dup_email.wal");
    engine
        .register_user(Ulid::new(), "ada@example.com".into(), "h".into(), Role::Standard)
        .await
        .unwrap();
    let again = engine
        .register_user(Ulid::new(), "ada@example.com".into(), "h".into(), Role::Standard)
        .await;
    assert!(matches!(again, Err(EngineError::EmailTaken(_))));
    assert_eq!(engine.user_count(), 1);
}

#[tokio::test]
async fn set_role_unknown_user() {
    let engine = new_engine("role_unknown.wal");
    let result = engine.set_user_role(Ulid::new(), Role::Admin).await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn wal_replay_restores_everything() {
    let path = test_wal_path("replay_all.wal");
    let user = Ulid::new();
    let room = Ulid::new();
    let gone = Ulid::new();
    let kept;
    let cancelled;
    {
        let engine = Arc::new(Engine::new(path.clone()).unwrap());
        engine
            .register_user(user, "bo@example.com".into(), "h".into(), Role::Standard)
            .await
            .unwrap();
        engine.set_user_role(user, Role::Admin).await.unwrap();
        engine.create_room(room, room_input("Blue")).await.unwrap();
        engine.create_room(gone, room_input("Red")).await.unwrap();
        engine.reserve(Ulid::new(), gone, span(1, 2), user, true).await.unwrap();
        engine.delete_room(gone).await.unwrap();
        kept = engine.reserve(Ulid::new(), room, span(1, 2), user, true).await.unwrap();
        cancelled = engine.reserve(Ulid::new(), room, span(3, 4), user, true).await.unwrap();
        engine.update_status(cancelled.id, BookingStatus::Cancelled).await.unwrap();
    }

    let engine = Engine::new(path).unwrap();
    assert_eq!(engine.user(&user).unwrap().role, Role::Admin);
    assert_eq!(engine.list_rooms().await.len(), 1);
    assert_eq!(engine.get_booking(kept.id).await.unwrap(), kept);
    assert_eq!(
        engine.get_booking(cancelled.id).await.unwrap().status,
        BookingStatus::Cancelled
    );
    assert_eq!(engine.list_by_owner(user).await.len(), 2);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let room = Ulid::new();
    let user = Ulid::new();
    let before;
    {
        let engine = Arc::new(Engine::new(path.clone()).unwrap());
        engine
            .register_user(user, "cy@example.com".into(), "h".into(), Role::Standard)
            .await
            .unwrap();
        engine.create_room(room, room_input("Blue")).await.unwrap();
        for i in 0..10 {
            let b = engine.reserve(Ulid::new(), room, span(i, i + 1), user, true).await.unwrap();
            if i % 2 == 0 {
                engine.update_status(b.id, BookingStatus::Cancelled).await.unwrap();
            }
        }
        let dropped = Ulid::new();
        engine.create_room(dropped, room_input("Gone")).await.unwrap();
        engine.delete_room(dropped).await.unwrap();

        before = engine.list_by_room(room, false).await;
        assert!(engine.wal_appends_since_compact().await > 0);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }

    let engine = Engine::new(path).unwrap();
    assert_eq!(engine.list_by_room(room, false).await, before);
    assert_eq!(engine.list_by_room(room, true).await.len(), 5);
    assert_eq!(engine.list_rooms().await.len(), 1);
    assert!(engine.user(&user).is_some());
}

#[tokio::test]
async fn group_commit_batches_appends() {
    let path = test_wal_path("group_commit_batch.wal");
    let engine = Arc::new(Engine::new(path.clone()).unwrap());

    let n = 20;
    let mut handles = Vec::new();
    for i in 0..n {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.create_room(Ulid::new(), room_input(&format!("R{i}"))).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(engine.list_rooms().await.len(), n);

    let engine2 = Engine::new(path).unwrap();
    assert_eq!(engine2.list_rooms().await.len(), n);
}
