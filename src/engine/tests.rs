use super::*;
use crate::limits::*;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeZone};

// 2025-10-27 is a Monday.
const MONDAY: (i32, u32, u32) = (2025, 10, 27);
const TUESDAY: (i32, u32, u32) = (2025, 10, 28);

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("roomkeeper_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn on(day: (i32, u32, u32), h: u32, m: u32) -> DateTime<FixedOffset> {
    FixedOffset::east_opt(9 * 3600)
        .unwrap()
        .with_ymd_and_hms(day.0, day.1, day.2, h, m, 0)
        .unwrap()
}

fn at(h: u32, m: u32) -> DateTime<FixedOffset> {
    on(MONDAY, h, m)
}

fn date(day: (i32, u32, u32)) -> NaiveDate {
    NaiveDate::from_ymd_opt(day.0, day.1, day.2).unwrap()
}

const ADMIN: Actor = Actor { id: 1 };
const ALICE: Actor = Actor { id: 100 };
const BOB: Actor = Actor { id: 200 };

fn booking(room_id: Ulid, start: (u32, u32), end: (u32, u32), priority: i32) -> ReservationDraft {
    ReservationDraft {
        room_id,
        group_id: 10,
        link_id: None,
        start: at(start.0, start.1),
        end: at(end.0, end.1),
        purpose: "study group".into(),
        priority,
    }
}

async fn create_room(engine: &Engine, name: &str) -> Ulid {
    let id = Ulid::new();
    engine
        .create_room(
            id,
            RoomDraft {
                name: name.into(),
                capacity: 30,
                department: Some("CS".into()),
            },
            ADMIN,
        )
        .await
        .unwrap();
    id
}

async fn open_on(engine: &Engine, room_id: Ulid, weekday: u8, opening: NaiveTime, closing: NaiveTime) -> Ulid {
    let id = Ulid::new();
    engine
        .create_operating_hour(
            id,
            OperatingHourDraft {
                room_id,
                weekday,
                opening,
                closing,
                max_duration_minutes: None,
            },
            ADMIN,
        )
        .await
        .unwrap();
    id
}

/// A room open Mondays 09:00-18:00.
async fn monday_room(engine: &Engine, name: &str) -> Ulid {
    let id = create_room(engine, name).await;
    open_on(engine, id, 1, t(9, 0), t(18, 0)).await;
    id
}

async fn active_in(engine: &Engine, room_id: Ulid) -> Vec<Reservation> {
    engine
        .list_reservations(&ReservationFilter {
            room_id: Some(room_id),
            ..Default::default()
        })
        .await
}

async fn everything(engine: &Engine) -> Vec<Reservation> {
    engine
        .list_reservations(&ReservationFilter {
            visibility: Visibility::IncludeCancelled,
            ..Default::default()
        })
        .await
}

fn assert_no_active_overlaps(reservations: &[Reservation]) {
    let active: Vec<&Reservation> = reservations.iter().filter(|r| r.is_active()).collect();
    for (i, a) in active.iter().enumerate() {
        for b in &active[i + 1..] {
            assert!(
                a.room_id != b.room_id || !a.span().overlaps(&b.span()),
                "active reservations {} and {} overlap",
                a.code,
                b.code
            );
        }
    }
}

/// Hands out the same code every time.
struct FixedCodes(&'static str);

impl CodeSource for FixedCodes {
    fn next_code(&self) -> String {
        self.0.to_string()
    }
}

// ── Calendar admission ───────────────────────────────────

#[tokio::test]
async fn admits_inside_operating_hours() {
    let engine = Engine::new(test_wal_path("admit_inside.wal")).unwrap();
    let room = monday_room(&engine, "A-101").await;

    let r = engine
        .create_reservation(booking(room, (10, 0), (11, 0), 0), ALICE)
        .await
        .unwrap();
    assert_eq!(r.room_id, room);
    assert_eq!(r.created_by, ALICE.id);
    assert!(r.is_active());
    assert!(!r.code.is_empty());
    assert_eq!(active_in(&engine, room).await, vec![r]);
}

#[tokio::test]
async fn rejects_before_opening() {
    let engine = Engine::new(test_wal_path("reject_early.wal")).unwrap();
    let room = monday_room(&engine, "A-101").await;

    let err = engine
        .create_reservation(booking(room, (8, 0), (9, 0), 0), ALICE)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert!(everything(&engine).await.is_empty());
}

#[tokio::test]
async fn rejects_weekday_without_hours() {
    let engine = Engine::new(test_wal_path("reject_weekday.wal")).unwrap();
    let room = monday_room(&engine, "A-101").await;

    let mut draft = booking(room, (10, 0), (11, 0), 0);
    draft.start = on(TUESDAY, 10, 0);
    draft.end = on(TUESDAY, 11, 0);
    let err = engine.create_reservation(draft, ALICE).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
}

#[tokio::test]
async fn rejects_on_holiday() {
    let engine = Engine::new(test_wal_path("reject_holiday.wal")).unwrap();
    let room = monday_room(&engine, "A-101").await;
    engine
        .create_exception(
            Ulid::new(),
            ExceptionDraft {
                room_id: room,
                date: date(MONDAY),
                reason: Some("founders day".into()),
                opening: None,
                closing: None,
            },
            ADMIN,
        )
        .await
        .unwrap();

    let err = engine
        .create_reservation(booking(room, (10, 0), (11, 0), 0), ALICE)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert!(err.to_string().contains("holiday"));
    assert_eq!(engine.effective_hours(room, date(MONDAY)).await.unwrap(), None);
}

#[tokio::test]
async fn special_hours_replace_weekday_hours() {
    let engine = Engine::new(test_wal_path("special_hours.wal")).unwrap();
    let room = monday_room(&engine, "A-101").await;
    engine
        .create_exception(
            Ulid::new(),
            ExceptionDraft {
                room_id: room,
                date: date(MONDAY),
                reason: Some("open day".into()),
                opening: Some(t(12, 0)),
                closing: Some(t(20, 0)),
            },
            ADMIN,
        )
        .await
        .unwrap();

    let err = engine
        .create_reservation(booking(room, (10, 0), (11, 0), 0), ALICE)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    engine
        .create_reservation(booking(room, (18, 30), (19, 30), 0), ALICE)
        .await
        .unwrap();

    let hours = engine.effective_hours(room, date(MONDAY)).await.unwrap().unwrap();
    assert!(hours.special);
    assert_eq!((hours.opening, hours.closing), (t(12, 0), t(20, 0)));
}

#[tokio::test]
async fn daily_maximum_is_unavailable() {
    let engine = Engine::new(test_wal_path("max_duration.wal")).unwrap();
    let room = create_room(&engine, "A-101").await;
    engine
        .create_operating_hour(
            Ulid::new(),
            OperatingHourDraft {
                room_id: room,
                weekday: 1,
                opening: t(9, 0),
                closing: t(18, 0),
                max_duration_minutes: Some(90),
            },
            ADMIN,
        )
        .await
        .unwrap();

    engine
        .create_reservation(booking(room, (9, 0), (10, 30), 0), ALICE)
        .await
        .unwrap();
    let err = engine
        .create_reservation(booking(room, (11, 0), (13, 0), 0), ALICE)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
}

#[tokio::test]
async fn deleted_hours_close_the_weekday() {
    let engine = Engine::new(test_wal_path("deleted_hours.wal")).unwrap();
    let room = create_room(&engine, "A-101").await;
    let hour = open_on(&engine, room, 1, t(9, 0), t(18, 0)).await;
    engine.delete_operating_hour(hour, ADMIN).await.unwrap();

    let err = engine
        .create_reservation(booking(room, (10, 0), (11, 0), 0), ALICE)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);

    // The weekday slot is free again.
    open_on(&engine, room, 1, t(8, 0), t(12, 0)).await;
    engine
        .create_reservation(booking(room, (8, 0), (9, 0), 0), ALICE)
        .await
        .unwrap();
}

// ── Validation ───────────────────────────────────────────

#[tokio::test]
async fn rejects_malformed_windows() {
    let engine = Engine::new(test_wal_path("malformed.wal")).unwrap();
    let room = monday_room(&engine, "A-101").await;

    let backwards = booking(room, (11, 0), (10, 0), 0);
    let empty = booking(room, (10, 0), (10, 0), 0);
    let mut overnight = booking(room, (17, 0), (18, 0), 0);
    overnight.end = on(TUESDAY, 9, 0);

    for draft in [backwards, empty, overnight] {
        let err = engine.create_reservation(draft, ALICE).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation, "{err}");
    }
    assert!(everything(&engine).await.is_empty());
}

#[tokio::test]
async fn rejects_bad_purpose() {
    let engine = Engine::new(test_wal_path("purpose.wal")).unwrap();
    let room = monday_room(&engine, "A-101").await;

    let mut blank = booking(room, (10, 0), (11, 0), 0);
    blank.purpose = "   ".into();
    let mut long = booking(room, (10, 0), (11, 0), 0);
    long.purpose = "x".repeat(MAX_PURPOSE_LEN + 1);

    for draft in [blank, long] {
        let err = engine.create_reservation(draft, ALICE).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}

#[tokio::test]
async fn unknown_room_is_not_found() {
    let engine = Engine::new(test_wal_path("unknown_room.wal")).unwrap();
    let err = engine
        .create_reservation(booking(Ulid::new(), (10, 0), (11, 0), 0), ALICE)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

// ── Priority policy ──────────────────────────────────────

#[tokio::test]
async fn higher_priority_preempts_lower() {
    let engine = Engine::new(test_wal_path("preempt.wal")).unwrap();
    let room = monday_room(&engine, "A-101").await;

    let low = engine
        .create_reservation(booking(room, (10, 0), (11, 0), 1), ALICE)
        .await
        .unwrap();
    let high = engine
        .create_reservation(booking(room, (10, 30), (11, 30), 5), BOB)
        .await
        .unwrap();

    assert_eq!(active_in(&engine, room).await, vec![high.clone()]);

    let loser = engine
        .get_reservation(&low.code, Visibility::IncludeCancelled)
        .await
        .unwrap();
    assert!(!loser.is_active());
    assert_eq!(loser.cancelled_by, Some(BOB.id));
    assert_eq!(loser.cancelled_at, Some(high.created_at));
    assert_eq!(loser.preempted_by.as_deref(), Some(high.code.as_str()));

    let err = engine
        .get_reservation(&low.code, Visibility::ActiveOnly)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn lower_priority_is_rejected() {
    let engine = Engine::new(test_wal_path("low_rejected.wal")).unwrap();
    let room = monday_room(&engine, "A-101").await;

    let high = engine
        .create_reservation(booking(room, (10, 0), (11, 0), 5), ALICE)
        .await
        .unwrap();
    let err = engine
        .create_reservation(booking(room, (10, 30), (11, 30), 1), BOB)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(matches!(&err, EngineError::Conflict { blocking_code } if *blocking_code == high.code));
    assert_eq!(everything(&engine).await, vec![high]);
}

#[tokio::test]
async fn equal_priority_never_preempts() {
    let engine = Engine::new(test_wal_path("tie.wal")).unwrap();
    let room = monday_room(&engine, "A-101").await;

    let first = engine
        .create_reservation(booking(room, (10, 0), (11, 0), 3), ALICE)
        .await
        .unwrap();
    let err = engine
        .create_reservation(booking(room, (10, 0), (11, 0), 3), BOB)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(active_in(&engine, room).await, vec![first]);
}

#[tokio::test]
async fn preempts_every_lower_overlap_at_once() {
    let engine = Engine::new(test_wal_path("preempt_many.wal")).unwrap();
    let room = monday_room(&engine, "A-101").await;

    let a = engine
        .create_reservation(booking(room, (10, 0), (11, 0), 0), ALICE)
        .await
        .unwrap();
    let b = engine
        .create_reservation(booking(room, (11, 0), (12, 0), 2), ALICE)
        .await
        .unwrap();
    let untouched = engine
        .create_reservation(booking(room, (13, 0), (14, 0), 0), ALICE)
        .await
        .unwrap();

    let winner = engine
        .create_reservation(booking(room, (10, 30), (11, 30), 3), BOB)
        .await
        .unwrap();

    let active = active_in(&engine, room).await;
    assert_eq!(active, vec![winner.clone(), untouched]);
    for code in [&a.code, &b.code] {
        let r = engine
            .get_reservation(code, Visibility::IncludeCancelled)
            .await
            .unwrap();
        assert_eq!(r.preempted_by.as_deref(), Some(winner.code.as_str()));
    }
}

#[tokio::test]
async fn one_blocker_rejects_the_whole_request() {
    let engine = Engine::new(test_wal_path("all_or_nothing.wal")).unwrap();
    let room = monday_room(&engine, "A-101").await;

    let low = engine
        .create_reservation(booking(room, (10, 0), (11, 0), 0), ALICE)
        .await
        .unwrap();
    let high = engine
        .create_reservation(booking(room, (11, 0), (12, 0), 9), ALICE)
        .await
        .unwrap();

    let err = engine
        .create_reservation(booking(room, (10, 30), (11, 30), 5), BOB)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    // The lower one would have lost, but nothing was applied.
    assert_eq!(active_in(&engine, room).await, vec![low, high]);
}

#[tokio::test]
async fn touching_reservations_coexist() {
    let engine = Engine::new(test_wal_path("touching.wal")).unwrap();
    let room = monday_room(&engine, "A-101").await;

    for (start, end) in [((9, 0), (10, 0)), ((10, 0), (11, 0)), ((11, 0), (12, 0))] {
        engine
            .create_reservation(booking(room, start, end, 0), ALICE)
            .await
            .unwrap();
    }
    assert_eq!(active_in(&engine, room).await.len(), 3);
}

#[tokio::test]
async fn same_window_in_other_room_is_independent() {
    let engine = Engine::new(test_wal_path("two_rooms.wal")).unwrap();
    let a = monday_room(&engine, "A-101").await;
    let b = monday_room(&engine, "B-202").await;

    engine
        .create_reservation(booking(a, (10, 0), (11, 0), 0), ALICE)
        .await
        .unwrap();
    engine
        .create_reservation(booking(b, (10, 0), (11, 0), 0), BOB)
        .await
        .unwrap();
    assert_eq!(everything(&engine).await.len(), 2);
}

// ── Cancellation ─────────────────────────────────────────

#[tokio::test]
async fn cancel_is_idempotent() {
    let engine = Engine::new(test_wal_path("cancel_twice.wal")).unwrap();
    let room = monday_room(&engine, "A-101").await;
    let r = engine
        .create_reservation(booking(room, (10, 0), (11, 0), 0), ALICE)
        .await
        .unwrap();

    let first = engine.cancel_reservation(&r.code, ALICE).await.unwrap();
    assert!(!first.is_active());
    assert_eq!(first.cancelled_by, Some(ALICE.id));
    assert_eq!(first.preempted_by, None);

    let second = engine.cancel_reservation(&r.code, BOB).await.unwrap();
    assert_eq!(second, first);
    assert_eq!(engine.wal_appends_since_compact().await, 4);
}

#[tokio::test]
async fn cancelled_slot_can_be_rebooked() {
    let engine = Engine::new(test_wal_path("rebook.wal")).unwrap();
    let room = monday_room(&engine, "A-101").await;
    let r = engine
        .create_reservation(booking(room, (10, 0), (11, 0), 0), ALICE)
        .await
        .unwrap();
    engine.cancel_reservation(&r.code, ALICE).await.unwrap();

    let again = engine
        .create_reservation(booking(room, (10, 0), (11, 0), 0), BOB)
        .await
        .unwrap();
    assert_ne!(again.code, r.code);
    assert_eq!(active_in(&engine, room).await, vec![again]);
    assert_eq!(everything(&engine).await.len(), 2);
}

#[tokio::test]
async fn unknown_code_is_not_found() {
    let engine = Engine::new(test_wal_path("unknown_code.wal")).unwrap();
    monday_room(&engine, "A-101").await;

    let err = engine.cancel_reservation("NOPE", ALICE).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = engine
        .update_reservation("NOPE", ReservationPatch::default(), ALICE)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = engine
        .get_reservation("NOPE", Visibility::IncludeCancelled)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

// ── Update ───────────────────────────────────────────────

#[tokio::test]
async fn update_does_not_conflict_with_itself() {
    let engine = Engine::new(test_wal_path("update_self.wal")).unwrap();
    let room = monday_room(&engine, "A-101").await;
    let r = engine
        .create_reservation(booking(room, (10, 0), (11, 0), 0), ALICE)
        .await
        .unwrap();

    let moved = engine
        .update_reservation(
            &r.code,
            ReservationPatch {
                start: Some(at(10, 30)),
                end: Some(at(11, 30)),
                ..Default::default()
            },
            BOB,
        )
        .await
        .unwrap();

    assert_eq!(moved.id, r.id);
    assert_eq!(moved.code, r.code);
    assert_eq!(moved.start, at(10, 30));
    assert_eq!(moved.created_by, ALICE.id);
    assert_eq!(moved.updated_by, Some(BOB.id));
    assert_eq!(active_in(&engine, room).await, vec![moved]);
}

#[tokio::test]
async fn update_runs_full_admission() {
    let engine = Engine::new(test_wal_path("update_admission.wal")).unwrap();
    let room = monday_room(&engine, "A-101").await;
    let a = engine
        .create_reservation(booking(room, (10, 0), (11, 0), 2), ALICE)
        .await
        .unwrap();
    let b = engine
        .create_reservation(booking(room, (12, 0), (13, 0), 2), BOB)
        .await
        .unwrap();

    let into_a = ReservationPatch {
        start: Some(at(10, 30)),
        end: Some(at(11, 30)),
        ..Default::default()
    };
    let err = engine
        .update_reservation(&b.code, into_a.clone(), BOB)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let late = ReservationPatch {
        end: Some(at(19, 0)),
        ..Default::default()
    };
    let err = engine.update_reservation(&b.code, late, BOB).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert_eq!(active_in(&engine, room).await, vec![a.clone(), b.clone()]);

    // Raising priority wins the slot.
    let bumped = engine
        .update_reservation(
            &b.code,
            ReservationPatch {
                priority: Some(3),
                ..into_a
            },
            BOB,
        )
        .await
        .unwrap();
    let loser = engine
        .get_reservation(&a.code, Visibility::IncludeCancelled)
        .await
        .unwrap();
    assert_eq!(loser.cancelled_by, Some(BOB.id));
    assert_eq!(loser.preempted_by.as_deref(), Some(b.code.as_str()));
    assert_eq!(active_in(&engine, room).await, vec![bumped]);
}

#[tokio::test]
async fn update_of_cancelled_is_not_found() {
    let engine = Engine::new(test_wal_path("update_cancelled.wal")).unwrap();
    let room = monday_room(&engine, "A-101").await;
    let r = engine
        .create_reservation(booking(room, (10, 0), (11, 0), 0), ALICE)
        .await
        .unwrap();
    engine.cancel_reservation(&r.code, ALICE).await.unwrap();

    let err = engine
        .update_reservation(
            &r.code,
            ReservationPatch {
                purpose: Some("revived".into()),
                ..Default::default()
            },
            ALICE,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn update_moves_between_rooms() {
    let engine = Engine::new(test_wal_path("update_move.wal")).unwrap();
    let a = monday_room(&engine, "A-101").await;
    let b = monday_room(&engine, "B-202").await;
    let r = engine
        .create_reservation(booking(a, (10, 0), (11, 0), 0), ALICE)
        .await
        .unwrap();

    let moved = engine
        .update_reservation(
            &r.code,
            ReservationPatch {
                room_id: Some(b),
                ..Default::default()
            },
            ALICE,
        )
        .await
        .unwrap();
    assert_eq!(moved.room_id, b);
    assert!(active_in(&engine, a).await.is_empty());
    assert_eq!(active_in(&engine, b).await, vec![moved.clone()]);
    assert_eq!(engine.room_of_entity(&r.id), Some(b));

    // The old slot is free, the record keeps working in its new room.
    engine
        .create_reservation(booking(a, (10, 0), (11, 0), 0), BOB)
        .await
        .unwrap();
    let cancelled = engine.cancel_reservation(&r.code, ALICE).await.unwrap();
    assert_eq!(cancelled.room_id, b);
}

#[tokio::test]
async fn move_into_closed_room_is_rejected() {
    let engine = Engine::new(test_wal_path("move_closed.wal")).unwrap();
    let a = monday_room(&engine, "A-101").await;
    let closed = create_room(&engine, "Storage").await;
    let r = engine
        .create_reservation(booking(a, (10, 0), (11, 0), 0), ALICE)
        .await
        .unwrap();

    let err = engine
        .update_reservation(
            &r.code,
            ReservationPatch {
                room_id: Some(closed),
                ..Default::default()
            },
            ALICE,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert_eq!(active_in(&engine, a).await, vec![r]);
    assert!(active_in(&engine, closed).await.is_empty());
}

#[tokio::test]
async fn move_can_preempt_in_target_room() {
    let engine = Engine::new(test_wal_path("move_preempt.wal")).unwrap();
    let a = monday_room(&engine, "A-101").await;
    let b = monday_room(&engine, "B-202").await;
    let low = engine
        .create_reservation(booking(b, (10, 0), (11, 0), 0), ALICE)
        .await
        .unwrap();
    let high = engine
        .create_reservation(booking(a, (10, 0), (11, 0), 4), BOB)
        .await
        .unwrap();

    engine
        .update_reservation(
            &high.code,
            ReservationPatch {
                room_id: Some(b),
                ..Default::default()
            },
            BOB,
        )
        .await
        .unwrap();
    let loser = engine
        .get_reservation(&low.code, Visibility::IncludeCancelled)
        .await
        .unwrap();
    assert_eq!(loser.preempted_by.as_deref(), Some(high.code.as_str()));
    assert_no_active_overlaps(&everything(&engine).await);
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn list_reservations_filters_and_orders() {
    let engine = Engine::new(test_wal_path("list_filters.wal")).unwrap();
    let room = monday_room(&engine, "A-101").await;

    let late = engine
        .create_reservation(booking(room, (15, 0), (16, 0), 0), ALICE)
        .await
        .unwrap();
    let early = engine
        .create_reservation(booking(room, (9, 0), (10, 0), 0), ALICE)
        .await
        .unwrap();
    let mut other_group = booking(room, (12, 0), (13, 0), 0);
    other_group.group_id = 99;
    let mid = engine.create_reservation(other_group, BOB).await.unwrap();

    assert_eq!(
        active_in(&engine, room).await,
        vec![early.clone(), mid.clone(), late.clone()]
    );

    let group = engine
        .list_reservations(&ReservationFilter {
            group_id: Some(99),
            ..Default::default()
        })
        .await;
    assert_eq!(group, vec![mid.clone()]);

    let window = engine
        .list_reservations(&ReservationFilter {
            start_after: Some(at(10, 0)),
            end_before: Some(at(16, 0)),
            ..Default::default()
        })
        .await;
    assert_eq!(window, vec![mid.clone(), late.clone()]);

    let by_code = engine
        .list_reservations(&ReservationFilter {
            code: Some(early.code.clone()),
            ..Default::default()
        })
        .await;
    assert_eq!(by_code, vec![early]);

    let overlapping = engine
        .find_overlapping(room, at(12, 30), at(15, 30), Some(late.id))
        .await
        .unwrap();
    assert_eq!(overlapping, vec![mid]);
}

// ── Catalog ──────────────────────────────────────────────

#[tokio::test]
async fn room_crud() {
    let engine = Engine::new(test_wal_path("room_crud.wal")).unwrap();
    let id = create_room(&engine, "Zeta").await;
    create_room(&engine, "Alpha").await;

    let err = engine
        .create_room(
            id,
            RoomDraft {
                name: "dup".into(),
                capacity: 1,
                department: None,
            },
            ADMIN,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)));

    let renamed = engine
        .update_room(
            id,
            RoomPatch {
                name: Some("Beta".into()),
                ..Default::default()
            },
            ADMIN,
        )
        .await
        .unwrap();
    assert_eq!(renamed.name, "Beta");
    assert_eq!(renamed.capacity, 30);

    let names: Vec<String> = engine.list_rooms().await.into_iter().map(|r| r.name).collect();
    assert_eq!(names, vec!["Alpha", "Beta"]);

    engine.delete_room(id, ADMIN).await.unwrap();
    assert_eq!(engine.list_rooms().await.len(), 1);
    assert_eq!(engine.get_room(id).await.unwrap_err().kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn catalog_updates_record_the_editor() {
    let engine = Engine::new(test_wal_path("updated_by.wal")).unwrap();
    let room = create_room(&engine, "A-101").await;
    let editor = Actor::new(7);

    let renamed = engine
        .update_room(
            room,
            RoomPatch {
                capacity: Some(12),
                ..Default::default()
            },
            editor,
        )
        .await
        .unwrap();
    assert_eq!(renamed.created_by, ADMIN.id);
    assert_eq!(renamed.updated_by, Some(editor.id));

    let exception = engine
        .create_exception(
            Ulid::new(),
            ExceptionDraft {
                room_id: room,
                date: date(MONDAY),
                reason: Some("holiday".into()),
                opening: None,
                closing: None,
            },
            ADMIN,
        )
        .await
        .unwrap();
    assert_eq!(exception.updated_by, None);

    let edited = engine
        .update_exception(
            exception.id,
            ExceptionPatch {
                reason: Some(Some("exams".into())),
                ..Default::default()
            },
            editor,
        )
        .await
        .unwrap();
    assert_eq!(edited.updated_by, Some(editor.id));
    assert_eq!(engine.list_exceptions(room).await.unwrap(), vec![edited]);
}

#[tokio::test]
async fn room_name_is_validated() {
    let engine = Engine::new(test_wal_path("room_name.wal")).unwrap();
    for name in [String::new(), "n".repeat(MAX_ROOM_NAME_LEN + 1)] {
        let err = engine
            .create_room(
                Ulid::new(),
                RoomDraft {
                    name,
                    capacity: 0,
                    department: None,
                },
                ADMIN,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}

#[tokio::test]
async fn room_with_active_reservations_cannot_be_deleted() {
    let engine = Engine::new(test_wal_path("room_in_use.wal")).unwrap();
    let room = monday_room(&engine, "A-101").await;
    let r = engine
        .create_reservation(booking(room, (10, 0), (11, 0), 0), ALICE)
        .await
        .unwrap();

    let err = engine.delete_room(room, ADMIN).await.unwrap_err();
    assert!(matches!(err, EngineError::RoomInUse(_)));

    engine.cancel_reservation(&r.code, ALICE).await.unwrap();
    engine.delete_room(room, ADMIN).await.unwrap();

    let err = engine
        .create_reservation(booking(room, (12, 0), (13, 0), 0), ALICE)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    // Audit trail survives the room.
    assert_eq!(everything(&engine).await.len(), 1);
}

#[tokio::test]
async fn one_active_hour_per_weekday() {
    let engine = Engine::new(test_wal_path("hour_dup.wal")).unwrap();
    let room = monday_room(&engine, "A-101").await;
    let tuesday = open_on(&engine, room, 2, t(9, 0), t(12, 0)).await;

    let err = engine
        .create_operating_hour(
            Ulid::new(),
            OperatingHourDraft {
                room_id: room,
                weekday: 1,
                opening: t(7, 0),
                closing: t(8, 0),
                max_duration_minutes: None,
            },
            ADMIN,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = engine
        .update_operating_hour(
            tuesday,
            OperatingHourPatch {
                weekday: Some(1),
                ..Default::default()
            },
            ADMIN,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let updated = engine
        .update_operating_hour(
            tuesday,
            OperatingHourPatch {
                closing: Some(t(17, 0)),
                ..Default::default()
            },
            ADMIN,
        )
        .await
        .unwrap();
    assert_eq!(updated.closing, t(17, 0));
    assert_eq!(updated.updated_by, Some(ADMIN.id));
    assert_eq!(engine.list_operating_hours(room).await.unwrap().len(), 2);
}

#[tokio::test]
async fn operating_hour_shape_is_validated() {
    let engine = Engine::new(test_wal_path("hour_shape.wal")).unwrap();
    let room = create_room(&engine, "A-101").await;

    for (weekday, opening, closing) in [(7, t(9, 0), t(10, 0)), (1, t(10, 0), t(10, 0)), (1, t(12, 0), t(9, 0))] {
        let err = engine
            .create_operating_hour(
                Ulid::new(),
                OperatingHourDraft {
                    room_id: room,
                    weekday,
                    opening,
                    closing,
                    max_duration_minutes: None,
                },
                ADMIN,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}

#[tokio::test]
async fn exception_shape_is_validated() {
    let engine = Engine::new(test_wal_path("exception_shape.wal")).unwrap();
    let room = monday_room(&engine, "A-101").await;

    let shapes = [
        (Some(t(10, 0)), None),
        (None, Some(t(10, 0))),
        (Some(t(14, 0)), Some(t(10, 0))),
    ];
    for (opening, closing) in shapes {
        let err = engine
            .create_exception(
                Ulid::new(),
                ExceptionDraft {
                    room_id: room,
                    date: date(MONDAY),
                    reason: None,
                    opening,
                    closing,
                },
                ADMIN,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    let holiday = Ulid::new();
    engine
        .create_exception(
            holiday,
            ExceptionDraft {
                room_id: room,
                date: date(MONDAY),
                reason: Some("holiday".into()),
                opening: None,
                closing: None,
            },
            ADMIN,
        )
        .await
        .unwrap();
    let err = engine
        .create_exception(
            Ulid::new(),
            ExceptionDraft {
                room_id: room,
                date: date(MONDAY),
                reason: None,
                opening: None,
                closing: None,
            },
            ADMIN,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    // Turning the holiday into special hours reopens the day.
    engine
        .update_exception(
            holiday,
            ExceptionPatch {
                opening: Some(Some(t(10, 0))),
                closing: Some(Some(t(12, 0))),
                ..Default::default()
            },
            ADMIN,
        )
        .await
        .unwrap();
    engine
        .create_reservation(booking(room, (10, 0), (11, 0), 0), ALICE)
        .await
        .unwrap();

    engine.delete_exception(holiday, ADMIN).await.unwrap();
    assert!(engine.list_exceptions(room).await.unwrap().is_empty());
}

// ── Codes ────────────────────────────────────────────────

#[tokio::test]
async fn repeated_code_is_a_persistence_fault() {
    let engine =
        Engine::with_code_source(test_wal_path("dup_code.wal"), Arc::new(FixedCodes("SAME"))).unwrap();
    let room = monday_room(&engine, "A-101").await;

    engine
        .create_reservation(booking(room, (10, 0), (11, 0), 0), ALICE)
        .await
        .unwrap();
    let err = engine
        .create_reservation(booking(room, (12, 0), (13, 0), 0), ALICE)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DuplicateCode(ref c) if c == "SAME"));
    assert_eq!(err.kind(), ErrorKind::Persistence);
    assert_eq!(everything(&engine).await.len(), 1);
}

#[tokio::test]
async fn codes_of_cancelled_reservations_stay_taken() {
    let path = test_wal_path("code_after_restart.wal");
    {
        let engine = Engine::with_code_source(path.clone(), Arc::new(FixedCodes("ONCE"))).unwrap();
        let room = monday_room(&engine, "A-101").await;
        let r = engine
            .create_reservation(booking(room, (10, 0), (11, 0), 0), ALICE)
            .await
            .unwrap();
        engine.cancel_reservation(&r.code, ALICE).await.unwrap();
    }

    let engine = Engine::with_code_source(path, Arc::new(FixedCodes("ONCE"))).unwrap();
    let room = engine.list_rooms().await[0].id;
    let err = engine
        .create_reservation(booking(room, (12, 0), (13, 0), 0), ALICE)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Persistence);
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_equal_priority_admits_exactly_one() {
    let engine = Arc::new(Engine::new(test_wal_path("race_equal.wal")).unwrap());
    let room = monday_room(&engine, "A-101").await;

    let mut handles = Vec::new();
    for i in 0..32 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .create_reservation(booking(room, (10, 0), (11, 0), 1), Actor::new(1000 + i))
                .await
        }));
    }

    let mut admitted = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(e) => assert_eq!(e.kind(), ErrorKind::Conflict),
        }
    }
    assert_eq!(admitted, 1);
    assert_eq!(active_in(&engine, room).await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_mixed_priorities_leave_no_overlaps() {
    let engine = Arc::new(Engine::new(test_wal_path("race_mixed.wal")).unwrap());
    let room = monday_room(&engine, "A-101").await;

    let mut handles = Vec::new();
    for i in 0..32u32 {
        let engine = engine.clone();
        let start = 9 + i % 6;
        handles.push(tokio::spawn(async move {
            engine
                .create_reservation(
                    booking(room, (start, 0), (start + 2, 30), (i % 5) as i32),
                    Actor::new(i64::from(i)),
                )
                .await
        }));
    }
    for h in handles {
        let _ = h.await.unwrap();
    }

    let all = everything(&engine).await;
    assert!(!all.is_empty());
    assert_no_active_overlaps(&all);
    for r in all.iter().filter(|r| r.preempted_by.is_some()) {
        assert!(!r.is_active());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lookups_during_room_moves_always_find_the_reservation() {
    let engine = Arc::new(Engine::new(test_wal_path("read_during_move.wal")).unwrap());
    let a = monday_room(&engine, "A-101").await;
    let b = monday_room(&engine, "B-202").await;
    let r = engine
        .create_reservation(booking(a, (10, 0), (11, 0), 0), ALICE)
        .await
        .unwrap();

    let mover = {
        let engine = engine.clone();
        let code = r.code.clone();
        tokio::spawn(async move {
            for i in 0..200 {
                let target = if i % 2 == 0 { b } else { a };
                engine
                    .update_reservation(
                        &code,
                        ReservationPatch {
                            room_id: Some(target),
                            ..Default::default()
                        },
                        ALICE,
                    )
                    .await
                    .unwrap();
            }
        })
    };

    let mut readers = Vec::new();
    for _ in 0..3 {
        let engine = engine.clone();
        let code = r.code.clone();
        readers.push(tokio::spawn(async move {
            for _ in 0..500 {
                let found = engine
                    .get_reservation(&code, Visibility::IncludeCancelled)
                    .await
                    .unwrap();
                assert!(found.room_id == a || found.room_id == b);
            }
        }));
    }

    mover.await.unwrap();
    for h in readers {
        h.await.unwrap();
    }
    assert_eq!(
        engine.get_reservation(&r.code, Visibility::ActiveOnly).await.unwrap().room_id,
        a
    );
}

// ── Durability ───────────────────────────────────────────

async fn busy_history(engine: &Engine) {
    let a = monday_room(engine, "A-101").await;
    let b = monday_room(engine, "B-202").await;
    engine
        .create_exception(
            Ulid::new(),
            ExceptionDraft {
                room_id: a,
                date: date((2025, 11, 3)),
                reason: Some("holiday".into()),
                opening: None,
                closing: None,
            },
            ADMIN,
        )
        .await
        .unwrap();
    let low = engine
        .create_reservation(booking(a, (10, 0), (11, 0), 0), ALICE)
        .await
        .unwrap();
    engine
        .create_reservation(booking(a, (10, 0), (11, 0), 2), BOB)
        .await
        .unwrap();
    let mover = engine
        .create_reservation(booking(a, (14, 0), (15, 0), 0), ALICE)
        .await
        .unwrap();
    engine
        .update_reservation(
            &mover.code,
            ReservationPatch {
                room_id: Some(b),
                ..Default::default()
            },
            ALICE,
        )
        .await
        .unwrap();
    let gone = engine
        .create_reservation(booking(b, (16, 0), (17, 0), 0), ALICE)
        .await
        .unwrap();
    engine.cancel_reservation(&gone.code, ALICE).await.unwrap();
    assert!(engine.get_reservation(&low.code, Visibility::ActiveOnly).await.is_err());
}

#[tokio::test]
async fn replay_restores_state() {
    let path = test_wal_path("replay.wal");
    let (before, rooms) = {
        let engine = Engine::new(path.clone()).unwrap();
        busy_history(&engine).await;
        (everything(&engine).await, engine.list_rooms().await)
    };

    let engine = Engine::new(path).unwrap();
    assert_eq!(everything(&engine).await, before);
    assert_eq!(engine.list_rooms().await, rooms);
    for room in &rooms {
        assert_eq!(engine.list_operating_hours(room.id).await.unwrap().len(), 1);
    }
    assert_no_active_overlaps(&before);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let before = {
        let engine = Engine::new(path.clone()).unwrap();
        busy_history(&engine).await;
        let appended = engine.wal_appends_since_compact().await;
        let written = engine.compact_wal().await.unwrap();
        assert!(written < appended as usize, "{written} < {appended}");
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        // Appends after compaction land in the new log.
        let room = engine.list_rooms().await[0].id;
        engine
            .create_reservation(booking(room, (16, 0), (17, 0), 0), ALICE)
            .await
            .unwrap();
        everything(&engine).await
    };

    let engine = Engine::new(path).unwrap();
    assert_eq!(everything(&engine).await, before);
}

#[tokio::test]
async fn writes_after_a_torn_tail_survive_restart() {
    let path = test_wal_path("torn_restart.wal");
    let first = {
        let engine = Engine::new(path.clone()).unwrap();
        monday_room(&engine, "A-101").await
    };
    {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[0xAB; 11]).unwrap();
    }

    let (second, booked) = {
        let engine = Engine::new(path.clone()).unwrap();
        assert_eq!(engine.list_rooms().await.len(), 1);
        let second = monday_room(&engine, "B-202").await;
        let booked = engine
            .create_reservation(booking(second, (10, 0), (11, 0), 0), ALICE)
            .await
            .unwrap();
        (second, booked)
    };

    let engine = Engine::new(path).unwrap();
    let ids: Vec<Ulid> = engine.list_rooms().await.into_iter().map(|r| r.id).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&first) && ids.contains(&second));
    assert_eq!(
        engine.get_reservation(&booked.code, Visibility::ActiveOnly).await.unwrap(),
        booked
    );
    assert_eq!(engine.list_operating_hours(second).await.unwrap().len(), 1);
}
