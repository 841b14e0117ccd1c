use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for interval arithmetic.
pub type Ms = i64;

/// Id of a user in the external identity service.
pub type UserId = i64;

/// Who is performing an engine call. Always passed explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub id: UserId,
}

impl Actor {
    pub fn new(id: UserId) -> Self {
        Self { id }
    }
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn of_window(start: &DateTime<FixedOffset>, end: &DateTime<FixedOffset>) -> Self {
        Self::new(start.timestamp_millis(), end.timestamp_millis())
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub name: String,
    /// Upper bound on occupants. Informational only, never enforced.
    pub capacity: u32,
    pub department: Option<String>,
    pub created_by: UserId,
    pub updated_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<UserId>,
}

impl Room {
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// Weekly opening hours of a room for one weekday.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingHour {
    pub id: Ulid,
    pub room_id: Ulid,
    /// 0 = Sunday .. 6 = Saturday.
    pub weekday: u8,
    pub opening: NaiveTime,
    pub closing: NaiveTime,
    /// Longest reservation allowed on this weekday.
    pub max_duration_minutes: Option<u32>,
    pub created_by: UserId,
    pub updated_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<UserId>,
}

impl OperatingHour {
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// A date-specific override: a holiday, or special hours when both times are set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomException {
    pub id: Ulid,
    pub room_id: Ulid,
    pub date: NaiveDate,
    pub reason: Option<String>,
    pub opening: Option<NaiveTime>,
    pub closing: Option<NaiveTime>,
    pub created_by: UserId,
    pub updated_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<UserId>,
}

impl RoomException {
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Replacement hours for the date, if this is a special-hours exception.
    pub fn override_hours(&self) -> Option<(NaiveTime, NaiveTime)> {
        match (self.opening, self.closing) {
            (Some(opening), Some(closing)) => Some((opening, closing)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    /// External booking code. Assigned once, never reused.
    pub code: String,
    pub room_id: Ulid,
    pub group_id: i64,
    pub link_id: Option<i64>,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    pub purpose: String,
    /// Higher value = stronger claim.
    pub priority: i32,
    pub created_by: UserId,
    pub updated_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancelled_by: Option<UserId>,
    /// Code of the reservation that displaced this one.
    pub preempted_by: Option<String>,
}

impl Reservation {
    pub fn is_active(&self) -> bool {
        self.cancelled_at.is_none()
    }

    pub fn span(&self) -> Span {
        Span::of_window(&self.start, &self.end)
    }

    /// The actor responsible for the latest admitted version of this record.
    pub fn last_actor(&self) -> UserId {
        self.updated_by.unwrap_or(self.created_by)
    }
}

// ── Inputs ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomDraft {
    pub name: String,
    pub capacity: u32,
    pub department: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatingHourDraft {
    pub room_id: Ulid,
    pub weekday: u8,
    pub opening: NaiveTime,
    pub closing: NaiveTime,
    pub max_duration_minutes: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionDraft {
    pub room_id: Ulid,
    pub date: NaiveDate,
    pub reason: Option<String>,
    pub opening: Option<NaiveTime>,
    pub closing: Option<NaiveTime>,
}

/// Partial change to a room. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomPatch {
    pub name: Option<String>,
    pub capacity: Option<u32>,
    pub department: Option<Option<String>>,
}

impl RoomPatch {
    pub fn apply_to(self, current: &Room) -> RoomDraft {
        RoomDraft {
            name: self.name.unwrap_or_else(|| current.name.clone()),
            capacity: self.capacity.unwrap_or(current.capacity),
            department: self.department.unwrap_or_else(|| current.department.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperatingHourPatch {
    pub weekday: Option<u8>,
    pub opening: Option<NaiveTime>,
    pub closing: Option<NaiveTime>,
    pub max_duration_minutes: Option<Option<u32>>,
}

impl OperatingHourPatch {
    pub fn apply_to(self, current: &OperatingHour) -> OperatingHourDraft {
        OperatingHourDraft {
            room_id: current.room_id,
            weekday: self.weekday.unwrap_or(current.weekday),
            opening: self.opening.unwrap_or(current.opening),
            closing: self.closing.unwrap_or(current.closing),
            max_duration_minutes: self
                .max_duration_minutes
                .unwrap_or(current.max_duration_minutes),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExceptionPatch {
    pub date: Option<NaiveDate>,
    pub reason: Option<Option<String>>,
    pub opening: Option<Option<NaiveTime>>,
    pub closing: Option<Option<NaiveTime>>,
}

impl ExceptionPatch {
    pub fn apply_to(self, current: &RoomException) -> ExceptionDraft {
        ExceptionDraft {
            room_id: current.room_id,
            date: self.date.unwrap_or(current.date),
            reason: self.reason.unwrap_or_else(|| current.reason.clone()),
            opening: self.opening.unwrap_or(current.opening),
            closing: self.closing.unwrap_or(current.closing),
        }
    }
}

/// Everything a caller supplies to create or replace a reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationDraft {
    pub room_id: Ulid,
    pub group_id: i64,
    pub link_id: Option<i64>,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    pub purpose: String,
    pub priority: i32,
}

/// Partial change to a reservation. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationPatch {
    pub room_id: Option<Ulid>,
    pub group_id: Option<i64>,
    pub link_id: Option<Option<i64>>,
    pub start: Option<DateTime<FixedOffset>>,
    pub end: Option<DateTime<FixedOffset>>,
    pub purpose: Option<String>,
    pub priority: Option<i32>,
}

impl ReservationPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply_to(self, current: &Reservation) -> ReservationDraft {
        ReservationDraft {
            room_id: self.room_id.unwrap_or(current.room_id),
            group_id: self.group_id.unwrap_or(current.group_id),
            link_id: self.link_id.unwrap_or(current.link_id),
            start: self.start.unwrap_or(current.start),
            end: self.end.unwrap_or(current.end),
            purpose: self.purpose.unwrap_or_else(|| current.purpose.clone()),
            priority: self.priority.unwrap_or(current.priority),
        }
    }
}

/// Which reservations a lookup may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    #[default]
    ActiveOnly,
    IncludeCancelled,
}

impl Visibility {
    pub fn admits(self, reservation: &Reservation) -> bool {
        match self {
            Visibility::ActiveOnly => reservation.is_active(),
            Visibility::IncludeCancelled => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub code: Option<String>,
    pub room_id: Option<Ulid>,
    pub group_id: Option<i64>,
    /// Keep reservations starting at or after this instant.
    pub start_after: Option<DateTime<FixedOffset>>,
    /// Keep reservations ending at or before this instant.
    pub end_before: Option<DateTime<FixedOffset>>,
    pub visibility: Visibility,
}

impl ReservationFilter {
    pub fn matches(&self, r: &Reservation) -> bool {
        self.visibility.admits(r)
            && self.code.as_deref().is_none_or(|c| c == r.code)
            && self.room_id.is_none_or(|id| id == r.room_id)
            && self.group_id.is_none_or(|g| g == r.group_id)
            && self.start_after.is_none_or(|t| r.start >= t)
            && self.end_before.is_none_or(|t| r.end <= t)
    }
}

// ── Per-room state ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    pub hours: Vec<OperatingHour>,
    pub exceptions: Vec<RoomException>,
    /// Every reservation admitted here, sorted by `start`. Cancelled ones stay for audit.
    pub reservations: Vec<Reservation>,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            hours: Vec::new(),
            exceptions: Vec::new(),
            reservations: Vec::new(),
        }
    }

    /// Insert maintaining sort order by start instant.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let key = reservation.span().start;
        let pos = self
            .reservations
            .partition_point(|r| r.span().start <= key);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn reservation_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    pub fn has_active_reservations(&self) -> bool {
        self.reservations.iter().any(Reservation::is_active)
    }

    /// Active reservations whose window intersects `query`, minus `exclude`.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn find_overlapping(
        &self,
        query: &Span,
        exclude: Option<Ulid>,
    ) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span().start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.is_active())
            .filter(move |r| Some(r.id) != exclude)
            .filter(move |r| r.span().end > query.start)
    }

    pub fn active_hour(&self, weekday: u8) -> Option<&OperatingHour> {
        self.hours
            .iter()
            .find(|h| h.is_active() && h.weekday == weekday)
    }

    pub fn active_exception(&self, date: NaiveDate) -> Option<&RoomException> {
        self.exceptions
            .iter()
            .find(|e| e.is_active() && e.date == date)
    }

    pub fn upsert_hour(&mut self, hour: OperatingHour) {
        match self.hours.iter_mut().find(|h| h.id == hour.id) {
            Some(slot) => *slot = hour,
            None => self.hours.push(hour),
        }
    }

    pub fn upsert_exception(&mut self, exception: RoomException) {
        match self.exceptions.iter_mut().find(|e| e.id == exception.id) {
            Some(slot) => *slot = exception,
            None => self.exceptions.push(exception),
        }
    }

    pub fn calendar_len(&self) -> usize {
        self.hours.len() + self.exceptions.len()
    }
}

/// WAL record format. One event is one atomic state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// Room created, updated or soft-deleted (full record).
    RoomSaved { room: Room },
    OperatingHourSaved { hour: OperatingHour },
    ExceptionSaved { exception: RoomException },
    /// A reservation admitted by create or update, together with every
    /// reservation it displaced. `moved_from` is set when an update changed rooms.
    ReservationAdmitted {
        reservation: Reservation,
        moved_from: Option<Ulid>,
        preempted: Vec<Ulid>,
    },
    ReservationCancelled {
        id: Ulid,
        room_id: Ulid,
        at: DateTime<Utc>,
        by: UserId,
    },
}

impl Event {
    /// The room whose state this event changes.
    pub fn room_id(&self) -> Ulid {
        match self {
            Event::RoomSaved { room } => room.id,
            Event::OperatingHourSaved { hour } => hour.room_id,
            Event::ExceptionSaved { exception } => exception.room_id,
            Event::ReservationAdmitted { reservation, .. } => reservation.room_id,
            Event::ReservationCancelled { room_id, .. } => *room_id,
        }
    }
}
