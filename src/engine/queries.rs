use chrono::{DateTime, FixedOffset, NaiveDate};
use ulid::Ulid;

use crate::model::*;

use super::calendar::{self, EffectiveHours};
use super::{Engine, EngineError, SharedRoomState};

impl Engine {
    fn existing_room(&self, room_id: Ulid) -> Result<SharedRoomState, EngineError> {
        self.room_state(&room_id)
            .ok_or_else(|| EngineError::not_found("room", room_id))
    }

    pub async fn get_room(&self, id: Ulid) -> Result<Room, EngineError> {
        let rs = self.existing_room(id)?;
        let guard = rs.read().await;
        if !guard.room.is_active() {
            return Err(EngineError::not_found("room", id));
        }
        Ok(guard.room.clone())
    }

    /// Active rooms, by name.
    pub async fn list_rooms(&self) -> Vec<Room> {
        let states: Vec<SharedRoomState> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut rooms = Vec::with_capacity(states.len());
        for rs in states {
            let guard = rs.read().await;
            if guard.room.is_active() {
                rooms.push(guard.room.clone());
            }
        }
        rooms.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        rooms
    }

    /// Active weekly hours of a room, Sunday first.
    pub async fn list_operating_hours(&self, room_id: Ulid) -> Result<Vec<OperatingHour>, EngineError> {
        let rs = self.existing_room(room_id)?;
        let guard = rs.read().await;
        let mut hours: Vec<OperatingHour> =
            guard.hours.iter().filter(|h| h.is_active()).cloned().collect();
        hours.sort_by_key(|h| h.weekday);
        Ok(hours)
    }

    pub async fn list_exceptions(&self, room_id: Ulid) -> Result<Vec<RoomException>, EngineError> {
        let rs = self.existing_room(room_id)?;
        let guard = rs.read().await;
        let mut exceptions: Vec<RoomException> = guard
            .exceptions
            .iter()
            .filter(|e| e.is_active())
            .cloned()
            .collect();
        exceptions.sort_by_key(|e| e.date);
        Ok(exceptions)
    }

    /// Opening window of a room on `date`; `None` when the room is closed that day.
    pub async fn effective_hours(
        &self,
        room_id: Ulid,
        date: NaiveDate,
    ) -> Result<Option<EffectiveHours>, EngineError> {
        let rs = self.existing_room(room_id)?;
        let guard = rs.read().await;
        if !guard.room.is_active() {
            return Err(EngineError::not_found("room", room_id));
        }
        Ok(calendar::effective_hours(&guard, date).ok())
    }

    /// Active reservations in a room intersecting `[start, end)`.
    pub async fn find_overlapping(
        &self,
        room_id: Ulid,
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
        exclude: Option<Ulid>,
    ) -> Result<Vec<Reservation>, EngineError> {
        if start >= end {
            return Err(EngineError::Validation("start must be before end".into()));
        }
        let rs = self.existing_room(room_id)?;
        let guard = rs.read().await;
        let span = Span::of_window(&start, &end);
        Ok(guard.find_overlapping(&span, exclude).cloned().collect())
    }

    pub async fn get_reservation(
        &self,
        code: &str,
        visibility: Visibility,
    ) -> Result<Reservation, EngineError> {
        let id = self.resolve_code(code)?;
        loop {
            let room_id = self
                .room_of_entity(&id)
                .ok_or_else(|| EngineError::not_found("reservation", code))?;
            let rs = self.existing_room(room_id)?;
            let guard = rs.read().await;
            // A move may have finished between the lookup and the lock.
            if self.room_of_entity(&id) != Some(room_id) {
                continue;
            }
            return guard
                .reservation(id)
                .filter(|r| visibility.admits(r))
                .cloned()
                .ok_or_else(|| EngineError::not_found("reservation", code));
        }
    }

    /// Reservations matching `filter`, ordered by start then code.
    pub async fn list_reservations(&self, filter: &ReservationFilter) -> Vec<Reservation> {
        if let Some(code) = &filter.code {
            return match self.get_reservation(code, filter.visibility).await {
                Ok(r) if filter.matches(&r) => vec![r],
                _ => Vec::new(),
            };
        }

        let states: Vec<SharedRoomState> = match filter.room_id {
            Some(room_id) => self.room_state(&room_id).into_iter().collect(),
            None => self.state.iter().map(|e| e.value().clone()).collect(),
        };

        let mut out = Vec::new();
        for rs in states {
            let guard = rs.read().await;
            out.extend(guard.reservations.iter().filter(|r| filter.matches(r)).cloned());
        }
        out.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.code.cmp(&b.code)));
        out
    }
}
