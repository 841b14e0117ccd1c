use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

fn validate_room(draft: &RoomDraft) -> Result<(), EngineError> {
    if draft.name.trim().is_empty() {
        return Err(EngineError::Validation("room name must not be empty".into()));
    }
    if draft.name.chars().count() > MAX_ROOM_NAME_LEN {
        return Err(EngineError::LimitExceeded("room name too long"));
    }
    if let Some(d) = &draft.department
        && d.chars().count() > MAX_DEPARTMENT_LEN
    {
        return Err(EngineError::LimitExceeded("department too long"));
    }
    Ok(())
}

fn validate_hour(draft: &OperatingHourDraft) -> Result<(), EngineError> {
    if draft.weekday > 6 {
        return Err(EngineError::Validation(format!(
            "weekday must be 0..=6 (0 = Sunday), got {}",
            draft.weekday
        )));
    }
    if draft.opening >= draft.closing {
        return Err(EngineError::Validation("opening must be before closing".into()));
    }
    if draft.max_duration_minutes == Some(0) {
        return Err(EngineError::Validation("max_duration must be positive".into()));
    }
    Ok(())
}

fn validate_exception(draft: &ExceptionDraft) -> Result<(), EngineError> {
    if let Some(r) = &draft.reason
        && r.chars().count() > MAX_EXCEPTION_REASON_LEN
    {
        return Err(EngineError::LimitExceeded("exception reason too long"));
    }
    match (draft.opening, draft.closing) {
        (Some(opening), Some(closing)) if opening >= closing => Err(EngineError::Validation(
            "opening must be before closing".into(),
        )),
        (Some(_), None) | (None, Some(_)) => Err(EngineError::Validation(
            "special hours need both opening and closing".into(),
        )),
        _ => Ok(()),
    }
}

fn active_room(rs: &RoomState) -> Result<(), EngineError> {
    if !rs.room.is_active() {
        return Err(EngineError::not_found("room", rs.room.id));
    }
    Ok(())
}

fn check_calendar_capacity(rs: &RoomState) -> Result<(), EngineError> {
    if rs.calendar_len() >= MAX_CALENDAR_ENTRIES_PER_ROOM {
        return Err(EngineError::LimitExceeded("too many calendar entries on room"));
    }
    Ok(())
}

impl Engine {
    // ── Rooms ────────────────────────────────────────────────

    pub async fn create_room(
        &self,
        id: Ulid,
        draft: RoomDraft,
        actor: Actor,
    ) -> Result<Room, EngineError> {
        validate_room(&draft)?;
        let _catalog = self.catalog_lock.lock().await;
        if self.state.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let now = Utc::now();
        let room = Room {
            id,
            name: draft.name,
            capacity: draft.capacity,
            department: draft.department,
            created_by: actor.id,
            updated_by: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            deleted_by: None,
        };
        let event = Event::RoomSaved { room: room.clone() };
        self.wal_append(&event).await?;
        self.state
            .insert(id, Arc::new(RwLock::new(RoomState::new(room.clone()))));
        info!(room = %id, name = %room.name, actor = actor.id, "room created");
        Ok(room)
    }

    pub async fn update_room(
        &self,
        id: Ulid,
        patch: RoomPatch,
        actor: Actor,
    ) -> Result<Room, EngineError> {
        let mut guard = self.room_write(id).await?;
        active_room(&guard)?;
        let draft = patch.apply_to(&guard.room);
        validate_room(&draft)?;

        let room = Room {
            name: draft.name,
            capacity: draft.capacity,
            department: draft.department,
            updated_by: Some(actor.id),
            updated_at: Utc::now(),
            ..guard.room.clone()
        };
        let event = Event::RoomSaved { room: room.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(room)
    }

    /// Soft delete. Refused while any reservation in the room is still active.
    pub async fn delete_room(&self, id: Ulid, actor: Actor) -> Result<Room, EngineError> {
        let mut guard = self.room_write(id).await?;
        active_room(&guard)?;
        if guard.has_active_reservations() {
            return Err(EngineError::RoomInUse(id));
        }

        let now = Utc::now();
        let room = Room {
            updated_by: Some(actor.id),
            updated_at: now,
            deleted_at: Some(now),
            deleted_by: Some(actor.id),
            ..guard.room.clone()
        };
        let event = Event::RoomSaved { room: room.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(room = %id, actor = actor.id, "room deleted");
        Ok(room)
    }

    // ── Operating hours ──────────────────────────────────────

    pub async fn create_operating_hour(
        &self,
        id: Ulid,
        draft: OperatingHourDraft,
        actor: Actor,
    ) -> Result<OperatingHour, EngineError> {
        validate_hour(&draft)?;
        let mut guard = self.room_write(draft.room_id).await?;
        active_room(&guard)?;
        check_calendar_capacity(&guard)?;
        if self.entity_to_room.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if guard.active_hour(draft.weekday).is_some() {
            return Err(EngineError::Validation(format!(
                "room already has operating hours for weekday {}",
                draft.weekday
            )));
        }

        let now = Utc::now();
        let hour = OperatingHour {
            id,
            room_id: draft.room_id,
            weekday: draft.weekday,
            opening: draft.opening,
            closing: draft.closing,
            max_duration_minutes: draft.max_duration_minutes,
            created_by: actor.id,
            updated_by: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            deleted_by: None,
        };
        let event = Event::OperatingHourSaved { hour: hour.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(hour)
    }

    pub async fn update_operating_hour(
        &self,
        id: Ulid,
        patch: OperatingHourPatch,
        actor: Actor,
    ) -> Result<OperatingHour, EngineError> {
        let (_, mut guard) = self.resolve_entity_write(&id, "operating hour").await?;
        let current = guard
            .hours
            .iter()
            .find(|h| h.id == id && h.is_active())
            .cloned()
            .ok_or_else(|| EngineError::not_found("operating hour", id))?;
        let draft = patch.apply_to(&current);
        validate_hour(&draft)?;
        if guard
            .active_hour(draft.weekday)
            .is_some_and(|other| other.id != id)
        {
            return Err(EngineError::Validation(format!(
                "room already has operating hours for weekday {}",
                draft.weekday
            )));
        }

        let hour = OperatingHour {
            weekday: draft.weekday,
            opening: draft.opening,
            closing: draft.closing,
            max_duration_minutes: draft.max_duration_minutes,
            updated_by: Some(actor.id),
            updated_at: Utc::now(),
            ..current
        };
        let event = Event::OperatingHourSaved { hour: hour.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(hour)
    }

    pub async fn delete_operating_hour(
        &self,
        id: Ulid,
        actor: Actor,
    ) -> Result<OperatingHour, EngineError> {
        let (_, mut guard) = self.resolve_entity_write(&id, "operating hour").await?;
        let current = guard
            .hours
            .iter()
            .find(|h| h.id == id && h.is_active())
            .cloned()
            .ok_or_else(|| EngineError::not_found("operating hour", id))?;

        let now = Utc::now();
        let hour = OperatingHour {
            updated_by: Some(actor.id),
            updated_at: now,
            deleted_at: Some(now),
            deleted_by: Some(actor.id),
            ..current
        };
        let event = Event::OperatingHourSaved { hour: hour.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(hour)
    }

    // ── Exceptions ───────────────────────────────────────────

    pub async fn create_exception(
        &self,
        id: Ulid,
        draft: ExceptionDraft,
        actor: Actor,
    ) -> Result<RoomException, EngineError> {
        validate_exception(&draft)?;
        let mut guard = self.room_write(draft.room_id).await?;
        active_room(&guard)?;
        check_calendar_capacity(&guard)?;
        if self.entity_to_room.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if guard.active_exception(draft.date).is_some() {
            return Err(EngineError::Validation(format!(
                "room already has an exception on {}",
                draft.date
            )));
        }

        let now = Utc::now();
        let exception = RoomException {
            id,
            room_id: draft.room_id,
            date: draft.date,
            reason: draft.reason,
            opening: draft.opening,
            closing: draft.closing,
            created_by: actor.id,
            updated_by: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            deleted_by: None,
        };
        let event = Event::ExceptionSaved {
            exception: exception.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(exception)
    }

    pub async fn update_exception(
        &self,
        id: Ulid,
        patch: ExceptionPatch,
        actor: Actor,
    ) -> Result<RoomException, EngineError> {
        let (_, mut guard) = self.resolve_entity_write(&id, "exception").await?;
        let current = guard
            .exceptions
            .iter()
            .find(|e| e.id == id && e.is_active())
            .cloned()
            .ok_or_else(|| EngineError::not_found("exception", id))?;
        let draft = patch.apply_to(&current);
        validate_exception(&draft)?;
        if guard
            .active_exception(draft.date)
            .is_some_and(|other| other.id != id)
        {
            return Err(EngineError::Validation(format!(
                "room already has an exception on {}",
                draft.date
            )));
        }

        let exception = RoomException {
            date: draft.date,
            reason: draft.reason,
            opening: draft.opening,
            closing: draft.closing,
            updated_by: Some(actor.id),
            updated_at: Utc::now(),
            ..current
        };
        let event = Event::ExceptionSaved {
            exception: exception.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(exception)
    }

    pub async fn delete_exception(
        &self,
        id: Ulid,
        actor: Actor,
    ) -> Result<RoomException, EngineError> {
        let (_, mut guard) = self.resolve_entity_write(&id, "exception").await?;
        let current = guard
            .exceptions
            .iter()
            .find(|e| e.id == id && e.is_active())
            .cloned()
            .ok_or_else(|| EngineError::not_found("exception", id))?;

        let now = Utc::now();
        let exception = RoomException {
            updated_by: Some(actor.id),
            updated_at: now,
            deleted_at: Some(now),
            deleted_by: Some(actor.id),
            ..current
        };
        let event = Event::ExceptionSaved {
            exception: exception.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(exception)
    }
}
