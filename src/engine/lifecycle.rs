use chrono::Utc;
use dashmap::mapref::entry::Entry;
use metrics::counter;
use tokio::sync::oneshot;
use tracing::{debug, error, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{
    ADMISSIONS_TOTAL, CANCELLATIONS_TOTAL, PREEMPTIONS_TOTAL, REJECTIONS_TOTAL,
};

use super::calendar::is_open;
use super::policy::{Admission, admit};
use super::{Engine, EngineError, ErrorKind, WalCommand};

/// Reject malformed input before any state is consulted.
pub(super) fn validate_draft(draft: &ReservationDraft) -> Result<(), EngineError> {
    if draft.purpose.trim().is_empty() {
        return Err(EngineError::Validation("purpose must not be empty".into()));
    }
    if draft.purpose.chars().count() > MAX_PURPOSE_LEN {
        return Err(EngineError::LimitExceeded("purpose too long"));
    }
    if draft.start >= draft.end {
        return Err(EngineError::Validation("start must be before end".into()));
    }
    let end = draft.end.with_timezone(draft.start.offset());
    if draft.start.date_naive() != end.date_naive() {
        return Err(EngineError::Validation(
            "reservation must start and end on the same date".into(),
        ));
    }
    Ok(())
}

/// Calendar, then overlap, then policy. Returns the ids to preempt.
fn decide(
    rs: &RoomState,
    draft: &ReservationDraft,
    exclude: Option<Ulid>,
) -> Result<Vec<Ulid>, EngineError> {
    if !rs.room.is_active() {
        return Err(EngineError::not_found("room", rs.room.id));
    }
    is_open(rs, &draft.start, &draft.end).map_err(|reason| EngineError::Unavailable(reason.to_string()))?;

    let span = Span::of_window(&draft.start, &draft.end);
    match admit(draft.priority, rs.find_overlapping(&span, exclude)) {
        Admission::Admit { preempt } => Ok(preempt),
        Admission::Reject { blocking_code } => Err(EngineError::Conflict { blocking_code }),
    }
}

fn active_reservation(rs: &RoomState, id: Ulid, code: &str) -> Result<Reservation, EngineError> {
    rs.reservation(id)
        .filter(|r| r.is_active())
        .cloned()
        .ok_or_else(|| EngineError::not_found("reservation", code))
}

fn revised(current: &Reservation, draft: ReservationDraft, actor: Actor) -> Reservation {
    Reservation {
        room_id: draft.room_id,
        group_id: draft.group_id,
        link_id: draft.link_id,
        start: draft.start,
        end: draft.end,
        purpose: draft.purpose,
        priority: draft.priority,
        updated_by: Some(actor.id),
        updated_at: Utc::now(),
        ..current.clone()
    }
}

fn check_room_capacity(rs: &RoomState) -> Result<(), EngineError> {
    if rs.reservations.len() >= MAX_RESERVATIONS_PER_ROOM {
        return Err(EngineError::LimitExceeded("too many reservations in room"));
    }
    Ok(())
}

fn log_admission(op: &str, event: &Event) {
    let Event::ReservationAdmitted {
        reservation,
        moved_from,
        preempted,
    } = event
    else {
        return;
    };
    info!(
        code = %reservation.code,
        room = %reservation.room_id,
        priority = reservation.priority,
        actor = reservation.last_actor(),
        "reservation {op}d"
    );
    if let Some(from) = moved_from {
        info!(code = %reservation.code, "moved from room {from}");
    }
    if !preempted.is_empty() {
        counter!(PREEMPTIONS_TOTAL).increment(preempted.len() as u64);
        info!(
            code = %reservation.code,
            "preempted {} lower priority reservation(s)",
            preempted.len()
        );
    }
}

fn record_outcome(op: &'static str, result: &Result<Reservation, EngineError>) {
    match result {
        Ok(_) => counter!(ADMISSIONS_TOTAL, "op" => op).increment(1),
        Err(e) => {
            counter!(REJECTIONS_TOTAL, "kind" => e.kind().as_str()).increment(1);
            if e.kind() == ErrorKind::Persistence {
                error!("{op} reservation failed: {e}");
            } else {
                debug!("{op} reservation rejected: {e}");
            }
        }
    }
}

impl Engine {
    /// Admit a new reservation, preempting lower priority ones in its way.
    pub async fn create_reservation(
        &self,
        draft: ReservationDraft,
        actor: Actor,
    ) -> Result<Reservation, EngineError> {
        let result = self.admit_new(draft, actor).await;
        record_outcome("create", &result);
        result
    }

    async fn admit_new(
        &self,
        draft: ReservationDraft,
        actor: Actor,
    ) -> Result<Reservation, EngineError> {
        validate_draft(&draft)?;
        let code = self.code_source.next_code();

        let mut guard = self.room_write(draft.room_id).await?;
        check_room_capacity(&guard)?;
        let preempted = decide(&guard, &draft, None)?;

        let now = Utc::now();
        let reservation = Reservation {
            id: Ulid::new(),
            code,
            room_id: draft.room_id,
            group_id: draft.group_id,
            link_id: draft.link_id,
            start: draft.start,
            end: draft.end,
            purpose: draft.purpose,
            priority: draft.priority,
            created_by: actor.id,
            updated_by: None,
            created_at: now,
            updated_at: now,
            cancelled_at: None,
            cancelled_by: None,
            preempted_by: None,
        };
        self.claim_code(&reservation)?;

        let event = Event::ReservationAdmitted {
            reservation: reservation.clone(),
            moved_from: None,
            preempted,
        };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            self.codes.remove(&reservation.code);
            return Err(e);
        }
        log_admission("create", &event);
        Ok(reservation)
    }

    /// Codes are never reused, not even those of cancelled reservations.
    fn claim_code(&self, reservation: &Reservation) -> Result<(), EngineError> {
        match self.codes.entry(reservation.code.clone()) {
            Entry::Occupied(_) => {
                error!("code source repeated reservation code {}", reservation.code);
                Err(EngineError::DuplicateCode(reservation.code.clone()))
            }
            Entry::Vacant(slot) => {
                slot.insert(reservation.id);
                Ok(())
            }
        }
    }

    /// Re-run admission for an edited reservation. The record being edited
    /// never conflicts with itself. Changing `room_id` moves it.
    pub async fn update_reservation(
        &self,
        code: &str,
        patch: ReservationPatch,
        actor: Actor,
    ) -> Result<Reservation, EngineError> {
        let result = self.readmit(code, patch, actor).await;
        record_outcome("update", &result);
        result
    }

    async fn readmit(
        &self,
        code: &str,
        patch: ReservationPatch,
        actor: Actor,
    ) -> Result<Reservation, EngineError> {
        let id = self.resolve_code(code)?;

        loop {
            let source_id = self
                .room_of_entity(&id)
                .ok_or_else(|| EngineError::not_found("reservation", code))?;
            let target_id = patch.room_id.unwrap_or(source_id);

            if target_id == source_id {
                let mut guard = self.room_write(source_id).await?;
                if self.room_of_entity(&id) != Some(source_id) {
                    continue;
                }
                let current = active_reservation(&guard, id, code)?;
                let draft = patch.clone().apply_to(&current);
                validate_draft(&draft)?;
                let preempted = decide(&guard, &draft, Some(id))?;

                let reservation = revised(&current, draft, actor);
                let event = Event::ReservationAdmitted {
                    reservation: reservation.clone(),
                    moved_from: None,
                    preempted,
                };
                self.persist_and_apply(&mut guard, &event).await?;
                log_admission("update", &event);
                return Ok(reservation);
            }

            // Moving rooms: lock both in id order to prevent deadlocks.
            let (first, second) = if source_id < target_id {
                (source_id, target_id)
            } else {
                (target_id, source_id)
            };
            let first_guard = self.room_write(first).await?;
            let second_guard = self.room_write(second).await?;
            let (mut source, mut target) = if first == source_id {
                (first_guard, second_guard)
            } else {
                (second_guard, first_guard)
            };
            if self.room_of_entity(&id) != Some(source_id) {
                continue;
            }

            let current = active_reservation(&source, id, code)?;
            let draft = patch.clone().apply_to(&current);
            validate_draft(&draft)?;
            check_room_capacity(&target)?;
            let preempted = decide(&target, &draft, Some(id))?;

            let reservation = revised(&current, draft, actor);
            let event = Event::ReservationAdmitted {
                reservation: reservation.clone(),
                moved_from: Some(source_id),
                preempted,
            };
            self.wal_append(&event).await?;
            source.remove_reservation(id);
            self.apply_locked(&mut target, &event);
            log_admission("update", &event);
            return Ok(reservation);
        }
    }

    /// Soft-cancel. Cancelling twice returns the record as first cancelled.
    pub async fn cancel_reservation(
        &self,
        code: &str,
        actor: Actor,
    ) -> Result<Reservation, EngineError> {
        let id = self.resolve_code(code)?;
        let (room_id, mut guard) = self.resolve_entity_write(&id, "reservation").await?;
        let current = guard
            .reservation(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("reservation", code))?;
        if !current.is_active() {
            debug!(code, "reservation already cancelled");
            return Ok(current);
        }

        let event = Event::ReservationCancelled {
            id,
            room_id,
            at: Utc::now(),
            by: actor.id,
        };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            error!("cancel reservation {code} failed: {e}");
            return Err(e);
        }
        counter!(CANCELLATIONS_TOTAL).increment(1);
        info!(code, actor = actor.id, "reservation cancelled");

        guard
            .reservation(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("reservation", code))
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    /// Cancelled reservations are kept; they hold their codes and audit trail.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        let _catalog = self.catalog_lock.lock().await;

        let mut room_ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        room_ids.sort();
        let mut guards = Vec::with_capacity(room_ids.len());
        for id in &room_ids {
            if let Some(rs) = self.room_state(id) {
                guards.push(rs.read_owned().await);
            }
        }

        let mut events = Vec::new();
        for rs in &guards {
            events.push(Event::RoomSaved {
                room: rs.room.clone(),
            });
            for hour in &rs.hours {
                events.push(Event::OperatingHourSaved { hour: hour.clone() });
            }
            for exception in &rs.exceptions {
                events.push(Event::ExceptionSaved {
                    exception: exception.clone(),
                });
            }
            for reservation in &rs.reservations {
                events.push(Event::ReservationAdmitted {
                    reservation: reservation.clone(),
                    moved_from: None,
                    preempted: Vec::new(),
                });
            }
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        Ok(count)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
