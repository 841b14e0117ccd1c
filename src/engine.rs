mod calendar;
mod catalog;
mod code;
mod error;
mod lifecycle;
mod policy;
mod queries;
#[cfg(test)]
mod tests;

pub use calendar::{ClosedReason, EffectiveHours, effective_hours, is_open, weekday_of};
pub use code::{CodeSource, UlidCodes};
pub use error::{EngineError, ErrorKind};
pub use policy::{Admission, admit};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush the batch first, then handle the non-append command
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush of {} events failed: {e}", batch.len());
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so buffered bytes do not leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: &mut Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// The booking store: one locked [`RoomState`] per room, made durable by the WAL.
pub struct Engine {
    pub state: DashMap<Ulid, SharedRoomState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: hour / exception / reservation id → room id.
    pub(super) entity_to_room: DashMap<Ulid, Ulid>,
    /// Every reservation code ever issued → reservation id.
    pub(super) codes: DashMap<String, Ulid>,
    pub(super) code_source: Arc<dyn CodeSource>,
    /// Serialises room creation against compaction snapshots.
    pub(super) catalog_lock: Mutex<()>,
}

/// Apply an event to a RoomState (no locking; caller holds the lock).
///
/// A `ReservationAdmitted` that moved rooms is applied to the destination only;
/// the caller detaches the record from `moved_from`.
fn apply_to_room(
    rs: &mut RoomState,
    event: &Event,
    entity_map: &DashMap<Ulid, Ulid>,
    codes: &DashMap<String, Ulid>,
) {
    match event {
        Event::RoomSaved { room } => {
            rs.room = room.clone();
        }
        Event::OperatingHourSaved { hour } => {
            rs.upsert_hour(hour.clone());
            entity_map.insert(hour.id, hour.room_id);
        }
        Event::ExceptionSaved { exception } => {
            rs.upsert_exception(exception.clone());
            entity_map.insert(exception.id, exception.room_id);
        }
        Event::ReservationAdmitted {
            reservation,
            preempted,
            ..
        } => {
            for loser_id in preempted {
                if let Some(loser) = rs.reservation_mut(*loser_id)
                    && loser.is_active()
                {
                    loser.cancelled_at = Some(reservation.updated_at);
                    loser.cancelled_by = Some(reservation.last_actor());
                    loser.preempted_by = Some(reservation.code.clone());
                }
            }
            rs.remove_reservation(reservation.id);
            rs.insert_reservation(reservation.clone());
            entity_map.insert(reservation.id, reservation.room_id);
            codes.insert(reservation.code.clone(), reservation.id);
        }
        Event::ReservationCancelled { id, at, by, .. } => {
            if let Some(r) = rs.reservation_mut(*id)
                && r.is_active()
            {
                r.cancelled_at = Some(*at);
                r.cancelled_by = Some(*by);
            }
        }
    }
}

fn replay_contended(room_id: Ulid) -> io::Error {
    io::Error::other(format!("replay: room {room_id} locked during startup"))
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        Self::with_code_source(wal_path, Arc::new(UlidCodes::new()))
    }

    pub fn with_code_source(wal_path: PathBuf, code_source: Arc<dyn CodeSource>) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            entity_to_room: DashMap::new(),
            codes: DashMap::new(),
            code_source,
            catalog_lock: Mutex::new(()),
        };

        // Replay: we are the sole owner of these Arcs, so try_write never contends.
        // Never use blocking_write here, this may run inside an async context.
        for event in &events {
            if let Event::RoomSaved { room } = event
                && !engine.state.contains_key(&room.id)
            {
                engine
                    .state
                    .insert(room.id, Arc::new(RwLock::new(RoomState::new(room.clone()))));
                continue;
            }

            if let Event::ReservationAdmitted {
                reservation,
                moved_from: Some(old_room),
                ..
            } = event
                && let Some(old) = engine.room_state(old_room)
            {
                let mut guard = old.try_write().map_err(|_| replay_contended(*old_room))?;
                guard.remove_reservation(reservation.id);
            }

            let room_id = event.room_id();
            if let Some(rs) = engine.room_state(&room_id) {
                let mut guard = rs.try_write().map_err(|_| replay_contended(room_id))?;
                apply_to_room(&mut guard, event, &engine.entity_to_room, &engine.codes);
            }
        }

        tracing::info!(
            "replayed {} events into {} rooms from {}",
            events.len(),
            engine.state.len(),
            wal_path.display()
        );
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn room_state(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn room_of_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_room.get(entity_id).map(|e| *e.value())
    }

    /// WAL-append + apply in one call.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut RoomState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_room(rs, event, &self.entity_to_room, &self.codes);
        Ok(())
    }

    pub(super) fn apply_locked(&self, rs: &mut RoomState, event: &Event) {
        apply_to_room(rs, event, &self.entity_to_room, &self.codes);
    }

    pub(super) async fn room_write(
        &self,
        room_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<RoomState>, EngineError> {
        let rs = self
            .room_state(&room_id)
            .ok_or_else(|| EngineError::not_found("room", room_id))?;
        Ok(rs.write_owned().await)
    }

    /// Lookup entity → room, acquire the room's write lock.
    ///
    /// Reservations can move between rooms, so the mapping is checked again once
    /// the lock is held and the lookup retried if it changed underneath us.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
        what: &str,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<RoomState>), EngineError> {
        loop {
            let room_id = self
                .room_of_entity(entity_id)
                .ok_or_else(|| EngineError::not_found(what, entity_id))?;
            let guard = self.room_write(room_id).await?;
            if self.room_of_entity(entity_id) == Some(room_id) {
                return Ok((room_id, guard));
            }
        }
    }

    /// Reservation id for an issued code.
    pub(super) fn resolve_code(&self, code: &str) -> Result<Ulid, EngineError> {
        self.codes
            .get(code)
            .map(|e| *e.value())
            .ok_or_else(|| EngineError::not_found("reservation", code))
    }
}
