mod conflict;
mod error;
mod index;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use error::EngineError;
pub use index::BookingIndex;

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::info;
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
/// Blocks for the first Append, drains whatever else is already queued,
/// then pays one fsync for the whole batch and answers every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        respond_batch(batch, &result);

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so buffered bytes don't leak into
    // the next batch; every caller in this batch is told it failed.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
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
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// The reservation store.
///
/// Each room lives behind its own `RwLock`; admission holds the room's
/// write lock across the conflict scan, the WAL append and the in-memory
/// apply, so admissions on one room are serialized while different rooms
/// never contend.
pub struct Engine {
    pub(super) rooms: DashMap<Ulid, SharedRoomState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) bookings: BookingIndex,
    pub(super) users: DashMap<Ulid, UserRecord>,
    /// Normalized email → user id.
    pub(super) emails: DashMap<String, Ulid>,
    /// Serializes room create/delete so id checks and inserts can't interleave.
    pub(super) catalog_lock: Mutex<()>,
    /// Serializes registration so the email uniqueness check holds.
    pub(super) registry_lock: Mutex<()>,
}

/// Apply a room-scoped event. Caller holds the room's write lock.
fn apply_to_room(rs: &mut RoomState, event: &Event, index: &BookingIndex) {
    match event {
        Event::BookingAdmitted {
            id,
            room_id,
            owner_id,
            span,
            status,
            created_at,
        } => {
            rs.insert_booking(Booking {
                id: *id,
                room_id: *room_id,
                owner_id: *owner_id,
                span: *span,
                status: *status,
                created_at: *created_at,
            });
            index.insert(*id, *room_id, *owner_id);
        }
        Event::BookingStatusChanged { id, status, .. } => {
            if let Some(booking) = rs.booking_mut(id) {
                booking.status = *status;
            }
        }
        Event::RoomUpdated { input, .. } => rs.replace(input.clone()),
        Event::RoomDeleted { .. } => {
            rs.retired = true;
            for booking in &rs.bookings {
                index.remove(&booking.id, &booking.owner_id);
            }
        }
        // Room creation and users are handled at the map level.
        Event::RoomCreated { .. } | Event::UserRegistered { .. } | Event::UserRoleChanged { .. } => {}
    }
}

/// Run a mutation to completion on its own task.
///
/// Dropping the caller's future does not abort the mutation halfway, so a
/// WAL append is never left without its in-memory apply (or the reverse).
pub(super) async fn detach<T, F>(fut: F) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, EngineError>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(fut)
        .await
        .map_err(|e| EngineError::Internal(format!("mutation task failed: {e}")))?
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            rooms: DashMap::new(),
            wal_tx,
            bookings: BookingIndex::new(),
            users: DashMap::new(),
            emails: DashMap::new(),
            catalog_lock: Mutex::new(()),
            registry_lock: Mutex::new(()),
        };

        // We're the sole owner of every lock during replay, so try_write
        // always succeeds. Never block here: this may run inside a runtime.
        for event in &events {
            engine.replay_event(event)?;
        }
        info!(
            path = %wal_path.display(),
            events = events.len(),
            rooms = engine.rooms.len(),
            users = engine.users.len(),
            "engine recovered"
        );

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) -> io::Result<()> {
        match event {
            Event::UserRegistered { .. } | Event::UserRoleChanged { .. } => {
                self.apply_to_users(event);
            }
            Event::RoomCreated { id, input, created_at } => {
                let rs = RoomState::new(*id, input.clone(), *created_at);
                self.rooms.insert(*id, Arc::new(RwLock::new(rs)));
            }
            Event::RoomDeleted { id } => {
                if let Some((_, rs)) = self.rooms.remove(id) {
                    let mut guard = rs.try_write().map_err(io::Error::other)?;
                    apply_to_room(&mut guard, event, &self.bookings);
                }
            }
            Event::RoomUpdated { id: room_id, .. }
            | Event::BookingAdmitted { room_id, .. }
            | Event::BookingStatusChanged { room_id, .. } => {
                if let Some(rs) = self.get_room_state(room_id) {
                    let mut guard = rs.try_write().map_err(io::Error::other)?;
                    apply_to_room(&mut guard, event, &self.bookings);
                }
            }
        }
        Ok(())
    }

    fn apply_to_users(&self, event: &Event) {
        match event {
            Event::UserRegistered {
                id,
                email,
                password_hash,
                role,
                created_at,
            } => {
                self.emails.insert(email.clone(), *id);
                self.users.insert(
                    *id,
                    UserRecord {
                        id: *id,
                        email: email.clone(),
                        password_hash: password_hash.clone(),
                        role: *role,
                        created_at: *created_at,
                    },
                );
            }
            Event::UserRoleChanged { id, role } => {
                if let Some(mut user) = self.users.get_mut(id) {
                    user.role = *role;
                }
            }
            _ => {}
        }
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

    pub(super) fn get_room_state(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    /// Write-lock a room that must still be live.
    pub(super) async fn lock_room(
        &self,
        room_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<RoomState>, EngineError> {
        let rs = self
            .get_room_state(room_id)
            .ok_or(EngineError::NotFound(*room_id))?;
        let guard = rs.write_owned().await;
        if guard.retired {
            return Err(EngineError::NotFound(*room_id));
        }
        Ok(guard)
    }

    /// Booking id → its room, write-locked.
    pub(super) async fn lock_booking_room(
        &self,
        booking_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<RoomState>, EngineError> {
        let room_id = self
            .bookings
            .room_of(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let guard = self.lock_room(&room_id).await?;
        if guard.booking(booking_id).is_none() {
            return Err(EngineError::NotFound(*booking_id));
        }
        Ok(guard)
    }

    /// WAL-append then apply, on a detached task that owns the room guard.
    pub(super) async fn commit(
        self: &Arc<Self>,
        mut guard: OwnedRwLockWriteGuard<RoomState>,
        event: Event,
    ) -> Result<(), EngineError> {
        let engine = Arc::clone(self);
        detach(async move {
            engine.wal_append(&event).await?;
            apply_to_room(&mut guard, &event, &engine.bookings);
            Ok(())
        })
        .await
    }
}
