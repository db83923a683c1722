use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use tracing::debug;
use ulid::Ulid;

use crate::lifecycle::{BookingStatus, Transition};
use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, now_ms, validate_span};
use super::{apply_to_room, detach, Engine, EngineError, WalCommand};

impl Engine {
    // ── Room catalog ─────────────────────────────────────────

    pub async fn create_room(self: &Arc<Self>, id: Ulid, input: RoomInput) -> Result<RoomInfo, EngineError> {
        check_room_input(&input)?;
        let engine = Arc::clone(self);
        detach(async move {
            let _catalog = engine.catalog_lock.lock().await;
            if engine.rooms.len() >= MAX_ROOMS {
                return Err(EngineError::LimitExceeded("too many rooms"));
            }
            if engine.rooms.contains_key(&id) {
                return Err(EngineError::AlreadyExists(id));
            }

            let created_at = now_ms();
            let event = Event::RoomCreated {
                id,
                input: input.clone(),
                created_at,
            };
            engine.wal_append(&event).await?;
            let rs = RoomState::new(id, input, created_at);
            let info = rs.info();
            engine.rooms.insert(id, Arc::new(RwLock::new(rs)));
            Ok(info)
        })
        .await
    }

    /// Replace every mutable field of the room.
    pub async fn update_room(self: &Arc<Self>, id: Ulid, input: RoomInput) -> Result<RoomInfo, EngineError> {
        check_room_input(&input)?;
        let guard = self.lock_room(&id).await?;
        let mut updated = guard.info();
        updated.name = input.name.clone();
        updated.description = input.description.clone();
        updated.capacity = input.capacity;
        updated.photo_url = input.photo_url.clone();
        updated.is_active = input.is_active;

        self.commit(guard, Event::RoomUpdated { id, input }).await?;
        Ok(updated)
    }

    /// Delete the room and every booking on it.
    pub async fn delete_room(self: &Arc<Self>, id: Ulid) -> Result<(), EngineError> {
        let engine = Arc::clone(self);
        detach(async move {
            let _catalog = engine.catalog_lock.lock().await;
            let mut guard = engine.lock_room(&id).await?;
            let event = Event::RoomDeleted { id };
            engine.wal_append(&event).await?;
            apply_to_room(&mut guard, &event, &engine.bookings);
            engine.rooms.remove(&id);
            debug!(room_id = %id, cascaded = guard.bookings.len(), "room deleted");
            Ok(())
        })
        .await
    }

    // ── Admission ────────────────────────────────────────────

    /// Admit a booking on `room_id` if no active booking overlaps `span`.
    ///
    /// Scan and insert happen under the room's write lock, so two
    /// overlapping requests for the same room can never both succeed.
    /// The id is claimed in the booking index first, so one id can't be
    /// admitted on two rooms at once. `span.start < span.end` is the
    /// caller's precondition.
    pub async fn reserve(
        self: &Arc<Self>,
        id: Ulid,
        room_id: Ulid,
        span: Span,
        owner_id: Ulid,
        require_active: bool,
    ) -> Result<Booking, EngineError> {
        validate_span(&span)?;
        let mut guard = self.lock_room(&room_id).await?;
        if require_active && !guard.is_active {
            return Err(EngineError::NotFound(room_id));
        }
        if !self.bookings.claim(id, room_id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if let Err(e) = check_admission(&guard, &span) {
            self.bookings.release(&id, &room_id);
            return Err(e);
        }

        let booking = Booking {
            id,
            room_id,
            owner_id,
            span,
            status: BookingStatus::Confirmed,
            created_at: now_ms(),
        };
        let event = Event::BookingAdmitted {
            id,
            room_id,
            owner_id,
            span,
            status: booking.status,
            created_at: booking.created_at,
        };

        // Same shape as `commit`, but a failed append gives the id back.
        let engine = Arc::clone(self);
        detach(async move {
            if let Err(e) = engine.wal_append(&event).await {
                engine.bookings.release(&id, &room_id);
                return Err(e);
            }
            apply_to_room(&mut guard, &event, &engine.bookings);
            Ok(booking)
        })
        .await
    }

    // ── Lifecycle ────────────────────────────────────────────

    /// Move a booking to `to`. The transition is checked under the room lock;
    /// an unchanged outcome writes nothing.
    pub async fn update_status(
        self: &Arc<Self>,
        id: Ulid,
        to: BookingStatus,
    ) -> Result<(Booking, Transition), EngineError> {
        let guard = self.lock_booking_room(&id).await?;
        let mut booking = guard
            .booking(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;

        let transition = booking.status.transition(to)?;
        let Transition::Applied(status) = transition else {
            return Ok((booking, transition));
        };

        let event = Event::BookingStatusChanged {
            id,
            room_id: booking.room_id,
            status,
        };
        self.commit(guard, event).await?;
        booking.status = status;
        Ok((booking, transition))
    }

    // ── Identity registry ────────────────────────────────────

    /// `email` must already be normalized.
    pub async fn register_user(
        self: &Arc<Self>,
        id: Ulid,
        email: String,
        password_hash: String,
        role: Role,
    ) -> Result<UserInfo, EngineError> {
        let engine = Arc::clone(self);
        detach(async move {
            let _registry = engine.registry_lock.lock().await;
            if engine.users.len() >= MAX_USERS {
                return Err(EngineError::LimitExceeded("too many users"));
            }
            if engine.emails.contains_key(&email) {
                return Err(EngineError::EmailTaken(email));
            }
            if engine.users.contains_key(&id) {
                return Err(EngineError::AlreadyExists(id));
            }

            let event = Event::UserRegistered {
                id,
                email,
                password_hash,
                role,
                created_at: now_ms(),
            };
            engine.wal_append(&event).await?;
            engine.apply_to_users(&event);
            engine
                .users
                .get(&id)
                .map(|u| u.info())
                .ok_or_else(|| EngineError::Internal("registered user missing".into()))
        })
        .await
    }

    pub async fn set_user_role(self: &Arc<Self>, id: Ulid, role: Role) -> Result<UserInfo, EngineError> {
        let engine = Arc::clone(self);
        detach(async move {
            let _registry = engine.registry_lock.lock().await;
            if !engine.users.contains_key(&id) {
                return Err(EngineError::NotFound(id));
            }
            let event = Event::UserRoleChanged { id, role };
            engine.wal_append(&event).await?;
            engine.apply_to_users(&event);
            engine
                .users
                .get(&id)
                .map(|u| u.info())
                .ok_or(EngineError::NotFound(id))
        })
        .await
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate current state.
    ///
    /// Holds both catalog locks and a read lock on every room until the
    /// writer has swapped the file, so no event can land in the old log
    /// after the snapshot was taken.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let _registry = self.registry_lock.lock().await;

        let mut events = Vec::new();

        let mut users: Vec<UserRecord> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        events.extend(users.into_iter().map(|u| Event::UserRegistered {
            id: u.id,
            email: u.email,
            password_hash: u.password_hash,
            role: u.role,
            created_at: u.created_at,
        }));

        let mut rooms: Vec<_> = self
            .rooms
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        rooms.sort_by_key(|(id, _)| *id);

        let mut guards = Vec::with_capacity(rooms.len());
        for (_, rs) in rooms {
            guards.push(rs.read_owned().await);
        }
        for rs in guards.iter().filter(|g| !g.retired) {
            events.push(Event::RoomCreated {
                id: rs.id,
                input: RoomInput {
                    name: rs.name.clone(),
                    description: rs.description.clone(),
                    capacity: rs.capacity,
                    photo_url: rs.photo_url.clone(),
                    is_active: rs.is_active,
                },
                created_at: rs.created_at,
            });
            events.extend(rs.bookings.iter().map(|b| Event::BookingAdmitted {
                id: b.id,
                room_id: b.room_id,
                owner_id: b.owner_id,
                span: b.span,
                status: b.status,
                created_at: b.created_at,
            }));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
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

fn check_admission(rs: &RoomState, span: &Span) -> Result<(), EngineError> {
    if rs.bookings.len() >= MAX_BOOKINGS_PER_ROOM {
        return Err(EngineError::LimitExceeded("too many bookings on room"));
    }
    check_no_conflict(rs, span)
}

fn check_room_input(input: &RoomInput) -> Result<(), EngineError> {
    if input.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("room name too long"));
    }
    if input
        .description
        .as_ref()
        .is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN)
    {
        return Err(EngineError::LimitExceeded("room description too long"));
    }
    if input
        .photo_url
        .as_ref()
        .is_some_and(|p| p.len() > MAX_PHOTO_URL_LEN)
    {
        return Err(EngineError::LimitExceeded("photo url too long"));
    }
    Ok(())
}
