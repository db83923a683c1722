use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// Live rooms ordered by id, which for ULIDs is creation order.
    pub async fn list_rooms(&self) -> Vec<RoomInfo> {
        let shared: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut rooms = Vec::with_capacity(shared.len());
        for rs in shared {
            let guard = rs.read().await;
            if !guard.retired {
                rooms.push(guard.info());
            }
        }
        rooms.sort_by_key(|r| r.id);
        rooms
    }

    pub async fn get_room(&self, id: Ulid) -> Result<RoomInfo, EngineError> {
        let rs = self.get_room_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        if guard.retired {
            return Err(EngineError::NotFound(id));
        }
        Ok(guard.info())
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let room_id = self.bookings.room_of(&id).ok_or(EngineError::NotFound(id))?;
        let rs = self
            .get_room_state(&room_id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        if guard.retired {
            return Err(EngineError::NotFound(id));
        }
        guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Bookings on a room by start ascending. An unknown room has none.
    pub async fn list_by_room(&self, room_id: Ulid, exclude_cancelled: bool) -> Vec<Booking> {
        let Some(rs) = self.get_room_state(&room_id) else {
            return Vec::new();
        };
        let guard = rs.read().await;
        if guard.retired {
            return Vec::new();
        }
        guard
            .bookings
            .iter()
            .filter(|b| !exclude_cancelled || b.status.is_active())
            .cloned()
            .collect()
    }

    /// Every booking the owner holds, any status, by start descending.
    pub async fn list_by_owner(&self, owner_id: Ulid) -> Vec<Booking> {
        let mut by_room: HashMap<Ulid, Vec<Ulid>> = HashMap::new();
        for (booking_id, room_id) in self.bookings.owned_by(&owner_id) {
            by_room.entry(room_id).or_default().push(booking_id);
        }

        let mut out = Vec::new();
        for (room_id, ids) in by_room {
            let Some(rs) = self.get_room_state(&room_id) else {
                continue;
            };
            let guard = rs.read().await;
            if guard.retired {
                continue;
            }
            out.extend(ids.iter().filter_map(|id| guard.booking(id).cloned()));
        }
        out.sort_by(|a, b| b.span.start.cmp(&a.span.start).then(b.id.cmp(&a.id)));
        out
    }

    pub fn user(&self, id: &Ulid) -> Option<UserRecord> {
        self.users.get(id).map(|e| e.value().clone())
    }

    /// `email` must already be normalized.
    pub fn user_by_email(&self, email: &str) -> Option<UserRecord> {
        let id = *self.emails.get(email)?.value();
        self.user(&id)
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}
