use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ulid::Ulid;

/// Secondary lookups over bookings: booking → room and owner → bookings.
///
/// Both maps are only written while the owning room's write lock is held,
/// so they never disagree with the room state for longer than one apply.
/// A booking id is claimed in `room_of` before admission, which keeps ids
/// unique across rooms whose locks are independent.
#[derive(Default)]
pub struct BookingIndex {
    room_of: DashMap<Ulid, Ulid>,
    by_owner: DashMap<Ulid, Vec<Ulid>>,
}

impl BookingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, booking_id: Ulid, room_id: Ulid, owner_id: Ulid) {
        self.room_of.insert(booking_id, room_id);
        self.by_owner.entry(owner_id).or_default().push(booking_id);
    }

    /// Reserve `booking_id` for `room_id`. False if any room already holds it.
    pub fn claim(&self, booking_id: Ulid, room_id: Ulid) -> bool {
        match self.room_of.entry(booking_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(room_id);
                true
            }
        }
    }

    /// Undo a `claim` whose admission failed.
    pub fn release(&self, booking_id: &Ulid, room_id: &Ulid) {
        self.room_of.remove_if(booking_id, |_, claimed| claimed == room_id);
    }

    pub fn remove(&self, booking_id: &Ulid, owner_id: &Ulid) {
        self.room_of.remove(booking_id);
        if let Some(mut ids) = self.by_owner.get_mut(owner_id) {
            ids.retain(|id| id != booking_id);
        }
        self.by_owner.remove_if(owner_id, |_, ids| ids.is_empty());
    }

    pub fn room_of(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.room_of.get(booking_id).map(|e| *e.value())
    }

    pub fn contains(&self, booking_id: &Ulid) -> bool {
        self.room_of.contains_key(booking_id)
    }

    /// `(booking_id, room_id)` pairs for every booking the owner holds.
    pub fn owned_by(&self, owner_id: &Ulid) -> Vec<(Ulid, Ulid)> {
        let ids = self
            .by_owner
            .get(owner_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        ids.into_iter()
            .filter_map(|id| self.room_of(&id).map(|rid| (id, rid)))
            .collect()
    }
}
