use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::lifecycle::BookingStatus;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

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

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching spans (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "user")]
    Standard,
    #[serde(rename = "admin")]
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Standard => "user",
            Role::Admin => "admin",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "user" | "standard" => Ok(Role::Standard),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Booking {
    pub id: Ulid,
    pub room_id: Ulid,
    pub owner_id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
    pub created_at: Ms,
}

/// Mutable room fields. An update replaces all of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInput {
    pub name: String,
    pub description: Option<String>,
    pub capacity: u32,
    pub photo_url: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct RoomState {
    pub id: Ulid,
    pub name: String,
    pub description: Option<String>,
    /// Stored for display; admission never counts occupants.
    pub capacity: u32,
    pub photo_url: Option<String>,
    pub is_active: bool,
    pub created_at: Ms,
    /// Set once the room has been deleted. Writers that raced the delete
    /// observe it after acquiring the lock.
    pub retired: bool,
    /// Longest booking ever inserted; bounds the backwards part of the scan.
    pub longest: Ms,
    /// All bookings of any status, sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl RoomState {
    pub fn new(id: Ulid, input: RoomInput, created_at: Ms) -> Self {
        Self {
            id,
            name: input.name,
            description: input.description,
            capacity: input.capacity,
            photo_url: input.photo_url,
            is_active: input.is_active,
            created_at,
            retired: false,
            longest: 0,
            bookings: Vec::new(),
        }
    }

    pub fn replace(&mut self, input: RoomInput) {
        self.name = input.name;
        self.description = input.description;
        self.capacity = input.capacity;
        self.photo_url = input.photo_url;
        self.is_active = input.is_active;
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        self.longest = self.longest.max(booking.span.duration_ms());
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    /// Bookings of any status whose span overlaps the query window.
    ///
    /// Nothing starting at or after `query.end` can overlap, and nothing
    /// starting at or before `query.start - longest` can reach into the
    /// window, so both ends are cut with a binary search.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        let earliest = query.start.saturating_sub(self.longest);
        let left_bound = self.bookings[..right_bound]
            .partition_point(|b| b.span.start <= earliest);
        self.bookings[left_bound..right_bound]
            .iter()
            .filter(move |b| b.span.overlaps(query))
    }

    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            capacity: self.capacity,
            photo_url: self.photo_url.clone(),
            is_active: self.is_active,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: Ulid,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub created_at: Ms,
}

impl UserRecord {
    pub fn info(&self) -> UserInfo {
        UserInfo {
            id: self.id,
            email: self.email.clone(),
            role: self.role,
            created_at: self.created_at,
        }
    }
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: Ulid,
        email: String,
        password_hash: String,
        role: Role,
        created_at: Ms,
    },
    UserRoleChanged {
        id: Ulid,
        role: Role,
    },
    RoomCreated {
        id: Ulid,
        input: RoomInput,
        created_at: Ms,
    },
    RoomUpdated {
        id: Ulid,
        input: RoomInput,
    },
    RoomDeleted {
        id: Ulid,
    },
    BookingAdmitted {
        id: Ulid,
        room_id: Ulid,
        owner_id: Ulid,
        span: Span,
        status: BookingStatus,
        created_at: Ms,
    },
    BookingStatusChanged {
        id: Ulid,
        room_id: Ulid,
        status: BookingStatus,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub id: Ulid,
    pub name: String,
    pub description: Option<String>,
    pub capacity: u32,
    pub photo_url: Option<String>,
    pub is_active: bool,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub id: Ulid,
    pub email: String,
    pub role: Role,
    pub created_at: Ms,
}
