//! Role and ownership rules. Every check runs before any store write.

use thiserror::Error;
use ulid::Ulid;

use crate::model::Role;

/// The authenticated caller, as far as the core is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Room listings and room-scoped booking schedules.
    ReadCatalog,
    CreateBooking,
    ReadOwnBookings,
    ReadBooking { owner_id: Ulid },
    /// Status update or cancel.
    MutateBooking { owner_id: Ulid },
    ManageRooms,
    ManageUsers,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    #[error("authentication required")]
    Unauthenticated,
    #[error("forbidden: {0}")]
    Forbidden(&'static str),
}

pub fn authorize(actor: Option<&Actor>, action: Action) -> Result<(), AccessError> {
    if action == Action::ReadCatalog {
        return Ok(());
    }
    let actor = actor.ok_or(AccessError::Unauthenticated)?;
    match action {
        Action::ReadCatalog | Action::CreateBooking | Action::ReadOwnBookings => Ok(()),
        Action::ReadBooking { owner_id } => {
            if actor.is_admin() || actor.id == owner_id {
                Ok(())
            } else {
                Err(AccessError::Forbidden("not the owner of this booking"))
            }
        }
        Action::MutateBooking { owner_id } => {
            if actor.is_admin() || actor.id == owner_id {
                Ok(())
            } else {
                Err(AccessError::Forbidden("only the owner or an admin may change this booking"))
            }
        }
        Action::ManageRooms | Action::ManageUsers => {
            if actor.is_admin() {
                Ok(())
            } else {
                Err(AccessError::Forbidden("admin role required"))
            }
        }
    }
}
