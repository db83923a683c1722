//! The reservation service: the one entry point the request layer calls.
//!
//! Every operation runs guard → validation → store, in that order, so a
//! rejected caller or a malformed interval never reaches a store write.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};
use ulid::Ulid;

use crate::credential::{self, CredentialConfig, CredentialError};
use crate::engine::{Engine, EngineError};
use crate::guard::{authorize, AccessError, Action, Actor};
use crate::lifecycle::{BookingStatus, LifecycleError, Transition};
use crate::limits::*;
use crate::model::*;
use crate::password;

/// Coarse error classes exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Authentication,
    Forbidden,
    NotFound,
    Conflict,
    InvalidTransition,
    AlreadyExists,
    Internal,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("time slot already booked (conflicts with booking {0})")]
    Conflict(Ulid),
    #[error(transparent)]
    InvalidTransition(LifecycleError),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Validation(_) => ErrorKind::Validation,
            ServiceError::Authentication(_) => ErrorKind::Authentication,
            ServiceError::Forbidden(_) => ErrorKind::Forbidden,
            ServiceError::NotFound(_) => ErrorKind::NotFound,
            ServiceError::Conflict(_) => ErrorKind::Conflict,
            ServiceError::InvalidTransition(_) => ErrorKind::InvalidTransition,
            ServiceError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            ServiceError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<EngineError> for ServiceError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::NotFound(id) => ServiceError::NotFound(id.to_string()),
            EngineError::AlreadyExists(id) => ServiceError::AlreadyExists(id.to_string()),
            EngineError::EmailTaken(email) => ServiceError::AlreadyExists(email),
            EngineError::Conflict(id) => ServiceError::Conflict(id),
            EngineError::Lifecycle(LifecycleError::UnknownStatus(s)) => {
                ServiceError::Validation(format!("unknown booking status: {s}"))
            }
            EngineError::Lifecycle(e) => ServiceError::InvalidTransition(e),
            EngineError::LimitExceeded(msg) => ServiceError::Validation(msg.to_string()),
            EngineError::WalError(msg) | EngineError::Internal(msg) => ServiceError::Internal(msg),
        }
    }
}

impl From<AccessError> for ServiceError {
    fn from(e: AccessError) -> Self {
        match e {
            AccessError::Unauthenticated => ServiceError::Authentication(e.to_string()),
            AccessError::Forbidden(msg) => ServiceError::Forbidden(msg.to_string()),
        }
    }
}

impl From<CredentialError> for ServiceError {
    fn from(e: CredentialError) -> Self {
        match e {
            CredentialError::Expired | CredentialError::Invalid(_) => {
                ServiceError::Authentication(e.to_string())
            }
            CredentialError::Crypto(msg) => ServiceError::Internal(msg),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    /// Allow bookings on rooms whose active flag is off.
    pub admit_inactive_rooms: bool,
}

/// Unvalidated room fields as they arrive from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomDraft {
    pub name: String,
    pub description: Option<String>,
    pub capacity: i64,
    pub photo_url: Option<String>,
    pub is_active: bool,
}

impl RoomDraft {
    fn validate(self) -> Result<RoomInput, ServiceError> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(ServiceError::Validation("room name required".into()));
        }
        if self.capacity <= 0 {
            return Err(ServiceError::Validation("capacity must be > 0".into()));
        }
        let capacity = u32::try_from(self.capacity)
            .map_err(|_| ServiceError::Validation("capacity too large".into()))?;
        Ok(RoomInput {
            name,
            description: self.description,
            capacity,
            photo_url: self.photo_url,
            is_active: self.is_active,
        })
    }
}

fn normalize_email(email: &str) -> Result<String, ServiceError> {
    let email = email.trim().to_lowercase();
    if email.is_empty() {
        return Err(ServiceError::Validation("email required".into()));
    }
    if email.len() > MAX_EMAIL_LEN || !email.contains('@') {
        return Err(ServiceError::Validation("malformed email".into()));
    }
    Ok(email)
}

fn check_password(password: &str) -> Result<(), ServiceError> {
    if password.is_empty() {
        return Err(ServiceError::Validation("password required".into()));
    }
    if password.len() > MAX_PASSWORD_LEN {
        return Err(ServiceError::Validation("password too long".into()));
    }
    Ok(())
}

fn require(actor: Option<&Actor>) -> Result<&Actor, ServiceError> {
    actor.ok_or_else(|| AccessError::Unauthenticated.into())
}

pub struct ReservationService {
    engine: Arc<Engine>,
    credentials: CredentialConfig,
    config: ServiceConfig,
}

impl ReservationService {
    pub fn new(engine: Arc<Engine>, credentials: CredentialConfig, config: ServiceConfig) -> Self {
        Self {
            engine,
            credentials,
            config,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    // ── Identity ─────────────────────────────────────────────

    pub async fn register(&self, id: Ulid, email: &str, password: &str) -> Result<UserInfo, ServiceError> {
        self.register_as(id, email, password, Role::Standard).await
    }

    async fn register_as(
        &self,
        id: Ulid,
        email: &str,
        password: &str,
        role: Role,
    ) -> Result<UserInfo, ServiceError> {
        let email = normalize_email(email)?;
        check_password(password)?;
        let hash = hash_blocking(password.to_string()).await?;
        let user = self.engine.register_user(id, email, hash, role).await?;
        info!(user_id = %user.id, role = %user.role, "user registered");
        Ok(user)
    }

    /// Make sure an admin account exists for `email`, promoting an existing
    /// account if needed. Used to bootstrap the first administrator.
    pub async fn ensure_admin(&self, email: &str, password: &str) -> Result<UserInfo, ServiceError> {
        let normalized = normalize_email(email)?;
        match self.engine.user_by_email(&normalized) {
            Some(user) if user.role == Role::Admin => Ok(user.info()),
            Some(user) => {
                let info = self.engine.set_user_role(user.id, Role::Admin).await?;
                info!(user_id = %info.id, "existing user promoted to admin");
                Ok(info)
            }
            None => self.register_as(Ulid::new(), email, password, Role::Admin).await,
        }
    }

    /// Verify the password and issue a signed credential.
    pub async fn login(&self, email: &str, password: &str) -> Result<String, ServiceError> {
        let email = normalize_email(email)?;
        check_password(password)?;
        let Some(user) = self.engine.user_by_email(&email) else {
            return Err(ServiceError::Authentication("invalid credentials".into()));
        };
        if !verify_blocking(password.to_string(), user.password_hash.clone()).await? {
            warn!(user_id = %user.id, "login with wrong password");
            return Err(ServiceError::Authentication("invalid credentials".into()));
        }
        let actor = Actor {
            id: user.id,
            role: user.role,
        };
        Ok(credential::issue(&actor, &self.credentials)?)
    }

    /// Resolve a bearer credential to the actor it names.
    pub fn authenticate(&self, token: &str) -> Result<Actor, ServiceError> {
        Ok(credential::verify(token, &self.credentials)?)
    }

    pub async fn set_user_role(
        &self,
        actor: Option<&Actor>,
        user_id: Ulid,
        role: Role,
    ) -> Result<UserInfo, ServiceError> {
        authorize(actor, Action::ManageUsers)?;
        let info = self.engine.set_user_role(user_id, role).await?;
        info!(user_id = %user_id, role = %role, "user role changed");
        Ok(info)
    }

    // ── Rooms ────────────────────────────────────────────────

    pub async fn list_rooms(&self) -> Vec<RoomInfo> {
        self.engine.list_rooms().await
    }

    pub async fn get_room(&self, id: Ulid) -> Result<RoomInfo, ServiceError> {
        Ok(self.engine.get_room(id).await?)
    }

    pub async fn create_room(
        &self,
        actor: Option<&Actor>,
        id: Ulid,
        draft: RoomDraft,
    ) -> Result<RoomInfo, ServiceError> {
        authorize(actor, Action::ManageRooms)?;
        let input = draft.validate()?;
        Ok(self.engine.create_room(id, input).await?)
    }

    /// Replace every mutable field of a room.
    pub async fn update_room(
        &self,
        actor: Option<&Actor>,
        id: Ulid,
        draft: RoomDraft,
    ) -> Result<RoomInfo, ServiceError> {
        authorize(actor, Action::ManageRooms)?;
        let input = draft.validate()?;
        Ok(self.engine.update_room(id, input).await?)
    }

    pub async fn delete_room(&self, actor: Option<&Actor>, id: Ulid) -> Result<(), ServiceError> {
        authorize(actor, Action::ManageRooms)?;
        self.engine.delete_room(id).await?;
        info!(room_id = %id, "room deleted");
        Ok(())
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Admit a booking for the calling actor. The owner is always the caller.
    pub async fn create_booking(
        &self,
        actor: Option<&Actor>,
        id: Ulid,
        room_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Booking, ServiceError> {
        authorize(actor, Action::CreateBooking)?;
        let actor = require(actor)?;
        if end <= start {
            return Err(ServiceError::Validation("end must be after start".into()));
        }

        let span = Span::new(start, end);
        let result = self
            .engine
            .reserve(id, room_id, span, actor.id, !self.config.admit_inactive_rooms)
            .await;
        let booking = match result {
            Ok(b) => b,
            Err(EngineError::Conflict(existing)) => {
                metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                return Err(ServiceError::Conflict(existing));
            }
            Err(e) => return Err(e.into()),
        };

        metrics::counter!(crate::observability::BOOKINGS_CONFIRMED_TOTAL).increment(1);
        info!(
            booking_id = %booking.id,
            room_id = %booking.room_id,
            owner_id = %booking.owner_id,
            "booking confirmed"
        );
        Ok(booking)
    }

    /// Non-cancelled bookings on a room, start ascending. Public.
    pub async fn list_room_bookings(&self, room_id: Ulid) -> Result<Vec<Booking>, ServiceError> {
        authorize(None, Action::ReadCatalog)?;
        Ok(self.engine.list_by_room(room_id, true).await)
    }

    /// The caller's bookings of every status, start descending.
    pub async fn list_my_bookings(&self, actor: Option<&Actor>) -> Result<Vec<Booking>, ServiceError> {
        authorize(actor, Action::ReadOwnBookings)?;
        let actor = require(actor)?;
        Ok(self.engine.list_by_owner(actor.id).await)
    }

    pub async fn get_booking(&self, actor: Option<&Actor>, id: Ulid) -> Result<Booking, ServiceError> {
        require(actor)?;
        let booking = self.engine.get_booking(id).await?;
        authorize(actor, Action::ReadBooking { owner_id: booking.owner_id })?;
        Ok(booking)
    }

    pub async fn update_booking_status(
        &self,
        actor: Option<&Actor>,
        id: Ulid,
        status: BookingStatus,
    ) -> Result<Booking, ServiceError> {
        let caller = require(actor)?;
        let current = self.engine.get_booking(id).await?;
        authorize(actor, Action::MutateBooking { owner_id: current.owner_id })?;

        let (booking, transition) = self.engine.update_status(id, status).await?;
        if let Transition::Applied(status) = transition {
            info!(booking_id = %id, actor_id = %caller.id, status = %status, "booking status changed");
        }
        Ok(booking)
    }

    /// Cancel a booking. Cancelling twice is not an error.
    pub async fn cancel_booking(&self, actor: Option<&Actor>, id: Ulid) -> Result<Booking, ServiceError> {
        self.update_booking_status(actor, id, BookingStatus::Cancelled)
            .await
    }
}

async fn hash_blocking(password: String) -> Result<String, ServiceError> {
    tokio::task::spawn_blocking(move || password::hash_password(&password))
        .await
        .map_err(|e| ServiceError::Internal(format!("hash task failed: {e}")))?
        .map_err(ServiceError::from)
}

async fn verify_blocking(password: String, hash: String) -> Result<bool, ServiceError> {
    tokio::task::spawn_blocking(move || password::verify_password(&password, &hash))
        .await
        .map_err(|e| ServiceError::Internal(format!("verify task failed: {e}")))?
        .map_err(ServiceError::from)
}
