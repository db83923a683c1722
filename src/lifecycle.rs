//! Booking states and the transitions allowed between them.
//!
//! ```text
//! Pending ──► Confirmed ──► Cancelled
//!    └───────────────────────▲
//! ```
//!
//! Admission creates bookings directly in `Confirmed`. `Pending` is declared
//! for an approval step that does not exist yet and is never produced.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
}

/// Outcome of a legal transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The status changed to the contained value and must be persisted.
    Applied(BookingStatus),
    /// Cancelling an already cancelled booking. Nothing to persist.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    #[error("unknown booking status: {0}")]
    UnknownStatus(String),
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    /// Active bookings occupy their interval on the room.
    pub fn is_active(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Cancelled)
    }

    pub fn transition(self, to: BookingStatus) -> Result<Transition, LifecycleError> {
        use BookingStatus::*;
        match (self, to) {
            (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Cancelled) => {
                Ok(Transition::Applied(to))
            }
            (Cancelled, Cancelled) => Ok(Transition::Unchanged),
            (from, to) => Err(LifecycleError::InvalidTransition { from, to }),
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BookingStatus {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "cancelled" => Ok(BookingStatus::Cancelled),
            _ => Err(LifecycleError::UnknownStatus(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BookingStatus::*;

    #[test]
    fn declared_transitions_apply() {
        assert_eq!(Pending.transition(Confirmed), Ok(Transition::Applied(Confirmed)));
        assert_eq!(Pending.transition(Cancelled), Ok(Transition::Applied(Cancelled)));
        assert_eq!(Confirmed.transition(Cancelled), Ok(Transition::Applied(Cancelled)));
    }

    #[test]
    fn cancel_is_idempotent() {
        assert_eq!(Cancelled.transition(Cancelled), Ok(Transition::Unchanged));
    }

    #[test]
    fn cancelled_is_terminal() {
        for to in [Pending, Confirmed] {
            assert_eq!(
                Cancelled.transition(to),
                Err(LifecycleError::InvalidTransition { from: Cancelled, to })
            );
        }
        assert!(Cancelled.is_terminal());
    }

    #[test]
    fn no_backwards_or_self_moves() {
        assert!(Confirmed.transition(Pending).is_err());
        assert!(Confirmed.transition(Confirmed).is_err());
        assert!(Pending.transition(Pending).is_err());
    }

    #[test]
    fn only_pending_and_confirmed_are_active() {
        assert!(Pending.is_active());
        assert!(Confirmed.is_active());
        assert!(!Cancelled.is_active());
    }

    #[test]
    fn parse_status() {
        assert_eq!(" Confirmed ".parse::<BookingStatus>().unwrap(), Confirmed);
        assert_eq!("cancelled".parse::<BookingStatus>().unwrap(), Cancelled);
        assert!(matches!(
            "approved".parse::<BookingStatus>(),
            Err(LifecycleError::UnknownStatus(_))
        ));
    }

    #[test]
    fn error_message_names_both_states() {
        let err = Cancelled.transition(Confirmed).unwrap_err();
        assert_eq!(err.to_string(), "invalid transition: cancelled -> confirmed");
    }
}
