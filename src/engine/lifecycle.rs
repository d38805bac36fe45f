//! Booking status machine.
//!
//! ```text
//! (new) ──► pending ──► confirmed ──► checked_in
//!   │          │            │
//!   └──────────┴──► cancelled ◄┘ (before start only)
//! ```
//!
//! `checked_in` and `cancelled` are terminal.

use crate::model::*;

use super::EngineError;

/// Guard for the initial status of a new booking.
pub(crate) fn check_creation(caller: &Caller, status: BookingStatus) -> Result<(), EngineError> {
    match status {
        BookingStatus::Pending => Ok(()),
        BookingStatus::Confirmed if caller.is_admin() => Ok(()),
        BookingStatus::Confirmed => Err(EngineError::Forbidden(
            "only admins can create confirmed bookings",
        )),
        to => Err(EngineError::InvalidTransition {
            from: None,
            to,
            reason: "new bookings start as pending or confirmed",
        }),
    }
}

/// Guard for moving `booking` to `to` at instant `now`.
pub(crate) fn check_transition(
    caller: &Caller,
    booking: &Booking,
    to: BookingStatus,
    now: Ms,
) -> Result<(), EngineError> {
    if !caller.may_act_for(booking.member_id) {
        return Err(EngineError::Forbidden("booking belongs to another member"));
    }
    let from = booking.effective_status(now);
    let invalid = |reason| EngineError::InvalidTransition {
        from: Some(from),
        to,
        reason,
    };

    match (from, to) {
        (BookingStatus::Cancelled | BookingStatus::CheckedIn, _) => Err(invalid("terminal state")),
        (f, t) if f == t => Err(invalid("already in this state")),
        (BookingStatus::Pending, BookingStatus::Confirmed) => {
            if caller.is_admin() {
                Ok(())
            } else {
                Err(EngineError::Forbidden("approval requires an admin"))
            }
        }
        (BookingStatus::Pending, BookingStatus::Cancelled) => Ok(()),
        (BookingStatus::Pending, BookingStatus::CheckedIn) => Err(invalid("booking is not confirmed")),
        (BookingStatus::Confirmed, BookingStatus::Cancelled) => {
            if now < booking.span.start {
                Ok(())
            } else {
                Err(invalid("booking has already started"))
            }
        }
        (BookingStatus::Confirmed, BookingStatus::CheckedIn) => {
            if booking.span.contains_instant(now) {
                Ok(())
            } else {
                Err(invalid("check-in is only open during the booking"))
            }
        }
        (_, BookingStatus::Pending) => Err(invalid("bookings never return to pending")),
        _ => Err(invalid("transition not allowed")),
    }
}

/// Statuses a booking may still be edited (moved) in.
pub(crate) fn is_editable(booking: &Booking, now: Ms) -> bool {
    matches!(
        booking.effective_status(now),
        BookingStatus::Pending | BookingStatus::Confirmed
    )
}
