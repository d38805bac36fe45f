use ulid::Ulid;

use crate::model::{BookingStatus, Collision, InvalidInterval, Ms};

#[derive(Debug)]
pub enum EngineError {
    InvalidInterval { start: Ms, end: Ms },
    /// The requested span collides with these live bookings.
    Conflict(Vec<Collision>),
    /// `from` is `None` for a booking that does not exist yet.
    InvalidTransition {
        from: Option<BookingStatus>,
        to: BookingStatus,
        reason: &'static str,
    },
    NotFound(Ulid),
    Forbidden(&'static str),
    AlreadyExists(Ulid),
    Inactive(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidInterval { .. } => "invalid_interval",
            EngineError::Conflict(_) => "conflict",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::NotFound(_) => "not_found",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::Inactive(_) => "inactive",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl From<InvalidInterval> for EngineError {
    fn from(e: InvalidInterval) -> Self {
        EngineError::InvalidInterval { start: e.start, end: e.end }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInterval { start, end } => {
                write!(f, "invalid interval: end {end} is not after start {start}")
            }
            EngineError::Conflict(collisions) => {
                write!(f, "resource already booked:")?;
                for (i, c) in collisions.iter().enumerate() {
                    let sep = if i == 0 { " " } else { ", " };
                    write!(f, "{sep}booking {} {} by member {}", c.booking_id, c.span, c.member_id)?;
                }
                Ok(())
            }
            EngineError::InvalidTransition { from, to, reason } => match from {
                Some(from) => write!(f, "invalid transition {from} -> {to}: {reason}"),
                None => write!(f, "cannot create booking as {to}: {reason}"),
            },
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Inactive(id) => write!(f, "inactive: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
