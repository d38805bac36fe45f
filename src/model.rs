use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::ledger::Ledger;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

/// A time range whose end is not strictly after its start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidInterval {
    pub start: Ms,
    pub end: Ms,
}

impl std::fmt::Display for InvalidInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid interval: end {} is not after start {}", self.end, self.start)
    }
}

impl std::error::Error for InvalidInterval {}

impl Span {
    /// Internal constructor for spans already known to be well-formed.
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Validating constructor for anything that comes from outside the engine.
    pub fn try_new(start: Ms, end: Ms) -> Result<Self, InvalidInterval> {
        if end <= start {
            return Err(InvalidInterval { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn duration_minutes(&self) -> i64 {
        self.duration_ms() / MINUTE_MS
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Intersection with `window`, if non-empty.
    pub fn clamp_to(&self, window: &Span) -> Option<Span> {
        let start = self.start.max(window.start);
        let end = self.end.min(window.end);
        (start < end).then_some(Span { start, end })
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", fmt_ms(self.start), fmt_ms(self.end))
    }
}

/// RFC 3339 rendering for messages; falls back to the raw number.
pub fn fmt_ms(ms: Ms) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%dT%H:%MZ").to_string())
        .unwrap_or_else(|| ms.to_string())
}

// ── Entities ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Desk,
    Room,
    Office,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Desk => "desk",
            ResourceKind::Room => "room",
            ResourceKind::Office => "office",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "desk" => Some(ResourceKind::Desk),
            "room" | "meeting_room" => Some(ResourceKind::Room),
            "office" => Some(ResourceKind::Office),
            _ => None,
        }
    }
}

/// A bookable desk, room or office.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Ulid,
    pub name: String,
    pub kind: ResourceKind,
    /// Seats. Informational: a resource never holds two overlapping bookings.
    pub capacity: u32,
    /// `false` once archived.
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    CheckedIn,
}

impl BookingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::CheckedIn => "checked_in",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(BookingStatus::Pending),
            "confirmed" => Some(BookingStatus::Confirmed),
            "cancelled" | "canceled" => Some(BookingStatus::Cancelled),
            "checked_in" => Some(BookingStatus::CheckedIn),
            _ => None,
        }
    }

    /// Statuses that occupy the resource.
    pub fn holds_slot(self) -> bool {
        !matches!(self, BookingStatus::Cancelled)
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub member_id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
    pub created_at: Ms,
}

impl Booking {
    /// A `checked_in` booking that has not started yet reads as `confirmed`.
    pub fn effective_status(&self, now: Ms) -> BookingStatus {
        match self.status {
            BookingStatus::CheckedIn if now < self.span.start => BookingStatus::Confirmed,
            s => s,
        }
    }
}

/// One existing booking that blocks a requested span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collision {
    pub booking_id: Ulid,
    pub member_id: Ulid,
    pub span: Span,
}

// ── Identity ─────────────────────────────────────────────────────

/// Who is asking, as vouched for by the auth collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    Admin,
    Coworker(Ulid),
}

impl Caller {
    pub fn is_admin(&self) -> bool {
        matches!(self, Caller::Admin)
    }

    pub fn may_act_for(&self, member_id: Ulid) -> bool {
        match self {
            Caller::Admin => true,
            Caller::Coworker(me) => *me == member_id,
        }
    }
}

// ── Per-resource state ───────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub resource: Resource,
    /// Non-cancelled bookings, sorted by start.
    pub ledger: Ledger,
    /// Cancelled bookings, kept for listing.
    pub cancelled: Vec<Booking>,
}

impl ResourceState {
    pub fn new(resource: Resource) -> Self {
        Self {
            resource,
            ledger: Ledger::new(),
            cancelled: Vec::new(),
        }
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.ledger
            .get(id)
            .or_else(|| self.cancelled.iter().find(|b| b.id == id))
    }

    /// Drop a booking from wherever it lives. Absent ids are a no-op.
    pub fn forget(&mut self, id: Ulid) -> Option<Booking> {
        if let Some(b) = self.ledger.remove(id) {
            return Some(b);
        }
        let pos = self.cancelled.iter().position(|b| b.id == id)?;
        Some(self.cancelled.remove(pos))
    }

    pub fn booking_count(&self) -> usize {
        self.ledger.len() + self.cancelled.len()
    }
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated { resource: Resource },
    ResourceUpdated { resource: Resource },
    MemberCreated { member: Member },
    MemberUpdated { member: Member },
    BookingCreated { booking: Booking },
    /// A batch, committed and replayed as one unit.
    BookingsCreated { bookings: Vec<Booking> },
    BookingStatusChanged {
        id: Ulid,
        resource_id: Ulid,
        status: BookingStatus,
    },
    /// Edit of resource/member/span. `from_resource` is where it lived before.
    BookingRescheduled { from_resource: Ulid, booking: Booking },
    BookingDeleted { id: Ulid, resource_id: Ulid },
}

impl Event {
    /// Resource channels this event concerns (for notifications).
    pub fn resource_ids(&self) -> Vec<Ulid> {
        match self {
            Event::ResourceCreated { resource } | Event::ResourceUpdated { resource } => {
                vec![resource.id]
            }
            Event::BookingCreated { booking } => vec![booking.resource_id],
            Event::BookingsCreated { bookings } => {
                let mut ids: Vec<Ulid> = bookings.iter().map(|b| b.resource_id).collect();
                ids.sort();
                ids.dedup();
                ids
            }
            Event::BookingStatusChanged { resource_id, .. }
            | Event::BookingDeleted { resource_id, .. } => vec![*resource_id],
            Event::BookingRescheduled { from_resource, booking } => {
                if *from_resource == booking.resource_id {
                    vec![booking.resource_id]
                } else {
                    vec![*from_resource, booking.resource_id]
                }
            }
            Event::MemberCreated { .. } | Event::MemberUpdated { .. } => Vec::new(),
        }
    }
}
