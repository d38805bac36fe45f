use ulid::Ulid;

use crate::model::*;

/// Ordered set of the bookings that currently occupy one resource.
///
/// Entries never overlap each other; cancelled bookings are never stored.
/// Callers hold the resource's write lock across `conflicts` + `insert`, which
/// makes check-then-commit a single critical section.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    entries: Vec<Booking>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Booking> {
        self.entries.iter()
    }

    pub fn get(&self, id: Ulid) -> Option<&Booking> {
        self.entries.iter().find(|b| b.id == id)
    }

    /// Entries that would collide with `span`, skipping `ignore` (a booking
    /// being moved within the same resource).
    pub fn conflicts(&self, span: &Span, ignore: Option<Ulid>) -> Vec<Collision> {
        self.query(span)
            .filter(|b| Some(b.id) != ignore)
            .map(|b| Collision {
                booking_id: b.id,
                member_id: b.member_id,
                span: b.span,
            })
            .collect()
    }

    /// Insert keeping start order. Fails with every colliding entry.
    pub fn insert(&mut self, booking: Booking) -> Result<(), Vec<Collision>> {
        debug_assert!(booking.status.holds_slot());
        let collisions = self.conflicts(&booking.span, None);
        if !collisions.is_empty() {
            return Err(collisions);
        }
        let pos = self
            .entries
            .partition_point(|b| b.span.start < booking.span.start);
        self.entries.insert(pos, booking);
        Ok(())
    }

    /// Remove by id. Absent ids are a no-op.
    pub fn remove(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.entries.iter().position(|b| b.id == id)?;
        Some(self.entries.remove(pos))
    }

    /// Change the status of a stored entry in place. Moving to `cancelled`
    /// goes through `remove` instead.
    pub fn set_status(&mut self, id: Ulid, status: BookingStatus) -> bool {
        debug_assert!(status.holds_slot());
        match self.entries.iter_mut().find(|b| b.id == id) {
            Some(b) => {
                b.status = status;
                true
            }
            None => false,
        }
    }

    /// Bookings overlapping `window`, in start order. Lazy and restartable.
    pub fn query(&self, window: &Span) -> impl Iterator<Item = &Booking> + '_ {
        // Everything at index >= right_bound starts at or after window.end.
        let right_bound = self.entries.partition_point(|b| b.span.start < window.end);
        let window = *window;
        self.entries[..right_bound]
            .iter()
            .filter(move |b| b.span.end > window.start)
    }

    /// Busy time inside `window`, clamped and sorted. Disjoint by construction.
    pub fn busy_spans(&self, window: &Span) -> Vec<Span> {
        self.query(window)
            .filter_map(|b| b.span.clamp_to(window))
            .collect()
    }
}
