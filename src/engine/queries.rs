use std::collections::HashMap;

use tokio::sync::OwnedRwLockReadGuard;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{self, SlotState, slot_count};
use super::calendar::{self, CalendarGrid, CalendarView, visible_slots};
use super::conflict::{validate_span, validate_window};
use super::{Engine, EngineError};

/// One row of the free/busy grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceFreeBusy {
    pub resource_id: Ulid,
    pub name: String,
    pub slots: Vec<SlotState>,
}

/// Booked time over bookable time of the active resources in a window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Occupancy {
    pub window: Span,
    pub booked_ms: Ms,
    pub available_ms: Ms,
    pub rate: f64,
}

impl Engine {
    async fn read_resource(&self, id: Ulid) -> Result<OwnedRwLockReadGuard<ResourceState>, EngineError> {
        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        Ok(rs.read_owned().await)
    }

    /// Read guards for `ids` in caller order, or for every resource ordered
    /// by name when `ids` is `None`.
    async fn read_resources(
        &self,
        ids: Option<&[Ulid]>,
    ) -> Result<Vec<OwnedRwLockReadGuard<ResourceState>>, EngineError> {
        match ids {
            Some(ids) => {
                if ids.len() > MAX_IN_CLAUSE_IDS {
                    return Err(EngineError::LimitExceeded("too many resource IDs"));
                }
                let mut guards = Vec::with_capacity(ids.len());
                for id in ids {
                    guards.push(self.read_resource(*id).await?);
                }
                Ok(guards)
            }
            None => {
                let all: Vec<_> = self.resources.iter().map(|e| e.value().clone()).collect();
                let mut guards = Vec::with_capacity(all.len());
                for rs in all {
                    guards.push(rs.read_owned().await);
                }
                guards.sort_by(|a, b| {
                    a.resource
                        .name
                        .cmp(&b.resource.name)
                        .then(a.resource.id.cmp(&b.resource.id))
                });
                Ok(guards)
            }
        }
    }

    // ── Directory ────────────────────────────────────────────

    pub async fn list_resources(&self) -> Vec<Resource> {
        self.read_resources(None)
            .await
            .map(|guards| guards.iter().map(|g| g.resource.clone()).collect())
            .unwrap_or_default()
    }

    pub fn list_members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self.members.iter().map(|m| m.value().clone()).collect();
        members.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        members
    }

    pub fn get_member(&self, id: Ulid) -> Result<Member, EngineError> {
        self.members
            .get(&id)
            .map(|m| m.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    pub fn member_names(&self) -> HashMap<Ulid, String> {
        self.members
            .iter()
            .map(|m| (*m.key(), m.value().name.clone()))
            .collect()
    }

    // ── Bookings ─────────────────────────────────────────────

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let resource_id = self
            .get_resource_for_booking(&id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = self.read_resource(resource_id).await?;
        guard.booking(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Bookings (cancelled ones included) on the given resources, or on all,
    /// that overlap `window`. Sorted by start.
    pub async fn list_bookings(
        &self,
        resource_ids: Option<&[Ulid]>,
        window: Option<Span>,
    ) -> Result<Vec<Booking>, EngineError> {
        let guards = self.read_resources(resource_ids).await?;
        let keep = |b: &&Booking| window.is_none_or(|w| b.span.overlaps(&w));
        let mut out: Vec<Booking> = guards
            .iter()
            .flat_map(|g| g.ledger.iter().chain(g.cancelled.iter()).filter(keep).cloned().collect::<Vec<_>>())
            .collect();
        out.sort_by(|a, b| a.span.start.cmp(&b.span.start).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    // ── Availability ─────────────────────────────────────────

    pub async fn is_available(&self, resource_id: Ulid, start: Ms, end: Ms) -> Result<bool, EngineError> {
        let span = validate_span(start, end)?;
        let guard = self.read_resource(resource_id).await?;
        Ok(availability::is_free(&guard.ledger, &span))
    }

    /// First active resource, in the given order (or by name), free for the
    /// whole span. `None` when everything is taken.
    pub async fn first_available(
        &self,
        resource_ids: Option<&[Ulid]>,
        start: Ms,
        end: Ms,
    ) -> Result<Option<Resource>, EngineError> {
        let span = validate_span(start, end)?;
        let guards = self.read_resources(resource_ids).await?;
        Ok(guards
            .iter()
            .find(|g| g.resource.active && availability::is_free(&g.ledger, &span))
            .map(|g| g.resource.clone()))
    }

    pub async fn free_busy_grid(
        &self,
        resource_ids: Option<&[Ulid]>,
        start: Ms,
        end: Ms,
        granularity_minutes: i64,
    ) -> Result<Vec<ResourceFreeBusy>, EngineError> {
        let window = validate_window(start, end)?;
        if granularity_minutes < MIN_SLOT_MINUTES {
            return Err(EngineError::LimitExceeded("slot granularity too small"));
        }
        if granularity_minutes > MAX_SLOT_MINUTES {
            return Err(EngineError::LimitExceeded("slot granularity too large"));
        }
        let granularity = granularity_minutes * MINUTE_MS;
        let guards = self.read_resources(resource_ids).await?;
        if slot_count(&window, granularity).saturating_mul(guards.len()) > MAX_GRID_CELLS {
            return Err(EngineError::LimitExceeded("free/busy grid too large"));
        }
        Ok(guards
            .iter()
            .map(|g| ResourceFreeBusy {
                resource_id: g.resource.id,
                name: g.resource.name.clone(),
                slots: availability::free_busy(&g.ledger, window, granularity).collect(),
            })
            .collect())
    }

    /// Free intervals of one resource inside a window, optionally dropping
    /// gaps shorter than `min_duration_ms`.
    pub async fn free_spans(
        &self,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        min_duration_ms: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        let window = validate_window(start, end)?;
        let guard = self.read_resource(resource_id).await?;
        let mut free = availability::free_spans(&guard.ledger, &window);
        if let Some(min) = min_duration_ms {
            free.retain(|span| span.duration_ms() >= min);
        }
        Ok(free)
    }

    /// Resources with a booking in progress at `now`, with that booking.
    pub async fn resources_in_use(&self, now: Ms) -> Vec<(Resource, Booking)> {
        let instant = Span::new(now, now.saturating_add(1));
        let Ok(guards) = self.read_resources(None).await else {
            return Vec::new();
        };
        guards
            .iter()
            .filter_map(|g| {
                g.ledger
                    .query(&instant)
                    .next()
                    .map(|b| (g.resource.clone(), b.clone()))
            })
            .collect()
    }

    // ── Calendar & dashboard ─────────────────────────────────

    /// Grid of the active resources (by name) over `window`.
    pub async fn calendar(
        &self,
        window: Span,
        view: &CalendarView,
        now: Ms,
    ) -> Result<CalendarGrid, EngineError> {
        if !view.is_valid() {
            return Err(EngineError::LimitExceeded("invalid calendar view"));
        }
        let window = validate_window(window.start, window.end)?;
        let guards: Vec<_> = self
            .read_resources(None)
            .await?
            .into_iter()
            .filter(|g| g.resource.active)
            .collect();
        if visible_slots(&window, view).len().saturating_mul(guards.len().max(1)) > MAX_GRID_CELLS {
            return Err(EngineError::LimitExceeded("calendar too large"));
        }
        let columns: Vec<(&Resource, &crate::ledger::Ledger)> =
            guards.iter().map(|g| (&g.resource, &g.ledger)).collect();
        Ok(calendar::project(&columns, &self.member_names(), window, view, now))
    }

    /// Calendar of the Monday-based UTC week containing `anchor`.
    pub async fn week_calendar(
        &self,
        anchor: Ms,
        view: &CalendarView,
        now: Ms,
    ) -> Result<CalendarGrid, EngineError> {
        let window = calendar::week_window(anchor)
            .ok_or(EngineError::LimitExceeded("timestamp out of range"))?;
        self.calendar(window, view, now).await
    }

    /// Next `limit` live bookings starting after `now`.
    pub async fn upcoming_bookings(&self, now: Ms, limit: usize) -> Vec<Booking> {
        let Ok(guards) = self.read_resources(None).await else {
            return Vec::new();
        };
        let mut out: Vec<Booking> = guards
            .iter()
            .flat_map(|g| g.ledger.iter().filter(|b| b.span.start > now).cloned().collect::<Vec<_>>())
            .collect();
        out.sort_by(|a, b| a.span.start.cmp(&b.span.start).then(a.id.cmp(&b.id)));
        out.truncate(limit);
        out
    }

    pub async fn occupancy(&self, start: Ms, end: Ms) -> Result<Occupancy, EngineError> {
        let window = validate_window(start, end)?;
        let guards = self.read_resources(None).await?;
        let (mut booked, mut available) = (0, 0);
        for g in guards.iter().filter(|g| g.resource.active) {
            booked += availability::booked_ms(&g.ledger, &window);
            available += window.duration_ms();
        }
        let rate = if available > 0 {
            booked as f64 / available as f64
        } else {
            0.0
        };
        Ok(Occupancy {
            window,
            booked_ms: booked,
            available_ms: available,
            rate,
        })
    }
}
