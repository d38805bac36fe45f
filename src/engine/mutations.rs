use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, oneshot};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_batch_disjoint, check_no_conflict, now_ms, validate_booking_span};
use super::lifecycle::{check_creation, check_transition, is_editable};
use super::{Engine, EngineError, IdClaim, WalCommand, apply_to_resource};

/// Input row for `batch_create_bookings`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub member_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub status: BookingStatus,
}

/// Partial update of a resource; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourcePatch {
    pub name: Option<String>,
    pub kind: Option<ResourceKind>,
    pub capacity: Option<u32>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberPatch {
    pub name: Option<String>,
    pub email: Option<String>,
    pub active: Option<bool>,
}

/// Edit of an existing booking; `None` keeps the current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reschedule {
    pub resource_id: Option<Ulid>,
    pub member_id: Option<Ulid>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
}

fn require_admin(caller: &Caller, what: &'static str) -> Result<(), EngineError> {
    if caller.is_admin() {
        Ok(())
    } else {
        Err(EngineError::Forbidden(what))
    }
}

fn check_name(name: &str) -> Result<(), EngineError> {
    if name.is_empty() {
        return Err(EngineError::LimitExceeded("name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn check_email(email: &str) -> Result<(), EngineError> {
    if email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("email too long"));
    }
    Ok(())
}

impl Engine {
    // ── Resources ────────────────────────────────────────────

    pub async fn create_resource(
        &self,
        caller: &Caller,
        id: Ulid,
        name: String,
        kind: ResourceKind,
        capacity: Option<u32>,
    ) -> Result<Resource, EngineError> {
        require_admin(caller, "only admins manage resources")?;
        check_name(&name)?;
        let capacity = match capacity {
            Some(0) => return Err(EngineError::LimitExceeded("capacity must be positive")),
            Some(c) => c,
            None => 1,
        };

        let _commit = self.commit_gate.read().await;
        let _dir = self.directory_lock.lock().await;
        if self.resources.len() >= MAX_RESOURCES_PER_SPACE {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if self.resources.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let resource = Resource { id, name, kind, capacity, active: true };
        let event = Event::ResourceCreated { resource: resource.clone() };
        self.persist_directory(&event).await?;
        self.resources
            .insert(id, Arc::new(RwLock::new(ResourceState::new(resource.clone()))));
        tracing::info!("resource {id} created ({})", resource.name);
        Ok(resource)
    }

    /// Rename, resize or archive (`active = false`) a resource. Archiving
    /// keeps its bookings but refuses new ones.
    pub async fn update_resource(
        &self,
        caller: &Caller,
        id: Ulid,
        patch: ResourcePatch,
    ) -> Result<Resource, EngineError> {
        require_admin(caller, "only admins manage resources")?;
        if let Some(name) = &patch.name {
            check_name(name)?;
        }
        if patch.capacity == Some(0) {
            return Err(EngineError::LimitExceeded("capacity must be positive"));
        }
        let _commit = self.commit_gate.read().await;
        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;

        let mut resource = guard.resource.clone();
        if let Some(name) = patch.name {
            resource.name = name;
        }
        if let Some(kind) = patch.kind {
            resource.kind = kind;
        }
        if let Some(capacity) = patch.capacity {
            resource.capacity = capacity;
        }
        if let Some(active) = patch.active {
            resource.active = active;
        }

        let event = Event::ResourceUpdated { resource: resource.clone() };
        self.persist_and_apply(&mut [&mut *guard], &event).await?;
        Ok(resource)
    }

    // ── Members ──────────────────────────────────────────────

    pub async fn create_member(
        &self,
        caller: &Caller,
        id: Ulid,
        name: String,
        email: String,
    ) -> Result<Member, EngineError> {
        require_admin(caller, "only admins invite members")?;
        check_name(&name)?;
        check_email(&email)?;

        let _commit = self.commit_gate.read().await;
        let _dir = self.directory_lock.lock().await;
        if self.members.len() >= MAX_MEMBERS_PER_SPACE {
            return Err(EngineError::LimitExceeded("too many members"));
        }
        if self.members.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let member = Member { id, name, email, active: true };
        self.persist_directory(&Event::MemberCreated { member: member.clone() })
            .await?;
        self.members.insert(id, member.clone());
        Ok(member)
    }

    /// Members are deactivated, never deleted: bookings keep referring to them.
    pub async fn update_member(
        &self,
        caller: &Caller,
        id: Ulid,
        patch: MemberPatch,
    ) -> Result<Member, EngineError> {
        require_admin(caller, "only admins manage members")?;
        if let Some(name) = &patch.name {
            check_name(name)?;
        }
        if let Some(email) = &patch.email {
            check_email(email)?;
        }

        let _commit = self.commit_gate.read().await;
        let _dir = self.directory_lock.lock().await;
        let mut member = self
            .members
            .get(&id)
            .map(|m| m.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        if let Some(name) = patch.name {
            member.name = name;
        }
        if let Some(email) = patch.email {
            member.email = email;
        }
        if let Some(active) = patch.active {
            member.active = active;
        }

        self.persist_directory(&Event::MemberUpdated { member: member.clone() })
            .await?;
        self.members.insert(id, member.clone());
        Ok(member)
    }

    fn active_member(&self, id: Ulid) -> Result<Member, EngineError> {
        let member = self
            .members
            .get(&id)
            .map(|m| m.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        if !member.active {
            return Err(EngineError::Inactive(id));
        }
        Ok(member)
    }

    // ── Bookings ─────────────────────────────────────────────

    pub async fn create_booking(
        &self,
        caller: &Caller,
        id: Ulid,
        resource_id: Ulid,
        member_id: Ulid,
        start: Ms,
        end: Ms,
        status: BookingStatus,
    ) -> Result<Booking, EngineError> {
        let span = validate_booking_span(start, end, &self.policy)?;
        check_creation(caller, status)?;
        if !caller.may_act_for(member_id) {
            return Err(EngineError::Forbidden("coworkers can only book for themselves"));
        }
        self.active_member(member_id)?;

        let _commit = self.commit_gate.read().await;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let mut guard = rs.write().await;
        if !guard.resource.active {
            return Err(EngineError::Inactive(resource_id));
        }
        let mut claim = IdClaim::new(&self.booking_index);
        claim.claim(id, resource_id)?;
        if guard.booking_count() >= MAX_BOOKINGS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many bookings on resource"));
        }

        check_no_conflict(&guard, &span, None)?;

        let booking = Booking {
            id,
            resource_id,
            member_id,
            span,
            status,
            created_at: now_ms(),
        };
        let event = Event::BookingCreated { booking: booking.clone() };
        self.persist_and_apply(&mut [&mut *guard], &event).await?;
        claim.commit();
        tracing::info!("booking {id} {status} on {resource_id} {span}");
        Ok(booking)
    }

    /// Create several bookings at once (e.g. a recurring series). All-or-nothing:
    /// if any one conflicts, none is committed. Bookings may span resources.
    pub async fn batch_create_bookings(
        &self,
        caller: &Caller,
        bookings: Vec<NewBooking>,
    ) -> Result<Vec<Booking>, EngineError> {
        require_admin(caller, "only admins create booking batches")?;
        if bookings.is_empty() {
            return Ok(Vec::new());
        }
        if bookings.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }

        let now = now_ms();
        let mut seen = HashSet::new();
        let mut prepared = Vec::with_capacity(bookings.len());
        for nb in bookings {
            let span = validate_booking_span(nb.start, nb.end, &self.policy)?;
            check_creation(caller, nb.status)?;
            self.active_member(nb.member_id)?;
            if !seen.insert(nb.id) || self.booking_index.contains_key(&nb.id) {
                return Err(EngineError::AlreadyExists(nb.id));
            }
            prepared.push(Booking {
                id: nb.id,
                resource_id: nb.resource_id,
                member_id: nb.member_id,
                span,
                status: nb.status,
                created_at: now,
            });
        }

        // Acquire write locks in sorted order to prevent deadlocks.
        let mut resource_ids: Vec<Ulid> = prepared.iter().map(|b| b.resource_id).collect();
        resource_ids.sort();
        resource_ids.dedup();

        let _commit = self.commit_gate.read().await;
        let mut guards = Vec::with_capacity(resource_ids.len());
        let mut slot_of = HashMap::new();
        for rid in &resource_ids {
            let rs = self.get_resource(rid).ok_or(EngineError::NotFound(*rid))?;
            let guard = rs.write_owned().await;
            if !guard.resource.active {
                return Err(EngineError::Inactive(*rid));
            }
            slot_of.insert(*rid, guards.len());
            guards.push(guard);
        }

        // Phase 1: validate against current state and within the batch.
        let mut by_resource: HashMap<Ulid, Vec<&Booking>> = HashMap::new();
        for b in &prepared {
            by_resource.entry(b.resource_id).or_default().push(b);
        }
        for (rid, batch) in &by_resource {
            let guard = &guards[slot_of[rid]];
            if guard.booking_count() + batch.len() > MAX_BOOKINGS_PER_RESOURCE {
                return Err(EngineError::LimitExceeded("too many bookings on resource"));
            }
            for b in batch {
                check_no_conflict(guard, &b.span, None)?;
            }
            check_batch_disjoint(batch)?;
        }

        let mut claim = IdClaim::new(&self.booking_index);
        for b in &prepared {
            claim.claim(b.id, b.resource_id)?;
        }

        // Phase 2: one WAL frame for the whole batch, then apply everywhere.
        let event = Event::BookingsCreated { bookings: prepared.clone() };
        self.wal_append(&event).await?;
        for guard in guards.iter_mut() {
            apply_to_resource(guard, &event, &self.booking_index);
        }
        claim.commit();
        for resource_id in event.resource_ids() {
            self.notify.send(resource_id, &event);
        }
        tracing::info!("batch of {} bookings committed", prepared.len());
        Ok(prepared)
    }

    pub async fn update_booking_status(
        &self,
        caller: &Caller,
        id: Ulid,
        status: BookingStatus,
    ) -> Result<Booking, EngineError> {
        self.update_booking_status_at(caller, id, status, now_ms()).await
    }

    /// Status transition evaluated at instant `now`. Cancelling removes the
    /// ledger entry in the same critical section.
    pub async fn update_booking_status_at(
        &self,
        caller: &Caller,
        id: Ulid,
        status: BookingStatus,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        let _commit = self.commit_gate.read().await;
        let (resource_id, mut guard) = self.resolve_booking_write(&id).await?;
        let current = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        check_transition(caller, &current, status, now)?;

        let event = Event::BookingStatusChanged { id, resource_id, status };
        self.persist_and_apply(&mut [&mut *guard], &event).await?;
        tracing::info!("booking {id}: {} -> {status}", current.status);
        Ok(Booking { status, ..current })
    }

    pub async fn cancel_booking(&self, caller: &Caller, id: Ulid) -> Result<Booking, EngineError> {
        self.update_booking_status(caller, id, BookingStatus::Cancelled).await
    }

    pub async fn reschedule_booking(
        &self,
        caller: &Caller,
        id: Ulid,
        change: Reschedule,
    ) -> Result<Booking, EngineError> {
        self.reschedule_booking_at(caller, id, change, now_ms()).await
    }

    /// Move a pending/confirmed booking to another span, resource or member.
    /// Conflict-checked against everything but itself; atomic across both resources.
    pub async fn reschedule_booking_at(
        &self,
        caller: &Caller,
        id: Ulid,
        change: Reschedule,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        let _commit = self.commit_gate.read().await;
        loop {
            let from = self
                .get_resource_for_booking(&id)
                .ok_or(EngineError::NotFound(id))?;
            let to = change.resource_id.unwrap_or(from);

            let from_rs = self.get_resource(&from).ok_or(EngineError::NotFound(from))?;
            let to_rs = self.get_resource(&to).ok_or(EngineError::NotFound(to))?;

            // Lock in id order; one lock when the resource stays the same.
            let (mut first, mut second) = if from == to {
                (from_rs.write_owned().await, None)
            } else if from < to {
                let a = from_rs.write_owned().await;
                let b = to_rs.write_owned().await;
                (a, Some(b))
            } else {
                let b = to_rs.write_owned().await;
                let a = from_rs.write_owned().await;
                (a, Some(b))
            };

            let Some(current) = first.booking(id).cloned() else {
                if self.get_resource_for_booking(&id) == Some(from) {
                    return Err(EngineError::NotFound(id));
                }
                continue; // moved while we waited
            };

            if !caller.may_act_for(current.member_id) {
                return Err(EngineError::Forbidden("booking belongs to another member"));
            }
            if !is_editable(&current, now) {
                return Err(EngineError::InvalidTransition {
                    from: Some(current.effective_status(now)),
                    to: current.status,
                    reason: "only pending or confirmed bookings can be edited",
                });
            }
            let member_id = change.member_id.unwrap_or(current.member_id);
            if member_id != current.member_id {
                if !caller.is_admin() {
                    return Err(EngineError::Forbidden("only admins reassign bookings"));
                }
                self.active_member(member_id)?;
            }
            let span = validate_booking_span(
                change.start.unwrap_or(current.span.start),
                change.end.unwrap_or(current.span.end),
                &self.policy,
            )?;

            let target = second.as_deref().unwrap_or(&*first);
            if !target.resource.active {
                return Err(EngineError::Inactive(to));
            }
            check_no_conflict(target, &span, Some(id))?;

            let booking = Booking {
                resource_id: to,
                member_id,
                span,
                ..current
            };
            let event = Event::BookingRescheduled {
                from_resource: from,
                booking: booking.clone(),
            };
            match second.as_mut() {
                Some(second) => {
                    self.persist_and_apply(&mut [&mut *first, &mut **second], &event)
                        .await?
                }
                None => self.persist_and_apply(&mut [&mut *first], &event).await?,
            }
            tracing::info!("booking {id} moved to {to} {span}");
            return Ok(booking);
        }
    }

    /// Hard-remove a booking. Idempotent: unknown ids succeed.
    pub async fn delete_booking(&self, caller: &Caller, id: Ulid) -> Result<(), EngineError> {
        require_admin(caller, "only admins delete bookings")?;
        let _commit = self.commit_gate.read().await;
        let (resource_id, mut guard) = match self.resolve_booking_write(&id).await {
            Ok(found) => found,
            Err(EngineError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        let event = Event::BookingDeleted { id, resource_id };
        self.persist_and_apply(&mut [&mut *guard], &event).await
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.commit_gate.write().await;

        let mut members: Vec<Member> = self.members.iter().map(|m| m.value().clone()).collect();
        members.sort_by_key(|m| m.id);
        let mut events: Vec<Event> = members
            .into_iter()
            .map(|member| Event::MemberCreated { member })
            .collect();

        let mut states: Vec<_> = self.resources.iter().map(|e| (*e.key(), e.value().clone())).collect();
        states.sort_by_key(|(id, _)| *id);
        for (_, rs) in states {
            let guard = rs.read().await;
            events.push(Event::ResourceCreated { resource: guard.resource.clone() });
            for booking in guard.ledger.iter().chain(guard.cancelled.iter()) {
                events.push(Event::BookingCreated { booking: booking.clone() });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
