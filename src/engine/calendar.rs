//! Week-grid projection of ledger state. Read-only: rows are time slots,
//! columns are resources.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, Duration};
use ulid::Ulid;

use crate::ledger::Ledger;
use crate::model::*;

use super::availability::slots;

const DAY_MS: Ms = 24 * HOUR_MS;

/// Which part of each day is drawn and how finely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarView {
    pub day_start_hour: u32,
    pub day_end_hour: u32,
    pub slot_minutes: i64,
}

impl Default for CalendarView {
    /// 09:00 to 19:00 in one-hour rows.
    fn default() -> Self {
        Self {
            day_start_hour: 9,
            day_end_hour: 19,
            slot_minutes: 60,
        }
    }
}

impl CalendarView {
    pub fn is_valid(&self) -> bool {
        self.day_start_hour < self.day_end_hour
            && self.day_end_hour <= 24
            && (crate::limits::MIN_SLOT_MINUTES..=crate::limits::MAX_SLOT_MINUTES)
                .contains(&self.slot_minutes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarColumn {
    pub resource_id: Ulid,
    pub name: String,
    pub kind: ResourceKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarCell {
    pub booking_id: Ulid,
    pub member_id: Ulid,
    pub member_name: Option<String>,
    pub status: BookingStatus,
    pub span: Span,
    /// Further bookings sharing this slot (short bookings in a wide row).
    pub more: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarRow {
    pub slot: Span,
    pub cells: Vec<Option<CalendarCell>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarGrid {
    pub window: Span,
    pub columns: Vec<CalendarColumn>,
    pub rows: Vec<CalendarRow>,
}

impl CalendarGrid {
    pub fn cell(&self, row: usize, column: usize) -> Option<&CalendarCell> {
        self.rows.get(row)?.cells.get(column)?.as_ref()
    }
}

/// Monday 00:00 UTC of the week containing `anchor`, spanning seven days.
pub fn week_window(anchor: Ms) -> Option<Span> {
    let date = DateTime::from_timestamp_millis(anchor)?.date_naive();
    let monday = date - Duration::days(i64::from(date.weekday().num_days_from_monday()));
    let start = monday.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis();
    Some(Span::new(start, start + 7 * DAY_MS))
}

/// Visible row slots of every UTC day touched by `window`.
pub fn visible_slots(window: &Span, view: &CalendarView) -> Vec<Span> {
    let slot_ms = view.slot_minutes * MINUTE_MS;
    let mut out = Vec::new();
    let mut day = window.start.div_euclid(DAY_MS) * DAY_MS;
    while day < window.end {
        let open = Span::new(
            day + i64::from(view.day_start_hour) * HOUR_MS,
            day + i64::from(view.day_end_hour) * HOUR_MS,
        );
        if let Some(visible) = open.clamp_to(window) {
            out.extend(slots(visible, slot_ms));
        }
        day += DAY_MS;
    }
    out
}

/// Project `columns` (in display order) onto the grid for `window`.
pub fn project(
    columns: &[(&Resource, &Ledger)],
    member_names: &HashMap<Ulid, String>,
    window: Span,
    view: &CalendarView,
    now: Ms,
) -> CalendarGrid {
    let rows = visible_slots(&window, view)
        .into_iter()
        .map(|slot| CalendarRow {
            slot,
            cells: columns
                .iter()
                .map(|(_, ledger)| cell_for(ledger, &slot, member_names, now))
                .collect(),
        })
        .collect();

    CalendarGrid {
        window,
        columns: columns
            .iter()
            .map(|(r, _)| CalendarColumn {
                resource_id: r.id,
                name: r.name.clone(),
                kind: r.kind,
            })
            .collect(),
        rows,
    }
}

fn cell_for(
    ledger: &Ledger,
    slot: &Span,
    member_names: &HashMap<Ulid, String>,
    now: Ms,
) -> Option<CalendarCell> {
    let mut hits = ledger.query(slot);
    let first = hits.next()?;
    Some(CalendarCell {
        booking_id: first.id,
        member_id: first.member_id,
        member_name: member_names.get(&first.member_id).cloned(),
        status: first.effective_status(now),
        span: first.span,
        more: hits.count(),
    })
}
