use crate::ledger::Ledger;
use crate::model::*;

// ── Availability primitives ───────────────────────────────────────

/// One cell of a free/busy row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotState {
    pub span: Span,
    pub busy: bool,
}

/// Consecutive `granularity`-wide slots covering `window`; the last one is
/// cut short at `window.end`.
pub fn slots(window: Span, granularity: Ms) -> impl Iterator<Item = Span> {
    debug_assert!(granularity > 0);
    let mut cursor = window.start;
    std::iter::from_fn(move || {
        if cursor >= window.end {
            return None;
        }
        let end = cursor.saturating_add(granularity).min(window.end);
        let slot = Span::new(cursor, end);
        cursor = end;
        Some(slot)
    })
}

pub fn slot_count(window: &Span, granularity: Ms) -> usize {
    let granularity = granularity.max(1);
    (window.duration_ms().saturating_add(granularity - 1) / granularity) as usize
}

/// True iff nothing on the ledger overlaps `span`.
pub fn is_free(ledger: &Ledger, span: &Span) -> bool {
    ledger.query(span).next().is_none()
}

/// Lazy free/busy row for one resource.
pub fn free_busy<'a>(
    ledger: &'a Ledger,
    window: Span,
    granularity: Ms,
) -> impl Iterator<Item = SlotState> + 'a {
    slots(window, granularity).map(move |span| SlotState {
        span,
        busy: !is_free(ledger, &span),
    })
}

/// Free intervals of `window` on one resource.
pub fn free_spans(ledger: &Ledger, window: &Span) -> Vec<Span> {
    let busy = ledger.busy_spans(window);
    subtract_intervals(&[*window], &busy)
}

/// Booked milliseconds inside `window`.
pub fn booked_ms(ledger: &Ledger, window: &Span) -> Ms {
    ledger
        .busy_spans(window)
        .iter()
        .map(Span::duration_ms)
        .sum()
}

/// `base` minus `to_remove`. Both sorted by start; `to_remove` may overlap itself.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < b.end {
            result.push(Span::new(current_start, b.end));
        }
    }

    result
}
