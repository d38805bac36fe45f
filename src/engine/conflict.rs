use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Optional booking-length bounds. Default: unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookingPolicy {
    pub min_duration_ms: Option<Ms>,
    pub max_duration_ms: Option<Ms>,
}

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Build a span from raw endpoints and check it against the hard limits.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = Span::try_new(start, end)?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(span)
}

/// Like `validate_span`, with the read-query width cap instead of the
/// booking one.
pub(crate) fn validate_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = validate_span(start, end)?;
    if span.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(span)
}

pub(crate) fn validate_booking_span(
    start: Ms,
    end: Ms,
    policy: &BookingPolicy,
) -> Result<Span, EngineError> {
    let span = validate_span(start, end)?;
    if span.duration_ms() > MAX_BOOKING_SPAN_MS {
        return Err(EngineError::LimitExceeded("booking too long"));
    }
    if policy.min_duration_ms.is_some_and(|min| span.duration_ms() < min) {
        return Err(EngineError::LimitExceeded("booking shorter than the minimum duration"));
    }
    if policy.max_duration_ms.is_some_and(|max| span.duration_ms() > max) {
        return Err(EngineError::LimitExceeded("booking longer than the maximum duration"));
    }
    Ok(span)
}

/// Fail with every live booking on `rs` that overlaps `span`.
pub(crate) fn check_no_conflict(
    rs: &ResourceState,
    span: &Span,
    ignore: Option<Ulid>,
) -> Result<(), EngineError> {
    let collisions = rs.ledger.conflicts(span, ignore);
    if collisions.is_empty() {
        Ok(())
    } else {
        metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
        Err(EngineError::Conflict(collisions))
    }
}

/// Pairwise overlap check within one batch on one resource. Fails with the
/// first clashing pair, in batch order.
pub(crate) fn check_batch_disjoint(batch: &[&Booking]) -> Result<(), EngineError> {
    let collision = |b: &Booking| Collision {
        booking_id: b.id,
        member_id: b.member_id,
        span: b.span,
    };
    for (i, a) in batch.iter().enumerate() {
        for b in &batch[i + 1..] {
            if a.span.overlaps(&b.span) {
                return Err(EngineError::Conflict(vec![collision(*a), collision(*b)]));
            }
        }
    }
    Ok(())
}
