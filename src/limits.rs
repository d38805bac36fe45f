use crate::model::Ms;

const DAY_MS: Ms = 86_400_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Longest single booking (a month-long office rental).
pub const MAX_BOOKING_SPAN_MS: Ms = 31 * DAY_MS;
/// Widest window accepted by read queries.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * DAY_MS;

pub const MAX_RESOURCES_PER_SPACE: usize = 10_000;
pub const MAX_MEMBERS_PER_SPACE: usize = 100_000;
pub const MAX_BOOKINGS_PER_RESOURCE: usize = 100_000;
pub const MAX_BATCH_SIZE: usize = 1_000;
pub const MAX_IN_CLAUSE_IDS: usize = 1_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;

pub const MAX_SPACES: usize = 10_000;
pub const MAX_SPACE_NAME_LEN: usize = 128;

/// Upper bound on `slots × resources` for grid-shaped responses.
pub const MAX_GRID_CELLS: usize = 200_000;
pub const MIN_SLOT_MINUTES: i64 = 5;
/// One slot never exceeds the widest query window.
pub const MAX_SLOT_MINUTES: i64 = MAX_QUERY_WINDOW_MS / 60_000;
