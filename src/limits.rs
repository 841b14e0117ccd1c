//! Hard limits. Anything past these is rejected before it reaches the WAL.

pub const MAX_ROOMS: usize = 10_000;
pub const MAX_RESERVATIONS_PER_ROOM: usize = 100_000;
pub const MAX_CALENDAR_ENTRIES_PER_ROOM: usize = 5_000;

pub const MAX_ROOM_NAME_LEN: usize = 100;
pub const MAX_DEPARTMENT_LEN: usize = 100;
pub const MAX_EXCEPTION_REASON_LEN: usize = 100;
pub const MAX_PURPOSE_LEN: usize = 255;

pub const MAX_SQL_LEN: usize = 64 * 1024;
