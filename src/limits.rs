use crate::model::Ms;

pub const MAX_ID_LEN: usize = 128;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_LOCATION_LEN: usize = 256;

/// 1970-01-01 .. 9999-12-31, in ms.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

/// A single booking may not exceed one year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_RECORDS_PER_RESOURCE: usize = 100_000;
