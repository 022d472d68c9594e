/// Longest resource-day label accepted, in bytes after trimming.
pub const MAX_LABEL_LEN: usize = 64;

/// Days after today a reservation date must be strictly later than.
pub const MIN_LEAD_DAYS: u64 = 1;

/// Capacity of the group-commit channel in front of the WAL writer.
pub const WAL_CHANNEL_DEPTH: usize = 4096;

/// Longest statement the request layer will parse.
pub const MAX_SQL_LEN: usize = 16 * 1024;
