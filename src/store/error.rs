use thiserror::Error;

use crate::model::{Rejection, ReservationId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reservation not found: {0}")]
    ReservationNotFound(ReservationId),

    #[error("resource day not found: {0}")]
    ResourceDayNotFound(String),

    #[error("reservation already exists: {0}")]
    AlreadyExists(ReservationId),

    #[error("resource day label already in use: {0}")]
    DuplicateLabel(String),

    #[error("invalid capacity {0}: must be a positive 32-bit count")]
    InvalidCapacity(i64),

    #[error("invalid label: {0}")]
    InvalidLabel(&'static str),

    /// A conditional write's admission predicate did not hold. Nothing was written.
    #[error("write rejected: {0:?}")]
    Rejected(Rejection),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("WAL error: {0}")]
    Wal(String),
}
