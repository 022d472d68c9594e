use chrono::NaiveDate;
use thiserror::Error;

use crate::model::{Rejection, ReservationId};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid date {date}: {reason}")]
    InvalidDate { date: NaiveDate, reason: &'static str },

    #[error("caller may not act on this record")]
    Forbidden,

    #[error("reservation not found: {0}")]
    NotFound(ReservationId),

    #[error("resource day not found: {0}")]
    ResourceDayNotFound(String),

    #[error("resource day label already in use: {0}")]
    DuplicateLabel(String),

    #[error("invalid capacity: {0}")]
    InvalidCapacity(i64),

    #[error("invalid label: {0}")]
    InvalidLabel(&'static str),

    #[error("vendor already holds reservation {conflicting} within a week of that date")]
    VendorAlreadyBooked { conflicting: ReservationId },

    #[error("capacity {capacity} exceeded: all units booked")]
    CapacityExceeded { capacity: u32 },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl EngineError {
    /// Only storage faults are worth retrying unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::StorageUnavailable(_))
    }

    /// Short stable name, used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidDate { .. } => "invalid_date",
            EngineError::Forbidden => "forbidden",
            EngineError::NotFound(_) => "not_found",
            EngineError::ResourceDayNotFound(_) => "resource_day_not_found",
            EngineError::DuplicateLabel(_) => "duplicate_label",
            EngineError::InvalidCapacity(_) => "invalid_capacity",
            EngineError::InvalidLabel(_) => "invalid_label",
            EngineError::VendorAlreadyBooked { .. } => "vendor_already_booked",
            EngineError::CapacityExceeded { .. } => "capacity_exceeded",
            EngineError::StorageUnavailable(_) => "storage_unavailable",
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ReservationNotFound(id) => EngineError::NotFound(id),
            StoreError::ResourceDayNotFound(day) => EngineError::ResourceDayNotFound(day),
            StoreError::DuplicateLabel(label) => EngineError::DuplicateLabel(label),
            StoreError::InvalidCapacity(c) => EngineError::InvalidCapacity(c),
            StoreError::InvalidLabel(msg) => EngineError::InvalidLabel(msg),
            StoreError::Rejected(Rejection::SlotFull { capacity }) => {
                EngineError::CapacityExceeded { capacity }
            }
            StoreError::Rejected(Rejection::VendorWindow { conflicting }) => {
                EngineError::VendorAlreadyBooked { conflicting }
            }
            e @ (StoreError::AlreadyExists(_)
            | StoreError::DeadlineExceeded
            | StoreError::Wal(_)) => EngineError::StorageUnavailable(e.to_string()),
        }
    }
}
